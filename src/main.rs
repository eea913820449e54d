use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cert_hunter::config::{utc_offset, DEFAULT_BASE_URL, DEFAULT_DAILY_CAP, DEFAULT_MAX_AGE_SECONDS};
use cert_hunter::quota::read_state;
use cert_hunter::temporal::day_stamp;
use cert_hunter::{
    append_identifiers, export_csv, extract_identifiers, load_candidates, open_database,
    record_count, rewrite_candidates, CancelToken, HttpAuthority, Pipeline, RawConfig,
    SystemClock, VERSION,
};

/// Exit status for a run stopped by Ctrl+C (128 + SIGINT)
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "cert-hunter", version)]
#[command(about = "Normalize certificate numbers, validate them against the grading authority, keep a local cache")]
struct Cli {
    /// SQLite store for validated records, quota and audit events
    #[arg(long, global = true, env = "DB_PATH", default_value = "data/certs.db")]
    db: PathBuf,

    /// More log output (-v debug, -vv everything)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull certificate numbers out of text files (or stdin) into the candidate file
    Ingest {
        #[command(flatten)]
        candidates: CandidateFile,

        /// Text files to scan; reads stdin when none are given
        files: Vec<PathBuf>,
    },

    /// Rewrite the candidate file in normalized, merged form
    Normalize {
        #[command(flatten)]
        candidates: CandidateFile,
    },

    /// Validate every stale candidate, within today's quota
    Validate {
        #[command(flatten)]
        candidates: CandidateFile,

        #[command(flatten)]
        settings: Settings,
    },

    /// Write all validated records as CSV
    Export {
        /// Output file (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Show today's quota usage
    Quota {
        /// Reference zone for the quota day, minutes east of UTC
        #[arg(long, env = "UTC_OFFSET_MINUTES", default_value_t = 0, allow_hyphen_values = true)]
        utc_offset_minutes: i32,
    },
}

#[derive(Args)]
struct CandidateFile {
    /// Newline-delimited candidate list (`<id> [annotation]` per line)
    #[arg(long = "candidates", env = "CANDIDATES_FILE", default_value = "data/candidates.txt")]
    path: PathBuf,
}

#[derive(Args)]
struct Settings {
    /// Maximum validation calls per calendar day
    #[arg(long, env = "DAILY_CAP", default_value_t = DEFAULT_DAILY_CAP as i64)]
    daily_cap: i64,

    /// Records younger than this are not revalidated (0 = always revalidate)
    #[arg(long, env = "MAX_AGE_SECONDS", default_value_t = DEFAULT_MAX_AGE_SECONDS)]
    max_age_seconds: i64,

    /// Minimum pause between consecutive calls
    #[arg(long, env = "SLEEP_MS", default_value_t = 250)]
    sleep_ms: i64,

    #[arg(long, env = "CONNECT_TIMEOUT", default_value_t = 10.0)]
    connect_timeout: f64,

    #[arg(long, env = "READ_TIMEOUT", default_value_t = 25.0)]
    read_timeout: f64,

    /// Retries after the first attempt on transient failures
    #[arg(long, env = "RETRIES", default_value_t = 3)]
    retries: i64,

    /// Base delay for exponential backoff between retries
    #[arg(long, env = "BACKOFF_MS", default_value_t = 800)]
    backoff_ms: i64,

    /// Reference zone for the quota day, minutes east of UTC
    #[arg(long, env = "UTC_OFFSET_MINUTES", default_value_t = 0, allow_hyphen_values = true)]
    utc_offset_minutes: i32,

    #[arg(long, env = "PSA_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Bearer token for the authority API
    #[arg(long, env = "PSA_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

impl From<Settings> for RawConfig {
    fn from(s: Settings) -> Self {
        RawConfig {
            daily_cap: s.daily_cap,
            max_age_seconds: s.max_age_seconds,
            sleep_between_calls_ms: s.sleep_ms,
            connect_timeout_secs: s.connect_timeout,
            read_timeout_secs: s.read_timeout,
            retry_count: s.retries,
            retry_backoff_ms: s.backoff_ms,
            utc_offset_minutes: s.utc_offset_minutes,
            base_url: s.base_url,
            credential: s.token,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    info!("cert-hunter v{} starting", VERSION);

    match cli.command {
        Command::Ingest { candidates, files } => run_ingest(&candidates.path, &files),
        Command::Normalize { candidates } => run_normalize(&candidates.path),
        Command::Validate { candidates, settings } => {
            let interrupted = run_validate(&cli.db, &candidates.path, settings)?;
            if interrupted {
                std::process::exit(EXIT_INTERRUPTED);
            }
            Ok(())
        }
        Command::Export { out } => run_export(&cli.db, out.as_deref()),
        Command::Quota { utc_offset_minutes } => run_quota(&cli.db, utc_offset_minutes),
    }
}

fn init_tracing(verbose: u8) {
    let default_filter = match verbose {
        0 => "cert_hunter=info",
        1 => "cert_hunter=debug",
        _ => "debug",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(io::stderr)
        .init();
}

fn run_ingest(candidates_path: &Path, files: &[PathBuf]) -> Result<()> {
    let mut text = String::new();

    if files.is_empty() {
        io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read stdin")?;
    } else {
        for path in files {
            let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
            text.push_str(&String::from_utf8_lossy(&bytes));
            text.push('\n');
        }
    }

    let found = extract_identifiers(&text);
    let added = append_identifiers(candidates_path, &found)?;

    println!("🔎 Found {} certificate numbers", found.len());
    println!("✓ Added {} new to {:?}", added, candidates_path);

    Ok(())
}

fn run_normalize(candidates_path: &Path) -> Result<()> {
    let candidates = load_candidates(candidates_path)?;
    rewrite_candidates(candidates_path, &candidates)?;

    println!("🧹 Normalized {:?}", candidates_path);
    println!("✓ Candidates: {}", candidates.len());
    println!("✓ Duplicates merged: {}", candidates.duplicates);
    println!("✓ Malformed lines dropped: {}", candidates.malformed);

    Ok(())
}

/// Returns true when the run was interrupted
fn run_validate(db_path: &Path, candidates_path: &Path, settings: Settings) -> Result<bool> {
    let mut config = RawConfig::from(settings).validate()?;
    let credential = config.take_credential()?;

    let conn = open_database(db_path)?;

    let candidates = load_candidates(candidates_path)?;
    rewrite_candidates(candidates_path, &candidates)?;
    info!(
        candidates = candidates.len(),
        duplicates = candidates.duplicates,
        malformed = candidates.malformed,
        "candidate file normalized"
    );

    let authority = HttpAuthority::new(&config.base_url, credential, config.timeouts)?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        handler_token.cancel();
        eprintln!("\n⚠️  Interrupt received. Finishing the current certificate...");
    }) {
        warn!(error = %e, "failed to install Ctrl+C handler");
    }

    let mut pipeline = Pipeline::new(&conn, &config, authority, SystemClock, cancel)?;
    let summary = pipeline.run(&candidates)?;

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Stored:         {}", summary.stored);
    println!("✓ Cache hits:     {}", summary.cache_hits);
    println!("✗ Rejected:       {}", summary.rejected);
    println!("✗ Given up:       {}", summary.given_up);
    println!("⏸ Quota denied:   {}", summary.quota_denied);
    println!("⏸ Not processed:  {}", summary.not_processed);
    println!("  Calls made:     {}", summary.calls);
    println!("  Quota left:     {}", summary.quota_remaining);
    println!("  Records cached: {}", record_count(&conn)?);

    if summary.auth_refused {
        bail!("authority refused the credential; check PSA_TOKEN (progress saved)");
    }

    if summary.interrupted {
        println!("⚠️  Interrupted; progress saved");
    } else if summary.quota_exhausted {
        println!("⏸  Daily cap reached; rerun tomorrow for the rest");
    }

    Ok(summary.interrupted)
}

fn run_export(db_path: &Path, out: Option<&Path>) -> Result<()> {
    let conn = open_database(db_path)?;

    let rows = match out {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
            export_csv(&conn, file)?
        }
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            let rows = export_csv(&conn, &mut lock)?;
            lock.flush()?;
            rows
        }
    };

    eprintln!("✓ Exported {} records", rows);

    Ok(())
}

fn run_quota(db_path: &Path, utc_offset_minutes: i32) -> Result<()> {
    let offset = utc_offset(utc_offset_minutes)?;
    let today = day_stamp(Utc::now(), offset);

    let conn = open_database(db_path)?;

    match read_state(&conn)? {
        Some(state) if state.date == today => {
            println!("📊 Quota for {}: {}/{} used, {} left", today, state.count, state.cap, state.remaining_on(today));
        }
        Some(state) => {
            println!("📊 Quota for {}: 0/{} used (last calls on {})", today, state.cap, state.date);
        }
        None => {
            println!("📊 Quota for {}: no calls recorded yet", today);
        }
    }

    Ok(())
}
