// 🔁 Pipeline Orchestrator - cache check → quota → validate → merge
//
// Per candidate:
//   Pending → CacheHitFresh
//   Pending → NeedsValidation → QuotaDenied
//   Pending → NeedsValidation → Validating → Stored | Rejected | GivenUp
//
// Strictly sequential. The store, the quota row and the audit trail are only
// written from this loop. Cancellation is cooperative: the flag is looked at
// between candidates and between retry attempts, never inside a store write.

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::client::{Authority, Gate, HaltReason, Rejection, Validation, ValidationClient};
use crate::config::PipelineConfig;
use crate::db::{self, CertRecord, Event};
use crate::normalizer::{Candidate, NormalizedCandidates};
use crate::quota::QuotaGovernor;
use crate::temporal::Clock;

const STORE_FAILURE: &str = "store persistence failure";

/// Longest stretch a wait goes without looking at the interrupt flag
const CANCEL_POLL: Duration = Duration::from_millis(50);

// ============================================================================
// CANCELLATION
// ============================================================================

/// Shared interrupt flag (set from a signal handler, read by the loop)
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` in short slices; false as soon as the flag is set
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CandidateOutcome {
    /// Record present and younger than max age
    CacheHitFresh,
    /// Validated and merged into the store
    Stored { attempts: u32 },
    /// Authority answered but the record doesn't qualify
    Rejected { reason: String, attempts: u32 },
    /// Transient failures on every allowed attempt
    GivenUp { attempts: u32 },
    /// No quota left today; no call made for this candidate
    QuotaDenied,
    /// Interrupt observed before this candidate finished
    Interrupted,
}

impl CandidateOutcome {
    fn event_type(&self) -> &'static str {
        match self {
            CandidateOutcome::CacheHitFresh => "cert_cache_hit",
            CandidateOutcome::Stored { .. } => "cert_stored",
            CandidateOutcome::Rejected { .. } => "cert_rejected",
            CandidateOutcome::GivenUp { .. } => "cert_given_up",
            CandidateOutcome::QuotaDenied => "cert_quota_denied",
            CandidateOutcome::Interrupted => "cert_interrupted",
        }
    }
}

/// Counts per outcome category for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub total: usize,
    pub malformed: usize,
    pub cache_hits: usize,
    pub stored: usize,
    pub rejected: usize,
    pub given_up: usize,
    pub quota_denied: usize,
    /// Candidates never looked at because the run was interrupted
    pub not_processed: usize,
    /// Outbound calls actually made (each one consumed a quota unit)
    pub calls: u32,
    pub quota_remaining: u32,
    pub quota_exhausted: bool,
    pub interrupted: bool,
    /// The authority refused the credential; the run stopped there
    pub auth_refused: bool,
}

impl RunSummary {
    fn record(&mut self, outcome: &CandidateOutcome) {
        match outcome {
            CandidateOutcome::CacheHitFresh => self.cache_hits += 1,
            CandidateOutcome::Stored { .. } => self.stored += 1,
            CandidateOutcome::Rejected { .. } => self.rejected += 1,
            CandidateOutcome::GivenUp { .. } => self.given_up += 1,
            CandidateOutcome::QuotaDenied => self.quota_denied += 1,
            CandidateOutcome::Interrupted => {}
        }
    }

    pub fn report(&self) -> String {
        format!(
            "stored={} cache_hits={} rejected={} given_up={} quota_denied={} not_processed={} malformed={} calls={} quota_remaining={}",
            self.stored,
            self.cache_hits,
            self.rejected,
            self.given_up,
            self.quota_denied,
            self.not_processed,
            self.malformed,
            self.calls,
            self.quota_remaining
        )
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline<'c, A: Authority, C: Clock> {
    conn: &'c Connection,
    client: ValidationClient<A>,
    quota: QuotaGovernor,
    clock: C,
    cancel: CancelToken,
    max_age_seconds: i64,
    run_id: String,
    last_call: Option<Instant>,
    quota_exhausted: bool,
    auth_refused: bool,
    calls: u32,
}

impl<'c, A: Authority, C: Clock> Pipeline<'c, A, C> {
    pub fn new(
        conn: &'c Connection,
        config: &PipelineConfig,
        authority: A,
        clock: C,
        cancel: CancelToken,
    ) -> Result<Self> {
        let quota = QuotaGovernor::load(
            conn,
            config.daily_cap,
            config.sleep_between_calls,
            config.reference_offset,
            clock.now(),
        )
        .context(STORE_FAILURE)?;

        Ok(Pipeline {
            conn,
            client: ValidationClient::new(authority, config.retry),
            quota,
            clock,
            cancel,
            max_age_seconds: config.max_age_seconds,
            run_id: uuid::Uuid::new_v4().to_string(),
            last_call: None,
            quota_exhausted: false,
            auth_refused: false,
            calls: 0,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn quota(&self) -> &QuotaGovernor {
        &self.quota
    }

    /// Process every candidate in order, then flush
    ///
    /// Err only for fatal conditions (the store or quota row can't be written).
    pub fn run(&mut self, candidates: &NormalizedCandidates) -> Result<RunSummary> {
        let mut summary = RunSummary {
            run_id: self.run_id.clone(),
            total: candidates.len(),
            malformed: candidates.malformed,
            ..Default::default()
        };

        info!(
            run_id = %self.run_id,
            candidates = candidates.len(),
            malformed = candidates.malformed,
            quota_remaining = self.quota.remaining(self.clock.now()),
            "validation run started"
        );

        for (index, candidate) in candidates.iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
                summary.not_processed = candidates.len() - index;
                warn!(remaining = summary.not_processed, "interrupt received; stopping");
                break;
            }

            let outcome = self.process(candidate)?;
            summary.record(&outcome);

            if outcome == CandidateOutcome::Interrupted {
                summary.interrupted = true;
                summary.not_processed = candidates.len() - index;
                warn!(cert = %candidate.id, remaining = summary.not_processed, "interrupted during retries; stopping");
                break;
            }

            if self.auth_refused {
                summary.auth_refused = true;
                summary.not_processed = candidates.len() - index - 1;
                break;
            }
        }

        self.flush(&mut summary)?;

        Ok(summary)
    }

    /// One candidate through the state machine
    fn process(&mut self, candidate: &Candidate) -> Result<CandidateOutcome> {
        let id = candidate.id.as_str();
        let now = self.clock.now();

        let stale = db::is_stale(self.conn, id, self.max_age_seconds, now).context(STORE_FAILURE)?;

        if !stale {
            let merged = db::merge_record_annotation(self.conn, id, &candidate.annotation)
                .context(STORE_FAILURE)?;
            debug!(cert = id, annotation_merged = merged, "fresh in cache");
            let outcome = CandidateOutcome::CacheHitFresh;
            self.log_event(Some(id), &outcome)?;
            return Ok(outcome);
        }

        if self.quota_exhausted {
            debug!(cert = id, "quota exhausted earlier this run; not validating");
            let outcome = CandidateOutcome::QuotaDenied;
            self.log_event(Some(id), &outcome)?;
            return Ok(outcome);
        }

        let calls_before = self.calls;
        let validation = self.validate(id)?;
        if self.calls > calls_before {
            // Spacing to the next candidate counts from the end of this call
            self.last_call = Some(Instant::now());
        }

        let outcome = match validation {
            Validation::Accepted { record, attempts } => {
                let stored = db::put_record(
                    self.conn,
                    &CertRecord::new(
                        id,
                        record,
                        &candidate.annotation,
                        self.clock.now(),
                        self.client.source_tag(),
                    ),
                )
                .context(STORE_FAILURE)?;

                info!(
                    cert = id,
                    year = stored.attributes.year,
                    brand = %stored.attributes.brand,
                    subject = %stored.attributes.subject,
                    "stored"
                );
                CandidateOutcome::Stored { attempts }
            }
            Validation::Rejected { rejection, attempts } => {
                if matches!(rejection, Rejection::Unauthorized { .. }) {
                    self.auth_refused = true;
                    error!(cert = id, reason = %rejection, "credential refused; stopping the run");
                } else {
                    info!(cert = id, reason = %rejection, "rejected");
                }
                CandidateOutcome::Rejected {
                    reason: rejection.to_string(),
                    attempts,
                }
            }
            Validation::GivenUp { attempts, last_error } => {
                warn!(cert = id, attempts, %last_error, "given up");
                CandidateOutcome::GivenUp { attempts }
            }
            Validation::Halted {
                reason: HaltReason::QuotaDenied,
                ..
            } => {
                self.quota_exhausted = true;
                info!(cap = self.quota.state().cap, "daily cap reached; no further validation this run");
                CandidateOutcome::QuotaDenied
            }
            Validation::Halted {
                reason: HaltReason::Cancelled,
                ..
            } => CandidateOutcome::Interrupted,
        };

        self.log_event(Some(id), &outcome)?;

        Ok(outcome)
    }

    /// Bounded retry loop; each attempt must clear cancellation, quota and pacing
    ///
    /// Backoff and pacing waits happen here, before the quota unit is taken,
    /// and end early on interrupt.
    fn validate(&mut self, id: &str) -> Result<Validation> {
        let conn = self.conn;
        let Pipeline {
            client,
            quota,
            clock,
            cancel,
            last_call,
            calls,
            ..
        } = self;

        client.validate(id, |attempt, backoff| {
            if attempt > 1 && cancel.is_cancelled() {
                return Ok(Gate::Stop(HaltReason::Cancelled));
            }

            // No point waiting for a call that can't be paid for
            if quota.remaining(clock.now()) == 0 {
                return Ok(Gate::Stop(HaltReason::QuotaDenied));
            }

            let pacing = last_call
                .map(|previous| quota.wait_interval().saturating_sub(previous.elapsed()))
                .unwrap_or_default();
            if !cancel.sleep(backoff.max(pacing)) {
                return Ok(Gate::Stop(HaltReason::Cancelled));
            }

            if !quota.try_consume(conn, clock.now()).context(STORE_FAILURE)? {
                return Ok(Gate::Stop(HaltReason::QuotaDenied));
            }
            *last_call = Some(Instant::now());
            *calls += 1;

            Ok(Gate::Proceed)
        })
    }

    fn log_event(&self, cert: Option<&str>, outcome: &CandidateOutcome) -> Result<()> {
        let event = Event::new(
            &self.run_id,
            outcome.event_type(),
            cert,
            serde_json::to_value(outcome)?,
            self.clock.now(),
        );
        db::insert_event(self.conn, &event).context(STORE_FAILURE)
    }

    /// Final flush point: quota row + run summary event
    fn flush(&mut self, summary: &mut RunSummary) -> Result<()> {
        self.quota.persist(self.conn).context(STORE_FAILURE)?;

        summary.calls = self.calls;
        summary.quota_exhausted = self.quota_exhausted;
        summary.quota_remaining = self.quota.remaining(self.clock.now());

        let event = Event::new(
            &self.run_id,
            "run_completed",
            None,
            serde_json::to_value(&*summary)?,
            self.clock.now(),
        );
        db::insert_event(self.conn, &event).context(STORE_FAILURE)?;

        info!(run_id = %self.run_id, "{}", summary.report());

        Ok(())
    }
}
