// Cert Hunter - Core Library
// Candidate normalization, quota-governed validation and the certificate cache

pub mod candidates;
pub mod client;
pub mod config;
pub mod db;
pub mod export;
pub mod normalizer;
pub mod pipeline;
pub mod quota;
pub mod temporal;

// Re-export commonly used types
pub use candidates::{append_identifiers, load_candidates, rewrite_candidates};
pub use client::{
    Authority, AuthorityResponse, HttpAuthority, Rejection, RetryPolicy, Timeouts,
    TransportError, Validation, ValidationClient, ValidatedRecord,
};
pub use config::{ConfigError, PipelineConfig, RawConfig};
pub use db::{
    CertRecord, Event,
    open_database, setup_database, get_record, put_record, merge_record_annotation,
    is_stale, get_all_records, record_count, insert_event, get_events_for_cert,
    get_events_for_run,
};
pub use export::export_csv;
pub use normalizer::{
    Candidate, NormalizedCandidates,
    extract_identifiers, merge_annotation, normalize_identifier, normalize_lines,
};
pub use pipeline::{CancelToken, CandidateOutcome, Pipeline, RunSummary};
pub use quota::{QuotaGovernor, QuotaState};
pub use temporal::{Clock, ManualClock, SystemClock};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
