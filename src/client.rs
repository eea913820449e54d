// 🛰️ Validation Client - one authority lookup per certificate, bounded retries
//
// Outcomes per attempt:
//   Accepted   → well-formed payload with year (4 digits), brand, subject
//   Rejected   → well-formed answer that doesn't qualify, or 4xx (never retried)
//   Transient  → connect/read timeout, network error, 408/429/5xx (retried)

use anyhow::{Context, Result};
use reqwest::header::ACCEPT;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

// ============================================================================
// VALIDATED RECORD
// ============================================================================

/// Structured attributes confirmed by the authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedRecord {
    /// Required: four-digit year
    pub year: i32,

    /// Required: brand / issuer label
    pub brand: String,

    /// Required: subject label
    pub subject: String,

    pub category: Option<String>,
    pub card_number: Option<String>,
    pub variety: Option<String>,
    pub card_grade: Option<String>,
    pub grade_description: Option<String>,
    pub total_population: Option<i64>,

    /// HTTP status of the accepted response
    pub http_status: u16,

    /// Raw payload as received
    pub payload_json: String,
}

impl ValidatedRecord {
    /// All required attributes present and well-formed
    pub fn is_complete(&self) -> bool {
        (1000..=9999).contains(&self.year)
            && !self.brand.trim().is_empty()
            && !self.subject.trim().is_empty()
    }
}

// ============================================================================
// ERRORS / OUTCOMES
// ============================================================================

/// Why a response was not accepted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("authority has no record (HTTP {status})")]
    NotFound { status: u16 },

    #[error("authority refused the lookup (HTTP {status})")]
    Refused { status: u16 },

    /// 401/403: the credential itself was refused, every later lookup will be too
    #[error("authority refused the credential (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("payload is not a certificate object: {0}")]
    MalformedPayload(String),

    #[error("required field {0} is missing or empty")]
    MissingField(&'static str),

    #[error("year {0:?} is not a four-digit year")]
    InvalidYear(String),

    #[error("payload describes certificate {got}, not {expected}")]
    CertMismatch { expected: String, got: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("request failed: {0}")]
    Other(String),
}

/// Result of exactly one outbound call
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Accepted(ValidatedRecord),
    Rejected(Rejection),
    Transient(String),
}

/// Why the retry loop stopped without an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltReason {
    QuotaDenied,
    Cancelled,
}

/// Decision taken before each attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    Stop(HaltReason),
}

/// Final result of `ValidationClient::validate`
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Accepted { record: ValidatedRecord, attempts: u32 },
    Rejected { rejection: Rejection, attempts: u32 },
    GivenUp { attempts: u32, last_error: String },
    Halted { attempts: u32, reason: HaltReason },
}

// ============================================================================
// AUTHORITY (transport seam)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityResponse {
    pub status: u16,
    pub body: String,
}

/// The external service that confirms certificates
pub trait Authority {
    fn fetch(&self, cert: &str) -> std::result::Result<AuthorityResponse, TransportError>;

    /// Tag stored with every record this authority produced
    fn source_tag(&self) -> &str;
}

impl<T: Authority + ?Sized> Authority for &T {
    fn fetch(&self, cert: &str) -> std::result::Result<AuthorityResponse, TransportError> {
        (**self).fetch(cert)
    }

    fn source_tag(&self) -> &str {
        (**self).source_tag()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Budget for establishing the connection
    pub connect: Duration,
    /// Budget for the whole request including the response body
    ///
    /// reqwest's blocking client only offers a total request timeout, so the
    /// time spent connecting also counts against this budget. Keep it larger
    /// than `connect`.
    pub read: Duration,
}

/// Certificate lookup over HTTPS with a bearer credential
pub struct HttpAuthority {
    client: reqwest::blocking::Client,
    base_url: String,
    credential: SecretString,
}

impl HttpAuthority {
    pub const SOURCE_TAG: &'static str = "psa-public-api";

    pub fn new(base_url: &str, credential: SecretString, timeouts: Timeouts) -> Result<Self> {
        Self::with_builder(reqwest::blocking::Client::builder(), base_url, credential, timeouts)
    }

    /// Same as `new`, starting from a caller-prepared builder (proxy, TLS roots)
    pub fn with_builder(
        builder: reqwest::blocking::ClientBuilder,
        base_url: &str,
        credential: SecretString,
        timeouts: Timeouts,
    ) -> Result<Self> {
        let client = builder
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.read)
            .user_agent(format!("cert-hunter/{}", crate::VERSION))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential,
        })
    }

    fn classify_transport(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

impl Authority for HttpAuthority {
    fn fetch(&self, cert: &str) -> std::result::Result<AuthorityResponse, TransportError> {
        let url = format!("{}/cert/GetByCertNumber/{}", self.base_url, cert);

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.credential.expose_secret())
            .header(ACCEPT, "application/json")
            .send()
            .map_err(Self::classify_transport)?;

        let status = response.status().as_u16();
        let body = response.text().map_err(Self::classify_transport)?;

        debug!(%url, status, body_len = body.len(), "authority response");

        Ok(AuthorityResponse { status, body })
    }

    fn source_tag(&self) -> &str {
        Self::SOURCE_TAG
    }
}

// ============================================================================
// RESPONSE ACCEPTANCE
// ============================================================================

#[derive(Debug, Deserialize)]
struct CertEnvelope {
    #[serde(rename = "PSACert")]
    cert: Option<CertPayload>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CertPayload {
    cert_number: Option<Value>,
    year: Option<Value>,
    brand: Option<Value>,
    subject: Option<Value>,
    category: Option<Value>,
    card_number: Option<Value>,
    variety: Option<Value>,
    card_grade: Option<Value>,
    grade_description: Option<Value>,
    total_population: Option<Value>,
}

/// Non-empty text from a string or number field
fn text_field(value: &Option<Value>) -> Option<String> {
    let text = match value.as_ref()? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Exactly four digits, as a string or an integer
fn parse_year(value: &Value) -> std::result::Result<i32, Rejection> {
    let raw = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        other => return Err(Rejection::InvalidYear(other.to_string())),
    };

    if raw.len() != 4 || !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(Rejection::InvalidYear(raw));
    }

    match raw.parse::<i32>() {
        Ok(year) if year >= 1000 => Ok(year),
        _ => Err(Rejection::InvalidYear(raw)),
    }
}

/// Map a 2xx body into a ValidatedRecord, or say why not
pub fn accept_payload(
    cert: &str,
    status: u16,
    body: &str,
) -> std::result::Result<ValidatedRecord, Rejection> {
    let envelope: CertEnvelope = serde_json::from_str(body).map_err(|e| {
        let preview: String = body.chars().take(200).collect();
        Rejection::MalformedPayload(format!("{} (body: {})", e, preview.replace('\n', " ")))
    })?;

    let payload = envelope.cert.unwrap_or_default();

    if let Some(got) = text_field(&payload.cert_number) {
        if got != cert {
            return Err(Rejection::CertMismatch {
                expected: cert.to_string(),
                got,
            });
        }
    }

    let year = match payload.year.as_ref() {
        Some(Value::Null) | None => return Err(Rejection::MissingField("Year")),
        Some(value) => parse_year(value)?,
    };
    let brand = text_field(&payload.brand).ok_or(Rejection::MissingField("Brand"))?;
    let subject = text_field(&payload.subject).ok_or(Rejection::MissingField("Subject"))?;

    Ok(ValidatedRecord {
        year,
        brand,
        subject,
        category: text_field(&payload.category),
        card_number: text_field(&payload.card_number),
        variety: text_field(&payload.variety),
        card_grade: text_field(&payload.card_grade),
        grade_description: text_field(&payload.grade_description),
        total_population: payload.total_population.as_ref().and_then(Value::as_i64),
        http_status: status,
        payload_json: body.to_string(),
    })
}

/// Classify one raw authority response
pub fn classify_response(cert: &str, response: &AuthorityResponse) -> AttemptOutcome {
    match response.status {
        200..=299 => match accept_payload(cert, response.status, &response.body) {
            Ok(record) => AttemptOutcome::Accepted(record),
            Err(rejection) => AttemptOutcome::Rejected(rejection),
        },
        408 | 429 | 500..=599 => {
            AttemptOutcome::Transient(format!("authority returned HTTP {}", response.status))
        }
        404 => AttemptOutcome::Rejected(Rejection::NotFound {
            status: response.status,
        }),
        401 | 403 => AttemptOutcome::Rejected(Rejection::Unauthorized {
            status: response.status,
        }),
        status => AttemptOutcome::Rejected(Rejection::Refused { status }),
    }
}

// ============================================================================
// RETRY POLICY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retry_count: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(retry_count: u32, base_backoff: Duration) -> Self {
        RetryPolicy {
            retry_count,
            base_backoff,
            max_backoff: Duration::from_secs(30),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Delay after the `failed_attempt`-th attempt: base * 2^(n-1), capped
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

// ============================================================================
// VALIDATION CLIENT
// ============================================================================

/// Retry state machine: Attempt(n) → (Finished | Backoff → Attempt(n+1))
enum Step {
    Attempt { n: u32, wait: Duration },
    Backoff { failed: u32 },
    Finished(Validation),
}

pub struct ValidationClient<A: Authority> {
    authority: A,
    policy: RetryPolicy,
}

impl<A: Authority> ValidationClient<A> {
    pub fn new(authority: A, policy: RetryPolicy) -> Self {
        ValidationClient { authority, policy }
    }

    pub fn source_tag(&self) -> &str {
        self.authority.source_tag()
    }

    /// Exactly one outbound call, classified
    pub fn attempt(&self, cert: &str) -> AttemptOutcome {
        match self.authority.fetch(cert) {
            Ok(response) => classify_response(cert, &response),
            Err(err) => AttemptOutcome::Transient(err.to_string()),
        }
    }

    /// Validate one certificate
    ///
    /// `gate(n, wait)` runs before attempt `n` and may stop the loop (quota,
    /// cancel). `wait` is the backoff owed before that attempt (zero for the
    /// first); the gate does the waiting so it can be cut short.
    /// An error from `gate` is fatal and is returned as-is.
    pub fn validate<G>(&self, cert: &str, mut gate: G) -> Result<Validation>
    where
        G: FnMut(u32, Duration) -> Result<Gate>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut step = Step::Attempt {
            n: 1,
            wait: Duration::ZERO,
        };

        loop {
            step = match step {
                Step::Attempt { n, wait } => match gate(n, wait)? {
                    Gate::Stop(reason) => Step::Finished(Validation::Halted {
                        attempts: n - 1,
                        reason,
                    }),
                    Gate::Proceed => match self.attempt(cert) {
                        AttemptOutcome::Accepted(record) => {
                            Step::Finished(Validation::Accepted { record, attempts: n })
                        }
                        AttemptOutcome::Rejected(rejection) => {
                            Step::Finished(Validation::Rejected { rejection, attempts: n })
                        }
                        AttemptOutcome::Transient(error) if n < max_attempts => {
                            warn!(cert, attempt = n, %error, "transient failure; will retry");
                            Step::Backoff { failed: n }
                        }
                        AttemptOutcome::Transient(error) => {
                            warn!(cert, attempts = n, %error, "giving up");
                            Step::Finished(Validation::GivenUp {
                                attempts: n,
                                last_error: error,
                            })
                        }
                    },
                },
                Step::Backoff { failed } => Step::Attempt {
                    n: failed + 1,
                    wait: self.policy.backoff_for(failed),
                },
                Step::Finished(validation) => return Ok(validation),
            };
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    /// Authority that replays a fixed script of responses
    pub(crate) struct ScriptedAuthority {
        script: RefCell<VecDeque<std::result::Result<AuthorityResponse, TransportError>>>,
        calls: Cell<u32>,
        requested: RefCell<Vec<String>>,
    }

    impl ScriptedAuthority {
        pub(crate) fn new() -> Self {
            ScriptedAuthority {
                script: RefCell::new(VecDeque::new()),
                calls: Cell::new(0),
                requested: RefCell::new(Vec::new()),
            }
        }

        pub(crate) fn then_ok(self, status: u16, body: &str) -> Self {
            self.script.borrow_mut().push_back(Ok(AuthorityResponse {
                status,
                body: body.to_string(),
            }));
            self
        }

        pub(crate) fn then_timeout(self) -> Self {
            self.script
                .borrow_mut()
                .push_back(Err(TransportError::Timeout("read timed out".to_string())));
            self
        }

        pub(crate) fn calls(&self) -> u32 {
            self.calls.get()
        }

        pub(crate) fn requested(&self) -> Vec<String> {
            self.requested.borrow().clone()
        }
    }

    impl Authority for ScriptedAuthority {
        fn fetch(&self, cert: &str) -> std::result::Result<AuthorityResponse, TransportError> {
            self.calls.set(self.calls.get() + 1);
            self.requested.borrow_mut().push(cert.to_string());
            self.script
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connect("script exhausted".to_string())))
        }

        fn source_tag(&self) -> &str {
            "scripted"
        }
    }

    /// A complete 200 body for `cert`
    pub(crate) fn cert_body(cert: &str, year: &str, brand: &str, subject: &str) -> String {
        serde_json::json!({
            "PSACert": {
                "CertNumber": cert,
                "Year": year,
                "Brand": brand,
                "Subject": subject,
                "Category": "BASEBALL CARDS",
                "CardNumber": "311",
                "CardGrade": "NM-MT 8",
                "TotalPopulation": 1342
            },
            "ServerMessage": "Request successful"
        })
        .to_string()
    }
}
