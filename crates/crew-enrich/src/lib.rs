//! Collaborator boundary for CREW: the enricher trait, its error taxonomy,
//! the bounded retry policy, the HTTP-backed client and a scripted in-memory
//! double for tests.
//!
//! Nothing in here touches job state. The engine hands a request over, gets a
//! result or a classified error back, and owns everything that happens next.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crew_core::{ConflictResolution, EnrichmentResult};

pub const CRATE_NAME: &str = "crew-enrich";

/// What the collaborator sees for one row: the populated cells plus the names
/// of columns the row left empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichRequest {
    pub row_index: usize,
    pub record: BTreeMap<String, String>,
    pub missing_columns: Vec<String>,
}

/// Follow-up request asking the collaborator to resolve a flagged
/// cross-field inconsistency. Issued at most once per row per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub row_index: usize,
    pub record: BTreeMap<String, String>,
    pub conflict: String,
}

/// Classified collaborator failure. The variant decides the retry behavior:
/// rate limits wait, transient and malformed responses retry immediately,
/// fatal errors do not retry at all.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("rate limited by collaborator")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient collaborator failure: {0}")]
    Transient(String),
    #[error("malformed collaborator response: {0}")]
    Malformed(String),
    #[error("fatal collaborator failure: {0}")]
    Fatal(String),
}

impl EnrichError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Maps an HTTP status to the error taxonomy. 429 carries the parsed
/// `Retry-After` hint; 5xx counts as transient; anything else is fatal.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> EnrichError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        EnrichError::RateLimited { retry_after }
    } else if status.is_server_error() {
        EnrichError::Transient(format!("http status {}", status.as_u16()))
    } else {
        EnrichError::Fatal(format!("http status {}", status.as_u16()))
    }
}

/// Timeouts and connection failures are worth retrying; everything else
/// coming out of the client is fatal.
pub fn classify_reqwest_error(err: &reqwest::Error) -> EnrichError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        EnrichError::Transient(err.to_string())
    } else {
        EnrichError::Fatal(err.to_string())
    }
}

/// Result of running a call through [`RetryPolicy::attempt`], carrying the
/// number of invocations actually made so the row can record it.
#[derive(Debug)]
pub struct Attempted<T> {
    pub outcome: Result<T, EnrichError>,
    pub attempts: usize,
}

/// Bounded retry loop around one collaborator invocation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before the next try after a rate limit: the server hint when one
    /// was sent, else the exponential schedule; capped either way so one row
    /// can never stall the pool indefinitely.
    pub fn rate_limit_delay(&self, attempt_index: usize, hint: Option<Duration>) -> Duration {
        let scheduled = {
            let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        };
        hint.unwrap_or(scheduled).min(self.max_delay)
    }

    /// Runs `call` until it succeeds, fails fatally, or the attempt cap is
    /// reached. Transient and malformed failures retry immediately; rate
    /// limits sleep first. The attempt count is always reported.
    pub async fn attempt<T, F, Fut>(&self, mut call: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EnrichError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match call().await {
                Ok(value) => {
                    return Attempted {
                        outcome: Ok(value),
                        attempts,
                    }
                }
                Err(err) => {
                    if attempts >= max_attempts || !err.is_retryable() {
                        return Attempted {
                            outcome: Err(err),
                            attempts,
                        };
                    }
                    if let EnrichError::RateLimited { retry_after } = &err {
                        let delay = self.rate_limit_delay(attempts - 1, *retry_after);
                        debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, "rate limited, backing off");
                        tokio::time::sleep(delay).await;
                    } else {
                        debug!(attempt = attempts, error = %err, "retrying collaborator call");
                    }
                }
            }
        }
    }
}

/// The external text-generation collaborator, seen through one async seam.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, request: &EnrichRequest) -> Result<EnrichmentResult, EnrichError>;

    /// One follow-up call for a flagged inconsistency. `Ok(None)` means the
    /// collaborator declined to correct anything.
    async fn resolve_conflict(
        &self,
        request: &ResolveRequest,
    ) -> Result<Option<ConflictResolution>, EnrichError>;
}

#[derive(Debug, Clone)]
pub struct HttpEnricherConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpEnricherConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9100".to_string(),
            token: None,
            timeout: Duration::from_secs(60),
        }
    }
}

/// JSON-over-HTTP collaborator client. Each call has a bounded timeout so a
/// hung request degrades at the row instead of pinning a worker forever.
#[derive(Debug)]
pub struct HttpEnricher {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpEnricher {
    pub fn new(config: HttpEnricherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, EnrichError>
    where
        B: Serialize,
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|err| classify_reqwest_error(&err))?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            warn!(%url, status = status.as_u16(), "collaborator returned error status");
            return Err(classify_status(status, retry_after));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| classify_reqwest_error(&err))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| EnrichError::Malformed(format!("decoding response body: {err}")))
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

#[async_trait]
impl Enricher for HttpEnricher {
    async fn enrich(&self, request: &EnrichRequest) -> Result<EnrichmentResult, EnrichError> {
        let result: EnrichmentResult = self.post_json("/enrich", request).await?;
        // A payload with no values at all is indistinguishable from a
        // truncated generation; let the retry policy take another swing.
        if result.is_empty() && result.conflict.is_none() {
            return Err(EnrichError::Malformed("empty enrichment payload".to_string()));
        }
        Ok(result)
    }

    async fn resolve_conflict(
        &self,
        request: &ResolveRequest,
    ) -> Result<Option<ConflictResolution>, EnrichError> {
        self.post_json("/resolve", request).await
    }
}

/// One scripted answer for the in-memory double.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Succeed(EnrichmentResult),
    RateLimited { retry_after: Option<Duration> },
    Transient(String),
    Malformed(String),
    Fatal(String),
}

impl ScriptedOutcome {
    fn into_result(self) -> Result<EnrichmentResult, EnrichError> {
        match self {
            Self::Succeed(result) => Ok(result),
            Self::RateLimited { retry_after } => Err(EnrichError::RateLimited { retry_after }),
            Self::Transient(detail) => Err(EnrichError::Transient(detail)),
            Self::Malformed(detail) => Err(EnrichError::Malformed(detail)),
            Self::Fatal(detail) => Err(EnrichError::Fatal(detail)),
        }
    }
}

/// In-memory [`Enricher`] scripted per key-column value, recording every
/// request it sees. The last scripted outcome for a key is sticky, so a
/// single `Fatal` entry models a row that never succeeds.
#[derive(Debug, Default)]
pub struct ScriptedEnricher {
    key_column: String,
    scripts: Mutex<BTreeMap<String, VecDeque<ScriptedOutcome>>>,
    resolutions: Mutex<BTreeMap<String, Option<ConflictResolution>>>,
    seen_enrich: Mutex<Vec<EnrichRequest>>,
    seen_resolve: Mutex<Vec<ResolveRequest>>,
}

impl ScriptedEnricher {
    pub fn new(key_column: impl Into<String>) -> Self {
        Self {
            key_column: key_column.into(),
            ..Self::default()
        }
    }

    pub fn script(&self, key: impl Into<String>, outcomes: Vec<ScriptedOutcome>) {
        self.scripts
            .lock()
            .expect("script lock")
            .insert(key.into(), outcomes.into());
    }

    pub fn script_resolution(&self, key: impl Into<String>, resolution: Option<ConflictResolution>) {
        self.resolutions
            .lock()
            .expect("resolution lock")
            .insert(key.into(), resolution);
    }

    pub fn enrich_requests(&self) -> Vec<EnrichRequest> {
        self.seen_enrich.lock().expect("seen lock").clone()
    }

    pub fn resolve_requests(&self) -> Vec<ResolveRequest> {
        self.seen_resolve.lock().expect("seen lock").clone()
    }

    fn key_for(&self, record: &BTreeMap<String, String>) -> String {
        record.get(&self.key_column).cloned().unwrap_or_default()
    }

    fn next_outcome(&self, key: &str) -> ScriptedOutcome {
        let mut scripts = self.scripts.lock().expect("script lock");
        match scripts.get_mut(key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().expect("non-empty queue"),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| ScriptedOutcome::Succeed(EnrichmentResult::default())),
            None => ScriptedOutcome::Succeed(EnrichmentResult::default()),
        }
    }
}

#[async_trait]
impl Enricher for ScriptedEnricher {
    async fn enrich(&self, request: &EnrichRequest) -> Result<EnrichmentResult, EnrichError> {
        self.seen_enrich
            .lock()
            .expect("seen lock")
            .push(request.clone());
        let key = self.key_for(&request.record);
        self.next_outcome(&key).into_result()
    }

    async fn resolve_conflict(
        &self,
        request: &ResolveRequest,
    ) -> Result<Option<ConflictResolution>, EnrichError> {
        self.seen_resolve
            .lock()
            .expect("seen lock")
            .push(request.clone());
        let key = self.key_for(&request.record);
        Ok(self
            .resolutions
            .lock()
            .expect("resolution lock")
            .get(&key)
            .cloned()
            .flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn status_classification_matches_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(7))),
            EnrichError::RateLimited {
                retry_after: Some(d)
            } if d == Duration::from_secs(7)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None),
            EnrichError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None),
            EnrichError::Fatal(_)
        ));
    }

    #[test]
    fn fatal_is_the_only_non_retryable_variant() {
        assert!(EnrichError::RateLimited { retry_after: None }.is_retryable());
        assert!(EnrichError::Transient("x".into()).is_retryable());
        assert!(EnrichError::Malformed("x".into()).is_retryable());
        assert!(!EnrichError::Fatal("x".into()).is_retryable());
    }

    #[test]
    fn rate_limit_delay_prefers_hint_and_caps_schedule() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        };
        assert_eq!(policy.rate_limit_delay(0, None), Duration::from_secs(1));
        assert_eq!(policy.rate_limit_delay(2, None), Duration::from_secs(4));
        assert_eq!(policy.rate_limit_delay(5, None), Duration::from_secs(8));
        assert_eq!(
            policy.rate_limit_delay(0, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(
            policy.rate_limit_delay(0, Some(Duration::from_secs(600))),
            Duration::from_secs(8)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_retry_until_success() {
        let policy = RetryPolicy::default();
        let calls = AtomicUsize::new(0);
        let attempted = policy
            .attempt(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(EnrichError::RateLimited { retry_after: None })
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(attempted.attempts, 3);
        assert_eq!(attempted.outcome.expect("third call succeeds"), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_cap_stops_persistent_failures() {
        let policy = RetryPolicy::default();
        let calls = AtomicUsize::new(0);
        let attempted: Attempted<()> = policy
            .attempt(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EnrichError::Transient("connection reset".into())) }
            })
            .await;
        assert_eq!(attempted.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(attempted.outcome, Err(EnrichError::Transient(_))));
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let policy = RetryPolicy::default();
        let calls = AtomicUsize::new(0);
        let attempted: Attempted<()> = policy
            .attempt(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EnrichError::Fatal("bad credentials".into())) }
            })
            .await;
        assert_eq!(attempted.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn request_for(key: &str) -> EnrichRequest {
        EnrichRequest {
            row_index: 0,
            record: BTreeMap::from([("sku".to_string(), key.to_string())]),
            missing_columns: vec![],
        }
    }

    #[tokio::test]
    async fn scripted_enricher_plays_outcomes_in_order_then_sticks() {
        let enricher = ScriptedEnricher::new("sku");
        enricher.script(
            "A-1",
            vec![
                ScriptedOutcome::Transient("blip".into()),
                ScriptedOutcome::Succeed(EnrichmentResult {
                    primary: Some("Cleaned title".into()),
                    ..EnrichmentResult::default()
                }),
            ],
        );

        let first = enricher.enrich(&request_for("A-1")).await;
        assert!(matches!(first, Err(EnrichError::Transient(_))));
        let second = enricher.enrich(&request_for("A-1")).await.expect("success");
        assert_eq!(second.primary.as_deref(), Some("Cleaned title"));
        // Last outcome is sticky.
        let third = enricher.enrich(&request_for("A-1")).await.expect("success");
        assert_eq!(third.primary.as_deref(), Some("Cleaned title"));
        assert_eq!(enricher.enrich_requests().len(), 3);
    }

    #[tokio::test]
    async fn scripted_enricher_records_resolution_calls() {
        let enricher = ScriptedEnricher::new("sku");
        enricher.script_resolution(
            "A-1",
            Some(ConflictResolution {
                feature: "memory".into(),
                value: "16GB".into(),
                justification: "title says 16GB".into(),
            }),
        );

        let request = ResolveRequest {
            row_index: 0,
            record: BTreeMap::from([("sku".to_string(), "A-1".to_string())]),
            conflict: "memory mismatch".into(),
        };
        let resolved = enricher
            .resolve_conflict(&request)
            .await
            .expect("scripted resolution")
            .expect("resolution present");
        assert_eq!(resolved.feature, "memory");
        assert_eq!(enricher.resolve_requests().len(), 1);

        let other = ResolveRequest {
            record: BTreeMap::from([("sku".to_string(), "B-9".to_string())]),
            ..request
        };
        assert!(enricher
            .resolve_conflict(&other)
            .await
            .expect("scripted resolution")
            .is_none());
    }
}
