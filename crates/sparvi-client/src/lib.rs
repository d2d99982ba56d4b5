//! Typed client for the Sparvi Automation Status and Trigger APIs.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sparvi_core::{NextRuns, RunsByType};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "sparvi-client";

const NOT_FOUND_MARKER: &str = "not found";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
}

impl ApiError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Network(_) => ErrorCategory::Network,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Remote collaborator the next-run coordinator polls and triggers through.
#[async_trait]
pub trait AutomationApi: Send + Sync {
    /// Next-run projections for a single connection, keyed by automation type.
    async fn next_run_times(&self, connection_id: &str, force_fresh: bool)
        -> Result<NextRuns, ApiError>;

    /// Next-run projections for every accessible connection.
    async fn next_run_times_all(&self, force_fresh: bool) -> Result<NextRuns, ApiError>;

    /// Ask the backend to run `automation_type` now. The run is scheduled
    /// asynchronously; run state is not updated by this call.
    async fn trigger_run(&self, connection_id: &str, automation_type: &str)
        -> Result<bool, ApiError>;
}

#[derive(Debug, Default, Deserialize)]
struct NextRunsBody {
    #[serde(default)]
    next_runs: Option<RunsByType>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectionRunsBody {
    #[serde(default)]
    next_runs: Option<RunsByType>,
}

#[derive(Debug, Default, Deserialize)]
struct AllNextRunsBody {
    #[serde(default)]
    next_runs_by_connection: Option<BTreeMap<String, ConnectionRunsBody>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TriggerBody {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse a body into `T`, treating an empty or `null` body as `T::default()`.
fn parse_body<T>(body: &[u8]) -> Result<T, ApiError>
where
    T: Default + serde::de::DeserializeOwned,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| ApiError::Malformed(e.to_string()))?;
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value).map_err(|e| ApiError::Malformed(e.to_string()))
}

/// `Ok(true)` when the server reported a logical "not found" (no schedule yet).
fn check_error_field(error: Option<String>) -> Result<bool, ApiError> {
    match error {
        None => Ok(false),
        Some(msg) if msg.to_ascii_lowercase().contains(NOT_FOUND_MARKER) => Ok(true),
        Some(msg) => Err(ApiError::Upstream(msg)),
    }
}

pub fn normalize_single(body: &[u8]) -> Result<NextRuns, ApiError> {
    let parsed: NextRunsBody = parse_body(body)?;
    if check_error_field(parsed.error)? {
        return Ok(NextRuns::empty(false));
    }
    Ok(NextRuns::Single(parsed.next_runs.unwrap_or_default()))
}

pub fn normalize_all(body: &[u8]) -> Result<NextRuns, ApiError> {
    let parsed: AllNextRunsBody = parse_body(body)?;
    if check_error_field(parsed.error)? {
        return Ok(NextRuns::empty(true));
    }
    let by_connection = parsed
        .next_runs_by_connection
        .unwrap_or_default()
        .into_iter()
        .map(|(conn, runs)| (conn, runs.next_runs.unwrap_or_default()))
        .collect();
    Ok(NextRuns::ByConnection(by_connection))
}

pub fn interpret_trigger(body: &[u8]) -> Result<bool, ApiError> {
    let parsed: TriggerBody = parse_body(body)?;
    if let Some(msg) = parsed.error {
        warn!(error = %msg, "trigger rejected by server");
        return Ok(false);
    }
    Ok(parsed.success.unwrap_or(true))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_api_error(err: &ApiError) -> RetryDisposition {
    match err {
        ApiError::Timeout(_) | ApiError::Network(_) => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            token: None,
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("sparvi-client/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("SPARVI_API_URL").unwrap_or(defaults.base_url),
            token: std::env::var("SPARVI_API_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            timeout: std::env::var("SPARVI_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: std::env::var("SPARVI_USER_AGENT")
                .ok()
                .or(defaults.user_agent),
            backoff: defaults.backoff,
        }
    }
}

/// reqwest-backed [`AutomationApi`].
#[derive(Debug, Clone)]
pub struct HttpAutomationApi {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    backoff: BackoffPolicy,
}

enum GetOutcome {
    Body(Vec<u8>),
    NotFound,
}

impl HttpAutomationApi {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(config.base_url.trim())
            .with_context(|| format!("parsing api base url {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("api base url {} cannot be a base", config.base_url);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            base_url,
            token: config.token,
            backoff: config.backoff,
        })
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::new(ClientConfig::from_env())
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidConfig(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "automation"])
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get_with_retries(&self, mut url: Url, force_fresh: bool) -> Result<GetOutcome, ApiError> {
        if force_fresh {
            url.query_pairs_mut().append_pair("force_fresh", "true");
        }

        let mut attempt = 0usize;
        loop {
            let result = self.authorize(self.client.get(url.clone())).send().await;
            let retry_after = match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(GetOutcome::Body(resp.bytes().await?.to_vec()));
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Ok(GetOutcome::NotFound);
                    }
                    let err = ApiError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(err);
                    }
                    err
                }
                Err(err) => {
                    let err = ApiError::from(err);
                    if classify_api_error(&err) == RetryDisposition::NonRetryable {
                        return Err(err);
                    }
                    err
                }
            };

            if attempt >= self.backoff.max_retries {
                return Err(retry_after);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(attempt, ?delay, error = %retry_after, "retrying automation status request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl AutomationApi for HttpAutomationApi {
    async fn next_run_times(
        &self,
        connection_id: &str,
        force_fresh: bool,
    ) -> Result<NextRuns, ApiError> {
        let url = self.endpoint(&["next-run-times", connection_id])?;
        let span = info_span!("next_run_times", connection_id, force_fresh);
        match self.get_with_retries(url, force_fresh).instrument(span).await? {
            GetOutcome::Body(body) => normalize_single(&body),
            GetOutcome::NotFound => Ok(NextRuns::empty(false)),
        }
    }

    async fn next_run_times_all(&self, force_fresh: bool) -> Result<NextRuns, ApiError> {
        let url = self.endpoint(&["next-run-times"])?;
        let span = info_span!("next_run_times_all", force_fresh);
        match self.get_with_retries(url, force_fresh).instrument(span).await? {
            GetOutcome::Body(body) => normalize_all(&body),
            GetOutcome::NotFound => Ok(NextRuns::empty(true)),
        }
    }

    async fn trigger_run(
        &self,
        connection_id: &str,
        automation_type: &str,
    ) -> Result<bool, ApiError> {
        let url = self.endpoint(&["trigger", connection_id])?;
        let span = info_span!("trigger_run", connection_id, automation_type);
        async move {
            let resp = self
                .authorize(self.client.post(url))
                .json(&serde_json::json!({ "automation_type": automation_type }))
                .send()
                .await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?;
            if !status.is_success() {
                return Err(ApiError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            interpret_trigger(&body)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_empty_bodies_are_empty_success() {
        assert_eq!(normalize_single(b"").unwrap(), NextRuns::empty(false));
        assert_eq!(normalize_single(b"null").unwrap(), NextRuns::empty(false));
        assert_eq!(normalize_all(b"  ").unwrap(), NextRuns::empty(true));
        assert_eq!(normalize_all(b"{}").unwrap(), NextRuns::empty(true));
    }

    #[test]
    fn not_found_error_normalizes_to_empty() {
        let runs = normalize_single(br#"{"error":"Schedule Not Found for connection X"}"#).unwrap();
        assert!(runs.is_empty());
        assert!(!runs.is_multi_connection());
        let all = normalize_all(br#"{"error":"no connections not found"}"#).unwrap();
        assert!(all.is_multi_connection());
    }

    #[test]
    fn other_error_values_fail() {
        let err = normalize_single(br#"{"error":"database unavailable"}"#).unwrap_err();
        assert_eq!(err, ApiError::Upstream("database unavailable".into()));
        assert_eq!(err.category(), ErrorCategory::Unknown);
    }

    #[test]
    fn malformed_bodies_fail() {
        assert!(matches!(normalize_single(b"<html>"), Err(ApiError::Malformed(_))));
        assert!(matches!(
            normalize_single(br#"{"next_runs":[1,2]}"#),
            Err(ApiError::Malformed(_))
        ));
    }

    #[test]
    fn null_flags_read_as_false() {
        let runs = normalize_single(
            br#"{"next_runs":{"validation_automation":{"enabled":true,"next_run_timestamp":10,"is_overdue":false,"currently_running":null},
                "profile_automation":{"enabled":null,"is_overdue":null}}}"#,
        )
        .unwrap();
        let validation = runs.get("validation_automation", None).unwrap();
        assert!(validation.enabled);
        assert!(!validation.currently_running);
        let profile = runs.get("profile_automation", None).unwrap();
        assert!(!profile.enabled);
        assert!(!profile.is_overdue);
        assert_eq!(runs.overdue_count(), 0);
    }

    #[test]
    fn all_connections_shape_is_flattened_per_connection() {
        let runs = normalize_all(
            br#"{"next_runs_by_connection":{
                "c1":{"next_runs":{"validation_automation":{"enabled":true,"next_run_timestamp":10,"is_overdue":true}}},
                "c2":{"next_runs":null}
            }}"#,
        )
        .unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs.get("validation_automation", Some("c1")).is_some());
        assert_eq!(runs.overdue_count(), 1);
    }

    #[test]
    fn trigger_body_interpretation() {
        assert!(interpret_trigger(b"").unwrap());
        assert!(interpret_trigger(br#"{"success":true,"run_id":"r1"}"#).unwrap());
        assert!(!interpret_trigger(br#"{"success":false}"#).unwrap());
        assert!(!interpret_trigger(br#"{"error":"automation disabled"}"#).unwrap());
    }

    #[test]
    fn error_categories() {
        assert_eq!(ApiError::Timeout("t".into()).category(), ErrorCategory::Timeout);
        assert_eq!(ApiError::Network("n".into()).category(), ErrorCategory::Network);
        assert_eq!(
            ApiError::HttpStatus { status: 500, url: "u".into() }.category(),
            ErrorCategory::Unknown
        );
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    #[test]
    fn default_retry_delays_double_until_the_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(5));
        // shifts past the width of u32 saturate instead of wrapping to zero
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_secs(5));
    }

    #[test]
    fn no_retry_policy_keeps_delays() {
        let policy = BackoffPolicy::none();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
    }

    #[test]
    fn endpoints_escape_connection_ids() {
        let api = HttpAutomationApi::new(ClientConfig {
            base_url: "https://api.sparvi.test/v1/".into(),
            ..Default::default()
        })
        .unwrap();
        let url = api.endpoint(&["next-run-times", "conn 1/a"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.sparvi.test/v1/api/automation/next-run-times/conn%201%2Fa"
        );
    }

    #[test]
    fn rejects_unusable_base_url() {
        assert!(HttpAutomationApi::new(ClientConfig {
            base_url: "mailto:ops@sparvi.test".into(),
            ..Default::default()
        })
        .is_err());
    }
}
