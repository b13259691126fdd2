//! Dispatcher (C5, spec.md §4.4): builds the request once, signs it,
//! drives the retry loop under the configuration's circuit breaker, and
//! records every attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::authorize::{domain_key_for_url, DomainAuthorizer};
use crate::breaker::CircuitBreakerRegistry;
use crate::error::{AttemptError, DenyReason, DispatchError};
use crate::model::{truncate, CallbackConfiguration, CallbackExecution, ExecutionStatus, ERROR_MESSAGE_CAP, RESPONSE_BODY_CAP};
use crate::store::ConfigStore;

type HmacSha256 = Hmac<Sha256>;

/// Default cap on the number of response bytes buffered in memory per
/// attempt (spec.md §6, "HTTP client max-in-memory response size").
const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

pub struct Dispatcher {
    store: Arc<dyn ConfigStore>,
    authorizer: Arc<DomainAuthorizer>,
    breakers: Arc<CircuitBreakerRegistry>,
    http: reqwest::Client,
    max_response_bytes: usize,
}

struct BuiltRequest {
    body: Vec<u8>,
    headers: HashMap<String, String>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn ConfigStore>, authorizer: Arc<DomainAuthorizer>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { store, authorizer, breakers, http: reqwest::Client::new(), max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES }
    }

    pub fn with_client(
        store: Arc<dyn ConfigStore>,
        authorizer: Arc<DomainAuthorizer>,
        breakers: Arc<CircuitBreakerRegistry>,
        http: reqwest::Client,
    ) -> Self {
        Self { store, authorizer, breakers, http, max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES }
    }

    /// Overrides the default in-memory response size cap (spec.md §6).
    pub fn with_max_response_bytes(mut self, max_response_bytes: usize) -> Self {
        self.max_response_bytes = max_response_bytes;
        self
    }

    /// Dispatch `(config, event)`. Completes when the dispatch is terminal
    /// (success or permanent failure). Never propagates an error to the
    /// router — failures are fully absorbed here and reflected only in
    /// recorded executions and the configuration's failure counters.
    pub async fn dispatch(
        &self,
        config: &CallbackConfiguration,
        event_type: &str,
        source_event_id: Uuid,
        payload: &serde_json::Value,
        cancellation: CancellationToken,
    ) {
        // 1. Authorize.
        if let Err(crate::error::AuthorizeError::Denied(reason)) = self.authorizer.authorize(&config.url).await {
            self.finish_not_authorized(config, event_type, source_event_id, payload, reason).await;
            return;
        }

        // 2. Build request once.
        let built = match self.build_request(config, event_type, source_event_id, payload) {
            Ok(b) => b,
            Err(e) => {
                self.record_permanent(config, event_type, source_event_id, payload, 1, 1, None, None, &e.to_string()).await;
                let _ = self.store.record_failure(config.id).await;
                return;
            }
        };

        // 3. Retry loop.
        let max_attempts = config.max_retries + 1;
        for attempt in 1..=max_attempts {
            if cancellation.is_cancelled() {
                self.record_permanent(config, event_type, source_event_id, payload, attempt, max_attempts, None, None, "cancelled")
                    .await;
                let _ = self.store.record_failure(config.id).await;
                return;
            }

            let Some(permit) = self.breakers.acquire(config.id) else {
                self.record_permanent(
                    config,
                    event_type,
                    source_event_id,
                    payload,
                    1,
                    max_attempts,
                    None,
                    None,
                    "circuit_open",
                )
                .await;
                let _ = self.store.record_failure(config.id).await;
                self.record_domain_outcome(config, false).await;
                return;
            };

            let started = Instant::now();
            let outcome = tokio::select! {
                result = self.send_once(config, &built) => result,
                _ = cancellation.cancelled() => {
                    permit.record(true, started.elapsed());
                    self.record_permanent(config, event_type, source_event_id, payload, attempt, max_attempts, None, None, "cancelled").await;
                    let _ = self.store.record_failure(config.id).await;
                    return;
                }
            };
            let elapsed = started.elapsed();

            match outcome {
                Ok((status, headers, body)) => {
                    permit.record(false, elapsed);
                    self.record_success(config, event_type, source_event_id, payload, attempt, max_attempts, status, headers, &body, elapsed)
                        .await;
                    let _ = self.store.record_success(config.id).await;
                    self.record_domain_outcome(config, true).await;
                    return;
                }
                Err(attempt_err) => {
                    permit.record(true, elapsed);
                    let retryable = attempt_err.is_retryable();
                    if retryable && attempt < max_attempts {
                        self.record_retrying(
                            config,
                            event_type,
                            source_event_id,
                            payload,
                            attempt,
                            max_attempts,
                            attempt_err.status_code(),
                            &attempt_err.to_string(),
                            elapsed,
                        )
                        .await;
                        let delay = retry_delay(config, attempt);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancellation.cancelled() => {
                                self.record_permanent(config, event_type, source_event_id, payload, attempt, max_attempts, None, None, "cancelled").await;
                                let _ = self.store.record_failure(config.id).await;
                                return;
                            }
                        }
                        continue;
                    }

                    self.record_permanent(
                        config,
                        event_type,
                        source_event_id,
                        payload,
                        attempt,
                        max_attempts,
                        attempt_err.status_code(),
                        None,
                        &attempt_err.to_string(),
                    )
                    .await;
                    let _ = self.store.record_failure(config.id).await;
                    self.record_domain_outcome(config, false).await;
                    return;
                }
            }
        }
    }

    fn build_request(
        &self,
        config: &CallbackConfiguration,
        event_type: &str,
        source_event_id: Uuid,
        payload: &serde_json::Value,
    ) -> Result<BuiltRequest, DispatchError> {
        let body = serde_json::to_vec(payload).map_err(|e| DispatchError::PayloadSerialization(e.to_string()))?;

        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("X-Event-Type".to_string(), event_type.to_string());
        headers.insert("X-Event-Id".to_string(), source_event_id.to_string());
        headers.insert("X-Timestamp".to_string(), Utc::now().to_rfc3339());
        for (k, v) in &config.custom_headers {
            headers.insert(k.clone(), v.clone());
        }

        if config.signature_enabled {
            let secret = config.secret.as_deref().unwrap_or(&[]);
            let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
            mac.update(&body);
            let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
            let header_name = if config.signature_header.is_empty() {
                CallbackConfiguration::default_signature_header()
            } else {
                config.signature_header.clone()
            };
            headers.insert(header_name, signature);
        }

        Ok(BuiltRequest { body, headers })
    }

    async fn send_once(
        &self,
        config: &CallbackConfiguration,
        built: &BuiltRequest,
    ) -> Result<(u16, HashMap<String, String>, String), AttemptError> {
        let mut req = self.http.request(config.method.as_reqwest(), &config.url);
        for (name, value) in &built.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        req = req.body(built.body.clone()).timeout(Duration::from_millis(config.timeout_ms));

        let response = match req.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(AttemptError::Timeout),
            Err(e) => return Err(AttemptError::Transport(e.to_string())),
        };

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = read_body_capped(response, self.max_response_bytes).await;

        if (200..300).contains(&status) {
            Ok((status, headers, body))
        } else if status == 408 || status == 429 || (500..600).contains(&status) {
            Err(AttemptError::ServerError(status))
        } else {
            Err(AttemptError::ClientError(status))
        }
    }

    async fn record_domain_outcome(&self, config: &CallbackConfiguration, success: bool) {
        if let Some(domain) = domain_key_for_url(&config.url) {
            let _ = self.store.record_domain_callback(&domain, success).await;
        }
    }

    async fn finish_not_authorized(
        &self,
        config: &CallbackConfiguration,
        event_type: &str,
        source_event_id: Uuid,
        payload: &serde_json::Value,
        reason: DenyReason,
    ) {
        self.record_permanent(
            config,
            event_type,
            source_event_id,
            payload,
            1,
            1,
            None,
            None,
            &format!("not_authorized: {reason}"),
        )
        .await;
        let _ = self.store.record_failure(config.id).await;
        // "increment domain counter ... only if the domain was known" —
        // look the domain up directly rather than trusting the denial
        // reason, since a malformed URL never resolves to a domain row.
        if let Some(domain_key) = domain_key_for_url(&config.url) {
            if self.store.get_domain_by_name(&domain_key).await.ok().flatten().is_some() {
                let _ = self.store.record_domain_callback(&domain_key, false).await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_success(
        &self,
        config: &CallbackConfiguration,
        event_type: &str,
        source_event_id: Uuid,
        payload: &serde_json::Value,
        attempt: u32,
        max_attempts: u32,
        status: u16,
        headers: HashMap<String, String>,
        body: &str,
        duration: Duration,
    ) {
        let now = Utc::now();
        let execution = CallbackExecution {
            id: Uuid::new_v4(),
            configuration_id: config.id,
            event_type: event_type.to_string(),
            source_event_id,
            status: ExecutionStatus::Success,
            attempt_number: attempt,
            max_attempts,
            request_payload: payload.to_string(),
            request_headers: HashMap::new(),
            response_headers: headers,
            response_body: Some(truncate(body, RESPONSE_BODY_CAP)),
            response_status_code: Some(status),
            request_duration_ms: duration.as_millis() as u64,
            error_message: None,
            next_retry_at: None,
            executed_at: now,
            completed_at: now,
        };
        if let Err(e) = self.store.append_execution(execution).await {
            tracing::warn!(error = %e, configuration_id = %config.id, "failed to append success execution row");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_retrying(
        &self,
        config: &CallbackConfiguration,
        event_type: &str,
        source_event_id: Uuid,
        payload: &serde_json::Value,
        attempt: u32,
        max_attempts: u32,
        status: Option<u16>,
        error_message: &str,
        duration: Duration,
    ) {
        let now = Utc::now();
        let next_retry_at = now + chrono::Duration::milliseconds(retry_delay(config, attempt).as_millis() as i64);
        let execution = CallbackExecution {
            id: Uuid::new_v4(),
            configuration_id: config.id,
            event_type: event_type.to_string(),
            source_event_id,
            status: ExecutionStatus::FailedRetrying,
            attempt_number: attempt,
            max_attempts,
            request_payload: payload.to_string(),
            request_headers: HashMap::new(),
            response_headers: HashMap::new(),
            response_body: None,
            response_status_code: status,
            request_duration_ms: duration.as_millis() as u64,
            error_message: Some(truncate(error_message, ERROR_MESSAGE_CAP)),
            next_retry_at: Some(next_retry_at),
            executed_at: now,
            completed_at: now,
        };
        if let Err(e) = self.store.append_execution(execution).await {
            tracing::warn!(error = %e, configuration_id = %config.id, "failed to append retrying execution row");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_permanent(
        &self,
        config: &CallbackConfiguration,
        event_type: &str,
        source_event_id: Uuid,
        payload: &serde_json::Value,
        attempt: u32,
        max_attempts: u32,
        status: Option<u16>,
        _headers: Option<HashMap<String, String>>,
        error_message: &str,
    ) {
        let now = Utc::now();
        let execution = CallbackExecution {
            id: Uuid::new_v4(),
            configuration_id: config.id,
            event_type: event_type.to_string(),
            source_event_id,
            status: ExecutionStatus::FailedPermanent,
            attempt_number: attempt,
            max_attempts,
            request_payload: payload.to_string(),
            request_headers: HashMap::new(),
            response_headers: HashMap::new(),
            response_body: None,
            response_status_code: status,
            request_duration_ms: 0,
            error_message: Some(truncate(error_message, ERROR_MESSAGE_CAP)),
            next_retry_at: None,
            executed_at: now,
            completed_at: now,
        };
        if let Err(e) = self.store.append_execution(execution).await {
            tracing::warn!(error = %e, configuration_id = %config.id, "failed to append permanent-failure execution row");
        }
    }
}

/// Reads the response body chunk by chunk, keeping at most
/// `max_bytes` of it in memory regardless of how large the actual
/// response is; excess chunks are drained (so the connection can be
/// reused) but discarded.
async fn read_body_capped(mut response: reqwest::Response, max_bytes: usize) -> String {
    let mut body = Vec::with_capacity(max_bytes.min(64 * 1024));
    loop {
        let chunk = match response.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(_) => break,
        };
        if body.len() < max_bytes {
            let remaining = max_bytes - body.len();
            let take = remaining.min(chunk.len());
            body.extend_from_slice(&chunk[..take]);
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// `delay_ms = min(retry_delay_ms * multiplier^(n-1), 60000)` (spec.md §4.4).
fn retry_delay(config: &CallbackConfiguration, attempt: u32) -> Duration {
    let exp = config.retry_backoff_multiplier.powi((attempt - 1) as i32);
    let delay_ms = (config.retry_delay_ms as f64 * exp).min(60_000.0);
    Duration::from_millis(delay_ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuthorizedDomain, ConfigurationStatus, HttpMethod};
    use crate::store::InMemoryConfigStore;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn base_config(url: String) -> CallbackConfiguration {
        CallbackConfiguration {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            url,
            method: HttpMethod::Post,
            status: ConfigurationStatus::Active,
            subscribed_event_types: vec!["customer.created".to_string()],
            custom_headers: HashMap::new(),
            metadata: HashMap::new(),
            signature_enabled: true,
            secret: Some(b"s".to_vec()),
            signature_header: "X-Signature".to_string(),
            max_retries: 3,
            retry_delay_ms: 10,
            retry_backoff_multiplier: 2.0,
            timeout_ms: 2_000,
            filter_expression: None,
            failure_threshold: 5,
            failure_count: 0,
            last_success_at: None,
            last_failure_at: None,
            active: true,
        }
    }

    fn allow_all_domain(host_port: &str) -> AuthorizedDomain {
        AuthorizedDomain {
            id: Uuid::new_v4(),
            domain: host_port.to_string(),
            verified: true,
            active: true,
            allowed_paths: vec![],
            require_https: false,
            expires_at: None,
            ip_whitelist: None,
            max_callbacks_per_minute: None,
            total_callbacks: 0,
            total_failed: 0,
            last_callback_at: None,
        }
    }

    fn harness(domain_host_port: &str) -> (Arc<InMemoryConfigStore>, Dispatcher) {
        let store = Arc::new(InMemoryConfigStore::new());
        store.insert_domain(allow_all_domain(domain_host_port));
        let authorizer = Arc::new(DomainAuthorizer::new(store.clone()));
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let dispatcher = Dispatcher::new(store.clone(), authorizer, breakers);
        (store, dispatcher)
    }

    fn host_port(url: &str) -> String {
        let parsed = url::Url::parse(url).unwrap();
        format!("{}:{}", parsed.host_str().unwrap(), parsed.port().unwrap())
    }

    #[tokio::test]
    async fn s1_happy_path_signs_and_records_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("X-Event-Type", "customer.created"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/hook", server.uri());
        let (store, dispatcher) = harness(&host_port(&url));
        let mut config = base_config(url);
        config.id = Uuid::new_v4();
        store.insert_config(config.clone());

        let event_id = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        let payload = serde_json::json!({"data": {"id": "c1"}});
        dispatcher.dispatch(&config, "customer.created", event_id, &payload, CancellationToken::new()).await;

        let executions = store.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Success);
        assert_eq!(executions[0].response_status_code, Some(200));
        assert_eq!(store.get_config_sync(config.id).unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn s2_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let url = format!("{}/hook", server.uri());
        let (store, dispatcher) = harness(&host_port(&url));
        let config = base_config(url);
        store.insert_config(config.clone());

        dispatcher
            .dispatch(&config, "customer.created", Uuid::new_v4(), &serde_json::json!({}), CancellationToken::new())
            .await;

        let executions = store.executions();
        assert_eq!(executions.len(), 3);
        assert_eq!(executions[0].status, ExecutionStatus::FailedRetrying);
        assert_eq!(executions[1].status, ExecutionStatus::FailedRetrying);
        assert_eq!(executions[2].status, ExecutionStatus::Success);
        assert_eq!(store.get_config_sync(config.id).unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn s3_permanent_4xx_no_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(404)).expect(1).mount(&server).await;

        let url = format!("{}/hook", server.uri());
        let (store, dispatcher) = harness(&host_port(&url));
        let config = base_config(url);
        store.insert_config(config.clone());

        dispatcher
            .dispatch(&config, "customer.created", Uuid::new_v4(), &serde_json::json!({}), CancellationToken::new())
            .await;

        let executions = store.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::FailedPermanent);
        assert_eq!(executions[0].response_status_code, Some(404));
        assert_eq!(store.get_config_sync(config.id).unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn s4_unauthorized_domain_makes_zero_requests() {
        let store = Arc::new(InMemoryConfigStore::new());
        let authorizer = Arc::new(DomainAuthorizer::new(store.clone()));
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let dispatcher = Dispatcher::new(store.clone(), authorizer, breakers);

        let config = base_config("http://evil.example/hook".to_string());
        store.insert_config(config.clone());

        dispatcher
            .dispatch(&config, "customer.created", Uuid::new_v4(), &serde_json::json!({}), CancellationToken::new())
            .await;

        let executions = store.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::FailedPermanent);
        assert!(executions[0].error_message.as_deref().unwrap().starts_with("not_authorized"));
    }

    #[tokio::test]
    async fn max_retries_zero_yields_single_permanent_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(503)).expect(1).mount(&server).await;

        let url = format!("{}/hook", server.uri());
        let (store, dispatcher) = harness(&host_port(&url));
        let mut config = base_config(url);
        config.max_retries = 0;
        store.insert_config(config.clone());

        dispatcher
            .dispatch(&config, "customer.created", Uuid::new_v4(), &serde_json::json!({}), CancellationToken::new())
            .await;

        let executions = store.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::FailedPermanent);
    }

    #[tokio::test]
    async fn s5_breaker_opens_after_failure_threshold() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

        let url = format!("{}/hook", server.uri());
        let (store, dispatcher) = harness(&host_port(&url));
        let mut config = base_config(url);
        config.max_retries = 0;
        config.failure_threshold = 100;
        store.insert_config(config.clone());

        for _ in 0..10 {
            dispatcher
                .dispatch(&config, "customer.created", Uuid::new_v4(), &serde_json::json!({}), CancellationToken::new())
                .await;
        }

        dispatcher
            .dispatch(&config, "customer.created", Uuid::new_v4(), &serde_json::json!({}), CancellationToken::new())
            .await;

        let executions = store.executions();
        assert_eq!(executions.len(), 11);
        let last = executions.last().unwrap();
        assert_eq!(last.status, ExecutionStatus::FailedPermanent);
        assert_eq!(last.error_message.as_deref(), Some("circuit_open"));
    }

    #[tokio::test]
    async fn s6_auto_pause_after_failure_threshold_excludes_from_routing() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(404)).mount(&server).await;

        let url = format!("{}/hook", server.uri());
        let (store, dispatcher) = harness(&host_port(&url));
        let mut config = base_config(url);
        config.failure_threshold = 3;
        store.insert_config(config.clone());

        for _ in 0..3 {
            dispatcher
                .dispatch(&config, "customer.created", Uuid::new_v4(), &serde_json::json!({}), CancellationToken::new())
                .await;
        }

        let stored = store.get_config_sync(config.id).unwrap();
        assert_eq!(stored.status, ConfigurationStatus::Paused);
        assert_eq!(stored.failure_count, 3);

        let matched = store.active_configs_for_event_type("customer.created").await.unwrap();
        assert!(matched.is_empty());

        store.record_success(config.id).await.unwrap();
        let reactivated = store.get_config_sync(config.id).unwrap();
        assert_eq!(reactivated.status, ConfigurationStatus::Active);
        assert_eq!(reactivated.failure_count, 0);
    }

    #[test]
    fn retry_delay_follows_exponential_backoff_capped_at_60s() {
        let mut config = base_config("http://x/".to_string());
        config.retry_delay_ms = 100;
        config.retry_backoff_multiplier = 2.0;
        assert_eq!(retry_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(retry_delay(&config, 3), Duration::from_millis(400));

        config.retry_delay_ms = 50_000;
        config.retry_backoff_multiplier = 10.0;
        assert_eq!(retry_delay(&config, 3), Duration::from_millis(60_000));
    }
}
