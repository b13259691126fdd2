//! Core entities: Subscription, AuthorizedDomain, CallbackConfiguration,
//! CallbackExecution. Plain records — storage and wire mapping lives in
//! `webhook-store` and in the dispatcher's header/body builders, not here.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported broker kinds. Only `Kafka` is required by the spec; the enum
/// exists so `Subscription::broker_kind` round-trips through storage even
/// though `BrokerDriver` only has one implementation today.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerKind {
    Kafka,
}

/// A durable broker binding. One running consumer exists per `id` with
/// `active = true`; see `webhook-consumer::manager`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub name: String,
    pub broker_kind: BrokerKind,
    pub connection_config: HashMap<String, String>,
    pub topic_or_queue: String,
    pub consumer_group_id: Option<String>,
    pub event_type_patterns: Vec<String>,
    pub max_concurrent_consumers: u32,
    pub polling_interval_ms: u32,
    pub active: bool,
    pub total_messages_received: u64,
    pub total_messages_failed: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether a change from `self` to `next` requires tearing down and
    /// re-registering the consumer, per spec.md §4.8.
    pub fn requires_restart(&self, next: &Subscription) -> bool {
        self.topic_or_queue != next.topic_or_queue
            || self.connection_config != next.connection_config
            || self.consumer_group_id != next.consumer_group_id
            || self.event_type_patterns != next.event_type_patterns
            || (self.active && !next.active)
    }
}

/// An authorization record for a callback host.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthorizedDomain {
    pub id: Uuid,
    /// Lowercased host, plus `:port` iff non-default for the scheme.
    pub domain: String,
    pub verified: bool,
    pub active: bool,
    pub allowed_paths: Vec<String>,
    pub require_https: bool,
    pub expires_at: Option<DateTime<Utc>>,
    /// Informational only — not enforced by the core. See DESIGN.md Open
    /// Question 1.
    pub ip_whitelist: Option<Vec<String>>,
    /// Informational only — not enforced by the core.
    pub max_callbacks_per_minute: Option<u32>,
    pub total_callbacks: u64,
    pub total_failed: u64,
    pub last_callback_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HttpMethod {
    Post,
    Put,
    Patch,
}

impl HttpMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigurationStatus {
    Active,
    Paused,
    Disabled,
    Failed,
}

/// A webhook definition: where to send matching events and how.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallbackConfiguration {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub method: HttpMethod,
    pub status: ConfigurationStatus,
    pub subscribed_event_types: Vec<String>,
    pub custom_headers: HashMap<String, String>,
    /// Opaque operator metadata. Never serialized onto the wire request.
    pub metadata: HashMap<String, String>,
    pub signature_enabled: bool,
    pub secret: Option<Vec<u8>>,
    pub signature_header: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff_multiplier: f64,
    pub timeout_ms: u64,
    pub filter_expression: Option<String>,
    pub failure_threshold: u32,
    pub failure_count: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl CallbackConfiguration {
    /// Eligible to fire iff `active ∧ status = ACTIVE` (spec.md §3).
    pub fn is_eligible(&self) -> bool {
        self.active && self.status == ConfigurationStatus::Active
    }

    pub fn default_signature_header() -> String {
        "X-Signature".to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Success,
    FailedRetrying,
    FailedPermanent,
    Skipped,
}

/// One persisted attempt record (append-per-attempt — DESIGN.md Open
/// Question 2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallbackExecution {
    pub id: Uuid,
    pub configuration_id: Uuid,
    pub event_type: String,
    pub source_event_id: Uuid,
    pub status: ExecutionStatus,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub request_payload: String,
    pub request_headers: HashMap<String, String>,
    pub response_headers: HashMap<String, String>,
    pub response_body: Option<String>,
    pub response_status_code: Option<u16>,
    pub request_duration_ms: u64,
    pub error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub executed_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Truncation cap for `response_body`/`error_message`, per spec.md §3.
pub const RESPONSE_BODY_CAP: usize = 10_000;
pub const ERROR_MESSAGE_CAP: usize = 2_000;

pub fn truncate(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        s.to_string()
    } else {
        s.chars().take(cap).collect()
    }
}
