//! Postgres-backed `ConfigStore` (spec.md §4.1), grounded in the teacher's
//! `data-service`/`api-service` `PgPoolOptions` + runtime-checked
//! `sqlx::query_as::<_, (...)>` style (no `query_as!` macro, so the crate
//! builds without a live database at compile time).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use webhook_core::error::StoreError;
use webhook_core::model::{
    AuthorizedDomain, BrokerKind, CallbackConfiguration, CallbackExecution, ConfigurationStatus, ExecutionStatus, HttpMethod,
    Subscription,
};
use webhook_core::store::{ConfigStore, ExecutionPatch, StoreResult};

pub struct PgConfigStore {
    pool: PgPool,
}

impl PgConfigStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn store_err(e: sqlx::Error) -> StoreError {
    StoreError(e.to_string())
}

#[derive(FromRow)]
struct ConfigRow {
    id: Uuid,
    name: String,
    url: String,
    method: String,
    status: String,
    subscribed_event_types: Json<Vec<String>>,
    custom_headers: Json<HashMap<String, String>>,
    metadata: Json<HashMap<String, String>>,
    signature_enabled: bool,
    secret: Option<Vec<u8>>,
    signature_header: String,
    max_retries: i32,
    retry_delay_ms: i64,
    retry_backoff_multiplier: f64,
    timeout_ms: i64,
    filter_expression: Option<String>,
    failure_threshold: i32,
    failure_count: i32,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    active: bool,
}

impl From<ConfigRow> for CallbackConfiguration {
    fn from(row: ConfigRow) -> Self {
        CallbackConfiguration {
            id: row.id,
            name: row.name,
            url: row.url,
            method: parse_method(&row.method),
            status: parse_status(&row.status),
            subscribed_event_types: row.subscribed_event_types.0,
            custom_headers: row.custom_headers.0,
            metadata: row.metadata.0,
            signature_enabled: row.signature_enabled,
            secret: row.secret,
            signature_header: row.signature_header,
            max_retries: row.max_retries.max(0) as u32,
            retry_delay_ms: row.retry_delay_ms.max(0) as u64,
            retry_backoff_multiplier: row.retry_backoff_multiplier,
            timeout_ms: row.timeout_ms.max(0) as u64,
            filter_expression: row.filter_expression,
            failure_threshold: row.failure_threshold.max(1) as u32,
            failure_count: row.failure_count.max(0) as u32,
            last_success_at: row.last_success_at,
            last_failure_at: row.last_failure_at,
            active: row.active,
        }
    }
}

fn parse_method(s: &str) -> HttpMethod {
    match s {
        "PUT" => HttpMethod::Put,
        "PATCH" => HttpMethod::Patch,
        _ => HttpMethod::Post,
    }
}

fn parse_status(s: &str) -> ConfigurationStatus {
    match s {
        "PAUSED" => ConfigurationStatus::Paused,
        "DISABLED" => ConfigurationStatus::Disabled,
        "FAILED" => ConfigurationStatus::Failed,
        _ => ConfigurationStatus::Active,
    }
}

#[derive(FromRow)]
struct DomainRow {
    id: Uuid,
    domain: String,
    verified: bool,
    active: bool,
    allowed_paths: Json<Vec<String>>,
    require_https: bool,
    expires_at: Option<DateTime<Utc>>,
    ip_whitelist: Option<Json<Vec<String>>>,
    max_callbacks_per_minute: Option<i32>,
    total_callbacks: i64,
    total_failed: i64,
    last_callback_at: Option<DateTime<Utc>>,
}

impl From<DomainRow> for AuthorizedDomain {
    fn from(row: DomainRow) -> Self {
        AuthorizedDomain {
            id: row.id,
            domain: row.domain,
            verified: row.verified,
            active: row.active,
            allowed_paths: row.allowed_paths.0,
            require_https: row.require_https,
            expires_at: row.expires_at,
            ip_whitelist: row.ip_whitelist.map(|j| j.0),
            max_callbacks_per_minute: row.max_callbacks_per_minute.map(|v| v as u32),
            total_callbacks: row.total_callbacks.max(0) as u64,
            total_failed: row.total_failed.max(0) as u64,
            last_callback_at: row.last_callback_at,
        }
    }
}

#[derive(FromRow)]
struct SubscriptionRow {
    id: Uuid,
    name: String,
    broker_kind: String,
    connection_config: Json<HashMap<String, String>>,
    topic_or_queue: String,
    consumer_group_id: Option<String>,
    event_type_patterns: Json<Vec<String>>,
    max_concurrent_consumers: i32,
    polling_interval_ms: i32,
    active: bool,
    total_messages_received: i64,
    total_messages_failed: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Subscription {
            id: row.id,
            name: row.name,
            broker_kind: BrokerKind::Kafka,
            connection_config: row.connection_config.0,
            topic_or_queue: row.topic_or_queue,
            consumer_group_id: row.consumer_group_id,
            event_type_patterns: row.event_type_patterns.0,
            max_concurrent_consumers: row.max_concurrent_consumers.max(1) as u32,
            polling_interval_ms: row.polling_interval_ms.max(100) as u32,
            active: row.active,
            total_messages_received: row.total_messages_received.max(0) as u64,
            total_messages_failed: row.total_messages_failed.max(0) as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn execution_status_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "PENDING",
        ExecutionStatus::InProgress => "IN_PROGRESS",
        ExecutionStatus::Success => "SUCCESS",
        ExecutionStatus::FailedRetrying => "FAILED_RETRYING",
        ExecutionStatus::FailedPermanent => "FAILED_PERMANENT",
        ExecutionStatus::Skipped => "SKIPPED",
    }
}

#[async_trait]
impl ConfigStore for PgConfigStore {
    async fn get_config(&self, id: Uuid) -> StoreResult<Option<CallbackConfiguration>> {
        let row = sqlx::query_as::<_, ConfigRow>("SELECT * FROM callback_configurations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.map(Into::into))
    }

    async fn get_domain_by_name(&self, name: &str) -> StoreResult<Option<AuthorizedDomain>> {
        let row = sqlx::query_as::<_, DomainRow>("SELECT * FROM authorized_domains WHERE lower(domain) = lower($1)")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.map(Into::into))
    }

    async fn active_configs_for_event_type(&self, event_type: &str) -> StoreResult<Vec<CallbackConfiguration>> {
        // Pre-filter to active+ACTIVE rows in SQL; the glob match itself
        // happens in `webhook_core::glob`, not in the query, since the
        // restricted-glob semantics aren't expressible portably in SQL.
        let rows = sqlx::query_as::<_, ConfigRow>(
            "SELECT * FROM callback_configurations WHERE active = true AND status = 'ACTIVE'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows
            .into_iter()
            .map(CallbackConfiguration::from)
            .filter(|c| webhook_core::glob::matches_any(&c.subscribed_event_types, event_type))
            .collect())
    }

    async fn record_success(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE callback_configurations
            SET last_success_at = now(),
                failure_count = 0,
                status = CASE WHEN status = 'PAUSED' THEN 'ACTIVE' ELSE status END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE callback_configurations
            SET last_failure_at = now(),
                failure_count = failure_count + 1,
                status = CASE WHEN failure_count + 1 >= failure_threshold THEN 'PAUSED' ELSE status END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn record_domain_callback(&self, domain: &str, success: bool) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE authorized_domains
            SET total_callbacks = total_callbacks + 1,
                total_failed = total_failed + CASE WHEN $2 THEN 0 ELSE 1 END,
                last_callback_at = now()
            WHERE lower(domain) = lower($1)
            "#,
        )
        .bind(domain)
        .bind(success)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list_active_subscriptions(&self) -> StoreResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>("SELECT * FROM subscriptions WHERE active = true")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn record_subscription_message(&self, id: Uuid, failed: bool) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET total_messages_received = total_messages_received + 1,
                total_messages_failed = total_messages_failed + CASE WHEN $2 THEN 1 ELSE 0 END,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(failed)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn append_execution(&self, execution: CallbackExecution) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO callback_executions (
                id, configuration_id, event_type, source_event_id, status, attempt_number, max_attempts,
                request_payload, request_headers, response_headers, response_body, response_status_code,
                request_duration_ms, error_message, next_retry_at, executed_at, completed_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
            "#,
        )
        .bind(execution.id)
        .bind(execution.configuration_id)
        .bind(execution.event_type)
        .bind(execution.source_event_id)
        .bind(execution_status_str(execution.status))
        .bind(execution.attempt_number as i32)
        .bind(execution.max_attempts as i32)
        .bind(execution.request_payload)
        .bind(Json(execution.request_headers))
        .bind(Json(execution.response_headers))
        .bind(execution.response_body)
        .bind(execution.response_status_code.map(|c| c as i32))
        .bind(execution.request_duration_ms as i64)
        .bind(execution.error_message)
        .bind(execution.next_retry_at)
        .bind(execution.executed_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update_execution(&self, id: Uuid, patch: ExecutionPatch) -> StoreResult<()> {
        let existing = sqlx::query_as::<_, (String,)>("SELECT status FROM callback_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        if existing.is_none() {
            return Err(StoreError(format!("no such execution: {id}")));
        }

        let status = patch.status.map(execution_status_str);
        sqlx::query(
            r#"
            UPDATE callback_executions
            SET status = COALESCE($2, status),
                response_status_code = COALESCE($3, response_status_code),
                response_body = COALESCE($4, response_body),
                error_message = COALESCE($5, error_message),
                completed_at = COALESCE($6, completed_at)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(patch.response_status_code.map(|c| c as i32))
        .bind(patch.response_body)
        .bind(patch.error_message)
        .bind(patch.completed_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}
