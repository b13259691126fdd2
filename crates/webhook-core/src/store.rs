//! The `ConfigStore` contract (spec.md §4.1) and an in-memory
//! implementation used by tests and the demo wiring. A Postgres-backed
//! implementation lives in `webhook-store`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::glob::matches_any;
use crate::model::{
    AuthorizedDomain, CallbackConfiguration, CallbackExecution, ConfigurationStatus, ExecutionStatus, Subscription,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// Partial update applied to an existing `CallbackExecution` row. Exposed
/// for store implementations or operators that prefer the single-row
/// reuse variant over append-per-attempt (DESIGN.md Open Question 2); the
/// core itself always calls `append_execution`.
#[derive(Clone, Debug, Default)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub response_status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub completed_at: Option<chrono::DateTime<Utc>>,
}

/// Durable CRUD + the handful of reactive operations the router and
/// dispatcher need. Every operation listed in spec.md §4.1.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_config(&self, id: Uuid) -> StoreResult<Option<CallbackConfiguration>>;
    async fn get_domain_by_name(&self, name: &str) -> StoreResult<Option<AuthorizedDomain>>;
    async fn active_configs_for_event_type(&self, event_type: &str) -> StoreResult<Vec<CallbackConfiguration>>;
    async fn record_success(&self, id: Uuid) -> StoreResult<()>;
    async fn record_failure(&self, id: Uuid) -> StoreResult<()>;
    async fn record_domain_callback(&self, domain: &str, success: bool) -> StoreResult<()>;
    async fn list_active_subscriptions(&self) -> StoreResult<Vec<Subscription>>;
    async fn append_execution(&self, execution: CallbackExecution) -> StoreResult<()>;
    async fn update_execution(&self, id: Uuid, patch: ExecutionPatch) -> StoreResult<()>;
    /// Increments `total_messages_received`, and `total_messages_failed`
    /// when `failed` is true, on the named subscription (spec.md §4.8
    /// steps 3-4: deserialization failure and router-propagated exception
    /// both increment `total_messages_failed`).
    async fn record_subscription_message(&self, id: Uuid, failed: bool) -> StoreResult<()>;
}

/// In-memory `ConfigStore`, guarded by one `RwLock` per table — adequate
/// for tests and for the demo binary; row-level atomicity is trivially
/// satisfied because every mutation is a single lock-held closure.
#[derive(Default)]
pub struct InMemoryConfigStore {
    configs: RwLock<HashMap<Uuid, CallbackConfiguration>>,
    domains: RwLock<HashMap<String, AuthorizedDomain>>,
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
    executions: RwLock<Vec<CallbackExecution>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_config(&self, config: CallbackConfiguration) {
        self.configs.write().insert(config.id, config);
    }

    pub fn insert_domain(&self, domain: AuthorizedDomain) {
        self.domains.write().insert(domain.domain.to_lowercase(), domain);
    }

    pub fn insert_subscription(&self, sub: Subscription) {
        self.subscriptions.write().insert(sub.id, sub);
    }

    pub fn get_config_sync(&self, id: Uuid) -> Option<CallbackConfiguration> {
        self.configs.read().get(&id).cloned()
    }

    pub fn executions(&self) -> Vec<CallbackExecution> {
        self.executions.read().clone()
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn get_config(&self, id: Uuid) -> StoreResult<Option<CallbackConfiguration>> {
        Ok(self.configs.read().get(&id).cloned())
    }

    async fn get_domain_by_name(&self, name: &str) -> StoreResult<Option<AuthorizedDomain>> {
        Ok(self.domains.read().get(&name.to_lowercase()).cloned())
    }

    async fn active_configs_for_event_type(&self, event_type: &str) -> StoreResult<Vec<CallbackConfiguration>> {
        Ok(self
            .configs
            .read()
            .values()
            .filter(|c| c.is_eligible() && matches_any(&c.subscribed_event_types, event_type))
            .cloned()
            .collect())
    }

    async fn record_success(&self, id: Uuid) -> StoreResult<()> {
        let mut configs = self.configs.write();
        let config = configs.get_mut(&id).ok_or_else(|| StoreError(format!("no such config: {id}")))?;
        config.last_success_at = Some(Utc::now());
        config.failure_count = 0;
        if config.status == ConfigurationStatus::Paused {
            config.status = ConfigurationStatus::Active;
        }
        Ok(())
    }

    async fn record_failure(&self, id: Uuid) -> StoreResult<()> {
        let mut configs = self.configs.write();
        let config = configs.get_mut(&id).ok_or_else(|| StoreError(format!("no such config: {id}")))?;
        config.last_failure_at = Some(Utc::now());
        config.failure_count += 1;
        if config.failure_count >= config.failure_threshold {
            config.status = ConfigurationStatus::Paused;
        }
        Ok(())
    }

    async fn record_domain_callback(&self, domain: &str, success: bool) -> StoreResult<()> {
        let mut domains = self.domains.write();
        let Some(entry) = domains.get_mut(&domain.to_lowercase()) else {
            return Ok(());
        };
        entry.total_callbacks += 1;
        if !success {
            entry.total_failed += 1;
        }
        entry.last_callback_at = Some(Utc::now());
        Ok(())
    }

    async fn list_active_subscriptions(&self) -> StoreResult<Vec<Subscription>> {
        Ok(self.subscriptions.read().values().filter(|s| s.active).cloned().collect())
    }

    async fn append_execution(&self, execution: CallbackExecution) -> StoreResult<()> {
        self.executions.write().push(execution);
        Ok(())
    }

    async fn update_execution(&self, id: Uuid, patch: ExecutionPatch) -> StoreResult<()> {
        let mut executions = self.executions.write();
        let Some(row) = executions.iter_mut().find(|e| e.id == id) else {
            return Err(StoreError(format!("no such execution: {id}")));
        };
        if let Some(status) = patch.status {
            row.status = status;
        }
        if patch.response_status_code.is_some() {
            row.response_status_code = patch.response_status_code;
        }
        if let Some(body) = patch.response_body {
            row.response_body = Some(body);
        }
        if let Some(msg) = patch.error_message {
            row.error_message = Some(msg);
        }
        if let Some(completed_at) = patch.completed_at {
            row.completed_at = completed_at;
        }
        Ok(())
    }

    async fn record_subscription_message(&self, id: Uuid, failed: bool) -> StoreResult<()> {
        let mut subscriptions = self.subscriptions.write();
        let sub = subscriptions.get_mut(&id).ok_or_else(|| StoreError(format!("no such subscription: {id}")))?;
        sub.total_messages_received += 1;
        if failed {
            sub.total_messages_failed += 1;
        }
        sub.updated_at = Utc::now();
        Ok(())
    }
}

pub type SharedConfigStore = Arc<dyn ConfigStore>;
