//! Dynamic Consumer Manager (C7, spec.md §4.8): maintains the invariant
//! "exactly one logical consumer per active Subscription." Grounded on
//! the teacher's single-loop consumer task shape in
//! `webhook-consumer/src/main.rs`, extended with the registry and
//! lifecycle hooks the distilled spec requires and the teacher's narrow
//! demo did not need.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webhook_core::error::ConsumerError;
use webhook_core::model::Subscription;
use webhook_core::router::{Envelope, EventRouter};
use webhook_core::store::ConfigStore;

use crate::kafka::{BrokerDriver, KafkaDriver};

struct RunningConsumer {
    handle: JoinHandle<()>,
    cancellation: CancellationToken,
}

/// Single-owner registry of running consumer tasks, keyed by
/// `Subscription.id`. All registry operations are O(1) under one lock;
/// handler invocations themselves run outside the lock (spec.md §4.8).
pub struct ConsumerManager {
    store: Arc<dyn ConfigStore>,
    router: Arc<EventRouter>,
    kafka_brokers: String,
    shutdown_deadline: Duration,
    registry: Mutex<HashMap<Uuid, RunningConsumer>>,
}

impl ConsumerManager {
    pub fn new(store: Arc<dyn ConfigStore>, router: Arc<EventRouter>, kafka_brokers: String, shutdown_deadline: Duration) -> Self {
        Self { store, router, kafka_brokers, shutdown_deadline, registry: Mutex::new(HashMap::new()) }
    }

    /// Register every active subscription found in the store. Called once
    /// at process startup.
    pub async fn start(self: &Arc<Self>) {
        let subs = match self.store.list_active_subscriptions().await {
            Ok(subs) => subs,
            Err(e) => {
                tracing::error!(error = %e, "failed to load active subscriptions at startup");
                return;
            }
        };
        for sub in subs {
            self.register(sub);
        }
    }

    /// `on_subscription_created` (spec.md §4.8). Idempotent: a second call
    /// for the same id is a no-op if already running.
    pub fn on_subscription_created(self: &Arc<Self>, sub: Subscription) {
        if !sub.active {
            return;
        }
        self.register(sub);
    }

    /// `on_subscription_updated` (spec.md §4.8). Any change to
    /// `topic_or_queue`, `connection_config`, `consumer_group_id`,
    /// `event_type_patterns`, or an `active` true->false flip tears down
    /// and (for the new state) re-registers.
    pub fn on_subscription_updated(self: &Arc<Self>, prev: &Subscription, next: Subscription) {
        if !prev.requires_restart(&next) {
            return;
        }
        self.unregister(prev.id);
        if next.active {
            self.register(next);
        }
    }

    /// `on_subscription_deleted` (spec.md §4.8). Idempotent.
    pub fn on_subscription_deleted(self: &Arc<Self>, sub: &Subscription) {
        self.unregister(sub.id);
    }

    fn register(self: &Arc<Self>, sub: Subscription) {
        let mut registry = self.registry.lock();
        if registry.contains_key(&sub.id) {
            return;
        }

        let cancellation = CancellationToken::new();
        let manager = self.clone();
        let sub_id = sub.id;
        let task_cancellation = cancellation.clone();
        let handle = tokio::spawn(async move {
            let driver = match KafkaDriver::connect(&sub, &manager.kafka_brokers) {
                Ok(driver) => driver,
                Err(e) => {
                    tracing::error!(error = %e, subscription_id = %sub.id, "failed to start consumer");
                    return;
                }
            };
            manager.run_consumer(sub, Box::new(driver), task_cancellation).await;
        });

        registry.insert(sub_id, RunningConsumer { handle, cancellation });
    }

    fn unregister(&self, id: Uuid) {
        let entry = self.registry.lock().remove(&id);
        if let Some(entry) = entry {
            entry.cancellation.cancel();
            // The task itself observes cancellation and exits; we don't
            // await the handle here so callers of on_subscription_* are
            // never blocked on network/broker teardown.
            entry.handle.abort();
        }
    }

    /// Number of consumers currently registered. Used by tests to check
    /// the registry invariant without depending on broker connectivity.
    pub fn registered_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Graceful shutdown: cancel every running consumer and wait for them
    /// to finish, bounded by `shutdown_deadline`.
    pub async fn shutdown(&self) {
        let handles: Vec<(Uuid, JoinHandle<()>, CancellationToken)> = {
            let mut registry = self.registry.lock();
            registry.drain().map(|(id, running)| (id, running.handle, running.cancellation)).collect()
        };

        for (_, _, cancellation) in &handles {
            cancellation.cancel();
        }

        let deadline = self.shutdown_deadline;
        for (id, handle, _) in handles {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                tracing::warn!(subscription_id = %id, "consumer did not stop within shutdown deadline; aborting");
            }
        }
    }

    async fn run_consumer(self: Arc<Self>, sub: Subscription, mut driver: Box<dyn BrokerDriver>, cancellation: CancellationToken) {
        loop {
            if cancellation.is_cancelled() {
                break;
            }

            let message = tokio::select! {
                result = driver.recv() => result,
                _ = cancellation.cancelled() => break,
            };

            match message {
                Ok(message) => {
                    self.handle_message(&sub, message.payload, message.headers, &cancellation).await;
                    if let Err(e) = driver.commit() {
                        tracing::error!(error = %e, subscription_id = %sub.id, "failed to commit offset");
                    }
                }
                Err(ConsumerError::Deserialization(msg)) => {
                    tracing::warn!(subscription_id = %sub.id, error = %msg, "dropping undeserializable message");
                    if let Err(e) = self.store.record_subscription_message(sub.id, true).await {
                        tracing::error!(error = %e, subscription_id = %sub.id, "failed to record failed message");
                    }
                    if let Err(e) = driver.commit() {
                        tracing::error!(error = %e, subscription_id = %sub.id, "failed to commit offset after drop");
                    }
                }
                Err(ConsumerError::Broker(msg)) => {
                    tracing::error!(subscription_id = %sub.id, error = %msg, "broker error; backing off");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    async fn handle_message(
        &self,
        sub: &Subscription,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
        cancellation: &CancellationToken,
    ) {
        let value: Value = match serde_json::from_slice(&payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(subscription_id = %sub.id, error = %e, "failed to parse message body as JSON");
                if let Err(e) = self.store.record_subscription_message(sub.id, true).await {
                    tracing::error!(error = %e, subscription_id = %sub.id, "failed to record failed message");
                }
                return;
            }
        };

        let envelope = Envelope { payload: value, headers };
        let router = self.router.clone();
        let route_cancellation = cancellation.clone();
        let routed = tokio::spawn(async move { router.route(envelope, route_cancellation).await }).await;

        match routed {
            Ok(dispatched) => {
                if let Err(e) = self.store.record_subscription_message(sub.id, false).await {
                    tracing::error!(error = %e, subscription_id = %sub.id, "failed to record received message");
                }
                tracing::debug!(subscription_id = %sub.id, dispatched, "routed one message");
            }
            Err(e) => {
                tracing::error!(error = %e, subscription_id = %sub.id, "router propagated an unexpected exception");
                if let Err(e) = self.store.record_subscription_message(sub.id, true).await {
                    tracing::error!(error = %e, subscription_id = %sub.id, "failed to record failed message");
                }
            }
        }
    }
}
