//! Process entry point. Builds the dependency graph explicitly — C1, then
//! C4, then C5 (with C2 and C4 injected), then C6 (with C5 injected),
//! then C7 (with C6 injected) — per spec.md §9's redesign note ("construct
//! the graph explicitly: build C1-C4, then C5, then C6 with C5 injected,
//! then C7 with C6 injected").

mod kafka;
mod manager;
mod settings;

use std::sync::Arc;

use webhook_core::authorize::DomainAuthorizer;
use webhook_core::breaker::CircuitBreakerRegistry;
use webhook_core::dispatch::Dispatcher;
use webhook_core::router::EventRouter;
use webhook_core::telemetry;
use webhook_store::PgConfigStore;

use manager::ConsumerManager;
use settings::Settings;

#[tokio::main]
async fn main() {
    telemetry::init();

    let settings = Settings::from_env();

    // C1
    let store: Arc<dyn webhook_core::store::ConfigStore> = match PgConfigStore::connect(&settings.database_url, 10).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to the config store");
            std::process::exit(1);
        }
    };

    // C2
    let authorizer = Arc::new(DomainAuthorizer::new(store.clone()));
    // C4
    let breakers = Arc::new(CircuitBreakerRegistry::with_params(settings.breaker));
    // C5
    let http = reqwest::Client::builder().build().expect("reqwest client configuration is static and always valid");
    let dispatcher = Arc::new(
        Dispatcher::with_client(store.clone(), authorizer, breakers, http)
            .with_max_response_bytes(settings.http_max_response_bytes),
    );
    // C6
    let router = Arc::new(EventRouter::new(store.clone(), dispatcher));
    // C7
    let manager = Arc::new(ConsumerManager::new(
        store.clone(),
        router,
        settings.kafka_brokers.clone(),
        std::time::Duration::from_millis(settings.shutdown_deadline_ms),
    ));

    manager.start().await;
    tracing::info!("webhook consumer started");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }

    tracing::info!("shutdown requested, draining consumers");
    manager.shutdown().await;
    tracing::info!("webhook consumer stopped");
}
