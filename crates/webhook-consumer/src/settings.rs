//! Process configuration (spec.md §6, "Process configuration"). Generalizes
//! every teacher service's repeated `std::env::var(...).unwrap_or_else(...)`
//! calls into one load site.

use std::time::Duration;

use webhook_core::breaker::BreakerParams;

#[derive(Clone, Debug)]
pub struct Settings {
    pub database_url: String,
    pub kafka_brokers: String,
    pub http_max_response_bytes: usize,
    pub shutdown_deadline_ms: u64,
    pub breaker: BreakerParams,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            database_url: env_or("DATABASE_URL", "postgres://localhost/webhooks"),
            kafka_brokers: env_or("KAFKA_BROKERS", "localhost:9092"),
            http_max_response_bytes: env_num("HTTP_MAX_RESPONSE_BYTES", 10 * 1024 * 1024),
            shutdown_deadline_ms: env_num("SHUTDOWN_DEADLINE_MS", 30_000),
            breaker: BreakerParams {
                window_size: env_num("BREAKER_WINDOW_SIZE", 10),
                minimum_calls: env_num("BREAKER_MINIMUM_CALLS", 10),
                failure_rate_threshold: env_f64("BREAKER_FAILURE_RATE_THRESHOLD", 0.5),
                slow_call_duration: Duration::from_millis(env_num("BREAKER_SLOW_CALL_DURATION_MS", 10_000)),
                slow_call_rate_threshold: env_f64("BREAKER_SLOW_CALL_RATE_THRESHOLD", 0.5),
                open_wait: Duration::from_millis(env_num("BREAKER_OPEN_WAIT_MS", 45_000)),
                half_open_permitted_calls: env_num("BREAKER_HALF_OPEN_PERMITTED_CALLS", 1),
            },
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env_num(key, default)
}
