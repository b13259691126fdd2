//! Webhook delivery engine core: Domain Authorizer, Circuit Breaker
//! Registry, Dispatcher, Event Router, and the `ConfigStore` contract.
//! The Dynamic Consumer Manager and its Kafka driver live in the
//! `webhook-consumer` binary crate, which depends on this crate.

pub mod authorize;
pub mod breaker;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod glob;
pub mod model;
pub mod router;
pub mod store;
pub mod telemetry;
