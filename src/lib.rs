//! Fault-injection gateway layer for chaos engineering.
//!
//! Attaches per-route, configuration-driven transforms to a reverse-proxy
//! request pipeline and probabilistically delays, corrupts, or aborts
//! traffic on its way to and from an upstream:
//!
//! - Latency injection before forwarding and after the response, uniform
//!   over a configured maximum
//! - Probabilistic failure before forwarding (connection abort or 503
//!   short-circuit) and after the response (truncation or status overwrite)
//! - Per-request stand-down header that proxies marked traffic untouched
//! - One structured event per evaluated stage, failing or not
//!
//! # Safety controls
//!
//! - Invalid chaos settings are fatal at startup, never silently ignored
//! - Global kill switch
//! - Dry run mode
//! - Stand-down header for health and validation traffic

pub mod config;
pub mod decision;
pub mod gateway;
pub mod pipeline;
pub mod telemetry;

pub use config::{Config, RouteChaos};
pub use gateway::ChaosGateway;
