//! twinsyncd: the twinstore replication daemon.
//!
//! This crate provides the daemon's HTTP surface:
//! - Notification intake that turns store events into queued sync tasks
//! - Health reporting for the coordination store and every replica
//! - Prometheus metrics

pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
