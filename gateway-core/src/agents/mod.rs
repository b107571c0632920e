//! Background task tracking and health aggregation.
//!
//! Plain tokio tasks tracked in a `DashMap`, not an actor runtime — the
//! gateway has no need for message-passing between pool agents since it
//! holds no connection pools (see DESIGN.md for the acton-reactive removal).

mod background_worker;
mod health;

pub use background_worker::{BackgroundWorker, TaskStatus};
pub use health::{AggregatedHealthResponse, ComponentHealth, HealthRegistry, HealthStatus};
