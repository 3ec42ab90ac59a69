// Shared crate clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Qalam Shared
//!
//! Common infrastructure used by the API server, the points crate, and the
//! worker: the read-only configuration snapshot, database pool helpers, and
//! the velocity counter store backing the risk engine.

pub mod config;
pub mod db;
pub mod types;
pub mod velocity;

pub use config::{ConfigError, PlanConfig, PointsConfig, VelocityLimits};
pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{CreditDestination, PlanCycle};
pub use velocity::{VelocityError, VelocityStore};
