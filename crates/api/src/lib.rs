// API crate clippy configuration
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Qalam Points API Library
//!
//! HTTP surface for the points subsystem: PayNow webhook ingress, the
//! queue push endpoint, wallet/ledger routes, and the admin surface for
//! risk holds, webhook operations, and reconciliation.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
