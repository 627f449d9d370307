//! Nebula Console Web API
//!
//! HTTP backend for managing a Nebula overlay network: certificate
//! authority and host certificates, one-time device provisioning, and
//! user accounts.

pub mod archive;
pub mod audit;
pub mod auth;
pub mod error;
pub mod middleware;
pub mod pki;
pub mod provision;
pub mod server;
pub mod settings;
pub mod users;

pub use error::{ApiError, ApiResult};
pub use server::{router, serve, AppState};
pub use settings::Settings;
