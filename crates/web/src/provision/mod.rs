//! Device provisioning: one-time tokens, client packages and QR codes

pub mod package;
pub mod routes;
pub mod service;

pub use service::ProvisioningService;
