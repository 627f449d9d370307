//! Nebula PKI: the `nebula-cert` adapter, certificate service and routes

pub mod cert_tool;
pub mod routes;
pub mod service;

pub use cert_tool::{CertDetails, CertTool, IssuedCert, NebulaCertCli};
pub use service::{CertificateService, CertificateView, Download};
