//! Nebula Console Common Library
//!
//! Storage, crypto, validation and config rendering shared by the console
//! server.

pub mod certs;
pub mod crypto;
pub mod db;
pub mod error;
pub mod nebula_config;
pub mod provision;
pub mod types;
pub mod users;
pub mod validate;

// Re-export commonly used types
pub use certs::{CertFilter, CertStore, CertificateRecord, NewCertificate};
pub use crypto::KeyCipher;
pub use db::Database;
pub use error::{Error, Result};
pub use nebula_config::{Lighthouse, NebulaConfig};
pub use provision::{ClaimOutcome, NewProvisionToken, ProvisionStore, ProvisionTokenRecord};
pub use types::*;
pub use users::{NewUser, UserRecord, UserStats, UserStore, UserUpdate};
pub use validate::{PasswordPolicy, ValidationError};

/// Console version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default data directory
pub fn default_data_dir() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".nebula-console")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_data_dir().join("console.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
