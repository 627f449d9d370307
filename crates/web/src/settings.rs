//! Console configuration
//!
//! Loaded from a TOML file (a missing file means defaults), then overridden
//! by environment variables.

use nebula_console_common::{Lighthouse, PasswordPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Placeholder shipped as the default signing secret
pub const DEFAULT_SECRET_KEY: &str = "change-this-to-a-secure-secret-key";

/// Longest access-token lifetime accepted without a warning (7 days)
const MAX_RECOMMENDED_TOKEN_TTL_MINUTES: i64 = 10080;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Development
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(format!("unknown environment: {}", s)),
        }
    }
}

/// Console configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub auth: AuthSettings,
    pub security: SecuritySettings,
    pub pki: PkiSettings,
    pub provisioning: ProvisioningSettings,
    pub lighthouse: LighthouseSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// HTTP listen address
    pub listen: String,

    pub environment: Environment,

    /// Data directory holding the database
    pub data_dir: PathBuf,

    /// Externally reachable base URL, used for QR codes
    pub public_url: Option<String>,

    /// CORS origins
    pub allowed_origins: Vec<String>,

    /// Requests per client IP per minute
    pub rate_limit_per_minute: u32,

    /// Client addresses or CIDRs allowed to connect; empty allows all
    pub ip_allowlist: Vec<String>,

    pub max_body_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8000".to_string(),
            environment: Environment::Development,
            data_dir: nebula_console_common::default_data_dir(),
            public_url: None,
            allowed_origins: vec![
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ],
            rate_limit_per_minute: 100,
            ip_allowlist: Vec::new(),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// HS256 signing secret for access tokens
    pub secret_key: String,
    pub token_ttl_minutes: i64,
    pub max_login_attempts: u32,
    pub lockout_minutes: i64,
    pub allow_signup: bool,
    pub totp_issuer: String,
    pub bootstrap_admin: BootstrapAdmin,
    pub password_policy: PasswordPolicy,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            secret_key: DEFAULT_SECRET_KEY.to_string(),
            token_ttl_minutes: 10080,
            max_login_attempts: 5,
            lockout_minutes: 15,
            allow_signup: true,
            totp_issuer: "Nebula Console".to_string(),
            bootstrap_admin: BootstrapAdmin::default(),
            password_policy: PasswordPolicy::default(),
        }
    }
}

/// Account created on first start when the users table is empty
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapAdmin {
    pub username: String,
    pub email: String,
    /// Generated and logged once when unset
    pub password: Option<String>,
}

impl Default for BootstrapAdmin {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            email: "admin@nebula.local".to_string(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Base64 32-byte key or passphrase for sealing private keys
    pub encryption_key: Option<String>,
    pub encrypt_private_keys: bool,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            encryption_key: None,
            encrypt_private_keys: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkiSettings {
    /// Path to nebula-cert; auto-detected when unset
    pub nebula_cert_bin: Option<PathBuf>,
    pub command_timeout_secs: u64,
    pub default_ca_duration_hours: i64,
    pub max_ca_duration_hours: i64,
    pub default_host_duration_hours: i64,
    pub max_host_duration_hours: i64,
    /// Overlay network used for automatic address assignment
    pub network: String,
    /// Hosts below this offset are never auto-assigned
    pub first_host_offset: u32,
}

impl Default for PkiSettings {
    fn default() -> Self {
        Self {
            nebula_cert_bin: None,
            command_timeout_secs: 30,
            default_ca_duration_hours: 87600,
            max_ca_duration_hours: 175200,
            default_host_duration_hours: 8760,
            max_host_duration_hours: 87600,
            network: "192.168.100.0/24".to_string(),
            first_host_offset: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningSettings {
    pub token_ttl_hours: i64,
    pub default_groups: Vec<String>,
    /// Seconds between sweeps of expired tokens and sessions
    pub sweep_interval_secs: u64,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            token_ttl_hours: 24,
            default_groups: vec!["clients".to_string()],
            sweep_interval_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LighthouseSettings {
    pub hosts: Vec<Lighthouse>,
}

impl Default for LighthouseSettings {
    fn default() -> Self {
        Self {
            hosts: vec![Lighthouse {
                nebula_ip: "192.168.100.1".to_string(),
                endpoints: vec!["YOUR_LIGHTHOUSE_IP:4242".to_string()],
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `text` or `json`
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: "text".to_string(),
        }
    }
}

impl Settings {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let settings: Self = toml::from_str(&content)?;
            Ok(settings)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any variable lookup
    pub fn apply_env_with(&mut self, get: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("NEBULA_CONSOLE_LISTEN") {
            self.server.listen = v;
        }
        if let Some(v) = get("NEBULA_CONSOLE_DATA_DIR") {
            self.server.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("NEBULA_CONSOLE_ENVIRONMENT") {
            self.server.environment = v.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        }
        if let Some(v) = get("NEBULA_CONSOLE_PUBLIC_URL") {
            self.server.public_url = Some(v.trim_end_matches('/').to_string());
        }
        if let Some(v) = get("ALLOWED_ORIGINS") {
            self.server.allowed_origins = v
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(v) = get("SECRET_KEY") {
            self.auth.secret_key = v;
        }
        if let Some(v) = get("ENCRYPTION_KEY") {
            self.security.encryption_key = Some(v);
        }
        if let Some(v) = get("NEBULA_CERT_BIN") {
            self.pki.nebula_cert_bin = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.server.environment == Environment::Production
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.server.data_dir.join("console.db")
    }

    /// Key file generated for development setups without `encryption_key`
    pub fn dev_key_path(&self) -> PathBuf {
        self.server.data_dir.join("encryption.key")
    }

    /// Public base URL without trailing slash
    pub fn public_base_url(&self) -> String {
        match &self.server.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.server.listen),
        }
    }

    /// Check security-relevant settings.
    ///
    /// Returns warnings; in production unsafe settings are errors.
    pub fn validate_security(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();
        let mut fatal = Vec::new();

        if self.auth.secret_key == DEFAULT_SECRET_KEY || self.auth.secret_key.len() < 32 {
            let msg = "auth.secret_key is the default or shorter than 32 characters".to_string();
            if self.is_production() {
                fatal.push(msg);
            } else {
                warnings.push(msg);
            }
        }
        if self.security.encryption_key.is_none() {
            let msg = "security.encryption_key is not set".to_string();
            if self.is_production() {
                fatal.push(msg);
            } else {
                warnings.push(format!("{}, using a generated development key", msg));
            }
        }
        if !self.security.encrypt_private_keys {
            warnings.push("private keys will be stored unencrypted".to_string());
        }
        if self.auth.token_ttl_minutes > MAX_RECOMMENDED_TOKEN_TTL_MINUTES {
            warnings.push(format!(
                "auth.token_ttl_minutes is {} (more than 7 days)",
                self.auth.token_ttl_minutes
            ));
        }
        if self.is_production() && self.server.allowed_origins.iter().any(|o| o.contains("localhost")) {
            warnings.push("server.allowed_origins contains localhost in production".to_string());
        }

        if fatal.is_empty() {
            Ok(warnings)
        } else {
            Err(fatal.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.auth.token_ttl_minutes, 10080);
        assert_eq!(s.auth.max_login_attempts, 5);
        assert_eq!(s.pki.default_host_duration_hours, 8760);
        assert_eq!(s.provisioning.default_groups, vec!["clients"]);
        assert_eq!(s.server.rate_limit_per_minute, 100);
        assert!(s.security.encrypt_private_keys);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let s: Settings = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"

            [pki]
            network = "10.42.0.0/16"

            [[lighthouse.hosts]]
            nebula_ip = "10.42.0.1"
            endpoints = ["198.51.100.7:4242"]
            "#,
        )
        .unwrap();
        assert_eq!(s.server.listen, "0.0.0.0:9000");
        assert_eq!(s.pki.network, "10.42.0.0/16");
        assert_eq!(s.pki.first_host_offset, 10);
        assert_eq!(s.lighthouse.hosts[0].endpoints, vec!["198.51.100.7:4242"]);
        assert_eq!(s.auth.lockout_minutes, 15);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(s.server.listen, "127.0.0.1:8000");
    }

    #[test]
    fn test_serialized_settings_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut s = Settings::default();
        s.server.public_url = Some("https://vpn.example.org".to_string());
        std::fs::write(&path, toml::to_string_pretty(&s).unwrap()).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.public_base_url(), "https://vpn.example.org");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SECRET_KEY", "s3cr3t-s3cr3t-s3cr3t-s3cr3t-s3cr3t"),
            ("ALLOWED_ORIGINS", "https://a.example, https://b.example,"),
            ("NEBULA_CONSOLE_ENVIRONMENT", "production"),
            ("NEBULA_CONSOLE_PUBLIC_URL", "https://vpn.example.org/"),
            ("ENCRYPTION_KEY", "  "),
        ]
        .into_iter()
        .collect();
        let mut s = Settings::default();
        s.apply_env_with(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(s.auth.secret_key, "s3cr3t-s3cr3t-s3cr3t-s3cr3t-s3cr3t");
        assert_eq!(s.server.allowed_origins, vec!["https://a.example", "https://b.example"]);
        assert!(s.is_production());
        assert_eq!(s.public_base_url(), "https://vpn.example.org");
        assert!(s.security.encryption_key.is_none());

        let mut bad = Settings::default();
        assert!(bad
            .apply_env_with(|k| (k == "NEBULA_CONSOLE_ENVIRONMENT").then(|| "staging".to_string()))
            .is_err());
    }

    #[test]
    fn test_security_validation() {
        let dev = Settings::default();
        let warnings = dev.validate_security().unwrap();
        assert!(warnings.iter().any(|w| w.contains("secret_key")));
        assert!(warnings.iter().any(|w| w.contains("encryption_key")));

        let mut prod = Settings::default();
        prod.server.environment = Environment::Production;
        let err = prod.validate_security().unwrap_err();
        assert!(err.contains("secret_key"));
        assert!(err.contains("encryption_key"));

        prod.auth.secret_key = "x".repeat(48);
        prod.security.encryption_key = Some("passphrase".to_string());
        prod.server.allowed_origins = vec!["https://console.example.org".to_string()];
        assert!(prod.validate_security().unwrap().is_empty());
    }
}
