//! `nebula-cert` adapter
//!
//! Signing happens in the external tool. Every invocation runs in a private
//! temporary directory that is removed afterwards, so CA and host keys only
//! touch disk for the lifetime of one command.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nebula_console_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Locations searched when no binary is configured
const SEARCH_PATHS: &[&str] = &["/usr/local/bin/nebula-cert", "/usr/bin/nebula-cert"];

/// Parameters for a new CA
#[derive(Debug, Clone)]
pub struct CaParams {
    pub name: String,
    pub duration_hours: i64,
    pub groups: Vec<String>,
}

/// Parameters for a host certificate
#[derive(Debug, Clone)]
pub struct SignParams {
    pub name: String,
    /// Overlay address with prefix, e.g. `192.168.100.10/24`
    pub ip: String,
    pub groups: Vec<String>,
    pub subnets: Vec<String>,
    pub duration_hours: i64,
}

/// Parsed output of `nebula-cert print -json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertDetails {
    pub name: String,
    pub ips: Vec<String>,
    pub groups: Vec<String>,
    pub subnets: Vec<String>,
    pub not_before: i64,
    pub not_after: i64,
    pub is_ca: bool,
    pub issuer: String,
    pub fingerprint: String,
}

/// Certificate and private key produced by the tool
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub details: CertDetails,
}

/// Operations the console needs from a Nebula CA tool
#[async_trait]
pub trait CertTool: Send + Sync {
    /// Version string, also used as an availability check
    async fn version(&self) -> Result<String>;

    async fn create_ca(&self, params: &CaParams) -> Result<IssuedCert>;

    async fn sign(&self, params: &SignParams, ca_cert_pem: &str, ca_key_pem: &str) -> Result<IssuedCert>;

    async fn inspect(&self, cert_pem: &str) -> Result<CertDetails>;
}

// ============================================================================
// Command lines
// ============================================================================

pub fn ca_args(params: &CaParams, out_crt: &Path, out_key: &Path) -> Vec<String> {
    let mut args = vec![
        "ca".to_string(),
        "-name".to_string(),
        params.name.clone(),
        "-duration".to_string(),
        format!("{}h", params.duration_hours),
        "-out-crt".to_string(),
        out_crt.display().to_string(),
        "-out-key".to_string(),
        out_key.display().to_string(),
    ];
    if !params.groups.is_empty() {
        args.push("-groups".to_string());
        args.push(params.groups.join(","));
    }
    args
}

pub fn sign_args(
    params: &SignParams,
    ca_crt: &Path,
    ca_key: &Path,
    out_crt: &Path,
    out_key: &Path,
) -> Vec<String> {
    let mut args = vec![
        "sign".to_string(),
        "-name".to_string(),
        params.name.clone(),
        "-ip".to_string(),
        params.ip.clone(),
        "-ca-crt".to_string(),
        ca_crt.display().to_string(),
        "-ca-key".to_string(),
        ca_key.display().to_string(),
        "-duration".to_string(),
        format!("{}h", params.duration_hours),
        "-out-crt".to_string(),
        out_crt.display().to_string(),
        "-out-key".to_string(),
        out_key.display().to_string(),
    ];
    if !params.groups.is_empty() {
        args.push("-groups".to_string());
        args.push(params.groups.join(","));
    }
    if !params.subnets.is_empty() {
        args.push("-subnets".to_string());
        args.push(params.subnets.join(","));
    }
    args
}

// ============================================================================
// print -json parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct PrintedCert {
    details: PrintedDetails,
    #[serde(default)]
    fingerprint: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrintedDetails {
    name: String,
    #[serde(default, alias = "networks")]
    ips: Vec<String>,
    #[serde(default, alias = "unsafeNetworks")]
    subnets: Vec<String>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    is_ca: bool,
    #[serde(default)]
    issuer: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

/// Older releases print one object, newer ones a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PrintOutput {
    One(PrintedCert),
    Many(Vec<PrintedCert>),
}

/// Parse `nebula-cert print -json` output
pub fn parse_print_json(output: &str) -> Result<CertDetails> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| Error::CertTool("empty print output".to_string()))?;
    let parsed: PrintOutput = serde_json::from_str(line)
        .map_err(|e| Error::CertTool(format!("unexpected print output: {}", e)))?;
    let cert = match parsed {
        PrintOutput::One(c) => c,
        PrintOutput::Many(list) => list
            .into_iter()
            .next()
            .ok_or_else(|| Error::CertTool("print output contained no certificate".to_string()))?,
    };
    Ok(CertDetails {
        name: cert.details.name,
        ips: cert.details.ips,
        groups: cert.details.groups,
        subnets: cert.details.subnets,
        not_before: cert.details.not_before.timestamp(),
        not_after: cert.details.not_after.timestamp(),
        is_ca: cert.details.is_ca,
        issuer: cert.details.issuer,
        fingerprint: cert.fingerprint,
    })
}

// ============================================================================
// CLI implementation
// ============================================================================

/// Runs the `nebula-cert` binary
pub struct NebulaCertCli {
    binary: PathBuf,
    timeout: Duration,
}

impl NebulaCertCli {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Use the configured binary, else the first well-known location that
    /// exists, else rely on `PATH`.
    pub fn discover(configured: Option<&Path>, timeout: Duration) -> Self {
        if let Some(path) = configured {
            return Self::new(path, timeout);
        }
        let binary = SEARCH_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .unwrap_or_else(|| PathBuf::from("nebula-cert"));
        Self::new(binary, timeout)
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn run(&self, args: &[String], cwd: &Path) -> Result<String> {
        debug!("Running {} {}", self.binary.display(), args.first().map(String::as_str).unwrap_or(""));
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).current_dir(cwd).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::CertTool(format!(
                    "{} not found, install nebula-cert or set pki.nebula_cert_bin",
                    self.binary.display()
                )))
            }
            Ok(Err(e)) => return Err(Error::CertTool(format!("failed to start: {}", e))),
            Err(_) => {
                warn!("nebula-cert timed out after {:?}", self.timeout);
                return Err(Error::Timeout { seconds: self.timeout.as_secs() });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let msg = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(Error::CertTool(msg.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn read_pair(dir: &Path) -> Result<(String, String)> {
        let cert_pem = tokio::fs::read_to_string(dir.join("out.crt")).await?;
        let key_pem = tokio::fs::read_to_string(dir.join("out.key")).await?;
        Ok((cert_pem, key_pem))
    }
}

fn scratch_dir() -> Result<tempfile::TempDir> {
    Ok(tempfile::Builder::new().prefix("nebula-cert-").tempdir()?)
}

/// Write a file readable only by the owner
async fn write_private(path: &Path, contents: &str) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    file.write_all(contents.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl CertTool for NebulaCertCli {
    async fn version(&self) -> Result<String> {
        let dir = scratch_dir()?;
        let out = self.run(&["-version".to_string()], dir.path()).await?;
        Ok(out.trim().trim_start_matches("Version:").trim().to_string())
    }

    async fn create_ca(&self, params: &CaParams) -> Result<IssuedCert> {
        let dir = scratch_dir()?;
        let args = ca_args(params, Path::new("out.crt"), Path::new("out.key"));
        self.run(&args, dir.path()).await?;
        let (cert_pem, key_pem) = Self::read_pair(dir.path()).await?;
        let details = self.inspect(&cert_pem).await?;
        Ok(IssuedCert { cert_pem, key_pem, details })
    }

    async fn sign(&self, params: &SignParams, ca_cert_pem: &str, ca_key_pem: &str) -> Result<IssuedCert> {
        let dir = scratch_dir()?;
        write_private(&dir.path().join("ca.crt"), ca_cert_pem).await?;
        write_private(&dir.path().join("ca.key"), ca_key_pem).await?;

        let args = sign_args(
            params,
            Path::new("ca.crt"),
            Path::new("ca.key"),
            Path::new("out.crt"),
            Path::new("out.key"),
        );
        self.run(&args, dir.path()).await?;
        let (cert_pem, key_pem) = Self::read_pair(dir.path()).await?;
        let details = self.inspect(&cert_pem).await?;
        Ok(IssuedCert { cert_pem, key_pem, details })
    }

    async fn inspect(&self, cert_pem: &str) -> Result<CertDetails> {
        let dir = scratch_dir()?;
        write_private(&dir.path().join("inspect.crt"), cert_pem).await?;
        let args = vec![
            "print".to_string(),
            "-json".to_string(),
            "-path".to_string(),
            "inspect.crt".to_string(),
        ];
        let out = self.run(&args, dir.path()).await?;
        parse_print_json(&out)
    }
}
