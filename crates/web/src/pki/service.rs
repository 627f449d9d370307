//! Certificate authority operations
//!
//! Validation and bookkeeping around the `CertTool`: which CA may sign,
//! which names and overlay addresses are still free, sealing of private
//! keys, revocation and bundle export.

use crate::archive::{ArchiveBuilder, MODE_PRIVATE, MODE_PUBLIC};
use crate::pki::cert_tool::{CaParams, CertDetails, CertTool, SignParams};
use crate::settings::PkiSettings;
use ipnetwork::Ipv4Network;
use nebula_console_common::validate::{
    assignable_hosts, normalize_groups, validate_duration_hours, validate_name, validate_nebula_ip,
    validate_subnet,
};
use nebula_console_common::nebula_config::validate_yaml;
use nebula_console_common::{
    now_epoch_secs, CertFilter, CertKind, CertStatus, CertStore, CertificateRecord, Error, KeyCipher,
    Lighthouse, NebulaConfig, NewCertificate, ProvisionStore, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCaRequest {
    pub name: String,
    pub duration_hours: Option<i64>,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignHostRequest {
    pub name: String,
    pub ca_id: i64,
    #[serde(alias = "ip")]
    pub ip_address: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub subnets: Vec<String>,
    pub duration_hours: Option<i64>,
}

/// Certificate as returned by the API; never carries the private key
#[derive(Debug, Clone, Serialize)]
pub struct CertificateView {
    #[serde(flatten)]
    pub record: CertificateRecord,
    pub status: CertStatus,
}

impl CertificateView {
    pub fn new(record: CertificateRecord, now: i64) -> Self {
        let status = record.status(now);
        Self { record, status }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BlocklistEntry {
    pub name: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Blocklist {
    pub fingerprints: Vec<BlocklistEntry>,
    /// Ready to paste under `pki:` in a Nebula config
    pub yaml: String,
}

/// A downloadable file
#[derive(Debug)]
pub struct Download {
    pub filename: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

pub struct CertificateService {
    store: CertStore,
    tokens: ProvisionStore,
    tool: Arc<dyn CertTool>,
    cipher: Arc<KeyCipher>,
    settings: PkiSettings,
    encrypt_private_keys: bool,
    lighthouses: Vec<Lighthouse>,
    ca_locks: parking_lot::Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl CertificateService {
    pub fn new(
        store: CertStore,
        tokens: ProvisionStore,
        tool: Arc<dyn CertTool>,
        cipher: Arc<KeyCipher>,
        settings: PkiSettings,
        encrypt_private_keys: bool,
        lighthouses: Vec<Lighthouse>,
    ) -> Self {
        Self {
            store,
            tokens,
            tool,
            cipher,
            settings,
            encrypt_private_keys,
            lighthouses,
            ca_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn tool(&self) -> &Arc<dyn CertTool> {
        &self.tool
    }

    pub fn store(&self) -> &CertStore {
        &self.store
    }

    pub fn lighthouses(&self) -> &[Lighthouse] {
        &self.lighthouses
    }

    // ------------------------------------------------------------------------
    // Issuance
    // ------------------------------------------------------------------------

    pub async fn create_ca(&self, req: &CreateCaRequest, created_by: Option<i64>) -> Result<CertificateRecord> {
        let name = validate_name("name", &req.name)?;
        self.ensure_name_free(&name)?;
        let hours = validate_duration_hours(
            req.duration_hours.unwrap_or(self.settings.default_ca_duration_hours),
            self.settings.max_ca_duration_hours,
        )?;
        let groups = normalize_groups(&req.groups)?;

        let issued = self
            .tool
            .create_ca(&CaParams {
                name: name.clone(),
                duration_hours: hours,
                groups: groups.clone(),
            })
            .await?;

        let now = now_epoch_secs();
        let expires_at = expiry_of(&issued.details, now, hours);
        let (private_key, key_encrypted) = self.seal_key(&issued.key_pem)?;
        let record = self.store.insert(&NewCertificate {
            name,
            kind: CertKind::Ca,
            ca_id: None,
            ip_address: None,
            groups,
            subnets: Vec::new(),
            duration_hours: hours,
            cert_pem: issued.cert_pem,
            private_key,
            key_encrypted,
            fingerprint: non_empty(issued.details.fingerprint),
            created_by,
            created_at: now,
            expires_at,
        })?;
        info!("Created CA {} (id {})", record.name, record.id);
        Ok(record)
    }

    pub async fn sign_host(&self, req: &SignHostRequest, created_by: Option<i64>) -> Result<CertificateRecord> {
        let _issuing = self.lock_ca(req.ca_id).await;
        self.sign_host_locked(req, created_by).await
    }

    /// Sign with the CA's issuance lock already held by the caller
    pub async fn sign_host_locked(&self, req: &SignHostRequest, created_by: Option<i64>) -> Result<CertificateRecord> {
        let now = now_epoch_secs();
        let name = validate_name("name", &req.name)?;
        self.ensure_name_free(&name)?;
        if self.tokens.has_pending_device(&name, now)? {
            return Err(Error::already_exists("certificate", &name));
        }

        let ca = self.usable_ca(req.ca_id, now)?;
        let ip = validate_nebula_ip(&req.ip_address)?;
        let groups = normalize_groups(&req.groups)?;
        let subnets = req
            .subnets
            .iter()
            .map(|s| validate_subnet(s).map(|n| n.to_string()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        // Without an explicit duration the certificate is cut to the CA's remaining lifetime.
        let remaining_hours = (ca.expires_at - now) / 3600;
        if remaining_hours < 1 {
            return Err(Error::Conflict(format!(
                "CA '{}' expires in less than an hour and can no longer sign",
                ca.name
            )));
        }
        let hours = validate_duration_hours(
            req.duration_hours
                .unwrap_or_else(|| self.settings.default_host_duration_hours.min(remaining_hours)),
            self.settings.max_host_duration_hours,
        )?;

        if now + hours * 3600 > ca.expires_at {
            return Err(Error::Validation(format!(
                "Certificate would outlive CA '{}'; at most {} hours remain",
                ca.name, remaining_hours
            )));
        }
        ensure_groups_allowed(&ca, &groups)?;
        if self.reserved_addresses(ca.id, now)?.contains(&ip.ip()) {
            return Err(Error::Conflict(format!("IP address {} is already in use", ip.ip())));
        }

        let ca_key = self.open_key(&ca)?;
        let issued = self
            .tool
            .sign(
                &SignParams {
                    name: name.clone(),
                    ip: ip.to_string(),
                    groups: groups.clone(),
                    subnets: subnets.clone(),
                    duration_hours: hours,
                },
                &ca.cert_pem,
                &ca_key,
            )
            .await?;

        let expires_at = expiry_of(&issued.details, now, hours);
        let (private_key, key_encrypted) = self.seal_key(&issued.key_pem)?;
        let record = self.store.insert(&NewCertificate {
            name,
            kind: CertKind::Host,
            ca_id: Some(ca.id),
            ip_address: Some(ip.to_string()),
            groups,
            subnets,
            duration_hours: hours,
            cert_pem: issued.cert_pem,
            private_key,
            key_encrypted,
            fingerprint: non_empty(issued.details.fingerprint),
            created_by,
            created_at: now,
            expires_at,
        })?;
        info!("Signed host certificate {} ({}) with CA {}", record.name, ip, ca.name);
        Ok(record)
    }

    /// Serializes address checks and inserts for one CA.
    ///
    /// Held from the reservation check until the certificate or token row
    /// exists, so two issuers cannot both see an address as free.
    pub async fn lock_ca(&self, ca_id: i64) -> OwnedMutexGuard<()> {
        let lock = self.ca_locks.lock().entry(ca_id).or_default().clone();
        lock.lock_owned().await
    }

    /// A CA that may sign right now
    pub fn usable_ca(&self, ca_id: i64, now: i64) -> Result<CertificateRecord> {
        let ca = self.get(ca_id)?;
        if !ca.is_ca() {
            return Err(Error::Validation(format!("Certificate {} is not a CA", ca_id)));
        }
        match ca.status(now) {
            CertStatus::Active => Ok(ca),
            CertStatus::Revoked => Err(Error::Conflict(format!("CA '{}' is revoked", ca.name))),
            CertStatus::Expired => Err(Error::Conflict(format!("CA '{}' has expired", ca.name))),
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn list(&self, filter: &CertFilter) -> Result<Vec<CertificateRecord>> {
        self.store.list(filter)
    }

    pub fn get(&self, id: i64) -> Result<CertificateRecord> {
        self.store
            .get(id)?
            .ok_or_else(|| Error::not_found("certificate", id))
    }

    pub async fn inspect(&self, id: i64) -> Result<CertDetails> {
        let cert = self.get(id)?;
        self.tool.inspect(&cert.cert_pem).await
    }

    pub fn blocklist(&self) -> Result<Blocklist> {
        let fingerprints: Vec<BlocklistEntry> = self
            .store
            .revoked_fingerprints(now_epoch_secs())?
            .into_iter()
            .map(|(name, fingerprint)| BlocklistEntry { name, fingerprint })
            .collect();
        Ok(Blocklist {
            yaml: blocklist_yaml(&fingerprints),
            fingerprints,
        })
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Returns every certificate id that became revoked
    pub fn revoke(&self, id: i64) -> Result<Vec<i64>> {
        let changed = self.store.revoke(id, now_epoch_secs())?;
        info!("Revoked certificate {} ({} total)", id, changed.len());
        Ok(changed)
    }

    pub fn delete(&self, id: i64) -> Result<CertificateRecord> {
        let cert = self.get(id)?;
        if cert.is_ca() {
            let active = self.store.active_children_count(id, now_epoch_secs())?;
            if active > 0 {
                return Err(Error::Conflict(format!(
                    "CA '{}' still has {} active certificate(s); revoke it first",
                    cert.name, active
                )));
            }
        }
        if !self.store.delete(id)? {
            return Err(Error::not_found("certificate", id));
        }
        info!("Deleted certificate {} (id {})", cert.name, id);
        Ok(cert)
    }

    // ------------------------------------------------------------------------
    // Exports
    // ------------------------------------------------------------------------

    /// Public certificate PEM
    pub fn certificate_pem(&self, id: i64) -> Result<Download> {
        let cert = self.get(id)?;
        let filename = if cert.is_ca() { "ca.crt".to_string() } else { format!("{}.crt", cert.name) };
        Ok(Download {
            filename,
            content_type: "application/x-pem-file",
            bytes: cert.cert_pem.into_bytes(),
        })
    }

    /// ZIP with everything a host needs to join the network
    pub fn bundle(&self, id: i64) -> Result<Download> {
        let cert = self.get(id)?;
        if cert.is_ca() {
            return Err(Error::Validation("CA certificates cannot be bundled".to_string()));
        }
        if cert.revoked {
            return Err(Error::Conflict(format!("Certificate '{}' is revoked", cert.name)));
        }
        let ca_id = cert
            .ca_id
            .ok_or_else(|| Error::Internal(format!("host certificate {} has no CA", cert.id)))?;
        let ca = self.get(ca_id)?;
        let key = self.open_key(&cert)?;
        let config = self.client_config("/etc/nebula", '/')?;

        let mut archive = ArchiveBuilder::new();
        let dir = &cert.name;
        archive.add(&format!("{}/ca.crt", dir), ca.cert_pem.as_bytes(), MODE_PUBLIC)?;
        archive.add(&format!("{}/host.crt", dir), cert.cert_pem.as_bytes(), MODE_PUBLIC)?;
        archive.add(&format!("{}/host.key", dir), key.as_bytes(), MODE_PRIVATE)?;
        archive.add(&format!("{}/config.yaml", dir), config.as_bytes(), MODE_PUBLIC)?;
        debug!("Bundled certificate {}", cert.name);

        Ok(Download {
            filename: format!("{}-nebula.zip", cert.name),
            content_type: "application/zip",
            bytes: archive.finish()?,
        })
    }

    /// Client configuration pointing at the configured lighthouses, with
    /// the current blocklist applied
    pub fn client_config(&self, pki_dir: &str, path_sep: char) -> Result<String> {
        let mut config = NebulaConfig::client(pki_dir, path_sep, &self.lighthouses);
        let blocked = self
            .store
            .revoked_fingerprints(now_epoch_secs())?
            .into_iter()
            .map(|(_, fp)| fp)
            .collect();
        config.set_blocklist(blocked);
        let yaml = config.to_yaml()?;
        let problems = validate_yaml(&yaml);
        if !problems.is_empty() {
            return Err(Error::Internal(format!(
                "generated client config is invalid: {}",
                problems.join("; ")
            )));
        }
        Ok(yaml)
    }

    // ------------------------------------------------------------------------
    // Keys and addresses
    // ------------------------------------------------------------------------

    /// Plaintext private key of a stored certificate
    pub fn open_key(&self, cert: &CertificateRecord) -> Result<String> {
        if cert.key_encrypted {
            self.cipher.open(&cert.private_key)
        } else {
            Ok(cert.private_key.clone())
        }
    }

    fn seal_key(&self, key_pem: &str) -> Result<(String, bool)> {
        if self.encrypt_private_keys {
            Ok((self.cipher.seal(key_pem)?, true))
        } else {
            Ok((key_pem.to_string(), false))
        }
    }

    fn ensure_name_free(&self, name: &str) -> Result<()> {
        if self.store.name_exists(name)? {
            return Err(Error::already_exists("certificate", name));
        }
        Ok(())
    }

    /// Addresses held by active certificates of the CA or by pending tokens
    pub fn reserved_addresses(&self, ca_id: i64, now: i64) -> Result<HashSet<Ipv4Addr>> {
        let mut used = HashSet::new();
        let held = self.store.active_ips(ca_id, now)?;
        let pending = self.tokens.pending_ips(ca_id, now)?;
        for ip in held.iter().chain(pending.iter()) {
            if let Some(addr) = host_part(ip) {
                used.insert(addr);
            }
        }
        Ok(used)
    }

    /// First free address of the overlay network, with its prefix
    pub fn allocate_ip(&self, ca_id: i64) -> Result<String> {
        let network: Ipv4Network = self
            .settings
            .network
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("pki.network '{}': {}", self.settings.network, e)))?;
        let used = self.reserved_addresses(ca_id, now_epoch_secs())?;
        assignable_hosts(network, self.settings.first_host_offset)
            .find(|addr| !used.contains(addr))
            .map(|addr| format!("{}/{}", addr, network.prefix()))
            .ok_or_else(|| Error::Conflict(format!("No free addresses left in {}", network)))
    }
}

/// A CA with groups only signs certificates within those groups
pub fn ensure_groups_allowed(ca: &CertificateRecord, groups: &[String]) -> Result<()> {
    if ca.groups.is_empty() {
        return Ok(());
    }
    let allowed: HashSet<&str> = ca.groups.iter().map(String::as_str).collect();
    let outside: Vec<&str> = groups.iter().map(String::as_str).filter(|g| !allowed.contains(g)).collect();
    if outside.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Groups not permitted by CA '{}': {}",
            ca.name,
            outside.join(", ")
        )))
    }
}

fn host_part(ip: &str) -> Option<Ipv4Addr> {
    ip.split('/').next().and_then(|a| a.parse().ok())
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Expiry reported by the tool, falling back to the requested duration
fn expiry_of(details: &CertDetails, now: i64, hours: i64) -> i64 {
    if details.not_after > 0 {
        details.not_after
    } else {
        now + hours * 3600
    }
}

fn blocklist_yaml(entries: &[BlocklistEntry]) -> String {
    if entries.is_empty() {
        return "pki:\n  blocklist: []\n".to_string();
    }
    let mut yaml = String::from("pki:\n  blocklist:\n");
    for entry in entries {
        yaml.push_str(&format!("    # {}\n    - {}\n", entry.name, entry.fingerprint));
    }
    yaml
}
