//! One-time device provisioning
//!
//! An operator issues a token for a device; whoever holds the token can
//! download a ready-to-install package exactly once. Only the SHA-256 of
//! the token is stored.

use image::{GrayImage, Luma};
use nebula_console_common::crypto::{generate_secure_token, hash_token};
use nebula_console_common::validate::{normalize_groups, validate_name, validate_nebula_ip};
use nebula_console_common::{
    now_epoch_secs, CertStatus, ClaimOutcome, DeviceType, Error, NewProvisionToken, ProvisionStore,
    ProvisionTokenRecord, Result, UserRecord,
};
use qrcode::{Color, QrCode};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{info, warn};

use crate::pki::service::{ensure_groups_allowed, CertificateService, Download, SignHostRequest};
use crate::provision::package::{self, PackageContents};
use crate::settings::ProvisioningSettings;

/// Pixels per QR module
const QR_MODULE_PX: u32 = 10;
/// Quiet zone, in modules
const QR_BORDER: u32 = 4;

pub const DOWNLOAD_PATH: &str = "/api/client-setup/download";
pub const QR_PATH: &str = "/api/client-setup/qr-code";

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionRequest {
    pub device_name: String,
    pub device_type: String,
    /// Assigned automatically when empty
    #[serde(default)]
    pub ip_address: Option<String>,
    pub ca_id: i64,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionResponse {
    /// Shown once; only its hash is kept
    pub token: String,
    pub id: i64,
    pub expires_at: i64,
    pub device_name: String,
    pub device_type: DeviceType,
    pub ip_address: String,
    pub download_url: String,
    pub qr_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device_name: String,
    /// `pending`, `active`, `expired`, `revoked` or `unknown`
    pub status: String,
    pub ip_address: Option<String>,
    pub expires_at: Option<i64>,
    pub certificate_id: Option<i64>,
}

pub struct ProvisioningService {
    tokens: ProvisionStore,
    certificates: Arc<CertificateService>,
    settings: ProvisioningSettings,
}

impl ProvisioningService {
    pub fn new(tokens: ProvisionStore, certificates: Arc<CertificateService>, settings: ProvisioningSettings) -> Self {
        Self {
            tokens,
            certificates,
            settings,
        }
    }

    pub async fn issue(&self, req: &ProvisionRequest, user: &UserRecord) -> Result<ProvisionResponse> {
        let device_type: DeviceType = req.device_type.parse().map_err(Error::Validation)?;
        let device_name = validate_name("device_name", &req.device_name)?;
        let _issuing = self.certificates.lock_ca(req.ca_id).await;
        let now = now_epoch_secs();
        let ca = self.certificates.usable_ca(req.ca_id, now)?;

        if self.certificates.store().name_exists(&device_name)?
            || self.tokens.has_pending_device(&device_name, now)?
        {
            return Err(Error::already_exists("device", &device_name));
        }

        let groups = if req.groups.is_empty() {
            normalize_groups(&self.settings.default_groups)?
        } else {
            normalize_groups(&req.groups)?
        };
        ensure_groups_allowed(&ca, &groups)?;

        let ip_address = match req.ip_address.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(requested) => {
                let ip = validate_nebula_ip(requested)?;
                if self.certificates.reserved_addresses(ca.id, now)?.contains(&ip.ip()) {
                    return Err(Error::Conflict(format!("IP address {} is already in use", ip.ip())));
                }
                ip.to_string()
            }
            None => self.certificates.allocate_ip(ca.id)?,
        };

        let token = generate_secure_token();
        let record = self.tokens.insert(&NewProvisionToken {
            token_hash: hash_token(&token),
            device_name,
            device_type,
            ip_address,
            ca_id: ca.id,
            groups,
            auto_connect: req.auto_connect,
            created_by: Some(user.id),
            created_at: now,
            expires_at: now + self.settings.token_ttl_hours.max(1) * 3600,
        })?;
        info!(
            "Issued provisioning token for {} ({}, {})",
            record.device_name, record.device_type, record.ip_address
        );

        Ok(ProvisionResponse {
            download_url: format!("{}/{}", DOWNLOAD_PATH, token),
            qr_url: format!("{}/{}", QR_PATH, token),
            token,
            id: record.id,
            expires_at: record.expires_at,
            device_name: record.device_name,
            device_type: record.device_type,
            ip_address: record.ip_address,
        })
    }

    /// Redeem a token: sign the device certificate and build its package
    pub async fn download(&self, token: &str) -> Result<(ProvisionTokenRecord, Download)> {
        let token_hash = hash_token(token);
        let ca_id = self
            .tokens
            .get_by_hash(&token_hash)?
            .map(|t| t.ca_id)
            .ok_or_else(|| Error::not_found("token", ""))?;
        // Claimed tokens no longer reserve their address, so hold the CA
        // until the certificate row exists.
        let _issuing = self.certificates.lock_ca(ca_id).await;

        let record = match self.tokens.claim(&token_hash, now_epoch_secs())? {
            ClaimOutcome::Claimed(record) => record,
            ClaimOutcome::NotFound => return Err(Error::not_found("token", "")),
            ClaimOutcome::Expired => return Err(Error::Gone("Token expired".to_string())),
            ClaimOutcome::AlreadyUsed => return Err(Error::Gone("Token already used".to_string())),
        };
        let mut claim = ClaimGuard {
            service: self,
            token_id: record.id,
            certificate_id: None,
            committed: false,
        };

        let cert = self
            .certificates
            .sign_host_locked(
                &SignHostRequest {
                    name: record.device_name.clone(),
                    ca_id: record.ca_id,
                    ip_address: record.ip_address.clone(),
                    groups: record.groups.clone(),
                    subnets: Vec::new(),
                    duration_hours: None,
                },
                record.created_by,
            )
            .await?;
        claim.certificate_id = Some(cert.id);

        let ca = self.certificates.get(record.ca_id)?;
        let key = self.certificates.open_key(&cert)?;
        let (pki_dir, sep) = package::pki_dir(record.device_type);
        let config = self.certificates.client_config(pki_dir, sep)?;
        let lighthouse_ip = self.certificates.lighthouses().first().map(|l| l.nebula_ip.as_str());

        let bytes = package::build(&PackageContents {
            device_name: &record.device_name,
            device_type: record.device_type,
            ip_address: &record.ip_address,
            auto_connect: record.auto_connect,
            ca_pem: &ca.cert_pem,
            cert_pem: &cert.cert_pem,
            key_pem: &key,
            config_yaml: &config,
            lighthouse_ip,
        })?;
        self.tokens.complete(record.id, cert.id)?;
        claim.committed = true;
        info!("Provisioned device {} (certificate {})", record.device_name, cert.id);

        let download = Download {
            filename: format!("{}-nebula-client.zip", record.device_name),
            content_type: "application/zip",
            bytes,
        };
        Ok((record, download))
    }

    /// PNG QR code of the absolute download URL
    pub fn qr_png(&self, token: &str, base_url: &str) -> Result<Vec<u8>> {
        let record = self
            .tokens
            .get_by_hash(&hash_token(token))?
            .ok_or_else(|| Error::not_found("token", ""))?;
        if !record.is_pending(now_epoch_secs()) {
            return Err(Error::Gone("Token expired or already used".to_string()));
        }
        let url = format!("{}{}/{}", base_url.trim_end_matches('/'), DOWNLOAD_PATH, token);
        render_qr_png(&url)
    }

    pub fn status(&self, device_name: &str) -> Result<DeviceStatus> {
        let now = now_epoch_secs();
        if let Some(cert) = self.certificates.store().get_by_name(device_name)? {
            let status = match cert.status(now) {
                CertStatus::Active => "active",
                CertStatus::Expired => "expired",
                CertStatus::Revoked => "revoked",
            };
            return Ok(DeviceStatus {
                device_name: cert.name,
                status: status.to_string(),
                ip_address: cert.ip_address,
                expires_at: Some(cert.expires_at),
                certificate_id: Some(cert.id),
            });
        }

        let token = self
            .tokens
            .latest_for_device(device_name)?
            .ok_or_else(|| Error::not_found("device", device_name))?;
        let status = if token.is_pending(now) {
            "pending"
        } else if token.used_at.is_none() {
            "expired"
        } else {
            // Used, but the certificate has since been deleted.
            "unknown"
        };
        Ok(DeviceStatus {
            device_name: token.device_name,
            status: status.to_string(),
            ip_address: Some(token.ip_address),
            expires_at: Some(token.expires_at),
            certificate_id: token.certificate_id,
        })
    }

    /// Pending tokens; `None` lists every user's
    pub fn list_pending(&self, created_by: Option<i64>) -> Result<Vec<ProvisionTokenRecord>> {
        self.tokens.list_pending(created_by, now_epoch_secs())
    }

    pub fn get(&self, id: i64) -> Result<ProvisionTokenRecord> {
        self.tokens
            .get(id)?
            .ok_or_else(|| Error::not_found("token", id))
    }

    pub fn cancel(&self, id: i64) -> Result<ProvisionTokenRecord> {
        let record = self.get(id)?;
        if record.used_at.is_some() {
            return Err(Error::Conflict("Token has already been used".to_string()));
        }
        self.tokens.delete(id)?;
        info!("Cancelled provisioning token {} for {}", id, record.device_name);
        Ok(record)
    }

    pub fn purge_expired(&self) -> Result<usize> {
        self.tokens.purge_expired(now_epoch_secs())
    }
}

/// Undoes a token claim unless the download completed.
///
/// Runs on early return and when the download future is dropped, so an
/// abandoned request leaves the token redeemable and no orphan certificate.
struct ClaimGuard<'a> {
    service: &'a ProvisioningService,
    token_id: i64,
    certificate_id: Option<i64>,
    committed: bool,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(cert_id) = self.certificate_id {
            if let Err(e) = self.service.certificates.store().delete(cert_id) {
                warn!("Failed to discard certificate {}: {}", cert_id, e);
            }
        }
        match self.service.tokens.release(self.token_id) {
            Ok(()) => warn!("Released provisioning token {} after an incomplete download", self.token_id),
            Err(e) => warn!("Failed to release token {}: {}", self.token_id, e),
        }
    }
}

fn render_qr_png(data: &str) -> Result<Vec<u8>> {
    let code = QrCode::new(data.as_bytes()).map_err(|e| Error::Internal(format!("QR encoding failed: {}", e)))?;
    let modules = code.width() as u32;
    let colors = code.to_colors();
    let side = (modules + 2 * QR_BORDER) * QR_MODULE_PX;

    let img = GrayImage::from_fn(side, side, |x, y| {
        let mx = (x / QR_MODULE_PX).checked_sub(QR_BORDER);
        let my = (y / QR_MODULE_PX).checked_sub(QR_BORDER);
        match (mx, my) {
            (Some(mx), Some(my)) if mx < modules && my < modules => {
                match colors[(my * modules + mx) as usize] {
                    Color::Dark => Luma([0u8]),
                    Color::Light => Luma([255u8]),
                }
            }
            _ => Luma([255u8]),
        }
    });

    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| Error::Internal(format!("PNG encoding failed: {}", e)))?;
    Ok(png)
}
