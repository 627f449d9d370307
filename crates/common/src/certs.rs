//! Certificate storage
//!
//! Holds CA and host certificates with their (optionally sealed) private
//! keys. Revocation is a flag plus timestamp; a revoked CA takes every
//! certificate it issued down with it.

use crate::db::{decode_list, encode_list, is_constraint_violation, Database};
use crate::types::{CertKind, CertStatus};
use crate::{Error, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

const CERT_COLUMNS: &str = "id, name, kind, ca_id, ip_address, groups, subnets, duration_hours, \
                            cert_pem, private_key, key_encrypted, fingerprint, created_by, \
                            created_at, expires_at, revoked, revoked_at";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: i64,
    pub name: String,
    pub kind: CertKind,
    pub ca_id: Option<i64>,
    pub ip_address: Option<String>,
    pub groups: Vec<String>,
    pub subnets: Vec<String>,
    pub duration_hours: i64,
    pub cert_pem: String,
    #[serde(skip)]
    pub private_key: String,
    #[serde(skip)]
    pub key_encrypted: bool,
    pub fingerprint: Option<String>,
    pub created_by: Option<i64>,
    pub created_at: i64,
    pub expires_at: i64,
    pub revoked: bool,
    pub revoked_at: Option<i64>,
}

impl CertificateRecord {
    pub fn is_ca(&self) -> bool {
        self.kind == CertKind::Ca
    }

    pub fn status(&self, now: i64) -> CertStatus {
        CertStatus::derive(self.revoked, self.expires_at, now)
    }
}

/// Fields for a freshly issued certificate
#[derive(Debug, Clone)]
pub struct NewCertificate {
    pub name: String,
    pub kind: CertKind,
    pub ca_id: Option<i64>,
    pub ip_address: Option<String>,
    pub groups: Vec<String>,
    pub subnets: Vec<String>,
    pub duration_hours: i64,
    pub cert_pem: String,
    pub private_key: String,
    pub key_encrypted: bool,
    pub fingerprint: Option<String>,
    pub created_by: Option<i64>,
    pub created_at: i64,
    pub expires_at: i64,
}

/// List filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CertFilter {
    pub kind: Option<CertKind>,
    pub ca_id: Option<i64>,
    #[serde(default)]
    pub include_revoked: bool,
}

fn map_cert(row: &Row<'_>) -> rusqlite::Result<CertificateRecord> {
    let kind: String = row.get(2)?;
    let groups: String = row.get(5)?;
    let subnets: String = row.get(6)?;
    Ok(CertificateRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: kind.parse().unwrap_or(CertKind::Host),
        ca_id: row.get(3)?,
        ip_address: row.get(4)?,
        groups: decode_list(&groups),
        subnets: decode_list(&subnets),
        duration_hours: row.get(7)?,
        cert_pem: row.get(8)?,
        private_key: row.get(9)?,
        key_encrypted: row.get(10)?,
        fingerprint: row.get(11)?,
        created_by: row.get(12)?,
        created_at: row.get(13)?,
        expires_at: row.get(14)?,
        revoked: row.get(15)?,
        revoked_at: row.get(16)?,
    })
}

/// Certificates table wrapper
#[derive(Clone)]
pub struct CertStore {
    db: Database,
}

impl CertStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, new: &NewCertificate) -> Result<CertificateRecord> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO certificates (name, kind, ca_id, ip_address, groups, subnets, duration_hours,
                cert_pem, private_key, key_encrypted, fingerprint, created_by, created_at, expires_at, revoked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 0)",
            params![
                new.name,
                new.kind.to_string(),
                new.ca_id,
                new.ip_address,
                encode_list(&new.groups),
                encode_list(&new.subnets),
                new.duration_hours,
                new.cert_pem,
                new.private_key,
                new.key_encrypted,
                new.fingerprint,
                new.created_by,
                new.created_at,
                new.expires_at,
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::already_exists("certificate", &new.name)
            } else {
                Error::Database(e)
            }
        })?;

        Ok(CertificateRecord {
            id: conn.last_insert_rowid(),
            name: new.name.clone(),
            kind: new.kind,
            ca_id: new.ca_id,
            ip_address: new.ip_address.clone(),
            groups: new.groups.clone(),
            subnets: new.subnets.clone(),
            duration_hours: new.duration_hours,
            cert_pem: new.cert_pem.clone(),
            private_key: new.private_key.clone(),
            key_encrypted: new.key_encrypted,
            fingerprint: new.fingerprint.clone(),
            created_by: new.created_by,
            created_at: new.created_at,
            expires_at: new.expires_at,
            revoked: false,
            revoked_at: None,
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<CertificateRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let cert = conn
            .query_row(
                &format!("SELECT {} FROM certificates WHERE id = ?1", CERT_COLUMNS),
                params![id],
                map_cert,
            )
            .optional()?;
        Ok(cert)
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<CertificateRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let cert = conn
            .query_row(
                &format!("SELECT {} FROM certificates WHERE name = ?1", CERT_COLUMNS),
                params![name],
                map_cert,
            )
            .optional()?;
        Ok(cert)
    }

    pub fn name_exists(&self, name: &str) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM certificates WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list(&self, filter: &CertFilter) -> Result<Vec<CertificateRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM certificates
             WHERE (?1 IS NULL OR kind = ?1)
               AND (?2 IS NULL OR ca_id = ?2)
               AND (?3 = 1 OR revoked = 0)
             ORDER BY id",
            CERT_COLUMNS
        ))?;
        let certs = stmt
            .query_map(
                params![
                    filter.kind.map(|k| k.to_string()),
                    filter.ca_id,
                    filter.include_revoked
                ],
                map_cert,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(certs)
    }

    /// Revoke a certificate; for a CA every unrevoked certificate it issued
    /// is revoked in the same transaction. Returns the ids that changed.
    pub fn revoke(&self, id: i64, now: i64) -> Result<Vec<i64>> {
        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;

        let state: Option<(String, bool)> = tx
            .query_row(
                "SELECT kind, revoked FROM certificates WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (kind, revoked) = state.ok_or_else(|| Error::not_found("certificate", id))?;
        if revoked {
            return Err(Error::Conflict(format!("certificate {} is already revoked", id)));
        }

        let mut changed = vec![id];
        tx.execute(
            "UPDATE certificates SET revoked = 1, revoked_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;

        if kind == CertKind::Ca.to_string() {
            let children = {
                let mut stmt =
                    tx.prepare("SELECT id FROM certificates WHERE ca_id = ?1 AND revoked = 0")?;
                let ids = stmt
                    .query_map(params![id], |row| row.get::<_, i64>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };
            tx.execute(
                "UPDATE certificates SET revoked = 1, revoked_at = ?1 WHERE ca_id = ?2 AND revoked = 0",
                params![now, id],
            )?;
            changed.extend(children);
        }

        tx.commit()?;
        Ok(changed)
    }

    /// Delete a certificate. Certificates issued by a deleted CA go with it.
    pub fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let n = conn.execute("DELETE FROM certificates WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Unrevoked, unexpired certificates issued by a CA
    pub fn active_children_count(&self, ca_id: i64, now: i64) -> Result<i64> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM certificates WHERE ca_id = ?1 AND revoked = 0 AND expires_at > ?2",
            params![ca_id, now],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Overlay addresses held by active certificates of a CA
    pub fn active_ips(&self, ca_id: i64, now: i64) -> Result<Vec<String>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ip_address FROM certificates
             WHERE ca_id = ?1 AND revoked = 0 AND expires_at > ?2 AND ip_address IS NOT NULL",
        )?;
        let ips = stmt
            .query_map(params![ca_id, now], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ips)
    }

    /// Fingerprints of revoked host certificates that would otherwise still be valid
    pub fn revoked_fingerprints(&self, now: i64) -> Result<Vec<(String, String)>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, fingerprint FROM certificates
             WHERE kind = 'host' AND revoked = 1 AND expires_at > ?1 AND fingerprint IS NOT NULL
             ORDER BY revoked_at, id",
        )?;
        let rows = stmt
            .query_map(params![now], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
