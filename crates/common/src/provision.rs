//! Provisioning token storage
//!
//! Tokens are single use. Claiming is one conditional UPDATE under the
//! connection lock, so two concurrent downloads of the same token cannot
//! both succeed.

use crate::db::{decode_list, encode_list, is_constraint_violation, Database};
use crate::types::DeviceType;
use crate::{Error, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

const TOKEN_COLUMNS: &str = "id, token_hash, device_name, device_type, ip_address, ca_id, groups, \
                             auto_connect, created_by, created_at, expires_at, used_at, certificate_id";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionTokenRecord {
    pub id: i64,
    #[serde(skip)]
    pub token_hash: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub ip_address: String,
    pub ca_id: i64,
    pub groups: Vec<String>,
    pub auto_connect: bool,
    pub created_by: Option<i64>,
    pub created_at: i64,
    pub expires_at: i64,
    pub used_at: Option<i64>,
    pub certificate_id: Option<i64>,
}

impl ProvisionTokenRecord {
    pub fn is_pending(&self, now: i64) -> bool {
        self.used_at.is_none() && self.expires_at > now
    }
}

#[derive(Debug, Clone)]
pub struct NewProvisionToken {
    pub token_hash: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub ip_address: String,
    pub ca_id: i64,
    pub groups: Vec<String>,
    pub auto_connect: bool,
    pub created_by: Option<i64>,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Result of trying to claim a token for download
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(ProvisionTokenRecord),
    NotFound,
    Expired,
    AlreadyUsed,
}

fn map_token(row: &Row<'_>) -> rusqlite::Result<ProvisionTokenRecord> {
    let device_type: String = row.get(3)?;
    let groups: String = row.get(6)?;
    Ok(ProvisionTokenRecord {
        id: row.get(0)?,
        token_hash: row.get(1)?,
        device_name: row.get(2)?,
        device_type: device_type.parse().unwrap_or(DeviceType::Linux),
        ip_address: row.get(4)?,
        ca_id: row.get(5)?,
        groups: decode_list(&groups),
        auto_connect: row.get(7)?,
        created_by: row.get(8)?,
        created_at: row.get(9)?,
        expires_at: row.get(10)?,
        used_at: row.get(11)?,
        certificate_id: row.get(12)?,
    })
}

/// Provisioning tokens table wrapper
#[derive(Clone)]
pub struct ProvisionStore {
    db: Database,
}

impl ProvisionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, new: &NewProvisionToken) -> Result<ProvisionTokenRecord> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO provision_tokens (token_hash, device_name, device_type, ip_address, ca_id,
                groups, auto_connect, created_by, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                new.token_hash,
                new.device_name,
                new.device_type.to_string(),
                new.ip_address,
                new.ca_id,
                encode_list(&new.groups),
                new.auto_connect,
                new.created_by,
                new.created_at,
                new.expires_at,
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::already_exists("provisioning token", &new.device_name)
            } else {
                Error::Database(e)
            }
        })?;

        Ok(ProvisionTokenRecord {
            id: conn.last_insert_rowid(),
            token_hash: new.token_hash.clone(),
            device_name: new.device_name.clone(),
            device_type: new.device_type,
            ip_address: new.ip_address.clone(),
            ca_id: new.ca_id,
            groups: new.groups.clone(),
            auto_connect: new.auto_connect,
            created_by: new.created_by,
            created_at: new.created_at,
            expires_at: new.expires_at,
            used_at: None,
            certificate_id: None,
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<ProvisionTokenRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let token = conn
            .query_row(
                &format!("SELECT {} FROM provision_tokens WHERE id = ?1", TOKEN_COLUMNS),
                params![id],
                map_token,
            )
            .optional()?;
        Ok(token)
    }

    pub fn get_by_hash(&self, token_hash: &str) -> Result<Option<ProvisionTokenRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let token = conn
            .query_row(
                &format!("SELECT {} FROM provision_tokens WHERE token_hash = ?1", TOKEN_COLUMNS),
                params![token_hash],
                map_token,
            )
            .optional()?;
        Ok(token)
    }

    /// Atomically mark a token used. Expired tokens are deleted on sight.
    pub fn claim(&self, token_hash: &str, now: i64) -> Result<ClaimOutcome> {
        let conn = self.db.connection();
        let conn = conn.lock();

        let changed = conn.execute(
            "UPDATE provision_tokens SET used_at = ?1
             WHERE token_hash = ?2 AND used_at IS NULL AND expires_at > ?1",
            params![now, token_hash],
        )?;

        let record = conn
            .query_row(
                &format!("SELECT {} FROM provision_tokens WHERE token_hash = ?1", TOKEN_COLUMNS),
                params![token_hash],
                map_token,
            )
            .optional()?;

        let outcome = match record {
            None => ClaimOutcome::NotFound,
            Some(record) if changed == 1 => ClaimOutcome::Claimed(record),
            Some(record) if record.used_at.is_some() => ClaimOutcome::AlreadyUsed,
            Some(record) => {
                conn.execute("DELETE FROM provision_tokens WHERE id = ?1", params![record.id])?;
                ClaimOutcome::Expired
            }
        };
        Ok(outcome)
    }

    /// Undo a claim whose certificate could not be issued
    pub fn release(&self, id: i64) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE provision_tokens SET used_at = NULL WHERE id = ?1 AND certificate_id IS NULL",
            params![id],
        )?;
        Ok(())
    }

    /// Link a claimed token to the certificate issued for it
    pub fn complete(&self, id: i64, certificate_id: i64) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE provision_tokens SET certificate_id = ?1 WHERE id = ?2",
            params![certificate_id, id],
        )?;
        Ok(())
    }

    /// Pending tokens, optionally restricted to one creator
    pub fn list_pending(&self, created_by: Option<i64>, now: i64) -> Result<Vec<ProvisionTokenRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM provision_tokens
             WHERE used_at IS NULL AND expires_at > ?1 AND (?2 IS NULL OR created_by = ?2)
             ORDER BY id",
            TOKEN_COLUMNS
        ))?;
        let tokens = stmt
            .query_map(params![now, created_by], map_token)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tokens)
    }

    /// Most recent token issued for a device name
    pub fn latest_for_device(&self, device_name: &str) -> Result<Option<ProvisionTokenRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let token = conn
            .query_row(
                &format!(
                    "SELECT {} FROM provision_tokens WHERE device_name = ?1 ORDER BY id DESC LIMIT 1",
                    TOKEN_COLUMNS
                ),
                params![device_name],
                map_token,
            )
            .optional()?;
        Ok(token)
    }

    pub fn has_pending_device(&self, device_name: &str, now: i64) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM provision_tokens
                 WHERE device_name = ?1 AND used_at IS NULL AND expires_at > ?2 LIMIT 1",
                params![device_name, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Addresses reserved by pending tokens of a CA
    pub fn pending_ips(&self, ca_id: i64, now: i64) -> Result<Vec<String>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ip_address FROM provision_tokens
             WHERE ca_id = ?1 AND used_at IS NULL AND expires_at > ?2",
        )?;
        let ips = stmt
            .query_map(params![ca_id, now], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ips)
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let n = conn.execute("DELETE FROM provision_tokens WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Remove tokens that expired without being used
    pub fn purge_expired(&self, now: i64) -> Result<usize> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let n = conn.execute(
            "DELETE FROM provision_tokens WHERE used_at IS NULL AND expires_at <= ?1",
            params![now],
        )?;
        Ok(n)
    }
}
