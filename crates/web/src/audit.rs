//! Audit trail
//!
//! Security-relevant actions are emitted as structured events on the
//! `audit` tracing target, so they can be routed to their own sink with
//! `RUST_LOG=audit=info` or a JSON log pipeline.

use nebula_console_common::UserRecord;
use tracing::{info, warn};

/// Who performed an action and from where
#[derive(Debug, Clone, Default)]
pub struct Actor {
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub ip: Option<String>,
}

impl Actor {
    pub fn user(user: &UserRecord, ip: Option<String>) -> Self {
        Self {
            user_id: Some(user.id),
            username: Some(user.username.clone()),
            ip,
        }
    }

    pub fn anonymous(ip: Option<String>) -> Self {
        Self {
            user_id: None,
            username: None,
            ip,
        }
    }
}

/// Record a successful action
pub fn success(actor: &Actor, action: &str, resource_type: &str, resource_name: &str) {
    info!(
        target: "audit",
        user_id = ?actor.user_id,
        username = actor.username.as_deref().unwrap_or("-"),
        ip = actor.ip.as_deref().unwrap_or("-"),
        action,
        resource_type,
        resource_name,
        status = "success",
        "{} {} {}",
        action,
        resource_type,
        resource_name
    );
}

/// Record a failed or refused action
pub fn failure(actor: &Actor, action: &str, resource_type: &str, resource_name: &str, error: &str) {
    warn!(
        target: "audit",
        user_id = ?actor.user_id,
        username = actor.username.as_deref().unwrap_or("-"),
        ip = actor.ip.as_deref().unwrap_or("-"),
        action,
        resource_type,
        resource_name,
        status = "failed",
        error,
        "{} {} {} failed: {}",
        action,
        resource_type,
        resource_name,
        error
    );
}
