//! Request extractors for the caller's identity

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::{header, request::Parts};
use nebula_console_common::{Role, UserRecord};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use crate::audit::Actor;
use crate::auth::jwt::Claims;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Peer address of the request, `unknown` when not served over TCP
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

impl ClientIp {
    pub fn from_parts(parts: &Parts) -> Self {
        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Self(ip)
    }
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_parts(parts))
    }
}

/// Authenticated, active user behind a bearer token.
///
/// The role comes from the database, not from the token, so role changes
/// and deactivation take effect immediately.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: UserRecord,
    pub claims: Claims,
    pub ip: String,
}

impl CurrentUser {
    pub fn require(&self, role: Role) -> ApiResult<()> {
        if self.user.role.allows(role) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!(
                "Not enough permissions. {} access required.",
                capitalized(role)
            )))
        }
    }

    pub fn is_admin(&self) -> bool {
        self.user.is_admin()
    }

    /// Owner of a resource or an admin
    pub fn require_owner_or_admin(&self, owner: Option<i64>) -> ApiResult<()> {
        if self.is_admin() || owner == Some(self.user.id) {
            Ok(())
        } else {
            Err(ApiError::forbidden("Not enough permissions"))
        }
    }

    pub fn actor(&self) -> Actor {
        Actor::user(&self.user, Some(self.ip.clone()))
    }
}

fn capitalized(role: Role) -> &'static str {
    match role {
        Role::Viewer => "Viewer",
        Role::User => "User",
        Role::Admin => "Admin",
    }
}

pub fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or_else(|| ApiError::unauthorized("Not authenticated"))?;
        let claims = state
            .issuer
            .verify(token)
            .map_err(|_| ApiError::unauthorized("Could not validate credentials"))?;

        if state.db.is_session_revoked(&claims.jti)? {
            debug!("Rejected revoked token for {}", claims.sub);
            return Err(ApiError::unauthorized("Token has been revoked"));
        }

        let user = state
            .users
            .get(claims.uid)?
            .filter(|u| u.username == claims.sub)
            .ok_or_else(|| ApiError::unauthorized("Could not validate credentials"))?;
        if !user.is_active {
            return Err(ApiError::bad_request("Inactive user"));
        }

        Ok(Self {
            user,
            claims,
            ip: ClientIp::from_parts(parts).0,
        })
    }
}
