//! `/api/auth` routes

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use nebula_console_common::crypto::{hash_password, verify_password};
use nebula_console_common::validate::{validate_email, validate_username};
use nebula_console_common::{now_epoch_secs, Error, NewUser, Role, UserRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::audit::{self, Actor};
use crate::auth::extract::{ClientIp, CurrentUser};
use crate::auth::totp;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/signup", post(signup_handler))
        .route("/login", post(login_handler))
        .route("/me", get(me_handler))
        .route("/logout", post(logout_handler))
        .route("/2fa/setup", post(totp_setup_handler))
        .route("/2fa/enable", post(totp_enable_handler))
        .route("/2fa/disable", post(totp_disable_handler))
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct SignupRequest {
    username: String,
    email: String,
    password: String,
    role: Option<Role>,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
    totp_code: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    expires_in: i64,
    user: UserRecord,
}

#[derive(Debug, Serialize)]
struct TotpSetupResponse {
    secret: String,
    otpauth_uri: String,
    qr_svg: String,
}

#[derive(Debug, Deserialize)]
struct TotpCodeRequest {
    code: String,
}

#[derive(Debug, Deserialize)]
struct PasswordConfirmRequest {
    password: String,
}

fn message(text: &str) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": text }))
}

// ============================================================================
// Handlers
// ============================================================================

async fn signup_handler(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    Json(req): Json<SignupRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = Actor::anonymous(Some(ip));
    if !state.settings.auth.allow_signup {
        return Err(ApiError::forbidden("Signup is disabled"));
    }
    let role = req.role.unwrap_or_default();
    if role == Role::Admin {
        audit::failure(&actor, "signup", "user", &req.username, "admin role requested");
        return Err(ApiError::forbidden("Admin accounts cannot be self-registered"));
    }

    let username = validate_username(&req.username)?;
    let email = validate_email(&req.email)?;
    state.settings.auth.password_policy.check(&req.password)?;

    if state.users.get_by_username(&username)?.is_some() {
        return Err(ApiError::bad_request("Username already registered"));
    }
    if state.users.get_by_email(&email)?.is_some() {
        return Err(ApiError::bad_request("Email already registered"));
    }

    let user = state.users.create(&NewUser {
        username,
        email,
        password_hash: hash_password(&req.password),
        role,
    })?;
    audit::success(&actor, "signup", "user", &user.username);
    info!("New {} account: {}", user.role, user.username);
    Ok((StatusCode::CREATED, Json(user)))
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let actor = Actor::anonymous(Some(ip));
    let key = req.username.trim().to_string();

    if let Err(retry_after_secs) = state.lockout.check(&key) {
        audit::failure(&actor, "login", "user", &key, "locked out");
        return Err(Error::Locked { retry_after_secs }.into());
    }

    let user = match check_credentials(&state, &key, &req.password)? {
        Some(u) => u,
        None => return Err(login_failed(&state, &actor, &key, "bad credentials")),
    };

    if !user.is_active {
        audit::failure(&actor, "login", "user", &key, "inactive user");
        return Err(ApiError::bad_request("Inactive user"));
    }

    if user.totp_enabled {
        let code = match req.totp_code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => code,
            None => return Err(ApiError::unauthorized("Two-factor code required")),
        };
        if !check_totp(&state, &user, code)? {
            return Err(login_failed(&state, &actor, &key, "bad two-factor code"));
        }
    }

    state.lockout.record_success(&key);
    state.users.touch_last_login(user.id)?;
    let user = state.users.get(user.id)?.unwrap_or(user);
    let (access_token, _) = state.issuer.issue(&user)?;

    audit::success(&Actor::user(&user, actor.ip.clone()), "login", "user", &user.username);
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer",
        expires_in: state.issuer.ttl_secs(),
        user,
    }))
}

/// Account matching the credentials.
///
/// Unknown usernames are checked against a dummy hash so both paths cost
/// one full PBKDF2 run.
fn check_credentials(state: &AppState, username: &str, password: &str) -> ApiResult<Option<UserRecord>> {
    match state.users.get_by_username(username)? {
        Some(user) => Ok(verify_password(password, &user.password_hash).then_some(user)),
        None => {
            verify_password(password, &state.dummy_password_hash);
            Ok(None)
        }
    }
}

/// Count a failed attempt, locking the account once the limit is reached
fn login_failed(state: &AppState, actor: &Actor, username: &str, reason: &str) -> ApiError {
    audit::failure(actor, "login", "user", username, reason);
    match state.lockout.record_failure(username) {
        Some(retry_after_secs) => Error::Locked { retry_after_secs }.into(),
        None => ApiError::unauthorized("Incorrect username or password"),
    }
}

fn check_totp(state: &AppState, user: &UserRecord, code: &str) -> ApiResult<bool> {
    let sealed = user
        .totp_secret
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("Two-factor authentication is not set up"))?;
    let secret = state.cipher.open(sealed)?;
    let totp = totp::totp_for_secret_b32(&state.settings.auth.totp_issuer, &user.username, &secret)?;
    Ok(totp::verify_code(&totp, code, now_epoch_secs()))
}

async fn me_handler(current: CurrentUser) -> Json<UserRecord> {
    Json(current.user)
}

async fn logout_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
) -> ApiResult<Json<serde_json::Value>> {
    state.db.revoke_session(&current.claims.jti, current.claims.exp)?;
    audit::success(&current.actor(), "logout", "user", &current.user.username);
    Ok(message("Successfully logged out"))
}

async fn totp_setup_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
) -> ApiResult<Json<TotpSetupResponse>> {
    if current.user.totp_enabled {
        return Err(ApiError::bad_request("Two-factor authentication is already enabled"));
    }
    let secret = totp::generate_secret_b32();
    let totp = totp::totp_for_secret_b32(&state.settings.auth.totp_issuer, &current.user.username, &secret)?;
    let otpauth_uri = totp.get_url();
    let qr_svg = totp::qr_svg(&otpauth_uri)?;

    state
        .users
        .set_totp(current.user.id, Some(&state.cipher.seal(&secret)?), false)?;
    audit::success(&current.actor(), "2fa_setup", "user", &current.user.username);
    Ok(Json(TotpSetupResponse {
        secret,
        otpauth_uri,
        qr_svg,
    }))
}

async fn totp_enable_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Json(req): Json<TotpCodeRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if current.user.totp_enabled {
        return Err(ApiError::bad_request("Two-factor authentication is already enabled"));
    }
    if !check_totp(&state, &current.user, &req.code)? {
        audit::failure(&current.actor(), "2fa_enable", "user", &current.user.username, "bad code");
        return Err(ApiError::bad_request("Invalid two-factor code"));
    }
    state
        .users
        .set_totp(current.user.id, current.user.totp_secret.as_deref(), true)?;
    audit::success(&current.actor(), "2fa_enable", "user", &current.user.username);
    Ok(message("Two-factor authentication enabled"))
}

async fn totp_disable_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Json(req): Json<PasswordConfirmRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !verify_password(&req.password, &current.user.password_hash) {
        audit::failure(&current.actor(), "2fa_disable", "user", &current.user.username, "bad password");
        return Err(ApiError::bad_request("Incorrect password"));
    }
    state.users.set_totp(current.user.id, None, false)?;
    audit::success(&current.actor(), "2fa_disable", "user", &current.user.username);
    Ok(message("Two-factor authentication disabled"))
}
