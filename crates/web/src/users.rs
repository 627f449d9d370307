//! `/api/users` routes: account administration and self-service

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use nebula_console_common::crypto::{hash_password, verify_password};
use nebula_console_common::validate::{validate_email, validate_username};
use nebula_console_common::{Error, NewUser, Role, UserRecord, UserStats, UserUpdate};
use serde::Deserialize;
use std::sync::Arc;

use crate::audit;
use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

const MAX_PAGE_SIZE: i64 = 1000;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_users_handler).post(create_user_handler))
        .route("/stats", get(user_stats_handler))
        .route("/me/change-password", post(change_password_handler))
        .route("/me/email", put(change_email_handler))
        .route(
            "/:id",
            get(get_user_handler).put(update_user_handler).delete(delete_user_handler),
        )
        .route("/:id/toggle-active", post(toggle_active_handler))
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    username: String,
    email: String,
    password: String,
    #[serde(default)]
    role: Role,
}

#[derive(Debug, Deserialize)]
struct UpdateUserRequest {
    email: Option<String>,
    role: Option<Role>,
    is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ChangePasswordRequest {
    old_password: String,
    new_password: String,
}

#[derive(Debug, Deserialize)]
struct ChangeEmailRequest {
    new_email: String,
    password: String,
}

fn load_user(state: &AppState, id: i64) -> ApiResult<UserRecord> {
    state
        .users
        .get(id)?
        .ok_or_else(|| ApiError::not_found("User not found"))
}

// ============================================================================
// Admin
// ============================================================================

async fn list_users_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<UserRecord>>> {
    current.require(Role::Admin)?;
    let users = state
        .users
        .list(page.skip.max(0), page.limit.clamp(1, MAX_PAGE_SIZE))?;
    Ok(Json(users))
}

async fn user_stats_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
) -> ApiResult<Json<UserStats>> {
    current.require(Role::Admin)?;
    Ok(Json(state.users.stats()?))
}

async fn get_user_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<UserRecord>> {
    current.require(Role::Admin)?;
    Ok(Json(load_user(&state, id)?))
}

async fn create_user_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<impl IntoResponse> {
    current.require(Role::Admin)?;
    let username = validate_username(&req.username)?;
    let email = validate_email(&req.email)?;
    state.settings.auth.password_policy.check(&req.password)?;

    let user = state.users.create(&NewUser {
        username,
        email,
        password_hash: hash_password(&req.password),
        role: req.role,
    })?;
    audit::success(&current.actor(), "create", "user", &user.username);
    Ok((StatusCode::CREATED, Json(user)))
}

async fn update_user_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateUserRequest>,
) -> ApiResult<Json<UserRecord>> {
    current.require(Role::Admin)?;
    if id == current.user.id {
        if req.role.is_some_and(|r| r != Role::Admin) {
            return Err(ApiError::bad_request("Cannot change your own admin role"));
        }
        if req.is_active == Some(false) {
            return Err(ApiError::bad_request("Cannot deactivate yourself"));
        }
    }
    let email = req.email.as_deref().map(validate_email).transpose()?;

    let updated = state
        .users
        .update(
            id,
            &UserUpdate {
                email,
                role: req.role,
                is_active: req.is_active,
            },
        )
        .map_err(|e| match e {
            Error::NotFound { .. } => ApiError::not_found("User not found"),
            other => other.into(),
        })?;
    audit::success(&current.actor(), "update", "user", &updated.username);
    Ok(Json(updated))
}

async fn toggle_active_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    current.require(Role::Admin)?;
    let user = load_user(&state, id)?;
    if user.id == current.user.id {
        return Err(ApiError::bad_request("Cannot toggle your own active status"));
    }
    let updated = state.users.update(
        id,
        &UserUpdate {
            is_active: Some(!user.is_active),
            ..Default::default()
        },
    )?;
    let action = if updated.is_active { "activate" } else { "deactivate" };
    audit::success(&current.actor(), action, "user", &updated.username);
    Ok(Json(serde_json::json!({
        "message": format!("User {}d", action),
        "is_active": updated.is_active,
    })))
}

async fn delete_user_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    current.require(Role::Admin)?;
    if id == current.user.id {
        return Err(ApiError::bad_request("Cannot delete yourself"));
    }
    let user = load_user(&state, id)?;
    if !state.users.delete(id)? {
        return Err(ApiError::not_found("User not found"));
    }
    audit::success(&current.actor(), "delete", "user", &user.username);
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Self-service
// ============================================================================

async fn change_password_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Json(req): Json<ChangePasswordRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !verify_password(&req.old_password, &current.user.password_hash) {
        audit::failure(&current.actor(), "change_password", "user", &current.user.username, "bad password");
        return Err(ApiError::bad_request("Old password is incorrect"));
    }
    state.settings.auth.password_policy.check(&req.new_password)?;
    state
        .users
        .set_password_hash(current.user.id, &hash_password(&req.new_password))?;
    audit::success(&current.actor(), "change_password", "user", &current.user.username);
    Ok(Json(serde_json::json!({ "message": "Password changed successfully" })))
}

async fn change_email_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Json(req): Json<ChangeEmailRequest>,
) -> ApiResult<Json<UserRecord>> {
    if !verify_password(&req.password, &current.user.password_hash) {
        return Err(ApiError::bad_request("Invalid password"));
    }
    let email = validate_email(&req.new_email)?;
    if let Some(other) = state.users.get_by_email(&email)? {
        if other.id != current.user.id {
            return Err(ApiError::bad_request("Email already in use by another account"));
        }
    }
    let updated = state.users.update(
        current.user.id,
        &UserUpdate {
            email: Some(email),
            ..Default::default()
        },
    )?;
    audit::success(&current.actor(), "change_email", "user", &updated.username);
    Ok(Json(updated))
}
