//! `/api/client-setup` routes

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use nebula_console_common::{Error, ProvisionTokenRecord, Role};
use std::sync::Arc;

use crate::audit::{self, Actor};
use crate::auth::{ClientIp, CurrentUser};
use crate::error::{ApiError, ApiResult};
use crate::pki::routes::attachment;
use crate::provision::service::{DeviceStatus, ProvisionRequest, ProvisionResponse};
use crate::server::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/provision", post(provision_handler))
        .route("/download/:token", get(download_handler))
        .route("/qr-code/:token", get(qr_code_handler))
        .route("/status/:device_name", get(status_handler))
        .route("/tokens", get(list_tokens_handler))
        .route("/tokens/:id", delete(cancel_token_handler))
}

/// Unknown tokens all look the same to the caller
fn token_error(e: Error) -> ApiError {
    match e {
        Error::NotFound { ref kind, .. } if kind == "token" => ApiError::not_found("Invalid or expired token"),
        other => other.into(),
    }
}

/// Base URL for links handed to devices: configured public URL, else the
/// Host the request came in on.
fn base_url(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(url) = &state.settings.server.public_url {
        return url.trim_end_matches('/').to_string();
    }
    match headers.get(header::HOST).and_then(|h| h.to_str().ok()) {
        Some(host) => format!("http://{}", host),
        None => state.settings.public_base_url(),
    }
}

async fn provision_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Json(req): Json<ProvisionRequest>,
) -> ApiResult<impl IntoResponse> {
    current.require(Role::User)?;
    match state.provisioning.issue(&req, &current.user).await {
        Ok(resp) => {
            audit::success(&current.actor(), "provision", "device", &resp.device_name);
            Ok((StatusCode::CREATED, Json::<ProvisionResponse>(resp)))
        }
        Err(e) => {
            audit::failure(&current.actor(), "provision", "device", &req.device_name, &e.to_string());
            Err(e.into())
        }
    }
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    Path(token): Path<String>,
) -> ApiResult<Response> {
    let actor = Actor::anonymous(Some(ip));
    match state.provisioning.download(&token).await {
        Ok((record, package)) => {
            audit::success(&actor, "download", "device", &record.device_name);
            let mut response = attachment(package);
            response
                .headers_mut()
                .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            Ok(response)
        }
        Err(e) => {
            audit::failure(&actor, "download", "device", "-", &e.to_string());
            Err(token_error(e))
        }
    }
}

async fn qr_code_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> ApiResult<Response> {
    let png = state
        .provisioning
        .qr_png(&token, &base_url(&state, &headers))
        .map_err(token_error)?;
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("image/png")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        png,
    )
        .into_response())
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(device_name): Path<String>,
) -> ApiResult<Json<DeviceStatus>> {
    current.require(Role::User)?;
    Ok(Json(state.provisioning.status(&device_name)?))
}

async fn list_tokens_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
) -> ApiResult<Json<Vec<ProvisionTokenRecord>>> {
    current.require(Role::User)?;
    let owner = if current.is_admin() { None } else { Some(current.user.id) };
    Ok(Json(state.provisioning.list_pending(owner)?))
}

async fn cancel_token_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    current.require(Role::User)?;
    let refused = |e: ApiError, name: &str| {
        audit::failure(&current.actor(), "cancel", "provision_token", name, &e.detail);
        e
    };
    let record = state
        .provisioning
        .get(id)
        .map_err(|e| refused(e.into(), &id.to_string()))?;
    current
        .require_owner_or_admin(record.created_by)
        .map_err(|e| refused(e, &record.device_name))?;
    state
        .provisioning
        .cancel(id)
        .map_err(|e| refused(e.into(), &record.device_name))?;
    audit::success(&current.actor(), "cancel", "provision_token", &record.device_name);
    Ok(StatusCode::NO_CONTENT)
}
