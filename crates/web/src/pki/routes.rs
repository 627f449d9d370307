//! `/api/certificates` routes

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use nebula_console_common::{now_epoch_secs, CertFilter, Role};
use std::sync::Arc;

use crate::audit;
use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult};
use crate::pki::cert_tool::CertDetails;
use crate::pki::service::{Blocklist, CertificateView, CreateCaRequest, Download, SignHostRequest};
use crate::server::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_certificates_handler))
        .route("/ca", post(create_ca_handler))
        .route("/sign", post(sign_host_handler))
        .route("/blocklist", get(blocklist_handler))
        .route("/:id", get(get_certificate_handler).delete(delete_certificate_handler))
        .route("/:id/revoke", post(revoke_certificate_handler))
        .route("/:id/inspect", get(inspect_certificate_handler))
        .route("/:id/bundle", get(bundle_handler))
        .route("/:id/certificate", get(certificate_pem_handler))
}

/// Attachment response for a generated file
pub fn attachment(download: Download) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", download.filename);
    let mut response = (
        [(header::CONTENT_TYPE, HeaderValue::from_static(download.content_type))],
        download.bytes,
    )
        .into_response();
    if let Ok(v) = HeaderValue::from_str(&disposition) {
        response.headers_mut().insert(header::CONTENT_DISPOSITION, v);
    }
    response
}

async fn list_certificates_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Query(filter): Query<CertFilter>,
) -> ApiResult<Json<Vec<CertificateView>>> {
    current.require(Role::Viewer)?;
    let now = now_epoch_secs();
    let certs = state
        .certificates
        .list(&filter)?
        .into_iter()
        .map(|c| CertificateView::new(c, now))
        .collect();
    Ok(Json(certs))
}

async fn create_ca_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Json(req): Json<CreateCaRequest>,
) -> ApiResult<impl IntoResponse> {
    current.require(Role::Admin)?;
    match state.certificates.create_ca(&req, Some(current.user.id)).await {
        Ok(ca) => {
            audit::success(&current.actor(), "create", "ca", &ca.name);
            Ok((StatusCode::CREATED, Json(CertificateView::new(ca, now_epoch_secs()))))
        }
        Err(e) => {
            audit::failure(&current.actor(), "create", "ca", &req.name, &e.to_string());
            Err(e.into())
        }
    }
}

async fn sign_host_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Json(req): Json<SignHostRequest>,
) -> ApiResult<impl IntoResponse> {
    current.require(Role::User)?;
    match state.certificates.sign_host(&req, Some(current.user.id)).await {
        Ok(cert) => {
            audit::success(&current.actor(), "sign", "certificate", &cert.name);
            Ok((StatusCode::CREATED, Json(CertificateView::new(cert, now_epoch_secs()))))
        }
        Err(e) => {
            audit::failure(&current.actor(), "sign", "certificate", &req.name, &e.to_string());
            Err(e.into())
        }
    }
}

async fn blocklist_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
) -> ApiResult<Json<Blocklist>> {
    current.require(Role::Viewer)?;
    Ok(Json(state.certificates.blocklist()?))
}

async fn get_certificate_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<CertificateView>> {
    current.require(Role::Viewer)?;
    let cert = state.certificates.get(id)?;
    Ok(Json(CertificateView::new(cert, now_epoch_secs())))
}

async fn inspect_certificate_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<CertDetails>> {
    current.require(Role::Viewer)?;
    Ok(Json(state.certificates.inspect(id).await?))
}

async fn revoke_certificate_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    current.require(Role::Admin)?;
    let cert = state
        .certificates
        .get(id)
        .map_err(|e| refused(&current, "revoke", &id.to_string(), e))?;
    let revoked = state
        .certificates
        .revoke(id)
        .map_err(|e| refused(&current, "revoke", &cert.name, e))?;
    audit::success(&current.actor(), "revoke", cert.kind.to_string().as_str(), &cert.name);
    Ok(Json(serde_json::json!({
        "message": format!("Certificate '{}' revoked", cert.name),
        "revoked_ids": revoked,
    })))
}

async fn delete_certificate_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    current.require(Role::Admin)?;
    let cert = state
        .certificates
        .delete(id)
        .map_err(|e| refused(&current, "delete", &id.to_string(), e))?;
    audit::success(&current.actor(), "delete", cert.kind.to_string().as_str(), &cert.name);
    Ok(StatusCode::NO_CONTENT)
}

async fn bundle_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    current.require(Role::Viewer)?;
    let cert = state
        .certificates
        .get(id)
        .map_err(|e| refused(&current, "download", &id.to_string(), e))?;
    current
        .require_owner_or_admin(cert.created_by)
        .map_err(|e| refused(&current, "download", &cert.name, e))?;
    let bundle = state
        .certificates
        .bundle(id)
        .map_err(|e| refused(&current, "download", &cert.name, e))?;
    audit::success(&current.actor(), "download", "bundle", &cert.name);
    Ok(attachment(bundle))
}

async fn certificate_pem_handler(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    current.require(Role::Viewer)?;
    Ok(attachment(state.certificates.certificate_pem(id)?))
}

/// Record a refused certificate action and pass the error through
fn refused(current: &CurrentUser, action: &str, name: &str, e: impl Into<ApiError>) -> ApiError {
    let e = e.into();
    audit::failure(&current.actor(), action, "certificate", name, &e.detail);
    e
}
