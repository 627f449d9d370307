//! Shared harness for API tests: in-memory database and a scripted CA tool.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use nebula_console_common::{now_epoch_secs, Database, Error, Result};
use nebula_console_web::pki::cert_tool::{CaParams, SignParams};
use nebula_console_web::pki::{CertDetails, CertTool, IssuedCert};
use nebula_console_web::server::{bootstrap_admin, router, AppState};
use nebula_console_web::Settings;
use serde_json::Value;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;
use tracing::subscriber::DefaultGuard;

pub const ADMIN_USER: &str = "admin";
pub const ADMIN_PASSWORD: &str = "Admin-Pass-1";

const PEM_HEADER: &str = "-----BEGIN NEBULA CERTIFICATE-----";
const PEM_FOOTER: &str = "-----END NEBULA CERTIFICATE-----";

/// Certificate tool that encodes the certificate details in the PEM body
#[derive(Default)]
pub struct FakeCertTool {
    serial: AtomicU64,
    /// Milliseconds each host signing takes
    pub sign_delay_ms: AtomicU64,
    pub fail_signing: AtomicBool,
}

impl FakeCertTool {
    pub fn set_sign_delay(&self, delay: Duration) {
        self.sign_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_fail_signing(&self, fail: bool) {
        self.fail_signing.store(fail, Ordering::SeqCst);
    }

    fn issue(&self, details: CertDetails) -> IssuedCert {
        let body = BASE64.encode(serde_json::to_vec(&details).unwrap_or_default());
        IssuedCert {
            cert_pem: format!("{}\n{}\n{}\n", PEM_HEADER, body, PEM_FOOTER),
            key_pem: format!(
                "-----BEGIN NEBULA X25519 PRIVATE KEY-----\n{}\n-----END NEBULA X25519 PRIVATE KEY-----\n",
                BASE64.encode(details.fingerprint.as_bytes())
            ),
            details,
        }
    }

    fn fingerprint(&self) -> String {
        format!("{:064x}", self.serial.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

fn decode(cert_pem: &str) -> Result<CertDetails> {
    let body = cert_pem
        .lines()
        .find(|l| !l.starts_with("-----") && !l.trim().is_empty())
        .ok_or_else(|| Error::CertTool("empty certificate".to_string()))?;
    let bytes = BASE64
        .decode(body.trim())
        .map_err(|e| Error::CertTool(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::CertTool(e.to_string()))
}

#[async_trait]
impl CertTool for FakeCertTool {
    async fn version(&self) -> Result<String> {
        Ok("1.8.2".to_string())
    }

    async fn create_ca(&self, params: &CaParams) -> Result<IssuedCert> {
        let now = now_epoch_secs();
        Ok(self.issue(CertDetails {
            name: params.name.clone(),
            ips: Vec::new(),
            groups: params.groups.clone(),
            subnets: Vec::new(),
            not_before: now,
            not_after: now + params.duration_hours * 3600,
            is_ca: true,
            issuer: String::new(),
            fingerprint: self.fingerprint(),
        }))
    }

    async fn sign(&self, params: &SignParams, ca_cert_pem: &str, _ca_key_pem: &str) -> Result<IssuedCert> {
        let delay = self.sign_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_signing.load(Ordering::SeqCst) {
            return Err(Error::CertTool("ca.key: permission denied".to_string()));
        }
        let ca = decode(ca_cert_pem)?;
        let now = now_epoch_secs();
        Ok(self.issue(CertDetails {
            name: params.name.clone(),
            ips: vec![params.ip.clone()],
            groups: params.groups.clone(),
            subnets: params.subnets.clone(),
            not_before: now,
            not_after: now + params.duration_hours * 3600,
            is_ca: false,
            issuer: ca.fingerprint,
            fingerprint: self.fingerprint(),
        }))
    }

    async fn inspect(&self, cert_pem: &str) -> Result<CertDetails> {
        decode(cert_pem)
    }
}

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.auth.secret_key = "test-signing-secret-0123456789abcdef0123456789".to_string();
    settings.auth.bootstrap_admin.password = Some(ADMIN_PASSWORD.to_string());
    settings.security.encryption_key = Some("test-encryption-passphrase".to_string());
    settings.server.rate_limit_per_minute = 10_000;
    settings.server.public_url = Some("https://vpn.example.org".to_string());
    settings
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub router: Router,
    pub tool: Arc<FakeCertTool>,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub bytes: Vec<u8>,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.bytes).unwrap_or(Value::Null)
    }
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let db = Database::open_memory().unwrap();
        let tool = Arc::new(FakeCertTool::default());
        let state = Arc::new(AppState::new(settings, db, tool.clone()).unwrap());
        bootstrap_admin(&state).unwrap();
        Self {
            router: router(state.clone()),
            state,
            tool,
        }
    }

    pub async fn send(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        TestResponse { status, headers, bytes }
    }

    pub async fn get(&self, uri: &str, token: Option<&str>) -> TestResponse {
        self.send(Method::GET, uri, token, None).await
    }

    pub async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> TestResponse {
        self.send(Method::POST, uri, token, Some(body)).await
    }

    pub async fn login(&self, username: &str, password: &str) -> String {
        let resp = self
            .post(
                "/api/auth/login",
                None,
                serde_json::json!({ "username": username, "password": password }),
            )
            .await;
        assert_eq!(resp.status, StatusCode::OK, "login failed: {:?}", resp.json());
        resp.json()["access_token"].as_str().unwrap().to_string()
    }

    pub async fn admin_token(&self) -> String {
        self.login(ADMIN_USER, ADMIN_PASSWORD).await
    }

    /// Sign up a regular user and return its token
    pub async fn user_token(&self, username: &str) -> String {
        let password = "User-Pass-1";
        let resp = self
            .post(
                "/api/auth/signup",
                None,
                serde_json::json!({
                    "username": username,
                    "email": format!("{}@example.org", username),
                    "password": password,
                }),
            )
            .await;
        assert_eq!(resp.status, StatusCode::CREATED, "signup failed: {:?}", resp.json());
        self.login(username, password).await
    }

    /// Overwrite a row's expiry to reach time-dependent paths
    pub fn set_expires_at(&self, table: &str, id: i64, expires_at: i64) {
        let conn = self.state.db.connection();
        conn.lock()
            .execute(
                &format!("UPDATE {} SET expires_at = ?1 WHERE id = ?2", table),
                [expires_at, id],
            )
            .unwrap();
    }

    /// Request a provisioning token and return `(id, token)`
    pub async fn provision(&self, token: &str, ca_id: i64, device_name: &str) -> (i64, String) {
        let resp = self
            .post(
                "/api/client-setup/provision",
                Some(token),
                serde_json::json!({ "device_name": device_name, "device_type": "linux", "ca_id": ca_id }),
            )
            .await;
        assert_eq!(resp.status, StatusCode::CREATED, "provision failed: {:?}", resp.json());
        let body = resp.json();
        (
            body["id"].as_i64().unwrap(),
            body["token"].as_str().unwrap().to_string(),
        )
    }

    /// Create a CA as admin and return its id
    pub async fn create_ca(&self, admin: &str, name: &str) -> i64 {
        let resp = self
            .post("/api/certificates/ca", Some(admin), serde_json::json!({ "name": name }))
            .await;
        assert_eq!(resp.status, StatusCode::CREATED, "create CA failed: {:?}", resp.json());
        resp.json()["id"].as_i64().unwrap()
    }
}

/// Log lines written while the guard returned by [`capture_logs`] is alive
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Route this thread's tracing output into a buffer
pub fn capture_logs() -> (DefaultGuard, LogBuffer) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    (tracing::subscriber::set_default(subscriber), buffer)
}
