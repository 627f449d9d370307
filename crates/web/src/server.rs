//! HTTP server: shared state, router assembly, startup and shutdown

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnetwork::IpNetwork;
use nebula_console_common::crypto::{generate_secure_token, hash_password};
use nebula_console_common::{
    CertStore, Database, KeyCipher, NewUser, ProvisionStore, Role, UserStore, VERSION,
};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{self, LoginAttemptTracker, TokenIssuer};
use crate::middleware::{ip_allowlist, parse_allowlist, rate_limit, request_id, security_headers, RateLimiter, X_REQUEST_ID};
use crate::pki::{self, CertTool, CertificateService, NebulaCertCli};
use crate::provision::{self, ProvisioningService};
use crate::settings::Settings;
use crate::users;

/// kv_store key holding the base64 salt for passphrase-derived keys
const KEY_SALT: &str = "key_salt";

/// How long the health check waits for `nebula-cert -version`
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// State
// ============================================================================

/// Shared application state
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: Database,
    pub users: UserStore,
    pub issuer: TokenIssuer,
    pub lockout: LoginAttemptTracker,
    pub cipher: Arc<KeyCipher>,
    pub certificates: Arc<CertificateService>,
    pub provisioning: Arc<ProvisioningService>,
    pub rate_limiter: RateLimiter,
    pub allowlist: Vec<IpNetwork>,
    /// Compared against when a login names an unknown user
    pub dummy_password_hash: String,
}

impl AppState {
    pub fn new(settings: Settings, db: Database, tool: Arc<dyn CertTool>) -> anyhow::Result<Self> {
        let cipher = Arc::new(resolve_cipher(&settings, &db)?);
        let allowlist = parse_allowlist(&settings.server.ip_allowlist).map_err(anyhow::Error::msg)?;

        let tokens = ProvisionStore::new(db.clone());
        let certificates = Arc::new(CertificateService::new(
            CertStore::new(db.clone()),
            tokens.clone(),
            tool,
            cipher.clone(),
            settings.pki.clone(),
            settings.security.encrypt_private_keys,
            settings.lighthouse.hosts.clone(),
        ));
        let provisioning = Arc::new(ProvisioningService::new(
            tokens,
            certificates.clone(),
            settings.provisioning.clone(),
        ));

        Ok(Self {
            users: UserStore::new(db.clone()),
            issuer: TokenIssuer::new(&settings.auth.secret_key, settings.auth.token_ttl_minutes),
            lockout: LoginAttemptTracker::new(
                settings.auth.max_login_attempts,
                Duration::from_secs(settings.auth.lockout_minutes.max(1) as u64 * 60),
            ),
            rate_limiter: RateLimiter::new(settings.server.rate_limit_per_minute, Duration::from_secs(60)),
            cipher,
            certificates,
            provisioning,
            allowlist,
            dummy_password_hash: hash_password(&generate_secure_token()),
            settings: Arc::new(settings),
            db,
        })
    }
}

/// Key used to seal private keys and TOTP secrets.
///
/// Production requires `security.encryption_key`. Development falls back to
/// a generated key persisted next to the database.
pub fn resolve_cipher(settings: &Settings, db: &Database) -> anyhow::Result<KeyCipher> {
    let secret = match &settings.security.encryption_key {
        Some(key) => key.clone(),
        None if settings.is_production() => {
            anyhow::bail!("security.encryption_key (ENCRYPTION_KEY) must be set in production")
        }
        None => load_or_create_dev_key(&settings.dev_key_path())?,
    };

    let salt = match db.kv_get(KEY_SALT)? {
        Some(encoded) => BASE64.decode(encoded.trim())?,
        None => {
            let salt = KeyCipher::generate_salt();
            db.kv_set(KEY_SALT, &BASE64.encode(salt))?;
            salt.to_vec()
        }
    };
    Ok(KeyCipher::from_secret(&secret, &salt)?)
}

fn load_or_create_dev_key(path: &Path) -> anyhow::Result<String> {
    if path.exists() {
        return Ok(std::fs::read_to_string(path)?.trim().to_string());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let key = KeyCipher::generate_key_b64();
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(key.as_bytes())?;
    warn!(
        "No encryption key configured; generated a development key at {}",
        path.display()
    );
    Ok(key)
}

/// Create the first admin account when the users table is empty
pub fn bootstrap_admin(state: &AppState) -> anyhow::Result<()> {
    if state.users.count()? > 0 {
        return Ok(());
    }
    let cfg = &state.settings.auth.bootstrap_admin;
    let (password, generated) = match &cfg.password {
        Some(p) => (p.clone(), false),
        None => (format!("Nc9-{}", &generate_secure_token()[..20]), true),
    };
    if let Err(e) = state.settings.auth.password_policy.check(&password) {
        warn!("Bootstrap admin password does not meet the password policy: {}", e);
    }
    let admin = state.users.create(&NewUser {
        username: cfg.username.clone(),
        email: cfg.email.clone(),
        password_hash: hash_password(&password),
        role: Role::Admin,
    })?;
    if generated {
        warn!(
            "Created admin user '{}' with generated password: {} (change it after first login)",
            admin.username, password
        );
    } else {
        info!("Created admin user '{}'", admin.username);
    }
    Ok(())
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let settings = state.settings.clone();
    Router::new()
        .route("/", get(root_handler))
        .route("/api/health", get(health_handler))
        .route("/api/security-info", get(security_info_handler))
        .nest("/api/auth", auth::routes::router())
        .nest("/api/users", users::router())
        .nest("/api/certificates", pki::routes::router())
        .nest("/api/client-setup", provision::routes::router())
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(settings.server.max_body_bytes))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), ip_allowlist))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(security_headers))
        .layer(cors_layer(&settings))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .server
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();
    let request_id = HeaderName::from_static(X_REQUEST_ID);
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::PATCH, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, request_id.clone()])
        .expose_headers([
            request_id,
            header::CONTENT_DISPOSITION,
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderName::from_static("x-ratelimit-remaining"),
        ])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600))
}

// ============================================================================
// Handlers
// ============================================================================

async fn root_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "Nebula Console API",
        "version": VERSION,
        "environment": state.settings.server.environment,
        "health": "/api/health",
        "security": {
            "encryption": if state.settings.security.encrypt_private_keys { "enabled" } else { "disabled" },
            "rate_limiting": "enabled",
            "audit_logging": "enabled",
        },
    }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (database, users) = match state.db.ping().and_then(|_| state.users.count()) {
        Ok(n) => ("healthy".to_string(), Some(n)),
        Err(e) => {
            error!("Health check database error: {}", e);
            ("unhealthy".to_string(), None)
        }
    };
    let tool = state.certificates.tool().clone();
    let nebula_cert = match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, tool.version()).await {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            debug!("nebula-cert version check failed: {}", e);
            "unavailable".to_string()
        }
        Err(_) => "unavailable".to_string(),
    };

    let healthy = users.is_some();
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(serde_json::json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "version": VERSION,
            "environment": state.settings.server.environment,
            "database": database,
            "users": users,
            "nebula_cert": nebula_cert,
            "security": {
                "encryption": if state.settings.security.encrypt_private_keys { "enabled" } else { "disabled" },
                "rate_limiting": format!("{}/min", state.settings.server.rate_limit_per_minute),
            },
        })),
    )
}

/// Effective security settings; development only
async fn security_info_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let s = &state.settings;
    if s.is_production() {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "detail": "This endpoint is only available in development mode" })),
        );
    }
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "environment": s.server.environment,
            "encryption": {
                "configured_key": s.security.encryption_key.is_some(),
                "private_keys": s.security.encrypt_private_keys,
            },
            "rate_limiting": {
                "global": format!("{}/min", s.server.rate_limit_per_minute),
                "login_attempts": s.auth.max_login_attempts,
                "lockout_minutes": s.auth.lockout_minutes,
            },
            "jwt": {
                "algorithm": "HS256",
                "expiration_minutes": s.auth.token_ttl_minutes,
            },
            "password_policy": s.auth.password_policy,
            "cors": { "allowed_origins": s.server.allowed_origins },
            "ip_allowlist": s.server.ip_allowlist,
        })),
    )
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "detail": "Not found" })))
}

// ============================================================================
// Background maintenance
// ============================================================================

/// One sweep: expired tokens, expired session revocations, stale counters
pub fn sweep(state: &AppState) {
    match state.provisioning.purge_expired() {
        Ok(n) if n > 0 => info!("Purged {} expired provisioning token(s)", n),
        Ok(_) => {}
        Err(e) => warn!("Failed to purge provisioning tokens: {}", e),
    }
    match state.db.purge_revoked_sessions(nebula_console_common::now_epoch_secs()) {
        Ok(n) if n > 0 => debug!("Purged {} expired session revocation(s)", n),
        Ok(_) => {}
        Err(e) => warn!("Failed to purge revoked sessions: {}", e),
    }
    let pruned = state.lockout.prune() + state.rate_limiter.prune();
    if pruned > 0 {
        debug!("Pruned {} idle limiter entries", pruned);
    }
}

pub fn spawn_sweeper(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(state.settings.provisioning.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep(&state);
        }
    })
}

// ============================================================================
// Serve
// ============================================================================

/// Open storage, build state and serve until Ctrl-C
pub async fn serve(settings: Settings) -> anyhow::Result<()> {
    match settings.validate_security() {
        Ok(warnings) => {
            for w in warnings {
                warn!("Security: {}", w);
            }
        }
        Err(e) => anyhow::bail!("Refusing to start: {}", e),
    }

    let addr: SocketAddr = settings
        .server
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address '{}': {}", settings.server.listen, e))?;

    let db = Database::open(settings.db_path())?;
    let tool = NebulaCertCli::discover(
        settings.pki.nebula_cert_bin.as_deref(),
        Duration::from_secs(settings.pki.command_timeout_secs),
    );
    info!("Using nebula-cert at {}", tool.binary().display());

    let environment = settings.server.environment;
    let state = Arc::new(AppState::new(settings, db, Arc::new(tool))?);
    bootstrap_admin(&state)?;
    let sweeper = spawn_sweeper(state.clone());

    info!("Nebula console ({}) listening on http://{}", environment, addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    info!("Nebula console stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
