//! End-to-end API tests against an in-memory console

mod common;

use axum::http::{header, Method, StatusCode};
use common::{capture_logs, test_settings, TestApp, ADMIN_PASSWORD, ADMIN_USER};
use nebula_console_common::{now_epoch_secs, Error};
use nebula_console_web::pki::service::SignHostRequest;
use serde_json::json;
use std::io::Cursor;
use std::time::Duration;

#[tokio::test]
async fn test_health_and_security_headers() {
    let app = TestApp::new();
    let resp = app.get("/api/health", None).await;
    assert_eq!(resp.status, StatusCode::OK);
    let body = resp.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "healthy");
    assert_eq!(body["users"], 1);
    assert_eq!(body["nebula_cert"], "1.8.2");

    assert_eq!(resp.headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    assert_eq!(resp.headers[header::X_FRAME_OPTIONS], "DENY");
    assert!(resp.headers.contains_key(header::CONTENT_SECURITY_POLICY));
    assert!(resp.headers.contains_key("x-request-id"));
    // Health checks are not rate limited.
    assert!(!resp.headers.contains_key("x-ratelimit-limit"));

    let root = app.get("/", None).await;
    assert_eq!(root.status, StatusCode::OK);
    assert_eq!(root.json()["message"], "Nebula Console API");
    assert!(root.headers.contains_key("x-ratelimit-remaining"));
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let app = TestApp::new();
    let resp = app.get("/api/nope", None).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
    assert_eq!(resp.json()["detail"], "Not found");
}

#[tokio::test]
async fn test_security_info_only_in_development() {
    let app = TestApp::new();
    let resp = app.get("/api/security-info", None).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.json()["jwt"]["algorithm"], "HS256");

    let mut settings = common::test_settings();
    settings.server.environment = nebula_console_web::settings::Environment::Production;
    let prod = TestApp::with_settings(settings);
    let resp = prod.get("/api/security-info", None).await;
    assert_eq!(resp.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_signup_login_me_logout() {
    let app = TestApp::new();
    let token = app.user_token("alice").await;

    let me = app.get("/api/auth/me", Some(&token)).await;
    assert_eq!(me.status, StatusCode::OK);
    let body = me.json();
    assert_eq!(body["username"], "alice");
    assert_eq!(body["role"], "user");
    assert!(body.get("password_hash").is_none());

    let out = app.send(Method::POST, "/api/auth/logout", Some(&token), None).await;
    assert_eq!(out.status, StatusCode::OK);

    let me = app.get("/api/auth/me", Some(&token)).await;
    assert_eq!(me.status, StatusCode::UNAUTHORIZED);
    assert_eq!(me.json()["detail"], "Token has been revoked");
}

#[tokio::test]
async fn test_signup_rules() {
    let app = TestApp::new();
    let admin = app
        .post(
            "/api/auth/signup",
            None,
            json!({ "username": "mallory", "email": "m@example.org", "password": "Strong-Pass-1", "role": "admin" }),
        )
        .await;
    assert_eq!(admin.status, StatusCode::FORBIDDEN);

    let weak = app
        .post(
            "/api/auth/signup",
            None,
            json!({ "username": "bob", "email": "bob@example.org", "password": "password" }),
        )
        .await;
    assert_eq!(weak.status, StatusCode::BAD_REQUEST);

    app.user_token("carol").await;
    let dup = app
        .post(
            "/api/auth/signup",
            None,
            json!({ "username": "carol", "email": "other@example.org", "password": "Strong-Pass-1" }),
        )
        .await;
    assert_eq!(dup.status, StatusCode::BAD_REQUEST);
    assert_eq!(dup.json()["detail"], "Username already registered");
}

#[tokio::test]
async fn test_login_lockout() {
    let app = TestApp::new();
    let bad = json!({ "username": ADMIN_USER, "password": "wrong-password" });
    for _ in 0..4 {
        let resp = app.post("/api/auth/login", None, bad.clone()).await;
        assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    }
    let locked = app.post("/api/auth/login", None, bad).await;
    assert_eq!(locked.status, StatusCode::TOO_MANY_REQUESTS);
    assert!(locked.headers.contains_key(header::RETRY_AFTER));

    // Even the right password is refused while locked.
    let resp = app
        .post(
            "/api/auth/login",
            None,
            json!({ "username": ADMIN_USER, "password": ADMIN_PASSWORD }),
        )
        .await;
    assert_eq!(resp.status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_requires_authentication() {
    let app = TestApp::new();
    let resp = app.get("/api/certificates", None).await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    let resp = app.get("/api/certificates", Some("not-a-jwt")).await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_role_checks() {
    let app = TestApp::new();
    let user = app.user_token("dave").await;

    let ca = app
        .post("/api/certificates/ca", Some(&user), json!({ "name": "rogue-ca" }))
        .await;
    assert_eq!(ca.status, StatusCode::FORBIDDEN);
    assert_eq!(ca.json()["detail"], "Not enough permissions. Admin access required.");

    let users = app.get("/api/users", Some(&user)).await;
    assert_eq!(users.status, StatusCode::FORBIDDEN);

    let admin = app.admin_token().await;
    let users = app.get("/api/users", Some(&admin)).await;
    assert_eq!(users.status, StatusCode::OK);
    assert_eq!(users.json().as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn test_admin_cannot_delete_self() {
    let app = TestApp::new();
    let admin = app.admin_token().await;
    let me = app.get("/api/auth/me", Some(&admin)).await.json();
    let id = me["id"].as_i64().unwrap();
    let resp = app
        .send(Method::DELETE, &format!("/api/users/{}", id), Some(&admin), None)
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(resp.json()["detail"], "Cannot delete yourself");
}

#[tokio::test]
async fn test_certificate_lifecycle() {
    let app = TestApp::new();
    let admin = app.admin_token().await;
    let ca_id = app.create_ca(&admin, "office-ca").await;

    let host = app
        .post(
            "/api/certificates/sign",
            Some(&admin),
            json!({ "name": "web-01", "ca_id": ca_id, "ip_address": "192.168.100.20/24", "groups": ["servers"] }),
        )
        .await;
    assert_eq!(host.status, StatusCode::CREATED);
    let host = host.json();
    assert_eq!(host["status"], "active");
    assert_eq!(host["ip_address"], "192.168.100.20/24");
    assert!(host.get("private_key").is_none());
    let host_id = host["id"].as_i64().unwrap();

    // Same address under the same CA is taken.
    let clash = app
        .post(
            "/api/certificates/sign",
            Some(&admin),
            json!({ "name": "web-02", "ca_id": ca_id, "ip_address": "192.168.100.20/24" }),
        )
        .await;
    assert_eq!(clash.status, StatusCode::CONFLICT);

    let inspect = app
        .get(&format!("/api/certificates/{}/inspect", host_id), Some(&admin))
        .await;
    assert_eq!(inspect.status, StatusCode::OK);
    assert_eq!(inspect.json()["name"], "web-01");

    let bundle = app
        .get(&format!("/api/certificates/{}/bundle", host_id), Some(&admin))
        .await;
    assert_eq!(bundle.status, StatusCode::OK);
    assert_eq!(bundle.headers[header::CONTENT_TYPE], "application/zip");
    let archive = zip::ZipArchive::new(Cursor::new(bundle.bytes)).unwrap();
    let names: Vec<&str> = archive.file_names().collect();
    assert!(names.contains(&"web-01/host.key"));
    assert!(names.contains(&"web-01/config.yaml"));

    let revoke = app
        .send(Method::POST, &format!("/api/certificates/{}/revoke", host_id), Some(&admin), None)
        .await;
    assert_eq!(revoke.status, StatusCode::OK);

    let blocklist = app.get("/api/certificates/blocklist", Some(&admin)).await.json();
    assert_eq!(blocklist["fingerprints"][0]["name"], "web-01");
    assert!(blocklist["yaml"].as_str().unwrap().contains("blocklist:"));

    let bundle = app
        .get(&format!("/api/certificates/{}/bundle", host_id), Some(&admin))
        .await;
    assert_eq!(bundle.status, StatusCode::CONFLICT);

    // The address is free again once the holder is revoked.
    let reuse = app
        .post(
            "/api/certificates/sign",
            Some(&admin),
            json!({ "name": "web-03", "ca_id": ca_id, "ip_address": "192.168.100.20/24" }),
        )
        .await;
    assert_eq!(reuse.status, StatusCode::CREATED);

    let ca_delete = app
        .send(Method::DELETE, &format!("/api/certificates/{}", ca_id), Some(&admin), None)
        .await;
    assert_eq!(ca_delete.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_sign_with_unknown_ca() {
    let app = TestApp::new();
    let admin = app.admin_token().await;
    let resp = app
        .post(
            "/api/certificates/sign",
            Some(&admin),
            json!({ "name": "orphan", "ca_id": 999, "ip_address": "192.168.100.30/24" }),
        )
        .await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_provisioning_flow() {
    let app = TestApp::new();
    let admin = app.admin_token().await;
    let ca_id = app.create_ca(&admin, "mesh-ca").await;
    let user = app.user_token("erin").await;

    let issued = app
        .post(
            "/api/client-setup/provision",
            Some(&user),
            json!({ "device_name": "erin-laptop", "device_type": "linux", "ca_id": ca_id }),
        )
        .await;
    assert_eq!(issued.status, StatusCode::CREATED, "{:?}", issued.json());
    let issued = issued.json();
    let token = issued["token"].as_str().unwrap().to_string();
    assert!(issued["ip_address"].as_str().unwrap().starts_with("192.168.100."));
    assert_eq!(
        issued["download_url"],
        format!("/api/client-setup/download/{}", token)
    );

    let status = app
        .get("/api/client-setup/status/erin-laptop", Some(&user))
        .await
        .json();
    assert_eq!(status["status"], "pending");

    let qr = app.get(&format!("/api/client-setup/qr-code/{}", token), None).await;
    assert_eq!(qr.status, StatusCode::OK);
    assert_eq!(qr.headers[header::CONTENT_TYPE], "image/png");
    assert_eq!(&qr.bytes[..4], b"\x89PNG");

    let download = app.get(&format!("/api/client-setup/download/{}", token), None).await;
    assert_eq!(download.status, StatusCode::OK);
    assert_eq!(download.headers[header::CACHE_CONTROL], "no-store");
    let archive = zip::ZipArchive::new(Cursor::new(download.bytes)).unwrap();
    let names: Vec<&str> = archive.file_names().collect();
    assert!(names.iter().any(|n| n.ends_with("ca.crt")));
    assert!(names.iter().any(|n| n.ends_with("host.key")));
    assert!(names.iter().any(|n| n.ends_with("config.yaml")));

    let replay = app.get(&format!("/api/client-setup/download/{}", token), None).await;
    assert_eq!(replay.status, StatusCode::GONE);

    let status = app
        .get("/api/client-setup/status/erin-laptop", Some(&user))
        .await
        .json();
    assert_eq!(status["status"], "active");

    let unknown = app.get("/api/client-setup/download/not-a-real-token", None).await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);
    assert_eq!(unknown.json()["detail"], "Invalid or expired token");
}

#[tokio::test]
async fn test_provisioning_rejects_duplicate_device() {
    let app = TestApp::new();
    let admin = app.admin_token().await;
    let ca_id = app.create_ca(&admin, "dup-ca").await;
    let body = json!({ "device_name": "kiosk", "device_type": "windows", "ca_id": ca_id });

    let first = app.post("/api/client-setup/provision", Some(&admin), body.clone()).await;
    assert_eq!(first.status, StatusCode::CREATED);
    let second = app.post("/api/client-setup/provision", Some(&admin), body).await;
    assert_eq!(second.status, StatusCode::CONFLICT);

    let bad_type = app
        .post(
            "/api/client-setup/provision",
            Some(&admin),
            json!({ "device_name": "toaster", "device_type": "toaster-os", "ca_id": ca_id }),
        )
        .await;
    assert_eq!(bad_type.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cancel_pending_token() {
    let app = TestApp::new();
    let admin = app.admin_token().await;
    let ca_id = app.create_ca(&admin, "cancel-ca").await;
    let other = app.user_token("frank").await;

    let issued = app
        .post(
            "/api/client-setup/provision",
            Some(&admin),
            json!({ "device_name": "tablet", "device_type": "android", "ca_id": ca_id }),
        )
        .await
        .json();
    let id = issued["id"].as_i64().unwrap();
    let token = issued["token"].as_str().unwrap().to_string();

    let denied = app
        .send(Method::DELETE, &format!("/api/client-setup/tokens/{}", id), Some(&other), None)
        .await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);

    let cancelled = app
        .send(Method::DELETE, &format!("/api/client-setup/tokens/{}", id), Some(&admin), None)
        .await;
    assert_eq!(cancelled.status, StatusCode::NO_CONTENT);

    let download = app.get(&format!("/api/client-setup/download/{}", token), None).await;
    assert_eq!(download.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_user_login_matches_bad_password() {
    let app = TestApp::new();
    assert!(app.state.dummy_password_hash.starts_with("pbkdf2_sha256$"));

    let bad = json!({ "username": "nobody", "password": "whatever-1" });
    for _ in 0..4 {
        let resp = app.post("/api/auth/login", None, bad.clone()).await;
        assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
        assert_eq!(resp.json()["detail"], "Incorrect username or password");
    }
    let locked = app.post("/api/auth/login", None, bad).await;
    assert_eq!(locked.status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_login_with_two_factor() {
    let app = TestApp::new();
    let admin = app.admin_token().await;

    let setup = app.post("/api/auth/2fa/setup", Some(&admin), json!({})).await;
    assert_eq!(setup.status, StatusCode::OK, "{:?}", setup.json());
    let secret = setup.json()["secret"].as_str().unwrap().to_string();
    assert!(setup.json()["otpauth_uri"].as_str().unwrap().starts_with("otpauth://totp/"));
    let totp = nebula_console_web::auth::totp::totp_for_secret_b32(
        &app.state.settings.auth.totp_issuer,
        ADMIN_USER,
        &secret,
    )
    .unwrap();
    let code = || totp.generate(now_epoch_secs() as u64);

    let wrong = app.post("/api/auth/2fa/enable", Some(&admin), json!({ "code": "abcdef" })).await;
    assert_eq!(wrong.status, StatusCode::BAD_REQUEST);
    let enabled = app.post("/api/auth/2fa/enable", Some(&admin), json!({ "code": code() })).await;
    assert_eq!(enabled.status, StatusCode::OK, "{:?}", enabled.json());

    let missing = app
        .post(
            "/api/auth/login",
            None,
            json!({ "username": ADMIN_USER, "password": ADMIN_PASSWORD }),
        )
        .await;
    assert_eq!(missing.status, StatusCode::UNAUTHORIZED);
    assert_eq!(missing.json()["detail"], "Two-factor code required");

    let bad_code = app
        .post(
            "/api/auth/login",
            None,
            json!({ "username": ADMIN_USER, "password": ADMIN_PASSWORD, "totp_code": "000000x" }),
        )
        .await;
    assert_eq!(bad_code.status, StatusCode::UNAUTHORIZED);
    assert_eq!(bad_code.json()["detail"], "Incorrect username or password");

    let ok = app
        .post(
            "/api/auth/login",
            None,
            json!({ "username": ADMIN_USER, "password": ADMIN_PASSWORD, "totp_code": code() }),
        )
        .await;
    assert_eq!(ok.status, StatusCode::OK, "{:?}", ok.json());
    assert_eq!(ok.json()["user"]["totp_enabled"], true);
}

#[tokio::test]
async fn test_rate_limit_sets_retry_after() {
    let mut settings = test_settings();
    settings.server.rate_limit_per_minute = 2;
    let app = TestApp::with_settings(settings);

    for _ in 0..2 {
        let resp = app.get("/api/certificates", None).await;
        assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    }
    let limited = app.get("/api/certificates", None).await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers.contains_key(header::RETRY_AFTER));
    assert_eq!(limited.headers["x-ratelimit-remaining"], "0");
}

#[tokio::test]
async fn test_sign_refused_by_unusable_ca() {
    let app = TestApp::new();
    let admin = app.admin_token().await;
    let sign = |ca_id: i64, name: &str| {
        json!({ "name": name, "ca_id": ca_id, "ip_address": "192.168.100.50/24" })
    };

    let expired = app.create_ca(&admin, "old-ca").await;
    app.set_expires_at("certificates", expired, now_epoch_secs() - 60);
    let resp = app.post("/api/certificates/sign", Some(&admin), sign(expired, "late-01")).await;
    assert_eq!(resp.status, StatusCode::CONFLICT);

    let closing = app.create_ca(&admin, "closing-ca").await;
    app.set_expires_at("certificates", closing, now_epoch_secs() + 1800);
    let resp = app.post("/api/certificates/sign", Some(&admin), sign(closing, "late-02")).await;
    assert_eq!(resp.status, StatusCode::CONFLICT);
    assert!(resp.json()["detail"].as_str().unwrap().contains("less than an hour"));

    let revoked = app.create_ca(&admin, "pulled-ca").await;
    let resp = app
        .send(Method::POST, &format!("/api/certificates/{}/revoke", revoked), Some(&admin), None)
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    let resp = app.post("/api/certificates/sign", Some(&admin), sign(revoked, "late-03")).await;
    assert_eq!(resp.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_host_lifetime_capped_by_ca() {
    let app = TestApp::new();
    let admin = app.admin_token().await;
    let ca = app
        .post(
            "/api/certificates/ca",
            Some(&admin),
            json!({ "name": "short-ca", "duration_hours": 48, "groups": ["servers"] }),
        )
        .await;
    assert_eq!(ca.status, StatusCode::CREATED);
    let ca = ca.json();
    let ca_id = ca["id"].as_i64().unwrap();

    let too_long = app
        .post(
            "/api/certificates/sign",
            Some(&admin),
            json!({ "name": "db-01", "ca_id": ca_id, "ip_address": "192.168.100.60/24", "duration_hours": 100 }),
        )
        .await;
    assert_eq!(too_long.status, StatusCode::BAD_REQUEST);

    let clamped = app
        .post(
            "/api/certificates/sign",
            Some(&admin),
            json!({ "name": "db-01", "ca_id": ca_id, "ip_address": "192.168.100.60/24", "groups": ["servers"] }),
        )
        .await;
    assert_eq!(clamped.status, StatusCode::CREATED, "{:?}", clamped.json());
    let clamped = clamped.json();
    assert!(clamped["expires_at"].as_i64().unwrap() <= ca["expires_at"].as_i64().unwrap());
    assert!(clamped["duration_hours"].as_i64().unwrap() <= 48);

    let foreign_group = app
        .post(
            "/api/certificates/sign",
            Some(&admin),
            json!({ "name": "db-02", "ca_id": ca_id, "ip_address": "192.168.100.61/24", "groups": ["other"] }),
        )
        .await;
    assert_eq!(foreign_group.status, StatusCode::BAD_REQUEST);
    assert!(foreign_group.json()["detail"].as_str().unwrap().contains("other"));
}

#[tokio::test]
async fn test_revoking_ca_cascades_once() {
    let app = TestApp::new();
    let admin = app.admin_token().await;
    let ca_id = app.create_ca(&admin, "branch-ca").await;
    let host = app
        .post(
            "/api/certificates/sign",
            Some(&admin),
            json!({ "name": "branch-01", "ca_id": ca_id, "ip_address": "192.168.100.70/24" }),
        )
        .await
        .json();
    let host_id = host["id"].as_i64().unwrap();

    let revoke = app
        .send(Method::POST, &format!("/api/certificates/{}/revoke", ca_id), Some(&admin), None)
        .await;
    assert_eq!(revoke.status, StatusCode::OK);
    let ids: Vec<i64> = revoke.json()["revoked_ids"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_i64())
        .collect();
    assert!(ids.contains(&ca_id));
    assert!(ids.contains(&host_id));

    let host = app.get(&format!("/api/certificates/{}", host_id), Some(&admin)).await;
    assert_eq!(host.json()["status"], "revoked");

    // Only the host shows up in the blocklist.
    let blocklist = app.get("/api/certificates/blocklist", Some(&admin)).await.json();
    let names: Vec<&str> = blocklist["fingerprints"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["name"].as_str())
        .collect();
    assert_eq!(names, vec!["branch-01"]);

    let again = app
        .send(Method::POST, &format!("/api/certificates/{}/revoke", ca_id), Some(&admin), None)
        .await;
    assert_eq!(again.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_refused_certificate_actions_are_audited() {
    let app = TestApp::new();
    let admin = app.admin_token().await;
    let ca_id = app.create_ca(&admin, "audit-ca").await;
    let host = app
        .post(
            "/api/certificates/sign",
            Some(&admin),
            json!({ "name": "audit-01", "ca_id": ca_id, "ip_address": "192.168.100.80/24" }),
        )
        .await
        .json();
    let host_id = host["id"].as_i64().unwrap();
    let user = app.user_token("gina").await;
    let (token_id, _) = app.provision(&admin, ca_id, "audit-tablet").await;

    let (_guard, logs) = capture_logs();

    let missing = app
        .send(Method::POST, "/api/certificates/9999/revoke", Some(&admin), None)
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    let in_use = app
        .send(Method::DELETE, &format!("/api/certificates/{}", ca_id), Some(&admin), None)
        .await;
    assert_eq!(in_use.status, StatusCode::CONFLICT);

    let foreign = app
        .get(&format!("/api/certificates/{}/bundle", host_id), Some(&user))
        .await;
    assert_eq!(foreign.status, StatusCode::FORBIDDEN);

    let not_owner = app
        .send(Method::DELETE, &format!("/api/client-setup/tokens/{}", token_id), Some(&user), None)
        .await;
    assert_eq!(not_owner.status, StatusCode::FORBIDDEN);

    let logs = logs.contents();
    assert!(logs.contains("revoke certificate 9999 failed"), "{}", logs);
    assert!(logs.contains(&format!("delete certificate {} failed", ca_id)), "{}", logs);
    assert!(logs.contains("download certificate audit-01 failed"), "{}", logs);
    assert!(logs.contains("cancel provision_token audit-tablet failed"), "{}", logs);
}

#[tokio::test]
async fn test_concurrent_signing_never_shares_an_address() {
    let app = TestApp::new();
    let admin = app.admin_token().await;
    let ca_id = app.create_ca(&admin, "race-ca").await;
    app.tool.set_sign_delay(Duration::from_millis(50));

    let first = SignHostRequest {
        name: "race-01".to_string(),
        ca_id,
        ip_address: "192.168.100.90/24".to_string(),
        groups: vec![],
        subnets: vec![],
        duration_hours: None,
    };
    let second = SignHostRequest {
        name: "race-02".to_string(),
        ..first.clone()
    };
    let (a, b) = tokio::join!(
        app.state.certificates.sign_host(&first, None),
        app.state.certificates.sign_host(&second, None),
    );
    assert!(a.is_ok(), "{:?}", a);
    assert!(matches!(b, Err(Error::Conflict(_))), "{:?}", b);
}

#[tokio::test]
async fn test_token_address_not_taken_while_signing() {
    let app = TestApp::new();
    let admin = app.admin_token().await;
    let ca_id = app.create_ca(&admin, "hold-ca").await;
    let user = app.state.users.get_by_username(ADMIN_USER).unwrap().unwrap();

    let sign = SignHostRequest {
        name: "hold-01".to_string(),
        ca_id,
        ip_address: "192.168.100.91/24".to_string(),
        groups: vec![],
        subnets: vec![],
        duration_hours: None,
    };
    app.tool.set_sign_delay(Duration::from_millis(50));
    let issue = nebula_console_web::provision::service::ProvisionRequest {
        device_name: "hold-laptop".to_string(),
        device_type: "linux".to_string(),
        ip_address: Some("192.168.100.91/24".to_string()),
        ca_id,
        groups: vec![],
        auto_connect: true,
    };
    let (signed, issued) = tokio::join!(
        app.state.certificates.sign_host(&sign, None),
        app.state.provisioning.issue(&issue, &user),
    );
    assert!(signed.is_ok(), "{:?}", signed);
    assert!(matches!(issued, Err(Error::Conflict(_))), "{:?}", issued.err());
}

#[tokio::test]
async fn test_expired_token_is_gone() {
    let app = TestApp::new();
    let admin = app.admin_token().await;
    let ca_id = app.create_ca(&admin, "stale-ca").await;
    let (id, token) = app.provision(&admin, ca_id, "stale-phone").await;
    app.set_expires_at("provision_tokens", id, now_epoch_secs() - 1);

    let status = app.get("/api/client-setup/status/stale-phone", Some(&admin)).await;
    assert_eq!(status.json()["status"], "expired");

    let gone = app.get(&format!("/api/client-setup/download/{}", token), None).await;
    assert_eq!(gone.status, StatusCode::GONE);
    assert_eq!(gone.json()["detail"], "Token expired");

    // Expired tokens are dropped once seen.
    let again = app.get(&format!("/api/client-setup/download/{}", token), None).await;
    assert_eq!(again.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_failed_signing_releases_token() {
    let app = TestApp::new();
    let admin = app.admin_token().await;
    let ca_id = app.create_ca(&admin, "flaky-ca").await;
    let (_, token) = app.provision(&admin, ca_id, "flaky-laptop").await;

    app.tool.set_fail_signing(true);
    let failed = app.get(&format!("/api/client-setup/download/{}", token), None).await;
    assert_eq!(failed.status, StatusCode::BAD_GATEWAY);
    assert!(!failed.json()["detail"].as_str().unwrap().contains("ca.key"));

    let status = app.get("/api/client-setup/status/flaky-laptop", Some(&admin)).await;
    assert_eq!(status.json()["status"], "pending");

    app.tool.set_fail_signing(false);
    let retry = app.get(&format!("/api/client-setup/download/{}", token), None).await;
    assert_eq!(retry.status, StatusCode::OK);
}

#[tokio::test]
async fn test_abandoned_download_keeps_token() {
    let app = TestApp::new();
    let admin = app.admin_token().await;
    let ca_id = app.create_ca(&admin, "slow-ca").await;
    let (_, token) = app.provision(&admin, ca_id, "slow-laptop").await;

    app.tool.set_sign_delay(Duration::from_millis(500));
    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        app.state.provisioning.download(&token),
    )
    .await;
    assert!(abandoned.is_err());

    let status = app.get("/api/client-setup/status/slow-laptop", Some(&admin)).await;
    assert_eq!(status.json()["status"], "pending");

    app.tool.set_sign_delay(Duration::ZERO);
    let download = app.get(&format!("/api/client-setup/download/{}", token), None).await;
    assert_eq!(download.status, StatusCode::OK);
    let status = app.get("/api/client-setup/status/slow-laptop", Some(&admin)).await;
    assert_eq!(status.json()["status"], "active");
}
