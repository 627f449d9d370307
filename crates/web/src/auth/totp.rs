//! TOTP second factor (Google Authenticator compatible)

use data_encoding::BASE32_NOPAD;
use nebula_console_common::crypto::constant_time_eq;
use nebula_console_common::{Error, Result};
use qrcode::{render::svg, QrCode};
use totp_rs::{Algorithm as TotpAlgorithm, Secret, TOTP};

const STEP_SECS: i64 = 30;

/// 20 random bytes as unpadded base32
pub fn generate_secret_b32() -> String {
    let raw: [u8; 20] = rand::random();
    BASE32_NOPAD.encode(&raw)
}

pub fn totp_for_secret_b32(issuer: &str, label: &str, secret_b32: &str) -> Result<TOTP> {
    let secret = Secret::Encoded(secret_b32.to_string())
        .to_bytes()
        .map_err(|e| Error::Crypto(format!("Invalid TOTP secret: {:?}", e)))?;
    TOTP::new(
        TotpAlgorithm::SHA1,
        6,
        1,
        STEP_SECS as u64,
        secret,
        Some(issuer.to_string()),
        label.to_string(),
    )
    .map_err(|e| Error::Crypto(format!("Invalid TOTP parameters: {}", e)))
}

/// Accept the current step and one step either side for clock skew.
pub fn verify_code(totp: &TOTP, code: &str, now: i64) -> bool {
    let code = code.trim();
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    for offset in [-STEP_SECS, 0, STEP_SECS] {
        let expected = totp.generate((now + offset).max(0) as u64);
        if constant_time_eq(expected.as_bytes(), code.as_bytes()) {
            return true;
        }
    }
    false
}

/// SVG QR code of an otpauth URI
pub fn qr_svg(otpauth_uri: &str) -> Result<String> {
    let code = QrCode::new(otpauth_uri.as_bytes())
        .map_err(|e| Error::Internal(format!("QR encoding failed: {}", e)))?;
    Ok(code.render::<svg::Color>().min_dimensions(220, 220).build())
}
