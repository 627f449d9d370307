//! HS256 access tokens

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use nebula_console_common::{now_epoch_secs, Error, Result, Role, UserRecord};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Username
    pub sub: String,
    pub uid: i64,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
    /// Token id, used for logout revocation
    pub jti: String,
}

pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: i64,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl_minutes: i64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 30;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl_secs: ttl_minutes.max(1) * 60,
        }
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    /// Issue a token for a user
    pub fn issue(&self, user: &UserRecord) -> Result<(String, Claims)> {
        let now = now_epoch_secs();
        let claims = Claims {
            sub: user.username.clone(),
            uid: user.id,
            role: user.role,
            iat: now,
            exp: now + self.ttl_secs,
            jti: uuid::Uuid::new_v4().simple().to_string(),
        };
        let token = self.encode(&claims)?;
        Ok((token, claims))
    }

    fn encode(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("Failed to sign token: {}", e)))
    }

    /// Validate signature and expiry
    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| Error::Unauthorized(format!("Could not validate credentials: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserRecord {
        UserRecord {
            id: 3,
            username: "alice".to_string(),
            email: "alice@example.org".to_string(),
            password_hash: String::new(),
            role: Role::User,
            is_active: true,
            totp_enabled: false,
            totp_secret: None,
            created_at: 0,
            updated_at: 0,
            last_login: None,
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let issuer = TokenIssuer::new("test-secret", 60);
        let (token, claims) = issuer.issue(&user()).unwrap();
        assert_eq!(claims.exp - claims.iat, 3600);
        let verified = issuer.verify(&token).unwrap();
        assert_eq!(verified, claims);
        assert_eq!(verified.role, Role::User);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let (token, _) = TokenIssuer::new("secret-a", 60).issue(&user()).unwrap();
        assert!(matches!(
            TokenIssuer::new("secret-b", 60).verify(&token),
            Err(Error::Unauthorized(_))
        ));
        assert!(TokenIssuer::new("secret-a", 60).verify("not.a.token").is_err());
    }

    #[test]
    fn test_expired_rejected() {
        let issuer = TokenIssuer::new("test-secret", 60);
        let now = now_epoch_secs();
        let claims = Claims {
            sub: "alice".to_string(),
            uid: 3,
            role: Role::User,
            iat: now - 7200,
            exp: now - 3600,
            jti: "old".to_string(),
        };
        let token = issuer.encode(&claims).unwrap();
        assert!(issuer.verify(&token).is_err());
    }

    #[test]
    fn test_unique_token_ids() {
        let issuer = TokenIssuer::new("test-secret", 60);
        let (_, a) = issuer.issue(&user()).unwrap();
        let (_, b) = issuer.issue(&user()).unwrap();
        assert_ne!(a.jti, b.jti);
    }
}
