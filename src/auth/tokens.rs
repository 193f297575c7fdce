use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::config::JwtConfig;

/// Sessions expire exactly one hour after issuance.
pub const SESSION_TTL: Duration = Duration::hours(1);

/// 160 bits; collisions between outstanding tokens are not checked.
const OPAQUE_TOKEN_BYTES: usize = 20;
/// 64 bits; stores check-and-retry on insert.
const RECORD_ID_BYTES: usize = 8;

/// Random token for verification and reset links, as lowercase hex.
pub fn new_opaque_token() -> String {
    random_hex(OPAQUE_TOKEN_BYTES)
}

/// Random identifier for users and pastes, as lowercase hex.
pub fn new_record_id() -> String {
    random_hex(RECORD_ID_BYTES)
}

fn random_hex(len: usize) -> String {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// JWT payload of a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,   // user ID
    pub email: String, // user email
    pub iat: i64,      // issued at (unix timestamp)
    pub exp: i64,      // expires at (unix timestamp)
    pub iss: String,
    pub aud: String,
}

/// Identity asserted by a valid session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClaims {
    pub email: String,
    pub user_id: String,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("session token expired")]
    Expired,
}

/// Signs and validates session tokens. The key is fixed for the process lifetime.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
}

impl TokenIssuer {
    pub fn new(cfg: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
        }
    }

    pub fn issue_session(&self, email: &str, user_id: &str) -> anyhow::Result<String> {
        self.issue_session_at(email, user_id, OffsetDateTime::now_utc())
    }

    pub fn issue_session_at(
        &self,
        email: &str,
        user_id: &str,
        now: OffsetDateTime,
    ) -> anyhow::Result<String> {
        let exp = now + SESSION_TTL;
        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_string(),
            iat: now.unix_timestamp(),
            exp: exp.unix_timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        debug!(user_id = %user_id, "session signed");
        Ok(token)
    }

    pub fn validate_session(&self, token: &str) -> Result<SessionClaims, SessionError> {
        self.validate_session_at(token, OffsetDateTime::now_utc())
    }

    /// Rejects bad signatures, foreign issuer/audience, and any `now` at or past `exp`.
    pub fn validate_session_at(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<SessionClaims, SessionError> {
        let mut validation = Validation::default();
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        // Expiry is checked below against the caller's clock, with no leeway.
        validation.validate_exp = false;
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        if now.unix_timestamp() >= data.claims.exp {
            return Err(SessionError::Expired);
        }
        debug!(user_id = %data.claims.sub, "session verified");
        Ok(SessionClaims {
            email: data.claims.email,
            user_id: data.claims.sub,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer(secret: &str, iss: &str, aud: &str) -> TokenIssuer {
        TokenIssuer::new(&JwtConfig {
            secret: secret.into(),
            issuer: iss.into(),
            audience: aud.into(),
        })
    }

    fn keys() -> TokenIssuer {
        issuer("dev-secret", "test-issuer", "test-aud")
    }

    #[test]
    fn opaque_tokens_are_fixed_length_lowercase_hex() {
        let a = new_opaque_token();
        let b = new_opaque_token();
        assert_eq!(a.len(), 40);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);

        let id = new_record_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn sign_and_validate_session() {
        let keys = keys();
        let token = keys.issue_session("a@b.com", "abc123").expect("sign");
        let claims = keys.validate_session(&token).expect("validate");
        assert_eq!(
            claims,
            SessionClaims {
                email: "a@b.com".into(),
                user_id: "abc123".into(),
            }
        );
    }

    #[test]
    fn session_valid_for_one_hour() {
        let keys = keys();
        let t = OffsetDateTime::now_utc();
        let token = keys.issue_session_at("a@b.com", "id1", t).unwrap();

        assert!(keys
            .validate_session_at(&token, t + Duration::minutes(59))
            .is_ok());
        assert!(matches!(
            keys.validate_session_at(&token, t + Duration::minutes(60)),
            Err(SessionError::Expired)
        ));
        assert!(matches!(
            keys.validate_session_at(&token, t + Duration::minutes(61)),
            Err(SessionError::Expired)
        ));
    }

    #[test]
    fn validate_rejects_other_secret() {
        let token = keys().issue_session("a@b.com", "id1").unwrap();
        let other = issuer("another-secret", "test-issuer", "test-aud");
        assert!(matches!(
            other.validate_session(&token),
            Err(SessionError::Invalid(_))
        ));
    }

    #[test]
    fn validate_rejects_wrong_issuer_or_audience() {
        let token = keys().issue_session("a@b.com", "id1").unwrap();
        let bad = issuer("dev-secret", "bad-iss", "bad-aud");
        assert!(bad.validate_session(&token).is_err());
    }

    #[test]
    fn validate_rejects_tampered_token() {
        let keys = keys();
        let mut token = keys.issue_session("a@b.com", "id1").unwrap();
        token.push('x');
        assert!(keys.validate_session(&token).is_err());
        assert!(keys.validate_session("not-a-jwt").is_err());
    }
}
