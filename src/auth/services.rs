use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    auth::{
        dto::Profile,
        password::{hash_password_blocking, verify_password_blocking},
        repo::{RepoError, User, UserRepo},
        tokens::{new_opaque_token, SessionClaims, TokenIssuer},
    },
    error::ApiError,
    journal::JournalError,
    notify::{outbox::Outbox, EmailMessage},
};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn normalize_email(email: &str) -> Option<String> {
    let email = email.trim().to_lowercase();
    is_valid_email(&email).then_some(email)
}

fn user_write_failed(source: JournalError) -> ApiError {
    ApiError::Persistence {
        what: "user",
        source,
    }
}

impl From<User> for Profile {
    fn from(u: User) -> Self {
        Self {
            email: u.email,
            joined: u.joined,
            profile_picture: u.profile_picture,
            id: u.id,
            pastes: u.pastes,
        }
    }
}

pub struct LoginOutcome {
    pub token: String,
    pub profile_picture: Option<String>,
}

/// Registration, verification, login, profile and password reset.
#[derive(Clone)]
pub struct CredentialStore {
    users: Arc<UserRepo>,
    tokens: TokenIssuer,
    outbox: Arc<Outbox>,
    public_url: Arc<str>,
}

impl CredentialStore {
    pub fn new(
        users: Arc<UserRepo>,
        tokens: TokenIssuer,
        outbox: Arc<Outbox>,
        public_url: &str,
    ) -> Self {
        Self {
            users,
            tokens,
            outbox,
            public_url: Arc::from(public_url.trim_end_matches('/')),
        }
    }

    /// Creates an unverified user and queues the verification email. Registering
    /// again before verifying replaces the password and sends a new link; the
    /// old link stops working. If the email cannot be queued the user still
    /// exists and the call fails.
    pub async fn register(&self, email: &str, password: &str) -> Result<(), ApiError> {
        let email = normalize_email(email).ok_or_else(|| {
            warn!("register with invalid email");
            ApiError::InvalidEmail
        })?;
        if password.is_empty() {
            return Err(ApiError::EmptyPassword);
        }
        // Cheap early exit; the authoritative check happens under the repo lock.
        if self
            .users
            .find_by_email(&email)
            .await
            .is_some_and(|u| u.verified)
        {
            warn!(email = %email, "email already registered");
            return Err(ApiError::DuplicateEmail);
        }

        let hash = hash_password_blocking(password.to_string()).await?;
        let token = new_opaque_token();
        let user = self
            .users
            .register(&email, hash, token.clone(), OffsetDateTime::now_utc())
            .await
            .map_err(|e| match e {
                RepoError::DuplicateEmail => {
                    warn!(email = %email, "email already registered");
                    ApiError::DuplicateEmail
                }
                RepoError::Journal(source) => user_write_failed(source),
            })?;

        let link = format!("{}/verify-email?token={}", self.public_url, token);
        self.outbox
            .enqueue(EmailMessage::verification(&user.email, &link))
            .await
            .map_err(|source| ApiError::MailDispatch {
                kind: "verification",
                source,
            })?;

        info!(user_id = %user.id, email = %user.email, "user registered");
        Ok(())
    }

    pub async fn verify_email(&self, token: &str) -> Result<(), ApiError> {
        let user = self
            .users
            .verify_email(token)
            .await
            .map_err(user_write_failed)?
            .ok_or(ApiError::TokenNotFound)?;
        info!(user_id = %user.id, "email verified");
        Ok(())
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, ApiError> {
        let email = normalize_email(email).ok_or(ApiError::InvalidCredentials)?;
        let Some(user) = self.users.find_by_email(&email).await else {
            warn!(email = %email, "login unknown email");
            return Err(ApiError::InvalidCredentials);
        };

        let ok = verify_password_blocking(password.to_string(), user.password_hash.clone()).await?;
        if !ok {
            warn!(email = %email, user_id = %user.id, "login invalid password");
            return Err(ApiError::InvalidCredentials);
        }
        if !user.verified {
            warn!(user_id = %user.id, "login before verification");
            return Err(ApiError::EmailNotVerified);
        }

        let token = self.tokens.issue_session(&user.email, &user.id)?;
        info!(user_id = %user.id, "user logged in");
        Ok(LoginOutcome {
            token,
            profile_picture: user.profile_picture,
        })
    }

    pub fn authenticate(&self, session_token: &str) -> Result<SessionClaims, ApiError> {
        self.tokens.validate_session(session_token).map_err(|e| {
            debug!(error = %e, "session rejected");
            ApiError::Unauthorized
        })
    }

    pub async fn get_profile(&self, session_token: &str) -> Result<Profile, ApiError> {
        let claims = self.authenticate(session_token)?;
        self.users
            .find_by_email(&claims.email)
            .await
            .map(Profile::from)
            .ok_or_else(|| {
                warn!(user_id = %claims.user_id, "session for a missing user");
                ApiError::UserNotFound
            })
    }

    pub async fn set_profile_picture(
        &self,
        session_token: &str,
        blob_ref: &str,
    ) -> Result<String, ApiError> {
        let claims = self.authenticate(session_token)?;
        let user = self
            .users
            .set_profile_picture(&claims.email, blob_ref)
            .await
            .map_err(user_write_failed)?
            .ok_or(ApiError::UserNotFound)?;
        info!(user_id = %user.id, "profile picture updated");
        Ok(blob_ref.to_string())
    }

    /// Issues a fresh reset token (invalidating any earlier one) and queues the reset email.
    pub async fn request_password_reset(&self, email: &str) -> Result<(), ApiError> {
        let email = normalize_email(email).ok_or(ApiError::EmailNotFound)?;
        let token = new_opaque_token();
        let user = self
            .users
            .set_reset_token(&email, token.clone())
            .await
            .map_err(user_write_failed)?
            .ok_or_else(|| {
                warn!(email = %email, "reset requested for unknown email");
                ApiError::EmailNotFound
            })?;

        let link = format!("{}/reset-password?token={}", self.public_url, token);
        self.outbox
            .enqueue(EmailMessage::password_reset(&user.email, &link))
            .await
            .map_err(|source| ApiError::MailDispatch {
                kind: "reset",
                source,
            })?;

        info!(user_id = %user.id, "password reset requested");
        Ok(())
    }

    /// The token is checked before the password so unknown tokens never pay for a hash.
    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), ApiError> {
        if self.users.find_by_reset_token(token).await.is_none() {
            warn!("reset with unknown token");
            return Err(ApiError::InvalidToken);
        }
        if new_password.is_empty() {
            return Err(ApiError::EmptyPassword);
        }
        let hash = hash_password_blocking(new_password.to_string()).await?;
        // Another reset may have consumed the token while hashing.
        let user = self
            .users
            .consume_reset_token(token, hash)
            .await
            .map_err(user_write_failed)?
            .ok_or(ApiError::InvalidToken)?;
        info!(user_id = %user.id, "password reset");
        Ok(())
    }

    pub async fn user_count(&self) -> usize {
        self.users.len().await
    }
}
