use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    auth::tokens::new_record_id,
    journal::{Journal, JournalError},
};

/// Journals shorter than this are never compacted.
const COMPACT_MIN_ENTRIES: usize = 64;

/// User record as persisted in `users.jsonl`. Never serialized to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub password_hash: String, // argon2id PHC string
    pub verified: bool,
    pub verification_token: Option<String>,
    pub reset_token: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub joined: OffsetDateTime,
    pub profile_picture: Option<String>,
    #[serde(default)]
    pub pastes: Vec<String>,
}

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("email already registered")]
    DuplicateEmail,
    #[error(transparent)]
    Journal(#[from] JournalError),
}

struct UserState {
    by_id: HashMap<String, User>,
    by_email: HashMap<String, String>,
    by_verification: HashMap<String, String>,
    by_reset: HashMap<String, String>,
    journal: Journal,
}

impl UserState {
    fn index(&mut self, user: User) {
        if let Some(prev) = self.by_id.get(&user.id) {
            if let Some(t) = &prev.verification_token {
                if user.verification_token.as_ref() != Some(t) {
                    self.by_verification.remove(t);
                }
            }
            if let Some(t) = &prev.reset_token {
                if user.reset_token.as_ref() != Some(t) {
                    self.by_reset.remove(t);
                }
            }
        }
        self.by_email.insert(user.email.clone(), user.id.clone());
        if let Some(t) = &user.verification_token {
            self.by_verification.insert(t.clone(), user.id.clone());
        }
        if let Some(t) = &user.reset_token {
            self.by_reset.insert(t.clone(), user.id.clone());
        }
        self.by_id.insert(user.id.clone(), user);
    }

    /// Journal first: a change is visible only once it is durable.
    async fn persist(&mut self, user: User) -> Result<(), JournalError> {
        self.journal.append(&user).await?;
        self.index(user);
        Ok(())
    }

    async fn update<F>(&mut self, id: Option<String>, f: F) -> Result<Option<User>, JournalError>
    where
        F: FnOnce(&mut User),
    {
        let Some(mut user) = id.and_then(|id| self.by_id.get(&id).cloned()) else {
            return Ok(None);
        };
        f(&mut user);
        self.persist(user.clone()).await?;
        Ok(Some(user))
    }

    async fn insert(
        &mut self,
        email: &str,
        password_hash: String,
        verification_token: String,
        joined: OffsetDateTime,
    ) -> Result<User, JournalError> {
        let id = loop {
            let id = new_record_id();
            if !self.by_id.contains_key(&id) {
                break id;
            }
        };
        let user = User {
            id,
            email: email.to_string(),
            password_hash,
            verified: false,
            verification_token: Some(verification_token),
            reset_token: None,
            joined,
            profile_picture: None,
            pastes: Vec::new(),
        };
        self.persist(user.clone()).await?;
        Ok(user)
    }

    async fn maybe_compact(&mut self) -> Result<(), JournalError> {
        let entries = self.journal.entries();
        if entries < COMPACT_MIN_ENTRIES || entries <= self.by_id.len() * 2 {
            return Ok(());
        }
        let mut users: Vec<&User> = self.by_id.values().collect();
        users.sort_by_key(|u| u.joined);
        self.journal.compact(users).await
    }
}

/// In-memory user table backed by an append-only journal. Every operation
/// runs under one lock, so check-then-write sequences cannot interleave.
pub struct UserRepo {
    state: Mutex<UserState>,
}

impl UserRepo {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let (journal, records) = Journal::open::<User>(path).await?;
        let mut state = UserState {
            by_id: HashMap::new(),
            by_email: HashMap::new(),
            by_verification: HashMap::new(),
            by_reset: HashMap::new(),
            journal,
        };
        // Later records supersede earlier ones for the same id.
        for user in records {
            state.index(user);
        }
        state.maybe_compact().await?;
        info!(
            path = %state.journal.path().display(),
            users = state.by_id.len(),
            "users loaded"
        );
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Inserts a new unverified user, or, if `email` belongs to a user who never
    /// verified, replaces that user's password and verification token. Earlier
    /// verification tokens stop working. Fails if the email is verified.
    pub async fn register(
        &self,
        email: &str,
        password_hash: String,
        verification_token: String,
        joined: OffsetDateTime,
    ) -> Result<User, RepoError> {
        let mut state = self.state.lock().await;
        let existing = state
            .by_email
            .get(email)
            .and_then(|id| state.by_id.get(id))
            .cloned();
        match existing {
            Some(user) if user.verified => Err(RepoError::DuplicateEmail),
            Some(mut user) => {
                user.password_hash = password_hash;
                user.verification_token = Some(verification_token);
                state.persist(user.clone()).await?;
                Ok(user)
            }
            None => Ok(state
                .insert(email, password_hash, verification_token, joined)
                .await?),
        }
    }

    pub async fn find_by_email(&self, email: &str) -> Option<User> {
        let state = self.state.lock().await;
        state
            .by_email
            .get(email)
            .and_then(|id| state.by_id.get(id))
            .cloned()
    }

    pub async fn find_by_reset_token(&self, token: &str) -> Option<User> {
        let state = self.state.lock().await;
        state
            .by_reset
            .get(token)
            .and_then(|id| state.by_id.get(id))
            .cloned()
    }

    /// Marks the token's owner verified. The token is kept, so repeating the
    /// call succeeds again.
    pub async fn verify_email(&self, token: &str) -> Result<Option<User>, JournalError> {
        let mut state = self.state.lock().await;
        let id = state.by_verification.get(token).cloned();
        if let Some(user) = id.as_ref().and_then(|id| state.by_id.get(id)) {
            if user.verified {
                return Ok(Some(user.clone()));
            }
        }
        state.update(id, |u| u.verified = true).await
    }

    /// Replaces any pending reset token for `email`.
    pub async fn set_reset_token(
        &self,
        email: &str,
        token: String,
    ) -> Result<Option<User>, JournalError> {
        let mut state = self.state.lock().await;
        let id = state.by_email.get(email).cloned();
        state.update(id, |u| u.reset_token = Some(token)).await
    }

    /// Sets a new password hash and clears the reset token in one step.
    pub async fn consume_reset_token(
        &self,
        token: &str,
        password_hash: String,
    ) -> Result<Option<User>, JournalError> {
        let mut state = self.state.lock().await;
        let id = state.by_reset.get(token).cloned();
        state
            .update(id, |u| {
                u.password_hash = password_hash;
                u.reset_token = None;
            })
            .await
    }

    pub async fn set_profile_picture(
        &self,
        email: &str,
        url: &str,
    ) -> Result<Option<User>, JournalError> {
        let mut state = self.state.lock().await;
        let id = state.by_email.get(email).cloned();
        state
            .update(id, |u| u.profile_picture = Some(url.to_string()))
            .await
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.by_id.len()
    }
}
