use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

use crate::{journal::JournalError, notify::outbox::OutboxError};

/// Failures surfaced to HTTP clients. Client errors carry their message in the
/// body; server errors are logged and answered with a fixed message.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid email.")]
    InvalidEmail,
    #[error("Password must not be empty.")]
    EmptyPassword,
    #[error("Email is already registered.")]
    DuplicateEmail,
    #[error("Invalid credentials.")]
    InvalidCredentials,
    #[error("Email not verified.")]
    EmailNotVerified,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("User not found.")]
    UserNotFound,
    #[error("Verification token not found.")]
    TokenNotFound,
    #[error("Invalid token.")]
    InvalidToken,
    #[error("Paste not found.")]
    PasteNotFound,
    #[error("Email not found.")]
    EmailNotFound,
    #[error("Unsupported image type.")]
    UnsupportedImage,
    #[error("profilePicture file is required.")]
    MissingUpload,
    /// Malformed or oversized multipart body; status comes from axum.
    #[error("{}", .0.body_text())]
    Upload(#[from] MultipartError),
    #[error("Error sending {kind} email.")]
    MailDispatch {
        kind: &'static str,
        #[source]
        source: OutboxError,
    },
    #[error("Failed to save {what}.")]
    Persistence {
        what: &'static str,
        #[source]
        source: JournalError,
    },
    #[error("Internal Server Error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidEmail
            | Self::EmptyPassword
            | Self::DuplicateEmail
            | Self::UnsupportedImage
            | Self::MissingUpload => StatusCode::BAD_REQUEST,
            Self::Upload(e) => e.status(),
            Self::InvalidCredentials | Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::EmailNotVerified => StatusCode::FORBIDDEN,
            Self::UserNotFound
            | Self::TokenNotFound
            | Self::InvalidToken
            | Self::PasteNotFound
            | Self::EmailNotFound => StatusCode::NOT_FOUND,
            Self::MailDispatch { .. } | Self::Persistence { .. } | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            Self::MailDispatch { source, .. } => error!(error = %source, "mail dispatch failed"),
            Self::Persistence { source, .. } => error!(error = %source, "persistence failed"),
            Self::Internal(err) => error!(error = ?err, "internal error"),
            Self::Upload(e) => warn!(error = %e, "multipart upload rejected"),
            _ => {}
        }
        (status, self.to_string()).into_response()
    }
}
