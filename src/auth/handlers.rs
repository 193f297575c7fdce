use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    routing::{get, post},
    Json, Router,
};
use tracing::instrument;

use crate::{
    auth::{
        dto::{
            LoginRequest, LoginResponse, PasswordResetRequest, Profile, ProfilePictureResponse,
            RegisterRequest, ResetPasswordRequest, VerifyEmailQuery,
        },
        extractors::BearerToken,
    },
    error::ApiError,
    images::services::{upload_profile_picture, UploadItem},
    state::AppState,
};

/// Upper bound for a profile picture upload.
const MAX_PICTURE_BYTES: usize = 5 * 1024 * 1024;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/api/register", post(register))
        .route("/verify-email", get(verify_email))
        .route("/api/login", post(login))
        .route("/api/password-reset-request", post(request_password_reset))
        .route("/api/reset-password", post(reset_password))
}

pub fn profile_routes() -> Router<AppState> {
    Router::new().route("/api/profile", get(get_profile)).route(
        "/api/uploadProfilePicture",
        post(upload_picture).layer(DefaultBodyLimit::max(MAX_PICTURE_BYTES)),
    )
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<&'static str, ApiError> {
    state
        .credentials
        .register(&payload.email, &payload.password)
        .await?;
    Ok("Registration successful. Please check your email to verify.")
}

#[instrument(skip(state, query))]
pub async fn verify_email(
    State(state): State<AppState>,
    Query(query): Query<VerifyEmailQuery>,
) -> Result<&'static str, ApiError> {
    let token = query.token.ok_or(ApiError::TokenNotFound)?;
    state.credentials.verify_email(&token).await?;
    Ok("Email verified successfully.")
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let outcome = state
        .credentials
        .login(&payload.email, &payload.password)
        .await?;
    Ok(Json(LoginResponse {
        token: outcome.token,
        profile_picture: outcome.profile_picture,
    }))
}

#[instrument(skip(state, token))]
pub async fn get_profile(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<Json<Profile>, ApiError> {
    Ok(Json(state.credentials.get_profile(&token).await?))
}

/// POST /api/uploadProfilePicture (multipart)
/// Field: profilePicture, a single image file.
#[instrument(skip(state, token, mp))]
pub async fn upload_picture(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    mut mp: Multipart,
) -> Result<Json<ProfilePictureResponse>, ApiError> {
    let mut file = None;
    while let Some(field) = mp.next_field().await? {
        if field.name() != Some("profilePicture") {
            continue;
        }
        let content_type = field
            .content_type()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "application/octet-stream".into());
        let data = field.bytes().await?;
        file = Some((data, content_type));
        break;
    }
    let (body, content_type) = file.ok_or(ApiError::MissingUpload)?;

    let profile_picture = upload_profile_picture(
        &state,
        &token,
        UploadItem {
            body,
            content_type: &content_type,
        },
    )
    .await?;
    Ok(Json(ProfilePictureResponse { profile_picture }))
}

#[instrument(skip(state, payload))]
pub async fn request_password_reset(
    State(state): State<AppState>,
    Json(payload): Json<PasswordResetRequest>,
) -> Result<&'static str, ApiError> {
    state
        .credentials
        .request_password_reset(&payload.email)
        .await?;
    Ok("Password reset email sent. Please check your email.")
}

#[instrument(skip(state, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<&'static str, ApiError> {
    state
        .credentials
        .reset_password(&payload.token, &payload.new_password)
        .await?;
    Ok("Password reset successful.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    #[test]
    fn login_response_uses_wire_names() {
        let json = serde_json::to_value(LoginResponse {
            token: "t".into(),
            profile_picture: None,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"token": "t", "profilePicture": null}));
    }

    #[test]
    fn profile_serializes_camel_case_with_rfc3339() {
        let profile = Profile {
            email: "a@b.com".into(),
            joined: OffsetDateTime::UNIX_EPOCH,
            profile_picture: Some("/uploads/x.png".into()),
            id: "0123456789abcdef".into(),
            pastes: vec![],
        };
        let json = serde_json::to_value(profile).unwrap();
        assert_eq!(json["joined"], "1970-01-01T00:00:00Z");
        assert_eq!(json["profilePicture"], "/uploads/x.png");
        assert_eq!(json["pastes"], serde_json::json!([]));
    }

    #[test]
    fn reset_request_reads_new_password() {
        let req: ResetPasswordRequest =
            serde_json::from_str(r#"{"token":"abc","newPassword":"pw2"}"#).unwrap();
        assert_eq!(req.new_password, "pw2");
    }
}
