use anyhow::Context;
use bytes::Bytes;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::{error::ApiError, state::AppState};

pub struct UploadItem<'a> {
    pub body: Bytes,
    pub content_type: &'a str,
}

/// Stores the image and points the session user's profile at it. Returns the
/// new picture URL.
pub async fn upload_profile_picture(
    st: &AppState,
    session_token: &str,
    img: UploadItem<'_>,
) -> Result<String, ApiError> {
    // Session and user are checked up front so rejected requests store nothing.
    let profile = st.credentials.get_profile(session_token).await?;
    let ext = ext_from_mime(img.content_type).ok_or_else(|| {
        warn!(content_type = %img.content_type, "unsupported profile picture type");
        ApiError::UnsupportedImage
    })?;

    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let key = format!("profile_pictures/{}-{}.{}", profile.id, millis, ext);
    st.storage
        .put_object(&key, img.body, img.content_type)
        .await
        .with_context(|| format!("put_object {}", key))?;

    let url = st.storage.object_url(&key);
    match st.credentials.set_profile_picture(session_token, &url).await {
        Ok(url) => {
            info!(user_id = %profile.id, %key, "profile picture stored");
            Ok(url)
        }
        Err(e) => {
            if let Err(del) = st.storage.delete_object(&key).await {
                warn!(error = %del, %key, "failed to remove orphaned upload");
            }
            Err(e)
        }
    }
}

fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/heic" => Some("heic"),
        _ => None,
    }
}
