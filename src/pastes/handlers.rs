use axum::{
    extract::{Path, State},
    response::Html,
    routing::{get, post},
    Json, Router,
};
use time::format_description::well_known::Rfc3339;
use tracing::{info, instrument};

use super::{
    dto::{CreatePasteRequest, CreatedPasteResponse},
    repo::Paste,
};
use crate::{error::ApiError, state::AppState};

pub fn paste_routes() -> Router<AppState> {
    Router::new()
        .route("/api/createPaste", post(create_paste))
        .route("/api/pastes/:id", get(get_paste))
        .route("/p/:id", get(view_paste))
}

/// POST /api/createPaste { paste }
#[instrument(skip(state, payload))]
pub async fn create_paste(
    State(state): State<AppState>,
    Json(payload): Json<CreatePasteRequest>,
) -> Result<Json<CreatedPasteResponse>, ApiError> {
    let paste = state
        .pastes
        .create(payload.paste)
        .await
        .map_err(|source| ApiError::Persistence {
            what: "paste",
            source,
        })?;
    info!(id = %paste.id, "paste created");
    Ok(Json(CreatedPasteResponse { id: paste.id }))
}

#[instrument(skip(state))]
pub async fn get_paste(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Paste>, ApiError> {
    state
        .pastes
        .get(&id)
        .await
        .map(Json)
        .ok_or(ApiError::PasteNotFound)
}

/// GET /p/:id, a standalone HTML page.
#[instrument(skip(state))]
pub async fn view_paste(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Html<String>, ApiError> {
    let paste = state.pastes.get(&id).await.ok_or(ApiError::PasteNotFound)?;
    let url = format!("{}/p/{}", state.config.public_url, paste.id);
    Ok(Html(render_paste(&paste, &url)))
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn render_paste(paste: &Paste, url: &str) -> String {
    let created = paste
        .created_at
        .format(&Rfc3339)
        .unwrap_or_else(|_| paste.created_at.to_string());
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="UTF-8">
  <title>Paste View</title>
</head>
<body>
  <h1>Paste View</h1>
  <div>
    <p><strong>Paste ID:</strong> {id}</p>
    <p><strong>Created At:</strong> {created}</p>
    <p><strong>Content:</strong></p>
    <pre>{content}</pre>
    <p><strong>URL:</strong> <span id="pasteUrl">{url}</span></p>
    <button id="copyUrlButton">Copy URL</button>
  </div>
  <script>
    document.getElementById('copyUrlButton').addEventListener('click', () => {{
      navigator.clipboard.writeText(document.getElementById('pasteUrl').innerText);
    }});
  </script>
</body>
</html>
"#,
        id = escape_html(&paste.id),
        created = created,
        content = escape_html(&paste.content),
        url = escape_html(url),
    )
}
