use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct CreatePasteRequest {
    pub paste: String,
}

#[derive(Debug, Serialize)]
pub struct CreatedPasteResponse {
    pub id: String,
}
