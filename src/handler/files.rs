use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::handler::ApiError;
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct FileListResponse {
    pub category: String,
    pub files: Vec<String>,
}

/// List the WAV files that can be played.
pub async fn list_files(State(state): State<AppState>) -> Result<Json<FileListResponse>, ApiError> {
    let files = state.sessions.list().await?;
    info!("Listing {} playable files", files.len());

    Ok(Json(FileListResponse {
        category: state.sessions.category().to_string(),
        files,
    }))
}
