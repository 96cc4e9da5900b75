//! Shared state handed to every request handler.

use crate::services::{upload_service::UploadSessionManager, user_service::UserDirectory};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

#[derive(Clone)]
pub struct AppState {
    /// SQLite pool, probed by `/readyz`.
    pub db: Arc<SqlitePool>,

    /// Root directory for parts and finished videos.
    pub base_path: PathBuf,

    pub users: Arc<dyn UserDirectory>,
    pub uploads: Arc<UploadSessionManager>,
}
