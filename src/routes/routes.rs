//! Routes for the MCA endpoints and health probes.
//!
//! - `POST /mca/register.htm`  : authenticate and register a device
//! - `POST /mca/listGroups.htm`: list the user's group names
//! - `POST /mca/upload.htm`    : open / append to / close an upload sequence
//! - `GET  /healthz`, `GET /readyz`
//!
//! The `.htm` paths are what deployed clients call.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        mca_handlers::{list_groups, register_mca, upload_video},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router; callers attach the shared [`AppState`].
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/mca/register.htm", post(register_mca))
        .route("/mca/listGroups.htm", post(list_groups))
        .route("/mca/upload.htm", post(upload_video))
}
