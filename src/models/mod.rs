//! Core data models for the Moteve server.
//!
//! Users and groups are read back from SQLite via `sqlx::FromRow`; devices
//! are only written. Upload sequences live in memory inside the upload
//! session manager.

pub mod device;
pub mod group;
pub mod sequence;
pub mod user;
