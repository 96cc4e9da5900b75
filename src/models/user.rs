//! A registered Moteve user.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// A user account as stored by the user service.
///
/// Users authenticate with email and password from the mobile client and
/// receive a device token in exchange (see [`Device`](super::device::Device)).
#[derive(Clone, FromRow, Debug, PartialEq)]
pub struct User {
    /// Unique identifier for this user.
    pub id: Uuid,

    /// Login e-mail, unique across users.
    pub email: String,

    /// Password as kept by the user store.
    pub password: String,

    /// Name shown to contacts.
    pub display_name: String,

    /// Disabled users cannot authenticate.
    pub enabled: bool,

    /// When the account was created.
    pub registered_at: DateTime<Utc>,
}
