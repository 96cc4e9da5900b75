//! A mobile client registered for a user.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One registered MCA installation.
///
/// The `token` is handed to the client at registration and sent back in the
/// `Moteve-Token` header on every later request.
#[derive(Clone, Debug)]
pub struct Device {
    /// Opaque credential, unique across devices.
    pub token: String,

    /// User the device acts for.
    pub user_id: Uuid,

    /// Free-form description sent by the client (phone model etc).
    pub description: String,

    pub registered_at: DateTime<Utc>,
}
