//! A named group of contacts owned by a user.

use sqlx::FromRow;
use uuid::Uuid;

#[derive(Clone, FromRow, Debug, PartialEq)]
pub struct Group {
    pub id: i64,

    /// Owning user.
    pub user_id: Uuid,

    pub name: String,
}
