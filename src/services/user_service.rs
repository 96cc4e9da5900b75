//! UserService: users, their groups, contacts and registered devices,
//! backed by SQLite.
//!
//! The HTTP layer and the upload session manager only see the
//! [`UserDirectory`] trait; the account management methods are used by the
//! admin command line.

use crate::models::{device::Device, group::Group, user::User};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UserError {
    #[error("user `{0}` not found")]
    UserNotFound(String),
    #[error("user `{0}` already exists")]
    UserAlreadyExists(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type UserResult<T> = Result<T, UserError>;

/// Authentication and group lookups needed to serve the mobile client.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Returns the enabled user with these credentials, if any.
    async fn authenticate(&self, email: &str, password: &str) -> UserResult<Option<User>>;

    /// Register a device for `user` and hand out its token.
    async fn issue_token(&self, user: &User, description: &str) -> UserResult<String>;

    /// Look up the user a device token belongs to.
    async fn resolve_user(&self, token: &str) -> UserResult<Option<User>>;

    /// Names of the user's groups, sorted.
    async fn list_group_names(&self, user: &User) -> UserResult<Vec<String>>;
}

#[derive(Clone)]
pub struct UserService {
    pub db: Arc<SqlitePool>,
}

const USER_COLUMNS: &str = "id, email, password, display_name, enabled, registered_at";

impl UserService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Create an enabled user.
    ///
    /// Returns UserAlreadyExists if the e-mail is taken.
    pub async fn register_user(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> UserResult<User> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(UserError::InvalidInput(format!("bad e-mail `{}`", email)));
        }
        if password.is_empty() {
            return Err(UserError::InvalidInput("empty password".into()));
        }

        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password: password.to_string(),
            display_name: display_name.to_string(),
            enabled: true,
            registered_at: Utc::now(),
        };

        match sqlx::query(
            "INSERT INTO users (id, email, password, display_name, enabled, registered_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password)
        .bind(&user.display_name)
        .bind(user.enabled)
        .bind(user.registered_at)
        .execute(&*self.db)
        .await
        {
            Ok(_) => {
                info!("Registered user {}", user.email);
                Ok(user)
            }
            Err(err) if is_unique_violation(&err) => {
                Err(UserError::UserAlreadyExists(email.to_string()))
            }
            Err(err) => Err(UserError::Sqlx(err)),
        }
    }

    pub async fn find_user_by_email(&self, email: &str) -> UserResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE email = ?",
            USER_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&*self.db)
        .await?;
        Ok(user)
    }

    async fn require_user(&self, email: &str) -> UserResult<User> {
        self.find_user_by_email(email)
            .await?
            .ok_or_else(|| UserError::UserNotFound(email.to_string()))
    }

    /// Create a group named `name` for the user identified by `email`.
    pub async fn create_group(&self, email: &str, name: &str) -> UserResult<Group> {
        let name = name.trim();
        if name.is_empty() || name.contains('\\') {
            return Err(UserError::InvalidInput(format!("bad group name `{}`", name)));
        }
        let user = self.require_user(email).await?;

        let group = sqlx::query_as::<_, Group>(
            "INSERT INTO user_groups (user_id, name) VALUES (?, ?)
             ON CONFLICT(user_id, name) DO UPDATE SET name = excluded.name
             RETURNING id, user_id, name",
        )
        .bind(user.id)
        .bind(name)
        .fetch_one(&*self.db)
        .await?;

        debug!("Created group {} for user {}", group.name, user.email);
        Ok(group)
    }

    /// All groups of the user identified by `email`, by name.
    pub async fn get_groups(&self, email: &str) -> UserResult<Vec<Group>> {
        let user = self.require_user(email).await?;
        let groups = sqlx::query_as::<_, Group>(
            "SELECT id, user_id, name FROM user_groups WHERE user_id = ? ORDER BY name ASC",
        )
        .bind(user.id)
        .fetch_all(&*self.db)
        .await?;
        Ok(groups)
    }

    /// Delete groups by id. Only groups owned by the user are touched; ids of
    /// other users' groups are ignored. Returns how many were removed.
    pub async fn remove_groups(&self, email: &str, group_ids: &[i64]) -> UserResult<u64> {
        if group_ids.is_empty() {
            return Ok(0);
        }
        let user = self.require_user(email).await?;

        let mut tx = self.db.begin().await?;
        let mut removed = 0;
        for id in group_ids {
            removed += sqlx::query("DELETE FROM user_groups WHERE id = ? AND user_id = ?")
                .bind(id)
                .bind(user.id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        debug!("Removed {} group(s) of user {}", removed, user.email);
        Ok(removed)
    }

    /// Enabled users whose e-mail or display name contains `criteria`
    /// (ASCII case-insensitive), ordered by e-mail.
    pub async fn find_users(&self, criteria: &str) -> UserResult<Vec<User>> {
        let criteria = criteria.trim();
        if criteria.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = format!("%{}%", escape_like(criteria));

        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users
             WHERE enabled = 1
               AND (email LIKE ?1 ESCAPE '\\' OR display_name LIKE ?1 ESCAPE '\\')
             ORDER BY email ASC",
            USER_COLUMNS
        ))
        .bind(&pattern)
        .fetch_all(&*self.db)
        .await?;
        Ok(users)
    }

    /// Add users (by id) to the contacts of the user identified by `email`.
    ///
    /// Contacts already present are skipped. Unknown ids fail the whole call
    /// with UserNotFound. Returns the number of contacts added.
    pub async fn add_contacts(&self, email: &str, contact_ids: &[Uuid]) -> UserResult<u64> {
        if contact_ids.is_empty() {
            return Ok(0);
        }
        let user = self.require_user(email).await?;
        if contact_ids.contains(&user.id) {
            return Err(UserError::InvalidInput(format!(
                "{} cannot be their own contact",
                user.email
            )));
        }

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let mut added = 0;
        for id in contact_ids {
            let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            if exists == 0 {
                return Err(UserError::UserNotFound(id.to_string()));
            }
            added += sqlx::query(
                "INSERT OR IGNORE INTO user_contacts (user_id, contact_id, added_at)
                 VALUES (?, ?, ?)",
            )
            .bind(user.id)
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;

        info!("Added {} contact(s) to user {}", added, user.email);
        Ok(added)
    }

    /// Contacts of the user identified by `email`, ordered by e-mail.
    pub async fn list_contacts(&self, email: &str) -> UserResult<Vec<User>> {
        let user = self.require_user(email).await?;
        let contacts = sqlx::query_as::<_, User>(
            "SELECT u.id, u.email, u.password, u.display_name, u.enabled, u.registered_at
             FROM user_contacts c JOIN users u ON u.id = c.contact_id
             WHERE c.user_id = ?
             ORDER BY u.email ASC",
        )
        .bind(user.id)
        .fetch_all(&*self.db)
        .await?;
        Ok(contacts)
    }
}

#[async_trait]
impl UserDirectory for UserService {
    async fn authenticate(&self, email: &str, password: &str) -> UserResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE email = ? AND password = ? AND enabled = 1",
            USER_COLUMNS
        ))
        .bind(email)
        .bind(password)
        .fetch_optional(&*self.db)
        .await?;
        Ok(user)
    }

    async fn issue_token(&self, user: &User, description: &str) -> UserResult<String> {
        let device = Device {
            token: new_token(),
            user_id: user.id,
            description: description.to_string(),
            registered_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO devices (token, user_id, description, registered_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&device.token)
        .bind(device.user_id)
        .bind(&device.description)
        .bind(device.registered_at)
        .execute(&*self.db)
        .await?;

        info!("Registered device `{}` for user {}", device.description, user.email);
        Ok(device.token)
    }

    async fn resolve_user(&self, token: &str) -> UserResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT u.id, u.email, u.password, u.display_name, u.enabled, u.registered_at
             FROM devices d JOIN users u ON u.id = d.user_id
             WHERE d.token = ? AND u.enabled = 1",
        )
        .bind(token)
        .fetch_optional(&*self.db)
        .await?;
        Ok(user)
    }

    async fn list_group_names(&self, user: &User) -> UserResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT name FROM user_groups WHERE user_id = ? ORDER BY name ASC, id ASC",
        )
        .bind(user.id)
        .fetch_all(&*self.db)
        .await?;
        Ok(names)
    }
}

/// A fresh opaque device token: 32 random bytes, URL-safe base64.
fn new_token() -> String {
    let mut raw = [0u8; 32];
    raw[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    raw[16..].copy_from_slice(Uuid::new_v4().as_bytes());
    general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

/// Escape `LIKE` wildcards so `criteria` matches literally.
fn escape_like(criteria: &str) -> String {
    let mut escaped = String::with_capacity(criteria.len());
    for c in criteria.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn service() -> UserService {
        let pool = db::connect("sqlite::memory:", 1).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        UserService::new(Arc::new(pool))
    }

    #[tokio::test]
    async fn authenticate_checks_password_and_enabled() {
        let svc = service().await;
        svc.register_user("ann@example.com", "secret", "Ann")
            .await
            .unwrap();

        let user = svc
            .authenticate("ann@example.com", "secret")
            .await
            .unwrap()
            .expect("valid credentials");
        assert_eq!(user.display_name, "Ann");
        assert!(svc.authenticate("ann@example.com", "nope").await.unwrap().is_none());
        assert!(svc.authenticate("bob@example.com", "secret").await.unwrap().is_none());

        sqlx::query("UPDATE users SET enabled = 0 WHERE id = ?")
            .bind(user.id)
            .execute(&*svc.db)
            .await
            .unwrap();
        assert!(svc.authenticate("ann@example.com", "secret").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let svc = service().await;
        svc.register_user("ann@example.com", "a", "Ann").await.unwrap();
        assert!(matches!(
            svc.register_user("ann@example.com", "b", "Other").await,
            Err(UserError::UserAlreadyExists(_))
        ));
        assert!(matches!(
            svc.register_user("not-an-email", "b", "Other").await,
            Err(UserError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn issued_tokens_resolve_to_their_user() {
        let svc = service().await;
        let ann = svc.register_user("ann@example.com", "a", "Ann").await.unwrap();
        let bob = svc.register_user("bob@example.com", "b", "Bob").await.unwrap();

        let t1 = svc.issue_token(&ann, "phone").await.unwrap();
        let t2 = svc.issue_token(&ann, "tablet").await.unwrap();
        let t3 = svc.issue_token(&bob, "phone").await.unwrap();
        assert_ne!(t1, t2);
        assert_eq!(t1.len(), 43);

        assert_eq!(svc.resolve_user(&t1).await.unwrap().unwrap().id, ann.id);
        assert_eq!(svc.resolve_user(&t2).await.unwrap().unwrap().id, ann.id);
        assert_eq!(svc.resolve_user(&t3).await.unwrap().unwrap().id, bob.id);
        assert!(svc.resolve_user("bogus").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn groups_are_listed_sorted_per_owner() {
        let svc = service().await;
        let ann = svc.register_user("ann@example.com", "a", "Ann").await.unwrap();
        let bob = svc.register_user("bob@example.com", "b", "Bob").await.unwrap();

        let family = svc.create_group("ann@example.com", "family").await.unwrap();
        svc.create_group("ann@example.com", "friends").await.unwrap();
        svc.create_group("ann@example.com", "colleagues").await.unwrap();
        svc.create_group("bob@example.com", "team").await.unwrap();

        assert_eq!(family.user_id, ann.id);
        assert_eq!(
            svc.list_group_names(&ann).await.unwrap(),
            vec!["colleagues", "family", "friends"]
        );
        assert_eq!(svc.list_group_names(&bob).await.unwrap(), vec!["team"]);

        // Creating an existing group hands back the same row.
        let again = svc.create_group("ann@example.com", "family").await.unwrap();
        assert_eq!(again.id, family.id);

        assert!(matches!(
            svc.create_group("nobody@example.com", "x").await,
            Err(UserError::UserNotFound(_))
        ));
        assert!(matches!(
            svc.create_group("ann@example.com", "a\\b").await,
            Err(UserError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn remove_groups_only_touches_the_owners_groups() {
        let svc = service().await;
        svc.register_user("ann@example.com", "a", "Ann").await.unwrap();
        svc.register_user("bob@example.com", "b", "Bob").await.unwrap();
        let family = svc.create_group("ann@example.com", "family").await.unwrap();
        let friends = svc.create_group("ann@example.com", "friends").await.unwrap();
        let team = svc.create_group("bob@example.com", "team").await.unwrap();

        let removed = svc
            .remove_groups("ann@example.com", &[family.id, team.id, 9999])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(svc.get_groups("ann@example.com").await.unwrap(), vec![friends]);
        assert_eq!(svc.get_groups("bob@example.com").await.unwrap(), vec![team]);

        assert_eq!(svc.remove_groups("ann@example.com", &[]).await.unwrap(), 0);
        assert!(matches!(
            svc.remove_groups("nobody@example.com", &[1]).await,
            Err(UserError::UserNotFound(_))
        ));
    }

    #[tokio::test]
    async fn find_users_matches_email_or_name_of_enabled_users() {
        let svc = service().await;
        svc.register_user("ann@example.com", "a", "Ann Smith").await.unwrap();
        svc.register_user("bob@moteve.com", "b", "Bob").await.unwrap();
        let carl = svc
            .register_user("carl@example.com", "c", "Carl 100%")
            .await
            .unwrap();

        let emails = |users: Vec<User>| users.into_iter().map(|u| u.email).collect::<Vec<_>>();

        assert_eq!(
            emails(svc.find_users("EXAMPLE").await.unwrap()),
            vec!["ann@example.com", "carl@example.com"]
        );
        assert_eq!(emails(svc.find_users("smith").await.unwrap()), vec!["ann@example.com"]);
        // Wildcards match literally.
        assert_eq!(emails(svc.find_users("100%").await.unwrap()), vec!["carl@example.com"]);
        assert!(svc.find_users("_").await.unwrap().is_empty());
        assert!(svc.find_users("  ").await.unwrap().is_empty());

        sqlx::query("UPDATE users SET enabled = 0 WHERE id = ?")
            .bind(carl.id)
            .execute(&*svc.db)
            .await
            .unwrap();
        assert!(svc.find_users("carl").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn contacts_are_added_once_and_listed() {
        let svc = service().await;
        let ann = svc.register_user("ann@example.com", "a", "Ann").await.unwrap();
        let bob = svc.register_user("bob@example.com", "b", "Bob").await.unwrap();
        let carl = svc.register_user("carl@example.com", "c", "Carl").await.unwrap();

        assert_eq!(
            svc.add_contacts("ann@example.com", &[carl.id, bob.id]).await.unwrap(),
            2
        );
        assert_eq!(svc.add_contacts("ann@example.com", &[bob.id]).await.unwrap(), 0);

        let contacts = svc.list_contacts("ann@example.com").await.unwrap();
        let ids: Vec<Uuid> = contacts.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![bob.id, carl.id]);
        assert!(svc.list_contacts("bob@example.com").await.unwrap().is_empty());

        assert!(matches!(
            svc.add_contacts("ann@example.com", &[ann.id]).await,
            Err(UserError::InvalidInput(_))
        ));
        // An unknown id rolls the whole batch back.
        let dave = svc.register_user("dave@example.com", "d", "Dave").await.unwrap();
        assert!(matches!(
            svc.add_contacts("bob@example.com", &[dave.id, Uuid::new_v4()]).await,
            Err(UserError::UserNotFound(_))
        ));
        assert!(svc.list_contacts("bob@example.com").await.unwrap().is_empty());
    }
}
