use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Viewer => "viewer",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "viewer" => Ok(Role::Viewer),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub platform_id: i64,
    pub username: String,
    pub email: String,
    pub avatar_url: String,
    pub installation_ids: Vec<i64>,
    pub role: Role,
    pub last_login_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub platform_id: i64,
    pub username: String,
    pub email: String,
    pub avatar_url: String,
    pub role: Role,
}

#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or refresh a user keyed by the unique upstream id. Profile
    /// fields follow the latest login; role is preserved on update.
    #[tracing::instrument(skip(self, new), fields(platform_id = new.platform_id))]
    pub async fn upsert(&self, new: &NewUser) -> Result<User> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO users (id, platform_id, username, email, avatar_url, role, last_login_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(platform_id) DO UPDATE SET
                username = excluded.username,
                email = excluded.email,
                avatar_url = excluded.avatar_url,
                last_login_at = excluded.last_login_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(new.platform_id)
        .bind(&new.username)
        .bind(&new.email)
        .bind(&new.avatar_url)
        .bind(new.role.as_str())
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.find_by_platform_id(new.platform_id)
            .await?
            .ok_or_else(|| crate::error::AppError::Internal("user vanished after upsert".into()))
    }

    #[tracing::instrument(skip(self))]
    pub async fn find_by_platform_id(&self, platform_id: i64) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, (String, i64, String, String, String, String, Option<DateTime<Utc>>)>(
            "SELECT id, platform_id, username, email, avatar_url, role, last_login_at FROM users WHERE platform_id = ?",
        )
        .bind(platform_id)
        .fetch_optional(&self.pool)
        .await?;

        self.hydrate(row).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, (String, i64, String, String, String, String, Option<DateTime<Utc>>)>(
            "SELECT id, platform_id, username, email, avatar_url, role, last_login_at FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        self.hydrate(row).await
    }

    /// All users linked to an installation. Used for single-member tenancy
    /// attribution.
    #[tracing::instrument(skip(self))]
    pub async fn find_by_installation(&self, installation_id: i64) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, (String, i64, String, String, String, String, Option<DateTime<Utc>>)>(
            r#"
            SELECT u.id, u.platform_id, u.username, u.email, u.avatar_url, u.role, u.last_login_at
            FROM users u
            JOIN user_installations ui ON ui.user_id = u.id
            WHERE ui.installation_id = ?
            ORDER BY u.username
            "#,
        )
        .bind(installation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(user) = self.hydrate(Some(row)).await? {
                users.push(user);
            }
        }
        Ok(users)
    }

    /// Add an installation to the user's set. No-op when already linked.
    #[tracing::instrument(skip(self))]
    pub async fn link_installation(&self, user_id: &str, installation_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO user_installations (user_id, installation_id) VALUES (?, ?)
             ON CONFLICT(user_id, installation_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(installation_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn hydrate(
        &self,
        row: Option<(String, i64, String, String, String, String, Option<DateTime<Utc>>)>,
    ) -> Result<Option<User>> {
        let Some((id, platform_id, username, email, avatar_url, role, last_login_at)) = row else {
            return Ok(None);
        };

        let installation_ids = sqlx::query_as::<_, (i64,)>(
            "SELECT installation_id FROM user_installations WHERE user_id = ? ORDER BY installation_id",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|(installation_id,)| installation_id)
        .collect();

        Ok(Some(User {
            id,
            platform_id,
            username,
            email,
            avatar_url,
            installation_ids,
            role: role
                .parse()
                .map_err(|e: String| crate::error::AppError::Internal(e))?,
            last_login_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::create_test_pool;

    fn make_user(platform_id: i64, username: &str) -> NewUser {
        NewUser {
            platform_id,
            username: username.to_string(),
            email: format!("{username}@example.com"),
            avatar_url: String::new(),
            role: Role::Viewer,
        }
    }

    #[tokio::test]
    async fn upsert_is_keyed_by_platform_id() {
        let pool = create_test_pool().await;
        let repo = UserRepository::new(pool);

        let first = repo.upsert(&make_user(42, "alice")).await.unwrap();
        let second = repo.upsert(&make_user(42, "alice-renamed")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.username, "alice-renamed");
    }

    #[tokio::test]
    async fn link_installation_is_a_set_operation() {
        let pool = create_test_pool().await;
        let repo = UserRepository::new(pool);
        let user = repo.upsert(&make_user(42, "alice")).await.unwrap();

        assert!(repo.link_installation(&user.id, 77).await.unwrap());
        assert!(!repo.link_installation(&user.id, 77).await.unwrap());

        let user = repo.find_by_username("alice").await.unwrap().unwrap();
        assert_eq!(user.installation_ids, vec![77]);
    }

    #[tokio::test]
    async fn find_by_installation_lists_linked_users() {
        let pool = create_test_pool().await;
        let repo = UserRepository::new(pool);
        let alice = repo.upsert(&make_user(1, "alice")).await.unwrap();
        let bob = repo.upsert(&make_user(2, "bob")).await.unwrap();
        repo.link_installation(&alice.id, 77).await.unwrap();
        repo.link_installation(&bob.id, 88).await.unwrap();

        let members = repo.find_by_installation(77).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].username, "alice");
    }
}
