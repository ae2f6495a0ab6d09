use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    User,
    Organization,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::User => "user",
            AccountType::Organization => "organization",
        }
    }
}

impl std::str::FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(AccountType::User),
            "organization" => Ok(AccountType::Organization),
            _ => Err(format!("unknown account type: {s}")),
        }
    }
}

/// A repository granted to an installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledRepo {
    pub repo_id: String,
    pub repo_full_name: String,
    pub private: bool,
    pub installed_at: DateTime<Utc>,
}

/// Tenancy unit granted by the platform. Never hard-deleted; uninstalls set
/// `suspended_at`.
#[derive(Debug, Clone)]
pub struct Installation {
    pub installation_id: i64,
    pub account_type: AccountType,
    pub account_login: String,
    pub account_avatar_url: String,
    pub repositories: Vec<InstalledRepo>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewInstallation {
    pub installation_id: i64,
    pub account_type: AccountType,
    pub account_login: String,
    pub account_avatar_url: String,
    pub repositories: Vec<NewRepo>,
}

#[derive(Debug, Clone)]
pub struct NewRepo {
    pub repo_id: String,
    pub repo_full_name: String,
    pub private: bool,
}

#[derive(Clone)]
pub struct InstallationRepository {
    pool: SqlitePool,
}

impl InstallationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert an installation if it does not exist yet. Returns `true` when a
    /// new row was created. An existing installation is left untouched apart
    /// from clearing `suspended_at` (a re-install revives the record).
    #[tracing::instrument(skip(self, new), fields(installation_id = new.installation_id))]
    pub async fn create_if_missing(&self, new: &NewInstallation) -> Result<bool> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, (DateTime<Utc>, DateTime<Utc>)>(
            r#"
            INSERT INTO installations
                (installation_id, account_type, account_login, account_avatar_url, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(installation_id) DO UPDATE SET
                suspended_at = NULL,
                updated_at = excluded.updated_at
            RETURNING created_at, updated_at
            "#,
        )
        .bind(new.installation_id)
        .bind(new.account_type.as_str())
        .bind(&new.account_login)
        .bind(&new.account_avatar_url)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        // Insert writes one timestamp to both columns; the update path bumps
        // only updated_at, so equality identifies a fresh row.
        let created = row.0 == row.1;

        self.add_repositories(new.installation_id, &new.repositories)
            .await?;

        Ok(created)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, installation_id: i64) -> Result<Option<Installation>> {
        let row = sqlx::query_as::<_, (i64, String, String, String, Option<DateTime<Utc>>, DateTime<Utc>, DateTime<Utc>)>(
            r#"
            SELECT installation_id, account_type, account_login, account_avatar_url,
                   suspended_at, created_at, updated_at
            FROM installations
            WHERE installation_id = ?
            "#,
        )
        .bind(installation_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((installation_id, account_type, account_login, account_avatar_url, suspended_at, created_at, updated_at)) = row
        else {
            return Ok(None);
        };

        let repositories = sqlx::query_as::<_, (String, String, bool, DateTime<Utc>)>(
            r#"
            SELECT repo_id, repo_full_name, private, installed_at
            FROM installation_repositories
            WHERE installation_id = ?
            ORDER BY installed_at, repo_id
            "#,
        )
        .bind(installation_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|(repo_id, repo_full_name, private, installed_at)| InstalledRepo {
            repo_id,
            repo_full_name,
            private,
            installed_at,
        })
        .collect();

        Ok(Some(Installation {
            installation_id,
            account_type: account_type
                .parse()
                .map_err(|e: String| crate::error::AppError::Internal(e))?,
            account_login,
            account_avatar_url,
            repositories,
            suspended_at,
            created_at,
            updated_at,
        }))
    }

    /// Append repositories to an installation. Already-present repo ids are
    /// left untouched, preserving their original `installed_at`.
    #[tracing::instrument(skip(self, repos), fields(count = repos.len()))]
    pub async fn add_repositories(&self, installation_id: i64, repos: &[NewRepo]) -> Result<()> {
        let now = Utc::now();
        for repo in repos {
            sqlx::query(
                r#"
                INSERT INTO installation_repositories
                    (installation_id, repo_id, repo_full_name, private, installed_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(installation_id, repo_id) DO NOTHING
                "#,
            )
            .bind(installation_id)
            .bind(&repo.repo_id)
            .bind(&repo.repo_full_name)
            .bind(repo.private)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }

        sqlx::query("UPDATE installations SET updated_at = ? WHERE installation_id = ?")
            .bind(now)
            .bind(installation_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self, repo_ids), fields(count = repo_ids.len()))]
    pub async fn remove_repositories(&self, installation_id: i64, repo_ids: &[String]) -> Result<()> {
        for repo_id in repo_ids {
            sqlx::query(
                "DELETE FROM installation_repositories WHERE installation_id = ? AND repo_id = ?",
            )
            .bind(installation_id)
            .bind(repo_id)
            .execute(&self.pool)
            .await?;
        }

        sqlx::query("UPDATE installations SET updated_at = ? WHERE installation_id = ?")
            .bind(Utc::now())
            .bind(installation_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Mark an installation suspended and detach it from every user. The two
    /// writes share a transaction so a crash cannot leave a suspended
    /// installation still visible to users.
    #[tracing::instrument(skip(self))]
    pub async fn mark_suspended(&self, installation_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE installations SET suspended_at = ?, updated_at = ? WHERE installation_id = ?",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(installation_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM user_installations WHERE installation_id = ?")
            .bind(installation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::create_test_pool;

    fn make_installation(id: i64) -> NewInstallation {
        NewInstallation {
            installation_id: id,
            account_type: AccountType::Organization,
            account_login: "acme".to_string(),
            account_avatar_url: "https://example.com/a.png".to_string(),
            repositories: vec![NewRepo {
                repo_id: "12345".to_string(),
                repo_full_name: "acme/widgets".to_string(),
                private: true,
            }],
        }
    }

    #[tokio::test]
    async fn create_if_missing_is_idempotent() {
        let pool = create_test_pool().await;
        let repo = InstallationRepository::new(pool);

        assert!(repo.create_if_missing(&make_installation(77)).await.unwrap());
        assert!(!repo.create_if_missing(&make_installation(77)).await.unwrap());

        let installation = repo.get(77).await.unwrap().unwrap();
        assert_eq!(installation.account_login, "acme");
        assert_eq!(installation.repositories.len(), 1);
    }

    #[tokio::test]
    async fn add_and_remove_repositories() {
        let pool = create_test_pool().await;
        let repo = InstallationRepository::new(pool);
        repo.create_if_missing(&make_installation(77)).await.unwrap();

        repo.add_repositories(
            77,
            &[NewRepo {
                repo_id: "67890".to_string(),
                repo_full_name: "acme/gadgets".to_string(),
                private: false,
            }],
        )
        .await
        .unwrap();

        let installation = repo.get(77).await.unwrap().unwrap();
        assert_eq!(installation.repositories.len(), 2);

        repo.remove_repositories(77, &["12345".to_string()]).await.unwrap();
        let installation = repo.get(77).await.unwrap().unwrap();
        assert_eq!(installation.repositories.len(), 1);
        assert_eq!(installation.repositories[0].repo_id, "67890");
    }

    #[tokio::test]
    async fn mark_suspended_sets_timestamp() {
        let pool = create_test_pool().await;
        let repo = InstallationRepository::new(pool);
        repo.create_if_missing(&make_installation(77)).await.unwrap();

        repo.mark_suspended(77).await.unwrap();
        let installation = repo.get(77).await.unwrap().unwrap();
        assert!(installation.suspended_at.is_some());
    }

    #[tokio::test]
    async fn reinstall_revives_suspended_installation() {
        let pool = create_test_pool().await;
        let repo = InstallationRepository::new(pool);
        repo.create_if_missing(&make_installation(77)).await.unwrap();
        repo.mark_suspended(77).await.unwrap();

        repo.create_if_missing(&make_installation(77)).await.unwrap();
        let installation = repo.get(77).await.unwrap().unwrap();
        assert!(installation.suspended_at.is_none());
    }
}
