use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::analyzer::{Analysis, DiffStats};
use crate::error::{AppError, Result};
use crate::store::users::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrStatus {
    Open,
    Closed,
    Merged,
}

impl PrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrStatus::Open => "open",
            PrStatus::Closed => "closed",
            PrStatus::Merged => "merged",
        }
    }
}

impl std::str::FromStr for PrStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" => Ok(PrStatus::Open),
            "closed" => Ok(PrStatus::Closed),
            "merged" => Ok(PrStatus::Merged),
            _ => Err(format!("unknown pull request status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStatus {
    Pending,
    Ready,
    Error,
}

impl SummaryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryStatus::Pending => "pending",
            SummaryStatus::Ready => "ready",
            SummaryStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for SummaryStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SummaryStatus::Pending),
            "ready" => Ok(SummaryStatus::Ready),
            "error" => Ok(SummaryStatus::Error),
            _ => Err(format!("unknown summary status: {s}")),
        }
    }
}

/// Per-file change counts as persisted on the PR. Raw patches are never
/// stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub filename: String,
    pub additions: u64,
    pub deletions: u64,
}

/// Generative-model output attached to a PR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub tldr: String,
    pub risks: Vec<String>,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PullRequest {
    pub id: String,
    pub installation_id: i64,
    pub repo_id: String,
    pub number: i64,
    pub user_id: Option<String>,
    pub repo_full_name: String,
    pub title: String,
    pub author: String,
    pub branch_from: String,
    pub branch_to: String,
    pub status: PrStatus,
    pub files_changed: Vec<FileStat>,
    pub summary: Option<Summary>,
    pub summary_status: SummaryStatus,
    pub summary_error: Option<String>,
    pub last_summarized_at: Option<DateTime<Utc>>,
    pub system_labels: Vec<String>,
    pub risk_flags: Vec<String>,
    pub risk_score: u8,
    pub diff_stats: Option<DiffStats>,
    pub chat_message_ts: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields the webhook receiver writes. Mutable fields are applied on every
/// delivery; identity fields only on insert.
#[derive(Debug, Clone)]
pub struct PrUpsert {
    pub installation_id: i64,
    pub repo_id: String,
    pub number: i64,
    pub user_id: Option<String>,
    pub repo_full_name: String,
    pub title: String,
    pub author: String,
    pub branch_from: String,
    pub branch_to: String,
    pub status: PrStatus,
    pub files_changed: Vec<FileStat>,
}

#[derive(Debug, sqlx::FromRow)]
struct PrRow {
    id: String,
    installation_id: i64,
    repo_id: String,
    number: i64,
    user_id: Option<String>,
    repo_full_name: String,
    title: String,
    author: String,
    branch_from: String,
    branch_to: String,
    status: String,
    files_changed: String,
    summary: Option<String>,
    summary_status: String,
    summary_error: Option<String>,
    last_summarized_at: Option<DateTime<Utc>>,
    system_labels: String,
    risk_flags: String,
    risk_score: i64,
    diff_stats: Option<String>,
    chat_message_ts: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PrRow> for PullRequest {
    type Error = AppError;

    fn try_from(row: PrRow) -> Result<Self> {
        Ok(PullRequest {
            status: row.status.parse().map_err(AppError::Internal)?,
            summary_status: row.summary_status.parse().map_err(AppError::Internal)?,
            files_changed: serde_json::from_str(&row.files_changed)?,
            summary: row.summary.as_deref().map(serde_json::from_str).transpose()?,
            system_labels: serde_json::from_str(&row.system_labels)?,
            risk_flags: serde_json::from_str(&row.risk_flags)?,
            diff_stats: row.diff_stats.as_deref().map(serde_json::from_str).transpose()?,
            risk_score: row.risk_score.clamp(0, 100) as u8,
            id: row.id,
            installation_id: row.installation_id,
            repo_id: row.repo_id,
            number: row.number,
            user_id: row.user_id,
            repo_full_name: row.repo_full_name,
            title: row.title,
            author: row.author,
            branch_from: row.branch_from,
            branch_to: row.branch_to,
            summary_error: row.summary_error,
            last_summarized_at: row.last_summarized_at,
            chat_message_ts: row.chat_message_ts,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    id, installation_id, repo_id, number, user_id, repo_full_name, title, author,
    branch_from, branch_to, status, files_changed, summary, summary_status,
    summary_error, last_summarized_at, system_labels, risk_flags, risk_score,
    diff_stats, chat_message_ts, created_at, updated_at
"#;

#[derive(Clone)]
pub struct PullRequestRepository {
    pool: SqlitePool,
}

impl PullRequestRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Atomic upsert keyed by the unique (repo_id, number) index. Returns the
    /// resulting document and whether it was created. Mutable fields are
    /// overwritten; identity, summary state, and analysis fields survive
    /// updates.
    #[tracing::instrument(skip(self, upsert), fields(repo_id = %upsert.repo_id, number = upsert.number))]
    pub async fn upsert(&self, upsert: &PrUpsert) -> Result<(PullRequest, bool)> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let files = serde_json::to_string(&upsert.files_changed)?;

        let row = sqlx::query_as::<_, PrRow>(&format!(
            r#"
            INSERT INTO pull_requests
                (id, installation_id, repo_id, number, user_id, repo_full_name, title, author,
                 branch_from, branch_to, status, files_changed, summary_status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
            ON CONFLICT(repo_id, number) DO UPDATE SET
                repo_full_name = excluded.repo_full_name,
                title = excluded.title,
                author = excluded.author,
                branch_from = excluded.branch_from,
                branch_to = excluded.branch_to,
                status = excluded.status,
                files_changed = excluded.files_changed,
                updated_at = excluded.updated_at
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(&id)
        .bind(upsert.installation_id)
        .bind(&upsert.repo_id)
        .bind(upsert.number)
        .bind(&upsert.user_id)
        .bind(&upsert.repo_full_name)
        .bind(&upsert.title)
        .bind(&upsert.author)
        .bind(&upsert.branch_from)
        .bind(&upsert.branch_to)
        .bind(upsert.status.as_str())
        .bind(&files)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        // The update path keeps the existing surrogate id, so the returned
        // row carries our fresh uuid only when it was actually inserted.
        let created = row.id == id;
        Ok((row.try_into()?, created))
    }

    #[tracing::instrument(skip(self))]
    pub async fn find_by_id(&self, id: &str) -> Result<Option<PullRequest>> {
        let row = sqlx::query_as::<_, PrRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM pull_requests WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    #[tracing::instrument(skip(self))]
    pub async fn find_by_repo_number(&self, repo_id: &str, number: i64) -> Result<Option<PullRequest>> {
        let row = sqlx::query_as::<_, PrRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM pull_requests WHERE repo_id = ? AND number = ?"
        ))
        .bind(repo_id)
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    /// Persist the deterministic analysis. Written before the model call so
    /// the fields survive a model outage.
    #[tracing::instrument(skip(self, analysis))]
    pub async fn update_analysis(&self, id: &str, analysis: &Analysis) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pull_requests
            SET system_labels = ?, risk_flags = ?, risk_score = ?, diff_stats = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(serde_json::to_string(&analysis.system_labels)?)
        .bind(serde_json::to_string(&analysis.risk_flags)?)
        .bind(analysis.risk_score as i64)
        .bind(serde_json::to_string(&analysis.diff_stats)?)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a successful summary: status ready, error cleared, summary and
    /// last_summarized_at set. One statement, one save.
    #[tracing::instrument(skip(self, summary))]
    pub async fn save_summary_success(&self, id: &str, summary: &Summary) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pull_requests
            SET summary = ?, summary_status = 'ready', summary_error = NULL,
                last_summarized_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(serde_json::to_string(summary)?)
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a failed summary attempt. The message is truncated to 500
    /// characters; a previously stored summary is left in place.
    #[tracing::instrument(skip(self, message))]
    pub async fn save_summary_error(&self, id: &str, message: &str) -> Result<()> {
        let truncated: String = message.chars().take(500).collect();
        sqlx::query(
            r#"
            UPDATE pull_requests
            SET summary_status = 'error', summary_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(truncated)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn set_status(&self, repo_id: &str, number: i64, status: PrStatus) -> Result<()> {
        sqlx::query("UPDATE pull_requests SET status = ?, updated_at = ? WHERE repo_id = ? AND number = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(repo_id)
            .bind(number)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Reopen: status back to open, summary state reset so a fresh summary is
    /// generated.
    #[tracing::instrument(skip(self))]
    pub async fn reopen(&self, repo_id: &str, number: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pull_requests
            SET status = 'open', summary_status = 'pending', summary_error = NULL, updated_at = ?
            WHERE repo_id = ? AND number = ?
            "#,
        )
        .bind(Utc::now())
        .bind(repo_id)
        .bind(number)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Set the chat delivery marker, first writer wins. Returns false when a
    /// marker was already present.
    #[tracing::instrument(skip(self))]
    pub async fn set_chat_message_ts(&self, id: &str, ts: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pull_requests SET chat_message_ts = ?, updated_at = ? WHERE id = ? AND chat_message_ts IS NULL",
        )
        .bind(ts)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// PRs visible to a user: restricted to their installation set, newest
    /// first.
    #[tracing::instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn find_by_user(
        &self,
        user: &User,
        status: Option<PrStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<PullRequest>> {
        let rows = sqlx::query_as::<_, PrRow>(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM pull_requests
            WHERE installation_id IN
                (SELECT installation_id FROM user_installations WHERE user_id = ?)
              AND (? IS NULL OR status = ?)
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(&user.id)
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn count_by_installation_and_repo(&self, installation_id: i64, repo_id: &str) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM pull_requests WHERE installation_id = ? AND repo_id = ?",
        )
        .bind(installation_id)
        .bind(repo_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::create_test_pool;
    use crate::store::users::{NewUser, Role, UserRepository};

    fn make_upsert(repo_id: &str, number: i64) -> PrUpsert {
        PrUpsert {
            installation_id: 77,
            repo_id: repo_id.to_string(),
            number,
            user_id: None,
            repo_full_name: "acme/widgets".to_string(),
            title: "Fix header parsing".to_string(),
            author: "alice".to_string(),
            branch_from: "fix/header".to_string(),
            branch_to: "main".to_string(),
            status: PrStatus::Open,
            files_changed: vec![FileStat {
                filename: "src/parser.ts".to_string(),
                additions: 10,
                deletions: 2,
            }],
        }
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let pool = create_test_pool().await;
        let repo = PullRequestRepository::new(pool);

        let (pr, created) = repo.upsert(&make_upsert("12345", 7)).await.unwrap();
        assert!(created);
        assert_eq!(pr.summary_status, SummaryStatus::Pending);
        assert_eq!(pr.number, 7);

        let mut second = make_upsert("12345", 7);
        second.title = "Fix header parsing (v2)".to_string();
        let (updated, created) = repo.upsert(&second).await.unwrap();
        assert!(!created);
        assert_eq!(updated.id, pr.id);
        assert_eq!(updated.title, "Fix header parsing (v2)");
        assert_eq!(updated.created_at, pr.created_at);
    }

    #[tokio::test]
    async fn redelivered_upserts_keep_one_document() {
        let pool = create_test_pool().await;
        let repo = PullRequestRepository::new(pool.clone());

        for _ in 0..3 {
            repo.upsert(&make_upsert("12345", 7)).await.unwrap();
        }

        let count = repo.count_by_installation_and_repo(77, "12345").await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn analysis_survives_summary_error() {
        let pool = create_test_pool().await;
        let repo = PullRequestRepository::new(pool);
        let (pr, _) = repo.upsert(&make_upsert("12345", 7)).await.unwrap();

        let analysis = crate::analyzer::analyze(&[crate::analyzer::FileChange {
            filename: "src/auth/session.ts".to_string(),
            additions: 4,
            deletions: 0,
            patch: None,
        }]);
        repo.update_analysis(&pr.id, &analysis).await.unwrap();
        repo.save_summary_error(&pr.id, "model unavailable").await.unwrap();

        let stored = repo.find_by_id(&pr.id).await.unwrap().unwrap();
        assert_eq!(stored.summary_status, SummaryStatus::Error);
        assert_eq!(stored.summary_error.as_deref(), Some("model unavailable"));
        assert!(stored.summary.is_none());
        assert_eq!(stored.risk_score, 20);
        assert!(stored.risk_flags.contains(&"auth-change".to_string()));
        assert!(stored.diff_stats.is_some());
    }

    #[tokio::test]
    async fn summary_error_is_truncated_to_500_chars() {
        let pool = create_test_pool().await;
        let repo = PullRequestRepository::new(pool);
        let (pr, _) = repo.upsert(&make_upsert("12345", 7)).await.unwrap();

        let long = "x".repeat(2000);
        repo.save_summary_error(&pr.id, &long).await.unwrap();

        let stored = repo.find_by_id(&pr.id).await.unwrap().unwrap();
        assert_eq!(stored.summary_error.unwrap().chars().count(), 500);
    }

    #[tokio::test]
    async fn summary_success_clears_error() {
        let pool = create_test_pool().await;
        let repo = PullRequestRepository::new(pool);
        let (pr, _) = repo.upsert(&make_upsert("12345", 7)).await.unwrap();

        repo.save_summary_error(&pr.id, "transient").await.unwrap();
        let summary = Summary {
            tldr: "Parser fix.".to_string(),
            risks: vec![],
            labels: vec!["backend".to_string()],
            created_at: Utc::now(),
        };
        repo.save_summary_success(&pr.id, &summary).await.unwrap();

        let stored = repo.find_by_id(&pr.id).await.unwrap().unwrap();
        assert_eq!(stored.summary_status, SummaryStatus::Ready);
        assert!(stored.summary_error.is_none());
        assert_eq!(stored.summary.unwrap().tldr, "Parser fix.");
        assert!(stored.last_summarized_at.is_some());
    }

    #[tokio::test]
    async fn chat_message_ts_is_set_once() {
        let pool = create_test_pool().await;
        let repo = PullRequestRepository::new(pool);
        let (pr, _) = repo.upsert(&make_upsert("12345", 7)).await.unwrap();

        assert!(repo.set_chat_message_ts(&pr.id, "1712.001").await.unwrap());
        assert!(!repo.set_chat_message_ts(&pr.id, "1712.002").await.unwrap());

        let stored = repo.find_by_id(&pr.id).await.unwrap().unwrap();
        assert_eq!(stored.chat_message_ts.as_deref(), Some("1712.001"));
    }

    #[tokio::test]
    async fn reopen_resets_summary_state() {
        let pool = create_test_pool().await;
        let repo = PullRequestRepository::new(pool);
        let (pr, _) = repo.upsert(&make_upsert("12345", 7)).await.unwrap();

        repo.save_summary_error(&pr.id, "failed").await.unwrap();
        repo.set_status("12345", 7, PrStatus::Closed).await.unwrap();
        repo.reopen("12345", 7).await.unwrap();

        let stored = repo.find_by_id(&pr.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PrStatus::Open);
        assert_eq!(stored.summary_status, SummaryStatus::Pending);
        assert!(stored.summary_error.is_none());
    }

    #[tokio::test]
    async fn find_by_user_is_tenancy_scoped() {
        let pool = create_test_pool().await;
        let prs = PullRequestRepository::new(pool.clone());
        let users = UserRepository::new(pool);

        prs.upsert(&make_upsert("12345", 7)).await.unwrap();
        let mut other = make_upsert("99999", 3);
        other.installation_id = 88;
        prs.upsert(&other).await.unwrap();

        let alice = users
            .upsert(&NewUser {
                platform_id: 1,
                username: "alice".to_string(),
                email: String::new(),
                avatar_url: String::new(),
                role: Role::Viewer,
            })
            .await
            .unwrap();
        users.link_installation(&alice.id, 77).await.unwrap();
        let alice = users.find_by_username("alice").await.unwrap().unwrap();

        let visible = prs.find_by_user(&alice, None, 50, 0).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].installation_id, 77);

        let closed_only = prs
            .find_by_user(&alice, Some(PrStatus::Closed), 50, 0)
            .await
            .unwrap();
        assert!(closed_only.is_empty());
    }
}
