use sqlx::SqlitePool;

use crate::error::Result;

/// Create all tables and indexes. Idempotent; run once at startup.
///
/// The unique index on `pull_requests(repo_id, number)` is the idempotency
/// anchor for webhook redeliveries.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS installations (
            installation_id INTEGER PRIMARY KEY,
            account_type TEXT NOT NULL CHECK (account_type IN ('user', 'organization')),
            account_login TEXT NOT NULL,
            account_avatar_url TEXT NOT NULL DEFAULT '',
            suspended_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS installation_repositories (
            installation_id INTEGER NOT NULL REFERENCES installations(installation_id),
            repo_id TEXT NOT NULL,
            repo_full_name TEXT NOT NULL,
            private INTEGER NOT NULL DEFAULT 0,
            installed_at TEXT NOT NULL,
            PRIMARY KEY (installation_id, repo_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            platform_id INTEGER NOT NULL UNIQUE,
            username TEXT NOT NULL,
            email TEXT NOT NULL DEFAULT '',
            avatar_url TEXT NOT NULL DEFAULT '',
            role TEXT NOT NULL DEFAULT 'viewer' CHECK (role IN ('admin', 'viewer')),
            last_login_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_installations (
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            installation_id INTEGER NOT NULL,
            PRIMARY KEY (user_id, installation_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_user_installations_installation
         ON user_installations(installation_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pull_requests (
            id TEXT PRIMARY KEY,
            installation_id INTEGER NOT NULL,
            repo_id TEXT NOT NULL,
            number INTEGER NOT NULL,
            user_id TEXT,
            repo_full_name TEXT NOT NULL,
            title TEXT NOT NULL,
            author TEXT NOT NULL,
            branch_from TEXT NOT NULL DEFAULT '',
            branch_to TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'closed', 'merged')),
            files_changed TEXT NOT NULL DEFAULT '[]',
            summary TEXT,
            summary_status TEXT NOT NULL DEFAULT 'pending'
                CHECK (summary_status IN ('pending', 'ready', 'error')),
            summary_error TEXT,
            last_summarized_at TEXT,
            system_labels TEXT NOT NULL DEFAULT '[]',
            risk_flags TEXT NOT NULL DEFAULT '[]',
            risk_score INTEGER NOT NULL DEFAULT 0 CHECK (risk_score BETWEEN 0 AND 100),
            diff_stats TEXT,
            chat_message_ts TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (repo_id, number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pull_requests_installation
         ON pull_requests(installation_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pull_requests_installation_status
         ON pull_requests(installation_id, status)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            name TEXT NOT NULL,
            data TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'active', 'completed', 'dead')),
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            run_at TEXT NOT NULL,
            locked_at TEXT,
            completed_at TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_queue_status_run_at ON jobs(queue, status, run_at)")
        .execute(pool)
        .await?;

    tracing::debug!("store migrations applied");
    Ok(())
}
