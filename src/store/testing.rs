use sqlx::sqlite::SqlitePool;

use super::schema;

/// In-memory store with the full schema applied. For tests only.
pub async fn create_test_pool() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    schema::migrate(&pool).await.unwrap();
    pool
}
