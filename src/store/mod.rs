pub mod installations;
pub mod pool;
pub mod pull_requests;
pub mod schema;
pub mod testing;
pub mod users;

use sqlx::SqlitePool;

use crate::error::Result;

use installations::InstallationRepository;
use pull_requests::PullRequestRepository;
use users::UserRepository;

/// Handle over the durable store: one pool, one repository per collection.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    pub installations: InstallationRepository,
    pub users: UserRepository,
    pub pull_requests: PullRequestRepository,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = pool::create_pool(database_url).await?;
        schema::migrate(&pool).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            installations: InstallationRepository::new(pool.clone()),
            users: UserRepository::new(pool.clone()),
            pull_requests: PullRequestRepository::new(pool.clone()),
            pool,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Health probe: one round trip to the store.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
