//! Database connection pool, migrations, and health check.
//!
//! One Postgres pool serves the job broker, the collaborator reads and the
//! score ledger.

pub mod activity;
pub mod jobs;

pub use jobs::PgBroker;

use std::time::Duration;

use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool shared across all modules.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Open a broker handle on this pool.
    pub fn broker(&self, visibility_timeout: Duration) -> PgBroker {
        PgBroker::new(self.pool.clone(), visibility_timeout)
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
