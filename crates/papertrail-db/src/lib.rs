//! # papertrail-db
//!
//! PostgreSQL + pgvector record store for PaperTrail.
//!
//! Provides the PostgreSQL implementations of the repository traits from
//! `papertrail-core`: catalog items, relationship edges and import tasks.
//!
//! ## Example
//!
//! ```ignore
//! use papertrail_db::Database;
//!
//! let db = Database::connect("postgres://localhost/papertrail").await?;
//! db.migrate().await?;
//!
//! let placeholders = db.items.count_by_status(EnrichmentStatus::Placeholder).await?;
//! ```

pub mod edges;
pub mod items;
pub mod pool;
pub mod tasks;

use std::sync::Arc;

pub use edges::PgEdgeRepository;
pub use items::PgCatalogRepository;
pub use pool::{PoolConfig, PoolStats};
pub use tasks::PgImportTaskRepository;

#[cfg(feature = "migrations")]
use papertrail_core::Error;
use papertrail_core::Result;

/// All repositories over one connection pool.
///
/// Repositories are behind `Arc` so they can be handed to the workers as
/// trait objects.
#[derive(Clone)]
pub struct Database {
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub items: Arc<PgCatalogRepository>,
    pub edges: Arc<PgEdgeRepository>,
    pub tasks: Arc<PgImportTaskRepository>,
}

impl Database {
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            items: Arc::new(PgCatalogRepository::new(pool.clone())),
            edges: Arc::new(PgEdgeRepository::new(pool.clone())),
            tasks: Arc::new(PgImportTaskRepository::new(pool.clone())),
            pool,
        }
    }

    /// Connect with pool settings from the environment.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PoolConfig::from_env().connect(database_url).await?;
        Ok(Self::new(pool))
    }

    /// Current pool occupancy.
    pub fn pool_stats(&self) -> PoolStats {
        PoolStats::of(&self.pool)
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
