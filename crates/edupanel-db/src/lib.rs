//! # edupanel-db
//!
//! Storage backends for edupanel.
//!
//! This crate provides:
//! - Connection pool management and schema migrations
//! - `PgRecordStore`, the PostgreSQL record store
//! - `FilesystemAttachmentStore`, the local-directory attachment store
//! - In-memory stores with fault injection for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use edupanel_db::{Database, NewRecord, RecordKind, RecordStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/edupanel").await?;
//!     db.migrate().await?;
//!
//!     let category = db.records.create(NewRecord::new(RecordKind::Category, "Science")).await?;
//!     println!("Created category: {}", category.id);
//!     Ok(())
//! }
//! ```
pub mod file_storage;
pub mod memory;
pub mod pool;
pub mod records;

// Re-export core types
pub use edupanel_core::*;

pub use file_storage::FilesystemAttachmentStore;
pub use memory::{CallJournal, Fault, MemoryAttachmentStore, MemoryRecordStore, StoreOp};
pub use pool::{create_pool, create_pool_with_config, run_migrations, PoolConfig};
pub use records::PgRecordStore;

/// Default database URL for integration tests.
pub const DEFAULT_TEST_DATABASE_URL: &str = defaults::DATABASE_URL;

/// Database handle bundling the pool and the record store.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Record store for all content kinds.
    pub records: PgRecordStore,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            records: PgRecordStore::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        run_migrations(&self.pool).await
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
