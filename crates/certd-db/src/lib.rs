//! Persisted certificate store
//!
//! SeaORM entities, migrations and the repository layer used by the
//! lifecycle manager and the renewal scheduler.

pub mod entities;
pub mod migrator;
pub mod store;

pub use entities::certificate::{self, CertStatus};
pub use store::CertificateStore;

use sea_orm::{Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;
use tracing::info;

/// Connect to the database at the given URL (SQLite or Postgres)
pub async fn connect(url: &str) -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect(url).await?;
    info!("Database connection established");
    Ok(db)
}

/// Run all pending migrations
pub async fn migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    migrator::Migrator::up(db, None).await?;
    info!("Database migrations applied");
    Ok(())
}
