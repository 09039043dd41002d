//! Installs the row-change trigger function.
//!
//! Only used in dev mode. In production the producing services own their
//! schema and attach the trigger themselves.

use std::path::PathBuf;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::error::DbError;

/// Run pending migrations against `database_url` over a short-lived pool.
pub async fn run_migrations(database_url: &str) -> Result<(), DbError> {
    info!("Running database migrations");

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .map_err(DbError::Connect)?;

    let candidates = vec![
        PathBuf::from("./migrations"),
        PathBuf::from("services/event-relay/migrations"),
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
    ];
    let mut last_error: Option<sqlx::migrate::MigrateError> = None;

    for dir in &candidates {
        match sqlx::migrate::Migrator::new(dir.clone()).await {
            Ok(migrator) => {
                info!(migrations_dir = %dir.display(), "Loaded migrations");
                let result = migrator.run(&pool).await.map_err(DbError::Migration);
                pool.close().await;
                result?;
                info!("Database migrations complete");
                return Ok(());
            }
            Err(e) => last_error = Some(e),
        }
    }
    pool.close().await;

    let tried = candidates
        .iter()
        .map(|dir| dir.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");

    Err(DbError::MigrationDirNotFound {
        tried,
        last_error: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string()),
    })
}
