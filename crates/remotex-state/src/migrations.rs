//! SurrealDB schema initialization
//!
//! Defines every remotex table with its indexes. Safe to call on every
//! connection (idempotent, `IF NOT EXISTS`).

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Initialize all remotex tables.
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("initializing remotex schema");

    init_users_table(db).await?;
    init_projects_table(db).await?;
    init_builds_table(db).await?;
    init_files_table(db).await?;

    info!("remotex schema initialization complete");
    Ok(())
}

/// Run a batch of DEFINE statements and surface per-statement errors.
async fn define(db: &Surreal<Any>, sql: &str) -> StorageResult<()> {
    db.query(sql)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?
        .check()
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    Ok(())
}

/// `users { name (unique), created_at, created_us }`
async fn init_users_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("initializing users table");
    define(
        db,
        r#"
        DEFINE TABLE IF NOT EXISTS users SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_user_name ON TABLE users COLUMNS name UNIQUE;
        "#,
    )
    .await
}

/// `projects { project_id (unique), owner, name, public, created_at, created_us }`
///
/// `(owner, name)` is unique.
async fn init_projects_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("initializing projects table");
    define(
        db,
        r#"
        DEFINE TABLE IF NOT EXISTS projects SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_project_id ON TABLE projects COLUMNS project_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_project_owner_name ON TABLE projects COLUMNS owner, name UNIQUE;
        "#,
    )
    .await
}

/// `builds { build_id (unique), project_id, started_at, started_us,
/// duration_ms, state, exit_code?, options, output, pending_key }`
///
/// `pending_key` is unique: at most one `pending` row per project.
async fn init_builds_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("initializing builds table");
    define(
        db,
        r#"
        DEFINE TABLE IF NOT EXISTS builds SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_build_id ON TABLE builds COLUMNS build_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_build_project ON TABLE builds COLUMNS project_id;
        DEFINE INDEX IF NOT EXISTS idx_build_state ON TABLE builds COLUMNS project_id, state;
        DEFINE INDEX IF NOT EXISTS idx_build_pending ON TABLE builds COLUMNS pending_key UNIQUE;
        "#,
    )
    .await
}

/// `files { project_id, subdir, path, size, digest }`, unique per
/// `(project_id, subdir, path)`.
async fn init_files_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("initializing files table");
    define(
        db,
        r#"
        DEFINE TABLE IF NOT EXISTS files SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_file_key ON TABLE files COLUMNS project_id, subdir, path UNIQUE;
        "#,
    )
    .await
}
