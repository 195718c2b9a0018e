//! src/db.rs
//!
//! SQLite pool setup and schema migrations for the session store.

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;

/// Schema statements, embedded so the runner works from any working
/// directory (unit tests included).
const MIGRATION_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Open a SQLite pool for `database_url`.
///
/// In-memory SQLite databases exist per connection, so a pooled
/// `sqlite::memory:` would hand every connection its own empty schema.
/// Those URLs are pinned to a single connection.
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

/// Run the embedded schema statements one at a time.
///
/// Every statement is `IF NOT EXISTS`-guarded, so this is safe to run at
/// each startup.
pub async fn run_migrations(db: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = MIGRATION_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::debug!("Running {} migration statements...", statements.len());

    for stmt in statements {
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply_and_are_idempotent() {
        let db = connect("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        run_migrations(&db).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_sessions")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn active_session_index_is_partial() {
        let db = connect("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();

        let insert = "INSERT INTO upload_sessions
                      (id, filename, filesize, key, upload_id, status, created_at, updated_at)
                      VALUES (?, 'f.bin', 10, ?, 'u', ?, '2026-01-01', '2026-01-01')";

        sqlx::query(insert)
            .bind("a")
            .bind("k1")
            .bind("aborted")
            .execute(&db)
            .await
            .unwrap();
        sqlx::query(insert)
            .bind("b")
            .bind("k2")
            .bind("in_progress")
            .execute(&db)
            .await
            .unwrap();

        // Only a second in-progress row for the same file collides.
        let err = sqlx::query(insert)
            .bind("c")
            .bind("k3")
            .bind("in_progress")
            .execute(&db)
            .await
            .unwrap_err();
        assert!(err.to_string().to_ascii_lowercase().contains("unique"));
    }
}
