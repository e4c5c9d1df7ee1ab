//! Store schema.
//!
//! Five data tables plus `schema_meta`:
//!
//! | Table | Holds |
//! |-------|-------|
//! | `patterns` | pattern metadata and content hash |
//! | `embeddings` | little-endian f32 vector BLOB per pattern |
//! | `usage_metrics` | the only rows mutated after creation |
//! | `tag_index` | tag → pattern id |
//! | `file_path_index` | touched path → pattern id |
//!
//! Every statement is `IF NOT EXISTS`, so running this on an existing
//! store is a no-op. Version 1 stores gain the feedback columns of
//! `usage_metrics` in place.

use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::SCHEMA_VERSION;

/// Columns added to `usage_metrics` after version 1.
const USAGE_METRICS_V2: &[(&str, &str)] = &[
    ("feedback_count", "INTEGER NOT NULL DEFAULT 0"),
    ("avg_feedback", "REAL"),
    ("relevance_count", "INTEGER NOT NULL DEFAULT 0"),
    ("avg_relevance", "REAL"),
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS patterns (
            id TEXT PRIMARY KEY,
            revision_id TEXT NOT NULL,
            revision_message TEXT NOT NULL,
            file_path TEXT NOT NULL,
            pattern_type TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            description TEXT NOT NULL,
            extras_json TEXT NOT NULL DEFAULT '{}',
            content_hash TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            pattern_id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            norm REAL NOT NULL,
            vector BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (pattern_id) REFERENCES patterns(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usage_metrics (
            pattern_id TEXT PRIMARY KEY,
            usage_count INTEGER NOT NULL DEFAULT 0,
            last_used_at INTEGER,
            surfaced_count INTEGER NOT NULL DEFAULT 0,
            last_surfaced_at INTEGER,
            feedback_count INTEGER NOT NULL DEFAULT 0,
            avg_feedback REAL,
            relevance_count INTEGER NOT NULL DEFAULT 0,
            avg_relevance REAL,
            FOREIGN KEY (pattern_id) REFERENCES patterns(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tag_index (
            tag TEXT NOT NULL,
            pattern_id TEXT NOT NULL,
            PRIMARY KEY (tag, pattern_id),
            FOREIGN KEY (pattern_id) REFERENCES patterns(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_path_index (
            file_path TEXT NOT NULL,
            pattern_id TEXT NOT NULL,
            PRIMARY KEY (file_path, pattern_id),
            FOREIGN KEY (pattern_id) REFERENCES patterns(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_patterns_created_at ON patterns(created_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tag_index_pattern ON tag_index(pattern_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_file_path_index_pattern ON file_path_index(pattern_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?)")
        .bind(SCHEMA_VERSION.to_string())
        .execute(pool)
        .await?;

    let version: String =
        sqlx::query_scalar("SELECT value FROM schema_meta WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await?;
    let version: u32 = version.parse().map_err(|_| {
        Error::Database(sqlx::Error::Protocol(format!(
            "unreadable schema version '{}'",
            version
        )))
    })?;
    if version > SCHEMA_VERSION {
        return Err(Error::Database(sqlx::Error::Protocol(format!(
            "store schema version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        ))));
    }
    if version < SCHEMA_VERSION {
        upgrade_usage_metrics(pool).await?;
        sqlx::query("UPDATE schema_meta SET value = ? WHERE key = 'schema_version'")
            .bind(SCHEMA_VERSION.to_string())
            .execute(pool)
            .await?;
        tracing::info!(from = version, to = SCHEMA_VERSION, "upgraded store schema");
    }

    Ok(())
}

async fn upgrade_usage_metrics(pool: &SqlitePool) -> Result<()> {
    let existing: Vec<String> = sqlx::query("PRAGMA table_info(usage_metrics)")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| row.get::<String, _>("name"))
        .collect();
    for (column, decl) in USAGE_METRICS_V2 {
        if !existing.iter().any(|c| c == column) {
            sqlx::query(&format!(
                "ALTER TABLE usage_metrics ADD COLUMN {} {}",
                column, decl
            ))
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_version_one_store_gains_feedback_columns() {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect(&tmp.path().join("old.sqlite")).await.unwrap();
        sqlx::query("CREATE TABLE schema_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO schema_meta (key, value) VALUES ('schema_version', '1')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE usage_metrics (
                pattern_id TEXT PRIMARY KEY,
                usage_count INTEGER NOT NULL DEFAULT 0,
                last_used_at INTEGER,
                surfaced_count INTEGER NOT NULL DEFAULT 0,
                last_surfaced_at INTEGER
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let columns: Vec<String> = sqlx::query("PRAGMA table_info(usage_metrics)")
            .fetch_all(&pool)
            .await
            .unwrap()
            .iter()
            .map(|r| r.get::<String, _>("name"))
            .collect();
        for (column, _) in USAGE_METRICS_V2 {
            assert!(columns.iter().any(|c| c == column), "missing {}", column);
        }
        let version: String =
            sqlx::query_scalar("SELECT value FROM schema_meta WHERE key = 'schema_version'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }
}
