//! Transactional pattern/vector store over a single SQLite file.
//!
//! [`VectorStore::insert_batch`] writes patterns, their embeddings, initial
//! usage metrics, and both secondary indexes in one transaction, so a
//! batch is either fully visible or not at all. Re-inserting a pattern whose
//! content hash and embedding model are both unchanged is a no-op, and an
//! upsert never touches existing usage metrics.

use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{Error, Result};
use crate::migrate;
use crate::models::{
    EmbeddingRecord, Feedback, Pattern, PatternExtras, PatternRecord, PatternType, StoredPattern,
    UsageMetrics,
};

/// Result of one `insert_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub written: usize,
    /// Already present with identical content and model.
    pub unchanged: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub record_count: u64,
    pub database_size_bytes: u64,
}

/// Narrows the candidate set using the secondary indexes.
#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    /// Every tag must be present.
    pub tags: Vec<String>,
    /// At least one touched path must start with this.
    pub path_prefix: Option<String>,
    /// Only patterns created at or after this unix time.
    pub since: Option<i64>,
}

impl CandidateFilter {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.path_prefix.is_none() && self.since.is_none()
    }
}

pub struct VectorStore {
    pool: SqlitePool,
    path: PathBuf,
}

const SELECT_METRICS: &str = r#"
    SELECT usage_count, last_used_at, surfaced_count, last_surfaced_at,
           feedback_count, avg_feedback, relevance_count, avg_relevance
    FROM usage_metrics WHERE pattern_id = ?"#;

const SELECT_STORED: &str = r#"
    SELECT p.id, p.revision_id, p.revision_message, p.file_path, p.pattern_type,
           p.tags_json, p.created_at, p.description, p.extras_json,
           e.vector,
           COALESCE(m.usage_count, 0) AS usage_count, m.last_used_at,
           COALESCE(m.surfaced_count, 0) AS surfaced_count, m.last_surfaced_at,
           COALESCE(m.feedback_count, 0) AS feedback_count, m.avg_feedback,
           COALESCE(m.relevance_count, 0) AS relevance_count, m.avg_relevance
    FROM patterns p
    JOIN embeddings e ON e.pattern_id = p.id
    LEFT JOIN usage_metrics m ON m.pattern_id = p.id
    WHERE 1 = 1"#;

impl VectorStore {
    /// Open the store at `path`, creating the file and tables if absent.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Vector dimension fixed by the first insert, if any.
    pub async fn dims(&self) -> Result<Option<usize>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM schema_meta WHERE key = 'dims'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    /// Ids among `patterns` already stored with identical content and
    /// embedded by `model`. Anything else needs (re-)embedding. With no
    /// `model`, only the content is compared.
    pub async fn unchanged_ids(
        &self,
        patterns: &[Pattern],
        model: Option<&str>,
    ) -> Result<HashSet<String>> {
        let mut out = HashSet::new();
        for pattern in patterns {
            let stored = sqlx::query(
                r#"
                SELECT p.content_hash, e.model
                FROM patterns p LEFT JOIN embeddings e ON e.pattern_id = p.id
                WHERE p.id = ?
                "#,
            )
            .bind(&pattern.id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = stored {
                if is_current(&row, &pattern.content_hash()?, model) {
                    out.insert(pattern.id.clone());
                }
            }
        }
        Ok(out)
    }

    /// Write a batch atomically.
    ///
    /// Vectors must already be unit length (see [`EmbeddingRecord::new`]);
    /// the record's pre-normalization norm is stored as given. The first
    /// batch ever written fixes the store's dimension; a later vector of
    /// another length fails the whole batch with [`Error::DimensionMismatch`].
    pub async fn insert_batch(&self, records: &[PatternRecord]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.pool.begin().await?;

        let stored_dims: Option<String> =
            sqlx::query_scalar("SELECT value FROM schema_meta WHERE key = 'dims'")
                .fetch_optional(&mut *tx)
                .await?;
        let dims = match stored_dims.and_then(|v| v.parse::<usize>().ok()) {
            Some(d) => d,
            None => {
                let d = records[0].embedding.vector.len();
                sqlx::query("INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('dims', ?)")
                    .bind(d.to_string())
                    .execute(&mut *tx)
                    .await?;
                d
            }
        };

        for record in records {
            let pattern = &record.pattern;
            let embedding = &record.embedding;

            if embedding.vector.len() != dims {
                return Err(Error::DimensionMismatch {
                    expected: dims,
                    actual: embedding.vector.len(),
                });
            }

            let hash = pattern.content_hash()?;
            let existing = sqlx::query(
                r#"
                SELECT p.content_hash, e.model
                FROM patterns p LEFT JOIN embeddings e ON e.pattern_id = p.id
                WHERE p.id = ?
                "#,
            )
            .bind(&pattern.id)
            .fetch_optional(&mut *tx)
            .await?;
            if existing.is_some_and(|row| is_current(&row, &hash, Some(embedding.model.as_str()))) {
                outcome.unchanged += 1;
                continue;
            }

            let length: f32 = embedding.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            if (length - 1.0).abs() > 1e-4 {
                return Err(Error::InvalidInput(format!(
                    "pattern {} has an embedding of length {}, expected a unit vector",
                    pattern.id, length
                )));
            }

            let tags_json = serde_json::to_string(&pattern.tags)?;
            let extras_json = serde_json::to_string(&pattern.extras)?;

            sqlx::query(
                r#"
                INSERT INTO patterns (id, revision_id, revision_message, file_path, pattern_type,
                                      tags_json, created_at, description, extras_json, content_hash)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    revision_id = excluded.revision_id,
                    revision_message = excluded.revision_message,
                    file_path = excluded.file_path,
                    pattern_type = excluded.pattern_type,
                    tags_json = excluded.tags_json,
                    created_at = excluded.created_at,
                    description = excluded.description,
                    extras_json = excluded.extras_json,
                    content_hash = excluded.content_hash
                "#,
            )
            .bind(&pattern.id)
            .bind(&pattern.revision_id)
            .bind(&pattern.revision_message)
            .bind(&pattern.file_path)
            .bind(pattern.pattern_type.as_str())
            .bind(&tags_json)
            .bind(pattern.created_at)
            .bind(&pattern.description)
            .bind(&extras_json)
            .bind(&hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT OR REPLACE INTO embeddings (pattern_id, model, dims, norm, vector, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&pattern.id)
            .bind(&embedding.model)
            .bind(dims as i64)
            .bind(f64::from(embedding.norm))
            .bind(vec_to_blob(&embedding.vector))
            .bind(embedding.created_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT OR IGNORE INTO usage_metrics (pattern_id) VALUES (?)")
                .bind(&pattern.id)
                .execute(&mut *tx)
                .await?;

            sqlx::query("DELETE FROM tag_index WHERE pattern_id = ?")
                .bind(&pattern.id)
                .execute(&mut *tx)
                .await?;
            for tag in &pattern.tags {
                sqlx::query("INSERT OR IGNORE INTO tag_index (tag, pattern_id) VALUES (?, ?)")
                    .bind(tag)
                    .bind(&pattern.id)
                    .execute(&mut *tx)
                    .await?;
            }

            sqlx::query("DELETE FROM file_path_index WHERE pattern_id = ?")
                .bind(&pattern.id)
                .execute(&mut *tx)
                .await?;
            for path in pattern.all_paths() {
                sqlx::query(
                    "INSERT OR IGNORE INTO file_path_index (file_path, pattern_id) VALUES (?, ?)",
                )
                .bind(path)
                .bind(&pattern.id)
                .execute(&mut *tx)
                .await?;
            }

            outcome.written += 1;
        }

        tx.commit().await?;
        tracing::debug!(
            written = outcome.written,
            unchanged = outcome.unchanged,
            "committed batch"
        );
        Ok(outcome)
    }

    /// Every stored pattern with its vector and metrics, newest first.
    pub async fn get_all_embeddings(&self) -> Result<Vec<StoredPattern>> {
        self.get_embeddings(&CandidateFilter::default()).await
    }

    /// Stored patterns matching `filter`, narrowed through the index tables.
    pub async fn get_embeddings(&self, filter: &CandidateFilter) -> Result<Vec<StoredPattern>> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(SELECT_STORED);
        for tag in &filter.tags {
            qb.push(" AND p.id IN (SELECT pattern_id FROM tag_index WHERE tag = ");
            qb.push_bind(tag.clone());
            qb.push(")");
        }
        if let Some(prefix) = &filter.path_prefix {
            qb.push(" AND p.id IN (SELECT pattern_id FROM file_path_index WHERE substr(file_path, 1, ");
            qb.push_bind(prefix.chars().count() as i64);
            qb.push(") = ");
            qb.push_bind(prefix.clone());
            qb.push(")");
        }
        if let Some(since) = filter.since {
            qb.push(" AND p.created_at >= ");
            qb.push_bind(since);
        }
        qb.push(" ORDER BY p.created_at DESC, p.id ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(stored_from_row).collect()
    }

    pub async fn get_pattern(&self, id: &str) -> Result<Option<Pattern>> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(SELECT_STORED);
        qb.push(" AND p.id = ");
        qb.push_bind(id.to_string());
        let row = qb.build().fetch_optional(&self.pool).await?;
        row.as_ref()
            .map(stored_from_row)
            .transpose()
            .map(|s| s.map(|s| s.pattern))
    }

    /// The stored embedding of one pattern.
    pub async fn get_embedding(&self, id: &str) -> Result<Option<EmbeddingRecord>> {
        let row = sqlx::query(
            "SELECT vector, norm, created_at, model FROM embeddings WHERE pattern_id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| EmbeddingRecord {
            vector: blob_to_vec(&r.get::<Vec<u8>, _>("vector")),
            norm: r.get::<f64, _>("norm") as f32,
            created_at: r.get("created_at"),
            model: r.get("model"),
        }))
    }

    pub async fn get_metrics(&self, id: &str) -> Result<Option<UsageMetrics>> {
        let row = sqlx::query(SELECT_METRICS)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(metrics_from_row))
    }

    /// Count an explicit acceptance of a recommendation.
    pub async fn record_usage(&self, id: &str) -> Result<UsageMetrics> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM patterns WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(Error::PatternNotFound(id.to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO usage_metrics (pattern_id, usage_count, last_used_at)
            VALUES (?, 1, ?)
            ON CONFLICT(pattern_id) DO UPDATE SET
                usage_count = usage_count + 1,
                last_used_at = excluded.last_used_at
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(SELECT_METRICS)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(metrics_from_row(&row))
    }

    /// Fold one piece of feedback into the pattern's running averages.
    ///
    /// `relevance` is the final score the pattern had when the feedback was
    /// given, when known. Neither average feeds into ranking.
    pub async fn record_feedback(
        &self,
        id: &str,
        feedback: Feedback,
        relevance: Option<f64>,
    ) -> Result<UsageMetrics> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM patterns WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(Error::PatternNotFound(id.to_string()));
        }

        sqlx::query("INSERT OR IGNORE INTO usage_metrics (pattern_id) VALUES (?)")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE usage_metrics SET
                avg_feedback = (COALESCE(avg_feedback, 0) * feedback_count + ?) / (feedback_count + 1),
                feedback_count = feedback_count + 1
            WHERE pattern_id = ?
            "#,
        )
        .bind(feedback.score() as f64)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if let Some(relevance) = relevance {
            sqlx::query(
                r#"
                UPDATE usage_metrics SET
                    avg_relevance = (COALESCE(avg_relevance, 0) * relevance_count + ?) / (relevance_count + 1),
                    relevance_count = relevance_count + 1
                WHERE pattern_id = ?
                "#,
            )
            .bind(relevance)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        let row = sqlx::query(SELECT_METRICS)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(metrics_from_row(&row))
    }

    /// Note that patterns were shown to a user. Does not affect ranking.
    pub async fn record_surfaced(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                r#"
                UPDATE usage_metrics
                SET surfaced_count = surfaced_count + 1, last_surfaced_at = ?
                WHERE pattern_id = ?
                "#,
            )
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let record_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM patterns")
            .fetch_one(&self.pool)
            .await?;
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;
        let file_size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        Ok(StoreStats {
            record_count: record_count.max(0) as u64,
            database_size_bytes: file_size.max((page_count * page_size).max(0) as u64),
        })
    }

    /// `(pattern type, count)` sorted by count descending.
    pub async fn type_counts(&self) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query(
            "SELECT pattern_type, COUNT(*) AS n FROM patterns GROUP BY pattern_type ORDER BY n DESC, pattern_type ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("pattern_type"), r.get::<i64, _>("n").max(0) as u64))
            .collect())
    }

    /// Most common tags, at most `limit`.
    pub async fn top_tags(&self, limit: usize) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query(
            "SELECT tag, COUNT(*) AS n FROM tag_index GROUP BY tag ORDER BY n DESC, tag ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("tag"), r.get::<i64, _>("n").max(0) as u64))
            .collect())
    }

    /// Newest revision time in the store.
    pub async fn latest_created_at(&self) -> Result<Option<i64>> {
        let ts: Option<i64> = sqlx::query_scalar("SELECT MAX(created_at) FROM patterns")
            .fetch_one(&self.pool)
            .await?;
        Ok(ts)
    }
}

fn decode_err(message: String) -> Error {
    Error::Database(sqlx::Error::Decode(message.into()))
}

fn stored_from_row(row: &SqliteRow) -> Result<StoredPattern> {
    let type_str: String = row.get("pattern_type");
    let pattern_type = PatternType::parse(&type_str)
        .ok_or_else(|| decode_err(format!("unknown pattern type '{}'", type_str)))?;
    let tags: BTreeSet<String> = serde_json::from_str(&row.get::<String, _>("tags_json"))?;
    let extras: PatternExtras = serde_json::from_str(&row.get::<String, _>("extras_json"))?;
    let blob: Vec<u8> = row.get("vector");

    Ok(StoredPattern {
        pattern: Pattern {
            id: row.get("id"),
            revision_id: row.get("revision_id"),
            revision_message: row.get("revision_message"),
            file_path: row.get("file_path"),
            pattern_type,
            tags,
            created_at: row.get("created_at"),
            description: row.get("description"),
            extras,
        },
        vector: blob_to_vec(&blob),
        metrics: metrics_from_row(row),
    })
}

fn metrics_from_row(row: &SqliteRow) -> UsageMetrics {
    UsageMetrics {
        usage_count: row.get::<i64, _>("usage_count").max(0) as u64,
        last_used_at: row.get("last_used_at"),
        surfaced_count: row.get::<i64, _>("surfaced_count").max(0) as u64,
        last_surfaced_at: row.get("last_surfaced_at"),
        feedback_count: row.get::<i64, _>("feedback_count").max(0) as u64,
        avg_feedback: row.get("avg_feedback"),
        relevance_count: row.get::<i64, _>("relevance_count").max(0) as u64,
        avg_relevance: row.get("avg_relevance"),
    }
}

/// Stored content hash matches, and so does the embedding model when one
/// is given.
fn is_current(row: &SqliteRow, hash: &str, model: Option<&str>) -> bool {
    let stored_hash: String = row.get("content_hash");
    let stored_model: Option<String> = row.get("model");
    stored_hash == hash && model.map_or(true, |m| stored_model.as_deref() == Some(m))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::models::EmbeddingRecord;

    pub fn pattern(rev: &str, path: &str, created_at: i64, tags: &[&str]) -> Pattern {
        Pattern {
            id: Pattern::derive_id(rev, path),
            revision_id: rev.to_string(),
            revision_message: format!("feat: change {}", path),
            file_path: path.to_string(),
            pattern_type: PatternType::FeatureImplementation,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            created_at,
            description: format!("Feature implementation: change {}", path),
            extras: PatternExtras::default(),
        }
    }

    pub fn record(pattern: Pattern, vector: Vec<f32>) -> PatternRecord {
        PatternRecord {
            embedding: EmbeddingRecord::new(vector, "test", pattern.created_at),
            pattern,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{pattern, record};
    use super::*;
    use tempfile::TempDir;

    async fn open_temp() -> (TempDir, VectorStore) {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::open(&tmp.path().join("data/store.sqlite"))
            .await
            .unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.sqlite");
        VectorStore::open(&path).await.unwrap().close().await;
        let store = VectorStore::open(&path).await.unwrap();
        assert_eq!(store.stats().await.unwrap().record_count, 0);
    }

    #[tokio::test]
    async fn test_insert_keeps_unit_vector_and_raw_norm() {
        let (_tmp, store) = open_temp().await;
        let p = pattern("r1", "src/a.rs", 100, &["rust"]);
        store
            .insert_batch(&[record(p.clone(), vec![3.0, 4.0, 0.0])])
            .await
            .unwrap();

        let all = store.get_all_embeddings().await.unwrap();
        assert_eq!(all.len(), 1);
        let norm: f32 = all[0].vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!((all[0].vector[0] - 0.6).abs() < 1e-6);

        let stored = store.get_embedding(&p.id).await.unwrap().unwrap();
        assert!((stored.norm - 5.0).abs() < 1e-6);
        assert_eq!(stored.model, "test");
    }

    #[tokio::test]
    async fn test_insert_rejects_non_unit_vector() {
        let (_tmp, store) = open_temp().await;
        let p = pattern("r1", "src/a.rs", 100, &[]);
        let mut rec = record(p, vec![1.0, 0.0]);
        rec.embedding.vector = vec![3.0, 4.0];
        let err = store.insert_batch(&[rec]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(store.stats().await.unwrap().record_count, 0);
    }

    #[tokio::test]
    async fn test_model_change_is_not_unchanged() {
        let (_tmp, store) = open_temp().await;
        let p = pattern("r1", "src/a.rs", 100, &[]);
        store.insert_batch(&[record(p.clone(), vec![1.0, 0.0])]).await.unwrap();
        store.record_usage(&p.id).await.unwrap();

        assert!(store.unchanged_ids(&[p.clone()], Some("test")).await.unwrap().contains(&p.id));
        assert!(store.unchanged_ids(&[p.clone()], Some("other-model")).await.unwrap().is_empty());
        assert!(store.unchanged_ids(&[p.clone()], None).await.unwrap().contains(&p.id));

        let mut rec = record(p.clone(), vec![0.0, 1.0]);
        rec.embedding.model = "other-model".into();
        let out = store.insert_batch(&[rec]).await.unwrap();
        assert_eq!(out, BatchOutcome { written: 1, unchanged: 0 });
        let stored = store.get_embedding(&p.id).await.unwrap().unwrap();
        assert_eq!(stored.model, "other-model");
        assert_eq!(stored.vector, vec![0.0, 1.0]);
        assert_eq!(store.get_metrics(&p.id).await.unwrap().unwrap().usage_count, 1);
    }

    #[tokio::test]
    async fn test_record_feedback_running_averages() {
        let (_tmp, store) = open_temp().await;
        let p = pattern("r1", "a.rs", 1, &[]);
        store.insert_batch(&[record(p.clone(), vec![1.0])]).await.unwrap();

        let m = store
            .record_feedback(&p.id, Feedback::Positive, Some(0.8))
            .await
            .unwrap();
        assert_eq!(m.feedback_count, 1);
        assert_eq!(m.avg_feedback, Some(1.0));
        assert_eq!(m.avg_relevance, Some(0.8));

        let m = store
            .record_feedback(&p.id, Feedback::Negative, None)
            .await
            .unwrap();
        assert_eq!(m.feedback_count, 2);
        assert_eq!(m.avg_feedback, Some(0.0));
        assert_eq!(m.relevance_count, 1);
        assert_eq!(m.avg_relevance, Some(0.8));

        let m = store
            .record_feedback(&p.id, Feedback::Negative, Some(0.2))
            .await
            .unwrap();
        assert!((m.avg_feedback.unwrap() + 1.0 / 3.0).abs() < 1e-9);
        assert!((m.avg_relevance.unwrap() - 0.5).abs() < 1e-9);
        assert_eq!(m.usage_count, 0);

        let err = store
            .record_feedback("missing", Feedback::Neutral, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PatternNotFound(_)));
    }

    #[tokio::test]
    async fn test_reinsert_identical_is_unchanged_and_keeps_metrics() {
        let (_tmp, store) = open_temp().await;
        let p = pattern("r1", "src/a.rs", 100, &["rust"]);
        let out = store
            .insert_batch(&[record(p.clone(), vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(out, BatchOutcome { written: 1, unchanged: 0 });

        store.record_usage(&p.id).await.unwrap();
        store.record_usage(&p.id).await.unwrap();

        let out = store
            .insert_batch(&[record(p.clone(), vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(out, BatchOutcome { written: 0, unchanged: 1 });
        assert_eq!(store.stats().await.unwrap().record_count, 1);
        assert_eq!(store.get_metrics(&p.id).await.unwrap().unwrap().usage_count, 2);
    }

    #[tokio::test]
    async fn test_changed_content_overwrites_without_metric_reset() {
        let (_tmp, store) = open_temp().await;
        let p = pattern("r1", "src/a.rs", 100, &["rust"]);
        store.insert_batch(&[record(p.clone(), vec![1.0, 0.0])]).await.unwrap();
        store.record_usage(&p.id).await.unwrap();

        let mut changed = p.clone();
        changed.description.push_str(" with more detail");
        changed.tags = ["python".to_string()].into_iter().collect();
        let out = store.insert_batch(&[record(changed, vec![0.0, 1.0])]).await.unwrap();
        assert_eq!(out.written, 1);

        let stored = store.get_pattern(&p.id).await.unwrap().unwrap();
        assert!(stored.description.ends_with("with more detail"));
        assert_eq!(store.get_metrics(&p.id).await.unwrap().unwrap().usage_count, 1);

        let rust = store
            .get_embeddings(&CandidateFilter {
                tags: vec!["rust".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(rust.is_empty(), "stale tag index entry survived");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rolls_back_batch() {
        let (_tmp, store) = open_temp().await;
        store
            .insert_batch(&[record(pattern("r1", "a.rs", 1, &[]), vec![1.0, 0.0])])
            .await
            .unwrap();

        let err = store
            .insert_batch(&[
                record(pattern("r2", "b.rs", 2, &[]), vec![1.0, 0.0]),
                record(pattern("r3", "c.rs", 3, &[]), vec![1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 2, actual: 3 }));
        assert_eq!(store.stats().await.unwrap().record_count, 1);
        assert_eq!(store.dims().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_filters_use_indexes() {
        let (_tmp, store) = open_temp().await;
        let mut web = pattern("r1", "web/app.tsx", 10, &["typescript", "react"]);
        web.extras.related_paths = vec!["src/api.rs".into()];
        store
            .insert_batch(&[
                record(web.clone(), vec![1.0, 0.0]),
                record(pattern("r2", "src/lib.rs", 20, &["rust"]), vec![0.0, 1.0]),
                record(pattern("r3", "docs/a.md", 30, &[]), vec![1.0, 1.0]),
            ])
            .await
            .unwrap();

        let react = store
            .get_embeddings(&CandidateFilter {
                tags: vec!["react".into(), "typescript".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(react.len(), 1);
        assert_eq!(react[0].pattern.id, web.id);

        let src = store
            .get_embeddings(&CandidateFilter {
                path_prefix: Some("src/".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<&str> = src.iter().map(|s| s.pattern.file_path.as_str()).collect();
        assert_eq!(ids, vec!["src/lib.rs", "web/app.tsx"]);

        let recent = store
            .get_embeddings(&CandidateFilter {
                since: Some(20),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn test_record_usage_unknown_id() {
        let (_tmp, store) = open_temp().await;
        let err = store.record_usage("missing").await.unwrap_err();
        assert!(matches!(err, Error::PatternNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_record_usage_and_surfaced() {
        let (_tmp, store) = open_temp().await;
        let p = pattern("r1", "a.rs", 1, &[]);
        store.insert_batch(&[record(p.clone(), vec![1.0])]).await.unwrap();

        let m = store.record_usage(&p.id).await.unwrap();
        assert_eq!(m.usage_count, 1);
        assert!(m.last_used_at.is_some());

        store.record_surfaced(&[p.id.clone()]).await.unwrap();
        let m = store.get_metrics(&p.id).await.unwrap().unwrap();
        assert_eq!(m.usage_count, 1);
        assert_eq!(m.surfaced_count, 1);
    }

    #[tokio::test]
    async fn test_stats_and_breakdowns() {
        let (_tmp, store) = open_temp().await;
        store
            .insert_batch(&[
                record(pattern("r1", "a.rs", 1, &["rust"]), vec![1.0]),
                record(pattern("r2", "b.rs", 2, &["rust", "tokio"]), vec![1.0]),
            ])
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.record_count, 2);
        assert!(stats.database_size_bytes > 0);

        assert_eq!(
            store.type_counts().await.unwrap(),
            vec![("feature_implementation".to_string(), 2)]
        );
        assert_eq!(
            store.top_tags(1).await.unwrap(),
            vec![("rust".to_string(), 2)]
        );
        assert_eq!(store.latest_created_at().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_unchanged_ids() {
        let (_tmp, store) = open_temp().await;
        let a = pattern("r1", "a.rs", 1, &[]);
        let b = pattern("r2", "b.rs", 2, &[]);
        store.insert_batch(&[record(a.clone(), vec![1.0])]).await.unwrap();
        let same = store.unchanged_ids(&[a.clone(), b], Some("test")).await.unwrap();
        assert_eq!(same.len(), 1);
        assert!(same.contains(&a.id));
    }
}
