//! Search backends: capability traits plus the SQLite implementation.
//!
//! Lexical search is an FTS5 external-content index synced manually on
//! write; vector search is a brute-force cosine scan over stored embedding
//! BLOBs. Both are behind traits so deployments can swap in a dedicated
//! vector store without touching the engine.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;
use crate::types::{ItemKind, RetrievalItem, TimeRange};

/// Vector search input: embedded query plus filters.
#[derive(Debug, Clone)]
pub struct VectorQuery {
    pub user_id: i64,
    pub vector: Vec<f32>,
    pub limit: usize,
    pub created_after: Option<DateTime<Utc>>,
}

/// BM25 search input.
#[derive(Debug, Clone)]
pub struct Bm25Query {
    pub user_id: i64,
    pub query: String,
    pub limit: usize,
    pub min_score: Option<f64>,
}

/// Semantic nearest-neighbour search over memos. Scores in [0, 1].
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn vector_search(&self, query: &VectorQuery) -> Result<Vec<RetrievalItem>>;
}

/// Lexical relevance search over memos. Scores non-negative, higher better.
#[async_trait]
pub trait Bm25Search: Send + Sync {
    async fn bm25_search(&self, query: &Bm25Query) -> Result<Vec<RetrievalItem>>;
}

/// Chronological memo listing, optionally bounded by creation time.
#[async_trait]
pub trait MemoListing: Send + Sync {
    async fn list_memos(
        &self,
        user_id: i64,
        limit: usize,
        range: Option<TimeRange>,
    ) -> Result<Vec<RetrievalItem>>;
}

/// Schedule table scan under a validated time range.
#[async_trait]
pub trait ScheduleScan: Send + Sync {
    async fn scan_schedules(
        &self,
        user_id: i64,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<RetrievalItem>>;
}

/// Everything the retrieval engine needs from one backend.
pub trait RetrievalBackend: VectorSearch + Bm25Search + MemoListing + ScheduleScan {}
impl<T: VectorSearch + Bm25Search + MemoListing + ScheduleScan> RetrievalBackend for T {}

/// SQLite-backed memo and schedule store.
pub struct MemoStore {
    db: Mutex<Connection>,
}

impl MemoStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Insert a memo, syncing the FTS index and optionally its embedding.
    pub fn insert_memo(
        &self,
        user_id: i64,
        content: &str,
        embedding: Option<&[f32]>,
    ) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO memos (user_id, content, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![user_id, content, now],
        )?;
        let id = db.last_insert_rowid();
        db.execute(
            "INSERT INTO memo_fts(rowid, content) VALUES (?1, ?2)",
            rusqlite::params![id, content],
        )?;
        if let Some(vec) = embedding {
            db.execute(
                "INSERT INTO memo_embeddings (memo_id, vector) VALUES (?1, ?2)",
                rusqlite::params![id, vector_to_blob(vec)],
            )?;
        }
        Ok(id)
    }

    /// Insert a memo with an explicit creation timestamp (backfill path).
    pub fn insert_memo_at(
        &self,
        user_id: i64,
        content: &str,
        embedding: Option<&[f32]>,
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO memos (user_id, content, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![user_id, content, created_at.to_rfc3339()],
        )?;
        let id = db.last_insert_rowid();
        db.execute(
            "INSERT INTO memo_fts(rowid, content) VALUES (?1, ?2)",
            rusqlite::params![id, content],
        )?;
        if let Some(vec) = embedding {
            db.execute(
                "INSERT INTO memo_embeddings (memo_id, vector) VALUES (?1, ?2)",
                rusqlite::params![id, vector_to_blob(vec)],
            )?;
        }
        Ok(id)
    }

    pub fn insert_schedule(
        &self,
        user_id: i64,
        title: &str,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO schedules (user_id, title, starts_at, ends_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                user_id,
                title,
                starts_at.to_rfc3339(),
                ends_at.to_rfc3339(),
                now
            ],
        )?;
        Ok(db.last_insert_rowid())
    }
}

#[async_trait]
impl VectorSearch for MemoStore {
    async fn vector_search(&self, query: &VectorQuery) -> Result<Vec<RetrievalItem>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT m.id, m.content, e.vector, m.created_at
             FROM memos m JOIN memo_embeddings e ON e.memo_id = m.id
             WHERE m.user_id = ?1",
        )?;
        let cutoff = query.created_after.map(|t| t.to_rfc3339());
        let rows = stmt.query_map(rusqlite::params![query.user_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut hits: Vec<RetrievalItem> = Vec::new();
        for row in rows.filter_map(|r| r.ok()) {
            let (id, content, blob, created_at) = row;
            if let Some(ref cut) = cutoff {
                if created_at.as_str() < cut.as_str() {
                    continue;
                }
            }
            let vec = blob_to_vector(&blob);
            let score = cosine_unit_interval(&query.vector, &vec);
            hits.push(RetrievalItem {
                id,
                kind: ItemKind::Memo,
                content,
                score,
                evidence: None,
            });
        }
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(query.limit);
        Ok(hits)
    }
}

#[async_trait]
impl Bm25Search for MemoStore {
    async fn bm25_search(&self, query: &Bm25Query) -> Result<Vec<RetrievalItem>> {
        let match_expr = fts_match_expr(&query.query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.db.lock().unwrap();
        // bm25() is smaller-is-better; negate so higher is better.
        let mut stmt = db.prepare(
            "SELECT m.id, m.content, -bm25(memo_fts) AS score
             FROM memos m JOIN memo_fts f ON m.id = f.rowid
             WHERE m.user_id = ?1 AND memo_fts MATCH ?2
             ORDER BY score DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![query.user_id, match_expr, query.limit as i64],
            |row| {
                Ok(RetrievalItem {
                    id: row.get(0)?,
                    kind: ItemKind::Memo,
                    content: row.get(1)?,
                    score: row.get(2)?,
                    evidence: None,
                })
            },
        )?;
        let min = query.min_score.unwrap_or(f64::MIN);
        Ok(rows
            .filter_map(|r| r.ok())
            .filter(|item| item.score >= min)
            .collect())
    }
}

#[async_trait]
impl MemoListing for MemoStore {
    async fn list_memos(
        &self,
        user_id: i64,
        limit: usize,
        range: Option<TimeRange>,
    ) -> Result<Vec<RetrievalItem>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, content, created_at FROM memos
             WHERE user_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, (limit * 4) as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut items = Vec::new();
        for (id, content, created_at) in rows.filter_map(|r| r.ok()) {
            if let Some(r) = range {
                match DateTime::parse_from_rfc3339(&created_at) {
                    Ok(t) if r.contains(t.with_timezone(&Utc)) => {}
                    _ => continue,
                }
            }
            items.push(RetrievalItem {
                id,
                kind: ItemKind::Memo,
                content,
                score: 1.0,
                evidence: None,
            });
            if items.len() >= limit {
                break;
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl ScheduleScan for MemoStore {
    async fn scan_schedules(
        &self,
        user_id: i64,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<RetrievalItem>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, title, starts_at, ends_at FROM schedules
             WHERE user_id = ?1 AND starts_at >= ?2 AND starts_at < ?3
             ORDER BY starts_at
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![
                user_id,
                range.start.to_rfc3339(),
                range.end.to_rfc3339(),
                limit as i64
            ],
            |row| {
                let title: String = row.get(1)?;
                let starts_at: String = row.get(2)?;
                let ends_at: String = row.get(3)?;
                Ok(RetrievalItem {
                    id: row.get(0)?,
                    kind: ItemKind::Schedule,
                    content: title.clone(),
                    score: 1.0,
                    evidence: Some(serde_json::json!({
                        "title": title,
                        "starts_at": starts_at,
                        "ends_at": ends_at,
                    })),
                })
            },
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memos (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    INTEGER NOT NULL,
            content    TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_memos_user
            ON memos(user_id, created_at DESC);

        CREATE VIRTUAL TABLE IF NOT EXISTS memo_fts
            USING fts5(content, content='memos', content_rowid='id');

        CREATE TABLE IF NOT EXISTS memo_embeddings (
            memo_id INTEGER PRIMARY KEY,
            vector  BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS schedules (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    INTEGER NOT NULL,
            title      TEXT NOT NULL,
            starts_at  TEXT NOT NULL,
            ends_at    TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_schedules_user
            ON schedules(user_id, starts_at);",
    )?;
    Ok(())
}

/// Build an FTS5 MATCH expression from free text: quoted tokens OR-ed
/// together, so user punctuation can't break the query syntax.
fn fts_match_expr(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn vector_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cosine similarity mapped from [-1, 1] into [0, 1].
fn cosine_unit_interval(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    let cos = dot / (na.sqrt() * nb.sqrt());
    (cos + 1.0) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> MemoStore {
        MemoStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn bm25_finds_lexical_matches() {
        let s = store();
        s.insert_memo(1, "Redis caching strategies for the API", None).unwrap();
        s.insert_memo(1, "Grocery list: apples, oranges", None).unwrap();
        s.insert_memo(2, "Redis for someone else", None).unwrap();

        let hits = s
            .bm25_search(&Bm25Query {
                user_id: 1,
                query: "redis caching".to_string(),
                limit: 10,
                min_score: None,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("Redis caching"));
        assert!(hits[0].score >= 0.0);
    }

    #[tokio::test]
    async fn fts_punctuation_does_not_break_query() {
        let s = store();
        s.insert_memo(1, "notes about deployment", None).unwrap();
        let hits = s
            .bm25_search(&Bm25Query {
                user_id: 1,
                query: "deployment? (urgent) \"quoted\"".to_string(),
                limit: 10,
                min_score: None,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn vector_search_orders_by_similarity() {
        let s = store();
        s.insert_memo(1, "close", Some(&[1.0, 0.0])).unwrap();
        s.insert_memo(1, "far", Some(&[-1.0, 0.0])).unwrap();

        let hits = s
            .vector_search(&VectorQuery {
                user_id: 1,
                vector: vec![1.0, 0.0],
                limit: 10,
                created_after: None,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "close");
        assert!(hits[0].score > 0.99);
        assert!(hits[1].score < 0.01);
    }

    #[tokio::test]
    async fn vector_search_respects_recency_cutoff() {
        let s = store();
        let old = Utc::now() - Duration::days(365);
        s.insert_memo_at(1, "ancient", Some(&[1.0, 0.0]), old).unwrap();
        s.insert_memo(1, "recent", Some(&[1.0, 0.0])).unwrap();

        let hits = s
            .vector_search(&VectorQuery {
                user_id: 1,
                vector: vec![1.0, 0.0],
                limit: 10,
                created_after: Some(Utc::now() - Duration::days(90)),
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "recent");
    }

    #[tokio::test]
    async fn schedule_scan_is_bounded_by_range() {
        let s = store();
        let base = Utc::now();
        s.insert_schedule(1, "inside", base + Duration::hours(1), base + Duration::hours(2))
            .unwrap();
        s.insert_schedule(1, "outside", base + Duration::days(7), base + Duration::days(7))
            .unwrap();

        let range = TimeRange::new(base, base + Duration::days(1)).unwrap();
        let hits = s.scan_schedules(1, range, 20).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "inside");
        assert_eq!(hits[0].kind, ItemKind::Schedule);
        assert!(hits[0].evidence.is_some());
    }

    #[tokio::test]
    async fn memo_listing_is_chronological_with_score_one() {
        let s = store();
        s.insert_memo(1, "a", None).unwrap();
        s.insert_memo(1, "b", None).unwrap();
        let items = s.list_memos(1, 10, None).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.score == 1.0));
    }
}
