//! SQLite-backed cache of serialized transfer records.
//!
//! The schema is deliberately opaque: one row per transfer holding the exact
//! record bytes of `transfer::serialize`, keyed by the engine-assigned id.
//! The single-threaded engine core never talks to the pool directly; it
//! appends puts and deletes to a [`CacheBatch`] and the embedding
//! application commits the batch in one transaction.

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use std::path::Path;

/// Buffered cache mutations collected during one engine step.
#[derive(Debug, Default)]
pub struct CacheBatch {
    ops: Vec<CacheOp>,
}

#[derive(Debug)]
enum CacheOp {
    Put {
        id: i64,
        direction: i64,
        record: Vec<u8>,
    },
    Del {
        id: i64,
    },
}

impl CacheBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, id: u64, direction: u8, record: Vec<u8>) {
        self.ops.push(CacheOp::Put {
            id: id as i64,
            direction: direction as i64,
            record,
        });
    }

    pub fn del(&mut self, id: u64) {
        self.ops.push(CacheOp::Del { id: id as i64 });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// A persisted transfer record as loaded from the cache.
#[derive(Debug, Clone)]
pub struct CachedRecord {
    pub id: u64,
    pub direction: u8,
    pub record: Vec<u8>,
}

/// Percent-encode a path for use in a sqlite:// URI so spaces and special
/// chars don't break parsing.
fn path_to_sqlite_uri(path: &Path) -> String {
    let s = path.to_string_lossy();
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '#' => out.push_str("%23"),
            '?' => out.push_str("%3F"),
            '&' => out.push_str("%26"),
            c => out.push(c),
        }
    }
    format!("sqlite://{}", out)
}

/// Handle to the SQLite-backed transfer cache.
#[derive(Clone)]
pub struct TransferCache {
    pool: Pool<Sqlite>,
}

impl TransferCache {
    /// Open (or create) the default cache under the XDG state directory and
    /// run migrations.
    pub async fn open_default() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("skyfer")?;
        let state_dir = xdg_dirs.get_state_home().join("skyfer");
        tokio::fs::create_dir_all(&state_dir).await?;
        let db_path = state_dir.join("transfers.db");

        let uri = path_to_sqlite_uri(&db_path) + "?mode=rwc";
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&uri)
            .await?;
        let cache = TransferCache { pool };
        cache.migrate().await?;
        Ok(cache)
    }

    /// Open (or create) the cache at a specific path. Intended for tests so
    /// the DB can be placed in a temp directory.
    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let uri = path_to_sqlite_uri(path) + "?mode=rwc";
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&uri)
            .await?;
        let cache = TransferCache { pool };
        cache.migrate().await?;
        Ok(cache)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                id INTEGER PRIMARY KEY,
                direction INTEGER NOT NULL,
                record BLOB NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Apply a batch atomically.
    pub async fn commit(&self, batch: CacheBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for op in batch.ops {
            match op {
                CacheOp::Put {
                    id,
                    direction,
                    record,
                } => {
                    sqlx::query(
                        "INSERT INTO transfers (id, direction, record) VALUES (?, ?, ?)
                         ON CONFLICT(id) DO UPDATE SET direction = excluded.direction,
                                                       record = excluded.record",
                    )
                    .bind(id)
                    .bind(direction)
                    .bind(record)
                    .execute(&mut *tx)
                    .await?;
                }
                CacheOp::Del { id } => {
                    sqlx::query("DELETE FROM transfers WHERE id = ?")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// All persisted records, in id order.
    pub async fn load_all(&self) -> Result<Vec<CachedRecord>> {
        use sqlx::Row;
        let rows = sqlx::query("SELECT id, direction, record FROM transfers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| CachedRecord {
                id: row.get::<i64, _>(0) as u64,
                direction: row.get::<i64, _>(1) as u8,
                record: row.get::<Vec<u8>, _>(2),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_memory() -> TransferCache {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let cache = TransferCache { pool };
        cache.migrate().await.unwrap();
        cache
    }

    #[tokio::test]
    async fn put_del_roundtrip() {
        let cache = open_memory().await;
        let mut batch = CacheBatch::new();
        batch.put(1, 0, vec![1, 2, 3]);
        batch.put(2, 1, vec![4, 5]);
        cache.commit(batch).await.unwrap();

        let records = cache.load_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 1);
        assert_eq!(records[0].record, vec![1, 2, 3]);
        assert_eq!(records[1].direction, 1);

        let mut batch = CacheBatch::new();
        batch.del(1);
        cache.commit(batch).await.unwrap();
        let records = cache.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 2);
    }

    #[tokio::test]
    async fn put_overwrites_existing_record() {
        let cache = open_memory().await;
        let mut batch = CacheBatch::new();
        batch.put(7, 0, vec![1]);
        batch.put(7, 0, vec![9, 9]);
        cache.commit(batch).await.unwrap();
        let records = cache.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record, vec![9, 9]);
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let cache = open_memory().await;
        cache.commit(CacheBatch::new()).await.unwrap();
        assert!(cache.load_all().await.unwrap().is_empty());
    }
}
