//! SQLite adapter for StoryStore
//!
//! Each story is one row: a store-assigned identity, an arrival sequence
//! number and the JSON body (without `_id`). Filters are translated to
//! `json_extract` / `json_type` predicates over the same expressions that
//! `create_index` indexes.
//!
//! The connection is owned by a `parking_lot::Mutex` and every call runs on
//! tokio's blocking pool. `update_many` reads, merges and writes back inside a
//! single transaction.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, TransactionBehavior};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{validate_path, Document, Filter, StoryStore, Update, ID_KEY};
use crate::{Result, StorageError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stories (
    seq  INTEGER PRIMARY KEY AUTOINCREMENT,
    id   TEXT NOT NULL UNIQUE,
    body TEXT NOT NULL
);
";

pub struct SqliteStoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStoryStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::with_connection(conn)
    }

    pub fn new_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Query Translation
// ═══════════════════════════════════════════════════════════════════════════

fn json_path(path: &str) -> String {
    format!("$.{}", path)
}

fn index_name(field: &str) -> String {
    format!("idx_stories_{}", field.replace('.', "__"))
}

/// Build a WHERE clause for the filter, pushing bound parameters in order.
///
/// Field paths are inlined (they are validated before translation) so the
/// expressions match the ones `create_index` builds; values are always bound.
fn where_clause(filter: &Filter, params: &mut Vec<SqlValue>) -> String {
    match filter {
        Filter::All => "1".to_string(),
        Filter::Missing(path) if path == ID_KEY => "0".to_string(),
        Filter::Missing(path) => format!("json_type(body, '{}') IS NULL", json_path(path)),
        Filter::Eq(path, value) if path == ID_KEY => match value {
            Value::String(id) => {
                params.push(SqlValue::Text(id.clone()));
                "id = ?".to_string()
            }
            _ => "0".to_string(),
        },
        // json_extract yields SQL NULL for a JSON null, which never compares equal
        Filter::Eq(path, Value::Null) => format!("json_type(body, '{}') = 'null'", json_path(path)),
        Filter::Eq(path, value) => {
            let path = json_path(path);
            let literal = value.to_string();
            params.push(SqlValue::Text(literal.clone()));
            params.push(SqlValue::Text(literal));
            format!(
                "(json_extract(body, '{path}') = json_extract(?, '$') AND json_type(body, '{path}') = json_type(?, '$'))"
            )
        }
        Filter::And(filters) if filters.is_empty() => "1".to_string(),
        Filter::And(filters) => {
            let parts: Vec<String> = filters.iter().map(|f| where_clause(f, params)).collect();
            format!("({})", parts.join(" AND "))
        }
    }
}

fn row_to_document(id: String, body: &str) -> Result<Document> {
    let mut doc: Document = serde_json::from_str(body)?;
    doc.insert(ID_KEY.to_string(), Value::String(id));
    Ok(doc)
}

fn body_of(doc: &Document) -> Result<String> {
    let mut body = doc.clone();
    body.remove(ID_KEY);
    Ok(serde_json::to_string(&body)?)
}

// ═══════════════════════════════════════════════════════════════════════════
// StoryStore
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
impl StoryStore for SqliteStoryStore {
    async fn insert_many(&self, stories: Vec<Document>) -> Result<Vec<String>> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let mut ids = Vec::with_capacity(stories.len());
            {
                let mut stmt = tx.prepare("INSERT INTO stories (id, body) VALUES (?1, ?2)")?;
                for story in &stories {
                    let id = match story.get(ID_KEY) {
                        None => Uuid::new_v4().to_string(),
                        Some(Value::String(id)) => id.clone(),
                        Some(other) => {
                            return Err(StorageError::invalid_document(format!(
                                "Identity must be a string, got {}",
                                other
                            )))
                        }
                    };
                    stmt.execute(params![id, body_of(story)?])?;
                    ids.push(id);
                }
            }
            tx.commit()?;
            Ok(ids)
        })
        .await
    }

    async fn find(&self, filter: &Filter, limit: Option<usize>) -> Result<Vec<Document>> {
        filter.validate()?;
        let filter = filter.clone();
        self.blocking(move |conn| {
            let mut params = Vec::new();
            let clause = where_clause(&filter, &mut params);
            // SQLite treats a negative LIMIT as unbounded
            params.push(SqlValue::Integer(limit.map_or(-1, |l| l as i64)));

            let sql = format!(
                "SELECT id, body FROM stories WHERE {} ORDER BY seq LIMIT ?",
                clause
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut stories = Vec::new();
            for row in rows {
                let (id, body) = row?;
                stories.push(row_to_document(id, &body)?);
            }
            Ok(stories)
        })
        .await
    }

    async fn update_many(&self, filter: &Filter, update: &Update) -> Result<u64> {
        filter.validate()?;
        let filter = filter.clone();
        let update = update.clone();
        self.blocking(move |conn| {
            // Write lock up front: the read below is always followed by a write
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut params = Vec::new();
            let clause = where_clause(&filter, &mut params);

            let matched: Vec<(i64, String, String)> = {
                let sql = format!("SELECT seq, id, body FROM stories WHERE {}", clause);
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(params), |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                let collected = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                collected
            };

            {
                let mut stmt = tx.prepare("UPDATE stories SET body = ?1 WHERE seq = ?2")?;
                for (seq, id, body) in &matched {
                    let mut doc = row_to_document(id.clone(), body)?;
                    update.apply(&mut doc);
                    stmt.execute(params![body_of(&doc)?, seq])?;
                }
            }
            tx.commit()?;
            Ok(matched.len() as u64)
        })
        .await
    }

    async fn create_index(&self, field: &str) -> Result<()> {
        validate_path(field)?;
        if field == ID_KEY {
            // Identity column is already UNIQUE
            return Ok(());
        }
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON stories (json_extract(body, '{}'))",
            index_name(field),
            json_path(field)
        );
        self.blocking(move |conn| {
            conn.execute_batch(&sql)?;
            Ok(())
        })
        .await
    }

    async fn count(&self, filter: &Filter) -> Result<u64> {
        filter.validate()?;
        let filter = filter.clone();
        self.blocking(move |conn| {
            let mut params = Vec::new();
            let clause = where_clause(&filter, &mut params);
            let sql = format!("SELECT COUNT(*) FROM stories WHERE {}", clause);
            let count: i64 = conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }
}
