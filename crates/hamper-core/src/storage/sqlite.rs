//! SQL basket storage over an embedded SQLite database.
//!
//! One connection, shared behind a lock, owns a `baskets` table (name,
//! token, config, responses, counters) and a `requests` table whose
//! autoincrement id provides the newest-first order. Configs, responses,
//! tokens, counters and the ring survive process restarts.
//!
//! Every basket handle shares the store's closed flag; after `release()`
//! all operations fail with [`StoreError::Closed`].

use super::{filter_names, mint_token, validate_name, BasketStore};
use crate::basket::core::{constant_time_eq, Basket};
use crate::basket::record::RequestRecord;
use crate::basket::types::{
    BasketAuth, BasketConfig, BasketNamesPage, BasketNamesQueryPage, Headers, RequestsPage,
    RequestsQueryPage, ResponseConfig, SearchScope, StoreError,
};
use crate::config::{Limits, ServiceConfig};
use crate::metrics;
use crate::stats::{BasketInfo, DatabaseStats};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS baskets (
    name TEXT PRIMARY KEY,
    token TEXT NOT NULL,
    config TEXT NOT NULL,
    responses TEXT NOT NULL DEFAULT '{}',
    total_count INTEGER NOT NULL DEFAULT 0,
    last_request_date INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    basket TEXT NOT NULL REFERENCES baskets(name) ON DELETE CASCADE,
    date INTEGER NOT NULL,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    query TEXT NOT NULL,
    headers TEXT NOT NULL,
    content_length INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_requests_basket_id ON requests(basket, id);
"#;

struct Inner {
    conn: Mutex<Connection>,
    limits: Limits,
    closed: AtomicBool,
}

impl Inner {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// SQLite-backed basket store.
pub struct SqliteStore {
    config: ServiceConfig,
    inner: Arc<Inner>,
}

impl SqliteStore {
    /// Open (or create) the database file and initialize the schema.
    pub fn open<P: AsRef<Path>>(path: P, config: ServiceConfig) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(backend)?;
            }
        }
        let conn = Connection::open(path.as_ref()).map_err(backend)?;
        // journal_mode reports the resulting mode as a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(backend)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(backend)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;

        info!("SQLite basket store opened at {}", path.as_ref().display());
        let limits = config.limits();
        Ok(Self {
            config,
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                limits,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

impl BasketStore for SqliteStore {
    fn create(&self, name: &str, config: BasketConfig) -> Result<BasketAuth, StoreError> {
        self.inner.check_open()?;
        validate_name(name, &self.config.reserved_names)?;
        config.validate(self.config.max_capacity)?;

        let token = mint_token(self.config.token_length);
        let config_json = serde_json::to_string(&config).map_err(backend)?;

        let conn = self.inner.conn.lock();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM baskets WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        if exists.is_some() {
            return Err(StoreError::NameConflict(name.to_string()));
        }
        conn.execute(
            "INSERT INTO baskets (name, token, config) VALUES (?1, ?2, ?3)",
            params![name, token, config_json],
        )
        .map_err(backend)?;

        info!("Created basket '{name}'");
        Ok(BasketAuth { token })
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Basket>> {
        if self.inner.closed.load(Ordering::Acquire) {
            warn!("Lookup of basket '{name}' on a released store");
            return None;
        }
        let conn = self.inner.conn.lock();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM baskets WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or_else(|e| {
                error!("Basket lookup failed: {e}");
                None
            });
        drop(conn);

        exists.map(|_| {
            Arc::new(SqliteBasket {
                name: name.to_string(),
                inner: Arc::clone(&self.inner),
            }) as Arc<dyn Basket>
        })
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.inner.check_open()?;
        let conn = self.inner.conn.lock();
        conn.execute("DELETE FROM requests WHERE basket = ?1", params![name])
            .map_err(backend)?;
        let deleted = conn
            .execute("DELETE FROM baskets WHERE name = ?1", params![name])
            .map_err(backend)?;
        if deleted > 0 {
            info!("Deleted basket '{name}'");
        }
        Ok(())
    }

    fn size(&self) -> usize {
        let conn = self.inner.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM baskets", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }

    fn get_names(&self, max: usize, skip: usize) -> BasketNamesPage {
        let max = max.min(self.inner.limits.page_limit);
        let conn = self.inner.conn.lock();
        let count = conn
            .query_row("SELECT COUNT(*) FROM baskets", [], |row| {
                row.get::<_, i64>(0)
            })
            .unwrap_or(0) as usize;

        let names = conn
            .prepare("SELECT name FROM baskets ORDER BY name LIMIT ?1 OFFSET ?2")
            .and_then(|mut stmt| {
                let rows = stmt.query_map(params![max as i64, skip as i64], |row| {
                    row.get::<_, String>(0)
                })?;
                rows.collect::<Result<Vec<String>, _>>()
            })
            .unwrap_or_else(|e| {
                error!("Basket name listing failed: {e}");
                Vec::new()
            });

        let has_more = skip + names.len() < count;
        BasketNamesPage {
            names,
            count,
            has_more,
        }
    }

    fn find_names(&self, query: &str, max: usize, skip: usize) -> BasketNamesQueryPage {
        let max = max.min(self.inner.limits.page_limit);
        let conn = self.inner.conn.lock();
        let names = conn
            .prepare("SELECT name FROM baskets ORDER BY name")
            .and_then(|mut stmt| {
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect::<Result<Vec<String>, _>>()
            })
            .unwrap_or_else(|e| {
                error!("Basket name search failed: {e}");
                Vec::new()
            });
        drop(conn);

        // substring match in code keeps the search case-sensitive
        let (names, has_more) = filter_names(&names, query, max, skip);
        BasketNamesQueryPage { names, has_more }
    }

    fn get_stats(&self, max: usize) -> DatabaseStats {
        let conn = self.inner.conn.lock();
        let infos = conn
            .prepare(
                "SELECT b.name, b.total_count, b.last_request_date, \
                 (SELECT COUNT(*) FROM requests r WHERE r.basket = b.name) \
                 FROM baskets b ORDER BY b.name",
            )
            .and_then(|mut stmt| {
                let rows = stmt.query_map([], |row| {
                    Ok(BasketInfo {
                        name: row.get(0)?,
                        requests_total_count: row.get::<_, i64>(1)? as u64,
                        last_request_date: row.get(2)?,
                        requests_count: row.get::<_, i64>(3)? as usize,
                    })
                })?;
                rows.collect::<Result<Vec<BasketInfo>, _>>()
            })
            .unwrap_or_else(|e| {
                error!("Stats query failed: {e}");
                Vec::new()
            });
        drop(conn);

        let mut stats = DatabaseStats::default();
        for info in &infos {
            stats.collect(info, max);
        }
        stats.update_average();
        stats
    }

    fn release(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let conn = self.inner.conn.lock();
        if let Err(e) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
            warn!("WAL checkpoint on release failed: {e}");
        }
        info!("SQLite basket store released");
    }
}

// ============================================================================
// SQL-backed basket
// ============================================================================

struct SqliteBasket {
    name: String,
    inner: Arc<Inner>,
}

impl SqliteBasket {
    fn load_config(&self, conn: &Connection) -> Option<BasketConfig> {
        let json: String = conn
            .query_row(
                "SELECT config FROM baskets WHERE name = ?1",
                params![self.name],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or_else(|e| {
                error!("Config load for basket '{}' failed: {e}", self.name);
                None
            })?;
        match serde_json::from_str(&json) {
            Ok(config) => Some(config),
            Err(e) => {
                error!("Corrupt config for basket '{}': {e}", self.name);
                None
            }
        }
    }

    fn load_responses(&self, conn: &Connection) -> HashMap<String, ResponseConfig> {
        let json: Option<String> = conn
            .query_row(
                "SELECT responses FROM baskets WHERE name = ?1",
                params![self.name],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or(None);
        json.and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default()
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestRecord> {
        let headers_json: String = row.get(4)?;
        let headers: Headers = serde_json::from_str(&headers_json).unwrap_or_default();
        Ok(RequestRecord {
            date: row.get(0)?,
            method: row.get(1)?,
            path: row.get(2)?,
            query: row.get(3)?,
            headers,
            content_length: row.get(5)?,
            body: row.get(6)?,
            truncated: false,
        })
    }

    /// Drop ring rows beyond `capacity`, oldest first.
    fn enforce_capacity(&self, conn: &Connection, capacity: usize, reason: &str) {
        let result = conn.execute(
            "DELETE FROM requests WHERE basket = ?1 AND id NOT IN \
             (SELECT id FROM requests WHERE basket = ?1 ORDER BY id DESC LIMIT ?2)",
            params![self.name, capacity as i64],
        );
        match result {
            Ok(evicted) => {
                for _ in 0..evicted {
                    metrics::record_eviction(reason);
                }
            }
            Err(e) => error!("Capacity enforcement for basket '{}' failed: {e}", self.name),
        }
    }
}

impl Basket for SqliteBasket {
    fn config(&self) -> Result<BasketConfig, StoreError> {
        self.inner.check_open()?;
        let conn = self.inner.conn.lock();
        Ok(self.load_config(&conn).unwrap_or_default())
    }

    fn update(&self, config: BasketConfig) -> Result<(), StoreError> {
        self.inner.check_open()?;
        config.validate(self.inner.limits.max_capacity)?;
        let config_json = serde_json::to_string(&config).map_err(backend)?;

        let conn = self.inner.conn.lock();
        conn.execute(
            "UPDATE baskets SET config = ?2 WHERE name = ?1",
            params![self.name, config_json],
        )
        .map_err(backend)?;
        self.enforce_capacity(&conn, config.capacity, "shrink");
        Ok(())
    }

    fn authorize(&self, token: &str) -> Result<bool, StoreError> {
        self.inner.check_open()?;
        let conn = self.inner.conn.lock();
        let stored: Option<String> = conn
            .query_row(
                "SELECT token FROM baskets WHERE name = ?1",
                params![self.name],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or(None);
        Ok(match stored {
            Some(stored) => constant_time_eq(token.as_bytes(), stored.as_bytes()),
            None => false,
        })
    }

    fn get_response(&self, method: &str) -> Result<Option<ResponseConfig>, StoreError> {
        self.inner.check_open()?;
        let conn = self.inner.conn.lock();
        Ok(self.load_responses(&conn).get(method).cloned())
    }

    fn set_response(&self, method: &str, response: ResponseConfig) -> Result<(), StoreError> {
        self.inner.check_open()?;
        response.validate()?;
        let conn = self.inner.conn.lock();
        let mut responses = self.load_responses(&conn);
        responses.insert(method.to_uppercase(), response);
        let json = serde_json::to_string(&responses).map_err(backend)?;
        conn.execute(
            "UPDATE baskets SET responses = ?2 WHERE name = ?1",
            params![self.name, json],
        )
        .map_err(backend)?;
        Ok(())
    }

    fn add(&self, record: RequestRecord) -> Result<RequestRecord, StoreError> {
        self.inner.check_open()?;
        let conn = self.inner.conn.lock();
        let capacity = self
            .load_config(&conn)
            .map(|c| c.capacity)
            .unwrap_or_else(|| BasketConfig::default().capacity);
        let headers_json = serde_json::to_string(&record.headers).unwrap_or_else(|_| "{}".into());

        conn.execute(
            "INSERT INTO requests (basket, date, method, path, query, headers, content_length, body) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                self.name,
                record.date,
                record.method,
                record.path,
                record.query,
                headers_json,
                record.content_length,
                record.body
            ],
        )
        .map_err(backend)?;

        if let Err(e) = conn.execute(
            "UPDATE baskets SET total_count = total_count + 1, \
             last_request_date = MAX(last_request_date, ?2) WHERE name = ?1",
            params![self.name, record.date],
        ) {
            error!("Counter update for basket '{}' failed: {e}", self.name);
        }
        self.enforce_capacity(&conn, capacity, "overflow");
        Ok(record)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.inner.check_open()?;
        let conn = self.inner.conn.lock();
        conn.execute(
            "DELETE FROM requests WHERE basket = ?1",
            params![self.name],
        )
        .map_err(backend)?;
        Ok(())
    }

    fn size(&self) -> Result<usize, StoreError> {
        self.inner.check_open()?;
        let conn = self.inner.conn.lock();
        Ok(conn
            .query_row(
                "SELECT COUNT(*) FROM requests WHERE basket = ?1",
                params![self.name],
                |row| row.get::<_, i64>(0),
            )
            .unwrap_or(0) as usize)
    }

    fn get_requests(&self, max: usize, skip: usize) -> Result<RequestsPage, StoreError> {
        self.inner.check_open()?;
        let max = max.min(self.inner.limits.page_limit);
        let conn = self.inner.conn.lock();
        let count = conn
            .query_row(
                "SELECT COUNT(*) FROM requests WHERE basket = ?1",
                params![self.name],
                |row| row.get::<_, i64>(0),
            )
            .unwrap_or(0) as usize;
        let total_count = conn
            .query_row(
                "SELECT total_count FROM baskets WHERE name = ?1",
                params![self.name],
                |row| row.get::<_, i64>(0),
            )
            .unwrap_or(0) as u64;

        let requests = conn
            .prepare(
                "SELECT date, method, path, query, headers, content_length, body \
                 FROM requests WHERE basket = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3",
            )
            .and_then(|mut stmt| {
                let rows = stmt.query_map(
                    params![self.name, max as i64, skip as i64],
                    Self::row_to_record,
                )?;
                rows.collect::<Result<Vec<RequestRecord>, _>>()
            })
            .unwrap_or_else(|e| {
                error!("Request listing for basket '{}' failed: {e}", self.name);
                Vec::new()
            });

        let has_more = skip + requests.len() < count;
        Ok(RequestsPage {
            requests,
            count,
            total_count,
            has_more,
        })
    }

    fn find_requests(
        &self,
        query: &str,
        scope: SearchScope,
        max: usize,
        skip: usize,
    ) -> Result<RequestsQueryPage, StoreError> {
        self.inner.check_open()?;
        let max = max.min(self.inner.limits.page_limit);
        let conn = self.inner.conn.lock();
        let rows = conn
            .prepare(
                "SELECT date, method, path, query, headers, content_length, body \
                 FROM requests WHERE basket = ?1 ORDER BY id DESC",
            )
            .and_then(|mut stmt| {
                let rows = stmt.query_map(params![self.name], Self::row_to_record)?;
                rows.collect::<Result<Vec<RequestRecord>, _>>()
            })
            .unwrap_or_else(|e| {
                error!("Request search for basket '{}' failed: {e}", self.name);
                Vec::new()
            });
        drop(conn);

        let mut requests = Vec::new();
        let mut skipped = 0usize;
        let mut has_more = false;
        for record in rows {
            if !record.matches(query, scope) {
                continue;
            }
            if skipped < skip {
                skipped += 1;
                continue;
            }
            if requests.len() < max {
                requests.push(record);
            } else {
                has_more = true;
                break;
            }
        }
        Ok(RequestsQueryPage { requests, has_more })
    }

    fn info(&self) -> Result<BasketInfo, StoreError> {
        self.inner.check_open()?;
        let conn = self.inner.conn.lock();
        let (total_count, last_request_date) = conn
            .query_row(
                "SELECT total_count, last_request_date FROM baskets WHERE name = ?1",
                params![self.name],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .unwrap_or((0, 0));
        let requests_count = conn
            .query_row(
                "SELECT COUNT(*) FROM requests WHERE basket = ?1",
                params![self.name],
                |row| row.get::<_, i64>(0),
            )
            .unwrap_or(0) as usize;
        Ok(BasketInfo {
            name: self.name.clone(),
            requests_count,
            requests_total_count: total_count as u64,
            last_request_date,
        })
    }
}
