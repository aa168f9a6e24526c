//! Single-file basket storage.
//!
//! The whole database lives in memory and is serialized to one JSON file:
//! metadata mutations (create, delete, config and response updates) are
//! flushed immediately, collected requests and counters on `release()`.
//! The file is replaced atomically (write to a temp sibling, then rename).
//!
//! The store's closed flag is shared with every basket image, so handles
//! obtained before `release()` reject further work instead of mutating
//! state that can never reach the disk again.

use super::{filter_names, mint_token, paginate_names, validate_name, BasketStore};
use crate::basket::core::{Basket, MemoryBasket};
use crate::basket::record::RequestRecord;
use crate::basket::types::{
    BasketAuth, BasketConfig, BasketNamesPage, BasketNamesQueryPage, RequestsPage,
    RequestsQueryPage, ResponseConfig, SearchScope, StoreError,
};
use crate::config::ServiceConfig;
use crate::stats::{BasketInfo, DatabaseStats};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Persisted form of one basket.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedBasket {
    name: String,
    token: String,
    config: BasketConfig,
    responses: HashMap<String, ResponseConfig>,
    total_count: u64,
    /// Ring content, newest first
    requests: Vec<RequestRecord>,
}

/// Persisted form of the whole database.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedDatabase {
    baskets: Vec<PersistedBasket>,
}

struct FileInner {
    path: PathBuf,
    baskets: RwLock<HashMap<String, Arc<MemoryBasket>>>,
    /// Shared with every basket handed out by this store
    closed: Arc<AtomicBool>,
    /// Request-level changes not yet on disk
    dirty: AtomicBool,
}

impl FileInner {
    /// Serialize every basket and atomically replace the database file.
    fn flush(&self) {
        let image = {
            let baskets = self.baskets.read();
            let mut image = PersistedDatabase::default();
            for (name, basket) in baskets.iter() {
                let (config, responses, requests, total_count) = basket.snapshot();
                image.baskets.push(PersistedBasket {
                    name: name.clone(),
                    token: basket.token().to_string(),
                    config,
                    responses,
                    total_count,
                    requests,
                });
            }
            image.baskets.sort_by(|a, b| a.name.cmp(&b.name));
            image
        };

        let json = match serde_json::to_vec(&image) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize basket database: {e}");
                return;
            }
        };

        let tmp = self.path.with_extension("tmp");
        if let Err(e) = std::fs::write(&tmp, &json) {
            error!("Failed to write {}: {e}", tmp.display());
            return;
        }
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            error!("Failed to replace {}: {e}", self.path.display());
            return;
        }
        self.dirty.store(false, Ordering::Release);
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

/// File-backed basket store.
pub struct FileStore {
    config: ServiceConfig,
    inner: Arc<FileInner>,
}

impl FileStore {
    /// Open (or create) the database file and load its content.
    pub fn open<P: AsRef<Path>>(path: P, config: ServiceConfig) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            }
        }

        let closed = Arc::new(AtomicBool::new(false));
        let mut baskets = HashMap::new();
        if path.exists() {
            let contents =
                std::fs::read(&path).map_err(|e| StoreError::Backend(e.to_string()))?;
            let image: PersistedDatabase = serde_json::from_slice(&contents)
                .map_err(|e| StoreError::Backend(format!("corrupt database file: {e}")))?;
            for persisted in image.baskets {
                let basket = MemoryBasket::new(
                    persisted.name.clone(),
                    persisted.token,
                    persisted.config,
                    config.limits(),
                    Arc::clone(&closed),
                );
                basket.restore(
                    persisted.responses,
                    persisted.requests,
                    persisted.total_count,
                );
                baskets.insert(persisted.name, Arc::new(basket));
            }
        }

        info!(
            "File basket store opened at {} ({} baskets)",
            path.display(),
            baskets.len()
        );
        Ok(Self {
            config,
            inner: Arc::new(FileInner {
                path,
                baskets: RwLock::new(baskets),
                closed,
                dirty: AtomicBool::new(false),
            }),
        })
    }

    fn sorted_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.baskets.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl BasketStore for FileStore {
    fn create(&self, name: &str, config: BasketConfig) -> Result<BasketAuth, StoreError> {
        self.inner.check_open()?;
        validate_name(name, &self.config.reserved_names)?;
        config.validate(self.config.max_capacity)?;

        let token = mint_token(self.config.token_length);
        {
            let mut baskets = self.inner.baskets.write();
            if baskets.contains_key(name) {
                return Err(StoreError::NameConflict(name.to_string()));
            }
            baskets.insert(
                name.to_string(),
                Arc::new(MemoryBasket::new(
                    name.to_string(),
                    token.clone(),
                    config,
                    self.config.limits(),
                    Arc::clone(&self.inner.closed),
                )),
            );
        }
        self.inner.flush();
        info!("Created basket '{name}'");
        Ok(BasketAuth { token })
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Basket>> {
        if self.inner.closed.load(Ordering::Acquire) {
            warn!("Lookup of basket '{name}' on a released store");
            return None;
        }
        let basket = self.inner.baskets.read().get(name).cloned()?;
        Some(Arc::new(FileBasket {
            basket,
            store: Arc::clone(&self.inner),
        }))
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.inner.check_open()?;
        let removed = self.inner.baskets.write().remove(name).is_some();
        if removed {
            self.inner.flush();
            info!("Deleted basket '{name}'");
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.inner.baskets.read().len()
    }

    fn get_names(&self, max: usize, skip: usize) -> BasketNamesPage {
        let max = max.min(self.config.limits().page_limit);
        let names = self.sorted_names();
        let count = names.len();
        let (page, has_more) = paginate_names(&names, max, skip);
        BasketNamesPage {
            names: page,
            count,
            has_more,
        }
    }

    fn find_names(&self, query: &str, max: usize, skip: usize) -> BasketNamesQueryPage {
        let max = max.min(self.config.limits().page_limit);
        let names = self.sorted_names();
        let (page, has_more) = filter_names(&names, query, max, skip);
        BasketNamesQueryPage {
            names: page,
            has_more,
        }
    }

    fn get_stats(&self, max: usize) -> DatabaseStats {
        let baskets: Vec<Arc<MemoryBasket>> =
            self.inner.baskets.read().values().cloned().collect();
        let mut stats = DatabaseStats::default();
        for basket in baskets {
            if let Ok(info) = basket.info() {
                stats.collect(&info, max);
            }
        }
        stats.update_average();
        stats
    }

    fn release(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // best-effort flush of request data collected since the last write;
        // the closed flag already rejects new mutations, so nothing can
        // slip in after this snapshot and be stranded
        self.inner.flush();
        self.inner.baskets.write().clear();
        info!("File basket store released");
    }
}

// ============================================================================
// File-backed basket
// ============================================================================

/// Basket handle that keeps the backing file in sync.
///
/// Metadata changes flush immediately; request-level changes only mark the
/// store dirty and reach the disk on `release()`. Closure checks live in
/// the underlying memory image, whose flag is shared with the store.
struct FileBasket {
    basket: Arc<MemoryBasket>,
    store: Arc<FileInner>,
}

impl Basket for FileBasket {
    fn config(&self) -> Result<BasketConfig, StoreError> {
        self.basket.config()
    }

    fn update(&self, config: BasketConfig) -> Result<(), StoreError> {
        self.basket.update(config)?;
        self.store.flush();
        Ok(())
    }

    fn authorize(&self, token: &str) -> Result<bool, StoreError> {
        self.basket.authorize(token)
    }

    fn get_response(&self, method: &str) -> Result<Option<ResponseConfig>, StoreError> {
        self.basket.get_response(method)
    }

    fn set_response(&self, method: &str, response: ResponseConfig) -> Result<(), StoreError> {
        self.basket.set_response(method, response)?;
        self.store.flush();
        Ok(())
    }

    fn add(&self, record: RequestRecord) -> Result<RequestRecord, StoreError> {
        let record = self.basket.add(record)?;
        self.store.dirty.store(true, Ordering::Release);
        Ok(record)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.basket.clear()?;
        self.store.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn size(&self) -> Result<usize, StoreError> {
        self.basket.size()
    }

    fn get_requests(&self, max: usize, skip: usize) -> Result<RequestsPage, StoreError> {
        self.basket.get_requests(max, skip)
    }

    fn find_requests(
        &self,
        query: &str,
        scope: SearchScope,
        max: usize,
        skip: usize,
    ) -> Result<RequestsQueryPage, StoreError> {
        self.basket.find_requests(query, scope, max, skip)
    }

    fn info(&self) -> Result<BasketInfo, StoreError> {
        self.basket.info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{HeaderMap, Method, Uri};
    use tempfile::TempDir;

    fn request(body: &str) -> RequestRecord {
        let uri: Uri = "/b".parse().unwrap();
        RequestRecord::from_parts(
            &Method::POST,
            &uri,
            &HeaderMap::new(),
            body.as_bytes(),
            1024 * 1024,
        )
    }

    #[test]
    fn test_create_and_recover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("baskets.json");
        let auth;
        {
            let store = FileStore::open(&path, ServiceConfig::default()).unwrap();
            auth = store
                .create(
                    "b1",
                    BasketConfig {
                        capacity: 3,
                        ..Default::default()
                    },
                )
                .unwrap();
            let basket = store.get("b1").unwrap();
            basket
                .set_response(
                    "GET",
                    ResponseConfig {
                        status: 418,
                        ..Default::default()
                    },
                )
                .unwrap();
            for body in ["a", "b", "c", "d"] {
                basket.add(request(body)).unwrap();
            }
            store.release();
        }

        let store = FileStore::open(&path, ServiceConfig::default()).unwrap();
        assert_eq!(store.size(), 1);
        let basket = store.get("b1").unwrap();
        assert!(basket.authorize(&auth.token).unwrap());
        assert_eq!(basket.config().unwrap().capacity, 3);
        assert_eq!(basket.get_response("GET").unwrap().unwrap().status, 418);

        let page = basket.get_requests(10, 0).unwrap();
        let bodies: Vec<&str> = page.requests.iter().map(|r| r.body.as_str()).collect();
        assert_eq!(bodies, vec!["d", "c", "b"]);
        assert_eq!(page.total_count, 4);
    }

    #[test]
    fn test_delete_is_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("baskets.json");
        {
            let store = FileStore::open(&path, ServiceConfig::default()).unwrap();
            store.create("b1", BasketConfig::default()).unwrap();
            store.create("b2", BasketConfig::default()).unwrap();
            store.delete("b1").unwrap();
            store.release();
        }

        let store = FileStore::open(&path, ServiceConfig::default()).unwrap();
        assert!(store.get("b1").is_none());
        assert!(store.get("b2").is_some());
    }

    #[test]
    fn test_metadata_flushes_without_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("baskets.json");
        let store = FileStore::open(&path, ServiceConfig::default()).unwrap();
        store.create("b1", BasketConfig::default()).unwrap();

        // creation alone must already be on disk; a second store instance
        // opened from the same file sees it
        let other = FileStore::open(&path, ServiceConfig::default()).unwrap();
        assert_eq!(other.size(), 1);
    }

    #[test]
    fn test_names_and_pages() {
        let dir = TempDir::new().unwrap();
        let store =
            FileStore::open(dir.path().join("baskets.json"), ServiceConfig::default()).unwrap();
        for name in ["b", "a", "c"] {
            store.create(name, BasketConfig::default()).unwrap();
        }
        let page = store.get_names(2, 0);
        assert_eq!(page.names, vec!["a", "b"]);
        assert!(page.has_more);

        let found = store.find_names("c", 10, 0);
        assert_eq!(found.names, vec!["c"]);
        assert!(!found.has_more);
    }

    #[test]
    fn test_release_closes_store() {
        let dir = TempDir::new().unwrap();
        let store =
            FileStore::open(dir.path().join("baskets.json"), ServiceConfig::default()).unwrap();
        store.create("b1", BasketConfig::default()).unwrap();
        store.release();

        assert!(matches!(
            store.create("b2", BasketConfig::default()),
            Err(StoreError::Closed)
        ));
        assert!(store.get("b1").is_none());
        store.release();
    }

    #[test]
    fn test_release_closes_outstanding_basket_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("baskets.json");
        let store = FileStore::open(&path, ServiceConfig::default()).unwrap();
        store.create("b1", BasketConfig::default()).unwrap();
        let basket = store.get("b1").unwrap();
        basket.add(request("before")).unwrap();

        store.release();

        // a stale handle cannot mutate state the store can no longer flush
        assert!(matches!(basket.add(request("after")), Err(StoreError::Closed)));
        assert!(matches!(basket.clear(), Err(StoreError::Closed)));
        assert!(matches!(basket.size(), Err(StoreError::Closed)));
        assert!(matches!(basket.get_requests(10, 0), Err(StoreError::Closed)));
        assert!(matches!(basket.config(), Err(StoreError::Closed)));

        // everything accepted before release made it to disk
        let reopened = FileStore::open(&path, ServiceConfig::default()).unwrap();
        let page = reopened.get("b1").unwrap().get_requests(10, 0).unwrap();
        assert_eq!(page.requests.len(), 1);
        assert_eq!(page.requests[0].body, "before");
        assert_eq!(page.total_count, 1);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("baskets.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            FileStore::open(&path, ServiceConfig::default()),
            Err(StoreError::Backend(_))
        ));
    }
}
