//! In-process cache of known databases and collections.
//!
//! The cache only short-circuits work; the backend stays authoritative and
//! entries are forgotten when a statement proves them stale.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::namespace::Namespace;

#[derive(Default)]
pub struct Catalog {
    databases: DashMap<String, ()>,
    /// Namespace to table name.
    collections: DashMap<Namespace, String>,
    ddl_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Source of drop stamps; strictly increasing.
    epoch: AtomicU64,
    db_generations: DashMap<String, u64>,
    ns_generations: DashMap<Namespace, u64>,
}

/// Holds one database's DDL lock. On drop the lock entry is pruned unless
/// another task holds or awaits it.
pub struct DdlGuard<'a> {
    catalog: &'a Catalog,
    db: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DdlGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.catalog
            .ddl_locks
            .remove_if(&self.db, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn knows_database(&self, db: &str) -> bool {
        self.databases.contains_key(db)
    }

    pub fn remember_database(&self, db: &str) {
        self.databases.insert(db.to_string(), ());
    }

    /// Forgets a database and every collection cached under it.
    pub fn forget_database(&self, db: &str) {
        self.databases.remove(db);
        self.collections.retain(|ns, _| ns.db != db);
    }

    pub fn table_for(&self, ns: &Namespace) -> Option<String> {
        self.collections.get(ns).map(|t| t.value().clone())
    }

    pub fn remember_collection(&self, ns: &Namespace, table: &str) {
        self.databases.insert(ns.db.clone(), ());
        self.collections.insert(ns.clone(), table.to_string());
    }

    pub fn forget_collection(&self, ns: &Namespace) {
        self.collections.remove(ns);
    }

    fn ddl_lock(&self, db: &str) -> Arc<Mutex<()>> {
        self.ddl_locks
            .entry(db.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Serializes DDL on one database within this process.
    pub async fn lock_ddl(&self, db: &str) -> DdlGuard<'_> {
        let guard = self.ddl_lock(db).lock_owned().await;
        DdlGuard {
            catalog: self,
            db: db.to_string(),
            guard: Some(guard),
        }
    }

    /// Changes whenever the namespace or its database is dropped.
    pub fn generation(&self, ns: &Namespace) -> u64 {
        let db = self.db_generations.get(&ns.db).map(|g| *g).unwrap_or(0);
        let coll = self.ns_generations.get(ns).map(|g| *g).unwrap_or(0);
        db.max(coll)
    }

    fn next_stamp(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn bump_collection(&self, ns: &Namespace) {
        self.ns_generations.insert(ns.clone(), self.next_stamp());
    }

    /// Stamps the database newer than any of its collections, so their
    /// entries can go.
    pub fn bump_database(&self, db: &str) {
        self.db_generations.insert(db.to_string(), self.next_stamp());
        self.ns_generations.retain(|ns, _| ns.db != db);
    }

    pub fn cached_databases(&self) -> usize {
        self.databases.len()
    }
}
