//! Document to relational mapping
//!
//! A database is a schema and a collection a table with three columns:
//! `_seq` (insertion order), `_id` (normalized identifier key, unique) and
//! `_doc` (canonical Extended JSON). Every statement runs under the
//! cancellation token of the request that issued it.

pub mod catalog;
pub mod cursor;
pub mod namespace;
pub mod pushdown;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    cancellable, Backend, BackendError, Dialect, Pool, PoolConfig, PooledConnection, Predicate,
    Role, Row, SqlValue,
};
use crate::bson::compare::values_equal;
use crate::bson::extjson::{document_from_str, document_to_string};
use crate::bson::{encode_document, Bson, Document, ObjectId};
use crate::error::ErrorKind;
use crate::query::update::PatchOps;
use crate::query::{resolve, Filter, Projection, QueryError, SortSpec, UpdateSpec};

pub use catalog::Catalog;
pub use cursor::DocumentStream;
pub use namespace::Namespace;

use namespace::{schema_ident, table_ident, validate_collection_name, validate_database_name};

/// Per-schema table mapping collection names to table names.
pub const METADATA_TABLE: &str = "_docwire_collections";

pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("ns not found: {0}")]
    NamespaceNotFound(String),

    #[error("namespace {0} already exists")]
    NamespaceAlreadyExists(String),

    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("E11000 duplicate key error collection: {0}")]
    DuplicateKey(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("operation was interrupted")]
    Cancelled,

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("corrupt stored document: {0}")]
    Corrupt(String),

    #[error("backend error: {0}")]
    Backend(BackendError),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NamespaceNotFound(_) => ErrorKind::NamespaceNotFound,
            StorageError::NamespaceAlreadyExists(_) => ErrorKind::NamespaceAlreadyExists,
            StorageError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            _ => ErrorKind::CommandError,
        }
    }

    /// Failures confined to one document of a bulk write.
    pub fn is_document_error(&self) -> bool {
        matches!(self, StorageError::DuplicateKey(_) | StorageError::Query(_))
    }
}

impl From<BackendError> for StorageError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Cancelled => StorageError::Cancelled,
            BackendError::NotFound(msg) => StorageError::NamespaceNotFound(msg),
            BackendError::AlreadyExists(msg) => StorageError::NamespaceAlreadyExists(msg),
            BackendError::UniqueViolation(msg) => StorageError::DuplicateKey(msg),
            e @ (BackendError::Connection(_)
            | BackendError::Busy(_)
            | BackendError::PoolShutdown
            | BackendError::PoolTimeout) => StorageError::BackendUnavailable(e.to_string()),
            other => StorageError::Backend(other),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub pool: PoolConfig,
    /// Extra acquisition attempts on transient backend failures.
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    /// Rows fetched per cursor page.
    pub page_size: usize,
    /// Documents buffered ahead of the consumer.
    pub read_ahead: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(50),
            page_size: 500,
            read_ahead: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FindOptions {
    pub filter: Filter,
    pub sort: Option<SortSpec>,
    pub projection: Option<Projection>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            filter: Filter::all(),
            sort: None,
            projection: None,
            skip: 0,
            limit: None,
        }
    }
}

impl FindOptions {
    pub fn with_filter(filter: Filter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteError {
    pub index: usize,
    pub error: StorageError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertOutcome {
    pub inserted: u64,
    pub errors: Vec<WriteError>,
}

#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub filter: Filter,
    /// Source of equality fields seeded into an upserted document.
    pub filter_doc: Document,
    pub update: UpdateSpec,
    pub multi: bool,
    pub upsert: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone)]
pub struct FindAndModifyRequest {
    pub filter: Filter,
    pub filter_doc: Document,
    pub sort: Option<SortSpec>,
    pub remove: bool,
    pub update: Option<UpdateSpec>,
    pub return_new: bool,
    pub upsert: bool,
    pub projection: Option<Projection>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindAndModifyOutcome {
    pub value: Option<Document>,
    pub updated_existing: bool,
    pub upserted_id: Option<Bson>,
    pub n: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    pub count: u64,
    pub size: u64,
}

struct Inner {
    pool: Pool,
    dialect: Arc<dyn Dialect>,
    catalog: Catalog,
    config: StorageConfig,
}

/// Handle to the storage mapper. Clones share the pool and catalog.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<Inner>,
    cancel: CancellationToken,
}

/// Moves `_id` to the front, generating one when absent.
pub fn prepare_document(mut doc: Document) -> StorageResult<(Document, Bson)> {
    let id = match doc.remove("_id") {
        Some(Bson::Array(_)) => {
            return Err(QueryError::BadValue("can't use an array for _id".into()).into())
        }
        Some(Bson::RegularExpression(_)) => {
            return Err(QueryError::BadValue("can't use a regex for _id".into()).into())
        }
        Some(id) => id,
        None => Bson::ObjectId(ObjectId::new()),
    };
    doc.insert_first("_id", id.clone());
    check_stored(&doc)?;
    Ok((doc, id))
}

/// Rejects documents that cannot be persisted: oversize ones and ones with
/// `$`-prefixed field names, which the stored text form would read back as
/// typed wrappers.
fn check_stored(doc: &Document) -> StorageResult<()> {
    check_field_names(doc)?;
    check_size(doc)
}

fn check_field_names(doc: &Document) -> StorageResult<()> {
    for (key, value) in doc.iter() {
        if key.starts_with('$') {
            return Err(QueryError::BadValue(format!(
                "Document can't have $ prefixed field names: {}",
                key
            ))
            .into());
        }
        check_nested_names(value)?;
    }
    Ok(())
}

fn check_nested_names(value: &Bson) -> StorageResult<()> {
    match value {
        Bson::Document(doc) => check_field_names(doc),
        Bson::Array(items) => items.iter().try_for_each(check_nested_names),
        _ => Ok(()),
    }
}

fn check_size(doc: &Document) -> StorageResult<()> {
    let size = encode_document(doc).len();
    if size > MAX_DOCUMENT_SIZE {
        return Err(QueryError::BadValue(format!(
            "object to insert too large. size in bytes: {}, max size: {}",
            size, MAX_DOCUMENT_SIZE
        ))
        .into());
    }
    Ok(())
}

fn decode_row(row: &Row) -> StorageResult<(i64, Document)> {
    let seq = row
        .get_i64(0)
        .ok_or_else(|| StorageError::Corrupt("missing _seq".into()))?;
    let text = row
        .get_str(1)
        .ok_or_else(|| StorageError::Corrupt(format!("missing _doc for row {}", seq)))?;
    let doc = document_from_str(text)
        .map_err(|e| StorageError::Corrupt(format!("row {}: {}", seq, e)))?;
    Ok((seq, doc))
}

impl Storage {
    /// Builds the pool for `backend` and returns a storage handle.
    pub async fn open(backend: Backend, config: StorageConfig) -> Self {
        let pool = Pool::new(backend.factory, config.pool.clone()).await;
        tracing::info!(backend = backend.dialect.name(), "Storage ready");
        Self {
            inner: Arc::new(Inner {
                pool,
                dialect: backend.dialect,
                catalog: Catalog::new(),
                config,
            }),
            cancel: CancellationToken::new(),
        }
    }

    /// A handle whose statements are cancelled with `cancel`.
    pub fn scoped(&self, cancel: CancellationToken) -> Self {
        Self {
            inner: self.inner.clone(),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.inner.dialect.as_ref()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    pub fn shutdown(&self) {
        self.inner.pool.shutdown();
    }

    fn table_ref(&self, db: &str, table: &str) -> String {
        let dialect = self.dialect();
        dialect.table_ref(&schema_ident(dialect, db), table)
    }

    fn metadata_ref(&self, db: &str) -> String {
        self.table_ref(db, METADATA_TABLE)
    }

    /// Acquires a connection, retrying transient failures with capped
    /// exponential backoff.
    async fn acquire(&self, role: Role) -> StorageResult<PooledConnection> {
        let mut delay = self.inner.config.retry_backoff;
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(StorageError::Cancelled),
                r = self.inner.pool.acquire(role) => r,
            };
            match result {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_retriable() && attempt < self.inner.config.retry_attempts => {
                    attempt += 1;
                    tracing::warn!(
                        role = role.as_str(),
                        attempt,
                        "Backend unavailable, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(StorageError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(MAX_RETRY_BACKOFF);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn execute(
        &self,
        conn: &PooledConnection,
        sql: &str,
        params: &[SqlValue],
    ) -> StorageResult<u64> {
        tracing::trace!(sql, "execute");
        Ok(cancellable(&self.cancel, conn.connection(), conn.execute(sql, params)).await?)
    }

    async fn query(
        &self,
        conn: &PooledConnection,
        sql: &str,
        params: &[SqlValue],
    ) -> StorageResult<Vec<Row>> {
        tracing::trace!(sql, "query");
        Ok(cancellable(&self.cancel, conn.connection(), conn.query(sql, params)).await?)
    }

    async fn begin(&self, conn: &PooledConnection) -> StorageResult<()> {
        Ok(conn.begin().await?)
    }

    /// Commits on success, rolls back on failure.
    async fn finish<T>(&self, conn: &PooledConnection, result: StorageResult<T>) -> StorageResult<T> {
        match result {
            Ok(value) => {
                conn.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = conn.rollback().await {
                    tracing::warn!("Rollback failed: {}", rb);
                }
                Err(e)
            }
        }
    }

    // ---- namespaces ----

    /// Creates a database. Returns `false` when it already existed, including
    /// when a concurrent creator won the race.
    pub async fn create_database(&self, db: &str) -> StorageResult<bool> {
        validate_database_name(db)?;
        let catalog = self.catalog();
        if catalog.knows_database(db) {
            return Ok(false);
        }
        let _guard = catalog.lock_ddl(db).await;
        if catalog.knows_database(db) {
            return Ok(false);
        }

        let schema = schema_ident(self.dialect(), db);
        let conn = self.acquire(Role::Privileged).await?;
        self.begin(&conn).await?;
        let result = async {
            for stmt in self.dialect().create_schema(&schema, db) {
                self.execute(&conn, &stmt.sql, &stmt.params).await?;
            }
            Ok(())
        }
        .await;

        match self.finish(&conn, result).await {
            Ok(()) => {
                catalog.remember_database(db);
                tracing::info!(db, "Created database");
                Ok(true)
            }
            Err(StorageError::NamespaceAlreadyExists(_)) | Err(StorageError::DuplicateKey(_)) => {
                catalog.remember_database(db);
                tracing::debug!(db, "Database already existed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Drops a database and all of its collections.
    pub async fn drop_database(&self, db: &str) -> StorageResult<()> {
        validate_database_name(db)?;
        let catalog = self.catalog();
        let _guard = catalog.lock_ddl(db).await;

        let schema = schema_ident(self.dialect(), db);
        let conn = self.acquire(Role::Privileged).await?;
        self.begin(&conn).await?;
        let result = async {
            let sql = format!("SELECT table_name FROM {}", self.metadata_ref(db));
            let tables: Vec<String> = self
                .query(&conn, &sql, &[])
                .await?
                .iter()
                .filter_map(|r| r.get_str(0).map(str::to_string))
                .collect();
            for stmt in self.dialect().drop_schema(&schema, db, &tables) {
                let changed = self.execute(&conn, &stmt.sql, &stmt.params).await?;
                if stmt.expect_rows && changed == 0 {
                    return Err(StorageError::NamespaceNotFound(db.to_string()));
                }
            }
            Ok(())
        }
        .await;

        match self.finish(&conn, result).await {
            Ok(()) => {
                catalog.forget_database(db);
                catalog.bump_database(db);
                tracing::info!(db, "Dropped database");
                Ok(())
            }
            Err(StorageError::NamespaceNotFound(_)) => {
                Err(StorageError::NamespaceNotFound(db.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Creates a collection (and its database when needed). Fails with
    /// `NamespaceAlreadyExists` when the collection is present.
    pub async fn create_collection(&self, ns: &Namespace) -> StorageResult<String> {
        validate_database_name(&ns.db)?;
        validate_collection_name(&ns.coll)?;
        let mut retried = false;
        loop {
            self.create_database(&ns.db).await?;
            let _guard = self.catalog().lock_ddl(&ns.db).await;
            match self.create_collection_locked(ns).await {
                // A cached database vanished underneath us.
                Err(StorageError::NamespaceNotFound(_)) if !retried => {
                    self.catalog().forget_database(&ns.db);
                    retried = true;
                }
                other => return other,
            }
        }
    }

    async fn create_collection_locked(&self, ns: &Namespace) -> StorageResult<String> {
        let table = table_ident(self.dialect(), &ns.coll);
        let conn = self.acquire(Role::Privileged).await?;
        self.begin(&conn).await?;
        let result = async {
            let sql = format!(
                "INSERT INTO {} (name, table_name) VALUES ({}, {})",
                self.metadata_ref(&ns.db),
                self.dialect().placeholder(1),
                self.dialect().placeholder(2)
            );
            self.execute(&conn, &sql, &[ns.coll.as_str().into(), table.as_str().into()])
                .await?;
            let create = self
                .dialect()
                .create_collection_table(&self.table_ref(&ns.db, &table));
            self.execute(&conn, &create, &[]).await?;
            Ok(())
        }
        .await;

        match self.finish(&conn, result).await {
            Ok(()) => {
                self.catalog().remember_collection(ns, &table);
                tracing::info!(ns = %ns, table = %table, "Created collection");
                Ok(table)
            }
            Err(StorageError::DuplicateKey(_)) | Err(StorageError::NamespaceAlreadyExists(_)) => {
                Err(StorageError::NamespaceAlreadyExists(ns.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn drop_collection(&self, ns: &Namespace) -> StorageResult<()> {
        validate_database_name(&ns.db)?;
        validate_collection_name(&ns.coll)?;
        let _guard = self.catalog().lock_ddl(&ns.db).await;

        let conn = self.acquire(Role::Privileged).await?;
        self.begin(&conn).await?;
        let result = async {
            let p1 = self.dialect().placeholder(1);
            let meta = self.metadata_ref(&ns.db);
            let rows = self
                .query(
                    &conn,
                    &format!("SELECT table_name FROM {} WHERE name = {}", meta, p1),
                    &[ns.coll.as_str().into()],
                )
                .await?;
            let table = rows
                .first()
                .and_then(|r| r.get_str(0))
                .map(str::to_string)
                .ok_or_else(|| StorageError::NamespaceNotFound(ns.to_string()))?;
            self.execute(
                &conn,
                &format!("DELETE FROM {} WHERE name = {}", meta, p1),
                &[ns.coll.as_str().into()],
            )
            .await?;
            self.execute(
                &conn,
                &format!("DROP TABLE {}", self.table_ref(&ns.db, &table)),
                &[],
            )
            .await?;
            Ok(())
        }
        .await;

        match self.finish(&conn, result).await {
            Ok(()) => {
                self.catalog().forget_collection(ns);
                self.catalog().bump_collection(ns);
                tracing::info!(ns = %ns, "Dropped collection");
                Ok(())
            }
            Err(StorageError::NamespaceNotFound(_)) => {
                Err(StorageError::NamespaceNotFound(ns.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list_databases(&self) -> StorageResult<Vec<String>> {
        let conn = self.acquire(Role::ReadOnly).await?;
        let stmt = self.dialect().list_schemas();
        let rows = self.query(&conn, &stmt.sql, &stmt.params).await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get_str(0).map(str::to_string))
            .collect())
    }

    /// Collection names of `db` in name order; empty when `db` is absent.
    pub async fn list_collections(&self, db: &str) -> StorageResult<Vec<String>> {
        validate_database_name(db)?;
        let conn = self.acquire(Role::ReadOnly).await?;
        let sql = format!("SELECT name FROM {} ORDER BY name", self.metadata_ref(db));
        match self.query(&conn, &sql, &[]).await {
            Ok(rows) => Ok(rows
                .iter()
                .filter_map(|r| r.get_str(0).map(str::to_string))
                .collect()),
            Err(StorageError::NamespaceNotFound(_)) => {
                self.catalog().forget_database(db);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Table backing `ns`, if the collection exists.
    pub async fn resolve_table(&self, ns: &Namespace) -> StorageResult<Option<String>> {
        if let Some(table) = self.catalog().table_for(ns) {
            return Ok(Some(table));
        }
        validate_database_name(&ns.db)?;
        validate_collection_name(&ns.coll)?;
        let conn = self.acquire(Role::ReadOnly).await?;
        let sql = format!(
            "SELECT table_name FROM {} WHERE name = {}",
            self.metadata_ref(&ns.db),
            self.dialect().placeholder(1)
        );
        match self.query(&conn, &sql, &[ns.coll.as_str().into()]).await {
            Ok(rows) => {
                let table = rows.first().and_then(|r| r.get_str(0)).map(str::to_string);
                if let Some(table) = &table {
                    self.catalog().remember_collection(ns, table);
                }
                Ok(table)
            }
            Err(StorageError::NamespaceNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolves `ns`, creating it implicitly when missing.
    pub async fn ensure_collection(&self, ns: &Namespace) -> StorageResult<String> {
        if let Some(table) = self.resolve_table(ns).await? {
            return Ok(table);
        }
        match self.create_collection(ns).await {
            Ok(table) => Ok(table),
            Err(StorageError::NamespaceAlreadyExists(_)) => self
                .resolve_table(ns)
                .await?
                .ok_or_else(|| StorageError::NamespaceNotFound(ns.to_string())),
            Err(e) => Err(e),
        }
    }

    pub async fn collection_stats(&self, ns: &Namespace) -> StorageResult<CollectionStats> {
        let table = self
            .resolve_table(ns)
            .await?
            .ok_or_else(|| StorageError::NamespaceNotFound(ns.to_string()))?;
        let conn = self.acquire(Role::ReadOnly).await?;
        let sql = format!(
            "SELECT COUNT(*), CAST(COALESCE(SUM({}), 0) AS BIGINT) FROM {}",
            self.dialect().doc_size(),
            self.table_ref(&ns.db, &table)
        );
        let rows = match self.query(&conn, &sql, &[]).await {
            Err(StorageError::NamespaceNotFound(_)) => {
                self.catalog().forget_collection(ns);
                return Err(StorageError::NamespaceNotFound(ns.to_string()));
            }
            other => other?,
        };
        let row = rows.first();
        Ok(CollectionStats {
            count: row.and_then(|r| r.get_i64(0)).unwrap_or(0).max(0) as u64,
            size: row.and_then(|r| r.get_i64(1)).unwrap_or(0).max(0) as u64,
        })
    }

    // ---- reads ----

    /// Streams the documents of `ns` matching `opts`. Unsorted results come
    /// in insertion order.
    pub async fn find(&self, ns: &Namespace, opts: FindOptions) -> StorageResult<DocumentStream> {
        let Some(table) = self.resolve_table(ns).await? else {
            return Ok(DocumentStream::empty());
        };
        let predicate = pushdown::translate(&opts.filter, self.dialect());
        let plan = cursor::ScanPlan {
            ns: ns.clone(),
            table_ref: self.table_ref(&ns.db, &table),
            predicate,
            opts,
        };
        Ok(cursor::spawn_scan(self.clone(), plan))
    }

    /// Materialised [`find`](Self::find).
    pub async fn fetch(&self, ns: &Namespace, opts: FindOptions) -> StorageResult<Vec<Document>> {
        self.find(ns, opts).await?.collect_all().await
    }

    pub async fn count(
        &self,
        ns: &Namespace,
        filter: Filter,
        skip: usize,
        limit: Option<usize>,
    ) -> StorageResult<u64> {
        let total = if filter.is_empty() {
            match self.resolve_table(ns).await? {
                Some(_) => self.collection_stats(ns).await?.count,
                None => 0,
            }
        } else {
            let mut stream = self.find(ns, FindOptions::with_filter(filter)).await?;
            let mut n = 0u64;
            while let Some(item) = stream.next().await {
                item?;
                n += 1;
            }
            n
        };
        let after_skip = total.saturating_sub(skip as u64);
        Ok(match limit {
            Some(limit) if limit > 0 => after_skip.min(limit as u64),
            _ => after_skip,
        })
    }

    /// Distinct values of `key` over matching documents, in first-seen
    /// order. Array values contribute their elements.
    pub async fn distinct(&self, ns: &Namespace, key: &str, filter: Filter) -> StorageResult<Vec<Bson>> {
        let mut stream = self.find(ns, FindOptions::with_filter(filter)).await?;
        let mut out: Vec<Bson> = Vec::new();
        while let Some(item) = stream.next().await {
            let doc = item?;
            for value in resolve(&doc, key) {
                let values: Vec<&Bson> = match value {
                    Bson::Array(items) => items.iter().collect(),
                    other => vec![other],
                };
                for v in values {
                    if !out.iter().any(|seen| values_equal(seen, v)) {
                        out.push(v.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    pub(crate) async fn scan_page(
        &self,
        table_ref: &str,
        predicate: &Predicate,
        after: i64,
        ascending: bool,
        limit: usize,
    ) -> StorageResult<Vec<(i64, Document)>> {
        let dialect = self.dialect();
        let conn = self.acquire(Role::ReadOnly).await?;
        let mut params = Vec::new();
        let where_sql = dialect.render(predicate, &mut params);
        params.push(SqlValue::Integer(after));
        let (cmp, order) = if ascending { (">", "ASC") } else { ("<", "DESC") };
        let sql = format!(
            "SELECT _seq, {} FROM {} WHERE ({}) AND _seq {} {} ORDER BY _seq {} LIMIT {}",
            dialect.doc_column(),
            table_ref,
            where_sql,
            cmp,
            dialect.placeholder(params.len()),
            order,
            limit
        );
        let rows = self.query(&conn, &sql, &params).await?;
        rows.iter().map(decode_row).collect()
    }

    // ---- writes ----

    /// Inserts documents, creating the collection when needed. With
    /// `ordered`, stops at the first failing document.
    pub async fn insert(
        &self,
        ns: &Namespace,
        docs: Vec<Document>,
        ordered: bool,
    ) -> StorageResult<InsertOutcome> {
        let mut table_ref = self.table_ref(&ns.db, &self.ensure_collection(ns).await?);
        let mut conn = self.acquire(Role::Privileged).await?;
        let mut retried = false;
        let mut outcome = InsertOutcome::default();
        for (index, doc) in docs.into_iter().enumerate() {
            let result = match prepare_document(doc) {
                Ok((doc, _)) => {
                    let mut result = self.insert_row(&conn, &table_ref, ns, &doc).await;
                    if !retried && matches!(result, Err(StorageError::NamespaceNotFound(_))) {
                        retried = true;
                        drop(conn);
                        let table = self.recover_collection(ns).await?;
                        table_ref = self.table_ref(&ns.db, &table);
                        conn = self.acquire(Role::Privileged).await?;
                        result = self.insert_row(&conn, &table_ref, ns, &doc).await;
                    }
                    result
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => outcome.inserted += 1,
                Err(error) if error.is_document_error() => {
                    outcome.errors.push(WriteError { index, error });
                    if ordered {
                        break;
                    }
                }
                Err(StorageError::NamespaceNotFound(_)) => {
                    self.catalog().forget_collection(ns);
                    return Err(StorageError::NamespaceNotFound(ns.to_string()));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    /// Inserts one document and returns its identifier.
    pub async fn insert_one(&self, ns: &Namespace, doc: Document) -> StorageResult<Bson> {
        let (doc, id) = prepare_document(doc)?;
        let mut retried = false;
        loop {
            let table = self.ensure_collection(ns).await?;
            let table_ref = self.table_ref(&ns.db, &table);
            let conn = self.acquire(Role::Privileged).await?;
            match self.insert_row(&conn, &table_ref, ns, &doc).await {
                Ok(()) => return Ok(id),
                Err(StorageError::NamespaceNotFound(_)) if !retried => {
                    self.forget_stale(ns);
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drops a cached table mapping that no longer matches the backend,
    /// e.g. after another process dropped the collection.
    fn forget_stale(&self, ns: &Namespace) {
        tracing::debug!(ns = %ns, "Cached collection is gone, resolving again");
        self.catalog().forget_collection(ns);
    }

    /// Resolves a collection again after its cached table vanished,
    /// recreating it implicitly.
    async fn recover_collection(&self, ns: &Namespace) -> StorageResult<String> {
        self.forget_stale(ns);
        self.ensure_collection(ns).await
    }

    async fn insert_row(
        &self,
        conn: &PooledConnection,
        table_ref: &str,
        ns: &Namespace,
        doc: &Document,
    ) -> StorageResult<()> {
        let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
        let dialect = self.dialect();
        let sql = format!(
            "INSERT INTO {} (_id, _doc) VALUES ({}, {})",
            table_ref,
            dialect.placeholder(1),
            dialect.doc_param(2)
        );
        let params = [
            SqlValue::Text(pushdown::id_key(&id)),
            SqlValue::Text(document_to_string(doc)),
        ];
        match self.execute(conn, &sql, &params).await {
            Ok(_) => Ok(()),
            Err(StorageError::DuplicateKey(_)) => Err(StorageError::DuplicateKey(format!(
                "{} index: _id_ dup key: {{ _id: {} }}",
                ns, id
            ))),
            Err(e) => Err(e),
        }
    }

    /// Matching rows in insertion order, read under a write lock.
    async fn scan_locked(
        &self,
        conn: &PooledConnection,
        table_ref: &str,
        filter: &Filter,
    ) -> StorageResult<Vec<(i64, Document)>> {
        let dialect = self.dialect();
        let predicate = pushdown::translate(filter, dialect);
        let mut params = Vec::new();
        let where_sql = dialect.render(&predicate, &mut params);
        let sql = format!(
            "SELECT _seq, {} FROM {} WHERE {} ORDER BY _seq{}",
            dialect.doc_column(),
            table_ref,
            where_sql,
            dialect.lock_suffix()
        );
        let rows = self.query(conn, &sql, &params).await?;
        let mut out = Vec::new();
        for row in &rows {
            let (seq, doc) = decode_row(row)?;
            if filter.matches(&doc) {
                out.push((seq, doc));
            }
        }
        Ok(out)
    }

    /// Writes `next` over row `seq`, in place when a patch is available.
    async fn write_back(
        &self,
        conn: &PooledConnection,
        table_ref: &str,
        seq: i64,
        next: &Document,
        patch: Option<&PatchOps>,
    ) -> StorageResult<()> {
        check_stored(next)?;
        let dialect = self.dialect();
        let mut params = Vec::new();
        let set_expr = match patch.and_then(|p| dialect.patch_expr(p, &mut params)) {
            Some(expr) => expr,
            None => {
                params.clear();
                params.push(SqlValue::Text(document_to_string(next)));
                dialect.doc_param(1)
            }
        };
        params.push(SqlValue::Integer(seq));
        let sql = format!(
            "UPDATE {} SET _doc = {} WHERE _seq = {}",
            table_ref,
            set_expr,
            dialect.placeholder(params.len())
        );
        self.execute(conn, &sql, &params).await?;
        Ok(())
    }

    async fn delete_row(&self, conn: &PooledConnection, table_ref: &str, seq: i64) -> StorageResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE _seq = {}",
            table_ref,
            self.dialect().placeholder(1)
        );
        self.execute(conn, &sql, &[SqlValue::Integer(seq)]).await?;
        Ok(())
    }

    /// Applies an update to the first (or every, with `multi`) matching
    /// document inside one transaction.
    pub async fn update(&self, ns: &Namespace, req: &UpdateRequest) -> StorageResult<UpdateOutcome> {
        let mut retried = false;
        loop {
            let table = match self.resolve_table(ns).await? {
                Some(table) => table,
                None if req.upsert => self.ensure_collection(ns).await?,
                None => return Ok(UpdateOutcome::default()),
            };
            let table_ref = self.table_ref(&ns.db, &table);
            let conn = self.acquire(Role::Privileged).await?;
            self.begin(&conn).await?;
            let result = self.update_in_tx(&conn, &table_ref, ns, req).await;
            match self.finish(&conn, result).await {
                Err(StorageError::NamespaceNotFound(_)) if !retried => {
                    self.forget_stale(ns);
                    retried = true;
                }
                other => return other,
            }
        }
    }

    async fn update_in_tx(
        &self,
        conn: &PooledConnection,
        table_ref: &str,
        ns: &Namespace,
        req: &UpdateRequest,
    ) -> StorageResult<UpdateOutcome> {
        let patch = if self.dialect().capabilities().atomic_patch {
            req.update.patch_ops()
        } else {
            None
        };
        let mut outcome = UpdateOutcome::default();
        for (seq, doc) in self.scan_locked(conn, table_ref, &req.filter).await? {
            outcome.matched += 1;
            let mut next = doc.clone();
            req.update.apply(&mut next, false)?;
            if next != doc {
                self.write_back(conn, table_ref, seq, &next, patch.as_ref())
                    .await?;
                outcome.modified += 1;
            }
            if !req.multi {
                break;
            }
        }
        if outcome.matched == 0 && req.upsert {
            let doc = req.update.upsert_document(&req.filter_doc)?;
            let (doc, id) = prepare_document(doc)?;
            self.insert_row(conn, table_ref, ns, &doc).await?;
            outcome.upserted_id = Some(id);
        }
        Ok(outcome)
    }

    /// Deletes the first (or every) matching document. Returns the count.
    pub async fn delete(&self, ns: &Namespace, filter: &Filter, just_one: bool) -> StorageResult<u64> {
        let mut retried = false;
        loop {
            let Some(table) = self.resolve_table(ns).await? else {
                return Ok(0);
            };
            let table_ref = self.table_ref(&ns.db, &table);
            let conn = self.acquire(Role::Privileged).await?;
            self.begin(&conn).await?;
            let result = async {
                let mut deleted = 0;
                for (seq, _) in self.scan_locked(&conn, &table_ref, filter).await? {
                    self.delete_row(&conn, &table_ref, seq).await?;
                    deleted += 1;
                    if just_one {
                        break;
                    }
                }
                Ok(deleted)
            }
            .await;
            match self.finish(&conn, result).await {
                Err(StorageError::NamespaceNotFound(_)) if !retried => {
                    self.forget_stale(ns);
                    retried = true;
                }
                other => return other,
            }
        }
    }

    /// Atomically finds one document and removes or updates it.
    pub async fn find_and_modify(
        &self,
        ns: &Namespace,
        req: &FindAndModifyRequest,
    ) -> StorageResult<FindAndModifyOutcome> {
        let mut retried = false;
        loop {
            let table = match self.resolve_table(ns).await? {
                Some(table) => table,
                None if req.upsert && !req.remove => self.ensure_collection(ns).await?,
                None => return Ok(FindAndModifyOutcome::default()),
            };
            let table_ref = self.table_ref(&ns.db, &table);
            let conn = self.acquire(Role::Privileged).await?;
            self.begin(&conn).await?;
            let result = self.find_and_modify_in_tx(&conn, &table_ref, ns, req).await;
            match self.finish(&conn, result).await {
                Err(StorageError::NamespaceNotFound(_)) if !retried => {
                    self.forget_stale(ns);
                    retried = true;
                }
                other => return other,
            }
        }
    }

    async fn find_and_modify_in_tx(
        &self,
        conn: &PooledConnection,
        table_ref: &str,
        ns: &Namespace,
        req: &FindAndModifyRequest,
    ) -> StorageResult<FindAndModifyOutcome> {
        let mut candidates = self.scan_locked(conn, table_ref, &req.filter).await?;
        if let Some(sort) = &req.sort {
            candidates.sort_by(|a, b| sort.compare(&a.1, &b.1));
        }
        let project = |doc: Document| match &req.projection {
            Some(p) => p.apply(&doc),
            None => doc,
        };
        let mut outcome = FindAndModifyOutcome::default();

        if let Some((seq, doc)) = candidates.into_iter().next() {
            outcome.n = 1;
            if req.remove {
                self.delete_row(conn, table_ref, seq).await?;
                outcome.value = Some(project(doc));
                return Ok(outcome);
            }
            let Some(update) = &req.update else {
                return Err(QueryError::FailedToParse("either an update or remove=true must be specified".into()).into());
            };
            let mut next = doc.clone();
            update.apply(&mut next, false)?;
            if next != doc {
                self.write_back(conn, table_ref, seq, &next, None).await?;
            }
            outcome.updated_existing = true;
            outcome.value = Some(project(if req.return_new { next } else { doc }));
            return Ok(outcome);
        }

        if req.upsert && !req.remove {
            if let Some(update) = &req.update {
                let doc = update.upsert_document(&req.filter_doc)?;
                let (doc, id) = prepare_document(doc)?;
                self.insert_row(conn, table_ref, ns, &doc).await?;
                outcome.n = 1;
                outcome.upserted_id = Some(id);
                if req.return_new {
                    outcome.value = Some(project(doc));
                }
            }
        }
        Ok(outcome)
    }
}
