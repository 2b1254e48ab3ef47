//! Relational backend abstraction
//!
//! A backend is a [`ConnectionFactory`] (how to open role-scoped connections)
//! paired with a [`Dialect`] (how to spell statements and which filter
//! operators it can evaluate). PostgreSQL and SQLite are provided.

pub mod pool;
pub mod postgres;
pub mod sqlite;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;
use crate::query::update::PatchOps;

pub use pool::{Pool, PoolConfig, PoolStats, PooledConnection};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("statement cancelled")]
    Cancelled,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("database busy: {0}")]
    Busy(String),

    #[error("connection pool is shut down")]
    PoolShutdown,

    #[error("timed out waiting for a connection")]
    PoolTimeout,

    #[error("query failed: {0}")]
    Query(String),
}

impl BackendError {
    /// Transient failures worth another attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BackendError::Connection(_) | BackendError::Busy(_) | BackendError::PoolTimeout
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Connection(_)
            | BackendError::Busy(_)
            | BackendError::PoolShutdown
            | BackendError::PoolTimeout => ErrorKind::BackendUnavailable,
            BackendError::NotFound(_) => ErrorKind::NamespaceNotFound,
            BackendError::AlreadyExists(_) | BackendError::UniqueViolation(_) => {
                ErrorKind::NamespaceAlreadyExists
            }
            _ => ErrorKind::CommandError,
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Connection privilege level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// DDL and all DML.
    Privileged,
    /// Reads only, enforced by the backend.
    ReadOnly,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Privileged => "privileged",
            Role::ReadOnly => "read_only",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn get_i64(&self, index: usize) -> Option<i64> {
        match self.values.get(index)? {
            SqlValue::Integer(v) => Some(*v),
            SqlValue::Text(s) => s.parse().ok(),
            SqlValue::Null => None,
        }
    }

    pub fn get_str(&self, index: usize) -> Option<&str> {
        match self.values.get(index)? {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// One backend session.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> BackendResult<u64>;

    async fn query(&self, sql: &str, params: &[SqlValue]) -> BackendResult<Vec<Row>>;

    async fn begin(&self) -> BackendResult<()>;

    async fn commit(&self) -> BackendResult<()>;

    async fn rollback(&self) -> BackendResult<()>;

    /// Cheap round trip used before handing out a pooled connection.
    async fn is_valid(&self) -> bool;

    fn in_transaction(&self) -> bool;

    /// Set once the session is unusable and must not be pooled.
    fn is_broken(&self) -> bool;

    /// Aborts the statement currently running on this session, if any.
    fn interrupt(&self);
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, role: Role) -> BackendResult<Box<dyn Connection>>;
}

/// What a backend can do natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// In-place partial update of the document column.
    pub atomic_patch: bool,
    /// `SELECT ... FOR UPDATE` row locks.
    pub row_locks: bool,
}

/// Filter operators a dialect may evaluate in SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushdownOp {
    Eq,
    In,
    Exists,
    Size,
}

impl PushdownOp {
    pub fn name(self) -> &'static str {
        match self {
            PushdownOp::Eq => "$eq",
            PushdownOp::In => "$in",
            PushdownOp::Exists => "$exists",
            PushdownOp::Size => "$size",
        }
    }
}

/// Backend-neutral row predicate over the stored document.
///
/// Paths address the canonical JSON text, so wrapper keys such as
/// `$numberInt` appear as ordinary path components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    /// Exact match on the identifier key column.
    IdEq(String),
    /// The value at `path` is a JSON string equal to `value`.
    TextEq { path: Vec<String>, value: String },
    BoolEq { path: Vec<String>, value: bool },
    IsArray { path: Vec<String> },
    Exists { path: Vec<String> },
    ArrayLen { path: Vec<String>, len: usize },
}

/// A statement with bound parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
    /// Zero affected rows means the target did not exist.
    pub expect_rows: bool,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            expect_rows: false,
        }
    }

    pub fn with_params(mut self, params: Vec<SqlValue>) -> Self {
        self.params = params;
        self
    }

    pub fn expecting_rows(mut self) -> Self {
        self.expect_rows = true;
        self
    }
}

/// SQL spelling and capabilities of a backend.
pub trait Dialect: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Whether `op` can be evaluated by the backend.
    fn supports(&self, op: PushdownOp) -> bool;

    /// Identifiers differing only in case collide.
    fn folds_identifier_case(&self) -> bool;

    fn max_identifier_len(&self) -> usize;

    /// Placeholder for the `n`th (1-based) parameter.
    fn placeholder(&self, n: usize) -> String;

    fn table_ref(&self, schema: &str, table: &str) -> String;

    fn create_schema(&self, schema: &str, database: &str) -> Vec<Statement>;

    fn drop_schema(&self, schema: &str, database: &str, tables: &[String]) -> Vec<Statement>;

    /// Query returning one row per database, name first.
    fn list_schemas(&self) -> Statement;

    fn create_metadata_table(&self, table_ref: &str) -> String;

    fn create_collection_table(&self, table_ref: &str) -> String;

    /// Expression binding the `n`th parameter as a document value.
    fn doc_param(&self, n: usize) -> String;

    /// Select expression yielding the document as text.
    fn doc_column(&self) -> &'static str;

    /// Select expression yielding the stored size of a document.
    fn doc_size(&self) -> &'static str;

    /// Suffix locking rows read inside a write transaction.
    fn lock_suffix(&self) -> &'static str;

    fn render(&self, predicate: &Predicate, params: &mut Vec<SqlValue>) -> String;

    /// Expression producing the patched document column, if the backend can
    /// apply `patch` in place.
    fn patch_expr(&self, patch: &PatchOps, params: &mut Vec<SqlValue>) -> Option<String>;
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// A path component that can be embedded in backend JSON paths verbatim.
pub fn is_plain_key(key: &str) -> bool {
    !key.is_empty()
        && !key.bytes().all(|b| b.is_ascii_digit())
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b == b'-')
}

/// Runs `fut` unless `cancel` fires first, in which case the statement is
/// interrupted and awaited so the session is left idle.
pub async fn cancellable<T, F>(
    cancel: &CancellationToken,
    conn: &dyn Connection,
    fut: F,
) -> BackendResult<T>
where
    F: Future<Output = BackendResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(BackendError::Cancelled);
    }
    tokio::pin!(fut);
    tokio::select! {
        biased;
        result = &mut fut => result,
        _ = cancel.cancelled() => {
            conn.interrupt();
            let _ = fut.await;
            Err(BackendError::Cancelled)
        }
    }
}

/// A configured backend.
#[derive(Clone)]
pub struct Backend {
    pub factory: Arc<dyn ConnectionFactory>,
    pub dialect: Arc<dyn Dialect>,
}

/// Opens the backend named by `url` (`postgres://`, `postgresql://` or
/// `sqlite://<path>`).
pub fn open(url: &str, read_only_url: Option<&str>) -> BackendResult<Backend> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let factory = postgres::PgConnectionFactory::new(url, read_only_url);
        Ok(Backend {
            factory: Arc::new(factory),
            dialect: Arc::new(postgres::PostgresDialect),
        })
    } else if let Some(path) = url.strip_prefix("sqlite://") {
        if path.is_empty() {
            return Err(BackendError::Connection(
                "sqlite URL needs a file path".into(),
            ));
        }
        Ok(Backend {
            factory: Arc::new(sqlite::SqliteConnectionFactory::new(path)),
            dialect: Arc::new(sqlite::SqliteDialect),
        })
    } else {
        Err(BackendError::Connection(format!(
            "unsupported backend URL: {}",
            url
        )))
    }
}
