//! SQLite backend on `rusqlite`.
//!
//! SQLite has no schemas, so databases are rows of `_docwire_schemas` and a
//! collection table is named `"<schema>.<table>"`. Statements run on the
//! blocking pool; cancellation uses the connection's interrupt handle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{ErrorCode, InterruptHandle, OpenFlags};

use super::{
    is_plain_key, quote_ident, BackendError, BackendResult, Capabilities, Connection,
    ConnectionFactory, Dialect, Predicate, PushdownOp, Role, Row, SqlValue, Statement,
};
use crate::bson::extjson;
use crate::query::update::PatchOps;
use crate::storage::METADATA_TABLE;

/// Global registry of databases.
pub const SCHEMAS_TABLE: &str = "_docwire_schemas";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn map_error(err: rusqlite::Error) -> BackendError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let message = message.clone().unwrap_or_else(|| failure.to_string());
            match failure.code {
                ErrorCode::ConstraintViolation if message.contains("UNIQUE") => {
                    BackendError::UniqueViolation(message)
                }
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => BackendError::Busy(message),
                ErrorCode::OperationInterrupted => BackendError::Cancelled,
                ErrorCode::ReadOnly | ErrorCode::PermissionDenied => {
                    BackendError::PermissionDenied(message)
                }
                ErrorCode::CannotOpen | ErrorCode::NotADatabase => BackendError::Connection(message),
                _ if message.contains("no such table") => BackendError::NotFound(message),
                _ if message.contains("already exists") => BackendError::AlreadyExists(message),
                _ => BackendError::Query(message),
            }
        }
        _ => BackendError::Query(err.to_string()),
    }
}

fn to_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(n) => Value::Integer(*n),
        SqlValue::Text(s) => Value::Text(s.clone()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(n) => SqlValue::Integer(n),
        ValueRef::Real(f) => SqlValue::Text(f.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            SqlValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

pub struct SqliteConnection {
    conn: Arc<Mutex<rusqlite::Connection>>,
    interrupt: InterruptHandle,
    role: Role,
    in_tx: AtomicBool,
    broken: AtomicBool,
}

impl SqliteConnection {
    fn new(conn: rusqlite::Connection, role: Role) -> Self {
        let interrupt = conn.get_interrupt_handle();
        Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            role,
            in_tx: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        }
    }

    async fn run<T, F>(&self, f: F) -> BackendResult<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> BackendResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await;
        match result {
            Ok(inner) => inner,
            Err(e) => {
                self.broken.store(true, Ordering::Release);
                Err(BackendError::Connection(format!("sqlite worker failed: {}", e)))
            }
        }
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> BackendResult<u64> {
        let sql = sql.to_string();
        let params: Vec<Value> = params.iter().map(to_value).collect();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(&sql).map_err(map_error)?;
            let changed = stmt
                .execute(rusqlite::params_from_iter(params.iter()))
                .map_err(map_error)?;
            Ok(changed as u64)
        })
        .await
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> BackendResult<Vec<Row>> {
        let sql = sql.to_string();
        let params: Vec<Value> = params.iter().map(to_value).collect();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(&sql).map_err(map_error)?;
            let width = stmt.column_count();
            let mut rows = stmt
                .query(rusqlite::params_from_iter(params.iter()))
                .map_err(map_error)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(map_error)? {
                let mut values = Vec::with_capacity(width);
                for i in 0..width {
                    values.push(from_value_ref(row.get_ref(i).map_err(map_error)?));
                }
                out.push(Row::new(values));
            }
            Ok(out)
        })
        .await
    }

    async fn begin(&self) -> BackendResult<()> {
        // Writers take the write lock up front so concurrent writers queue on
        // the busy timeout instead of failing at commit.
        let sql = match self.role {
            Role::Privileged => "BEGIN IMMEDIATE",
            Role::ReadOnly => "BEGIN",
        };
        self.run(move |conn| conn.execute_batch(sql).map_err(map_error))
            .await?;
        self.in_tx.store(true, Ordering::Release);
        Ok(())
    }

    async fn commit(&self) -> BackendResult<()> {
        let result = self
            .run(|conn| conn.execute_batch("COMMIT").map_err(map_error))
            .await;
        self.in_tx.store(false, Ordering::Release);
        result
    }

    async fn rollback(&self) -> BackendResult<()> {
        let result = self
            .run(|conn| {
                if conn.is_autocommit() {
                    return Ok(());
                }
                conn.execute_batch("ROLLBACK").map_err(map_error)
            })
            .await;
        self.in_tx.store(false, Ordering::Release);
        result
    }

    async fn is_valid(&self) -> bool {
        !self.is_broken()
            && self
                .run(|conn| conn.execute_batch("SELECT 1").map_err(map_error))
                .await
                .is_ok()
    }

    fn in_transaction(&self) -> bool {
        self.in_tx.load(Ordering::Acquire)
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    fn interrupt(&self) {
        self.broken.store(true, Ordering::Release);
        self.interrupt.interrupt();
    }
}

pub struct SqliteConnectionFactory {
    path: PathBuf,
}

impl SqliteConnectionFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

fn open(path: PathBuf, role: Role) -> BackendResult<rusqlite::Connection> {
    let flags = match role {
        Role::Privileged => {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        }
        Role::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    };
    let conn = rusqlite::Connection::open_with_flags(&path, flags)
        .map_err(|e| BackendError::Connection(format!("{}: {}", path.display(), e)))?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(map_error)?;
    if role == Role::Privileged {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(map_error)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (name TEXT PRIMARY KEY, database TEXT NOT NULL UNIQUE)",
            SCHEMAS_TABLE
        ))
        .map_err(map_error)?;
    }
    Ok(conn)
}

#[async_trait]
impl ConnectionFactory for SqliteConnectionFactory {
    async fn connect(&self, role: Role) -> BackendResult<Box<dyn Connection>> {
        let path = self.path.clone();
        let conn = tokio::task::spawn_blocking(move || open(path, role))
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))??;
        Ok(Box::new(SqliteConnection::new(conn, role)))
    }
}

pub struct SqliteDialect;

impl SqliteDialect {
    /// JSON path such as `$."a"."b"`; components are plain keys.
    fn json_path(&self, path: &[String], params: &mut Vec<SqlValue>) -> String {
        let mut text = String::from("$");
        for part in path {
            text.push_str(&format!(".\"{}\"", part));
        }
        params.push(SqlValue::Text(text));
        self.placeholder(params.len())
    }
}

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            atomic_patch: true,
            row_locks: false,
        }
    }

    fn supports(&self, op: PushdownOp) -> bool {
        matches!(
            op,
            PushdownOp::Eq | PushdownOp::In | PushdownOp::Exists | PushdownOp::Size
        )
    }

    fn folds_identifier_case(&self) -> bool {
        true
    }

    fn max_identifier_len(&self) -> usize {
        255
    }

    fn placeholder(&self, n: usize) -> String {
        format!("?{}", n)
    }

    fn table_ref(&self, schema: &str, table: &str) -> String {
        quote_ident(&format!("{}.{}", schema, table))
    }

    fn create_schema(&self, schema: &str, database: &str) -> Vec<Statement> {
        vec![
            Statement::new(format!(
                "INSERT INTO {} (name, database) VALUES (?1, ?2)",
                SCHEMAS_TABLE
            ))
            .with_params(vec![schema.into(), database.into()]),
            Statement::new(self.create_metadata_table(&self.table_ref(schema, METADATA_TABLE))),
        ]
    }

    fn drop_schema(&self, schema: &str, _database: &str, tables: &[String]) -> Vec<Statement> {
        let mut stmts = vec![Statement::new(format!(
            "DELETE FROM {} WHERE name = ?1",
            SCHEMAS_TABLE
        ))
        .with_params(vec![schema.into()])
        .expecting_rows()];
        for table in tables {
            stmts.push(Statement::new(format!(
                "DROP TABLE IF EXISTS {}",
                self.table_ref(schema, table)
            )));
        }
        stmts.push(Statement::new(format!(
            "DROP TABLE IF EXISTS {}",
            self.table_ref(schema, METADATA_TABLE)
        )));
        stmts
    }

    fn list_schemas(&self) -> Statement {
        Statement::new(format!(
            "SELECT database FROM {} ORDER BY database",
            SCHEMAS_TABLE
        ))
    }

    fn create_metadata_table(&self, table_ref: &str) -> String {
        format!(
            "CREATE TABLE {} (name TEXT PRIMARY KEY, table_name TEXT NOT NULL UNIQUE)",
            table_ref
        )
    }

    fn create_collection_table(&self, table_ref: &str) -> String {
        format!(
            "CREATE TABLE {} (_seq INTEGER PRIMARY KEY AUTOINCREMENT, _id TEXT NOT NULL UNIQUE, _doc TEXT NOT NULL)",
            table_ref
        )
    }

    fn doc_param(&self, n: usize) -> String {
        self.placeholder(n)
    }

    fn doc_column(&self) -> &'static str {
        "_doc"
    }

    fn doc_size(&self) -> &'static str {
        "length(CAST(_doc AS BLOB))"
    }

    fn lock_suffix(&self) -> &'static str {
        ""
    }

    fn render(&self, predicate: &Predicate, params: &mut Vec<SqlValue>) -> String {
        match predicate {
            Predicate::And(items) if items.is_empty() => "1".to_string(),
            Predicate::Or(items) if items.is_empty() => "0".to_string(),
            Predicate::And(items) => items
                .iter()
                .map(|p| format!("({})", self.render(p, params)))
                .collect::<Vec<_>>()
                .join(" AND "),
            Predicate::Or(items) => items
                .iter()
                .map(|p| format!("({})", self.render(p, params)))
                .collect::<Vec<_>>()
                .join(" OR "),
            Predicate::IdEq(key) => {
                params.push(SqlValue::Text(key.clone()));
                format!("_id = {}", self.placeholder(params.len()))
            }
            Predicate::TextEq { path, value } => {
                let p = self.json_path(path, params);
                params.push(SqlValue::Text(value.clone()));
                format!("json_extract(_doc, {}) = {}", p, self.placeholder(params.len()))
            }
            Predicate::BoolEq { path, value } => {
                let p = self.json_path(path, params);
                format!("json_type(_doc, {}) = '{}'", p, value)
            }
            Predicate::IsArray { path } => {
                format!("json_type(_doc, {}) = 'array'", self.json_path(path, params))
            }
            Predicate::Exists { path } => {
                format!("json_type(_doc, {}) IS NOT NULL", self.json_path(path, params))
            }
            Predicate::ArrayLen { path, len } => {
                let p = self.json_path(path, params);
                params.push(SqlValue::Integer(*len as i64));
                format!(
                    "json_array_length(_doc, {}) = {}",
                    p,
                    self.placeholder(params.len())
                )
            }
        }
    }

    fn patch_expr(&self, patch: &PatchOps, params: &mut Vec<SqlValue>) -> Option<String> {
        let mut keys = patch.set.iter().map(|(k, _)| k).chain(patch.unset.iter());
        if keys.any(|k| !is_plain_key(k)) {
            return None;
        }
        let mut expr = String::from("_doc");
        if !patch.set.is_empty() {
            let mut args = vec![expr];
            for (key, value) in &patch.set {
                let path = self.json_path(std::slice::from_ref(key), params);
                params.push(SqlValue::Text(extjson::to_json(value).to_string()));
                args.push(format!("{}, json({})", path, self.placeholder(params.len())));
            }
            expr = format!("json_set({})", args.join(", "));
        }
        if !patch.unset.is_empty() {
            let mut args = vec![expr];
            for key in &patch.unset {
                args.push(self.json_path(std::slice::from_ref(key), params));
            }
            expr = format!("json_remove({})", args.join(", "));
        }
        Some(expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::Bson;
    use tempfile::TempDir;

    #[test]
    fn test_render_predicates() {
        let d = SqliteDialect;
        let mut params = Vec::new();
        let pred = Predicate::Or(vec![
            Predicate::TextEq {
                path: vec!["a".into(), "$numberInt".into()],
                value: "5".into(),
            },
            Predicate::ArrayLen {
                path: vec!["tags".into()],
                len: 2,
            },
        ]);
        let sql = d.render(&pred, &mut params);
        assert_eq!(
            sql,
            "(json_extract(_doc, ?1) = ?2) OR (json_array_length(_doc, ?3) = ?4)"
        );
        assert_eq!(params[0], SqlValue::Text("$.\"a\".\"$numberInt\"".into()));
        assert_eq!(params[3], SqlValue::Integer(2));
    }

    #[test]
    fn test_patch_expression() {
        let d = SqliteDialect;
        let patch = PatchOps {
            set: vec![("a".into(), Bson::Int32(1))],
            unset: vec!["b".into()],
        };
        let mut params = Vec::new();
        let expr = d.patch_expr(&patch, &mut params).unwrap();
        assert_eq!(expr, "json_remove(json_set(_doc, ?1, json(?2)), ?3)");
        assert_eq!(params[1], SqlValue::Text("{\"$numberInt\":\"1\"}".into()));

        let odd = PatchOps {
            set: vec![("a b".into(), Bson::Null)],
            unset: vec![],
        };
        assert!(d.patch_expr(&odd, &mut Vec::new()).is_none());
    }

    #[test]
    fn test_schema_statements() {
        let d = SqliteDialect;
        let stmts = d.drop_schema("test", "test", &["values".into()]);
        assert!(stmts[0].expect_rows);
        assert_eq!(stmts[1].sql, "DROP TABLE IF EXISTS \"test.values\"");
        assert_eq!(stmts.len(), 3);
    }

    #[tokio::test]
    async fn test_connection_roundtrip_and_errors() {
        let dir = TempDir::new().unwrap();
        let factory = SqliteConnectionFactory::new(dir.path().join("db.sqlite"));
        let conn = factory.connect(Role::Privileged).await.unwrap();

        conn.execute("CREATE TABLE t (_id TEXT UNIQUE, v INTEGER)", &[])
            .await
            .unwrap();
        conn.begin().await.unwrap();
        assert!(conn.in_transaction());
        conn.execute(
            "INSERT INTO t (_id, v) VALUES (?1, ?2)",
            &["a".into(), SqlValue::Integer(7)],
        )
        .await
        .unwrap();
        conn.commit().await.unwrap();

        let rows = conn.query("SELECT _id, v FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str(0), Some("a"));
        assert_eq!(rows[0].get_i64(1), Some(7));

        let err = conn
            .execute("INSERT INTO t (_id, v) VALUES ('a', 1)", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::UniqueViolation(_)));

        let err = conn.query("SELECT * FROM missing", &[]).await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));

        let err = conn.execute("CREATE TABLE t (x)", &[]).await.unwrap_err();
        assert!(matches!(err, BackendError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_interrupted_connection_is_broken() {
        let dir = TempDir::new().unwrap();
        let factory = SqliteConnectionFactory::new(dir.path().join("db.sqlite"));
        let conn = factory.connect(Role::Privileged).await.unwrap();
        assert!(!conn.is_broken());
        conn.interrupt();
        assert!(conn.is_broken());
    }

    #[tokio::test]
    async fn test_read_only_role_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let factory = SqliteConnectionFactory::new(dir.path().join("db.sqlite"));
        let rw = factory.connect(Role::Privileged).await.unwrap();
        rw.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();

        let ro = factory.connect(Role::ReadOnly).await.unwrap();
        assert!(ro.query("SELECT v FROM t", &[]).await.unwrap().is_empty());
        let err = ro.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap_err();
        assert!(matches!(err, BackendError::PermissionDenied(_)));
    }
}
