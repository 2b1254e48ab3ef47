//! PostgreSQL backend on `tokio-postgres`.
//!
//! Each database is a real schema; documents live in a `json` column.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{CancelToken, Client, NoTls};

use super::{
    quote_ident, BackendError, BackendResult, Capabilities, Connection, ConnectionFactory,
    Dialect, Predicate, PushdownOp, Role, Row, SqlValue, Statement,
};
use crate::query::update::PatchOps;

fn value_to_sql(value: &SqlValue) -> Box<dyn ToSql + Sync + Send> {
    match value {
        SqlValue::Null => Box::new(Option::<String>::None),
        SqlValue::Integer(n) => Box::new(*n),
        SqlValue::Text(s) => Box::new(s.clone()),
    }
}

fn pg_row_to_row(row: &tokio_postgres::Row) -> Row {
    let values = row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let value = match *col.type_() {
                Type::INT8 => row.try_get::<_, Option<i64>>(i).ok().flatten().map(SqlValue::Integer),
                Type::INT4 => row
                    .try_get::<_, Option<i32>>(i)
                    .ok()
                    .flatten()
                    .map(|v| SqlValue::Integer(v.into())),
                Type::INT2 => row
                    .try_get::<_, Option<i16>>(i)
                    .ok()
                    .flatten()
                    .map(|v| SqlValue::Integer(v.into())),
                Type::BOOL => row
                    .try_get::<_, Option<bool>>(i)
                    .ok()
                    .flatten()
                    .map(|v| SqlValue::Integer(v.into())),
                _ => row.try_get::<_, Option<String>>(i).ok().flatten().map(SqlValue::Text),
            };
            value.unwrap_or(SqlValue::Null)
        })
        .collect();
    Row::new(values)
}

fn map_error(err: tokio_postgres::Error) -> BackendError {
    if err.is_closed() {
        return BackendError::Connection(err.to_string());
    }
    let message = match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    };
    match err.code() {
        Some(code) if *code == SqlState::DUPLICATE_SCHEMA || *code == SqlState::DUPLICATE_TABLE => {
            BackendError::AlreadyExists(message)
        }
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => BackendError::UniqueViolation(message),
        Some(code)
            if *code == SqlState::INVALID_SCHEMA_NAME || *code == SqlState::UNDEFINED_TABLE =>
        {
            BackendError::NotFound(message)
        }
        Some(code) if *code == SqlState::QUERY_CANCELED => BackendError::Cancelled,
        Some(code)
            if *code == SqlState::READ_ONLY_SQL_TRANSACTION
                || *code == SqlState::INSUFFICIENT_PRIVILEGE =>
        {
            BackendError::PermissionDenied(message)
        }
        Some(code)
            if *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::LOCK_NOT_AVAILABLE =>
        {
            BackendError::Busy(message)
        }
        Some(code) if *code == SqlState::ADMIN_SHUTDOWN || *code == SqlState::CANNOT_CONNECT_NOW => {
            BackendError::Connection(message)
        }
        _ => BackendError::Query(message),
    }
}

pub struct PgConnection {
    client: Client,
    cancel_token: CancelToken,
    in_tx: AtomicBool,
    broken: AtomicBool,
}

impl PgConnection {
    pub fn new(client: Client) -> Self {
        let cancel_token = client.cancel_token();
        Self {
            client,
            cancel_token,
            in_tx: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        }
    }

    fn check(&self, result: Result<(), tokio_postgres::Error>) -> BackendResult<()> {
        result.map_err(|e| self.observe(e))
    }

    fn observe(&self, err: tokio_postgres::Error) -> BackendError {
        let err = map_error(err);
        if matches!(err, BackendError::Connection(_)) {
            self.broken.store(true, Ordering::Release);
        }
        err
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> BackendResult<u64> {
        let boxed: Vec<Box<dyn ToSql + Sync + Send>> = params.iter().map(value_to_sql).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();
        self.client
            .execute(sql, &refs)
            .await
            .map_err(|e| self.observe(e))
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> BackendResult<Vec<Row>> {
        let boxed: Vec<Box<dyn ToSql + Sync + Send>> = params.iter().map(value_to_sql).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = self
            .client
            .query(sql, &refs)
            .await
            .map_err(|e| self.observe(e))?;
        Ok(rows.iter().map(pg_row_to_row).collect())
    }

    async fn begin(&self) -> BackendResult<()> {
        self.check(self.client.batch_execute("BEGIN").await)?;
        self.in_tx.store(true, Ordering::Release);
        Ok(())
    }

    async fn commit(&self) -> BackendResult<()> {
        let result = self.client.batch_execute("COMMIT").await;
        self.in_tx.store(false, Ordering::Release);
        self.check(result)
    }

    async fn rollback(&self) -> BackendResult<()> {
        let result = self.client.batch_execute("ROLLBACK").await;
        self.in_tx.store(false, Ordering::Release);
        self.check(result)
    }

    async fn is_valid(&self) -> bool {
        !self.is_broken() && self.client.simple_query("SELECT 1").await.is_ok()
    }

    fn in_transaction(&self) -> bool {
        self.in_tx.load(Ordering::Acquire)
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire) || self.client.is_closed()
    }

    /// Sends a cancel request. The session is retired afterwards since the
    /// request may land after the statement already finished.
    fn interrupt(&self) {
        self.broken.store(true, Ordering::Release);
        let token = self.cancel_token.clone();
        tokio::spawn(async move {
            if let Err(e) = token.cancel_query(NoTls).await {
                tracing::debug!("Cancel request failed: {}", e);
            }
        });
    }
}

pub struct PgConnectionFactory {
    url: String,
    read_only_url: Option<String>,
}

impl PgConnectionFactory {
    pub fn new(url: &str, read_only_url: Option<&str>) -> Self {
        Self {
            url: url.to_string(),
            read_only_url: read_only_url.map(str::to_string),
        }
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, role: Role) -> BackendResult<Box<dyn Connection>> {
        let url = match (role, &self.read_only_url) {
            (Role::ReadOnly, Some(url)) => url.as_str(),
            _ => self.url.as_str(),
        };
        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("PostgreSQL connection error: {}", e);
            }
        });

        if role == Role::ReadOnly {
            client
                .batch_execute("SET default_transaction_read_only = on")
                .await
                .map_err(map_error)?;
        }

        Ok(Box::new(PgConnection::new(client)))
    }
}

pub struct PostgresDialect;

impl PostgresDialect {
    /// `_doc -> $a::text -> $b::text`, optionally ending in `->>` for text.
    fn accessor(&self, path: &[String], as_text: bool, params: &mut Vec<SqlValue>) -> String {
        let mut expr = String::from("_doc");
        for (i, part) in path.iter().enumerate() {
            params.push(SqlValue::Text(part.clone()));
            let op = if as_text && i + 1 == path.len() { "->>" } else { "->" };
            expr.push_str(&format!(" {} {}::text", op, self.placeholder(params.len())));
        }
        expr
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            atomic_patch: false,
            row_locks: true,
        }
    }

    fn supports(&self, op: PushdownOp) -> bool {
        matches!(op, PushdownOp::Eq | PushdownOp::In | PushdownOp::Exists)
    }

    fn folds_identifier_case(&self) -> bool {
        false
    }

    fn max_identifier_len(&self) -> usize {
        63
    }

    fn placeholder(&self, n: usize) -> String {
        format!("${}", n)
    }

    fn table_ref(&self, schema: &str, table: &str) -> String {
        format!("{}.{}", quote_ident(schema), quote_ident(table))
    }

    fn create_schema(&self, schema: &str, _database: &str) -> Vec<Statement> {
        vec![
            Statement::new(format!("CREATE SCHEMA {}", quote_ident(schema))),
            Statement::new(
                self.create_metadata_table(&self.table_ref(schema, crate::storage::METADATA_TABLE)),
            ),
        ]
    }

    fn drop_schema(&self, schema: &str, _database: &str, _tables: &[String]) -> Vec<Statement> {
        vec![Statement::new(format!("DROP SCHEMA {} CASCADE", quote_ident(schema)))]
    }

    fn list_schemas(&self) -> Statement {
        Statement::new(format!(
            "SELECT n.nspname::text FROM pg_namespace n \
             WHERE EXISTS (SELECT 1 FROM pg_class c WHERE c.relnamespace = n.oid AND c.relname = '{}') \
             ORDER BY 1",
            crate::storage::METADATA_TABLE
        ))
    }

    fn create_metadata_table(&self, table_ref: &str) -> String {
        format!(
            "CREATE TABLE {} (name text PRIMARY KEY, table_name text NOT NULL UNIQUE)",
            table_ref
        )
    }

    fn create_collection_table(&self, table_ref: &str) -> String {
        format!(
            "CREATE TABLE {} (_seq bigserial PRIMARY KEY, _id text NOT NULL UNIQUE, _doc json NOT NULL)",
            table_ref
        )
    }

    fn doc_param(&self, n: usize) -> String {
        format!("(${}::text)::json", n)
    }

    fn doc_column(&self) -> &'static str {
        "_doc::text"
    }

    fn doc_size(&self) -> &'static str {
        "pg_column_size(_doc)::bigint"
    }

    fn lock_suffix(&self) -> &'static str {
        " FOR UPDATE"
    }

    fn render(&self, predicate: &Predicate, params: &mut Vec<SqlValue>) -> String {
        match predicate {
            Predicate::And(items) if items.is_empty() => "TRUE".to_string(),
            Predicate::Or(items) if items.is_empty() => "FALSE".to_string(),
            Predicate::And(items) => join(items.iter().map(|p| self.render(p, params)), " AND "),
            Predicate::Or(items) => join(items.iter().map(|p| self.render(p, params)), " OR "),
            Predicate::IdEq(key) => {
                params.push(SqlValue::Text(key.clone()));
                format!("_id = {}", self.placeholder(params.len()))
            }
            Predicate::TextEq { path, value } => {
                let expr = self.accessor(path, true, params);
                params.push(SqlValue::Text(value.clone()));
                format!("({}) = {}::text", expr, self.placeholder(params.len()))
            }
            Predicate::BoolEq { path, value } => {
                let expr = self.accessor(path, true, params);
                format!("({}) = '{}'", expr, value)
            }
            Predicate::IsArray { path } => {
                format!("json_typeof({}) = 'array'", self.accessor(path, false, params))
            }
            Predicate::Exists { path } => {
                format!("({}) IS NOT NULL", self.accessor(path, false, params))
            }
            Predicate::ArrayLen { path, len } => {
                let expr = self.accessor(path, false, params);
                params.push(SqlValue::Integer(*len as i64));
                format!(
                    "(CASE WHEN json_typeof({0}) = 'array' THEN json_array_length({0}) END) = {1}",
                    expr,
                    self.placeholder(params.len())
                )
            }
        }
    }

    fn patch_expr(&self, _patch: &PatchOps, _params: &mut Vec<SqlValue>) -> Option<String> {
        None
    }
}

fn join(parts: impl Iterator<Item = String>, sep: &str) -> String {
    let parts: Vec<String> = parts.map(|p| format!("({})", p)).collect();
    parts.join(sep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ref_and_ddl() {
        let d = PostgresDialect;
        assert_eq!(d.table_ref("test", "values"), "\"test\".\"values\"");
        let stmts = d.create_schema("test", "test");
        assert_eq!(stmts[0].sql, "CREATE SCHEMA \"test\"");
        assert!(stmts[1].sql.contains("\"test\".\"_docwire_collections\""));
        assert_eq!(
            d.drop_schema("test", "test", &[])[0].sql,
            "DROP SCHEMA \"test\" CASCADE"
        );
    }

    #[test]
    fn test_render_predicates() {
        let d = PostgresDialect;
        let mut params = Vec::new();
        let pred = Predicate::And(vec![
            Predicate::IdEq("\"abc\"".into()),
            Predicate::TextEq {
                path: vec!["a".into(), "b".into()],
                value: "x".into(),
            },
        ]);
        let sql = d.render(&pred, &mut params);
        assert_eq!(
            sql,
            "(_id = $1) AND ((_doc -> $2::text ->> $3::text) = $4::text)"
        );
        assert_eq!(
            params,
            vec![
                SqlValue::Text("\"abc\"".into()),
                SqlValue::Text("a".into()),
                SqlValue::Text("b".into()),
                SqlValue::Text("x".into()),
            ]
        );
    }

    #[test]
    fn test_render_exists_and_empty() {
        let d = PostgresDialect;
        let mut params = Vec::new();
        let sql = d.render(&Predicate::Exists { path: vec!["a".into()] }, &mut params);
        assert_eq!(sql, "(_doc -> $1::text) IS NOT NULL");
        assert_eq!(d.render(&Predicate::And(vec![]), &mut params), "TRUE");
        assert_eq!(d.render(&Predicate::Or(vec![]), &mut params), "FALSE");
    }

    #[test]
    fn test_capabilities() {
        let d = PostgresDialect;
        assert!(d.capabilities().row_locks);
        assert!(!d.capabilities().atomic_patch);
        assert!(d.supports(PushdownOp::Eq));
        assert!(!d.supports(PushdownOp::Size));
        assert!(d.patch_expr(&PatchOps::default(), &mut Vec::new()).is_none());
    }
}
