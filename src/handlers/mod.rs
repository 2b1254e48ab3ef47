//! Command dispatch.
//!
//! The command name is the first field of the body. Handlers are looked up
//! in a registry built once at startup and shared read-only.

pub mod admin;
pub mod cursors;
pub mod database;
pub mod document;
pub mod query;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::bson::{Bson, Document};
use crate::error::{CommandError, CommandResult, ErrorCode};
use crate::metrics::Metrics;
use crate::storage::namespace::validate_database_name;
use crate::storage::{Namespace, Storage};
use crate::wire::{DocumentSequence, OpMsg};

pub use cursors::CursorRegistry;

/// Maximum document size advertised to clients.
pub const MAX_BSON_OBJECT_SIZE: i32 = 16 * 1024 * 1024;
pub const MAX_WRITE_BATCH_SIZE: i32 = 100_000;

#[derive(Debug, Clone)]
pub struct Settings {
    pub default_batch_size: usize,
    pub cursor_timeout: Duration,
    pub max_message_size: usize,
    /// Process arguments, reported by `getCmdLineOpts`.
    pub argv: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_batch_size: 101,
            cursor_timeout: Duration::from_secs(600),
            max_message_size: crate::wire::frame::DEFAULT_MAX_MESSAGE_SIZE,
            argv: Vec::new(),
        }
    }
}

/// State shared by every connection.
pub struct Context {
    pub storage: Storage,
    pub metrics: Arc<Metrics>,
    pub settings: Settings,
    pub registry: Arc<Registry>,
    pub started: Instant,
    next_session: AtomicU64,
}

impl Context {
    pub fn new(storage: Storage, metrics: Arc<Metrics>, settings: Settings) -> Self {
        Self {
            storage,
            metrics,
            settings,
            registry: Arc::new(Registry::builtin()),
            started: Instant::now(),
            next_session: AtomicU64::new(1),
        }
    }

    /// A session whose backend work is cancelled with `cancel`.
    pub fn open_session(&self, peer: Option<SocketAddr>, cancel: CancellationToken) -> Session {
        Session {
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            peer,
            cursors: CursorRegistry::new(self.settings.cursor_timeout),
            last_command: None,
            storage: self.storage.scoped(cancel),
        }
    }
}

/// Per-connection state.
pub struct Session {
    pub id: u64,
    pub peer: Option<SocketAddr>,
    pub cursors: CursorRegistry,
    pub last_command: Option<String>,
    storage: Storage,
}

impl Session {
    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

/// A command body plus any document sequences sent with it.
#[derive(Debug, Clone)]
pub struct Request {
    pub body: Document,
    pub sequences: Vec<DocumentSequence>,
}

impl Request {
    pub fn new(body: Document) -> Self {
        Self {
            body,
            sequences: Vec::new(),
        }
    }

    pub fn command_name(&self) -> Option<&str> {
        self.body.first().map(|(k, _)| k)
    }

    pub fn db(&self) -> CommandResult<&str> {
        match self.body.get("$db") {
            Some(Bson::String(db)) => Ok(db),
            Some(other) => Err(CommandError::type_mismatch(format!(
                "$db must be a string, not {}",
                other.type_name()
            ))),
            None => Err(CommandError::new(
                ErrorCode::InvalidNamespace,
                "missing $db field",
            )),
        }
    }

    /// Namespace named by the command field's string value.
    pub fn namespace(&self) -> CommandResult<Namespace> {
        let db = self.db()?;
        match self.body.first() {
            Some((_, Bson::String(coll))) if !coll.is_empty() => {
                let ns = Namespace::new(db, coll.as_str());
                crate::storage::namespace::validate_collection_name(&ns.coll)?;
                Ok(ns)
            }
            Some((name, value)) => Err(CommandError::new(
                ErrorCode::InvalidNamespace,
                format!(
                    "collection name has invalid type {} for {}",
                    value.type_name(),
                    name
                ),
            )),
            None => Err(CommandError::new(ErrorCode::InvalidNamespace, "empty command")),
        }
    }

    /// Documents of a bulk write, from either the body or a sequence.
    pub fn documents(&self, key: &str) -> CommandResult<Vec<Document>> {
        let sequence = self.sequences.iter().find(|s| s.identifier == key);
        match (self.body.get(key), sequence) {
            (Some(_), Some(_)) => Err(CommandError::bad_value(format!(
                "'{}' given both in the command body and as a document sequence",
                key
            ))),
            (Some(Bson::Array(items)), None) => items
                .iter()
                .map(|item| match item {
                    Bson::Document(doc) => Ok(doc.clone()),
                    other => Err(CommandError::type_mismatch(format!(
                        "'{}' elements must be documents, not {}",
                        key,
                        other.type_name()
                    ))),
                })
                .collect(),
            (Some(other), None) => Err(CommandError::type_mismatch(format!(
                "'{}' must be an array, not {}",
                key,
                other.type_name()
            ))),
            (None, Some(seq)) => Ok(seq.documents.clone()),
            (None, None) => Err(CommandError::new(
                ErrorCode::FailedToParse,
                format!("missing '{}' field", key),
            )),
        }
    }
}

impl From<OpMsg> for Request {
    fn from(msg: OpMsg) -> Self {
        Self {
            body: msg.body,
            sequences: msg.sequences,
        }
    }
}

/// Optional sub-document argument.
pub fn document_arg<'a>(body: &'a Document, key: &str) -> CommandResult<Option<&'a Document>> {
    match body.get(key) {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::Document(doc)) => Ok(Some(doc)),
        Some(other) => Err(CommandError::type_mismatch(format!(
            "'{}' must be a document, not {}",
            key,
            other.type_name()
        ))),
    }
}

/// Optional boolean argument; numbers are accepted as truthiness.
pub fn bool_arg(body: &Document, key: &str, default: bool) -> CommandResult<bool> {
    match body.get(key) {
        None | Some(Bson::Null) => Ok(default),
        Some(Bson::Boolean(b)) => Ok(*b),
        Some(v) if v.is_number() => Ok(v.is_truthy()),
        Some(other) => Err(CommandError::type_mismatch(format!(
            "'{}' must be a boolean, not {}",
            key,
            other.type_name()
        ))),
    }
}

/// Optional integral argument.
pub fn int_arg(body: &Document, key: &str) -> CommandResult<Option<i64>> {
    match body.get(key) {
        None | Some(Bson::Null) => Ok(None),
        Some(v) if v.is_number() => match v.as_i64() {
            Some(n) => Ok(Some(n)),
            None => Err(CommandError::bad_value(format!(
                "'{}' must be an integer, got {}",
                key, v
            ))),
        },
        Some(other) => Err(CommandError::type_mismatch(format!(
            "'{}' must be a number, not {}",
            key,
            other.type_name()
        ))),
    }
}

/// Optional non-negative count argument.
pub fn count_arg(body: &Document, key: &str) -> CommandResult<Option<usize>> {
    match int_arg(body, key)? {
        Some(n) if n < 0 => Err(CommandError::bad_value(format!(
            "'{}' must be non-negative, got {}",
            key, n
        ))),
        Some(n) => Ok(Some(n as usize)),
        None => Ok(None),
    }
}

pub type HandlerFuture<'a> = BoxFuture<'a, CommandResult<Document>>;
pub type HandlerFn = for<'a> fn(&'a Context, &'a mut Session, &'a Request) -> HandlerFuture<'a>;

pub struct CommandSpec {
    pub handler: HandlerFn,
    pub help: &'static str,
}

/// Wraps an `async fn(&Context, &mut Session, &Request)` into a [`CommandSpec`].
macro_rules! command {
    ($handler:path, $help:expr) => {{
        fn call<'a>(
            ctx: &'a Context,
            session: &'a mut Session,
            req: &'a Request,
        ) -> HandlerFuture<'a> {
            Box::pin($handler(ctx, session, req))
        }
        CommandSpec {
            handler: call,
            help: $help,
        }
    }};
}

/// Immutable command name to handler table.
pub struct Registry {
    commands: HashMap<&'static str, CommandSpec>,
}

impl Registry {
    pub fn builtin() -> Self {
        let mut commands = HashMap::new();
        let mut add = |name: &'static str, spec: CommandSpec| {
            commands.insert(name, spec);
        };

        add("hello", command!(admin::hello, "describes this server's role"));
        add("isMaster", command!(admin::hello, "legacy form of hello"));
        add("ismaster", command!(admin::hello, "legacy form of hello"));
        add("ping", command!(admin::ping, "checks that the server is responding"));
        add("buildInfo", command!(admin::build_info, "reports the server build"));
        add("buildinfo", command!(admin::build_info, "reports the server build"));
        add("whatsmyuri", command!(admin::whats_my_uri, "reports the client address"));
        add(
            "connectionStatus",
            command!(admin::connection_status, "reports authentication state"),
        );
        add(
            "getCmdLineOpts",
            command!(admin::get_cmd_line_opts, "reports the server's arguments"),
        );
        add("endSessions", command!(admin::end_sessions, "ends logical sessions"));
        add("serverStatus", command!(admin::server_status, "reports server counters"));
        add("listCommands", command!(admin::list_commands, "lists supported commands"));

        add(
            "listDatabases",
            command!(database::list_databases, "lists databases"),
        );
        add(
            "listCollections",
            command!(database::list_collections, "lists collections of a database"),
        );
        add("create", command!(database::create, "creates a collection"));
        add("drop", command!(database::drop, "drops a collection"));
        add(
            "dropDatabase",
            command!(database::drop_database, "drops the current database"),
        );
        add("collStats", command!(database::coll_stats, "reports collection statistics"));
        add("dbStats", command!(database::db_stats, "reports database statistics"));

        add("insert", command!(document::insert, "inserts documents"));
        add("update", command!(document::update, "updates documents"));
        add("delete", command!(document::delete, "deletes documents"));
        add(
            "findAndModify",
            command!(document::find_and_modify, "atomically modifies one document"),
        );
        add(
            "findandmodify",
            command!(document::find_and_modify, "atomically modifies one document"),
        );

        add("find", command!(query::find, "queries a collection"));
        add("getMore", command!(query::get_more, "continues a cursor"));
        add("killCursors", command!(query::kill_cursors, "closes cursors"));
        add("count", command!(query::count, "counts matching documents"));
        add("distinct", command!(query::distinct, "lists distinct values of a field"));

        Self { commands }
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Command names in sorted order.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.commands.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Routes requests to handlers and shapes every outcome into a reply.
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Runs one command. Always returns a reply document carrying `ok`.
    pub async fn handle(&self, ctx: &Context, session: &mut Session, req: &Request) -> Document {
        let started = Instant::now();
        let name = req.command_name().unwrap_or_default().to_string();
        let result = self.dispatch(ctx, session, req, &name).await;

        let label = if self.registry.get(&name).is_some() {
            name.as_str()
        } else {
            "unknown"
        };
        ctx.metrics
            .record_command(label, result.is_ok(), started.elapsed());
        session.last_command = Some(name.clone());

        match result {
            Ok(mut reply) => {
                if !reply.contains_key("ok") {
                    reply.push("ok", 1.0);
                }
                tracing::debug!(
                    session = session.id,
                    command = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Command succeeded"
                );
                reply
            }
            Err(e) => {
                tracing::debug!(
                    session = session.id,
                    command = %name,
                    code = e.code.code(),
                    "Command failed: {}",
                    e
                );
                e.to_document()
            }
        }
    }

    async fn dispatch(
        &self,
        ctx: &Context,
        session: &mut Session,
        req: &Request,
        name: &str,
    ) -> CommandResult<Document> {
        if name.is_empty() {
            return Err(CommandError::new(
                ErrorCode::FailedToParse,
                "no command specified",
            ));
        }
        let spec = self.registry.get(name).ok_or_else(|| {
            CommandError::new(
                ErrorCode::CommandNotFound,
                format!("no such command: '{}'", name),
            )
        })?;
        validate_common(req)?;
        (spec.handler)(ctx, session, req).await
    }
}

/// Checks shared by every command.
fn validate_common(req: &Request) -> CommandResult<()> {
    let db = req.db()?;
    validate_database_name(db)?;

    if let Some(wc) = req.body.get("writeConcern") {
        let wc = match wc {
            Bson::Document(doc) => doc,
            other => {
                return Err(CommandError::new(
                    ErrorCode::FailedToParse,
                    format!("writeConcern must be a document, not {}", other.type_name()),
                ))
            }
        };
        for (key, value) in wc.iter() {
            let ok = match key {
                "w" => value.is_number() || matches!(value, Bson::String(_)),
                "j" | "fsync" => matches!(value, Bson::Boolean(_)) || value.is_number(),
                "wtimeout" | "wtimeoutMS" => value.is_number(),
                "provenance" => matches!(value, Bson::String(_)),
                _ => {
                    return Err(CommandError::new(
                        ErrorCode::FailedToParse,
                        format!("unrecognized write concern field: {}", key),
                    ))
                }
            };
            if !ok {
                return Err(CommandError::new(
                    ErrorCode::FailedToParse,
                    format!(
                        "writeConcern.{} has invalid type {}",
                        key,
                        value.type_name()
                    ),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pool::tests::MockFactory;
    use crate::backend::sqlite::SqliteDialect;
    use crate::backend::{Backend, PoolConfig};
    use crate::doc;
    use crate::storage::StorageConfig;

    #[tokio::test]
    async fn test_unreachable_backend_retries_then_replies_host_unreachable() {
        let factory = Arc::new(MockFactory::default());
        factory.fail.store(true, Ordering::SeqCst);
        let backend = Backend {
            factory: factory.clone(),
            dialect: Arc::new(SqliteDialect),
        };
        let config = StorageConfig {
            pool: PoolConfig::default().with_acquire_timeout(Duration::from_millis(100)),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            ..StorageConfig::default()
        };
        let storage = Storage::open(backend, config).await;
        let before = factory.attempts.load(Ordering::SeqCst);

        let err = storage.list_databases().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BackendUnavailable);
        assert_eq!(factory.attempts.load(Ordering::SeqCst) - before, 4);

        let metrics = Arc::new(Metrics::new().unwrap());
        let ctx = Context::new(storage, metrics, Settings::default());
        let dispatcher = Dispatcher::new(ctx.registry.clone());
        let mut session = ctx.open_session(None, CancellationToken::new());
        let before = factory.attempts.load(Ordering::SeqCst);
        let reply = dispatcher
            .handle(
                &ctx,
                &mut session,
                &Request::new(doc! { "listDatabases": 1, "$db": "admin" }),
            )
            .await;
        assert_eq!(reply.get("ok").and_then(|v| v.as_f64()), Some(0.0));
        assert_eq!(reply.get("code"), Some(&Bson::Int32(6)));
        assert_eq!(reply.get_str("codeName"), Some("HostUnreachable"));
        assert_eq!(factory.attempts.load(Ordering::SeqCst) - before, 4);
    }

    #[test]
    fn test_registry_is_complete() {
        let registry = Registry::builtin();
        for name in [
            "hello",
            "isMaster",
            "ping",
            "buildInfo",
            "listDatabases",
            "create",
            "drop",
            "dropDatabase",
            "insert",
            "update",
            "delete",
            "findAndModify",
            "find",
            "getMore",
            "killCursors",
            "count",
            "distinct",
        ] {
            assert!(registry.get(name).is_some(), "missing {}", name);
        }
        assert!(registry.get("nope").is_none());
        let names = registry.names();
        assert!(names.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_request_helpers() {
        let req = Request::new(doc! { "find": "values", "filter": doc! {}, "$db": "test" });
        assert_eq!(req.command_name(), Some("find"));
        assert_eq!(req.db().unwrap(), "test");
        assert_eq!(req.namespace().unwrap(), Namespace::new("test", "values"));

        let req = Request::new(doc! { "find": 1, "$db": "test" });
        assert_eq!(req.namespace().unwrap_err().code, ErrorCode::InvalidNamespace);
    }

    #[test]
    fn test_bulk_documents_from_body_or_sequence() {
        let docs = vec![Bson::Document(doc! { "a": 1 })];
        let req = Request::new(doc! { "insert": "v", "documents": docs.clone(), "$db": "t" });
        assert_eq!(req.documents("documents").unwrap().len(), 1);

        let mut req = Request::new(doc! { "insert": "v", "$db": "t" });
        req.sequences.push(DocumentSequence {
            identifier: "documents".into(),
            documents: vec![doc! { "a": 1 }, doc! { "a": 2 }],
        });
        assert_eq!(req.documents("documents").unwrap().len(), 2);

        req.body.insert("documents", docs);
        assert_eq!(
            req.documents("documents").unwrap_err().code,
            ErrorCode::BadValue
        );
    }

    #[test]
    fn test_write_concern_validation() {
        let ok = Request::new(doc! { "insert": "v", "$db": "t", "writeConcern": doc! { "w": "majority", "j": true } });
        assert!(validate_common(&ok).is_ok());

        let bad = Request::new(doc! { "insert": "v", "$db": "t", "writeConcern": doc! { "w": true } });
        assert_eq!(validate_common(&bad).unwrap_err().code, ErrorCode::FailedToParse);

        let missing_db = Request::new(doc! { "ping": 1 });
        assert_eq!(
            validate_common(&missing_db).unwrap_err().code,
            ErrorCode::InvalidNamespace
        );
    }

    #[test]
    fn test_argument_helpers() {
        let body = doc! { "a": true, "b": 0, "c": "x", "n": 5, "neg": -1 };
        assert!(bool_arg(&body, "a", false).unwrap());
        assert!(!bool_arg(&body, "b", true).unwrap());
        assert!(bool_arg(&body, "missing", true).unwrap());
        assert!(bool_arg(&body, "c", false).is_err());
        assert_eq!(int_arg(&body, "n").unwrap(), Some(5));
        assert!(count_arg(&body, "neg").is_err());
        assert!(document_arg(&body, "c").is_err());
    }
}
