//! Handshake and administrative commands.

use chrono::Utc;

use super::{Context, Request, Session, MAX_BSON_OBJECT_SIZE, MAX_WRITE_BATCH_SIZE};
use crate::bson::{Bson, Document};
use crate::doc;
use crate::error::CommandResult;

/// Wire versions spoken by this server.
pub const MIN_WIRE_VERSION: i32 = 0;
pub const MAX_WIRE_VERSION: i32 = 17;
pub const SERVER_VERSION: &str = "6.0.0";

pub async fn hello(ctx: &Context, session: &mut Session, req: &Request) -> CommandResult<Document> {
    let mut reply = Document::new();
    match req.command_name() {
        Some("hello") => reply.insert("isWritablePrimary", true),
        _ => reply.insert("ismaster", true),
    };
    reply.insert("maxBsonObjectSize", MAX_BSON_OBJECT_SIZE);
    reply.insert("maxMessageSizeBytes", ctx.settings.max_message_size as i32);
    reply.insert("maxWriteBatchSize", MAX_WRITE_BATCH_SIZE);
    reply.insert("localTime", Bson::DateTime(Utc::now().timestamp_millis()));
    reply.insert("logicalSessionTimeoutMinutes", 30);
    reply.insert("connectionId", session.id as i64);
    reply.insert("minWireVersion", MIN_WIRE_VERSION);
    reply.insert("maxWireVersion", MAX_WIRE_VERSION);
    reply.insert("readOnly", false);
    Ok(reply)
}

pub async fn ping(_ctx: &Context, _session: &mut Session, _req: &Request) -> CommandResult<Document> {
    Ok(Document::new())
}

pub async fn build_info(ctx: &Context, _session: &mut Session, _req: &Request) -> CommandResult<Document> {
    let version_array: Vec<Bson> = SERVER_VERSION
        .split('.')
        .filter_map(|p| p.parse::<i32>().ok())
        .chain(std::iter::once(0))
        .map(Bson::Int32)
        .collect();
    Ok(doc! {
        "version": SERVER_VERSION,
        "gitVersion": env!("CARGO_PKG_VERSION"),
        "versionArray": version_array,
        "bits": 64,
        "debug": cfg!(debug_assertions),
        "maxBsonObjectSize": MAX_BSON_OBJECT_SIZE,
        "storageEngines": vec![Bson::from(ctx.storage.dialect().name())],
        "docwire": doc! { "version": env!("CARGO_PKG_VERSION"), "backend": ctx.storage.dialect().name() },
    })
}

pub async fn whats_my_uri(_ctx: &Context, session: &mut Session, _req: &Request) -> CommandResult<Document> {
    let you = session
        .peer
        .map(|p| p.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    Ok(doc! { "you": you })
}

pub async fn connection_status(
    _ctx: &Context,
    _session: &mut Session,
    _req: &Request,
) -> CommandResult<Document> {
    Ok(doc! {
        "authInfo": doc! {
            "authenticatedUsers": Vec::<Bson>::new(),
            "authenticatedUserRoles": Vec::<Bson>::new(),
        },
    })
}

pub async fn get_cmd_line_opts(
    ctx: &Context,
    _session: &mut Session,
    _req: &Request,
) -> CommandResult<Document> {
    let argv: Vec<Bson> = ctx.settings.argv.iter().map(|a| Bson::from(a.as_str())).collect();
    Ok(doc! { "argv": argv, "parsed": Document::new() })
}

/// Sessions are not tracked; accepted for driver compatibility.
pub async fn end_sessions(_ctx: &Context, _session: &mut Session, _req: &Request) -> CommandResult<Document> {
    Ok(Document::new())
}

pub async fn server_status(ctx: &Context, session: &mut Session, _req: &Request) -> CommandResult<Document> {
    let pool = ctx.storage.pool().stats();
    ctx.metrics.update_pool(&pool);
    Ok(doc! {
        "host": hostname(),
        "version": SERVER_VERSION,
        "process": "docwire",
        "pid": std::process::id() as i64,
        "uptime": ctx.started.elapsed().as_secs_f64().floor(),
        "uptimeMillis": ctx.started.elapsed().as_millis() as i64,
        "localTime": Bson::DateTime(Utc::now().timestamp_millis()),
        "connections": doc! {
            "current": ctx.metrics.open_connections() as i32,
            "totalCreated": ctx.metrics.total_connections() as i64,
        },
        "pool": doc! {
            "idle": pool.idle as i64,
            "inUse": pool.in_use as i64,
            "live": pool.live as i64,
            "created": pool.created as i64,
            "replaced": pool.replaced as i64,
            "timeouts": pool.timeouts as i64,
        },
        "catalog": doc! {
            "cachedDatabases": ctx.storage.catalog().cached_databases() as i64,
        },
        "session": doc! {
            "id": session.id as i64,
            "openCursors": session.cursors.len() as i64,
        },
        "backend": ctx.storage.dialect().name(),
    })
}

pub async fn list_commands(ctx: &Context, _session: &mut Session, _req: &Request) -> CommandResult<Document> {
    let mut commands = Document::new();
    for name in ctx.registry.names() {
        if let Some(spec) = ctx.registry.get(name) {
            commands.insert(name, doc! { "help": spec.help });
        }
    }
    Ok(doc! { "commands": commands })
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
