//! Common test utilities
//!
//! Provides shared helper functions for:
//! - Creating SQLite-backed storage in a temp dir
//! - Building a command context and session
//! - Running a server on an ephemeral port and talking to it

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use docwire::backend;
use docwire::handlers::{Context, Dispatcher, Request, Session, Settings};
use docwire::metrics::Metrics;
use docwire::wire::frame::{read_frame, FrameLimits};
use docwire::wire::{Listener, OpMsg};
use docwire::{Document, Storage, StorageConfig};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

pub fn test_storage_config() -> StorageConfig {
    StorageConfig {
        page_size: 3,
        read_ahead: 4,
        ..StorageConfig::default()
    }
}

pub async fn create_test_storage() -> (Storage, TempDir) {
    let tmp_dir = TempDir::new().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", tmp_dir.path().join("docwire.db").display());
    let backend = backend::open(&url, None).expect("Failed to open backend");
    let storage = Storage::open(backend, test_storage_config()).await;
    (storage, tmp_dir)
}

pub struct TestContext {
    pub ctx: Arc<Context>,
    pub dispatcher: Dispatcher,
    pub session: Session,
    pub _tmp: TempDir,
}

impl TestContext {
    pub async fn new() -> Self {
        let (storage, tmp) = create_test_storage().await;
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let ctx = Arc::new(Context::new(storage, metrics, Settings::default()));
        let dispatcher = Dispatcher::new(ctx.registry.clone());
        let session = ctx.open_session(None, CancellationToken::new());
        Self {
            ctx,
            dispatcher,
            session,
            _tmp: tmp,
        }
    }

    /// Runs `body` against database `db`.
    pub async fn run(&mut self, db: &str, mut body: Document) -> Document {
        body.push("$db", db);
        self.dispatcher
            .handle(&self.ctx, &mut self.session, &Request::new(body))
            .await
    }

    pub async fn run_request(&mut self, request: Request) -> Document {
        self.dispatcher
            .handle(&self.ctx, &mut self.session, &request)
            .await
    }
}

pub fn is_ok(reply: &Document) -> bool {
    reply.get("ok").and_then(|v| v.as_f64()) == Some(1.0)
}

pub fn error_code(reply: &Document) -> Option<i64> {
    reply.get("code").and_then(|v| v.as_i64())
}

pub fn first_batch(reply: &Document) -> Vec<Document> {
    batch(reply, "firstBatch")
}

pub fn batch(reply: &Document, key: &str) -> Vec<Document> {
    reply
        .get_document("cursor")
        .and_then(|c| c.get_array(key))
        .map(|items| {
            items
                .iter()
                .filter_map(|b| b.as_document().cloned())
                .collect()
        })
        .unwrap_or_default()
}

pub fn cursor_id(reply: &Document) -> i64 {
    reply
        .get_document("cursor")
        .and_then(|c| c.get("id"))
        .and_then(|v| v.as_i64())
        .unwrap_or(-1)
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub _tmp: TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn spawn_server(limits: FrameLimits) -> TestServer {
    let (storage, tmp) = create_test_storage().await;
    let metrics = Arc::new(Metrics::new().expect("metrics"));
    let ctx = Arc::new(Context::new(storage, metrics, Settings::default()));
    let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), ctx, limits)
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let shutdown = CancellationToken::new();
    tokio::spawn(listener.run(shutdown.clone()));
    TestServer {
        addr,
        shutdown,
        _tmp: tmp,
    }
}

/// Sends one OP_MSG and waits for its reply.
pub async fn roundtrip(stream: &mut TcpStream, request_id: i32, body: Document) -> Document {
    let bytes = OpMsg::new(body).encode(request_id, 0);
    stream.write_all(&bytes).await.expect("write");
    let frame = read_frame(stream, FrameLimits::default())
        .await
        .expect("read")
        .expect("reply frame");
    assert_eq!(frame.header.response_to, request_id);
    OpMsg::parse(&frame.payload).expect("reply body").body
}
