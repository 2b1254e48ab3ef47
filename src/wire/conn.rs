//! Per-connection request loop.
//!
//! A reader task decodes frames into a bounded channel; the dispatch loop
//! answers them strictly in order. EOF, I/O errors and shutdown cancel the
//! connection token, which aborts in-flight backend statements.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{read_frame, write_frame, Frame, FrameLimits};
use super::message::{OpMsg, OpQuery, OpReply, Request as WireRequest};
use super::WireResult;
use crate::bson::Document;
use crate::doc;
use crate::error::{CommandError, ErrorCode};
use crate::handlers::{Context, Dispatcher, Request, Session};

const PIPELINE_DEPTH: usize = 16;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Serves one client until it disconnects, misbehaves or `shutdown` fires.
pub async fn serve_connection<S>(
    stream: S,
    peer: Option<SocketAddr>,
    ctx: Arc<Context>,
    dispatcher: Arc<Dispatcher>,
    limits: FrameLimits,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let cancel = shutdown.child_token();
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<WireResult<Frame>>(PIPELINE_DEPTH);

    let reader_cancel = cancel.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = reader_cancel.cancelled() => break,
                next = read_frame(&mut reader, limits) => next,
            };
            match next {
                Ok(Some(frame)) => {
                    if tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
        reader_cancel.cancel();
    });

    ctx.metrics.connection_opened();
    let mut session = ctx.open_session(peer, cancel.clone());
    let peer_label = peer.map(|p| p.to_string()).unwrap_or_else(|| "local".into());
    tracing::info!(session = session.id, "Connection from {}", peer_label);

    loop {
        let item = tokio::select! {
            biased;
            item = rx.recv() => item,
            _ = shutdown.cancelled() => break,
        };
        let frame = match item {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::warn!(session = session.id, "Protocol error from {}: {}", peer_label, e);
                break;
            }
            None => break,
        };

        match respond(&ctx, &dispatcher, &mut session, &frame).await {
            Ok(Some(bytes)) => {
                if let Err(e) = write_frame(&mut writer, &bytes).await {
                    tracing::warn!(session = session.id, "Write to {} failed: {}", peer_label, e);
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(session = session.id, "Protocol error from {}: {}", peer_label, e);
                break;
            }
        }
    }

    cancel.cancel();
    let _ = reader_task.await;
    ctx.metrics.connection_closed();
    tracing::info!(session = session.id, "Connection from {} closed", peer_label);
}

/// Answers one frame. `Ok(None)` means no reply is owed.
async fn respond(
    ctx: &Context,
    dispatcher: &Dispatcher,
    session: &mut Session,
    frame: &Frame,
) -> WireResult<Option<Vec<u8>>> {
    ctx.metrics.record_request(frame.header.op_code.name());
    let request_id = frame.header.request_id;
    match WireRequest::decode(frame)? {
        WireRequest::Msg(msg) => {
            let silent = msg.more_to_come();
            let request = Request::from(msg);
            tracing::debug!(
                session = session.id,
                request_id,
                command = request.command_name().unwrap_or_default(),
                "OP_MSG"
            );
            let reply = dispatcher.handle(ctx, session, &request).await;
            if silent {
                return Ok(None);
            }
            Ok(Some(OpMsg::new(reply).encode(next_request_id(), request_id)))
        }
        WireRequest::Query(query) => {
            let reply = legacy_query(ctx, dispatcher, session, &query).await;
            Ok(Some(reply.encode(next_request_id(), request_id)))
        }
    }
}

/// Runs a `<db>.$cmd` query; other legacy queries fail.
async fn legacy_query(
    ctx: &Context,
    dispatcher: &Dispatcher,
    session: &mut Session,
    query: &OpQuery,
) -> OpReply {
    tracing::debug!(session = session.id, ns = %query.full_collection_name, "OP_QUERY");
    let Some(db) = query.command_database() else {
        let err = CommandError::new(
            ErrorCode::NotImplemented,
            format!(
                "OP_QUERY is only supported for commands, not {}",
                query.full_collection_name
            ),
        );
        let mut body = doc! { "$err": err.message.as_str() };
        for (k, v) in err.to_document() {
            body.insert(k, v);
        }
        return OpReply::failure(body);
    };
    let mut body: Document = query.command();
    if !body.contains_key("$db") {
        body.push("$db", db);
    }
    let reply = dispatcher.handle(ctx, session, &Request::new(body)).await;
    OpReply::single(reply)
}
