//! End-to-end tests over TCP.

mod common;

use std::time::Duration;

use common::{first_batch, is_ok, roundtrip, spawn_server};
use docwire::bson::Bson;
use docwire::doc;
use docwire::wire::frame::{encode_frame, read_frame, FrameLimits, OpCode};
use docwire::wire::message::flags;
use docwire::wire::{OpMsg, OpQuery, OpReply};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn connect(addr: std::net::SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("connect")
}

/// True once the server has closed its side of `stream`.
async fn is_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1];
    matches!(
        tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}

#[tokio::test]
async fn test_op_msg_ping() {
    let server = spawn_server(FrameLimits::default()).await;
    let mut stream = connect(server.addr).await;
    let reply = roundtrip(&mut stream, 7, doc! { "ping": 1, "$db": "admin" }).await;
    assert!(is_ok(&reply));
}

#[tokio::test]
async fn test_legacy_is_master() {
    let server = spawn_server(FrameLimits::default()).await;
    let mut stream = connect(server.addr).await;
    let query = OpQuery {
        flags: 0,
        full_collection_name: "admin.$cmd".into(),
        number_to_skip: 0,
        number_to_return: -1,
        query: doc! { "isMaster": 1 },
        return_fields: None,
    };
    stream.write_all(&query.encode(41)).await.unwrap();

    let frame = read_frame(&mut stream, FrameLimits::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.header.op_code, OpCode::Reply);
    assert_eq!(frame.header.response_to, 41);
    let reply = OpReply::parse(&frame.payload).unwrap();
    assert_eq!(reply.documents.len(), 1);
    let body = &reply.documents[0];
    assert!(is_ok(body));
    assert_eq!(body.get_bool("ismaster"), Some(true));
}

#[tokio::test]
async fn test_legacy_query_on_collection_fails() {
    let server = spawn_server(FrameLimits::default()).await;
    let mut stream = connect(server.addr).await;
    let query = OpQuery {
        flags: 0,
        full_collection_name: "test.values".into(),
        number_to_skip: 0,
        number_to_return: 0,
        query: doc! {},
        return_fields: None,
    };
    stream.write_all(&query.encode(3)).await.unwrap();
    let frame = read_frame(&mut stream, FrameLimits::default())
        .await
        .unwrap()
        .unwrap();
    let reply = OpReply::parse(&frame.payload).unwrap();
    assert_ne!(reply.response_flags & flags::QUERY_FAILURE, 0);
    assert!(reply.documents[0].contains_key("$err"));

    // The connection stays usable.
    let reply = roundtrip(&mut stream, 4, doc! { "ping": 1, "$db": "admin" }).await;
    assert!(is_ok(&reply));
}

#[tokio::test]
async fn test_pipelined_requests_answer_in_order() {
    let server = spawn_server(FrameLimits::default()).await;
    let mut stream = connect(server.addr).await;
    let mut bytes = Vec::new();
    bytes.extend(OpMsg::new(doc! { "insert": "values", "documents": vec![Bson::Document(doc! { "_id": 1 })], "$db": "test" }).encode(1, 0));
    bytes.extend(OpMsg::new(doc! { "find": "values", "$db": "test" }).encode(2, 0));
    stream.write_all(&bytes).await.unwrap();

    for expected in [1, 2] {
        let frame = read_frame(&mut stream, FrameLimits::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.header.response_to, expected);
        let body = OpMsg::parse(&frame.payload).unwrap().body;
        assert!(is_ok(&body));
        if expected == 2 {
            assert_eq!(first_batch(&body), vec![doc! { "_id": 1 }]);
        }
    }
}

#[tokio::test]
async fn test_more_to_come_gets_no_reply() {
    let server = spawn_server(FrameLimits::default()).await;
    let mut stream = connect(server.addr).await;
    let mut silent = OpMsg::new(doc! {
        "insert": "values",
        "documents": vec![Bson::Document(doc! { "_id": 1 })],
        "$db": "test",
    });
    silent.flags = flags::MORE_TO_COME;
    stream.write_all(&silent.encode(1, 0)).await.unwrap();

    // The next reply answers request 2, not the unacknowledged write.
    let reply = roundtrip(&mut stream, 2, doc! { "count": "values", "$db": "test" }).await;
    assert_eq!(reply.get_i64("n"), Some(1));
}

#[tokio::test]
async fn test_oversize_message_closes_only_that_connection() {
    let limits = FrameLimits { min: 16, max: 1024 };
    let server = spawn_server(limits).await;
    let mut good = connect(server.addr).await;
    let mut bad = connect(server.addr).await;

    let body = doc! { "ping": 1, "$db": "admin", "pad": "x".repeat(2048) };
    bad.write_all(&OpMsg::new(body).encode(1, 0)).await.unwrap();
    assert!(is_closed(&mut bad).await);

    let reply = roundtrip(&mut good, 9, doc! { "ping": 1, "$db": "admin" }).await;
    assert!(is_ok(&reply));
}

#[tokio::test]
async fn test_undersize_message_closes_connection() {
    let server = spawn_server(FrameLimits::default()).await;
    let mut bad = connect(server.addr).await;
    let mut header = Vec::new();
    header.extend_from_slice(&8i32.to_le_bytes());
    header.extend_from_slice(&[0u8; 12]);
    bad.write_all(&header).await.unwrap();
    assert!(is_closed(&mut bad).await);

    let mut good = connect(server.addr).await;
    let reply = roundtrip(&mut good, 1, doc! { "ping": 1, "$db": "admin" }).await;
    assert!(is_ok(&reply));
}

#[tokio::test]
async fn test_unknown_op_code_closes_connection() {
    let server = spawn_server(FrameLimits::default()).await;
    let mut bad = connect(server.addr).await;
    let mut bytes = encode_frame(1, 0, OpCode::Msg, &[0u8; 8]);
    bytes[12..16].copy_from_slice(&2004i32.wrapping_add(1).to_le_bytes());
    bad.write_all(&bytes).await.unwrap();
    assert!(is_closed(&mut bad).await);
}

#[tokio::test]
async fn test_cursor_survives_across_requests_on_one_connection() {
    let server = spawn_server(FrameLimits::default()).await;
    let mut stream = connect(server.addr).await;
    let docs: Vec<Bson> = (0..5).map(|i| Bson::Document(doc! { "_id": i })).collect();
    roundtrip(&mut stream, 1, doc! { "insert": "values", "documents": docs, "$db": "test" }).await;

    let reply = roundtrip(
        &mut stream,
        2,
        doc! { "find": "values", "batchSize": 2, "$db": "test" },
    )
    .await;
    let id = common::cursor_id(&reply);
    assert_ne!(id, 0);

    let reply = roundtrip(
        &mut stream,
        3,
        doc! { "getMore": id, "collection": "values", "$db": "test" },
    )
    .await;
    assert_eq!(common::batch(&reply, "nextBatch").len(), 3);
    assert_eq!(common::cursor_id(&reply), 0);

    // Cursors belong to their connection.
    let mut other = connect(server.addr).await;
    let reply = roundtrip(
        &mut other,
        1,
        doc! { "getMore": id, "collection": "values", "$db": "test" },
    )
    .await;
    assert_eq!(common::error_code(&reply), Some(43));
}
