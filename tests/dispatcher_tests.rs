//! Command dispatch tests: commands run through the registry against a
//! SQLite-backed context, without a socket.

mod common;

use common::{batch, cursor_id, error_code, first_batch, is_ok, TestContext};
use docwire::bson::Bson;
use docwire::doc;
use docwire::handlers::Request;
use docwire::wire::DocumentSequence;
use docwire::Document;

fn docs(n: i32) -> Vec<Bson> {
    (0..n).map(|i| Bson::Document(doc! { "_id": i, "v": i })).collect()
}

fn ids(batch: &[Document]) -> Vec<i64> {
    batch.iter().filter_map(|d| d.get_i64("_id")).collect()
}

#[tokio::test]
async fn test_command_name_is_first_field() {
    let mut t = TestContext::new().await;
    let mut body = Document::new();
    body.push("ping", 1);
    body.push("comment", "first");
    assert!(is_ok(&t.run("admin", body).await));

    // `find` later in the document does not make it a find.
    let mut body = Document::new();
    body.push("ping", 1);
    body.push("find", "values");
    let reply = t.run("admin", body).await;
    assert!(is_ok(&reply));
    assert!(reply.get("cursor").is_none());
}

#[tokio::test]
async fn test_unknown_command() {
    let mut t = TestContext::new().await;
    let reply = t.run("admin", doc! { "frobnicate": 1 }).await;
    assert_eq!(reply.get("ok"), Some(&Bson::Double(0.0)));
    assert_eq!(error_code(&reply), Some(59));
    assert_eq!(reply.get_str("codeName"), Some("CommandNotFound"));
    assert!(reply.get_str("errmsg").unwrap().contains("frobnicate"));
}

#[tokio::test]
async fn test_missing_db_is_rejected() {
    let mut t = TestContext::new().await;
    let reply = t.run_request(Request::new(doc! { "ping": 1 })).await;
    assert!(!is_ok(&reply));
}

#[tokio::test]
async fn test_hello_and_legacy_handshake() {
    let mut t = TestContext::new().await;
    let reply = t.run("admin", doc! { "hello": 1 }).await;
    assert!(is_ok(&reply));
    assert_eq!(reply.get_bool("isWritablePrimary"), Some(true));
    assert!(reply.get_i64("maxWireVersion").unwrap() >= 6);

    let reply = t.run("admin", doc! { "isMaster": 1 }).await;
    assert_eq!(reply.get_bool("ismaster"), Some(true));
}

#[tokio::test]
async fn test_insert_then_find_in_batches() {
    let mut t = TestContext::new().await;
    let reply = t
        .run("test", doc! { "insert": "values", "documents": docs(7) })
        .await;
    assert!(is_ok(&reply));
    assert_eq!(reply.get_i64("n"), Some(7));

    let reply = t
        .run("test", doc! { "find": "values", "batchSize": 3 })
        .await;
    assert!(is_ok(&reply));
    assert_eq!(ids(&first_batch(&reply)), vec![0, 1, 2]);
    let id = cursor_id(&reply);
    assert_ne!(id, 0);
    assert_eq!(
        reply.get_document("cursor").and_then(|c| c.get_str("ns")),
        Some("test.values")
    );

    let reply = t
        .run(
            "test",
            doc! { "getMore": id, "collection": "values", "batchSize": 3 },
        )
        .await;
    assert_eq!(ids(&batch(&reply, "nextBatch")), vec![3, 4, 5]);
    assert_eq!(cursor_id(&reply), id);

    let reply = t
        .run("test", doc! { "getMore": id, "collection": "values" })
        .await;
    assert_eq!(ids(&batch(&reply, "nextBatch")), vec![6]);
    assert_eq!(cursor_id(&reply), 0);
    assert!(t.session.cursors.is_empty());
}

#[tokio::test]
async fn test_find_filter_sort_projection_limit() {
    let mut t = TestContext::new().await;
    t.run("test", doc! { "insert": "values", "documents": docs(10) })
        .await;
    let reply = t
        .run(
            "test",
            doc! {
                "find": "values",
                "filter": doc! { "v": doc! { "$gte": 4 } },
                "sort": doc! { "v": -1 },
                "projection": doc! { "_id": 1 },
                "limit": 3,
            },
        )
        .await;
    let found = first_batch(&reply);
    assert_eq!(ids(&found), vec![9, 8, 7]);
    assert!(found.iter().all(|d| d.len() == 1));
    assert_eq!(cursor_id(&reply), 0);
}

#[tokio::test]
async fn test_find_missing_collection_is_empty() {
    let mut t = TestContext::new().await;
    let reply = t.run("test", doc! { "find": "nothing" }).await;
    assert!(is_ok(&reply));
    assert!(first_batch(&reply).is_empty());
    assert_eq!(cursor_id(&reply), 0);
}

#[tokio::test]
async fn test_get_more_unknown_cursor() {
    let mut t = TestContext::new().await;
    let reply = t
        .run("test", doc! { "getMore": 12345i64, "collection": "values" })
        .await;
    assert_eq!(error_code(&reply), Some(43));
}

#[tokio::test]
async fn test_get_more_after_drop() {
    let mut t = TestContext::new().await;
    t.run("test", doc! { "insert": "values", "documents": docs(10) })
        .await;
    let reply = t
        .run("test", doc! { "find": "values", "batchSize": 2 })
        .await;
    let id = cursor_id(&reply);
    assert_ne!(id, 0);

    assert!(is_ok(&t.run("test", doc! { "drop": "values" }).await));
    let reply = t
        .run("test", doc! { "getMore": id, "collection": "values" })
        .await;
    assert_eq!(error_code(&reply), Some(43));
}

#[tokio::test]
async fn test_kill_cursors() {
    let mut t = TestContext::new().await;
    t.run("test", doc! { "insert": "values", "documents": docs(5) })
        .await;
    let reply = t
        .run("test", doc! { "find": "values", "batchSize": 1 })
        .await;
    let id = cursor_id(&reply);

    let reply = t
        .run(
            "test",
            doc! { "killCursors": "values", "cursors": vec![Bson::Int64(id), Bson::Int64(7)] },
        )
        .await;
    assert_eq!(reply.get_array("cursorsKilled"), Some(&vec![Bson::Int64(id)]));
    assert_eq!(reply.get_array("cursorsNotFound"), Some(&vec![Bson::Int64(7)]));
    let reply = t
        .run("test", doc! { "getMore": id, "collection": "values" })
        .await;
    assert_eq!(error_code(&reply), Some(43));
}

#[tokio::test]
async fn test_write_errors_ordered_and_unordered() {
    let mut t = TestContext::new().await;
    let batch_docs = vec![
        Bson::Document(doc! { "_id": 1 }),
        Bson::Document(doc! { "_id": 1 }),
        Bson::Document(doc! { "_id": 2 }),
    ];

    let reply = t
        .run("test", doc! { "insert": "ordered", "documents": batch_docs.clone() })
        .await;
    assert!(is_ok(&reply));
    assert_eq!(reply.get_i64("n"), Some(1));
    let errors = reply.get_array("writeErrors").unwrap();
    assert_eq!(errors.len(), 1);
    let first = errors[0].as_document().unwrap();
    assert_eq!(first.get_i64("index"), Some(1));
    assert_eq!(first.get_i64("code"), Some(11000));

    let reply = t
        .run(
            "test",
            doc! { "insert": "unordered", "documents": batch_docs, "ordered": false },
        )
        .await;
    assert_eq!(reply.get_i64("n"), Some(2));
    assert_eq!(reply.get_array("writeErrors").map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_update_and_delete_commands() {
    let mut t = TestContext::new().await;
    t.run("test", doc! { "insert": "values", "documents": docs(4) })
        .await;

    let reply = t
        .run(
            "test",
            doc! {
                "update": "values",
                "updates": vec![
                    Bson::Document(doc! { "q": doc! { "v": doc! { "$lt": 2 } }, "u": doc! { "$set": doc! { "low": true } }, "multi": true }),
                    Bson::Document(doc! { "q": doc! { "_id": 99 }, "u": doc! { "$set": doc! { "v": 99 } }, "upsert": true }),
                ],
            },
        )
        .await;
    assert!(is_ok(&reply));
    assert_eq!(reply.get_i64("n"), Some(3));
    assert_eq!(reply.get_i64("nModified"), Some(2));
    let upserted = reply.get_array("upserted").unwrap();
    assert_eq!(
        upserted[0].as_document().and_then(|d| d.get_i64("_id")),
        Some(99)
    );

    let reply = t
        .run(
            "test",
            doc! {
                "delete": "values",
                "deletes": vec![Bson::Document(doc! { "q": doc! { "low": true }, "limit": 0 })],
            },
        )
        .await;
    assert_eq!(reply.get_i64("n"), Some(2));

    let reply = t.run("test", doc! { "count": "values" }).await;
    assert_eq!(reply.get_i64("n"), Some(3));
}

#[tokio::test]
async fn test_find_and_modify_command() {
    let mut t = TestContext::new().await;
    t.run("test", doc! { "insert": "values", "documents": docs(3) })
        .await;
    let reply = t
        .run(
            "test",
            doc! {
                "findAndModify": "values",
                "query": doc! { "_id": 1 },
                "update": doc! { "$inc": doc! { "v": 5 } },
                "new": true,
            },
        )
        .await;
    assert!(is_ok(&reply));
    assert_eq!(reply.get_document("value"), Some(&doc! { "_id": 1, "v": 6 }));
    assert_eq!(
        reply
            .get_document("lastErrorObject")
            .and_then(|l| l.get_bool("updatedExisting")),
        Some(true)
    );

    let reply = t
        .run(
            "test",
            doc! { "findAndModify": "values", "query": doc! { "_id": 42 }, "remove": true },
        )
        .await;
    assert!(is_ok(&reply));
    assert_eq!(reply.get("value"), Some(&Bson::Null));
}

#[tokio::test]
async fn test_count_and_distinct_commands() {
    let mut t = TestContext::new().await;
    let items = vec![
        Bson::Document(doc! { "k": "a" }),
        Bson::Document(doc! { "k": "b" }),
        Bson::Document(doc! { "k": "a" }),
    ];
    t.run("test", doc! { "insert": "values", "documents": items })
        .await;
    let reply = t
        .run("test", doc! { "count": "values", "query": doc! { "k": "a" } })
        .await;
    assert_eq!(reply.get_i64("n"), Some(2));

    let reply = t
        .run("test", doc! { "distinct": "values", "key": "k" })
        .await;
    assert_eq!(
        reply.get_array("values"),
        Some(&vec![Bson::from("a"), Bson::from("b")])
    );
}

#[tokio::test]
async fn test_namespace_commands() {
    let mut t = TestContext::new().await;
    assert!(is_ok(&t.run("test", doc! { "create": "values" }).await));
    assert_eq!(
        error_code(&t.run("test", doc! { "create": "values" }).await),
        Some(48)
    );

    let reply = t.run("test", doc! { "listCollections": 1 }).await;
    let names: Vec<_> = first_batch(&reply)
        .iter()
        .filter_map(|c| c.get_str("name").map(str::to_string))
        .collect();
    assert_eq!(names, vec!["values"]);

    let reply = t.run("admin", doc! { "listDatabases": 1 }).await;
    let dbs = reply.get_array("databases").unwrap();
    assert!(dbs
        .iter()
        .any(|d| d.as_document().and_then(|d| d.get_str("name")) == Some("test")));

    assert_eq!(
        error_code(&t.run("test", doc! { "drop": "missing" }).await),
        Some(26)
    );
    assert!(is_ok(&t.run("test", doc! { "drop": "values" }).await));
}

#[tokio::test]
async fn test_drop_database_missing_is_ok() {
    let mut t = TestContext::new().await;
    let reply = t.run("nowhere", doc! { "dropDatabase": 1 }).await;
    assert!(is_ok(&reply));
    assert!(reply.get("dropped").is_none());

    t.run("test", doc! { "insert": "values", "documents": docs(1) })
        .await;
    let reply = t.run("test", doc! { "dropDatabase": 1 }).await;
    assert_eq!(reply.get_str("dropped"), Some("test"));
}

#[tokio::test]
async fn test_coll_stats_missing_collection() {
    let mut t = TestContext::new().await;
    let reply = t.run("test", doc! { "collStats": "missing" }).await;
    assert_eq!(error_code(&reply), Some(26));

    t.run("test", doc! { "insert": "values", "documents": docs(2) })
        .await;
    let reply = t.run("test", doc! { "collStats": "values" }).await;
    assert!(is_ok(&reply));
    assert_eq!(reply.get_i64("count"), Some(2));
}

#[tokio::test]
async fn test_insert_from_document_sequence() {
    let mut t = TestContext::new().await;
    let request = Request {
        body: doc! { "insert": "values", "$db": "test" },
        sequences: vec![DocumentSequence {
            identifier: "documents".into(),
            documents: vec![doc! { "_id": 1 }, doc! { "_id": 2 }],
        }],
    };
    let reply = t.run_request(request).await;
    assert!(is_ok(&reply));
    assert_eq!(reply.get_i64("n"), Some(2));

    // The same key in both places is ambiguous.
    let request = Request {
        body: doc! { "insert": "values", "$db": "test", "documents": docs(1) },
        sequences: vec![DocumentSequence {
            identifier: "documents".into(),
            documents: vec![doc! { "_id": 3 }],
        }],
    };
    let reply = t.run_request(request).await;
    assert_eq!(error_code(&reply), Some(2));
}

#[tokio::test]
async fn test_list_commands_reports_registry() {
    let mut t = TestContext::new().await;
    let reply = t.run("admin", doc! { "listCommands": 1 }).await;
    let commands = reply.get_document("commands").unwrap();
    assert!(commands.contains_key("find"));
    assert!(commands.contains_key("getMore"));
    assert_eq!(commands.len(), t.ctx.registry.len());
}

#[tokio::test]
async fn test_dollar_prefixed_fields_are_write_errors() {
    let mut t = TestContext::new().await;
    let reply = t
        .run(
            "test",
            doc! {
                "insert": "values",
                "documents": vec![
                    Bson::Document(doc! { "_id": 1, "a": 1 }),
                    Bson::Document(doc! { "_id": 2, "a": doc! { "$numberInt": "5" } }),
                ],
                "ordered": false,
            },
        )
        .await;
    assert!(is_ok(&reply));
    assert_eq!(reply.get_i64("n"), Some(1));
    let errors = reply.get_array("writeErrors").unwrap();
    let first = errors[0].as_document().unwrap();
    assert_eq!(first.get_i64("index"), Some(1));
    assert_eq!(first.get_i64("code"), Some(2));
    assert!(first
        .get_str("errmsg")
        .unwrap()
        .starts_with("Document can't have $ prefixed field names"));

    let reply = t
        .run(
            "test",
            doc! {
                "update": "values",
                "updates": vec![
                    Bson::Document(doc! { "q": doc! { "_id": 1 }, "u": doc! { "$set": doc! { "b": doc! { "$oid": "zz" } } } }),
                    Bson::Document(doc! { "q": doc! { "_id": 1 }, "u": doc! { "b": doc! { "$numberInt": "5" } } }),
                ],
                "ordered": false,
            },
        )
        .await;
    assert!(is_ok(&reply));
    assert_eq!(reply.get_i64("nModified"), Some(0));
    let errors = reply.get_array("writeErrors").unwrap();
    assert_eq!(errors.len(), 2);
    for error in errors {
        assert_eq!(error.as_document().unwrap().get_i64("code"), Some(2));
    }

    let reply = t.run("test", doc! { "find": "values" }).await;
    assert_eq!(first_batch(&reply), vec![doc! { "_id": 1, "a": 1 }]);
}
