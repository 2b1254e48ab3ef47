//! PostgreSQL backend tests. Set DOCWIRE_TEST_POSTGRES_URL to run them;
//! they return early otherwise.

use docwire::backend;
use docwire::bson::Bson;
use docwire::doc;
use docwire::query::{Filter, UpdateSpec};
use docwire::storage::{FindOptions, UpdateRequest};
use docwire::{Namespace, Storage, StorageConfig, StorageError};

async fn postgres_storage() -> Option<Storage> {
    let url = std::env::var("DOCWIRE_TEST_POSTGRES_URL").ok()?;
    let backend = backend::open(&url, None).expect("Failed to open backend");
    Some(Storage::open(backend, StorageConfig::default()).await)
}

fn unique_db(prefix: &str) -> String {
    format!("{}_{}", prefix, docwire::ObjectId::new().to_hex())
}

#[tokio::test]
async fn test_postgres_round_trip() {
    let Some(storage) = postgres_storage().await else {
        return;
    };
    let db = unique_db("pg_rt");
    let ns = Namespace::new(db.as_str(), "values");
    let docs: Vec<_> = (0..5).map(|i| doc! { "_id": i, "v": i }).collect();
    let outcome = storage.insert(&ns, docs, true).await.unwrap();
    assert_eq!(outcome.inserted, 5);

    let found = storage
        .fetch(
            &ns,
            FindOptions::with_filter(Filter::parse(&doc! { "v": doc! { "$gte": 3 } }).unwrap()),
        )
        .await
        .unwrap();
    assert_eq!(found, vec![doc! { "_id": 3, "v": 3 }, doc! { "_id": 4, "v": 4 }]);

    let err = storage.insert_one(&ns, doc! { "_id": 1 }).await.unwrap_err();
    assert!(matches!(err, StorageError::DuplicateKey(_)));

    storage.drop_database(&db).await.unwrap();
    assert!(!storage.list_databases().await.unwrap().contains(&db));
}

#[tokio::test]
async fn test_postgres_patch_update() {
    let Some(storage) = postgres_storage().await else {
        return;
    };
    let db = unique_db("pg_patch");
    let ns = Namespace::new(db.as_str(), "values");
    storage
        .insert_one(&ns, doc! { "_id": 1, "a": 1, "b": "drop" })
        .await
        .unwrap();
    let req = UpdateRequest {
        filter: Filter::all(),
        filter_doc: doc! {},
        update: UpdateSpec::parse(&doc! { "$set": doc! { "c": "x" }, "$unset": doc! { "b": 1 } })
            .unwrap(),
        multi: false,
        upsert: false,
    };
    let outcome = storage.update(&ns, &req).await.unwrap();
    assert_eq!(outcome.modified, 1);

    let found = storage.fetch(&ns, FindOptions::default()).await.unwrap();
    assert_eq!(found[0].get("c"), Some(&Bson::from("x")));
    assert!(found[0].get("b").is_none());
    storage.drop_database(&db).await.unwrap();
}
