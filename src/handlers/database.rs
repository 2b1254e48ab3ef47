use super::{bool_arg, document_arg, int_arg, Context, Request, Session};
use crate::bson::{Bson, Document};
use crate::doc;
use crate::error::{CommandError, CommandResult, ErrorCode};
use crate::query::Filter;
use crate::storage::{Namespace, StorageError};

pub async fn list_databases(
    _ctx: &Context,
    session: &mut Session,
    req: &Request,
) -> CommandResult<Document> {
    let storage = session.storage();
    let name_only = bool_arg(&req.body, "nameOnly", false)?;
    let filter = match document_arg(&req.body, "filter")? {
        Some(spec) => Filter::parse(spec)?,
        None => Filter::all(),
    };

    let mut databases = Vec::new();
    let mut total_size = 0i64;
    for name in storage.list_databases().await? {
        let entry = if name_only {
            doc! { "name": name.as_str() }
        } else {
            let mut size = 0i64;
            let collections = storage.list_collections(&name).await?;
            for coll in &collections {
                match storage.collection_stats(&Namespace::new(name.as_str(), coll.as_str())).await {
                    Ok(stats) => size += stats.size as i64,
                    // Dropped concurrently.
                    Err(StorageError::NamespaceNotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            total_size += size;
            doc! {
                "name": name.as_str(),
                "sizeOnDisk": size,
                "empty": collections.is_empty(),
            }
        };
        if filter.matches(&entry) {
            databases.push(Bson::Document(entry));
        }
    }

    let mut reply = doc! { "databases": databases };
    if !name_only {
        reply.insert("totalSize", total_size);
    }
    Ok(reply)
}

pub async fn list_collections(
    _ctx: &Context,
    session: &mut Session,
    req: &Request,
) -> CommandResult<Document> {
    let db = req.db()?;
    let name_only = bool_arg(&req.body, "nameOnly", false)?;
    let filter = match document_arg(&req.body, "filter")? {
        Some(spec) => Filter::parse(spec)?,
        None => Filter::all(),
    };

    let mut batch = Vec::new();
    for name in session.storage().list_collections(db).await? {
        let entry = if name_only {
            doc! { "name": name.as_str(), "type": "collection" }
        } else {
            doc! {
                "name": name.as_str(),
                "type": "collection",
                "options": Document::new(),
                "info": doc! { "readOnly": false },
            }
        };
        if filter.matches(&entry) {
            batch.push(Bson::Document(entry));
        }
    }

    Ok(doc! {
        "cursor": doc! {
            "id": 0i64,
            "ns": format!("{}.$cmd.listCollections", db),
            "firstBatch": batch,
        },
    })
}

pub async fn create(_ctx: &Context, session: &mut Session, req: &Request) -> CommandResult<Document> {
    let ns = req.namespace()?;
    for unsupported in ["capped", "timeseries", "clusteredIndex", "viewOn"] {
        if req.body.get(unsupported).is_some_and(Bson::is_truthy) {
            return Err(CommandError::new(
                ErrorCode::NotImplemented,
                format!("'{}' collections are not supported", unsupported),
            ));
        }
    }
    match session.storage().create_collection(&ns).await {
        Ok(_) => Ok(Document::new()),
        Err(StorageError::NamespaceAlreadyExists(_)) => Err(CommandError::new(
            ErrorCode::NamespaceExists,
            format!("Collection {} already exists.", ns),
        )),
        Err(e) => Err(e.into()),
    }
}

pub async fn drop(_ctx: &Context, session: &mut Session, req: &Request) -> CommandResult<Document> {
    let ns = req.namespace()?;
    session.storage().drop_collection(&ns).await?;
    Ok(doc! { "nIndexesWas": 1, "ns": ns.to_string() })
}

/// Dropping a missing database succeeds.
pub async fn drop_database(
    _ctx: &Context,
    session: &mut Session,
    req: &Request,
) -> CommandResult<Document> {
    let db = req.db()?;
    match session.storage().drop_database(db).await {
        Ok(()) => Ok(doc! { "dropped": db }),
        Err(StorageError::NamespaceNotFound(_)) => Ok(Document::new()),
        Err(e) => Err(e.into()),
    }
}

fn scale_arg(req: &Request) -> CommandResult<i64> {
    match int_arg(&req.body, "scale")? {
        Some(n) if n < 1 => Err(CommandError::bad_value("scale has to be > 0")),
        Some(n) => Ok(n),
        None => Ok(1),
    }
}

pub async fn coll_stats(_ctx: &Context, session: &mut Session, req: &Request) -> CommandResult<Document> {
    let ns = req.namespace()?;
    let scale = scale_arg(req)?;
    let stats = session.storage().collection_stats(&ns).await?;
    let count = stats.count as i64;
    let size = stats.size as i64;
    let avg = if count > 0 { size / count } else { 0 };
    Ok(doc! {
        "ns": ns.to_string(),
        "count": count,
        "size": size / scale,
        "avgObjSize": avg,
        "storageSize": size / scale,
        "nindexes": 1,
        "totalIndexSize": 0i64,
        "totalSize": size / scale,
        "scaleFactor": scale,
    })
}

pub async fn db_stats(_ctx: &Context, session: &mut Session, req: &Request) -> CommandResult<Document> {
    let db = req.db()?;
    let scale = scale_arg(req)?;
    let storage = session.storage();
    let collections = storage.list_collections(db).await?;
    let mut objects = 0i64;
    let mut data_size = 0i64;
    for coll in &collections {
        match storage.collection_stats(&Namespace::new(db, coll.as_str())).await {
            Ok(stats) => {
                objects += stats.count as i64;
                data_size += stats.size as i64;
            }
            Err(StorageError::NamespaceNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    let avg = if objects > 0 { data_size as f64 / objects as f64 } else { 0.0 };
    Ok(doc! {
        "db": db,
        "collections": collections.len() as i64,
        "views": 0,
        "objects": objects,
        "avgObjSize": avg,
        "dataSize": data_size / scale,
        "storageSize": data_size / scale,
        "indexes": collections.len() as i64,
        "indexSize": 0i64,
        "totalSize": data_size / scale,
        "scaleFactor": scale,
    })
}
