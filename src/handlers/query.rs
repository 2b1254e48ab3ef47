//! Read commands and cursor management.

use super::cursors::Cursor;
use super::{
    bool_arg, count_arg, document_arg, int_arg, Context, Request, Session, MAX_BSON_OBJECT_SIZE,
};
use crate::bson::{Bson, Document};
use crate::doc;
use crate::error::{CommandError, CommandResult, ErrorCode};
use crate::query::{Filter, Projection, SortSpec};
use crate::storage::{FindOptions, Namespace};

/// Reply bytes reserved for the cursor envelope.
const REPLY_OVERHEAD: usize = 16 * 1024;

fn cursor_reply(id: i64, ns: &Namespace, key: &str, batch: Vec<Document>) -> Document {
    let batch: Vec<Bson> = batch.into_iter().map(Bson::Document).collect();
    let mut cursor = Document::with_capacity(3);
    cursor.insert(key, batch);
    cursor.insert("id", id);
    cursor.insert("ns", ns.to_string());
    doc! { "cursor": cursor }
}

fn cursor_not_found(id: i64) -> CommandError {
    CommandError::new(ErrorCode::CursorNotFound, format!("cursor id {} not found", id))
}

fn filter_arg(body: &Document, key: &str) -> CommandResult<Filter> {
    match document_arg(body, key)? {
        Some(spec) => Ok(Filter::parse(spec)?),
        None => Ok(Filter::all()),
    }
}

/// Splits a signed limit into a document limit and a single-batch flag.
fn limit_arg(body: &Document) -> CommandResult<(Option<usize>, bool)> {
    Ok(match int_arg(body, "limit")? {
        None | Some(0) => (None, false),
        Some(n) if n < 0 => (Some(n.unsigned_abs() as usize), true),
        Some(n) => (Some(n as usize), false),
    })
}

fn max_batch_bytes() -> usize {
    MAX_BSON_OBJECT_SIZE as usize - REPLY_OVERHEAD
}

pub async fn find(ctx: &Context, session: &mut Session, req: &Request) -> CommandResult<Document> {
    let ns = req.namespace()?;
    let body = &req.body;
    let (limit, negative_limit) = limit_arg(body)?;
    let single_batch = bool_arg(body, "singleBatch", false)? || negative_limit;
    let batch_size = count_arg(body, "batchSize")?.unwrap_or(ctx.settings.default_batch_size);
    let opts = FindOptions {
        filter: filter_arg(body, "filter")?,
        sort: document_arg(body, "sort")?.map(SortSpec::parse).transpose()?,
        projection: match document_arg(body, "projection")? {
            Some(spec) => Projection::parse(spec)?,
            None => None,
        },
        skip: count_arg(body, "skip")?.unwrap_or(0),
        limit,
    };

    let storage = session.storage();
    let generation = storage.catalog().generation(&ns);
    let mut stream = storage.find(&ns, opts).await?;
    let first = stream.next_batch(batch_size, max_batch_bytes()).await?;

    let id = if single_batch || stream.is_exhausted().await {
        0
    } else {
        session.cursors.insert(Cursor::new(ns.clone(), stream, generation))
    };
    Ok(cursor_reply(id, &ns, "firstBatch", first))
}

pub async fn get_more(ctx: &Context, session: &mut Session, req: &Request) -> CommandResult<Document> {
    let id = match req.body.first() {
        Some((_, Bson::Int64(id))) => *id,
        Some((_, Bson::Int32(id))) => *id as i64,
        Some((_, other)) => {
            return Err(CommandError::type_mismatch(format!(
                "cursor id must be a long, not {}",
                other.type_name()
            )))
        }
        None => return Err(CommandError::bad_value("missing cursor id")),
    };
    let coll = match req.body.get("collection") {
        Some(Bson::String(c)) => c.as_str(),
        _ => {
            return Err(CommandError::type_mismatch(
                "'collection' must be a string",
            ))
        }
    };
    let ns = Namespace::new(req.db()?, coll);
    let batch_size = count_arg(&req.body, "batchSize")?
        .filter(|n| *n > 0)
        .unwrap_or(usize::MAX);

    let mut cursor = session.cursors.take(id).ok_or_else(|| cursor_not_found(id))?;
    if cursor.ns != ns {
        let owner = cursor.ns.to_string();
        session.cursors.restore(id, cursor);
        return Err(CommandError::bad_value(format!(
            "Requested getMore on namespace '{}', but cursor belongs to a different namespace {}",
            ns, owner
        )));
    }
    if ctx.storage.catalog().generation(&ns) != cursor.generation {
        tracing::debug!(cursor = id, ns = %ns, "Cursor invalidated by drop");
        return Err(cursor_not_found(id));
    }

    let batch = cursor.stream.next_batch(batch_size, max_batch_bytes()).await?;
    let next_id = if cursor.stream.is_exhausted().await {
        0
    } else {
        session.cursors.restore(id, cursor);
        id
    };
    Ok(cursor_reply(next_id, &ns, "nextBatch", batch))
}

pub async fn kill_cursors(_ctx: &Context, session: &mut Session, req: &Request) -> CommandResult<Document> {
    let ids = match req.body.get("cursors") {
        Some(Bson::Array(ids)) => ids,
        _ => return Err(CommandError::type_mismatch("'cursors' must be an array")),
    };
    let mut killed = Vec::new();
    let mut not_found = Vec::new();
    for value in ids {
        let id = value
            .as_i64()
            .ok_or_else(|| CommandError::type_mismatch("cursor ids must be longs"))?;
        if session.cursors.kill(id) {
            killed.push(Bson::Int64(id));
        } else {
            not_found.push(Bson::Int64(id));
        }
    }
    Ok(doc! {
        "cursorsKilled": killed,
        "cursorsNotFound": not_found,
        "cursorsAlive": Vec::<Bson>::new(),
        "cursorsUnknown": Vec::<Bson>::new(),
    })
}

pub async fn count(_ctx: &Context, session: &mut Session, req: &Request) -> CommandResult<Document> {
    let ns = req.namespace()?;
    let filter = filter_arg(&req.body, "query")?;
    let skip = count_arg(&req.body, "skip")?.unwrap_or(0);
    let (limit, _) = limit_arg(&req.body)?;
    let n = session.storage().count(&ns, filter, skip, limit).await?;
    Ok(doc! { "n": n as i64 })
}

pub async fn distinct(_ctx: &Context, session: &mut Session, req: &Request) -> CommandResult<Document> {
    let ns = req.namespace()?;
    let key = match req.body.get("key") {
        Some(Bson::String(key)) if !key.is_empty() => key.as_str(),
        Some(Bson::String(_)) => return Err(CommandError::bad_value("'key' must not be empty")),
        _ => return Err(CommandError::type_mismatch("'key' must be a string")),
    };
    let filter = filter_arg(&req.body, "query")?;
    let values = session.storage().distinct(&ns, key, filter).await?;
    Ok(doc! { "values": values })
}
