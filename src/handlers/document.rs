//! Write commands.
//!
//! Failures confined to one statement are reported in `writeErrors`; with
//! `ordered` (the default) the first one stops the batch.

use super::{bool_arg, document_arg, int_arg, Context, Request, Session, MAX_WRITE_BATCH_SIZE};
use crate::bson::{Bson, Document};
use crate::doc;
use crate::error::{CommandError, CommandResult, ErrorCode};
use crate::query::{Filter, Projection, SortSpec, UpdateSpec};
use crate::storage::{FindAndModifyRequest, StorageError, UpdateRequest};

fn write_error(index: usize, err: &CommandError) -> Bson {
    Bson::Document(doc! {
        "index": index as i32,
        "code": err.code.code(),
        "errmsg": err.message.as_str(),
    })
}

fn check_batch_size(len: usize) -> CommandResult<()> {
    if len > MAX_WRITE_BATCH_SIZE as usize {
        return Err(CommandError::new(
            ErrorCode::InvalidOptions,
            format!(
                "Write batch sizes must be between 1 and {}. Got {} operations.",
                MAX_WRITE_BATCH_SIZE, len
            ),
        ));
    }
    Ok(())
}

/// Splits statement-level failures from failures of the whole command.
fn statement_error(err: StorageError) -> CommandResult<CommandError> {
    if err.is_document_error() {
        Ok(err.into())
    } else {
        Err(err.into())
    }
}

fn finish_write(mut reply: Document, errors: Vec<Bson>) -> Document {
    if !errors.is_empty() {
        reply.insert("writeErrors", errors);
    }
    reply
}

pub async fn insert(_ctx: &Context, session: &mut Session, req: &Request) -> CommandResult<Document> {
    let ns = req.namespace()?;
    let docs = req.documents("documents")?;
    let ordered = bool_arg(&req.body, "ordered", true)?;
    check_batch_size(docs.len())?;
    if docs.is_empty() {
        return Ok(doc! { "n": 0 });
    }

    let outcome = session.storage().insert(&ns, docs, ordered).await?;
    let errors = outcome
        .errors
        .iter()
        .map(|e| write_error(e.index, &CommandError::from(e.error.clone())))
        .collect();
    Ok(finish_write(doc! { "n": outcome.inserted as i32 }, errors))
}

struct UpdateStatement {
    request: UpdateRequest,
}

fn parse_update_statement(spec: &Document) -> CommandResult<UpdateStatement> {
    let filter_doc = document_arg(spec, "q")?
        .cloned()
        .ok_or_else(|| CommandError::new(ErrorCode::FailedToParse, "update statement is missing 'q'"))?;
    let update = match spec.get("u") {
        Some(Bson::Document(u)) => UpdateSpec::parse(u)?,
        Some(Bson::Array(_)) => {
            return Err(CommandError::new(
                ErrorCode::NotImplemented,
                "aggregation pipeline updates are not supported",
            ))
        }
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "'u' must be a document, not {}",
                other.type_name()
            )))
        }
        None => {
            return Err(CommandError::new(
                ErrorCode::FailedToParse,
                "update statement is missing 'u'",
            ))
        }
    };
    let multi = bool_arg(spec, "multi", false)?;
    if multi && update.is_replacement() {
        return Err(CommandError::new(
            ErrorCode::FailedToParse,
            "multi update is not supported for replacement-style update",
        ));
    }
    if spec.get("arrayFilters").is_some() {
        return Err(CommandError::new(
            ErrorCode::NotImplemented,
            "arrayFilters is not supported",
        ));
    }
    Ok(UpdateStatement {
        request: UpdateRequest {
            filter: Filter::parse(&filter_doc)?,
            filter_doc,
            update,
            multi,
            upsert: bool_arg(spec, "upsert", false)?,
        },
    })
}

pub async fn update(_ctx: &Context, session: &mut Session, req: &Request) -> CommandResult<Document> {
    let ns = req.namespace()?;
    let statements = req.documents("updates")?;
    let ordered = bool_arg(&req.body, "ordered", true)?;
    check_batch_size(statements.len())?;

    let storage = session.storage();
    let mut matched = 0i64;
    let mut modified = 0i64;
    let mut upserted = Vec::new();
    let mut errors = Vec::new();

    for (index, spec) in statements.iter().enumerate() {
        let result = match parse_update_statement(spec) {
            Ok(stmt) => match storage.update(&ns, &stmt.request).await {
                Ok(outcome) => Ok(outcome),
                Err(e) => Err(statement_error(e)?),
            },
            Err(e) => Err(e),
        };
        match result {
            Ok(outcome) => {
                matched += outcome.matched as i64;
                modified += outcome.modified as i64;
                if let Some(id) = outcome.upserted_id {
                    matched += 1;
                    upserted.push(Bson::Document(doc! { "index": index as i32, "_id": id }));
                }
            }
            Err(e) => {
                errors.push(write_error(index, &e));
                if ordered {
                    break;
                }
            }
        }
    }

    let mut reply = doc! { "n": matched as i32, "nModified": modified as i32 };
    if !upserted.is_empty() {
        reply.insert("upserted", upserted);
    }
    Ok(finish_write(reply, errors))
}

fn parse_delete_statement(spec: &Document) -> CommandResult<(Filter, bool)> {
    let filter_doc = document_arg(spec, "q")?
        .ok_or_else(|| CommandError::new(ErrorCode::FailedToParse, "delete statement is missing 'q'"))?;
    let just_one = match int_arg(spec, "limit")? {
        Some(0) => false,
        Some(1) => true,
        Some(n) => {
            return Err(CommandError::new(
                ErrorCode::FailedToParse,
                format!("the limit field in delete objects must be 0 or 1. Got {}", n),
            ))
        }
        None => {
            return Err(CommandError::new(
                ErrorCode::FailedToParse,
                "delete statement is missing 'limit'",
            ))
        }
    };
    Ok((Filter::parse(filter_doc)?, just_one))
}

pub async fn delete(_ctx: &Context, session: &mut Session, req: &Request) -> CommandResult<Document> {
    let ns = req.namespace()?;
    let statements = req.documents("deletes")?;
    let ordered = bool_arg(&req.body, "ordered", true)?;
    check_batch_size(statements.len())?;

    let storage = session.storage();
    let mut deleted = 0i64;
    let mut errors = Vec::new();
    for (index, spec) in statements.iter().enumerate() {
        let result = match parse_delete_statement(spec) {
            Ok((filter, just_one)) => match storage.delete(&ns, &filter, just_one).await {
                Ok(n) => Ok(n),
                Err(e) => Err(statement_error(e)?),
            },
            Err(e) => Err(e),
        };
        match result {
            Ok(n) => deleted += n as i64,
            Err(e) => {
                errors.push(write_error(index, &e));
                if ordered {
                    break;
                }
            }
        }
    }
    Ok(finish_write(doc! { "n": deleted as i32 }, errors))
}

pub async fn find_and_modify(
    _ctx: &Context,
    session: &mut Session,
    req: &Request,
) -> CommandResult<Document> {
    let ns = req.namespace()?;
    let body = &req.body;
    let filter_doc = document_arg(body, "query")?.cloned().unwrap_or_default();
    let remove = bool_arg(body, "remove", false)?;
    let update = match body.get("update") {
        None | Some(Bson::Null) => None,
        Some(Bson::Document(u)) => Some(UpdateSpec::parse(u)?),
        Some(Bson::Array(_)) => {
            return Err(CommandError::new(
                ErrorCode::NotImplemented,
                "aggregation pipeline updates are not supported",
            ))
        }
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "'update' must be a document, not {}",
                other.type_name()
            )))
        }
    };
    let upsert = bool_arg(body, "upsert", false)?;
    match (remove, update.is_some()) {
        (true, true) => {
            return Err(CommandError::new(
                ErrorCode::FailedToParse,
                "Cannot specify both an update and remove=true",
            ))
        }
        (false, false) => {
            return Err(CommandError::new(
                ErrorCode::FailedToParse,
                "Either an update or remove=true must be specified",
            ))
        }
        (true, false) if upsert => {
            return Err(CommandError::new(
                ErrorCode::FailedToParse,
                "Cannot specify both upsert=true and remove=true",
            ))
        }
        _ => {}
    }

    let request = FindAndModifyRequest {
        filter: Filter::parse(&filter_doc)?,
        filter_doc,
        sort: document_arg(body, "sort")?.map(SortSpec::parse).transpose()?,
        remove,
        update,
        return_new: bool_arg(body, "new", false)?,
        upsert,
        projection: match document_arg(body, "fields")? {
            Some(spec) => Projection::parse(spec)?,
            None => None,
        },
    };

    let outcome = session.storage().find_and_modify(&ns, &request).await?;
    let mut last_error = doc! { "n": outcome.n as i32 };
    if !remove {
        last_error.insert("updatedExisting", outcome.updated_existing);
    }
    if let Some(id) = outcome.upserted_id {
        last_error.insert("upserted", id);
    }
    Ok(doc! {
        "lastErrorObject": last_error,
        "value": outcome.value.map(Bson::Document).unwrap_or(Bson::Null),
    })
}
