//! In-process query evaluation: filters, projections, sorts and updates.
//!
//! Everything here works on decoded documents. The storage layer uses these
//! as the authority for matching; backend predicates only narrow candidates.

pub mod filter;
pub mod projection;
pub mod sort;
pub mod update;

use thiserror::Error;

use crate::bson::{Bson, Document};

pub use filter::Filter;
pub use projection::Projection;
pub use sort::SortSpec;
pub use update::UpdateSpec;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("{0}")]
    BadValue(String),

    #[error("{0}")]
    TypeMismatch(String),

    #[error("{0}")]
    FailedToParse(String),

    #[error("{0}")]
    ConflictingUpdateOperators(String),

    #[error("{0}")]
    ImmutableField(String),

    #[error("{0} is not supported")]
    NotImplemented(String),
}

pub type QueryResult<T> = Result<T, QueryError>;

/// Collects every value reachable through a dotted `path`.
///
/// Arrays met on the way are traversed: a numeric component indexes the
/// array, and document elements are searched with the same remaining path.
pub fn resolve<'a>(doc: &'a Document, path: &str) -> Vec<&'a Bson> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    walk_document(doc, &parts, &mut out);
    out
}

fn walk_document<'a>(doc: &'a Document, parts: &[&str], out: &mut Vec<&'a Bson>) {
    if let Some(value) = doc.get(parts[0]) {
        walk(value, &parts[1..], out);
    }
}

fn walk<'a>(value: &'a Bson, parts: &[&str], out: &mut Vec<&'a Bson>) {
    if parts.is_empty() {
        out.push(value);
        return;
    }
    match value {
        Bson::Document(d) => walk_document(d, parts, out),
        Bson::Array(items) => {
            if let Ok(index) = parts[0].parse::<usize>() {
                if let Some(item) = items.get(index) {
                    walk(item, &parts[1..], out);
                }
            }
            for item in items {
                if let Bson::Document(d) = item {
                    walk_document(d, parts, out);
                }
            }
        }
        _ => {}
    }
}

/// Values at `path` plus, for array values, their elements.
pub fn resolve_expanded<'a>(doc: &'a Document, path: &str) -> Vec<&'a Bson> {
    let mut out = Vec::new();
    for value in resolve(doc, path) {
        out.push(value);
        if let Bson::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}
