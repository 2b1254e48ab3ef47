//! Field projections (`{a: 1, "b.c": 1}` or `{a: 0}`).

use std::collections::BTreeMap;

use super::{QueryError, QueryResult};
use crate::bson::{Bson, Document};

#[derive(Debug, Clone, Default)]
struct Node {
    /// Set when this path itself is named in the projection.
    leaf: bool,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn add(&mut self, parts: &[&str]) -> QueryResult<()> {
        match parts.split_first() {
            None => {
                self.leaf = true;
                Ok(())
            }
            Some((head, rest)) => {
                let child = self.children.entry(head.to_string()).or_default();
                if child.leaf || (rest.is_empty() && !child.children.is_empty()) {
                    return Err(QueryError::BadValue(format!(
                        "path collision at {}",
                        head
                    )));
                }
                child.add(rest)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Projection {
    inclusive: bool,
    include_id: bool,
    root: Node,
}

impl Projection {
    /// Returns `None` for an empty projection.
    pub fn parse(spec: &Document) -> QueryResult<Option<Self>> {
        if spec.is_empty() {
            return Ok(None);
        }
        let mut inclusive: Option<bool> = None;
        let mut include_id = true;
        let mut root = Node::default();

        for (path, value) in spec.iter() {
            let include = match value {
                Bson::Boolean(b) => *b,
                v if v.is_number() => v.as_f64().is_some_and(|f| f != 0.0),
                Bson::Document(_) => {
                    return Err(QueryError::NotImplemented(format!(
                        "projection operator on field {}",
                        path
                    )))
                }
                _ => {
                    return Err(QueryError::BadValue(format!(
                        "unsupported projection value for {}",
                        path
                    )))
                }
            };
            if path.starts_with('$') {
                return Err(QueryError::BadValue(format!(
                    "field path {} must not start with $",
                    path
                )));
            }
            if path == "_id" {
                include_id = include;
                continue;
            }
            match inclusive {
                Some(mode) if mode != include => {
                    return Err(QueryError::BadValue(if include {
                        format!("cannot do inclusion on field {} in exclusion projection", path)
                    } else {
                        format!("cannot do exclusion on field {} in inclusion projection", path)
                    }))
                }
                _ => inclusive = Some(include),
            }
            let parts: Vec<&str> = path.split('.').collect();
            root.add(&parts)?;
        }

        Ok(Some(Self {
            // A projection of only `_id: 0` excludes, `_id: 1` includes.
            inclusive: inclusive.unwrap_or(include_id),
            include_id,
            root,
        }))
    }

    pub fn apply(&self, doc: &Document) -> Document {
        let mut out = if self.inclusive {
            let mut out = Document::new();
            if self.include_id {
                if let Some(id) = doc.get("_id") {
                    out.push("_id", id.clone());
                }
            }
            include_into(&self.root, doc, &mut out);
            out
        } else {
            exclude(&self.root, doc)
        };
        if !self.include_id {
            out.remove("_id");
        }
        out
    }
}

fn include_into(node: &Node, doc: &Document, out: &mut Document) {
    for (key, value) in doc.iter() {
        if key == "_id" {
            continue;
        }
        let Some(child) = node.children.get(key) else {
            continue;
        };
        if child.leaf {
            out.push(key, value.clone());
        } else if let Some(projected) = include_value(child, value) {
            out.push(key, projected);
        }
    }
}

fn include_value(node: &Node, value: &Bson) -> Option<Bson> {
    match value {
        Bson::Document(d) => {
            let mut sub = Document::new();
            include_into(node, d, &mut sub);
            Some(Bson::Document(sub))
        }
        Bson::Array(items) => Some(Bson::Array(
            items
                .iter()
                .filter_map(|item| match item {
                    Bson::Document(_) | Bson::Array(_) => include_value(node, item),
                    _ => None,
                })
                .collect(),
        )),
        _ => None,
    }
}

fn exclude(node: &Node, doc: &Document) -> Document {
    let mut out = Document::with_capacity(doc.len());
    for (key, value) in doc.iter() {
        match node.children.get(key) {
            Some(child) if child.leaf => {}
            Some(child) => out.push(key, exclude_value(child, value)),
            None => out.push(key, value.clone()),
        }
    }
    out
}

fn exclude_value(node: &Node, value: &Bson) -> Bson {
    match value {
        Bson::Document(d) => Bson::Document(exclude(node, d)),
        Bson::Array(items) => Bson::Array(items.iter().map(|i| exclude_value(node, i)).collect()),
        other => other.clone(),
    }
}
