//! Sort specifications.

use std::cmp::Ordering;

use super::{resolve, QueryError, QueryResult};
use crate::bson::compare::compare;
use crate::bson::{Bson, Document};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKey {
    Field { path: String, ascending: bool },
    /// Storage order.
    Natural { ascending: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortSpec {
    keys: Vec<SortKey>,
}

impl SortSpec {
    pub fn parse(spec: &Document) -> QueryResult<Self> {
        let mut keys = Vec::with_capacity(spec.len());
        for (path, value) in spec.iter() {
            let ascending = match value.as_i64() {
                Some(1) => true,
                Some(-1) => false,
                _ => {
                    return Err(QueryError::BadValue(format!(
                        "invalid sort direction for {}: {}",
                        path, value
                    )))
                }
            };
            if path == "$natural" {
                keys.push(SortKey::Natural { ascending });
            } else if path.starts_with('$') || path.is_empty() {
                return Err(QueryError::BadValue(format!("invalid sort key {}", path)));
            } else {
                keys.push(SortKey::Field {
                    path: path.to_string(),
                    ascending,
                });
            }
        }
        Ok(Self { keys })
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    /// True when only `$natural` keys are present.
    pub fn is_natural(&self) -> bool {
        self.keys
            .iter()
            .all(|k| matches!(k, SortKey::Natural { .. }))
    }

    /// Direction of the storage scan implied by a `$natural` key.
    pub fn natural_ascending(&self) -> bool {
        self.keys
            .iter()
            .find_map(|k| match k {
                SortKey::Natural { ascending } => Some(*ascending),
                _ => None,
            })
            .unwrap_or(true)
    }

    /// Compares two documents. `$natural` keys compare equal; callers feed
    /// documents in storage order and rely on a stable sort.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for key in &self.keys {
            if let SortKey::Field { path, ascending } = key {
                let ord = compare(&sort_value(a, path, *ascending), &sort_value(b, path, *ascending));
                let ord = if *ascending { ord } else { ord.reverse() };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
        Ordering::Equal
    }

    pub fn sort(&self, docs: &mut [Document]) {
        docs.sort_by(|a, b| self.compare(a, b));
    }
}

/// Ascending sorts use the smallest array element, descending the largest.
fn sort_value(doc: &Document, path: &str, ascending: bool) -> Bson {
    let mut candidates = Vec::new();
    for value in resolve(doc, path) {
        match value {
            Bson::Array(items) if !items.is_empty() => candidates.extend(items.iter()),
            other => candidates.push(other),
        }
    }
    let best = if ascending {
        candidates.into_iter().min_by(|x, y| compare(x, y))
    } else {
        candidates.into_iter().max_by(|x, y| compare(x, y))
    };
    best.cloned().unwrap_or(Bson::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_sort_ascending_and_descending() {
        let mut docs = vec![
            doc! { "n": 3, "s": "b" },
            doc! { "n": 1, "s": "a" },
            doc! { "n": 2.5, "s": "c" },
            doc! { "s": "z" },
        ];
        SortSpec::parse(&doc! { "n": 1 }).unwrap().sort(&mut docs);
        let order: Vec<_> = docs.iter().map(|d| d.get_str("s").unwrap()).collect();
        assert_eq!(order, vec!["z", "a", "c", "b"]);

        SortSpec::parse(&doc! { "n": -1 }).unwrap().sort(&mut docs);
        let order: Vec<_> = docs.iter().map(|d| d.get_str("s").unwrap()).collect();
        assert_eq!(order, vec!["b", "c", "a", "z"]);
    }

    #[test]
    fn test_arrays_sort_by_extreme_element() {
        let mut docs = vec![
            doc! { "id": 1, "v": vec![Bson::Int32(5), Bson::Int32(1)] },
            doc! { "id": 2, "v": 3 },
        ];
        SortSpec::parse(&doc! { "v": 1 }).unwrap().sort(&mut docs);
        assert_eq!(docs[0].get_i64("id"), Some(1));
        SortSpec::parse(&doc! { "v": -1 }).unwrap().sort(&mut docs);
        assert_eq!(docs[0].get_i64("id"), Some(1));
    }

    #[test]
    fn test_natural_and_errors() {
        let spec = SortSpec::parse(&doc! { "$natural": -1 }).unwrap();
        assert!(spec.is_natural());
        assert!(!spec.natural_ascending());
        assert!(SortSpec::parse(&doc! { "a": 2 }).is_err());
        assert!(SortSpec::parse(&doc! { "a": "up" }).is_err());
    }
}
