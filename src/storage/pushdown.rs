//! Filter to backend predicate translation.
//!
//! The translator only ever widens: every document the full filter would
//! match also satisfies the emitted predicate. Callers re-run the complete
//! filter over the candidates, so a predicate that admits extra rows costs
//! time, never correctness. Anything the dialect cannot evaluate is reported
//! as [`PushdownError::Unsupported`] and dropped from the enclosing `AND`.

use thiserror::Error;

use crate::backend::{is_plain_key, Dialect, Predicate, PushdownOp};
use crate::bson::extjson::{format_double, to_json};
use crate::bson::Bson;
use crate::error::ErrorKind;
use crate::query::filter::{Cond, Expr};
use crate::query::Filter;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushdownError {
    #[error("{0} cannot be evaluated by the backend")]
    Unsupported(&'static str),
}

impl PushdownError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::UnsupportedOperator
    }
}

type PushdownResult<T> = Result<T, PushdownError>;

/// Translates `filter` into the widest-safe predicate for `dialect`.
pub fn translate(filter: &Filter, dialect: &dyn Dialect) -> Predicate {
    match expr(filter.expr(), dialect) {
        Ok(pred) => simplify(pred),
        Err(e) => {
            tracing::debug!("Filter evaluated in process: {}", e);
            Predicate::And(Vec::new())
        }
    }
}

/// Whether the translated predicate narrows anything.
pub fn is_trivial(pred: &Predicate) -> bool {
    matches!(pred, Predicate::And(items) if items.is_empty())
}

fn expr(e: &Expr, d: &dyn Dialect) -> PushdownResult<Predicate> {
    match e {
        Expr::And(children) => {
            let mut kept = Vec::with_capacity(children.len());
            for child in children {
                match expr(child, d) {
                    Ok(p) => kept.push(p),
                    Err(err) => tracing::debug!("Dropped conjunct from pushdown: {}", err),
                }
            }
            Ok(Predicate::And(kept))
        }
        Expr::Or(children) => children
            .iter()
            .map(|c| expr(c, d))
            .collect::<PushdownResult<Vec<_>>>()
            .map(Predicate::Or),
        Expr::Nor(_) => Err(PushdownError::Unsupported("$nor")),
        Expr::Field { path, cond } => field(path, cond, d),
    }
}

fn split_path(path: &str) -> PushdownResult<Vec<String>> {
    let parts: Vec<String> = path.split('.').map(str::to_string).collect();
    if parts.iter().all(|p| is_plain_key(p)) {
        Ok(parts)
    } else {
        Err(PushdownError::Unsupported("field path"))
    }
}

fn require(d: &dyn Dialect, op: PushdownOp) -> PushdownResult<()> {
    if d.supports(op) {
        Ok(())
    } else {
        Err(PushdownError::Unsupported(op.name()))
    }
}

fn field(path: &str, cond: &Cond, d: &dyn Dialect) -> PushdownResult<Predicate> {
    match cond {
        Cond::Eq(value) => {
            require(d, PushdownOp::Eq)?;
            equals(path, value)
        }
        Cond::In(values, patterns) => {
            require(d, PushdownOp::In)?;
            if !patterns.is_empty() {
                return Err(PushdownError::Unsupported("$in with regex"));
            }
            values
                .iter()
                .map(|v| equals(path, v))
                .collect::<PushdownResult<Vec<_>>>()
                .map(Predicate::Or)
        }
        Cond::Exists(true) => {
            require(d, PushdownOp::Exists)?;
            let parts = split_path(path)?;
            let mut alts = vec![Predicate::Exists { path: parts.clone() }];
            alts.extend(array_prefixes(&parts));
            Ok(Predicate::Or(alts))
        }
        Cond::Size(len) => {
            require(d, PushdownOp::Size)?;
            let parts = split_path(path)?;
            let mut alts = vec![Predicate::ArrayLen {
                path: parts.clone(),
                len: *len,
            }];
            alts.extend(array_prefixes(&parts));
            Ok(Predicate::Or(alts))
        }
        Cond::And(conds) => {
            let mut kept = Vec::with_capacity(conds.len());
            for c in conds {
                if let Ok(p) = field(path, c, d) {
                    kept.push(p);
                }
            }
            Ok(Predicate::And(kept))
        }
        Cond::Exists(false) => Err(PushdownError::Unsupported("$exists: false")),
        Cond::Ne(_) => Err(PushdownError::Unsupported("$ne")),
        Cond::Cmp(..) => Err(PushdownError::Unsupported("comparison")),
        Cond::Nin(..) => Err(PushdownError::Unsupported("$nin")),
        Cond::Type(_) => Err(PushdownError::Unsupported("$type")),
        Cond::All(_) => Err(PushdownError::Unsupported("$all")),
        Cond::ElemMatch(_) => Err(PushdownError::Unsupported("$elemMatch")),
        Cond::Regex(_) => Err(PushdownError::Unsupported("$regex")),
        Cond::Not(_) => Err(PushdownError::Unsupported("$not")),
        Cond::Mod(..) => Err(PushdownError::Unsupported("$mod")),
    }
}

/// `IsArray` for every proper prefix: a path crossing an array is not
/// addressable as a plain JSON path, so such rows must stay candidates.
fn array_prefixes(parts: &[String]) -> Vec<Predicate> {
    (1..parts.len())
        .map(|n| Predicate::IsArray {
            path: parts[..n].to_vec(),
        })
        .collect()
}

fn equals(path: &str, value: &Bson) -> PushdownResult<Predicate> {
    if path == "_id" {
        if let Some(key) = exact_id_key(value) {
            return Ok(Predicate::IdEq(key));
        }
    }
    let parts = split_path(path)?;
    let mut alts = scalar_encodings(&parts, value)?;
    alts.push(Predicate::IsArray {
        path: parts.clone(),
    });
    alts.extend(array_prefixes(&parts));
    Ok(Predicate::Or(alts))
}

fn at(parts: &[String], extra: &[&str]) -> Vec<String> {
    let mut path = parts.to_vec();
    path.extend(extra.iter().map(|s| s.to_string()));
    path
}

/// Every canonical text form a value equal to `value` may be stored as.
fn scalar_encodings(parts: &[String], value: &Bson) -> PushdownResult<Vec<Predicate>> {
    let text = |extra: &[&str], v: String| Predicate::TextEq {
        path: at(parts, extra),
        value: v,
    };
    Ok(match value {
        Bson::String(s) => vec![text(&[], s.clone())],
        Bson::Boolean(b) => vec![Predicate::BoolEq {
            path: parts.to_vec(),
            value: *b,
        }],
        Bson::ObjectId(oid) => vec![text(&["$oid"], oid.to_hex())],
        Bson::DateTime(ms) => vec![text(&["$date", "$numberLong"], ms.to_string())],
        v if v.is_number() => {
            let mut alts = Vec::new();
            match integral(v) {
                Some(i) => {
                    if i32::try_from(i).is_ok() {
                        alts.push(text(&["$numberInt"], i.to_string()));
                    }
                    alts.push(text(&["$numberLong"], i.to_string()));
                    let f = i as f64;
                    if f as i64 == i {
                        alts.push(text(&["$numberDouble"], format_double(f)));
                        if i == 0 {
                            alts.push(text(&["$numberDouble"], format_double(-0.0)));
                        }
                    }
                }
                None => {
                    let f = v.as_f64().unwrap_or(f64::NAN);
                    if f.is_nan() {
                        return Err(PushdownError::Unsupported("NaN equality"));
                    }
                    alts.push(text(&["$numberDouble"], format_double(f)));
                }
            }
            alts.push(Predicate::Exists {
                path: at(parts, &["$numberDecimal"]),
            });
            alts
        }
        _ => return Err(PushdownError::Unsupported("$eq on this type")),
    })
}

fn integral(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        Bson::Double(f) if f.fract() == 0.0 && f.abs() < 9.2e18 => Some(*f as i64),
        Bson::Decimal128(d) => d.to_i64_exact(),
        _ => None,
    }
}

/// Normalized identifier key stored in the `_id` column: canonical JSON
/// text with integral numbers of any width spelled as `$numberLong`.
pub fn id_key(value: &Bson) -> String {
    match integral(value) {
        Some(i) => to_json(&Bson::Int64(i)).to_string(),
        None => to_json(value).to_string(),
    }
}

/// Key for an `_id` equality whose matches are exactly the rows with that
/// key. Documents and non-integral numbers compare by value, so they go
/// through the document column instead.
fn exact_id_key(value: &Bson) -> Option<String> {
    match value {
        Bson::String(_)
        | Bson::ObjectId(_)
        | Bson::Boolean(_)
        | Bson::DateTime(_)
        | Bson::Int32(_)
        | Bson::Int64(_) => Some(id_key(value)),
        Bson::Double(_) | Bson::Decimal128(_) => integral(value).map(|_| id_key(value)),
        _ => None,
    }
}

/// Flattens nested `AND`s and drops trivially true conjuncts.
fn simplify(pred: Predicate) -> Predicate {
    match pred {
        Predicate::And(items) => {
            let mut out = Vec::new();
            for item in items.into_iter().map(simplify) {
                match item {
                    Predicate::And(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            if out.len() == 1 {
                out.remove(0)
            } else {
                Predicate::And(out)
            }
        }
        Predicate::Or(items) => {
            let items: Vec<_> = items.into_iter().map(simplify).collect();
            if items.iter().any(is_trivial) {
                Predicate::And(Vec::new())
            } else {
                Predicate::Or(items)
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::postgres::PostgresDialect;
    use crate::backend::sqlite::SqliteDialect;
    use crate::bson::{Document, ObjectId};
    use crate::doc;

    fn tr(filter: Document, d: &dyn Dialect) -> Predicate {
        translate(&Filter::parse(&filter).unwrap(), d)
    }

    #[test]
    fn test_id_equality_is_exact() {
        let pred = tr(doc! { "_id": 5 }, &SqliteDialect);
        assert_eq!(pred, Predicate::IdEq("{\"$numberLong\":\"5\"}".into()));

        let pred = tr(doc! { "_id": 5.0 }, &SqliteDialect);
        assert_eq!(pred, Predicate::IdEq("{\"$numberLong\":\"5\"}".into()));

        let pred = tr(doc! { "_id": "abc" }, &SqliteDialect);
        assert_eq!(pred, Predicate::IdEq("\"abc\"".into()));
    }

    #[test]
    fn test_id_key_normalizes_integers() {
        assert_eq!(id_key(&Bson::Int32(7)), id_key(&Bson::Int64(7)));
        assert_eq!(id_key(&Bson::Double(7.0)), id_key(&Bson::Int64(7)));
        assert_ne!(id_key(&Bson::Double(7.5)), id_key(&Bson::Int64(7)));
        let oid = ObjectId::new();
        assert_eq!(id_key(&Bson::ObjectId(oid)), format!("{{\"$oid\":\"{}\"}}", oid.to_hex()));
    }

    #[test]
    fn test_string_equality_includes_array_candidates() {
        let pred = tr(doc! { "a.b": "x" }, &SqliteDialect);
        let path = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            pred,
            Predicate::Or(vec![
                Predicate::TextEq {
                    path: path.clone(),
                    value: "x".into()
                },
                Predicate::IsArray { path },
                Predicate::IsArray {
                    path: vec!["a".into()]
                },
            ])
        );
    }

    #[test]
    fn test_numeric_equality_enumerates_encodings() {
        let Predicate::Or(alts) = tr(doc! { "n": 1 }, &SqliteDialect) else {
            panic!("expected OR");
        };
        let texts: Vec<_> = alts
            .iter()
            .filter_map(|p| match p {
                Predicate::TextEq { path, value } => Some((path[1].clone(), value.clone())),
                _ => None,
            })
            .collect();
        assert!(texts.contains(&("$numberInt".into(), "1".into())));
        assert!(texts.contains(&("$numberLong".into(), "1".into())));
        assert!(texts.contains(&("$numberDouble".into(), "1.0".into())));
        assert!(alts.contains(&Predicate::Exists {
            path: vec!["n".into(), "$numberDecimal".into()]
        }));
    }

    #[test]
    fn test_unsupported_conjunct_is_dropped() {
        let pred = tr(doc! { "a": "x", "b": doc! { "$gt": 3 } }, &SqliteDialect);
        assert!(matches!(pred, Predicate::Or(_)));

        let pred = tr(doc! { "b": doc! { "$gt": 3 } }, &SqliteDialect);
        assert!(is_trivial(&pred));
    }

    #[test]
    fn test_or_with_unsupported_branch_is_dropped() {
        let filter = doc! {
            "$or": vec![
                Bson::Document(doc! { "a": "x" }),
                Bson::Document(doc! { "b": doc! { "$regex": "^y" } }),
            ]
        };
        assert!(is_trivial(&tr(filter, &SqliteDialect)));
    }

    #[test]
    fn test_capabilities_gate_operators() {
        let filter = doc! { "tags": doc! { "$size": 2 } };
        assert!(!is_trivial(&tr(filter.clone(), &SqliteDialect)));
        assert!(is_trivial(&tr(filter, &PostgresDialect)));
    }

    #[test]
    fn test_odd_paths_stay_in_process() {
        assert!(is_trivial(&tr(doc! { "a.0": "x" }, &SqliteDialect)));
        assert!(is_trivial(&tr(doc! { "a b": "x" }, &SqliteDialect)));
        assert!(is_trivial(&tr(doc! { "a": Bson::Null }, &SqliteDialect)));
    }
}
