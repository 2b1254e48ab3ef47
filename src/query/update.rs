//! Update documents: whole-document replacement or field operators.

use std::cmp::Ordering;

use super::filter::Filter;
use super::{QueryError, QueryResult};
use crate::bson::compare::{compare, values_equal};
use crate::bson::{Bson, Decimal128, Document, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Set,
    Unset,
    Inc,
    Mul,
    Min,
    Max,
    Rename,
    Push,
    AddToSet,
    Pop,
    Pull,
    CurrentDate,
    SetOnInsert,
}

impl OpKind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$set" => OpKind::Set,
            "$unset" => OpKind::Unset,
            "$inc" => OpKind::Inc,
            "$mul" => OpKind::Mul,
            "$min" => OpKind::Min,
            "$max" => OpKind::Max,
            "$rename" => OpKind::Rename,
            "$push" => OpKind::Push,
            "$addToSet" => OpKind::AddToSet,
            "$pop" => OpKind::Pop,
            "$pull" => OpKind::Pull,
            "$currentDate" => OpKind::CurrentDate,
            "$setOnInsert" => OpKind::SetOnInsert,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOp {
    pub kind: OpKind,
    pub path: String,
    pub arg: Bson,
}

#[derive(Debug, Clone)]
pub enum UpdateSpec {
    Replacement(Document),
    Operators(Vec<UpdateOp>),
}

/// Top-level `$set`/`$unset` changes that a backend can apply in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchOps {
    pub set: Vec<(String, Bson)>,
    pub unset: Vec<String>,
}

fn conflicts(a: &str, b: &str) -> bool {
    let prefix = |short: &str, long: &str| {
        long.starts_with(short) && long.as_bytes().get(short.len()) == Some(&b'.')
    };
    a == b || prefix(a, b) || prefix(b, a)
}

fn validate_path(path: &str) -> QueryResult<()> {
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(QueryError::BadValue(format!(
            "an update path '{}' contains an empty field name",
            path
        )));
    }
    if path.split('.').any(|p| p.starts_with('$')) {
        return Err(QueryError::BadValue(format!(
            "the update path '{}' contains a $-prefixed field name",
            path
        )));
    }
    Ok(())
}

impl UpdateSpec {
    pub fn parse(doc: &Document) -> QueryResult<Self> {
        let operator_form = doc.first().is_some_and(|(k, _)| k.starts_with('$'));
        if !operator_form {
            if let Some(key) = doc.keys().find(|k| k.starts_with('$')) {
                return Err(QueryError::BadValue(format!(
                    "the dollar ($) prefixed field '{}' is not allowed in a replacement document",
                    key
                )));
            }
            return Ok(UpdateSpec::Replacement(doc.clone()));
        }

        let mut ops = Vec::new();
        let mut touched: Vec<String> = Vec::new();
        for (name, fields) in doc.iter() {
            let kind = OpKind::from_name(name).ok_or_else(|| {
                QueryError::FailedToParse(format!("unknown modifier: {}", name))
            })?;
            let fields = fields.as_document().ok_or_else(|| {
                QueryError::FailedToParse(format!(
                    "modifiers operate on fields but {} was given a non-document",
                    name
                ))
            })?;
            for (path, arg) in fields.iter() {
                validate_path(path)?;
                let mut paths = vec![path.to_string()];
                if kind == OpKind::Rename {
                    let target = arg.as_str().ok_or_else(|| {
                        QueryError::BadValue(format!(
                            "the 'to' field for $rename must be a string: {}",
                            path
                        ))
                    })?;
                    validate_path(target)?;
                    if target == path {
                        return Err(QueryError::BadValue(format!(
                            "the source and target field for $rename must differ: {}",
                            path
                        )));
                    }
                    paths.push(target.to_string());
                }
                for p in paths {
                    if let Some(existing) = touched.iter().find(|t| conflicts(t, &p)) {
                        return Err(QueryError::ConflictingUpdateOperators(format!(
                            "updating the path '{}' would create a conflict at '{}'",
                            p, existing
                        )));
                    }
                    touched.push(p);
                }
                ops.push(UpdateOp {
                    kind,
                    path: path.to_string(),
                    arg: arg.clone(),
                });
            }
        }
        Ok(UpdateSpec::Operators(ops))
    }

    pub fn is_replacement(&self) -> bool {
        matches!(self, UpdateSpec::Replacement(_))
    }

    /// Operators that only `$set`/`$unset` top-level, non-`_id` fields.
    pub fn patch_ops(&self) -> Option<PatchOps> {
        let UpdateSpec::Operators(ops) = self else {
            return None;
        };
        let mut patch = PatchOps::default();
        for op in ops {
            if op.path.contains('.') || op.path == "_id" {
                return None;
            }
            match op.kind {
                OpKind::Set => patch.set.push((op.path.clone(), op.arg.clone())),
                OpKind::Unset => patch.unset.push(op.path.clone()),
                _ => return None,
            }
        }
        Some(patch)
    }

    /// Applies the update in place. `inserting` enables `$setOnInsert`.
    pub fn apply(&self, doc: &mut Document, inserting: bool) -> QueryResult<()> {
        let original_id = doc.get("_id").cloned();
        match self {
            UpdateSpec::Replacement(replacement) => {
                let mut next = replacement.clone();
                if let Some(id) = &original_id {
                    if let Some(new_id) = next.get("_id") {
                        if !values_equal(id, new_id) {
                            return Err(immutable_id());
                        }
                    }
                    next.insert_first("_id", id.clone());
                }
                *doc = next;
            }
            UpdateSpec::Operators(ops) => {
                for op in ops {
                    apply_op(doc, op, inserting)?;
                }
                if let Some(id) = &original_id {
                    match doc.get("_id") {
                        Some(now) if values_equal(id, now) => {}
                        _ => return Err(immutable_id()),
                    }
                }
            }
        }
        Ok(())
    }

    /// Builds the document inserted by an upsert that matched nothing.
    pub fn upsert_document(&self, filter: &Document) -> QueryResult<Document> {
        let seed = seed_from_filter(filter);
        match self {
            UpdateSpec::Replacement(replacement) => {
                let mut doc = replacement.clone();
                if !doc.contains_key("_id") {
                    if let Some(id) = seed.get("_id") {
                        doc.insert_first("_id", id.clone());
                    }
                }
                Ok(doc)
            }
            UpdateSpec::Operators(_) => {
                let mut doc = seed;
                self.apply(&mut doc, true)?;
                Ok(doc)
            }
        }
    }
}

fn immutable_id() -> QueryError {
    QueryError::ImmutableField(
        "performing an update on the path '_id' would modify the immutable field '_id'".into(),
    )
}

/// Equality conditions of a filter, as the base of an upserted document.
pub fn seed_from_filter(filter: &Document) -> Document {
    let mut seed = Document::new();
    collect_equalities(filter, &mut seed);
    seed
}

fn collect_equalities(filter: &Document, seed: &mut Document) {
    for (key, value) in filter.iter() {
        if key == "$and" {
            for item in value.as_array().into_iter().flatten() {
                if let Bson::Document(d) = item {
                    collect_equalities(d, seed);
                }
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        let eq = match value {
            Bson::Document(d) if d.first().is_some_and(|(k, _)| k.starts_with('$')) => {
                match d.get("$eq") {
                    Some(v) => v.clone(),
                    None => continue,
                }
            }
            Bson::RegularExpression(_) => continue,
            other => other.clone(),
        };
        let parts: Vec<&str> = key.split('.').collect();
        // Conflicting equality paths are left to the filter to reject.
        let _ = set_path(seed, &parts, eq);
    }
}

fn get_path<'a>(doc: &'a Document, parts: &[&str]) -> Option<&'a Bson> {
    let (head, rest) = parts.split_first()?;
    let mut current = doc.get(head)?;
    for part in rest {
        current = match current {
            Bson::Document(d) => d.get(part)?,
            Bson::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn path_error(part: &str, container: &Bson) -> QueryError {
    QueryError::BadValue(format!(
        "cannot create field '{}' in element of type {}",
        part,
        container.type_name()
    ))
}

pub(crate) fn set_path(doc: &mut Document, parts: &[&str], value: Bson) -> QueryResult<()> {
    let Some((head, rest)) = parts.split_first() else {
        return Ok(());
    };
    if rest.is_empty() {
        doc.insert(*head, value);
        return Ok(());
    }
    match doc.get_mut(head) {
        Some(child) => set_in_value(child, rest, value),
        None => {
            let mut sub = Document::new();
            set_path(&mut sub, rest, value)?;
            doc.insert(*head, sub);
            Ok(())
        }
    }
}

fn set_in_value(target: &mut Bson, parts: &[&str], value: Bson) -> QueryResult<()> {
    match target {
        Bson::Document(d) => set_path(d, parts, value),
        Bson::Array(items) => {
            let index = parts[0]
                .parse::<usize>()
                .map_err(|_| path_error(parts[0], &Bson::Array(Vec::new())))?;
            if items.len() <= index {
                items.resize(index + 1, Bson::Null);
            }
            if parts.len() == 1 {
                items[index] = value;
                Ok(())
            } else {
                if matches!(items[index], Bson::Null) {
                    items[index] = Bson::Document(Document::new());
                }
                set_in_value(&mut items[index], &parts[1..], value)
            }
        }
        other => Err(path_error(parts[0], other)),
    }
}

fn remove_path(doc: &mut Document, parts: &[&str]) -> Option<Bson> {
    let (head, rest) = parts.split_first()?;
    if rest.is_empty() {
        return doc.remove(head);
    }
    remove_in_value(doc.get_mut(head)?, rest)
}

fn remove_in_value(target: &mut Bson, parts: &[&str]) -> Option<Bson> {
    match target {
        Bson::Document(d) => remove_path(d, parts),
        Bson::Array(items) => {
            let index = parts[0].parse::<usize>().ok()?;
            let slot = items.get_mut(index)?;
            if parts.len() == 1 {
                // Unsetting an array element leaves a null in its place.
                Some(std::mem::replace(slot, Bson::Null))
            } else {
                remove_in_value(slot, &parts[1..])
            }
        }
        _ => None,
    }
}

enum Arith {
    Add,
    Mul,
}

fn arithmetic(current: &Bson, arg: &Bson, op: Arith) -> QueryResult<Bson> {
    let overflow = || QueryError::BadValue("integer overflow in arithmetic update".into());
    match (current, arg) {
        (Bson::Decimal128(_), _) | (_, Bson::Decimal128(_)) => {
            let (a, b) = (current.as_f64().unwrap_or(0.0), arg.as_f64().unwrap_or(0.0));
            let result = match op {
                Arith::Add => a + b,
                Arith::Mul => a * b,
            };
            Ok(format!("{}", result)
                .parse::<Decimal128>()
                .map(Bson::Decimal128)
                .unwrap_or(Bson::Double(result)))
        }
        (Bson::Double(_), _) | (_, Bson::Double(_)) => {
            let (a, b) = (current.as_f64().unwrap_or(0.0), arg.as_f64().unwrap_or(0.0));
            Ok(Bson::Double(match op {
                Arith::Add => a + b,
                Arith::Mul => a * b,
            }))
        }
        _ => {
            let a = current.as_i64().ok_or_else(overflow)?;
            let b = arg.as_i64().ok_or_else(overflow)?;
            let result = match op {
                Arith::Add => a.checked_add(b),
                Arith::Mul => a.checked_mul(b),
            }
            .ok_or_else(overflow)?;
            let both_small = matches!(current, Bson::Int32(_)) && matches!(arg, Bson::Int32(_));
            Ok(match i32::try_from(result) {
                Ok(small) if both_small => Bson::Int32(small),
                _ => Bson::Int64(result),
            })
        }
    }
}

fn zero_like(arg: &Bson) -> Bson {
    match arg {
        Bson::Int32(_) => Bson::Int32(0),
        Bson::Int64(_) => Bson::Int64(0),
        Bson::Decimal128(_) => Bson::Decimal128(Decimal128::from_i64(0)),
        _ => Bson::Double(0.0),
    }
}

fn each_items(op: &str, arg: &Bson) -> QueryResult<Vec<Bson>> {
    if let Bson::Document(d) = arg {
        if d.first().is_some_and(|(k, _)| k.starts_with('$')) {
            for (k, _) in d.iter() {
                if k != "$each" {
                    return Err(QueryError::NotImplemented(format!("{} modifier {}", op, k)));
                }
            }
            return d
                .get_array("$each")
                .cloned()
                .ok_or_else(|| QueryError::BadValue(format!("{} $each requires an array", op)));
        }
    }
    Ok(vec![arg.clone()])
}

fn pull_matcher(arg: &Bson) -> QueryResult<Box<dyn Fn(&Bson) -> bool>> {
    match arg {
        Bson::Document(d) if d.first().is_some_and(|(k, _)| k.starts_with('$')) => {
            let mut wrapper = Document::new();
            wrapper.insert("v", arg.clone());
            let filter = Filter::parse(&wrapper)?;
            Ok(Box::new(move |item: &Bson| {
                let mut probe = Document::new();
                probe.insert("v", item.clone());
                filter.matches(&probe)
            }))
        }
        Bson::Document(d) => {
            let filter = Filter::parse(d)?;
            Ok(Box::new(move |item: &Bson| match item {
                Bson::Document(inner) => filter.matches(inner),
                _ => false,
            }))
        }
        other => {
            let target = other.clone();
            Ok(Box::new(move |item: &Bson| values_equal(item, &target)))
        }
    }
}

fn not_array(path: &str, value: &Bson) -> QueryError {
    QueryError::BadValue(format!(
        "the field '{}' must be an array but is of type {}",
        path,
        value.type_name()
    ))
}

fn apply_op(doc: &mut Document, op: &UpdateOp, inserting: bool) -> QueryResult<()> {
    let parts: Vec<&str> = op.path.split('.').collect();
    let current = get_path(doc, &parts).cloned();

    match op.kind {
        OpKind::Set => set_path(doc, &parts, op.arg.clone()),
        OpKind::SetOnInsert => {
            if inserting {
                set_path(doc, &parts, op.arg.clone())?;
            }
            Ok(())
        }
        OpKind::Unset => {
            remove_path(doc, &parts);
            Ok(())
        }
        OpKind::Inc | OpKind::Mul => {
            let name = if op.kind == OpKind::Inc { "$inc" } else { "$mul" };
            if !op.arg.is_number() {
                return Err(QueryError::TypeMismatch(format!(
                    "cannot {} with non-numeric argument: {}",
                    name, op.arg
                )));
            }
            let next = match &current {
                None if op.kind == OpKind::Inc => op.arg.clone(),
                None => zero_like(&op.arg),
                Some(value) if value.is_number() => arithmetic(
                    value,
                    &op.arg,
                    if op.kind == OpKind::Inc {
                        Arith::Add
                    } else {
                        Arith::Mul
                    },
                )?,
                Some(value) => {
                    return Err(QueryError::TypeMismatch(format!(
                        "cannot apply {} to a value of non-numeric type {}",
                        name,
                        value.type_name()
                    )))
                }
            };
            set_path(doc, &parts, next)
        }
        OpKind::Min | OpKind::Max => {
            let wanted = if op.kind == OpKind::Min {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            match &current {
                Some(value) if compare(&op.arg, value) != wanted => Ok(()),
                _ => set_path(doc, &parts, op.arg.clone()),
            }
        }
        OpKind::Rename => {
            let target: Vec<&str> = op.arg.as_str().unwrap_or_default().split('.').collect();
            if let Some(value) = remove_path(doc, &parts) {
                set_path(doc, &target, value)?;
            }
            Ok(())
        }
        OpKind::Push | OpKind::AddToSet => {
            let name = if op.kind == OpKind::Push { "$push" } else { "$addToSet" };
            let items = each_items(name, &op.arg)?;
            let mut list = match current {
                None => Vec::new(),
                Some(Bson::Array(list)) => list,
                Some(other) => return Err(not_array(&op.path, &other)),
            };
            for item in items {
                if op.kind == OpKind::Push || !list.iter().any(|e| values_equal(e, &item)) {
                    list.push(item);
                }
            }
            set_path(doc, &parts, Bson::Array(list))
        }
        OpKind::Pop => {
            let first = match op.arg.as_i64() {
                Some(-1) => true,
                Some(1) => false,
                _ => {
                    return Err(QueryError::FailedToParse(
                        "$pop expects 1 or -1".into(),
                    ))
                }
            };
            match current {
                None => Ok(()),
                Some(Bson::Array(mut list)) => {
                    if !list.is_empty() {
                        if first {
                            list.remove(0);
                        } else {
                            list.pop();
                        }
                    }
                    set_path(doc, &parts, Bson::Array(list))
                }
                Some(other) => Err(not_array(&op.path, &other)),
            }
        }
        OpKind::Pull => {
            let matcher = pull_matcher(&op.arg)?;
            match current {
                None => Ok(()),
                Some(Bson::Array(list)) => {
                    let kept: Vec<Bson> = list.into_iter().filter(|item| !matcher(item)).collect();
                    set_path(doc, &parts, Bson::Array(kept))
                }
                Some(_) => Err(QueryError::BadValue(
                    "cannot apply $pull to a non-array value".into(),
                )),
            }
        }
        OpKind::CurrentDate => {
            let now = chrono::Utc::now();
            let value = match &op.arg {
                Bson::Boolean(true) => Bson::DateTime(now.timestamp_millis()),
                Bson::Document(d) => match d.get_str("$type") {
                    Some("date") => Bson::DateTime(now.timestamp_millis()),
                    Some("timestamp") => Bson::Timestamp(Timestamp {
                        time: now.timestamp() as u32,
                        increment: 1,
                    }),
                    _ => {
                        return Err(QueryError::BadValue(
                            "the '$type' string field is required to be 'date' or 'timestamp'"
                                .into(),
                        ))
                    }
                },
                _ => {
                    return Err(QueryError::BadValue(
                        "$currentDate expects true or a {$type: ...} document".into(),
                    ))
                }
            };
            set_path(doc, &parts, value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn apply(update: Document, mut doc: Document) -> Document {
        UpdateSpec::parse(&update).unwrap().apply(&mut doc, false).unwrap();
        doc
    }

    #[test]
    fn test_set_and_unset() {
        let out = apply(
            doc! { "$set": doc! { "a": 5, "n.x": "y" }, "$unset": doc! { "b": "" } },
            doc! { "_id": 1, "a": 1, "b": 2 },
        );
        assert_eq!(out, doc! { "_id": 1, "a": 5, "n": doc! { "x": "y" } });
    }

    #[test]
    fn test_inc_and_mul_promote_types() {
        let out = apply(
            doc! { "$inc": doc! { "i": 1, "d": 0.5, "new": Bson::Int64(3) }, "$mul": doc! { "m": 2 } },
            doc! { "_id": 1, "i": i32::MAX, "d": 1, "m": 4 },
        );
        assert_eq!(out.get("i"), Some(&Bson::Int64(i32::MAX as i64 + 1)));
        assert_eq!(out.get("d"), Some(&Bson::Double(1.5)));
        assert_eq!(out.get("new"), Some(&Bson::Int64(3)));
        assert_eq!(out.get("m"), Some(&Bson::Int32(8)));
    }

    #[test]
    fn test_inc_rejects_non_numeric() {
        let spec = UpdateSpec::parse(&doc! { "$inc": doc! { "s": 1 } }).unwrap();
        let mut doc = doc! { "s": "text" };
        assert!(matches!(spec.apply(&mut doc, false), Err(QueryError::TypeMismatch(_))));
    }

    #[test]
    fn test_array_operators() {
        let out = apply(
            doc! {
                "$push": doc! { "a": doc! { "$each": vec![Bson::Int32(3), Bson::Int32(4)] } },
                "$addToSet": doc! { "s": 1 },
                "$pop": doc! { "p": -1 },
                "$pull": doc! { "q": doc! { "$gte": 5 } },
            },
            doc! {
                "_id": 1,
                "a": vec![Bson::Int32(1)],
                "s": vec![Bson::Double(1.0)],
                "p": vec![Bson::Int32(1), Bson::Int32(2)],
                "q": vec![Bson::Int32(1), Bson::Int32(7), Bson::Int32(5)],
            },
        );
        assert_eq!(out.get_array("a").unwrap().len(), 3);
        assert_eq!(out.get_array("s").unwrap().len(), 1);
        assert_eq!(out.get_array("p").unwrap(), &vec![Bson::Int32(2)]);
        assert_eq!(out.get_array("q").unwrap(), &vec![Bson::Int32(1)]);
    }

    #[test]
    fn test_min_max_rename() {
        let out = apply(
            doc! { "$min": doc! { "lo": 1 }, "$max": doc! { "hi": 1 }, "$rename": doc! { "old": "new" } },
            doc! { "_id": 1, "lo": 5, "hi": 5, "old": true },
        );
        assert_eq!(out.get("lo"), Some(&Bson::Int32(1)));
        assert_eq!(out.get("hi"), Some(&Bson::Int32(5)));
        assert_eq!(out.get("new"), Some(&Bson::Boolean(true)));
        assert!(!out.contains_key("old"));
    }

    #[test]
    fn test_id_is_immutable() {
        let spec = UpdateSpec::parse(&doc! { "$set": doc! { "_id": 2 } }).unwrap();
        let mut doc = doc! { "_id": 1 };
        assert!(matches!(spec.apply(&mut doc, false), Err(QueryError::ImmutableField(_))));

        let spec = UpdateSpec::parse(&doc! { "_id": 2, "a": 1 }).unwrap();
        let mut doc = doc! { "_id": 1 };
        assert!(matches!(spec.apply(&mut doc, false), Err(QueryError::ImmutableField(_))));

        let spec = UpdateSpec::parse(&doc! { "a": 1 }).unwrap();
        let mut doc = doc! { "_id": 1, "b": 2 };
        spec.apply(&mut doc, false).unwrap();
        assert_eq!(doc, doc! { "_id": 1, "a": 1 });
    }

    #[test]
    fn test_conflicts_and_parse_errors() {
        assert!(matches!(
            UpdateSpec::parse(&doc! { "$set": doc! { "a": 1 }, "$inc": doc! { "a.b": 1 } }),
            Err(QueryError::ConflictingUpdateOperators(_))
        ));
        assert!(UpdateSpec::parse(&doc! { "$bogus": doc! { "a": 1 } }).is_err());
        assert!(UpdateSpec::parse(&doc! { "a": 1, "$set": doc! { "b": 1 } }).is_err());
        assert!(UpdateSpec::parse(&doc! { "$set": 1 }).is_err());
        assert!(UpdateSpec::parse(&doc! { "$set": doc! { "a..b": 1 } }).is_err());
    }

    #[test]
    fn test_patch_ops() {
        let spec = UpdateSpec::parse(&doc! { "$set": doc! { "a": 1 }, "$unset": doc! { "b": 1 } }).unwrap();
        let patch = spec.patch_ops().unwrap();
        assert_eq!(patch.set, vec![("a".to_string(), Bson::Int32(1))]);
        assert_eq!(patch.unset, vec!["b".to_string()]);

        let nested = UpdateSpec::parse(&doc! { "$set": doc! { "a.b": 1 } }).unwrap();
        assert!(nested.patch_ops().is_none());
        let inc = UpdateSpec::parse(&doc! { "$inc": doc! { "a": 1 } }).unwrap();
        assert!(inc.patch_ops().is_none());
    }

    #[test]
    fn test_upsert_document() {
        let spec = UpdateSpec::parse(&doc! { "$set": doc! { "b": 2 }, "$setOnInsert": doc! { "c": 3 } }).unwrap();
        let doc = spec
            .upsert_document(&doc! { "_id": 7, "a": 1, "n": doc! { "$gt": 1 } })
            .unwrap();
        assert_eq!(doc, doc! { "_id": 7, "a": 1, "b": 2, "c": 3 });

        let replacement = UpdateSpec::parse(&doc! { "x": 1 }).unwrap();
        let doc = replacement.upsert_document(&doc! { "_id": "k" }).unwrap();
        assert_eq!(doc, doc! { "_id": "k", "x": 1 });
    }
}
