//! Query filters
//!
//! A filter document is parsed once into an [`Expr`] tree and then evaluated
//! against candidate documents. Field paths are dotted and traverse arrays.

use std::cmp::Ordering;

use regex::RegexBuilder;

use super::{resolve, QueryError, QueryResult};
use crate::bson::compare::{compare, type_rank, values_equal};
use crate::bson::{tag, Bson, Document, Regex};

/// Parsed filter.
#[derive(Debug, Clone)]
pub struct Filter {
    expr: Expr,
}

#[derive(Debug, Clone)]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Nor(Vec<Expr>),
    Field { path: String, cond: Cond },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone)]
pub enum Cond {
    Eq(Bson),
    Ne(Bson),
    Cmp(CmpOp, Bson),
    In(Vec<Bson>, Vec<Pattern>),
    Nin(Vec<Bson>, Vec<Pattern>),
    Exists(bool),
    Type(Vec<TypeSel>),
    Size(usize),
    All(Vec<Bson>),
    ElemMatch(ElemMatch),
    Regex(Pattern),
    Not(Box<Cond>),
    Mod(i64, i64),
    And(Vec<Cond>),
}

#[derive(Debug, Clone)]
pub enum ElemMatch {
    /// Operators applied to each element directly, e.g. `{$gt: 1, $lt: 5}`.
    Value(Box<Cond>),
    /// A filter applied to document elements.
    Document(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSel {
    Tag(u8),
    Number,
}

/// A compiled regular expression together with its source form.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub source: Regex,
    compiled: regex::Regex,
}

impl Pattern {
    pub fn compile(pattern: &str, options: &str) -> QueryResult<Self> {
        let mut builder = RegexBuilder::new(pattern);
        for flag in options.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                'x' => {
                    builder.ignore_whitespace(true);
                }
                'u' => {}
                other => {
                    return Err(QueryError::BadValue(format!(
                        "invalid flag in regex options: {}",
                        other
                    )))
                }
            }
        }
        let compiled = builder
            .build()
            .map_err(|e| QueryError::BadValue(format!("invalid regular expression: {}", e)))?;
        Ok(Self {
            source: Regex {
                pattern: pattern.to_string(),
                options: options.to_string(),
            },
            compiled,
        })
    }

    pub fn is_match(&self, s: &str) -> bool {
        self.compiled.is_match(s)
    }

    fn matches_value(&self, value: &Bson) -> bool {
        match value {
            Bson::String(s) => self.is_match(s),
            Bson::RegularExpression(re) => *re == self.source,
            _ => false,
        }
    }
}

impl Filter {
    pub fn parse(doc: &Document) -> QueryResult<Self> {
        Ok(Self {
            expr: parse_expr(doc)?,
        })
    }

    /// Filter that matches every document.
    pub fn all() -> Self {
        Self {
            expr: Expr::And(Vec::new()),
        }
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn is_empty(&self) -> bool {
        matches!(&self.expr, Expr::And(clauses) if clauses.is_empty())
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.expr.matches(doc)
    }
}

fn parse_expr(doc: &Document) -> QueryResult<Expr> {
    let mut clauses = Vec::with_capacity(doc.len());
    for (key, value) in doc.iter() {
        match key {
            "$and" | "$or" | "$nor" => {
                let items = value.as_array().ok_or_else(|| {
                    QueryError::BadValue(format!("{} must be an array", key))
                })?;
                if items.is_empty() {
                    return Err(QueryError::BadValue(format!(
                        "{} must be a nonempty array",
                        key
                    )));
                }
                let mut parsed = Vec::with_capacity(items.len());
                for item in items {
                    let sub = item.as_document().ok_or_else(|| {
                        QueryError::BadValue(format!("{} entries must be documents", key))
                    })?;
                    parsed.push(parse_expr(sub)?);
                }
                clauses.push(match key {
                    "$and" => Expr::And(parsed),
                    "$or" => Expr::Or(parsed),
                    _ => Expr::Nor(parsed),
                });
            }
            "$comment" => {}
            k if k.starts_with('$') => {
                return Err(QueryError::BadValue(format!(
                    "unknown top level operator: {}",
                    k
                )))
            }
            path => clauses.push(Expr::Field {
                path: path.to_string(),
                cond: parse_cond(value)?,
            }),
        }
    }
    Ok(Expr::And(clauses))
}

fn is_operator_document(doc: &Document) -> bool {
    doc.first().is_some_and(|(k, _)| k.starts_with('$'))
}

fn parse_cond(value: &Bson) -> QueryResult<Cond> {
    match value {
        Bson::Document(d) if is_operator_document(d) => parse_operators(d),
        Bson::RegularExpression(re) => Ok(Cond::Regex(Pattern::compile(&re.pattern, &re.options)?)),
        other => Ok(Cond::Eq(other.clone())),
    }
}

fn parse_list(op: &str, value: &Bson) -> QueryResult<(Vec<Bson>, Vec<Pattern>)> {
    let items = value
        .as_array()
        .ok_or_else(|| QueryError::BadValue(format!("{} needs an array", op)))?;
    let mut values = Vec::new();
    let mut patterns = Vec::new();
    for item in items {
        match item {
            Bson::RegularExpression(re) => patterns.push(Pattern::compile(&re.pattern, &re.options)?),
            Bson::Document(d) if is_operator_document(d) => {
                return Err(QueryError::BadValue(format!(
                    "cannot nest $ under {}",
                    op
                )))
            }
            other => values.push(other.clone()),
        }
    }
    Ok((values, patterns))
}

fn parse_type_selector(value: &Bson) -> QueryResult<TypeSel> {
    const KNOWN: [u8; 14] = [
        tag::DOUBLE,
        tag::STRING,
        tag::DOCUMENT,
        tag::ARRAY,
        tag::BINARY,
        tag::OBJECT_ID,
        tag::BOOLEAN,
        tag::DATE_TIME,
        tag::NULL,
        tag::REGEX,
        tag::INT32,
        tag::TIMESTAMP,
        tag::INT64,
        tag::DECIMAL128,
    ];
    if let Some(code) = value.as_i64() {
        return u8::try_from(code)
            .ok()
            .filter(|c| KNOWN.contains(c))
            .map(TypeSel::Tag)
            .ok_or_else(|| QueryError::BadValue(format!("invalid numerical type code: {}", code)));
    }
    let alias = value
        .as_str()
        .ok_or_else(|| QueryError::TypeMismatch("type must be represented as a number or a string".into()))?;
    let sel = match alias {
        "double" => TypeSel::Tag(tag::DOUBLE),
        "string" => TypeSel::Tag(tag::STRING),
        "object" => TypeSel::Tag(tag::DOCUMENT),
        "array" => TypeSel::Tag(tag::ARRAY),
        "binData" => TypeSel::Tag(tag::BINARY),
        "objectId" => TypeSel::Tag(tag::OBJECT_ID),
        "bool" => TypeSel::Tag(tag::BOOLEAN),
        "date" => TypeSel::Tag(tag::DATE_TIME),
        "null" => TypeSel::Tag(tag::NULL),
        "regex" => TypeSel::Tag(tag::REGEX),
        "int" => TypeSel::Tag(tag::INT32),
        "timestamp" => TypeSel::Tag(tag::TIMESTAMP),
        "long" => TypeSel::Tag(tag::INT64),
        "decimal" => TypeSel::Tag(tag::DECIMAL128),
        "number" => TypeSel::Number,
        other => {
            return Err(QueryError::BadValue(format!(
                "unknown type name alias: {}",
                other
            )))
        }
    };
    Ok(sel)
}

fn parse_operators(doc: &Document) -> QueryResult<Cond> {
    let mut conds = Vec::with_capacity(doc.len());
    let options = doc.get("$options");

    for (op, arg) in doc.iter() {
        let cond = match op {
            "$eq" => Cond::Eq(arg.clone()),
            "$ne" => Cond::Ne(arg.clone()),
            "$gt" => Cond::Cmp(CmpOp::Gt, arg.clone()),
            "$gte" => Cond::Cmp(CmpOp::Gte, arg.clone()),
            "$lt" => Cond::Cmp(CmpOp::Lt, arg.clone()),
            "$lte" => Cond::Cmp(CmpOp::Lte, arg.clone()),
            "$in" => {
                let (values, patterns) = parse_list(op, arg)?;
                Cond::In(values, patterns)
            }
            "$nin" => {
                let (values, patterns) = parse_list(op, arg)?;
                Cond::Nin(values, patterns)
            }
            "$exists" => Cond::Exists(arg.is_truthy()),
            "$type" => match arg {
                Bson::Array(items) => Cond::Type(
                    items
                        .iter()
                        .map(parse_type_selector)
                        .collect::<QueryResult<_>>()?,
                ),
                other => Cond::Type(vec![parse_type_selector(other)?]),
            },
            "$size" => {
                let n = arg.as_i64().ok_or_else(|| {
                    QueryError::BadValue("$size needs a whole number".into())
                })?;
                let n = usize::try_from(n)
                    .map_err(|_| QueryError::BadValue("$size may not be negative".into()))?;
                Cond::Size(n)
            }
            "$all" => Cond::All(
                arg.as_array()
                    .ok_or_else(|| QueryError::BadValue("$all needs an array".into()))?
                    .clone(),
            ),
            "$elemMatch" => {
                let sub = arg
                    .as_document()
                    .ok_or_else(|| QueryError::BadValue("$elemMatch needs an Object".into()))?;
                let value_form = sub
                    .first()
                    .is_some_and(|(k, _)| k.starts_with('$') && !matches!(k, "$and" | "$or" | "$nor"));
                if value_form {
                    Cond::ElemMatch(ElemMatch::Value(Box::new(parse_operators(sub)?)))
                } else {
                    Cond::ElemMatch(ElemMatch::Document(Box::new(parse_expr(sub)?)))
                }
            }
            "$regex" => {
                let (pattern, own_options) = match arg {
                    Bson::String(s) => (s.as_str(), ""),
                    Bson::RegularExpression(re) => (re.pattern.as_str(), re.options.as_str()),
                    _ => {
                        return Err(QueryError::BadValue(
                            "$regex has to be a string".into(),
                        ))
                    }
                };
                let flags = match options {
                    Some(Bson::String(o)) => o.as_str(),
                    Some(_) => {
                        return Err(QueryError::BadValue(
                            "$options has to be a string".into(),
                        ))
                    }
                    None => own_options,
                };
                Cond::Regex(Pattern::compile(pattern, flags)?)
            }
            "$options" => {
                if !doc.contains_key("$regex") {
                    return Err(QueryError::BadValue("$options needs a $regex".into()));
                }
                continue;
            }
            "$not" => match arg {
                Bson::Document(d) if is_operator_document(d) => {
                    Cond::Not(Box::new(parse_operators(d)?))
                }
                Bson::RegularExpression(re) => {
                    Cond::Not(Box::new(Cond::Regex(Pattern::compile(&re.pattern, &re.options)?)))
                }
                _ => {
                    return Err(QueryError::BadValue(
                        "$not needs a regex or a document".into(),
                    ))
                }
            },
            "$mod" => {
                let parts = arg
                    .as_array()
                    .filter(|a| a.len() == 2)
                    .ok_or_else(|| {
                        QueryError::BadValue(
                            "malformed mod, needs to be an array of two numbers".into(),
                        )
                    })?;
                let divisor = parts[0].as_f64().map(|v| v.trunc() as i64);
                let remainder = parts[1].as_f64().map(|v| v.trunc() as i64);
                match (divisor, remainder) {
                    (Some(0), _) => {
                        return Err(QueryError::BadValue("divisor cannot be 0".into()))
                    }
                    (Some(d), Some(r)) => Cond::Mod(d, r),
                    _ => {
                        return Err(QueryError::BadValue(
                            "malformed mod, needs to be an array of two numbers".into(),
                        ))
                    }
                }
            }
            other if other.starts_with('$') => {
                return Err(QueryError::BadValue(format!("unknown operator: {}", other)))
            }
            other => {
                return Err(QueryError::BadValue(format!(
                    "unknown operator: {} (field names cannot follow operators)",
                    other
                )))
            }
        };
        conds.push(cond);
    }

    Ok(if conds.len() == 1 {
        conds.remove(0)
    } else {
        Cond::And(conds)
    })
}

impl Expr {
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Expr::And(items) => items.iter().all(|e| e.matches(doc)),
            Expr::Or(items) => items.iter().any(|e| e.matches(doc)),
            Expr::Nor(items) => !items.iter().any(|e| e.matches(doc)),
            Expr::Field { path, cond } => cond.matches_path(doc, path),
        }
    }
}

fn expand<'a>(values: &[&'a Bson]) -> Vec<&'a Bson> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        out.push(*value);
        if let Bson::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

fn eq_matches(values: &[&Bson], target: &Bson) -> bool {
    if matches!(target, Bson::Null) && values.is_empty() {
        return true;
    }
    expand(values).iter().any(|v| values_equal(v, target))
}

fn in_matches(values: &[&Bson], list: &[Bson], patterns: &[Pattern]) -> bool {
    list.iter().any(|target| eq_matches(values, target))
        || expand(values)
            .iter()
            .any(|v| patterns.iter().any(|p| p.matches_value(v)))
}

impl Cond {
    fn matches_path(&self, doc: &Document, path: &str) -> bool {
        match self {
            Cond::Not(inner) => !inner.matches_path(doc, path),
            Cond::And(items) => items.iter().all(|c| c.matches_path(doc, path)),
            _ => self.matches_values(&resolve(doc, path)),
        }
    }

    /// Evaluates against the values found at a path.
    fn matches_values(&self, values: &[&Bson]) -> bool {
        match self {
            Cond::Eq(target) => eq_matches(values, target),
            Cond::Ne(target) => !eq_matches(values, target),
            Cond::Cmp(op, target) => expand(values).iter().any(|v| {
                if type_rank(v) != type_rank(target) {
                    return false;
                }
                let ord = compare(v, target);
                match op {
                    CmpOp::Gt => ord == Ordering::Greater,
                    CmpOp::Gte => ord != Ordering::Less,
                    CmpOp::Lt => ord == Ordering::Less,
                    CmpOp::Lte => ord != Ordering::Greater,
                }
            }),
            Cond::In(list, patterns) => in_matches(values, list, patterns),
            Cond::Nin(list, patterns) => !in_matches(values, list, patterns),
            Cond::Exists(want) => values.is_empty() != *want,
            Cond::Type(sels) => expand(values).iter().any(|v| {
                sels.iter().any(|sel| match sel {
                    TypeSel::Number => v.is_number(),
                    TypeSel::Tag(t) => v.element_type() == *t,
                })
            }),
            Cond::Size(n) => values
                .iter()
                .any(|v| matches!(v, Bson::Array(items) if items.len() == *n)),
            Cond::All(list) => {
                !list.is_empty()
                    && list.iter().all(|item| match item {
                        Bson::RegularExpression(re) => Pattern::compile(&re.pattern, &re.options)
                            .map(|p| expand(values).iter().any(|v| p.matches_value(v)))
                            .unwrap_or(false),
                        other => eq_matches(values, other),
                    })
            }
            Cond::ElemMatch(em) => values.iter().any(|v| match v {
                Bson::Array(items) => items.iter().any(|item| match em {
                    ElemMatch::Value(cond) => cond.matches_values(&[item]),
                    ElemMatch::Document(expr) => match item {
                        Bson::Document(d) => expr.matches(d),
                        _ => false,
                    },
                }),
                _ => false,
            }),
            Cond::Regex(pattern) => expand(values).iter().any(|v| pattern.matches_value(v)),
            Cond::Not(inner) => !inner.matches_values(values),
            Cond::Mod(divisor, remainder) => expand(values).iter().any(|v| {
                v.is_number()
                    && v
                        .as_f64()
                        .filter(|f| f.is_finite())
                        .is_some_and(|f| (f.trunc() as i64) % divisor == *remainder)
            }),
            Cond::And(items) => items.iter().all(|c| c.matches_values(values)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn matches(filter: Document, doc: &Document) -> bool {
        Filter::parse(&filter).unwrap().matches(doc)
    }

    fn person() -> Document {
        doc! {
            "_id": 1,
            "name": "Alice",
            "age": 30,
            "tags": vec![Bson::String("a".into()), Bson::String("b".into())],
            "address": doc! { "city": "Paris", "zip": "75001" },
            "scores": vec![
                Bson::Document(doc! { "k": "x", "v": 5 }),
                Bson::Document(doc! { "k": "y", "v": 9 }),
            ],
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(Filter::all().is_empty());
        assert!(matches(doc! {}, &person()));
    }

    #[test]
    fn test_equality_and_numeric_kinds() {
        let p = person();
        assert!(matches(doc! { "age": 30.0 }, &p));
        assert!(matches(doc! { "age": Bson::Int64(30) }, &p));
        assert!(!matches(doc! { "age": "30" }, &p));
        assert!(matches(doc! { "address.city": "Paris" }, &p));
        assert!(matches(doc! { "tags": "b" }, &p));
        assert!(matches(doc! { "scores.k": "y" }, &p));
    }

    #[test]
    fn test_null_matches_missing() {
        let p = person();
        assert!(matches(doc! { "nope": Bson::Null }, &p));
        assert!(!matches(doc! { "nope": doc! { "$ne": Bson::Null } }, &p));
        assert!(matches(doc! { "name": doc! { "$ne": Bson::Null } }, &p));
    }

    #[test]
    fn test_comparisons_respect_type_brackets() {
        let p = person();
        assert!(matches(doc! { "age": doc! { "$gt": 20, "$lte": 30 } }, &p));
        assert!(!matches(doc! { "age": doc! { "$gt": "20" } }, &p));
        assert!(matches(doc! { "scores.v": doc! { "$gte": 9 } }, &p));
    }

    #[test]
    fn test_logical_operators() {
        let p = person();
        assert!(matches(
            doc! { "$or": vec![Bson::Document(doc! { "age": 1 }), Bson::Document(doc! { "name": "Alice" })] },
            &p
        ));
        assert!(!matches(
            doc! { "$nor": vec![Bson::Document(doc! { "name": "Alice" })] },
            &p
        ));
        assert!(matches(
            doc! { "$and": vec![Bson::Document(doc! { "age": 30 }), Bson::Document(doc! { "tags": "a" })] },
            &p
        ));
    }

    #[test]
    fn test_array_operators() {
        let p = person();
        assert!(matches(doc! { "tags": doc! { "$size": 2 } }, &p));
        assert!(matches(doc! { "tags": doc! { "$all": vec![Bson::from("a"), Bson::from("b")] } }, &p));
        assert!(!matches(doc! { "tags": doc! { "$all": vec![Bson::from("a"), Bson::from("z")] } }, &p));
        assert!(matches(
            doc! { "scores": doc! { "$elemMatch": doc! { "k": "x", "v": 5 } } },
            &p
        ));
        assert!(!matches(
            doc! { "scores": doc! { "$elemMatch": doc! { "k": "x", "v": 9 } } },
            &p
        ));
        assert!(matches(
            doc! { "scores.v": doc! { "$in": vec![Bson::Int32(1), Bson::Int32(9)] } },
            &p
        ));
        assert!(matches(doc! { "age": doc! { "$nin": vec![Bson::Int32(1)] } }, &p));
    }

    #[test]
    fn test_exists_type_mod_regex() {
        let p = person();
        assert!(matches(doc! { "address.zip": doc! { "$exists": true } }, &p));
        assert!(matches(doc! { "nope": doc! { "$exists": false } }, &p));
        assert!(matches(doc! { "age": doc! { "$type": "number" } }, &p));
        assert!(matches(doc! { "tags": doc! { "$type": "array" } }, &p));
        assert!(matches(doc! { "age": doc! { "$mod": vec![Bson::Int32(7), Bson::Int32(2)] } }, &p));
        assert!(matches(doc! { "name": doc! { "$regex": "^ali", "$options": "i" } }, &p));
        assert!(!matches(doc! { "name": doc! { "$not": doc! { "$regex": "^A" } } }, &p));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Filter::parse(&doc! { "$where": "1" }).is_err());
        assert!(Filter::parse(&doc! { "a": doc! { "$bogus": 1 } }).is_err());
        assert!(Filter::parse(&doc! { "a": doc! { "$in": 1 } }).is_err());
        assert!(Filter::parse(&doc! { "$or": Vec::<Bson>::new() }).is_err());
        assert!(Filter::parse(&doc! { "a": doc! { "$mod": vec![Bson::Int32(0), Bson::Int32(1)] } }).is_err());
        assert!(Filter::parse(&doc! { "a": doc! { "$regex": "(" } }).is_err());
    }
}
