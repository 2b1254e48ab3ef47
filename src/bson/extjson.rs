//! Canonical Extended JSON
//!
//! The textual form is used for diagnostics and is also the persisted format
//! of the document column. Every value kind is wrapped so that the original
//! type survives a round trip; plain JSON numbers are accepted on input.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};

use super::{BsonError, BsonResult, Binary, Bson, Decimal128, Document, ObjectId, Regex, Timestamp};

fn invalid(msg: impl Into<String>) -> BsonError {
    BsonError::InvalidEncoding(msg.into())
}

/// Text used for `$numberDouble`. Integral values keep a `.0` suffix.
pub fn format_double(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "Infinity".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        format!("{:?}", v)
    }
}

fn wrap(key: &str, value: Value) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(key.to_string(), value);
    Value::Object(map)
}

pub fn to_json(value: &Bson) -> Value {
    match value {
        Bson::Double(v) => wrap("$numberDouble", Value::String(format_double(*v))),
        Bson::String(s) => Value::String(s.clone()),
        Bson::Document(d) => document_to_json(d),
        Bson::Array(items) => Value::Array(items.iter().map(to_json).collect()),
        Bson::Binary(b) => {
            let mut inner = Map::with_capacity(2);
            inner.insert("base64".into(), Value::String(STANDARD.encode(&b.bytes)));
            inner.insert("subType".into(), Value::String(format!("{:02x}", b.subtype)));
            wrap("$binary", Value::Object(inner))
        }
        Bson::ObjectId(oid) => wrap("$oid", Value::String(oid.to_hex())),
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::DateTime(ms) => wrap("$date", wrap("$numberLong", Value::String(ms.to_string()))),
        Bson::Null => Value::Null,
        Bson::RegularExpression(re) => {
            let mut inner = Map::with_capacity(2);
            inner.insert("pattern".into(), Value::String(re.pattern.clone()));
            inner.insert("options".into(), Value::String(re.options.clone()));
            wrap("$regularExpression", Value::Object(inner))
        }
        Bson::Int32(v) => wrap("$numberInt", Value::String(v.to_string())),
        Bson::Timestamp(ts) => {
            let mut inner = Map::with_capacity(2);
            inner.insert("t".into(), Value::from(ts.time));
            inner.insert("i".into(), Value::from(ts.increment));
            wrap("$timestamp", Value::Object(inner))
        }
        Bson::Int64(v) => wrap("$numberLong", Value::String(v.to_string())),
        Bson::Decimal128(d) => wrap("$numberDecimal", Value::String(d.to_string())),
    }
}

pub fn document_to_json(doc: &Document) -> Value {
    let mut map = Map::with_capacity(doc.len());
    for (k, v) in doc.iter() {
        map.insert(k.to_string(), to_json(v));
    }
    Value::Object(map)
}

/// Compact canonical text of a document.
pub fn document_to_string(doc: &Document) -> String {
    document_to_json(doc).to_string()
}

/// Parses canonical (or relaxed) Extended JSON text into a document.
pub fn document_from_str(text: &str) -> BsonResult<Document> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| invalid(format!("invalid JSON: {}", e)))?;
    match from_json(&value)? {
        Bson::Document(doc) => Ok(doc),
        other => Err(invalid(format!(
            "expected a JSON object, found {}",
            other.type_name()
        ))),
    }
}

fn expect_str<'a>(value: &'a Value, what: &str) -> BsonResult<&'a str> {
    value
        .as_str()
        .ok_or_else(|| invalid(format!("{} must be a string", what)))
}

fn parse_double(s: &str) -> BsonResult<f64> {
    match s {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        _ => s
            .parse::<f64>()
            .map_err(|_| invalid(format!("invalid $numberDouble '{}'", s))),
    }
}

fn parse_date(value: &Value) -> BsonResult<i64> {
    match value {
        Value::Object(map) => match map.get("$numberLong") {
            Some(v) if map.len() == 1 => expect_str(v, "$date.$numberLong")?
                .parse::<i64>()
                .map_err(|_| invalid("invalid $date.$numberLong")),
            _ => Err(invalid("invalid $date document")),
        },
        Value::Number(n) => n.as_i64().ok_or_else(|| invalid("invalid $date number")),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| invalid(format!("invalid $date string '{}': {}", s, e))),
        _ => Err(invalid("invalid $date value")),
    }
}

fn parse_wrapper(key: &str, value: &Value, map: &Map<String, Value>) -> BsonResult<Option<Bson>> {
    let parsed = match key {
        "$oid" => Bson::ObjectId(ObjectId::parse_str(expect_str(value, "$oid")?)?),
        "$numberInt" => Bson::Int32(
            expect_str(value, "$numberInt")?
                .parse()
                .map_err(|_| invalid("invalid $numberInt"))?,
        ),
        "$numberLong" => Bson::Int64(
            expect_str(value, "$numberLong")?
                .parse()
                .map_err(|_| invalid("invalid $numberLong"))?,
        ),
        "$numberDouble" => Bson::Double(parse_double(expect_str(value, "$numberDouble")?)?),
        "$numberDecimal" => {
            Bson::Decimal128(expect_str(value, "$numberDecimal")?.parse::<Decimal128>()?)
        }
        "$date" => Bson::DateTime(parse_date(value)?),
        "$binary" => {
            let inner = value
                .as_object()
                .ok_or_else(|| invalid("$binary must be a document"))?;
            let data = expect_str(
                inner.get("base64").ok_or_else(|| invalid("$binary.base64 missing"))?,
                "$binary.base64",
            )?;
            let subtype = expect_str(
                inner.get("subType").ok_or_else(|| invalid("$binary.subType missing"))?,
                "$binary.subType",
            )?;
            let bytes = STANDARD
                .decode(data)
                .map_err(|e| invalid(format!("invalid base64: {}", e)))?;
            let subtype =
                u8::from_str_radix(subtype, 16).map_err(|_| invalid("invalid $binary.subType"))?;
            Bson::Binary(Binary { subtype, bytes })
        }
        "$regularExpression" => {
            let inner = value
                .as_object()
                .ok_or_else(|| invalid("$regularExpression must be a document"))?;
            let pattern = expect_str(
                inner.get("pattern").ok_or_else(|| invalid("pattern missing"))?,
                "pattern",
            )?;
            let options = expect_str(
                inner.get("options").ok_or_else(|| invalid("options missing"))?,
                "options",
            )?;
            if pattern.contains('\0') || options.contains('\0') {
                return Err(invalid("regular expression must not contain NUL"));
            }
            Bson::RegularExpression(Regex {
                pattern: pattern.to_string(),
                options: options.to_string(),
            })
        }
        "$timestamp" => {
            let inner = value
                .as_object()
                .ok_or_else(|| invalid("$timestamp must be a document"))?;
            let field = |name: &str| -> BsonResult<u32> {
                inner
                    .get(name)
                    .and_then(Value::as_u64)
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| invalid(format!("invalid $timestamp.{}", name)))
            };
            Bson::Timestamp(Timestamp {
                time: field("t")?,
                increment: field("i")?,
            })
        }
        _ => return Ok(None),
    };
    if map.len() != 1 {
        return Err(invalid(format!("{} must be the only key", key)));
    }
    Ok(Some(parsed))
}

pub fn from_json(value: &Value) -> BsonResult<Bson> {
    Ok(match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                match i32::try_from(i) {
                    Ok(small) => Bson::Int32(small),
                    Err(_) => Bson::Int64(i),
                }
            } else {
                Bson::Double(n.as_f64().ok_or_else(|| invalid("number out of range"))?)
            }
        }
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(items) => Bson::Array(items.iter().map(from_json).collect::<BsonResult<_>>()?),
        Value::Object(map) => {
            if let Some((key, inner)) = map.iter().next() {
                if key.starts_with('$') {
                    if let Some(special) = parse_wrapper(key, inner, map)? {
                        return Ok(special);
                    }
                }
            }
            let mut doc = Document::with_capacity(map.len());
            for (k, v) in map {
                if k.contains('\0') {
                    return Err(invalid("field names must not contain NUL"));
                }
                doc.push(k.clone(), from_json(v)?);
            }
            Bson::Document(doc)
        }
    })
}
