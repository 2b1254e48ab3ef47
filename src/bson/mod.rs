//! Document model
//!
//! An ordered, typed document representation together with its binary codec
//! (`codec`), the canonical textual form (`extjson`) and the cross-type value
//! ordering used by queries (`compare`).

pub mod codec;
pub mod compare;
pub mod decimal;
pub mod extjson;

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use rand::Rng;

pub use codec::{decode_document, encode_document, BsonError, BsonResult};
pub use decimal::Decimal128;

/// Element type tags as they appear on the wire.
pub mod tag {
    pub const DOUBLE: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const DOCUMENT: u8 = 0x03;
    pub const ARRAY: u8 = 0x04;
    pub const BINARY: u8 = 0x05;
    pub const OBJECT_ID: u8 = 0x07;
    pub const BOOLEAN: u8 = 0x08;
    pub const DATE_TIME: u8 = 0x09;
    pub const NULL: u8 = 0x0A;
    pub const REGEX: u8 = 0x0B;
    pub const INT32: u8 = 0x10;
    pub const TIMESTAMP: u8 = 0x11;
    pub const INT64: u8 = 0x12;
    pub const DECIMAL128: u8 = 0x13;
}

/// A single typed value.
#[derive(Debug, Clone)]
pub enum Bson {
    Double(f64),
    String(String),
    Document(Document),
    Array(Vec<Bson>),
    Binary(Binary),
    ObjectId(ObjectId),
    Boolean(bool),
    /// Milliseconds since the Unix epoch.
    DateTime(i64),
    Null,
    RegularExpression(Regex),
    Int32(i32),
    Timestamp(Timestamp),
    Int64(i64),
    Decimal128(Decimal128),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    pub subtype: u8,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regex {
    pub pattern: String,
    pub options: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub time: u32,
    pub increment: u32,
}

impl PartialEq for Bson {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            // Bitwise so that NaN and signed zeroes survive equality checks.
            (Bson::Double(a), Bson::Double(b)) => a.to_bits() == b.to_bits(),
            (Bson::String(a), Bson::String(b)) => a == b,
            (Bson::Document(a), Bson::Document(b)) => a == b,
            (Bson::Array(a), Bson::Array(b)) => a == b,
            (Bson::Binary(a), Bson::Binary(b)) => a == b,
            (Bson::ObjectId(a), Bson::ObjectId(b)) => a == b,
            (Bson::Boolean(a), Bson::Boolean(b)) => a == b,
            (Bson::DateTime(a), Bson::DateTime(b)) => a == b,
            (Bson::Null, Bson::Null) => true,
            (Bson::RegularExpression(a), Bson::RegularExpression(b)) => a == b,
            (Bson::Int32(a), Bson::Int32(b)) => a == b,
            (Bson::Timestamp(a), Bson::Timestamp(b)) => a == b,
            (Bson::Int64(a), Bson::Int64(b)) => a == b,
            (Bson::Decimal128(a), Bson::Decimal128(b)) => a == b,
            _ => false,
        }
    }
}

impl Bson {
    /// Wire type tag of this value.
    pub fn element_type(&self) -> u8 {
        match self {
            Bson::Double(_) => tag::DOUBLE,
            Bson::String(_) => tag::STRING,
            Bson::Document(_) => tag::DOCUMENT,
            Bson::Array(_) => tag::ARRAY,
            Bson::Binary(_) => tag::BINARY,
            Bson::ObjectId(_) => tag::OBJECT_ID,
            Bson::Boolean(_) => tag::BOOLEAN,
            Bson::DateTime(_) => tag::DATE_TIME,
            Bson::Null => tag::NULL,
            Bson::RegularExpression(_) => tag::REGEX,
            Bson::Int32(_) => tag::INT32,
            Bson::Timestamp(_) => tag::TIMESTAMP,
            Bson::Int64(_) => tag::INT64,
            Bson::Decimal128(_) => tag::DECIMAL128,
        }
    }

    /// Type alias used by `$type` and in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Bson::Double(_) => "double",
            Bson::String(_) => "string",
            Bson::Document(_) => "object",
            Bson::Array(_) => "array",
            Bson::Binary(_) => "binData",
            Bson::ObjectId(_) => "objectId",
            Bson::Boolean(_) => "bool",
            Bson::DateTime(_) => "date",
            Bson::Null => "null",
            Bson::RegularExpression(_) => "regex",
            Bson::Int32(_) => "int",
            Bson::Timestamp(_) => "timestamp",
            Bson::Int64(_) => "long",
            Bson::Decimal128(_) => "decimal",
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(
            self,
            Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Decimal128(_)
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Bson::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Bson::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Bson>> {
        match self {
            Bson::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Bson::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric value as f64, for any numeric kind.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Bson::Double(v) => Some(*v),
            Bson::Int32(v) => Some(*v as f64),
            Bson::Int64(v) => Some(*v as f64),
            Bson::Decimal128(d) => Some(d.to_f64()),
            _ => None,
        }
    }

    /// Numeric value as i64 when it is integral and in range.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Bson::Int32(v) => Some(*v as i64),
            Bson::Int64(v) => Some(*v),
            Bson::Double(v) => {
                if v.fract() == 0.0 && *v >= -9.223_372_036_854_776e18 && *v < 9.223_372_036_854_776e18
                {
                    Some(*v as i64)
                } else {
                    None
                }
            }
            Bson::Decimal128(d) => d.to_i64_exact(),
            _ => None,
        }
    }

    /// Truthiness as used by command options such as `ordered` or `multi`.
    pub fn is_truthy(&self) -> bool {
        match self {
            Bson::Boolean(b) => *b,
            Bson::Null => false,
            other => match other.as_f64() {
                Some(v) => v != 0.0,
                None => true,
            },
        }
    }
}

impl fmt::Display for Bson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", extjson::to_json(self))
    }
}

impl From<f64> for Bson {
    fn from(v: f64) -> Self {
        Bson::Double(v)
    }
}

impl From<i32> for Bson {
    fn from(v: i32) -> Self {
        Bson::Int32(v)
    }
}

impl From<i64> for Bson {
    fn from(v: i64) -> Self {
        Bson::Int64(v)
    }
}

impl From<bool> for Bson {
    fn from(v: bool) -> Self {
        Bson::Boolean(v)
    }
}

impl From<&str> for Bson {
    fn from(v: &str) -> Self {
        Bson::String(v.to_string())
    }
}

impl From<String> for Bson {
    fn from(v: String) -> Self {
        Bson::String(v)
    }
}

impl From<Document> for Bson {
    fn from(v: Document) -> Self {
        Bson::Document(v)
    }
}

impl From<Vec<Bson>> for Bson {
    fn from(v: Vec<Bson>) -> Self {
        Bson::Array(v)
    }
}

impl From<ObjectId> for Bson {
    fn from(v: ObjectId) -> Self {
        Bson::ObjectId(v)
    }
}

impl From<Decimal128> for Bson {
    fn from(v: Decimal128) -> Self {
        Bson::Decimal128(v)
    }
}

/// An ordered list of named values.
///
/// Decoded documents keep duplicate keys so that re-encoding is byte-identical;
/// `insert` replaces the first occurrence in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    entries: Vec<(String, Bson)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Bson> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Bson> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Sets `key`, keeping its position if present. Returns the old value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bson>) -> Option<Bson> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Appends without checking for an existing key.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<Bson>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Places `key` first, removing any other occurrence.
    pub fn insert_first(&mut self, key: impl Into<String>, value: impl Into<Bson>) {
        let key = key.into();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.insert(0, (key, value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<Bson> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn first(&self) -> Option<(&str, &Bson)> {
        self.entries.first().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bson)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Bson)> {
        self.entries.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Bson::as_str)
    }

    pub fn get_document(&self, key: &str) -> Option<&Document> {
        self.get(key).and_then(Bson::as_document)
    }

    pub fn get_array(&self, key: &str) -> Option<&Vec<Bson>> {
        self.get(key).and_then(Bson::as_array)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Bson::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Bson::as_i64)
    }
}

impl IntoIterator for Document {
    type Item = (String, Bson);
    type IntoIter = std::vec::IntoIter<(String, Bson)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(String, Bson)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Bson)>>(iter: T) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&extjson::document_to_string(self))
    }
}

/// Builds a [`Document`] from `"key": value` pairs.
#[macro_export]
macro_rules! doc {
    () => { $crate::bson::Document::new() };
    ($($key:literal : $value:expr),+ $(,)?) => {{
        let mut document = $crate::bson::Document::new();
        $( document.insert($key, $value); )+
        document
    }};
}

/// Twelve byte document identifier.
///
/// Layout: 4-byte big-endian seconds, 5 process-unique random bytes, 3-byte counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

static OID_COUNTER: OnceLock<AtomicU32> = OnceLock::new();
static OID_PROCESS: OnceLock<[u8; 5]> = OnceLock::new();

impl ObjectId {
    pub fn new() -> Self {
        let secs = chrono::Utc::now().timestamp() as u32;
        let process = OID_PROCESS.get_or_init(|| rand::thread_rng().gen());
        let counter = OID_COUNTER
            .get_or_init(|| AtomicU32::new(rand::thread_rng().gen_range(0..0x00FF_FFFF)))
            .fetch_add(1, Ordering::Relaxed)
            & 0x00FF_FFFF;

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(process);
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn parse_str(s: &str) -> Result<Self, BsonError> {
        let raw = hex::decode(s)
            .map_err(|e| BsonError::InvalidEncoding(format!("invalid ObjectId '{}': {}", s, e)))?;
        let bytes: [u8; 12] = raw.try_into().map_err(|_| {
            BsonError::InvalidEncoding(format!("ObjectId '{}' must be 24 hex characters", s))
        })?;
        Ok(Self(bytes))
    }

    /// Creation time in seconds since the epoch.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_keeps_position() {
        let mut doc = doc! { "a": 1, "b": 2, "c": 3 };
        let old = doc.insert("b", "two");
        assert_eq!(old, Some(Bson::Int32(2)));
        assert_eq!(doc.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(doc.get_str("b"), Some("two"));
    }

    #[test]
    fn test_insert_first_moves_key() {
        let mut doc = doc! { "a": 1, "_id": 7 };
        doc.insert_first("_id", 7);
        assert_eq!(doc.first().map(|(k, _)| k), Some("_id"));
        assert_eq!(doc.len(), 2);
    }

    #[test]
    fn test_object_id_hex_round_trip() {
        let oid = ObjectId::new();
        let parsed = ObjectId::parse_str(&oid.to_hex()).unwrap();
        assert_eq!(oid, parsed);
        assert!(ObjectId::parse_str("zz").is_err());
        assert!(ObjectId::parse_str("0011").is_err());
    }

    #[test]
    fn test_object_ids_are_unique() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_double_equality_is_bitwise() {
        assert_eq!(Bson::Double(f64::NAN), Bson::Double(f64::NAN));
        assert_ne!(Bson::Double(0.0), Bson::Double(-0.0));
        assert_ne!(Bson::Int32(1), Bson::Int64(1));
    }

    #[test]
    fn test_as_i64() {
        assert_eq!(Bson::Double(3.0).as_i64(), Some(3));
        assert_eq!(Bson::Double(3.5).as_i64(), None);
        assert_eq!(Bson::Int32(-4).as_i64(), Some(-4));
        assert_eq!(Bson::String("1".into()).as_i64(), None);
    }
}
