//! Binary document codec
//!
//! Decoding is strict: every embedded length is checked against the bytes it
//! claims, strings must be terminated and valid UTF-8, and unknown type tags
//! are rejected. Adversarial input yields `BsonError::InvalidEncoding`, never a
//! panic.

use thiserror::Error;

use super::{tag, Binary, Bson, Decimal128, Document, ObjectId, Regex, Timestamp};

/// Deepest nesting accepted by the decoder.
pub const MAX_DEPTH: usize = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BsonError {
    #[error("invalid BSON: {0}")]
    InvalidEncoding(String),
}

pub type BsonResult<T> = Result<T, BsonError>;

fn invalid(msg: impl Into<String>) -> BsonError {
    BsonError::InvalidEncoding(msg.into())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> BsonResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(invalid(format!(
                "need {} bytes at offset {}, only {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> BsonResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> BsonResult<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32(&mut self) -> BsonResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> BsonResult<i64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_le_bytes(raw))
    }

    fn f64(&mut self) -> BsonResult<f64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_le_bytes(raw))
    }

    fn cstring(&mut self) -> BsonResult<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| invalid("unterminated C string"))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|_| invalid("C string is not valid UTF-8"))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }

    fn string(&mut self) -> BsonResult<String> {
        let len = self.i32()?;
        if len < 1 {
            return Err(invalid(format!("invalid string length {}", len)));
        }
        let raw = self.take(len as usize)?;
        if raw[raw.len() - 1] != 0 {
            return Err(invalid("string is not NUL terminated"));
        }
        std::str::from_utf8(&raw[..raw.len() - 1])
            .map(str::to_string)
            .map_err(|_| invalid("string is not valid UTF-8"))
    }

    /// Slice holding the embedded document that starts at the cursor.
    fn embedded(&mut self) -> BsonResult<&'a [u8]> {
        if self.remaining() < 4 {
            return Err(invalid("truncated document length"));
        }
        let b = &self.buf[self.pos..self.pos + 4];
        let len = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        if len < 5 {
            return Err(invalid(format!("invalid document length {}", len)));
        }
        self.take(len as usize)
    }
}

/// Decodes a buffer that must contain exactly one document.
pub fn decode_document(bytes: &[u8]) -> BsonResult<Document> {
    let (doc, used) = read_document(bytes)?;
    if used != bytes.len() {
        return Err(invalid(format!(
            "{} trailing bytes after document",
            bytes.len() - used
        )));
    }
    Ok(doc)
}

/// Decodes the document at the start of `bytes`, returning it and the number
/// of bytes it occupied.
pub fn read_document(bytes: &[u8]) -> BsonResult<(Document, usize)> {
    let mut reader = Reader::new(bytes);
    let raw = reader.embedded()?;
    let entries = parse_elements(raw, 0, false)?;
    Ok((Document { entries }, raw.len()))
}

fn parse_elements(raw: &[u8], depth: usize, array: bool) -> BsonResult<Vec<(String, Bson)>> {
    if depth > MAX_DEPTH {
        return Err(invalid("document nesting too deep"));
    }
    if raw[raw.len() - 1] != 0 {
        return Err(invalid("document is not NUL terminated"));
    }
    // Skip the length prefix; the trailing NUL bounds the element list.
    let mut reader = Reader::new(&raw[..raw.len() - 1]);
    reader.pos = 4;

    let mut entries = Vec::new();
    while reader.remaining() > 0 {
        let element_type = reader.u8()?;
        let key = reader.cstring()?;
        if array && key != entries.len().to_string() {
            return Err(invalid(format!(
                "array key '{}' out of sequence, expected '{}'",
                key,
                entries.len()
            )));
        }
        let value = parse_value(&mut reader, element_type, depth)?;
        entries.push((key, value));
    }
    Ok(entries)
}

fn parse_value(reader: &mut Reader<'_>, element_type: u8, depth: usize) -> BsonResult<Bson> {
    let value = match element_type {
        tag::DOUBLE => Bson::Double(reader.f64()?),
        tag::STRING => Bson::String(reader.string()?),
        tag::DOCUMENT => {
            let raw = reader.embedded()?;
            Bson::Document(Document {
                entries: parse_elements(raw, depth + 1, false)?,
            })
        }
        tag::ARRAY => {
            let raw = reader.embedded()?;
            let items = parse_elements(raw, depth + 1, true)?;
            Bson::Array(items.into_iter().map(|(_, v)| v).collect())
        }
        tag::BINARY => {
            let len = reader.i32()?;
            if len < 0 {
                return Err(invalid(format!("invalid binary length {}", len)));
            }
            let subtype = reader.u8()?;
            let bytes = reader.take(len as usize)?.to_vec();
            // The old binary subtype repeats its length inside the payload.
            if subtype == 0x02 {
                if bytes.len() < 4 {
                    return Err(invalid("binary subtype 2 payload too short"));
                }
                let inner = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                if inner < 0 || inner as usize != bytes.len() - 4 {
                    return Err(invalid("binary subtype 2 inner length mismatch"));
                }
            }
            Bson::Binary(Binary { subtype, bytes })
        }
        tag::OBJECT_ID => {
            let mut raw = [0u8; 12];
            raw.copy_from_slice(reader.take(12)?);
            Bson::ObjectId(ObjectId::from_bytes(raw))
        }
        tag::BOOLEAN => match reader.u8()? {
            0 => Bson::Boolean(false),
            1 => Bson::Boolean(true),
            other => return Err(invalid(format!("invalid boolean byte {}", other))),
        },
        tag::DATE_TIME => Bson::DateTime(reader.i64()?),
        tag::NULL => Bson::Null,
        tag::REGEX => {
            let pattern = reader.cstring()?;
            let options = reader.cstring()?;
            Bson::RegularExpression(Regex { pattern, options })
        }
        tag::INT32 => Bson::Int32(reader.i32()?),
        tag::TIMESTAMP => {
            let increment = reader.u32()?;
            let time = reader.u32()?;
            Bson::Timestamp(Timestamp { time, increment })
        }
        tag::INT64 => Bson::Int64(reader.i64()?),
        tag::DECIMAL128 => {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(reader.take(16)?);
            Bson::Decimal128(Decimal128::from_bytes(raw))
        }
        other => {
            return Err(invalid(format!(
                "unsupported element type 0x{:02x}",
                other
            )))
        }
    };
    Ok(value)
}

/// Encodes a document.
pub fn encode_document(doc: &Document) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    write_document(&mut buf, doc);
    buf
}

/// Appends the encoding of `doc` to `buf`.
pub fn write_document(buf: &mut Vec<u8>, doc: &Document) {
    write_elements(buf, doc.iter());
}

fn write_elements<'a, K: AsRef<str>>(
    buf: &mut Vec<u8>,
    elements: impl Iterator<Item = (K, &'a Bson)>,
) {
    let start = buf.len();
    buf.extend_from_slice(&[0, 0, 0, 0]);
    for (key, value) in elements {
        buf.push(value.element_type());
        buf.extend_from_slice(key.as_ref().as_bytes());
        buf.push(0);
        write_value(buf, value);
    }
    buf.push(0);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&((s.len() + 1) as i32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn write_value(buf: &mut Vec<u8>, value: &Bson) {
    match value {
        Bson::Double(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Bson::String(s) => write_string(buf, s),
        Bson::Document(d) => write_document(buf, d),
        Bson::Array(items) => write_elements(
            buf,
            items.iter().enumerate().map(|(i, v)| (i.to_string(), v)),
        ),
        Bson::Binary(b) => {
            buf.extend_from_slice(&(b.bytes.len() as i32).to_le_bytes());
            buf.push(b.subtype);
            buf.extend_from_slice(&b.bytes);
        }
        Bson::ObjectId(oid) => buf.extend_from_slice(&oid.bytes()),
        Bson::Boolean(b) => buf.push(u8::from(*b)),
        Bson::DateTime(ms) => buf.extend_from_slice(&ms.to_le_bytes()),
        Bson::Null => {}
        Bson::RegularExpression(re) => {
            buf.extend_from_slice(re.pattern.as_bytes());
            buf.push(0);
            buf.extend_from_slice(re.options.as_bytes());
            buf.push(0);
        }
        Bson::Int32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Bson::Timestamp(ts) => {
            buf.extend_from_slice(&ts.increment.to_le_bytes());
            buf.extend_from_slice(&ts.time.to_le_bytes());
        }
        Bson::Int64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Bson::Decimal128(d) => buf.extend_from_slice(&d.bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn sample() -> Document {
        doc! {
            "_id": ObjectId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]),
            "double": 1.5,
            "negzero": -0.0,
            "string": "héllo",
            "nested": doc! { "a": 1, "b": doc! { "c": Bson::Null } },
            "array": vec![Bson::Int32(1), Bson::String("two".into()), Bson::Array(vec![])],
            "binary": Bson::Binary(Binary { subtype: 0x04, bytes: vec![0xde, 0xad] }),
            "old_binary": Bson::Binary(Binary { subtype: 0x02, bytes: vec![2, 0, 0, 0, 7, 8] }),
            "bool": true,
            "date": Bson::DateTime(1_700_000_000_000),
            "regex": Bson::RegularExpression(Regex { pattern: "^a.*".into(), options: "i".into() }),
            "int64": Bson::Int64(-5),
            "ts": Bson::Timestamp(Timestamp { time: 10, increment: 3 }),
            "decimal": Bson::Decimal128("1.25".parse::<Decimal128>().unwrap()),
        }
    }

    #[test]
    fn test_round_trip_is_exact() {
        let doc = sample();
        let bytes = encode_document(&doc);
        let decoded = decode_document(&bytes).unwrap();
        assert_eq!(decoded, doc);
        assert_eq!(encode_document(&decoded), bytes);
    }

    #[test]
    fn test_empty_document_encoding() {
        assert_eq!(encode_document(&Document::new()), vec![5, 0, 0, 0, 0]);
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let mut bytes = encode_document(&doc! { "a": 1 });
        bytes[0] += 1;
        assert!(decode_document(&bytes).is_err());

        let mut bytes = encode_document(&doc! { "a": 1 });
        bytes.push(0);
        assert!(decode_document(&bytes).is_err());
    }

    #[test]
    fn test_rejects_unknown_type_tag() {
        let mut bytes = encode_document(&doc! { "a": 1 });
        bytes[4] = 0x42;
        let err = decode_document(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported element type"));
    }

    #[test]
    fn test_rejects_bad_boolean() {
        let mut bytes = encode_document(&doc! { "b": true });
        let pos = bytes.len() - 2;
        bytes[pos] = 2;
        assert!(decode_document(&bytes).is_err());
    }

    #[test]
    fn test_rejects_unterminated_string() {
        let mut bytes = encode_document(&doc! { "s": "abc" });
        // Overwrite the string's trailing NUL.
        let pos = bytes.len() - 2;
        bytes[pos] = b'x';
        assert!(decode_document(&bytes).is_err());
    }

    #[test]
    fn test_rejects_out_of_order_array_keys() {
        let mut bytes = encode_document(&doc! { "a": vec![Bson::Int32(1)] });
        // Element key "0" inside the array.
        let key = bytes.iter().rposition(|b| *b == b'0').unwrap();
        bytes[key] = b'1';
        assert!(decode_document(&bytes).is_err());
    }

    #[test]
    fn test_rejects_excessive_depth() {
        let mut doc = doc! { "leaf": 1 };
        for _ in 0..(MAX_DEPTH + 1) {
            doc = doc! { "x": doc };
        }
        let bytes = encode_document(&doc);
        assert!(decode_document(&bytes).is_err());
    }

    #[test]
    fn test_truncated_input_never_panics() {
        let bytes = encode_document(&sample());
        for len in 0..bytes.len() {
            assert!(decode_document(&bytes[..len]).is_err());
        }
    }

    #[test]
    fn test_read_document_reports_consumed_bytes() {
        let mut bytes = encode_document(&doc! { "a": 1 });
        let first_len = bytes.len();
        bytes.extend_from_slice(&encode_document(&doc! { "b": 2 }));
        let (doc, used) = read_document(&bytes).unwrap();
        assert_eq!(used, first_len);
        assert_eq!(doc.get("a"), Some(&Bson::Int32(1)));
    }
}
