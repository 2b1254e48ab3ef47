//! `OP_MSG`, `OP_QUERY` and `OP_REPLY` bodies.

use super::frame::{encode_frame, Frame, OpCode};
use super::{malformed, WireError, WireResult};
use crate::bson::codec::{read_document, write_document};
use crate::bson::Document;

pub mod flags {
    pub const CHECKSUM_PRESENT: u32 = 1;
    pub const MORE_TO_COME: u32 = 1 << 1;
    pub const EXHAUST_ALLOWED: u32 = 1 << 16;

    /// Low 16 bits must be understood by the receiver.
    pub const REQUIRED_MASK: u32 = 0xffff;
    pub const KNOWN_REQUIRED: u32 = CHECKSUM_PRESENT | MORE_TO_COME;

    /// `OP_REPLY` response flag.
    pub const QUERY_FAILURE: i32 = 1 << 1;
}

/// A kind-1 section: documents sent next to the body, e.g. a bulk insert.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpMsg {
    pub flags: u32,
    pub body: Document,
    pub sequences: Vec<DocumentSequence>,
}

impl OpMsg {
    pub fn new(body: Document) -> Self {
        Self {
            flags: 0,
            body,
            sequences: Vec::new(),
        }
    }

    pub fn more_to_come(&self) -> bool {
        self.flags & flags::MORE_TO_COME != 0
    }

    pub fn sequence(&self, identifier: &str) -> Option<&DocumentSequence> {
        self.sequences.iter().find(|s| s.identifier == identifier)
    }

    pub fn parse(payload: &[u8]) -> WireResult<Self> {
        if payload.len() < 5 {
            return Err(malformed("OP_MSG too short"));
        }
        let flags = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        if flags & flags::REQUIRED_MASK & !flags::KNOWN_REQUIRED != 0 {
            return Err(WireError::UnsupportedFlags(flags));
        }
        let mut end = payload.len();
        if flags & flags::CHECKSUM_PRESENT != 0 {
            if end < 9 {
                return Err(malformed("OP_MSG checksum missing"));
            }
            end -= 4;
        }

        let mut body = None;
        let mut sequences = Vec::new();
        let mut pos = 4;
        while pos < end {
            let kind = payload[pos];
            pos += 1;
            match kind {
                0 => {
                    let (doc, used) = read_document(&payload[pos..end])?;
                    if body.replace(doc).is_some() {
                        return Err(malformed("OP_MSG has more than one body section"));
                    }
                    pos += used;
                }
                1 => {
                    let (seq, used) = parse_sequence(&payload[pos..end])?;
                    sequences.push(seq);
                    pos += used;
                }
                other => return Err(malformed(format!("unknown OP_MSG section kind {}", other))),
            }
        }

        let body = body.ok_or_else(|| malformed("OP_MSG has no body section"))?;
        Ok(Self {
            flags,
            body,
            sequences,
        })
    }

    /// Section bytes without a frame header.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.flags & !flags::CHECKSUM_PRESENT).to_le_bytes());
        buf.push(0);
        write_document(&mut buf, &self.body);
        for seq in &self.sequences {
            buf.push(1);
            let start = buf.len();
            buf.extend_from_slice(&[0; 4]);
            buf.extend_from_slice(seq.identifier.as_bytes());
            buf.push(0);
            for doc in &seq.documents {
                write_document(&mut buf, doc);
            }
            let size = (buf.len() - start) as i32;
            buf[start..start + 4].copy_from_slice(&size.to_le_bytes());
        }
        buf
    }

    pub fn encode(&self, request_id: i32, response_to: i32) -> Vec<u8> {
        encode_frame(request_id, response_to, OpCode::Msg, &self.encode_payload())
    }
}

fn parse_sequence(bytes: &[u8]) -> WireResult<(DocumentSequence, usize)> {
    if bytes.len() < 4 {
        return Err(malformed("document sequence size missing"));
    }
    let size = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if size < 5 || size as usize > bytes.len() {
        return Err(malformed(format!("bad document sequence size {}", size)));
    }
    let section = &bytes[..size as usize];
    let (identifier, used) = read_cstring(&section[4..])?;
    let mut pos = 4 + used;
    let mut documents = Vec::new();
    while pos < section.len() {
        let (doc, used) = read_document(&section[pos..])?;
        documents.push(doc);
        pos += used;
    }
    Ok((
        DocumentSequence {
            identifier,
            documents,
        },
        size as usize,
    ))
}

fn read_cstring(bytes: &[u8]) -> WireResult<(String, usize)> {
    let nul = bytes
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| malformed("unterminated string"))?;
    let s = std::str::from_utf8(&bytes[..nul]).map_err(|_| malformed("string is not UTF-8"))?;
    Ok((s.to_string(), nul + 1))
}

fn read_i32(bytes: &[u8], pos: usize) -> WireResult<i32> {
    bytes
        .get(pos..pos + 4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| malformed("message truncated"))
}

/// Legacy query, used by drivers for the initial handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct OpQuery {
    pub flags: i32,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub return_fields: Option<Document>,
}

impl OpQuery {
    pub fn parse(payload: &[u8]) -> WireResult<Self> {
        let flags = read_i32(payload, 0)?;
        let (full_collection_name, used) = read_cstring(payload.get(4..).unwrap_or_default())?;
        let mut pos = 4 + used;
        let number_to_skip = read_i32(payload, pos)?;
        let number_to_return = read_i32(payload, pos + 4)?;
        pos += 8;
        let (query, used) = read_document(payload.get(pos..).unwrap_or_default())?;
        pos += used;
        let return_fields = if pos < payload.len() {
            let (fields, used) = read_document(&payload[pos..])?;
            pos += used;
            Some(fields)
        } else {
            None
        };
        if pos != payload.len() {
            return Err(malformed("trailing bytes after OP_QUERY"));
        }
        Ok(Self {
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
            return_fields,
        })
    }

    pub fn encode(&self, request_id: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(self.full_collection_name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&self.number_to_skip.to_le_bytes());
        buf.extend_from_slice(&self.number_to_return.to_le_bytes());
        write_document(&mut buf, &self.query);
        if let Some(fields) = &self.return_fields {
            write_document(&mut buf, fields);
        }
        encode_frame(request_id, 0, OpCode::Query, &buf)
    }

    /// Database of a `<db>.$cmd` query.
    pub fn command_database(&self) -> Option<&str> {
        self.full_collection_name.strip_suffix(".$cmd")
    }

    /// The command document, with a `$query` wrapper removed.
    pub fn command(&self) -> Document {
        match self.query.get_document("$query") {
            Some(inner) => inner.clone(),
            None => self.query.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpReply {
    pub response_flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl OpReply {
    pub fn single(doc: Document) -> Self {
        Self {
            response_flags: 0,
            cursor_id: 0,
            starting_from: 0,
            documents: vec![doc],
        }
    }

    pub fn failure(doc: Document) -> Self {
        Self {
            response_flags: flags::QUERY_FAILURE,
            ..Self::single(doc)
        }
    }

    pub fn encode(&self, request_id: i32, response_to: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.response_flags.to_le_bytes());
        buf.extend_from_slice(&self.cursor_id.to_le_bytes());
        buf.extend_from_slice(&self.starting_from.to_le_bytes());
        buf.extend_from_slice(&(self.documents.len() as i32).to_le_bytes());
        for doc in &self.documents {
            write_document(&mut buf, doc);
        }
        encode_frame(request_id, response_to, OpCode::Reply, &buf)
    }

    pub fn parse(payload: &[u8]) -> WireResult<Self> {
        let response_flags = read_i32(payload, 0)?;
        let cursor_id = payload
            .get(4..12)
            .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .ok_or_else(|| malformed("message truncated"))?;
        let starting_from = read_i32(payload, 12)?;
        let count = read_i32(payload, 16)?;
        let mut pos = 20;
        let mut documents = Vec::new();
        for _ in 0..count.max(0) {
            let (doc, used) = read_document(payload.get(pos..).unwrap_or_default())?;
            documents.push(doc);
            pos += used;
        }
        Ok(Self {
            response_flags,
            cursor_id,
            starting_from,
            documents,
        })
    }
}

/// A decoded client request.
#[derive(Debug, Clone)]
pub enum Request {
    Msg(OpMsg),
    Query(OpQuery),
}

impl Request {
    pub fn decode(frame: &Frame) -> WireResult<Self> {
        match frame.header.op_code {
            OpCode::Msg => Ok(Request::Msg(OpMsg::parse(&frame.payload)?)),
            OpCode::Query => Ok(Request::Query(OpQuery::parse(&frame.payload)?)),
            OpCode::Reply => Err(WireError::UnsupportedOpCode(OpCode::Reply.code())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::encode_document;
    use crate::doc;

    #[test]
    fn test_op_msg_with_sequence() {
        let mut msg = OpMsg::new(doc! { "insert": "values", "$db": "test" });
        msg.sequences.push(DocumentSequence {
            identifier: "documents".into(),
            documents: vec![doc! { "_id": 1 }, doc! { "_id": 2 }],
        });
        let parsed = OpMsg::parse(&msg.encode_payload()).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.sequence("documents").map(|s| s.documents.len()), Some(2));
        assert!(!parsed.more_to_come());
    }

    #[test]
    fn test_op_msg_checksum_is_stripped() {
        let mut payload = OpMsg::new(doc! { "ping": 1 }).encode_payload();
        payload[0] |= flags::CHECKSUM_PRESENT as u8;
        payload.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let parsed = OpMsg::parse(&payload).unwrap();
        assert_eq!(parsed.body, doc! { "ping": 1 });
    }

    #[test]
    fn test_op_msg_rejects_unknown_required_flag() {
        let mut payload = OpMsg::new(doc! { "ping": 1 }).encode_payload();
        payload[0] |= 1 << 3;
        assert!(matches!(
            OpMsg::parse(&payload),
            Err(WireError::UnsupportedFlags(_))
        ));

        // Optional bits are ignored.
        let mut payload = OpMsg::new(doc! { "ping": 1 }).encode_payload();
        payload[2] |= 1;
        assert!(OpMsg::parse(&payload).is_ok());
    }

    #[test]
    fn test_op_msg_requires_one_body() {
        let mut payload = 0u32.to_le_bytes().to_vec();
        assert!(OpMsg::parse(&payload).is_err());

        for _ in 0..2 {
            payload.push(0);
            payload.extend_from_slice(&encode_document(&doc! { "a": 1 }));
        }
        assert!(OpMsg::parse(&payload).is_err());
    }

    #[test]
    fn test_op_msg_rejects_bad_sequence_size() {
        let mut payload = OpMsg::new(doc! { "insert": "v" }).encode_payload();
        payload.push(1);
        payload.extend_from_slice(&100i32.to_le_bytes());
        payload.extend_from_slice(b"documents\0");
        assert!(OpMsg::parse(&payload).is_err());
    }

    #[test]
    fn test_op_query_command() {
        let query = OpQuery {
            flags: 0,
            full_collection_name: "admin.$cmd".into(),
            number_to_skip: 0,
            number_to_return: -1,
            query: doc! { "$query": doc! { "isMaster": 1 } },
            return_fields: None,
        };
        let bytes = query.encode(3);
        let parsed = OpQuery::parse(&bytes[16..]).unwrap();
        assert_eq!(parsed, query);
        assert_eq!(parsed.command_database(), Some("admin"));
        assert_eq!(parsed.command(), doc! { "isMaster": 1 });
    }

    #[test]
    fn test_op_reply_encoding() {
        let reply = OpReply::failure(doc! { "ok": 0.0 });
        let bytes = reply.encode(9, 3);
        assert_eq!(i32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 3);
        let parsed = OpReply::parse(&bytes[16..]).unwrap();
        assert_eq!(parsed, reply);
        assert_eq!(parsed.response_flags & flags::QUERY_FAILURE, flags::QUERY_FAILURE);
    }
}
