//! Length-prefixed framing.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{WireError, WireResult};

pub const HEADER_LEN: usize = 16;
pub const DEFAULT_MIN_MESSAGE_SIZE: usize = HEADER_LEN;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Reply,
    Query,
    Msg,
}

impl OpCode {
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            1 => Some(OpCode::Reply),
            2004 => Some(OpCode::Query),
            2013 => Some(OpCode::Msg),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Query => 2004,
            OpCode::Msg => 2013,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Reply => "OP_REPLY",
            OpCode::Query => "OP_QUERY",
            OpCode::Msg => "OP_MSG",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

/// Accepted total message sizes, header included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub min: usize,
    pub max: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_MESSAGE_SIZE,
            max: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Reads one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, limits: FrameLimits) -> WireResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = i32::from_le_bytes(len_buf);
    let min = limits.min.max(HEADER_LEN);
    if len < 0 || (len as usize) < min || (len as usize) > limits.max {
        return Err(WireError::BadLength {
            len: len as i64,
            min,
            max: limits.max,
        });
    }

    let mut rest = [0u8; HEADER_LEN - 4];
    reader.read_exact(&mut rest).await?;
    let field = |i: usize| i32::from_le_bytes([rest[i], rest[i + 1], rest[i + 2], rest[i + 3]]);
    let code = field(8);
    let op_code = OpCode::from_i32(code).ok_or(WireError::UnsupportedOpCode(code))?;
    let header = Header {
        message_length: len,
        request_id: field(0),
        response_to: field(4),
        op_code,
    };

    let mut payload = vec![0u8; len as usize - HEADER_LEN];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame { header, payload }))
}

/// Prefixes `payload` with a header.
pub fn encode_frame(request_id: i32, response_to: i32, op_code: OpCode, payload: &[u8]) -> Vec<u8> {
    let len = (HEADER_LEN + payload.len()) as i32;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&request_id.to_le_bytes());
    buf.extend_from_slice(&response_to.to_le_bytes());
    buf.extend_from_slice(&op_code.code().to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_frame() {
        let bytes = encode_frame(7, 0, OpCode::Msg, &[1, 2, 3]);
        let mut reader = &bytes[..];
        let frame = read_frame(&mut reader, FrameLimits::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.header.request_id, 7);
        assert_eq!(frame.header.op_code, OpCode::Msg);
        assert_eq!(frame.header.message_length, 19);
        assert_eq!(frame.payload, vec![1, 2, 3]);

        assert!(read_frame(&mut reader, FrameLimits::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_lengths() {
        let mut short = encode_frame(1, 0, OpCode::Msg, &[]);
        short[0] = 8;
        let err = read_frame(&mut &short[..], FrameLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::BadLength { len: 8, .. }));

        let bytes = encode_frame(1, 0, OpCode::Msg, &[0; 64]);
        let limits = FrameLimits { min: 16, max: 32 };
        let err = read_frame(&mut &bytes[..], limits).await.unwrap_err();
        assert!(matches!(err, WireError::BadLength { .. }));

        let mut negative = bytes.clone();
        negative[..4].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(read_frame(&mut &negative[..], FrameLimits::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_rejects_unknown_opcode() {
        let mut bytes = encode_frame(1, 0, OpCode::Msg, &[0; 4]);
        bytes[12..16].copy_from_slice(&2012i32.to_le_bytes());
        let err = read_frame(&mut &bytes[..], FrameLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::UnsupportedOpCode(2012)));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_error() {
        let bytes = encode_frame(1, 0, OpCode::Msg, &[0; 10]);
        let err = read_frame(&mut &bytes[..20], FrameLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
    }
}
