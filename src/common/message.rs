//! Node protocol: messages, responses and framing
//!
//! Frame format: [LEN u32 BE][CRC32 u32 BE][BINCODE BODY]
//!
//! Stream payloads are a flat sequence of records:
//! [KEY_LEN u32 BE][KEY][VALUE_LEN u32 BE][VALUE]...

use crate::common::{crc32, Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Largest frame body accepted on either side of a connection
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Sentinel separating buffered time-series values
pub const DELIMITER: &[u8] = b"@@@";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    Read,
    Write,
    Delete,
    DeleteColFam,
    TsWrite,
    Stream,
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Read => write!(f, "READ"),
            Op::Write => write!(f, "WRITE"),
            Op::Delete => write!(f, "DELETE"),
            Op::DeleteColFam => write!(f, "DELETE_COLFAM"),
            Op::TsWrite => write!(f, "TS_WRITE"),
            Op::Stream => write!(f, "STREAM"),
        }
    }
}

/// Request sent from the coordinator to a storage node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub op: Op,
    pub col_fam: Vec<u8>,
    pub key: Option<Vec<u8>>,
    /// Value for writes, start offset for streams
    pub value: Option<Vec<u8>>,
}

impl Message {
    /// Build a message with a fresh correlation id.
    pub fn new(op: Op, col_fam: &[u8], key: Option<&[u8]>, value: Option<&[u8]>) -> Self {
        Self {
            id: Uuid::new_v4(),
            op,
            col_fam: col_fam.to_vec(),
            key: key.map(<[u8]>::to_vec),
            value: value.map(<[u8]>::to_vec),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    NotFound,
    Error,
}

/// Reply from a storage node, matched to its request by `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: Uuid,
    pub status: Status,
    pub payload: Option<Vec<u8>>,
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: Uuid, payload: Option<Vec<u8>>) -> Self {
        Self {
            id,
            status: Status::Ok,
            payload,
            error: None,
        }
    }

    pub fn not_found(id: Uuid) -> Self {
        Self {
            id,
            status: Status::NotFound,
            payload: None,
            error: None,
        }
    }

    pub fn error(id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            id,
            status: Status::Error,
            payload: None,
            error: Some(reason.into()),
        }
    }

    /// A node answered the question, even if the answer is "absent".
    pub fn is_resolved(&self) -> bool {
        !matches!(self.status, Status::Error)
    }
}

/// Encode a value into a complete frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(value)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32(&body).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(value)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 8];
    match reader.read_exact(&mut header[..4]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    reader.read_exact(&mut header[4..]).await?;

    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let expected = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let actual = crc32(&body);
    if actual != expected {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    Ok(Some(bincode::deserialize(&body)?))
}

/// One (key, value) pair from a column family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
}

impl Record {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

pub fn encode_records<'a, I>(records: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let mut buf = BytesMut::new();
    for (key, value) in records {
        buf.put_u32(key.len() as u32);
        buf.put_slice(key);
        buf.put_u32(value.len() as u32);
        buf.put_slice(value);
    }
    buf.to_vec()
}

/// Ordered, finite sequence of records decoded lazily from one stream reply.
///
/// The sequence is consumed once; iterating does not restart it.
#[derive(Debug, Default)]
pub struct RecordStream {
    buf: Bytes,
    corrupted: bool,
}

impl RecordStream {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            buf: payload.into(),
            corrupted: false,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Bytes not yet decoded
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// True if iteration stopped on a truncated record.
    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    fn take_field(&mut self) -> Option<Bytes> {
        if self.buf.remaining() < 4 {
            return None;
        }
        let len =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if self.buf.remaining() < 4 + len {
            return None;
        }
        self.buf.advance(4);
        Some(self.buf.split_to(len))
    }
}

impl Iterator for RecordStream {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        if self.buf.is_empty() {
            return None;
        }
        match (self.take_field(), self.take_field()) {
            (Some(key), Some(value)) => Some(Record { key, value }),
            _ => {
                tracing::warn!(
                    "Truncated stream payload, dropping {} trailing bytes",
                    self.buf.len()
                );
                self.corrupted = true;
                self.buf.clear();
                None
            }
        }
    }
}

/// Split a delimited time-series blob into its non-empty values.
pub fn split_delimited(blob: &[u8]) -> Vec<&[u8]> {
    let mut values = Vec::new();
    let mut rest = blob;
    while let Some(pos) = find(rest, DELIMITER) {
        if pos > 0 {
            values.push(&rest[..pos]);
        }
        rest = &rest[pos + DELIMITER.len()..];
    }
    if !rest.is_empty() {
        values.push(rest);
    }
    values
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip_over_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let msg = Message::new(Op::Write, b"cf", Some(b"k1"), Some(b"v1"));

        write_frame(&mut client, &msg).await.unwrap();
        drop(client);

        let decoded: Message = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(decoded, msg);
        let eof: Option<Message> = read_frame(&mut server).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        let msg = Response::ok(Uuid::new_v4(), Some(b"value".to_vec()));
        let mut frame = encode_frame(&msg).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let mut reader = &frame[..];
        let result: Result<Option<Response>> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());

        let mut reader = &frame[..];
        let result: Result<Option<Message>> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(Error::FrameTooLarge { .. })));
    }

    #[test]
    fn test_record_stream_is_lazy_and_ordered() {
        let payload = encode_records(vec![
            (&b"a"[..], &b"1"[..]),
            (&b"b"[..], &b""[..]),
            (&b"c"[..], &b"333"[..]),
        ]);
        let total = payload.len();
        let mut stream = RecordStream::new(payload);
        assert_eq!(stream.remaining(), total);

        let first = stream.next().unwrap();
        assert_eq!(first, Record::new(&b"a"[..], &b"1"[..]));
        assert!(stream.remaining() < total);

        let rest: Vec<_> = stream.by_ref().collect();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].value, Bytes::from_static(b"333"));
        assert!(stream.next().is_none());
        assert!(!stream.is_corrupted());
    }

    #[test]
    fn test_record_stream_truncated() {
        let mut payload = encode_records(vec![(&b"a"[..], &b"1"[..])]);
        payload.extend_from_slice(&[0, 0, 0, 9, b'x']);
        let mut stream = RecordStream::new(payload);
        assert!(stream.next().is_some());
        assert!(stream.next().is_none());
        assert!(stream.is_corrupted());
    }

    #[test]
    fn test_split_delimited() {
        assert_eq!(
            split_delimited(b"one@@@two@@@three@@@"),
            vec![&b"one"[..], &b"two"[..], &b"three"[..]]
        );
        assert_eq!(split_delimited(b"solo"), vec![&b"solo"[..]]);
        assert!(split_delimited(b"@@@@@@").is_empty());
    }
}
