//! Capture record codec
//!
//! One captured HTTP message is framed as a line-oriented record:
//!
//! ```text
//! <kind><SP><decimal id><SP><decimal timing><LF><payload bytes...>
//! ```
//!
//! The first newline terminates the header; the payload runs to the end of
//! the record and may itself contain newlines and spaces.

use crate::error::{RefractError, Result};

/// Record kind discriminator, one ASCII byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// A captured request; timing is the capture timestamp in nanoseconds.
    Request,
    /// A captured response; timing is the measured RTT in nanoseconds.
    Response,
}

impl RecordKind {
    pub fn as_byte(self) -> u8 {
        match self {
            RecordKind::Request => b'1',
            RecordKind::Response => b'2',
        }
    }

    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'1' => Ok(RecordKind::Request),
            b'2' => Ok(RecordKind::Response),
            other => Err(RefractError::Record(format!(
                "unknown record kind byte 0x{:02x}",
                other
            ))),
        }
    }
}

/// One captured HTTP message with its correlation id and timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedMessage {
    pub kind: RecordKind,
    /// Flow hash + per-connection sequence; identical for a request and its
    /// response.
    pub id: u64,
    /// Nanoseconds: capture timestamp for requests, RTT for responses.
    pub timing: u64,
    /// Raw HTTP bytes including headers and body.
    pub payload: Vec<u8>,
}

impl CapturedMessage {
    /// Serialized length: header + newline + payload.
    pub fn encoded_len(&self) -> usize {
        // kind + SP + id + SP + timing + LF
        1 + 1 + decimal_len(self.id) + 1 + decimal_len(self.timing) + 1 + self.payload.len()
    }

    /// Encode the record into a caller-supplied buffer.
    ///
    /// Returns the number of bytes written, or `None` (writing nothing) when
    /// the buffer is too small to hold the whole record.
    pub fn encode_into(&self, buf: &mut [u8]) -> Option<usize> {
        let total = self.encoded_len();
        if buf.len() < total {
            return None;
        }

        let id = self.id.to_string();
        let timing = self.timing.to_string();

        buf[0] = self.kind.as_byte();
        buf[1] = b' ';

        let mut pos = 2;
        buf[pos..pos + id.len()].copy_from_slice(id.as_bytes());
        pos += id.len();
        buf[pos] = b' ';
        pos += 1;

        buf[pos..pos + timing.len()].copy_from_slice(timing.as_bytes());
        pos += timing.len();
        buf[pos] = b'\n';
        pos += 1;

        buf[pos..pos + self.payload.len()].copy_from_slice(&self.payload);
        Some(total)
    }

    /// Inverse codec: parse a serialized record back into a message.
    pub fn decode(frame: &[u8]) -> Result<CapturedMessage> {
        let header_end = frame
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| RefractError::Record("missing header newline".into()))?;

        let header = &frame[..header_end];
        let mut fields = header.split(|&b| b == b' ');

        let kind_field = fields
            .next()
            .filter(|f| f.len() == 1)
            .ok_or_else(|| RefractError::Record("missing kind field".into()))?;
        let kind = RecordKind::from_byte(kind_field[0])?;

        let id = parse_decimal(fields.next(), "id")?;
        let timing = parse_decimal(fields.next(), "timing")?;

        if fields.next().is_some() {
            return Err(RefractError::Record("trailing header fields".into()));
        }

        Ok(CapturedMessage {
            kind,
            id,
            timing,
            payload: frame[header_end + 1..].to_vec(),
        })
    }
}

fn parse_decimal(field: Option<&[u8]>, name: &str) -> Result<u64> {
    let field = field.ok_or_else(|| RefractError::Record(format!("missing {} field", name)))?;
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RefractError::Record(format!("invalid {} field", name)))
}

fn decimal_len(mut v: u64) -> usize {
    let mut len = 1;
    while v >= 10 {
        v /= 10;
        len += 1;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &CapturedMessage) -> CapturedMessage {
        let mut buf = vec![0u8; msg.encoded_len()];
        let n = msg.encode_into(&mut buf).unwrap();
        assert_eq!(n, msg.encoded_len());
        CapturedMessage::decode(&buf[..n]).unwrap()
    }

    #[test]
    fn test_encode_layout() {
        let msg = CapturedMessage {
            kind: RecordKind::Request,
            id: 42,
            timing: 1234567890,
            payload: b"GET / HTTP/1.1\r\n\r\n".to_vec(),
        };
        let mut buf = vec![0u8; 128];
        let n = msg.encode_into(&mut buf).unwrap();
        assert!(buf[..n].starts_with(b"1 42 1234567890\n"));
        assert!(buf[..n].ends_with(b"GET / HTTP/1.1\r\n\r\n"));
    }

    #[test]
    fn test_roundtrip_plain() {
        let msg = CapturedMessage {
            kind: RecordKind::Response,
            id: u64::MAX,
            timing: 5_000_000,
            payload: b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec(),
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_roundtrip_payload_with_lf_and_sp() {
        let msg = CapturedMessage {
            kind: RecordKind::Request,
            id: 7,
            timing: 0,
            payload: b"POST /x HTTP/1.1\r\n\r\nline one\nline two\n 3 4 5\n".to_vec(),
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_roundtrip_binary_payload() {
        let msg = CapturedMessage {
            kind: RecordKind::Request,
            id: 9000,
            timing: 17,
            payload: (0u8..=255).collect(),
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_encode_rejects_short_buffer() {
        let msg = CapturedMessage {
            kind: RecordKind::Request,
            id: 1,
            timing: 1,
            payload: vec![0u8; 64],
        };
        let mut buf = vec![0u8; 16];
        assert!(msg.encode_into(&mut buf).is_none());
        // nothing written
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(CapturedMessage::decode(b"no newline here").is_err());
        assert!(CapturedMessage::decode(b"3 1 1\npayload").is_err());
        assert!(CapturedMessage::decode(b"1 abc 1\npayload").is_err());
        assert!(CapturedMessage::decode(b"1 1\npayload").is_err());
    }
}
