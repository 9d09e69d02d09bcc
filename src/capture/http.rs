//! HTTP/1.x message framing over reassembled streams
//!
//! Pulls one complete request or response off a growing byte buffer. The
//! parser only ever sees one side of the connection, so body length must be
//! inferred from the message's own headers: Content-Length, chunked
//! transfer coding, bodiless status codes, or (for responses) end of stream.

use crate::error::{RefractError, Result};

/// Cap on the header block; a stream that exceeds it without producing a
/// complete head is treated as unparseable.
const MAX_HEADER_BYTES: usize = 64 * 1024;

const MAX_HEADERS: usize = 64;

/// Outcome of a framing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsed {
    /// A complete message occupies `buf[..consumed]`.
    Complete { consumed: usize },
    /// The buffer holds a valid prefix; feed more bytes and retry.
    NeedMore,
}

/// Frame one HTTP request at the front of `buf`.
pub fn parse_request(buf: &[u8]) -> Result<Parsed> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return partial(buf),
    };

    let framing = body_framing(req.headers)?;
    match framing {
        BodyFraming::Length(len) => complete_at(buf, head_len + len),
        BodyFraming::Chunked => parse_chunked(buf, head_len),
        // A request without Content-Length or chunked coding has no body.
        BodyFraming::Unspecified => Ok(Parsed::Complete { consumed: head_len }),
    }
}

/// Frame one HTTP response at the front of `buf`.
///
/// `eof` marks that the stream has ended: responses that declare no length
/// and are not chunked run to the end of the connection, and can only be
/// completed once EOF is known.
pub fn parse_response(buf: &[u8], eof: bool) -> Result<Parsed> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    let head_len = match resp.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return partial(buf),
    };

    let code = resp
        .code
        .ok_or_else(|| RefractError::HttpParse("response without status code".into()))?;
    if bodiless_status(code) {
        return Ok(Parsed::Complete { consumed: head_len });
    }

    match body_framing(resp.headers)? {
        BodyFraming::Length(len) => complete_at(buf, head_len + len),
        BodyFraming::Chunked => parse_chunked(buf, head_len),
        BodyFraming::Unspecified => {
            if eof {
                Ok(Parsed::Complete { consumed: buf.len() })
            } else {
                Ok(Parsed::NeedMore)
            }
        }
    }
}

enum BodyFraming {
    Length(usize),
    Chunked,
    Unspecified,
}

fn body_framing(headers: &[httparse::Header<'_>]) -> Result<BodyFraming> {
    for h in headers {
        if h.name.eq_ignore_ascii_case("transfer-encoding") {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| RefractError::HttpParse("non-utf8 transfer-encoding".into()))?;
            if value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
            {
                return Ok(BodyFraming::Chunked);
            }
        }
    }
    for h in headers {
        if h.name.eq_ignore_ascii_case("content-length") {
            let len = std::str::from_utf8(h.value)
                .ok()
                .and_then(|s| s.trim().parse::<usize>().ok())
                .ok_or_else(|| RefractError::HttpParse("invalid content-length".into()))?;
            return Ok(BodyFraming::Length(len));
        }
    }
    Ok(BodyFraming::Unspecified)
}

fn bodiless_status(code: u16) -> bool {
    (100..200).contains(&code) || code == 204 || code == 304
}

fn complete_at(buf: &[u8], end: usize) -> Result<Parsed> {
    if buf.len() >= end {
        Ok(Parsed::Complete { consumed: end })
    } else {
        Ok(Parsed::NeedMore)
    }
}

fn partial(buf: &[u8]) -> Result<Parsed> {
    if buf.len() > MAX_HEADER_BYTES {
        Err(RefractError::HttpParse(format!(
            "header block exceeds {} bytes",
            MAX_HEADER_BYTES
        )))
    } else {
        Ok(Parsed::NeedMore)
    }
}

/// Walk the chunked body starting at `offset`, through the terminal 0-size
/// chunk and any trailers, up to and including the final blank line.
fn parse_chunked(buf: &[u8], offset: usize) -> Result<Parsed> {
    let mut pos = offset;
    loop {
        let line_end = match find_crlf(&buf[pos..]) {
            Some(e) => pos + e,
            None => return Ok(Parsed::NeedMore),
        };
        let size_line = &buf[pos..line_end];
        let size_token = size_line
            .split(|&b| b == b';')
            .next()
            .unwrap_or(size_line);
        let size = std::str::from_utf8(size_token)
            .ok()
            .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
            .ok_or_else(|| RefractError::HttpParse("invalid chunk size line".into()))?;

        pos = line_end + 2;

        if size == 0 {
            // Trailers run until a blank line; the common case is none at all.
            loop {
                let trailer_end = match find_crlf(&buf[pos..]) {
                    Some(e) => pos + e,
                    None => return Ok(Parsed::NeedMore),
                };
                let empty = trailer_end == pos;
                pos = trailer_end + 2;
                if empty {
                    return Ok(Parsed::Complete { consumed: pos });
                }
            }
        }

        // Chunk data plus its trailing CRLF
        if buf.len() < pos + size + 2 {
            return Ok(Parsed::NeedMore);
        }
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return Err(RefractError::HttpParse("chunk data missing CRLF".into()));
        }
        pos += size + 2;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
