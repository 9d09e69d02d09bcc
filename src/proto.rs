//! Byte-level helpers for raw HTTP/1.x payloads
//!
//! Captured messages travel through the pipeline as raw wire bytes. These
//! helpers slice the interesting pieces (method, path, status, headers, body)
//! without a full parse, and splice edits back into a fresh buffer.

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Request method: the first token of the start line.
pub fn method(req: &[u8]) -> &[u8] {
    first_line_token(req, 0)
}

/// Request path: the second token of the start line.
pub fn path(req: &[u8]) -> &[u8] {
    first_line_token(req, 1)
}

/// Response status line, without the trailing CRLF.
pub fn status_line(resp: &[u8]) -> &[u8] {
    match find(resp, CRLF) {
        Some(end) => &resp[..end],
        None => resp,
    }
}

/// Response status code token, e.g. `b"503"`.
pub fn status(resp: &[u8]) -> &[u8] {
    first_line_token(resp, 1)
}

/// Everything past the blank line terminating the header block.
///
/// Returns an empty slice when the message has no body (or no header
/// terminator at all).
pub fn body(msg: &[u8]) -> &[u8] {
    match find(msg, HEADER_END) {
        Some(pos) => &msg[pos + HEADER_END.len()..],
        None => &[],
    }
}

/// Look up a header value by case-insensitive name.
pub fn header<'a>(msg: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let head_end = find(msg, HEADER_END).unwrap_or(msg.len());
    let mut pos = find(msg, CRLF)? + CRLF.len();

    while pos < head_end {
        let line_end = find(&msg[pos..], CRLF).map(|e| pos + e).unwrap_or(head_end);
        let line = &msg[pos..line_end];
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            if line[..colon].eq_ignore_ascii_case(name.as_bytes()) {
                let mut value = &line[colon + 1..];
                while value.first() == Some(&b' ') {
                    value = &value[1..];
                }
                return Some(value);
            }
        }
        pos = line_end + CRLF.len();
    }
    None
}

/// Set or replace a header, returning a new buffer.
///
/// An existing header with the same name (case-insensitive) is replaced in
/// place; otherwise the header is inserted right after the start line.
pub fn set_header(msg: &[u8], name: &str, value: &str) -> Vec<u8> {
    let head_end = find(msg, HEADER_END).unwrap_or(msg.len());
    let start_line_end = match find(msg, CRLF) {
        Some(e) => e + CRLF.len(),
        None => return msg.to_vec(),
    };

    let mut pos = start_line_end;
    while pos < head_end {
        let line_end = find(&msg[pos..], CRLF).map(|e| pos + e).unwrap_or(head_end);
        let line = &msg[pos..line_end];
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            if line[..colon].eq_ignore_ascii_case(name.as_bytes()) {
                let mut out = Vec::with_capacity(msg.len() + value.len());
                out.extend_from_slice(&msg[..pos]);
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(&msg[line_end..]);
                return out;
            }
        }
        pos = line_end + CRLF.len();
    }

    let mut out = Vec::with_capacity(msg.len() + name.len() + value.len() + 4);
    out.extend_from_slice(&msg[..start_line_end]);
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(CRLF);
    out.extend_from_slice(&msg[start_line_end..]);
    out
}

/// Replace the request path, returning a new buffer.
pub fn set_path(req: &[u8], new_path: &[u8]) -> Vec<u8> {
    let line_end = find(req, CRLF).unwrap_or(req.len());
    let start = match req[..line_end].iter().position(|&b| b == b' ') {
        Some(sp) => sp + 1,
        None => return req.to_vec(),
    };
    let old_len = req[start..line_end]
        .iter()
        .position(|&b| b == b' ')
        .unwrap_or(line_end - start);

    let mut out = Vec::with_capacity(req.len() - old_len + new_path.len());
    out.extend_from_slice(&req[..start]);
    out.extend_from_slice(new_path);
    out.extend_from_slice(&req[start + old_len..]);
    out
}

/// Set a query parameter on the request path, overwriting an existing value.
pub fn set_query_param(req: &[u8], key: &str, value: &str) -> Vec<u8> {
    let old_path = path(req);
    if old_path.is_empty() {
        return req.to_vec();
    }

    let path_str = String::from_utf8_lossy(old_path).into_owned();
    let (base, query) = match path_str.split_once('?') {
        Some((b, q)) => (b.to_string(), q.to_string()),
        None => (path_str.clone(), String::new()),
    };

    let mut params: Vec<(String, String)> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (p.to_string(), String::new()),
        })
        .collect();

    match params.iter_mut().find(|(k, _)| k == key) {
        Some(entry) => entry.1 = value.to_string(),
        None => params.push((key.to_string(), value.to_string())),
    }

    let rebuilt = format!(
        "{}?{}",
        base,
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    );
    set_path(req, rebuilt.as_bytes())
}

fn first_line_token(msg: &[u8], index: usize) -> &[u8] {
    let line_end = find(msg, CRLF).unwrap_or(msg.len());
    let mut tokens = msg[..line_end].split(|&b| b == b' ').filter(|t| !t.is_empty());
    tokens.nth(index).unwrap_or(&[])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQ: &[u8] = b"GET /users?id=7 HTTP/1.1\r\nHost: api.example.com\r\nAccept: */*\r\n\r\n";
    const RESP: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\n\r\nBUSY";

    #[test]
    fn test_method_and_path() {
        assert_eq!(method(REQ), b"GET");
        assert_eq!(path(REQ), b"/users?id=7");
    }

    #[test]
    fn test_status() {
        assert_eq!(status(RESP), b"503");
        assert_eq!(status_line(RESP), b"HTTP/1.1 503 Service Unavailable");
    }

    #[test]
    fn test_body() {
        assert_eq!(body(RESP), b"BUSY");
        assert_eq!(body(REQ), b"");
        assert_eq!(body(b"garbage without header end"), b"");
    }

    #[test]
    fn test_body_may_contain_crlf() {
        let resp = b"HTTP/1.1 200 OK\r\n\r\nline one\r\n\r\nline two";
        assert_eq!(body(resp), b"line one\r\n\r\nline two");
    }

    #[test]
    fn test_header_lookup() {
        assert_eq!(header(REQ, "Host"), Some(&b"api.example.com"[..]));
        assert_eq!(header(REQ, "host"), Some(&b"api.example.com"[..]));
        assert_eq!(header(REQ, "X-Missing"), None);
    }

    #[test]
    fn test_set_header_replaces() {
        let out = set_header(REQ, "Host", "staging.example.com");
        assert_eq!(header(&out, "Host"), Some(&b"staging.example.com"[..]));
        assert_eq!(method(&out), b"GET");
    }

    #[test]
    fn test_set_header_inserts() {
        let out = set_header(REQ, "User-Agent", "refract");
        assert_eq!(header(&out, "User-Agent"), Some(&b"refract"[..]));
        // Existing headers survive the splice
        assert_eq!(header(&out, "Host"), Some(&b"api.example.com"[..]));
    }

    #[test]
    fn test_set_path() {
        let out = set_path(REQ, b"/v2/users");
        assert_eq!(path(&out), b"/v2/users");
    }

    #[test]
    fn test_set_query_param_overwrites() {
        let out = set_query_param(REQ, "id", "42");
        assert_eq!(path(&out), b"/users?id=42");
    }

    #[test]
    fn test_set_query_param_appends() {
        let out = set_query_param(REQ, "api_key", "k");
        assert_eq!(path(&out), b"/users?id=7&api_key=k");
    }
}
