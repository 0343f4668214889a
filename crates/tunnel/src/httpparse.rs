//! Incremental HTTP/1.1 request parser for the decrypted tunnel stream.
//!
//! The parser accepts bytes in arbitrary splits and yields a complete
//! request once the head and body (Content-Length or chunked) have fully
//! arrived. Malformed input is an error; the dispatcher drops the
//! connection rather than guessing.

use claudish_core::error::ProxyError;

/// Upper bound on the request head; beyond this the connection is broken.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound on a buffered request body.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    /// Headers in on-wire order, names as received.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// The entire on-wire form of this request.
    pub raw: Vec<u8>,
}

impl ParsedRequest {
    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host").map(|h| h.split(':').next().unwrap_or(h))
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }

    /// Path without the query string.
    pub fn path_only(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }

    pub fn query(&self) -> Option<&str> {
        self.path.split_once('?').map(|(_, q)| q)
    }

    /// Re-serialize for upstream transmission.
    ///
    /// Removed headers are matched case-insensitively; `Content-Length`
    /// is recomputed from the reassembled body (which also replaces any
    /// chunked encoding the client used), then `add` headers are
    /// appended.
    pub fn serialize(&self, remove: &[&str], add: &[(&str, &str)]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.raw.len());
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method, self.path, self.version).as_bytes(),
        );
        for (name, value) in &self.headers {
            let skip = remove.iter().any(|r| name.eq_ignore_ascii_case(r))
                || name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding");
            if !skip {
                out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
            }
        }
        if !self.body.is_empty() {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        for (name, value) in add {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[derive(Debug, Default)]
pub struct RequestParser {
    buffer: Vec<u8>,
    complete: Option<ParsedRequest>,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and advance. Errors are fatal for the connection.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), ProxyError> {
        self.buffer.extend_from_slice(bytes);
        if self.complete.is_none()
            && let Some((request, consumed)) = try_parse(&self.buffer)?
        {
            self.buffer.drain(..consumed);
            self.complete = Some(request);
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.complete.is_some()
    }

    /// The parsed request, once complete.
    pub fn take(&mut self) -> Option<ParsedRequest> {
        self.complete.take()
    }

    /// Prepare for the next request on a keep-alive connection. Bytes
    /// already received beyond the last request are kept.
    pub fn reset(&mut self) -> Result<(), ProxyError> {
        self.complete = None;
        // Leftover bytes may already contain the next request.
        if !self.buffer.is_empty()
            && let Some((request, consumed)) = try_parse(&self.buffer)?
        {
            self.buffer.drain(..consumed);
            self.complete = Some(request);
        }
        Ok(())
    }
}

fn try_parse(buf: &[u8]) -> Result<Option<(ParsedRequest, usize)>, ProxyError> {
    let Some(head_end) = find_subsequence(buf, b"\r\n\r\n") else {
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::Tunnel("request head too large".to_string()));
        }
        return Ok(None);
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| ProxyError::Tunnel("request head is not valid UTF-8".to_string()))?;
    let mut lines = head.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| ProxyError::Tunnel("empty request".to_string()))?;
    let mut parts = request_line.split(' ');
    let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v), None) if v.starts_with("HTTP/") && !m.is_empty() => {
            (m.to_string(), p.to_string(), v.to_string())
        }
        _ => {
            return Err(ProxyError::Tunnel(format!(
                "malformed request line: {request_line:?}"
            )));
        }
    };

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::Tunnel(format!("malformed header line: {line:?}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let body_start = head_end + 4;
    let chunked = headers.iter().any(|(n, v)| {
        n.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked")
    });

    // Chunked wins over Content-Length when both are present (RFC 7230).
    let (body, consumed) = if chunked {
        match parse_chunked(&buf[body_start..])? {
            Some((body, used)) => (body, body_start + used),
            None => return Ok(None),
        }
    } else {
        let length = match headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        {
            Some((_, v)) => v
                .parse::<usize>()
                .map_err(|_| ProxyError::Tunnel(format!("bad Content-Length: {v:?}")))?,
            None => 0,
        };
        if length > MAX_BODY_BYTES {
            return Err(ProxyError::Tunnel("request body too large".to_string()));
        }
        if buf.len() < body_start + length {
            return Ok(None);
        }
        (buf[body_start..body_start + length].to_vec(), body_start + length)
    };

    Ok(Some((
        ParsedRequest {
            method,
            path,
            version,
            headers,
            body,
            raw: buf[..consumed].to_vec(),
        },
        consumed,
    )))
}

/// Reassemble a chunked body. Returns None until the terminating chunk
/// (and its trailing CRLF) has arrived.
fn parse_chunked(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, ProxyError> {
    let mut body = Vec::new();
    let mut pos = 0usize;

    loop {
        let Some(line_end) = find_subsequence(&buf[pos..], b"\r\n") else {
            return Ok(None);
        };
        let size_line = std::str::from_utf8(&buf[pos..pos + line_end])
            .map_err(|_| ProxyError::Tunnel("bad chunk size line".to_string()))?;
        // Chunk extensions after ';' are ignored.
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ProxyError::Tunnel(format!("bad chunk size: {size_str:?}")))?;
        pos += line_end + 2;

        if size == 0 {
            // Trailer section: skip to the blank line.
            let Some(trailer_end) = find_subsequence(&buf[pos..], b"\r\n") else {
                return Ok(None);
            };
            return Ok(Some((body, pos + trailer_end + 2)));
        }

        if body.len() + size > MAX_BODY_BYTES {
            return Err(ProxyError::Tunnel("chunked body too large".to_string()));
        }
        if buf.len() < pos + size + 2 {
            return Ok(None);
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        pos += size + 2;
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &[u8] =
        b"POST /api/test HTTP/1.1\r\nHost: claude.ai\r\nContent-Length: 5\r\n\r\nhello";

    fn parse_whole(bytes: &[u8]) -> ParsedRequest {
        let mut parser = RequestParser::new();
        parser.feed(bytes).unwrap();
        assert!(parser.is_complete());
        parser.take().unwrap()
    }

    #[test]
    fn test_simple_request() {
        let request = parse_whole(SIMPLE);
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/api/test");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.header("host"), Some("claude.ai"));
        assert_eq!(request.header("HOST"), Some("claude.ai"));
        assert_eq!(request.body, b"hello");
        assert_eq!(request.raw, SIMPLE);
    }

    #[test]
    fn test_no_body() {
        let request = parse_whole(b"GET /api/me HTTP/1.1\r\nHost: claude.ai\r\n\r\n");
        assert!(request.body.is_empty());
        assert!(request.is_websocket_upgrade() == false);
    }

    #[test]
    fn test_split_invariance() {
        // Feeding byte-by-byte yields the same result as feeding whole.
        let whole = parse_whole(SIMPLE);
        let mut parser = RequestParser::new();
        for byte in SIMPLE {
            parser.feed(&[*byte]).unwrap();
        }
        let split = parser.take().unwrap();
        assert_eq!(split.method, whole.method);
        assert_eq!(split.path, whole.path);
        assert_eq!(split.headers, whole.headers);
        assert_eq!(split.body, whole.body);
        assert_eq!(split.raw, whole.raw);
    }

    #[test]
    fn test_incomplete_body_pending() {
        let mut parser = RequestParser::new();
        parser.feed(&SIMPLE[..SIMPLE.len() - 2]).unwrap();
        assert!(!parser.is_complete());
        parser.feed(&SIMPLE[SIMPLE.len() - 2..]).unwrap();
        assert!(parser.is_complete());
    }

    #[test]
    fn test_chunked_body() {
        let wire = b"POST /x HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n\
                     5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let request = parse_whole(wire);
        assert_eq!(request.body, b"hello world");
    }

    #[test]
    fn test_chunked_wins_over_content_length() {
        let wire = b"POST /x HTTP/1.1\r\nContent-Length: 999\r\nTransfer-Encoding: chunked\r\n\r\n\
                     2\r\nok\r\n0\r\n\r\n";
        let request = parse_whole(wire);
        assert_eq!(request.body, b"ok");
    }

    #[test]
    fn test_malformed_request_line() {
        let mut parser = RequestParser::new();
        assert!(parser.feed(b"NOT A REQUEST AT ALL\r\n\r\n").is_err());
    }

    #[test]
    fn test_malformed_header() {
        let mut parser = RequestParser::new();
        assert!(parser.feed(b"GET / HTTP/1.1\r\nbroken header\r\n\r\n").is_err());
    }

    #[test]
    fn test_keep_alive_reset() {
        let mut parser = RequestParser::new();
        let two = [SIMPLE, b"GET /second HTTP/1.1\r\nHost: claude.ai\r\n\r\n".as_slice()].concat();
        parser.feed(&two).unwrap();
        let first = parser.take().unwrap();
        assert_eq!(first.path, "/api/test");
        parser.reset().unwrap();
        assert!(parser.is_complete());
        assert_eq!(parser.take().unwrap().path, "/second");
    }

    #[test]
    fn test_serialize_removes_and_recomputes() {
        let wire = b"POST /x HTTP/1.1\r\nHost: a\r\nAccept-Encoding: gzip\r\nTransfer-Encoding: chunked\r\n\r\n\
                     5\r\nhello\r\n0\r\n\r\n";
        let request = parse_whole(wire);
        let out = request.serialize(&["accept-encoding"], &[("Connection", "close")]);
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("Accept-Encoding"));
        assert!(!text.contains("Transfer-Encoding"));
        assert!(text.contains("Content-Length: 5"));
        assert!(text.contains("Connection: close"));
        assert!(text.ends_with("hello"));
    }

    #[test]
    fn test_path_helpers() {
        let request =
            parse_whole(b"GET /api/conv/abc?tree=True&limit=2 HTTP/1.1\r\nHost: a\r\n\r\n");
        assert_eq!(request.path_only(), "/api/conv/abc");
        assert_eq!(request.query(), Some("tree=True&limit=2"));
    }
}
