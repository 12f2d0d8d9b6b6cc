use http::{Method, Uri, Version};
use tracing::trace;

use crate::connection::ParseError;
use crate::decode::decode_ascii;
use crate::ensure;
use crate::memory::Cursor;
use crate::token::{known_method, known_version};

/// Longest request line accepted, the terminating CRLF included.
pub const MAX_REQUEST_LINE_SIZE: usize = 8 * 1024;

/// The first line of a request: `METHOD SP request-target SP HTTP-version CRLF`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    method: Method,
    target: String,
    version: Version,
}

impl RequestLine {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> Version {
        self.version
    }
}

/// Parses the request line starting at `cursor`.
///
/// Returns `Ok(None)` while the line is incomplete; the cursor is left untouched so the call
/// can be repeated once more bytes arrived. On success the cursor is moved past the CRLF.
pub fn parse_request_line(cursor: &mut Cursor) -> Result<Option<RequestLine>, ParseError> {
    let mut line_end = cursor.clone();
    if line_end.seek(b'\n').is_none() {
        let buffered = cursor.get_length(&line_end);
        ensure!(buffered < MAX_REQUEST_LINE_SIZE, ParseError::too_long_request_line(buffered, MAX_REQUEST_LINE_SIZE));
        return Ok(None);
    }
    let line_size = cursor.get_length(&line_end) + 1;
    ensure!(line_size <= MAX_REQUEST_LINE_SIZE, ParseError::too_long_request_line(line_size, MAX_REQUEST_LINE_SIZE));

    let mut at = cursor.clone();
    let method = match known_method(&mut at) {
        Some(method) => method,
        None => {
            let space = seek_before(&at, b' ', &line_end).ok_or(ParseError::InvalidMethod)?;
            let token = decode_ascii(&at, &space).ok_or(ParseError::InvalidMethod)?;
            let method = Method::from_bytes(token.as_bytes()).map_err(|_| ParseError::InvalidMethod)?;
            at = space;
            at.skip(1);
            method
        }
    };

    let space = seek_before(&at, b' ', &line_end).ok_or_else(|| ParseError::invalid_target("missing http version"))?;
    let target = decode_ascii(&at, &space).unwrap_or_default();
    ensure!(!target.is_empty(), ParseError::invalid_target("empty request target"));
    target.parse::<Uri>().map_err(ParseError::invalid_target)?;
    at = space;
    at.skip(1);

    let version = known_version(&mut at).ok_or(ParseError::InvalidVersion)?;
    ensure!(at.take() == Some(b'\r') && at.take() == Some(b'\n'), ParseError::InvalidVersion);

    trace!(%method, request_target = target.as_str(), ?version, "request line parsed");
    *cursor = at;
    Ok(Some(RequestLine { method, target, version }))
}

/// The next `byte` after `from`, if it comes before `limit`.
fn seek_before(from: &Cursor, byte: u8, limit: &Cursor) -> Option<Cursor> {
    let mut scan = from.clone();
    scan.seek(byte)?;
    (from.get_length(&scan) < from.get_length(limit)).then_some(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_chain;
    use indoc::indoc;

    fn parse(parts: &[&[u8]]) -> (Result<Option<RequestLine>, ParseError>, Cursor) {
        let (_blocks, mut cursor, _) = test_chain(parts);
        let result = parse_request_line(&mut cursor);
        (result, cursor)
    }

    /// Cross-checks a complete request head against httparse, after switching to CRLF line ends.
    fn check_against_httparse(head: &str) {
        let head = head.replace('\n', "\r\n");
        let head = head.as_str();
        let mut headers = [httparse::EMPTY_HEADER; 16];
        let mut reference = httparse::Request::new(&mut headers);
        assert!(reference.parse(head.as_bytes()).unwrap().is_complete());

        let (result, mut rest) = parse(&[head.as_bytes()]);
        let line = result.unwrap().unwrap();
        assert_eq!(Some(line.method().as_str()), reference.method);
        assert_eq!(Some(line.target()), reference.path);
        assert_eq!(Some(if line.version() == Version::HTTP_11 { 1 } else { 0 }), reference.version);
        assert_eq!(rest.take(), head.lines().nth(1).and_then(|header| header.bytes().next()));
    }

    #[test]
    fn known_and_extension_methods() {
        check_against_httparse(indoc! {r##"
        GET /index.html?lang=en HTTP/1.1
        Host: 127.0.0.1:8080
        User-Agent: curl/7.79.1

        "##});
        check_against_httparse(indoc! {r##"
        OPTIONS * HTTP/1.0
        Host: localhost

        "##});
        check_against_httparse(indoc! {r##"
        PROPFIND /calendars/user/ HTTP/1.1
        Depth: 1

        "##});
    }

    #[test]
    fn line_split_across_blocks() {
        let (result, cursor) = parse(&[b"PO", b"ST /submit HT", b"TP/1.1\r", b"\nContent-Length: 0"]);
        let line = result.unwrap().unwrap();
        assert_eq!(line.method(), &Method::POST);
        assert_eq!(line.target(), "/submit");
        assert_eq!(line.version(), Version::HTTP_11);
        assert_eq!(cursor.peek(), Some(b'C'));
    }

    #[test]
    fn incomplete_line_waits_for_more() {
        let (result, cursor) = parse(&[b"GET /partial HTTP/1."]);
        assert_eq!(result, Ok(None));
        assert_eq!(cursor.index(), 0);
    }

    #[test]
    fn malformed_lines() {
        assert_eq!(parse(&[b"G@T / HTTP/1.1\r\n"]).0, Err(ParseError::InvalidMethod));
        assert_eq!(parse(&[b"GET\r\n"]).0, Err(ParseError::InvalidMethod));
        assert!(matches!(parse(&[b"GET /missing-version\r\n"]).0, Err(ParseError::InvalidTarget { .. })));
        assert!(matches!(parse(&[b"GET  HTTP/1.1\r\n"]).0, Err(ParseError::InvalidTarget { .. })));
        assert_eq!(parse(&[b"GET / HTTP/2.0\r\n"]).0, Err(ParseError::InvalidVersion));
        assert_eq!(parse(&[b"GET / HTTP/1.1\n"]).0, Err(ParseError::InvalidVersion));
        assert_eq!(parse(&[b"GET / HTTP/1.1\rX\n"]).0, Err(ParseError::InvalidVersion));
    }

    #[test]
    fn oversized_line_is_rejected() {
        let target = "a".repeat(MAX_REQUEST_LINE_SIZE);
        let without_newline = format!("GET /{target}");
        assert!(matches!(parse(&[without_newline.as_bytes()]).0, Err(ParseError::TooLongRequestLine { .. })));

        let complete = format!("GET /{target} HTTP/1.1\r\n");
        assert!(matches!(parse(&[complete.as_bytes()]).0, Err(ParseError::TooLongRequestLine { .. })));
    }
}
