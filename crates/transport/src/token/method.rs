use http::Method;

use super::{pack, take_literal};
use crate::memory::Cursor;

struct MethodToken {
    word: u64,
    /// bits shifted out so that only the token and its trailing space are compared
    shift: u32,
    method: Method,
}

impl MethodToken {
    const fn new(padded: &[u8; 8], len: usize, method: Method) -> Self {
        Self { word: pack(padded), shift: 8 * (8 - (len as u32 + 1)), method }
    }

    /// Token length including the delimiting space
    #[inline]
    const fn consumed(&self) -> usize {
        8 - (self.shift / 8) as usize
    }
}

// most frequent first
static METHOD_TOKENS: [MethodToken; 9] = [
    MethodToken::new(b"GET     ", 3, Method::GET),
    MethodToken::new(b"POST    ", 4, Method::POST),
    MethodToken::new(b"DELETE  ", 6, Method::DELETE),
    MethodToken::new(b"HEAD    ", 4, Method::HEAD),
    MethodToken::new(b"PUT     ", 3, Method::PUT),
    MethodToken::new(b"CONNECT ", 7, Method::CONNECT),
    MethodToken::new(b"PATCH   ", 5, Method::PATCH),
    MethodToken::new(b"OPTIONS ", 7, Method::OPTIONS),
    MethodToken::new(b"TRACE   ", 5, Method::TRACE),
];

/// Matches one of the known method tokens followed by a space.
///
/// On success the cursor is advanced past the token and the space. On a miss the cursor is
/// left untouched and the caller falls back to general token parsing.
pub fn known_method(cursor: &mut Cursor) -> Option<Method> {
    match cursor.peek_long() {
        Some(scan) => {
            let token = match_word(scan)?;
            cursor.skip(token.consumed());
            Some(token.method.clone())
        }
        None => {
            let mut scan = cursor.clone();
            let method = take_method(&mut scan)?;
            *cursor = scan;
            Some(method)
        }
    }
}

fn match_word(scan: u64) -> Option<&'static MethodToken> {
    METHOD_TOKENS.iter().find(|token| ((scan ^ token.word) << token.shift) == 0)
}

/// Byte at a time matcher, used when fewer than 8 contiguous bytes are available.
fn take_method(scan: &mut Cursor) -> Option<Method> {
    let (rest, method): (&[u8], Method) = match scan.take()? {
        b'G' => (b"ET ", Method::GET),
        b'H' => (b"EAD ", Method::HEAD),
        b'P' => match scan.take()? {
            b'O' => (b"ST ", Method::POST),
            b'U' => (b"T ", Method::PUT),
            b'A' => (b"TCH ", Method::PATCH),
            _ => return None,
        },
        b'D' => (b"ELETE ", Method::DELETE),
        b'C' => (b"ONNECT ", Method::CONNECT),
        b'O' => (b"PTIONS ", Method::OPTIONS),
        b'T' => (b"RACE ", Method::TRACE),
        _ => return None,
    };
    take_literal(scan, rest).then_some(method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBlock, test_chain};

    const METHODS: [&str; 9] = ["GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "PATCH", "TRACE"];

    /// Runs both matchers on `input` and checks they agree on result and consumed bytes.
    fn both(input: &[u8]) -> Option<(Method, usize)> {
        let block = MemoryBlock::from_slice(input);

        let mut slow = Cursor::at_start(&block);
        let slow_result = take_method(&mut slow).map(|method| (method, slow.index()));

        let mut matched = Cursor::at_start(&block);
        let result = known_method(&mut matched);
        let consumed = matched.index();

        if let Some(scan) = Cursor::at_start(&block).peek_long() {
            let fast = match_word(scan).map(|token| (token.method.clone(), token.consumed()));
            assert_eq!(fast, slow_result, "fast and slow disagree on {:?}", String::from_utf8_lossy(input));
        }
        assert_eq!(result.clone().map(|method| (method, consumed)), slow_result);
        if result.is_none() {
            assert_eq!(consumed, 0, "a miss must not move the cursor");
        }
        result.map(|method| (method, consumed))
    }

    #[test]
    fn every_method_long_buffer() {
        for name in METHODS {
            let input = format!("{name} /index.html HTTP/1.1\r\n");
            let (method, consumed) = both(input.as_bytes()).unwrap();
            assert_eq!(method.as_str(), name);
            assert_eq!(consumed, name.len() + 1);
        }
    }

    #[test]
    fn every_method_short_buffer() {
        for name in METHODS {
            let input = format!("{name} ");
            let (method, consumed) = both(input.as_bytes()).unwrap();
            assert_eq!(method.as_str(), name);
            assert_eq!(consumed, name.len() + 1);

            // without the delimiter neither path matches
            assert!(both(name.as_bytes()).is_none());
        }
    }

    #[test]
    fn near_misses_are_rejected() {
        let inputs: [&[u8]; 12] = [
            b"GETT    ",
            b"GETT /",
            b"get / HTTP/1.1",
            b"POS /   ",
            b"PUTS /  ",
            b"PATCHY  ",
            b"OPTIONSX",
            b"CONNECT/",
            b"DELETE/ ",
            b"TRACE\t  ",
            b"XGET /  ",
            b"",
        ];
        for input in inputs {
            assert!(both(input).is_none(), "{:?} should not match", String::from_utf8_lossy(input));
        }
    }

    #[test]
    fn fallback_crosses_block_boundary() {
        let (_blocks, mut cursor, _) = test_chain(&[b"DEL", b"ETE /item HTTP/1.1"]);
        assert_eq!(known_method(&mut cursor), Some(Method::DELETE));
        assert_eq!(cursor.peek(), Some(b'/'));
    }

    #[test]
    fn fast_path_does_not_read_past_delimiter() {
        let (_blocks, mut cursor, _) = test_chain(&[b"GET /a\r\n"]);
        assert_eq!(known_method(&mut cursor), Some(Method::GET));
        assert_eq!(cursor.index(), 4);
    }
}
