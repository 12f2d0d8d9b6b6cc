use http::Version;

use super::{pack, take_literal};
use crate::memory::Cursor;

const HTTP_10_WORD: u64 = pack(b"HTTP/1.0");
const HTTP_11_WORD: u64 = pack(b"HTTP/1.1");

/// Matches `HTTP/1.0` or `HTTP/1.1` immediately followed by a carriage return.
///
/// On success the cursor is left on the `\r`. Any other trailing byte rejects the match and
/// the cursor stays at its pre-match position.
pub fn known_version(cursor: &mut Cursor) -> Option<Version> {
    let mut scan = cursor.clone();
    let version = match cursor.peek_long() {
        Some(word) => {
            let version = match word {
                HTTP_11_WORD => Version::HTTP_11,
                HTTP_10_WORD => Version::HTTP_10,
                _ => return None,
            };
            scan.skip(8);
            version
        }
        None => take_version(&mut scan)?,
    };

    if scan.peek() != Some(b'\r') {
        return None;
    }
    *cursor = scan;
    Some(version)
}

fn take_version(scan: &mut Cursor) -> Option<Version> {
    if !take_literal(scan, b"HTTP/1.") {
        return None;
    }
    match scan.take()? {
        b'1' => Some(Version::HTTP_11),
        b'0' => Some(Version::HTTP_10),
        _ => None,
    }
}
