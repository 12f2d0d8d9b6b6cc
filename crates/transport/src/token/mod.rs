//! Recognizing fixed HTTP tokens at a cursor position.
//!
//! Request lines start with one of a handful of method tokens and end with one of two
//! version tokens. Instead of comparing those byte by byte, the matcher reads the next 8
//! bytes as one little-endian `u64` ([`Cursor::peek_long`](crate::memory::Cursor::peek_long))
//! and compares it against precomputed words:
//!
//! - every token is padded with spaces to 8 bytes and packed into a `u64` constant
//! - for a method shorter than 7 bytes, `(scan ^ word) << (8 * (8 - (len + 1)))` discards the
//!   bytes following the token and its delimiting space, the match is a zero result
//! - `CONNECT ` and `OPTIONS ` fill all 8 bytes and compare the full word, as do the versions
//!
//! When fewer than 8 bytes are left in the current block the word cannot be read and a byte
//! at a time matcher takes over. Both accept exactly the same inputs and consume the same
//! number of bytes; a miss is a plain `None` and leaves the cursor where it was.

mod method;
mod version;

pub use method::known_method;
pub use version::known_version;

/// Packs an 8 byte token into the word `peek_long` would read for it.
#[inline]
const fn pack(token: &[u8; 8]) -> u64 {
    u64::from_le_bytes(*token)
}

/// Consumes `literal` from `scan`, false on the first mismatch.
fn take_literal(scan: &mut crate::memory::Cursor, literal: &[u8]) -> bool {
    literal.iter().all(|expected| scan.take() == Some(*expected))
}
