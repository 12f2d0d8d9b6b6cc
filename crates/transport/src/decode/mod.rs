//! Materializing strings and byte segments from cursor ranges.
//!
//! Every function here takes the two cursors delimiting a half-open range `[start, end)` and
//! returns `None` when either of them is a default cursor.
//!
//! - [`decode_ascii`]: one `char` per byte, bytes above `0x7f` kept as the char of the same
//!   ordinal (opaque header octets, see RFC 7230 section 3.2.4)
//! - [`decode_utf8`]: proper UTF-8 decoding, invalid sequences become U+FFFD
//! - [`extract_bytes`]: a borrowed view when the range sits in one block, an owned copy
//!   otherwise
//!
//! Ranges inside a single block are read straight from the block storage. Ranges spanning
//! blocks are gathered first; for ASCII decoding a per-thread scratch buffer is used up to
//! [`MAX_STACK_DECODE_BYTES`] and a heap buffer above that, both producing the same string.

mod ascii;
mod segment;
mod utf8;

pub use ascii::{MAX_STACK_DECODE_BYTES, decode_ascii};
pub use segment::{ByteSegment, extract_bytes};
pub use utf8::decode_utf8;
