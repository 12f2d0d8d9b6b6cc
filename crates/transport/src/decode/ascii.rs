use std::cell::RefCell;

use crate::memory::Cursor;

/// Largest multi-block span gathered in the reusable scratch buffer instead of a fresh heap
/// allocation.
pub const MAX_STACK_DECODE_BYTES: usize = 16384;

thread_local! {
    static SCRATCH: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(MAX_STACK_DECODE_BYTES));
}

/// Decodes `[start, end)` treating every byte as the char with the same ordinal.
pub fn decode_ascii(start: &Cursor, end: &Cursor) -> Option<String> {
    let (Some(block), Some(_)) = (start.block(), end.block()) else {
        return None;
    };

    if start.same_block(end) {
        let storage = block.storage();
        return Some(bytes_to_string(storage.get(start.index()..end.index()).unwrap_or_default()));
    }

    let length = start.get_length(end);
    if length > MAX_STACK_DECODE_BYTES {
        return Some(decode_heap(start, length));
    }

    SCRATCH.with(|scratch| match scratch.try_borrow_mut() {
        Ok(mut scratch) => {
            scratch.clear();
            scratch.resize(length, 0);
            let copied = start.clone().copy_to(&mut scratch);
            Some(bytes_to_string(&scratch[..copied]))
        }
        Err(_) => Some(decode_heap(start, length)),
    })
}

fn decode_heap(start: &Cursor, length: usize) -> String {
    let mut buffer = vec![0u8; length];
    let copied = start.clone().copy_to(&mut buffer);
    bytes_to_string(&buffer[..copied])
}

#[inline]
fn bytes_to_string(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len());
    text.extend(bytes.iter().copied().map(char::from));
    text
}
