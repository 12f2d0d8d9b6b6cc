use crate::memory::Cursor;

/// Decodes `[start, end)` as UTF-8, replacing invalid sequences with U+FFFD.
///
/// The result is identical to [`String::from_utf8_lossy`] over the concatenated range. Ranges
/// spanning blocks are fed block by block through a streaming decoder, so a multi-byte
/// character split across a block boundary decodes as one character.
pub fn decode_utf8(start: &Cursor, end: &Cursor) -> Option<String> {
    let (Some(first), Some(_)) = (start.block(), end.block()) else {
        return None;
    };

    if start.same_block(end) {
        let storage = first.storage();
        let bytes = storage.get(start.index()..end.index()).unwrap_or_default();
        return Some(String::from_utf8_lossy(bytes).into_owned());
    }

    let length = start.get_length(end);
    let mut text = String::with_capacity(length);
    let mut decoder = Utf8Decoder::default();

    let mut block = first.clone();
    let mut index = start.index();
    let mut remaining = length;
    loop {
        let following = block.end().saturating_sub(index);
        let next = block.next();
        let storage = block.storage();

        if remaining <= following || next.is_none() {
            let count = remaining.min(following);
            decoder.decode(storage.get(index..index + count).unwrap_or_default(), true, &mut text);
            return Some(text);
        }

        decoder.decode(storage.get(index..index + following).unwrap_or_default(), false, &mut text);
        remaining -= following;
        drop(storage);

        let Some(next) = next else {
            return Some(text);
        };
        index = next.start();
        block = next;
    }
}

/// Incremental UTF-8 decoder that carries an incomplete trailing sequence between inputs.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: [u8; 4],
    pending_len: usize,
}

impl Utf8Decoder {
    /// Appends the decoded form of `input` to `out`.
    ///
    /// A sequence cut off at the end of `input` is held back until the next call. With
    /// `last` set, a sequence still incomplete at the end is emitted as U+FFFD.
    pub(crate) fn decode(&mut self, mut input: &[u8], last: bool, out: &mut String) {
        if self.pending_len > 0 {
            let carried = self.pending_len;
            let take = (self.pending.len() - carried).min(input.len());

            let mut joined = self.pending;
            joined[carried..carried + take].copy_from_slice(&input[..take]);
            let joined_len = carried + take;

            let consumed = push_complete(&joined[..joined_len], out);
            if consumed < carried {
                // still incomplete, every input byte went into `joined`
                self.pending = joined;
                self.pending_len = joined_len;
                if last {
                    self.flush(out);
                }
                return;
            }
            input = &input[consumed - carried..];
            self.pending_len = 0;
        }

        let consumed = push_complete(input, out);
        let tail = &input[consumed..];
        self.pending[..tail.len()].copy_from_slice(tail);
        self.pending_len = tail.len();

        if last {
            self.flush(out);
        }
    }

    fn flush(&mut self, out: &mut String) {
        if self.pending_len > 0 {
            out.push(char::REPLACEMENT_CHARACTER);
            self.pending_len = 0;
        }
    }
}

/// Decodes every complete sequence of `bytes` into `out` and returns how many bytes were
/// consumed. Only an incomplete sequence at the very end is left unconsumed.
fn push_complete(bytes: &[u8], out: &mut String) -> usize {
    let mut consumed = 0;
    for chunk in bytes.utf8_chunks() {
        out.push_str(chunk.valid());
        consumed += chunk.valid().len();

        let invalid = chunk.invalid();
        if invalid.is_empty() {
            continue;
        }
        let truncated = consumed + invalid.len() == bytes.len()
            && std::str::from_utf8(invalid).is_err_and(|error| error.error_len().is_none());
        if truncated {
            return consumed;
        }
        out.push(char::REPLACEMENT_CHARACTER);
        consumed += invalid.len();
    }
    consumed
}
