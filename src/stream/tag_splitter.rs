use memchr::{memchr_iter, memmem};

// Incremental splitter for one inline tag, e.g. `<think>…</think>`.
//
// Key invariants:
// - Only the configured tag name is recognized; other angle-bracket content is
//   plain payload.
// - A tag cut by a chunk boundary is held back until the next chunk resolves
//   it, or until `finish` forces it out verbatim.
// - Spans are emitted only when their payload is non-empty.

/// One classified run of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSpan {
    /// `true` when the text sat between the opening and closing tag.
    pub matched: bool,
    pub data: String,
}

impl TagSpan {
    fn new(matched: bool, data: &str) -> Self {
        Self {
            matched,
            data: data.to_owned(),
        }
    }
}

/// Streaming scanner that separates tagged from untagged text.
#[derive(Debug, Clone)]
pub struct TagSplitter {
    open_tag: String,
    close_tag: String,
    buffer: String,
    inside_tag: bool,
}

impl TagSplitter {
    /// Create a splitter for `<tag_name>` / `</tag_name>`.
    #[must_use]
    pub fn new(tag_name: &str) -> Self {
        Self {
            open_tag: format!("<{tag_name}>"),
            close_tag: format!("</{tag_name}>"),
            buffer: String::new(),
            inside_tag: false,
        }
    }

    #[must_use]
    pub fn is_inside_tag(&self) -> bool {
        self.inside_tag
    }

    /// Whether a partial tag is currently held back.
    #[must_use]
    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Feed a chunk and return every span that can be classified so far.
    pub fn update(&mut self, chunk: &str) -> Vec<TagSpan> {
        let mut out = Vec::new();
        self.update_into(chunk, &mut out);
        out
    }

    /// Feed a chunk and append classified spans to `out`.
    pub fn update_into(&mut self, chunk: &str, out: &mut Vec<TagSpan>) {
        if chunk.is_empty() {
            return;
        }

        // Fast path: nothing held back and no '<' means no tag can start here.
        if self.buffer.is_empty() && memchr::memchr(b'<', chunk.as_bytes()).is_none() {
            out.push(TagSpan::new(self.inside_tag, chunk));
            return;
        }

        self.buffer.push_str(chunk);
        let mut consumed = 0usize;
        loop {
            let pending = if self.inside_tag {
                self.close_tag.as_str()
            } else {
                self.open_tag.as_str()
            };
            let rest = &self.buffer[consumed..];

            if let Some(pos) = memmem::find(rest.as_bytes(), pending.as_bytes()) {
                if pos > 0 {
                    out.push(TagSpan::new(self.inside_tag, &rest[..pos]));
                }
                consumed += pos + pending.len();
                self.inside_tag = !self.inside_tag;
                continue;
            }

            let hold = partial_tag_suffix_len(rest.as_bytes(), pending.as_bytes());
            let emit_len = rest.len() - hold;
            if emit_len > 0 {
                out.push(TagSpan::new(self.inside_tag, &rest[..emit_len]));
            }
            consumed += emit_len;
            break;
        }

        if consumed == self.buffer.len() {
            self.buffer.clear();
        } else {
            self.buffer.drain(..consumed);
        }
    }

    /// Flush whatever is still held back under the current state.
    pub fn finish(&mut self) -> Vec<TagSpan> {
        let mut out = Vec::new();
        if !self.buffer.is_empty() {
            out.push(TagSpan {
                matched: self.inside_tag,
                data: std::mem::take(&mut self.buffer),
            });
        }
        self.inside_tag = false;
        out
    }
}

/// Length of the longest suffix of `haystack` that is a proper prefix of `tag`.
///
/// `tag` starts with `<`, so the held-back suffix always begins on a char
/// boundary.
#[inline]
fn partial_tag_suffix_len(haystack: &[u8], tag: &[u8]) -> usize {
    let window = tag.len().saturating_sub(1);
    let tail_start = haystack.len().saturating_sub(window);
    let tail = &haystack[tail_start..];
    memchr_iter(b'<', tail)
        .find(|&pos| tag.starts_with(&tail[pos..]))
        .map_or(0, |pos| tail.len() - pos)
}
