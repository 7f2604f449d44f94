//! Incremental byte-to-frame tokenizer for `text/event-stream` bodies.
//!
//! Feed raw network chunks with [`FrameDecoder::feed`] and drain complete
//! frames with [`FrameDecoder::next_frame`]. Output does not depend on where
//! the chunk boundaries fall, including boundaries inside multi-byte
//! characters. CRLF and lone CR line endings are read as LF.

use std::collections::VecDeque;

pub const FRAME_DELIMITER: &str = "\n\n";

/// Streaming UTF-8 decoder that carries an incomplete trailing sequence over
/// to the next chunk. Invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8], out: &mut String) {
        self.pending.extend_from_slice(chunk);
        let mut consumed = 0;

        loop {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    consumed = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            consumed += valid + bad;
                        }
                        None => {
                            consumed += valid;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..consumed);
    }

    /// Flushes a dangling partial sequence at end of input.
    pub fn finish(&mut self, out: &mut String) {
        if !self.pending.is_empty() {
            out.push(char::REPLACEMENT_CHARACTER);
            self.pending.clear();
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    utf8: Utf8StreamDecoder,
    decoded: String,
    /// Set after a `\r` so a following `\n`, even in the next chunk, is
    /// folded into the same line break.
    skip_lf: bool,
    buffer: String,
    ready: VecDeque<String>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.utf8.decode(chunk, &mut self.decoded);
        self.normalize_line_endings();
        while let Some(idx) = self.buffer.find(FRAME_DELIMITER) {
            let frame = self.buffer[..idx].to_string();
            self.buffer.drain(..idx + FRAME_DELIMITER.len());
            self.ready.push_back(frame);
        }
    }

    fn normalize_line_endings(&mut self) {
        for ch in self.decoded.drain(..) {
            let after_cr = std::mem::take(&mut self.skip_lf);
            match ch {
                '\n' if after_cr => {}
                '\r' => {
                    self.buffer.push('\n');
                    self.skip_lf = true;
                }
                _ => self.buffer.push(ch),
            }
        }
    }

    pub fn next_frame(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    /// Convenience for `feed` followed by draining every complete frame.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.feed(chunk);
        self.ready.drain(..).collect()
    }

    /// Returns the held-back partial frame, if any. Callers treat it as
    /// truncated input; it is never parsed as a frame.
    pub fn finish(mut self) -> Option<String> {
        self.utf8.finish(&mut self.decoded);
        self.normalize_line_endings();
        if self.buffer.trim().is_empty() {
            None
        } else {
            Some(self.buffer)
        }
    }
}
