//! Fixed-capacity receive buffer for the VRCL server.
//!
//! Bytes arrive in arbitrary TCP segments; [`TagExtractor`] appends them to
//! a [`CircularBuffer`] and pulls every complete tag unit out with the
//! streaming scanner. A buffer that fills up without containing a complete
//! tag is discarded so the stream can resynchronise on the next `<`.

use std::collections::VecDeque;

use tracing::{debug, warn};

use super::scanner::{Scan, TagUnit, scan};

/// Default receive capacity, large enough for any single VRCL message.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

// ── CircularBuffer ───────────────────────────────────────────────

#[derive(Debug)]
pub struct CircularBuffer {
    data: VecDeque<u8>,
    capacity: usize,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append as many bytes as fit. Returns the number accepted.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let accepted = bytes.len().min(self.free());
        self.data.extend(&bytes[..accepted]);
        accepted
    }

    /// The buffered bytes as one slice.
    pub fn contiguous(&mut self) -> &[u8] {
        self.data.make_contiguous()
    }

    /// Drop `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }

    pub fn free(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ── TagExtractor ─────────────────────────────────────────────────

/// One item pulled out of the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Tag(TagUnit),
    /// Bytes that could not start a tag; already skipped.
    Invalid(String),
}

/// Circular buffer plus scanner: bytes in, tag units out.
#[derive(Debug)]
pub struct TagExtractor {
    buffer: CircularBuffer,
    overflows: u64,
}

impl TagExtractor {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: CircularBuffer::new(capacity),
            overflows: 0,
        }
    }

    /// Feed freshly received bytes and collect every unit they complete.
    pub fn push(&mut self, mut bytes: &[u8]) -> Vec<Extracted> {
        let mut out = Vec::new();
        loop {
            let accepted = self.buffer.write(bytes);
            bytes = &bytes[accepted..];
            self.drain(&mut out);

            if bytes.is_empty() {
                break;
            }
            if self.buffer.is_full() {
                warn!(
                    capacity = self.buffer.capacity(),
                    "receive buffer overflow without a complete tag, resetting"
                );
                self.buffer.clear();
                self.overflows += 1;
            }
        }
        out
    }

    fn drain(&mut self, out: &mut Vec<Extracted>) {
        loop {
            let step = scan(self.buffer.contiguous());
            match step {
                Scan::Complete { unit, len } => {
                    self.buffer.consume(len);
                    out.push(Extracted::Tag(unit));
                }
                Scan::Skip(n) => {
                    let skipped = self.take_text(n);
                    if !skipped.trim().is_empty() {
                        debug!(%skipped, "discarding bytes outside any tag");
                    }
                }
                Scan::Invalid { skip } => {
                    let raw = self.take_text(skip);
                    out.push(Extracted::Invalid(raw));
                }
                Scan::Incomplete => return,
            }
        }
    }

    fn take_text(&mut self, n: usize) -> String {
        let n = n.min(self.buffer.len());
        let text = String::from_utf8_lossy(&self.buffer.contiguous()[..n]).into_owned();
        self.buffer.consume(n);
        text
    }

    /// Bytes waiting for the rest of a tag.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// How many times the buffer was reset after filling up.
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

impl Default for TagExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
