//! Segmented read buffer for the byte stream.
//!
//! Holds the blocks received from the socket and supports the two
//! extractions the stream offers: a fixed byte count and a delimiter.
//! When a request fits within the first segment the extraction is
//! zero-copy (a refcount bump on the underlying `Bytes`); spans copy
//! into one contiguous buffer.

use std::collections::VecDeque;
use std::mem;

use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Default)]
pub struct BufferReader {
    segs: VecDeque<Bytes>,
    len: usize,
    // Resume point for delimiter scans within the first segment, so
    // repeated misses never rescan already-covered bytes.
    search_from: usize,
}

impl BufferReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, block: Bytes) {
        if block.is_empty() {
            return;
        }
        self.len += block.len();
        self.segs.push_back(block);
    }

    /// Extract exactly `n` bytes, or `None` when fewer are buffered.
    pub fn read_until_length(&mut self, n: usize) -> Option<Bytes> {
        if n > self.len {
            return None;
        }
        if n == 0 {
            return Some(Bytes::new());
        }
        self.search_from = 0;
        self.len -= n;

        // A request the first segment covers whole is a refcount bump,
        // not a copy.
        let front = self.segs.front_mut().expect("len accounting is non-zero");
        if front.len() >= n {
            let out = front.split_to(n);
            if front.is_empty() {
                self.segs.pop_front();
            }
            return Some(out);
        }

        // Assemble across the boundary, chipping each front segment
        // away in place until the request is filled.
        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            let front = self
                .segs
                .front_mut()
                .expect("len accounting guarantees buffered segments");
            let take = (n - out.len()).min(front.len());
            out.put(front.split_to(take));
            if front.is_empty() {
                self.segs.pop_front();
            }
        }
        Some(out.freeze())
    }

    /// Extract everything up to and including the first occurrence of
    /// `delimiter`, or `None` when it has not arrived yet.
    ///
    /// A miss keeps at most `delimiter.len() - 1` bytes of overlap in
    /// the scan window; adjacent segments are merged so a delimiter
    /// split across blocks is still found.
    pub fn read_until_delimiter(&mut self, delimiter: &[u8]) -> Option<Bytes> {
        if delimiter.is_empty() {
            return Some(Bytes::new());
        }

        while let Some(front) = self.segs.front() {
            match find(&front[self.search_from..], delimiter) {
                Some(rel) => {
                    let end = self.search_from + rel + delimiter.len();
                    self.search_from = 0;
                    let front = self.segs.front_mut().expect("front exists");
                    self.len -= end;
                    let out = front.split_to(end);
                    if front.is_empty() {
                        self.segs.pop_front();
                    }
                    return Some(out);
                }
                None => {
                    self.search_from = front.len().saturating_sub(delimiter.len() - 1);
                    if self.segs.len() > 1 {
                        self.unify();
                    } else {
                        return None;
                    }
                }
            }
        }
        None
    }

    /// Fold the second segment into the first, so a delimiter split
    /// across their boundary lands inside one contiguous slice.
    fn unify(&mut self) {
        let Some(second) = self.segs.remove(1) else {
            return;
        };
        let first = self.segs.front_mut().expect("remove(1) implies a front");
        let mut merged = BytesMut::with_capacity(first.len() + second.len());
        merged.put(mem::take(first));
        merged.put(second);
        *first = merged.freeze();
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
