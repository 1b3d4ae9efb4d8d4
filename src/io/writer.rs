//! Scatter/gather send queue.
//!
//! Command fragments are queued as `Bytes` segments in append order and
//! exposed as an `IoSlice` vector for `sendmsg`. Partial transmissions are
//! tracked with a read index plus an intra-segment offset so the original
//! segment list survives intact and `rewind` can retransmit everything
//! after a reconnect.

use bytes::Bytes;
use std::io::IoSlice;

#[derive(Debug, Default)]
pub struct BufferWriter {
    segments: Vec<Bytes>,
    /// Index of the first segment not yet fully sent.
    read_idx: usize,
    /// Bytes of `segments[read_idx]` already sent.
    partial: usize,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.segments.reserve(additional);
    }

    /// Queue a fragment for transmission.
    pub fn take_buffer(&mut self, buf: Bytes) {
        if !buf.is_empty() {
            self.segments.push(buf);
        }
    }

    /// Format an integer and queue it.
    pub fn take_number(&mut self, value: i64) {
        self.take_buffer(Bytes::from(value.to_string()));
    }

    /// Remaining unsent segment count.
    pub fn unsent_len(&self) -> usize {
        self.segments.len() - self.read_idx
    }

    /// Whether any byte has gone out since the last reset/rewind.
    pub fn has_sent(&self) -> bool {
        self.read_idx > 0 || self.partial > 0
    }

    /// The unsent tail as iovec-compatible slices.
    pub fn unsent_slices(&self) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::with_capacity(self.unsent_len());
        for (i, segment) in self.segments.iter().enumerate().skip(self.read_idx) {
            let offset = if i == self.read_idx { self.partial } else { 0 };
            slices.push(IoSlice::new(&segment[offset..]));
        }
        slices
    }

    /// Advance past `sent` transmitted bytes.
    pub fn commit_read(&mut self, mut sent: usize) {
        while self.read_idx < self.segments.len() {
            let left = self.segments[self.read_idx].len() - self.partial;
            if sent >= left {
                sent -= left;
                self.read_idx += 1;
                self.partial = 0;
            } else {
                self.partial += sent;
                return;
            }
        }
        debug_assert_eq!(sent, 0, "committed more bytes than were queued");
    }

    /// Restore the full segment list for retransmission.
    pub fn rewind(&mut self) {
        self.read_idx = 0;
        self.partial = 0;
    }

    /// Drop all queued segments.
    pub fn reset(&mut self) {
        self.segments.clear();
        self.read_idx = 0;
        self.partial = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(writer: &BufferWriter) -> Vec<u8> {
        writer
            .unsent_slices()
            .iter()
            .flat_map(|s| s.iter().copied())
            .collect()
    }

    #[test]
    fn test_fragments_keep_append_order() {
        let mut writer = BufferWriter::new();
        writer.take_buffer(Bytes::from_static(b"set "));
        writer.take_buffer(Bytes::from_static(b"key"));
        writer.take_buffer(Bytes::from_static(b" "));
        writer.take_number(42);
        writer.take_buffer(Bytes::from_static(b"\r\n"));
        assert_eq!(writer.unsent_len(), 5);
        assert_eq!(queued(&writer), b"set key 42\r\n");
    }

    #[test]
    fn test_commit_read_partial_segment() {
        let mut writer = BufferWriter::new();
        writer.take_buffer(Bytes::from_static(b"hello"));
        writer.take_buffer(Bytes::from_static(b"world"));

        writer.commit_read(7); // "hello" + "wo"
        assert!(writer.has_sent());
        assert_eq!(writer.unsent_len(), 1);
        assert_eq!(queued(&writer), b"rld");

        writer.commit_read(3);
        assert_eq!(writer.unsent_len(), 0);
        assert!(queued(&writer).is_empty());
    }

    #[test]
    fn test_rewind_restores_everything() {
        let mut writer = BufferWriter::new();
        writer.take_buffer(Bytes::from_static(b"get foo"));
        writer.take_buffer(Bytes::from_static(b"\r\n"));
        writer.commit_read(5);

        writer.rewind();
        assert!(!writer.has_sent());
        assert_eq!(queued(&writer), b"get foo\r\n");
    }

    #[test]
    fn test_take_number_formats_negative_values() {
        let mut writer = BufferWriter::new();
        writer.take_number(-1);
        writer.take_number(0);
        assert_eq!(queued(&writer), b"-10");
    }

    #[test]
    fn test_reset_drops_segments() {
        let mut writer = BufferWriter::new();
        writer.take_buffer(Bytes::from_static(b"quit\r\n"));
        writer.commit_read(2);
        writer.reset();
        assert_eq!(writer.unsent_len(), 0);
        assert!(!writer.has_sent());
    }

    #[test]
    fn test_empty_fragments_are_ignored() {
        let mut writer = BufferWriter::new();
        writer.take_buffer(Bytes::new());
        assert_eq!(writer.unsent_len(), 0);
    }
}
