// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use alloc::{collections::VecDeque, vec::Vec};
use bytes::{Buf, Bytes, BytesMut};
use core::fmt;

/// A buffer for combining chunks of an ordered byte stream which might
/// arrive out of order.
///
/// Incoming data is deduplicated against everything already buffered and
/// coalesced into contiguous chunks. Readers receive cheap reference-counted
/// views of contiguous data at the front of the stream; the data is only
/// released once the reader *drains* it, so a reader that consumes less than
/// it was handed can be served the remainder again.
///
/// The buffer enforces two limits on writes: the stream's own advertised
/// window (`virtual_buffer_length` past the delivered prefix) and a
/// caller-provided credit for newly received bytes (connection flow control).
#[derive(Default)]
pub struct ReceiveBuffer {
    /// Received but not yet read chunks, sorted by offset, disjoint
    chunks: VecDeque<Chunk>,
    /// Read but not yet drained data, contiguous from `base_offset`
    pending: VecDeque<Bytes>,
    /// The delivered prefix of the stream
    base_offset: u64,
    /// Total bytes currently in `pending`
    read_pending_length: u64,
    /// The furthest byte ever written (the stream's total received length)
    max_written_offset: u64,
    /// The advertisable receive window past `base_offset`
    virtual_buffer_length: u64,
}

struct Chunk {
    offset: u64,
    data: BytesMut,
}

impl Chunk {
    #[inline]
    fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

impl fmt::Debug for ReceiveBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReceiveBuffer")
            .field("base_offset", &self.base_offset)
            .field("read_pending_length", &self.read_pending_length)
            .field("max_written_offset", &self.max_written_offset)
            .field("virtual_buffer_length", &self.virtual_buffer_length)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The write extends past the stream's advertised receive window
    WindowExceeded,
    /// The newly received bytes exceed the caller-provided credit
    CreditExceeded,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::WindowExceeded => write!(f, "write beyond receive window"),
            Error::CreditExceeded => write!(f, "write beyond receive credit"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteOutcome {
    /// By how much the total received length grew (duplicates don't count)
    pub written: u64,
    /// True if contiguous data is available at the delivery point
    pub ready_to_deliver: bool,
}

impl ReceiveBuffer {
    pub fn new(virtual_buffer_length: u64) -> Self {
        Self {
            virtual_buffer_length,
            ..Self::default()
        }
    }

    /// The delivered (drained) prefix of the stream
    #[inline]
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// The total received length: the furthest byte ever written
    #[inline]
    pub fn total_received_len(&self) -> u64 {
        self.max_written_offset
    }

    #[inline]
    pub fn virtual_buffer_length(&self) -> u64 {
        self.virtual_buffer_length
    }

    /// Bytes handed to the reader which have not been drained yet
    #[inline]
    pub fn read_pending_length(&self) -> u64 {
        self.read_pending_length
    }

    /// Grows the advertisable window. The window never shrinks.
    #[inline]
    pub fn increase_virtual_buffer_length(&mut self, new_length: u64) {
        debug_assert!(new_length >= self.virtual_buffer_length);
        self.virtual_buffer_length = new_length;
    }

    /// True if contiguous unread data is buffered at the delivery point
    #[inline]
    pub fn has_unread_data(&self) -> bool {
        match self.chunks.front() {
            Some(chunk) => chunk.offset == self.base_offset + self.read_pending_length,
            None => false,
        }
    }

    /// Writes `data` at `offset`, deduplicating against buffered and
    /// delivered bytes.
    ///
    /// `write_limit` caps the growth of the total received length (the
    /// connection flow control credit for this write).
    pub fn write(&mut self, offset: u64, data: &[u8], write_limit: u64) -> Result<WriteOutcome, Error> {
        let end = offset + data.len() as u64;

        ensure!(
            end <= self.base_offset + self.virtual_buffer_length,
            Err(Error::WindowExceeded)
        );

        let written = end.saturating_sub(self.max_written_offset);
        ensure!(written <= write_limit, Err(Error::CreditExceeded));

        // Bytes below the read point are duplicates of delivered data
        let read_floor = self.base_offset + self.read_pending_length;
        let start = offset.max(read_floor);

        if start < end {
            self.insert(start, &data[(start - offset) as usize..]);
        }

        self.max_written_offset = self.max_written_offset.max(end);

        self.invariants();

        Ok(WriteOutcome {
            written,
            ready_to_deliver: self.has_unread_data(),
        })
    }

    /// Copies the uncovered parts of `[offset, offset + data.len())` into the
    /// chunk list, then coalesces adjacent chunks.
    fn insert(&mut self, offset: u64, data: &[u8]) {
        let end = offset + data.len() as u64;
        let mut gaps: Vec<(u64, &[u8])> = Vec::new();
        let mut cursor = offset;

        for chunk in &self.chunks {
            if cursor >= end {
                break;
            }
            if chunk.end() <= cursor {
                continue;
            }
            if chunk.offset > cursor {
                let gap_end = end.min(chunk.offset);
                gaps.push((
                    cursor,
                    &data[(cursor - offset) as usize..(gap_end - offset) as usize],
                ));
            }
            cursor = cursor.max(chunk.end());
        }
        if cursor < end {
            gaps.push((cursor, &data[(cursor - offset) as usize..]));
        }

        for (gap_offset, gap_data) in gaps {
            let idx = self
                .chunks
                .partition_point(|chunk| chunk.offset < gap_offset);
            self.chunks.insert(
                idx,
                Chunk {
                    offset: gap_offset,
                    data: BytesMut::from(gap_data),
                },
            );
        }

        self.coalesce();
    }

    /// Merges chunks that have become adjacent
    fn coalesce(&mut self) {
        let mut idx = 0;
        while idx + 1 < self.chunks.len() {
            if self.chunks[idx].end() == self.chunks[idx + 1].offset {
                let next = self.chunks.remove(idx + 1).expect("index checked");
                self.chunks[idx].data.extend_from_slice(&next.data);
            } else {
                idx += 1;
            }
        }
    }

    /// Reads up to 3 contiguous chunks at the delivery point, marking them
    /// pending until they are drained.
    ///
    /// Returns the absolute stream offset of the first chunk.
    pub fn read(&mut self) -> Option<(u64, Vec<Bytes>)> {
        let absolute_offset = self.base_offset + self.read_pending_length;
        let mut out = Vec::new();

        while out.len() < 3 && self.has_unread_data() {
            let chunk = self.chunks.pop_front().expect("has_unread_data");
            let bytes = chunk.data.freeze();
            self.read_pending_length += bytes.len() as u64;
            self.pending.push_back(bytes.clone());
            out.push(bytes);
        }

        ensure!(!out.is_empty(), None);
        Some((absolute_offset, out))
    }

    /// Releases `len` bytes of pending data, advancing the delivered prefix.
    ///
    /// With `requeue_remainder` any pending data past `len` is made readable
    /// again (single-receive mode); otherwise it stays pending until a later
    /// drain. Returns true if no pending and no unread data remains.
    pub fn drain(&mut self, len: u64, requeue_remainder: bool) -> bool {
        debug_assert!(len <= self.read_pending_length);
        let len = len.min(self.read_pending_length);

        let mut remaining = len;
        while remaining > 0 {
            let front = self.pending.front_mut().expect("pending covers len");
            if (front.len() as u64) <= remaining {
                remaining -= front.len() as u64;
                self.pending.pop_front();
            } else {
                front.advance(remaining as usize);
                remaining = 0;
            }
        }

        self.base_offset += len;
        self.read_pending_length -= len;

        if requeue_remainder && self.read_pending_length > 0 {
            // The reader consumed less than it was handed; rewind the
            // remainder so the next read delivers it again.
            let mut offset = self.base_offset + self.read_pending_length;
            while let Some(bytes) = self.pending.pop_back() {
                offset -= bytes.len() as u64;
                self.chunks.push_front(Chunk {
                    offset,
                    data: BytesMut::from(&bytes[..]),
                });
            }
            debug_assert_eq!(offset, self.base_offset);
            self.read_pending_length = 0;
            self.coalesce();
        }

        self.invariants();

        self.read_pending_length == 0 && !self.has_unread_data()
    }

    /// Drops all buffered data
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.pending.clear();
        self.read_pending_length = 0;
    }

    #[inline(always)]
    fn invariants(&self) {
        if cfg!(debug_assertions) {
            let mut prev_end = self.base_offset + self.read_pending_length;
            for chunk in &self.chunks {
                assert!(!chunk.data.is_empty(), "chunks must be non-empty");
                assert!(chunk.offset >= prev_end, "chunks must be disjoint");
                prev_end = chunk.end();
            }
            assert!(prev_end <= self.max_written_offset);
            assert_eq!(
                self.read_pending_length,
                self.pending.iter().map(|b| b.len() as u64).sum::<u64>()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_LIMIT: u64 = u64::MAX;

    fn buffer() -> ReceiveBuffer {
        ReceiveBuffer::new(64 * 1024)
    }

    fn read_all(buffer: &mut ReceiveBuffer) -> (u64, Vec<u8>) {
        let (offset, chunks) = buffer.read().expect("data expected");
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(&chunk);
        }
        (offset, out)
    }

    #[test]
    fn in_order_write_read_drain() {
        let mut buf = buffer();

        let outcome = buf.write(0, &[1, 2, 3, 4], NO_LIMIT).unwrap();
        assert_eq!(outcome.written, 4);
        assert!(outcome.ready_to_deliver);
        assert_eq!(buf.total_received_len(), 4);

        let (offset, data) = read_all(&mut buf);
        assert_eq!(offset, 0);
        assert_eq!(data, [1, 2, 3, 4]);
        assert_eq!(buf.read_pending_length(), 4);

        assert!(buf.drain(4, false));
        assert_eq!(buf.base_offset(), 4);
        assert_eq!(buf.read_pending_length(), 0);
    }

    #[test]
    fn out_of_order_writes_coalesce() {
        let mut buf = buffer();

        assert!(!buf.write(4, &[4, 5, 6, 7], NO_LIMIT).unwrap().ready_to_deliver);
        assert!(!buf.has_unread_data());

        let outcome = buf.write(0, &[0, 1, 2, 3], NO_LIMIT).unwrap();
        assert!(outcome.ready_to_deliver);

        let (offset, chunks) = buf.read().unwrap();
        assert_eq!(offset, 0);
        // adjacent writes coalesce into one chunk
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0][..], &[0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn duplicates_are_not_counted() {
        let mut buf = buffer();

        assert_eq!(buf.write(0, &[1, 2, 3, 4], NO_LIMIT).unwrap().written, 4);
        // exact duplicate
        assert_eq!(buf.write(0, &[1, 2, 3, 4], NO_LIMIT).unwrap().written, 0);
        // partial overlap only counts the new suffix
        assert_eq!(buf.write(2, &[3, 4, 5, 6], NO_LIMIT).unwrap().written, 2);

        let (_, data) = read_all(&mut buf);
        assert_eq!(data, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn overlapping_hole_fill() {
        let mut buf = buffer();

        buf.write(0, b"ab", NO_LIMIT).unwrap();
        buf.write(6, b"gh", NO_LIMIT).unwrap();
        // covers both existing chunks and the hole
        buf.write(0, b"abcdefgh", NO_LIMIT).unwrap();

        let (_, data) = read_all(&mut buf);
        assert_eq!(data, b"abcdefgh");
    }

    #[test]
    fn window_violation() {
        let mut buf = ReceiveBuffer::new(8);
        assert_eq!(
            buf.write(4, &[0; 8], NO_LIMIT).unwrap_err(),
            Error::WindowExceeded
        );

        // draining moves the window forward
        buf.write(0, &[0; 8], NO_LIMIT).unwrap();
        buf.read().unwrap();
        buf.drain(8, false);
        assert!(buf.write(8, &[0; 8], NO_LIMIT).is_ok());
    }

    #[test]
    fn credit_violation() {
        let mut buf = buffer();
        assert_eq!(
            buf.write(0, &[0; 10], 9).unwrap_err(),
            Error::CreditExceeded
        );
        // duplicates don't consume credit
        buf.write(0, &[0; 10], 10).unwrap();
        assert!(buf.write(0, &[0; 10], 0).is_ok());
    }

    #[test]
    fn partial_drain_requeues_remainder() {
        let mut buf = buffer();
        buf.write(0, b"hello world", NO_LIMIT).unwrap();

        let (_, data) = read_all(&mut buf);
        assert_eq!(data, b"hello world");

        // single-receive mode: the reader only took 5 bytes
        assert!(!buf.drain(5, true));
        assert_eq!(buf.base_offset(), 5);
        assert_eq!(buf.read_pending_length(), 0);

        let (offset, data) = read_all(&mut buf);
        assert_eq!(offset, 5);
        assert_eq!(data, b" world");
        assert!(buf.drain(6, true));
    }

    #[test]
    fn partial_drain_keeps_pending_in_multiple_mode() {
        let mut buf = buffer();
        buf.write(0, b"abcdef", NO_LIMIT).unwrap();
        read_all(&mut buf);

        assert!(!buf.drain(2, false));
        assert_eq!(buf.base_offset(), 2);
        assert_eq!(buf.read_pending_length(), 4);

        // nothing new to read; remaining bytes are still pending
        assert!(buf.read().is_none());
        assert!(buf.drain(4, false));
        assert_eq!(buf.base_offset(), 6);
    }

    #[test]
    fn reads_cap_at_three_chunks() {
        let mut buf = buffer();
        // non-adjacent offsets to prevent coalescing, then fill the holes
        buf.write(0, &[0; 10], NO_LIMIT).unwrap();
        buf.write(20, &[2; 10], NO_LIMIT).unwrap();
        buf.write(40, &[4; 10], NO_LIMIT).unwrap();
        buf.write(60, &[6; 10], NO_LIMIT).unwrap();

        assert!(buf.read().is_some());
        // only the first chunk was contiguous
        assert_eq!(buf.read_pending_length(), 10);

        buf.write(10, &[1; 10], NO_LIMIT).unwrap();
        buf.write(30, &[3; 10], NO_LIMIT).unwrap();
        buf.write(50, &[5; 10], NO_LIMIT).unwrap();

        // coalescing merged everything reachable into fewer chunks, so a
        // single read covers at most 3 of them
        let (offset, chunks) = buf.read().unwrap();
        assert_eq!(offset, 10);
        assert!(chunks.len() <= 3);
    }

    #[test]
    fn write_below_read_floor_is_ignored() {
        let mut buf = buffer();
        buf.write(0, b"abcd", NO_LIMIT).unwrap();
        read_all(&mut buf);
        buf.drain(4, false);

        let outcome = buf.write(0, b"abcd", NO_LIMIT).unwrap();
        assert_eq!(outcome.written, 0);
        assert!(!outcome.ready_to_deliver);
        assert!(buf.read().is_none());
    }

    #[test]
    fn model_check() {
        // randomized writes against a simple model of the stream contents
        bolero::check!()
            .with_type::<Vec<(u8, u8)>>()
            .for_each(|writes| {
                let mut buf = ReceiveBuffer::new(1024);
                let mut model = [None::<u8>; 512];

                for (offset, len) in writes {
                    let offset = *offset as u64;
                    let len = (*len % 32) as usize;
                    let data: Vec<u8> = (0..len).map(|i| (offset as usize + i) as u8).collect();
                    if buf.write(offset, &data, NO_LIMIT).is_ok() {
                        for (i, byte) in data.iter().enumerate() {
                            model[offset as usize + i] = Some(*byte);
                        }
                    }
                }

                // everything contiguous from 0 must read back exactly
                let mut expected = Vec::new();
                for slot in model.iter() {
                    match slot {
                        Some(byte) => expected.push(*byte),
                        None => break,
                    }
                }

                let mut actual = Vec::new();
                while let Some((_, chunks)) = buf.read() {
                    for chunk in chunks {
                        actual.extend_from_slice(&chunk);
                    }
                }
                assert_eq!(actual, expected);
            });
    }
}
