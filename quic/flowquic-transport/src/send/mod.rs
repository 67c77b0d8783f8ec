// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection-wide send management
//!
//! Anything that needs to go out is queued by setting a flag: connection
//! level frames on [`SendState::send_flags`], stream level frames on the
//! stream itself, with the stream linked into a priority-ordered queue here.
//! The actual framing happens in the connection's flush loop.

use crate::stream::StreamId;
use flowquic_core::time::Timestamp;

pub mod packet_builder;

/// Connection-level pending frame bits
pub mod flags {
    pub const ACK: u32 = 0x0000_0001;
    pub const CRYPTO: u32 = 0x0000_0002;
    pub const CONNECTION_CLOSE: u32 = 0x0000_0004;
    pub const APPLICATION_CLOSE: u32 = 0x0000_0008;
    pub const DATA_BLOCKED: u32 = 0x0000_0010;
    pub const MAX_DATA: u32 = 0x0000_0020;
    pub const MAX_STREAMS_BIDI: u32 = 0x0000_0040;
    pub const MAX_STREAMS_UNI: u32 = 0x0000_0080;
    pub const NEW_CONNECTION_ID: u32 = 0x0000_0100;
    pub const RETIRE_CONNECTION_ID: u32 = 0x0000_0200;
    pub const PATH_CHALLENGE: u32 = 0x0000_0400;
    pub const PATH_RESPONSE: u32 = 0x0000_0800;
    pub const PING: u32 = 0x0000_1000;
    pub const HANDSHAKE_DONE: u32 = 0x0000_2000;
    pub const DATAGRAM: u32 = 0x0000_4000;
    pub const DPLPMTUD: u32 = 0x0000_8000;
    pub const BIDI_STREAMS_BLOCKED: u32 = 0x0001_0000;
    pub const UNI_STREAMS_BLOCKED: u32 = 0x0002_0000;
    pub const ACK_FREQUENCY: u32 = 0x0004_0000;

    /// The only frames legal before the 1-RTT key is available
    pub const ALLOWED_HANDSHAKE: u32 =
        ACK | CRYPTO | CONNECTION_CLOSE | APPLICATION_CLOSE | PING;

    /// Frames that may be sent while congestion blocked
    pub const BYPASS_CC: u32 = ACK | CONNECTION_CLOSE | APPLICATION_CLOSE;

    /// Everything that stops making sense once the connection is closed
    pub const CONN_CLOSED_MASK: u32 = !(CONNECTION_CLOSE | APPLICATION_CLOSE);
}

/// Reasons the connection as a whole cannot make forward progress
pub mod blocked_reasons {
    pub const SCHEDULING: u8 = 0x01;
    pub const PACING: u8 = 0x02;
    pub const AMPLIFICATION_PROTECTION: u8 = 0x04;
    pub const CONGESTION_CONTROL: u8 = 0x08;
    pub const CONN_FLOW_CONTROL: u8 = 0x10;
}

/// After this many packets a round-robin scheduled stream yields its slot
pub const STREAM_SEND_BATCH_COUNT: u32 = 8;

/// Minimum amplification budget worth building a packet for
pub const MIN_SEND_ALLOWANCE: u32 = 75;

/// The outcome of one flush pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushResult {
    /// Everything sendable was sent
    Complete,
    /// Scheduling-limited; another flush is queued
    Incomplete,
    /// Congestion-window paced; the pacing timer is armed
    DelayedPacing,
}

#[derive(Clone, Copy, Debug)]
struct QueuedStream {
    id: StreamId,
    priority: u16,
}

/// The connection-wide send state shared by the scheduler, the congestion
/// controller hookup and every stream
#[derive(Debug)]
pub struct SendState {
    pub send_flags: u32,
    queue: Vec<QueuedStream>,

    /// Local connection flow control credit granted to the peer
    pub max_data: u64,
    /// Peer-granted connection flow control credit
    pub peer_max_data: u64,
    /// Total stream bytes put on the wire (first transmissions only)
    pub ordered_stream_bytes_sent: u64,
    /// Total stream bytes admitted from the peer
    pub ordered_stream_bytes_received: u64,
    /// Bytes delivered to the app since the last MAX_DATA update
    pub ordered_stream_bytes_delivered_accumulator: u64,

    pub(crate) last_flush_time: Option<Timestamp>,
    pub(crate) delayed_ack_timer_active: bool,
    pub(crate) flush_operation_pending: bool,
    pub(crate) tail_loss_probe_needed: bool,
    pub(crate) uninitialized: bool,

    /// Mirrors of connection state the flag filters depend on
    pub(crate) closed: bool,
    pub(crate) started: bool,

    /// Connection-wide out-flow blocked reasons (see [`blocked_reasons`])
    pub(crate) blocked_reasons: u8,
}

impl SendState {
    pub fn new(conn_flow_control_window: u64) -> Self {
        Self {
            send_flags: 0,
            queue: Vec::new(),
            max_data: conn_flow_control_window,
            peer_max_data: 0,
            ordered_stream_bytes_sent: 0,
            ordered_stream_bytes_received: 0,
            ordered_stream_bytes_delivered_accumulator: 0,
            last_flush_time: None,
            delayed_ack_timer_active: false,
            flush_operation_pending: false,
            tail_loss_probe_needed: false,
            uninitialized: false,
            closed: false,
            started: false,
            blocked_reasons: 0,
        }
    }

    /// Idempotently records a connection blocked reason; true if newly added
    #[inline]
    pub(crate) fn add_blocked_reason(&mut self, reason: u8) -> bool {
        let added = self.blocked_reasons & reason == 0;
        self.blocked_reasons |= reason;
        added
    }

    #[inline]
    pub(crate) fn remove_blocked_reason(&mut self, reason: u8) -> bool {
        let removed = self.blocked_reasons & reason != 0;
        self.blocked_reasons &= !reason;
        removed
    }

    /// Sets connection-level flags and requests a flush pass. Flags that
    /// need close-state filtering or timer interplay go through the
    /// connection instead.
    pub(crate) fn set_flag(&mut self, flags: u32) {
        if !self.closed && self.insert_flags(flags) {
            self.queue_flush();
        }
    }

    /// Sets connection-level flags. Returns true if any flag was newly set.
    #[inline]
    pub(crate) fn insert_flags(&mut self, flags: u32) -> bool {
        let changed = self.send_flags | flags != self.send_flags;
        self.send_flags |= flags;
        changed
    }

    #[inline]
    pub(crate) fn clear_flags(&mut self, flags: u32) {
        self.send_flags &= !flags;
    }

    /// Marks that a flush pass should run
    #[inline]
    pub(crate) fn queue_flush(&mut self) {
        self.flush_operation_pending = true;
    }

    #[inline]
    pub fn has_queued_streams(&self) -> bool {
        !self.queue.is_empty()
    }

    pub(crate) fn queued_stream_ids(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.queue.iter().map(|entry| entry.id)
    }

    /// Links a stream into the send queue: descending priority, FIFO within
    /// a priority class. No-op if already queued.
    pub(crate) fn queue_stream(&mut self, id: StreamId, priority: u16) {
        ensure!(!self.queue.iter().any(|entry| entry.id == id));

        // Search back to front for the insertion point
        let pos = self
            .queue
            .iter()
            .rposition(|entry| entry.priority >= priority)
            .map_or(0, |idx| idx + 1);
        self.queue.insert(pos, QueuedStream { id, priority });
    }

    pub(crate) fn remove_stream(&mut self, id: StreamId) {
        self.queue.retain(|entry| entry.id != id);
    }

    /// Re-sorts a stream after its priority changed
    pub(crate) fn update_stream_priority(&mut self, id: StreamId, priority: u16) {
        ensure!(self.queue.iter().any(|entry| entry.id == id));
        self.remove_stream(id);
        self.queue_stream(id, priority);
    }

    /// Moves the stream behind every other queued stream of the same
    /// priority (round-robin batching)
    pub(crate) fn rotate_stream(&mut self, id: StreamId) {
        let Some(idx) = self.queue.iter().position(|entry| entry.id == id) else {
            return;
        };
        let entry = self.queue.remove(idx);
        let pos = self
            .queue
            .iter()
            .rposition(|other| other.priority >= entry.priority)
            .map_or(0, |i| i + 1);
        self.queue.insert(pos, entry);
    }

    /// Drains the stream queue, returning the unlinked ids (connection close)
    pub(crate) fn clear_queue(&mut self) -> Vec<StreamId> {
        self.queue.drain(..).map(|entry| entry.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u64) -> StreamId {
        StreamId::new(v)
    }

    #[test]
    fn queue_orders_by_priority_fifo_within_class() {
        let mut send = SendState::new(1 << 20);
        send.queue_stream(id(0), 100);
        send.queue_stream(id(4), 200);
        send.queue_stream(id(8), 100);
        send.queue_stream(id(12), 200);

        let order: Vec<_> = send.queued_stream_ids().collect();
        assert_eq!(order, vec![id(4), id(12), id(0), id(8)]);
    }

    #[test]
    fn queue_is_idempotent() {
        let mut send = SendState::new(1 << 20);
        send.queue_stream(id(0), 100);
        send.queue_stream(id(0), 100);
        assert_eq!(send.queued_stream_ids().count(), 1);
    }

    #[test]
    fn rotation_stays_within_class() {
        let mut send = SendState::new(1 << 20);
        send.queue_stream(id(0), 200);
        send.queue_stream(id(4), 200);
        send.queue_stream(id(8), 100);

        send.rotate_stream(id(0));
        let order: Vec<_> = send.queued_stream_ids().collect();
        assert_eq!(order, vec![id(4), id(0), id(8)]);
    }

    #[test]
    fn priority_update_repositions() {
        let mut send = SendState::new(1 << 20);
        send.queue_stream(id(0), 100);
        send.queue_stream(id(4), 100);
        send.update_stream_priority(id(4), 300);
        let order: Vec<_> = send.queued_stream_ids().collect();
        assert_eq!(order, vec![id(4), id(0)]);
    }

    #[test]
    fn insert_flags_reports_changes() {
        let mut send = SendState::new(1 << 20);
        assert!(send.insert_flags(flags::MAX_DATA));
        assert!(!send.insert_flags(flags::MAX_DATA));
        assert!(send.insert_flags(flags::MAX_DATA | flags::PING));
        send.clear_flags(flags::MAX_DATA);
        assert_eq!(send.send_flags, flags::PING);
    }
}
