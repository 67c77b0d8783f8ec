// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-stream state: the send half with its recovery window and SACK
//! bookkeeping, and the receive half with reassembly and flow control
//! tuning.
//!
//! ```text
//! [   ][   ][   ][   ][   ][   ][   ][   ][   ] send requests
//!                  [   ]         [      ]       SACKs
//!    |                                          un_acked_offset
//!                                          |    next_send_offset
//!        |                                      recovery_next_offset
//!                       |                       recovery_end_offset
//!         xxxxxxxxxxxxxx                        recovery window
//! ```
//!
//! `un_acked_offset` works just like TCP's SND.UNA and tracks cumulatively
//! acked bytes. Noncontiguous acked regions past it are recorded as SACK
//! ranges, subsumed as `un_acked_offset` advances. Fresh bytes are sent at
//! (and advance) `next_send_offset`, but while the recovery window is open
//! (`recovery_next_offset < recovery_end_offset`) retransmissions from
//! `recovery_next_offset` go first. A closed recovery window only means all
//! loss-marked bytes were resent; recovery itself ends when
//! `un_acked_offset` passes `recovery_end_offset`.

use crate::{connection::Settings, range_set::RangeSet, send::SendState};
use bytes::Bytes;
use flowquic_core::buffer::ReceiveBuffer;
use flowquic_core::time::Timestamp;
use std::collections::VecDeque;

pub(crate) mod recv;
mod send;

#[cfg(test)]
mod tests;

/// The RFC 9000 stream identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u64);

impl StreamId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_server_initiated(self) -> bool {
        self.0 & 0x1 != 0
    }

    #[inline]
    pub fn is_unidirectional(self) -> bool {
        self.0 & 0x2 != 0
    }

    /// Index into the four per-type stream count tables
    #[inline]
    pub fn type_index(self) -> usize {
        (self.0 & 0x3) as usize
    }

    /// This stream's ordinal within its type, starting at 1
    #[inline]
    pub fn stream_count(self) -> u64 {
        (self.0 >> 2) + 1
    }
}

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

/// Stream-level pending frame bits
pub mod send_flags {
    pub const OPEN: u16 = 0x0001;
    pub const FIN: u16 = 0x0002;
    pub const DATA: u16 = 0x0004;
    pub const MAX_DATA: u16 = 0x0008;
    pub const DATA_BLOCKED: u16 = 0x0010;
    pub const SEND_ABORT: u16 = 0x0020;
    pub const RECV_ABORT: u16 = 0x0040;

    pub const ALL: u16 = 0x007f;

    /// Flags carried by STREAM frames themselves
    pub const DATA_FRAMES: u16 = OPEN | FIN | DATA;
    /// Flags carried by dedicated control frames
    pub const CONTROL_FRAMES: u16 = MAX_DATA | DATA_BLOCKED | SEND_ABORT | RECV_ABORT;
}

/// Flags on an application send request
pub mod request_flags {
    pub const START: u8 = 0x01;
    pub const FIN: u8 = 0x02;
    pub const ALLOW_0_RTT: u8 = 0x04;
    pub const DELAY_SEND: u8 = 0x08;
    /// The data was copied and completed at queue time
    pub const BUFFERED: u8 = 0x10;
}

/// Reasons a stream cannot make forward progress, kept for diagnostics and
/// for the DATA_BLOCKED edge triggers
pub mod blocked_reasons {
    pub const APP: u8 = 0x01;
    pub const STREAM_FLOW_CONTROL: u8 = 0x02;
}

pub(crate) const DEFAULT_SEND_PRIORITY: u16 = 0x7fff;

/// One queued application write
#[derive(Clone, Debug)]
pub struct SendRequest {
    pub(crate) stream_offset: u64,
    pub(crate) data: Bytes,
    pub(crate) flags: u8,
    /// Opaque app cookie echoed in `SendComplete`
    pub(crate) context: u64,
}

impl SendRequest {
    #[inline]
    pub(crate) fn end_offset(&self) -> u64 {
        self.stream_offset + self.data.len() as u64
    }
}

/// Boolean stream state, grouped like a bitfield
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamFlags {
    /// The stream is known to the peer (assigned and flushed)
    pub started: bool,
    /// App writes are currently accepted
    pub send_enabled: bool,
    /// The app queued a graceful send close
    pub local_close_fin: bool,
    /// The send direction was abortively closed
    pub local_close_reset: bool,
    /// The peer acknowledged our close (FIN or RESET)
    pub local_close_acked: bool,
    /// A frame for this stream has been acknowledged
    pub send_open_acked: bool,
    pub fin_acked: bool,
    pub in_recovery: bool,
    /// The app asked for sends to be batched with later work
    pub send_delayed: bool,
    /// `SendShutdownComplete` has fired
    pub send_shutdown_indicated: bool,

    /// Receiving is impossible (locally initiated unidirectional stream)
    pub remote_not_allowed: bool,
    pub remote_close_fin: bool,
    pub remote_close_reset: bool,
    pub remote_close_reset_reliable: bool,
    pub remote_close_acked: bool,
    pub sent_stop_sending: bool,
    pub received_stop_sending: bool,
    pub receive_enabled: bool,
    /// Multiple receive indications may be outstanding
    pub receive_multiple: bool,
    pub receive_data_pending: bool,
    pub receive_flush_queued: bool,
    pub receive_call_active: bool,
}

#[derive(Debug)]
pub struct Stream {
    pub(crate) id: StreamId,
    pub(crate) send_priority: u16,
    pub(crate) send_flags: u16,
    pub(crate) flags: StreamFlags,
    pub(crate) blocked_reasons: u8,

    // ===== send half =====
    /// Cumulative acked prefix (SND.UNA)
    pub(crate) un_acked_offset: u64,
    /// Next fresh byte to transmit
    pub(crate) next_send_offset: u64,
    /// Retransmission cursor; the recovery window is open while it is below
    /// `recovery_end_offset`
    pub(crate) recovery_next_offset: u64,
    pub(crate) recovery_end_offset: u64,
    /// Highest stream offset ever transmitted
    pub(crate) max_sent_length: u64,
    /// Total bytes queued by the app
    pub(crate) queued_send_offset: u64,
    /// Bytes the app allowed to go out in 0-RTT
    pub(crate) queued_zero_rtt: u64,
    /// Bytes confirmed sent in 0-RTT packets
    pub(crate) sent_zero_rtt: u64,
    /// Peer-granted stream flow control limit
    pub(crate) max_allowed_send_offset: u64,
    /// Cached `min(max_allowed_send_offset - un_acked_offset, u32::MAX)`
    pub(crate) send_window: u32,
    /// Acked ranges above `un_acked_offset`
    pub(crate) sparse_ack_ranges: RangeSet,
    pub(crate) send_requests: VecDeque<SendRequest>,
    /// Cursor hint into `send_requests` for sequential frame fills
    pub(crate) send_bookmark: usize,
    /// First request not yet absorbed by send buffering
    pub(crate) send_buffer_bookmark: usize,
    pub(crate) send_shutdown_error_code: u64,

    // ===== receive half =====
    pub(crate) recv_buffer: ReceiveBuffer,
    /// Stream flow control limit advertised to the peer
    pub(crate) max_allowed_recv_offset: u64,
    /// The stream's final size, or `u64::MAX` while unknown
    pub(crate) recv_max_length: u64,
    /// Highest offset received under the 0-RTT key
    pub(crate) recv_max_zero_rtt_length: u64,
    pub(crate) recv_window_bytes_delivered: u64,
    pub(crate) recv_window_last_update: Option<Timestamp>,
    /// Bytes indicated to the app and not yet completed
    pub(crate) recv_pending_length: u64,
    /// Bytes the app completed while a receive indication was outstanding
    pub(crate) recv_completion_length: u64,
    pub(crate) recv_shutdown_error_code: u64,
}

impl Stream {
    /// `local_endpoint_is_server` decides which initiator bit counts as
    /// "locally initiated"
    pub fn new(id: StreamId, local_endpoint_is_server: bool, settings: &Settings) -> Self {
        let locally_initiated = id.is_server_initiated() == local_endpoint_is_server;
        let remote_not_allowed = id.is_unidirectional() && locally_initiated;
        let local_not_allowed = id.is_unidirectional() && !locally_initiated;

        let mut flags = StreamFlags {
            send_enabled: !local_not_allowed,
            remote_not_allowed,
            receive_enabled: !remote_not_allowed,
            ..Default::default()
        };
        // Peer-opened streams don't need the opening frame bit
        if !locally_initiated {
            flags.started = true;
            flags.send_open_acked = true;
        }

        Self {
            id,
            send_priority: DEFAULT_SEND_PRIORITY,
            send_flags: 0,
            flags,
            blocked_reasons: 0,
            un_acked_offset: 0,
            next_send_offset: 0,
            recovery_next_offset: 0,
            recovery_end_offset: 0,
            max_sent_length: 0,
            queued_send_offset: 0,
            queued_zero_rtt: 0,
            sent_zero_rtt: 0,
            max_allowed_send_offset: settings.peer_initial_max_stream_data,
            send_window: settings.peer_initial_max_stream_data.min(u32::MAX as u64) as u32,
            sparse_ack_ranges: RangeSet::with_limit(settings.max_sack_ranges),
            send_requests: VecDeque::new(),
            send_bookmark: 0,
            send_buffer_bookmark: 0,
            send_shutdown_error_code: 0,
            recv_buffer: ReceiveBuffer::new(settings.stream_recv_window),
            max_allowed_recv_offset: settings.stream_recv_window,
            recv_max_length: u64::MAX,
            recv_max_zero_rtt_length: 0,
            recv_window_bytes_delivered: 0,
            recv_window_last_update: None,
            recv_pending_length: 0,
            recv_completion_length: 0,
            recv_shutdown_error_code: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[inline]
    pub fn send_priority(&self) -> u16 {
        self.send_priority
    }

    #[inline]
    pub fn send_flags(&self) -> u16 {
        self.send_flags
    }

    #[inline]
    pub fn flags(&self) -> &StreamFlags {
        &self.flags
    }

    /// Both directions fully closed: the connection can drop the stream
    #[inline]
    pub(crate) fn shutdown_complete(&self) -> bool {
        self.flags.local_close_acked && self.flags.remote_close_acked
    }

    /// Idempotently records a blocked reason; true if it was newly added
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

    /// Sets stream-level send flags, filtered by the current close state,
    /// and queues the stream with the scheduler. Returns true if any flag
    /// survived filtering.
    pub(crate) fn set_send_flags(
        &mut self,
        send: &mut SendState,
        mut flags: u16,
        delay_send: bool,
    ) -> bool {
        if send.closed {
            // Ignore all frames once the connection is closed
            return false;
        }

        // Drop flags that no longer make sense in the current state
        if self.flags.local_close_acked {
            flags &= !(send_flags::SEND_ABORT
                | send_flags::DATA_BLOCKED
                | send_flags::DATA
                | send_flags::OPEN
                | send_flags::FIN);
        } else if self.flags.local_close_reset {
            flags &= !(send_flags::DATA_BLOCKED
                | send_flags::DATA
                | send_flags::OPEN
                | send_flags::FIN);
        }
        if self.flags.remote_close_acked {
            flags &= !(send_flags::RECV_ABORT | send_flags::MAX_DATA);
        } else if self.flags.remote_close_fin || self.flags.remote_close_reset {
            flags &= !send_flags::MAX_DATA;
        }

        if (self.send_flags | flags) != self.send_flags
            || (self.flags.send_delayed && flags & send_flags::DATA != 0)
        {
            tracing::trace!(
                stream = %self.id,
                flags = format_args!("{:#x}", flags & !self.send_flags),
                "scheduling stream send flags"
            );
            if self.flags.started {
                send.queue_stream(self.id, self.send_priority);
                if delay_send {
                    self.flags.send_delayed = true;
                } else if send.started {
                    self.flags.send_delayed = false;
                    send.queue_flush();
                }
            }
            self.send_flags |= flags;
        }

        flags != 0
    }

    /// Clears stream-level send flags, unlinking the stream from the
    /// scheduler queue when none remain
    pub(crate) fn clear_send_flags(&mut self, send: &mut SendState, flags: u16) {
        if self.send_flags & flags != 0 {
            self.send_flags &= !flags;
            if self.send_flags == 0 {
                send.remove_stream(self.id);
            }
        }
    }
}
