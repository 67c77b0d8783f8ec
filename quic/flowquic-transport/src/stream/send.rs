// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Send-side stream logic: queueing app data, framing STREAM frames with
//! SACK-guided retransmission, and reacting to acknowledgments and losses.

use crate::{
    event::{Event, EventHandler},
    send::{
        packet_builder::{PacketBuilder, MAX_FRAMES_PER_PACKET},
        SendState,
    },
    space::SentFrame,
    stream::{blocked_reasons, request_flags, send_flags, SendRequest, Stream},
};
use bytes::Bytes;
use flowquic_core::{frame, packet::KeyType, transport, varint::VarInt};

#[inline]
fn varint(value: u64) -> VarInt {
    VarInt::new(value).expect("value within varint range")
}

/// True if the recovery window is open
macro_rules! recovery_window_open {
    ($stream:expr) => {
        $stream.flags.in_recovery && $stream.recovery_next_offset < $stream.recovery_end_offset
    };
}

impl Stream {
    /// Marks the stream live on the wire: the next STREAM frame carries the
    /// opening transmission
    pub(crate) fn start(&mut self, send: &mut SendState) {
        ensure!(!self.flags.started);
        self.flags.started = true;
        self.set_send_flags(send, send_flags::OPEN, false);
    }

    /// Queues one application write.
    ///
    /// Returns true if the request asked for the stream to be started.
    pub(crate) fn queue_app_send(
        &mut self,
        send: &mut SendState,
        data: Bytes,
        flags: u8,
        context: u64,
        buffering_enabled: bool,
        handler: &mut impl EventHandler,
    ) -> bool {
        if !self.flags.send_enabled {
            // Only possible when more sends are queued after one carrying FIN
            handler.on_stream_event(
                self.id,
                Event::SendComplete {
                    canceled: true,
                    context,
                },
            );
            return false;
        }

        let mut request = SendRequest {
            stream_offset: self.queued_send_offset,
            data,
            flags,
            context,
        };
        self.queued_send_offset += request.data.len() as u64;

        if flags & request_flags::ALLOW_0_RTT != 0 && self.queued_zero_rtt == request.stream_offset
        {
            self.queued_zero_rtt = self.queued_send_offset;
        }

        if buffering_enabled {
            // Ownership of the bytes moves into the queue, so the request can
            // complete to the app right away
            request.flags |= request_flags::BUFFERED;
            self.send_buffer_bookmark = self.send_requests.len() + 1;
            handler.on_stream_event(
                self.id,
                Event::SendComplete {
                    canceled: false,
                    context,
                },
            );
        }

        tracing::trace!(
            stream = %self.id,
            offset = request.stream_offset,
            len = request.data.len(),
            "send request queued"
        );

        self.send_requests.push_back(request);
        self.remove_blocked_reason(blocked_reasons::APP);

        let start_requested = flags & request_flags::START != 0 && !self.flags.started;

        if flags & request_flags::FIN != 0 {
            self.send_shutdown(
                send,
                true,
                false,
                flags & request_flags::DELAY_SEND != 0,
                0,
                handler,
            );
        }

        self.set_send_flags(
            send,
            send_flags::DATA,
            flags & request_flags::DELAY_SEND != 0,
        );

        start_requested
    }

    /// Closes the send direction, gracefully or abortively.
    ///
    /// Returns true if stream teardown should be attempted.
    pub(crate) fn send_shutdown(
        &mut self,
        send: &mut SendState,
        graceful: bool,
        silent: bool,
        delay_send: bool,
        error_code: u64,
        handler: &mut impl EventHandler,
    ) -> bool {
        if self.flags.local_close_acked {
            // Already closed and acknowledged by the peer
            return silent;
        }

        self.flags.send_enabled = false;

        if graceful {
            debug_assert!(!silent);
            if self.flags.local_close_fin || self.flags.local_close_reset {
                // Already closed; a graceful close cannot follow
                return false;
            }

            self.flags.local_close_fin = true;
            self.set_send_flags(send, send_flags::FIN, delay_send);
            return false;
        }

        // Deliver all cancellations before any state changes
        while let Some(request) = self.send_requests.pop_front() {
            if request.flags & request_flags::BUFFERED == 0 {
                handler.on_stream_event(
                    self.id,
                    Event::SendComplete {
                        canceled: true,
                        context: request.context,
                    },
                );
            }
        }
        self.send_bookmark = 0;
        self.send_buffer_bookmark = 0;

        if silent {
            // The handle is going away: clear everything and treat the close
            // as implicitly acknowledged
            self.clear_send_flags(send, send_flags::ALL);
            self.flags.local_close_acked = true;
            self.indicate_send_shutdown_complete(false, handler);
        }

        if self.flags.local_close_reset {
            return silent;
        }

        self.flags.local_close_reset = true;
        self.send_shutdown_error_code = error_code;
        tracing::debug!(stream = %self.id, error_code, "send path aborted");

        if !silent {
            self.set_send_flags(send, send_flags::SEND_ABORT, false);
            self.clear_send_flags(
                send,
                send_flags::DATA_BLOCKED
                    | send_flags::DATA
                    | send_flags::OPEN
                    | send_flags::FIN,
            );
        }

        silent
    }

    pub(crate) fn indicate_send_shutdown_complete(
        &mut self,
        graceful: bool,
        handler: &mut impl EventHandler,
    ) {
        debug_assert!(!self.flags.send_enabled);
        if !self.flags.send_shutdown_indicated {
            self.flags.send_shutdown_indicated = true;
            handler.on_stream_event(self.id, Event::SendShutdownComplete { graceful });
        }
    }

    /// True if any stream bytes remain to send (fresh or retransmission)
    pub(crate) fn has_pending_stream_data(&self) -> bool {
        recovery_window_open!(self) || self.next_send_offset < self.queued_send_offset
    }

    /// True if data queued for 0-RTT remains unsent
    pub(crate) fn has_pending_zero_rtt_data(&self) -> bool {
        self.queued_zero_rtt > self.next_send_offset
            || (self.next_send_offset == self.queued_send_offset
                && self.send_flags & send_flags::FIN != 0)
    }

    /// True if a STREAM frame could be written right now, congestion aside
    pub(crate) fn can_write_data_frames(&self, send: &SendState) -> bool {
        debug_assert!(self.send_flags & send_flags::DATA_FRAMES != 0);

        if self.send_flags & send_flags::OPEN != 0 {
            // Flow control doesn't block opening a new stream
            return true;
        }

        if recovery_window_open!(self) {
            // Retransmissions ignore flow control; those bytes were already
            // accounted for
            return true;
        }

        if self.next_send_offset == self.queued_send_offset {
            // No unsent data; only a FIN could go out
            return self.send_flags & send_flags::FIN != 0;
        }

        self.next_send_offset < self.max_allowed_send_offset
            && send.ordered_stream_bytes_sent < send.peer_max_data
    }

    /// True if this stream can contribute frames to a packet right now.
    /// `allowed_by_peer` is the stream-count admission check.
    pub(crate) fn can_send_now(&self, zero_rtt: bool, allowed_by_peer: bool, send: &SendState) -> bool {
        debug_assert!(self.send_flags != 0);

        if !allowed_by_peer {
            return false;
        }

        if self.send_flags & send_flags::CONTROL_FRAMES != 0
            || self.send_flags & send_flags::OPEN != 0
        {
            // Control frames and stream opens always qualify
            return true;
        }

        if self.send_flags & send_flags::DATA_FRAMES != 0 && self.can_write_data_frames(send) {
            return !zero_rtt || self.has_pending_zero_rtt_data();
        }

        false
    }

    /// Writes this stream's pending frames into the packet under
    /// construction. Returns true if any frame was written.
    pub(crate) fn write_frames(&mut self, send: &mut SendState, builder: &mut PacketBuilder) -> bool {
        debug_assert!(builder.metadata.frame_count() < MAX_FRAMES_PER_PACKET);
        debug_assert!(self.send_flags != 0);
        debug_assert!(matches!(
            builder.key_type,
            KeyType::OneRtt | KeyType::ZeroRtt
        ));

        let prev_frame_count = builder.metadata.frame_count();

        if self.send_flags & send_flags::MAX_DATA != 0 {
            let frame = frame::MaxStreamData {
                stream_id: varint(self.id.as_u64()),
                maximum_stream_data: varint(self.max_allowed_recv_offset),
            };
            if let Some(len) = frame.encode(builder.frame_buf()) {
                builder.commit(len);
                self.send_flags &= !send_flags::MAX_DATA;
                if builder.add_frame(SentFrame::MaxStreamData { id: self.id }, true) {
                    return true;
                }
            }
        }

        if self.send_flags & send_flags::SEND_ABORT != 0 {
            let frame = frame::ResetStream {
                stream_id: varint(self.id.as_u64()),
                error_code: varint(self.send_shutdown_error_code),
                final_size: varint(self.max_sent_length),
            };
            if let Some(len) = frame.encode(builder.frame_buf()) {
                builder.commit(len);
                self.send_flags &= !send_flags::SEND_ABORT;
                if builder.add_frame(SentFrame::ResetStream { id: self.id }, true) {
                    return true;
                }
            }
        }

        if self.send_flags & send_flags::RECV_ABORT != 0 {
            let frame = frame::StopSending {
                stream_id: varint(self.id.as_u64()),
                error_code: varint(self.recv_shutdown_error_code),
            };
            if let Some(len) = frame.encode(builder.frame_buf()) {
                builder.commit(len);
                self.send_flags &= !send_flags::RECV_ABORT;
                if builder.add_frame(SentFrame::StopSending { id: self.id }, true) {
                    return true;
                }
            }
        }

        if self.send_flags & send_flags::DATA_FRAMES != 0 && self.can_write_data_frames(send) {
            self.write_stream_frames(send, builder);

            if !self.has_pending_stream_data() {
                self.send_flags &= !send_flags::DATA;
            }

            if builder.metadata.frame_count() == MAX_FRAMES_PER_PACKET {
                return true;
            }
        }

        if self.send_flags & send_flags::DATA_BLOCKED != 0 {
            let frame = frame::StreamDataBlocked {
                stream_id: varint(self.id.as_u64()),
                stream_data_limit: varint(self.next_send_offset),
            };
            if let Some(len) = frame.encode(builder.frame_buf()) {
                builder.commit(len);
                self.send_flags &= !send_flags::DATA_BLOCKED;
                if builder.add_frame(SentFrame::StreamDataBlocked { id: self.id }, true) {
                    return true;
                }
            }
        }

        builder.metadata.frame_count() > prev_frame_count
    }

    /// Fills the packet with STREAM frames, walking the recovery window,
    /// SACK holes and flow control limits
    fn write_stream_frames(&mut self, send: &mut SendState, builder: &mut PacketBuilder) {
        while builder.remaining_space() > 0
            && builder.metadata.frame_count() < MAX_FRAMES_PER_PACKET
        {
            // Frame bounds: `left` is the first byte of the frame, `right`
            // the first byte after it.
            let recovery = recovery_window_open!(self);
            let left = if recovery {
                self.recovery_next_offset
            } else {
                self.next_send_offset
            };
            let mut right = left + builder.remaining_space() as u64;

            if recovery
                && right > self.recovery_end_offset
                && self.recovery_end_offset != self.next_send_offset
            {
                right = self.recovery_end_offset;
            }

            // The first SACK at or past the selected offset bounds the frame
            let sack = if left == self.max_sent_length {
                // Transmitting new bytes; no such SACK can exist
                None
            } else {
                self.sparse_ack_ranges.iter().find(|s| {
                    debug_assert!(s.low >= left || s.high() <= left);
                    s.low >= left
                })
            };

            if let Some(sack) = sack {
                right = right.min(sack.low);
            } else {
                right = right.min(self.queued_send_offset);
            }

            // Stream flow control
            right = right.min(self.max_allowed_send_offset);

            // Connection flow control
            let max_conn_flow_control_offset = self.max_sent_length
                + (send.peer_max_data - send.ordered_stream_bytes_sent);
            right = right.min(max_conn_flow_control_offset);

            // `right == left` is fine: opening and FIN frames are empty
            debug_assert!(right >= left);

            let Some(payload_len) = self.write_one_frame(builder, left, (right - left) as u16)
            else {
                // Too little room for anything more
                break;
            };

            let mut exit_loop = payload_len == 0;

            // Recalculate with what actually fit
            let right = left + payload_len as u64;

            debug_assert!(right <= self.queued_send_offset);
            if right == self.queued_send_offset {
                self.add_blocked_reason(blocked_reasons::APP);
                exit_loop = true;
            }

            debug_assert!(right <= self.max_allowed_send_offset);
            if right == self.max_allowed_send_offset {
                if self.add_blocked_reason(blocked_reasons::STREAM_FLOW_CONTROL) {
                    self.send_flags |= send_flags::DATA_BLOCKED;
                }
                exit_loop = true;
            }

            debug_assert!(right <= max_conn_flow_control_offset);
            if right == max_conn_flow_control_offset {
                if send.add_blocked_reason(crate::send::blocked_reasons::CONN_FLOW_CONTROL) {
                    send.insert_flags(crate::send::flags::DATA_BLOCKED);
                }
                exit_loop = true;
            }

            // Advance the active cursor, hopping over a SACK it landed on
            if recovery {
                debug_assert!(self.recovery_next_offset <= right);
                self.recovery_next_offset = right;
                if let Some(sack) = sack {
                    if self.recovery_next_offset == sack.low {
                        self.recovery_next_offset += sack.count;
                    }
                }
            }

            if self.next_send_offset < right {
                self.next_send_offset = right;
                if let Some(sack) = sack {
                    if self.next_send_offset == sack.low {
                        self.next_send_offset += sack.count;
                    }
                }
            }

            if self.max_sent_length < right {
                send.ordered_stream_bytes_sent += right - self.max_sent_length;
                debug_assert!(send.ordered_stream_bytes_sent <= send.peer_max_data);
                self.max_sent_length = right;
            }

            self.validate_recovery_state();

            if exit_loop {
                break;
            }
        }
    }

    /// Writes a single STREAM frame at `offset` carrying at most
    /// `max_payload` bytes. Returns the payload length, or `None` if nothing
    /// was written (no room, or no payload/FIN/open to carry).
    fn write_one_frame(
        &mut self,
        builder: &mut PacketBuilder,
        offset: u64,
        max_payload: u16,
    ) -> Option<u16> {
        let id = varint(self.id.as_u64());
        let buf_len = builder.remaining_space() as usize;

        let header_len = frame::stream_header_size(id, offset, max_payload as u64);
        ensure!(buf_len >= header_len, None);

        let mut payload_len = max_payload.min((buf_len - header_len) as u16);
        if payload_len > 0 {
            debug_assert!(offset < self.queued_send_offset);
            payload_len = payload_len.min((self.queued_send_offset - offset) as u16);
            debug_assert!(payload_len > 0);
        }

        let fin = self.send_flags & send_flags::FIN != 0
            && offset + payload_len as u64 == self.queued_send_offset;

        if payload_len == 0 && !fin && self.send_flags & send_flags::OPEN == 0 {
            // No bytes, no open, no FIN: no frame
            return None;
        }

        let buf = builder.frame_buf();
        let header_len =
            frame::encode_stream_header(buf, id, offset, payload_len as u64, fin)?;
        if payload_len > 0 {
            let end = header_len + payload_len as usize;
            self.copy_from_requests(offset, &mut buf[header_len..end]);
        }

        builder.commit(header_len + payload_len as usize);

        let open = self.send_flags & send_flags::OPEN != 0;
        if open {
            self.send_flags &= !send_flags::OPEN;
        }
        if fin {
            self.send_flags &= !send_flags::FIN;
        }

        tracing::trace!(
            stream = %self.id,
            offset,
            len = payload_len,
            fin,
            "stream frame built"
        );

        builder.add_frame(
            SentFrame::Stream {
                id: self.id,
                offset,
                length: payload_len,
                open,
                fin,
            },
            true,
        );

        Some(payload_len)
    }

    /// Copies `out.len()` stream bytes starting at `offset` from the
    /// noncontiguous send request queue, using the bookmark when the request
    /// is at or past it (retransmissions may have to search from the start)
    pub(crate) fn copy_from_requests(&mut self, offset: u64, out: &mut [u8]) {
        debug_assert!(!out.is_empty());
        debug_assert!(!self.send_requests.is_empty());

        let mut index = if self
            .send_requests
            .get(self.send_bookmark)
            .is_some_and(|request| request.stream_offset <= offset)
        {
            self.send_bookmark
        } else {
            0
        };

        let mut copied = 0usize;
        let mut cursor = offset;
        while copied < out.len() {
            // Find the request containing the cursor, skipping empty ones
            while self.send_requests[index].end_offset() <= cursor {
                index += 1;
            }

            let request = &self.send_requests[index];
            let within = (cursor - request.stream_offset) as usize;
            let available = request.data.len() - within;
            let take = available.min(out.len() - copied);
            debug_assert!(take > 0);
            out[copied..copied + take]
                .copy_from_slice(&request.data[within..within + take]);
            copied += take;
            cursor += take as u64;
        }

        self.send_bookmark = index;
    }

    /// Processes the acknowledgment of one previously sent STREAM frame
    pub(crate) fn on_ack(
        &mut self,
        send: &mut SendState,
        key_type: KeyType,
        offset: u64,
        length: u16,
        fin: bool,
        handler: &mut impl EventHandler,
    ) -> Result<(), transport::Error> {
        let following_offset = offset + length as u64;
        let mut remove_send_flags = 0u16;

        debug_assert!(following_offset <= self.queued_send_offset);

        tracing::trace!(
            stream = %self.id,
            offset,
            length,
            "stream frame acknowledged"
        );

        if key_type == KeyType::ZeroRtt && self.sent_zero_rtt < following_offset {
            self.sent_zero_rtt = following_offset;
        }

        if !self.flags.send_open_acked {
            // The peer acknowledged a STREAM frame, so it definitely knows
            // the stream exists
            self.flags.send_open_acked = true;
            remove_send_flags |= send_flags::OPEN;
        }

        if fin {
            self.flags.fin_acked = true;
            remove_send_flags |= send_flags::FIN;
        }

        if offset <= self.un_acked_offset {
            if self.un_acked_offset < following_offset {
                self.un_acked_offset = following_offset;

                // Subsume any SACKs the cumulative prefix caught up to
                self.sparse_ack_ranges.set_min(self.un_acked_offset);
                if let Some(sack) = self.sparse_ack_ranges.first() {
                    if sack.low == self.un_acked_offset {
                        self.un_acked_offset = sack.high();
                        self.sparse_ack_ranges.remove(0);
                    }
                }

                if self.next_send_offset < self.un_acked_offset {
                    self.next_send_offset = self.un_acked_offset;
                }
                if self.recovery_next_offset < self.un_acked_offset {
                    self.recovery_next_offset = self.un_acked_offset;
                }
                if self.recovery_end_offset < self.un_acked_offset {
                    // Recovered successfully
                    self.flags.in_recovery = false;
                }
            }

            // Pop any fully-acked requests; completions fire strictly in
            // queue order
            let mut popped = 0usize;
            while let Some(request) = self.send_requests.front() {
                if request.end_offset() > self.un_acked_offset {
                    break;
                }
                let request = self.send_requests.pop_front().expect("front checked");
                popped += 1;
                if request.flags & request_flags::BUFFERED == 0 {
                    handler.on_stream_event(
                        self.id,
                        Event::SendComplete {
                            canceled: false,
                            context: request.context,
                        },
                    );
                }
            }
            self.send_bookmark = self.send_bookmark.saturating_sub(popped);
            self.send_buffer_bookmark = self.send_buffer_bookmark.saturating_sub(popped);

            if self.un_acked_offset == self.queued_send_offset && self.flags.fin_acked {
                debug_assert!(self.send_requests.is_empty());
                tracing::debug!(stream = %self.id, "send queue completely drained");

                if !self.flags.local_close_acked {
                    self.flags.local_close_acked = true;
                    self.indicate_send_shutdown_complete(true, handler);
                }
            }
        } else {
            match self.sparse_ack_ranges.add(offset, length as u64) {
                Err(_) => {
                    return Err(transport::Error::INTERNAL_ERROR
                        .with_reason("sparse ack range limit exceeded"));
                }
                Ok((sack, updated)) => {
                    if updated {
                        // The write path assumes the send cursors point at
                        // unacknowledged bytes; fix them up if this SACK
                        // swallowed them.
                        if sack.contains(self.next_send_offset) {
                            self.next_send_offset = sack.high();
                        }
                        if sack.contains(self.recovery_next_offset) {
                            self.recovery_next_offset = sack.high();
                        }
                    }
                }
            }
        }

        if !self.has_pending_stream_data() {
            remove_send_flags |= send_flags::DATA;
        }

        if remove_send_flags != 0 {
            self.clear_send_flags(send, remove_send_flags);
        }

        self.validate_recovery_state();
        Ok(())
    }

    /// Processes the loss of one previously sent STREAM frame.
    ///
    /// Returns true if data was queued for retransmission.
    pub(crate) fn on_loss(
        &mut self,
        send: &mut SendState,
        offset: u64,
        length: u16,
        open: bool,
        fin: bool,
    ) -> bool {
        if self.flags.local_close_reset {
            // The send path was aborted; nothing to recover
            return false;
        }

        let mut add_send_flags = 0u16;

        let mut start = offset;
        let mut end = offset + length as u64;

        if open && !self.flags.send_open_acked {
            add_send_flags |= send_flags::OPEN;
        }

        if fin && !self.flags.fin_acked {
            add_send_flags |= send_flags::FIN;
        }

        // Clip the range against data already acknowledged elsewhere
        'recover: {
            if end <= self.un_acked_offset {
                break 'recover;
            }
            if start < self.un_acked_offset {
                start = self.un_acked_offset;
            }

            for sack in self.sparse_ack_ranges.iter() {
                if sack.low >= end {
                    break;
                }
                if start < sack.high() {
                    if start >= sack.low {
                        if end <= sack.high() {
                            // Fully covered by the SACK
                            break 'recover;
                        }
                        // Covers the start: move it past the SACK
                        start = sack.high();
                    } else if end <= sack.high() {
                        // Covers the end: stop right before the SACK
                        end = sack.low;
                    }
                    // A SACK strictly inside the range still leaves both
                    // edges to retransmit
                }
            }

            let mut updated_recovery_window = false;
            if start < self.recovery_next_offset {
                self.recovery_next_offset = start;
                updated_recovery_window = true;
            }
            if self.recovery_end_offset < end {
                self.recovery_end_offset = end;
                updated_recovery_window = true;
            }

            if updated_recovery_window {
                tracing::debug!(
                    stream = %self.id,
                    start,
                    end,
                    "recovering stream bytes"
                );
                add_send_flags |= send_flags::DATA;
            }
        }

        if add_send_flags != 0 {
            if !self.flags.in_recovery {
                self.flags.in_recovery = true;
            }
            let queued = self.set_send_flags(send, add_send_flags, false);
            self.validate_recovery_state();
            return queued;
        }

        false
    }

    /// The peer acknowledged our RESET_STREAM
    pub(crate) fn on_reset_ack(&mut self, handler: &mut impl EventHandler) {
        if !self.flags.local_close_acked {
            self.flags.local_close_acked = true;
            self.indicate_send_shutdown_complete(false, handler);
        }
    }

    /// The peer granted more stream send credit
    pub(crate) fn on_max_stream_data(&mut self, send: &mut SendState, maximum_data: u64) -> bool {
        ensure!(self.max_allowed_send_offset < maximum_data, false);

        self.max_allowed_send_offset = maximum_data;
        self.send_window =
            (self.max_allowed_send_offset - self.un_acked_offset).min(u32::MAX as u64) as u32;

        // The stream may have been blocked; let the scheduler retry
        self.remove_blocked_reason(blocked_reasons::STREAM_FLOW_CONTROL);
        self.clear_send_flags(send, send_flags::DATA_BLOCKED);
        send.queue_flush();
        true
    }

    #[inline]
    fn validate_recovery_state(&self) {
        if cfg!(debug_assertions) {
            assert!(self.un_acked_offset <= self.next_send_offset);
            assert!(self.next_send_offset <= self.max_sent_length);
            assert!(self.max_sent_length <= self.queued_send_offset);
            if recovery_window_open!(self) {
                assert!(self.un_acked_offset <= self.recovery_next_offset);
                for sack in self.sparse_ack_ranges.iter() {
                    if sack.low < self.recovery_next_offset {
                        // The recovery window never starts inside a SACK
                        assert!(sack.high() <= self.recovery_next_offset);
                    }
                }
            }
        }
    }
}
