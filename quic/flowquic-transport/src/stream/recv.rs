// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Receive-side stream logic: STREAM/RESET/STOP_SENDING processing, the
//! delivery loop, and receive window tuning.
//!
//! MAX_DATA / MAX_STREAM_DATA updates follow the original design: whenever
//! bytes are delivered, a MAX_STREAM_DATA update goes out if an ACK is
//! already queued or the tuning algorithm below grew the window. The
//! connection-wide MAX_DATA is driven by its own delivered-bytes
//! accumulator, so that workloads of many short streams still refresh the
//! connection window even though no single stream crosses its own drain
//! threshold.

use crate::{
    connection::Settings,
    event::{Event, EventHandler},
    send::{flags as conn_flags, SendState},
    stream::{send_flags, Stream},
};
use flowquic_core::{
    buffer,
    recovery::RttEstimator,
    time::Timestamp,
    transport,
    varint::MAX_VARINT_VALUE,
};

/// MAX_DATA / MAX_STREAM_DATA updates fire after this fraction of the
/// window has been delivered to the app
pub const RECV_BUFFER_DRAIN_RATIO: u64 = 4;

/// What the connection should do after processing an inbound stream frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RecvFlushDisposition {
    None,
    /// Queue a receive flush on the operation queue
    Queue,
    /// All data up to the FIN is contiguous; flush inline
    Inline,
}

impl Stream {
    /// Closes the receive direction. Returns true if stream teardown should
    /// be attempted.
    pub(crate) fn recv_shutdown(
        &mut self,
        send: &mut SendState,
        mut silent: bool,
        error_code: u64,
        handler: &mut impl EventHandler,
    ) -> bool {
        if silent {
            // Implicitly treat the remote close as completed
            self.flags.sent_stop_sending = true;
            self.flags.remote_close_acked = true;
            self.flags.receive_enabled = false;
            self.flags.receive_data_pending = false;
            return true;
        }

        if self.flags.remote_close_acked
            || self.flags.remote_close_fin
            || self.flags.remote_close_reset
        {
            // The peer already closed; nothing to do
            return false;
        }

        if self.flags.sent_stop_sending {
            // Already aborted locally
            return false;
        }

        self.flags.receive_enabled = false;
        self.flags.receive_data_pending = false;

        self.recv_shutdown_error_code = error_code;
        self.flags.sent_stop_sending = true;

        if self.recv_max_length != u64::MAX {
            // The peer already closed gracefully; we just hadn't drained up
            // to that point. Treat the shutdown as an acknowledged reset.
            let _ = self.process_reset_frame(send, self.recv_max_length, 0, handler);
            silent = true;
            return silent;
        }

        self.set_send_flags(send, send_flags::RECV_ABORT, false);
        self.clear_send_flags(send, send_flags::MAX_DATA);

        false
    }

    /// Processes a received RESET_STREAM. Returns true if stream teardown
    /// should be attempted.
    pub(crate) fn process_reset_frame(
        &mut self,
        send: &mut SendState,
        final_size: u64,
        error_code: u64,
        handler: &mut impl EventHandler,
    ) -> Result<bool, transport::Error> {
        self.flags.remote_close_reset = true;

        ensure!(!self.flags.remote_close_acked, Ok(false));
        self.flags.remote_close_acked = true;
        self.flags.receive_enabled = false;
        self.flags.receive_data_pending = false;

        let total_recv_length = self.recv_buffer.total_received_len();
        if total_recv_length > final_size {
            // The final size contradicts data the peer already sent us
            return Err(transport::Error::FINAL_SIZE_ERROR
                .with_reason("reset below received bytes"));
        }

        if total_recv_length < final_size {
            // More data was "sent" than we received; account for it so the
            // connection flow control stays in sync with the peer
            let flow_control_increase = final_size - total_recv_length;
            send.ordered_stream_bytes_received = send
                .ordered_stream_bytes_received
                .checked_add(flow_control_increase)
                .ok_or_else(|| {
                    transport::Error::FINAL_SIZE_ERROR.with_reason("reset final size overflow")
                })?;
            if send.ordered_stream_bytes_received > send.max_data {
                return Err(transport::Error::FINAL_SIZE_ERROR
                    .with_reason("reset final size exceeds flow control"));
            }
        }

        let total_read_length = self.recv_buffer.base_offset();
        if total_read_length < final_size {
            // Credit back everything the app will never read
            send.max_data += final_size - total_read_length;
            send.set_flag(conn_flags::MAX_DATA);
        }

        tracing::debug!(stream = %self.id, error_code, "closed remotely (reset)");

        if !self.flags.sent_stop_sending {
            handler.on_stream_event(self.id, Event::PeerSendAborted { error_code });
        }

        self.clear_send_flags(send, send_flags::MAX_DATA | send_flags::RECV_ABORT);

        Ok(true)
    }

    /// Processes a received RELIABLE_RESET_STREAM. Returns true if stream
    /// teardown should be attempted.
    pub(crate) fn process_reliable_reset_frame(
        &mut self,
        send: &mut SendState,
        error_code: u64,
        reliable_offset: u64,
        negotiated: bool,
        handler: &mut impl EventHandler,
    ) -> Result<bool, transport::Error> {
        if !negotiated {
            // The peer used an experimental feature without negotiating it
            return Err(transport::Error::TRANSPORT_PARAMETER_ERROR
                .with_reason("reliable reset not negotiated"));
        }

        // Only strictly decreasing reliable offsets are accepted
        if self.recv_max_length == 0 || reliable_offset < self.recv_max_length {
            self.recv_max_length = reliable_offset;
            self.flags.remote_close_reset_reliable = true;
            tracing::debug!(
                stream = %self.id,
                reliable_offset,
                "reliable recv offset set"
            );
        }

        if self.recv_buffer.base_offset() >= self.recv_max_length {
            handler.on_stream_event(self.id, Event::PeerSendAborted { error_code });
            Ok(self.recv_shutdown(send, true, error_code, handler))
        } else {
            // Data is still owed to the app; keep the error code for later
            self.recv_shutdown_error_code = error_code;
            Ok(false)
        }
    }

    /// Processes a received STOP_SENDING
    pub(crate) fn process_stop_sending_frame(
        &mut self,
        send: &mut SendState,
        error_code: u64,
        handler: &mut impl EventHandler,
    ) {
        // Only act if our send side isn't already closed and acknowledged
        // or reset
        ensure!(!self.flags.local_close_acked && !self.flags.local_close_reset);

        tracing::debug!(stream = %self.id, error_code, "closed locally (stop sending)");
        self.flags.received_stop_sending = true;

        handler.on_stream_event(self.id, Event::PeerReceiveAborted { error_code });

        // The peer asked us to stop; close abortively with NO_ERROR
        self.send_shutdown(send, false, false, false, 0, handler);
    }

    /// Processes a received STREAM frame
    pub(crate) fn process_stream_frame(
        &mut self,
        send: &mut SendState,
        zero_rtt: bool,
        offset: u64,
        data: &[u8],
        fin: bool,
        handler: &mut impl EventHandler,
    ) -> Result<RecvFlushDisposition, transport::Error> {
        let end_offset = offset + data.len() as u64;
        let mut ready_to_deliver = false;

        if self.flags.remote_not_allowed {
            return Err(transport::Error::STREAM_STATE_ERROR
                .with_reason("receive on unidirectional stream"));
        }

        if self.flags.remote_close_fin || self.flags.remote_close_reset {
            // Already closed remotely; likely a stale retransmission
            tracing::trace!(stream = %self.id, "ignoring recv after close");
            return Ok(RecvFlushDisposition::None);
        }

        if self.flags.sent_stop_sending {
            // The receive path was aborted, but the peer may still finish
            // with a FIN instead of a reset; treat that FIN as one.
            if fin {
                self.process_reset_frame(send, end_offset, 0, handler)?;
                // Teardown is attempted by the caller via the reset path
                return Ok(RecvFlushDisposition::None);
            }
            tracing::trace!(stream = %self.id, "ignoring recv after abort");
            return Ok(RecvFlushDisposition::None);
        }

        if fin && self.recv_max_length != u64::MAX && end_offset != self.recv_max_length {
            // FIN disagrees with an earlier FIN
            return Err(transport::Error::FINAL_SIZE_ERROR.with_reason("conflicting FIN"));
        }

        if self.flags.remote_close_reset_reliable {
            if self.recv_buffer.base_offset() >= self.recv_max_length {
                // Reliably reset and fully delivered; data past the reliable
                // offset is ignorable
                return Ok(RecvFlushDisposition::None);
            }
        } else if end_offset > self.recv_max_length {
            // The frame goes past the FIN
            return Err(transport::Error::FINAL_SIZE_ERROR.with_reason("data beyond final size"));
        }

        if end_offset > MAX_VARINT_VALUE {
            // Impossible to grant flow control credit for such data
            return Err(transport::Error::FLOW_CONTROL_ERROR
                .with_reason("stream data beyond varint range"));
        }

        if !data.is_empty() {
            // The connection credit headroom caps how much new data may be
            // admitted
            let write_limit = send.max_data - send.ordered_stream_bytes_received;

            let outcome = self
                .recv_buffer
                .write(offset, data, write_limit)
                .map_err(|error| {
                    let reason = match error {
                        buffer::Error::WindowExceeded => "stream flow control violated",
                        buffer::Error::CreditExceeded => "connection flow control violated",
                    };
                    transport::Error::FLOW_CONTROL_ERROR.with_reason(reason)
                })?;

            send.ordered_stream_bytes_received += outcome.written;
            debug_assert!(send.ordered_stream_bytes_received <= send.max_data);
            ready_to_deliver = outcome.ready_to_deliver;

            if self.recv_buffer.total_received_len() == self.max_allowed_recv_offset {
                tracing::trace!(stream = %self.id, "flow control window exhausted");
            }

            if zero_rtt && end_offset > self.recv_max_zero_rtt_length {
                self.recv_max_zero_rtt_length = end_offset;
            }
        }

        if fin {
            self.recv_max_length = end_offset;
            if self.recv_buffer.base_offset() == self.recv_max_length {
                // Everything was already delivered; only the FIN remains
                ready_to_deliver = true;
            }
        }

        tracing::trace!(
            stream = %self.id,
            offset,
            len = data.len(),
            ready = ready_to_deliver,
            "stream frame received"
        );

        if ready_to_deliver
            && (self.flags.receive_multiple || self.recv_buffer.read_pending_length() == 0)
        {
            self.flags.receive_data_pending = true;
            if self.recv_buffer.base_offset() == self.recv_max_length {
                return Ok(RecvFlushDisposition::Inline);
            }
            return Ok(RecvFlushDisposition::Queue);
        }

        Ok(RecvFlushDisposition::None)
    }

    /// Accounts bytes the app consumed: connection credit, the MAX_DATA
    /// accumulator, and the per-stream receive window tuning
    pub(crate) fn on_bytes_delivered(
        &mut self,
        send: &mut SendState,
        settings: &Settings,
        rtt: &RttEstimator,
        now: Timestamp,
        bytes_delivered: u64,
    ) {
        let drain_threshold = self.recv_buffer.virtual_buffer_length() / RECV_BUFFER_DRAIN_RATIO;

        self.recv_window_bytes_delivered += bytes_delivered;
        send.max_data += bytes_delivered;

        send.ordered_stream_bytes_delivered_accumulator += bytes_delivered;
        if send.ordered_stream_bytes_delivered_accumulator
            >= settings.conn_flow_control_window / RECV_BUFFER_DRAIN_RATIO
        {
            send.ordered_stream_bytes_delivered_accumulator = 0;
            send.set_flag(conn_flags::MAX_DATA);
        }

        if self.recv_window_bytes_delivered >= drain_threshold {
            // Tuning: the virtual length limits throughput to window/RTT. If
            // the app absorbed a quarter window faster than the delivery rate
            // the window supports, double it (bounded by the connection
            // window).
            if self.recv_buffer.virtual_buffer_length() < settings.conn_flow_control_window {
                let time_threshold_micros = (self.recv_window_bytes_delivered
                    * rtt.smoothed_rtt().as_micros() as u64)
                    / drain_threshold.max(1);
                let recently_updated = self.recv_window_last_update.is_some_and(|last| {
                    now.saturating_duration_since(last).as_micros() as u64
                        <= time_threshold_micros
                });
                if recently_updated {
                    let new_length = self.recv_buffer.virtual_buffer_length() * 2;
                    tracing::debug!(
                        stream = %self.id,
                        new_length,
                        "increasing receive buffer limit"
                    );
                    self.recv_buffer.increase_virtual_buffer_length(new_length);
                }
            }

            self.recv_window_last_update = Some(now);
            self.recv_window_bytes_delivered = 0;
        } else if send.send_flags & conn_flags::ACK == 0 {
            // Below the drain limit and no ACK going out to piggy-back on
            return;
        }

        debug_assert!(
            self.recv_buffer.base_offset() + self.recv_buffer.virtual_buffer_length()
                > self.max_allowed_recv_offset
        );

        self.max_allowed_recv_offset =
            self.recv_buffer.base_offset() + self.recv_buffer.virtual_buffer_length();

        tracing::trace!(
            stream = %self.id,
            max_allowed_recv_offset = self.max_allowed_recv_offset,
            "updating flow control window"
        );

        send.set_flag(conn_flags::MAX_DATA);
        self.set_send_flags(send, send_flags::MAX_DATA, false);
    }

    /// Pumps buffered data into the app until it stops consuming.
    ///
    /// Returns true if stream teardown should be attempted.
    pub(crate) fn recv_flush(
        &mut self,
        send: &mut SendState,
        settings: &Settings,
        rtt: &RttEstimator,
        now: Timestamp,
        handler: &mut impl EventHandler,
    ) -> bool {
        use crate::event::EventResult;

        self.flags.receive_flush_queued = false;

        if !self.flags.receive_data_pending {
            // The flush already happened inline
            return false;
        }

        if !self.flags.receive_enabled {
            tracing::trace!(stream = %self.id, "ignoring recv flush (recv disabled)");
            return false;
        }

        let mut teardown = false;
        let mut flush_recv = true;
        while flush_recv {
            debug_assert!(!self.flags.sent_stop_sending);

            let (event, total_length) = if self.recv_buffer.has_unread_data() {
                let (absolute_offset, chunks) =
                    self.recv_buffer.read().expect("unread data present");
                let total_length: u64 = chunks.iter().map(|c| c.len() as u64).sum();
                debug_assert!(total_length != 0);
                (
                    Event::Receive {
                        absolute_offset,
                        fin: absolute_offset + total_length == self.recv_max_length,
                        zero_rtt: absolute_offset < self.recv_max_zero_rtt_length,
                        chunks,
                    },
                    total_length,
                )
            } else {
                // FIN only
                (
                    Event::Receive {
                        absolute_offset: self.recv_max_length,
                        chunks: Vec::new(),
                        fin: true,
                        zero_rtt: false,
                    },
                    0,
                )
            };

            self.flags.receive_enabled = self.flags.receive_multiple;
            self.flags.receive_call_active = true;
            self.recv_pending_length += total_length;
            debug_assert!(self.recv_pending_length <= self.recv_buffer.read_pending_length() || total_length == 0);

            tracing::trace!(
                stream = %self.id,
                len = total_length,
                "indicating receive"
            );

            let status = handler.on_stream_event(self.id, event);
            self.flags.receive_call_active = false;

            match status {
                EventResult::Continue => {
                    debug_assert!(!self.flags.sent_stop_sending);
                    self.recv_completion_length += total_length;
                    flush_recv = true;
                    // The app explicitly asked for more callbacks even
                    // though the data wasn't drained
                    self.flags.receive_enabled = true;
                }
                EventResult::Pending => {
                    // The app may have completed inline already
                    flush_recv = self.recv_completion_length != 0;
                }
                EventResult::Success => {
                    self.recv_completion_length += total_length;
                    flush_recv = true;
                }
            }

            if flush_recv {
                let buffer_length = self.recv_completion_length;
                self.recv_completion_length = 0;
                let (more, td) =
                    self.receive_complete(send, settings, rtt, now, buffer_length, handler);
                teardown |= td;
                flush_recv = more;
            }
        }

        teardown
    }

    /// Reclaims buffer space the app consumed and decides whether the
    /// delivery loop continues.
    ///
    /// Returns `(flush_again, teardown)`.
    pub(crate) fn receive_complete(
        &mut self,
        send: &mut SendState,
        settings: &Settings,
        rtt: &RttEstimator,
        now: Timestamp,
        buffer_length: u64,
        handler: &mut impl EventHandler,
    ) -> (bool, bool) {
        if self.flags.sent_stop_sending || self.flags.remote_close_fin {
            // The receive path was torn down while the indication was out
            return (false, false);
        }

        tracing::trace!(stream = %self.id, len = buffer_length, "receive complete");
        debug_assert!(buffer_length <= self.recv_pending_length);

        if self.recv_pending_length == 0
            || self
                .recv_buffer
                .drain(buffer_length, !self.flags.receive_multiple)
        {
            // No more pending data to deliver
            self.flags.receive_data_pending = false;
        }

        if buffer_length != 0 {
            self.recv_pending_length -= buffer_length;
            self.on_bytes_delivered(send, settings, rtt, now, buffer_length);
        }

        if self.recv_pending_length == 0 {
            // Everything was drained; callbacks can continue
            self.flags.receive_enabled = true;
        } else if !self.flags.receive_multiple {
            // The app didn't drain everything; wait for it to ask again
            self.recv_pending_length = 0;
        }

        if !self.flags.receive_enabled {
            // Paused until the app re-enables receive callbacks
            return (false, false);
        }

        if self.flags.receive_data_pending {
            // More data to process; continue the flush loop unless
            // multi-receive callbacks are already doing so
            return (!self.flags.receive_multiple, false);
        }

        if self.recv_buffer.base_offset() == self.recv_max_length {
            debug_assert!(!self.flags.receive_data_pending);
            // The whole stream was delivered; fire the graceful close
            self.flags.remote_close_fin = true;
            self.flags.remote_close_acked = true;

            tracing::debug!(stream = %self.id, "closed remotely (graceful)");
            handler.on_stream_event(self.id, Event::PeerSendShutdown);

            self.clear_send_flags(send, send_flags::MAX_DATA | send_flags::RECV_ABORT);
            return (false, true);
        }

        if self.flags.remote_close_reset_reliable
            && self.recv_buffer.base_offset() >= self.recv_max_length
        {
            // Reliable reset: the owed prefix was delivered, finish the abort
            let error_code = self.recv_shutdown_error_code;
            handler.on_stream_event(self.id, Event::PeerSendAborted { error_code });
            let teardown = self.recv_shutdown(send, true, error_code, handler);
            return (false, teardown);
        }

        (false, false)
    }

    /// Enables or pauses receive indications.
    ///
    /// Returns true if a flush should be scheduled.
    pub(crate) fn recv_set_enabled(&mut self, enabled: bool) -> Result<bool, transport::Error> {
        if self.flags.remote_not_allowed
            || self.flags.remote_close_fin
            || self.flags.remote_close_reset
            || self.flags.sent_stop_sending
        {
            return Err(transport::Error::PROTOCOL_VIOLATION
                .with_reason("receive direction is closed"));
        }

        if self.flags.receive_enabled != enabled {
            debug_assert!(!self.flags.sent_stop_sending);
            self.flags.receive_enabled = enabled;

            if self.flags.started
                && enabled
                && (self.flags.receive_multiple || self.recv_buffer.read_pending_length() == 0)
            {
                // The app resumed receive callbacks; drain what accumulated
                return Ok(true);
            }
        }

        Ok(false)
    }
}
