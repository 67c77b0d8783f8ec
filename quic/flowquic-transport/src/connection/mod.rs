// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-connection state machine: stream arena, frame dispatch, ack/loss
//! replay and the send flush loop.
//!
//! Streams are stored in an arena keyed by stream id; the scheduler queue
//! and the sent-frame metadata refer to streams by id only. Everything here
//! runs on the connection's owning worker.

use crate::{
    event::EventHandler,
    path::Path,
    send::{blocked_reasons as conn_blocked, flags, packet_builder::Datagram, SendState},
    space::{PacketSpace, SentFrame},
    stream::{recv::RecvFlushDisposition, send_flags, Stream, StreamId},
};
use bytes::Bytes;
use flowquic_core::{
    frame::{Decoder, Frame},
    packet::{KeyType, PacketNumber, PacketNumberSpace},
    recovery::{self, AckEvent, CongestionController, LossEvent, RttEstimator},
    time::Timestamp,
    transport,
};
use hashbrown::HashMap;
use std::{collections::VecDeque, time::Duration};

mod flush;


/// How many PTO periods the close state lingers for
pub const CLOSE_PTO_COUNT: u32 = 3;

const DEFAULT_PEER_PACKET_TOLERANCE: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointType {
    Client,
    Server,
}

/// Connection configuration, a snapshot of local settings and negotiated
/// peer transport parameters
#[derive(Clone, Debug)]
pub struct Settings {
    pub conn_flow_control_window: u64,
    pub stream_recv_window: u64,
    pub peer_max_data: u64,
    pub peer_initial_max_stream_data: u64,
    pub peer_initial_max_streams_bidi: u64,
    pub peer_initial_max_streams_uni: u64,
    pub local_max_streams_bidi: u64,
    pub local_max_streams_uni: u64,
    pub max_sack_ranges: usize,
    pub initial_window_packets: u32,
    pub send_idle_timeout: Duration,
    pub pacing_enabled: bool,
    pub max_ack_delay: Duration,
    pub send_buffering_enabled: bool,
    pub use_round_robin_stream_scheduling: bool,
    pub keep_alive_padding: u16,
    pub mtu: u16,
    pub reliable_reset_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            conn_flow_control_window: 16 * 1024 * 1024,
            stream_recv_window: 64 * 1024,
            peer_max_data: 16 * 1024 * 1024,
            peer_initial_max_stream_data: 64 * 1024,
            peer_initial_max_streams_bidi: 100,
            peer_initial_max_streams_uni: 100,
            local_max_streams_bidi: 100,
            local_max_streams_uni: 100,
            max_sack_ranges: 4096,
            initial_window_packets: 10,
            send_idle_timeout: Duration::from_secs(1),
            pacing_enabled: true,
            max_ack_delay: Duration::from_millis(25),
            send_buffering_enabled: false,
            use_round_robin_stream_scheduling: false,
            keep_alive_padding: 0,
            mtu: 1200,
            reliable_reset_enabled: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    AckDelay,
    Pacing,
}

/// The connection's slice of the per-worker timer wheel
#[derive(Clone, Debug, Default)]
pub struct TimerTable {
    deadlines: [Option<Timestamp>; 2],
}

impl TimerTable {
    #[inline]
    fn index(id: TimerId) -> usize {
        match id {
            TimerId::AckDelay => 0,
            TimerId::Pacing => 1,
        }
    }

    pub fn set(&mut self, id: TimerId, deadline: Timestamp) {
        self.deadlines[Self::index(id)] = Some(deadline);
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.deadlines[Self::index(id)] = None;
    }

    pub fn deadline(&self, id: TimerId) -> Option<Timestamp> {
        self.deadlines[Self::index(id)]
    }

    /// Takes the timer if it fired at or before `now`
    pub fn take_expired(&mut self, id: TimerId, now: Timestamp) -> bool {
        match self.deadlines[Self::index(id)] {
            Some(deadline) if deadline <= now => {
                self.deadlines[Self::index(id)] = None;
                true
            }
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct State {
    started: bool,
    closed_locally: bool,
    closed_remotely: bool,
    reliable_reset_negotiated: bool,
}

/// A locally issued connection id the peer should learn about
#[derive(Clone, Debug)]
struct SourceCid {
    sequence: u64,
    data: [u8; 8],
    needs_to_send: bool,
}

/// A peer connection id queued for retirement
#[derive(Clone, Debug)]
struct RetiredDestCid {
    sequence: u64,
    needs_to_send: bool,
}

struct StreamMap {
    map: HashMap<u64, Stream>,
    /// Peer-granted stream counts, indexed by stream type bits
    peer_max_stream_count: [u64; 4],
    /// Stream counts we granted to the peer
    local_max_stream_count: [u64; 4],
    next_local_bidi: u64,
    next_local_uni: u64,
}

impl StreamMap {
    fn new(endpoint_type: EndpointType, settings: &Settings) -> Self {
        let mut peer_max_stream_count = [0u64; 4];
        let mut local_max_stream_count = [0u64; 4];
        let local_is_server = endpoint_type == EndpointType::Server;

        // Peer grants apply to streams we initiate; our grants to theirs
        let local_bit = local_is_server as usize;
        let remote_bit = !local_is_server as usize;
        peer_max_stream_count[local_bit] = settings.peer_initial_max_streams_bidi;
        peer_max_stream_count[local_bit | 0x2] = settings.peer_initial_max_streams_uni;
        local_max_stream_count[remote_bit] = settings.local_max_streams_bidi;
        local_max_stream_count[remote_bit | 0x2] = settings.local_max_streams_uni;

        Self {
            map: HashMap::new(),
            peer_max_stream_count,
            local_max_stream_count,
            next_local_bidi: 0,
            next_local_uni: 0,
        }
    }

    #[inline]
    fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.map.get_mut(&id.as_u64())
    }

    /// True once the peer's MAX_STREAMS covers this stream
    #[inline]
    fn allowed_by_peer(&self, id: StreamId) -> bool {
        self.peer_max_stream_count[id.type_index()] >= id.stream_count()
    }
}

impl Connection {
    /// The stream count we currently grant the peer for its streams
    fn local_stream_grant(&self, bidirectional: bool) -> u64 {
        let peer_is_server = self.endpoint_type == EndpointType::Client;
        let index = peer_is_server as usize | ((!bidirectional as usize) << 1);
        self.streams.local_max_stream_count[index]
    }

    /// The stream count the peer currently grants us
    fn peer_stream_grant(&self, bidirectional: bool) -> u64 {
        let local_is_server = self.endpoint_type == EndpointType::Server;
        let index = local_is_server as usize | ((!bidirectional as usize) << 1);
        self.streams.peer_max_stream_count[index]
    }
}

pub struct Connection {
    settings: Settings,
    endpoint_type: EndpointType,
    state: State,

    pub(crate) send: SendState,
    streams: StreamMap,
    pub(crate) cc: CongestionController,
    pub(crate) rtt: RttEstimator,
    pub(crate) paths: Vec<Path>,
    spaces: [PacketSpace; PacketNumberSpace::COUNT],
    pub(crate) timers: TimerTable,

    write_key_type: KeyType,
    has_zero_rtt_key: bool,

    close_error_code: u64,
    close_is_application: bool,
    /// The first fatal transport error, if any
    error: Option<transport::Error>,

    peer_packet_tolerance: u8,
    local_packet_tolerance: u16,
    send_ack_freq_seq_num: u64,

    /// Streams with a queued receive flush operation
    recv_flush_queue: VecDeque<StreamId>,

    /// Handshake bytes queued by the TLS collaborator
    crypto_buffer: Vec<u8>,
    crypto_next_offset: u64,

    source_cids: Vec<SourceCid>,
    retired_dest_cids: Vec<RetiredDestCid>,

    datagram_send_queue: VecDeque<Bytes>,
    /// DATAGRAM frames received from the peer, drained by the app
    pub received_datagrams: VecDeque<Bytes>,
}

impl Connection {
    pub fn new(endpoint_type: EndpointType, settings: Settings) -> Self {
        let path = match endpoint_type {
            // A client's initial path needs no address validation
            EndpointType::Client => Path::validated(settings.mtu),
            EndpointType::Server => Path::new(settings.mtu),
        };

        let cc_config = recovery::Config {
            initial_window_packets: settings.initial_window_packets,
            send_idle_timeout: settings.send_idle_timeout,
            pacing_enabled: settings.pacing_enabled,
        };

        let mut send = SendState::new(settings.conn_flow_control_window);
        send.peer_max_data = settings.peer_max_data;

        Self {
            streams: StreamMap::new(endpoint_type, &settings),
            cc: CongestionController::cubic(settings.mtu, &cc_config),
            rtt: RttEstimator::default(),
            paths: vec![path],
            spaces: Default::default(),
            timers: TimerTable::default(),
            write_key_type: KeyType::Initial,
            has_zero_rtt_key: false,
            state: State {
                reliable_reset_negotiated: settings.reliable_reset_enabled,
                ..Default::default()
            },
            close_error_code: 0,
            close_is_application: false,
            error: None,
            peer_packet_tolerance: DEFAULT_PEER_PACKET_TOLERANCE,
            local_packet_tolerance: DEFAULT_PEER_PACKET_TOLERANCE as u16,
            send_ack_freq_seq_num: 0,
            recv_flush_queue: VecDeque::new(),
            crypto_buffer: Vec::new(),
            crypto_next_offset: 0,
            source_cids: Vec::new(),
            retired_dest_cids: Vec::new(),
            datagram_send_queue: VecDeque::new(),
            received_datagrams: VecDeque::new(),
            send,
            settings,
            endpoint_type,
        }
    }

    // ===== lifecycle and handshake plumbing =====

    pub fn start(&mut self) {
        self.state.started = true;
        self.send.started = true;
    }

    /// Invoked by the TLS collaborator as key material becomes available
    pub fn set_write_key(&mut self, key_type: KeyType) {
        debug_assert!(key_type >= self.write_key_type);
        self.write_key_type = key_type;
        if key_type == KeyType::OneRtt && self.endpoint_type == EndpointType::Server {
            self.set_send_flag(flags::HANDSHAKE_DONE);
        }
    }

    pub fn set_zero_rtt_key(&mut self, available: bool) {
        self.has_zero_rtt_key = available;
    }

    pub fn on_peer_validated(&mut self) {
        self.paths[0].on_peer_validated();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.closed_locally || self.state.closed_remotely
    }

    #[inline]
    pub fn error(&self) -> Option<transport::Error> {
        self.error
    }

    #[inline]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[inline]
    pub fn rtt_estimator_mut(&mut self) -> &mut RttEstimator {
        &mut self.rtt
    }

    #[inline]
    pub fn congestion_controller(&self) -> &CongestionController {
        &self.cc
    }

    /// True if a flush pass has been requested since the last one ran
    #[inline]
    pub fn needs_flush(&self) -> bool {
        self.send.flush_operation_pending
    }

    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.map.get(&id.as_u64())
    }

    // ===== connection level frame scheduling =====

    /// Sets connection-level send flags, handling the ACK/delayed-ack
    /// interplay and close-frame supersession
    pub(crate) fn set_send_flag(&mut self, send_flags: u32) -> bool {
        let is_close_frame =
            send_flags & (flags::CONNECTION_CLOSE | flags::APPLICATION_CLOSE) != 0;
        let can_set_flag = !self.is_closed() || is_close_frame;

        if send_flags & flags::ACK != 0 && self.send.delayed_ack_timer_active {
            self.timers.cancel(TimerId::AckDelay);
            self.send.delayed_ack_timer_active = false;
        }

        if can_set_flag && self.send.insert_flags(send_flags) && self.can_send_flags_now() {
            self.send.queue_flush();
        }

        if is_close_frame {
            self.clear_send_state_on_close();
        }

        self.validate_send();
        can_set_flag
    }

    /// True if any of the currently pending flags could actually go out at
    /// the keys available right now
    pub(crate) fn can_send_flags_now(&self) -> bool {
        if self.write_key_type < KeyType::OneRtt {
            if self.has_zero_rtt_key && !self.send.has_queued_streams() {
                return true;
            }
            if (!self.state.started && self.endpoint_type == EndpointType::Client)
                || self.send.send_flags & flags::ALLOWED_HANDSHAKE == 0
            {
                return false;
            }
        }
        true
    }

    /// Tears down the send state when the connection shuts down; the stream
    /// references are dropped and nothing further is scheduled
    pub fn uninitialize_send(&mut self) {
        self.send.uninitialized = true;
        self.send.delayed_ack_timer_active = false;
        self.timers.cancel(TimerId::AckDelay);
        self.timers.cancel(TimerId::Pacing);
        self.send.send_flags = 0;
        for id in self.send.clear_queue() {
            if let Some(stream) = self.streams.get_mut(id) {
                stream.send_flags = 0;
            }
        }
    }

    /// Removes everything that is no longer allowed to be sent once the
    /// connection is closed, and unlinks all queued streams
    fn clear_send_state_on_close(&mut self) {
        self.send.clear_flags(flags::CONN_CLOSED_MASK);
        for id in self.send.clear_queue() {
            if let Some(stream) = self.streams.get_mut(id) {
                stream.send_flags = 0;
            }
        }
    }

    /// Closes the connection. CONNECTION_CLOSE supersedes all other pending
    /// frames.
    pub fn close(&mut self, error_code: u64, is_application: bool) {
        ensure!(!self.state.closed_locally);
        self.state.closed_locally = true;
        self.send.closed = true;
        self.close_error_code = error_code;
        self.close_is_application = is_application;
        self.set_send_flag(if is_application {
            flags::APPLICATION_CLOSE
        } else {
            flags::CONNECTION_CLOSE
        });
    }

    /// Raises a connection-fatal transport error
    pub(crate) fn transport_error(&mut self, error: transport::Error) {
        tracing::warn!(code = %error.code, reason = error.reason, "transport error");
        if self.error.is_none() {
            self.error = Some(error);
        }
        if !self.state.closed_locally {
            self.close(error.code.as_u64(), false);
        }
    }

    /// Queues handshake bytes produced by the TLS collaborator
    pub fn queue_crypto(&mut self, data: &[u8]) {
        ensure!(!data.is_empty());
        self.crypto_buffer.extend_from_slice(data);
        self.set_send_flag(flags::CRYPTO);
    }

    /// Queues an unreliable DATAGRAM frame
    pub fn queue_datagram(&mut self, data: Bytes) {
        self.datagram_send_queue.push_back(data);
        self.set_send_flag(flags::DATAGRAM);
    }

    /// Registers a locally issued connection id to advertise
    pub fn queue_new_connection_id(&mut self, sequence: u64, data: [u8; 8]) {
        self.source_cids.push(SourceCid {
            sequence,
            data,
            needs_to_send: true,
        });
        self.set_send_flag(flags::NEW_CONNECTION_ID);
    }

    /// Queues retirement of a peer connection id
    pub fn queue_retire_connection_id(&mut self, sequence: u64) {
        self.retired_dest_cids.push(RetiredDestCid {
            sequence,
            needs_to_send: true,
        });
        self.set_send_flag(flags::RETIRE_CONNECTION_ID);
    }

    /// Arms a path challenge on the primary path
    pub fn queue_path_challenge(&mut self, challenge: [u8; 8]) {
        self.paths[0].challenge_pending = Some(challenge);
        self.set_send_flag(flags::PATH_CHALLENGE);
    }

    /// Requests an MTU probe (DPLPMTUD)
    pub fn queue_mtu_probe(&mut self) {
        self.set_send_flag(flags::DPLPMTUD);
    }

    pub fn queue_ping(&mut self) {
        self.set_send_flag(flags::PING);
    }

    /// Updates the number of packets the peer may hold ACKs for, arming an
    /// ACK_FREQUENCY update if it changed
    pub(crate) fn update_peer_packet_tolerance(&mut self, new_tolerance: u8) {
        if new_tolerance != self.peer_packet_tolerance {
            self.peer_packet_tolerance = new_tolerance;
            self.set_send_flag(flags::ACK_FREQUENCY);
        }
    }

    // ===== stream API =====

    /// Opens a locally initiated stream. The stream is announced to the
    /// peer on its first send carrying the START flag.
    pub fn open_stream(&mut self, unidirectional: bool) -> StreamId {
        let local_is_server = self.endpoint_type == EndpointType::Server;
        let index = if unidirectional {
            let index = self.streams.next_local_uni;
            self.streams.next_local_uni += 1;
            index
        } else {
            let index = self.streams.next_local_bidi;
            self.streams.next_local_bidi += 1;
            index
        };
        let id = StreamId::new(
            (index << 2) | ((unidirectional as u64) << 1) | (local_is_server as u64),
        );
        let stream = Stream::new(id, local_is_server, &self.settings);
        self.streams.map.insert(id.as_u64(), stream);
        tracing::debug!(stream = %id, unidirectional, "stream opened");
        id
    }

    pub fn set_stream_priority(&mut self, id: StreamId, priority: u16) {
        let Some(stream) = self.streams.get_mut(id) else {
            return;
        };
        stream.send_priority = priority;
        if stream.send_flags != 0 {
            self.send.update_stream_priority(id, priority);
        }
    }

    /// Queues application data. `request_flags` come from
    /// [`crate::stream::request_flags`].
    pub fn stream_send(
        &mut self,
        id: StreamId,
        data: Bytes,
        req_flags: u8,
        context: u64,
        handler: &mut impl EventHandler,
    ) -> Result<(), transport::Error> {
        let buffering = self.settings.send_buffering_enabled;
        let Some(stream) = self.streams.get_mut(id) else {
            return Err(transport::Error::STREAM_STATE_ERROR.with_reason("unknown stream"));
        };

        let start_requested =
            stream.queue_app_send(&mut self.send, data, req_flags, context, buffering, handler);
        if start_requested {
            self.stream_start(id);
        }
        Ok(())
    }

    /// Makes the stream live on the wire
    pub fn stream_start(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(id) else {
            return;
        };
        ensure!(!stream.flags.started);
        stream.start(&mut self.send);
        // Queue everything that accumulated before the start
        let pending = stream.send_flags;
        stream.set_send_flags(&mut self.send, pending, false);
    }

    /// Gracefully or abortively closes the send direction
    pub fn stream_shutdown_send(
        &mut self,
        id: StreamId,
        graceful: bool,
        error_code: u64,
        handler: &mut impl EventHandler,
    ) {
        let Some(stream) = self.streams.get_mut(id) else {
            return;
        };
        let teardown = stream.send_shutdown(&mut self.send, graceful, false, false, error_code, handler);
        if teardown {
            self.try_complete_stream_shutdown(id);
        }
    }

    /// Aborts the receive direction (sends STOP_SENDING)
    pub fn stream_abort_receive(
        &mut self,
        id: StreamId,
        error_code: u64,
        handler: &mut impl EventHandler,
    ) {
        let Some(stream) = self.streams.get_mut(id) else {
            return;
        };
        let teardown = stream.recv_shutdown(&mut self.send, false, error_code, handler);
        if teardown {
            self.try_complete_stream_shutdown(id);
        }
    }

    /// Silently closes both directions, as when the app drops its handle
    pub fn stream_close_silent(&mut self, id: StreamId, handler: &mut impl EventHandler) {
        let Some(stream) = self.streams.get_mut(id) else {
            return;
        };
        stream.send_shutdown(&mut self.send, false, true, false, 0, handler);
        stream.recv_shutdown(&mut self.send, true, 0, handler);
        self.try_complete_stream_shutdown(id);
    }

    /// Pauses or resumes receive indications
    pub fn stream_receive_set_enabled(
        &mut self,
        id: StreamId,
        enabled: bool,
        now: Timestamp,
        handler: &mut impl EventHandler,
    ) -> Result<(), transport::Error> {
        let Some(stream) = self.streams.get_mut(id) else {
            return Err(transport::Error::STREAM_STATE_ERROR.with_reason("unknown stream"));
        };
        if stream.recv_set_enabled(enabled)? {
            let teardown = stream.recv_flush(
                &mut self.send,
                &self.settings,
                &self.rtt,
                now,
                handler,
            );
            if teardown {
                self.try_complete_stream_shutdown(id);
            }
        }
        Ok(())
    }

    /// Completes a receive the app answered with `Pending`
    pub fn stream_receive_complete(
        &mut self,
        id: StreamId,
        buffer_length: u64,
        now: Timestamp,
        handler: &mut impl EventHandler,
    ) {
        let Some(stream) = self.streams.get_mut(id) else {
            return;
        };
        stream.recv_completion_length += buffer_length;
        if stream.flags.receive_call_active {
            // The flush loop picks the completion up when the callback
            // returns
            return;
        }

        let buffer_length = stream.recv_completion_length;
        stream.recv_completion_length = 0;
        let (flush_again, mut teardown) = stream.receive_complete(
            &mut self.send,
            &self.settings,
            &self.rtt,
            now,
            buffer_length,
            handler,
        );
        if flush_again {
            teardown |= stream.recv_flush(
                &mut self.send,
                &self.settings,
                &self.rtt,
                now,
                handler,
            );
        }
        if teardown {
            self.try_complete_stream_shutdown(id);
        }
    }

    /// Drops the stream once both directions are closed and acknowledged
    fn try_complete_stream_shutdown(&mut self, id: StreamId) {
        let Some(stream) = self.streams.map.get(&id.as_u64()) else {
            return;
        };
        if stream.shutdown_complete() {
            tracing::debug!(stream = %id, "stream shutdown complete");
            self.send.remove_stream(id);
            self.streams.map.remove(&id.as_u64());
        }
    }

    // ===== receive path =====

    /// Feeds one received datagram (already decrypted) into the connection
    pub fn on_datagram(
        &mut self,
        now: Timestamp,
        datagram: &Datagram,
        handler: &mut impl EventHandler,
    ) -> Result<(), transport::Error> {
        self.paths[0].on_datagram_received(datagram.payload.len() as u16);
        self.on_packet_received(
            now,
            datagram.key_type,
            datagram.packet_number,
            datagram.frames(),
            handler,
        )
    }

    /// Processes the frame section of one received packet
    pub fn on_packet_received(
        &mut self,
        now: Timestamp,
        key_type: KeyType,
        packet_number: PacketNumber,
        payload: &[u8],
        handler: &mut impl EventHandler,
    ) -> Result<(), transport::Error> {
        let mut decoder = Decoder::new(payload);
        let mut ack_eliciting = false;

        while !decoder.is_empty() {
            let frame = Frame::decode(&mut decoder).map_err(|_| {
                let error =
                    transport::Error::FRAME_ENCODING_ERROR.with_reason("malformed frame");
                self.transport_error(error);
                error
            })?;

            ack_eliciting |= !matches!(
                frame,
                Frame::Padding | Frame::Ack(_) | Frame::ConnectionClose(_)
            );

            if let Err(error) = self.on_frame(now, key_type, frame, handler) {
                self.transport_error(error);
                return Err(error);
            }
        }

        let space = &mut self.spaces[key_type.space().index()];
        let ack_now = space.ack_tracker.on_packet_received(
            packet_number,
            ack_eliciting,
            self.local_packet_tolerance,
        );
        if ack_eliciting {
            if ack_now {
                self.set_send_flag(flags::ACK);
            } else {
                self.start_delayed_ack_timer(now);
            }
        }

        // Run any receive flushes queued by stream frames
        self.process_recv_flushes(now, handler);

        Ok(())
    }

    /// Dispatches one received frame
    pub fn on_frame(
        &mut self,
        now: Timestamp,
        key_type: KeyType,
        frame: Frame,
        handler: &mut impl EventHandler,
    ) -> Result<(), transport::Error> {
        match frame {
            Frame::Padding | Frame::Ping => {}

            Frame::Ack(ack) => {
                let space = key_type.space();
                for (smallest, largest) in ack.ranges.iter().copied() {
                    for pn in smallest..=largest {
                        self.on_packet_acked(now, space, pn, handler)?;
                    }
                }
            }

            Frame::Crypto(_crypto) => {
                // Handed to the TLS collaborator; nothing for the core
            }

            Frame::Stream(stream_frame) => {
                let id = StreamId::new(stream_frame.stream_id.as_u64());
                let zero_rtt = key_type == KeyType::ZeroRtt;
                ensure!(self.ensure_stream(id)?, Ok(()));
                let stream = self.streams.get_mut(id).expect("stream just ensured");

                let disposition = stream.process_stream_frame(
                    &mut self.send,
                    zero_rtt,
                    stream_frame.offset.as_u64(),
                    stream_frame.data,
                    stream_frame.fin,
                    handler,
                )?;
                match disposition {
                    RecvFlushDisposition::None => {}
                    RecvFlushDisposition::Inline => {
                        let teardown = stream.recv_flush(
                            &mut self.send,
                            &self.settings,
                            &self.rtt,
                            now,
                            handler,
                        );
                        if teardown {
                            self.try_complete_stream_shutdown(id);
                        }
                    }
                    RecvFlushDisposition::Queue => self.queue_recv_flush(id),
                }
            }

            Frame::ResetStream(reset) => {
                let id = StreamId::new(reset.stream_id.as_u64());
                ensure!(self.ensure_stream(id)?, Ok(()));
                let stream = self.streams.get_mut(id).expect("stream just ensured");
                let teardown = stream.process_reset_frame(
                    &mut self.send,
                    reset.final_size.as_u64(),
                    reset.error_code.as_u64(),
                    handler,
                )?;
                if teardown {
                    self.try_complete_stream_shutdown(id);
                }
            }

            Frame::ReliableResetStream(reset) => {
                let id = StreamId::new(reset.stream_id.as_u64());
                ensure!(self.ensure_stream(id)?, Ok(()));
                let negotiated = self.state.reliable_reset_negotiated;
                let stream = self.streams.get_mut(id).expect("stream just ensured");
                let teardown = stream.process_reliable_reset_frame(
                    &mut self.send,
                    reset.error_code.as_u64(),
                    reset.reliable_size.as_u64(),
                    negotiated,
                    handler,
                )?;
                if teardown {
                    self.try_complete_stream_shutdown(id);
                }
            }

            Frame::StopSending(stop) => {
                let id = StreamId::new(stop.stream_id.as_u64());
                ensure!(self.ensure_stream(id)?, Ok(()));
                let stream = self.streams.get_mut(id).expect("stream just ensured");
                stream.process_stop_sending_frame(
                    &mut self.send,
                    stop.error_code.as_u64(),
                    handler,
                );
            }

            Frame::MaxStreamData(frame) => {
                let id = StreamId::new(frame.stream_id.as_u64());
                if let Some(stream) = self.streams.get_mut(id) {
                    stream.on_max_stream_data(&mut self.send, frame.maximum_stream_data.as_u64());
                }
            }

            Frame::StreamDataBlocked(frame) => {
                let id = StreamId::new(frame.stream_id.as_u64());
                if let Some(stream) = self.streams.get_mut(id) {
                    tracing::trace!(stream = %id, "peer is stream flow control blocked");
                    stream.set_send_flags(&mut self.send, send_flags::MAX_DATA, false);
                }
            }

            Frame::MaxData(frame) => {
                if frame.maximum_data.as_u64() > self.send.peer_max_data {
                    self.send.peer_max_data = frame.maximum_data.as_u64();
                    self.send
                        .remove_blocked_reason(conn_blocked::CONN_FLOW_CONTROL);
                    self.send.queue_flush();
                }
            }

            Frame::DataBlocked(_) => {
                // The peer thinks it's blocked; refresh its view of MAX_DATA
                self.set_send_flag(flags::MAX_DATA);
            }

            Frame::MaxStreams(frame) => {
                let type_index = (self.endpoint_type == EndpointType::Server) as usize
                    | ((!frame.bidirectional as usize) << 1);
                let count = &mut self.streams.peer_max_stream_count[type_index];
                if frame.maximum_streams.as_u64() > *count {
                    *count = frame.maximum_streams.as_u64();
                    self.send.queue_flush();
                }
            }

            Frame::StreamsBlocked(frame) => {
                self.set_send_flag(if frame.bidirectional {
                    flags::MAX_STREAMS_BIDI
                } else {
                    flags::MAX_STREAMS_UNI
                });
            }

            Frame::PathChallenge(challenge) => {
                self.paths[0].response_pending = Some(challenge.data);
                self.set_send_flag(flags::PATH_RESPONSE);
            }

            Frame::PathResponse(response) => {
                if self.paths[0].challenge_pending == Some(response.data) {
                    self.paths[0].challenge_pending = None;
                    self.paths[0].on_peer_validated();
                }
            }

            Frame::ConnectionClose(close) => {
                tracing::debug!(
                    error_code = close.error_code.as_u64(),
                    "peer closed the connection"
                );
                self.state.closed_remotely = true;
                self.send.closed = true;
                self.clear_send_state_on_close();
            }

            Frame::HandshakeDone => {
                // Handshake confirmation is the loss-detection collaborator's
                // signal; nothing to do in the core
            }

            Frame::AckFrequency(frame) => {
                self.local_packet_tolerance =
                    frame.ack_eliciting_threshold.as_u64().clamp(1, u16::MAX as u64) as u16;
            }

            Frame::Datagram(datagram) => {
                self.received_datagrams
                    .push_back(Bytes::copy_from_slice(datagram.data));
            }

            Frame::NewConnectionId(_) | Frame::RetireConnectionId(_) => {
                // Connection id management lives in the registration layer
            }
        }

        Ok(())
    }

    /// Creates a peer-initiated stream on first reference. Returns false if
    /// the stream is unknown and not creatable (e.g. already torn down).
    fn ensure_stream(&mut self, id: StreamId) -> Result<bool, transport::Error> {
        if self.streams.map.contains_key(&id.as_u64()) {
            return Ok(true);
        }

        let local_is_server = self.endpoint_type == EndpointType::Server;
        let peer_initiated = id.is_server_initiated() != local_is_server;
        if !peer_initiated {
            // A frame for a locally initiated stream we no longer track;
            // stale retransmission
            return Ok(false);
        }

        if self.streams.local_max_stream_count[id.type_index()] < id.stream_count() {
            return Err(
                transport::Error::STREAM_LIMIT_ERROR.with_reason("peer exceeded stream limit")
            );
        }

        let stream = Stream::new(id, local_is_server, &self.settings);
        self.streams.map.insert(id.as_u64(), stream);
        tracing::debug!(stream = %id, "peer stream created");
        Ok(true)
    }

    fn queue_recv_flush(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(id) else {
            return;
        };
        if !stream.flags.receive_flush_queued {
            tracing::trace!(stream = %id, "queuing recv flush");
            stream.flags.receive_flush_queued = true;
            self.recv_flush_queue.push_back(id);
        }
    }

    /// Drains queued receive flush operations in FIFO order
    pub fn process_recv_flushes(&mut self, now: Timestamp, handler: &mut impl EventHandler) {
        while let Some(id) = self.recv_flush_queue.pop_front() {
            let Some(stream) = self.streams.get_mut(id) else {
                continue;
            };
            let teardown =
                stream.recv_flush(&mut self.send, &self.settings, &self.rtt, now, handler);
            if teardown {
                self.try_complete_stream_shutdown(id);
            }
        }
    }

    // ===== acknowledgment and loss replay =====

    /// Processes the acknowledgment of one sent packet
    pub fn on_packet_acked(
        &mut self,
        now: Timestamp,
        space: PacketNumberSpace,
        packet_number: PacketNumber,
        handler: &mut impl EventHandler,
    ) -> Result<(), transport::Error> {
        let Some(metadata) = self.spaces[space.index()].take_sent_packet(packet_number) else {
            return Ok(());
        };

        let event = AckEvent {
            time_now: now,
            largest_acked: packet_number,
            bytes_acked: if metadata.is_ack_eliciting {
                metadata.bytes as u32
            } else {
                0
            },
        };
        let unblocked = self.cc.on_data_acknowledged(&event, &self.rtt);

        for frame in metadata.frames {
            match frame {
                SentFrame::Stream {
                    id,
                    offset,
                    length,
                    open: _,
                    fin,
                } => {
                    if let Some(stream) = self.streams.get_mut(id) {
                        stream.on_ack(
                            &mut self.send,
                            metadata.key_type,
                            offset,
                            length,
                            fin,
                            handler,
                        )?;
                        self.try_complete_stream_shutdown(id);
                    }
                }
                SentFrame::ResetStream { id } => {
                    if let Some(stream) = self.streams.get_mut(id) {
                        stream.on_reset_ack(handler);
                        self.try_complete_stream_shutdown(id);
                    }
                }
                _ => {}
            }
        }

        if unblocked {
            self.send.remove_blocked_reason(conn_blocked::CONGESTION_CONTROL);
            self.send.last_flush_time = Some(now);
            self.send.queue_flush();
        }

        Ok(())
    }

    /// Processes the loss of one sent packet, re-arming every affected flag
    pub fn on_packet_lost(
        &mut self,
        space: PacketNumberSpace,
        packet_number: PacketNumber,
        persistent_congestion: bool,
        handler: &mut impl EventHandler,
    ) {
        let _ = handler;
        let Some(metadata) = self.spaces[space.index()].take_sent_packet(packet_number) else {
            return;
        };

        let event = LossEvent {
            largest_lost: packet_number,
            largest_sent: self.spaces[space.index()].largest_sent(),
            bytes_lost: if metadata.is_ack_eliciting {
                metadata.bytes as u32
            } else {
                0
            },
            persistent_congestion,
        };
        let unblocked = self.cc.on_data_lost(&event);

        for frame in metadata.frames {
            match frame {
                SentFrame::Stream {
                    id,
                    offset,
                    length,
                    open,
                    fin,
                } => {
                    if let Some(stream) = self.streams.get_mut(id) {
                        stream.on_loss(&mut self.send, offset, length, open, fin);
                    }
                }
                SentFrame::ResetStream { id } => {
                    if let Some(stream) = self.streams.get_mut(id) {
                        stream.set_send_flags(&mut self.send, send_flags::SEND_ABORT, false);
                    }
                }
                SentFrame::StopSending { id } => {
                    if let Some(stream) = self.streams.get_mut(id) {
                        stream.set_send_flags(&mut self.send, send_flags::RECV_ABORT, false);
                    }
                }
                SentFrame::MaxStreamData { id } => {
                    if let Some(stream) = self.streams.get_mut(id) {
                        stream.set_send_flags(&mut self.send, send_flags::MAX_DATA, false);
                    }
                }
                SentFrame::StreamDataBlocked { id } => {
                    if let Some(stream) = self.streams.get_mut(id) {
                        stream.set_send_flags(&mut self.send, send_flags::DATA_BLOCKED, false);
                    }
                }
                SentFrame::Crypto { offset, .. } => {
                    // Simple go-back on handshake data
                    self.crypto_next_offset = self.crypto_next_offset.min(offset);
                    self.set_send_flag(flags::CRYPTO);
                }
                SentFrame::MaxData => {
                    self.set_send_flag(flags::MAX_DATA);
                }
                SentFrame::DataBlocked => {
                    self.set_send_flag(flags::DATA_BLOCKED);
                }
                SentFrame::MaxStreamsBidi => {
                    self.set_send_flag(flags::MAX_STREAMS_BIDI);
                }
                SentFrame::MaxStreamsUni => {
                    self.set_send_flag(flags::MAX_STREAMS_UNI);
                }
                SentFrame::BidiStreamsBlocked => {
                    self.set_send_flag(flags::BIDI_STREAMS_BLOCKED);
                }
                SentFrame::UniStreamsBlocked => {
                    self.set_send_flag(flags::UNI_STREAMS_BLOCKED);
                }
                SentFrame::NewConnectionId { sequence } => {
                    if let Some(cid) = self
                        .source_cids
                        .iter_mut()
                        .find(|cid| cid.sequence == sequence)
                    {
                        cid.needs_to_send = true;
                        self.set_send_flag(flags::NEW_CONNECTION_ID);
                    }
                }
                SentFrame::RetireConnectionId { sequence } => {
                    if let Some(cid) = self
                        .retired_dest_cids
                        .iter_mut()
                        .find(|cid| cid.sequence == sequence)
                    {
                        cid.needs_to_send = true;
                        self.set_send_flag(flags::RETIRE_CONNECTION_ID);
                    }
                }
                SentFrame::HandshakeDone => {
                    self.set_send_flag(flags::HANDSHAKE_DONE);
                }
                SentFrame::AckFrequency => {
                    self.set_send_flag(flags::ACK_FREQUENCY);
                }
                SentFrame::PathChallenge => {
                    if self.paths.iter().any(|p| p.challenge_pending.is_some()) {
                        self.set_send_flag(flags::PATH_CHALLENGE);
                    }
                }
                SentFrame::PathResponse
                | SentFrame::Ack
                | SentFrame::Ping
                | SentFrame::Datagram
                | SentFrame::ConnectionClose => {}
            }
        }

        if unblocked {
            self.send.remove_blocked_reason(conn_blocked::CONGESTION_CONTROL);
            self.send.queue_flush();
        }
    }

    /// The loss-detection collaborator decided an earlier congestion event
    /// was spurious
    pub fn on_spurious_congestion(&mut self) {
        if self.cc.on_spurious_congestion() {
            self.send.remove_blocked_reason(conn_blocked::CONGESTION_CONTROL);
            self.send.queue_flush();
        }
    }

    // ===== timers =====

    /// Starts the delayed ACK timer unless an ACK is already pending
    pub(crate) fn start_delayed_ack_timer(&mut self, now: Timestamp) {
        debug_assert!(self.settings.max_ack_delay > Duration::ZERO);
        if !self.send.delayed_ack_timer_active
            && self.send.send_flags & flags::ACK == 0
            && !self.state.closed_locally
            && !self.state.closed_remotely
        {
            tracing::trace!("starting ACK delay timer");
            self.timers
                .set(TimerId::AckDelay, now + self.settings.max_ack_delay);
            self.send.delayed_ack_timer_active = true;
        }
        self.validate_send();
    }

    /// Fires expired timers
    pub fn on_timeout(&mut self, now: Timestamp) {
        if self.timers.take_expired(TimerId::AckDelay, now) {
            self.on_ack_delay_expired();
        }
        if self.timers.take_expired(TimerId::Pacing, now) {
            self.send.remove_blocked_reason(conn_blocked::PACING);
            self.send.queue_flush();
        }
    }

    fn on_ack_delay_expired(&mut self) {
        debug_assert!(self.send.delayed_ack_timer_active);
        debug_assert!(self.send.send_flags & flags::ACK == 0);
        self.send.delayed_ack_timer_active = false;

        let has_packets_to_acknowledge = self
            .spaces
            .iter()
            .any(|space| space.ack_tracker.ack_eliciting_packets_to_acknowledge() > 0);

        debug_assert!(has_packets_to_acknowledge);
        if has_packets_to_acknowledge {
            self.send.insert_flags(flags::ACK);
            self.send.queue_flush();
        }

        self.validate_send();
    }

    pub fn timer_deadline(&self, id: TimerId) -> Option<Timestamp> {
        self.timers.deadline(id)
    }

    #[inline]
    fn validate_send(&self) {
        if cfg!(debug_assertions) {
            if self.send.uninitialized {
                return;
            }
            let has_packets = self
                .spaces
                .iter()
                .any(|space| space.ack_tracker.ack_eliciting_packets_to_acknowledge() > 0);
            if self.send.send_flags & flags::ACK != 0 {
                assert!(!self.send.delayed_ack_timer_active);
                assert!(has_packets);
            } else if self.send.delayed_ack_timer_active {
                assert!(has_packets);
            }
        }
    }
}
