// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The send flush loop
//!
//! Fills packets in priority order: connection-wide control data first, then
//! MTU probes, then stream data. The loop never blocks; it returns
//! `Complete`, `Incomplete` (scheduling-limited, another flush is queued) or
//! `DelayedPacing` (the pacing timer is armed).

use crate::{
    connection::{Connection, TimerId},
    send::{
        blocked_reasons as conn_blocked, flags,
        packet_builder::{
            Datagram, PacketBuilder, MAX_DATAGRAMS_PER_SEND, MAX_FRAMES_PER_PACKET,
            MIN_PACKET_SPARE_SPACE,
        },
        FlushResult, MIN_SEND_ALLOWANCE, STREAM_SEND_BATCH_COUNT,
    },
    space::SentFrame,
    stream::StreamId,
};
use flowquic_core::{
    frame,
    packet::{KeyType, PacketNumberSpace},
    recovery::SEND_PACING_INTERVAL,
    time::Timestamp,
    transport,
    varint::VarInt,
};
use std::time::Duration;

#[inline]
fn varint(value: u64) -> VarInt {
    VarInt::new(value).expect("value within varint range")
}

impl Connection {
    /// Runs one flush pass, producing a batch of datagrams for the datapath
    pub fn flush(&mut self, now: Timestamp) -> (FlushResult, Vec<Datagram>) {
        self.send.flush_operation_pending = false;
        self.timers.cancel(TimerId::Pacing);
        self.send
            .remove_blocked_reason(conn_blocked::SCHEDULING | conn_blocked::PACING);

        // Pacing allowance for this pass
        let (elapsed, elapsed_valid) = match self.send.last_flush_time {
            Some(last) if now >= last => (now - last, true),
            _ => (Duration::ZERO, false),
        };
        let send_allowance = self.cc.get_send_allowance(&self.rtt, elapsed, elapsed_valid);
        self.send.last_flush_time = Some(now);

        if !self.paths[0].is_peer_validated {
            // MTU probing needs a validated peer address
            self.send.clear_flags(flags::DPLPMTUD);
        }

        let mut datagrams = Vec::new();

        if self.send.send_flags == 0 && !self.send.has_queued_streams() {
            return (FlushResult::Complete, datagrams);
        }

        // Path challenges go out in dedicated, possibly padded packets
        if self.send.send_flags & flags::PATH_CHALLENGE != 0 {
            self.send.clear_flags(flags::PATH_CHALLENGE);
            self.send_path_challenges(&mut datagrams);
        }

        let mut builder = PacketBuilder::new(send_allowance);
        let mut result = FlushResult::Incomplete;
        let mut current_stream: Option<StreamId> = None;
        let mut stream_packet_count = 0u32;
        let mut loop_guard = 0u32;

        loop {
            loop_guard += 1;
            debug_assert!(loop_guard < 1000, "flush loop is not making progress");

            if self.paths[0].allowance < MIN_SEND_ALLOWANCE {
                tracing::trace!("blocked by amplification protection");
                self.send
                    .add_blocked_reason(conn_blocked::AMPLIFICATION_PROTECTION);
                result = FlushResult::Complete;
                break;
            }

            let mut send_flags = self.send.send_flags;
            if self.write_key_type < KeyType::OneRtt {
                send_flags &= flags::ALLOWED_HANDSHAKE;
            }
            if self.paths[0].allowance != u32::MAX {
                // Datagram frames may not fit the limited pre-validation space
                send_flags &= !flags::DATAGRAM;
            }

            if !builder.has_allowance(&self.cc) {
                // Congestion blocked: very little may still be sent
                send_flags &= flags::BYPASS_CC;
                if send_flags == 0 {
                    if self.cc.can_send() {
                        // The pacing chunk ran out; schedule the next one
                        self.send.add_blocked_reason(conn_blocked::PACING);
                        self.timers
                            .set(TimerId::Pacing, now + SEND_PACING_INTERVAL);
                        result = FlushResult::DelayedPacing;
                    } else {
                        self.send
                            .add_blocked_reason(conn_blocked::CONGESTION_CONTROL);
                        result = FlushResult::Complete;
                    }
                    break;
                }
            }

            // Packet fill order: connection control data, then MTU probes,
            // then stream data.
            let mut wrote_packet_frames;
            let mut flush_batched_datagrams = false;
            let send_connection_control =
                send_flags & !(flags::DPLPMTUD | flags::PATH_CHALLENGE) != 0;

            if send_connection_control {
                let key = self.write_key_type;
                if !builder.prepare(
                    key,
                    &mut self.spaces[key.space().index()],
                    &self.paths[0],
                ) {
                    break;
                }
                wrote_packet_frames = self.write_connection_frames(&mut builder, send_flags);
            } else if send_flags & flags::DPLPMTUD != 0 {
                let key = self.write_key_type;
                if !builder.prepare(
                    key,
                    &mut self.spaces[key.space().index()],
                    &self.paths[0],
                ) {
                    break;
                }
                // Probe the full path MTU; include a PING so it gets ACKed
                builder.pad_to_full();
                flush_batched_datagrams = true;
                self.send.clear_flags(flags::DPLPMTUD);
                if builder.metadata.frame_count() < MAX_FRAMES_PER_PACKET
                    && builder.remaining_space() > 0
                {
                    builder.frame_buf()[0] = frame::tag::PING as u8;
                    builder.commit(1);
                    builder.add_frame(SentFrame::Ping, true);
                    wrote_packet_frames = true;
                } else {
                    wrote_packet_frames = false;
                }
            } else {
                let stream_id = match current_stream {
                    Some(id) => Some(id),
                    None => {
                        let next = self.get_next_stream(&mut stream_packet_count);
                        current_stream = next;
                        next
                    }
                };
                let Some(id) = stream_id else {
                    // Nothing else to send right now
                    result = FlushResult::Complete;
                    break;
                };

                let key = if self.write_key_type == KeyType::OneRtt {
                    KeyType::OneRtt
                } else {
                    KeyType::ZeroRtt
                };
                if !builder.prepare(
                    key,
                    &mut self.spaces[key.space().index()],
                    &self.paths[0],
                ) {
                    break;
                }

                // Opportunistically prepend ACKs (never in 0-RTT packets)
                let mut wrote = false;
                if key != KeyType::ZeroRtt {
                    let space = &mut self.spaces[key.space().index()];
                    if space.ack_tracker.has_packets_to_ack()
                        && space.ack_tracker.encode_ack_frame(&mut builder)
                    {
                        self.send.clear_flags(flags::ACK);
                        wrote = true;
                    }
                }

                let allowed_by_peer = self.streams.allowed_by_peer(id);
                let Some(stream) = self.streams.get_mut(id) else {
                    current_stream = None;
                    self.send.remove_stream(id);
                    continue;
                };

                wrote |= stream.write_frames(&mut self.send, &mut builder);
                wrote_packet_frames = wrote;

                if stream.send_flags == 0 {
                    // Nothing left on this stream; unlink it
                    self.send.remove_stream(id);
                    current_stream = None;
                } else if (wrote && {
                    stream_packet_count = stream_packet_count.saturating_sub(1);
                    stream_packet_count == 0
                }) || !stream.can_send_now(
                    key == KeyType::ZeroRtt,
                    allowed_by_peer,
                    &self.send,
                ) {
                    // Batch exhausted or blocked; try another stream next
                    current_stream = None;
                }
            }

            self.send.tail_loss_probe_needed = false;

            if !wrote_packet_frames
                || flush_batched_datagrams
                || builder.metadata.frame_count() == MAX_FRAMES_PER_PACKET
                || builder.remaining_space() < MIN_PACKET_SPARE_SPACE
            {
                let space_index = builder.key_type.space().index();
                if !builder.finalize(
                    &mut self.spaces[space_index],
                    &mut self.cc,
                    &mut self.paths[0],
                ) {
                    break;
                }
            }

            if !builder.is_prepared()
                && builder.total_count_datagrams as usize >= MAX_DATAGRAMS_PER_SEND
            {
                break;
            }
        }

        if builder.is_prepared() {
            let space_index = builder.key_type.space().index();
            builder.finalize(
                &mut self.spaces[space_index],
                &mut self.cc,
                &mut self.paths[0],
            );
        }
        datagrams.extend(builder.take_batch());

        tracing::trace!(
            flags = format_args!("{:#x}", self.send.send_flags),
            datagrams = datagrams.len(),
            ?result,
            "flush complete"
        );

        if result == FlushResult::Incomplete {
            // Scheduling limited: queue another pass and hint the peer to
            // tolerate a full batch before acknowledging
            self.send.add_blocked_reason(conn_blocked::SCHEDULING);
            self.send.queue_flush();

            let batch = builder.total_count_datagrams;
            if batch.saturating_add(1) > self.peer_packet_tolerance {
                self.update_peer_packet_tolerance(batch.saturating_add(1));
            }
        }

        (result, datagrams)
    }

    /// Writes pending connection-level frames into the packet, most
    /// important first. ACKs lead; CONNECTION_CLOSE replaces everything
    /// after it.
    fn write_connection_frames(&mut self, builder: &mut PacketBuilder, send_flags: u32) -> bool {
        let prev_frame_count = builder.metadata.frame_count();
        let is_one_rtt_level = matches!(builder.key_type, KeyType::OneRtt | KeyType::ZeroRtt);

        if builder.key_type != KeyType::ZeroRtt {
            let space = &mut self.spaces[builder.key_type.space().index()];
            if space.ack_tracker.has_packets_to_ack() {
                if space.ack_tracker.encode_ack_frame(builder) {
                    self.send.clear_flags(flags::ACK);
                } else {
                    return builder.metadata.frame_count() > prev_frame_count;
                }
            }
        }

        if send_flags & flags::CRYPTO != 0 {
            self.write_crypto_frame(builder);
            if builder.metadata.frame_count() == MAX_FRAMES_PER_PACKET {
                return true;
            }
        }

        if send_flags & (flags::CONNECTION_CLOSE | flags::APPLICATION_CLOSE) != 0 {
            let mut is_application = send_flags & flags::APPLICATION_CLOSE != 0;
            if self.state.closed_remotely {
                // We're only acknowledging the peer's close
                is_application = false;
            }

            let mut error_code = self.close_error_code;
            if is_application && !is_one_rtt_level {
                // A 0x1d close must become 0x1c outside 1-RTT so application
                // state is not revealed; the code becomes APPLICATION_ERROR.
                error_code = transport::Error::APPLICATION_ERROR.code.as_u64();
                is_application = false;
            }

            let close = frame::ConnectionClose {
                is_application,
                error_code: varint(error_code),
                frame_type: VarInt::ZERO,
                reason: &[],
            };
            if let Some(len) = close.encode(builder.frame_buf()) {
                builder.commit(len);
                builder.written_connection_close_frame = true;
                self.send
                    .clear_flags(flags::CONNECTION_CLOSE | flags::APPLICATION_CLOSE);
                builder.add_frame(SentFrame::ConnectionClose, false);
            }

            // The close frame supersedes all

            return builder.metadata.frame_count() > prev_frame_count;
        }

        if send_flags & flags::PATH_RESPONSE != 0 {
            for index in 0..self.paths.len() {
                let Some(data) = self.paths[index].response_pending else {
                    continue;
                };
                let response = frame::PathResponse { data };
                let Some(len) = response.encode(builder.frame_buf()) else {
                    break;
                };
                builder.commit(len);
                self.paths[index].response_pending = None;
                if builder.add_frame(SentFrame::PathResponse, true) {
                    break;
                }
            }
            if self.paths.iter().all(|path| path.response_pending.is_none()) {
                self.send.clear_flags(flags::PATH_RESPONSE);
            }
            if builder.metadata.frame_count() == MAX_FRAMES_PER_PACKET {
                return true;
            }
        }

        if is_one_rtt_level {
            if builder.key_type == KeyType::OneRtt
                && send_flags & flags::HANDSHAKE_DONE != 0
                && builder.remaining_space() > 0
            {
                builder.frame_buf()[0] = frame::tag::HANDSHAKE_DONE as u8;
                builder.commit(1);
                builder.pad_to_full();
                self.send.clear_flags(flags::HANDSHAKE_DONE);
                if builder.add_frame(SentFrame::HandshakeDone, true) {
                    return true;
                }
            }

            if send_flags & flags::DATA_BLOCKED != 0 {
                let frame = frame::DataBlocked {
                    data_limit: varint(self.send.ordered_stream_bytes_sent),
                };
                if let Some(len) = frame.encode(builder.frame_buf()) {
                    builder.commit(len);
                    self.send.clear_flags(flags::DATA_BLOCKED);
                    if builder.add_frame(SentFrame::DataBlocked, true) {
                        return true;
                    }
                }
            }

            if send_flags & flags::MAX_DATA != 0 {
                let frame = frame::MaxData {
                    maximum_data: varint(self.send.max_data),
                };
                if let Some(len) = frame.encode(builder.frame_buf()) {
                    builder.commit(len);
                    self.send.clear_flags(flags::MAX_DATA);
                    if builder.add_frame(SentFrame::MaxData, true) {
                        return true;
                    }
                }
            }

            if send_flags & flags::MAX_STREAMS_BIDI != 0 {
                let frame = frame::MaxStreams {
                    bidirectional: true,
                    maximum_streams: varint(self.local_stream_grant(true)),
                };
                if let Some(len) = frame.encode(builder.frame_buf()) {
                    builder.commit(len);
                    self.send.clear_flags(flags::MAX_STREAMS_BIDI);
                    if builder.add_frame(SentFrame::MaxStreamsBidi, true) {
                        return true;
                    }
                }
            }

            if send_flags & flags::BIDI_STREAMS_BLOCKED != 0 {
                let frame = frame::StreamsBlocked {
                    bidirectional: true,
                    stream_limit: varint(self.peer_stream_grant(true)),
                };
                if let Some(len) = frame.encode(builder.frame_buf()) {
                    builder.commit(len);
                    self.send.clear_flags(flags::BIDI_STREAMS_BLOCKED);
                    if builder.add_frame(SentFrame::BidiStreamsBlocked, true) {
                        return true;
                    }
                }
            }

            if send_flags & flags::UNI_STREAMS_BLOCKED != 0 {
                let frame = frame::StreamsBlocked {
                    bidirectional: false,
                    stream_limit: varint(self.peer_stream_grant(false)),
                };
                if let Some(len) = frame.encode(builder.frame_buf()) {
                    builder.commit(len);
                    self.send.clear_flags(flags::UNI_STREAMS_BLOCKED);
                    if builder.add_frame(SentFrame::UniStreamsBlocked, true) {
                        return true;
                    }
                }
            }

            if send_flags & flags::MAX_STREAMS_UNI != 0 {
                let frame = frame::MaxStreams {
                    bidirectional: false,
                    maximum_streams: varint(self.local_stream_grant(false)),
                };
                if let Some(len) = frame.encode(builder.frame_buf()) {
                    builder.commit(len);
                    self.send.clear_flags(flags::MAX_STREAMS_UNI);
                    if builder.add_frame(SentFrame::MaxStreamsUni, true) {
                        return true;
                    }
                }
            }

            if send_flags & flags::NEW_CONNECTION_ID != 0 {
                let mut has_more_cids_to_send = false;
                let mut frame_limit_hit = false;
                let stateless_reset_token = [0u8; 16];
                for index in 0..self.source_cids.len() {
                    if !self.source_cids[index].needs_to_send {
                        continue;
                    }
                    if frame_limit_hit {
                        has_more_cids_to_send = true;
                        break;
                    }
                    let cid = &self.source_cids[index];
                    let frame = frame::NewConnectionId {
                        sequence: varint(cid.sequence),
                        retire_prior_to: VarInt::ZERO,
                        connection_id: &cid.data,
                        stateless_reset_token: &stateless_reset_token,
                    };
                    let Some(len) = frame.encode(builder.frame_buf()) else {
                        has_more_cids_to_send = true;
                        break;
                    };
                    builder.commit(len);
                    let sequence = cid.sequence;
                    self.source_cids[index].needs_to_send = false;
                    frame_limit_hit =
                        builder.add_frame(SentFrame::NewConnectionId { sequence }, true);
                }
                if !has_more_cids_to_send {
                    self.send.clear_flags(flags::NEW_CONNECTION_ID);
                }
                if frame_limit_hit {
                    return true;
                }
            }

            if send_flags & flags::RETIRE_CONNECTION_ID != 0 {
                let mut has_more_cids_to_send = false;
                let mut frame_limit_hit = false;
                for index in 0..self.retired_dest_cids.len() {
                    if !self.retired_dest_cids[index].needs_to_send {
                        continue;
                    }
                    if frame_limit_hit {
                        has_more_cids_to_send = true;
                        break;
                    }
                    let sequence = self.retired_dest_cids[index].sequence;
                    let frame = frame::RetireConnectionId {
                        sequence: varint(sequence),
                    };
                    let Some(len) = frame.encode(builder.frame_buf()) else {
                        has_more_cids_to_send = true;
                        break;
                    };
                    builder.commit(len);
                    self.retired_dest_cids[index].needs_to_send = false;
                    frame_limit_hit =
                        builder.add_frame(SentFrame::RetireConnectionId { sequence }, true);
                }
                if !has_more_cids_to_send {
                    self.send.clear_flags(flags::RETIRE_CONNECTION_ID);
                }
                if frame_limit_hit {
                    return true;
                }
            }

            if send_flags & flags::ACK_FREQUENCY != 0 {
                let frame = frame::AckFrequency {
                    sequence: varint(self.send_ack_freq_seq_num),
                    ack_eliciting_threshold: varint(self.peer_packet_tolerance as u64),
                    requested_max_ack_delay: varint(
                        self.settings.max_ack_delay.as_micros() as u64
                    ),
                    reordering_threshold: varint(1),
                };
                if let Some(len) = frame.encode(builder.frame_buf()) {
                    builder.commit(len);
                    self.send_ack_freq_seq_num += 1;
                    self.send.clear_flags(flags::ACK_FREQUENCY);
                    if builder.add_frame(SentFrame::AckFrequency, true) {
                        return true;
                    }
                }
            }

            if send_flags & flags::DATAGRAM != 0 {
                while let Some(data) = self.datagram_send_queue.front() {
                    let frame = frame::Datagram { data };
                    let Some(len) = frame.encode(builder.frame_buf()) else {
                        break;
                    };
                    builder.commit(len);
                    self.datagram_send_queue.pop_front();
                    if builder.add_frame(SentFrame::Datagram, true) {
                        return true;
                    }
                }
                if self.datagram_send_queue.is_empty() {
                    self.send.clear_flags(flags::DATAGRAM);
                }
            }
        }

        if send_flags & flags::PING != 0 && builder.remaining_space() > 0 {
            builder.frame_buf()[0] = frame::tag::PING as u8;
            builder.commit(1);
            self.send.clear_flags(flags::PING);
            if self.settings.keep_alive_padding > 0 {
                // Pad just enough to keep NAT bindings fresh
                builder.min_datagram_length = builder.datagram_length
                    + self.settings.keep_alive_padding
                    + builder.encryption_overhead;
            } else {
                builder.pad_to_full();
            }
            if builder.add_frame(SentFrame::Ping, true) {
                return true;
            }
        }

        builder.metadata.frame_count() > prev_frame_count
    }

    /// Writes one CRYPTO frame from the handshake byte queue
    fn write_crypto_frame(&mut self, builder: &mut PacketBuilder) {
        let total = self.crypto_buffer.len() as u64;
        if self.crypto_next_offset >= total {
            self.send.clear_flags(flags::CRYPTO);
            return;
        }

        let offset = self.crypto_next_offset;
        let space_len = builder.remaining_space() as usize;
        // tag + offset varint + a generous length varint
        let header_estimate = 1 + varint(offset).encoding_size() + 4;
        ensure!(space_len > header_estimate);

        let chunk_len = ((total - offset) as usize).min(space_len - header_estimate);
        let crypto = frame::Crypto {
            offset: varint(offset),
            data: &self.crypto_buffer[offset as usize..offset as usize + chunk_len],
        };
        let Some(len) = crypto.encode(builder.frame_buf()) else {
            return;
        };
        builder.commit(len);

        self.crypto_next_offset += chunk_len as u64;
        if self.crypto_next_offset >= total {
            self.send.clear_flags(flags::CRYPTO);
        }

        builder.add_frame(
            SentFrame::Crypto {
                offset,
                length: chunk_len as u16,
            },
            true,
        );
    }

    /// Picks the highest-priority stream that can send right now; in
    /// round-robin mode rotates it behind its priority class and limits its
    /// batch
    fn get_next_stream(&mut self, packet_count: &mut u32) -> Option<StreamId> {
        let zero_rtt = match self.write_key_type {
            KeyType::OneRtt => false,
            _ if self.has_zero_rtt_key => true,
            _ => return None,
        };

        let candidates: Vec<StreamId> = self.send.queued_stream_ids().collect();
        for id in candidates {
            let allowed_by_peer = self.streams.allowed_by_peer(id);
            let Some(stream) = self.streams.map.get(&id.as_u64()) else {
                continue;
            };

            if stream.can_send_now(zero_rtt, allowed_by_peer, &self.send) {
                if self.settings.use_round_robin_stream_scheduling {
                    self.send.rotate_stream(id);
                    *packet_count = STREAM_SEND_BATCH_COUNT;
                } else {
                    // FIFO prioritization holds the slot until blocked
                    *packet_count = u32::MAX;
                }
                return Some(id);
            }
        }

        None
    }

    /// Sends a dedicated (possibly MTU-padded) packet with a PATH_CHALLENGE
    /// on every path that needs one
    fn send_path_challenges(&mut self, out: &mut Vec<Datagram>) {
        if self.write_key_type != KeyType::OneRtt {
            // Challenges require 1-RTT keys; retry once they exist
            self.send.insert_flags(flags::PATH_CHALLENGE);
            return;
        }

        let space_index = PacketNumberSpace::ApplicationData.index();
        for index in 0..self.paths.len() {
            let Some(challenge) = self.paths[index].challenge_pending else {
                continue;
            };
            if self.paths[index].allowance < MIN_SEND_ALLOWANCE {
                self.send.insert_flags(flags::PATH_CHALLENGE);
                continue;
            }

            let mut builder = PacketBuilder::new(u32::MAX);
            if !builder.prepare(
                KeyType::OneRtt,
                &mut self.spaces[space_index],
                &self.paths[index],
            ) {
                continue;
            }

            if !self.paths[index].is_min_mtu_validated {
                // Pad like an Initial so the path's minimum MTU is validated
                // (amplification limits cap this via the datagram budget)
                builder.pad_to_full();
            }

            let frame = frame::PathChallenge { data: challenge };
            if let Some(len) = frame.encode(builder.frame_buf()) {
                builder.commit(len);
                builder.add_frame(SentFrame::PathChallenge, true);
                self.paths[index].challenge_pending = None;
            }

            builder.finalize(
                &mut self.spaces[space_index],
                &mut self.cc,
                &mut self.paths[index],
            );
            out.extend(builder.take_batch());
        }
    }
}
