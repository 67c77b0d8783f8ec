// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-encryption-level packet bookkeeping
//!
//! Each packet number space owns an [`AckTracker`] for packets received from
//! the peer and a store of sent-packet metadata which the ack and loss paths
//! replay into the stream and congestion state.

use crate::{range_set::RangeSet, send::packet_builder::PacketBuilder, stream::StreamId};
use flowquic_core::{
    frame,
    packet::{KeyType, PacketNumber},
    varint::VarInt,
};
use hashbrown::HashMap;
use smallvec::SmallVec;

/// Per-frame metadata recorded at packet build time, replayed on ack/loss
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SentFrame {
    Stream {
        id: StreamId,
        offset: u64,
        length: u16,
        /// The frame was this stream's first transmission (OPEN flag)
        open: bool,
        fin: bool,
    },
    ResetStream { id: StreamId },
    StopSending { id: StreamId },
    MaxStreamData { id: StreamId },
    StreamDataBlocked { id: StreamId },
    Crypto { offset: u64, length: u16 },
    Ack,
    MaxData,
    DataBlocked,
    MaxStreamsBidi,
    MaxStreamsUni,
    BidiStreamsBlocked,
    UniStreamsBlocked,
    NewConnectionId { sequence: u64 },
    RetireConnectionId { sequence: u64 },
    PathChallenge,
    PathResponse,
    HandshakeDone,
    AckFrequency,
    ConnectionClose,
    Ping,
    Datagram,
}

#[derive(Clone, Debug)]
pub struct SentPacketMetadata {
    pub packet_number: PacketNumber,
    pub key_type: KeyType,
    pub is_ack_eliciting: bool,
    /// On-wire datagram bytes attributed to this packet
    pub bytes: u16,
    pub frames: SmallVec<[SentFrame; 4]>,
}

impl SentPacketMetadata {
    pub fn new(packet_number: PacketNumber, key_type: KeyType) -> Self {
        Self {
            packet_number,
            key_type,
            is_ack_eliciting: false,
            bytes: 0,
            frames: SmallVec::new(),
        }
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

/// Tracks packets received from the peer which still need acknowledging
#[derive(Clone, Debug, Default)]
pub struct AckTracker {
    packets_to_ack: RangeSet,
    ack_eliciting_packets_to_acknowledge: u16,
    largest_received: Option<PacketNumber>,
    /// No new packets arrived since the last ACK frame went out
    already_written_ack_frame: bool,
}

impl AckTracker {
    /// Records a received packet. Returns true when enough ack-eliciting
    /// packets accumulated that an ACK should be sent immediately.
    pub fn on_packet_received(
        &mut self,
        packet_number: PacketNumber,
        ack_eliciting: bool,
        packet_tolerance: u16,
    ) -> bool {
        let _ = self.packets_to_ack.add(packet_number, 1);
        self.already_written_ack_frame = false;
        if self.largest_received.is_none_or(|pn| packet_number > pn) {
            self.largest_received = Some(packet_number);
        }
        if ack_eliciting {
            self.ack_eliciting_packets_to_acknowledge += 1;
        }
        self.ack_eliciting_packets_to_acknowledge >= packet_tolerance
    }

    #[inline]
    pub fn has_packets_to_ack(&self) -> bool {
        !self.packets_to_ack.is_empty() && !self.already_written_ack_frame
    }

    #[inline]
    pub fn ack_eliciting_packets_to_acknowledge(&self) -> u16 {
        self.ack_eliciting_packets_to_acknowledge
    }

    /// Writes an ACK frame into the packet under construction.
    ///
    /// Returns false if the frame did not fit.
    pub fn encode_ack_frame(&mut self, builder: &mut PacketBuilder) -> bool {
        let Some(last) = self.packets_to_ack.last() else {
            return false;
        };

        let largest = last.high() - 1;
        let first_range = last.count - 1;

        // (gap, length) pairs over the remaining ranges, descending
        let mut ranges: SmallVec<[(VarInt, VarInt); 8]> = SmallVec::new();
        let mut prev_low = last.low;
        for range in self.packets_to_ack.iter().rev().skip(1) {
            let gap = prev_low - range.high() - 1;
            let length = range.count - 1;
            ranges.push((
                VarInt::new(gap).expect("gap fits"),
                VarInt::new(length).expect("length fits"),
            ));
            prev_low = range.low;
        }

        let ack = frame::Ack {
            largest: VarInt::new(largest).expect("packet number fits"),
            ack_delay: VarInt::ZERO,
            first_range: VarInt::new(first_range).expect("range fits"),
            ranges: &ranges,
        };

        let Some(len) = ack.encode(builder.frame_buf()) else {
            return false;
        };
        builder.commit(len);
        builder.add_frame(SentFrame::Ack, false);
        self.ack_eliciting_packets_to_acknowledge = 0;
        self.already_written_ack_frame = true;
        true
    }
}

/// One per encryption level
#[derive(Clone, Debug, Default)]
pub struct PacketSpace {
    pub ack_tracker: AckTracker,
    next_packet_number: PacketNumber,
    sent_packets: HashMap<PacketNumber, SentPacketMetadata>,
}

impl PacketSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next packet number
    #[inline]
    pub fn next_packet_number(&mut self) -> PacketNumber {
        let pn = self.next_packet_number;
        self.next_packet_number += 1;
        pn
    }

    #[inline]
    pub fn largest_sent(&self) -> PacketNumber {
        self.next_packet_number.saturating_sub(1)
    }

    pub fn on_packet_sent(&mut self, metadata: SentPacketMetadata) {
        self.sent_packets.insert(metadata.packet_number, metadata);
    }

    /// Hands the metadata to the ack/loss replay path, at most once per packet
    pub fn take_sent_packet(&mut self, packet_number: PacketNumber) -> Option<SentPacketMetadata> {
        self.sent_packets.remove(&packet_number)
    }

    /// Discards all recovery state, e.g. when the key is dropped
    pub fn discard(&mut self) -> impl Iterator<Item = SentPacketMetadata> + '_ {
        self.sent_packets.drain().map(|(_, metadata)| metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_tracker_counts_eliciting_packets() {
        let mut tracker = AckTracker::default();
        assert!(!tracker.on_packet_received(0, false, 2));
        assert!(tracker.has_packets_to_ack());
        assert!(!tracker.on_packet_received(1, true, 2));
        assert!(tracker.on_packet_received(2, true, 2));
        assert_eq!(tracker.ack_eliciting_packets_to_acknowledge(), 2);
    }

    #[test]
    fn packet_numbers_are_sequential() {
        let mut space = PacketSpace::new();
        assert_eq!(space.next_packet_number(), 0);
        assert_eq!(space.next_packet_number(), 1);
        assert_eq!(space.largest_sent(), 1);
    }

    #[test]
    fn sent_packets_are_taken_once() {
        let mut space = PacketSpace::new();
        let pn = space.next_packet_number();
        space.on_packet_sent(SentPacketMetadata::new(pn, KeyType::OneRtt));
        assert!(space.take_sent_packet(pn).is_some());
        assert!(space.take_sent_packet(pn).is_none());
    }
}
