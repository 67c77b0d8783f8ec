// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Assembles frames into datagrams
//!
//! Header protection and AEAD are collaborators outside this core; packets
//! carry a stub header (key type byte plus a 32-bit packet number) and
//! reserve a fixed tag's worth of overhead, which keeps the space accounting
//! identical to the production path.

use crate::{
    path::Path,
    space::{PacketSpace, SentFrame, SentPacketMetadata},
};
use flowquic_core::{
    packet::{KeyType, PacketNumber},
    recovery::CongestionController,
};

/// Hard cap on frames per packet, bounding per-packet metadata
pub const MAX_FRAMES_PER_PACKET: usize = 12;

/// Hard cap on datagrams built in one flush pass, bounding worker occupancy
pub const MAX_DATAGRAMS_PER_SEND: usize = 40;

/// Packets with less spare room than this are finalized rather than offered
/// to further frame writers
pub const MIN_PACKET_SPARE_SPACE: u16 = 64;

/// Stand-in for the AEAD tag the crypto collaborator would append
pub const ENCRYPTION_OVERHEAD: u16 = 16;

/// Stub header: key type byte + 32-bit packet number
const HEADER_SIZE: u16 = 5;

/// A finished datagram ready for the UDP datapath
#[derive(Clone, Debug)]
pub struct Datagram {
    pub key_type: KeyType,
    pub packet_number: PacketNumber,
    pub payload: Vec<u8>,
}

impl Datagram {
    /// The frame section of the payload (skips the stub header and tag)
    pub fn frames(&self) -> &[u8] {
        &self.payload[HEADER_SIZE as usize..self.payload.len() - ENCRYPTION_OVERHEAD as usize]
    }
}

#[derive(Debug)]
pub struct PacketBuilder {
    buffer: Vec<u8>,
    capacity: u16,
    /// Bytes written so far, including the stub header
    pub datagram_length: u16,
    pub encryption_overhead: u16,
    /// Pad the datagram up to this total length on finalize
    pub min_datagram_length: u16,
    pub key_type: KeyType,
    pub packet_number: PacketNumber,
    pub metadata: SentPacketMetadata,
    /// Pacing budget for this flush pass
    pub send_allowance: u32,
    pub total_count_datagrams: u8,
    pub written_connection_close_frame: bool,
    prepared: bool,
    batch: Vec<Datagram>,
}

impl PacketBuilder {
    pub fn new(send_allowance: u32) -> Self {
        Self {
            buffer: Vec::new(),
            capacity: 0,
            datagram_length: 0,
            encryption_overhead: ENCRYPTION_OVERHEAD,
            min_datagram_length: 0,
            key_type: KeyType::Initial,
            packet_number: 0,
            metadata: SentPacketMetadata::new(0, KeyType::Initial),
            send_allowance,
            total_count_datagrams: 0,
            written_connection_close_frame: false,
            prepared: false,
            batch: Vec::new(),
        }
    }

    #[inline]
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// True while congestion-counted frames may still be added
    #[inline]
    pub fn has_allowance(&self, cc: &CongestionController) -> bool {
        self.send_allowance > 0 || cc.exemptions() > 0
    }

    /// Starts a packet for the given key type if none is in progress.
    ///
    /// Returns false when the path's budget cannot fit a useful packet.
    pub fn prepare(&mut self, key_type: KeyType, space: &mut PacketSpace, path: &Path) -> bool {
        if self.prepared {
            debug_assert_eq!(
                self.key_type, key_type,
                "packet must be finalized before switching key types"
            );
            return self.key_type == key_type;
        }

        let mut budget = path.mtu as u32;
        if path.allowance != u32::MAX {
            budget = budget.min(path.allowance);
        }
        ensure!(
            budget > (HEADER_SIZE + ENCRYPTION_OVERHEAD) as u32,
            false
        );

        self.capacity = budget as u16;
        self.buffer.clear();
        self.buffer.resize(self.capacity as usize, 0);

        let packet_number = space.next_packet_number();
        self.buffer[0] = key_type as u8;
        self.buffer[1..5].copy_from_slice(&(packet_number as u32).to_be_bytes());

        self.datagram_length = HEADER_SIZE;
        self.min_datagram_length = 0;
        self.key_type = key_type;
        self.packet_number = packet_number;
        self.metadata = SentPacketMetadata::new(packet_number, key_type);
        self.prepared = true;
        true
    }

    /// Writable space left for frames in the current packet
    #[inline]
    pub fn remaining_space(&self) -> u16 {
        (self.capacity - self.encryption_overhead).saturating_sub(self.datagram_length)
    }

    /// The unwritten frame section; pair every write with [`Self::commit`]
    #[inline]
    pub fn frame_buf(&mut self) -> &mut [u8] {
        let end = (self.capacity - self.encryption_overhead) as usize;
        &mut self.buffer[self.datagram_length as usize..end]
    }

    #[inline]
    pub fn commit(&mut self, len: usize) {
        debug_assert!(len <= self.remaining_space() as usize);
        self.datagram_length += len as u16;
    }

    /// Pads the datagram to the full path budget on finalize
    #[inline]
    pub fn pad_to_full(&mut self) {
        self.min_datagram_length = self.capacity;
    }

    /// Records frame metadata. Returns true when the per-packet frame limit
    /// is reached and the packet must be finalized.
    pub fn add_frame(&mut self, frame: SentFrame, ack_eliciting: bool) -> bool {
        debug_assert!(self.metadata.frame_count() < MAX_FRAMES_PER_PACKET);
        self.metadata.frames.push(frame);
        if ack_eliciting {
            self.metadata.is_ack_eliciting = true;
        }
        self.metadata.frame_count() == MAX_FRAMES_PER_PACKET
    }

    /// Completes the packet under construction, if any, handing the datagram
    /// to the batch and registering the sent metadata.
    ///
    /// Returns true while more packets may be built in this pass.
    pub fn finalize(
        &mut self,
        space: &mut PacketSpace,
        cc: &mut CongestionController,
        path: &mut Path,
    ) -> bool {
        ensure!(self.prepared, false);
        self.prepared = false;

        if self.metadata.frame_count() == 0 {
            // Nothing was framed; drop the buffer (the packet number gap is
            // harmless)
            return false;
        }

        // Pad with PADDING frames (zero bytes are already in place)
        let padded_length = self
            .min_datagram_length
            .saturating_sub(self.encryption_overhead)
            .min(self.capacity - self.encryption_overhead);
        if self.datagram_length < padded_length {
            self.datagram_length = padded_length;
        }

        let total_length = self.datagram_length + self.encryption_overhead;
        self.buffer.truncate(total_length as usize);

        let mut metadata = core::mem::replace(
            &mut self.metadata,
            SentPacketMetadata::new(0, self.key_type),
        );
        metadata.bytes = total_length;

        if metadata.is_ack_eliciting {
            cc.on_data_sent(total_length as u32);
        }
        path.on_datagram_sent(total_length);
        self.send_allowance = self.send_allowance.saturating_sub(total_length as u32);

        self.batch.push(Datagram {
            key_type: self.key_type,
            packet_number: metadata.packet_number,
            payload: core::mem::take(&mut self.buffer),
        });
        space.on_packet_sent(metadata);

        self.total_count_datagrams += 1;
        self.min_datagram_length = 0;

        (self.total_count_datagrams as usize) < MAX_DATAGRAMS_PER_SEND
    }

    /// Hands over the finished datagrams
    pub fn take_batch(&mut self) -> Vec<Datagram> {
        core::mem::take(&mut self.batch)
    }
}
