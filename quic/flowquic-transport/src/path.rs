// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Per-path state consumed by the send scheduler
#[derive(Clone, Debug)]
pub struct Path {
    /// Usable UDP payload bytes per datagram on this path
    pub mtu: u16,
    /// Anti-amplification budget. `u32::MAX` once the peer's address is
    /// validated.
    pub allowance: u32,
    pub is_peer_validated: bool,
    /// True once a full-MTU packet made it through
    pub is_min_mtu_validated: bool,
    /// Challenge payload to send in a dedicated PATH_CHALLENGE packet
    pub challenge_pending: Option<[u8; 8]>,
    /// Response payload to echo back in a PATH_RESPONSE frame
    pub response_pending: Option<[u8; 8]>,
}

impl Path {
    pub fn new(mtu: u16) -> Self {
        Self {
            mtu,
            allowance: 0,
            is_peer_validated: false,
            is_min_mtu_validated: false,
            challenge_pending: None,
            response_pending: None,
        }
    }

    /// A path whose peer address is already validated (e.g. a client's
    /// initial path)
    pub fn validated(mtu: u16) -> Self {
        Self {
            allowance: u32::MAX,
            is_peer_validated: true,
            is_min_mtu_validated: true,
            ..Self::new(mtu)
        }
    }

    /// Lifts amplification limits once the peer address is validated
    pub fn on_peer_validated(&mut self) {
        self.is_peer_validated = true;
        self.allowance = u32::MAX;
    }

    /// Consumes amplification budget for a sent datagram
    #[inline]
    pub fn on_datagram_sent(&mut self, len: u16) {
        if self.allowance != u32::MAX {
            self.allowance = self.allowance.saturating_sub(len as u32);
        }
    }

    /// Grants amplification budget for a received datagram (3x)
    #[inline]
    pub fn on_datagram_received(&mut self, len: u16) {
        if self.allowance != u32::MAX {
            self.allowance = self.allowance.saturating_add(3 * len as u32);
        }
    }
}
