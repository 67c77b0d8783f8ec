// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Congestion control and round trip time estimation

mod cubic;
mod rtt_estimator;

pub use cubic::{
    Cubic, PERSISTENT_CONGESTION_WINDOW_PACKETS, TEN_TIMES_BETA_CUBIC, TEN_TIMES_C_CUBIC,
};
pub use rtt_estimator::RttEstimator;

use crate::{packet::PacketNumber, time::Timestamp};
use core::time::Duration;

/// Below this smoothed RTT the pacing math is noise, so sends are not paced
pub const MIN_PACING_RTT: Duration = Duration::from_millis(1);

/// How long a pacing-blocked sender waits before flushing the next chunk
pub const SEND_PACING_INTERVAL: Duration = Duration::from_millis(1);

/// Inputs the loss-detection collaborator distills out of one ACK frame
#[derive(Clone, Copy, Debug)]
pub struct AckEvent {
    pub time_now: Timestamp,
    pub largest_acked: PacketNumber,
    /// Ack-eliciting bytes newly removed from flight by this ACK
    pub bytes_acked: u32,
}

/// Inputs the loss-detection collaborator produces when packets are declared lost
#[derive(Clone, Copy, Debug)]
pub struct LossEvent {
    pub largest_lost: PacketNumber,
    /// The largest packet number sent at the time the loss was detected
    pub largest_sent: PacketNumber,
    pub bytes_lost: u32,
    pub persistent_congestion: bool,
}

/// Congestion controller configuration, shared by all algorithms
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub initial_window_packets: u32,
    pub send_idle_timeout: Duration,
    pub pacing_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_window_packets: 10,
            send_idle_timeout: Duration::from_secs(1),
            pacing_enabled: true,
        }
    }
}

/// The per-connection congestion controller
///
/// Algorithms are dispatched through this sum type; CUBIC is the only
/// implementation today.
#[derive(Clone, Debug)]
pub enum CongestionController {
    Cubic(Cubic),
}

impl CongestionController {
    pub fn cubic(max_datagram_size: u16, config: &Config) -> Self {
        Self::Cubic(Cubic::new(max_datagram_size, config))
    }

    #[inline]
    pub fn can_send(&self) -> bool {
        match self {
            Self::Cubic(cc) => cc.can_send(),
        }
    }

    #[inline]
    pub fn set_exemption(&mut self, num_packets: u8) {
        match self {
            Self::Cubic(cc) => cc.set_exemption(num_packets),
        }
    }

    #[inline]
    pub fn get_send_allowance(
        &mut self,
        rtt: &RttEstimator,
        time_since_last_send: Duration,
        time_since_last_send_valid: bool,
    ) -> u32 {
        match self {
            Self::Cubic(cc) => {
                cc.get_send_allowance(rtt, time_since_last_send, time_since_last_send_valid)
            }
        }
    }

    #[inline]
    pub fn on_data_sent(&mut self, bytes: u32) {
        match self {
            Self::Cubic(cc) => cc.on_data_sent(bytes),
        }
    }

    #[inline]
    pub fn on_data_invalidated(&mut self, bytes: u32) -> bool {
        match self {
            Self::Cubic(cc) => cc.on_data_invalidated(bytes),
        }
    }

    #[inline]
    pub fn on_data_acknowledged(&mut self, event: &AckEvent, rtt: &RttEstimator) -> bool {
        match self {
            Self::Cubic(cc) => cc.on_data_acknowledged(event, rtt),
        }
    }

    #[inline]
    pub fn on_data_lost(&mut self, event: &LossEvent) -> bool {
        match self {
            Self::Cubic(cc) => cc.on_data_lost(event),
        }
    }

    #[inline]
    pub fn on_spurious_congestion(&mut self) -> bool {
        match self {
            Self::Cubic(cc) => cc.on_spurious_congestion(),
        }
    }

    #[inline]
    pub fn reset(&mut self, full: bool) {
        match self {
            Self::Cubic(cc) => cc.reset(full),
        }
    }

    #[inline]
    pub fn congestion_window(&self) -> u32 {
        match self {
            Self::Cubic(cc) => cc.congestion_window(),
        }
    }

    #[inline]
    pub fn bytes_in_flight(&self) -> u32 {
        match self {
            Self::Cubic(cc) => cc.bytes_in_flight(),
        }
    }

    #[inline]
    pub fn is_in_recovery(&self) -> bool {
        match self {
            Self::Cubic(cc) => cc.is_in_recovery(),
        }
    }

    #[inline]
    pub fn exemptions(&self) -> u8 {
        match self {
            Self::Cubic(cc) => cc.exemptions(),
        }
    }
}
