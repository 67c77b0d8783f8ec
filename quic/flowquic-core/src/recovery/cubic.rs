// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! CUBIC congestion control (RFC 8312bis) in integer arithmetic
//!
//! Window sizes are in bytes. The controller additionally maintains a
//! Reno-friendly AIMD shadow window grown by Appropriate Byte Counting; the
//! effective congestion window is the larger of the two regions on every ACK.

use crate::{
    counter::Counter,
    packet::PacketNumber,
    recovery::{AckEvent, Config, LossEvent, RttEstimator, MIN_PACING_RTT},
    time::Timestamp,
};
use core::time::Duration;


//= https://www.rfc-editor.org/rfc/rfc8312#section-4.5
//# Parameter beta_cubic SHOULD be set to 0.7.
// 10x multiples for integer arithmetic.
pub const TEN_TIMES_BETA_CUBIC: u32 = 7;

//= https://www.rfc-editor.org/rfc/rfc8312#section-5.1
//# Therefore, C SHOULD be set to 0.4.
pub const TEN_TIMES_C_CUBIC: u32 = 4;

/// Window floor, in packets, used on persistent congestion and as the
/// minimum the multiplicative decrease can produce
pub const PERSISTENT_CONGESTION_WINDOW_PACKETS: u32 = 2;

/// The longest interval the cubic polynomial is evaluated over. Beyond this
/// the window is limited by `2 * BytesInFlightMax` anyway and the integer
/// math would overflow.
const MAX_DELTA_T_MS: i64 = 2_500_000;

/// Computes ⌊∛radicand⌋ with a 3-bit shifting root.
///
/// This works like long division: the radicand is consumed in aligned 3-bit
/// chunks (one bit of root per chunk, since 2^3 = 8) and each step picks the
/// low bit of the shifted root so that y^3 <= x < (y+1)^3 holds.
pub fn cube_root(radicand: u32) -> u32 {
    let mut x: u32 = 0;
    let mut y: u32 = 0;

    let mut i = 30i32;
    while i >= 0 {
        x = x * 8 + ((radicand >> i) & 7);
        let candidate = (y * 2 + 1) as u64;
        if candidate * candidate * candidate <= x as u64 {
            y = y * 2 + 1;
        } else {
            y *= 2;
        }
        i -= 3;
    }
    y
}

/// The six fields rolled back when a congestion event turns out spurious
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Snapshot {
    window_max: u32,
    window_last_max: u32,
    k_cubic: u64,
    slow_start_threshold: u32,
    congestion_window: u32,
    aimd_window: u32,
}

#[derive(Clone, Debug)]
pub struct Cubic {
    congestion_window: u32,
    slow_start_threshold: u32,

    /// Reno-friendly shadow window (RFC 8312 section 4.2)
    aimd_window: u32,
    /// Appropriate Byte Counting accumulator for the shadow window
    aimd_accumulator: u32,

    bytes_in_flight: Counter<u32>,
    /// High watermark of `bytes_in_flight`; the window never grows beyond
    /// twice this value, so it cannot run away without loss feedback
    bytes_in_flight_max: u32,

    /// W_max: window size just before the last window reduction
    window_max: u32,
    /// W_last_max for fast convergence (RFC 8312 section 4.6)
    window_last_max: u32,
    /// K, in milliseconds
    k_cubic: u64,

    /// Unconsumed portion of the last pacing chunk
    last_send_allowance: u32,
    /// Number of packets allowed to bypass the congestion gate (probes)
    exemptions: u8,

    max_datagram_size: u16,
    initial_window_packets: u32,
    send_idle_timeout: Duration,
    pacing_enabled: bool,

    time_of_last_ack: Option<Timestamp>,
    time_of_cong_avoid_start: Option<Timestamp>,
    recovery_sent_packet_number: PacketNumber,

    is_in_recovery: bool,
    is_in_persistent_congestion: bool,
    has_had_congestion_event: bool,

    prev: Option<Snapshot>,
}

impl Cubic {
    pub fn new(max_datagram_size: u16, config: &Config) -> Self {
        let congestion_window = max_datagram_size as u32 * config.initial_window_packets;
        Self {
            congestion_window,
            slow_start_threshold: u32::MAX,
            aimd_window: 0,
            aimd_accumulator: 0,
            bytes_in_flight: Counter::new(0),
            bytes_in_flight_max: congestion_window / 2,
            window_max: 0,
            window_last_max: 0,
            k_cubic: 0,
            last_send_allowance: 0,
            exemptions: 0,
            max_datagram_size,
            initial_window_packets: config.initial_window_packets,
            send_idle_timeout: config.send_idle_timeout,
            pacing_enabled: config.pacing_enabled,
            time_of_last_ack: None,
            time_of_cong_avoid_start: None,
            recovery_sent_packet_number: 0,
            is_in_recovery: false,
            is_in_persistent_congestion: false,
            has_had_congestion_event: false,
            prev: None,
        }
    }

    #[inline]
    pub fn can_send(&self) -> bool {
        *self.bytes_in_flight < self.congestion_window || self.exemptions > 0
    }

    #[inline]
    pub fn set_exemption(&mut self, num_packets: u8) {
        self.exemptions = num_packets;
    }

    #[inline]
    pub fn congestion_window(&self) -> u32 {
        self.congestion_window
    }

    #[inline]
    pub fn slow_start_threshold(&self) -> u32 {
        self.slow_start_threshold
    }

    #[inline]
    pub fn bytes_in_flight(&self) -> u32 {
        *self.bytes_in_flight
    }

    #[inline]
    pub fn bytes_in_flight_max(&self) -> u32 {
        self.bytes_in_flight_max
    }

    #[inline]
    pub fn exemptions(&self) -> u8 {
        self.exemptions
    }

    #[inline]
    pub fn is_in_recovery(&self) -> bool {
        self.is_in_recovery
    }

    #[inline]
    pub fn is_in_persistent_congestion(&self) -> bool {
        self.is_in_persistent_congestion
    }

    #[inline]
    pub fn window_max(&self) -> u32 {
        self.window_max
    }

    #[inline]
    pub fn window_last_max(&self) -> u32 {
        self.window_last_max
    }

    #[inline]
    pub fn k_cubic_ms(&self) -> u64 {
        self.k_cubic
    }

    #[inline]
    pub fn aimd_window(&self) -> u32 {
        self.aimd_window
    }

    #[inline]
    pub fn recovery_sent_packet_number(&self) -> PacketNumber {
        self.recovery_sent_packet_number
    }

    #[inline]
    pub fn time_of_cong_avoid_start(&self) -> Option<Timestamp> {
        self.time_of_cong_avoid_start
    }

    pub fn reset(&mut self, full_reset: bool) {
        self.slow_start_threshold = u32::MAX;
        self.is_in_recovery = false;
        self.has_had_congestion_event = false;
        self.congestion_window = self.max_datagram_size as u32 * self.initial_window_packets;
        self.bytes_in_flight_max = self.congestion_window / 2;
        self.last_send_allowance = 0;
        if full_reset {
            self.bytes_in_flight.set(0);
        }
    }

    /// Returns the number of bytes that may be sent right now.
    ///
    /// When pacing is active this returns the current chunk of the estimated
    /// next-round-trip window rather than the full congestion headroom, so
    /// that window growth via ACK feedback is not slowed down by pacing
    /// itself.
    pub fn get_send_allowance(
        &mut self,
        rtt: &RttEstimator,
        time_since_last_send: Duration,
        time_since_last_send_valid: bool,
    ) -> u32 {
        if *self.bytes_in_flight >= self.congestion_window {
            // Congestion control blocked
            return 0;
        }

        let headroom = self.congestion_window - *self.bytes_in_flight;

        if !time_since_last_send_valid
            || !self.pacing_enabled
            || rtt.first_rtt_sample().is_none()
            || rtt.smoothed_rtt() < MIN_PACING_RTT
        {
            // Not in the necessary state to pace
            return headroom;
        }

        // Predicted window of the next round trip: doubling in slow start
        // (capped at the threshold), 25% growth in congestion avoidance.
        let estimated_wnd: u64 = if self.congestion_window < self.slow_start_threshold {
            ((self.congestion_window as u64) << 1).min(self.slow_start_threshold as u64)
        } else {
            self.congestion_window as u64 + (self.congestion_window as u64 >> 2)
        };

        let srtt_micros = rtt.smoothed_rtt().as_micros() as u64;
        let allowance = (self.last_send_allowance as u64).saturating_add(
            estimated_wnd.saturating_mul(time_since_last_send.as_micros() as u64) / srtt_micros,
        );

        let allowance = if allowance > headroom as u64 {
            headroom
        } else {
            allowance as u32
        };
        self.last_send_allowance = allowance;
        allowance
    }

    pub fn on_data_sent(&mut self, num_retransmittable_bytes: u32) {
        self.bytes_in_flight += num_retransmittable_bytes;
        if self.bytes_in_flight_max < *self.bytes_in_flight {
            self.bytes_in_flight_max = *self.bytes_in_flight;
        }

        self.last_send_allowance = self
            .last_send_allowance
            .saturating_sub(num_retransmittable_bytes);

        if self.exemptions > 0 {
            self.exemptions -= 1;
        }
    }

    /// Removes bytes from flight without an ACK, e.g. when the packet is
    /// discarded with its key. Returns true if the sender became unblocked.
    pub fn on_data_invalidated(&mut self, num_retransmittable_bytes: u32) -> bool {
        let previously_blocked = !self.can_send();
        self.bytes_in_flight -= num_retransmittable_bytes;
        previously_blocked && self.can_send()
    }

    /// Returns true if the sender became unblocked
    pub fn on_data_acknowledged(&mut self, event: &AckEvent, rtt: &RttEstimator) -> bool {
        let previously_blocked = !self.can_send();
        let time_now = event.time_now;
        let mut bytes_acked = event.bytes_acked;

        self.bytes_in_flight -= bytes_acked;

        'grow: {
            if self.is_in_recovery {
                if event.largest_acked > self.recovery_sent_packet_number {
                    // Done recovering. Completion of recovery is defined a bit
                    // differently than in TCP: an ACK for any packet sent
                    // after recovery started is enough.
                    self.is_in_recovery = false;
                    self.is_in_persistent_congestion = false;
                    self.time_of_cong_avoid_start = Some(time_now);
                }
                break 'grow;
            }
            if bytes_acked == 0 {
                break 'grow;
            }

            if self.congestion_window < self.slow_start_threshold {
                //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.1
                //# While a sender is in slow start, the congestion window
                //# increases by the number of bytes acknowledged.
                self.congestion_window =
                    self.congestion_window.saturating_add(bytes_acked);
                bytes_acked = 0;
                if self.congestion_window >= self.slow_start_threshold {
                    // Exponential growth stops at the threshold. Any spare
                    // acked bytes count as congestion avoidance input below.
                    self.time_of_cong_avoid_start = Some(time_now);
                    bytes_acked = self.congestion_window - self.slow_start_threshold;
                    self.congestion_window = self.slow_start_threshold;
                }
            }

            if bytes_acked > 0 {
                self.congestion_avoidance(bytes_acked, time_now, rtt);
            }

            // Limit growth by the bytes actually put on the wire, which may be
            // capped by flow control or the app. Twice the in-flight maximum
            // still allows exponential growth when not otherwise limited.
            let limit = self.bytes_in_flight_max.saturating_mul(2);
            if self.congestion_window > limit {
                self.congestion_window = limit;
            }
        }

        self.time_of_last_ack = Some(time_now);
        previously_blocked && self.can_send()
    }

    fn congestion_avoidance(&mut self, bytes_acked: u32, time_now: Timestamp, rtt: &RttEstimator) {
        debug_assert!(self.congestion_window >= self.slow_start_threshold);

        let datagram_payload_length = self.max_datagram_size as u32;

        // Steady ACK feedback is required to justify window growth. A long
        // gap between ACKs advances the congestion avoidance epoch, which
        // freezes the cubic polynomial for the duration of the gap.
        if let (Some(time_of_last_ack), Some(start)) =
            (self.time_of_last_ack, self.time_of_cong_avoid_start)
        {
            let time_since_last_ack = time_now.saturating_duration_since(time_of_last_ack);
            if time_since_last_ack > self.send_idle_timeout
                && time_since_last_ack > rtt.smoothed_rtt() + 4 * rtt.rttvar()
            {
                let mut advanced = start + time_since_last_ack;
                if time_now <= advanced {
                    advanced = time_now;
                }
                self.time_of_cong_avoid_start = Some(advanced);
            }
        }

        let start = match self.time_of_cong_avoid_start {
            Some(start) => start,
            None => {
                self.time_of_cong_avoid_start = Some(time_now);
                time_now
            }
        };

        //= https://www.rfc-editor.org/rfc/rfc8312#section-4.1
        //# W_cubic(t) = C*(t-K)^3 + W_max (Eq. 1)
        //
        // t is in seconds and the window is in MSS units in the RFC; here the
        // window stays in bytes and t in milliseconds, with a 30-bit right
        // shift converting ms^3 to s^3. The RFC evaluates W_cubic(t+RTT), so
        // the smoothed RTT is added to t. With C = 0.4 and the maximum
        // datagram size this is overflow-safe for DeltaT below 2.5M ms.
        let time_in_cong_avoid_micros =
            time_now.saturating_duration_since(start).as_micros() as i64;
        let delta_t_micros = time_in_cong_avoid_micros - (self.k_cubic as i64) * 1000
            + rtt.smoothed_rtt().as_micros() as i64;
        let delta_t = (delta_t_micros / 1000).min(MAX_DELTA_T_MS);

        let mut cubic_window = ((((delta_t * delta_t) >> 10) * delta_t
            * (datagram_payload_length as i64 * TEN_TIMES_C_CUBIC as i64 / 10))
            >> 20)
            + self.window_max as i64;

        if cubic_window < 0 {
            // The window overflowed; the limit below would clamp the huge
            // value anyway, so substitute the limiting value directly.
            cubic_window = 2 * self.bytes_in_flight_max as i64;
        }

        // The AIMD window mimics an AIMD flow with BETA=0.5 and a slope of
        // 1 MSS/RTT. With BETA_CUBIC=0.7 the required slope below W_max is
        // 3*(1-BETA)/(1+BETA) which is about 0.5 MSS/RTT; at W_max the slope
        // switches to 1 MSS/RTT to match Reno. The window grows in whole MSS
        // increments via Appropriate Byte Counting.
        if self.aimd_window < self.window_max {
            self.aimd_accumulator = self.aimd_accumulator.saturating_add(bytes_acked / 2);
        } else {
            self.aimd_accumulator = self.aimd_accumulator.saturating_add(bytes_acked);
        }
        if self.aimd_accumulator > self.aimd_window {
            self.aimd_window = self.aimd_window.saturating_add(datagram_payload_length);
            // The accumulator pays for the post-increment window.
            self.aimd_accumulator = self.aimd_accumulator.wrapping_sub(self.aimd_window);
        }

        if self.aimd_window as i64 > cubic_window {
            // Reno-friendly region
            self.congestion_window = self.aimd_window;
        } else {
            // Concave or convex region. The target is constrained to
            // [CongestionWindow, 1.5 * CongestionWindow].
            let cwnd = self.congestion_window as u64;
            let target = cwnd.max((cubic_window as u64).min(cwnd + (cwnd >> 1)));
            self.congestion_window = self.congestion_window.saturating_add(
                ((target - cwnd) * datagram_payload_length as u64 / cwnd) as u32,
            );
        }
    }

    fn on_congestion_event(&mut self, is_persistent_congestion: bool) {
        let datagram_payload_length = self.max_datagram_size as u32;

        self.is_in_recovery = true;
        self.has_had_congestion_event = true;

        // Save the state for rollback in case this event turns out spurious.
        self.prev = Some(Snapshot {
            window_max: self.window_max,
            window_last_max: self.window_last_max,
            k_cubic: self.k_cubic,
            slow_start_threshold: self.slow_start_threshold,
            congestion_window: self.congestion_window,
            aimd_window: self.aimd_window,
        });

        if is_persistent_congestion && !self.is_in_persistent_congestion {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-7.6.2
            //# When persistent congestion is declared, the sender's congestion
            //# window MUST be reduced to the minimum congestion window.
            self.is_in_persistent_congestion = true;

            let reduced =
                (self.congestion_window as u64 * TEN_TIMES_BETA_CUBIC as u64 / 10) as u32;
            self.window_max = reduced;
            self.window_last_max = reduced;
            self.slow_start_threshold = reduced;
            self.aimd_window = reduced;
            self.congestion_window =
                datagram_payload_length * PERSISTENT_CONGESTION_WINDOW_PACKETS;
            self.k_cubic = 0;
        } else {
            self.window_max = self.congestion_window;
            if self.window_last_max > self.window_max {
                //= https://www.rfc-editor.org/rfc/rfc8312#section-4.6
                //# With fast convergence, when a congestion event occurs, ...
                //# W_max = W_max*(1.0+beta_cubic)/2.0
                self.window_last_max = self.window_max;
                self.window_max = (self.window_max as u64
                    * (10 + TEN_TIMES_BETA_CUBIC) as u64
                    / 20) as u32;
            } else {
                self.window_last_max = self.window_max;
            }

            // K = cubic_root(W_max * (1 - beta) / C)
            //
            // Rounding error is reduced by left-shifting the radicand by 9
            // before the division and right-shifting the result by 3
            // (since 2^9 = 2^3^3).
            let radicand = ((self.window_max / datagram_payload_length
                * (10 - TEN_TIMES_BETA_CUBIC)) as u64)
                .checked_shl(9)
                .unwrap_or(u64::MAX)
                / TEN_TIMES_C_CUBIC as u64;
            self.k_cubic = cube_root(radicand.min(u32::MAX as u64) as u32) as u64;
            self.k_cubic *= 1000; // seconds to milliseconds
            self.k_cubic >>= 3;

            let reduced = (datagram_payload_length * PERSISTENT_CONGESTION_WINDOW_PACKETS).max(
                (self.congestion_window as u64 * TEN_TIMES_BETA_CUBIC as u64 / 10) as u32,
            );
            self.slow_start_threshold = reduced;
            self.congestion_window = reduced;
            self.aimd_window = reduced;
        }
    }

    /// Returns true if the sender became unblocked
    pub fn on_data_lost(&mut self, event: &LossEvent) -> bool {
        let previously_blocked = !self.can_send();

        // Loss after the most recent congestion event (or with no congestion
        // event yet) starts a new congestion event.
        if !self.has_had_congestion_event
            || event.largest_lost > self.recovery_sent_packet_number
        {
            self.recovery_sent_packet_number = event.largest_sent;
            self.on_congestion_event(event.persistent_congestion);
        }

        self.bytes_in_flight -= event.bytes_lost;

        previously_blocked && self.can_send()
    }

    /// Rolls the controller back to the state before the congestion event.
    /// Returns true if the sender became unblocked.
    pub fn on_spurious_congestion(&mut self) -> bool {
        if !self.is_in_recovery {
            return false;
        }

        let previously_blocked = !self.can_send();

        if let Some(prev) = self.prev.take() {
            self.window_max = prev.window_max;
            self.window_last_max = prev.window_last_max;
            self.k_cubic = prev.k_cubic;
            self.slow_start_threshold = prev.slow_start_threshold;
            self.congestion_window = prev.congestion_window;
            self.aimd_window = prev.aimd_window;
        }

        self.is_in_recovery = false;
        self.has_had_congestion_event = false;

        previously_blocked && self.can_send()
    }
}
