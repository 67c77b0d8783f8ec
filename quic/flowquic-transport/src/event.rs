// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Indications delivered to the application
//!
//! Upcalls are re-entrant from the worker context: the handler may call back
//! into the transport inline. Failure returns from handlers are treated as
//! success.

use crate::stream::StreamId;
use bytes::Bytes;
use std::vec::Vec;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Stream data is available. `chunks` are contiguous starting at
    /// `absolute_offset`.
    Receive {
        absolute_offset: u64,
        chunks: Vec<Bytes>,
        /// The data ends exactly at the stream's final size
        fin: bool,
        /// Part of the data was received in 0-RTT packets
        zero_rtt: bool,
    },
    /// A queued send request finished (acknowledged or canceled)
    SendComplete { canceled: bool, context: u64 },
    /// The send direction is fully closed
    SendShutdownComplete { graceful: bool },
    /// The peer abortively closed its send direction
    PeerSendAborted { error_code: u64 },
    /// The peer abortively closed its receive direction
    PeerReceiveAborted { error_code: u64 },
    /// The peer gracefully closed its send direction
    PeerSendShutdown,
}

impl Event {
    /// Total data length carried by a `Receive` event
    pub fn receive_length(&self) -> u64 {
        match self {
            Event::Receive { chunks, .. } => chunks.iter().map(|c| c.len() as u64).sum(),
            _ => 0,
        }
    }
}

/// How the application responded to a `Receive` indication.
///
/// Ignored for every other event type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventResult {
    /// Keep delivering even though the data was not drained
    Continue,
    /// The app will complete the receive later via
    /// [`Connection::stream_receive_complete`](crate::Connection::stream_receive_complete)
    Pending,
    /// The indicated data was consumed in full
    Success,
}

pub trait EventHandler {
    fn on_stream_event(&mut self, id: StreamId, event: Event) -> EventResult;
}

/// Collects events and answers `Success`; the default harness for tests and
/// fire-and-forget applications
#[derive(Debug, Default)]
pub struct EventSink {
    pub events: Vec<(StreamId, Event)>,
}

impl EventHandler for EventSink {
    fn on_stream_event(&mut self, id: StreamId, event: Event) -> EventResult {
        self.events.push((id, event));
        EventResult::Success
    }
}
