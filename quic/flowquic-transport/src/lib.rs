// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-connection transport data plane: congestion control hookup,
//! stream send/receive state machines, and the connection-wide send
//! scheduler.
//!
//! Everything in this crate executes on the connection's owning worker; no
//! internal synchronization is used.

/// Evaluates to the given expression if `$cond` is false.
macro_rules! ensure {
    ($cond:expr, $otherwise:expr) => {
        if !($cond) {
            return $otherwise;
        }
    };
    ($cond:expr) => {
        ensure!($cond, ());
    };
}

pub mod connection;
pub mod event;
pub mod path;
pub mod range_set;
pub mod send;
pub mod space;
pub mod stream;

pub use connection::{Connection, Settings};
pub use event::{Event, EventHandler, EventResult};
