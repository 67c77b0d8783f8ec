// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

/// Evaluates to the given expression if `$cond` is false.
///
/// This is used all over the receive paths to keep the error/early-return
/// handling on a single line.
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

pub mod buffer;
pub mod counter;
pub mod frame;
pub mod packet;
pub mod recovery;
pub mod time;
pub mod transport;
pub mod varint;
