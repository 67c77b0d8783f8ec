// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Data structures for buffering incoming stream data

mod receive_buffer;

pub use receive_buffer::{Error, ReceiveBuffer, WriteOutcome};
