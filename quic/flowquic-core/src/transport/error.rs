// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;
use core::fmt;

//= https://www.rfc-editor.org/rfc/rfc9000#section-20
//# QUIC transport error codes and application error codes are 62-bit
//# unsigned integers.

/// A connection-fatal transport error
///
/// Carries the RFC 9000 error code, the type of the frame that triggered the
/// error (when known) and a static human readable reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Error {
    pub code: VarInt,
    pub frame_type: Option<VarInt>,
    pub reason: &'static str,
}

impl Error {
    /// Creates a new `Error` with the specified error code
    pub const fn new(code: VarInt) -> Self {
        Self {
            code,
            frame_type: None,
            reason: "",
        }
    }

    /// Updates the `Error` with the specified `frame_type`
    #[must_use]
    pub const fn with_frame_type(mut self, frame_type: VarInt) -> Self {
        self.frame_type = Some(frame_type);
        self
    }

    /// Updates the `Error` with the specified `reason`
    #[must_use]
    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "TransportError({})", self.code)
        } else {
            f.write_str(self.reason)
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Internal convenience macro for defining standard error codes
macro_rules! def_error {
    ($doc:expr, $name:ident, $code:expr) => {
        impl Error {
            #[doc = $doc]
            pub const $name: Error = Error::new(VarInt::from_u8($code));
        }
    };
}

def_error!(
    "An endpoint uses this with CONNECTION_CLOSE to signal that the connection is being closed abruptly in the absence of any error.",
    NO_ERROR,
    0x0
);

def_error!(
    "The endpoint encountered an internal error and cannot continue with the connection.",
    INTERNAL_ERROR,
    0x1
);

def_error!(
    "The server refused to accept a new connection.",
    CONNECTION_REFUSED,
    0x2
);

def_error!(
    "An endpoint received more data than it permitted in its advertised data limits.",
    FLOW_CONTROL_ERROR,
    0x3
);

def_error!(
    "An endpoint received a frame for a stream identifier that exceeded its advertised stream limit for the corresponding stream type.",
    STREAM_LIMIT_ERROR,
    0x4
);

def_error!(
    "An endpoint received a frame for a stream that was not in a state that permitted that frame.",
    STREAM_STATE_ERROR,
    0x5
);

def_error!(
    "An endpoint received a STREAM or RESET_STREAM frame containing a final size inconsistent with the stream data already received.",
    FINAL_SIZE_ERROR,
    0x6
);

def_error!(
    "An endpoint received a frame that was badly formatted.",
    FRAME_ENCODING_ERROR,
    0x7
);

def_error!(
    "An endpoint received transport parameters that were badly formatted, included an invalid value, or used a feature that was not negotiated.",
    TRANSPORT_PARAMETER_ERROR,
    0x8
);

def_error!(
    "An endpoint detected an error with protocol compliance that was not covered by more specific error codes.",
    PROTOCOL_VIOLATION,
    0xa
);

def_error!(
    "The application or application protocol caused the connection to be closed.",
    APPLICATION_ERROR,
    0xc
);

impl Error {
    /// True if the two errors carry the same error code
    #[inline]
    pub fn same_code(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            Error::FLOW_CONTROL_ERROR.to_string(),
            "TransportError(3)".to_string()
        );
        assert_eq!(
            Error::FLOW_CONTROL_ERROR
                .with_reason("peer exceeded MAX_DATA")
                .to_string(),
            "peer exceeded MAX_DATA".to_string()
        );
    }
}
