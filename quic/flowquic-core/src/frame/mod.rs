// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! RFC 9000 frame model
//!
//! Encoders write into a caller provided buffer and return `None` when the
//! frame does not fit; the send path uses that as its ran-out-of-room signal
//! and finalizes the packet. Decoders consume from a [`Decoder`] cursor and
//! fail with [`DecodeError`], which the packet processor escalates to a
//! connection-level `FRAME_ENCODING_ERROR`.

use crate::varint::VarInt;
use alloc::vec::Vec;
use core::fmt;

#[cfg(test)]
mod tests;

/// Frame type tags (RFC 9000 section 19, plus extension frames)
pub mod tag {
    pub const PADDING: u64 = 0x00;
    pub const PING: u64 = 0x01;
    pub const ACK: u64 = 0x02;
    pub const ACK_ECN: u64 = 0x03;
    pub const RESET_STREAM: u64 = 0x04;
    pub const STOP_SENDING: u64 = 0x05;
    pub const CRYPTO: u64 = 0x06;
    pub const STREAM_BASE: u64 = 0x08;
    pub const STREAM_MAX: u64 = 0x0f;
    pub const MAX_DATA: u64 = 0x10;
    pub const MAX_STREAM_DATA: u64 = 0x11;
    pub const MAX_STREAMS_BIDI: u64 = 0x12;
    pub const MAX_STREAMS_UNI: u64 = 0x13;
    pub const DATA_BLOCKED: u64 = 0x14;
    pub const STREAM_DATA_BLOCKED: u64 = 0x15;
    pub const STREAMS_BLOCKED_BIDI: u64 = 0x16;
    pub const STREAMS_BLOCKED_UNI: u64 = 0x17;
    pub const NEW_CONNECTION_ID: u64 = 0x18;
    pub const RETIRE_CONNECTION_ID: u64 = 0x19;
    pub const PATH_CHALLENGE: u64 = 0x1a;
    pub const PATH_RESPONSE: u64 = 0x1b;
    pub const CONNECTION_CLOSE: u64 = 0x1c;
    pub const CONNECTION_CLOSE_APP: u64 = 0x1d;
    pub const HANDSHAKE_DONE: u64 = 0x1e;
    pub const RELIABLE_RESET_STREAM: u64 = 0x22;
    pub const DATAGRAM: u64 = 0x30;
    pub const DATAGRAM_LEN: u64 = 0x31;
    pub const ACK_FREQUENCY: u64 = 0xaf;

    pub const STREAM_FLAG_FIN: u64 = 0x01;
    pub const STREAM_FLAG_LEN: u64 = 0x02;
    pub const STREAM_FLAG_OFF: u64 = 0x04;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeError;

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "malformed frame")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DecodeError {}

/// A read cursor over the frame section of a packet payload
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Decoder<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.offset == self.buf.len()
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn varint(&mut self) -> Result<VarInt, DecodeError> {
        let (value, len) = VarInt::decode(&self.buf[self.offset..]).ok_or(DecodeError)?;
        self.offset += len;
        Ok(value)
    }

    #[inline]
    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.buf.get(self.offset).ok_or(DecodeError)?;
        self.offset += 1;
        Ok(byte)
    }

    #[inline]
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.offset.checked_add(len).ok_or(DecodeError)?;
        ensure!(end <= self.buf.len(), Err(DecodeError));
        let out = &self.buf[self.offset..end];
        self.offset = end;
        Ok(out)
    }

    #[inline]
    pub fn remaining(&mut self) -> &'a [u8] {
        let out = &self.buf[self.offset..];
        self.offset = self.buf.len();
        out
    }
}

/// A bounds-checked write cursor; every write fails once the buffer is full
struct Writer<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> Writer<'a> {
    #[inline]
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    #[inline]
    fn varint(&mut self, value: VarInt) -> Option<()> {
        let len = value.encode(&mut self.buf[self.len..])?;
        self.len += len;
        Some(())
    }

    #[inline]
    fn tag(&mut self, value: u64) -> Option<()> {
        self.varint(VarInt::new(value).ok()?)
    }

    #[inline]
    fn slice(&mut self, value: &[u8]) -> Option<()> {
        ensure!(self.buf.len() - self.len >= value.len(), None);
        self.buf[self.len..self.len + value.len()].copy_from_slice(value);
        self.len += value.len();
        Some(())
    }

    #[inline]
    fn u8(&mut self, value: u8) -> Option<()> {
        ensure!(self.buf.len() > self.len, None);
        self.buf[self.len] = value;
        self.len += 1;
        Some(())
    }

    #[inline]
    fn finish(self) -> usize {
        self.len
    }
}

macro_rules! simple_frame {
    ($(#[$attr:meta])* $name:ident, $tag:expr, [$($field:ident),+ $(,)?]) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub struct $name {
            $(pub $field: VarInt,)+
        }

        impl $name {
            pub const TAG: u64 = $tag;

            pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
                let mut w = Writer::new(buf);
                w.tag(Self::TAG)?;
                $(w.varint(self.$field)?;)+
                Some(w.finish())
            }

            pub fn decode(dec: &mut Decoder) -> Result<Self, DecodeError> {
                Ok(Self {
                    $($field: dec.varint()?,)+
                })
            }
        }
    };
}

simple_frame!(
    /// RESET_STREAM (0x04): abrupt termination of the sending part of a stream
    ResetStream,
    tag::RESET_STREAM,
    [stream_id, error_code, final_size]
);

simple_frame!(
    /// STOP_SENDING (0x05): request that the peer cease transmission
    StopSending,
    tag::STOP_SENDING,
    [stream_id, error_code]
);

simple_frame!(
    /// RELIABLE_RESET_STREAM (experimental, feature negotiated)
    ReliableResetStream,
    tag::RELIABLE_RESET_STREAM,
    [stream_id, error_code, reliable_size]
);

simple_frame!(MaxData, tag::MAX_DATA, [maximum_data]);

simple_frame!(
    MaxStreamData,
    tag::MAX_STREAM_DATA,
    [stream_id, maximum_stream_data]
);

simple_frame!(DataBlocked, tag::DATA_BLOCKED, [data_limit]);

simple_frame!(
    StreamDataBlocked,
    tag::STREAM_DATA_BLOCKED,
    [stream_id, stream_data_limit]
);

simple_frame!(
    RetireConnectionId,
    tag::RETIRE_CONNECTION_ID,
    [sequence]
);

simple_frame!(
    /// ACK_FREQUENCY (experimental): adjusts peer acknowledgment behavior
    AckFrequency,
    tag::ACK_FREQUENCY,
    [
        sequence,
        ack_eliciting_threshold,
        requested_max_ack_delay,
        reordering_threshold,
    ]
);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxStreams {
    pub bidirectional: bool,
    pub maximum_streams: VarInt,
}

impl MaxStreams {
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        let mut w = Writer::new(buf);
        w.tag(if self.bidirectional {
            tag::MAX_STREAMS_BIDI
        } else {
            tag::MAX_STREAMS_UNI
        })?;
        w.varint(self.maximum_streams)?;
        Some(w.finish())
    }

    pub fn decode(bidirectional: bool, dec: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            bidirectional,
            maximum_streams: dec.varint()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamsBlocked {
    pub bidirectional: bool,
    pub stream_limit: VarInt,
}

impl StreamsBlocked {
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        let mut w = Writer::new(buf);
        w.tag(if self.bidirectional {
            tag::STREAMS_BLOCKED_BIDI
        } else {
            tag::STREAMS_BLOCKED_UNI
        })?;
        w.varint(self.stream_limit)?;
        Some(w.finish())
    }

    pub fn decode(bidirectional: bool, dec: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            bidirectional,
            stream_limit: dec.varint()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewConnectionId<'a> {
    pub sequence: VarInt,
    pub retire_prior_to: VarInt,
    pub connection_id: &'a [u8],
    pub stateless_reset_token: &'a [u8; 16],
}

impl<'a> NewConnectionId<'a> {
    pub const TAG: u64 = tag::NEW_CONNECTION_ID;

    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        debug_assert!((1..=20).contains(&self.connection_id.len()));
        let mut w = Writer::new(buf);
        w.tag(Self::TAG)?;
        w.varint(self.sequence)?;
        w.varint(self.retire_prior_to)?;
        w.u8(self.connection_id.len() as u8)?;
        w.slice(self.connection_id)?;
        w.slice(self.stateless_reset_token)?;
        Some(w.finish())
    }

    pub fn decode(dec: &mut Decoder<'a>) -> Result<Self, DecodeError> {
        let sequence = dec.varint()?;
        let retire_prior_to = dec.varint()?;
        let len = dec.u8()? as usize;
        ensure!((1..=20).contains(&len), Err(DecodeError));
        let connection_id = dec.bytes(len)?;
        let token = dec.bytes(16)?;
        Ok(Self {
            sequence,
            retire_prior_to,
            connection_id,
            stateless_reset_token: token.try_into().expect("token length checked"),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathChallenge {
    pub data: [u8; 8],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathResponse {
    pub data: [u8; 8],
}

macro_rules! path_frame {
    ($name:ident, $tag:expr) => {
        impl $name {
            pub const TAG: u64 = $tag;

            pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
                let mut w = Writer::new(buf);
                w.tag(Self::TAG)?;
                w.slice(&self.data)?;
                Some(w.finish())
            }

            pub fn decode(dec: &mut Decoder) -> Result<Self, DecodeError> {
                let data = dec.bytes(8)?;
                Ok(Self {
                    data: data.try_into().expect("length checked"),
                })
            }
        }
    };
}

path_frame!(PathChallenge, tag::PATH_CHALLENGE);
path_frame!(PathResponse, tag::PATH_RESPONSE);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionClose<'a> {
    pub is_application: bool,
    pub error_code: VarInt,
    /// Only present for the transport (0x1c) variant
    pub frame_type: VarInt,
    pub reason: &'a [u8],
}

impl<'a> ConnectionClose<'a> {
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        let mut w = Writer::new(buf);
        if self.is_application {
            w.tag(tag::CONNECTION_CLOSE_APP)?;
            w.varint(self.error_code)?;
        } else {
            w.tag(tag::CONNECTION_CLOSE)?;
            w.varint(self.error_code)?;
            w.varint(self.frame_type)?;
        }
        w.varint(VarInt::try_from(self.reason.len()).ok()?)?;
        w.slice(self.reason)?;
        Some(w.finish())
    }

    pub fn decode(is_application: bool, dec: &mut Decoder<'a>) -> Result<Self, DecodeError> {
        let error_code = dec.varint()?;
        let frame_type = if is_application {
            VarInt::ZERO
        } else {
            dec.varint()?
        };
        let reason_len = dec.varint()?.as_u64() as usize;
        let reason = dec.bytes(reason_len)?;
        Ok(Self {
            is_application,
            error_code,
            frame_type,
            reason,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Crypto<'a> {
    pub offset: VarInt,
    pub data: &'a [u8],
}

impl<'a> Crypto<'a> {
    pub const TAG: u64 = tag::CRYPTO;

    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        let mut w = Writer::new(buf);
        w.tag(Self::TAG)?;
        w.varint(self.offset)?;
        w.varint(VarInt::try_from(self.data.len()).ok()?)?;
        w.slice(self.data)?;
        Some(w.finish())
    }

    pub fn decode(dec: &mut Decoder<'a>) -> Result<Self, DecodeError> {
        let offset = dec.varint()?;
        let len = dec.varint()?.as_u64() as usize;
        let data = dec.bytes(len)?;
        Ok(Self { offset, data })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Datagram<'a> {
    pub data: &'a [u8],
}

impl<'a> Datagram<'a> {
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        let mut w = Writer::new(buf);
        w.tag(tag::DATAGRAM_LEN)?;
        w.varint(VarInt::try_from(self.data.len()).ok()?)?;
        w.slice(self.data)?;
        Some(w.finish())
    }

    pub fn decode(with_len: bool, dec: &mut Decoder<'a>) -> Result<Self, DecodeError> {
        let data = if with_len {
            let len = dec.varint()?.as_u64() as usize;
            dec.bytes(len)?
        } else {
            dec.remaining()
        };
        Ok(Self { data })
    }
}

/// STREAM (0x08-0x0f)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stream<'a> {
    pub stream_id: VarInt,
    pub offset: VarInt,
    pub fin: bool,
    pub data: &'a [u8],
}

impl<'a> Stream<'a> {
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        let header = encode_stream_header(
            buf,
            self.stream_id,
            self.offset.as_u64(),
            self.data.len() as u64,
            self.fin,
        )?;
        let mut w = Writer::new(&mut buf[header..]);
        w.slice(self.data)?;
        Some(header + w.finish())
    }

    pub fn decode(frame_tag: u64, dec: &mut Decoder<'a>) -> Result<Self, DecodeError> {
        ensure!(
            (tag::STREAM_BASE..=tag::STREAM_MAX).contains(&frame_tag),
            Err(DecodeError)
        );
        let stream_id = dec.varint()?;
        let offset = if frame_tag & tag::STREAM_FLAG_OFF != 0 {
            dec.varint()?
        } else {
            VarInt::ZERO
        };
        let data = if frame_tag & tag::STREAM_FLAG_LEN != 0 {
            let len = dec.varint()?.as_u64() as usize;
            dec.bytes(len)?
        } else {
            dec.remaining()
        };
        Ok(Self {
            stream_id,
            offset,
            fin: frame_tag & tag::STREAM_FLAG_FIN != 0,
            data,
        })
    }
}

/// Size of a STREAM frame header carrying `payload_len` bytes at `offset`.
///
/// The length field is always written explicitly so more frames can follow.
#[inline]
pub fn stream_header_size(stream_id: VarInt, offset: u64, payload_len: u64) -> usize {
    let mut size = 1 + stream_id.encoding_size();
    if offset > 0 {
        size += VarInt::new(offset).unwrap_or(VarInt::MAX).encoding_size();
    }
    size + VarInt::new(payload_len)
        .unwrap_or(VarInt::MAX)
        .encoding_size()
}

/// Writes a STREAM frame header; the caller copies `payload_len` bytes after it
#[inline]
pub fn encode_stream_header(
    buf: &mut [u8],
    stream_id: VarInt,
    offset: u64,
    payload_len: u64,
    fin: bool,
) -> Option<usize> {
    let mut frame_tag = tag::STREAM_BASE | tag::STREAM_FLAG_LEN;
    if fin {
        frame_tag |= tag::STREAM_FLAG_FIN;
    }
    if offset > 0 {
        frame_tag |= tag::STREAM_FLAG_OFF;
    }

    let mut w = Writer::new(buf);
    w.tag(frame_tag)?;
    w.varint(stream_id)?;
    if offset > 0 {
        w.varint(VarInt::new(offset).ok()?)?;
    }
    w.varint(VarInt::new(payload_len).ok()?)?;
    Some(w.finish())
}

/// An ACK frame, encoded from the tracker's interval set
///
/// `ranges` are the (gap, length) pairs following the first range, as
/// described in RFC 9000 section 19.3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ack<'a> {
    pub largest: VarInt,
    pub ack_delay: VarInt,
    pub first_range: VarInt,
    pub ranges: &'a [(VarInt, VarInt)],
}

impl<'a> Ack<'a> {
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        let mut w = Writer::new(buf);
        w.tag(tag::ACK)?;
        w.varint(self.largest)?;
        w.varint(self.ack_delay)?;
        w.varint(VarInt::try_from(self.ranges.len()).ok()?)?;
        w.varint(self.first_range)?;
        for (gap, length) in self.ranges {
            w.varint(*gap)?;
            w.varint(*length)?;
        }
        Some(w.finish())
    }
}

/// A fully decoded ACK frame
///
/// `ranges` holds inclusive `(smallest, largest)` packet number ranges in
/// descending order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckOwned {
    pub largest: u64,
    pub ack_delay: u64,
    pub ranges: Vec<(u64, u64)>,
}

impl AckOwned {
    pub fn decode(with_ecn: bool, dec: &mut Decoder) -> Result<Self, DecodeError> {
        let largest = dec.varint()?.as_u64();
        let ack_delay = dec.varint()?.as_u64();
        let range_count = dec.varint()?.as_u64();
        let first_range = dec.varint()?.as_u64();

        let mut ranges = Vec::with_capacity(range_count as usize + 1);
        let mut largest_in_range = largest;
        let smallest = largest_in_range.checked_sub(first_range).ok_or(DecodeError)?;
        ranges.push((smallest, largest_in_range));
        let mut smallest_so_far = smallest;

        for _ in 0..range_count {
            let gap = dec.varint()?.as_u64();
            let length = dec.varint()?.as_u64();
            largest_in_range = smallest_so_far
                .checked_sub(gap.checked_add(2).ok_or(DecodeError)?)
                .ok_or(DecodeError)?;
            smallest_so_far = largest_in_range.checked_sub(length).ok_or(DecodeError)?;
            ranges.push((smallest_so_far, largest_in_range));
        }

        if with_ecn {
            for _ in 0..3 {
                dec.varint()?;
            }
        }

        Ok(Self {
            largest,
            ack_delay,
            ranges,
        })
    }
}

/// Any frame the transport core produces or consumes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Padding,
    Ping,
    Ack(AckOwned),
    ResetStream(ResetStream),
    StopSending(StopSending),
    Crypto(Crypto<'a>),
    Stream(Stream<'a>),
    MaxData(MaxData),
    MaxStreamData(MaxStreamData),
    MaxStreams(MaxStreams),
    DataBlocked(DataBlocked),
    StreamDataBlocked(StreamDataBlocked),
    StreamsBlocked(StreamsBlocked),
    NewConnectionId(NewConnectionId<'a>),
    RetireConnectionId(RetireConnectionId),
    PathChallenge(PathChallenge),
    PathResponse(PathResponse),
    ConnectionClose(ConnectionClose<'a>),
    HandshakeDone,
    AckFrequency(AckFrequency),
    Datagram(Datagram<'a>),
    ReliableResetStream(ReliableResetStream),
}

impl<'a> Frame<'a> {
    /// Decodes the next frame, including its type tag
    pub fn decode(dec: &mut Decoder<'a>) -> Result<Self, DecodeError> {
        let frame_tag = dec.varint()?.as_u64();
        Ok(match frame_tag {
            tag::PADDING => Frame::Padding,
            tag::PING => Frame::Ping,
            tag::ACK => Frame::Ack(AckOwned::decode(false, dec)?),
            tag::ACK_ECN => Frame::Ack(AckOwned::decode(true, dec)?),
            tag::RESET_STREAM => Frame::ResetStream(ResetStream::decode(dec)?),
            tag::STOP_SENDING => Frame::StopSending(StopSending::decode(dec)?),
            tag::CRYPTO => Frame::Crypto(Crypto::decode(dec)?),
            tag::STREAM_BASE..=tag::STREAM_MAX => Frame::Stream(Stream::decode(frame_tag, dec)?),
            tag::MAX_DATA => Frame::MaxData(MaxData::decode(dec)?),
            tag::MAX_STREAM_DATA => Frame::MaxStreamData(MaxStreamData::decode(dec)?),
            tag::MAX_STREAMS_BIDI => Frame::MaxStreams(MaxStreams::decode(true, dec)?),
            tag::MAX_STREAMS_UNI => Frame::MaxStreams(MaxStreams::decode(false, dec)?),
            tag::DATA_BLOCKED => Frame::DataBlocked(DataBlocked::decode(dec)?),
            tag::STREAM_DATA_BLOCKED => {
                Frame::StreamDataBlocked(StreamDataBlocked::decode(dec)?)
            }
            tag::STREAMS_BLOCKED_BIDI => Frame::StreamsBlocked(StreamsBlocked::decode(true, dec)?),
            tag::STREAMS_BLOCKED_UNI => Frame::StreamsBlocked(StreamsBlocked::decode(false, dec)?),
            tag::NEW_CONNECTION_ID => Frame::NewConnectionId(NewConnectionId::decode(dec)?),
            tag::RETIRE_CONNECTION_ID => {
                Frame::RetireConnectionId(RetireConnectionId::decode(dec)?)
            }
            tag::PATH_CHALLENGE => Frame::PathChallenge(PathChallenge::decode(dec)?),
            tag::PATH_RESPONSE => Frame::PathResponse(PathResponse::decode(dec)?),
            tag::CONNECTION_CLOSE => {
                Frame::ConnectionClose(ConnectionClose::decode(false, dec)?)
            }
            tag::CONNECTION_CLOSE_APP => {
                Frame::ConnectionClose(ConnectionClose::decode(true, dec)?)
            }
            tag::HANDSHAKE_DONE => Frame::HandshakeDone,
            tag::ACK_FREQUENCY => Frame::AckFrequency(AckFrequency::decode(dec)?),
            tag::DATAGRAM => Frame::Datagram(Datagram::decode(false, dec)?),
            tag::DATAGRAM_LEN => Frame::Datagram(Datagram::decode(true, dec)?),
            tag::RELIABLE_RESET_STREAM => {
                Frame::ReliableResetStream(ReliableResetStream::decode(dec)?)
            }
            _ => return Err(DecodeError),
        })
    }
}
