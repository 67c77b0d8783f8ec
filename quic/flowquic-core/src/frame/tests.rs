// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;

fn decode_one(buf: &[u8]) -> Frame {
    let mut dec = Decoder::new(buf);
    let frame = Frame::decode(&mut dec).unwrap();
    assert!(dec.is_empty(), "trailing bytes after frame");
    frame
}

#[test]
fn reset_stream_round_trip() {
    let frame = ResetStream {
        stream_id: VarInt::from_u8(4),
        error_code: VarInt::from_u32(0xbeef),
        final_size: VarInt::from_u32(1_000_000),
    };
    let mut buf = [0u8; 64];
    let len = frame.encode(&mut buf).unwrap();
    assert_eq!(decode_one(&buf[..len]), Frame::ResetStream(frame));
}

#[test]
fn stream_header_variants() {
    let mut buf = [0u8; 64];

    // offset 0 omits the offset field
    let len = encode_stream_header(&mut buf, VarInt::from_u8(0), 0, 3, false).unwrap();
    assert_eq!(len, 3);
    assert_eq!(buf[0], (tag::STREAM_BASE | tag::STREAM_FLAG_LEN) as u8);

    // a non-zero offset adds the OFF bit and field
    let len = encode_stream_header(&mut buf, VarInt::from_u8(0), 64, 3, true).unwrap();
    assert_eq!(
        buf[0],
        (tag::STREAM_BASE | tag::STREAM_FLAG_LEN | tag::STREAM_FLAG_OFF | tag::STREAM_FLAG_FIN)
            as u8
    );
    assert_eq!(len, 1 + 1 + 2 + 1);
    assert_eq!(
        len,
        stream_header_size(VarInt::from_u8(0), 64, 3),
        "header size estimate must match the encoder"
    );
}

#[test]
fn stream_round_trip() {
    let frame = Stream {
        stream_id: VarInt::from_u8(8),
        offset: VarInt::from_u32(100_000),
        fin: true,
        data: b"hello quic",
    };
    let mut buf = [0u8; 64];
    let len = frame.encode(&mut buf).unwrap();
    assert_eq!(decode_one(&buf[..len]), Frame::Stream(frame));
}

#[test]
fn zero_length_stream_frame_with_fin() {
    let frame = Stream {
        stream_id: VarInt::from_u8(0),
        offset: VarInt::from_u32(1234),
        fin: true,
        data: &[],
    };
    let mut buf = [0u8; 16];
    let len = frame.encode(&mut buf).unwrap();
    assert_eq!(decode_one(&buf[..len]), Frame::Stream(frame));
}

#[test]
fn no_room_is_none() {
    let frame = MaxData {
        maximum_data: VarInt::from_u32(1 << 20),
    };
    let mut buf = [0u8; 3];
    assert!(frame.encode(&mut buf).is_none());

    let mut buf = [0u8; 5];
    assert!(frame.encode(&mut buf).is_some());
}

#[test]
fn connection_close_variants() {
    let mut buf = [0u8; 64];

    let transport = ConnectionClose {
        is_application: false,
        error_code: VarInt::from_u8(0x6),
        frame_type: VarInt::from_u8(0x4),
        reason: b"final size error",
    };
    let len = transport.encode(&mut buf).unwrap();
    assert_eq!(decode_one(&buf[..len]), Frame::ConnectionClose(transport));

    let application = ConnectionClose {
        is_application: true,
        error_code: VarInt::from_u32(77),
        frame_type: VarInt::ZERO,
        reason: &[],
    };
    let len = application.encode(&mut buf).unwrap();
    assert_eq!(decode_one(&buf[..len]), Frame::ConnectionClose(application));
}

#[test]
fn ack_encode_decode() {
    // ranges [7..=9] and [0..=3]
    let frame = Ack {
        largest: VarInt::from_u8(9),
        ack_delay: VarInt::from_u8(0),
        first_range: VarInt::from_u8(2),
        ranges: &[(VarInt::from_u8(2), VarInt::from_u8(3))],
    };
    let mut buf = [0u8; 64];
    let len = frame.encode(&mut buf).unwrap();

    let decoded = match decode_one(&buf[..len]) {
        Frame::Ack(ack) => ack,
        other => panic!("unexpected frame {other:?}"),
    };
    assert_eq!(decoded.largest, 9);
    assert_eq!(decoded.ranges, alloc::vec![(7, 9), (0, 3)]);
}

#[test]
fn new_connection_id_round_trip() {
    let token = [0xaa; 16];
    let frame = NewConnectionId {
        sequence: VarInt::from_u8(3),
        retire_prior_to: VarInt::from_u8(1),
        connection_id: &[1, 2, 3, 4, 5, 6, 7, 8],
        stateless_reset_token: &token,
    };
    let mut buf = [0u8; 64];
    let len = frame.encode(&mut buf).unwrap();
    assert_eq!(decode_one(&buf[..len]), Frame::NewConnectionId(frame));
}

#[test]
fn unknown_tag_fails() {
    let mut dec = Decoder::new(&[0x21]);
    assert!(Frame::decode(&mut dec).is_err());
}

#[test]
fn truncated_frames_fail() {
    // RESET_STREAM missing its final size
    let mut buf = [0u8; 64];
    let frame = ResetStream {
        stream_id: VarInt::from_u8(4),
        error_code: VarInt::from_u8(1),
        final_size: VarInt::from_u32(100_000),
    };
    let len = frame.encode(&mut buf).unwrap();
    for cut in 1..len {
        let mut dec = Decoder::new(&buf[..cut]);
        assert!(Frame::decode(&mut dec).is_err(), "cut={cut}");
    }
}
