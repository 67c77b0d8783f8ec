// Copyright the flowquic authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{recv::RecvFlushDisposition, *};
use crate::{
    event::{Event, EventSink},
    path::Path,
    send::{blocked_reasons as conn_blocked, flags as conn_flags, packet_builder::PacketBuilder},
    space::{PacketSpace, SentFrame},
};
use bytes::Bytes;
use flowquic_core::{packet::KeyType, recovery::RttEstimator, time::Timestamp};

fn send_state(settings: &Settings) -> SendState {
    let mut send = SendState::new(settings.conn_flow_control_window);
    send.peer_max_data = settings.peer_max_data;
    send.started = true;
    send
}

/// A started, locally initiated bidirectional stream (client side)
fn local_stream(send: &mut SendState, settings: &Settings) -> Stream {
    let mut stream = Stream::new(StreamId::new(0), false, settings);
    stream.start(send);
    stream
}

/// A peer initiated bidirectional stream (client side receives on it)
fn peer_stream(settings: &Settings) -> Stream {
    Stream::new(StreamId::new(1), false, settings)
}

fn packet(space: &mut PacketSpace, path: &Path) -> PacketBuilder {
    let mut builder = PacketBuilder::new(u32::MAX);
    assert!(builder.prepare(KeyType::OneRtt, space, path));
    builder
}

fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| i as u8).collect::<Vec<u8>>())
}

fn queue(
    stream: &mut Stream,
    send: &mut SendState,
    sink: &mut EventSink,
    len: usize,
    flags: u8,
    context: u64,
) {
    stream.queue_app_send(send, payload(len), flags, context, false, sink);
}

/// `(offset, length, open, fin)` for every STREAM frame in the metadata
fn stream_frames(frames: &[SentFrame]) -> Vec<(u64, u16, bool, bool)> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            SentFrame::Stream {
                offset,
                length,
                open,
                fin,
                ..
            } => Some((*offset, *length, *open, *fin)),
            _ => None,
        })
        .collect()
}

fn now() -> Timestamp {
    Timestamp::from_micros(5_000_000)
}

// ===== send half =====

#[test]
fn writes_queued_data_and_clears_flags() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);
    let mut space = PacketSpace::new();
    let path = Path::validated(1200);

    queue(&mut stream, &mut send, &mut sink, 100, 0, 1);
    assert!(stream.send_flags & send_flags::DATA != 0);
    assert!(send.has_queued_streams());

    let mut builder = packet(&mut space, &path);
    assert!(stream.write_frames(&mut send, &mut builder));

    assert_eq!(
        stream_frames(&builder.metadata.frames),
        vec![(0, 100, true, false)]
    );
    assert!(builder.metadata.is_ack_eliciting);
    assert_eq!(stream.next_send_offset, 100);
    assert_eq!(stream.max_sent_length, 100);
    assert_eq!(send.ordered_stream_bytes_sent, 100);
    // open was carried, all data sent
    assert_eq!(stream.send_flags & (send_flags::OPEN | send_flags::DATA), 0);
    assert!(stream.blocked_reasons & blocked_reasons::APP != 0);
}

#[test]
fn open_frame_without_data_is_empty() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut stream = local_stream(&mut send, &settings);
    let mut space = PacketSpace::new();
    let path = Path::validated(1200);

    assert!(stream.send_flags & send_flags::OPEN != 0);
    let mut builder = packet(&mut space, &path);
    assert!(stream.write_frames(&mut send, &mut builder));
    assert_eq!(
        stream_frames(&builder.metadata.frames),
        vec![(0, 0, true, false)]
    );
}

#[test]
fn empty_fin_frame_is_emitted_exactly_once() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);
    let mut space = PacketSpace::new();
    let path = Path::validated(1200);

    queue(&mut stream, &mut send, &mut sink, 0, request_flags::FIN, 1);
    assert!(stream.flags.local_close_fin);

    let mut builder = packet(&mut space, &path);
    assert!(stream.write_frames(&mut send, &mut builder));
    assert_eq!(
        stream_frames(&builder.metadata.frames),
        vec![(0, 0, true, true)]
    );

    // the FIN was consumed; no stream-data frames remain to send
    assert_eq!(stream.send_flags & send_flags::DATA_FRAMES, 0);
}

#[test]
fn stream_flow_control_caps_the_frame() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);
    let mut space = PacketSpace::new();
    let path = Path::validated(1200);

    stream.max_allowed_send_offset = 50;
    queue(&mut stream, &mut send, &mut sink, 100, 0, 1);

    let mut builder = packet(&mut space, &path);
    stream.write_frames(&mut send, &mut builder);

    assert_eq!(
        stream_frames(&builder.metadata.frames),
        vec![(0, 50, true, false)]
    );
    assert_eq!(stream.next_send_offset, 50);
    assert!(stream.send_flags & send_flags::DATA_BLOCKED != 0);
    assert!(stream.blocked_reasons & blocked_reasons::STREAM_FLOW_CONTROL != 0);
    // still has pending data
    assert!(stream.send_flags & send_flags::DATA != 0);
}

#[test]
fn connection_flow_control_caps_the_frame() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    send.peer_max_data = 30;
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);
    let mut space = PacketSpace::new();
    let path = Path::validated(1200);

    queue(&mut stream, &mut send, &mut sink, 100, 0, 1);

    let mut builder = packet(&mut space, &path);
    stream.write_frames(&mut send, &mut builder);

    assert_eq!(
        stream_frames(&builder.metadata.frames),
        vec![(0, 30, true, false)]
    );
    assert_eq!(send.ordered_stream_bytes_sent, 30);
    assert!(send.send_flags & conn_flags::DATA_BLOCKED != 0);
    assert!(send.blocked_reasons & conn_blocked::CONN_FLOW_CONTROL != 0);
}

#[test]
fn granting_stream_credit_unblocks() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);
    let mut space = PacketSpace::new();
    let path = Path::validated(1200);

    stream.max_allowed_send_offset = 50;
    queue(&mut stream, &mut send, &mut sink, 100, 0, 1);
    let mut builder = packet(&mut space, &path);
    stream.write_frames(&mut send, &mut builder);
    assert!(stream.send_flags & send_flags::DATA_BLOCKED != 0);

    assert!(stream.on_max_stream_data(&mut send, 1_000_000));
    assert_eq!(stream.max_allowed_send_offset, 1_000_000);
    assert_eq!(stream.send_window, 1_000_000);
    assert_eq!(stream.send_flags & send_flags::DATA_BLOCKED, 0);
    assert!(send.flush_operation_pending);

    // stale or smaller grants are ignored
    assert!(!stream.on_max_stream_data(&mut send, 10));
    assert_eq!(stream.max_allowed_send_offset, 1_000_000);
}

#[test]
fn sack_holes_bound_retransmissions() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);
    let mut space = PacketSpace::new();
    let path = Path::validated(1200);

    queue(&mut stream, &mut send, &mut sink, 300, 0, 1);
    let mut builder = packet(&mut space, &path);
    stream.write_frames(&mut send, &mut builder);
    assert_eq!(stream.next_send_offset, 300);

    // the middle got acknowledged in some packet
    stream
        .on_ack(&mut send, KeyType::OneRtt, 100, 100, false, &mut sink)
        .unwrap();
    assert_eq!(stream.un_acked_offset, 0);
    assert_eq!(stream.sparse_ack_ranges.len(), 1);

    // the whole original frame was declared lost
    assert!(stream.on_loss(&mut send, 0, 300, false, false));
    assert!(stream.flags.in_recovery);
    assert_eq!(stream.recovery_next_offset, 0);
    assert_eq!(stream.recovery_end_offset, 300);

    let mut builder = packet(&mut space, &path);
    stream.write_frames(&mut send, &mut builder);

    // retransmissions skip the SACKed range
    assert_eq!(
        stream_frames(&builder.metadata.frames),
        vec![(0, 100, false, false), (200, 100, false, false)]
    );
    // first transmissions were already counted
    assert_eq!(send.ordered_stream_bytes_sent, 300);
}

#[test]
fn loss_covered_by_acks_is_ignored() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);
    let mut space = PacketSpace::new();
    let path = Path::validated(1200);

    queue(&mut stream, &mut send, &mut sink, 100, 0, 1);
    let mut builder = packet(&mut space, &path);
    stream.write_frames(&mut send, &mut builder);

    stream
        .on_ack(&mut send, KeyType::OneRtt, 0, 100, false, &mut sink)
        .unwrap();
    assert_eq!(stream.un_acked_offset, 100);

    assert!(!stream.on_loss(&mut send, 0, 100, false, false));
    assert!(!stream.flags.in_recovery);
}

#[test]
fn cumulative_acks_complete_requests_in_order() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);
    let mut space = PacketSpace::new();
    let path = Path::validated(1200);

    for context in 1..=3 {
        queue(&mut stream, &mut send, &mut sink, 100, 0, context);
    }
    let mut builder = packet(&mut space, &path);
    stream.write_frames(&mut send, &mut builder);

    stream
        .on_ack(&mut send, KeyType::OneRtt, 0, 100, false, &mut sink)
        .unwrap();
    stream
        .on_ack(&mut send, KeyType::OneRtt, 100, 200, false, &mut sink)
        .unwrap();

    let completions: Vec<u64> = sink
        .events
        .iter()
        .filter_map(|(_, event)| match event {
            Event::SendComplete {
                canceled: false,
                context,
            } => Some(*context),
            _ => None,
        })
        .collect();
    assert_eq!(completions, vec![1, 2, 3]);
    assert_eq!(stream.un_acked_offset, 300);
}

#[test]
fn sack_adjacent_to_cumulative_prefix_collapses() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);
    let mut space = PacketSpace::new();
    let path = Path::validated(1200);

    queue(&mut stream, &mut send, &mut sink, 200, 0, 1);
    let mut builder = packet(&mut space, &path);
    stream.write_frames(&mut send, &mut builder);

    stream
        .on_ack(&mut send, KeyType::OneRtt, 100, 100, false, &mut sink)
        .unwrap();
    assert_eq!(stream.sparse_ack_ranges.len(), 1);

    // the prefix catches up to the SACK: both collapse in one step
    stream
        .on_ack(&mut send, KeyType::OneRtt, 0, 100, false, &mut sink)
        .unwrap();
    assert_eq!(stream.un_acked_offset, 200);
    assert!(stream.sparse_ack_ranges.is_empty());
}

#[test]
fn sack_swallowing_cursor_jumps_it_forward() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);
    let mut space = PacketSpace::new();
    let path = Path::validated(1200);

    queue(&mut stream, &mut send, &mut sink, 300, 0, 1);
    let mut builder = packet(&mut space, &path);
    stream.write_frames(&mut send, &mut builder);

    // roll the fresh cursor back as a retransmit timeout would
    stream.next_send_offset = 100;
    stream
        .on_ack(&mut send, KeyType::OneRtt, 50, 100, false, &mut sink)
        .unwrap();

    // the cursor sat inside the newly acked range and must move past it
    assert_eq!(stream.next_send_offset, 150);
}

#[test]
fn fin_ack_fires_exactly_one_shutdown_complete() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);
    let mut space = PacketSpace::new();
    let path = Path::validated(1200);

    queue(&mut stream, &mut send, &mut sink, 100, request_flags::FIN, 7);
    let mut builder = packet(&mut space, &path);
    stream.write_frames(&mut send, &mut builder);
    assert_eq!(
        stream_frames(&builder.metadata.frames),
        vec![(0, 100, true, true)]
    );

    stream
        .on_ack(&mut send, KeyType::OneRtt, 0, 100, true, &mut sink)
        .unwrap();
    // a duplicate ack of the same frame is idempotent
    stream
        .on_ack(&mut send, KeyType::OneRtt, 0, 100, true, &mut sink)
        .unwrap();

    assert!(stream.flags.fin_acked);
    assert!(stream.flags.local_close_acked);
    let shutdowns = sink
        .events
        .iter()
        .filter(|(_, event)| {
            matches!(event, Event::SendShutdownComplete { graceful: true })
        })
        .count();
    assert_eq!(shutdowns, 1);
}

#[test]
fn loss_reflags_open_and_fin() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);
    let mut space = PacketSpace::new();
    let path = Path::validated(1200);

    queue(&mut stream, &mut send, &mut sink, 10, request_flags::FIN, 1);
    let mut builder = packet(&mut space, &path);
    stream.write_frames(&mut send, &mut builder);
    assert_eq!(stream.send_flags & (send_flags::OPEN | send_flags::FIN), 0);

    assert!(stream.on_loss(&mut send, 0, 10, true, true));
    assert!(stream.flags.in_recovery);
    assert!(stream.send_flags & send_flags::OPEN != 0);
    assert!(stream.send_flags & send_flags::FIN != 0);
    assert!(stream.send_flags & send_flags::DATA != 0);
}

#[test]
fn abortive_shutdown_cancels_requests_in_order() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);
    let mut space = PacketSpace::new();
    let path = Path::validated(1200);

    queue(&mut stream, &mut send, &mut sink, 100, 0, 1);
    queue(&mut stream, &mut send, &mut sink, 100, 0, 2);
    let mut builder = packet(&mut space, &path);
    stream.write_frames(&mut send, &mut builder);

    stream.send_shutdown(&mut send, false, false, false, 0x77, &mut sink);

    let canceled: Vec<u64> = sink
        .events
        .iter()
        .filter_map(|(_, event)| match event {
            Event::SendComplete {
                canceled: true,
                context,
            } => Some(*context),
            _ => None,
        })
        .collect();
    assert_eq!(canceled, vec![1, 2]);
    assert!(stream.flags.local_close_reset);
    assert!(stream.send_flags & send_flags::SEND_ABORT != 0);
    assert_eq!(stream.send_flags & send_flags::DATA_FRAMES, 0);

    // the RESET_STREAM carries the highest offset ever sent
    let mut builder = packet(&mut space, &path);
    assert!(stream.write_frames(&mut send, &mut builder));
    assert!(matches!(
        builder.metadata.frames[0],
        SentFrame::ResetStream { .. }
    ));

    // losses after an abort are ignored
    assert!(!stream.on_loss(&mut send, 0, 100, false, false));
}

#[test]
fn silent_shutdown_completes_immediately() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);

    queue(&mut stream, &mut send, &mut sink, 100, 0, 1);
    let teardown = stream.send_shutdown(&mut send, false, true, false, 0, &mut sink);

    assert!(teardown);
    assert!(stream.flags.local_close_acked);
    assert_eq!(stream.send_flags, 0);
    assert!(sink.events.iter().any(|(_, event)| matches!(
        event,
        Event::SendShutdownComplete { graceful: false }
    )));
}

#[test]
fn sends_after_fin_are_canceled() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);

    queue(&mut stream, &mut send, &mut sink, 10, request_flags::FIN, 1);
    queue(&mut stream, &mut send, &mut sink, 10, 0, 2);

    assert!(sink.events.iter().any(|(_, event)| matches!(
        event,
        Event::SendComplete {
            canceled: true,
            context: 2
        }
    )));
    assert_eq!(stream.queued_send_offset, 10);
}

#[test]
fn zero_rtt_bookkeeping() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);

    queue(
        &mut stream,
        &mut send,
        &mut sink,
        100,
        request_flags::ALLOW_0_RTT,
        1,
    );
    assert_eq!(stream.queued_zero_rtt, 100);
    assert!(stream.has_pending_zero_rtt_data());

    // non-contiguous 0-RTT request does not extend the window
    queue(&mut stream, &mut send, &mut sink, 100, 0, 2);
    queue(
        &mut stream,
        &mut send,
        &mut sink,
        100,
        request_flags::ALLOW_0_RTT,
        3,
    );
    assert_eq!(stream.queued_zero_rtt, 100);

    let mut space = PacketSpace::new();
    let path = Path::validated(1200);
    let mut builder = packet(&mut space, &path);
    stream.write_frames(&mut send, &mut builder);
    assert!(!stream.has_pending_zero_rtt_data());

    stream
        .on_ack(&mut send, KeyType::ZeroRtt, 0, 100, false, &mut sink)
        .unwrap();
    assert_eq!(stream.sent_zero_rtt, 100);
}

#[test]
fn buffered_sends_complete_at_queue_time() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);

    stream.queue_app_send(&mut send, payload(100), 0, 9, true, &mut sink);
    assert!(sink.events.iter().any(|(_, event)| matches!(
        event,
        Event::SendComplete {
            canceled: false,
            context: 9
        }
    )));

    // the ack must not complete it a second time
    let mut space = PacketSpace::new();
    let path = Path::validated(1200);
    let mut builder = packet(&mut space, &path);
    stream.write_frames(&mut send, &mut builder);
    sink.events.clear();
    stream
        .on_ack(&mut send, KeyType::OneRtt, 0, 100, false, &mut sink)
        .unwrap();
    assert!(sink.events.is_empty());
}

// ===== receive half =====

#[test]
fn fin_reassembly_delivers_one_receive_and_shutdown() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = peer_stream(&settings);
    let rtt = RttEstimator::default();

    let first = payload(100);
    let last = payload(50);
    let middle = payload(100);

    assert_eq!(
        stream
            .process_stream_frame(&mut send, false, 0, &first, false, &mut sink)
            .unwrap(),
        RecvFlushDisposition::Queue
    );
    stream
        .process_stream_frame(&mut send, false, 200, &last, true, &mut sink)
        .unwrap();
    stream
        .process_stream_frame(&mut send, false, 100, &middle, false, &mut sink)
        .unwrap();

    assert_eq!(stream.recv_max_length, 250);
    assert_eq!(send.ordered_stream_bytes_received, 250);

    let teardown = stream.recv_flush(&mut send, &settings, &rtt, now(), &mut sink);
    assert!(teardown);

    let mut receives = 0;
    let mut shutdowns = 0;
    for (_, event) in &sink.events {
        match event {
            Event::Receive {
                absolute_offset,
                chunks,
                fin,
                ..
            } => {
                receives += 1;
                assert_eq!(*absolute_offset, 0);
                let total: usize = chunks.iter().map(|c| c.len()).sum();
                assert_eq!(total, 250);
                assert!(chunks.len() <= 3);
                assert!(fin);
            }
            Event::PeerSendShutdown => shutdowns += 1,
            _ => {}
        }
    }
    assert_eq!(receives, 1);
    assert_eq!(shutdowns, 1);
    assert!(stream.flags.remote_close_fin);
    assert!(stream.flags.remote_close_acked);
}

#[test]
fn conflicting_fin_is_a_final_size_error() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = peer_stream(&settings);

    stream
        .process_stream_frame(&mut send, false, 0, &payload(10), true, &mut sink)
        .unwrap();

    let error = stream
        .process_stream_frame(&mut send, false, 20, &payload(1), true, &mut sink)
        .unwrap_err();
    assert!(error.same_code(&flowquic_core::transport::Error::FINAL_SIZE_ERROR));
}

#[test]
fn data_beyond_fin_is_a_final_size_error() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = peer_stream(&settings);

    stream
        .process_stream_frame(&mut send, false, 0, &payload(10), true, &mut sink)
        .unwrap();

    let error = stream
        .process_stream_frame(&mut send, false, 10, &payload(5), false, &mut sink)
        .unwrap_err();
    assert!(error.same_code(&flowquic_core::transport::Error::FINAL_SIZE_ERROR));
}

#[test]
fn stream_window_violation_is_a_flow_control_error() {
    let mut settings = Settings::default();
    settings.stream_recv_window = 100;
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = peer_stream(&settings);

    let error = stream
        .process_stream_frame(&mut send, false, 50, &payload(100), false, &mut sink)
        .unwrap_err();
    assert!(error.same_code(&flowquic_core::transport::Error::FLOW_CONTROL_ERROR));
}

#[test]
fn connection_credit_violation_is_a_flow_control_error() {
    let mut settings = Settings::default();
    settings.conn_flow_control_window = 100;
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = peer_stream(&settings);

    let error = stream
        .process_stream_frame(&mut send, false, 0, &payload(200), false, &mut sink)
        .unwrap_err();
    assert!(error.same_code(&flowquic_core::transport::Error::FLOW_CONTROL_ERROR));
}

#[test]
fn duplicate_data_does_not_consume_connection_credit() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = peer_stream(&settings);

    stream
        .process_stream_frame(&mut send, false, 0, &payload(100), false, &mut sink)
        .unwrap();
    stream
        .process_stream_frame(&mut send, false, 0, &payload(100), false, &mut sink)
        .unwrap();
    assert_eq!(send.ordered_stream_bytes_received, 100);
}

#[test]
fn max_data_tuning_follows_the_drain_ratio() {
    let mut settings = Settings::default();
    settings.conn_flow_control_window = 64 * 1024;
    settings.stream_recv_window = 64 * 1024;
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = peer_stream(&settings);
    let rtt = RttEstimator::default();

    let initial_max_data = send.max_data;

    // deliver a quarter of the window (the drain threshold)
    stream
        .process_stream_frame(&mut send, false, 0, &payload(16 * 1024), false, &mut sink)
        .unwrap();
    stream.recv_flush(&mut send, &settings, &rtt, now(), &mut sink);

    assert_eq!(send.max_data, initial_max_data + 16 * 1024);
    assert!(send.send_flags & conn_flags::MAX_DATA != 0);
    assert!(stream.send_flags & send_flags::MAX_DATA != 0);
    assert_eq!(stream.max_allowed_recv_offset, 16 * 1024 + 64 * 1024);

    // below the threshold and with no ACK armed, nothing further goes out
    send.clear_flags(conn_flags::MAX_DATA);
    stream.clear_send_flags(&mut send, send_flags::MAX_DATA);
    let advertised = stream.max_allowed_recv_offset;

    stream
        .process_stream_frame(
            &mut send,
            false,
            16 * 1024,
            &payload(4 * 1024),
            false,
            &mut sink,
        )
        .unwrap();
    stream.recv_flush(&mut send, &settings, &rtt, now(), &mut sink);

    assert_eq!(send.max_data, initial_max_data + 20 * 1024);
    assert!(send.send_flags & conn_flags::MAX_DATA == 0);
    assert!(stream.send_flags & send_flags::MAX_DATA == 0);
    assert_eq!(stream.max_allowed_recv_offset, advertised);
}

#[test]
fn piggy_backs_window_update_on_pending_ack() {
    let mut settings = Settings::default();
    settings.conn_flow_control_window = 64 * 1024;
    settings.stream_recv_window = 64 * 1024;
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = peer_stream(&settings);
    let rtt = RttEstimator::default();

    // an ACK is already scheduled: even a small delivery updates the window
    send.insert_flags(conn_flags::ACK);
    stream
        .process_stream_frame(&mut send, false, 0, &payload(1024), false, &mut sink)
        .unwrap();
    stream.recv_flush(&mut send, &settings, &rtt, now(), &mut sink);

    assert!(stream.send_flags & send_flags::MAX_DATA != 0);
    assert_eq!(stream.max_allowed_recv_offset, 1024 + 64 * 1024);
}

#[test]
fn receive_buffer_doubles_under_fast_delivery() {
    let mut settings = Settings::default();
    settings.stream_recv_window = 4 * 1024;
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = peer_stream(&settings);
    let rtt = RttEstimator::default();

    // two quarter-window deliveries in rapid succession; the second update
    // happens faster than the window could have drained at rtt pace
    stream
        .process_stream_frame(&mut send, false, 0, &payload(1024), false, &mut sink)
        .unwrap();
    stream.recv_flush(&mut send, &settings, &rtt, now(), &mut sink);
    assert_eq!(stream.recv_buffer.virtual_buffer_length(), 4 * 1024);

    stream
        .process_stream_frame(&mut send, false, 1024, &payload(1024), false, &mut sink)
        .unwrap();
    stream.recv_flush(
        &mut send,
        &settings,
        &rtt,
        now() + core::time::Duration::from_millis(1),
        &mut sink,
    );
    assert_eq!(stream.recv_buffer.virtual_buffer_length(), 8 * 1024);
}

#[test]
fn stop_sending_aborts_our_send_path() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = local_stream(&mut send, &settings);

    stream.process_stop_sending_frame(&mut send, 0x42, &mut sink);

    assert!(stream.flags.received_stop_sending);
    assert!(stream.flags.local_close_reset);
    assert!(stream.send_flags & send_flags::SEND_ABORT != 0);
    assert!(sink.events.iter().any(|(_, event)| matches!(
        event,
        Event::PeerReceiveAborted { error_code: 0x42 }
    )));

    // a second STOP_SENDING is ignored
    sink.events.clear();
    stream.process_stop_sending_frame(&mut send, 0x43, &mut sink);
    assert!(sink.events.is_empty());
}

#[test]
fn reset_validates_final_size() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = peer_stream(&settings);

    stream
        .process_stream_frame(&mut send, false, 0, &payload(100), false, &mut sink)
        .unwrap();

    // a final size below received bytes is fatal
    let error = stream
        .process_reset_frame(&mut send, 50, 1, &mut sink)
        .unwrap_err();
    assert!(error.same_code(&flowquic_core::transport::Error::FINAL_SIZE_ERROR));
}

#[test]
fn reset_grants_credit_for_unreceived_bytes() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = peer_stream(&settings);

    stream
        .process_stream_frame(&mut send, false, 0, &payload(100), false, &mut sink)
        .unwrap();
    let max_data_before = send.max_data;

    let teardown = stream
        .process_reset_frame(&mut send, 400, 9, &mut sink)
        .unwrap();
    assert!(teardown);

    // the unsent remainder counts against connection flow control, and the
    // unread bytes are credited back to the peer
    assert_eq!(send.ordered_stream_bytes_received, 400);
    assert_eq!(send.max_data, max_data_before + 400);
    assert!(send.send_flags & conn_flags::MAX_DATA != 0);

    assert!(stream.flags.remote_close_reset);
    assert!(stream.flags.remote_close_acked);
    assert!(sink.events.iter().any(|(_, event)| matches!(
        event,
        Event::PeerSendAborted { error_code: 9 }
    )));
}

#[test]
fn fin_after_stop_sending_acts_as_reset() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = peer_stream(&settings);

    assert!(!stream.recv_shutdown(&mut send, false, 0x21, &mut sink));
    assert!(stream.flags.sent_stop_sending);
    assert!(stream.send_flags & send_flags::RECV_ABORT != 0);

    // data is discarded, but a FIN completes the close like a reset
    stream
        .process_stream_frame(&mut send, false, 0, &payload(10), false, &mut sink)
        .unwrap();
    assert_eq!(send.ordered_stream_bytes_received, 0);

    stream
        .process_stream_frame(&mut send, false, 10, &payload(5), true, &mut sink)
        .unwrap();
    assert!(stream.flags.remote_close_reset);
    assert!(stream.flags.remote_close_acked);
    // we had already stopped receiving: no abort indication
    assert!(!sink
        .events
        .iter()
        .any(|(_, event)| matches!(event, Event::PeerSendAborted { .. })));
}

#[test]
fn reliable_reset_requires_negotiation() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = peer_stream(&settings);

    let error = stream
        .process_reliable_reset_frame(&mut send, 3, 100, false, &mut sink)
        .unwrap_err();
    assert!(error.same_code(&flowquic_core::transport::Error::TRANSPORT_PARAMETER_ERROR));
}

#[test]
fn reliable_reset_delivers_owed_prefix_first() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = peer_stream(&settings);
    let rtt = RttEstimator::default();

    stream
        .process_stream_frame(&mut send, false, 0, &payload(60), false, &mut sink)
        .unwrap();

    // reliable offset not yet delivered: the error code is cached
    let teardown = stream
        .process_reliable_reset_frame(&mut send, 5, 50, true, &mut sink)
        .unwrap();
    assert!(!teardown);
    assert_eq!(stream.recv_max_length, 50);
    assert!(stream.flags.remote_close_reset_reliable);
    assert!(!sink
        .events
        .iter()
        .any(|(_, event)| matches!(event, Event::PeerSendAborted { .. })));

    // only strictly decreasing offsets are accepted
    stream
        .process_reliable_reset_frame(&mut send, 5, 80, true, &mut sink)
        .unwrap();
    assert_eq!(stream.recv_max_length, 50);

    // delivering the prefix completes the abort
    let teardown = stream.recv_flush(&mut send, &settings, &rtt, now(), &mut sink);
    assert!(teardown);
    assert!(sink.events.iter().any(|(_, event)| matches!(
        event,
        Event::PeerSendAborted { error_code: 5 }
    )));
}

#[test]
fn receive_pause_and_resume() {
    let settings = Settings::default();
    let mut send = send_state(&settings);
    let mut sink = EventSink::default();
    let mut stream = peer_stream(&settings);
    let rtt = RttEstimator::default();

    assert!(!stream.recv_set_enabled(false).unwrap());

    stream
        .process_stream_frame(&mut send, false, 0, &payload(10), false, &mut sink)
        .unwrap();
    // disabled: the flush is a no-op
    stream.recv_flush(&mut send, &settings, &rtt, now(), &mut sink);
    assert!(sink.events.is_empty());

    // resuming wants a flush
    assert!(stream.recv_set_enabled(true).unwrap());
    stream.recv_flush(&mut send, &settings, &rtt, now(), &mut sink);
    assert_eq!(sink.events.len(), 1);
}
