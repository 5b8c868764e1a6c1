// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire-level conformance: packet framing, classification and reply
//! boundary counting.

use hgate::protocol::{
    count_signal_packets, split_payload, Command, FrameDecoder, Packet, ReplyKind, SignalState,
};

const MAX_PAYLOAD: usize = 0x00FF_FFFF;

fn eof_payload(status: u16) -> Vec<u8> {
    let mut p = vec![0xfe, 0x00, 0x00];
    p.extend_from_slice(&status.to_le_bytes());
    p
}

#[test]
fn frame_reference_byte_stream() {
    // COM_QUIT | 'SEL1' | three bytes of a further header.
    let bytes: Vec<u8> = [
        &[0x01, 0x00, 0x00, 0x00, 0x01][..],
        &[0x05, 0x00, 0x00, 0x00, 0x03, 0x53, 0x45, 0x4c, 0x31][..],
        &[0x03, 0x00, 0x00, 0x00][..],
    ]
    .concat();

    let mut decoder = FrameDecoder::new();
    let packets = decoder.feed(&bytes);

    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].command().unwrap(), Command::Quit);
    assert_eq!(packets[1].command().unwrap(), Command::Query);
    assert_eq!(packets[1].payload(), &[0x03, 0x53, 0x45, 0x4c, 0x31]);
    assert_eq!(decoder.residual(), &[0x03, 0x00, 0x00, 0x00]);
}

#[test]
fn frame_round_trips_any_well_formed_stream() {
    // Concatenations of well-formed packets always come back intact with
    // an empty residual, regardless of how the bytes are chunked.
    let mut wire = Vec::new();
    let mut expected = Vec::new();
    for size in [0usize, 1, 2, 16, 255, 256, 4096] {
        let payload: Vec<u8> = (0..size).map(|b| (b % 251) as u8).collect();
        let packet = Packet::from_payload((size % 256) as u8, &payload);
        wire.extend_from_slice(packet.as_wire());
        expected.push(packet);
    }

    for chunk_size in [1usize, 3, 4, 7, 1024, wire.len()] {
        let mut decoder = FrameDecoder::new();
        let mut got = Vec::new();
        for chunk in wire.chunks(chunk_size) {
            got.extend(decoder.feed(chunk));
        }
        assert_eq!(got, expected, "chunk size {chunk_size}");
        assert!(decoder.residual().is_empty(), "chunk size {chunk_size}");
    }
}

#[test]
fn zero_byte_payload_is_a_valid_packet() {
    let mut decoder = FrameDecoder::new();
    let packets = decoder.feed(&[0x00, 0x00, 0x00, 0x07]);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].payload_len(), 0);
    assert_eq!(packets[0].seq(), 7);
}

#[test]
fn maximal_payload_gets_empty_continuation() {
    let packets = split_payload(0, &vec![0x55; MAX_PAYLOAD]);
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].payload_len(), MAX_PAYLOAD);
    assert_eq!(packets[1].payload_len(), 0, "continuation may be empty");
    assert_eq!(packets[1].seq(), 1);

    // And it reassembles through the decoder.
    let mut wire = Vec::new();
    for packet in &packets {
        wire.extend_from_slice(packet.as_wire());
    }
    let mut decoder = FrameDecoder::new();
    assert_eq!(decoder.feed(&wire), packets);
}

#[test]
fn classification_discriminators() {
    let ok = Packet::from_payload(1, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
    assert_eq!(ok.classify(false), ReplyKind::Ok);

    let err = Packet::from_payload(1, &[0xff, 0x28, 0x04, b'#', b'H', b'Y', b'0', b'0', b'0']);
    assert_eq!(err.classify(false), ReplyKind::Err);

    let eof = Packet::from_payload(1, &eof_payload(0));
    assert_eq!(eof.classify(false), ReplyKind::Eof);
    // The same first byte reads as AuthSwitchRequest during auth.
    assert_eq!(eof.classify(true), ReplyKind::AuthSwitch);

    // A 0xFE packet of nine-plus payload bytes is not an EOF.
    let long_fe = Packet::from_payload(1, &[0xfe; 12]);
    assert_eq!(long_fe.classify(false), ReplyKind::Data);

    let infile = Packet::from_payload(1, &[0xfb, b'/', b't', b'm', b'p']);
    assert_eq!(infile.classify(false), ReplyKind::LocalInfile);
}

#[test]
fn ps_out_params_continues_for_exactly_one_result() {
    const SERVER_PS_OUT_PARAMS: u16 = 0x1000;

    // Result set whose first EOF carries PS_OUT_PARAMS and whose second
    // carries neither flag.
    let mut stream = Vec::new();
    stream.extend_from_slice(Packet::from_payload(1, &[0x01]).as_wire());
    stream.extend_from_slice(Packet::from_payload(2, &eof_payload(SERVER_PS_OUT_PARAMS)).as_wire());
    stream.extend_from_slice(Packet::from_payload(3, &[0x02, b'v']).as_wire());
    stream.extend_from_slice(Packet::from_payload(4, &eof_payload(0)).as_wire());

    let mut state = SignalState::default();
    let first = count_signal_packets(&stream, 0, &mut state);
    assert_eq!(first.total, 2);
    assert!(first.more, "the stream continues for one more result");

    // The one additional result terminates the stream.
    let ok = Packet::from_payload(5, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
    let second = count_signal_packets(ok.as_wire(), first.total, &mut state);
    assert!(!second.more);
    assert!(!second.aborted);
}

#[test]
fn err_packet_aborts_the_stream() {
    let mut stream = Vec::new();
    stream.extend_from_slice(Packet::from_payload(1, &[0x01]).as_wire());
    stream.extend_from_slice(Packet::from_payload(2, &eof_payload(0)).as_wire());
    stream.extend_from_slice(
        Packet::from_payload(3, &[0xff, 0x28, 0x04, b'#', b'4', b'2', b'0', b'0', b'0']).as_wire(),
    );

    let mut state = SignalState::default();
    let count = count_signal_packets(&stream, 0, &mut state);
    assert!(count.aborted);
    assert!(!count.more, "no more results follow an error");
}

#[test]
fn command_tables() {
    assert!(Command::StmtExecute.is_ps_command());
    assert!(Command::StmtFetch.is_ps_command());
    assert!(!Command::InitDb.is_ps_command());

    assert!(!Command::Quit.will_respond());
    assert!(!Command::StmtSendLongData.will_respond());
    assert!(!Command::StmtClose.will_respond());
    assert!(Command::StmtFetch.will_respond());
    assert!(Command::ResetConnection.will_respond());
}
