// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MySQL packet framing and classification.
//!
//! TCP is a stream protocol without message boundaries. Every MySQL packet
//! begins with a 4-byte header:
//!
//! ```text
//! +----------------+---------+-------------------+
//! | Length (3B LE) | Seq (1B)| Payload           |
//! +----------------+---------+-------------------+
//! ```
//!
//! A payload longer than `0x00FFFFFF` is split into multiple packets with
//! incrementing sequence numbers, the final one shorter than the maximum
//! (possibly empty). The decoder maintains partial read state so residual
//! bytes carry over to the next read.

use super::constants::{
    Command, EOF_PACKET_LEN, HEADER_LEN, MAX_PAYLOAD_LEN, OK_PACKET_MIN_LEN, REPLY_EOF, REPLY_ERR,
    REPLY_LOCAL_INFILE, REPLY_OK, SERVER_MORE_RESULTS_EXIST, SERVER_PS_OUT_PARAMS,
};
use super::ParseError;

/// Parsed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length, at most [`MAX_PAYLOAD_LEN`].
    pub length: usize,
    /// Sequence number, wraps at 255.
    pub seq: u8,
}

/// Read a packet header. Three bytes are enough to compute the length, but
/// a full header is required to produce the sequence number.
pub fn header(buf: &[u8]) -> Result<PacketHeader, ParseError> {
    if buf.len() < HEADER_LEN {
        return Err(ParseError::Truncated {
            need: HEADER_LEN,
            have: buf.len(),
        });
    }
    Ok(PacketHeader {
        length: payload_len(buf),
        seq: buf[3],
    })
}

/// Payload length from the first three header bytes.
#[inline]
pub fn payload_len(buf: &[u8]) -> usize {
    debug_assert!(buf.len() >= 3);
    usize::from(buf[0]) | (usize::from(buf[1]) << 8) | (usize::from(buf[2]) << 16)
}

/// A single complete wire packet (header + payload), contiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
}

impl Packet {
    /// Wrap raw wire bytes. The buffer must contain exactly one complete
    /// packet: header plus `length` bytes of payload.
    pub fn from_wire(data: Vec<u8>) -> Result<Self, ParseError> {
        let hdr = header(&data)?;
        let expect = HEADER_LEN + hdr.length;
        if data.len() != expect {
            return Err(ParseError::Truncated {
                need: expect,
                have: data.len(),
            });
        }
        Ok(Self { data })
    }

    /// Build a packet from a payload, writing the header.
    ///
    /// # Panics
    /// Panics if the payload exceeds [`MAX_PAYLOAD_LEN`]; oversize payloads
    /// must be split by the caller with [`split_payload`].
    pub fn from_payload(seq: u8, payload: &[u8]) -> Self {
        assert!(payload.len() <= MAX_PAYLOAD_LEN, "payload must be split");
        let mut data = Vec::with_capacity(HEADER_LEN + payload.len());
        let len = payload.len();
        data.push((len & 0xff) as u8);
        data.push(((len >> 8) & 0xff) as u8);
        data.push(((len >> 16) & 0xff) as u8);
        data.push(seq);
        data.extend_from_slice(payload);
        Self { data }
    }

    /// Full wire bytes, header included.
    pub fn as_wire(&self) -> &[u8] {
        &self.data
    }

    /// Payload bytes, header excluded.
    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_LEN..]
    }

    pub fn seq(&self) -> u8 {
        self.data[3]
    }

    pub fn payload_len(&self) -> usize {
        self.data.len() - HEADER_LEN
    }

    /// Command byte of a client request packet, the byte after the header.
    pub fn command(&self) -> Result<Command, ParseError> {
        match self.payload().first() {
            Some(&byte) => Ok(Command::from_byte(byte)),
            None => Err(ParseError::EmptyPayload),
        }
    }

    /// Classify a server reply packet.
    ///
    /// `in_auth` selects the authentication-phase interpretation of `0xFE`
    /// (AuthSwitchRequest rather than EOF).
    pub fn classify(&self, in_auth: bool) -> ReplyKind {
        let payload = self.payload();
        let Some(&first) = payload.first() else {
            return ReplyKind::Unknown;
        };
        match first {
            REPLY_OK if self.data.len() >= OK_PACKET_MIN_LEN => ReplyKind::Ok,
            REPLY_ERR => ReplyKind::Err,
            REPLY_EOF if in_auth => ReplyKind::AuthSwitch,
            REPLY_EOF if payload.len() < 9 => ReplyKind::Eof,
            REPLY_LOCAL_INFILE => ReplyKind::LocalInfile,
            _ => ReplyKind::Data,
        }
    }
}

/// Server reply classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Ok,
    Err,
    Eof,
    LocalInfile,
    AuthSwitch,
    Data,
    Unknown,
}

/// Split an arbitrarily large payload into wire packets with incrementing
/// sequence numbers. A payload of exactly `MAX_PAYLOAD_LEN` is followed by
/// an empty continuation packet.
pub fn split_payload(mut seq: u8, payload: &[u8]) -> Vec<Packet> {
    let mut out = Vec::with_capacity(payload.len() / MAX_PAYLOAD_LEN + 1);
    let mut chunks = payload.chunks(MAX_PAYLOAD_LEN).peekable();
    let mut last_len = None;
    while let Some(chunk) = chunks.next() {
        out.push(Packet::from_payload(seq, chunk));
        seq = seq.wrapping_add(1);
        if chunks.peek().is_none() {
            last_len = Some(chunk.len());
        }
    }
    match last_len {
        // Terminating empty continuation after a maximal chunk.
        Some(len) if len == MAX_PAYLOAD_LEN => out.push(Packet::from_payload(seq, &[])),
        Some(_) => {}
        // Zero-byte payload is a valid empty packet.
        None => out.push(Packet::from_payload(seq, &[])),
    }
    out
}

// ============================================================================
// Stream decoder
// ============================================================================

/// Incremental packet decoder for a byte stream.
///
/// Peels off as many whole packets as present; the residual is retained and
/// prepended to the next feed. This is the only layer aware of read-segment
/// boundaries.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    residual: Vec<u8>,

    // Statistics
    packets_decoded: u64,
    bytes_decoded: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and peel off all complete packets.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Packet> {
        self.residual.extend_from_slice(bytes);

        let mut packets = Vec::new();
        let mut offset = 0;
        loop {
            let rest = &self.residual[offset..];
            if rest.len() < 3 {
                break;
            }
            let need = HEADER_LEN + payload_len(rest);
            if rest.len() < need {
                break;
            }
            packets.push(Packet {
                data: rest[..need].to_vec(),
            });
            offset += need;
            self.packets_decoded += 1;
            self.bytes_decoded += need as u64;
        }
        self.residual.drain(..offset);
        packets
    }

    /// Bytes held over for the next feed.
    pub fn residual(&self) -> &[u8] {
        &self.residual
    }

    pub fn packets_decoded(&self) -> u64 {
        self.packets_decoded
    }

    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }

    /// Drop partial state, e.g. after a connection reset.
    pub fn reset(&mut self) {
        self.residual.clear();
    }
}

// ============================================================================
// Reply-boundary counting
// ============================================================================

/// Carry-over state for [`count_signal_packets`] across reads.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SignalState(u8);

const SKIP_NEXT: u8 = 0x1;
const PS_OUT_PARAM: u8 = 0x2;

/// Result of walking a chain of reply packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalCount {
    /// Number of EOF/ERR/OK boundaries seen so far, `n_found` included.
    pub total: u32,
    /// The server announced more result sets follow.
    pub more: bool,
    /// The stream was aborted by an ERR packet.
    pub aborted: bool,
}

/// Count the OK/EOF/ERR packets that delimit result sets in `stream`,
/// without parsing the result sets themselves.
///
/// `n_found` is the boundary count carried in from previous reads of the
/// same reply. Two boundaries delimit one ordinary result set, so a caller
/// knows the reply is complete when the total is even and `more` is false.
///
/// Honors `SERVER_MORE_RESULTS_EXIST`, and works around the MySQL 5.6/5.7
/// behaviour where `SERVER_PS_OUT_PARAMS` on the first EOF suppresses
/// `MORE_RESULTS_EXIST` on the second: the flag is sticky across exactly
/// one EOF pair.
///
/// A complete stream consisting of more than one packet where every packet
/// is an OK is collapsed to a single result set (`total = 2`). Multi-
/// statement routers rely on this collapsing.
pub fn count_signal_packets(stream: &[u8], n_found: u32, state: &mut SignalState) -> SignalCount {
    let len = stream.len();
    let mut eof: u32 = 0;
    let mut offset = 0usize;
    let mut more = false;
    let mut only_ok = true;
    let mut num_packets = 0u64;
    let mut internal = state.0;

    while offset + HEADER_LEN <= len {
        num_packets += 1;
        let hdr = &stream[offset..];
        let plen = payload_len(hdr);
        let pktlen = plen + HEADER_LEN;

        if plen == MAX_PAYLOAD_LEN {
            only_ok = false;
            internal |= SKIP_NEXT;
        } else if internal & SKIP_NEXT != 0 {
            only_ok = false;
            internal &= !SKIP_NEXT;
        } else if let (true, Some(&first)) = (plen > 0, stream.get(offset + HEADER_LEN)) {
            if first == REPLY_ERR {
                // An error aborts result-set generation; nothing follows.
                state.0 = internal;
                return SignalCount {
                    total: 2,
                    more: false,
                    aborted: true,
                };
            } else if first == REPLY_EOF && pktlen == EOF_PACKET_LEN {
                eof += 1;
                only_ok = false;

                let status = read_u16_le(stream, offset + HEADER_LEN + 3);
                more = status & SERVER_MORE_RESULTS_EXIST != 0;

                if status & SERVER_PS_OUT_PARAMS != 0 {
                    internal |= PS_OUT_PARAM;
                } else if internal & PS_OUT_PARAM != 0 {
                    more = true;
                    internal &= !PS_OUT_PARAM;
                }
            } else if first == REPLY_OK
                && pktlen >= OK_PACKET_MIN_LEN
                && (eof + n_found) % 2 == 0
            {
                // An OK packet that is not in the middle of a resultset
                // stream: skip affected-rows and last-insert-id, then read
                // the status word.
                let mut pos = offset + HEADER_LEN + 1;
                pos += lenenc_bytes(stream, pos);
                pos += lenenc_bytes(stream, pos);
                more = read_u16_le(stream, pos) & SERVER_MORE_RESULTS_EXIST != 0;
            } else {
                only_ok = false;
            }
        }

        offset += pktlen;
    }

    state.0 = internal;

    let mut total = eof + n_found;
    if only_ok && !more && num_packets > 1 {
        total = 2;
    }

    SignalCount {
        total,
        more,
        aborted: false,
    }
}

/// Wire size of a length-encoded integer starting at `pos`.
fn lenenc_bytes(buf: &[u8], pos: usize) -> usize {
    match buf.get(pos) {
        Some(0xfc) => 3,
        Some(0xfd) => 4,
        Some(0xfe) => 9,
        _ => 1,
    }
}

fn read_u16_le(buf: &[u8], pos: usize) -> u16 {
    match (buf.get(pos), buf.get(pos + 1)) {
        (Some(&a), Some(&b)) => u16::from_le_bytes([a, b]),
        _ => 0,
    }
}

/// Read a length-encoded integer, returning the value and consumed bytes.
pub fn lenenc_int(buf: &[u8]) -> Result<(u64, usize), ParseError> {
    let Some(&first) = buf.first() else {
        return Err(ParseError::EmptyPayload);
    };
    let need = lenenc_bytes(buf, 0);
    if buf.len() < need {
        return Err(ParseError::Truncated {
            need,
            have: buf.len(),
        });
    }
    let value = match first {
        0xfc => u64::from(u16::from_le_bytes([buf[1], buf[2]])),
        0xfd => u64::from(buf[1]) | u64::from(buf[2]) << 8 | u64::from(buf[3]) << 16,
        0xfe => u64::from_le_bytes([
            buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8],
        ]),
        byte => u64::from(byte),
    };
    Ok((value, need))
}

/// Parsed OK packet fields the routing layer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: u16,
    pub warnings: u16,
}

impl OkPacket {
    /// Parse an OK payload (first byte `0x00` already verified by
    /// classification).
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let mut pos = 1;
        let (affected_rows, used) = lenenc_int(&payload[pos..])?;
        pos += used;
        let (last_insert_id, used) = lenenc_int(&payload[pos..])?;
        pos += used;
        if payload.len() < pos + 4 {
            return Err(ParseError::Truncated {
                need: pos + 4,
                have: payload.len(),
            });
        }
        let status = u16::from_le_bytes([payload[pos], payload[pos + 1]]);
        let warnings = u16::from_le_bytes([payload[pos + 2], payload[pos + 3]]);
        Ok(Self {
            affected_rows,
            last_insert_id,
            status,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::SERVER_STATUS_AUTOCOMMIT;

    fn ok_payload(status: u16) -> Vec<u8> {
        // 0x00, affected=0, insert_id=0, status, warnings=0
        let mut p = vec![0x00, 0x00, 0x00];
        p.extend_from_slice(&status.to_le_bytes());
        p.extend_from_slice(&[0x00, 0x00]);
        p
    }

    fn eof_payload(status: u16) -> Vec<u8> {
        let mut p = vec![0xfe, 0x00, 0x00];
        p.extend_from_slice(&status.to_le_bytes());
        p
    }

    #[test]
    fn test_frame_simple_stream() {
        // COM_QUIT | "SEL1" query fragment | partial header
        let bytes: Vec<u8> = [
            &[0x01, 0x00, 0x00, 0x00, 0x01][..],
            &[0x05, 0x00, 0x00, 0x00, 0x03, 0x53, 0x45, 0x4c, 0x31][..],
            &[0x03, 0x00, 0x00, 0x00][..],
        ]
        .concat();

        let mut dec = FrameDecoder::new();
        let packets = dec.feed(&bytes);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].command().unwrap(), Command::Quit);
        assert_eq!(packets[1].command().unwrap(), Command::Query);
        assert_eq!(dec.residual(), &[0x03, 0x00, 0x00, 0x00]);

        // Completing the partial packet drains the residual.
        let more = dec.feed(&[0x03, 0x20, 0x20]);
        assert_eq!(more.len(), 1);
        assert_eq!(more[0].payload(), &[0x03, 0x20, 0x20]);
        assert!(dec.residual().is_empty());
    }

    #[test]
    fn test_frame_zero_length_packet() {
        let mut dec = FrameDecoder::new();
        let packets = dec.feed(&[0x00, 0x00, 0x00, 0x05]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload_len(), 0);
        assert_eq!(packets[0].seq(), 5);
    }

    #[test]
    fn test_frame_roundtrip_many() {
        let mut wire = Vec::new();
        let mut expected = Vec::new();
        for i in 0..64u8 {
            let payload: Vec<u8> = (0..usize::from(i) * 7).map(|b| b as u8).collect();
            let pkt = Packet::from_payload(i, &payload);
            wire.extend_from_slice(pkt.as_wire());
            expected.push(pkt);
        }

        // Feed in ragged chunks to exercise residual handling.
        let mut dec = FrameDecoder::new();
        let mut got = Vec::new();
        for chunk in wire.chunks(13) {
            got.extend(dec.feed(chunk));
        }
        assert_eq!(got, expected);
        assert!(dec.residual().is_empty());
    }

    #[test]
    fn test_split_payload_max_boundary() {
        let payload = vec![0xaa; MAX_PAYLOAD_LEN];
        let packets = split_payload(0, &payload);
        assert_eq!(packets.len(), 2, "maximal payload needs empty continuation");
        assert_eq!(packets[0].payload_len(), MAX_PAYLOAD_LEN);
        assert_eq!(packets[1].payload_len(), 0);
        assert_eq!(packets[1].seq(), 1);
    }

    #[test]
    fn test_split_payload_empty() {
        let packets = split_payload(3, &[]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload_len(), 0);
        assert_eq!(packets[0].seq(), 3);
    }

    #[test]
    fn test_classify() {
        let ok = Packet::from_payload(1, &ok_payload(SERVER_STATUS_AUTOCOMMIT));
        assert_eq!(ok.classify(false), ReplyKind::Ok);

        let err = Packet::from_payload(1, &[0xff, 0x15, 0x04]);
        assert_eq!(err.classify(false), ReplyKind::Err);

        let eof = Packet::from_payload(1, &eof_payload(0));
        assert_eq!(eof.classify(false), ReplyKind::Eof);
        assert_eq!(eof.classify(true), ReplyKind::AuthSwitch);

        let infile = Packet::from_payload(1, &[0xfb, b'/', b'x']);
        assert_eq!(infile.classify(false), ReplyKind::LocalInfile);

        let data = Packet::from_payload(1, &[0x02, 0x01]);
        assert_eq!(data.classify(false), ReplyKind::Data);
    }

    #[test]
    fn test_count_single_ok() {
        let pkt = Packet::from_payload(1, &ok_payload(0));
        let mut state = SignalState::default();
        let count = count_signal_packets(pkt.as_wire(), 0, &mut state);
        assert_eq!(count.total, 0);
        assert!(!count.more);
        assert!(!count.aborted);
    }

    #[test]
    fn test_count_resultset_two_eofs() {
        // column-def EOF ... row EOF: fake a minimal stream of
        // [data][eof][data][eof].
        let mut stream = Vec::new();
        stream.extend_from_slice(Packet::from_payload(1, &[0x01]).as_wire());
        stream.extend_from_slice(Packet::from_payload(2, &eof_payload(0)).as_wire());
        stream.extend_from_slice(Packet::from_payload(3, &[0x02, b'a']).as_wire());
        stream.extend_from_slice(Packet::from_payload(4, &eof_payload(0)).as_wire());

        let mut state = SignalState::default();
        let count = count_signal_packets(&stream, 0, &mut state);
        assert_eq!(count.total, 2);
        assert!(!count.more);
    }

    #[test]
    fn test_count_err_aborts() {
        let mut stream = Vec::new();
        stream.extend_from_slice(Packet::from_payload(1, &[0x01]).as_wire());
        stream.extend_from_slice(Packet::from_payload(2, &[0xff, 0x15, 0x04]).as_wire());

        let mut state = SignalState::default();
        let count = count_signal_packets(&stream, 0, &mut state);
        assert!(count.aborted);
        assert_eq!(count.total, 2);
        assert!(!count.more);
    }

    #[test]
    fn test_count_ps_out_params_sticky() {
        // First EOF carries PS_OUT_PARAMS, second carries neither flag:
        // the stream must still be reported as continuing.
        let mut stream = Vec::new();
        stream.extend_from_slice(Packet::from_payload(1, &[0x01]).as_wire());
        stream.extend_from_slice(
            Packet::from_payload(2, &eof_payload(SERVER_PS_OUT_PARAMS)).as_wire(),
        );
        stream.extend_from_slice(Packet::from_payload(3, &[0x02]).as_wire());
        stream.extend_from_slice(Packet::from_payload(4, &eof_payload(0)).as_wire());

        let mut state = SignalState::default();
        let count = count_signal_packets(&stream, 0, &mut state);
        assert_eq!(count.total, 2);
        assert!(count.more, "PS_OUT_PARAMS implies one more result");

        // Exactly one additional result: an OK terminates the stream.
        let ok = Packet::from_payload(5, &ok_payload(0));
        let count = count_signal_packets(ok.as_wire(), count.total, &mut state);
        assert!(!count.more);
    }

    #[test]
    fn test_count_multi_ok_collapses() {
        // A complete multi-statement reply of only OK packets is treated
        // as a single result set.
        let mut stream = Vec::new();
        stream.extend_from_slice(
            Packet::from_payload(1, &ok_payload(SERVER_MORE_RESULTS_EXIST)).as_wire(),
        );
        stream.extend_from_slice(Packet::from_payload(2, &ok_payload(0)).as_wire());

        let mut state = SignalState::default();
        let count = count_signal_packets(&stream, 0, &mut state);
        assert_eq!(count.total, 2);
        assert!(!count.more);
    }

    #[test]
    fn test_count_skips_max_length_continuations() {
        // A 0xFFFFFF-length packet must not be classified by its first
        // payload byte, and neither must its continuation.
        let mut stream = Vec::new();
        let huge = vec![0xfe; MAX_PAYLOAD_LEN];
        stream.extend_from_slice(Packet::from_payload(1, &huge).as_wire());
        stream.extend_from_slice(Packet::from_payload(2, &eof_payload(0)).as_wire());

        let mut state = SignalState::default();
        let count = count_signal_packets(&stream, 0, &mut state);
        // The continuation happened to be an EOF-sized packet but must be
        // skipped; total stays at the carried-in count.
        assert_eq!(count.total, 0);
    }

    #[test]
    fn test_lenenc_int() {
        assert_eq!(lenenc_int(&[0x0a]).unwrap(), (10, 1));
        assert_eq!(lenenc_int(&[0xfc, 0x10, 0x27]).unwrap(), (10000, 3));
        assert_eq!(lenenc_int(&[0xfd, 0x01, 0x00, 0x01]).unwrap(), (65537, 4));
        let wide = [0xfe, 1, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(lenenc_int(&wide).unwrap(), (1, 9));
        assert!(lenenc_int(&[0xfc, 0x01]).is_err());
    }

    #[test]
    fn test_ok_packet_parse() {
        let payload = ok_payload(SERVER_STATUS_AUTOCOMMIT);
        let ok = OkPacket::parse(&payload).unwrap();
        assert_eq!(ok.affected_rows, 0);
        assert_eq!(ok.status, SERVER_STATUS_AUTOCOMMIT);
    }
}
