// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Canonical ERR packet construction and parsing.
//!
//! Wire layout:
//!
//! ```text
//! +--------------+---------+------+--------------+---+-------------+---------+
//! | Length (3B)  | Seq (1B)| 0xFF | errno (2B LE)| # | sqlstate 5B | message |
//! +--------------+---------+------+--------------+---+-------------+---------+
//! ```
//!
//! The `#` marker and sqlstate are optional on input but always emitted.

use super::constants::{ERR_PACKET_MIN_LEN, REPLY_ERR};
use super::packet::Packet;
use super::ParseError;

/// SQLSTATE for generic errors.
pub const SQLSTATE_GENERAL: &str = "HY000";
/// SQLSTATE for communication link failure, used for protocol errors.
pub const SQLSTATE_COMM_ERROR: &str = "08S01";

/// Error number used for proxy-generated errors without a specific code.
pub const ER_UNKNOWN_ERROR: u16 = 1105;
/// Too many connections.
pub const ER_CON_COUNT_ERROR: u16 = 1040;
/// Lost connection to the backend mid-query.
pub const ER_LOST_CONNECTION: u16 = 2013;

/// Build an ERR packet. `sqlstate` must be exactly five ASCII bytes.
pub fn create(seq: u8, errno: u16, sqlstate: &str, message: &str) -> Packet {
    debug_assert_eq!(sqlstate.len(), 5, "sqlstate is five bytes");
    let mut payload = Vec::with_capacity(1 + 2 + 6 + message.len());
    payload.push(REPLY_ERR);
    payload.extend_from_slice(&errno.to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(sqlstate.as_bytes());
    payload.extend_from_slice(message.as_bytes());
    Packet::from_payload(seq, &payload)
}

/// Parsed ERR packet contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub errno: u16,
    pub sqlstate: String,
    pub message: String,
}

/// Parse an ERR packet. The sqlstate marker is optional on input; when
/// absent the sqlstate defaults to [`SQLSTATE_GENERAL`].
pub fn parse(packet: &Packet) -> Result<ErrPacket, ParseError> {
    let payload = packet.payload();
    if packet.as_wire().len() < ERR_PACKET_MIN_LEN || payload[0] != REPLY_ERR {
        return Err(ParseError::NotAnErrPacket);
    }
    let errno = u16::from_le_bytes([payload[1], payload[2]]);
    let (sqlstate, msg_start) = if payload.get(3) == Some(&b'#') && payload.len() >= 9 {
        (String::from_utf8_lossy(&payload[4..9]).into_owned(), 9)
    } else {
        (SQLSTATE_GENERAL.to_string(), 3)
    };
    let message = String::from_utf8_lossy(&payload[msg_start..]).into_owned();
    Ok(ErrPacket {
        errno,
        sqlstate,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_layout() {
        let pkt = create(1, 1040, SQLSTATE_GENERAL, "Too many connections");
        let wire = pkt.as_wire();

        let msg_len = "Too many connections".len();
        assert_eq!(pkt.payload_len(), 1 + 2 + 6 + msg_len);
        assert_eq!(wire[3], 1, "sequence");
        assert_eq!(wire[4], 0xff);
        assert_eq!(u16::from_le_bytes([wire[5], wire[6]]), 1040);
        assert_eq!(wire[7], b'#');
        assert_eq!(&wire[8..13], b"HY000");
    }

    #[test]
    fn test_roundtrip() {
        let pkt = create(3, 2013, SQLSTATE_COMM_ERROR, "Lost connection to backend");
        let err = parse(&pkt).unwrap();
        assert_eq!(err.errno, 2013);
        assert_eq!(err.sqlstate, "08S01");
        assert_eq!(err.message, "Lost connection to backend");
    }

    #[test]
    fn test_parse_without_sqlstate_marker() {
        // Pre-4.1 style ERR without the '#' marker.
        let mut payload = vec![0xff];
        payload.extend_from_slice(&1064u16.to_le_bytes());
        payload.extend_from_slice(b"syntax error");
        let pkt = Packet::from_payload(1, &payload);

        let err = parse(&pkt).unwrap();
        assert_eq!(err.errno, 1064);
        assert_eq!(err.sqlstate, SQLSTATE_GENERAL);
        assert_eq!(err.message, "syntax error");
    }

    #[test]
    fn test_parse_rejects_non_err() {
        let pkt = Packet::from_payload(1, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
        assert!(parse(&pkt).is_err());
    }
}
