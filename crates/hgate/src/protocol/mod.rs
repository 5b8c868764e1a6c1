// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MySQL/MariaDB wire protocol: framing, classification, canonicalisation.
//!
//! This layer owns the packet model the routing core depends on. It does
//! not interpret result sets; it only finds their boundaries.

pub mod canonical;
pub mod constants;
pub mod err;
pub mod packet;

pub use canonical::canonicalise;
pub use constants::{caps, Command};
pub use packet::{
    count_signal_packets, header, split_payload, FrameDecoder, OkPacket, Packet, PacketHeader,
    ReplyKind, SignalCount, SignalState,
};

/// Errors produced by result-returning parsers. Parsers carry a position
/// and an error kind; the caller decides whether the error is fatal for
/// the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("truncated packet: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("empty payload")]
    EmptyPayload,
    #[error("packet is not an ERR packet")]
    NotAnErrPacket,
    #[error("malformed packet at byte {offset}")]
    Malformed { offset: usize },
}
