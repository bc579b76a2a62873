// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module implements the versioned binary gossip protocol: the framed
//! envelope, the payload primitives and the per-message codecs.

pub(crate) mod endpoint;
pub(crate) mod message;
pub(crate) mod state;

pub use endpoint::{
    read_endpoint,
    write_endpoint,
    write_endpoint_address_only,
    write_endpoint_with_port,
};
pub use message::{
    GossipDigest,
    GossipDigestAck,
    GossipDigestAck2,
    GossipDigestSyn,
    Message,
};

use num_derive::FromPrimitive;
use thiserror::Error;

/// The protocol version this node speaks. Versions below
/// [`FIRST_PORT_AWARE_VERSION`] serialize endpoints as bare addresses.
pub const PROTOCOL_VERSION: u8 = 40;
/// The first protocol version that carries ports (and host ids) inside
/// endpoint encodings.
pub const FIRST_PORT_AWARE_VERSION: u8 = 40;

/// A violation of the wire protocol. Fatal for the connection it arrived on.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The payload ended before the announced content.
    #[error("truncated frame: needed {needed} bytes at offset {at}")]
    Truncated {
        /// Bytes required by the decoder.
        needed: usize,
        /// Offset at which they were required.
        at: usize,
    },
    /// An endpoint encoding with an unknown size prefix.
    #[error("invalid endpoint size prefix: {0}")]
    InvalidEndpointSize(u8),
    /// An unknown message verb.
    #[error("unknown verb: {0}")]
    UnknownVerb(u8),
    /// An application state ordinal this version does not know.
    #[error("unknown application state ordinal: {0}")]
    UnknownStateKey(i32),
    /// A string payload that is not valid utf8.
    #[error("invalid utf8 in payload: {0}")]
    InvalidString(#[from] std::string::FromUtf8Error),
    /// A frame announcing a protocol version this node cannot speak.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
}

/// The message verbs of the gossip protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Verb {
    /// First phase of a round: digests only.
    Syn = 0x00,
    /// Second phase: requested digests plus fresher states.
    Ack = 0x01,
    /// Third phase: the states the ack requested.
    Ack2 = 0x02,
    /// One-way orderly shutdown announcement.
    Shutdown = 0x03,
    /// Liveness probe.
    Echo = 0x04,
    /// Liveness probe reply.
    EchoResponse = 0x05,
}

/// Encode a value into a payload buffer.
pub trait ToPayload {
    /// Append the encoding of `self` to the payload.
    fn to_payload(&self, payload: &mut Vec<u8>);
}

/// Decode a value from a payload buffer.
pub trait FromPayload: Sized {
    /// Decode a value starting at `*start`, advancing it past the consumed
    /// bytes.
    fn from_payload(start: &mut usize, payload: &[u8]) -> Result<Self, FrameError>;
}

pub(crate) fn take<'a>(start: &mut usize, payload: &'a [u8], len: usize) -> Result<&'a [u8], FrameError> {
    if payload.len() < *start + len {
        return Err(FrameError::Truncated {
            needed: len,
            at: *start,
        });
    }
    let bytes = &payload[*start..*start + len];
    *start += len;
    Ok(bytes)
}

pub(crate) fn write_u8(payload: &mut Vec<u8>, value: u8) {
    payload.push(value);
}

pub(crate) fn read_u8(start: &mut usize, payload: &[u8]) -> Result<u8, FrameError> {
    Ok(take(start, payload, 1)?[0])
}

pub(crate) fn write_u16(payload: &mut Vec<u8>, value: u16) {
    payload.extend(&value.to_be_bytes());
}

pub(crate) fn read_u16(start: &mut usize, payload: &[u8]) -> Result<u16, FrameError> {
    let bytes = take(start, payload, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn write_i32(payload: &mut Vec<u8>, value: i32) {
    payload.extend(&value.to_be_bytes());
}

pub(crate) fn read_i32(start: &mut usize, payload: &[u8]) -> Result<i32, FrameError> {
    let bytes = take(start, payload, 4)?;
    Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn write_u32(payload: &mut Vec<u8>, value: u32) {
    payload.extend(&value.to_be_bytes());
}

pub(crate) fn read_u32(start: &mut usize, payload: &[u8]) -> Result<u32, FrameError> {
    let bytes = take(start, payload, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn write_u64(payload: &mut Vec<u8>, value: u64) {
    payload.extend(&value.to_be_bytes());
}

pub(crate) fn read_u64(start: &mut usize, payload: &[u8]) -> Result<u64, FrameError> {
    let bytes = take(start, payload, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(buf))
}

pub(crate) fn write_string(payload: &mut Vec<u8>, value: &str) {
    write_u16(payload, value.len() as u16);
    payload.extend(value.as_bytes());
}

pub(crate) fn read_string(start: &mut usize, payload: &[u8]) -> Result<String, FrameError> {
    let len = read_u16(start, payload)? as usize;
    let bytes = take(start, payload, len)?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut payload = Vec::new();
        write_u16(&mut payload, 0xBEEF);
        write_i32(&mut payload, -7);
        write_u64(&mut payload, u64::MAX - 1);
        write_string(&mut payload, "hive");
        let mut start = 0;
        assert_eq!(read_u16(&mut start, &payload).unwrap(), 0xBEEF);
        assert_eq!(read_i32(&mut start, &payload).unwrap(), -7);
        assert_eq!(read_u64(&mut start, &payload).unwrap(), u64::MAX - 1);
        assert_eq!(read_string(&mut start, &payload).unwrap(), "hive");
        assert_eq!(start, payload.len());
    }

    #[test]
    fn truncated_reads_are_rejected() {
        let payload = vec![0u8; 3];
        let mut start = 0;
        assert!(matches!(
            read_i32(&mut start, &payload),
            Err(FrameError::Truncated { .. })
        ));
    }
}
