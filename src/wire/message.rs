// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module implements the framed gossip messages. A frame is a one byte
//! protocol version, a one byte verb and a big endian u32 body length,
//! followed by the body.

use super::{
    read_endpoint,
    read_string,
    read_u32,
    read_u8,
    write_endpoint,
    write_string,
    write_u32,
    write_u8,
    FrameError,
    FromPayload,
    ToPayload,
    Verb,
    PROTOCOL_VERSION,
};
use crate::app::{
    endpoint::EndpointId,
    state::EndpointState,
};
pub use super::state::GossipDigest;
use num_traits::FromPrimitive;

/// First phase of a gossip round: the sender's digest of every endpoint it
/// knows, plus the cluster and partitioner names used to reject strays. An
/// empty digest list marks a shadow round request.
#[derive(Clone, Debug)]
pub struct GossipDigestSyn {
    /// The sender's cluster name.
    pub cluster_name: String,
    /// The sender's partitioner name.
    pub partitioner_name: String,
    /// One digest per known endpoint, shuffled by the sender.
    pub digests: Vec<GossipDigest>,
}

/// Second phase: the digests the responder needs full or partial state for,
/// plus the states it already knows to be fresher than the sender's.
#[derive(Clone, Debug, Default)]
pub struct GossipDigestAck {
    /// Digests the responder requests state for.
    pub digests: Vec<GossipDigest>,
    /// States fresher on the responder's side.
    pub states: Vec<(EndpointId, EndpointState)>,
}

/// Third phase: the states requested by the ack.
#[derive(Clone, Debug, Default)]
pub struct GossipDigestAck2 {
    /// The requested states.
    pub states: Vec<(EndpointId, EndpointState)>,
}

/// A framed gossip message.
#[derive(Clone, Debug)]
pub enum Message {
    /// First phase of a round.
    Syn(GossipDigestSyn),
    /// Second phase of a round.
    Ack(GossipDigestAck),
    /// Third phase of a round.
    Ack2(GossipDigestAck2),
    /// One-way orderly shutdown announcement; the sender is the subject.
    Shutdown,
    /// Liveness probe.
    Echo,
    /// Liveness probe reply.
    EchoResponse,
}

fn write_digests(payload: &mut Vec<u8>, digests: &[GossipDigest]) {
    write_u32(payload, digests.len() as u32);
    for digest in digests {
        digest.to_payload(payload);
    }
}

fn read_digests(start: &mut usize, payload: &[u8]) -> Result<Vec<GossipDigest>, FrameError> {
    let count = read_u32(start, payload)?;
    (0..count).map(|_| GossipDigest::from_payload(start, payload)).collect()
}

fn write_states(payload: &mut Vec<u8>, states: &[(EndpointId, EndpointState)]) {
    write_u32(payload, states.len() as u32);
    for (endpoint, state) in states {
        write_endpoint(payload, endpoint, PROTOCOL_VERSION);
        state.to_payload(payload);
    }
}

fn read_states(start: &mut usize, payload: &[u8]) -> Result<Vec<(EndpointId, EndpointState)>, FrameError> {
    let count = read_u32(start, payload)?;
    (0..count)
        .map(|_| {
            let endpoint = read_endpoint(start, payload)?;
            let state = EndpointState::from_payload(start, payload)?;
            Ok((endpoint, state))
        })
        .collect()
}

impl Message {
    /// The verb of this message.
    pub fn verb(&self) -> Verb {
        match self {
            Message::Syn(_) => Verb::Syn,
            Message::Ack(_) => Verb::Ack,
            Message::Ack2(_) => Verb::Ack2,
            Message::Shutdown => Verb::Shutdown,
            Message::Echo => Verb::Echo,
            Message::EchoResponse => Verb::EchoResponse,
        }
    }
    /// Encode the message into a framed byte vector.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Message::Syn(syn) => {
                write_string(&mut body, &syn.cluster_name);
                write_string(&mut body, &syn.partitioner_name);
                write_digests(&mut body, &syn.digests);
            }
            Message::Ack(ack) => {
                write_digests(&mut body, &ack.digests);
                write_states(&mut body, &ack.states);
            }
            Message::Ack2(ack2) => {
                write_states(&mut body, &ack2.states);
            }
            Message::Shutdown | Message::Echo | Message::EchoResponse => {}
        }
        let mut frame = Vec::with_capacity(6 + body.len());
        write_u8(&mut frame, PROTOCOL_VERSION);
        write_u8(&mut frame, self.verb() as u8);
        write_u32(&mut frame, body.len() as u32);
        frame.extend(body);
        frame
    }
    /// Decode a framed message.
    pub fn from_frame(frame: &[u8]) -> Result<Self, FrameError> {
        let mut start = 0;
        let version = read_u8(&mut start, frame)?;
        if version > PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let verb_byte = read_u8(&mut start, frame)?;
        let verb = Verb::from_u8(verb_byte).ok_or(FrameError::UnknownVerb(verb_byte))?;
        let body_len = read_u32(&mut start, frame)? as usize;
        if frame.len() < start + body_len {
            return Err(FrameError::Truncated {
                needed: body_len,
                at: start,
            });
        }
        Ok(match verb {
            Verb::Syn => {
                let cluster_name = read_string(&mut start, frame)?;
                let partitioner_name = read_string(&mut start, frame)?;
                let digests = read_digests(&mut start, frame)?;
                Message::Syn(GossipDigestSyn {
                    cluster_name,
                    partitioner_name,
                    digests,
                })
            }
            Verb::Ack => {
                let digests = read_digests(&mut start, frame)?;
                let states = read_states(&mut start, frame)?;
                Message::Ack(GossipDigestAck { digests, states })
            }
            Verb::Ack2 => {
                let states = read_states(&mut start, frame)?;
                Message::Ack2(GossipDigestAck2 { states })
            }
            Verb::Shutdown => Message::Shutdown,
            Verb::Echo => Message::Echo,
            Verb::EchoResponse => Message::EchoResponse,
        })
    }
}
