// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module implements the codecs for heartbeat state, versioned values
//! and full endpoint states. Application state keys serialize as the ordinal
//! of the fixed enumeration; an unknown ordinal on read is fatal.

use super::{
    read_endpoint,
    read_i32,
    read_string,
    write_endpoint,
    write_i32,
    write_string,
    FrameError,
    FromPayload,
    ToPayload,
    PROTOCOL_VERSION,
};
use crate::app::state::{
    AppStateKey,
    EndpointState,
    HeartBeatState,
    VersionedValue,
};
use num_traits::FromPrimitive;

impl ToPayload for HeartBeatState {
    fn to_payload(&self, payload: &mut Vec<u8>) {
        write_i32(payload, self.generation);
        write_i32(payload, self.version);
    }
}

impl FromPayload for HeartBeatState {
    fn from_payload(start: &mut usize, payload: &[u8]) -> Result<Self, FrameError> {
        let generation = read_i32(start, payload)?;
        let version = read_i32(start, payload)?;
        Ok(Self { generation, version })
    }
}

impl ToPayload for VersionedValue {
    fn to_payload(&self, payload: &mut Vec<u8>) {
        write_string(payload, &self.value);
        write_i32(payload, self.version);
    }
}

impl FromPayload for VersionedValue {
    fn from_payload(start: &mut usize, payload: &[u8]) -> Result<Self, FrameError> {
        let value = read_string(start, payload)?;
        let version = read_i32(start, payload)?;
        Ok(Self { value, version })
    }
}

impl ToPayload for EndpointState {
    fn to_payload(&self, payload: &mut Vec<u8>) {
        self.heartbeat().to_payload(payload);
        let applications = self.application_states();
        let mut entries: Vec<_> = applications.iter().collect();
        entries.sort_by_key(|(key, _)| **key);
        write_i32(payload, entries.len() as i32);
        for (key, value) in entries {
            write_i32(payload, *key as i32);
            value.to_payload(payload);
        }
    }
}

impl FromPayload for EndpointState {
    fn from_payload(start: &mut usize, payload: &[u8]) -> Result<Self, FrameError> {
        let heartbeat = HeartBeatState::from_payload(start, payload)?;
        let state = EndpointState::new(heartbeat);
        let count = read_i32(start, payload)?;
        for _ in 0..count {
            let ordinal = read_i32(start, payload)?;
            let key = AppStateKey::from_i32(ordinal).ok_or(FrameError::UnknownStateKey(ordinal))?;
            let value = VersionedValue::from_payload(start, payload)?;
            state.add_application_state(key, value);
        }
        Ok(state)
    }
}

/// A compact summary of one endpoint's state: its generation and maximum
/// version, exchanged during the first two phases of a round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GossipDigest {
    /// The summarized endpoint.
    pub endpoint: crate::app::endpoint::EndpointId,
    /// Its generation.
    pub generation: i32,
    /// The maximum of its heartbeat and application versions.
    pub max_version: i32,
}

impl ToPayload for GossipDigest {
    fn to_payload(&self, payload: &mut Vec<u8>) {
        write_endpoint(payload, &self.endpoint, PROTOCOL_VERSION);
        write_i32(payload, self.generation);
        write_i32(payload, self.max_version);
    }
}

impl FromPayload for GossipDigest {
    fn from_payload(start: &mut usize, payload: &[u8]) -> Result<Self, FrameError> {
        let endpoint = read_endpoint(start, payload)?;
        let generation = read_i32(start, payload)?;
        let max_version = read_i32(start, payload)?;
        Ok(Self {
            endpoint,
            generation,
            max_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::endpoint::{
        EndpointId,
        HostId,
    };

    #[test]
    fn endpoint_state_round_trip_preserves_everything() {
        let state = EndpointState::new(HeartBeatState {
            generation: 1234,
            version: 56,
        });
        state.add_application_state(AppStateKey::Status, VersionedValue::new("NORMAL,10", 3));
        state.add_application_state(AppStateKey::StatusWithPort, VersionedValue::new("NORMAL,10", 4));
        state.add_application_state(AppStateKey::Tokens, VersionedValue::new("10;20;30", 5));
        let mut payload = Vec::new();
        state.to_payload(&mut payload);
        let mut start = 0;
        let decoded = EndpointState::from_payload(&mut start, &payload).unwrap();
        assert_eq!(start, payload.len());
        assert_eq!(decoded.heartbeat(), state.heartbeat());
        assert_eq!(*decoded.application_states(), *state.application_states());
    }

    #[test]
    fn unknown_ordinal_is_fatal() {
        let state = EndpointState::new(HeartBeatState::new(1));
        let mut payload = Vec::new();
        state.heartbeat().to_payload(&mut payload);
        write_i32(&mut payload, 1);
        write_i32(&mut payload, 9999);
        VersionedValue::new("x", 1).to_payload(&mut payload);
        let mut start = 0;
        assert!(matches!(
            EndpointState::from_payload(&mut start, &payload),
            Err(FrameError::UnknownStateKey(9999))
        ));
    }

    #[test]
    fn digest_round_trip() {
        let digest = GossipDigest {
            endpoint: EndpointId::new(HostId::random(), "10.0.0.1:7000".parse().unwrap()),
            generation: 77,
            max_version: 12,
        };
        let mut payload = Vec::new();
        digest.to_payload(&mut payload);
        let mut start = 0;
        assert_eq!(GossipDigest::from_payload(&mut start, &payload).unwrap(), digest);
    }
}
