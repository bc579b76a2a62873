// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module defines the two persistence collaborators the core reads: the
//! peers table seeded into gossip at startup, and the record of token ranges
//! already streamed durably to this node.

use crate::app::{
    endpoint::HostId,
    ring::{
        Range,
        Token,
    },
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Mutex,
};

/// One row of the persisted peers table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRecord {
    /// The gossip broadcast address of the peer.
    pub address: SocketAddr,
    /// Its stable host id.
    pub host_id: HostId,
    /// The tokens it held when last seen.
    pub tokens: Vec<Token>,
    /// Its datacenter, if known.
    pub data_center: Option<String>,
    /// Its rack, if known.
    pub rack: Option<String>,
    /// The address this node prefers for reaching the peer.
    pub preferred: Option<SocketAddr>,
}

/// Read access to the persisted peers table. The core never writes it;
/// subscribers persist what gossip learns.
pub trait PeerStore: Send + Sync {
    /// The host id persisted for the local node, if any.
    fn local_host_id(&self) -> Option<HostId>;
    /// The persisted peer rows.
    fn load_peers(&self) -> Vec<PeerRecord>;
}

/// Records which token ranges have been durably received for each keyspace.
pub trait StateStore: Send + Sync {
    /// The ranges already present locally for a keyspace under the named
    /// partitioner.
    fn available_ranges(&self, keyspace: &str, partitioner: &str) -> Vec<Range>;
    /// Sink for ranges that finished streaming.
    fn ranges_received(&self, keyspace: &str, ranges: &[Range]);
}

/// An in-memory peers table.
#[derive(Default)]
pub struct MemoryPeerStore {
    local_host_id: Option<HostId>,
    peers: Mutex<Vec<PeerRecord>>,
}

impl MemoryPeerStore {
    /// Create a store with the given local host id and peer rows.
    pub fn new(local_host_id: Option<HostId>, peers: Vec<PeerRecord>) -> Self {
        Self {
            local_host_id,
            peers: Mutex::new(peers),
        }
    }
}

impl PeerStore for MemoryPeerStore {
    fn local_host_id(&self) -> Option<HostId> {
        self.local_host_id
    }
    fn load_peers(&self) -> Vec<PeerRecord> {
        self.peers.lock().expect("peer lock poisoned").clone()
    }
}

/// An in-memory range record.
#[derive(Default)]
pub struct MemoryStateStore {
    ranges: Mutex<HashMap<String, Vec<Range>>>,
}

impl MemoryStateStore {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn available_ranges(&self, keyspace: &str, _partitioner: &str) -> Vec<Range> {
        self.ranges
            .lock()
            .expect("range lock poisoned")
            .get(keyspace)
            .cloned()
            .unwrap_or_default()
    }
    fn ranges_received(&self, keyspace: &str, ranges: &[Range]) {
        self.ranges
            .lock()
            .expect("range lock poisoned")
            .entry(keyspace.to_string())
            .or_default()
            .extend_from_slice(ranges);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_state_store_accumulates_ranges() {
        let store = MemoryStateStore::new();
        assert!(store.available_ranges("ks", "Murmur3Partitioner").is_empty());
        store.ranges_received("ks", &[Range::new(1, 5)]);
        store.ranges_received("ks", &[Range::new(5, 9)]);
        assert_eq!(store.available_ranges("ks", "Murmur3Partitioner").len(), 2);
    }

    #[test]
    fn peer_records_serialize() {
        let record = PeerRecord {
            address: "10.0.0.1:7000".parse().unwrap(),
            host_id: HostId::random(),
            tokens: vec![1, 2],
            data_center: Some("dc1".into()),
            rack: None,
            preferred: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        let decoded: PeerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.address, record.address);
        assert_eq!(decoded.host_id, record.host_id);
        assert_eq!(decoded.tokens, record.tokens);
    }
}
