// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module defines the replication strategy capability the ring and the
//! streaming planner depend on, plus the two canonical strategies.

use crate::app::{
    endpoint::EndpointId,
    ring::{
        Range,
        Token,
        TokenMap,
    },
};
use dyn_clone::DynClone;
use std::collections::{
    HashMap,
    HashSet,
};

/// Maps tokens to their natural replica sets over a ring snapshot.
pub trait ReplicationStrategy: DynClone + Send + Sync {
    /// The ordered natural replicas of a token; the first is the primary.
    fn calculate_natural_endpoints(&self, token: Token, ring: &TokenMap) -> Vec<EndpointId>;
    /// The replication factor this strategy targets.
    fn replication_factor(&self) -> usize;
    /// Every range each endpoint replicates, derived from the ring snapshot.
    fn address_ranges(&self, ring: &TokenMap) -> HashMap<EndpointId, Vec<Range>> {
        let mut ranges: HashMap<EndpointId, Vec<Range>> = HashMap::new();
        for token in ring.sorted_tokens() {
            let range = ring.primary_range_for(*token);
            for endpoint in self.calculate_natural_endpoints(*token, ring) {
                ranges.entry(endpoint).or_default().push(range);
            }
        }
        ranges
    }
}

dyn_clone::clone_trait_object!(ReplicationStrategy);

/// Replicates each token range onto the next `replication_factor` distinct
/// endpoints along the ring, topology blind.
#[derive(Clone, Debug)]
pub struct SimpleStrategy {
    replication_factor: usize,
}

impl SimpleStrategy {
    /// Create a strategy with the given replication factor.
    pub fn new(replication_factor: usize) -> Self {
        Self { replication_factor }
    }
}

impl ReplicationStrategy for SimpleStrategy {
    fn calculate_natural_endpoints(&self, token: Token, ring: &TokenMap) -> Vec<EndpointId> {
        let mut replicas = Vec::new();
        if ring.sorted_tokens().is_empty() {
            return replicas;
        }
        for ring_token in ring.ring_iterator(token) {
            let owner = ring.owner(ring_token).expect("sorted token without owner");
            if !replicas.contains(owner) {
                replicas.push(owner.clone());
                if replicas.len() == self.replication_factor {
                    break;
                }
            }
        }
        replicas
    }
    fn replication_factor(&self) -> usize {
        self.replication_factor
    }
}

/// Replicates per datacenter, preferring one replica per rack and falling
/// back to already used racks only once every rack in the datacenter holds a
/// replica.
#[derive(Clone, Debug)]
pub struct NetworkTopologyStrategy {
    datacenter_factors: HashMap<String, usize>,
}

impl NetworkTopologyStrategy {
    /// Create a strategy from per-datacenter replica counts.
    pub fn new(datacenter_factors: HashMap<String, usize>) -> Self {
        Self { datacenter_factors }
    }
}

impl ReplicationStrategy for NetworkTopologyStrategy {
    fn calculate_natural_endpoints(&self, token: Token, ring: &TokenMap) -> Vec<EndpointId> {
        let mut replicas: Vec<EndpointId> = Vec::new();
        if ring.sorted_tokens().is_empty() {
            return replicas;
        }
        let topology = ring.topology();
        let mut chosen_per_dc: HashMap<&str, usize> = HashMap::new();
        let mut seen_racks: HashMap<&str, HashSet<&str>> = HashMap::new();
        let mut skipped: HashMap<&str, Vec<(EndpointId, usize)>> = HashMap::new();
        let mut slot = 0usize;
        for ring_token in ring.ring_iterator(token) {
            let owner = ring.owner(ring_token).expect("sorted token without owner");
            if replicas.contains(owner) {
                continue;
            }
            let (dc, rack) = match topology.location(owner) {
                Some(location) => location,
                None => continue,
            };
            let wanted = match self.datacenter_factors.get(dc) {
                Some(wanted) => *wanted,
                None => continue,
            };
            if chosen_per_dc.get(dc).copied().unwrap_or(0) >= wanted {
                continue;
            }
            let rack_count = topology.datacenter_racks(dc).map(|racks| racks.len()).unwrap_or(0);
            let seen = seen_racks.entry(dc).or_default();
            if seen.contains(rack) && seen.len() < rack_count {
                // rack already replicated while unseen racks remain
                skipped.entry(dc).or_default().push((owner.clone(), slot));
                slot += 1;
                continue;
            }
            seen.insert(rack);
            replicas.push(owner.clone());
            *chosen_per_dc.entry(dc).or_default() += 1;
            slot += 1;
        }
        // fill remaining quota from skipped same-rack candidates, in walk order
        for (dc, wanted) in &self.datacenter_factors {
            let mut candidates = skipped.remove(dc.as_str()).unwrap_or_default();
            candidates.sort_by_key(|(_, slot)| *slot);
            for (endpoint, _) in candidates {
                if chosen_per_dc.get(dc.as_str()).copied().unwrap_or(0) >= *wanted {
                    break;
                }
                if !replicas.contains(&endpoint) {
                    replicas.push(endpoint);
                    *chosen_per_dc.entry(dc.as_str()).or_default() += 1;
                }
            }
        }
        replicas
    }
    fn replication_factor(&self) -> usize {
        self.datacenter_factors.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{
        endpoint::HostId,
        ring::TokenRing,
    };
    use maplit::hashmap;

    fn endpoint(last: u8) -> EndpointId {
        EndpointId::new(
            HostId::from_u64_pair(last as u64, 0),
            format!("127.0.0.{}:7000", last).parse().unwrap(),
        )
    }

    fn three_node_map() -> TokenMap {
        let ring = TokenRing::new();
        ring.update_normal_tokens(&endpoint(1), &[10]);
        ring.update_normal_tokens(&endpoint(2), &[20]);
        ring.update_normal_tokens(&endpoint(3), &[30]);
        (*ring.clone_only_token_map()).clone()
    }

    #[test]
    fn simple_strategy_walks_the_ring() {
        let map = three_node_map();
        let strategy = SimpleStrategy::new(2);
        assert_eq!(
            strategy.calculate_natural_endpoints(15, &map),
            vec![endpoint(2), endpoint(3)]
        );
        // wraps past the largest token
        assert_eq!(
            strategy.calculate_natural_endpoints(25, &map),
            vec![endpoint(3), endpoint(1)]
        );
        // an oversized factor returns every endpoint once
        assert_eq!(SimpleStrategy::new(9).calculate_natural_endpoints(15, &map).len(), 3);
    }

    #[test]
    fn address_ranges_cover_every_token() {
        let map = three_node_map();
        let strategy = SimpleStrategy::new(3);
        let ranges = strategy.address_ranges(&map);
        for e in [endpoint(1), endpoint(2), endpoint(3)] {
            assert_eq!(ranges[&e].len(), 3);
        }
    }

    #[test]
    fn network_topology_prefers_distinct_racks() {
        let ring = TokenRing::new();
        for (last, token, rack) in [(1u8, 10, "r1"), (2, 20, "r1"), (3, 30, "r2")] {
            let e = endpoint(last);
            ring.update_topology(&e, "dc1", rack);
            ring.update_normal_tokens(&e, &[token]);
        }
        let map = (*ring.clone_only_token_map()).clone();
        let strategy = NetworkTopologyStrategy::new(hashmap! {"dc1".to_string() => 2});
        // walking from 5: endpoint 1 (r1) accepted, endpoint 2 (r1) skipped in
        // favor of the unseen r2, endpoint 3 (r2) accepted
        assert_eq!(
            strategy.calculate_natural_endpoints(5, &map),
            vec![endpoint(1), endpoint(3)]
        );
        // rf 3 falls back to the skipped same-rack endpoint
        let strategy = NetworkTopologyStrategy::new(hashmap! {"dc1".to_string() => 3});
        assert_eq!(
            strategy.calculate_natural_endpoints(5, &map),
            vec![endpoint(1), endpoint(3), endpoint(2)]
        );
    }

    #[test]
    fn network_topology_respects_per_dc_quotas() {
        let ring = TokenRing::new();
        for (last, token, dc) in [(1u8, 10, "dc1"), (2, 20, "dc2"), (3, 30, "dc1"), (4, 40, "dc2")] {
            let e = endpoint(last);
            ring.update_topology(&e, dc, "r1");
            ring.update_normal_tokens(&e, &[token]);
        }
        let map = (*ring.clone_only_token_map()).clone();
        let strategy = NetworkTopologyStrategy::new(hashmap! {
            "dc1".to_string() => 1,
            "dc2".to_string() => 2,
        });
        let replicas = strategy.calculate_natural_endpoints(5, &map);
        assert_eq!(replicas.len(), 3);
        assert!(replicas.contains(&endpoint(1)));
        assert!(replicas.contains(&endpoint(2)));
        assert!(replicas.contains(&endpoint(4)));
    }
}
