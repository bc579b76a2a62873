// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module computes the pending ranges of a keyspace: for every range
//! affected by an in-flight bootstrap, leave or move, the endpoints that will
//! come to own it. Over-approximating is safe (extra writes compact away);
//! under-approximating loses writes, so the calculation unions every
//! conceivable post-transition ownership.

use super::{
    EndpointId,
    Range,
    Token,
    TokenMap,
};
use crate::app::strategy::ReplicationStrategy;
use std::collections::{
    BTreeMap,
    BTreeSet,
    HashMap,
};

/// The pending destinations of every in-flight range of one keyspace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingRanges {
    ranges: BTreeMap<Range, BTreeSet<EndpointId>>,
}

impl PendingRanges {
    fn insert(&mut self, range: Range, endpoint: EndpointId) {
        self.ranges.entry(range).or_default().insert(endpoint);
    }
    /// Whether no range is in flight.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
    /// Iterate over ranges and their pending destinations.
    pub fn iter(&self) -> impl Iterator<Item = (&Range, &BTreeSet<EndpointId>)> {
        self.ranges.iter()
    }
    /// The pending destinations of the range covering `token`.
    pub fn pending_endpoints_for(&self, token: Token) -> Vec<EndpointId> {
        let mut endpoints = BTreeSet::new();
        for (range, destinations) in &self.ranges {
            if range.contains_token(token) {
                endpoints.extend(destinations.iter().cloned());
            }
        }
        endpoints.into_iter().collect()
    }
}

/// Compute the pending ranges for one keyspace from snapshots of the ring
/// inputs. Deterministic for a given set of inputs.
pub(crate) fn calculate_pending_ranges(
    strategy: &dyn ReplicationStrategy,
    metadata: &TokenMap,
    bootstrap_tokens: &BTreeMap<Token, EndpointId>,
    leaving: &BTreeSet<EndpointId>,
    moving: &BTreeMap<EndpointId, Token>,
) -> PendingRanges {
    let mut pending = PendingRanges::default();
    if bootstrap_tokens.is_empty() && leaving.is_empty() && moving.is_empty() {
        return pending;
    }
    let address_ranges = strategy.address_ranges(metadata);

    // the ring once every leaving endpoint has left
    let mut all_left = metadata.clone();
    for endpoint in leaving {
        all_left.remove_endpoint(endpoint);
    }

    // ranges owned by a leaving endpoint migrate to whoever replicates them
    // once the leavers are gone
    let mut affected: BTreeSet<Range> = BTreeSet::new();
    for endpoint in leaving {
        if let Some(ranges) = address_ranges.get(endpoint) {
            affected.extend(ranges.iter().copied());
        }
    }
    for range in affected {
        let current: BTreeSet<_> = strategy
            .calculate_natural_endpoints(range.right, metadata)
            .into_iter()
            .collect();
        let after: BTreeSet<_> = strategy
            .calculate_natural_endpoints(range.right, &all_left)
            .into_iter()
            .collect();
        for endpoint in after.difference(&current) {
            pending.insert(range, endpoint.clone());
        }
    }

    // each bootstrapping endpoint is inserted alone into the post-leave ring;
    // every range it then replicates is pending for it
    let mut bootstrapping: HashMap<&EndpointId, Vec<Token>> = HashMap::new();
    for (token, endpoint) in bootstrap_tokens {
        bootstrapping.entry(endpoint).or_default().push(*token);
    }
    let mut bootstrappers: Vec<_> = bootstrapping.into_iter().collect();
    bootstrappers.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (endpoint, tokens) in bootstrappers {
        all_left.update_normal_tokens(endpoint, &tokens);
        for range in strategy
            .address_ranges(&all_left)
            .remove(endpoint)
            .unwrap_or_default()
        {
            pending.insert(range, endpoint.clone());
        }
        all_left.remove_endpoint(endpoint);
    }

    // each moving endpoint gains the ranges it replicates at its new token
    // but not at its old one
    for (endpoint, new_token) in moving {
        let before: BTreeSet<Range> = strategy
            .address_ranges(&all_left)
            .remove(endpoint)
            .unwrap_or_default()
            .into_iter()
            .collect();
        let mut moved = all_left.clone();
        moved.update_normal_tokens(endpoint, &[*new_token]);
        let after: BTreeSet<Range> = strategy
            .address_ranges(&moved)
            .remove(endpoint)
            .unwrap_or_default()
            .into_iter()
            .collect();
        for range in after.difference(&before) {
            pending.insert(*range, endpoint.clone());
        }
    }
    pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{
        endpoint::HostId,
        ring::TokenRing,
        strategy::SimpleStrategy,
    };

    fn endpoint(last: u8) -> EndpointId {
        EndpointId::new(
            HostId::from_u64_pair(last as u64, 0),
            format!("127.0.0.{}:7000", last).parse().unwrap(),
        )
    }

    fn calc(ring: &TokenRing, strategy: &dyn ReplicationStrategy) -> PendingRanges {
        ring.calculate_pending_ranges(strategy, "ks");
        (*ring.pending_ranges("ks").unwrap()).clone()
    }

    #[test]
    fn quiescent_ring_has_no_pending_ranges() {
        let ring = TokenRing::new();
        ring.update_normal_tokens(&endpoint(1), &[10]);
        let pending = calc(&ring, &SimpleStrategy::new(1));
        assert!(pending.is_empty());
    }

    #[test]
    fn bootstrap_pends_the_ranges_the_joiner_will_replicate() {
        let ring = TokenRing::new();
        ring.update_normal_tokens(&endpoint(1), &[10]);
        ring.update_normal_tokens(&endpoint(2), &[20]);
        ring.update_normal_tokens(&endpoint(3), &[30]);
        ring.add_bootstrap_tokens(&[15], &endpoint(4), None).unwrap();
        let pending = calc(&ring, &SimpleStrategy::new(1));
        // with rf 1 the joiner takes over exactly (10, 15]
        let entries: Vec<_> = pending.iter().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(*entries[0].0, Range::new(10, 15));
        assert!(entries[0].1.contains(&endpoint(4)));
        assert_eq!(pending.pending_endpoints_for(12), vec![endpoint(4)]);
        assert!(pending.pending_endpoints_for(18).is_empty());
    }

    #[test]
    fn leaving_pends_ranges_toward_the_survivors() {
        let ring = TokenRing::new();
        ring.update_normal_tokens(&endpoint(1), &[10]);
        ring.update_normal_tokens(&endpoint(2), &[20]);
        ring.update_normal_tokens(&endpoint(3), &[30]);
        ring.add_leaving_endpoint(&endpoint(2));
        let pending = calc(&ring, &SimpleStrategy::new(2));
        // every range endpoint 2 replicated must gain a new replica
        let mut destinations = BTreeSet::new();
        for (_, endpoints) in pending.iter() {
            destinations.extend(endpoints.iter().cloned());
        }
        assert!(!pending.is_empty());
        assert!(!destinations.contains(&endpoint(2)));
    }

    #[test]
    fn simultaneous_bootstraps_are_deterministic_and_union_both_joiners() {
        // ring a@10, c@30, e@50 with rf 3; d joins between c and e, b between
        // a and c
        let ring = TokenRing::new();
        ring.update_normal_tokens(&endpoint(1), &[10]);
        ring.update_normal_tokens(&endpoint(3), &[30]);
        ring.update_normal_tokens(&endpoint(5), &[50]);
        ring.add_bootstrap_tokens(&[40], &endpoint(4), None).unwrap();
        ring.add_bootstrap_tokens(&[20], &endpoint(2), None).unwrap();
        let strategy = SimpleStrategy::new(3);
        let first = calc(&ring, &strategy);
        let second = calc(&ring, &strategy);
        assert_eq!(first, second);
        // with rf 3 over three settled nodes, each joiner replicates every
        // range it can see, so both appear as destinations
        let mut destinations = BTreeSet::new();
        for (_, endpoints) in first.iter() {
            destinations.extend(endpoints.iter().cloned());
        }
        assert!(destinations.contains(&endpoint(2)));
        assert!(destinations.contains(&endpoint(4)));
        // every pending destination set only ever adds endpoints that were
        // not already natural replicas
        let map = ring.clone_only_token_map();
        for (range, endpoints) in first.iter() {
            let natural: BTreeSet<_> = strategy
                .calculate_natural_endpoints(range.right, &map)
                .into_iter()
                .collect();
            for endpoint in endpoints {
                assert!(!natural.contains(endpoint), "{} already natural for {}", endpoint, range);
            }
        }
    }

    #[test]
    fn moving_pends_only_newly_gained_ranges() {
        let ring = TokenRing::new();
        ring.update_normal_tokens(&endpoint(1), &[10]);
        ring.update_normal_tokens(&endpoint(2), &[20]);
        ring.update_normal_tokens(&endpoint(3), &[30]);
        ring.add_moving_endpoint(25, &endpoint(1));
        let pending = calc(&ring, &SimpleStrategy::new(1));
        // at token 25 the mover newly covers (20, 25]
        let ranges: Vec<_> = pending.iter().map(|(r, _)| *r).collect();
        assert_eq!(ranges, vec![Range::new(20, 25)]);
        assert_eq!(pending.pending_endpoints_for(23), vec![endpoint(1)]);
    }
}
