// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module defines the proximity capability consumed by the replication
//! strategies and the streaming planner.

use crate::app::endpoint::EndpointId;
use std::{
    cmp::Ordering,
    collections::HashMap,
};

/// Datacenter, rack and proximity lookups.
pub trait Snitch: Send + Sync {
    /// The datacenter of an endpoint.
    fn datacenter(&self, endpoint: &EndpointId) -> String;
    /// The rack of an endpoint.
    fn rack(&self, endpoint: &EndpointId) -> String;
    /// Order two endpoints by proximity to the target.
    fn compare_endpoints(&self, target: &EndpointId, a: &EndpointId, b: &EndpointId) -> Ordering;
    /// Sort endpoints in place by proximity to the target.
    fn sort_by_proximity(&self, target: &EndpointId, endpoints: &mut Vec<EndpointId>) {
        endpoints.sort_by(|a, b| self.compare_endpoints(target, a, b));
    }
    /// A proximity-sorted copy of the endpoints.
    fn sorted_by_proximity(&self, target: &EndpointId, mut endpoints: Vec<EndpointId>) -> Vec<EndpointId> {
        self.sort_by_proximity(target, &mut endpoints);
        endpoints
    }
    /// Invoked once when the gossip engine starts.
    fn gossiper_starting(&self) {}
    /// Whether merging the two restricted replica sets is worth it for a
    /// range query.
    fn is_worth_merging_for_range_query(
        &self,
        _merged: &[EndpointId],
        _left: &[EndpointId],
        _right: &[EndpointId],
    ) -> bool {
        true
    }
}

/// A topology blind snitch placing everything in one datacenter and rack and
/// ordering by endpoint identity.
#[derive(Clone, Debug, Default)]
pub struct SimpleSnitch;

impl Snitch for SimpleSnitch {
    fn datacenter(&self, _: &EndpointId) -> String {
        "datacenter1".to_string()
    }
    fn rack(&self, _: &EndpointId) -> String {
        "rack1".to_string()
    }
    fn compare_endpoints(&self, _: &EndpointId, a: &EndpointId, b: &EndpointId) -> Ordering {
        a.cmp(b)
    }
}

/// A snitch with explicitly pinned locations and proximity order; endpoints
/// earlier in the order are closer. Used to make planner behavior
/// reproducible in tests and simulations.
#[derive(Clone, Debug, Default)]
pub struct FixedSnitch {
    order: Vec<EndpointId>,
    locations: HashMap<EndpointId, (String, String)>,
}

impl FixedSnitch {
    /// Create a snitch with the given proximity order.
    pub fn new(order: Vec<EndpointId>) -> Self {
        Self {
            order,
            locations: HashMap::new(),
        }
    }
    /// Pin the datacenter and rack of an endpoint.
    pub fn with_location(mut self, endpoint: EndpointId, dc: &str, rack: &str) -> Self {
        self.locations.insert(endpoint, (dc.to_string(), rack.to_string()));
        self
    }
    fn position(&self, endpoint: &EndpointId) -> usize {
        self.order
            .iter()
            .position(|e| e == endpoint)
            .unwrap_or(self.order.len())
    }
}

impl Snitch for FixedSnitch {
    fn datacenter(&self, endpoint: &EndpointId) -> String {
        self.locations
            .get(endpoint)
            .map(|(dc, _)| dc.clone())
            .unwrap_or_else(|| "datacenter1".to_string())
    }
    fn rack(&self, endpoint: &EndpointId) -> String {
        self.locations
            .get(endpoint)
            .map(|(_, rack)| rack.clone())
            .unwrap_or_else(|| "rack1".to_string())
    }
    fn compare_endpoints(&self, _: &EndpointId, a: &EndpointId, b: &EndpointId) -> Ordering {
        self.position(a).cmp(&self.position(b)).then_with(|| a.cmp(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::endpoint::HostId;

    fn endpoint(last: u8) -> EndpointId {
        EndpointId::new(
            HostId::from_u64_pair(last as u64, 0),
            format!("127.0.0.{}:7000", last).parse().unwrap(),
        )
    }

    #[test]
    fn fixed_snitch_orders_by_pinned_proximity() {
        let snitch = FixedSnitch::new(vec![endpoint(3), endpoint(1)]);
        let sorted = snitch.sorted_by_proximity(&endpoint(9), vec![endpoint(1), endpoint(2), endpoint(3)]);
        assert_eq!(sorted, vec![endpoint(3), endpoint(1), endpoint(2)]);
    }

    #[test]
    fn simple_snitch_is_identity_ordered() {
        let snitch = SimpleSnitch;
        assert_eq!(snitch.datacenter(&endpoint(1)), "datacenter1");
        let sorted = snitch.sorted_by_proximity(&endpoint(9), vec![endpoint(2), endpoint(1)]);
        assert_eq!(sorted, vec![endpoint(1), endpoint(2)]);
    }
}
