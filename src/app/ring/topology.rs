// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module tracks which datacenter and rack every ring endpoint sits in.

use crate::app::endpoint::EndpointId;
use std::collections::{
    BTreeSet,
    HashMap,
};

/// The datacenter and rack layout of the ring membership.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    dc_endpoints: HashMap<String, BTreeSet<EndpointId>>,
    dc_racks: HashMap<String, HashMap<String, BTreeSet<EndpointId>>>,
    current_locations: HashMap<EndpointId, (String, String)>,
}

impl Topology {
    /// Create an empty topology.
    pub fn new() -> Self {
        Self::default()
    }
    /// Place an endpoint, relocating it if it was known elsewhere.
    pub fn add_endpoint(&mut self, endpoint: &EndpointId, dc: &str, rack: &str) {
        if let Some((current_dc, current_rack)) = self.current_locations.get(endpoint) {
            if current_dc == dc && current_rack == rack {
                return;
            }
        }
        self.remove_endpoint(endpoint);
        self.dc_endpoints
            .entry(dc.to_string())
            .or_default()
            .insert(endpoint.clone());
        self.dc_racks
            .entry(dc.to_string())
            .or_default()
            .entry(rack.to_string())
            .or_default()
            .insert(endpoint.clone());
        self.current_locations
            .insert(endpoint.clone(), (dc.to_string(), rack.to_string()));
    }
    /// Drop an endpoint and any emptied datacenter or rack buckets.
    pub fn remove_endpoint(&mut self, endpoint: &EndpointId) {
        let (dc, rack) = match self.current_locations.remove(endpoint) {
            Some(location) => location,
            None => return,
        };
        if let Some(endpoints) = self.dc_endpoints.get_mut(&dc) {
            endpoints.remove(endpoint);
            if endpoints.is_empty() {
                self.dc_endpoints.remove(&dc);
            }
        }
        if let Some(racks) = self.dc_racks.get_mut(&dc) {
            if let Some(endpoints) = racks.get_mut(&rack) {
                endpoints.remove(endpoint);
                if endpoints.is_empty() {
                    racks.remove(&rack);
                }
            }
            if racks.is_empty() {
                self.dc_racks.remove(&dc);
            }
        }
    }
    /// The datacenter and rack of an endpoint, if it was ever placed.
    pub fn location(&self, endpoint: &EndpointId) -> Option<(&str, &str)> {
        self.current_locations
            .get(endpoint)
            .map(|(dc, rack)| (dc.as_str(), rack.as_str()))
    }
    /// The endpoints of one datacenter.
    pub fn datacenter_endpoints(&self, dc: &str) -> Option<&BTreeSet<EndpointId>> {
        self.dc_endpoints.get(dc)
    }
    /// The rack buckets of one datacenter.
    pub fn datacenter_racks(&self, dc: &str) -> Option<&HashMap<String, BTreeSet<EndpointId>>> {
        self.dc_racks.get(dc)
    }
    /// All known datacenters.
    pub fn datacenters(&self) -> impl Iterator<Item = &String> {
        self.dc_endpoints.keys()
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
    fn relocation_moves_between_buckets() {
        let mut topology = Topology::new();
        let e = endpoint(1);
        topology.add_endpoint(&e, "dc1", "r1");
        assert_eq!(topology.location(&e), Some(("dc1", "r1")));
        topology.add_endpoint(&e, "dc2", "r9");
        assert_eq!(topology.location(&e), Some(("dc2", "r9")));
        assert!(topology.datacenter_endpoints("dc1").is_none());
        assert_eq!(topology.datacenter_racks("dc2").unwrap()["r9"].len(), 1);
    }

    #[test]
    fn removal_clears_empty_buckets() {
        let mut topology = Topology::new();
        let a = endpoint(1);
        let b = endpoint(2);
        topology.add_endpoint(&a, "dc1", "r1");
        topology.add_endpoint(&b, "dc1", "r2");
        topology.remove_endpoint(&a);
        assert!(topology.location(&a).is_none());
        assert_eq!(topology.datacenter_endpoints("dc1").unwrap().len(), 1);
        assert!(topology.datacenter_racks("dc1").unwrap().get("r1").is_none());
        topology.remove_endpoint(&b);
        assert!(topology.datacenters().next().is_none());
    }
}
