// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]
//! The cluster membership core: gossip, failure detection, ring metadata and
//! range stream planning, wired together by [`cluster::Cluster`].

/// The composition root wiring the engine and its collaborators
pub mod cluster;
/// The phi accrual failure detector
pub mod detector;
/// Canonical endpoint identity
pub mod endpoint;
/// The anti-entropy gossip engine
pub mod gossip;
/// Token ring metadata and pending ranges
pub mod ring;
/// Proximity lookups
pub mod snitch;
/// Versioned per-endpoint state
pub mod state;
/// Persistence collaborators
pub mod store;
/// Replication strategies
pub mod strategy;
/// The range streaming planner
pub mod stream;

pub use cluster::Cluster;

use serde::{
    Deserialize,
    Serialize,
};
use std::{
    net::SocketAddr,
    time::Duration,
};

/// Static node configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HiveConfig {
    /// The cluster name; strays from other clusters are rejected.
    pub cluster_name: String,
    /// The gossip broadcast address of this node.
    pub broadcast_address: SocketAddr,
    /// The seed addresses anchoring convergence.
    pub seeds: Vec<SocketAddr>,
    /// Milliseconds between gossip rounds.
    pub gossip_interval_ms: u64,
    /// The basic settling time for ring transitions, in milliseconds.
    pub ring_delay_ms: u64,
    /// The failure detector conviction threshold.
    pub phi_convict_threshold: f64,
    /// Grace period between the shutdown announcement and engine stop, in
    /// milliseconds.
    pub shutdown_grace_ms: u64,
    /// The datacenter this node advertises.
    pub local_datacenter: String,
    /// The rack this node advertises.
    pub local_rack: String,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            cluster_name: "hive cluster".to_string(),
            broadcast_address: ([127, 0, 0, 1], 7000).into(),
            seeds: Vec::new(),
            gossip_interval_ms: 1000,
            ring_delay_ms: 30_000,
            phi_convict_threshold: 8.0,
            shutdown_grace_ms: 2000,
            local_datacenter: "datacenter1".to_string(),
            local_rack: "rack1".to_string(),
        }
    }
}

impl HiveConfig {
    /// Start building a configuration.
    pub fn builder() -> HiveConfigBuilder {
        HiveConfigBuilder::default()
    }
    /// The interval between gossip rounds.
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }
    /// The basic settling time for ring transitions.
    pub fn ring_delay(&self) -> Duration {
        Duration::from_millis(self.ring_delay_ms)
    }
    /// The shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Builder for [`HiveConfig`].
#[derive(Default)]
pub struct HiveConfigBuilder {
    config: HiveConfig,
}

impl HiveConfigBuilder {
    /// Set the cluster name.
    pub fn cluster_name<N: Into<String>>(mut self, name: N) -> Self {
        self.config.cluster_name = name.into();
        self
    }
    /// Set the broadcast address.
    pub fn broadcast_address(mut self, address: SocketAddr) -> Self {
        self.config.broadcast_address = address;
        self
    }
    /// Set the seed addresses.
    pub fn seeds(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.config.seeds = seeds;
        self
    }
    /// Set the gossip interval in milliseconds.
    pub fn gossip_interval_ms(mut self, interval: u64) -> Self {
        self.config.gossip_interval_ms = interval;
        self
    }
    /// Set the ring delay in milliseconds.
    pub fn ring_delay_ms(mut self, ring_delay: u64) -> Self {
        self.config.ring_delay_ms = ring_delay;
        self
    }
    /// Set the conviction threshold.
    pub fn phi_convict_threshold(mut self, threshold: f64) -> Self {
        self.config.phi_convict_threshold = threshold;
        self
    }
    /// Set the shutdown grace in milliseconds.
    pub fn shutdown_grace_ms(mut self, grace: u64) -> Self {
        self.config.shutdown_grace_ms = grace;
        self
    }
    /// Set the advertised datacenter.
    pub fn local_datacenter<N: Into<String>>(mut self, dc: N) -> Self {
        self.config.local_datacenter = dc.into();
        self
    }
    /// Set the advertised rack.
    pub fn local_rack<N: Into<String>>(mut self, rack: N) -> Self {
        self.config.local_rack = rack.into();
        self
    }
    /// Finish the configuration.
    pub fn build(self) -> HiveConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = HiveConfig::builder()
            .cluster_name("test")
            .seeds(vec![([10, 0, 0, 1], 7000).into()])
            .gossip_interval_ms(100)
            .ring_delay_ms(500)
            .build();
        assert_eq!(config.cluster_name, "test");
        assert_eq!(config.gossip_interval(), Duration::from_millis(100));
        assert_eq!(config.ring_delay(), Duration::from_millis(500));
        assert_eq!(config.phi_convict_threshold, 8.0);
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = HiveConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let decoded: HiveConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.cluster_name, config.cluster_name);
        assert_eq!(decoded.broadcast_address, config.broadcast_address);
    }
}
