// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module projects gossiped application state into the ring metadata:
//! STATUS transitions drive the bootstrap, normal, leaving, moving and
//! replacement views, DC and RACK drive the topology, and every mutation
//! refreshes the pending ranges of the registered keyspaces.

use super::{
    StateConflict,
    Token,
    TokenRing,
};
use crate::app::{
    endpoint::EndpointId,
    gossip::EventSubscriber,
    state::{
        parse_tokens,
        AppStateKey,
        EndpointState,
        Status,
        VersionedValue,
    },
    strategy::ReplicationStrategy,
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        RwLock,
    },
};

#[derive(Default)]
struct PeerProjection {
    dc: Option<String>,
    rack: Option<String>,
    tokens: Option<Vec<Token>>,
    status: Option<String>,
    status_with_port: Option<String>,
}

impl PeerProjection {
    fn status(&self) -> Option<Status> {
        let value = self.status_with_port.as_ref().or(self.status.as_ref())?;
        Status::parse(value).ok()
    }
}

/// The gossip subscriber that keeps [`TokenRing`] in sync with cluster state.
/// Projections are idempotent; notifications may arrive in any order.
pub struct RingUpdater {
    ring: Arc<TokenRing>,
    local: EndpointId,
    peers: Mutex<HashMap<EndpointId, PeerProjection>>,
    strategies: RwLock<HashMap<String, Box<dyn ReplicationStrategy>>>,
}

impl RingUpdater {
    /// Create an updater over the ring.
    pub fn new(ring: Arc<TokenRing>, local: EndpointId) -> Self {
        Self {
            ring,
            local,
            peers: Mutex::new(HashMap::new()),
            strategies: RwLock::new(HashMap::new()),
        }
    }
    /// Register a keyspace whose pending ranges follow every ring change.
    pub fn register_keyspace(&self, keyspace: &str, strategy: Box<dyn ReplicationStrategy>) {
        self.strategies
            .write()
            .expect("strategy lock poisoned")
            .insert(keyspace.to_string(), strategy);
        self.recalculate_pending();
    }
    /// The ring this updater maintains.
    pub fn ring(&self) -> &Arc<TokenRing> {
        &self.ring
    }
    fn recalculate_pending(&self) {
        let strategies = self.strategies.read().expect("strategy lock poisoned");
        for (keyspace, strategy) in strategies.iter() {
            self.ring.calculate_pending_ranges(strategy.as_ref(), keyspace);
        }
    }
    fn record(&self, endpoint: &EndpointId, key: AppStateKey, value: &VersionedValue) -> bool {
        let mut peers = self.peers.lock().expect("peer lock poisoned");
        let projection = peers.entry(endpoint.clone()).or_default();
        match key {
            AppStateKey::Dc => projection.dc = Some(value.value.clone()),
            AppStateKey::Rack => projection.rack = Some(value.value.clone()),
            AppStateKey::Tokens => projection.tokens = parse_tokens(&value.value).ok(),
            AppStateKey::Status => projection.status = Some(value.value.clone()),
            AppStateKey::StatusWithPort => projection.status_with_port = Some(value.value.clone()),
            _ => return false,
        }
        true
    }
    /// Re-derive the ring view of one endpoint from its cached projection.
    fn project(&self, endpoint: &EndpointId) {
        let (location, tokens, status) = {
            let peers = self.peers.lock().expect("peer lock poisoned");
            let projection = match peers.get(endpoint) {
                Some(projection) => projection,
                None => return,
            };
            (
                projection.dc.clone().zip(projection.rack.clone()),
                projection.tokens.clone().unwrap_or_default(),
                projection.status(),
            )
        };
        if let Some((dc, rack)) = location {
            self.ring.update_topology(endpoint, &dc, &rack);
        }
        match status {
            Some(Status::Bootstrapping { .. }) => {
                if let Err(conflict) = self.ring.add_bootstrap_tokens(&tokens, endpoint, None) {
                    log::error!("Rejecting bootstrap of {}: {}", endpoint, conflict);
                    return;
                }
            }
            Some(Status::BootstrappingReplace { replaced }) => {
                let original = self.ring.clone_only_token_map().endpoint_by_host_id(replaced).cloned();
                match original {
                    Some(original) => {
                        if let Err(conflict) = self.ring.add_bootstrap_tokens(
                            &self.ring.tokens_of(&original),
                            endpoint,
                            Some(&original),
                        ) {
                            log::error!("Rejecting replacement by {}: {}", endpoint, conflict);
                            return;
                        }
                    }
                    None => {
                        log::error!("{} claims to replace unknown host id {}", endpoint, replaced);
                        return;
                    }
                }
            }
            Some(Status::Normal { .. }) => {
                if tokens.is_empty() {
                    log::warn!("Ignoring NORMAL status of {} without tokens", endpoint);
                    return;
                }
                // a host id may only settle once per cluster
                let collision = self
                    .ring
                    .clone_only_token_map()
                    .endpoint_by_host_id(endpoint.host_id())
                    .filter(|existing| *existing != endpoint)
                    .cloned();
                if let Some(existing) = collision {
                    let conflict = StateConflict::HostIdCollision {
                        host_id: endpoint.host_id(),
                        endpoint: existing,
                    };
                    log::error!("Rejecting NORMAL status of {}: {}", endpoint, conflict);
                    return;
                }
                self.ring.update_normal_tokens(endpoint, &tokens);
            }
            Some(Status::Leaving { .. }) => {
                self.ring.add_leaving_endpoint(endpoint);
            }
            Some(Status::Left { .. }) | Some(Status::RemovedToken { .. }) => {
                self.ring.remove_endpoint(endpoint);
            }
            Some(Status::Moving { token }) => {
                self.ring.add_moving_endpoint(token, endpoint);
            }
            Some(Status::RemovingToken) | Some(Status::Shutdown) | Some(Status::Hibernate) | None => {}
        }
        self.recalculate_pending();
    }
}

impl EventSubscriber for RingUpdater {
    fn on_join(&self, endpoint: &EndpointId, state: &EndpointState) {
        let snapshot = state.application_states();
        let mut relevant = false;
        for (key, value) in snapshot.iter() {
            relevant |= self.record(endpoint, *key, value);
        }
        if relevant {
            self.project(endpoint);
        }
    }
    fn on_change(&self, endpoint: &EndpointId, key: AppStateKey, value: &VersionedValue) {
        if self.record(endpoint, key, value) {
            self.project(endpoint);
        }
    }
    fn on_remove(&self, endpoint: &EndpointId) {
        if *endpoint == self.local {
            return;
        }
        self.peers.lock().expect("peer lock poisoned").remove(endpoint);
        self.ring.remove_endpoint(endpoint);
        self.recalculate_pending();
    }
}
