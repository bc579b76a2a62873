// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module implements the shadow round: a pre-join gossip exchange that
//! collects cluster state from the seeds without advertising the local node.

use super::Gossiper;
use crate::{
    app::{
        endpoint::{
            EndpointId,
            HostId,
        },
        state::EndpointState,
    },
    wire::{
        GossipDigestSyn,
        Message,
    },
};
use std::collections::HashMap;
use thiserror::Error;

/// A failed shadow round; fatal to node startup for non-seeds.
#[derive(Error, Debug)]
pub enum ShadowRoundError {
    /// No seed replied within the allotted window.
    #[error("unable to gossip with any peers within {0} milliseconds")]
    Unfinished(u128),
}

/// The collection state of an in-flight shadow round.
#[derive(Default)]
pub struct ShadowRound {
    in_progress: bool,
    responded: bool,
    states: HashMap<EndpointId, EndpointState>,
}

impl ShadowRound {
    /// Whether a shadow round is collecting.
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }
    pub(crate) fn begin(&mut self) {
        self.in_progress = true;
        self.responded = false;
        self.states.clear();
    }
    /// Fold a seed's reply into the collected map.
    pub(crate) fn collect(&mut self, from: &EndpointId, states: Vec<(EndpointId, EndpointState)>) {
        log::debug!("Received a shadow round reply from {}", from);
        self.responded = true;
        for (endpoint, state) in states {
            self.states.insert(endpoint, state);
        }
    }
    fn finish(&mut self) -> HashMap<EndpointId, EndpointState> {
        self.in_progress = false;
        std::mem::take(&mut self.states)
    }
}

impl Gossiper {
    /// Collect existing cluster state from the seeds without exposing the
    /// local node: empty SYNs are sent every interval until any seed answers
    /// with a full ack. Seeds may finish empty handed after `ring_delay`; a
    /// non-seed that hears nothing within twice that fails fatally.
    ///
    /// The engine loop must be running so replies are routed here.
    pub async fn do_shadow_round(&self) -> Result<HashMap<EndpointId, EndpointState>, ShadowRoundError> {
        let seeds = self.seeds();
        if seeds.is_empty() {
            // the first node of a fresh cluster has nobody to ask
            return Ok(HashMap::new());
        }
        self.shadow.lock().expect("shadow lock poisoned").begin();
        let deadline = if self.local_is_seed() {
            self.ring_delay()
        } else {
            self.ring_delay() * 2
        };
        let started = tokio::time::Instant::now();
        log::info!("Starting shadow gossip round, seeds {:?}", seeds);
        loop {
            let probes = seeds
                .iter()
                .map(|seed| {
                    (
                        EndpointId::new(HostId::nil(), *seed),
                        Message::Syn(GossipDigestSyn {
                            cluster_name: self.cluster_name().to_string(),
                            partitioner_name: self.partitioner_name().to_string(),
                            digests: Vec::new(),
                        }),
                    )
                })
                .collect();
            self.dispatch(probes).await;
            let _ = tokio::time::timeout(self.interval(), self.shadow_notify.notified()).await;
            let mut shadow = self.shadow.lock().expect("shadow lock poisoned");
            if shadow.responded {
                log::info!("Shadow round complete with {} endpoint states", shadow.states.len());
                return Ok(shadow.finish());
            }
            if started.elapsed() >= deadline {
                if self.local_is_seed() {
                    log::info!("Shadow round finished empty; this seed is starting a fresh cluster");
                    return Ok(shadow.finish());
                }
                shadow.in_progress = false;
                return Err(ShadowRoundError::Unfinished(deadline.as_millis()));
            }
        }
    }
}
