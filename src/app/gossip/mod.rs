// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module implements the anti-entropy gossip engine: the periodic
//! SYN/ACK/ACK2 reconciliation rounds, the authoritative merge rules for
//! remote endpoint state, liveness transitions gated on echo round trips,
//! quarantine of removed endpoints and the per-tick status check.

pub mod shadow;

use crate::{
    app::{
        detector::{
            FailureDetector,
            FailureListener,
        },
        endpoint::EndpointId,
        ring::{
            Token,
            TokenRing,
        },
        state::{
            uptime_nanos,
            AppStateKey,
            EndpointState,
            HeartBeatState,
            Status,
            ValueFactory,
            VersionGenerator,
            VersionedValue,
        },
    },
    wire::{
        GossipDigest,
        GossipDigestAck,
        GossipDigestAck2,
        GossipDigestSyn,
        Message,
    },
};
use async_trait::async_trait;
use rand::{
    seq::SliceRandom,
    thread_rng,
    Rng,
};
use shadow::ShadowRound;
use std::{
    collections::{
        BTreeSet,
        HashMap,
    },
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
        RwLock,
    },
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};
use tokio::sync::{
    mpsc::{
        unbounded_channel,
        UnboundedReceiver,
        UnboundedSender,
    },
    Notify,
};

/// A remote generation further than this ahead of the local wall clock is
/// rejected as corrupt.
pub const MAX_GENERATION_SKEW_SECS: i64 = 365 * 24 * 3600;
/// How long a departed endpoint's state lingers before eviction when its
/// status carries no explicit expiry.
pub const A_VERY_LONG_TIME: Duration = Duration::from_secs(3 * 24 * 3600);

pub(crate) fn wall_clock_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub(crate) fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Receives membership and state change notifications, synchronously on the
/// engine's thread. Subscribers must not block on cluster io and must not
/// call back into the gossiper.
pub trait EventSubscriber: Send + Sync {
    /// About to apply a new value for the key.
    fn before_change(&self, _endpoint: &EndpointId, _state: &EndpointState, _key: AppStateKey, _new: &VersionedValue) {
    }
    /// A brand new endpoint entered the state map.
    fn on_join(&self, _endpoint: &EndpointId, _state: &EndpointState) {}
    /// The endpoint was confirmed reachable.
    fn on_alive(&self, _endpoint: &EndpointId, _state: &EndpointState) {}
    /// The endpoint was convicted unreachable.
    fn on_dead(&self, _endpoint: &EndpointId, _state: &EndpointState) {}
    /// One application state entry was applied.
    fn on_change(&self, _endpoint: &EndpointId, _key: AppStateKey, _value: &VersionedValue) {}
    /// The endpoint was evicted from the state map.
    fn on_remove(&self, _endpoint: &EndpointId) {}
    /// The endpoint came back with a newer generation.
    fn on_restart(&self, _endpoint: &EndpointId, _state: &EndpointState) {}
}

/// Ring facts the engine needs for its status check: whether an endpoint is a
/// settled member, and its tokens for assassination.
pub trait MembershipProbe: Send + Sync {
    /// Whether the endpoint holds any normal token.
    fn is_member(&self, endpoint: &EndpointId) -> bool;
    /// The tokens of the endpoint.
    fn tokens_of(&self, endpoint: &EndpointId) -> Vec<Token>;
}

impl MembershipProbe for TokenRing {
    fn is_member(&self, endpoint: &EndpointId) -> bool {
        TokenRing::is_member(self, endpoint)
    }
    fn tokens_of(&self, endpoint: &EndpointId) -> Vec<Token> {
        TokenRing::tokens_of(self, endpoint)
    }
}

/// Delivers framed messages to peers. Implementations queue and never block
/// the engine; delivery is best effort.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message to the peer.
    async fn send(&self, to: &EndpointId, message: Message) -> anyhow::Result<()>;
}

/// Events processed by the gossip engine actor.
#[derive(Debug)]
pub enum GossipEvent {
    /// One scheduler tick.
    Tick,
    /// An inbound message from a peer.
    Message(EndpointId, Message),
    /// Local application states to advertise.
    LocalStates(Vec<(AppStateKey, VersionedValue)>),
    /// A failure detector conviction.
    Convict(EndpointId, f64),
    /// Stop the engine loop.
    Stop,
}

/// The cloneable inbox handle of the engine.
#[derive(Clone)]
pub struct GossipHandle {
    tx: UnboundedSender<GossipEvent>,
}

impl GossipHandle {
    /// Enqueue an event; false once the engine stopped.
    pub fn send(&self, event: GossipEvent) -> bool {
        self.tx.send(event).is_ok()
    }
    /// Enqueue an inbound peer message.
    pub fn deliver(&self, from: EndpointId, message: Message) -> bool {
        self.send(GossipEvent::Message(from, message))
    }
}

/// Forwards failure detector convictions into the engine inbox, keeping the
/// liveness transition on the engine actor.
pub struct ConvictionForwarder {
    handle: GossipHandle,
}

impl ConvictionForwarder {
    /// Create a forwarder around the engine handle.
    pub fn new(handle: GossipHandle) -> Self {
        Self { handle }
    }
}

impl FailureListener for ConvictionForwarder {
    fn convict(&self, endpoint: &EndpointId, phi: f64) {
        self.handle.send(GossipEvent::Convict(endpoint.clone(), phi));
    }
}

#[derive(Default)]
struct Shared {
    endpoints: HashMap<EndpointId, Arc<EndpointState>>,
    live: BTreeSet<EndpointId>,
    unreachable: HashMap<EndpointId, u64>,
    seeds: Vec<SocketAddr>,
    just_removed: HashMap<EndpointId, u64>,
    expire_times: HashMap<EndpointId, u64>,
    stopped: bool,
}

impl Shared {
    fn endpoint_by_broadcast(&self, address: SocketAddr) -> Option<EndpointId> {
        self.endpoints.keys().find(|e| e.broadcast() == address).cloned()
    }
}

/// The gossip engine. All mutation is serialized on the engine actor (or the
/// caller of a synchronous entry point) under one task lock; readers take it
/// only briefly.
pub struct Gossiper {
    local: EndpointId,
    local_is_seed: bool,
    cluster_name: String,
    partitioner_name: String,
    interval: Duration,
    ring_delay: Duration,
    quarantine_delay: Duration,
    fat_client_timeout: Duration,
    transport: Arc<dyn Transport>,
    detector: Arc<FailureDetector>,
    versions: Arc<VersionGenerator>,
    factory: ValueFactory,
    state: Mutex<Shared>,
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
    membership: RwLock<Option<Arc<dyn MembershipProbe>>>,
    pub(crate) shadow: Mutex<ShadowRound>,
    pub(crate) shadow_notify: Notify,
}

impl Gossiper {
    /// Create an engine around its collaborators.
    pub fn new(
        local: EndpointId,
        cluster_name: &str,
        partitioner_name: &str,
        interval: Duration,
        ring_delay: Duration,
        seeds: Vec<SocketAddr>,
        transport: Arc<dyn Transport>,
        detector: Arc<FailureDetector>,
    ) -> Self {
        let versions = Arc::new(VersionGenerator::default());
        let local_is_seed = seeds.contains(&local.broadcast());
        let mut shared = Shared::default();
        shared.seeds = seeds.into_iter().filter(|s| *s != local.broadcast()).collect();
        Self {
            local,
            local_is_seed,
            cluster_name: cluster_name.to_string(),
            partitioner_name: partitioner_name.to_string(),
            interval,
            ring_delay,
            quarantine_delay: ring_delay * 2,
            fat_client_timeout: ring_delay,
            transport,
            detector,
            factory: ValueFactory::new(versions.clone()),
            versions,
            state: Mutex::new(shared),
            subscribers: RwLock::new(Vec::new()),
            membership: RwLock::new(None),
            shadow: Mutex::new(ShadowRound::default()),
            shadow_notify: Notify::new(),
        }
    }
    /// Create the engine inbox.
    pub fn channel() -> (GossipHandle, UnboundedReceiver<GossipEvent>) {
        let (tx, rx) = unbounded_channel();
        (GossipHandle { tx }, rx)
    }
    /// The local identity.
    pub fn local(&self) -> &EndpointId {
        &self.local
    }
    /// Whether the local node is itself a configured seed.
    pub fn local_is_seed(&self) -> bool {
        self.local_is_seed
    }
    /// The cluster name exchanged in every SYN.
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }
    /// The partitioner name exchanged in every SYN.
    pub fn partitioner_name(&self) -> &str {
        &self.partitioner_name
    }
    /// The interval between rounds.
    pub fn interval(&self) -> Duration {
        self.interval
    }
    /// The settling time for ring transitions.
    pub fn ring_delay(&self) -> Duration {
        self.ring_delay
    }
    /// The factory stamping local application state values.
    pub fn value_factory(&self) -> &ValueFactory {
        &self.factory
    }
    /// The failure detector driven by this engine.
    pub fn detector(&self) -> &Arc<FailureDetector> {
        &self.detector
    }
    /// Register a membership and state change subscriber.
    pub fn register(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.write().expect("subscriber lock poisoned").push(subscriber);
    }
    /// Wire the ring facts used by the status check.
    pub fn set_membership(&self, membership: Arc<dyn MembershipProbe>) {
        *self.membership.write().expect("membership lock poisoned") = Some(membership);
    }
    fn is_ring_member(&self, endpoint: &EndpointId) -> bool {
        self.membership
            .read()
            .expect("membership lock poisoned")
            .as_ref()
            .map(|m| m.is_member(endpoint))
            .unwrap_or(false)
    }
    /// Seed the local endpoint state with its generation and initial
    /// application states.
    pub fn initialize_local_state(&self, generation: i32, states: Vec<(AppStateKey, VersionedValue)>) {
        let mut shared = self.state.lock().expect("task lock poisoned");
        let state = shared
            .endpoints
            .entry(self.local.clone())
            .or_insert_with(|| Arc::new(EndpointState::new(HeartBeatState::new(generation))))
            .clone();
        state.set_alive(true);
        drop(shared);
        self.add_local_states(states);
    }
    /// Seed a peer read from persisted storage: present, dead, generation
    /// zero, until gossip confirms it.
    pub fn add_saved_endpoint(&self, endpoint: EndpointId, states: Vec<(AppStateKey, VersionedValue)>) {
        if endpoint == self.local {
            return;
        }
        let mut shared = self.state.lock().expect("task lock poisoned");
        let state = Arc::new(EndpointState::new(HeartBeatState::new(0)));
        state.add_application_states(states);
        state.set_alive(false);
        shared.endpoints.insert(endpoint.clone(), state.clone());
        shared.unreachable.insert(endpoint.clone(), uptime_nanos());
        drop(shared);
        for subscriber in self.subscribers() {
            subscriber.on_join(&endpoint, &state);
        }
    }
    /// Advertise local application states, firing `before_change`/`on_change`.
    pub fn add_local_states(&self, states: Vec<(AppStateKey, VersionedValue)>) {
        let shared = self.state.lock().expect("task lock poisoned");
        let state = match shared.endpoints.get(&self.local) {
            Some(state) => state.clone(),
            None => return,
        };
        drop(shared);
        let subscribers = self.subscribers();
        for (key, value) in &states {
            for subscriber in &subscribers {
                subscriber.before_change(&self.local, &state, *key, value);
            }
        }
        for (key, value) in states {
            state.add_application_state(key, value.clone());
            for subscriber in &subscribers {
                subscriber.on_change(&self.local, key, &value);
            }
        }
    }
    fn subscribers(&self) -> Vec<Arc<dyn EventSubscriber>> {
        self.subscribers.read().expect("subscriber lock poisoned").clone()
    }
    /// The state of one endpoint, if known.
    pub fn endpoint_state(&self, endpoint: &EndpointId) -> Option<Arc<EndpointState>> {
        self.state
            .lock()
            .expect("task lock poisoned")
            .endpoints
            .get(endpoint)
            .cloned()
    }
    /// A snapshot of every known endpoint and its state.
    pub fn endpoint_states(&self) -> Vec<(EndpointId, Arc<EndpointState>)> {
        self.state
            .lock()
            .expect("task lock poisoned")
            .endpoints
            .iter()
            .map(|(e, s)| (e.clone(), s.clone()))
            .collect()
    }
    /// The peers currently considered alive.
    pub fn live_endpoints(&self) -> BTreeSet<EndpointId> {
        self.state.lock().expect("task lock poisoned").live.clone()
    }
    /// The peers currently considered unreachable.
    pub fn unreachable_endpoints(&self) -> Vec<EndpointId> {
        self.state
            .lock()
            .expect("task lock poisoned")
            .unreachable
            .keys()
            .cloned()
            .collect()
    }
    /// How long the endpoint has been unreachable.
    pub fn endpoint_downtime(&self, endpoint: &EndpointId) -> Duration {
        self.state
            .lock()
            .expect("task lock poisoned")
            .unreachable
            .get(endpoint)
            .map(|since| Duration::from_nanos(uptime_nanos().saturating_sub(*since)))
            .unwrap_or_default()
    }
    /// The configured seed addresses.
    pub fn seeds(&self) -> Vec<SocketAddr> {
        self.state.lock().expect("task lock poisoned").seeds.clone()
    }
    /// Replace the seed list, skipping the local address.
    pub fn reload_seeds(&self, seeds: Vec<SocketAddr>) {
        let mut shared = self.state.lock().expect("task lock poisoned");
        shared.seeds = seeds.into_iter().filter(|s| *s != self.local.broadcast()).collect();
    }
    /// Whether the endpoint's broadcast address is a configured seed.
    pub fn is_seed(&self, endpoint: &EndpointId) -> bool {
        self.state
            .lock()
            .expect("task lock poisoned")
            .seeds
            .contains(&endpoint.broadcast())
    }
    /// Whether any configured seed is present in the state map.
    pub fn seen_any_seed(&self) -> bool {
        let shared = self.state.lock().expect("task lock poisoned");
        shared
            .endpoints
            .keys()
            .any(|e| shared.seeds.contains(&e.broadcast()))
    }
    /// The local generation.
    pub fn generation(&self) -> i32 {
        self.endpoint_state(&self.local)
            .map(|state| state.heartbeat().generation)
            .unwrap_or(0)
    }
    /// The advertised release version of every known endpoint.
    pub fn release_versions(&self) -> HashMap<EndpointId, Option<String>> {
        self.endpoint_states()
            .into_iter()
            .map(|(e, s)| (e, s.release_version()))
            .collect()
    }

    /// One gossip round: bump the local heartbeat, pick peers for the digest
    /// synchronization and run the status check. Returns the outbound sends.
    pub fn run_round(&self) -> Vec<(EndpointId, Message)> {
        let mut out = Vec::new();
        let mut shared = self.state.lock().expect("task lock poisoned");
        if shared.stopped {
            return out;
        }
        if let Some(local_state) = shared.endpoints.get(&self.local) {
            local_state.bump_heartbeat(self.versions.next_version());
        }
        let digests = self.build_digests(&shared);
        if !digests.is_empty() {
            let syn = Message::Syn(GossipDigestSyn {
                cluster_name: self.cluster_name.clone(),
                partitioner_name: self.partitioner_name.clone(),
                digests,
            });
            let mut rng = thread_rng();
            let live: Vec<_> = shared.live.iter().cloned().collect();
            let unreachable: Vec<_> = shared.unreachable.keys().cloned().collect();
            let seed_count = shared.seeds.len();
            // one random live peer
            let mut gossiped_to_seed = false;
            if let Some(peer) = live.choose(&mut rng) {
                gossiped_to_seed = self.is_seed_address(&shared, peer);
                out.push((peer.clone(), syn.clone()));
            }
            // possibly one unreachable peer
            if !unreachable.is_empty() {
                let probability = unreachable.len() as f64 / (live.len() as f64 + 1.0);
                if rng.gen::<f64>() < probability {
                    if let Some(peer) = unreachable.choose(&mut rng) {
                        out.push((peer.clone(), syn.clone()));
                    }
                }
            }
            // keep seeds converged
            if seed_count > 0 && (!gossiped_to_seed || live.len() < seed_count) {
                let probability = seed_count as f64 / (live.len() + unreachable.len()) as f64;
                if live.is_empty() || rng.gen::<f64>() < probability {
                    if let Some(seed) = shared.seeds.choose(&mut rng).copied() {
                        let peer = shared
                            .endpoint_by_broadcast(seed)
                            .unwrap_or_else(|| EndpointId::new(crate::app::endpoint::HostId::nil(), seed));
                        out.push((peer, syn));
                    }
                }
            }
        }
        let mut removals = self.do_status_check(&mut shared);
        drop(shared);
        for endpoint in removals.drain(..) {
            self.remove_endpoint(&endpoint);
        }
        out
    }
    fn is_seed_address(&self, shared: &Shared, endpoint: &EndpointId) -> bool {
        shared.seeds.contains(&endpoint.broadcast())
    }
    /// A SYN over the current digest list, as one round would send it.
    pub fn make_syn(&self) -> Message {
        let shared = self.state.lock().expect("task lock poisoned");
        Message::Syn(GossipDigestSyn {
            cluster_name: self.cluster_name.clone(),
            partitioner_name: self.partitioner_name.clone(),
            digests: self.build_digests(&shared),
        })
    }
    fn build_digests(&self, shared: &Shared) -> Vec<GossipDigest> {
        let mut digests: Vec<_> = shared
            .endpoints
            .iter()
            .map(|(endpoint, state)| GossipDigest {
                endpoint: endpoint.clone(),
                generation: state.heartbeat().generation,
                max_version: state.max_version(),
            })
            .collect();
        digests.shuffle(&mut thread_rng());
        digests
    }
    /// Per tick bookkeeping: interpret the detector for every peer, expire
    /// fat clients and departed endpoints, drain the quarantine. Returns fat
    /// clients to remove outside the lock walk.
    fn do_status_check(&self, shared: &mut Shared) -> Vec<EndpointId> {
        let now = uptime_nanos();
        let now_millis = wall_clock_millis();
        let mut fat_clients = Vec::new();
        let mut evictions = Vec::new();
        for (endpoint, state) in &shared.endpoints {
            if *endpoint == self.local {
                continue;
            }
            self.detector.interpret(endpoint);
            let is_member = self.is_ring_member(endpoint);
            if !is_member
                && !shared.just_removed.contains_key(endpoint)
                && state.silence() > self.fat_client_timeout
            {
                // a fat client: present in gossip but never part of the ring
                log::info!("FatClient {} has been silent for too long, removing", endpoint);
                fat_clients.push(endpoint.clone());
                continue;
            }
            if !state.is_alive() && !is_member {
                let expire_at = shared
                    .expire_times
                    .get(endpoint)
                    .copied()
                    .or_else(|| match state.status() {
                        Some(Status::Left { expire_at_millis, .. }) => Some(expire_at_millis),
                        Some(Status::RemovedToken { expire_at_millis }) => Some(expire_at_millis),
                        _ => None,
                    });
                if let Some(expire_at) = expire_at {
                    if now_millis > expire_at {
                        log::info!("Evicting expired endpoint {}", endpoint);
                        evictions.push(endpoint.clone());
                    }
                }
            }
        }
        for endpoint in evictions {
            shared.endpoints.remove(&endpoint);
            shared.expire_times.remove(&endpoint);
            shared.unreachable.remove(&endpoint);
            shared.just_removed.insert(endpoint, now);
        }
        let quarantine = self.quarantine_delay.as_nanos() as u64;
        shared
            .just_removed
            .retain(|endpoint, since| {
                if now.saturating_sub(*since) > quarantine {
                    log::debug!("{} elapsed, {} gossip quarantine over", Duration::from_nanos(quarantine).as_millis(), endpoint);
                    false
                } else {
                    true
                }
            });
        fat_clients
    }
    /// Remove an endpoint from liveness tracking and quarantine it.
    pub fn remove_endpoint(&self, endpoint: &EndpointId) {
        for subscriber in self.subscribers() {
            subscriber.on_remove(endpoint);
        }
        self.detector.remove(endpoint);
        let mut shared = self.state.lock().expect("task lock poisoned");
        shared.live.remove(endpoint);
        shared.unreachable.remove(endpoint);
        shared.endpoints.remove(endpoint);
        shared.expire_times.remove(endpoint);
        shared.just_removed.insert(endpoint.clone(), uptime_nanos());
        log::info!("Removed endpoint {}", endpoint);
    }
    /// Record an explicit expiry for a departed endpoint's state.
    pub fn add_expire_time_for_endpoint(&self, endpoint: &EndpointId, expire_at_millis: u64) {
        self.state
            .lock()
            .expect("task lock poisoned")
            .expire_times
            .insert(endpoint.clone(), expire_at_millis);
    }

    /// Handle one inbound message, returning the outbound replies.
    pub fn handle_message(&self, from: EndpointId, message: Message) -> Vec<(EndpointId, Message)> {
        match message {
            Message::Syn(syn) => self.handle_syn(from, syn),
            Message::Ack(ack) => self.handle_ack(from, ack),
            Message::Ack2(ack2) => {
                self.apply_states(ack2.states)
            }
            Message::Echo => vec![(from, Message::EchoResponse)],
            Message::EchoResponse => {
                self.real_mark_alive(&from);
                Vec::new()
            }
            Message::Shutdown => {
                self.mark_as_shutdown(&from);
                Vec::new()
            }
        }
    }
    fn handle_syn(&self, from: EndpointId, syn: GossipDigestSyn) -> Vec<(EndpointId, Message)> {
        if syn.cluster_name != self.cluster_name {
            log::warn!(
                "ClusterName mismatch from {}: {} != {}",
                from,
                syn.cluster_name,
                self.cluster_name
            );
            return Vec::new();
        }
        if syn.partitioner_name != self.partitioner_name {
            log::warn!(
                "Partitioner mismatch from {}: {} != {}",
                from,
                syn.partitioner_name,
                self.partitioner_name
            );
            return Vec::new();
        }
        let shared = self.state.lock().expect("task lock poisoned");
        if syn.digests.is_empty() {
            // a shadow round request: answer with everything we know
            let states: Vec<_> = shared
                .endpoints
                .iter()
                .map(|(e, s)| (e.clone(), EndpointState::clone(s)))
                .collect();
            return vec![(from, Message::Ack(GossipDigestAck { digests: Vec::new(), states }))];
        }
        let (request, states) = self.examine_digests(&shared, &syn.digests);
        drop(shared);
        vec![(from, Message::Ack(GossipDigestAck { digests: request, states }))]
    }
    fn handle_ack(&self, from: EndpointId, ack: GossipDigestAck) -> Vec<(EndpointId, Message)> {
        {
            let mut shadow = self.shadow.lock().expect("shadow lock poisoned");
            if shadow.in_progress() {
                shadow.collect(&from, ack.states);
                self.shadow_notify.notify_waiters();
                return Vec::new();
            }
        }
        let mut out = self.apply_states(ack.states);
        let shared = self.state.lock().expect("task lock poisoned");
        let mut states = Vec::new();
        for digest in &ack.digests {
            if let Some(state) = shared.endpoints.get(&digest.endpoint) {
                if let Some(delta) = state_newer_than(state, digest.max_version) {
                    states.push((digest.endpoint.clone(), delta));
                }
            }
        }
        drop(shared);
        out.push((from, Message::Ack2(GossipDigestAck2 { states })));
        out
    }
    /// Compare remote digests with local knowledge: what must be requested in
    /// full or in part, and which local states are fresher.
    fn examine_digests(
        &self,
        shared: &Shared,
        digests: &[GossipDigest],
    ) -> (Vec<GossipDigest>, Vec<(EndpointId, EndpointState)>) {
        let mut request = Vec::new();
        let mut states = Vec::new();
        for digest in digests {
            match shared.endpoints.get(&digest.endpoint) {
                None => {
                    // the remote knows an endpoint we do not
                    request.push(GossipDigest {
                        endpoint: digest.endpoint.clone(),
                        generation: digest.generation,
                        max_version: 0,
                    });
                }
                Some(local) => {
                    let local_generation = local.heartbeat().generation;
                    let local_version = local.max_version();
                    if digest.generation > local_generation {
                        request.push(GossipDigest {
                            endpoint: digest.endpoint.clone(),
                            generation: digest.generation,
                            max_version: 0,
                        });
                    } else if digest.generation < local_generation {
                        if let Some(delta) = state_newer_than(local, 0) {
                            states.push((digest.endpoint.clone(), delta));
                        }
                    } else if digest.max_version > local_version {
                        request.push(GossipDigest {
                            endpoint: digest.endpoint.clone(),
                            generation: local_generation,
                            max_version: local_version,
                        });
                    } else if digest.max_version < local_version {
                        if let Some(delta) = state_newer_than(local, digest.max_version) {
                            states.push((digest.endpoint.clone(), delta));
                        }
                    }
                }
            }
        }
        (request, states)
    }
    /// The authoritative merge of remote endpoint states into the local map.
    /// Returns echo probes for endpoints about to be marked alive.
    pub fn apply_states(&self, states: Vec<(EndpointId, EndpointState)>) -> Vec<(EndpointId, Message)> {
        let mut out = Vec::new();
        let now_secs = wall_clock_secs();
        for (endpoint, remote) in states {
            if endpoint == self.local {
                continue;
            }
            {
                let shared = self.state.lock().expect("task lock poisoned");
                if shared.just_removed.contains_key(&endpoint) {
                    log::debug!("Ignoring gossip for {} while under quarantine", endpoint);
                    continue;
                }
            }
            let remote_generation = remote.heartbeat().generation;
            if remote_generation as i64 > now_secs + MAX_GENERATION_SKEW_SECS {
                log::warn!(
                    "Received an invalid gossip generation {} for {}; discarding",
                    remote_generation,
                    endpoint
                );
                continue;
            }
            let local_state = self.endpoint_state(&endpoint);
            match local_state {
                None => {
                    out.extend(self.handle_major_state_change(&endpoint, remote, false));
                }
                Some(local) => {
                    let local_generation = local.heartbeat().generation;
                    if remote_generation > local_generation {
                        let restarted = local_generation > 0;
                        if restarted {
                            for subscriber in self.subscribers() {
                                subscriber.on_restart(&endpoint, &remote);
                            }
                        }
                        out.extend(self.handle_major_state_change(&endpoint, remote, restarted));
                    } else if remote_generation == local_generation {
                        out.extend(self.apply_newer_states(&endpoint, &local, &remote));
                    }
                    // an older generation is silently dropped
                }
            }
        }
        out
    }
    /// Replace an endpoint's state wholesale, on first sight or on a newer
    /// generation.
    fn handle_major_state_change(
        &self,
        endpoint: &EndpointId,
        remote: EndpointState,
        restarted: bool,
    ) -> Vec<(EndpointId, Message)> {
        let is_new = {
            let shared = self.state.lock().expect("task lock poisoned");
            !shared.endpoints.contains_key(endpoint)
        };
        let remote = Arc::new(remote);
        let dead_state = remote.status().map(|s| s.is_dead_state()).unwrap_or(false);
        {
            let mut shared = self.state.lock().expect("task lock poisoned");
            shared.endpoints.insert(endpoint.clone(), remote.clone());
            shared.live.remove(endpoint);
        }
        self.detector.report(endpoint);
        let subscribers = self.subscribers();
        if is_new {
            log::info!("Node {} is now part of the cluster", endpoint);
            for subscriber in &subscribers {
                subscriber.on_join(endpoint, &remote);
            }
        } else if restarted {
            log::info!("Node {} has restarted", endpoint);
        }
        let snapshot = remote.application_states();
        let mut entries: Vec<_> = snapshot.iter().collect();
        entries.sort_by_key(|(key, _)| **key);
        for (key, value) in entries {
            for subscriber in &subscribers {
                subscriber.on_change(endpoint, *key, value);
            }
        }
        if dead_state {
            self.mark_dead(endpoint, &remote);
            Vec::new()
        } else {
            // alive only after the echo round trip
            vec![(endpoint.clone(), Message::Echo)]
        }
    }
    /// Same generation: apply the entries whose version exceeds ours.
    fn apply_newer_states(
        &self,
        endpoint: &EndpointId,
        local: &Arc<EndpointState>,
        remote: &EndpointState,
    ) -> Vec<(EndpointId, Message)> {
        let remote_heartbeat = remote.heartbeat();
        let mut advanced = false;
        if remote_heartbeat.version > local.heartbeat().version {
            local.set_heartbeat(remote_heartbeat);
            self.detector.report(endpoint);
            advanced = true;
        }
        let subscribers = self.subscribers();
        let local_snapshot = local.application_states();
        let remote_snapshot = remote.application_states();
        let mut entries: Vec<_> = remote_snapshot
            .iter()
            .filter(|(key, value)| {
                local_snapshot
                    .get(key)
                    .map(|current| value.version > current.version)
                    .unwrap_or(true)
            })
            .collect();
        entries.sort_by_key(|(key, _)| **key);
        for (key, value) in &entries {
            for subscriber in &subscribers {
                subscriber.before_change(endpoint, local, **key, value);
            }
        }
        for (key, value) in entries {
            local.add_application_state(*key, value.clone());
            advanced = true;
            for subscriber in &subscribers {
                subscriber.on_change(endpoint, *key, value);
            }
        }
        let dead_state = local.status().map(|s| s.is_dead_state()).unwrap_or(false);
        if advanced && !local.is_alive() && !dead_state {
            // unreachable but heard of again: confirm with an echo
            vec![(endpoint.clone(), Message::Echo)]
        } else {
            Vec::new()
        }
    }
    /// Promote an endpoint to alive after its echo reply.
    pub fn real_mark_alive(&self, endpoint: &EndpointId) {
        let state = match self.endpoint_state(endpoint) {
            Some(state) => state,
            None => return,
        };
        if state.status().map(|s| s.is_dead_state()).unwrap_or(false) {
            return;
        }
        state.set_alive(true);
        state.touch();
        {
            let mut shared = self.state.lock().expect("task lock poisoned");
            shared.live.insert(endpoint.clone());
            shared.unreachable.remove(endpoint);
        }
        log::info!("Endpoint {} is now UP", endpoint);
        for subscriber in self.subscribers() {
            subscriber.on_alive(endpoint, &state);
        }
    }
    fn mark_dead(&self, endpoint: &EndpointId, state: &Arc<EndpointState>) {
        state.set_alive(false);
        {
            let mut shared = self.state.lock().expect("task lock poisoned");
            shared.live.remove(endpoint);
            shared.unreachable.insert(endpoint.clone(), uptime_nanos());
        }
        log::info!("Endpoint {} is now DOWN", endpoint);
        for subscriber in self.subscribers() {
            subscriber.on_dead(endpoint, state);
        }
    }
    /// A failure detector conviction: mark the endpoint dead, honoring an
    /// advertised shutdown.
    pub fn convict(&self, endpoint: &EndpointId, phi: f64) {
        let state = match self.endpoint_state(endpoint) {
            Some(state) => state,
            None => return,
        };
        if !state.is_alive() {
            return;
        }
        log::debug!("Convicting {} with phi {:.2}", endpoint, phi);
        if matches!(state.status(), Some(Status::Shutdown)) {
            self.mark_as_shutdown(endpoint);
        } else {
            self.mark_dead(endpoint, &state);
        }
    }
    /// A peer announced an orderly shutdown: pin its status, freeze its
    /// generation's heartbeat and mark it dead.
    pub fn mark_as_shutdown(&self, endpoint: &EndpointId) {
        let state = match self.endpoint_state(endpoint) {
            Some(state) => state,
            None => return,
        };
        let shutdown = self.factory.shutdown();
        state.add_application_states(vec![
            (AppStateKey::Status, shutdown.clone()),
            (AppStateKey::StatusWithPort, shutdown),
        ]);
        state.force_highest_version();
        self.mark_dead(endpoint, &state);
        self.detector.force_conviction(endpoint);
    }
    /// Build the local shutdown announcement: the status states to advertise
    /// and the one-way shutdown messages for every live peer.
    pub fn announce_shutdown(&self) -> Vec<(EndpointId, Message)> {
        let shutdown = self.factory.shutdown();
        self.add_local_states(vec![
            (AppStateKey::Status, shutdown.clone()),
            (AppStateKey::StatusWithPort, shutdown),
        ]);
        let mut shared = self.state.lock().expect("task lock poisoned");
        shared.stopped = true;
        shared
            .live
            .iter()
            .map(|peer| (peer.clone(), Message::Shutdown))
            .collect()
    }
    /// Forcibly advertise that an endpoint has left the ring: its state is
    /// replaced with STATUS LEFT under a bumped generation and broadcast by
    /// subsequent rounds. Sleeps `ring_delay` to confirm the generation is
    /// stable, then four intervals for propagation.
    pub async fn assassinate(&self, address: SocketAddr) -> anyhow::Result<()> {
        let endpoint = {
            let shared = self.state.lock().expect("task lock poisoned");
            shared.endpoint_by_broadcast(address)
        };
        let endpoint = endpoint.ok_or_else(|| anyhow::anyhow!("unknown endpoint {}", address))?;
        let state = self
            .endpoint_state(&endpoint)
            .ok_or_else(|| anyhow::anyhow!("no state for {}", endpoint))?;
        let observed_generation = state.heartbeat().generation;
        let mut tokens = self
            .membership
            .read()
            .expect("membership lock poisoned")
            .as_ref()
            .map(|m| m.tokens_of(&endpoint))
            .unwrap_or_default();
        if tokens.is_empty() {
            log::warn!("Unable to calculate tokens for {}; using a random one", endpoint);
            tokens = vec![thread_rng().gen::<Token>()];
        }
        log::warn!("Assassinating {}, confirming its generation is stable", endpoint);
        tokio::time::sleep(self.ring_delay).await;
        let state = self
            .endpoint_state(&endpoint)
            .ok_or_else(|| anyhow::anyhow!("no state for {}", endpoint))?;
        anyhow::ensure!(
            state.heartbeat().generation == observed_generation,
            "endpoint {} generation changed while awaiting assassination",
            endpoint
        );
        let expire_at = wall_clock_millis() + A_VERY_LONG_TIME.as_millis() as u64;
        let left = self.factory.left(&tokens, expire_at);
        let replacement = EndpointState::new(HeartBeatState::new(observed_generation + 1));
        replacement.add_application_states(vec![
            (AppStateKey::Status, left.clone()),
            (AppStateKey::StatusWithPort, left),
            (AppStateKey::Tokens, self.factory.tokens(&tokens)),
        ]);
        self.apply_states(vec![(endpoint.clone(), replacement)]);
        self.add_expire_time_for_endpoint(&endpoint, expire_at);
        // let the change propagate before returning
        tokio::time::sleep(self.interval * 4).await;
        log::warn!("Finished assassinating {}", endpoint);
        Ok(())
    }

    /// Dispatch outbound messages through the transport.
    pub async fn dispatch(&self, out: Vec<(EndpointId, Message)>) {
        let sends = out.into_iter().map(|(peer, message)| {
            let transport = self.transport.clone();
            async move {
                if let Err(e) = transport.send(&peer, message).await {
                    log::debug!("Dropping message to {}: {}", peer, e);
                }
            }
        });
        futures::future::join_all(sends).await;
    }
    /// The engine actor loop: processes ticks, inbound messages, local state
    /// announcements and convictions until stopped.
    pub async fn run(self: Arc<Self>, mut inbox: UnboundedReceiver<GossipEvent>) {
        while let Some(event) = inbox.recv().await {
            match event {
                GossipEvent::Tick => {
                    let out = self.run_round();
                    self.dispatch(out).await;
                }
                GossipEvent::Message(from, message) => {
                    let out = self.handle_message(from, message);
                    self.dispatch(out).await;
                }
                GossipEvent::LocalStates(states) => {
                    self.add_local_states(states);
                }
                GossipEvent::Convict(endpoint, phi) => {
                    self.convict(&endpoint, phi);
                }
                GossipEvent::Stop => break,
            }
        }
        log::info!("Gossip engine stopped");
    }
    /// Spawn the tick task feeding the engine inbox.
    pub fn spawn_ticker(handle: GossipHandle, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !handle.send(GossipEvent::Tick) {
                    break;
                }
            }
        })
    }
}

/// A partial copy of an endpoint state carrying only the entries above the
/// given version, or the full state for version zero.
fn state_newer_than(state: &EndpointState, version: i32) -> Option<EndpointState> {
    if state.max_version() <= version {
        return None;
    }
    let delta = EndpointState::new(state.heartbeat());
    delta.add_application_states(state.states_newer_than(version));
    delta.set_alive(state.is_alive());
    Some(delta)
}

/// An in-process transport routing frames between engines by broadcast
/// address. Used by tests and local simulations; frames are encoded and
/// decoded to exercise the wire codecs.
#[derive(Default)]
pub struct MemoryNetwork {
    inboxes: Mutex<HashMap<SocketAddr, GossipHandle>>,
    partitioned: Mutex<BTreeSet<SocketAddr>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
    /// The sender half for a node; it may exist before the node's inbox is
    /// registered.
    pub fn transport_for(self: &Arc<Self>, sender: EndpointId) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            sender,
        })
    }
    /// Register a node's inbox under its broadcast address.
    pub fn register(&self, address: SocketAddr, handle: GossipHandle) {
        self.inboxes.lock().expect("inbox lock poisoned").insert(address, handle);
    }
    /// Cut a node off from the network.
    pub fn partition(&self, address: SocketAddr) {
        self.partitioned.lock().expect("partition lock poisoned").insert(address);
    }
    /// Reconnect a node.
    pub fn heal(&self, address: SocketAddr) {
        self.partitioned.lock().expect("partition lock poisoned").remove(&address);
    }
}

/// The per-node sender half of a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    sender: EndpointId,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: &EndpointId, message: Message) -> anyhow::Result<()> {
        {
            let partitioned = self.network.partitioned.lock().expect("partition lock poisoned");
            if partitioned.contains(&to.broadcast()) || partitioned.contains(&self.sender.broadcast()) {
                anyhow::bail!("{} unreachable", to);
            }
        }
        // round trip through the frame codec, as a socket would
        let frame = message.to_frame();
        let message = Message::from_frame(&frame)?;
        let handle = self
            .network
            .inboxes
            .lock()
            .expect("inbox lock poisoned")
            .get(&to.broadcast())
            .cloned();
        match handle {
            Some(handle) => {
                handle.deliver(self.sender.clone(), message);
                Ok(())
            }
            None => anyhow::bail!("no route to {}", to),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::endpoint::HostId;
    use std::collections::VecDeque;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(&self, _: &EndpointId, _: Message) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn endpoint(last: u8) -> EndpointId {
        EndpointId::new(
            HostId::from_u64_pair(last as u64, 0),
            format!("127.0.0.{}:7000", last).parse().unwrap(),
        )
    }

    fn gossiper(last: u8, ring_delay: Duration) -> Gossiper {
        Gossiper::new(
            endpoint(last),
            "hive",
            "Murmur3Partitioner",
            Duration::from_millis(1000),
            ring_delay,
            vec!["127.0.0.1:7000".parse().unwrap()],
            Arc::new(NullTransport),
            Arc::new(FailureDetector::new(8.0, Duration::from_secs(1))),
        )
    }

    fn started(last: u8, token: Token) -> Gossiper {
        let g = gossiper(last, Duration::from_secs(30));
        let factory = g.value_factory().clone();
        let states = vec![
            (AppStateKey::Status, factory.normal(token)),
            (AppStateKey::StatusWithPort, factory.normal(token)),
            (AppStateKey::Tokens, factory.tokens(&[token])),
        ];
        g.initialize_local_state(100 + last as i32, states);
        g
    }

    /// Deliver a message and cascade every reply until the exchange settles.
    fn route(nodes: &[&Gossiper], sender: EndpointId, to: EndpointId, message: Message) {
        let mut queue: VecDeque<(EndpointId, EndpointId, Message)> = VecDeque::new();
        queue.push_back((sender, to, message));
        while let Some((from, to, message)) = queue.pop_front() {
            if let Some(node) = nodes.iter().find(|n| *n.local() == to) {
                for (dest, reply) in node.handle_message(from.clone(), message) {
                    queue.push_back((to.clone(), dest, reply));
                }
            }
        }
    }

    fn exchange(nodes: &[&Gossiper], from: &Gossiper, to: &Gossiper) {
        route(nodes, from.local().clone(), to.local().clone(), from.make_syn());
    }

    #[test]
    fn three_nodes_converge_within_three_exchanges() {
        let a = started(1, 10);
        let b = started(2, 20);
        let c = started(3, 30);
        let nodes = [&a, &b, &c];
        // a and b have gossiped before c arrives
        exchange(&nodes, &a, &b);
        exchange(&nodes, &b, &a);
        // c introduces itself to the seed a, then the states flow outward
        exchange(&nodes, &c, &a);
        exchange(&nodes, &a, &c);
        exchange(&nodes, &a, &b);
        for node in &nodes {
            for other in &nodes {
                let state = node
                    .endpoint_state(other.local())
                    .unwrap_or_else(|| panic!("{} does not know {}", node.local(), other.local()));
                assert!(state.tokens().is_some(), "{} has no tokens for {}", node.local(), other.local());
            }
        }
        // the echo round trips promoted the peers to alive
        assert!(a.live_endpoints().contains(c.local()));
        assert!(c.live_endpoints().contains(a.local()));
        // versions never went backwards while merging
        let view_of_b = a.endpoint_state(b.local()).unwrap();
        assert_eq!(view_of_b.heartbeat().generation, 102);
    }

    #[test]
    fn an_exchange_carries_the_initiators_endpoints_to_the_receiver() {
        let a = started(1, 10);
        let b = started(2, 20);
        let nodes = [&a, &b];
        // the ack only addresses digests the initiator advertised, so one
        // exchange teaches the receiver about the initiator and nothing more
        exchange(&nodes, &a, &b);
        assert!(b.endpoint_state(a.local()).is_some());
        assert!(a.endpoint_state(b.local()).is_none());
        exchange(&nodes, &b, &a);
        assert_eq!(a.endpoint_state(b.local()).unwrap().tokens(), Some(vec![20]));
        assert_eq!(b.endpoint_state(a.local()).unwrap().tokens(), Some(vec![10]));
    }

    #[test]
    fn older_generations_are_silently_dropped() {
        let a = started(1, 10);
        let b = endpoint(2);
        let newer = EndpointState::new(HeartBeatState::new(50));
        newer.add_application_state(AppStateKey::Rack, VersionedValue::new("r2", 4));
        a.apply_states(vec![(b.clone(), newer)]);
        let stale = EndpointState::new(HeartBeatState::new(49));
        stale.add_application_state(AppStateKey::Rack, VersionedValue::new("r1", 9));
        a.apply_states(vec![(b.clone(), stale)]);
        let state = a.endpoint_state(&b).unwrap();
        assert_eq!(state.heartbeat().generation, 50);
        assert_eq!(state.application_state(AppStateKey::Rack).unwrap().value, "r2");
    }

    #[test]
    fn same_generation_merges_only_newer_versions() {
        let a = started(1, 10);
        let b = endpoint(2);
        let first = EndpointState::new(HeartBeatState { generation: 50, version: 3 });
        first.add_application_state(AppStateKey::Rack, VersionedValue::new("r1", 2));
        a.apply_states(vec![(b.clone(), first)]);
        let second = EndpointState::new(HeartBeatState { generation: 50, version: 9 });
        second.add_application_state(AppStateKey::Rack, VersionedValue::new("r2", 1));
        second.add_application_state(AppStateKey::Dc, VersionedValue::new("dc9", 8));
        a.apply_states(vec![(b.clone(), second)]);
        let state = a.endpoint_state(&b).unwrap();
        assert_eq!(state.heartbeat().version, 9);
        // the rack value was older and must not regress
        assert_eq!(state.application_state(AppStateKey::Rack).unwrap().value, "r1");
        assert_eq!(state.application_state(AppStateKey::Dc).unwrap().value, "dc9");
    }

    #[test]
    fn quarantined_endpoints_do_not_reincarnate() {
        let a = gossiper(1, Duration::from_millis(20));
        a.initialize_local_state(100, Vec::new());
        let b = endpoint(2);
        let state = EndpointState::new(HeartBeatState::new(50));
        a.apply_states(vec![(b.clone(), state)]);
        assert!(a.endpoint_state(&b).is_some());
        a.remove_endpoint(&b);
        assert!(a.endpoint_state(&b).is_none());
        // gossip about the endpoint is ignored while quarantined
        a.apply_states(vec![(b.clone(), EndpointState::new(HeartBeatState::new(51)))]);
        assert!(a.endpoint_state(&b).is_none());
        // after the quarantine delay the next round drains the record
        std::thread::sleep(Duration::from_millis(90));
        a.run_round();
        a.apply_states(vec![(b.clone(), EndpointState::new(HeartBeatState::new(51)))]);
        assert!(a.endpoint_state(&b).is_some());
    }

    #[test]
    fn generations_from_the_far_future_are_rejected() {
        let a = started(1, 10);
        let b = endpoint(2);
        let generation = (wall_clock_secs() + MAX_GENERATION_SKEW_SECS + 3600) as i32;
        a.apply_states(vec![(b.clone(), EndpointState::new(HeartBeatState::new(generation)))]);
        assert!(a.endpoint_state(&b).is_none());
    }

    #[test]
    fn peers_become_alive_only_after_the_echo_round_trip() {
        let a = started(1, 10);
        let b = endpoint(2);
        let state = EndpointState::new(HeartBeatState::new(50));
        let out = a.apply_states(vec![(b.clone(), state)]);
        // the merge requested an echo instead of trusting the heartbeat
        assert!(matches!(out.as_slice(), [(to, Message::Echo)] if *to == b));
        assert!(!a.live_endpoints().contains(&b));
        a.handle_message(b.clone(), Message::EchoResponse);
        assert!(a.live_endpoints().contains(&b));
        assert!(a.endpoint_state(&b).unwrap().is_alive());
    }

    #[test]
    fn shutdown_announcements_pin_the_peer_down() {
        let a = started(1, 10);
        let b = endpoint(2);
        a.apply_states(vec![(b.clone(), EndpointState::new(HeartBeatState::new(50)))]);
        a.handle_message(b.clone(), Message::EchoResponse);
        assert!(a.live_endpoints().contains(&b));
        a.handle_message(b.clone(), Message::Shutdown);
        assert!(!a.live_endpoints().contains(&b));
        let state = a.endpoint_state(&b).unwrap();
        assert_eq!(state.status(), Some(Status::Shutdown));
        // the heartbeat is pinned so no replayed update resurrects it
        assert_eq!(state.heartbeat().version, i32::MAX);
        assert!(!a.detector().is_alive(&b));
    }

    #[test]
    fn an_empty_syn_is_answered_with_everything() {
        let a = started(1, 10);
        let b = started(2, 20);
        let nodes = [&a, &b];
        exchange(&nodes, &b, &a);
        let shadow_syn = Message::Syn(GossipDigestSyn {
            cluster_name: "hive".into(),
            partitioner_name: "Murmur3Partitioner".into(),
            digests: Vec::new(),
        });
        let replies = a.handle_message(endpoint(9), shadow_syn);
        match &replies[..] {
            [(to, Message::Ack(ack))] => {
                assert_eq!(*to, endpoint(9));
                assert!(ack.digests.is_empty());
                let known: Vec<_> = ack.states.iter().map(|(e, _)| e.clone()).collect();
                assert!(known.contains(a.local()));
                assert!(known.contains(b.local()));
            }
            other => panic!("unexpected replies {:?}", other),
        }
    }

    #[test]
    fn cluster_name_mismatches_are_ignored() {
        let a = started(1, 10);
        let stray = Message::Syn(GossipDigestSyn {
            cluster_name: "somebody-else".into(),
            partitioner_name: "Murmur3Partitioner".into(),
            digests: Vec::new(),
        });
        assert!(a.handle_message(endpoint(9), stray).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn assassination_forces_a_left_state() {
        let a = gossiper(1, Duration::from_millis(10));
        a.initialize_local_state(100, Vec::new());
        let b = endpoint(2);
        a.apply_states(vec![(b.clone(), EndpointState::new(HeartBeatState::new(50)))]);
        a.assassinate(b.broadcast()).await.unwrap();
        let state = a.endpoint_state(&b).unwrap();
        assert_eq!(state.heartbeat().generation, 51);
        assert!(matches!(state.status(), Some(Status::Left { .. })));
        assert!(!state.is_alive());
        assert!(!a.live_endpoints().contains(&b));
    }

    #[test]
    fn saved_endpoints_start_dead_until_gossip_confirms() {
        let a = started(1, 10);
        let b = endpoint(2);
        a.add_saved_endpoint(b.clone(), vec![(AppStateKey::Dc, VersionedValue::new("dc1", 1))]);
        let state = a.endpoint_state(&b).unwrap();
        assert!(!state.is_alive());
        assert_eq!(state.heartbeat().generation, 0);
        assert!(a.unreachable_endpoints().contains(&b));
        // a real generation supersedes the placeholder wholesale
        a.apply_states(vec![(b.clone(), EndpointState::new(HeartBeatState::new(50)))]);
        assert_eq!(a.endpoint_state(&b).unwrap().heartbeat().generation, 50);
    }
}
