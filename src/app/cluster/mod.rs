// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module wires the membership core together: configuration, transport,
//! failure detector, gossip engine, ring metadata and the ring updater, plus
//! the small remote management surface.

use super::HiveConfig;
use crate::app::{
    detector::FailureDetector,
    endpoint::{
        EndpointId,
        HostId,
    },
    gossip::{
        ConvictionForwarder,
        GossipEvent,
        GossipHandle,
        Gossiper,
        Transport,
    },
    ring::{
        Partitioner,
        RingUpdater,
        Token,
        TokenRing,
    },
    state::{
        AppStateKey,
        EndpointState,
        VersionedValue,
    },
    store::PeerStore,
    strategy::ReplicationStrategy,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
};

/// The composition root of a node's membership core. Collaborators are wired
/// as explicit dependencies so tests substitute in-memory fakes.
pub struct Cluster {
    config: HiveConfig,
    local: EndpointId,
    partitioner: Arc<dyn Partitioner>,
    detector: Arc<FailureDetector>,
    gossiper: Arc<Gossiper>,
    ring: Arc<TokenRing>,
    updater: Arc<RingUpdater>,
    handle: GossipHandle,
    inbox: Mutex<Option<UnboundedReceiver<GossipEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Cluster {
    /// Wire a node from its configuration and collaborators.
    pub fn new(
        config: HiveConfig,
        partitioner: Arc<dyn Partitioner>,
        transport: Arc<dyn Transport>,
        peer_store: Arc<dyn PeerStore>,
    ) -> Self {
        let host_id = peer_store.local_host_id().unwrap_or_else(HostId::random);
        let local = EndpointId::new(host_id, config.broadcast_address);
        let detector = Arc::new(FailureDetector::new(
            config.phi_convict_threshold,
            config.gossip_interval() * 2,
        ));
        let gossiper = Arc::new(Gossiper::new(
            local.clone(),
            &config.cluster_name,
            partitioner.name(),
            config.gossip_interval(),
            config.ring_delay(),
            config.seeds.clone(),
            transport,
            detector.clone(),
        ));
        let (handle, inbox) = Gossiper::channel();
        detector.register(Arc::new(ConvictionForwarder::new(handle.clone())));
        let ring = Arc::new(TokenRing::new());
        let updater = Arc::new(RingUpdater::new(ring.clone(), local.clone()));
        gossiper.register(updater.clone());
        gossiper.set_membership(ring.clone());
        let cluster = Self {
            config,
            local,
            partitioner,
            detector,
            gossiper,
            ring,
            updater,
            handle,
            inbox: Mutex::new(Some(inbox)),
            tasks: Mutex::new(Vec::new()),
        };
        cluster.seed_saved_endpoints(peer_store.as_ref());
        cluster
    }
    fn seed_saved_endpoints(&self, peer_store: &dyn PeerStore) {
        let factory = self.gossiper.value_factory();
        for record in peer_store.load_peers() {
            let endpoint = EndpointId::new(record.host_id, record.address);
            let mut states = vec![(AppStateKey::HostId, factory.host_id(record.host_id))];
            if !record.tokens.is_empty() {
                states.push((AppStateKey::Tokens, factory.tokens(&record.tokens)));
            }
            if let Some(dc) = &record.data_center {
                states.push((AppStateKey::Dc, factory.datacenter(dc.clone())));
            }
            if let Some(rack) = &record.rack {
                states.push((AppStateKey::Rack, factory.rack(rack.clone())));
            }
            if let Some(preferred) = record.preferred {
                states.push((AppStateKey::InternalAddress, factory.internal_address(preferred)));
            }
            self.gossiper.add_saved_endpoint(endpoint, states);
        }
    }
    /// The local identity.
    pub fn local(&self) -> &EndpointId {
        &self.local
    }
    /// The engine inbox handle.
    pub fn handle(&self) -> &GossipHandle {
        &self.handle
    }
    /// The gossip engine.
    pub fn gossiper(&self) -> &Arc<Gossiper> {
        &self.gossiper
    }
    /// The ring metadata.
    pub fn ring(&self) -> &Arc<TokenRing> {
        &self.ring
    }
    /// The failure detector.
    pub fn detector(&self) -> &Arc<FailureDetector> {
        &self.detector
    }
    /// The partitioner of this cluster.
    pub fn partitioner(&self) -> &Arc<dyn Partitioner> {
        &self.partitioner
    }
    /// Register a keyspace whose pending ranges the ring maintains.
    pub fn register_keyspace(&self, keyspace: &str, strategy: Box<dyn ReplicationStrategy>) {
        self.updater.register_keyspace(keyspace, strategy);
    }
    /// Spawn the engine actor loop without advertising the local node; used
    /// before the shadow round. Idempotent.
    pub fn spawn_engine(&self) {
        let inbox = self.inbox.lock().expect("inbox lock poisoned").take();
        if let Some(inbox) = inbox {
            self.tasks
                .lock()
                .expect("task lock poisoned")
                .push(tokio::spawn(self.gossiper.clone().run(inbox)));
        }
    }
    /// Initialize the local state and spawn the engine actor and its ticker.
    pub fn start(&self) {
        self.spawn_engine();
        let generation = crate::app::gossip::wall_clock_secs() as i32;
        let factory = self.gossiper.value_factory();
        let states = vec![
            (AppStateKey::HostId, factory.host_id(self.local.host_id())),
            (AppStateKey::Dc, factory.datacenter(self.config.local_datacenter.clone())),
            (AppStateKey::Rack, factory.rack(self.config.local_rack.clone())),
            (
                AppStateKey::ReleaseVersion,
                factory.release_version(env!("CARGO_PKG_VERSION")),
            ),
            (AppStateKey::NativeAddress, factory.native_address(self.local.native())),
            (
                AppStateKey::InternalAddress,
                factory.internal_address(self.local.listen()),
            ),
            (AppStateKey::RpcReady, factory.rpc_ready(false)),
        ];
        self.gossiper.initialize_local_state(generation, states);
        self.tasks
            .lock()
            .expect("task lock poisoned")
            .push(Gossiper::spawn_ticker(self.handle.clone(), self.config.gossip_interval()));
        log::info!("Started gossip for {} with generation {}", self.local, generation);
    }
    /// Run the pre-join shadow round; the engine must be started first.
    pub async fn shadow_round(
        &self,
    ) -> Result<HashMap<EndpointId, EndpointState>, crate::app::gossip::shadow::ShadowRoundError> {
        self.gossiper.do_shadow_round().await
    }
    /// Advertise this node as bootstrapping with the given tokens.
    pub fn announce_bootstrap(&self, tokens: &[Token]) {
        let factory = self.gossiper.value_factory();
        let sample = tokens.first().copied().unwrap_or_else(|| self.partitioner.random_token());
        let status = factory.bootstrapping(sample);
        self.gossiper.add_local_states(vec![
            (AppStateKey::Tokens, factory.tokens(tokens)),
            (AppStateKey::Status, status.clone()),
            (AppStateKey::StatusWithPort, status),
        ]);
    }
    /// Advertise this node as a settled member owning the given tokens.
    pub fn announce_normal(&self, tokens: &[Token]) {
        let factory = self.gossiper.value_factory();
        let sample = tokens.first().copied().unwrap_or_else(|| self.partitioner.random_token());
        let status = factory.normal(sample);
        self.gossiper.add_local_states(vec![
            (AppStateKey::Tokens, factory.tokens(tokens)),
            (AppStateKey::Status, status.clone()),
            (AppStateKey::StatusWithPort, status),
            (AppStateKey::RpcReady, factory.rpc_ready(true)),
        ]);
    }
    /// Advertise local application states.
    pub fn add_local_states(&self, states: Vec<(AppStateKey, VersionedValue)>) {
        self.gossiper.add_local_states(states);
    }
    /// Advertise the background load severity of this node.
    pub fn set_severity(&self, severity: f64) {
        let factory = self.gossiper.value_factory();
        self.gossiper
            .add_local_states(vec![(AppStateKey::Severity, factory.severity(severity))]);
    }
    /// Advertise the schema version this node has settled on.
    pub fn update_schema_version(&self, version: &str) {
        let factory = self.gossiper.value_factory();
        self.gossiper
            .add_local_states(vec![(AppStateKey::Schema, factory.schema_version(version))]);
    }
    /// Announce an orderly shutdown, give the announcement a grace period to
    /// propagate, then stop the engine.
    pub async fn stop(&self) {
        let farewells = self.gossiper.announce_shutdown();
        self.gossiper.dispatch(farewells).await;
        tokio::time::sleep(self.config.shutdown_grace()).await;
        self.handle.send(GossipEvent::Stop);
        let mut tasks = self.tasks.lock().expect("task lock poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
        log::info!("Stopped gossip for {}", self.local);
    }

    // ------ the remote management surface ------

    /// The configured seed addresses.
    pub fn seeds(&self) -> Vec<SocketAddr> {
        self.gossiper.seeds()
    }
    /// Replace the seed list at runtime.
    pub fn reload_seeds(&self, seeds: Vec<SocketAddr>) {
        self.gossiper.reload_seeds(seeds);
    }
    /// How long the endpoint has been unreachable.
    pub fn endpoint_downtime(&self, endpoint: &EndpointId) -> Duration {
        self.gossiper.endpoint_downtime(endpoint)
    }
    /// The release version advertised by every known endpoint.
    pub fn release_versions(&self) -> HashMap<EndpointId, Option<String>> {
        self.gossiper.release_versions()
    }
    /// The current local generation number.
    pub fn current_generation(&self) -> i32 {
        self.gossiper.generation()
    }
    /// Forcibly remove the endpoint at the given address from the ring.
    pub async fn assassinate_endpoint(&self, address: SocketAddr) -> anyhow::Result<()> {
        self.gossiper.assassinate(address).await
    }
    /// Deprecated alias of [`Cluster::assassinate_endpoint`].
    #[deprecated(note = "use assassinate_endpoint")]
    pub async fn unsafe_assassinate_endpoint(&self, address: SocketAddr) -> anyhow::Result<()> {
        self.assassinate_endpoint(address).await
    }
}
