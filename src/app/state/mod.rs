// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module implements the per-endpoint versioned state carried by gossip:
//! the heartbeat, the application state map and the status values derived
//! from it.

use crate::app::{
    endpoint::HostId,
    ring::token::Token,
};
use anyhow::{
    anyhow,
    bail,
};
use arc_swap::ArcSwap;
use num_derive::FromPrimitive;
use std::{
    collections::HashMap,
    sync::{
        atomic::{
            AtomicBool,
            AtomicI32,
            AtomicU64,
            Ordering,
        },
        Arc,
        OnceLock,
    },
    time::Duration,
};

/// The fixed enumeration of application state keys. The ordinal is the wire
/// representation; an unknown ordinal on read is a protocol violation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, FromPrimitive)]
#[repr(i32)]
pub enum AppStateKey {
    /// Legacy status value, kept for peers that predate port-aware addresses.
    Status = 0,
    /// The datacenter of the endpoint.
    Dc = 1,
    /// The rack of the endpoint.
    Rack = 2,
    /// The release version the endpoint runs.
    ReleaseVersion = 3,
    /// The internal listen address.
    InternalAddress = 4,
    /// The legacy client address.
    RpcAddress = 5,
    /// The schema version the endpoint advertises.
    Schema = 6,
    /// The full token set of the endpoint.
    Tokens = 7,
    /// Background load severity, consumed by proximity sorting.
    Severity = 8,
    /// The stable host id.
    HostId = 9,
    /// Whether the endpoint serves client requests.
    RpcReady = 10,
    /// The port-aware client address.
    NativeAddress = 11,
    /// The coordinator of a token removal.
    RemovalCoordinator = 12,
    /// Port-aware status value; readers prefer it over `Status`.
    StatusWithPort = 13,
}

/// A string payload tagged with a version that increases monotonically within
/// one endpoint generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedValue {
    /// The payload.
    pub value: String,
    /// The version within the owning generation.
    pub version: i32,
}

impl VersionedValue {
    /// Create a value with an explicit version.
    pub fn new<V: Into<String>>(value: V, version: i32) -> Self {
        Self {
            value: value.into(),
            version,
        }
    }
}

/// Hands out the strictly increasing versions tagged onto heartbeats and
/// application state values of the local endpoint.
#[derive(Debug, Default)]
pub struct VersionGenerator(AtomicI32);

impl VersionGenerator {
    /// The next version.
    pub fn next_version(&self) -> i32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
    /// The most recently handed out version.
    pub fn current(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }
}

const STATUS_DELIMITER: char = ',';

/// Builds versioned application state values for the local endpoint, stamping
/// each with the next version of the shared generator.
#[derive(Clone)]
pub struct ValueFactory {
    versions: Arc<VersionGenerator>,
}

impl ValueFactory {
    /// Create a factory around the shared version generator.
    pub fn new(versions: Arc<VersionGenerator>) -> Self {
        Self { versions }
    }
    fn value<V: Into<String>>(&self, value: V) -> VersionedValue {
        VersionedValue::new(value, self.versions.next_version())
    }
    /// A NORMAL status carrying a sample token.
    pub fn normal(&self, token: Token) -> VersionedValue {
        self.value(format!("NORMAL{}{}", STATUS_DELIMITER, token))
    }
    /// A bootstrapping status carrying a sample token.
    pub fn bootstrapping(&self, token: Token) -> VersionedValue {
        self.value(format!("BOOT{}{}", STATUS_DELIMITER, token))
    }
    /// A replacement bootstrap status carrying the replaced host id.
    pub fn bootstrapping_replace(&self, replaced: HostId) -> VersionedValue {
        self.value(format!("BOOT_REPLACE{}{}", STATUS_DELIMITER, replaced))
    }
    /// A leaving status carrying a sample token.
    pub fn leaving(&self, token: Token) -> VersionedValue {
        self.value(format!("LEAVING{}{}", STATUS_DELIMITER, token))
    }
    /// A LEFT status carrying the departed tokens and the expiry timestamp.
    pub fn left(&self, tokens: &[Token], expire_at_millis: u64) -> VersionedValue {
        self.value(format!(
            "LEFT{}{}{}{}",
            STATUS_DELIMITER,
            join_tokens(tokens),
            STATUS_DELIMITER,
            expire_at_millis
        ))
    }
    /// A moving status carrying the target token.
    pub fn moving(&self, token: Token) -> VersionedValue {
        self.value(format!("MOVING{}{}", STATUS_DELIMITER, token))
    }
    /// A shutdown status.
    pub fn shutdown(&self) -> VersionedValue {
        self.value("shutdown,true")
    }
    /// A hibernate status.
    pub fn hibernate(&self) -> VersionedValue {
        self.value("hibernate,true")
    }
    /// A removing-token status.
    pub fn removing_token(&self) -> VersionedValue {
        self.value("removing")
    }
    /// A removed-token status carrying the expiry timestamp.
    pub fn removed_token(&self, expire_at_millis: u64) -> VersionedValue {
        self.value(format!("removed{}{}", STATUS_DELIMITER, expire_at_millis))
    }
    /// The full token set of the endpoint.
    pub fn tokens(&self, tokens: &[Token]) -> VersionedValue {
        self.value(join_tokens(tokens))
    }
    /// The stable host id.
    pub fn host_id(&self, host_id: HostId) -> VersionedValue {
        self.value(host_id.to_string())
    }
    /// The datacenter name.
    pub fn datacenter<V: Into<String>>(&self, dc: V) -> VersionedValue {
        self.value(dc)
    }
    /// The rack name.
    pub fn rack<V: Into<String>>(&self, rack: V) -> VersionedValue {
        self.value(rack)
    }
    /// The release version string.
    pub fn release_version<V: Into<String>>(&self, version: V) -> VersionedValue {
        self.value(version)
    }
    /// The schema version.
    pub fn schema_version<V: Into<String>>(&self, version: V) -> VersionedValue {
        self.value(version)
    }
    /// The internal listen address.
    pub fn internal_address(&self, address: std::net::SocketAddr) -> VersionedValue {
        self.value(address.to_string())
    }
    /// The port-aware client address.
    pub fn native_address(&self, address: std::net::SocketAddr) -> VersionedValue {
        self.value(address.to_string())
    }
    /// Whether the endpoint serves client requests.
    pub fn rpc_ready(&self, ready: bool) -> VersionedValue {
        self.value(ready.to_string())
    }
    /// Background load severity.
    pub fn severity(&self, severity: f64) -> VersionedValue {
        self.value(severity.to_string())
    }
    /// The coordinator of a token removal.
    pub fn removal_coordinator(&self, coordinator: HostId) -> VersionedValue {
        self.value(format!("REMOVER{}{}", STATUS_DELIMITER, coordinator))
    }
}

/// Join tokens into the comma separated payload used by TOKENS and LEFT.
pub fn join_tokens(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(";")
}

/// Parse the payload produced by [`join_tokens`].
pub fn parse_tokens(value: &str) -> anyhow::Result<Vec<Token>> {
    value
        .split(';')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Token>().map_err(|e| anyhow!("bad token {:?}: {}", s, e)))
        .collect()
}

/// The application level status of an endpoint, parsed from the STATUS or
/// STATUS_WITH_PORT value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Joining the ring.
    Bootstrapping {
        /// A sample token of the joining endpoint.
        token: Token,
    },
    /// Joining the ring in place of a departed endpoint.
    BootstrappingReplace {
        /// The host id being replaced.
        replaced: HostId,
    },
    /// A settled ring member.
    Normal {
        /// A sample token of the member.
        token: Token,
    },
    /// Decommissioning.
    Leaving {
        /// A sample token of the leaving member.
        token: Token,
    },
    /// Departed; state expires after the embedded deadline.
    Left {
        /// The departed tokens.
        tokens: Vec<Token>,
        /// Wall clock expiry in milliseconds.
        expire_at_millis: u64,
    },
    /// Relocating one token.
    Moving {
        /// The target token.
        token: Token,
    },
    /// Token removal in progress, coordinated by a third node.
    RemovingToken,
    /// Token removal completed.
    RemovedToken {
        /// Wall clock expiry in milliseconds.
        expire_at_millis: u64,
    },
    /// Announced an orderly shutdown.
    Shutdown,
    /// Present but deliberately not participating.
    Hibernate,
}

impl Status {
    /// Parse a status payload.
    pub fn parse(value: &str) -> anyhow::Result<Status> {
        let mut pieces = value.split(STATUS_DELIMITER);
        let verb = pieces.next().unwrap_or_default();
        let mut arg = || pieces.next().ok_or_else(|| anyhow!("truncated status {:?}", value));
        Ok(match verb {
            "BOOT" => Status::Bootstrapping { token: arg()?.parse()? },
            "BOOT_REPLACE" => Status::BootstrappingReplace { replaced: arg()?.parse()? },
            "NORMAL" => Status::Normal { token: arg()?.parse()? },
            "LEAVING" => Status::Leaving { token: arg()?.parse()? },
            "LEFT" => {
                let tokens = parse_tokens(arg()?)?;
                Status::Left {
                    tokens,
                    expire_at_millis: arg()?.parse()?,
                }
            }
            "MOVING" => Status::Moving { token: arg()?.parse()? },
            "removing" => Status::RemovingToken,
            "removed" => Status::RemovedToken {
                expire_at_millis: arg()?.parse()?,
            },
            "shutdown" => Status::Shutdown,
            "hibernate" => Status::Hibernate,
            _ => bail!("unknown status verb {:?}", verb),
        })
    }
    /// Dead states are ignored when deciding live participation in a merge.
    pub fn is_dead_state(&self) -> bool {
        matches!(
            self,
            Status::RemovingToken | Status::RemovedToken { .. } | Status::Left { .. } | Status::Hibernate
        )
    }
}

/// The heartbeat of an endpoint: its generation and the version bumped on
/// every gossip tick.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeartBeatState {
    /// The generation, initialized from wall clock seconds at process start.
    pub generation: i32,
    /// The version within the generation.
    pub version: i32,
}

impl HeartBeatState {
    /// Create a fresh heartbeat for the given generation.
    pub fn new(generation: i32) -> Self {
        Self { generation, version: 0 }
    }
}

static EPOCH: OnceLock<tokio::time::Instant> = OnceLock::new();

/// Monotonic nanoseconds since the first use within this process. Shared by
/// the gossip engine and the failure detector so silences are comparable.
pub fn uptime_nanos() -> u64 {
    let epoch = *EPOCH.get_or_init(tokio::time::Instant::now);
    (tokio::time::Instant::now() - epoch).as_nanos() as u64
}

/// The full local view of one endpoint: heartbeat, application state map and
/// the derived liveness flag. Readers observe copy-on-write snapshots and
/// never lock; writers swap snapshots with compare-and-swap retries.
pub struct EndpointState {
    heartbeat: ArcSwap<HeartBeatState>,
    applications: ArcSwap<HashMap<AppStateKey, VersionedValue>>,
    updated_at_nanos: AtomicU64,
    alive: AtomicBool,
}

impl EndpointState {
    /// Create a state around a heartbeat with an empty application map.
    pub fn new(heartbeat: HeartBeatState) -> Self {
        Self {
            heartbeat: ArcSwap::from_pointee(heartbeat),
            applications: ArcSwap::from_pointee(HashMap::new()),
            updated_at_nanos: AtomicU64::new(uptime_nanos()),
            alive: AtomicBool::new(false),
        }
    }
    /// The current heartbeat.
    pub fn heartbeat(&self) -> HeartBeatState {
        **self.heartbeat.load()
    }
    /// Replace the heartbeat and refresh the update timestamp.
    pub fn set_heartbeat(&self, heartbeat: HeartBeatState) {
        self.heartbeat.store(Arc::new(heartbeat));
        self.touch();
    }
    /// Bump the heartbeat version to the given value.
    pub fn bump_heartbeat(&self, version: i32) {
        let mut hb = self.heartbeat();
        hb.version = version;
        self.set_heartbeat(hb);
    }
    /// Force the heartbeat version past anything the generation can produce,
    /// so no further updates for this generation apply.
    pub fn force_highest_version(&self) {
        let mut hb = self.heartbeat();
        hb.version = i32::MAX;
        self.set_heartbeat(hb);
    }
    /// The current value of one application state, if present.
    pub fn application_state(&self, key: AppStateKey) -> Option<VersionedValue> {
        self.applications.load().get(&key).cloned()
    }
    /// A snapshot of the whole application state map. Holders keep observing
    /// this snapshot regardless of later writes.
    pub fn application_states(&self) -> Arc<HashMap<AppStateKey, VersionedValue>> {
        self.applications.load_full()
    }
    /// Atomically insert or replace one entry.
    pub fn add_application_state(&self, key: AppStateKey, value: VersionedValue) {
        self.add_application_states(std::iter::once((key, value)));
    }
    /// Atomically insert or replace entries, retrying on concurrent writers.
    pub fn add_application_states<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (AppStateKey, VersionedValue)> + Clone,
    {
        self.applications.rcu(|current| {
            let mut next = HashMap::clone(current);
            for (key, value) in entries.clone() {
                next.insert(key, value);
            }
            next
        });
        self.touch();
    }
    /// The maximum of the heartbeat version and all application versions.
    pub fn max_version(&self) -> i32 {
        let applications = self.applications.load();
        applications
            .values()
            .map(|v| v.version)
            .chain(std::iter::once(self.heartbeat().version))
            .max()
            .unwrap_or(0)
    }
    /// The application entries strictly above the given version, transmitted
    /// during reconciliation.
    pub fn states_newer_than(&self, version: i32) -> Vec<(AppStateKey, VersionedValue)> {
        self.applications
            .load()
            .iter()
            .filter(|(_, v)| v.version > version)
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }
    /// Whether the failure detector currently considers the endpoint alive.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
    /// Record the liveness verdict.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }
    /// Monotonic timestamp of the last local update; never serialized.
    pub fn updated_at_nanos(&self) -> u64 {
        self.updated_at_nanos.load(Ordering::SeqCst)
    }
    /// How long the endpoint has been silent.
    pub fn silence(&self) -> Duration {
        Duration::from_nanos(uptime_nanos().saturating_sub(self.updated_at_nanos()))
    }
    /// Refresh the update timestamp.
    pub fn touch(&self) {
        self.updated_at_nanos.store(uptime_nanos(), Ordering::SeqCst);
    }
    /// The status, preferring the port-aware value and falling back to the
    /// legacy one.
    pub fn status(&self) -> Option<Status> {
        let applications = self.applications.load();
        let value = applications
            .get(&AppStateKey::StatusWithPort)
            .or_else(|| applications.get(&AppStateKey::Status))?;
        match Status::parse(&value.value) {
            Ok(status) => Some(status),
            Err(e) => {
                log::warn!("Unparseable status {:?}: {}", value.value, e);
                None
            }
        }
    }
    /// The advertised token set, if any.
    pub fn tokens(&self) -> Option<Vec<Token>> {
        let value = self.application_state(AppStateKey::Tokens)?;
        parse_tokens(&value.value).ok()
    }
    /// The advertised release version, if any.
    pub fn release_version(&self) -> Option<String> {
        self.application_state(AppStateKey::ReleaseVersion).map(|v| v.value)
    }
    /// The advertised schema version, if any.
    pub fn schema_version(&self) -> Option<String> {
        self.application_state(AppStateKey::Schema).map(|v| v.value)
    }
    /// Whether the endpoint advertises itself ready for client requests.
    pub fn is_rpc_ready(&self) -> bool {
        self.application_state(AppStateKey::RpcReady)
            .map(|v| v.value == "true")
            .unwrap_or(false)
    }
}

impl Clone for EndpointState {
    fn clone(&self) -> Self {
        let state = Self::new(self.heartbeat());
        state
            .applications
            .store(Arc::new(HashMap::clone(&self.applications.load())));
        state.alive.store(self.is_alive(), Ordering::SeqCst);
        state
    }
}

impl std::fmt::Debug for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointState")
            .field("heartbeat", &self.heartbeat())
            .field("applications", &self.applications.load())
            .field("alive", &self.is_alive())
            .finish()
    }
}
