// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module implements the authoritative local token ring metadata: the
//! token to endpoint map with its derived views for bootstrapping, leaving,
//! moving and replacement endpoints, plus the cached pending ranges per
//! keyspace.

pub mod pending;
pub mod token;
pub mod topology;
pub mod updater;

pub use pending::PendingRanges;
pub use token::{
    Murmur3Partitioner,
    Partitioner,
    Range,
    Token,
    MIN_TOKEN,
};
pub use topology::Topology;
pub use updater::RingUpdater;

use crate::app::{
    endpoint::{
        EndpointId,
        HostId,
    },
    strategy::ReplicationStrategy,
};
use std::{
    collections::{
        BTreeMap,
        BTreeSet,
        HashMap,
    },
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
        Mutex,
        RwLock,
    },
};
use thiserror::Error;

/// A conflicting mutation of membership state. Surfaced to the caller; the
/// ring is left untouched.
#[derive(Error, Debug)]
pub enum StateConflict {
    /// A bootstrap token is already claimed by another endpoint.
    #[error("bootstrap token {token} conflicts with endpoint {owner}")]
    TokenCollision {
        /// The contested token.
        token: Token,
        /// The endpoint already holding it.
        owner: EndpointId,
    },
    /// A host id is already claimed by a live endpoint.
    #[error("host id {host_id} is already held by live endpoint {endpoint}")]
    HostIdCollision {
        /// The contested host id.
        host_id: HostId,
        /// The endpoint already holding it.
        endpoint: EndpointId,
    },
}

/// The token to endpoint view of the ring, with the datacenter topology of
/// its members. Handed out as a deep snapshot by [`TokenRing`] and used as
/// the working type for ring simulations.
#[derive(Clone, Debug, Default)]
pub struct TokenMap {
    token_to_endpoint: BTreeMap<Token, EndpointId>,
    endpoint_to_tokens: HashMap<EndpointId, BTreeSet<Token>>,
    sorted_tokens: Vec<Token>,
    topology: Topology,
}

impl TokenMap {
    fn rebuild_sorted(&mut self) {
        self.sorted_tokens = self.token_to_endpoint.keys().copied().collect();
    }
    /// The strictly ascending token list.
    pub fn sorted_tokens(&self) -> &[Token] {
        &self.sorted_tokens
    }
    /// All member endpoints.
    pub fn endpoints(&self) -> impl Iterator<Item = &EndpointId> {
        self.endpoint_to_tokens.keys()
    }
    /// Number of member endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.endpoint_to_tokens.len()
    }
    /// The owner of an exact token.
    pub fn owner(&self, token: Token) -> Option<&EndpointId> {
        self.token_to_endpoint.get(&token)
    }
    /// The tokens of a member endpoint.
    pub fn tokens_of(&self, endpoint: &EndpointId) -> Option<&BTreeSet<Token>> {
        self.endpoint_to_tokens.get(endpoint)
    }
    /// Whether the endpoint holds any normal token.
    pub fn is_member(&self, endpoint: &EndpointId) -> bool {
        self.endpoint_to_tokens.contains_key(endpoint)
    }
    /// The datacenter and rack layout of the members.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }
    /// Mutable access to the layout; used when building simulations.
    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topology
    }
    /// The member holding the given host id, if any.
    pub fn endpoint_by_host_id(&self, host_id: HostId) -> Option<&EndpointId> {
        self.endpoint_to_tokens.keys().find(|e| e.host_id() == host_id)
    }
    /// Make the endpoint the owner of exactly the given tokens, transferring
    /// any that belonged to other endpoints.
    pub fn update_normal_tokens(&mut self, endpoint: &EndpointId, tokens: &[Token]) {
        if let Some(old) = self.endpoint_to_tokens.remove(endpoint) {
            for token in old {
                self.token_to_endpoint.remove(&token);
            }
        }
        let mut owned = BTreeSet::new();
        for token in tokens {
            if let Some(previous) = self.token_to_endpoint.insert(*token, endpoint.clone()) {
                if previous != *endpoint {
                    let now_empty = match self.endpoint_to_tokens.get_mut(&previous) {
                        Some(tokens) => {
                            tokens.remove(token);
                            tokens.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        self.endpoint_to_tokens.remove(&previous);
                        self.topology.remove_endpoint(&previous);
                    }
                }
            }
            owned.insert(*token);
        }
        self.endpoint_to_tokens.insert(endpoint.clone(), owned);
        self.rebuild_sorted();
    }
    /// Drop a member and its tokens.
    pub fn remove_endpoint(&mut self, endpoint: &EndpointId) {
        if let Some(tokens) = self.endpoint_to_tokens.remove(endpoint) {
            for token in tokens {
                self.token_to_endpoint.remove(&token);
            }
            self.rebuild_sorted();
        }
        self.topology.remove_endpoint(endpoint);
    }
    /// The index of the first token at or after `start`, wrapping to zero
    /// past the largest token.
    pub fn first_token_index(&self, start: Token) -> usize {
        assert!(!self.sorted_tokens.is_empty(), "token ring is empty");
        match self.sorted_tokens.binary_search(&start) {
            Ok(index) => index,
            Err(index) => {
                if index == self.sorted_tokens.len() {
                    0
                } else {
                    index
                }
            }
        }
    }
    /// The tokens starting at the first at or after `start`, walking the full
    /// ring once.
    pub fn ring_iterator(&self, start: Token) -> impl Iterator<Item = Token> + '_ {
        let len = self.sorted_tokens.len();
        let first = if len == 0 { 0 } else { self.first_token_index(start) };
        (0..len).map(move |offset| self.sorted_tokens[(first + offset) % len])
    }
    /// The token preceding the given ring token, wrapping below the smallest.
    pub fn predecessor(&self, token: Token) -> Token {
        let index = self
            .sorted_tokens
            .binary_search(&token)
            .expect("token not present in the ring");
        if index == 0 {
            *self.sorted_tokens.last().expect("token ring is empty")
        } else {
            self.sorted_tokens[index - 1]
        }
    }
    /// The token following the given ring token, wrapping past the largest.
    pub fn successor(&self, token: Token) -> Token {
        let index = self
            .sorted_tokens
            .binary_search(&token)
            .expect("token not present in the ring");
        self.sorted_tokens[(index + 1) % self.sorted_tokens.len()]
    }
    /// The primary range of a ring token: `(predecessor, token]`.
    pub fn primary_range_for(&self, token: Token) -> Range {
        Range::new(self.predecessor(token), token)
    }
    /// The primary ranges of all the endpoint's tokens.
    pub fn primary_ranges_for(&self, endpoint: &EndpointId) -> Vec<Range> {
        self.tokens_of(endpoint)
            .map(|tokens| tokens.iter().map(|t| self.primary_range_for(*t)).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct RingState {
    map: TokenMap,
    bootstrap_tokens: BTreeMap<Token, EndpointId>,
    leaving: BTreeSet<EndpointId>,
    moving: BTreeMap<EndpointId, Token>,
    replacement_to_original: HashMap<EndpointId, EndpointId>,
    original_to_replacement: HashMap<EndpointId, EndpointId>,
}

impl RingState {
    fn forget_transients(&mut self, endpoint: &EndpointId) {
        self.bootstrap_tokens.retain(|_, e| e != endpoint);
        self.leaving.remove(endpoint);
        self.moving.remove(endpoint);
        if let Some(original) = self.replacement_to_original.remove(endpoint) {
            self.original_to_replacement.remove(&original);
        }
        if let Some(replacement) = self.original_to_replacement.remove(endpoint) {
            self.replacement_to_original.remove(&replacement);
        }
    }
}

/// The authoritative ring metadata. Mutators take the write lock, observers
/// the read lock; pending ranges live under their own monitor so long
/// recalculations never block readers of the token view.
pub struct TokenRing {
    state: RwLock<RingState>,
    pending: Mutex<HashMap<String, Arc<PendingRanges>>>,
    ring_version: AtomicU64,
    cached_map: Mutex<Option<(u64, Arc<TokenMap>)>>,
}

impl Default for TokenRing {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenRing {
    /// Create empty ring metadata.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RingState::default()),
            pending: Mutex::new(HashMap::new()),
            ring_version: AtomicU64::new(0),
            cached_map: Mutex::new(None),
        }
    }
    fn invalidate(&self) {
        self.ring_version.fetch_add(1, Ordering::SeqCst);
    }
    /// The monotonic counter bumped on every mutation; a happens-before fence
    /// for derived caches.
    pub fn ring_version(&self) -> u64 {
        self.ring_version.load(Ordering::SeqCst)
    }
    /// Record the datacenter and rack of an endpoint.
    pub fn update_topology(&self, endpoint: &EndpointId, dc: &str, rack: &str) {
        let mut state = self.state.write().expect("ring lock poisoned");
        state.map.topology.add_endpoint(endpoint, dc, rack);
        drop(state);
        self.invalidate();
    }
    /// Settle the endpoint as the normal owner of the given tokens, clearing
    /// it out of every transient set.
    pub fn update_normal_tokens(&self, endpoint: &EndpointId, tokens: &[Token]) {
        let mut state = self.state.write().expect("ring lock poisoned");
        state.forget_transients(endpoint);
        for token in tokens {
            match state.map.owner(*token) {
                Some(owner) if owner != endpoint => {
                    log::warn!("Token {} changing ownership from {} to {}", token, owner, endpoint);
                }
                _ => {}
            }
        }
        state.map.update_normal_tokens(endpoint, tokens);
        drop(state);
        self.invalidate();
    }
    /// Record a joining endpoint and its claimed tokens, rejecting collisions
    /// with other bootstrappers or with settled owners other than the
    /// replacement original.
    pub fn add_bootstrap_tokens(
        &self,
        tokens: &[Token],
        endpoint: &EndpointId,
        original: Option<&EndpointId>,
    ) -> Result<(), StateConflict> {
        let mut state = self.state.write().expect("ring lock poisoned");
        for token in tokens {
            if let Some(claimant) = state.bootstrap_tokens.get(token) {
                if claimant != endpoint {
                    return Err(StateConflict::TokenCollision {
                        token: *token,
                        owner: claimant.clone(),
                    });
                }
            }
            if let Some(owner) = state.map.owner(*token) {
                if owner != endpoint && Some(owner) != original {
                    return Err(StateConflict::TokenCollision {
                        token: *token,
                        owner: owner.clone(),
                    });
                }
            }
        }
        state.bootstrap_tokens.retain(|_, e| e != endpoint);
        for token in tokens {
            state.bootstrap_tokens.insert(*token, endpoint.clone());
        }
        if let Some(original) = original {
            state
                .replacement_to_original
                .insert(endpoint.clone(), original.clone());
            state
                .original_to_replacement
                .insert(original.clone(), endpoint.clone());
        }
        drop(state);
        self.invalidate();
        Ok(())
    }
    /// Drop bootstrap claims for the given tokens.
    pub fn remove_bootstrap_tokens(&self, tokens: &[Token]) {
        let mut state = self.state.write().expect("ring lock poisoned");
        for token in tokens {
            state.bootstrap_tokens.remove(token);
        }
        drop(state);
        self.invalidate();
    }
    /// Record a decommissioning member.
    pub fn add_leaving_endpoint(&self, endpoint: &EndpointId) {
        self.state
            .write()
            .expect("ring lock poisoned")
            .leaving
            .insert(endpoint.clone());
        self.invalidate();
    }
    /// Record a member relocating one token.
    pub fn add_moving_endpoint(&self, token: Token, endpoint: &EndpointId) {
        self.state
            .write()
            .expect("ring lock poisoned")
            .moving
            .insert(endpoint.clone(), token);
        self.invalidate();
    }
    /// Drop a member from the moving set.
    pub fn remove_moving_endpoint(&self, endpoint: &EndpointId) {
        self.state
            .write()
            .expect("ring lock poisoned")
            .moving
            .remove(endpoint);
        self.invalidate();
    }
    /// Drop an endpoint from every view, including the topology.
    pub fn remove_endpoint(&self, endpoint: &EndpointId) {
        let mut state = self.state.write().expect("ring lock poisoned");
        state.forget_transients(endpoint);
        state.map.remove_endpoint(endpoint);
        drop(state);
        self.invalidate();
    }
    /// Whether the endpoint holds any normal token.
    pub fn is_member(&self, endpoint: &EndpointId) -> bool {
        self.state.read().expect("ring lock poisoned").map.is_member(endpoint)
    }
    /// The tokens of a member.
    pub fn tokens_of(&self, endpoint: &EndpointId) -> Vec<Token> {
        self.state
            .read()
            .expect("ring lock poisoned")
            .map
            .tokens_of(endpoint)
            .map(|tokens| tokens.iter().copied().collect())
            .unwrap_or_default()
    }
    /// The current bootstrap claims.
    pub fn bootstrap_tokens(&self) -> BTreeMap<Token, EndpointId> {
        self.state.read().expect("ring lock poisoned").bootstrap_tokens.clone()
    }
    /// The decommissioning members.
    pub fn leaving_endpoints(&self) -> BTreeSet<EndpointId> {
        self.state.read().expect("ring lock poisoned").leaving.clone()
    }
    /// The relocating members and their target tokens.
    pub fn moving_endpoints(&self) -> BTreeMap<EndpointId, Token> {
        self.state.read().expect("ring lock poisoned").moving.clone()
    }
    /// The endpoint this replacement is standing in for, if any.
    pub fn replacement_original(&self, replacement: &EndpointId) -> Option<EndpointId> {
        self.state
            .read()
            .expect("ring lock poisoned")
            .replacement_to_original
            .get(replacement)
            .cloned()
    }
    /// The endpoint replacing this member, if any.
    pub fn replacement_of(&self, original: &EndpointId) -> Option<EndpointId> {
        self.state
            .read()
            .expect("ring lock poisoned")
            .original_to_replacement
            .get(original)
            .cloned()
    }
    /// Number of settled members. Racy by design; used only for sizing.
    pub fn member_count(&self) -> usize {
        self.state.read().expect("ring lock poisoned").map.endpoint_count()
    }
    /// A read-only deep snapshot of the token to endpoint view and topology,
    /// cached until the next mutation.
    pub fn clone_only_token_map(&self) -> Arc<TokenMap> {
        let version = self.ring_version();
        let mut cached = self.cached_map.lock().expect("cache lock poisoned");
        if let Some((cached_version, map)) = cached.as_ref() {
            if *cached_version == version {
                return map.clone();
            }
        }
        let map = Arc::new(self.state.read().expect("ring lock poisoned").map.clone());
        *cached = Some((version, map.clone()));
        map
    }
    /// The ring as it will look once every leaving endpoint has left.
    pub fn clone_after_all_left(&self) -> TokenMap {
        let state = self.state.read().expect("ring lock poisoned");
        let mut map = state.map.clone();
        for endpoint in &state.leaving {
            map.remove_endpoint(endpoint);
        }
        map
    }
    /// The ring as it will look once every leave and move has settled.
    pub fn clone_after_all_settled(&self) -> TokenMap {
        let state = self.state.read().expect("ring lock poisoned");
        let mut map = state.map.clone();
        for endpoint in &state.leaving {
            map.remove_endpoint(endpoint);
        }
        for (endpoint, token) in &state.moving {
            map.update_normal_tokens(endpoint, &[*token]);
        }
        map
    }
    /// Recompute and atomically publish the pending ranges of one keyspace.
    /// Inputs are snapshotted under the read lock; the calculation itself
    /// runs lock free.
    pub fn calculate_pending_ranges(&self, strategy: &dyn ReplicationStrategy, keyspace: &str) {
        let (map, bootstrap_tokens, leaving, moving) = {
            let state = self.state.read().expect("ring lock poisoned");
            (
                state.map.clone(),
                state.bootstrap_tokens.clone(),
                state.leaving.clone(),
                state.moving.clone(),
            )
        };
        let ranges = pending::calculate_pending_ranges(strategy, &map, &bootstrap_tokens, &leaving, &moving);
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(keyspace.to_string(), Arc::new(ranges));
    }
    /// The cached pending ranges of a keyspace.
    pub fn pending_ranges(&self, keyspace: &str) -> Option<Arc<PendingRanges>> {
        self.pending.lock().expect("pending lock poisoned").get(keyspace).cloned()
    }
    /// The pending destinations whose ranges cover the given token.
    pub fn pending_endpoints_for(&self, token: Token, keyspace: &str) -> Vec<EndpointId> {
        self.pending_ranges(keyspace)
            .map(|pending| pending.pending_endpoints_for(token))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::endpoint::HostId;

    pub(crate) fn endpoint(last: u8) -> EndpointId {
        EndpointId::new(
            HostId::from_u64_pair(last as u64, 0),
            format!("127.0.0.{}:7000", last).parse().unwrap(),
        )
    }

    #[test]
    fn sorted_tokens_track_the_token_map() {
        let ring = TokenRing::new();
        ring.update_normal_tokens(&endpoint(1), &[30, 10]);
        ring.update_normal_tokens(&endpoint(2), &[20]);
        let map = ring.clone_only_token_map();
        assert_eq!(map.sorted_tokens(), &[10, 20, 30]);
        assert_eq!(map.owner(20), Some(&endpoint(2)));
        // tokens move wholesale on re-announcement
        ring.update_normal_tokens(&endpoint(1), &[40]);
        let map = ring.clone_only_token_map();
        assert_eq!(map.sorted_tokens(), &[20, 40]);
    }

    #[test]
    fn primary_range_wraps_at_the_smallest_token() {
        let ring = TokenRing::new();
        ring.update_normal_tokens(&endpoint(1), &[10]);
        ring.update_normal_tokens(&endpoint(2), &[20]);
        ring.update_normal_tokens(&endpoint(3), &[30]);
        let map = ring.clone_only_token_map();
        assert_eq!(map.primary_range_for(20), Range::new(10, 20));
        assert_eq!(map.primary_range_for(10), Range::new(30, 10));
        assert_eq!(map.successor(30), 10);
        assert_eq!(map.predecessor(10), 30);
    }

    #[test]
    fn bootstrap_collisions_are_rejected() {
        let ring = TokenRing::new();
        ring.update_normal_tokens(&endpoint(1), &[10]);
        ring.add_bootstrap_tokens(&[15], &endpoint(2), None).unwrap();
        // another bootstrapper claiming the same token
        assert!(matches!(
            ring.add_bootstrap_tokens(&[15], &endpoint(3), None),
            Err(StateConflict::TokenCollision { token: 15, .. })
        ));
        // a settled owner's token, not being replaced
        assert!(ring.add_bootstrap_tokens(&[10], &endpoint(3), None).is_err());
        // the same token is fine when replacing its owner
        ring.add_bootstrap_tokens(&[10], &endpoint(3), Some(&endpoint(1)))
            .unwrap();
        assert_eq!(ring.replacement_original(&endpoint(3)), Some(endpoint(1)));
        assert_eq!(ring.replacement_of(&endpoint(1)), Some(endpoint(3)));
    }

    #[test]
    fn settling_clears_transient_sets() {
        let ring = TokenRing::new();
        ring.update_normal_tokens(&endpoint(1), &[10]);
        ring.add_bootstrap_tokens(&[15], &endpoint(2), None).unwrap();
        ring.add_leaving_endpoint(&endpoint(1));
        ring.update_normal_tokens(&endpoint(2), &[15]);
        assert!(ring.bootstrap_tokens().is_empty());
        assert!(ring.leaving_endpoints().contains(&endpoint(1)));
        ring.update_normal_tokens(&endpoint(1), &[10]);
        assert!(ring.leaving_endpoints().is_empty());
    }

    #[test]
    fn clone_after_all_left_and_settled() {
        let ring = TokenRing::new();
        ring.update_normal_tokens(&endpoint(1), &[10]);
        ring.update_normal_tokens(&endpoint(2), &[20]);
        ring.update_normal_tokens(&endpoint(3), &[30]);
        ring.add_leaving_endpoint(&endpoint(2));
        ring.add_moving_endpoint(35, &endpoint(3));
        let left = ring.clone_after_all_left();
        assert_eq!(left.sorted_tokens(), &[10, 30]);
        let settled = ring.clone_after_all_settled();
        assert_eq!(settled.sorted_tokens(), &[10, 35]);
        assert_eq!(settled.owner(35), Some(&endpoint(3)));
        // the authoritative view is untouched
        assert_eq!(ring.clone_only_token_map().sorted_tokens(), &[10, 20, 30]);
    }

    #[test]
    fn snapshot_cache_invalidates_on_mutation() {
        let ring = TokenRing::new();
        ring.update_normal_tokens(&endpoint(1), &[10]);
        let first = ring.clone_only_token_map();
        assert!(Arc::ptr_eq(&first, &ring.clone_only_token_map()));
        ring.update_normal_tokens(&endpoint(2), &[20]);
        assert!(!Arc::ptr_eq(&first, &ring.clone_only_token_map()));
    }

    #[test]
    fn removal_erases_topology() {
        let ring = TokenRing::new();
        ring.update_topology(&endpoint(1), "dc1", "r1");
        ring.update_normal_tokens(&endpoint(1), &[10]);
        ring.remove_endpoint(&endpoint(1));
        let map = ring.clone_only_token_map();
        assert!(map.topology().location(&endpoint(1)).is_none());
        assert!(map.sorted_tokens().is_empty());
    }
}
