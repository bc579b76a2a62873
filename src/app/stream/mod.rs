// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module builds the fetch plan a bootstrapping, replacing or rebuilding
//! node hands to its streaming transport: one source per desired range,
//! constrained by replica consistency rules and composable source filters.

pub(crate) mod fetch;

use crate::app::{
    detector::FailureDetector,
    endpoint::EndpointId,
    ring::{
        Range,
        Token,
        TokenMap,
    },
    snitch::Snitch,
    store::StateStore,
    strategy::ReplicationStrategy,
};
use dyn_clone::DynClone;
use fetch::RangeFetchMapCalculator;
use std::{
    collections::{
        BTreeMap,
        BTreeSet,
        HashMap,
    },
    sync::Arc,
};
use thiserror::Error;

/// A source restriction; filters compose by conjunction.
pub trait SourceFilter: DynClone + Send + Sync {
    /// Whether the endpoint may serve as a stream source.
    fn accept(&self, endpoint: &EndpointId) -> bool;
}

dyn_clone::clone_trait_object!(SourceFilter);

/// Accepts only endpoints the failure detector currently considers alive.
#[derive(Clone)]
pub struct FailureDetectorSourceFilter {
    detector: Arc<FailureDetector>,
}

impl FailureDetectorSourceFilter {
    /// Create a filter over the given detector.
    pub fn new(detector: Arc<FailureDetector>) -> Self {
        Self { detector }
    }
}

impl SourceFilter for FailureDetectorSourceFilter {
    fn accept(&self, endpoint: &EndpointId) -> bool {
        self.detector.is_alive(endpoint)
    }
}

/// Accepts only endpoints of one datacenter.
#[derive(Clone)]
pub struct SingleDatacenterFilter {
    snitch: Arc<dyn Snitch>,
    datacenter: String,
}

impl SingleDatacenterFilter {
    /// Create a filter for the named datacenter.
    pub fn new(snitch: Arc<dyn Snitch>, datacenter: &str) -> Self {
        Self {
            snitch,
            datacenter: datacenter.to_string(),
        }
    }
}

impl SourceFilter for SingleDatacenterFilter {
    fn accept(&self, endpoint: &EndpointId) -> bool {
        self.snitch.datacenter(endpoint) == self.datacenter
    }
}

/// Rejects the local node.
#[derive(Clone)]
pub struct ExcludeLocalNodeFilter {
    local: EndpointId,
}

impl ExcludeLocalNodeFilter {
    /// Create a filter rejecting the given identity.
    pub fn new(local: EndpointId) -> Self {
        Self { local }
    }
}

impl SourceFilter for ExcludeLocalNodeFilter {
    fn accept(&self, endpoint: &EndpointId) -> bool {
        *endpoint != self.local
    }
}

/// Accepts only whitelisted endpoints.
#[derive(Clone)]
pub struct WhitelistedSourcesFilter {
    allowed: BTreeSet<EndpointId>,
}

impl WhitelistedSourcesFilter {
    /// Create a filter around the allowed set.
    pub fn new(allowed: BTreeSet<EndpointId>) -> Self {
        Self { allowed }
    }
}

impl SourceFilter for WhitelistedSourcesFilter {
    fn accept(&self, endpoint: &EndpointId) -> bool {
        self.allowed.contains(endpoint)
    }
}

/// A failure to build a fetch plan.
#[derive(Error, Debug)]
pub enum StreamError {
    /// No ring range covers a desired range, or no acceptable source remains.
    #[error("no sources found for range {range} in keyspace {keyspace}")]
    NoSources {
        /// The keyspace of the plan.
        keyspace: String,
        /// The uncoverable range.
        range: Range,
    },
    /// Strict consistency found zero or several hand-off sources.
    #[error("expected exactly one hand-off source for range {range} in keyspace {keyspace}, found {found}")]
    StrictSourceCount {
        /// The keyspace of the plan.
        keyspace: String,
        /// The affected range.
        range: Range,
        /// How many candidates were found.
        found: usize,
    },
    /// The unique strict source is not alive.
    #[error(
        "the unique hand-off source {source} for range {range} in keyspace {keyspace} is down; \
         disable strict consistency to stream from the remaining replicas"
    )]
    StrictSourceDown {
        /// The keyspace of the plan.
        keyspace: String,
        /// The affected range.
        range: Range,
        /// The dead hand-off source.
        source: EndpointId,
    },
}

/// The plan: every range each source will stream to this node.
pub type FetchMap = HashMap<EndpointId, Vec<Range>>;

/// Plans which existing replica streams each desired range. Operates on an
/// immutable ring snapshot, so it is re-entrant and may run off any thread.
pub struct RangeStreamer {
    ring: Arc<TokenMap>,
    local: EndpointId,
    local_tokens: Vec<Token>,
    replacing: Option<EndpointId>,
    description: String,
    snitch: Arc<dyn Snitch>,
    state_store: Arc<dyn StateStore>,
    filters: Vec<Box<dyn SourceFilter>>,
    use_strict: bool,
    to_fetch: HashMap<String, FetchMap>,
}

impl RangeStreamer {
    /// Create a planner over a ring snapshot.
    pub fn new(
        ring: Arc<TokenMap>,
        local: EndpointId,
        description: &str,
        snitch: Arc<dyn Snitch>,
        state_store: Arc<dyn StateStore>,
        use_strict: bool,
    ) -> Self {
        Self {
            ring,
            local,
            local_tokens: Vec::new(),
            replacing: None,
            description: description.to_string(),
            snitch,
            state_store,
            filters: Vec::new(),
            use_strict,
            to_fetch: HashMap::new(),
        }
    }
    /// The tokens the local node is claiming; required for strict hand-off
    /// computation.
    pub fn with_tokens(mut self, tokens: Vec<Token>) -> Self {
        self.local_tokens = tokens;
        self
    }
    /// The dead endpoint this node is replacing; it is excluded from the ring
    /// before hand-off sources are computed.
    pub fn with_replaced(mut self, replaced: EndpointId) -> Self {
        self.replacing = Some(replaced);
        self
    }
    /// Add a source restriction.
    pub fn add_source_filter(&mut self, filter: Box<dyn SourceFilter>) {
        self.filters.push(filter);
    }
    fn accepted(&self, endpoint: &EndpointId) -> bool {
        self.filters.iter().all(|filter| filter.accept(endpoint))
    }
    /// Plan the fetches for one keyspace, merging into the accumulated plan.
    pub fn add_ranges(
        &mut self,
        keyspace: &str,
        strategy: &dyn ReplicationStrategy,
        partitioner_name: &str,
        desired: Vec<Range>,
    ) -> Result<(), StreamError> {
        // subtract what the state store already holds
        let available = self.state_store.available_ranges(keyspace, partitioner_name);
        let mut residual = Vec::new();
        for range in desired {
            let mut pieces = vec![range];
            for have in &available {
                pieces = pieces.iter().flat_map(|piece| piece.subtract(have)).collect();
            }
            residual.extend(pieces);
        }
        if residual.is_empty() {
            log::info!(
                "{}: every requested range of keyspace {} is already available; nothing to stream",
                self.description,
                keyspace
            );
            return Ok(());
        }
        let use_strict = self.use_strict_for(strategy);
        let ranges_with_sources = if use_strict {
            self.all_ranges_with_strict_sources(keyspace, strategy, &residual)?
        } else {
            self.all_ranges_with_sources(keyspace, strategy, &residual)?
        };
        let fetch_map = if !use_strict && strategy.replication_factor() > 1 {
            self.optimized_fetch_map(keyspace, &ranges_with_sources)?
        } else {
            self.simple_fetch_map(keyspace, strategy, &ranges_with_sources)?
        };
        for (source, ranges) in &fetch_map {
            assert!(*source != self.local, "planned to fetch from the local node");
            assert!(self.accepted(source), "planned source rejected by a filter");
            log::debug!(
                "{}: keyspace {} will stream {} ranges from {}",
                self.description,
                keyspace,
                ranges.len(),
                source
            );
        }
        let entry = self.to_fetch.entry(keyspace.to_string()).or_default();
        for (source, ranges) in fetch_map {
            entry.entry(source).or_default().extend(ranges);
        }
        Ok(())
    }
    /// The accumulated plan.
    pub fn to_fetch(&self) -> &HashMap<String, FetchMap> {
        &self.to_fetch
    }
    /// Strict mode applies only when requested and when the cluster is bigger
    /// or smaller than the replication factor, since at equal size every node
    /// already replicates everything it will own.
    fn use_strict_for(&self, strategy: &dyn ReplicationStrategy) -> bool {
        self.use_strict && !self.local_tokens.is_empty() && self.ring.endpoint_count() != strategy.replication_factor()
    }
    /// Non-strict candidates: the current replicas of the ring range covering
    /// each desired range, sorted by proximity to the local node.
    fn all_ranges_with_sources(
        &self,
        keyspace: &str,
        strategy: &dyn ReplicationStrategy,
        desired: &[Range],
    ) -> Result<BTreeMap<Range, Vec<EndpointId>>, StreamError> {
        let mut out = BTreeMap::new();
        for range in desired {
            let mut found = false;
            for token in self.ring.sorted_tokens() {
                let ring_range = self.ring.primary_range_for(*token);
                if ring_range.contains_range(range) {
                    let replicas = strategy.calculate_natural_endpoints(*token, &self.ring);
                    let sorted = self.snitch.sorted_by_proximity(&self.local, replicas);
                    out.insert(*range, sorted);
                    found = true;
                    break;
                }
            }
            if !found {
                return Err(StreamError::NoSources {
                    keyspace: keyspace.to_string(),
                    range: *range,
                });
            }
        }
        Ok(out)
    }
    /// Strict candidates: exactly the replica that hands off its
    /// responsibility once the local node claims its tokens.
    fn all_ranges_with_strict_sources(
        &self,
        keyspace: &str,
        strategy: &dyn ReplicationStrategy,
        desired: &[Range],
    ) -> Result<BTreeMap<Range, Vec<EndpointId>>, StreamError> {
        let mut base = (*self.ring).clone();
        if let Some(replaced) = &self.replacing {
            base.remove_endpoint(replaced);
        }
        let mut with_local = base.clone();
        with_local.update_normal_tokens(&self.local, &self.local_tokens);
        let mut out = BTreeMap::new();
        for range in desired {
            let before: BTreeSet<_> = strategy
                .calculate_natural_endpoints(range.right, &base)
                .into_iter()
                .collect();
            let after: BTreeSet<_> = strategy
                .calculate_natural_endpoints(range.right, &with_local)
                .into_iter()
                .collect();
            let handoff: Vec<_> = before.difference(&after).cloned().collect();
            if handoff.len() != 1 {
                return Err(StreamError::StrictSourceCount {
                    keyspace: keyspace.to_string(),
                    range: *range,
                    found: handoff.len(),
                });
            }
            let source = handoff.into_iter().next().expect("checked length");
            if !self.accepted(&source) {
                return Err(StreamError::StrictSourceDown {
                    keyspace: keyspace.to_string(),
                    range: *range,
                    source,
                });
            }
            out.insert(*range, vec![source]);
        }
        Ok(out)
    }
    /// Walk candidates in proximity order and take the first acceptable one.
    /// An rf of one only warns on an unsourceable range unless strict
    /// consistency was demanded.
    fn simple_fetch_map(
        &self,
        keyspace: &str,
        strategy: &dyn ReplicationStrategy,
        ranges_with_sources: &BTreeMap<Range, Vec<EndpointId>>,
    ) -> Result<FetchMap, StreamError> {
        let mut fetch_map: FetchMap = HashMap::new();
        for (range, sources) in ranges_with_sources {
            let mut found = false;
            for source in sources {
                if *source == self.local {
                    // already local; nothing to transfer
                    found = true;
                    break;
                }
                if self.accepted(source) {
                    fetch_map.entry(source.clone()).or_default().push(*range);
                    found = true;
                    break;
                }
            }
            if !found {
                if strategy.replication_factor() == 1 && !self.use_strict {
                    log::warn!(
                        "{}: unable to find a source for range {} in keyspace {} at replication factor one; \
                         the range will not be fetched",
                        self.description,
                        range,
                        keyspace
                    );
                } else {
                    return Err(StreamError::NoSources {
                        keyspace: keyspace.to_string(),
                        range: *range,
                    });
                }
            }
        }
        Ok(fetch_map)
    }
    /// Balanced assignment over the filter-accepted candidates.
    fn optimized_fetch_map(
        &self,
        keyspace: &str,
        ranges_with_sources: &BTreeMap<Range, Vec<EndpointId>>,
    ) -> Result<FetchMap, StreamError> {
        let mut filtered: BTreeMap<Range, Vec<EndpointId>> = BTreeMap::new();
        for (range, sources) in ranges_with_sources {
            let acceptable: Vec<_> = sources
                .iter()
                .filter(|source| **source != self.local && self.accepted(source))
                .cloned()
                .collect();
            if sources.iter().any(|source| *source == self.local) && acceptable.is_empty() {
                // the local node already replicates it; nothing to transfer
                continue;
            }
            filtered.insert(*range, acceptable);
        }
        match RangeFetchMapCalculator::new(&filtered).calculate() {
            Some(fetch_map) => Ok(fetch_map),
            None => {
                let range = filtered
                    .iter()
                    .find(|(_, sources)| sources.is_empty())
                    .map(|(range, _)| *range)
                    .unwrap_or_else(|| *filtered.keys().next().expect("nonempty"));
                Err(StreamError::NoSources {
                    keyspace: keyspace.to_string(),
                    range,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{
        endpoint::HostId,
        ring::TokenRing,
        snitch::FixedSnitch,
        store::MemoryStateStore,
        strategy::SimpleStrategy,
    };
    use std::time::Duration;

    fn endpoint(last: u8) -> EndpointId {
        EndpointId::new(
            HostId::from_u64_pair(last as u64, 0),
            format!("127.0.0.{}:7000", last).parse().unwrap(),
        )
    }

    fn three_node_ring() -> Arc<TokenMap> {
        let ring = TokenRing::new();
        ring.update_normal_tokens(&endpoint(1), &[10]);
        ring.update_normal_tokens(&endpoint(2), &[20]);
        ring.update_normal_tokens(&endpoint(3), &[30]);
        ring.clone_only_token_map()
    }

    fn live_detector(endpoints: &[EndpointId]) -> Arc<FailureDetector> {
        let detector = Arc::new(FailureDetector::new(8.0, Duration::from_secs(1)));
        for endpoint in endpoints {
            detector.report(endpoint);
        }
        detector
    }

    #[test]
    fn bootstrap_fetch_names_a_current_replica() {
        // cluster a@10 b@20 c@30 at rf 3; d joins with token 15 and wants
        // (10, 15]
        let local = endpoint(4);
        let snitch = Arc::new(FixedSnitch::new(vec![endpoint(2), endpoint(3), endpoint(1)]));
        let mut streamer = RangeStreamer::new(
            three_node_ring(),
            local.clone(),
            "Bootstrap",
            snitch,
            Arc::new(MemoryStateStore::new()),
            false,
        );
        let detector = live_detector(&[endpoint(1), endpoint(2), endpoint(3)]);
        streamer.add_source_filter(Box::new(FailureDetectorSourceFilter::new(detector)));
        streamer.add_source_filter(Box::new(ExcludeLocalNodeFilter::new(local)));
        streamer
            .add_ranges("ks", &SimpleStrategy::new(3), "Murmur3Partitioner", vec![Range::new(10, 15)])
            .unwrap();
        let plan = &streamer.to_fetch()["ks"];
        let total: usize = plan.values().map(|ranges| ranges.len()).sum();
        assert_eq!(total, 1);
        let (source, ranges) = plan.iter().next().unwrap();
        assert!([endpoint(1), endpoint(2), endpoint(3)].contains(source));
        assert_eq!(ranges, &vec![Range::new(10, 15)]);
    }

    #[test]
    fn strict_replacement_streams_from_the_handoff_replica() {
        // d replaces b: claims b's token while b is absent from the candidate
        // set
        let local = endpoint(4);
        let ring = TokenRing::new();
        ring.update_normal_tokens(&endpoint(1), &[10]);
        ring.update_normal_tokens(&endpoint(2), &[20]);
        ring.update_normal_tokens(&endpoint(3), &[30]);
        ring.update_normal_tokens(&endpoint(5), &[40]);
        let snapshot = ring.clone_only_token_map();
        let mut streamer = RangeStreamer::new(
            snapshot,
            local.clone(),
            "Replace",
            Arc::new(FixedSnitch::new(vec![])),
            Arc::new(MemoryStateStore::new()),
            true,
        )
        .with_tokens(vec![15]);
        let detector = live_detector(&[endpoint(1), endpoint(2), endpoint(3), endpoint(5)]);
        streamer.add_source_filter(Box::new(FailureDetectorSourceFilter::new(detector.clone())));
        streamer.add_source_filter(Box::new(ExcludeLocalNodeFilter::new(local)));
        streamer
            .add_ranges("ks", &SimpleStrategy::new(2), "Murmur3Partitioner", vec![Range::new(10, 15)])
            .unwrap();
        let plan = &streamer.to_fetch()["ks"];
        assert_eq!(plan.len(), 1);
        // before: (10,15] is replicated by b@20 and c@30; with d@15 inserted
        // it moves to d and b, so c hands off
        assert_eq!(plan.keys().next().unwrap(), &endpoint(3));
    }

    #[test]
    fn strict_replacement_with_the_dead_nodes_tokens_never_names_it() {
        // d replaces b, claiming exactly b's token; the hand-off source must
        // be a surviving replica, never b or d
        let local = endpoint(4);
        let ring = TokenRing::new();
        ring.update_normal_tokens(&endpoint(1), &[10]);
        ring.update_normal_tokens(&endpoint(2), &[20]);
        ring.update_normal_tokens(&endpoint(3), &[30]);
        ring.update_normal_tokens(&endpoint(5), &[40]);
        let mut streamer = RangeStreamer::new(
            ring.clone_only_token_map(),
            local.clone(),
            "Replace",
            Arc::new(FixedSnitch::new(vec![])),
            Arc::new(MemoryStateStore::new()),
            true,
        )
        .with_tokens(vec![20])
        .with_replaced(endpoint(2));
        let detector = live_detector(&[endpoint(1), endpoint(3), endpoint(5)]);
        streamer.add_source_filter(Box::new(FailureDetectorSourceFilter::new(detector)));
        streamer.add_source_filter(Box::new(ExcludeLocalNodeFilter::new(local)));
        streamer
            .add_ranges("ks", &SimpleStrategy::new(2), "Murmur3Partitioner", vec![Range::new(10, 20)])
            .unwrap();
        let plan = &streamer.to_fetch()["ks"];
        // without b the range is replicated by c and e; with d claiming b's
        // token it moves to d and c, so e hands off
        assert_eq!(plan.keys().collect::<Vec<_>>(), vec![&endpoint(5)]);
    }

    #[test]
    fn strict_mode_fails_when_the_handoff_source_is_down() {
        let local = endpoint(4);
        let mut streamer = RangeStreamer::new(
            three_node_ring(),
            local.clone(),
            "Replace",
            Arc::new(FixedSnitch::new(vec![])),
            Arc::new(MemoryStateStore::new()),
            true,
        )
        .with_tokens(vec![15]);
        // nothing reported to the detector, so every source is down
        let detector = Arc::new(FailureDetector::new(8.0, Duration::from_secs(1)));
        streamer.add_source_filter(Box::new(FailureDetectorSourceFilter::new(detector)));
        let result = streamer.add_ranges("ks", &SimpleStrategy::new(2), "Murmur3Partitioner", vec![Range::new(10, 15)]);
        assert!(matches!(result, Err(StreamError::StrictSourceDown { .. })));
    }

    #[test]
    fn rf_one_carveout_warns_instead_of_failing() {
        let local = endpoint(4);
        let mut streamer = RangeStreamer::new(
            three_node_ring(),
            local.clone(),
            "Rebuild",
            Arc::new(FixedSnitch::new(vec![])),
            Arc::new(MemoryStateStore::new()),
            false,
        );
        // no heartbeats at all: every candidate is rejected
        let detector = Arc::new(FailureDetector::new(8.0, Duration::from_secs(1)));
        streamer.add_source_filter(Box::new(FailureDetectorSourceFilter::new(detector)));
        streamer
            .add_ranges("ks", &SimpleStrategy::new(1), "Murmur3Partitioner", vec![Range::new(10, 15)])
            .unwrap();
        assert!(streamer
            .to_fetch()
            .get("ks")
            .map(|plan| plan.is_empty())
            .unwrap_or(true));
    }

    #[test]
    fn whitelist_filter_restricts_sources() {
        let local = endpoint(4);
        let mut streamer = RangeStreamer::new(
            three_node_ring(),
            local.clone(),
            "Rebuild",
            Arc::new(FixedSnitch::new(vec![endpoint(1), endpoint(2), endpoint(3)])),
            Arc::new(MemoryStateStore::new()),
            false,
        );
        let allowed: BTreeSet<_> = vec![endpoint(3)].into_iter().collect();
        streamer.add_source_filter(Box::new(WhitelistedSourcesFilter::new(allowed)));
        streamer
            .add_ranges("ks", &SimpleStrategy::new(3), "Murmur3Partitioner", vec![Range::new(10, 15)])
            .unwrap();
        let plan = &streamer.to_fetch()["ks"];
        assert_eq!(plan.keys().collect::<Vec<_>>(), vec![&endpoint(3)]);
    }

    #[test]
    fn already_streamed_ranges_are_skipped() {
        let local = endpoint(4);
        let store = Arc::new(MemoryStateStore::new());
        store.ranges_received("ks", &[Range::new(10, 15)]);
        let mut streamer = RangeStreamer::new(
            three_node_ring(),
            local,
            "Bootstrap",
            Arc::new(FixedSnitch::new(vec![])),
            store,
            false,
        );
        streamer
            .add_ranges("ks", &SimpleStrategy::new(3), "Murmur3Partitioner", vec![Range::new(10, 15)])
            .unwrap();
        assert!(streamer.to_fetch().is_empty());
    }

    #[test]
    fn uncovered_ranges_fail_with_no_sources() {
        let local = endpoint(4);
        let ring = TokenRing::new();
        ring.update_normal_tokens(&endpoint(1), &[10]);
        ring.update_normal_tokens(&endpoint(2), &[20]);
        let mut streamer = RangeStreamer::new(
            ring.clone_only_token_map(),
            local,
            "Rebuild",
            Arc::new(FixedSnitch::new(vec![])),
            Arc::new(MemoryStateStore::new()),
            false,
        );
        // (5, 25] spans two ring ranges, so no single ring range covers it
        let result = streamer.add_ranges("ks", &SimpleStrategy::new(2), "Murmur3Partitioner", vec![Range::new(5, 25)]);
        assert!(matches!(result, Err(StreamError::NoSources { .. })));
    }
}
