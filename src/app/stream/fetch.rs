// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module balances a fetch plan: every range is assigned exactly one of
//! its candidate sources while the heaviest source load is minimized. The
//! assignment is a bipartite matching with a progressively raised per-source
//! bound, with ties broken by source identity and range lower bound so the
//! result is reproducible.

use crate::app::{
    endpoint::EndpointId,
    ring::Range,
};
use std::collections::{
    BTreeMap,
    HashMap,
};

/// Assigns each range one source from its candidates, balancing load.
pub(crate) struct RangeFetchMapCalculator {
    ranges: Vec<Range>,
    candidates: Vec<Vec<usize>>,
    sources: Vec<EndpointId>,
}

impl RangeFetchMapCalculator {
    /// Build a calculator from filtered candidate sources per range.
    pub(crate) fn new(ranges_with_sources: &BTreeMap<Range, Vec<EndpointId>>) -> Self {
        let mut sources: Vec<EndpointId> = ranges_with_sources
            .values()
            .flatten()
            .cloned()
            .collect();
        sources.sort_unstable();
        sources.dedup();
        let mut ranges = Vec::with_capacity(ranges_with_sources.len());
        let mut candidates = Vec::with_capacity(ranges_with_sources.len());
        // ranges in lower-bound order, candidates in source identity order
        for (range, range_sources) in ranges_with_sources {
            ranges.push(*range);
            let mut indices: Vec<usize> = range_sources
                .iter()
                .map(|source| sources.binary_search(source).expect("source must be indexed"))
                .collect();
            indices.sort_unstable();
            indices.dedup();
            candidates.push(indices);
        }
        Self {
            ranges,
            candidates,
            sources,
        }
    }
    /// Compute the balanced assignment. Returns `None` for any range with no
    /// candidate at all.
    pub(crate) fn calculate(&self) -> Option<HashMap<EndpointId, Vec<Range>>> {
        if self.ranges.is_empty() {
            return Some(HashMap::new());
        }
        if self.candidates.iter().any(|candidates| candidates.is_empty()) {
            return None;
        }
        let minimum = (self.ranges.len() + self.sources.len() - 1) / self.sources.len();
        for bound in minimum..=self.ranges.len() {
            if let Some(assignment) = self.try_bound(bound) {
                let mut fetch_map: HashMap<EndpointId, Vec<Range>> = HashMap::new();
                for (range_index, source_index) in assignment.into_iter().enumerate() {
                    fetch_map
                        .entry(self.sources[source_index].clone())
                        .or_default()
                        .push(self.ranges[range_index]);
                }
                return Some(fetch_map);
            }
        }
        None
    }
    /// Try to assign every range with at most `bound` ranges per source,
    /// using augmenting paths.
    fn try_bound(&self, bound: usize) -> Option<Vec<usize>> {
        let mut assignment: Vec<Option<usize>> = vec![None; self.ranges.len()];
        let mut loads: Vec<usize> = vec![0; self.sources.len()];
        for range_index in 0..self.ranges.len() {
            let mut visited = vec![false; self.ranges.len()];
            if !self.augment(range_index, bound, &mut assignment, &mut loads, &mut visited) {
                return None;
            }
        }
        Some(assignment.into_iter().map(|slot| slot.expect("assigned")).collect())
    }
    fn augment(
        &self,
        range_index: usize,
        bound: usize,
        assignment: &mut Vec<Option<usize>>,
        loads: &mut Vec<usize>,
        visited: &mut Vec<bool>,
    ) -> bool {
        if visited[range_index] {
            return false;
        }
        visited[range_index] = true;
        // a source below the bound takes the range directly
        for &source_index in &self.candidates[range_index] {
            if loads[source_index] < bound {
                assignment[range_index] = Some(source_index);
                loads[source_index] += 1;
                return true;
            }
        }
        // otherwise try to reroute a range held by one of our candidates
        for &source_index in &self.candidates[range_index] {
            for other in 0..assignment.len() {
                if assignment[other] == Some(source_index)
                    && self.reroute(other, bound, assignment, loads, visited)
                {
                    assignment[range_index] = Some(source_index);
                    loads[source_index] += 1;
                    return true;
                }
            }
        }
        false
    }
    fn reroute(
        &self,
        range_index: usize,
        bound: usize,
        assignment: &mut Vec<Option<usize>>,
        loads: &mut Vec<usize>,
        visited: &mut Vec<bool>,
    ) -> bool {
        if visited[range_index] {
            return false;
        }
        visited[range_index] = true;
        let current = assignment[range_index].expect("rerouted range must be assigned");
        for &source_index in &self.candidates[range_index] {
            if source_index != current && loads[source_index] < bound {
                loads[current] -= 1;
                loads[source_index] += 1;
                assignment[range_index] = Some(source_index);
                return true;
            }
        }
        for &source_index in &self.candidates[range_index] {
            if source_index == current {
                continue;
            }
            for other in 0..assignment.len() {
                if assignment[other] == Some(source_index)
                    && self.reroute(other, bound, assignment, loads, visited)
                {
                    loads[current] -= 1;
                    loads[source_index] += 1;
                    assignment[range_index] = Some(source_index);
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::endpoint::HostId;
    use maplit::btreemap;

    fn endpoint(last: u8) -> EndpointId {
        EndpointId::new(
            HostId::from_u64_pair(last as u64, 0),
            format!("127.0.0.{}:7000", last).parse().unwrap(),
        )
    }

    #[test]
    fn spreads_load_across_shared_candidates() {
        let a = endpoint(1);
        let b = endpoint(2);
        let sources = vec![a.clone(), b.clone()];
        let ranges = btreemap! {
            Range::new(0, 10) => sources.clone(),
            Range::new(10, 20) => sources.clone(),
            Range::new(20, 30) => sources.clone(),
            Range::new(30, 40) => sources,
        };
        let fetch_map = RangeFetchMapCalculator::new(&ranges).calculate().unwrap();
        assert_eq!(fetch_map[&a].len(), 2);
        assert_eq!(fetch_map[&b].len(), 2);
    }

    #[test]
    fn reroutes_when_a_source_is_the_only_option_elsewhere() {
        let a = endpoint(1);
        let b = endpoint(2);
        // both ranges accept a, only the first accepts b; a balanced plan
        // must give the second range to a
        let ranges = btreemap! {
            Range::new(0, 10) => vec![a.clone(), b.clone()],
            Range::new(10, 20) => vec![a.clone()],
        };
        let fetch_map = RangeFetchMapCalculator::new(&ranges).calculate().unwrap();
        assert_eq!(fetch_map[&a], vec![Range::new(10, 20)]);
        assert_eq!(fetch_map[&b], vec![Range::new(0, 10)]);
    }

    #[test]
    fn is_deterministic() {
        let sources: Vec<_> = (1..=4).map(endpoint).collect();
        let ranges: BTreeMap<_, _> = (0..8)
            .map(|i| (Range::new(i * 10, i * 10 + 10), sources.clone()))
            .collect();
        let first = RangeFetchMapCalculator::new(&ranges).calculate().unwrap();
        for _ in 0..5 {
            assert_eq!(RangeFetchMapCalculator::new(&ranges).calculate().unwrap(), first);
        }
    }

    #[test]
    fn empty_candidates_fail() {
        let ranges = btreemap! {
            Range::new(0, 10) => vec![],
        };
        assert!(RangeFetchMapCalculator::new(&ranges).calculate().is_none());
    }
}
