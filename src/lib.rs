// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! An eventually-consistent gossip membership and token ring core for
//! partitioned key-value clusters: the anti-entropy engine disseminating
//! per-endpoint version vectors, the authoritative token ring metadata with
//! its pending-range cache, and the planner that turns ring snapshots into
//! range fetch plans.

/// The membership components and their composition root
pub mod app;
/// The versioned binary gossip protocol
pub mod wire;

/// The commonly used types of the crate.
pub mod prelude {
    pub use crate::{
        app::{
            cluster::Cluster,
            detector::{
                FailureDetector,
                FailureListener,
            },
            endpoint::{
                EndpointId,
                HostId,
            },
            gossip::{
                EventSubscriber,
                GossipEvent,
                GossipHandle,
                Gossiper,
                MemoryNetwork,
                MemoryTransport,
                Transport,
            },
            ring::{
                Murmur3Partitioner,
                Partitioner,
                PendingRanges,
                Range,
                RingUpdater,
                StateConflict,
                Token,
                TokenMap,
                TokenRing,
                MIN_TOKEN,
            },
            snitch::{
                FixedSnitch,
                SimpleSnitch,
                Snitch,
            },
            state::{
                AppStateKey,
                EndpointState,
                HeartBeatState,
                Status,
                ValueFactory,
                VersionedValue,
            },
            store::{
                MemoryPeerStore,
                MemoryStateStore,
                PeerRecord,
                PeerStore,
                StateStore,
            },
            strategy::{
                NetworkTopologyStrategy,
                ReplicationStrategy,
                SimpleStrategy,
            },
            stream::{
                ExcludeLocalNodeFilter,
                FailureDetectorSourceFilter,
                FetchMap,
                RangeStreamer,
                SingleDatacenterFilter,
                SourceFilter,
                StreamError,
                WhitelistedSourcesFilter,
            },
            HiveConfig,
            HiveConfigBuilder,
        },
        wire::{
            FrameError,
            GossipDigest,
            GossipDigestAck,
            GossipDigestAck2,
            GossipDigestSyn,
            Message,
            Verb,
        },
    };
}
