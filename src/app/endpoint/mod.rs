// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module defines the canonical node identity used as the key of every
//! membership and ring structure.

use anyhow::ensure;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    cmp::Ordering,
    fmt,
    net::{
        IpAddr,
        SocketAddr,
    },
};
use uuid::Uuid;

/// The stable host identifier of a node. Immutable once learned; nil until the
/// peer announces itself.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display)]
pub struct HostId(Uuid);

impl HostId {
    /// The sentinel id used before the identity is learned.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }
    /// Generate a fresh random host id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
    /// Whether this is the nil sentinel.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
    /// Rebuild a host id from its two on-wire halves.
    pub fn from_u64_pair(most_sig: u64, least_sig: u64) -> Self {
        Self(Uuid::from_u64_pair(most_sig, least_sig))
    }
    /// The two on-wire halves of the id.
    pub fn as_u64_pair(&self) -> (u64, u64) {
        self.0.as_u64_pair()
    }
}

impl std::str::FromStr for HostId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl fmt::Debug for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The identity of a cluster endpoint: a stable host id plus up to four
/// addresses. The broadcast address is the canonical gossip address; the
/// others default to it until the peer advertises them.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId {
    host_id: HostId,
    listen: SocketAddr,
    broadcast: SocketAddr,
    native: SocketAddr,
    broadcast_native: SocketAddr,
}

impl EndpointId {
    /// Create an identity from a host id and its broadcast address. All other
    /// addresses default to the broadcast address.
    pub fn new(host_id: HostId, broadcast: SocketAddr) -> Self {
        Self {
            host_id,
            listen: broadcast,
            broadcast,
            native: broadcast,
            broadcast_native: broadcast,
        }
    }
    /// Create an identity from raw ip/port parts, rejecting ports outside
    /// `[0, 65535]`.
    pub fn try_new(host_id: HostId, ip: IpAddr, port: i64) -> anyhow::Result<Self> {
        ensure!((0..=u16::MAX as i64).contains(&port), "port {} out of range", port);
        Ok(Self::new(host_id, SocketAddr::new(ip, port as u16)))
    }
    /// Set the internal listen address.
    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }
    /// Set the native client address.
    pub fn with_native(mut self, native: SocketAddr) -> Self {
        self.native = native;
        self
    }
    /// Set the broadcast native address.
    pub fn with_broadcast_native(mut self, broadcast_native: SocketAddr) -> Self {
        self.broadcast_native = broadcast_native;
        self
    }
    /// The stable host id, nil until learned.
    pub fn host_id(&self) -> HostId {
        self.host_id
    }
    /// The internal listen address.
    pub fn listen(&self) -> SocketAddr {
        self.listen
    }
    /// The canonical gossip broadcast address.
    pub fn broadcast(&self) -> SocketAddr {
        self.broadcast
    }
    /// The native client address.
    pub fn native(&self) -> SocketAddr {
        self.native
    }
    /// The broadcast native address.
    pub fn broadcast_native(&self) -> SocketAddr {
        self.broadcast_native
    }
    fn broadcast_ip_octets(&self) -> Vec<u8> {
        match self.broadcast.ip() {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        }
    }
}

impl Ord for EndpointId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.broadcast_ip_octets()
            .cmp(&other.broadcast_ip_octets())
            .then_with(|| self.host_id.cmp(&other.host_id))
            .then_with(|| self.broadcast.port().cmp(&other.broadcast.port()))
    }
}

impl PartialOrd for EndpointId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.broadcast, self.host_id)
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::error::Error for EndpointId {}
