// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module implements the size-prefixed endpoint encodings. The size byte
//! discriminates the variant on read:
//!
//! - `4 | 16`: a bare ipv4/ipv6 address (protocol versions before 40)
//! - `6 | 18`: address plus port
//! - `22 | 34`: address, port and the two host id halves
//!
//! Any other size is a protocol violation.

use super::{
    read_u16,
    read_u64,
    take,
    write_u16,
    write_u64,
    write_u8,
    FrameError,
    FIRST_PORT_AWARE_VERSION,
};
use crate::app::endpoint::{
    EndpointId,
    HostId,
};
use std::net::{
    IpAddr,
    Ipv4Addr,
    Ipv6Addr,
    SocketAddr,
};

fn write_ip(payload: &mut Vec<u8>, ip: IpAddr) {
    match ip {
        IpAddr::V4(ip) => payload.extend(&ip.octets()),
        IpAddr::V6(ip) => payload.extend(&ip.octets()),
    }
}

fn ip_len(ip: IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 16,
    }
}

/// Write a bare address, the encoding of protocol versions before 40.
pub fn write_endpoint_address_only(payload: &mut Vec<u8>, endpoint: &EndpointId) {
    let ip = endpoint.broadcast().ip();
    write_u8(payload, ip_len(ip));
    write_ip(payload, ip);
}

/// Write an address plus port, without the host id.
pub fn write_endpoint_with_port(payload: &mut Vec<u8>, endpoint: &EndpointId) {
    let broadcast = endpoint.broadcast();
    write_u8(payload, ip_len(broadcast.ip()) + 2);
    write_ip(payload, broadcast.ip());
    write_u16(payload, broadcast.port());
}

/// Write the full identity appropriate for the given protocol version.
pub fn write_endpoint(payload: &mut Vec<u8>, endpoint: &EndpointId, version: u8) {
    if version < FIRST_PORT_AWARE_VERSION {
        write_endpoint_address_only(payload, endpoint);
        return;
    }
    let broadcast = endpoint.broadcast();
    write_u8(payload, ip_len(broadcast.ip()) + 18);
    write_ip(payload, broadcast.ip());
    write_u16(payload, broadcast.port());
    let (most_sig, least_sig) = endpoint.host_id().as_u64_pair();
    write_u64(payload, most_sig);
    write_u64(payload, least_sig);
}

fn read_ip(start: &mut usize, payload: &[u8], len: usize) -> Result<IpAddr, FrameError> {
    let bytes = take(start, payload, len)?;
    Ok(if len == 4 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        IpAddr::V4(Ipv4Addr::from(buf))
    } else {
        let mut buf = [0u8; 16];
        buf.copy_from_slice(bytes);
        IpAddr::V6(Ipv6Addr::from(buf))
    })
}

/// Read an endpoint in any of the three encodings, discriminated by the size
/// prefix.
pub fn read_endpoint(start: &mut usize, payload: &[u8]) -> Result<EndpointId, FrameError> {
    let size = take(start, payload, 1)?[0];
    let (ip_len, with_port, with_host_id) = match size {
        4 | 16 => (size as usize, false, false),
        6 | 18 => (size as usize - 2, true, false),
        22 | 34 => (size as usize - 18, true, true),
        other => return Err(FrameError::InvalidEndpointSize(other)),
    };
    let ip = read_ip(start, payload, ip_len)?;
    let port = if with_port { read_u16(start, payload)? } else { 0 };
    let host_id = if with_host_id {
        let most_sig = read_u64(start, payload)?;
        let least_sig = read_u64(start, payload)?;
        HostId::from_u64_pair(most_sig, least_sig)
    } else {
        HostId::nil()
    };
    Ok(EndpointId::new(host_id, SocketAddr::new(ip, port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ip: IpAddr) -> EndpointId {
        EndpointId::new(HostId::from_u64_pair(0xDEAD, 0xBEEF), SocketAddr::new(ip, 7000))
    }

    #[test]
    fn address_only_round_trip() {
        for ip in [
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ] {
            let endpoint = sample(ip);
            let mut payload = Vec::new();
            write_endpoint_address_only(&mut payload, &endpoint);
            assert!(matches!(payload[0], 4 | 16));
            let mut start = 0;
            let decoded = read_endpoint(&mut start, &payload).unwrap();
            assert_eq!(decoded.broadcast().ip(), ip);
            assert_eq!(decoded.broadcast().port(), 0);
            assert!(decoded.host_id().is_nil());
            assert_eq!(start, payload.len());
        }
    }

    #[test]
    fn with_port_round_trip() {
        for ip in [
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ] {
            let endpoint = sample(ip);
            let mut payload = Vec::new();
            write_endpoint_with_port(&mut payload, &endpoint);
            assert!(matches!(payload[0], 6 | 18));
            let mut start = 0;
            let decoded = read_endpoint(&mut start, &payload).unwrap();
            assert_eq!(decoded.broadcast(), endpoint.broadcast());
            assert!(decoded.host_id().is_nil());
        }
    }

    #[test]
    fn full_identity_round_trip() {
        for ip in [
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ] {
            let endpoint = sample(ip);
            let mut payload = Vec::new();
            write_endpoint(&mut payload, &endpoint, 40);
            assert!(matches!(payload[0], 22 | 34));
            let mut start = 0;
            let decoded = read_endpoint(&mut start, &payload).unwrap();
            assert_eq!(decoded, endpoint);
        }
    }

    #[test]
    fn unknown_size_prefix_is_a_protocol_violation() {
        let payload = vec![5u8, 0, 0, 0, 0, 0];
        let mut start = 0;
        assert!(matches!(
            read_endpoint(&mut start, &payload),
            Err(FrameError::InvalidEndpointSize(5))
        ));
    }
}
