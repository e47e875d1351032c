// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Largest payload accepted for a single datagram.
pub const MAX_UDP_PACKAGE: usize = 65535;

/// Packed size of an encoded v6 peer address (family + port + 16 address
/// bytes). A v4 address occupies the first 7 bytes of the same layout.
pub const UDP_ADDRESS_SIZE: usize = 19;

const FAMILY_V4: u8 = 1;
const FAMILY_V6: u8 = 2;

/// A UDP peer address in its packed on-wire form: one family byte, the port
/// in network order, then the raw address bytes exactly as obtained from the
/// OS. The port and address bytes are deliberately *not* byte-swapped so the
/// blob can round-trip through payloads without any re-encoding.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct UdpAddress {
    bytes: [u8; UDP_ADDRESS_SIZE],
    len: usize,
}

impl UdpAddress {
    /// The packed bytes of this address (7 for v4, 19 for v6).
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn is_v6(&self) -> bool {
        self.bytes[0] == FAMILY_V6
    }

    /// Decode a packed address from the front of `data`. Returns the address
    /// and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Option<(UdpAddress, usize)> {
        if data.is_empty() {
            return None;
        }

        let len = match data[0] {
            FAMILY_V4 => 1 + 2 + 4,
            FAMILY_V6 => 1 + 2 + 16,
            _ => return None,
        };

        if data.len() < len {
            return None;
        }

        let mut bytes = [0u8; UDP_ADDRESS_SIZE];
        bytes[..len].copy_from_slice(&data[..len]);

        Some((UdpAddress { bytes, len }, len))
    }

    /// Recover the std socket address. Fails only on a corrupted family byte,
    /// which `decode` already rejects.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let port = u16::from_be_bytes([self.bytes[1], self.bytes[2]]);

        match self.bytes[0] {
            FAMILY_V4 => {
                let octets: [u8; 4] = self.bytes[3..7].try_into().ok()?;
                Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            FAMILY_V6 => {
                let octets: [u8; 16] = self.bytes[3..19].try_into().ok()?;
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for UdpAddress {
    fn from(addr: SocketAddr) -> Self {
        let mut bytes = [0u8; UDP_ADDRESS_SIZE];
        bytes[1..3].copy_from_slice(&addr.port().to_be_bytes());

        let len = match addr.ip() {
            IpAddr::V4(ip) => {
                bytes[0] = FAMILY_V4;
                bytes[3..7].copy_from_slice(&ip.octets());
                7
            }
            IpAddr::V6(ip) => {
                bytes[0] = FAMILY_V6;
                bytes[3..19].copy_from_slice(&ip.octets());
                19
            }
        };

        UdpAddress { bytes, len }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trip() {
        let addr: SocketAddr = "127.0.0.1:8000".parse().unwrap();
        let packed = UdpAddress::from(addr);

        assert_eq!(packed.as_bytes().len(), 7);
        assert_eq!(packed.as_bytes()[0], FAMILY_V4);
        // Port is stored in network order:
        assert_eq!(&packed.as_bytes()[1..3], &8000u16.to_be_bytes());
        assert_eq!(packed.to_socket_addr(), Some(addr));
    }

    #[test]
    fn v6_round_trip() {
        let addr: SocketAddr = "[::1]:53".parse().unwrap();
        let packed = UdpAddress::from(addr);

        assert_eq!(packed.as_bytes().len(), 19);
        assert_eq!(packed.to_socket_addr(), Some(addr));
    }

    #[test]
    fn decode_rejects_short_and_garbage() {
        assert!(UdpAddress::decode(&[]).is_none());
        assert!(UdpAddress::decode(&[9, 0, 0]).is_none());
        assert!(UdpAddress::decode(&[FAMILY_V4, 0, 80]).is_none());
    }
}
