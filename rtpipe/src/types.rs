// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Generation number of a peering session. Issued by the route source,
/// starting at 1 and incremented exactly once each time a peer's session
/// comes back up.
pub type Genid = u32;

#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, Eq, Hash, PartialEq, JsonSchema,
)]
pub struct Prefix4 {
    pub value: Ipv4Addr,
    pub length: u8,
}

impl PartialOrd for Prefix4 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Prefix4 {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.value != other.value {
            return self.value.cmp(&other.value);
        }
        self.length.cmp(&other.length)
    }
}

impl Prefix4 {
    pub const HOST_MASK: u8 = 32;

    /// Create a new `Prefix4` from an IP address and net mask.
    /// The newly created `Prefix4` will have its host bits zeroed upon creation
    /// e.g.
    /// ```
    /// use rtpipe::types::Prefix4;
    /// use std::net::Ipv4Addr;
    /// let p4 = Prefix4::new(Ipv4Addr::new(10, 0, 0, 10), 24);
    /// assert_eq!(p4.value, Ipv4Addr::new(10, 0, 0, 0));
    /// ```
    pub fn new(ip: Ipv4Addr, length: u8) -> Self {
        let mut new = Self {
            value: ip,
            length: length.min(Self::HOST_MASK),
        };
        new.unset_host_bits();
        new
    }

    fn mask(length: u8) -> u32 {
        match length {
            0 => 0,
            _ => (!0u32) << (32 - length),
        }
    }

    pub fn host_bits_are_unset(&self) -> bool {
        self.value.to_bits() & Self::mask(self.length) == self.value.to_bits()
    }

    pub fn unset_host_bits(&mut self) {
        self.value =
            Ipv4Addr::from_bits(self.value.to_bits() & Self::mask(self.length))
    }

    /// Check if this prefix is contained within another prefix.
    /// Returns true if this prefix is equal to or more specific than the other.
    pub fn within(&self, other: &Prefix4) -> bool {
        if self.length < other.length {
            return false;
        }
        let mask = Self::mask(other.length);
        self.value.to_bits() & mask == other.value.to_bits() & mask
    }

    /// Check if an address falls inside this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = Self::mask(self.length);
        addr.to_bits() & mask == self.value.to_bits()
    }
}

impl fmt::Display for Prefix4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

impl FromStr for Prefix4 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, length) =
            s.split_once('/').ok_or("malformed prefix".to_string())?;
        let value: Ipv4Addr =
            value.parse().map_err(|_| "malformed ip addr".to_string())?;
        let length: u8 =
            length.parse().map_err(|_| "malformed length".to_string())?;
        if length > Self::HOST_MASK {
            return Err(format!("prefix length {length} out of range"));
        }
        Ok(Self::new(value, length))
    }
}

#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, JsonSchema,
)]
pub struct Prefix6 {
    pub value: Ipv6Addr,
    pub length: u8,
}

impl PartialOrd for Prefix6 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Prefix6 {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.value != other.value {
            return self.value.cmp(&other.value);
        }
        self.length.cmp(&other.length)
    }
}

impl fmt::Display for Prefix6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

impl Prefix6 {
    pub const HOST_MASK: u8 = 128;

    /// Create a new `Prefix6` from an IP address and net mask, zeroing the
    /// host bits.
    pub fn new(ip: Ipv6Addr, length: u8) -> Self {
        let mut new = Self {
            value: ip,
            length: length.min(Self::HOST_MASK),
        };
        new.unset_host_bits();
        new
    }

    fn mask(length: u8) -> u128 {
        match length {
            0 => 0,
            _ => (!0u128) << (128 - length),
        }
    }

    pub fn host_bits_are_unset(&self) -> bool {
        self.value.to_bits() & Self::mask(self.length) == self.value.to_bits()
    }

    pub fn unset_host_bits(&mut self) {
        self.value =
            Ipv6Addr::from_bits(self.value.to_bits() & Self::mask(self.length))
    }

    pub fn within(&self, other: &Prefix6) -> bool {
        if self.length < other.length {
            return false;
        }
        let mask = Self::mask(other.length);
        self.value.to_bits() & mask == other.value.to_bits() & mask
    }

    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        let mask = Self::mask(self.length);
        addr.to_bits() & mask == self.value.to_bits()
    }
}

impl FromStr for Prefix6 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, length) =
            s.split_once('/').ok_or("malformed prefix".to_string())?;
        let value: Ipv6Addr =
            value.parse().map_err(|_| "malformed ip addr".to_string())?;
        let length: u8 =
            length.parse().map_err(|_| "malformed length".to_string())?;
        if length > Self::HOST_MASK {
            return Err(format!("prefix length {length} out of range"));
        }
        Ok(Self::new(value, length))
    }
}

/// A network prefix. All IPv4 prefixes order before all IPv6 prefixes, and
/// within a family prefixes order by address then length. Dump cursors and
/// deletion sweeps walk routes in this order.
#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    JsonSchema,
    PartialOrd,
    Ord,
)]
pub enum Prefix {
    V4(Prefix4),
    V6(Prefix6),
}

impl std::fmt::Display for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Prefix::V4(p) => p.fmt(f),
            Prefix::V6(p) => p.fmt(f),
        }
    }
}

impl From<Prefix4> for Prefix {
    fn from(value: Prefix4) -> Self {
        Self::V4(value)
    }
}

impl From<Prefix6> for Prefix {
    fn from(value: Prefix6) -> Self {
        Self::V6(value)
    }
}

impl FromStr for Prefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(prefix4) = s.parse::<Prefix4>() {
            Ok(Self::V4(prefix4))
        } else if let Ok(prefix6) = s.parse::<Prefix6>() {
            Ok(Self::V6(prefix6))
        } else {
            Err(format!("malformed prefix {s}"))
        }
    }
}

impl Prefix {
    pub fn new(ip: IpAddr, length: u8) -> Self {
        match ip {
            IpAddr::V4(ip4) => Self::V4(Prefix4::new(ip4, length)),
            IpAddr::V6(ip6) => Self::V6(Prefix6::new(ip6, length)),
        }
    }

    pub fn length(&self) -> u8 {
        match self {
            Self::V4(p4) => p4.length,
            Self::V6(p6) => p6.length,
        }
    }

    pub fn host_bits_are_unset(&self) -> bool {
        match self {
            Self::V4(p4) => p4.host_bits_are_unset(),
            Self::V6(p6) => p6.host_bits_are_unset(),
        }
    }

    /// Returns true if this prefix is equal to or more specific than the
    /// other. Cross-family comparisons are always false.
    pub fn within(&self, other: &Prefix) -> bool {
        match (self, other) {
            (Prefix::V4(a), Prefix::V4(b)) => a.within(b),
            (Prefix::V6(a), Prefix::V6(b)) => a.within(b),
            _ => false,
        }
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self, addr) {
            (Prefix::V4(p), IpAddr::V4(a)) => p.contains(a),
            (Prefix::V6(p), IpAddr::V6(a)) => p.contains(a),
            _ => false,
        }
    }

    pub fn is_v4(&self) -> bool {
        matches!(self, Prefix::V4(_))
    }
}

/// Identity of a peer within a pipeline.
#[derive(
    Debug,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    PartialOrd,
    Ord,
    JsonSchema,
)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, Eq, PartialEq, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum PeerType {
    /// External peer in another autonomous system.
    Ebgp,
    /// External peer in another member AS of our confederation.
    EbgpConfed,
    /// Internal peer.
    Ibgp,
    /// Internal peer that is a route reflector client of ours.
    IbgpClient,
    /// Locally originated routes.
    Internal,
}

impl PeerType {
    pub fn is_ibgp(&self) -> bool {
        matches!(self, Self::Ibgp | Self::IbgpClient)
    }

    pub fn is_ebgp(&self) -> bool {
        matches!(self, Self::Ebgp | Self::EbgpConfed)
    }
}

/// Everything the pipeline knows about the peer a route came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandle {
    pub id: PeerId,
    pub name: String,
    pub peer_type: PeerType,
    pub address: IpAddr,
    pub asn: u32,
    pub router_id: Ipv4Addr,
}

impl PeerHandle {
    pub fn new(
        id: PeerId,
        name: impl Into<String>,
        peer_type: PeerType,
        address: IpAddr,
        asn: u32,
        router_id: Ipv4Addr,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            peer_type,
            address,
            asn,
            router_id,
        }
    }

    pub fn is_ibgp(&self) -> bool {
        self.peer_type.is_ibgp()
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use rtpipe_common::*;

    #[test]
    fn parse_clears_host_bits() {
        let p: Prefix = cidr!("10.1.2.3/16");
        assert_eq!(p.to_string(), "10.1.0.0/16");
        let p: Prefix = cidr!("2001:db8::1/32");
        assert_eq!(p.to_string(), "2001:db8::/32");
        assert!("10.0.0.0/33".parse::<Prefix>().is_err());
    }

    #[test]
    fn ordering_is_family_then_address_then_length() {
        let mut v: Vec<Prefix> = vec![
            cidr!("2001:db8::/32"),
            cidr!("10.0.0.0/16"),
            cidr!("10.0.0.0/8"),
            cidr!("9.0.0.0/8"),
        ];
        v.sort();
        let s: Vec<String> = v.iter().map(|p| p.to_string()).collect();
        assert_eq!(
            s,
            vec!["9.0.0.0/8", "10.0.0.0/8", "10.0.0.0/16", "2001:db8::/32"]
        );
    }

    #[test]
    fn contains_address() {
        let p: Prefix = cidr!("192.168.4.0/22");
        assert!(p.contains(ip!("192.168.7.1")));
        assert!(!p.contains(ip!("192.168.8.1")));
        assert!(!p.contains(ip!("fd00::1")));
    }
}
