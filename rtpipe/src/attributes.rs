// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Path attributes carried by routes.
//!
//! Attribute sets are immutable once attached to a route and are shared
//! between a route and every route derived from it until a filter produces
//! a modified copy.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::net::{IpAddr, Ipv4Addr};

pub mod path_attribute_flags {
    pub const OPTIONAL: u8 = 0b10000000;
    pub const TRANSITIVE: u8 = 0b01000000;
    pub const PARTIAL: u8 = 0b00100000;
    pub const EXTENDED_LENGTH: u8 = 0b00010000;
}

#[derive(
    Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u32)]
pub enum Community {
    /// Must not be advertised outside a BGP confederation boundary.
    NoExport = 0xFFFFFF01,

    /// Must not be advertised to any other BGP peer.
    NoAdvertise = 0xFFFFFF02,

    /// Must not be advertised to external BGP peers, including peers in
    /// other member autonomous systems of our confederation.
    NoExportSubConfed = 0xFFFFFF03,

    GracefulShutdown = 0xFFFF0000,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum PathOrigin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

impl Default for PathOrigin {
    fn default() -> Self {
        Self::Igp
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum AsPathType {
    AsSet = 1,
    AsSequence = 2,
    AsConfedSequence = 3,
    AsConfedSet = 4,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct As4PathSegment {
    pub typ: AsPathType,
    pub value: Vec<u32>,
}

impl As4PathSegment {
    pub fn sequence(value: Vec<u32>) -> Self {
        Self {
            typ: AsPathType::AsSequence,
            value,
        }
    }

    pub fn is_confed(&self) -> bool {
        matches!(
            self.typ,
            AsPathType::AsConfedSequence | AsPathType::AsConfedSet
        )
    }
}

/// An attribute we do not interpret, carried through as opaque bytes.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct UnknownAttribute {
    pub type_code: u8,
    pub flags: u8,
    pub value: Vec<u8>,
}

impl UnknownAttribute {
    pub fn is_transitive(&self) -> bool {
        self.flags & path_attribute_flags::TRANSITIVE != 0
    }
}

/// Tag set by aggregation on routes it has looked at, telling outbound
/// filters which sessions may see the route.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum AggregationMark {
    /// Not touched by aggregation.
    #[default]
    Ignore,
    /// Component of an aggregate that may only be sent to internal peers.
    IbgpOnly,
    /// The aggregate route itself, only sent to external peers.
    EbgpAggregate,
    /// Component that did not get aggregated, sent to everyone.
    EbgpNotAggregated,
    /// Component suppressed toward external peers by its aggregate.
    EbgpWasAggregated,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PathAttributes {
    pub origin: PathOrigin,
    pub as_path: Vec<As4PathSegment>,
    pub nexthop: IpAddr,
    pub med: Option<u32>,
    pub local_pref: Option<u32>,
    pub atomic_aggregate: bool,
    pub aggregator: Option<(u32, Ipv4Addr)>,
    pub communities: Vec<u32>,
    pub originator_id: Option<Ipv4Addr>,
    pub cluster_list: Vec<Ipv4Addr>,
    pub unknown: Vec<UnknownAttribute>,
}

impl PathAttributes {
    pub fn new(nexthop: IpAddr) -> Self {
        Self {
            origin: PathOrigin::default(),
            as_path: Vec::new(),
            nexthop,
            med: None,
            local_pref: None,
            atomic_aggregate: false,
            aggregator: None,
            communities: Vec::new(),
            originator_id: None,
            cluster_list: Vec::new(),
            unknown: Vec::new(),
        }
    }

    pub fn with_as_path(mut self, path: &[u32]) -> Self {
        self.as_path = vec![As4PathSegment::sequence(path.to_vec())];
        self
    }

    pub fn with_med(mut self, med: u32) -> Self {
        self.med = Some(med);
        self
    }

    pub fn with_local_pref(mut self, local_pref: u32) -> Self {
        self.local_pref = Some(local_pref);
        self
    }

    pub fn with_community(mut self, community: impl Into<u32>) -> Self {
        self.communities.push(community.into());
        self
    }

    pub fn has_community(&self, community: Community) -> bool {
        let value: u32 = community.into();
        self.communities.contains(&value)
    }

    pub fn as_path_contains(&self, asn: u32) -> bool {
        self.as_path.iter().any(|s| s.value.contains(&asn))
    }

    /// Number of AS hops as counted by path selection: a set counts as one,
    /// confederation segments do not count.
    pub fn as_path_len(&self) -> usize {
        self.as_path
            .iter()
            .map(|s| match s.typ {
                AsPathType::AsSequence => s.value.len(),
                AsPathType::AsSet => 1,
                _ => 0,
            })
            .sum()
    }

    /// Prepend an AS to the leading sequence segment, starting a new one
    /// when the path is empty or starts with a different segment type.
    pub fn prepend_as(&mut self, asn: u32) {
        self.prepend(AsPathType::AsSequence, asn)
    }

    pub fn prepend_confed_as(&mut self, asn: u32) {
        self.prepend(AsPathType::AsConfedSequence, asn)
    }

    fn prepend(&mut self, typ: AsPathType, asn: u32) {
        match self.as_path.first_mut() {
            Some(seg) if seg.typ == typ => seg.value.insert(0, asn),
            _ => self.as_path.insert(
                0,
                As4PathSegment {
                    typ,
                    value: vec![asn],
                },
            ),
        }
    }

    /// Drop confederation segments, used when a route leaves the
    /// confederation.
    pub fn strip_confed_segments(&mut self) {
        self.as_path.retain(|s| !s.is_confed());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    #[test]
    fn prepend_merges_into_leading_sequence() {
        let mut pa = PathAttributes::new(Ipv4Addr::new(1, 1, 1, 1).into())
            .with_as_path(&[65001, 65002]);
        pa.prepend_as(64512);
        assert_eq!(
            pa.as_path,
            vec![As4PathSegment::sequence(vec![64512, 65001, 65002])]
        );
        assert_eq!(pa.as_path_len(), 3);

        pa.prepend_confed_as(65100);
        assert_eq!(pa.as_path.len(), 2);
        assert!(pa.as_path[0].is_confed());
        assert_eq!(pa.as_path_len(), 3);
        pa.strip_confed_segments();
        assert_eq!(pa.as_path.len(), 1);
    }

    #[test]
    fn well_known_communities() {
        let pa = PathAttributes::new(Ipv4Addr::new(1, 1, 1, 1).into())
            .with_community(Community::NoExport)
            .with_community(0x00010002u32);
        assert!(pa.has_community(Community::NoExport));
        assert!(!pa.has_community(Community::NoAdvertise));
        assert!(Community::try_from(0x00010002u32).is_err());
    }
}
