// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routes and the update envelopes that carry them between tables.

use crate::attributes::{AggregationMark, PathAttributes};
use crate::types::{Genid, PeerHandle, PeerId, Prefix};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

const IGP_METRIC_UNKNOWN: u32 = u32::MAX;

/// A route to one network.
///
/// Routes are shared between tables as `Arc<SubnetRoute>`. The attribute set
/// is immutable; a table that needs different attributes derives a new route
/// with [`SubnetRoute::derive`], which remembers the original route so that
/// usage feedback can find its way back to the source.
///
/// The flags are per instance and may be flipped by whichever table holds
/// the route.
#[derive(Debug)]
pub struct SubnetRoute {
    net: Prefix,
    attributes: Arc<PathAttributes>,
    parent: Option<Arc<SubnetRoute>>,
    aggregation: AggregationMark,
    igp_metric: AtomicU32,
    in_use: AtomicBool,
    filtered: AtomicBool,
    nexthop_resolved: AtomicBool,
}

impl SubnetRoute {
    pub fn new(net: Prefix, attributes: PathAttributes) -> Arc<Self> {
        Self::with_aggregation(net, attributes, AggregationMark::Ignore)
    }

    pub fn with_aggregation(
        net: Prefix,
        attributes: PathAttributes,
        aggregation: AggregationMark,
    ) -> Arc<Self> {
        Arc::new(Self {
            net,
            attributes: Arc::new(attributes),
            parent: None,
            aggregation,
            igp_metric: AtomicU32::new(IGP_METRIC_UNKNOWN),
            in_use: AtomicBool::new(false),
            filtered: AtomicBool::new(false),
            nexthop_resolved: AtomicBool::new(false),
        })
    }

    /// Create a modified copy of this route carrying new attributes.
    pub fn derive(self: &Arc<Self>, attributes: PathAttributes) -> Arc<Self> {
        let parent = match &self.parent {
            Some(p) => p.clone(),
            None => self.clone(),
        };
        Arc::new(Self {
            net: self.net,
            attributes: Arc::new(attributes),
            parent: Some(parent),
            aggregation: self.aggregation,
            igp_metric: AtomicU32::new(self.igp_metric.load(Ordering::Relaxed)),
            in_use: AtomicBool::new(false),
            filtered: AtomicBool::new(false),
            nexthop_resolved: AtomicBool::new(self.nexthop_resolved()),
        })
    }

    pub fn net(&self) -> Prefix {
        self.net
    }

    pub fn attributes(&self) -> &PathAttributes {
        &self.attributes
    }

    pub fn nexthop(&self) -> IpAddr {
        self.attributes.nexthop
    }

    pub fn aggregation(&self) -> AggregationMark {
        self.aggregation
    }

    /// The route this one was derived from, or itself if it is an original.
    pub fn original_route(&self) -> &SubnetRoute {
        self.parent.as_deref().unwrap_or(self)
    }

    pub fn is_derived(&self) -> bool {
        self.parent.is_some()
    }

    pub fn igp_metric(&self) -> Option<u32> {
        match self.igp_metric.load(Ordering::Relaxed) {
            IGP_METRIC_UNKNOWN => None,
            m => Some(m),
        }
    }

    pub fn set_igp_metric(&self, metric: u32) {
        self.igp_metric.store(metric, Ordering::Relaxed);
    }

    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::Relaxed);
    }

    pub fn is_filtered(&self) -> bool {
        self.filtered.load(Ordering::Relaxed)
    }

    pub fn set_filtered(&self, filtered: bool) {
        self.filtered.store(filtered, Ordering::Relaxed);
    }

    pub fn nexthop_resolved(&self) -> bool {
        self.nexthop_resolved.load(Ordering::Relaxed)
    }

    pub fn set_nexthop_resolved(&self, resolved: bool) {
        self.nexthop_resolved.store(resolved, Ordering::Relaxed);
    }
}

impl PartialEq for SubnetRoute {
    fn eq(&self, other: &Self) -> bool {
        self.net == other.net && self.attributes == other.attributes
    }
}

impl fmt::Display for SubnetRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.net, self.attributes.nexthop)
    }
}

/// The result a table reports for a route operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Accepted and in use downstream.
    Used,
    /// Accepted but not currently used, or held back.
    Unused,
    /// Rejected by a filter.
    Filtered,
    /// Downstream could not process it. Treated as in use so the route is
    /// not reclaimed out from under a retry.
    Failed,
}

impl Outcome {
    /// Whether the route holder should consider the route in use.
    pub fn in_use(&self) -> bool {
        matches!(self, Self::Used | Self::Failed)
    }
}

/// Answer to a lookup: the route a table currently exposes for a prefix,
/// the peer it came from and the genid it was learned under.
#[derive(Debug, Clone)]
pub struct RouteLookup {
    pub route: Arc<SubnetRoute>,
    pub origin: Arc<PeerHandle>,
    pub genid: Genid,
}

impl RouteLookup {
    /// Wrap the answer in an envelope, for tables that run lookups through
    /// the same code as updates.
    pub fn into_message(self) -> InternalMessage {
        InternalMessage::new(self.route, self.origin, self.genid)
    }

    pub fn from_message(msg: InternalMessage) -> Self {
        Self {
            genid: msg.genid,
            origin: msg.origin,
            route: msg.route,
        }
    }
}

/// Update envelope passed between tables.
///
/// Envelopes move by value. A table receiving a `changed` envelope holds the
/// only long-lived reference to a freshly derived route: it must either store
/// that route or let it drop.
#[derive(Debug)]
pub struct InternalMessage {
    route: Arc<SubnetRoute>,
    origin: Arc<PeerHandle>,
    genid: Genid,
    changed: bool,
    push: bool,
    from_previous_peering: bool,
    dump: bool,
}

impl InternalMessage {
    pub fn new(
        route: Arc<SubnetRoute>,
        origin: Arc<PeerHandle>,
        genid: Genid,
    ) -> Self {
        Self {
            route,
            origin,
            genid,
            changed: false,
            push: false,
            from_previous_peering: false,
            dump: false,
        }
    }

    pub fn route(&self) -> &Arc<SubnetRoute> {
        &self.route
    }

    pub fn into_route(self) -> Arc<SubnetRoute> {
        self.route
    }

    pub fn net(&self) -> Prefix {
        self.route.net()
    }

    pub fn nexthop(&self) -> IpAddr {
        self.route.nexthop()
    }

    pub fn attributes(&self) -> &PathAttributes {
        self.route.attributes()
    }

    pub fn origin_peer(&self) -> &Arc<PeerHandle> {
        &self.origin
    }

    pub fn peer_id(&self) -> PeerId {
        self.origin.id
    }

    pub fn genid(&self) -> Genid {
        self.genid
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn set_changed(&mut self) {
        self.changed = true;
    }

    pub fn clear_changed(&mut self) {
        self.changed = false;
    }

    pub fn push(&self) -> bool {
        self.push
    }

    pub fn set_push(&mut self) {
        self.push = true;
    }

    pub fn clear_push(&mut self) {
        self.push = false;
    }

    pub fn from_previous_peering(&self) -> bool {
        self.from_previous_peering
    }

    pub fn set_from_previous_peering(&mut self) {
        self.from_previous_peering = true;
    }

    pub fn dump(&self) -> bool {
        self.dump
    }

    pub fn set_dump(&mut self) {
        self.dump = true;
    }

    /// Replace the route with one derived from it carrying new attributes.
    /// The result is always `changed`.
    pub fn with_attributes(self, attributes: PathAttributes) -> Self {
        let route = self.route.derive(attributes);
        let mut msg = self.with_route(route);
        msg.changed = true;
        msg
    }

    /// Re-target the envelope at another route for the same network,
    /// keeping origin, genid and flags.
    pub fn with_route(self, route: Arc<SubnetRoute>) -> Self {
        debug_assert_eq!(route.net(), self.route.net());
        Self { route, ..self }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::PeerType;
    use rtpipe_common::*;
    use std::net::Ipv4Addr;

    #[test]
    fn derived_routes_release_with_their_holders() {
        let net: Prefix = cidr!("10.0.0.0/8");
        let original =
            SubnetRoute::new(net, PathAttributes::new(ip!("192.0.2.1")));
        let peer = Arc::new(PeerHandle::new(
            PeerId(1),
            "a",
            PeerType::Ebgp,
            ip!("192.0.2.1"),
            65001,
            Ipv4Addr::new(1, 1, 1, 1),
        ));
        let msg = InternalMessage::new(original.clone(), peer, 1);
        assert!(!msg.changed());

        let msg = msg.with_attributes(
            PathAttributes::new(ip!("198.51.100.1")).with_med(5),
        );
        assert!(msg.changed());
        let nexthop: IpAddr = ip!("198.51.100.1");
        assert_eq!(msg.nexthop(), nexthop);
        assert!(std::ptr::eq(msg.route().original_route(), &*original));
        assert_eq!(Arc::strong_count(&original), 2);

        let weak = Arc::downgrade(msg.route());
        drop(msg);
        assert!(weak.upgrade().is_none());
        assert_eq!(Arc::strong_count(&original), 1);
    }
}
