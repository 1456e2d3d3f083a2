// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Filter banks.
//!
//! A [`FilterTable`] runs every route through an ordered bank of
//! [`RouteFilter`]s. Each filter may pass a route, drop it, or replace it
//! with a modified copy.
//!
//! Banks are versioned. Reconfiguration installs a new current version, but
//! a session keeps using the version that filtered its first route, so a
//! withdrawal is always judged by the same filters as the announcement it
//! withdraws. A version that is no longer current is released once the last
//! route it filtered has been withdrawn.

use crate::attributes::{path_attribute_flags, AggregationMark, Community};
use crate::config::FilterSpec;
use crate::error::Error;
use crate::log::table_log;
use crate::nhlookup::NextHopResolver;
use crate::route::{InternalMessage, Outcome, RouteLookup};
use crate::table::{RouteTable, TableCtx, Upstream};
use crate::types::{Genid, PeerId, PeerType, Prefix};
use crate::MOD_FILTER;
use itertools::Itertools;
use slog::Logger;
use std::any::Any;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub trait RouteFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pass, drop (`None`) or rewrite a route.
    fn filter(&self, msg: InternalMessage) -> Option<InternalMessage>;
}

/// Drops routes that aggregation marked as not for this kind of session.
pub struct AggregationFilter {
    ibgp: bool,
}

impl RouteFilter for AggregationFilter {
    fn name(&self) -> &'static str {
        "aggregation"
    }

    fn filter(&self, msg: InternalMessage) -> Option<InternalMessage> {
        let mark = msg.route().aggregation();
        let keep = match (self.ibgp, mark) {
            (_, AggregationMark::Ignore) => true,
            (true, AggregationMark::EbgpAggregate) => false,
            (true, _) => true,
            (false, AggregationMark::IbgpOnly) => false,
            (false, AggregationMark::EbgpWasAggregated) => false,
            (false, _) => true,
        };
        keep.then_some(msg)
    }
}

/// Drops routes whose AS path contains our AS.
pub struct SimpleAsFilter {
    asn: u32,
}

impl RouteFilter for SimpleAsFilter {
    fn name(&self) -> &'static str {
        "simple-as-loop"
    }

    fn filter(&self, msg: InternalMessage) -> Option<InternalMessage> {
        (!msg.attributes().as_path_contains(self.asn)).then_some(msg)
    }
}

/// Drops reflected routes that have come back to us.
pub struct RrInputFilter {
    bgp_id: Ipv4Addr,
    cluster_id: Ipv4Addr,
}

impl RouteFilter for RrInputFilter {
    fn name(&self) -> &'static str {
        "rr-input"
    }

    fn filter(&self, msg: InternalMessage) -> Option<InternalMessage> {
        let pa = msg.attributes();
        if pa.originator_id == Some(self.bgp_id) {
            return None;
        }
        if pa.cluster_list.contains(&self.cluster_id) {
            return None;
        }
        Some(msg)
    }
}

pub struct AsPrependFilter {
    asn: u32,
    confederation: bool,
}

impl RouteFilter for AsPrependFilter {
    fn name(&self) -> &'static str {
        "as-prepend"
    }

    fn filter(&self, msg: InternalMessage) -> Option<InternalMessage> {
        let mut pa = msg.attributes().clone();
        if self.confederation {
            pa.prepend_confed_as(self.asn);
        } else {
            pa.strip_confed_segments();
            pa.prepend_as(self.asn);
        }
        Some(msg.with_attributes(pa))
    }
}

pub struct NexthopRewriteFilter {
    local_nexthop: IpAddr,
    directly_connected: bool,
    subnet: Option<Prefix>,
}

impl RouteFilter for NexthopRewriteFilter {
    fn name(&self) -> &'static str {
        "nexthop-rewrite"
    }

    fn filter(&self, msg: InternalMessage) -> Option<InternalMessage> {
        // A third party next hop on the subnet we share with the peer is
        // better than going through us.
        if self.directly_connected
            && self.subnet.is_some_and(|s| s.contains(msg.nexthop()))
        {
            return Some(msg);
        }
        if msg.nexthop() == self.local_nexthop {
            return Some(msg);
        }
        let mut pa = msg.attributes().clone();
        pa.nexthop = self.local_nexthop;
        Some(msg.with_attributes(pa))
    }
}

/// Sending a peer a route through itself is useless; point it at us.
pub struct NexthopPeerCheckFilter {
    local_nexthop: IpAddr,
    peer_address: IpAddr,
}

impl RouteFilter for NexthopPeerCheckFilter {
    fn name(&self) -> &'static str {
        "nexthop-peer-check"
    }

    fn filter(&self, msg: InternalMessage) -> Option<InternalMessage> {
        if msg.nexthop() != self.peer_address {
            return Some(msg);
        }
        let mut pa = msg.attributes().clone();
        pa.nexthop = self.local_nexthop;
        Some(msg.with_attributes(pa))
    }
}

/// Without route reflection, IBGP learned routes are not sent to IBGP
/// peers.
pub struct IbgpLoopFilter;

impl RouteFilter for IbgpLoopFilter {
    fn name(&self) -> &'static str {
        "ibgp-loop"
    }

    fn filter(&self, msg: InternalMessage) -> Option<InternalMessage> {
        (!msg.origin_peer().is_ibgp()).then_some(msg)
    }
}

/// Route reflection toward an internal peer. Routes from non-client
/// internal peers are only reflected to clients. Reflected routes get an
/// originator id and our cluster id.
pub struct RrIbgpLoopFilter {
    rr_client: bool,
    bgp_id: Ipv4Addr,
    cluster_id: Ipv4Addr,
}

impl RouteFilter for RrIbgpLoopFilter {
    fn name(&self) -> &'static str {
        "rr-ibgp-loop"
    }

    fn filter(&self, msg: InternalMessage) -> Option<InternalMessage> {
        let origin = msg.origin_peer().clone();
        if !origin.is_ibgp() {
            return Some(msg);
        }
        if !self.rr_client && origin.peer_type != PeerType::IbgpClient {
            return None;
        }
        let mut pa = msg.attributes().clone();
        if pa.originator_id.is_none() {
            pa.originator_id = Some(if origin.router_id.is_unspecified() {
                self.bgp_id
            } else {
                origin.router_id
            });
        }
        pa.cluster_list.insert(0, self.cluster_id);
        Some(msg.with_attributes(pa))
    }
}

/// Strip reflection attributes from routes leaving the AS.
pub struct RrPurgeFilter;

impl RouteFilter for RrPurgeFilter {
    fn name(&self) -> &'static str {
        "rr-purge"
    }

    fn filter(&self, msg: InternalMessage) -> Option<InternalMessage> {
        let pa = msg.attributes();
        if pa.originator_id.is_none() && pa.cluster_list.is_empty() {
            return Some(msg);
        }
        let mut pa = pa.clone();
        pa.originator_id = None;
        pa.cluster_list.clear();
        Some(msg.with_attributes(pa))
    }
}

pub struct LocalPrefInsertionFilter {
    local_pref: u32,
}

impl RouteFilter for LocalPrefInsertionFilter {
    fn name(&self) -> &'static str {
        "local-pref-insertion"
    }

    fn filter(&self, msg: InternalMessage) -> Option<InternalMessage> {
        let mut pa = msg.attributes().clone();
        pa.local_pref = Some(self.local_pref);
        Some(msg.with_attributes(pa))
    }
}

pub struct LocalPrefRemovalFilter;

impl RouteFilter for LocalPrefRemovalFilter {
    fn name(&self) -> &'static str {
        "local-pref-removal"
    }

    fn filter(&self, msg: InternalMessage) -> Option<InternalMessage> {
        if msg.attributes().local_pref.is_none() {
            return Some(msg);
        }
        let mut pa = msg.attributes().clone();
        pa.local_pref = None;
        Some(msg.with_attributes(pa))
    }
}

/// Sets the MED from the IGP distance to the next hop: the metric learned
/// by next-hop resolution if the route has one, the resolver's answer
/// otherwise. Routes with no known metric pass unchanged.
pub struct MedInsertionFilter {
    resolver: Option<Arc<dyn NextHopResolver>>,
}

impl RouteFilter for MedInsertionFilter {
    fn name(&self) -> &'static str {
        "med-insertion"
    }

    fn filter(&self, msg: InternalMessage) -> Option<InternalMessage> {
        let metric = msg.route().igp_metric().or_else(|| {
            self.resolver
                .as_ref()
                .and_then(|r| r.lookup(msg.nexthop()))
                .map(|r| r.metric)
        });
        let Some(metric) = metric else {
            return Some(msg);
        };
        let mut pa = msg.attributes().clone();
        pa.med = Some(metric);
        Some(msg.with_attributes(pa))
    }
}

pub struct MedRemovalFilter;

impl RouteFilter for MedRemovalFilter {
    fn name(&self) -> &'static str {
        "med-removal"
    }

    fn filter(&self, msg: InternalMessage) -> Option<InternalMessage> {
        if msg.attributes().med.is_none() {
            return Some(msg);
        }
        let mut pa = msg.attributes().clone();
        pa.med = None;
        Some(msg.with_attributes(pa))
    }
}

/// Honors the well-known communities toward a peer of the given type.
pub struct KnownCommunityFilter {
    peer_type: PeerType,
}

impl RouteFilter for KnownCommunityFilter {
    fn name(&self) -> &'static str {
        "known-community"
    }

    fn filter(&self, msg: InternalMessage) -> Option<InternalMessage> {
        let pa = msg.attributes();
        if pa.has_community(Community::NoAdvertise) {
            return None;
        }
        if self.peer_type == PeerType::Ebgp
            && pa.has_community(Community::NoExport)
        {
            return None;
        }
        if self.peer_type.is_ebgp()
            && pa.has_community(Community::NoExportSubConfed)
        {
            return None;
        }
        Some(msg)
    }
}

/// Unknown optional attributes: non-transitive ones are dropped, transitive
/// ones are passed on marked partial.
pub struct UnknownFilter;

impl RouteFilter for UnknownFilter {
    fn name(&self) -> &'static str {
        "unknown-attributes"
    }

    fn filter(&self, msg: InternalMessage) -> Option<InternalMessage> {
        let unknown = &msg.attributes().unknown;
        let clean = unknown.iter().all(|u| {
            u.is_transitive() && u.flags & path_attribute_flags::PARTIAL != 0
        });
        if clean {
            return Some(msg);
        }
        let mut pa = msg.attributes().clone();
        pa.unknown.retain(|u| u.is_transitive());
        for u in pa.unknown.iter_mut() {
            u.flags |= path_attribute_flags::PARTIAL;
        }
        Some(msg.with_attributes(pa))
    }
}

/// Validate a filter description and build the filter.
pub fn build_filter(
    spec: &FilterSpec,
    resolver: Option<&Arc<dyn NextHopResolver>>,
) -> Result<Box<dyn RouteFilter>, Error> {
    fn invalid(msg: String) -> Error {
        Error::InvalidFilter(msg)
    }

    let filter: Box<dyn RouteFilter> = match spec {
        FilterSpec::Aggregation { ibgp } => {
            Box::new(AggregationFilter { ibgp: *ibgp })
        }
        FilterSpec::SimpleAsLoop { asn } => {
            if *asn == 0 {
                return Err(invalid("as loop filter with AS 0".into()));
            }
            Box::new(SimpleAsFilter { asn: *asn })
        }
        FilterSpec::RrInput { bgp_id, cluster_id } => {
            if bgp_id.is_unspecified() || cluster_id.is_unspecified() {
                return Err(invalid(
                    "route reflection needs a bgp id and cluster id".into(),
                ));
            }
            Box::new(RrInputFilter {
                bgp_id: *bgp_id,
                cluster_id: *cluster_id,
            })
        }
        FilterSpec::AsPrepend { asn, confederation } => {
            if *asn == 0 {
                return Err(invalid("cannot prepend AS 0".into()));
            }
            Box::new(AsPrependFilter {
                asn: *asn,
                confederation: *confederation,
            })
        }
        FilterSpec::NexthopRewrite {
            local_nexthop,
            directly_connected,
            subnet,
        } => {
            if local_nexthop.is_unspecified() {
                return Err(invalid(format!(
                    "unspecified local next hop {local_nexthop}"
                )));
            }
            match subnet {
                Some(s) if s.is_v4() != local_nexthop.is_ipv4() => {
                    return Err(invalid(format!(
                        "subnet {s} and next hop {local_nexthop} differ in \
                         address family"
                    )));
                }
                None if *directly_connected => {
                    return Err(invalid(
                        "directly connected peer without a subnet".into(),
                    ));
                }
                _ => {}
            }
            Box::new(NexthopRewriteFilter {
                local_nexthop: *local_nexthop,
                directly_connected: *directly_connected,
                subnet: *subnet,
            })
        }
        FilterSpec::NexthopPeerCheck {
            local_nexthop,
            peer_address,
        } => {
            if local_nexthop.is_unspecified() || peer_address.is_unspecified()
            {
                return Err(invalid(
                    "next hop peer check with unspecified address".into(),
                ));
            }
            if local_nexthop.is_ipv4() != peer_address.is_ipv4() {
                return Err(invalid(format!(
                    "next hop {local_nexthop} and peer {peer_address} differ \
                     in address family"
                )));
            }
            Box::new(NexthopPeerCheckFilter {
                local_nexthop: *local_nexthop,
                peer_address: *peer_address,
            })
        }
        FilterSpec::IbgpLoop => Box::new(IbgpLoopFilter),
        FilterSpec::RrIbgpLoop {
            rr_client,
            bgp_id,
            cluster_id,
        } => {
            if bgp_id.is_unspecified() || cluster_id.is_unspecified() {
                return Err(invalid(
                    "route reflection needs a bgp id and cluster id".into(),
                ));
            }
            Box::new(RrIbgpLoopFilter {
                rr_client: *rr_client,
                bgp_id: *bgp_id,
                cluster_id: *cluster_id,
            })
        }
        FilterSpec::RrPurge => Box::new(RrPurgeFilter),
        FilterSpec::LocalPrefInsertion { local_pref } => {
            Box::new(LocalPrefInsertionFilter {
                local_pref: *local_pref,
            })
        }
        FilterSpec::LocalPrefRemoval => Box::new(LocalPrefRemovalFilter),
        FilterSpec::MedInsertion => Box::new(MedInsertionFilter {
            resolver: resolver.cloned(),
        }),
        FilterSpec::MedRemoval => Box::new(MedRemovalFilter),
        FilterSpec::KnownCommunity { peer_type } => {
            if *peer_type == PeerType::Internal {
                return Err(invalid(
                    "known community filter toward internal routes".into(),
                ));
            }
            Box::new(KnownCommunityFilter {
                peer_type: *peer_type,
            })
        }
        FilterSpec::UnknownAttributes => Box::new(UnknownFilter),
    };
    Ok(filter)
}

/// One configuration of a filter bank.
pub struct FilterVersion {
    id: u64,
    filters: Vec<Box<dyn RouteFilter>>,
    /// Routes filtered by this version that have not been withdrawn.
    routes: AtomicUsize,
}

impl FilterVersion {
    fn new(id: u64, filters: Vec<Box<dyn RouteFilter>>) -> Self {
        Self {
            id,
            filters,
            routes: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn route_count(&self) -> usize {
        self.routes.load(Ordering::Relaxed)
    }

    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    fn apply(&self, msg: InternalMessage) -> Option<InternalMessage> {
        self.filters.iter().try_fold(msg, |msg, f| f.filter(msg))
    }

    fn acquire(&self) {
        self.routes.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) {
        let prev = self.routes.fetch_sub(1, Ordering::Relaxed);
        assert!(
            prev > 0,
            "BUG: filter version {} released below zero",
            self.id
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefChange {
    Acquire,
    Release,
    None,
}

pub struct FilterTable {
    pub(crate) name: String,
    current: Arc<FilterVersion>,
    next_version: u64,
    /// Version each session is filtered with.
    sessions: BTreeMap<(PeerId, Genid), Arc<FilterVersion>>,
    resolver: Option<Arc<dyn NextHopResolver>>,
    pub(crate) log: Logger,
}

impl FilterTable {
    /// A filter table with an empty bank, which passes everything.
    pub fn new(name: impl Into<String>, log: Logger) -> Self {
        Self {
            name: name.into(),
            current: Arc::new(FilterVersion::new(0, Vec::new())),
            next_version: 1,
            sessions: BTreeMap::new(),
            resolver: None,
            log,
        }
    }

    /// Resolver consulted by MED insertion for routes that have not been
    /// through next-hop resolution.
    pub fn with_resolver(mut self, resolver: Arc<dyn NextHopResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Build and install a new bank. Nothing changes if any entry is
    /// invalid.
    pub fn reconfigure(&mut self, specs: &[FilterSpec]) -> Result<u64, Error> {
        let filters = specs
            .iter()
            .map(|s| build_filter(s, self.resolver.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        self.install(filters);
        Ok(self.current.id)
    }

    /// Install an already built bank.
    pub fn install(&mut self, filters: Vec<Box<dyn RouteFilter>>) {
        let id = self.next_version;
        self.next_version += 1;
        let previous = std::mem::replace(
            &mut self.current,
            Arc::new(FilterVersion::new(id, filters)),
        );
        table_log!(self, info, MOD_FILTER, "installed filter version {}", id;
            "filters" => self.current.filters.iter().map(|f| f.name()).join(",")
        );
        if previous.route_count() == 0 {
            self.retire(&previous);
        }
    }

    pub fn current_version(&self) -> &Arc<FilterVersion> {
        &self.current
    }

    /// The version a session is being filtered with, if it has sent us
    /// anything.
    pub fn session_version(
        &self,
        peer: PeerId,
        genid: Genid,
    ) -> Option<&Arc<FilterVersion>> {
        self.sessions.get(&(peer, genid))
    }

    /// Ids of every version still alive, including the current one.
    pub fn live_versions(&self) -> Vec<u64> {
        self.sessions
            .values()
            .map(|v| v.id)
            .chain(std::iter::once(self.current.id))
            .sorted()
            .dedup()
            .collect()
    }

    fn retire(&mut self, version: &Arc<FilterVersion>) {
        if Arc::ptr_eq(version, &self.current) {
            return;
        }
        let id = version.id;
        self.sessions.retain(|_, v| v.id != id);
        table_log!(self, debug, MOD_FILTER, "retired filter version {}", id);
    }

    fn apply_filters(
        &mut self,
        msg: InternalMessage,
        change: RefChange,
    ) -> Option<InternalMessage> {
        let key = (msg.peer_id(), msg.genid());
        let version = match change {
            RefChange::None => self
                .sessions
                .get(&key)
                .unwrap_or(&self.current)
                .clone(),
            _ => self
                .sessions
                .entry(key)
                .or_insert_with(|| self.current.clone())
                .clone(),
        };
        match change {
            RefChange::Acquire => version.acquire(),
            RefChange::Release => version.release(),
            RefChange::None => {}
        }
        let out = version.apply(msg);
        if change == RefChange::Release && version.route_count() == 0 {
            self.retire(&version);
        }
        out
    }
}

impl RouteTable for FilterTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn add_route(
        &mut self,
        msg: InternalMessage,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        match self.apply_filters(msg, RefChange::Acquire) {
            Some(msg) => next.add_route(msg),
            None => Outcome::Filtered,
        }
    }

    fn replace_route(
        &mut self,
        old: InternalMessage,
        new: InternalMessage,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        let old = self.apply_filters(old, RefChange::Release);
        let new = self.apply_filters(new, RefChange::Acquire);
        match (old, new) {
            (None, None) => Outcome::Filtered,
            (Some(old), None) => {
                next.delete_route(old);
                Outcome::Filtered
            }
            (None, Some(new)) => next.add_route(new),
            (Some(old), Some(new)) => next.replace_route(old, new),
        }
    }

    fn delete_route(
        &mut self,
        msg: InternalMessage,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        match self.apply_filters(msg, RefChange::Release) {
            Some(msg) => next.delete_route(msg),
            None => Outcome::Filtered,
        }
    }

    fn route_dump(
        &mut self,
        msg: InternalMessage,
        dump_peer: PeerId,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        match self.apply_filters(msg, RefChange::Acquire) {
            Some(msg) => next.route_dump(msg, dump_peer),
            None => Outcome::Filtered,
        }
    }

    fn lookup_route(
        &self,
        net: Prefix,
        up: &Upstream<'_>,
    ) -> Option<RouteLookup> {
        let found = up.lookup_route(net)?;
        let version = self
            .sessions
            .get(&(found.origin.id, found.genid))
            .unwrap_or(&self.current);
        version
            .apply(found.into_message())
            .map(RouteLookup::from_message)
    }

    fn peering_down_complete(
        &mut self,
        peer: PeerId,
        genid: Genid,
        next: &mut TableCtx<'_>,
    ) {
        self.sessions.remove(&(peer, genid));
        next.peering_down_complete(peer, genid)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::attributes::{PathAttributes, UnknownAttribute};
    use crate::route::SubnetRoute;
    use crate::types::PeerHandle;
    use rtpipe_common::*;

    fn peer(id: u32, peer_type: PeerType) -> Arc<PeerHandle> {
        Arc::new(PeerHandle::new(
            PeerId(id),
            format!("peer-{id}"),
            peer_type,
            ip!("192.0.2.2"),
            64512 + id,
            Ipv4Addr::new(10, 255, 0, id as u8),
        ))
    }

    fn msg(origin: Arc<PeerHandle>, pa: PathAttributes) -> InternalMessage {
        InternalMessage::new(
            SubnetRoute::new(cidr!("198.51.100.0/24"), pa),
            origin,
            1,
        )
    }

    fn build(spec: FilterSpec) -> Box<dyn RouteFilter> {
        build_filter(&spec, None).expect("valid filter")
    }

    #[test]
    fn as_loop() {
        let f = build(FilterSpec::SimpleAsLoop { asn: 65000 });
        let looped = PathAttributes::new(ip!("192.0.2.1"))
            .with_as_path(&[65001, 65000, 65002]);
        assert!(f.filter(msg(peer(1, PeerType::Ebgp), looped)).is_none());

        let clean =
            PathAttributes::new(ip!("192.0.2.1")).with_as_path(&[65001]);
        let out = f
            .filter(msg(peer(1, PeerType::Ebgp), clean))
            .expect("passes");
        assert!(!out.changed());
    }

    #[test]
    fn rewriting_filters_mark_changed() {
        let f = build(FilterSpec::LocalPrefInsertion { local_pref: 200 });
        let pa = PathAttributes::new(ip!("192.0.2.1"));
        let m = msg(peer(1, PeerType::Ebgp), pa);
        let original = m.route().clone();
        let out = f.filter(m).expect("passes");
        assert!(out.changed());
        assert_eq!(out.attributes().local_pref, Some(200));
        assert!(out.route().is_derived());
        assert_eq!(original.attributes().local_pref, None);
    }

    #[test]
    fn nexthop_rewrite_keeps_third_party_nexthop() {
        let f = build(FilterSpec::NexthopRewrite {
            local_nexthop: ip!("203.0.113.1"),
            directly_connected: true,
            subnet: Some(cidr!("203.0.113.0/24")),
        });
        let on_subnet = PathAttributes::new(ip!("203.0.113.9"));
        let out = f
            .filter(msg(peer(1, PeerType::Ebgp), on_subnet))
            .expect("passes");
        let kept: IpAddr = ip!("203.0.113.9");
        assert_eq!(out.nexthop(), kept);
        assert!(!out.changed());

        let elsewhere = PathAttributes::new(ip!("192.0.2.1"));
        let out = f
            .filter(msg(peer(1, PeerType::Ebgp), elsewhere))
            .expect("passes");
        let local: IpAddr = ip!("203.0.113.1");
        assert_eq!(out.nexthop(), local);
        assert!(out.changed());
    }

    #[test]
    fn known_communities() {
        let no_export = PathAttributes::new(ip!("192.0.2.1"))
            .with_community(Community::NoExport);
        let to_ebgp = build(FilterSpec::KnownCommunity {
            peer_type: PeerType::Ebgp,
        });
        let to_ibgp = build(FilterSpec::KnownCommunity {
            peer_type: PeerType::Ibgp,
        });
        assert!(to_ebgp
            .filter(msg(peer(1, PeerType::Ibgp), no_export.clone()))
            .is_none());
        assert!(to_ibgp
            .filter(msg(peer(1, PeerType::Ibgp), no_export))
            .is_some());

        let no_advertise = PathAttributes::new(ip!("192.0.2.1"))
            .with_community(Community::NoAdvertise);
        assert!(to_ibgp
            .filter(msg(peer(1, PeerType::Ibgp), no_advertise))
            .is_none());

        let subconfed = PathAttributes::new(ip!("192.0.2.1"))
            .with_community(Community::NoExportSubConfed);
        let to_confed = build(FilterSpec::KnownCommunity {
            peer_type: PeerType::EbgpConfed,
        });
        assert!(to_confed
            .filter(msg(peer(1, PeerType::Ibgp), subconfed))
            .is_none());
    }

    #[test]
    fn route_reflection() {
        let to_nonclient = build(FilterSpec::RrIbgpLoop {
            rr_client: false,
            bgp_id: Ipv4Addr::new(10, 0, 0, 1),
            cluster_id: Ipv4Addr::new(10, 0, 0, 100),
        });
        let pa = PathAttributes::new(ip!("192.0.2.1"));
        assert!(to_nonclient
            .filter(msg(peer(1, PeerType::Ibgp), pa.clone()))
            .is_none());

        let out = to_nonclient
            .filter(msg(peer(2, PeerType::IbgpClient), pa.clone()))
            .expect("reflected");
        assert_eq!(
            out.attributes().originator_id,
            Some(Ipv4Addr::new(10, 255, 0, 2))
        );
        assert_eq!(
            out.attributes().cluster_list,
            vec![Ipv4Addr::new(10, 0, 0, 100)]
        );

        let ebgp = to_nonclient
            .filter(msg(peer(3, PeerType::Ebgp), pa))
            .expect("external routes pass");
        assert!(!ebgp.changed());

        let input = build(FilterSpec::RrInput {
            bgp_id: Ipv4Addr::new(10, 0, 0, 1),
            cluster_id: Ipv4Addr::new(10, 0, 0, 100),
        });
        assert!(input.filter(out).is_none());
    }

    #[test]
    fn unknown_attributes() {
        let mut pa = PathAttributes::new(ip!("192.0.2.1"));
        pa.unknown = vec![
            UnknownAttribute {
                type_code: 99,
                flags: path_attribute_flags::OPTIONAL,
                value: vec![1],
            },
            UnknownAttribute {
                type_code: 100,
                flags: path_attribute_flags::OPTIONAL
                    | path_attribute_flags::TRANSITIVE,
                value: vec![2],
            },
        ];
        let f = build(FilterSpec::UnknownAttributes);
        let out = f.filter(msg(peer(1, PeerType::Ebgp), pa)).expect("passes");
        assert_eq!(out.attributes().unknown.len(), 1);
        let kept = &out.attributes().unknown[0];
        assert_eq!(kept.type_code, 100);
        assert_ne!(kept.flags & path_attribute_flags::PARTIAL, 0);
    }

    #[test]
    fn invalid_filters_are_rejected() {
        let bad = [
            FilterSpec::SimpleAsLoop { asn: 0 },
            FilterSpec::AsPrepend {
                asn: 0,
                confederation: false,
            },
            FilterSpec::NexthopRewrite {
                local_nexthop: ip!("203.0.113.1"),
                directly_connected: true,
                subnet: None,
            },
            FilterSpec::NexthopRewrite {
                local_nexthop: ip!("203.0.113.1"),
                directly_connected: false,
                subnet: Some(cidr!("2001:db8::/64")),
            },
            FilterSpec::RrInput {
                bgp_id: Ipv4Addr::UNSPECIFIED,
                cluster_id: Ipv4Addr::new(10, 0, 0, 1),
            },
        ];
        for spec in bad {
            assert!(
                matches!(
                    build_filter(&spec, None),
                    Err(Error::InvalidFilter(_))
                ),
                "{spec:?} accepted"
            );
        }
    }

    #[test]
    fn failed_reconfigure_keeps_current_bank() {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let mut table = FilterTable::new("filter", log);
        let first = table
            .reconfigure(&[FilterSpec::SimpleAsLoop { asn: 65000 }])
            .expect("valid bank");
        let err = table.reconfigure(&[
            FilterSpec::MedRemoval,
            FilterSpec::SimpleAsLoop { asn: 0 },
        ]);
        assert!(err.is_err());
        assert_eq!(table.current_version().id(), first);
        assert_eq!(
            table.current_version().filter_names(),
            vec!["simple-as-loop"]
        );
        assert_eq!(table.live_versions(), vec![first]);
    }
}
