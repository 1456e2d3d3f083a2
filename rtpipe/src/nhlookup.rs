// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Next-hop gated admission.
//!
//! A route is only useful downstream once we know whether its next hop is
//! reachable. When the resolver does not know yet, the update is parked
//! here until the resolver calls back through `Pipeline::rib_lookup_done`.

use crate::log::table_log;
use crate::route::{InternalMessage, Outcome, RouteLookup, SubnetRoute};
use crate::table::{RouteTable, TableCtx, Upstream};
use crate::types::{Genid, PeerId, Prefix};
use crate::MOD_NHLOOKUP;
use slog::Logger;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub reachable: bool,
    pub metric: u32,
}

/// The routing information base that tells us how to reach next hops.
pub trait NextHopResolver: Send + Sync {
    /// Register interest in `nexthop` on behalf of `net`. Returns true if
    /// the reachability of `nexthop` is already known, in which case
    /// [`NextHopResolver::lookup`] answers immediately. Otherwise the
    /// resolver reports back later through `Pipeline::rib_lookup_done`.
    fn register_nexthop(&self, nexthop: IpAddr, net: Prefix) -> bool;

    /// Withdraw one earlier registration of `nexthop` for `net`.
    /// Registrations are counted, so a prefix may hold several for the same
    /// next hop while a replacement is in flight.
    fn deregister_nexthop(&self, nexthop: IpAddr, net: Prefix);

    fn lookup(&self, nexthop: IpAddr) -> Option<Resolution>;
}

#[derive(Debug)]
enum Queued {
    Add(InternalMessage),
    /// `old` is what downstream currently has for the prefix.
    Replace {
        old: InternalMessage,
        new: InternalMessage,
    },
}

impl Queued {
    /// The message waiting on resolution.
    fn pending(&self) -> &InternalMessage {
        match self {
            Self::Add(msg) => msg,
            Self::Replace { new, .. } => new,
        }
    }
}

#[derive(Debug)]
struct QueueEntry {
    seq: u64,
    op: Queued,
}

pub struct NhLookupTable {
    pub(crate) name: String,
    resolver: Arc<dyn NextHopResolver>,
    queue_by_net: BTreeMap<Prefix, QueueEntry>,
    /// Arrival order of queued prefixes per next hop.
    queue_by_nexthop: BTreeMap<IpAddr, BTreeMap<u64, Prefix>>,
    next_seq: u64,
    /// Prefixes whose add was dropped for an unreachable next hop.
    /// Downstream has nothing for them.
    dropped: BTreeSet<Prefix>,
    down_sessions: BTreeSet<(PeerId, Genid)>,
    pub(crate) log: Logger,
}

impl NhLookupTable {
    pub fn new(
        name: impl Into<String>,
        resolver: Arc<dyn NextHopResolver>,
        log: Logger,
    ) -> Self {
        Self {
            name: name.into(),
            resolver,
            queue_by_net: BTreeMap::new(),
            queue_by_nexthop: BTreeMap::new(),
            next_seq: 0,
            dropped: BTreeSet::new(),
            down_sessions: BTreeSet::new(),
            log,
        }
    }

    pub fn queued_count(&self) -> usize {
        self.queue_by_net.len()
    }

    pub fn is_queued(&self, net: Prefix) -> bool {
        self.queue_by_net.contains_key(&net)
    }

    fn enqueue(&mut self, op: Queued) {
        let pending = op.pending();
        let (net, nexthop) = (pending.net(), pending.nexthop());
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue_by_nexthop
            .entry(nexthop)
            .or_default()
            .insert(seq, net);
        let previous = self.queue_by_net.insert(net, QueueEntry { seq, op });
        assert!(
            previous.is_none(),
            "BUG: prefix {net} queued twice in {}",
            self.name
        );
        table_log!(self, debug, MOD_NHLOOKUP,
            "queued {} waiting on next hop {}", net, nexthop;
            "seq" => seq
        );
    }

    fn dequeue(&mut self, net: Prefix) -> Option<Queued> {
        let entry = self.queue_by_net.remove(&net)?;
        let nexthop = entry.op.pending().nexthop();
        let index = self.queue_by_nexthop.get_mut(&nexthop);
        let removed = index.and_then(|i| i.remove(&entry.seq));
        assert_eq!(
            removed,
            Some(net),
            "BUG: next hop index out of sync for {net} in {}",
            self.name
        );
        if self
            .queue_by_nexthop
            .get(&nexthop)
            .is_some_and(|i| i.is_empty())
        {
            self.queue_by_nexthop.remove(&nexthop);
        }
        Some(entry.op)
    }

    fn deregister(&self, msg: &InternalMessage) {
        self.resolver.deregister_nexthop(msg.nexthop(), msg.net());
    }

    fn mark_resolved(&self, route: &SubnetRoute, reachable: bool) {
        route.set_nexthop_resolved(reachable);
        if let Some(res) = self.resolver.lookup(route.nexthop()) {
            route.set_igp_metric(res.metric);
        }
    }

    fn mark_known(&self, route: &SubnetRoute) {
        let reachable = self
            .resolver
            .lookup(route.nexthop())
            .map(|r| r.reachable)
            .unwrap_or(false);
        self.mark_resolved(route, reachable);
    }

    fn is_stale(&self, msg: &InternalMessage) -> bool {
        self.down_sessions.contains(&(msg.peer_id(), msg.genid()))
    }

    /// Replay one queued entry now that its next hop is resolved.
    fn replay(
        &mut self,
        op: Queued,
        reachable: bool,
        next: &mut TableCtx<'_>,
    ) {
        match op {
            Queued::Add(msg) if reachable => {
                self.mark_resolved(msg.route(), true);
                next.add_route(msg);
            }
            Queued::Add(msg) => {
                table_log!(self, debug, MOD_NHLOOKUP,
                    "dropping {}: next hop {} unreachable",
                    msg.net(), msg.nexthop()
                );
                self.deregister(&msg);
                self.dropped.insert(msg.net());
            }
            Queued::Replace { old, new } if reachable => {
                self.mark_resolved(new.route(), true);
                let (onh, net) = (old.nexthop(), old.net());
                next.replace_route(old, new);
                self.resolver.deregister_nexthop(onh, net);
            }
            Queued::Replace { old, new } => {
                table_log!(self, debug, MOD_NHLOOKUP,
                    "withdrawing {}: new next hop {} unreachable",
                    new.net(), new.nexthop()
                );
                self.deregister(&new);
                self.dropped.insert(new.net());
                let (onh, net) = (old.nexthop(), old.net());
                next.delete_route(old);
                self.resolver.deregister_nexthop(onh, net);
            }
        }
    }
}

impl RouteTable for NhLookupTable {
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
        let net = msg.net();
        assert!(
            !self.queue_by_net.contains_key(&net),
            "BUG: add for queued prefix {net} in {}",
            self.name
        );
        self.dropped.remove(&net);
        if !self.resolver.register_nexthop(msg.nexthop(), net) {
            self.enqueue(Queued::Add(msg));
            return Outcome::Used;
        }
        self.mark_known(msg.route());
        next.add_route(msg)
    }

    fn replace_route(
        &mut self,
        old: InternalMessage,
        new: InternalMessage,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        let net = new.net();
        let known = self.resolver.register_nexthop(new.nexthop(), net);

        // What downstream has for this prefix, if anything.
        let downstream_old = match self.dequeue(net) {
            Some(Queued::Add(queued)) => {
                self.deregister(&queued);
                None
            }
            Some(Queued::Replace { old: queued_old, new: queued_new }) => {
                self.deregister(&queued_new);
                Some(queued_old)
            }
            None if self.dropped.remove(&net) => None,
            None => Some(old),
        };

        if !known {
            match downstream_old {
                Some(old) => self.enqueue(Queued::Replace { old, new }),
                None => self.enqueue(Queued::Add(new)),
            }
            return Outcome::Used;
        }

        self.mark_known(new.route());
        match downstream_old {
            Some(old) => {
                let onh = old.nexthop();
                let outcome = next.replace_route(old, new);
                self.resolver.deregister_nexthop(onh, net);
                outcome
            }
            None => next.add_route(new),
        }
    }

    fn delete_route(
        &mut self,
        msg: InternalMessage,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        let net = msg.net();
        match self.dequeue(net) {
            Some(Queued::Add(queued)) => {
                self.deregister(&queued);
                Outcome::Unused
            }
            Some(Queued::Replace { mut old, new }) => {
                self.deregister(&new);
                if msg.from_previous_peering() {
                    old.set_from_previous_peering();
                }
                let onh = old.nexthop();
                let outcome = next.delete_route(old);
                self.resolver.deregister_nexthop(onh, net);
                outcome
            }
            None if self.dropped.remove(&net) => Outcome::Unused,
            None => {
                let onh = msg.nexthop();
                let outcome = next.delete_route(msg);
                self.resolver.deregister_nexthop(onh, net);
                outcome
            }
        }
    }

    fn route_dump(
        &mut self,
        msg: InternalMessage,
        dump_peer: PeerId,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        let net = msg.net();
        if self.dropped.contains(&net) {
            return Outcome::Unused;
        }
        match self.queue_by_net.get(&net).map(|e| &e.op) {
            Some(Queued::Add(_)) => Outcome::Unused,
            Some(Queued::Replace { old, .. }) => {
                let msg = InternalMessage::new(
                    old.route().clone(),
                    old.origin_peer().clone(),
                    old.genid(),
                );
                next.route_dump(msg, dump_peer)
            }
            None => next.route_dump(msg, dump_peer),
        }
    }

    fn lookup_route(
        &self,
        net: Prefix,
        up: &Upstream<'_>,
    ) -> Option<RouteLookup> {
        if self.dropped.contains(&net) {
            return None;
        }
        match self.queue_by_net.get(&net).map(|e| &e.op) {
            Some(Queued::Add(_)) => None,
            Some(Queued::Replace { old, .. }) => Some(RouteLookup {
                route: old.route().clone(),
                origin: old.origin_peer().clone(),
                genid: old.genid(),
            }),
            None => up.lookup_route(net),
        }
    }

    fn rib_lookup_done(
        &mut self,
        nexthop: IpAddr,
        nets: &[Prefix],
        resolvable: bool,
        next: &mut TableCtx<'_>,
    ) {
        let Some(index) = self.queue_by_nexthop.get(&nexthop) else {
            table_log!(self, debug, MOD_NHLOOKUP,
                "nothing queued on next hop {}", nexthop
            );
            return;
        };
        let wanted: BTreeSet<&Prefix> = nets.iter().collect();
        let ready: Vec<Prefix> = index
            .values()
            .filter(|net| wanted.contains(net))
            .copied()
            .collect();

        let mut replayed = 0usize;
        for net in ready {
            let stale = self
                .queue_by_net
                .get(&net)
                .is_some_and(|e| self.is_stale(e.op.pending()));
            if stale {
                // Settled by the dead session's withdrawals.
                continue;
            }
            if let Some(op) = self.dequeue(net) {
                self.replay(op, resolvable, next);
                replayed += 1;
            }
        }
        table_log!(self, debug, MOD_NHLOOKUP,
            "next hop {} resolved", nexthop;
            "reachable" => resolvable,
            "replayed" => replayed
        );
        if replayed > 0 {
            next.push();
        }
    }

    fn peering_went_down(
        &mut self,
        peer: PeerId,
        genid: Genid,
        next: &mut TableCtx<'_>,
    ) {
        self.down_sessions.insert((peer, genid));
        next.peering_went_down(peer, genid)
    }

    fn peering_down_complete(
        &mut self,
        peer: PeerId,
        genid: Genid,
        next: &mut TableCtx<'_>,
    ) {
        let leftover: Vec<Prefix> = self
            .queue_by_net
            .iter()
            .filter(|(_, e)| {
                let m = e.op.pending();
                m.peer_id() == peer && m.genid() == genid
            })
            .map(|(net, _)| *net)
            .collect();
        for net in leftover {
            if let Some(op) = self.dequeue(net) {
                match &op {
                    Queued::Add(msg) => self.deregister(msg),
                    Queued::Replace { old, new } => {
                        self.deregister(new);
                        self.deregister(old);
                    }
                }
            }
        }
        self.down_sessions.remove(&(peer, genid));
        next.peering_down_complete(peer, genid)
    }

    fn route_count(&self) -> usize {
        self.queue_by_net.len()
    }
}
