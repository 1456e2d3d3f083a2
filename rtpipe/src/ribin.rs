// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The near end of a pipeline: routes as learned from each peer.

use crate::attributes::PathAttributes;
use crate::clock::TimerEvent;
use crate::error::Error;
use crate::log::table_log;
use crate::route::{InternalMessage, Outcome, RouteLookup, SubnetRoute};
use crate::table::TableCtx;
use crate::types::{Genid, PeerHandle, PeerId, Prefix};
use crate::MOD_RIBIN;
use slog::Logger;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

/// How many routes of a dead session are withdrawn per background step.
pub const DEFAULT_DELETION_CHUNK: usize = 100;

struct PeerRib {
    handle: Arc<PeerHandle>,
    genid: Genid,
    routes: BTreeMap<Prefix, Arc<SubnetRoute>>,
}

/// Routes of a session that went down, still being withdrawn downstream.
struct Deletion {
    handle: Arc<PeerHandle>,
    routes: BTreeMap<Prefix, Arc<SubnetRoute>>,
}

pub struct RibInTable {
    pub(crate) name: String,
    peers: BTreeMap<PeerId, PeerRib>,
    /// Last genid issued per peer. Survives the peer going down so the next
    /// session gets a fresh number.
    genids: BTreeMap<PeerId, Genid>,
    deleting: BTreeMap<(PeerId, Genid), Deletion>,
    deletion_chunk: usize,
    pub(crate) log: Logger,
}

impl RibInTable {
    pub fn new(name: impl Into<String>, log: Logger) -> Self {
        Self {
            name: name.into(),
            peers: BTreeMap::new(),
            genids: BTreeMap::new(),
            deleting: BTreeMap::new(),
            deletion_chunk: DEFAULT_DELETION_CHUNK,
            log,
        }
    }

    pub fn set_deletion_chunk(&mut self, chunk: usize) {
        self.deletion_chunk = chunk.max(1);
    }

    pub fn genid(&self, peer: PeerId) -> Option<Genid> {
        self.peers.get(&peer).map(|p| p.genid)
    }

    pub fn is_up(&self, peer: PeerId) -> bool {
        self.peers.contains_key(&peer)
    }

    pub fn route_count(&self) -> usize {
        self.peers.values().map(|p| p.routes.len()).sum()
    }

    pub fn peer_route_count(&self, peer: PeerId) -> usize {
        self.peers.get(&peer).map(|p| p.routes.len()).unwrap_or(0)
    }

    /// Sessions whose routes are still being withdrawn.
    pub fn deleting_sessions(&self) -> Vec<(PeerId, Genid)> {
        self.deleting.keys().copied().collect()
    }

    /// Up peers and their genids, in dump order.
    pub fn up_peers(&self) -> Vec<(PeerId, Genid)> {
        self.peers.iter().map(|(id, p)| (*id, p.genid)).collect()
    }

    pub fn peering_came_up(
        &mut self,
        handle: PeerHandle,
        next: &mut TableCtx<'_>,
    ) -> Result<Genid, Error> {
        let id = handle.id;
        if self.peers.contains_key(&id) {
            return Err(Error::PeerExists(id));
        }
        let genid = self.genids.entry(id).or_insert(0);
        *genid += 1;
        let genid = *genid;
        table_log!(self, info, MOD_RIBIN, "peering came up";
            "peer" => id.0,
            "genid" => genid
        );
        self.peers.insert(
            id,
            PeerRib {
                handle: Arc::new(handle),
                genid,
                routes: BTreeMap::new(),
            },
        );
        next.peering_came_up(id, genid);
        Ok(genid)
    }

    pub fn add_route(
        &mut self,
        peer: PeerId,
        net: Prefix,
        attributes: PathAttributes,
        next: &mut TableCtx<'_>,
    ) -> Result<Outcome, Error> {
        self.add_subnet_route(peer, SubnetRoute::new(net, attributes), next)
    }

    /// Announce a route. A route for a prefix the peer already announced
    /// replaces the previous one, and so does a route for a prefix that an
    /// earlier session of the peer announced and that has not been withdrawn
    /// yet.
    pub fn add_subnet_route(
        &mut self,
        peer: PeerId,
        route: Arc<SubnetRoute>,
        next: &mut TableCtx<'_>,
    ) -> Result<Outcome, Error> {
        let rib = self.peers.get_mut(&peer).ok_or(Error::UnknownPeer(peer))?;
        let net = route.net();
        let msg =
            InternalMessage::new(route.clone(), rib.handle.clone(), rib.genid);
        let outcome = match rib.routes.insert(net, route.clone()) {
            Some(old) => {
                old.set_in_use(false);
                let old =
                    InternalMessage::new(old, rib.handle.clone(), rib.genid);
                next.replace_route(old, msg)
            }
            None => match Self::take_pending(&mut self.deleting, peer, net) {
                Some(old) => {
                    table_log!(self, debug, MOD_RIBIN,
                        "{} announced again before its withdrawal", net;
                        "peer" => peer.0,
                        "old_genid" => old.genid(),
                        "genid" => msg.genid()
                    );
                    next.replace_route(old, msg)
                }
                None => next.add_route(msg),
            },
        };
        Self::record(&route, outcome);
        Ok(outcome)
    }

    /// Pull `net` out of the withdrawals still pending for `peer`'s earlier
    /// sessions. Downstream holds that route until it is replaced.
    fn take_pending(
        deleting: &mut BTreeMap<(PeerId, Genid), Deletion>,
        peer: PeerId,
        net: Prefix,
    ) -> Option<InternalMessage> {
        deleting
            .range_mut((peer, Genid::MIN)..=(peer, Genid::MAX))
            .find_map(|(&(_, genid), deletion)| {
                let route = deletion.routes.remove(&net)?;
                route.set_in_use(false);
                let mut msg =
                    InternalMessage::new(route, deletion.handle.clone(), genid);
                msg.set_from_previous_peering();
                Some(msg)
            })
    }

    pub fn delete_route(
        &mut self,
        peer: PeerId,
        net: Prefix,
        next: &mut TableCtx<'_>,
    ) -> Result<Outcome, Error> {
        let rib = self.peers.get_mut(&peer).ok_or(Error::UnknownPeer(peer))?;
        let Some(old) = rib.routes.remove(&net) else {
            table_log!(self, debug, MOD_RIBIN,
                "withdraw for unknown prefix {}", net;
                "peer" => peer.0
            );
            return Ok(Outcome::Unused);
        };
        old.set_in_use(false);
        let msg = InternalMessage::new(old, rib.handle.clone(), rib.genid);
        Ok(next.delete_route(msg))
    }

    pub fn push(
        &mut self,
        peer: PeerId,
        next: &mut TableCtx<'_>,
    ) -> Result<(), Error> {
        if !self.peers.contains_key(&peer) {
            return Err(Error::UnknownPeer(peer));
        }
        next.push();
        Ok(())
    }

    /// Take a session down. Its routes are withdrawn in the background;
    /// `peering_down_complete` follows the last withdrawal.
    pub fn peering_went_down(
        &mut self,
        peer: PeerId,
        next: &mut TableCtx<'_>,
    ) -> Result<Genid, Error> {
        let rib = self.peers.remove(&peer).ok_or(Error::UnknownPeer(peer))?;
        let genid = rib.genid;
        table_log!(self, info, MOD_RIBIN, "peering went down";
            "peer" => peer.0,
            "genid" => genid,
            "routes" => rib.routes.len()
        );
        next.peering_went_down(peer, genid);
        if rib.routes.is_empty() {
            next.peering_down_complete(peer, genid);
            return Ok(genid);
        }
        self.deleting.insert(
            (peer, genid),
            Deletion {
                handle: rib.handle,
                routes: rib.routes,
            },
        );
        next.schedule_after(
            Duration::ZERO,
            TimerEvent::DeleteSomeRoutes { peer, genid },
        );
        Ok(genid)
    }

    pub fn timer_fired(&mut self, event: TimerEvent, next: &mut TableCtx<'_>) {
        if let TimerEvent::DeleteSomeRoutes { peer, genid } = event {
            self.delete_some_routes(peer, genid, next);
        }
    }

    fn delete_some_routes(
        &mut self,
        peer: PeerId,
        genid: Genid,
        next: &mut TableCtx<'_>,
    ) {
        let Some(deletion) = self.deleting.get_mut(&(peer, genid)) else {
            return;
        };
        for _ in 0..self.deletion_chunk {
            let Some((_, route)) = deletion.routes.pop_first() else {
                break;
            };
            route.set_in_use(false);
            let mut msg =
                InternalMessage::new(route, deletion.handle.clone(), genid);
            msg.set_from_previous_peering();
            next.delete_route(msg);
        }
        next.push();

        if deletion.routes.is_empty() {
            self.deleting.remove(&(peer, genid));
            table_log!(self, debug, MOD_RIBIN, "deletion complete";
                "peer" => peer.0,
                "genid" => genid
            );
            next.peering_down_complete(peer, genid);
        } else {
            next.schedule_after(
                Duration::ZERO,
                TimerEvent::DeleteSomeRoutes { peer, genid },
            );
        }
    }

    /// The route for `net` from the lowest numbered up peer announcing it.
    pub fn lookup_route(&self, net: Prefix) -> Option<RouteLookup> {
        self.peers.values().find_map(|p| {
            p.routes.get(&net).map(|r| RouteLookup {
                route: r.clone(),
                origin: p.handle.clone(),
                genid: p.genid,
            })
        })
    }

    pub fn route_used(&self, route: &SubnetRoute, in_use: bool) {
        route.original_route().set_in_use(in_use);
    }

    /// The first route of `peer`'s session `genid` strictly after `after`,
    /// packaged for a dump. `None` when that session has nothing further to
    /// offer, including when it is no longer up.
    pub fn next_dump_route(
        &self,
        peer: PeerId,
        genid: Genid,
        after: Option<Prefix>,
    ) -> Option<InternalMessage> {
        let rib = self.peers.get(&peer).filter(|p| p.genid == genid)?;
        let lower = match after {
            Some(net) => Bound::Excluded(net),
            None => Bound::Unbounded,
        };
        let (_, route) = rib.routes.range((lower, Bound::Unbounded)).next()?;
        Some(InternalMessage::new(route.clone(), rib.handle.clone(), genid))
    }

    fn record(route: &SubnetRoute, outcome: Outcome) {
        route.set_in_use(outcome.in_use());
        route.set_filtered(outcome == Outcome::Filtered);
    }
}
