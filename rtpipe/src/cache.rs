// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Change cache.
//!
//! Tables above a cache, typically a filter bank, may hand down freshly
//! derived routes that nobody upstream keeps. The cache becomes the owner
//! of such routes so that tables below it see a stable route per prefix,
//! and so that a later replace or delete can be matched to exactly the
//! route that was announced.

use crate::clock::TimerEvent;
use crate::log::table_log;
use crate::route::{InternalMessage, Outcome, RouteLookup, SubnetRoute};
use crate::table::{RouteTable, TableCtx, Upstream};
use crate::types::{Genid, PeerHandle, PeerId, Prefix};
use crate::MOD_CACHE;
use slog::Logger;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// How many flushed routes are released per background step.
pub const FLUSH_CHUNK: usize = 100;

#[derive(Debug)]
struct CacheEntry {
    route: Arc<SubnetRoute>,
    origin: Arc<PeerHandle>,
    genid: Genid,
}

pub struct CacheTable {
    pub(crate) name: String,
    routes: BTreeMap<Prefix, CacheEntry>,
    /// Routes dropped from the cache that are released in the background.
    flushing: Vec<Arc<SubnetRoute>>,
    flush_armed: bool,
    /// Sessions whose entries were flushed. Late withdrawals for them are
    /// absorbed rather than treated as a broken contract.
    flushed_sessions: BTreeSet<(PeerId, Genid)>,
    pub(crate) log: Logger,
}

impl CacheTable {
    pub fn new(name: impl Into<String>, log: Logger) -> Self {
        Self {
            name: name.into(),
            routes: BTreeMap::new(),
            flushing: Vec::new(),
            flush_armed: false,
            flushed_sessions: BTreeSet::new(),
            log,
        }
    }

    pub fn cached_route(&self, net: Prefix) -> Option<&Arc<SubnetRoute>> {
        self.routes.get(&net).map(|e| &e.route)
    }

    /// Routes waiting to be released by a flush.
    pub fn flush_backlog(&self) -> usize {
        self.flushing.len()
    }

    /// Forget every cached route without telling downstream. Used when the
    /// downstream of this cache is being torn down with it.
    pub fn flush_cache(&mut self, next: &mut TableCtx<'_>) {
        let routes = std::mem::take(&mut self.routes);
        table_log!(self, info, MOD_CACHE, "flushing cache";
            "routes" => routes.len()
        );
        for (_, entry) in routes {
            self.flushed_sessions.insert((entry.origin.id, entry.genid));
            self.flushing.push(entry.route);
        }
        self.arm_flush(next);
    }

    fn arm_flush(&mut self, next: &mut TableCtx<'_>) {
        if !self.flush_armed && !self.flushing.is_empty() {
            next.schedule_after(Duration::ZERO, TimerEvent::FlushSomeRoutes);
            self.flush_armed = true;
        }
    }

    fn flush_some_routes(&mut self, next: &mut TableCtx<'_>) {
        self.flush_armed = false;
        let keep = self.flushing.len().saturating_sub(FLUSH_CHUNK);
        self.flushing.truncate(keep);
        self.arm_flush(next);
    }

    /// Put a changed route in the cache and hand back an unchanged envelope
    /// that refers to the cached route.
    fn store(&mut self, mut msg: InternalMessage) -> InternalMessage {
        let net = msg.net();
        if !msg.changed() {
            assert!(
                !self.routes.contains_key(&net),
                "BUG: unchanged route for cached prefix {net} in {}",
                self.name
            );
            return msg;
        }
        let previous = self.routes.insert(
            net,
            CacheEntry {
                route: msg.route().clone(),
                origin: msg.origin_peer().clone(),
                genid: msg.genid(),
            },
        );
        assert!(
            previous.is_none(),
            "BUG: add for prefix {net} already cached in {}",
            self.name
        );
        msg.clear_changed();
        msg
    }

    /// Take the cached route an old envelope refers to out of the cache.
    /// `None` means the envelope belongs to a flushed session and should be
    /// absorbed.
    fn take(&mut self, msg: InternalMessage) -> Option<InternalMessage> {
        let net = msg.net();
        if !msg.changed() {
            assert!(
                !self.routes.contains_key(&net),
                "BUG: unchanged route for cached prefix {net} in {}",
                self.name
            );
            return Some(msg);
        }
        match self.routes.remove(&net) {
            Some(entry) => {
                debug_assert_eq!(entry.route.nexthop(), msg.nexthop());
                let mut msg = msg.with_route(entry.route);
                msg.clear_changed();
                Some(msg)
            }
            None if self
                .flushed_sessions
                .contains(&(msg.peer_id(), msg.genid())) =>
            {
                table_log!(self, debug, MOD_CACHE,
                    "absorbing withdrawal of flushed prefix {}", net;
                    "peer" => msg.peer_id().0,
                    "genid" => msg.genid()
                );
                None
            }
            None => panic!(
                "BUG: changed route for prefix {net} not cached in {}",
                self.name
            ),
        }
    }
}

impl RouteTable for CacheTable {
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
        if !msg.changed() {
            let net = msg.net();
            assert!(
                !self.routes.contains_key(&net),
                "BUG: unchanged add for cached prefix {net} in {}",
                self.name
            );
            return next.add_route(msg);
        }
        let msg = self.store(msg);
        let route = msg.route().clone();
        let outcome = next.add_route(msg);
        route.set_in_use(outcome.in_use());
        outcome
    }

    fn replace_route(
        &mut self,
        old: InternalMessage,
        new: InternalMessage,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        let new = match self.take(old) {
            Some(old) => {
                let new = self.store(new);
                let route = new.route().clone();
                let outcome = next.replace_route(old, new);
                route.set_in_use(outcome.in_use());
                return outcome;
            }
            None => self.store(new),
        };
        // The old route went with a flush, so downstream never saw it.
        let route = new.route().clone();
        let outcome = next.add_route(new);
        route.set_in_use(outcome.in_use());
        outcome
    }

    fn delete_route(
        &mut self,
        msg: InternalMessage,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        match self.take(msg) {
            Some(msg) => next.delete_route(msg),
            None => Outcome::Unused,
        }
    }

    fn route_dump(
        &mut self,
        msg: InternalMessage,
        dump_peer: PeerId,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        if !msg.changed() {
            return next.route_dump(msg, dump_peer);
        }
        let msg = match self.routes.get(&msg.net()) {
            Some(entry) => {
                let route = entry.route.clone();
                let mut msg = msg.with_route(route);
                msg.clear_changed();
                msg
            }
            None => self.store(msg),
        };
        next.route_dump(msg, dump_peer)
    }

    fn lookup_route(
        &self,
        net: Prefix,
        up: &Upstream<'_>,
    ) -> Option<RouteLookup> {
        match self.routes.get(&net) {
            Some(entry) => Some(RouteLookup {
                route: entry.route.clone(),
                origin: entry.origin.clone(),
                genid: entry.genid,
            }),
            None => up.lookup_route(net),
        }
    }

    fn peering_down_complete(
        &mut self,
        peer: PeerId,
        genid: Genid,
        next: &mut TableCtx<'_>,
    ) {
        let stale: Vec<Prefix> = self
            .routes
            .iter()
            .filter(|(_, e)| e.origin.id == peer && e.genid == genid)
            .map(|(net, _)| *net)
            .collect();
        if !stale.is_empty() {
            table_log!(self, warn, MOD_CACHE,
                "flushing {} routes left behind by a dead session", stale.len();
                "peer" => peer.0,
                "genid" => genid
            );
        }
        for net in stale {
            if let Some(entry) = self.routes.remove(&net) {
                self.flushing.push(entry.route);
            }
        }
        self.flushed_sessions.remove(&(peer, genid));
        self.arm_flush(next);
        next.peering_down_complete(peer, genid)
    }

    fn timer_fired(&mut self, event: TimerEvent, next: &mut TableCtx<'_>) {
        if event == TimerEvent::FlushSomeRoutes {
            self.flush_some_routes(next);
        }
    }

    fn route_count(&self) -> usize {
        self.routes.len()
    }
}
