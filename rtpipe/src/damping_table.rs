// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flap damping stage.
//!
//! Damping state is kept per prefix, so a damping table belongs on a chain
//! that carries a single peer's routes.

use crate::clock::{TimerEvent, TimerHandle};
use crate::config::DampingConfig;
use crate::damping::{Damping, FREQUENCY};
use crate::error::Error;
use crate::log::table_log;
use crate::route::{InternalMessage, Outcome, RouteLookup};
use crate::table::{RouteTable, TableCtx, Upstream};
use crate::types::{Genid, PeerId, Prefix};
use crate::MOD_DAMPING;
use slog::Logger;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Interval of the sweep that drops records of settled prefixes.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DampRecord {
    /// Tick of the last flap.
    tick: u64,
    merit: u32,
    damped: bool,
}

/// A suppressed prefix.
struct Suppressed {
    /// The route being held back. `None` once it has been withdrawn; the
    /// prefix stays suppressed until its merit decays.
    msg: Option<InternalMessage>,
    genid: Genid,
    timer: TimerHandle,
}

pub struct DampingTable {
    pub(crate) name: String,
    damping: Damping,
    records: BTreeMap<Prefix, DampRecord>,
    suppressed: BTreeMap<Prefix, Suppressed>,
    /// Sessions that went down and whose routes are still being withdrawn.
    down: BTreeSet<(PeerId, Genid)>,
    pub(crate) log: Logger,
}

impl DampingTable {
    pub fn new(name: impl Into<String>, damping: Damping, log: Logger) -> Self {
        Self {
            name: name.into(),
            damping,
            records: BTreeMap::new(),
            suppressed: BTreeMap::new(),
            down: BTreeSet::new(),
            log,
        }
    }

    pub fn reconfigure(&mut self, config: &DampingConfig) -> Result<(), Error> {
        self.damping.reconfigure(config)?;
        table_log!(self, info, MOD_DAMPING, "damping reconfigured";
            "enabled" => config.enabled,
            "half_life" => config.half_life,
            "max_hold_down" => config.max_hold_down,
            "reuse" => config.reuse,
            "cutoff" => config.cutoff
        );
        self.settle();
        Ok(())
    }

    pub fn damping(&self) -> &Damping {
        &self.damping
    }

    pub fn is_damped(&self, net: Prefix) -> bool {
        self.records.get(&net).is_some_and(|r| r.damped)
    }

    /// Whether a route for `net` is being held back.
    pub fn is_held(&self, net: Prefix) -> bool {
        self.suppressed.get(&net).is_some_and(|s| s.msg.is_some())
    }

    /// Merit as of the last flap of `net`.
    pub fn merit(&self, net: Prefix) -> Option<u32> {
        self.records.get(&net).map(|r| r.merit)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Once damping is off and nothing is suppressed any more, the records
    /// serve no purpose.
    fn settle(&mut self) {
        if !self.damping.active() && !self.records.is_empty() {
            table_log!(self, debug, MOD_DAMPING,
                "damping disabled, dropping {} records", self.records.len()
            );
            self.records.clear();
        }
    }

    /// Count a flap of `net` at `now`, returning whether the prefix is
    /// suppressed afterwards. The first announcement of a prefix starts its
    /// record without a penalty beyond the base merit.
    fn flap(&mut self, net: Prefix, now: u64) -> bool {
        let damping = &self.damping;
        let record = self.records.entry(net).or_insert(DampRecord {
            tick: now,
            merit: 0,
            damped: false,
        });
        record.merit = damping.compute_merit(record.tick, now, record.merit);
        record.tick = now;
        if record.damped {
            return true;
        }
        if damping.enabled() && damping.cutoff(record.merit) {
            record.damped = true;
            self.damping.damped();
            return true;
        }
        false
    }

    /// Hold `msg` back until the merit of its prefix has decayed.
    fn suppress(&mut self, msg: InternalMessage, next: &mut TableCtx<'_>) {
        let net = msg.net();
        let merit = self.records.get(&net).map(|r| r.merit).unwrap_or(0);
        let delay = self.damping.reuse_time(merit);
        if let Some(prev) = self.suppressed.remove(&net) {
            next.cancel(prev.timer);
        }
        let genid = msg.genid();
        let timer =
            next.schedule_after(delay, TimerEvent::Undamp { net, genid });
        table_log!(self, info, MOD_DAMPING, "suppressing {}", net;
            "peer" => msg.peer_id().0,
            "merit" => merit,
            "release_in_secs" => delay.as_secs()
        );
        self.suppressed.insert(
            net,
            Suppressed {
                msg: Some(msg),
                genid,
                timer,
            },
        );
    }

    fn release(
        &mut self,
        net: Prefix,
        genid: Genid,
        next: &mut TableCtx<'_>,
    ) {
        let now = Damping::tick(next.now());
        let Some(held) = self.suppressed.get(&net) else {
            return;
        };
        if held.genid != genid {
            table_log!(self, debug, MOD_DAMPING,
                "ignoring stale release of {}", net;
                "genid" => genid
            );
            return;
        }
        let Some(record) = self.records.get(&net).copied() else {
            panic!("BUG: suppressed prefix {net} has no damping record");
        };
        let merit = self.damping.decayed_merit(record.tick, now, record.merit);
        let stale = held
            .msg
            .as_ref()
            .is_some_and(|m| self.down.contains(&(m.peer_id(), m.genid())));

        // The route of a dead session stays put until its withdrawal
        // arrives.
        if stale || self.damping.reuse(merit) {
            let delay = if stale {
                FREQUENCY
            } else {
                self.damping.reuse_time(merit)
            };
            let timer =
                next.schedule_after(delay, TimerEvent::Undamp { net, genid });
            if let Some(held) = self.suppressed.get_mut(&net) {
                held.timer = timer;
            }
            return;
        }

        let Some(held) = self.suppressed.remove(&net) else {
            return;
        };
        if let Some(record) = self.records.get_mut(&net) {
            record.damped = false;
        }
        self.damping.undamped();
        table_log!(self, info, MOD_DAMPING, "releasing {}", net;
            "merit" => merit,
            "held" => held.msg.is_some()
        );
        if let Some(msg) = held.msg {
            next.add_route(msg);
            next.push();
        }
        self.settle();
    }

    fn sweep(&mut self, now: u64) {
        let damping = &self.damping;
        let before = self.records.len();
        self.records
            .retain(|_, r| r.damped || !damping.expired(r.tick, now));
        let swept = before - self.records.len();
        if swept > 0 {
            table_log!(self, debug, MOD_DAMPING,
                "swept {} settled records", swept
            );
        }
    }
}

impl RouteTable for DampingTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn plumbed(&mut self, next: &mut TableCtx<'_>) {
        next.schedule_periodic(SWEEP_INTERVAL, TimerEvent::DampingTick);
    }

    fn add_route(
        &mut self,
        msg: InternalMessage,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        if msg.origin_peer().is_ibgp() || !self.damping.active() {
            return next.add_route(msg);
        }
        // Replays are not flaps.
        if msg.dump() {
            if self.is_damped(msg.net()) {
                return Outcome::Unused;
            }
            return next.add_route(msg);
        }
        let now = Damping::tick(next.now());
        if self.flap(msg.net(), now) {
            self.suppress(msg, next);
            return Outcome::Unused;
        }
        next.add_route(msg)
    }

    fn replace_route(
        &mut self,
        old: InternalMessage,
        new: InternalMessage,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        if new.origin_peer().is_ibgp() || !self.damping.active() {
            return next.replace_route(old, new);
        }
        let net = new.net();
        let was_damped = self.is_damped(net);
        let now = Damping::tick(next.now());
        if !self.flap(net, now) {
            return next.replace_route(old, new);
        }
        // The old route only reached downstream if the prefix was not
        // already suppressed.
        if !was_damped {
            next.delete_route(old);
        }
        self.suppress(new, next);
        Outcome::Unused
    }

    fn delete_route(
        &mut self,
        msg: InternalMessage,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        let net = msg.net();
        if !self.is_damped(net) {
            return next.delete_route(msg);
        }
        // A held route from another session is not the one being withdrawn.
        let session = (msg.peer_id(), msg.genid());
        let other = self
            .suppressed
            .get(&net)
            .and_then(|held| held.msg.as_ref())
            .is_some_and(|held| (held.peer_id(), held.genid()) != session);
        if other {
            table_log!(self, debug, MOD_DAMPING,
                "ignoring stale withdrawal of suppressed {}", net;
                "peer" => msg.peer_id().0,
                "genid" => msg.genid()
            );
            return Outcome::Unused;
        }
        if !msg.from_previous_peering() {
            let now = Damping::tick(next.now());
            self.flap(net, now);
        }
        if let Some(held) = self.suppressed.get_mut(&net) {
            held.msg = None;
        }
        table_log!(self, debug, MOD_DAMPING,
            "withdrawal of suppressed {}", net;
            "peer" => msg.peer_id().0
        );
        Outcome::Unused
    }

    fn route_dump(
        &mut self,
        msg: InternalMessage,
        dump_peer: PeerId,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        if self.is_damped(msg.net()) {
            return Outcome::Unused;
        }
        next.route_dump(msg, dump_peer)
    }

    fn lookup_route(
        &self,
        net: Prefix,
        up: &Upstream<'_>,
    ) -> Option<RouteLookup> {
        if self.is_damped(net) {
            return None;
        }
        up.lookup_route(net)
    }

    fn peering_went_down(
        &mut self,
        peer: PeerId,
        genid: Genid,
        next: &mut TableCtx<'_>,
    ) {
        self.down.insert((peer, genid));
        next.peering_went_down(peer, genid)
    }

    fn peering_down_complete(
        &mut self,
        peer: PeerId,
        genid: Genid,
        next: &mut TableCtx<'_>,
    ) {
        self.down.remove(&(peer, genid));
        for held in self.suppressed.values_mut() {
            if held
                .msg
                .as_ref()
                .is_some_and(|m| m.peer_id() == peer && m.genid() == genid)
            {
                held.msg = None;
            }
        }
        next.peering_down_complete(peer, genid)
    }

    fn timer_fired(&mut self, event: TimerEvent, next: &mut TableCtx<'_>) {
        match event {
            TimerEvent::Undamp { net, genid } => self.release(net, genid, next),
            TimerEvent::DampingTick => self.sweep(Damping::tick(next.now())),
            _ => {}
        }
    }

    fn route_count(&self) -> usize {
        self.suppressed.values().filter(|s| s.msg.is_some()).count()
    }
}
