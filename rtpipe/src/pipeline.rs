// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The owning chain object and its driver.
//!
//! A [`Pipeline`] owns its route source, its tables, its sink and its timer
//! service, and is the only way anything outside reaches them. Everything
//! runs on the caller's thread: route operations are delivered depth first
//! down the chain before the call returns, and background work (timers,
//! held back updates, dump steps) advances only when the owner calls
//! [`Pipeline::get_next_message`], [`Pipeline::run_until_idle`] or
//! [`Pipeline::advance`].
//!
//! While the sink reports busy, updates from the source are queued at the
//! top of the chain and timers that would send routes are deferred. Both
//! drain, in order, once the sink is ready again.

use crate::attributes::PathAttributes;
use crate::clock::{Scheduler, StageId, TimerEvent};
use crate::dump::{DumpIterator, DumpTable};
use crate::error::Error;
use crate::log::pipeline_log;
use crate::ribin::RibInTable;
use crate::route::{Outcome, RouteLookup, SubnetRoute};
use crate::table::{
    NullSink, QueuedOp, RouteSink, RouteTable, Slot, TableCtx, Upstream,
};
use crate::types::{Genid, PeerHandle, PeerId, Prefix};
use rtpipe_common::lock;
use slog::Logger;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{sleep, spawn, JoinHandle};
use std::time::{Duration, Instant};

pub struct Pipeline {
    pub(crate) name: String,
    source: RibInTable,
    tables: Vec<Slot>,
    sink: Box<dyn RouteSink>,
    attached: bool,
    sched: Scheduler,
    /// Source operations held back while the sink is busy.
    queue: VecDeque<QueuedOp>,
    /// Stage timers that fired while the sink was busy.
    deferred: VecDeque<(StageId, TimerEvent)>,
    output_busy: bool,
    dump: Option<StageId>,
    next_stage_id: u64,
    pub(crate) log: Logger,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, log: Logger) -> Self {
        let name = name.into();
        Self {
            source: RibInTable::new(format!("{name}/ribin"), log.clone()),
            name,
            tables: Vec::new(),
            sink: Box::new(NullSink),
            attached: false,
            sched: Scheduler::new(),
            queue: VecDeque::new(),
            deferred: VecDeque::new(),
            output_busy: false,
            dump: None,
            next_stage_id: StageId::SOURCE.0 + 1,
            log,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pipeline time.
    pub fn now(&self) -> Duration {
        self.sched.now()
    }

    pub fn source(&self) -> &RibInTable {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut RibInTable {
        &mut self.source
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn is_busy(&self) -> bool {
        self.output_busy
    }

    /// Source operations waiting for the sink.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Stage ids and names, from the source toward the sink.
    pub fn stages(&self) -> Vec<(StageId, &str)> {
        self.tables.iter().map(|s| (s.id, s.table.name())).collect()
    }

    /// The dump table, while a dump is in progress.
    pub fn dump_stage(&self) -> Option<StageId> {
        self.dump
    }

    fn allocate_id(&mut self) -> StageId {
        let id = StageId(self.next_stage_id);
        self.next_stage_id += 1;
        id
    }

    fn index_of(&self, id: StageId) -> Option<usize> {
        self.tables.iter().position(|s| s.id == id)
    }

    /// Add a table at the far end of the chain, just above the sink.
    pub fn plumb(&mut self, table: Box<dyn RouteTable>) -> StageId {
        let id = self.allocate_id();
        pipeline_log!(self, debug, "plumbing {}", table.name();
            "stage" => id.0
        );
        self.tables.push(Slot { id, table });
        let index = self.tables.len() - 1;
        self.with_stage(index, |table, ctx| table.plumbed(ctx));
        id
    }

    /// Connect the far end of the pipeline. Routes the source already holds
    /// are not replayed; use [`Pipeline::attach_with_dump`] for that.
    pub fn attach(&mut self, sink: Box<dyn RouteSink>) -> Result<(), Error> {
        if self.attached {
            return Err(Error::AlreadyAttached(self.name.clone()));
        }
        self.sink = sink;
        self.attached = true;
        pipeline_log!(self, info, "sink attached");
        Ok(())
    }

    /// Connect the far end of the pipeline and replay everything the source
    /// holds to it, on behalf of `target`, while live updates keep flowing.
    pub fn attach_with_dump(
        &mut self,
        target: PeerId,
        sink: Box<dyn RouteSink>,
    ) -> Result<StageId, Error> {
        if let Some(id) = self.dump {
            let peer = self
                .table::<DumpTable>(id)
                .map(|d| d.target())
                .unwrap_or(target);
            return Err(Error::DumpInProgress(peer));
        }
        self.attach(sink)?;

        let iter = DumpIterator::new(
            target,
            &self.source.up_peers(),
            &self.source.deleting_sessions(),
        );
        let name = format!("{}/dump", self.name);
        let table = DumpTable::new(name, iter, self.log.clone());
        let id = self.allocate_id();
        self.tables.insert(
            0,
            Slot {
                id,
                table: Box::new(table),
            },
        );
        self.dump = Some(id);
        pipeline_log!(self, info, "dumping table";
            "target" => target.0,
            "stage" => id.0
        );
        self.with_stage(0, |table, ctx| table.plumbed(ctx));
        Ok(id)
    }

    pub fn table<T: RouteTable>(&self, id: StageId) -> Option<&T> {
        let index = self.index_of(id)?;
        self.tables[index].table.as_any().downcast_ref::<T>()
    }

    pub fn table_mut<T: RouteTable>(&mut self, id: StageId) -> Option<&mut T> {
        let index = self.index_of(id)?;
        self.tables[index].table.as_any_mut().downcast_mut::<T>()
    }

    /// The first stage of type `T`.
    pub fn find<T: RouteTable>(&self) -> Option<StageId> {
        self.tables
            .iter()
            .find(|s| s.table.as_any().is::<T>())
            .map(|s| s.id)
    }

    /// Run `f` against a stage with a context for everything below it, for
    /// operations such as a cache flush that send routes downstream.
    pub fn with_table<T: RouteTable, R>(
        &mut self,
        id: StageId,
        f: impl FnOnce(&mut T, &mut TableCtx<'_>) -> R,
    ) -> Result<R, Error> {
        let index = self.index_of(id).ok_or(Error::NoSuchTable(id.0))?;
        self.with_stage(index, |table, ctx| {
            table.as_any_mut().downcast_mut::<T>().map(|t| f(t, ctx))
        })
        .ok_or(Error::WrongTableKind(id.0, std::any::type_name::<T>()))
    }

    /// Whether source traffic has to be queued.
    fn holding(&self) -> bool {
        self.attached && (self.output_busy || !self.queue.is_empty())
    }

    /// Run `f` against the source with a context for the whole chain. With
    /// `hold`, route operations are queued instead of delivered.
    fn with_source<R>(
        &mut self,
        hold: bool,
        f: impl FnOnce(&mut RibInTable, &mut TableCtx<'_>) -> R,
    ) -> R {
        let mut empty: [Slot; 0] = [];
        let mut null = NullSink;
        let (rest, sink): (&mut [Slot], &mut (dyn RouteSink + 'static)) =
            if self.attached {
                (self.tables.as_mut_slice(), &mut *self.sink)
            } else {
                (&mut empty[..], &mut null as &mut (dyn RouteSink + 'static))
            };
        let queue = if hold { Some(&mut self.queue) } else { None };
        let mut ctx =
            TableCtx::new(StageId::SOURCE, rest, sink, &mut self.sched, queue);
        f(&mut self.source, &mut ctx)
    }

    /// Run `f` against the stage at `index` with a context for everything
    /// below it.
    fn with_stage<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut dyn RouteTable, &mut TableCtx<'_>) -> R,
    ) -> R {
        let (above, below) = self.tables.split_at_mut(index + 1);
        let slot = &mut above[index];
        let mut ctx = TableCtx::new(
            slot.id,
            below,
            &mut *self.sink,
            &mut self.sched,
            None,
        );
        f(&mut *slot.table, &mut ctx)
    }

    pub fn peering_came_up(
        &mut self,
        handle: PeerHandle,
    ) -> Result<Genid, Error> {
        let hold = self.holding();
        self.with_source(hold, |source, ctx| {
            source.peering_came_up(handle, ctx)
        })
    }

    pub fn add_route(
        &mut self,
        peer: PeerId,
        net: Prefix,
        attributes: PathAttributes,
    ) -> Result<Outcome, Error> {
        let hold = self.holding();
        self.with_source(hold, |source, ctx| {
            source.add_route(peer, net, attributes, ctx)
        })
    }

    pub fn add_subnet_route(
        &mut self,
        peer: PeerId,
        route: Arc<SubnetRoute>,
    ) -> Result<Outcome, Error> {
        let hold = self.holding();
        self.with_source(hold, |source, ctx| {
            source.add_subnet_route(peer, route, ctx)
        })
    }

    pub fn delete_route(
        &mut self,
        peer: PeerId,
        net: Prefix,
    ) -> Result<Outcome, Error> {
        let hold = self.holding();
        self.with_source(hold, |source, ctx| {
            source.delete_route(peer, net, ctx)
        })
    }

    pub fn push(&mut self, peer: PeerId) -> Result<(), Error> {
        let hold = self.holding();
        self.with_source(hold, |source, ctx| source.push(peer, ctx))
    }

    pub fn peering_went_down(&mut self, peer: PeerId) -> Result<Genid, Error> {
        let hold = self.holding();
        self.with_source(hold, |source, ctx| {
            source.peering_went_down(peer, ctx)
        })
    }

    /// The route the far end of the pipeline sees for `net`.
    pub fn lookup_route(&self, net: Prefix) -> Option<RouteLookup> {
        Upstream::new(&self.tables, &self.source).lookup_route(net)
    }

    /// The sink reports whether it still references a route it was sent.
    pub fn route_used(&mut self, route: &SubnetRoute, in_use: bool) {
        for slot in self.tables.iter_mut().rev() {
            slot.table.route_used(route, in_use);
        }
        self.source.route_used(route, in_use);
    }

    /// The sink reports whether it can take more work.
    pub fn output_state(&mut self, busy: bool) {
        if busy == self.output_busy {
            return;
        }
        self.output_busy = busy;
        pipeline_log!(self, debug, "output state changed";
            "busy" => busy,
            "queued" => self.queue.len()
        );
        for slot in self.tables.iter_mut() {
            slot.table.output_state(busy);
        }
        if !busy && (!self.queue.is_empty() || self.dump.is_some()) {
            self.sink.wakeup();
        }
    }

    /// Next-hop resolution finished for `nexthop`.
    pub fn rib_lookup_done(
        &mut self,
        nexthop: IpAddr,
        nets: &[Prefix],
        resolvable: bool,
    ) {
        for index in 0..self.tables.len() {
            self.with_stage(index, |table, ctx| {
                table.rib_lookup_done(nexthop, nets, resolvable, ctx)
            });
        }
    }

    /// Do one unit of background work: deliver one held back operation,
    /// fire one deferred or due timer, or move a dump along by one route.
    /// Returns false when there is nothing to do.
    pub fn get_next_message(&mut self) -> bool {
        if self.output_busy {
            return self.fire_due_timer();
        }
        if let Some(op) = self.queue.pop_front() {
            self.with_source(false, |_, ctx| ctx.deliver(op));
            return true;
        }
        if let Some((owner, event)) = self.deferred.pop_front() {
            self.dispatch(owner, event);
            return true;
        }
        if self.fire_due_timer() {
            return true;
        }
        // Dumping only gets a turn when no live change or timer is pending.
        self.dump_step()
    }

    /// Do background work until there is none left at the current time.
    pub fn run_until_idle(&mut self) -> usize {
        let mut steps = 0;
        while self.get_next_message() {
            steps += 1;
        }
        steps
    }

    /// Move pipeline time forward, firing timers as their deadlines pass.
    pub fn advance(&mut self, by: Duration) {
        let until = self.sched.now() + by;
        self.run_until_idle();
        while let Some((owner, event)) = self.sched.pop_due(until) {
            self.dispatch(owner, event);
            self.run_until_idle();
        }
        self.sched.set_now(until);
        self.run_until_idle();
    }

    /// Drive a shared pipeline against the wall clock until `shutdown` is
    /// set.
    pub fn run(
        pipeline: Arc<Mutex<Pipeline>>,
        resolution: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        spawn(move || {
            let start = Instant::now();
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                {
                    let mut p = lock!(pipeline);
                    let behind = start.elapsed().saturating_sub(p.now());
                    p.advance(behind);
                }
                sleep(resolution);
            }
        })
    }

    fn fire_due_timer(&mut self) -> bool {
        match self.sched.pop_due(self.sched.now()) {
            Some((owner, event)) => {
                self.dispatch(owner, event);
                true
            }
            None => false,
        }
    }

    fn dispatch(&mut self, owner: StageId, event: TimerEvent) {
        if self.output_busy && !event.is_housekeeping() {
            self.deferred.push_back((owner, event));
            return;
        }
        if owner == StageId::SOURCE {
            let hold = self.holding();
            self.with_source(hold, |source, ctx| {
                source.timer_fired(event, ctx)
            });
            return;
        }
        if event == TimerEvent::Unplumb {
            self.unplumb(owner);
            return;
        }
        match self.index_of(owner) {
            Some(index) => {
                self.with_stage(index, |table, ctx| {
                    table.timer_fired(event, ctx)
                });
            }
            None => {
                pipeline_log!(self, debug, "timer for removed stage";
                    "stage" => owner.0
                );
            }
        }
    }

    fn unplumb(&mut self, id: StageId) {
        let Some(index) = self.index_of(id) else {
            return;
        };
        let slot = self.tables.remove(index);
        self.sched.cancel_owned_by(id);
        self.deferred.retain(|(owner, _)| *owner != id);
        if self.dump == Some(id) {
            self.dump = None;
        }
        pipeline_log!(self, info, "unplumbed {}", slot.table.name();
            "stage" => id.0
        );
    }

    /// Move a dump in progress along by one route.
    fn dump_step(&mut self) -> bool {
        let Some(id) = self.dump else {
            return false;
        };
        let Some(index) = self.index_of(id) else {
            return false;
        };
        let Some(dump) =
            self.tables[index].table.as_any().downcast_ref::<DumpTable>()
        else {
            return false;
        };
        let Some((peer, genid, after)) = dump.position() else {
            return false;
        };
        let target = dump.target();
        match self.source.next_dump_route(peer, genid, after) {
            Some(msg) => {
                self.with_stage(index, |table, ctx| {
                    table.route_dump(msg, target, ctx)
                });
            }
            None => {
                self.with_stage(index, |table, ctx| {
                    if let Some(dump) =
                        table.as_any_mut().downcast_mut::<DumpTable>()
                    {
                        dump.peer_exhausted(peer, genid, ctx);
                    }
                });
            }
        }
        true
    }

    /// Deliver an operation straight into the first table, bypassing the
    /// source.
    #[cfg(test)]
    pub(crate) fn inject(&mut self, op: QueuedOp) -> Outcome {
        self.with_source(false, |_, ctx| ctx.deliver(op))
    }
}
