// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The contract shared by every table in a pipeline.
//!
//! A pipeline is an ordered chain: the route source at the near end, then
//! zero or more [`RouteTable`] stages, then a [`RouteSink`]. Route
//! operations flow toward the sink. A stage reaches everything below it
//! through the [`TableCtx`] it is handed, and everything above it, for
//! lookups only, through an [`Upstream`] view. Queries that travel toward
//! the source (`route_used`, `output_state`) are driven by the pipeline,
//! which visits each stage in turn.

use crate::clock::{Scheduler, StageId, TimerEvent, TimerHandle};
use crate::ribin::RibInTable;
use crate::route::{InternalMessage, Outcome, RouteLookup, SubnetRoute};
use crate::types::{Genid, PeerId, Prefix};
use std::any::Any;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Duration;

pub trait RouteTable: Any + Send {
    fn name(&self) -> &str;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Called once when the table is inserted into a pipeline. Tables that
    /// need a periodic timer arm it here.
    fn plumbed(&mut self, _next: &mut TableCtx<'_>) {}

    fn add_route(
        &mut self,
        msg: InternalMessage,
        next: &mut TableCtx<'_>,
    ) -> Outcome;

    fn replace_route(
        &mut self,
        old: InternalMessage,
        new: InternalMessage,
        next: &mut TableCtx<'_>,
    ) -> Outcome;

    fn delete_route(
        &mut self,
        msg: InternalMessage,
        next: &mut TableCtx<'_>,
    ) -> Outcome;

    /// A route replayed for `dump_peer` by a dump in progress. The dump
    /// table turns these into adds; tables above it see them as is.
    fn route_dump(
        &mut self,
        msg: InternalMessage,
        dump_peer: PeerId,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        next.route_dump(msg, dump_peer)
    }

    /// End of a batch of related updates.
    fn push(&mut self, next: &mut TableCtx<'_>) {
        next.push()
    }

    fn lookup_route(
        &self,
        net: Prefix,
        up: &Upstream<'_>,
    ) -> Option<RouteLookup> {
        up.lookup_route(net)
    }

    /// Usage feedback travelling toward the source. The pipeline relays it
    /// through every table above the one that reported it.
    fn route_used(&mut self, _route: &SubnetRoute, _in_use: bool) {}

    fn peering_went_down(
        &mut self,
        peer: PeerId,
        genid: Genid,
        next: &mut TableCtx<'_>,
    ) {
        next.peering_went_down(peer, genid)
    }

    fn peering_down_complete(
        &mut self,
        peer: PeerId,
        genid: Genid,
        next: &mut TableCtx<'_>,
    ) {
        next.peering_down_complete(peer, genid)
    }

    fn peering_came_up(
        &mut self,
        peer: PeerId,
        genid: Genid,
        next: &mut TableCtx<'_>,
    ) {
        next.peering_came_up(peer, genid)
    }

    /// Downstream flow-control state changed.
    fn output_state(&mut self, _busy: bool) {}

    fn wakeup(&mut self, next: &mut TableCtx<'_>) {
        next.wakeup()
    }

    fn timer_fired(&mut self, _event: TimerEvent, _next: &mut TableCtx<'_>) {}

    /// Next-hop resolution finished for `nexthop`, affecting `nets`.
    fn rib_lookup_done(
        &mut self,
        _nexthop: IpAddr,
        _nets: &[Prefix],
        _resolvable: bool,
        _next: &mut TableCtx<'_>,
    ) {
    }

    fn route_count(&self) -> usize {
        0
    }
}

/// The far end of a pipeline: a decision process or a peer's outbound RIB.
pub trait RouteSink: Send {
    fn add_route(&mut self, msg: InternalMessage) -> Outcome;

    fn replace_route(
        &mut self,
        old: InternalMessage,
        new: InternalMessage,
    ) -> Outcome;

    fn delete_route(&mut self, msg: InternalMessage) -> Outcome;

    fn push(&mut self) {}

    fn peering_went_down(&mut self, _peer: PeerId, _genid: Genid) {}

    fn peering_down_complete(&mut self, _peer: PeerId, _genid: Genid) {}

    fn peering_came_up(&mut self, _peer: PeerId, _genid: Genid) {}

    /// Data is available. A sink that wants it calls
    /// `Pipeline::get_next_message` once it regains control.
    fn wakeup(&mut self) {}
}

/// Sink of a pipeline that has nothing attached yet.
#[derive(Debug, Default)]
pub struct NullSink;

impl RouteSink for NullSink {
    fn add_route(&mut self, _msg: InternalMessage) -> Outcome {
        Outcome::Unused
    }

    fn replace_route(
        &mut self,
        _old: InternalMessage,
        _new: InternalMessage,
    ) -> Outcome {
        Outcome::Unused
    }

    fn delete_route(&mut self, _msg: InternalMessage) -> Outcome {
        Outcome::Unused
    }
}

/// A table in the pipeline's stage vector.
pub struct Slot {
    pub(crate) id: StageId,
    pub(crate) table: Box<dyn RouteTable>,
}

/// Work held back at the top of the pipeline while the downstream is busy.
#[derive(Debug)]
pub enum QueuedOp {
    Add(InternalMessage),
    Replace(InternalMessage, InternalMessage),
    Delete(InternalMessage),
    Push,
    PeeringWentDown(PeerId, Genid),
    PeeringDownComplete(PeerId, Genid),
    PeeringCameUp(PeerId, Genid),
}

/// A table's view of everything downstream of it, plus the timer service.
pub struct TableCtx<'a> {
    me: StageId,
    rest: &'a mut [Slot],
    sink: &'a mut (dyn RouteSink + 'static),
    sched: &'a mut Scheduler,
    queue: Option<&'a mut VecDeque<QueuedOp>>,
}

impl<'a> TableCtx<'a> {
    pub(crate) fn new(
        me: StageId,
        rest: &'a mut [Slot],
        sink: &'a mut (dyn RouteSink + 'static),
        sched: &'a mut Scheduler,
        queue: Option<&'a mut VecDeque<QueuedOp>>,
    ) -> Self {
        Self {
            me,
            rest,
            sink,
            sched,
            queue,
        }
    }

    /// Id of the table this context was handed to.
    pub fn me(&self) -> StageId {
        self.me
    }

    pub fn now(&self) -> Duration {
        self.sched.now()
    }

    pub fn schedule_after(
        &mut self,
        delay: Duration,
        event: TimerEvent,
    ) -> TimerHandle {
        self.sched.schedule_after(delay, self.me, event)
    }

    pub fn schedule_periodic(
        &mut self,
        interval: Duration,
        event: TimerEvent,
    ) -> TimerHandle {
        self.sched.schedule_periodic(interval, self.me, event)
    }

    pub fn cancel(&mut self, handle: TimerHandle) {
        self.sched.cancel(handle)
    }

    /// Split off the next table and a context for everything below it.
    fn next(&mut self) -> Option<(&mut Box<dyn RouteTable>, TableCtx<'_>)> {
        let (head, rest) = self.rest.split_first_mut()?;
        Some((
            &mut head.table,
            TableCtx {
                me: head.id,
                rest,
                sink: &mut *self.sink,
                sched: &mut *self.sched,
                queue: None,
            },
        ))
    }

    /// The queue of held back work, if this context belongs to the source
    /// of a busy pipeline.
    fn held(&mut self) -> Option<&mut VecDeque<QueuedOp>> {
        self.queue.as_deref_mut()
    }

    pub fn add_route(&mut self, msg: InternalMessage) -> Outcome {
        if let Some(queue) = self.held() {
            queue.push_back(QueuedOp::Add(msg));
            return Outcome::Used;
        }
        match self.next() {
            Some((table, mut ctx)) => table.add_route(msg, &mut ctx),
            None => self.sink.add_route(msg),
        }
    }

    pub fn replace_route(
        &mut self,
        old: InternalMessage,
        new: InternalMessage,
    ) -> Outcome {
        if let Some(queue) = self.held() {
            queue.push_back(QueuedOp::Replace(old, new));
            return Outcome::Used;
        }
        match self.next() {
            Some((table, mut ctx)) => table.replace_route(old, new, &mut ctx),
            None => self.sink.replace_route(old, new),
        }
    }

    pub fn delete_route(&mut self, msg: InternalMessage) -> Outcome {
        if let Some(queue) = self.held() {
            queue.push_back(QueuedOp::Delete(msg));
            return Outcome::Used;
        }
        match self.next() {
            Some((table, mut ctx)) => table.delete_route(msg, &mut ctx),
            None => self.sink.delete_route(msg),
        }
    }

    /// Dumps only run while the downstream is ready, so they are never
    /// queued. A dumped route that reaches the sink without meeting a dump
    /// table is delivered as an add.
    pub fn route_dump(
        &mut self,
        mut msg: InternalMessage,
        dump_peer: PeerId,
    ) -> Outcome {
        match self.next() {
            Some((table, mut ctx)) => {
                table.route_dump(msg, dump_peer, &mut ctx)
            }
            None => {
                msg.set_dump();
                self.sink.add_route(msg)
            }
        }
    }

    pub fn push(&mut self) {
        if let Some(queue) = self.held() {
            queue.push_back(QueuedOp::Push);
            return;
        }
        match self.next() {
            Some((table, mut ctx)) => table.push(&mut ctx),
            None => self.sink.push(),
        }
    }

    pub fn peering_went_down(&mut self, peer: PeerId, genid: Genid) {
        if let Some(queue) = self.held() {
            queue.push_back(QueuedOp::PeeringWentDown(peer, genid));
            return;
        }
        match self.next() {
            Some((table, mut ctx)) => {
                table.peering_went_down(peer, genid, &mut ctx)
            }
            None => self.sink.peering_went_down(peer, genid),
        }
    }

    pub fn peering_down_complete(&mut self, peer: PeerId, genid: Genid) {
        if let Some(queue) = self.held() {
            queue.push_back(QueuedOp::PeeringDownComplete(peer, genid));
            return;
        }
        match self.next() {
            Some((table, mut ctx)) => {
                table.peering_down_complete(peer, genid, &mut ctx)
            }
            None => self.sink.peering_down_complete(peer, genid),
        }
    }

    pub fn peering_came_up(&mut self, peer: PeerId, genid: Genid) {
        if let Some(queue) = self.held() {
            queue.push_back(QueuedOp::PeeringCameUp(peer, genid));
            return;
        }
        match self.next() {
            Some((table, mut ctx)) => {
                table.peering_came_up(peer, genid, &mut ctx)
            }
            None => self.sink.peering_came_up(peer, genid),
        }
    }

    pub fn wakeup(&mut self) {
        match self.next() {
            Some((table, mut ctx)) => table.wakeup(&mut ctx),
            None => self.sink.wakeup(),
        }
    }

    /// Deliver an operation that was held back while the downstream was
    /// busy.
    pub(crate) fn deliver(&mut self, op: QueuedOp) -> Outcome {
        match op {
            QueuedOp::Add(msg) => self.add_route(msg),
            QueuedOp::Replace(old, new) => self.replace_route(old, new),
            QueuedOp::Delete(msg) => self.delete_route(msg),
            QueuedOp::Push => {
                self.push();
                Outcome::Used
            }
            QueuedOp::PeeringWentDown(peer, genid) => {
                self.peering_went_down(peer, genid);
                Outcome::Used
            }
            QueuedOp::PeeringDownComplete(peer, genid) => {
                self.peering_down_complete(peer, genid);
                Outcome::Used
            }
            QueuedOp::PeeringCameUp(peer, genid) => {
                self.peering_came_up(peer, genid);
                Outcome::Used
            }
        }
    }
}

/// A table's view of everything upstream of it, for lookups.
pub struct Upstream<'a> {
    tables: &'a [Slot],
    source: &'a RibInTable,
}

impl<'a> Upstream<'a> {
    pub(crate) fn new(tables: &'a [Slot], source: &'a RibInTable) -> Self {
        Self { tables, source }
    }

    pub fn lookup_route(&self, net: Prefix) -> Option<RouteLookup> {
        match self.tables.split_last() {
            Some((last, above)) => last
                .table
                .lookup_route(net, &Upstream::new(above, self.source)),
            None => self.source.lookup_route(net),
        }
    }
}
