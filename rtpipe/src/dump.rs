// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background table dumps.
//!
//! A [`DumpTable`] sits directly below the route source of a branch that
//! feeds a newly established peer. The pipeline pulls routes from the
//! source one at a time, whenever the downstream is idle, and hands them to
//! the dump table, which passes them on as dump-flagged adds. Meanwhile live
//! changes keep flowing: a change is forwarded only if the peer has already
//! been sent the route it affects, otherwise the dump will deliver the
//! result later.
//!
//! When the walk is over and no session that went down mid-dump still has
//! withdrawals pending, the table schedules its own removal.

use crate::clock::TimerEvent;
use crate::log::table_log;
use crate::route::{InternalMessage, Outcome, RouteLookup};
use crate::table::{RouteTable, TableCtx, Upstream};
use crate::types::{Genid, PeerId, Prefix};
use crate::MOD_DUMP;
use chrono::{DateTime, Utc};
use slog::Logger;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

/// Audit log capacity.
pub const AUDIT_LOG_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDumpState {
    /// Up when the dump started, not reached yet.
    StillToDump,
    /// Being walked; routes up to and including `last` have been sent.
    CurrentlyDumping { last: Option<Prefix> },
    CompletelyDumped,
    /// Came up after the dump started. Its routes flow as live changes.
    NewPeer,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PeerDump {
    genid: Genid,
    state: PeerDumpState,
}

/// How much of a session that went down had been dumped when it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Watermark {
    Nothing,
    UpTo(Prefix),
    All,
}

impl Watermark {
    fn covers(&self, net: Prefix) -> bool {
        match self {
            Self::Nothing => false,
            Self::UpTo(last) => net <= *last,
            Self::All => true,
        }
    }
}

/// Dump cursor for one receiving peer.
#[derive(Debug, Clone)]
pub struct DumpIterator {
    target: PeerId,
    peers: BTreeMap<PeerId, PeerDump>,
    deleting: BTreeMap<(PeerId, Genid), Watermark>,
}

impl DumpIterator {
    /// Start a dump of every up session toward `target`. Sessions still
    /// being withdrawn have had nothing dumped.
    pub fn new(
        target: PeerId,
        up: &[(PeerId, Genid)],
        deleting: &[(PeerId, Genid)],
    ) -> Self {
        Self {
            target,
            peers: up
                .iter()
                .map(|(peer, genid)| {
                    (
                        *peer,
                        PeerDump {
                            genid: *genid,
                            state: PeerDumpState::StillToDump,
                        },
                    )
                })
                .collect(),
            deleting: deleting
                .iter()
                .map(|session| (*session, Watermark::Nothing))
                .collect(),
        }
    }

    pub fn target(&self) -> PeerId {
        self.target
    }

    pub fn peer_state(&self, peer: PeerId) -> Option<PeerDumpState> {
        self.peers.get(&peer).map(|p| p.state)
    }

    /// The session being walked and the last prefix sent from it.
    pub fn position(&self) -> Option<(PeerId, Genid, Option<Prefix>)> {
        self.peers.iter().find_map(|(peer, p)| match p.state {
            PeerDumpState::CurrentlyDumping { last } => {
                Some((*peer, p.genid, last))
            }
            PeerDumpState::StillToDump => Some((*peer, p.genid, None)),
            _ => None,
        })
    }

    pub fn is_exhausted(&self) -> bool {
        self.position().is_none()
    }

    pub fn route_dumped(&mut self, peer: PeerId, genid: Genid, net: Prefix) {
        match self.peers.get_mut(&peer) {
            Some(p) if p.genid == genid => {
                p.state = PeerDumpState::CurrentlyDumping { last: Some(net) }
            }
            _ => panic!(
                "BUG: dumped {net} from {peer} genid {genid} out of turn"
            ),
        }
    }

    pub fn peer_dumped(&mut self, peer: PeerId) {
        if let Some(p) = self.peers.get_mut(&peer) {
            p.state = PeerDumpState::CompletelyDumped;
        }
    }

    /// Whether the receiving peer has been sent the route a change to
    /// `net` from `peer`'s session `genid` applies to.
    pub fn route_change_is_valid(
        &self,
        peer: PeerId,
        genid: Genid,
        net: Prefix,
    ) -> bool {
        if let Some(watermark) = self.deleting.get(&(peer, genid)) {
            return watermark.covers(net);
        }
        let Some(p) = self.peers.get(&peer) else {
            return true;
        };
        if p.genid != genid {
            return false;
        }
        match p.state {
            PeerDumpState::StillToDump | PeerDumpState::Down => false,
            PeerDumpState::CurrentlyDumping { last } => {
                last.is_some_and(|last| net <= last)
            }
            PeerDumpState::CompletelyDumped | PeerDumpState::NewPeer => true,
        }
    }

    pub fn peering_went_down(&mut self, peer: PeerId, genid: Genid) {
        let Some(p) = self.peers.get_mut(&peer) else {
            return;
        };
        if p.genid != genid {
            return;
        }
        let watermark = match p.state {
            PeerDumpState::StillToDump => Watermark::Nothing,
            PeerDumpState::CurrentlyDumping { last: None } => {
                Watermark::Nothing
            }
            PeerDumpState::CurrentlyDumping { last: Some(last) } => {
                Watermark::UpTo(last)
            }
            PeerDumpState::CompletelyDumped | PeerDumpState::NewPeer => {
                Watermark::All
            }
            PeerDumpState::Down => return,
        };
        p.state = PeerDumpState::Down;
        self.deleting.insert((peer, genid), watermark);
    }

    pub fn peering_down_complete(&mut self, peer: PeerId, genid: Genid) {
        self.deleting.remove(&(peer, genid));
    }

    pub fn peering_came_up(&mut self, peer: PeerId, genid: Genid) {
        self.peers.insert(
            peer,
            PeerDump {
                genid,
                state: PeerDumpState::NewPeer,
            },
        );
    }

    /// Whether a session that was not completely dumped is still being
    /// withdrawn. Removing the dump table before that finishes would let
    /// withdrawals of routes never sent reach the receiving peer.
    pub fn waiting_for_deletion(&self) -> bool {
        self.deleting.values().any(|w| *w != Watermark::All)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    Started { target: PeerId },
    PeerCameUp { peer: PeerId, genid: Genid },
    PeerWentDown { peer: PeerId, genid: Genid },
    PeerDownComplete { peer: PeerId, genid: Genid },
    PeerDumped { peer: PeerId, genid: Genid },
    Paused,
    Resumed,
    WaitingForDeletion,
    Complete { routes: usize },
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { target } => write!(f, "dump to {target} started"),
            Self::PeerCameUp { peer, genid } => {
                write!(f, "{peer} genid {genid} came up")
            }
            Self::PeerWentDown { peer, genid } => {
                write!(f, "{peer} genid {genid} went down")
            }
            Self::PeerDownComplete { peer, genid } => {
                write!(f, "{peer} genid {genid} down complete")
            }
            Self::PeerDumped { peer, genid } => {
                write!(f, "{peer} genid {genid} dumped")
            }
            Self::Paused => write!(f, "output busy, paused"),
            Self::Resumed => write!(f, "output ready, resumed"),
            Self::WaitingForDeletion => {
                write!(f, "walk done, waiting for deletions")
            }
            Self::Complete { routes } => {
                write!(f, "dump complete after {routes} routes")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    /// Pipeline time.
    pub at: Duration,
    pub wall: DateTime<Utc>,
    pub event: AuditEvent,
}

impl fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (+{:.3}s) {}",
            self.wall.to_rfc3339(),
            self.at.as_secs_f64(),
            self.event
        )
    }
}

pub struct DumpTable {
    pub(crate) name: String,
    iter: DumpIterator,
    output_busy: bool,
    waiting: bool,
    complete: bool,
    routes_dumped: usize,
    audit: VecDeque<AuditEntry>,
    /// Pipeline time as of the last call that carried it.
    now: Duration,
    pub(crate) log: Logger,
}

impl DumpTable {
    pub fn new(
        name: impl Into<String>,
        iter: DumpIterator,
        log: Logger,
    ) -> Self {
        let mut table = Self {
            name: name.into(),
            iter,
            output_busy: false,
            waiting: false,
            complete: false,
            routes_dumped: 0,
            audit: VecDeque::with_capacity(AUDIT_LOG_SIZE),
            now: Duration::ZERO,
            log,
        };
        let target = table.iter.target();
        table.audit(AuditEvent::Started { target });
        table
    }

    pub fn target(&self) -> PeerId {
        self.iter.target()
    }

    pub fn iterator(&self) -> &DumpIterator {
        &self.iter
    }

    pub fn routes_dumped(&self) -> usize {
        self.routes_dumped
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Where the walk resumes, or `None` when there is nothing left to
    /// pull.
    pub fn position(&self) -> Option<(PeerId, Genid, Option<Prefix>)> {
        if self.complete {
            return None;
        }
        self.iter.position()
    }

    pub fn audit_log(&self) -> impl Iterator<Item = &AuditEntry> {
        self.audit.iter()
    }

    /// Write the audit log out through the table's logger.
    pub fn print_audit_log(&self) {
        for entry in &self.audit {
            table_log!(self, info, MOD_DUMP, "audit: {}", entry);
        }
    }

    fn audit(&mut self, event: AuditEvent) {
        if self.audit.len() == AUDIT_LOG_SIZE {
            self.audit.pop_front();
        }
        self.audit.push_back(AuditEntry {
            at: self.now,
            wall: Utc::now(),
            event,
        });
    }

    /// The session being walked has nothing further to offer.
    pub fn peer_exhausted(
        &mut self,
        peer: PeerId,
        genid: Genid,
        next: &mut TableCtx<'_>,
    ) {
        self.now = next.now();
        self.iter.peer_dumped(peer);
        self.audit(AuditEvent::PeerDumped { peer, genid });
        table_log!(self, debug, MOD_DUMP, "finished dumping {}", peer;
            "genid" => genid
        );
        self.check_finished(next);
    }

    fn check_finished(&mut self, next: &mut TableCtx<'_>) {
        if self.complete || !self.iter.is_exhausted() {
            return;
        }
        if self.iter.waiting_for_deletion() {
            if !self.waiting {
                self.waiting = true;
                self.audit(AuditEvent::WaitingForDeletion);
            }
            return;
        }
        self.complete = true;
        self.audit(AuditEvent::Complete {
            routes: self.routes_dumped,
        });
        table_log!(self, info, MOD_DUMP, "dump complete";
            "target" => self.iter.target().0,
            "routes" => self.routes_dumped
        );
        next.schedule_after(Duration::ZERO, TimerEvent::Unplumb);
    }
}

impl RouteTable for DumpTable {
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
        self.now = next.now();
        table_log!(self, info, MOD_DUMP, "dump started";
            "target" => self.iter.target().0
        );
        self.check_finished(next);
    }

    fn add_route(
        &mut self,
        msg: InternalMessage,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        if !self.iter.route_change_is_valid(
            msg.peer_id(),
            msg.genid(),
            msg.net(),
        ) {
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
        let old_valid = self.iter.route_change_is_valid(
            old.peer_id(),
            old.genid(),
            old.net(),
        );
        let new_valid = self.iter.route_change_is_valid(
            new.peer_id(),
            new.genid(),
            new.net(),
        );
        match (old_valid, new_valid) {
            (true, true) => next.replace_route(old, new),
            (false, true) => next.add_route(new),
            (true, false) => {
                next.delete_route(old);
                Outcome::Unused
            }
            (false, false) => Outcome::Unused,
        }
    }

    fn delete_route(
        &mut self,
        msg: InternalMessage,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        if !self.iter.route_change_is_valid(
            msg.peer_id(),
            msg.genid(),
            msg.net(),
        ) {
            return Outcome::Unused;
        }
        next.delete_route(msg)
    }

    fn route_dump(
        &mut self,
        mut msg: InternalMessage,
        dump_peer: PeerId,
        next: &mut TableCtx<'_>,
    ) -> Outcome {
        assert_eq!(
            dump_peer,
            self.iter.target(),
            "BUG: dump for {} reached the dump table of {}",
            dump_peer,
            self.iter.target()
        );
        self.iter.route_dumped(msg.peer_id(), msg.genid(), msg.net());
        self.routes_dumped += 1;
        msg.set_dump();
        next.add_route(msg)
    }

    fn lookup_route(
        &self,
        net: Prefix,
        up: &Upstream<'_>,
    ) -> Option<RouteLookup> {
        up.lookup_route(net).filter(|found| {
            self.iter
                .route_change_is_valid(found.origin.id, found.genid, net)
        })
    }

    fn peering_went_down(
        &mut self,
        peer: PeerId,
        genid: Genid,
        next: &mut TableCtx<'_>,
    ) {
        self.now = next.now();
        self.iter.peering_went_down(peer, genid);
        self.audit(AuditEvent::PeerWentDown { peer, genid });
        next.peering_went_down(peer, genid);
        self.check_finished(next);
    }

    fn peering_down_complete(
        &mut self,
        peer: PeerId,
        genid: Genid,
        next: &mut TableCtx<'_>,
    ) {
        self.now = next.now();
        self.iter.peering_down_complete(peer, genid);
        self.audit(AuditEvent::PeerDownComplete { peer, genid });
        next.peering_down_complete(peer, genid);
        self.check_finished(next);
    }

    fn peering_came_up(
        &mut self,
        peer: PeerId,
        genid: Genid,
        next: &mut TableCtx<'_>,
    ) {
        self.now = next.now();
        self.iter.peering_came_up(peer, genid);
        self.audit(AuditEvent::PeerCameUp { peer, genid });
        next.peering_came_up(peer, genid)
    }

    fn output_state(&mut self, busy: bool) {
        if busy == self.output_busy {
            return;
        }
        self.output_busy = busy;
        if !self.complete {
            self.audit(if busy {
                AuditEvent::Paused
            } else {
                AuditEvent::Resumed
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rtpipe_common::*;

    #[test]
    fn changes_pass_only_behind_the_cursor() {
        let (a, b) = (PeerId(1), PeerId(2));
        let mut it = DumpIterator::new(PeerId(9), &[(a, 1), (b, 1)], &[]);
        let low: Prefix = cidr!("10.0.0.0/8");
        let high: Prefix = cidr!("172.16.0.0/12");

        assert_eq!(it.position(), Some((a, 1, None)));
        assert!(!it.route_change_is_valid(a, 1, low));

        it.route_dumped(a, 1, low);
        assert_eq!(it.position(), Some((a, 1, Some(low))));
        assert!(it.route_change_is_valid(a, 1, low));
        assert!(!it.route_change_is_valid(a, 1, high));
        assert!(!it.route_change_is_valid(b, 1, low));

        it.peer_dumped(a);
        assert_eq!(it.position(), Some((b, 1, None)));
        assert!(it.route_change_is_valid(a, 1, high));

        // Stale session.
        assert!(!it.route_change_is_valid(a, 0, high));

        it.peer_dumped(b);
        assert!(it.is_exhausted());
    }

    #[test]
    fn deletions_are_watermarked() {
        let (a, b, c) = (PeerId(1), PeerId(2), PeerId(3));
        let mut it =
            DumpIterator::new(PeerId(9), &[(a, 1), (b, 4)], &[(c, 2)]);
        let low: Prefix = cidr!("10.0.0.0/8");
        let high: Prefix = cidr!("172.16.0.0/12");

        it.route_dumped(a, 1, low);
        it.peering_went_down(a, 1);
        assert_eq!(it.peer_state(a), Some(PeerDumpState::Down));
        assert!(it.route_change_is_valid(a, 1, low));
        assert!(!it.route_change_is_valid(a, 1, high));
        assert!(!it.route_change_is_valid(c, 2, low));
        assert!(it.waiting_for_deletion());

        // The walk moves on past the dead session.
        assert_eq!(it.position(), Some((b, 4, None)));

        it.peering_came_up(a, 2);
        assert!(it.route_change_is_valid(a, 2, high));

        it.peering_down_complete(a, 1);
        it.peering_down_complete(c, 2);
        assert!(!it.waiting_for_deletion());
    }

    #[test]
    fn audit_log_is_bounded() {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let it = DumpIterator::new(PeerId(9), &[], &[]);
        let mut table = DumpTable::new("dump", it, log);
        for _ in 0..AUDIT_LOG_SIZE {
            table.output_state(true);
            table.output_state(false);
        }
        assert_eq!(table.audit_log().count(), AUDIT_LOG_SIZE);
        assert_eq!(
            table.audit_log().last().map(|e| e.event.clone()),
            Some(AuditEvent::Resumed)
        );
        assert!(!table
            .audit_log()
            .any(|e| matches!(e.event, AuditEvent::Started { .. })));
    }
}
