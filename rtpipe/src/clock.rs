// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cooperative timer service.
//!
//! Tables never block and never spawn threads. Deferred work (damping
//! release, background deletion, cache flushing, self removal) is
//! expressed as a [`TimerEvent`] scheduled on the pipeline's [`Scheduler`].
//! The scheduler runs on virtual time that the pipeline advances, either
//! from a real-time loop or directly from tests.

use crate::types::{Genid, PeerId, Prefix};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Identifies a table within a pipeline. The route source is always
/// [`StageId::SOURCE`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u64);

impl StageId {
    pub const SOURCE: StageId = StageId(0);
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Damping clock tick.
    DampingTick,
    /// A suppressed route may be eligible for release.
    Undamp { net: Prefix, genid: Genid },
    /// Withdraw the next batch of routes from a session that went down.
    DeleteSomeRoutes { peer: PeerId, genid: Genid },
    /// Release the next batch of a flushed cache.
    FlushSomeRoutes,
    /// Remove the owning table from the pipeline.
    Unplumb,
}

impl TimerEvent {
    /// Housekeeping events never send routes downstream, so they may run
    /// while the downstream is busy.
    pub fn is_housekeeping(&self) -> bool {
        matches!(self, Self::DampingTick | Self::FlushSomeRoutes)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Debug)]
struct Timer {
    owner: StageId,
    event: TimerEvent,
    deadline: Duration,
    /// Re-arm interval for periodic timers.
    interval: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    now: Duration,
    next_id: u64,
    timers: HashMap<u64, Timer>,
    /// Deadline order. Entries whose timer was cancelled or re-armed are
    /// skipped when popped.
    queue: BTreeSet<(Duration, u64)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn schedule_after(
        &mut self,
        delay: Duration,
        owner: StageId,
        event: TimerEvent,
    ) -> TimerHandle {
        self.insert(delay, owner, event, None)
    }

    pub fn schedule_periodic(
        &mut self,
        interval: Duration,
        owner: StageId,
        event: TimerEvent,
    ) -> TimerHandle {
        self.insert(interval, owner, event, Some(interval))
    }

    fn insert(
        &mut self,
        delay: Duration,
        owner: StageId,
        event: TimerEvent,
        interval: Option<Duration>,
    ) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = self.now + delay;
        self.queue.insert((deadline, id));
        self.timers.insert(
            id,
            Timer {
                owner,
                event,
                deadline,
                interval,
            },
        );
        TimerHandle(id)
    }

    /// Cancel a timer. Cancelling a timer that already fired is a no-op.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if let Some(t) = self.timers.remove(&handle.0) {
            self.queue.remove(&(t.deadline, handle.0));
        }
    }

    /// Cancel every timer owned by a stage, used when a stage is unplumbed.
    pub fn cancel_owned_by(&mut self, owner: StageId) {
        let ids: Vec<u64> = self
            .timers
            .iter()
            .filter(|(_, t)| t.owner == owner)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.cancel(TimerHandle(id));
        }
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.timers.contains_key(&handle.0)
    }

    /// Deadline of the earliest pending timer.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.queue.first().map(|(d, _)| *d)
    }

    /// Pop the earliest timer due at or before `until`, moving the clock to
    /// its deadline. Periodic timers are re-armed under the same handle.
    pub fn pop_due(
        &mut self,
        until: Duration,
    ) -> Option<(StageId, TimerEvent)> {
        let (deadline, id) = *self.queue.first()?;
        if deadline > until {
            return None;
        }
        self.queue.remove(&(deadline, id));
        self.now = self.now.max(deadline);
        let timer = self.timers.remove(&id)?;
        let fired = (timer.owner, timer.event.clone());
        if let Some(interval) = timer.interval {
            let deadline = deadline + interval;
            self.queue.insert((deadline, id));
            self.timers.insert(id, Timer { deadline, ..timer });
        }
        Some(fired)
    }

    /// Move the clock forward without firing anything. Callers drain due
    /// timers with [`Scheduler::pop_due`] first.
    pub fn set_now(&mut self, now: Duration) {
        self.now = self.now.max(now);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fires_in_deadline_order() {
        let mut s = Scheduler::new();
        let me = StageId(3);
        s.schedule_after(
            Duration::from_secs(10),
            me,
            TimerEvent::DampingTick,
        );
        s.schedule_after(Duration::from_secs(5), me, TimerEvent::Unplumb);
        let h = s.schedule_after(
            Duration::from_secs(7),
            me,
            TimerEvent::FlushSomeRoutes,
        );
        s.cancel(h);
        assert!(!s.is_pending(h));

        assert_eq!(s.pop_due(Duration::from_secs(4)), None);
        assert_eq!(
            s.pop_due(Duration::from_secs(20)),
            Some((me, TimerEvent::Unplumb))
        );
        assert_eq!(s.now(), Duration::from_secs(5));
        assert_eq!(
            s.pop_due(Duration::from_secs(20)),
            Some((me, TimerEvent::DampingTick))
        );
        assert_eq!(s.pop_due(Duration::from_secs(20)), None);
    }

    #[test]
    fn periodic_timers_rearm() {
        let mut s = Scheduler::new();
        let h = s.schedule_periodic(
            Duration::from_secs(5),
            StageId(1),
            TimerEvent::DampingTick,
        );
        let mut fired = 0;
        while s.pop_due(Duration::from_secs(30)).is_some() {
            fired += 1;
        }
        assert_eq!(fired, 6);
        assert!(s.is_pending(h));
        assert_eq!(s.next_deadline(), Some(Duration::from_secs(35)));

        s.cancel_owned_by(StageId(1));
        assert!(!s.is_pending(h));
        assert_eq!(s.next_deadline(), None);
    }
}
