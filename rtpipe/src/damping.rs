// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Route flap damping arithmetic, after RFC 2439.
//!
//! Every flap adds [`FIXED`] to a prefix's figure of merit, which decays
//! exponentially with the configured half-life. Time is counted in ticks of
//! [`FREQUENCY`]; the decay factor for every tick count up to the maximum
//! hold-down is computed once up front.

use crate::config::DampingConfig;
use crate::error::Error;
use std::time::Duration;

/// Merit added per flap.
pub const FIXED: u32 = 1000;

/// Damping clock resolution.
pub const FREQUENCY: Duration = Duration::from_secs(5);

/// Longest accepted maximum hold-down, in minutes.
pub const MAX_HOLD_DOWN_LIMIT: u32 = 24 * 60;

#[derive(Debug, Clone)]
pub struct Damping {
    enabled: bool,
    half_life: u32,
    max_hold_down: u32,
    reuse: u32,
    cutoff: u32,
    /// Merit fraction, scaled by `FIXED`, left after `i` ticks.
    decay: Vec<u32>,
    /// Merit is never allowed to exceed this, so no route is held down for
    /// longer than the maximum hold-down.
    ceiling: u32,
    /// Prefixes currently suppressed.
    damp_count: usize,
}

impl Damping {
    pub fn new(config: &DampingConfig) -> Result<Self, Error> {
        fn invalid(msg: String) -> Error {
            Error::InvalidDamping(msg)
        }

        if config.half_life == 0 {
            return Err(invalid("half life must be positive".into()));
        }
        if config.max_hold_down < config.half_life {
            return Err(invalid(format!(
                "max hold down {} shorter than half life {}",
                config.max_hold_down, config.half_life
            )));
        }
        if config.max_hold_down > MAX_HOLD_DOWN_LIMIT {
            return Err(invalid(format!(
                "max hold down {} exceeds {} minutes",
                config.max_hold_down, MAX_HOLD_DOWN_LIMIT
            )));
        }
        if config.reuse == 0 || config.reuse >= config.cutoff {
            return Err(invalid(format!(
                "reuse {} must be positive and below cutoff {}",
                config.reuse, config.cutoff
            )));
        }

        let doublings =
            f64::from(config.max_hold_down) / f64::from(config.half_life);
        let ceiling = f64::from(config.reuse) * 2f64.powf(doublings);
        let ceiling = ceiling.min(f64::from(u32::MAX)) as u32;
        if config.cutoff >= ceiling {
            return Err(invalid(format!(
                "cutoff {} unreachable below merit ceiling {}",
                config.cutoff, ceiling
            )));
        }

        let tick = FREQUENCY.as_secs_f64();
        let half_life_secs = f64::from(config.half_life) * 60.0;
        let max_ticks = Self::ticks(config.max_hold_down);
        let decay = (0..=max_ticks)
            .map(|i| {
                let factor = 0.5f64.powf(i as f64 * tick / half_life_secs);
                (factor * f64::from(FIXED)) as u32
            })
            .collect();

        Ok(Self {
            enabled: config.enabled,
            half_life: config.half_life,
            max_hold_down: config.max_hold_down,
            reuse: config.reuse,
            cutoff: config.cutoff,
            decay,
            ceiling,
            damp_count: 0,
        })
    }

    /// Ticks in `minutes`.
    fn ticks(minutes: u32) -> u64 {
        u64::from(minutes) * 60 / FREQUENCY.as_secs()
    }

    /// Tick number of a point in time.
    pub fn tick(now: Duration) -> u64 {
        now.as_secs() / FREQUENCY.as_secs()
    }

    /// Apply a new configuration, keeping track of prefixes already
    /// suppressed.
    pub fn reconfigure(&mut self, config: &DampingConfig) -> Result<(), Error> {
        let damp_count = self.damp_count;
        *self = Self::new(config)?;
        self.damp_count = damp_count;
        Ok(())
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether updates need to be looked at at all. With damping disabled,
    /// prefixes that were suppressed before are still honored until the
    /// last one is released.
    pub fn active(&self) -> bool {
        self.enabled || self.damp_count > 0
    }

    pub fn damp_count(&self) -> usize {
        self.damp_count
    }

    pub fn damped(&mut self) {
        self.damp_count += 1;
    }

    pub fn undamped(&mut self) {
        assert!(self.damp_count > 0, "BUG: damp count underflow");
        self.damp_count -= 1;
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Merit decayed from `last` to `now`, without a new flap.
    pub fn decayed_merit(&self, last: u64, now: u64, merit: u32) -> u32 {
        let elapsed = now.saturating_sub(last);
        match self.decay.get(elapsed as usize) {
            Some(factor) => {
                (u64::from(merit) * u64::from(*factor) / u64::from(FIXED))
                    as u32
            }
            None => 0,
        }
    }

    /// Merit after a flap at `now`.
    pub fn compute_merit(&self, last: u64, now: u64, merit: u32) -> u32 {
        let merit = self.decayed_merit(last, now, merit).saturating_add(FIXED);
        merit.min(self.ceiling)
    }

    /// Whether a flap leaving this merit suppresses the route.
    pub fn cutoff(&self, merit: u32) -> bool {
        merit > self.cutoff
    }

    /// Whether a suppressed route with this merit must stay suppressed.
    pub fn reuse(&self, merit: u32) -> bool {
        merit > self.reuse
    }

    /// Time for `merit` to decay down to the reuse threshold, bounded by
    /// the maximum hold-down and never shorter than one tick.
    pub fn reuse_time(&self, merit: u32) -> Duration {
        if !self.reuse(merit) {
            return FREQUENCY;
        }
        let half_life_secs = f64::from(self.half_life) * 60.0;
        let secs = half_life_secs
            * (f64::from(merit) / f64::from(self.reuse)).log2();
        let max = f64::from(self.max_hold_down) * 60.0;
        let secs = secs.min(max).ceil() as u64;
        Duration::from_secs(secs).max(FREQUENCY)
    }

    /// Whether a record last touched at `last` has decayed to nothing by
    /// `now`.
    pub fn expired(&self, last: u64, now: u64) -> bool {
        now.saturating_sub(last) as usize >= self.decay.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn defaults() -> Damping {
        Damping::new(&DampingConfig::default()).expect("default damping")
    }

    #[test]
    fn decay_halves_per_half_life() {
        let d = defaults();
        // 15 minutes is 180 ticks.
        assert_eq!(d.decayed_merit(0, 0, 2000), 2000);
        assert_eq!(d.decayed_merit(0, 180, 2000), 1000);
        assert_eq!(d.decayed_merit(0, 360, 2000), 500);
        assert_eq!(d.compute_merit(0, 180, 1000), 1500);
    }

    #[test]
    fn merit_is_capped() {
        let d = defaults();
        assert_eq!(d.ceiling(), 12000);
        let mut merit = 0;
        for _ in 0..20 {
            merit = d.compute_merit(0, 0, merit);
        }
        assert_eq!(merit, 12000);
    }

    #[test]
    fn flaps_past_cutoff() {
        let d = defaults();
        let mut merit = FIXED;
        let mut flaps = 1;
        while !d.cutoff(merit) {
            merit = d.compute_merit(0, 0, merit);
            flaps += 1;
        }
        assert_eq!(flaps, 4);
        assert_eq!(merit, 4000);
    }

    #[test]
    fn reuse_time_inverts_decay() {
        let d = defaults();
        // 3000 -> 750 is two half lives.
        assert_eq!(d.reuse_time(3000), Duration::from_secs(1800));
        // Bounded by the max hold down.
        assert_eq!(d.reuse_time(12000), Duration::from_secs(3600));
        assert_eq!(d.reuse_time(500), FREQUENCY);

        let merit = 4000;
        let t = Damping::tick(d.reuse_time(merit));
        assert!(!d.reuse(d.decayed_merit(0, t + 1, merit)));
        assert!(d.reuse(d.decayed_merit(0, t - 2, merit)));
    }

    #[test]
    fn records_expire_after_max_hold_down() {
        let d = defaults();
        assert!(!d.expired(0, 720));
        assert!(d.expired(0, 721));
        assert_eq!(d.decayed_merit(0, 721, 12000), 0);
    }

    #[test]
    fn invalid_parameters() {
        let bad = [
            DampingConfig {
                half_life: 0,
                ..Default::default()
            },
            DampingConfig {
                max_hold_down: 10,
                ..Default::default()
            },
            DampingConfig {
                reuse: 3000,
                cutoff: 3000,
                ..Default::default()
            },
            DampingConfig {
                reuse: 0,
                ..Default::default()
            },
            DampingConfig {
                max_hold_down: 15,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(
                matches!(Damping::new(&config), Err(Error::InvalidDamping(_))),
                "{config:?} accepted"
            );
        }
    }
}
