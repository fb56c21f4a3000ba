//! Commercial break schedule, generated once per show.

use crate::error::{OnAirError, Result};
use crate::unit::AdTier;
use serde::Serialize;
use std::time::Duration;

/// Lead times before a break and the fixed length of each break segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BreakTiming {
    window: Duration,
    grace: Duration,
    imminent: Duration,
    break_jingle: Duration,
    ad_slot: Duration,
    return_jingle: Duration,
}

impl BreakTiming {
    /// Thresholds must satisfy `window > grace > imminent > 0`.
    pub fn new(window: Duration, grace: Duration, imminent: Duration) -> Result<Self> {
        if imminent.is_zero() {
            return Err(OnAirError::SchedulingInvariantViolated(
                "imminent lead time must be positive".into(),
            ));
        }
        if !(window > grace && grace > imminent) {
            return Err(OnAirError::SchedulingInvariantViolated(format!(
                "expected window > grace > imminent, got {:?} / {:?} / {:?}",
                window, grace, imminent
            )));
        }
        Ok(BreakTiming {
            window,
            grace,
            imminent,
            break_jingle: Duration::from_secs(5),
            ad_slot: Duration::from_secs(18),
            return_jingle: Duration::from_secs(3),
        })
    }

    pub fn with_segments(
        mut self,
        break_jingle: Duration,
        ad_slot: Duration,
        return_jingle: Duration,
    ) -> Self {
        self.break_jingle = break_jingle;
        self.ad_slot = ad_slot;
        self.return_jingle = return_jingle;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn imminent(&self) -> Duration {
        self.imminent
    }

    pub fn break_jingle(&self) -> Duration {
        self.break_jingle
    }

    pub fn ad_slot(&self) -> Duration {
        self.ad_slot
    }

    pub fn return_jingle(&self) -> Duration {
        self.return_jingle
    }
}

impl Default for BreakTiming {
    fn default() -> Self {
        BreakTiming {
            window: Duration::from_secs(20),
            grace: Duration::from_secs(10),
            imminent: Duration::from_secs(5),
            break_jingle: Duration::from_secs(5),
            ad_slot: Duration::from_secs(18),
            return_jingle: Duration::from_secs(3),
        }
    }
}

/// One scheduled commercial break.
///
/// `was_queued` and `has_played` only ever go from false to true.
#[derive(Debug, Clone, Serialize)]
pub struct BreakConfig {
    index: usize,
    scheduled_time: Duration,
    slots: usize,
    was_queued: bool,
    has_played: bool,
}

impl BreakConfig {
    fn new(index: usize, scheduled_time: Duration, slots: usize) -> Self {
        BreakConfig {
            index,
            scheduled_time,
            slots,
            was_queued: false,
            has_played: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Offset from show start.
    pub fn scheduled_time(&self) -> Duration {
        self.scheduled_time
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn was_queued(&self) -> bool {
        self.was_queued
    }

    pub fn has_played(&self) -> bool {
        self.has_played
    }

    /// Returns true if this call changed the flag.
    pub fn mark_queued(&mut self) -> bool {
        !std::mem::replace(&mut self.was_queued, true)
    }

    /// Returns true if this call changed the flag.
    pub fn mark_played(&mut self) -> bool {
        !std::mem::replace(&mut self.has_played, true)
    }

    /// Jingle in, every slot, jingle out.
    pub fn total_duration(&self, timing: &BreakTiming) -> Duration {
        timing.break_jingle() + timing.ad_slot() * self.slots as u32 + timing.return_jingle()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakSchedule {
    breaks: Vec<BreakConfig>,
}

impl BreakSchedule {
    /// Spread `count` breaks evenly: break `i` lands at `duration * (i+1) / (count+1)`.
    pub fn generate(show_duration: Duration, count: usize, slots: usize) -> Result<Self> {
        let times = (0..count)
            .map(|i| show_duration * (i as u32 + 1) / (count as u32 + 1))
            .collect();
        Self::from_times(times, slots)
    }

    /// Build a schedule from explicit offsets, which must be strictly increasing.
    pub fn from_times(times: Vec<Duration>, slots: usize) -> Result<Self> {
        if slots == 0 {
            return Err(OnAirError::SchedulingInvariantViolated(
                "a break needs at least one slot".into(),
            ));
        }
        let mut prev: Option<Duration> = None;
        for &t in &times {
            if t.is_zero() {
                return Err(OnAirError::SchedulingInvariantViolated(
                    "break scheduled at show start".into(),
                ));
            }
            if prev.is_some_and(|p| t <= p) {
                return Err(OnAirError::SchedulingInvariantViolated(format!(
                    "break times must be strictly increasing ({:?} after {:?})",
                    t,
                    prev.unwrap_or_default()
                )));
            }
            prev = Some(t);
        }
        let breaks = times
            .into_iter()
            .enumerate()
            .map(|(i, t)| BreakConfig::new(i, t, slots))
            .collect();
        Ok(BreakSchedule { breaks })
    }

    pub fn breaks(&self) -> &[BreakConfig] {
        &self.breaks
    }

    pub fn get(&self, index: usize) -> Option<&BreakConfig> {
        self.breaks.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut BreakConfig> {
        self.breaks.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.breaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breaks.is_empty()
    }

    pub fn total_slots(&self) -> usize {
        self.breaks.iter().map(|b| b.slots).sum()
    }

    pub fn total_ad_time(&self, timing: &BreakTiming) -> Duration {
        self.breaks.iter().map(|b| b.total_duration(timing)).sum()
    }

    /// Revenue bounds for the whole show across the given listener range.
    pub fn estimate_revenue_range(&self, min_listeners: u32, max_listeners: u32) -> (f64, f64) {
        let slots = self.total_slots() as f64;
        let low = slots * min_listeners as f64 * AdTier::for_listeners(min_listeners).rate();
        let high = slots * max_listeners as f64 * AdTier::for_listeners(max_listeners).rate();
        (low, high)
    }
}
