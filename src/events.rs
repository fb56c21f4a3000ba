//! Event types carried on the [`EventChannel`](crate::channel::EventChannel).

use crate::station::ShowState;
use crate::unit::{AdTier, UnitOutcome, UnitProjection};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Why the active unit (or the whole show) was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    ShowEnding,
    BreakStarting,
    BreakEnding,
    BreakImminent,
    BreakGracePeriod,
    UserAction,
    CallerDropped,
    /// The unit outlived its nominal duration plus the safety margin.
    Timeout,
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InterruptReason::ShowEnding => "show-ending",
            InterruptReason::BreakStarting => "break-starting",
            InterruptReason::BreakEnding => "break-ending",
            InterruptReason::BreakImminent => "break-imminent",
            InterruptReason::BreakGracePeriod => "break-grace-period",
            InterruptReason::UserAction => "user-action",
            InterruptReason::CallerDropped => "caller-dropped",
            InterruptReason::Timeout => "timeout",
        };
        f.write_str(label)
    }
}

// ── Unit lifecycle ──────────────────────────────────────────────────────────

/// A unit (or one line of a conversation) began. Always precedes its work.
#[derive(Debug, Clone, Serialize)]
pub struct UnitStarted {
    pub projection: UnitProjection,
    pub nominal: Duration,
    /// Length of the audio asset, when it could be probed.
    pub measured: Option<Duration>,
}

/// A unit was cancelled. Published before the cancellation error propagates.
#[derive(Debug, Clone, Serialize)]
pub struct UnitInterrupted {
    pub unit_id: String,
    pub reason: InterruptReason,
    pub projection: UnitProjection,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitCompleted {
    pub unit_id: String,
    pub outcome: UnitOutcome,
}

/// An advertisement finished and its revenue was awarded.
#[derive(Debug, Clone, Serialize)]
pub struct AdAired {
    pub unit_id: String,
    pub tier: AdTier,
    pub listeners: u32,
    pub revenue: f64,
}

// ── Break scheduling ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct BreakWindowOpened {
    pub index: usize,
    pub until_break: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakGracePeriod {
    pub index: usize,
    pub until_break: Duration,
    pub queued: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakImminent {
    pub index: usize,
    pub until_break: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakQueued {
    pub index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakStarted {
    pub index: usize,
    pub was_queued: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakEnded {
    pub index: usize,
    pub revenue: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllBreaksCompleted;

// ── Timeline ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastInterruption {
    pub reason: InterruptReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateChanged {
    pub from: ShowState,
    pub to: ShowState,
}

/// A caller was cut off so the break could start cleanly.
#[derive(Debug, Clone, Serialize)]
pub struct CallerForceDisconnected {
    pub caller_id: u32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShowEnded {
    pub reason: InterruptReason,
}

// ── Consumed ────────────────────────────────────────────────────────────────

/// Published by the penalty countdown when it resolves.
#[derive(Debug, Clone, Serialize)]
pub struct PenaltyTimerCompleted {
    /// True if the operator hit the delay button before the countdown expired.
    pub was_successful: bool,
}
