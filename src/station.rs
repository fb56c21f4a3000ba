//! Station collaborators consumed by units and the break scheduler.
//!
//! Each concern is a narrow trait so the engine can run against the game's
//! real managers or the in-memory versions below (used by the CLI and tests).

use crate::error::{OnAirError, Result};
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

/// Coarse phase of the show, driven by the timeline and its units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShowState {
    Idle,
    ShowOpening,
    Conversation,
    BetweenCallers,
    AdBreak,
    BreakReturn,
    DroppedCaller,
    DeadAir,
    ShowClosing,
    ShowEnding,
}

// ── Callers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerState {
    Incoming,
    Screening,
    OnHold,
    OnAir,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Caller {
    pub id: u32,
    pub name: String,
    pub state: CallerState,
}

pub trait CallerRepository: Send + Sync {
    /// Promote the next on-hold caller to on-air.
    fn put_on_air(&self) -> Result<Caller>;
    fn on_air_caller(&self) -> Option<Caller>;
    fn on_hold_count(&self) -> usize;
    fn set_caller_state(&self, caller: &Caller, state: CallerState);
    fn remove_caller(&self, caller: &Caller);
}

/// In-memory caller queue.
#[derive(Default)]
pub struct CallerBoard {
    callers: Mutex<Vec<Caller>>,
    next_id: Mutex<u32>,
}

impl CallerBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a caller directly to the hold queue. Returns its ID.
    pub fn hold(&self, name: &str) -> u32 {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        let id = *next;
        self.callers.lock().unwrap().push(Caller {
            id,
            name: name.to_string(),
            state: CallerState::OnHold,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.callers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CallerRepository for CallerBoard {
    fn put_on_air(&self) -> Result<Caller> {
        let mut callers = self.callers.lock().unwrap();
        if let Some(live) = callers.iter().find(|c| c.state == CallerState::OnAir) {
            return Err(OnAirError::ResourceUnavailable(format!(
                "caller '{}' is already on air",
                live.name
            )));
        }
        let next = callers
            .iter_mut()
            .find(|c| c.state == CallerState::OnHold)
            .ok_or_else(|| OnAirError::ResourceUnavailable("no callers on hold".to_string()))?;
        next.state = CallerState::OnAir;
        Ok(next.clone())
    }

    fn on_air_caller(&self) -> Option<Caller> {
        self.callers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.state == CallerState::OnAir)
            .cloned()
    }

    fn on_hold_count(&self) -> usize {
        self.callers
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.state == CallerState::OnHold)
            .count()
    }

    fn set_caller_state(&self, caller: &Caller, state: CallerState) {
        if let Some(c) = self
            .callers
            .lock()
            .unwrap()
            .iter_mut()
            .find(|c| c.id == caller.id)
        {
            c.state = state;
        }
    }

    fn remove_caller(&self, caller: &Caller) {
        self.callers.lock().unwrap().retain(|c| c.id != caller.id);
    }
}

// ── Listeners ───────────────────────────────────────────────────────────────

pub trait ListenerProvider: Send + Sync {
    fn current_listeners(&self) -> u32;
    fn modify_listeners(&self, delta: i64);
}

/// Listener count that never drops below zero.
pub struct ListenerGauge {
    count: AtomicI64,
}

impl ListenerGauge {
    pub fn new(initial: u32) -> Self {
        ListenerGauge {
            count: AtomicI64::new(initial as i64),
        }
    }
}

impl ListenerProvider for ListenerGauge {
    fn current_listeners(&self) -> u32 {
        self.count.load(Ordering::Relaxed).clamp(0, u32::MAX as i64) as u32
    }

    fn modify_listeners(&self, delta: i64) {
        let _ = self
            .count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some((c + delta).max(0))
            });
    }
}

// ── Money ───────────────────────────────────────────────────────────────────

pub trait RevenueSink: Send + Sync {
    fn add_money(&self, amount: f64, reason: &str);
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub amount: f64,
    pub reason: String,
}

/// Append-only record of awarded money.
#[derive(Default)]
pub struct Ledger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> f64 {
        self.entries.lock().unwrap().iter().map(|e| e.amount).sum()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl RevenueSink for Ledger {
    fn add_money(&self, amount: f64, reason: &str) {
        self.entries.lock().unwrap().push(LedgerEntry {
            amount,
            reason: reason.to_string(),
        });
    }
}

// ── Stats ───────────────────────────────────────────────────────────────────

/// Mood/patience style stat adjusted by penalties.
pub trait StatSink: Send + Sync {
    fn modify(&self, delta: f64);
}

pub struct MoodMeter {
    value: Mutex<f64>,
}

impl MoodMeter {
    pub fn new(initial: f64) -> Self {
        MoodMeter {
            value: Mutex::new(initial),
        }
    }

    pub fn value(&self) -> f64 {
        *self.value.lock().unwrap()
    }
}

impl StatSink for MoodMeter {
    fn modify(&self, delta: f64) {
        *self.value.lock().unwrap() += delta;
    }
}
