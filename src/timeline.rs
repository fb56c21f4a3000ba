//! Timeline: runs units one at a time and hands the floor to breaks.
//!
//! The timeline owns the session token. Each unit runs under a child of it,
//! so a break start cancels exactly the unit on air and nothing else. When
//! the show clock runs out the session token itself is cancelled.

use crate::break_scheduler::BreakScheduler;
use crate::channel::EventChannel;
use crate::error::Result;
use crate::events::{
    BreakGracePeriod, BreakImminent, BreakStarted, BroadcastInterruption, InterruptReason,
    ShowEnded, StateChanged,
};
use crate::stage::Stage;
use crate::station::ShowState;
use crate::unit::{Advert, ExecutionUnit, UnitOutcome, force_disconnect};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const IDLE_POLL: Duration = Duration::from_secs(1);

/// Where the timeline gets its next unit.
pub trait UnitSource: Send {
    fn next_unit(&mut self) -> Option<ExecutionUnit>;
}

/// Fixed running order.
#[derive(Debug, Default)]
pub struct Rundown {
    units: VecDeque<ExecutionUnit>,
}

impl Rundown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, unit: ExecutionUnit) {
        self.units.push_back(unit);
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl From<Vec<ExecutionUnit>> for Rundown {
    fn from(units: Vec<ExecutionUnit>) -> Self {
        Rundown {
            units: units.into(),
        }
    }
}

impl UnitSource for Rundown {
    fn next_unit(&mut self) -> Option<ExecutionUnit> {
        self.units.pop_front()
    }
}

#[derive(Default)]
struct Active {
    current: Option<CancellationToken>,
    pending_break: Option<usize>,
    last_interrupt: Option<InterruptReason>,
    ended_by: Option<InterruptReason>,
}

/// The part of the timeline units and event handlers can reach.
pub struct TimelineHandle {
    events: Arc<EventChannel>,
    session: CancellationToken,
    break_pending: AtomicBool,
    state: Mutex<ShowState>,
    active: Mutex<Active>,
    wake: Notify,
}

impl TimelineHandle {
    pub fn new(events: Arc<EventChannel>) -> Self {
        TimelineHandle {
            events,
            session: CancellationToken::new(),
            break_pending: AtomicBool::new(false),
            state: Mutex::new(ShowState::Idle),
            active: Mutex::new(Active::default()),
            wake: Notify::new(),
        }
    }

    /// True once a break is close enough that content should wrap up.
    pub fn break_pending(&self) -> bool {
        self.break_pending.load(Ordering::SeqCst)
    }

    pub fn set_break_pending(&self, pending: bool) {
        self.break_pending.store(pending, Ordering::SeqCst);
    }

    pub fn state(&self) -> ShowState {
        *self.state.lock().unwrap()
    }

    /// Force a state transition. Publishes `StateChanged` when the state moves.
    pub fn set_state(&self, to: ShowState) {
        let from = std::mem::replace(&mut *self.state.lock().unwrap(), to);
        if from != to {
            tracing::debug!(?from, ?to, "show state");
            self.events.publish(StateChanged { from, to });
        }
    }

    pub fn last_interrupt(&self) -> Option<InterruptReason> {
        self.active.lock().unwrap().last_interrupt
    }

    pub fn session(&self) -> &CancellationToken {
        &self.session
    }

    /// Cancel whatever unit is on air. False if nothing was.
    pub fn interrupt_current(&self, reason: InterruptReason) -> bool {
        let mut guard = self.active.lock().unwrap();
        let active = &mut *guard;
        match active.current.as_ref() {
            Some(token) => {
                active.last_interrupt = Some(reason);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// End the show now. Later calls are ignored.
    pub fn end_show(&self, reason: InterruptReason) {
        {
            let mut active = self.active.lock().unwrap();
            if active.ended_by.is_some() {
                return;
            }
            active.ended_by = Some(reason);
            active.last_interrupt = Some(reason);
        }
        tracing::info!(%reason, "ending show");
        self.events.publish(BroadcastInterruption { reason });
        self.session.cancel();
        self.wake.notify_one();
    }

    pub fn ended_by(&self) -> Option<InterruptReason> {
        self.active.lock().unwrap().ended_by
    }

    fn request_break(&self, index: usize) {
        {
            let mut guard = self.active.lock().unwrap();
            let active = &mut *guard;
            active.pending_break = Some(index);
            if let Some(token) = active.current.as_ref() {
                active.last_interrupt = Some(InterruptReason::BreakStarting);
                token.cancel();
            }
        }
        self.wake.notify_one();
    }

    fn take_pending_break(&self) -> Option<usize> {
        self.active.lock().unwrap().pending_break.take()
    }

    /// Register the unit about to run. A break that landed between units
    /// cancels it straight away.
    fn begin_unit(&self, token: CancellationToken) {
        let mut active = self.active.lock().unwrap();
        active.last_interrupt = active.ended_by;
        if active.pending_break.is_some() {
            active.last_interrupt = Some(InterruptReason::BreakStarting);
            token.cancel();
        }
        active.current = Some(token);
    }

    fn end_unit(&self) {
        self.active.lock().unwrap().current = None;
    }
}

/// What happened over one run of the show.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShowSummary {
    pub ended_by: Option<InterruptReason>,
    pub elapsed: Duration,
    pub units_completed: usize,
    pub units_ended_early: usize,
    pub units_interrupted: usize,
    pub breaks_played: usize,
    pub ad_revenue: f64,
}

pub struct Timeline {
    stage: Stage,
    scheduler: BreakScheduler,
    show_duration: Duration,
}

impl Timeline {
    pub fn new(stage: Stage, scheduler: BreakScheduler, show_duration: Duration) -> Self {
        Timeline {
            stage,
            scheduler,
            show_duration,
        }
    }

    pub fn handle(&self) -> Arc<TimelineHandle> {
        self.stage.timeline.clone()
    }

    pub fn scheduler(&self) -> &BreakScheduler {
        &self.scheduler
    }

    /// Run the show until its clock runs out (or it is ended early).
    pub async fn run(&self, source: &mut dyn UnitSource) -> ShowSummary {
        let handle = self.handle();
        let session = handle.session().clone();
        let started = Instant::now();
        let mut summary = ShowSummary::default();

        let h = handle.clone();
        let events = self.stage.events.clone();
        let callers = self.stage.callers.clone();
        let _on_break = self.stage.events.subscribe_scoped(move |e: &BreakStarted| {
            events.publish(BroadcastInterruption {
                reason: InterruptReason::BreakStarting,
            });
            force_disconnect(callers.as_ref(), &events);
            h.request_break(e.index);
        });
        let h = handle.clone();
        let events = self.stage.events.clone();
        let _on_grace = self.stage.events.subscribe_scoped(move |e: &BreakGracePeriod| {
            if e.queued {
                h.set_break_pending(true);
                events.publish(BroadcastInterruption {
                    reason: InterruptReason::BreakGracePeriod,
                });
            }
        });
        let h = handle.clone();
        let events = self.stage.events.clone();
        let _on_imminent = self.stage.events.subscribe_scoped(move |_: &BreakImminent| {
            h.set_break_pending(true);
            events.publish(BroadcastInterruption {
                reason: InterruptReason::BreakImminent,
            });
        });

        tracing::info!(duration = ?self.show_duration, "show starting");
        handle.set_state(ShowState::ShowOpening);
        self.scheduler.start(&session);

        let clock = handle.clone();
        let show_duration = self.show_duration;
        tokio::spawn(async move {
            let session = clock.session().clone();
            tokio::select! {
                _ = session.cancelled() => {}
                _ = tokio::time::sleep(show_duration) => clock.end_show(InterruptReason::ShowEnding),
            }
        });

        while !session.is_cancelled() {
            if let Some(index) = handle.take_pending_break() {
                self.play_break(index, &session, &mut summary).await;
                continue;
            }
            // Content that wrapped up for a break stays on the rundown until
            // the break has played.
            if handle.break_pending() {
                tokio::select! {
                    _ = session.cancelled() => {}
                    _ = handle.wake.notified() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
                continue;
            }
            match source.next_unit() {
                Some(unit) => self.run_unit(&unit, &session, &mut summary).await,
                None => {
                    handle.set_state(ShowState::DeadAir);
                    tokio::select! {
                        _ = session.cancelled() => {}
                        _ = handle.wake.notified() => {}
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                }
            }
        }

        self.scheduler.shutdown();
        let reason = handle.ended_by().unwrap_or(InterruptReason::ShowEnding);
        handle.set_state(ShowState::ShowEnding);
        self.stage.events.publish(ShowEnded { reason });

        summary.ended_by = Some(reason);
        summary.elapsed = started.elapsed();
        tracing::info!(
            breaks = summary.breaks_played,
            revenue = summary.ad_revenue,
            "show ended ({})",
            reason
        );
        summary
    }

    async fn run_unit(
        &self,
        unit: &ExecutionUnit,
        session: &CancellationToken,
        summary: &mut ShowSummary,
    ) {
        let handle = &self.stage.timeline;
        let token = session.child_token();
        if let Some(state) = unit.kind().show_state() {
            handle.set_state(state);
        }
        handle.begin_unit(token.clone());

        let result = if unit.requires_wait() {
            self.run_bounded(unit, &token).await
        } else {
            // Control actions finish in one step; there is nothing to time out.
            unit.execute(&self.stage, &token).await
        };
        handle.end_unit();

        match result {
            Ok(UnitOutcome::Completed) => summary.units_completed += 1,
            Ok(UnitOutcome::EndedEarly) => summary.units_ended_early += 1,
            Err(e) if e.is_cancelled() => summary.units_interrupted += 1,
            Err(e) => tracing::warn!(unit = unit.id(), "unit failed: {}", e),
        }
    }

    /// Race the unit against its ceiling. An overrun is cancelled with
    /// `Timeout` and still awaited so it can report the interruption.
    async fn run_bounded(&self, unit: &ExecutionUnit, token: &CancellationToken) -> Result<UnitOutcome> {
        let ceiling = unit.ceiling(self.stage.timing.safety_margin);
        let run = unit.execute(&self.stage, token);
        tokio::pin!(run);
        tokio::select! {
            biased;
            r = &mut run => r,
            _ = tokio::time::sleep(ceiling) => {
                tracing::warn!(unit = unit.id(), ?ceiling, "unit overran its ceiling");
                self.stage.timeline.interrupt_current(InterruptReason::Timeout);
                run.await
            }
        }
    }

    /// Jingle, the ad spots, return jingle, then settle the break.
    async fn play_break(&self, index: usize, session: &CancellationToken, summary: &mut ShowSummary) {
        let handle = &self.stage.timeline;
        handle.set_state(ShowState::AdBreak);

        let timing = self.scheduler.timing();
        let slots = self.scheduler.schedule().get(index).map_or(0, |b| b.slots());
        let number = index + 1;
        let units = [
            ExecutionUnit::transition(
                format!("break{}_jingle", number),
                "Break jingle",
                self.stage.ads.break_jingle(),
                timing.break_jingle(),
            ),
            ExecutionUnit::ad_sequence(
                format!("break{}", number),
                vec![Advert::new(timing.ad_slot()); slots],
            ),
            ExecutionUnit::transition(
                format!("break{}_return", number),
                "Return jingle",
                self.stage.ads.return_jingle(),
                timing.return_jingle(),
            ),
        ];
        for unit in &units {
            if session.is_cancelled() {
                break;
            }
            self.run_unit(unit, session, summary).await;
        }
        if !session.is_cancelled() {
            self.stage.events.publish(BroadcastInterruption {
                reason: InterruptReason::BreakEnding,
            });
        }

        if let Some(revenue) = self.scheduler.end_break() {
            summary.breaks_played += 1;
            summary.ad_revenue += revenue;
        }
        handle.set_break_pending(false);
        if !session.is_cancelled() {
            handle.set_state(ShowState::BreakReturn);
        }
    }
}
