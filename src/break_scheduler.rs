//! BreakScheduler: fires commercial break triggers against show time.
//!
//! Each break walks `Idle → WindowOpen → [Queued] → GracePeriod → Imminent →
//! Started`, driven by one timer task per break. The task runs under a child
//! of the session token and is cancelled as soon as the break starts, whether
//! the timer got there first or [`BreakScheduler::start_break_now`] did.
//!
//! State lives behind one mutex; events are always published after the lock
//! is released so handlers may call back into the scheduler.

use crate::channel::{EventChannel, Subscription};
use crate::events::{
    AdAired, AllBreaksCompleted, BreakEnded, BreakGracePeriod, BreakImminent, BreakQueued,
    BreakStarted, BreakWindowOpened,
};
use crate::schedule::{BreakSchedule, BreakTiming};
use crate::station::{ListenerProvider, RevenueSink, StatSink};
use crate::unit::ad_revenue;
use serde::Serialize;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Consequences applied when a break starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakRules {
    /// Mood lost if the break was never queued.
    pub unqueued_penalty: f64,
    /// Fraction of the audience that tunes out for the break.
    pub listener_dip: f64,
}

impl Default for BreakRules {
    fn default() -> Self {
        BreakRules {
            unqueued_penalty: 15.0,
            listener_dip: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakPhase {
    Idle,
    WindowOpen,
    Queued,
    GracePeriod,
    Imminent,
    Started,
    Exhausted,
}

/// Countdown snapshot for display.
#[derive(Debug, Clone, Serialize)]
pub struct BreakStatus {
    pub phase: BreakPhase,
    /// Break currently pending or playing; `None` once exhausted.
    pub index: Option<usize>,
    pub elapsed: Duration,
    pub until_window: Option<Duration>,
    pub until_break: Option<Duration>,
    pub queued: bool,
    pub breaks_remaining: usize,
}

struct State {
    schedule: BreakSchedule,
    current: usize,
    phase: BreakPhase,
    show_start: Option<Instant>,
    session: Option<CancellationToken>,
    timer: Option<CancellationToken>,
    /// Listeners removed at break start, given back at break end.
    dip: i64,
    break_revenue: f64,
    ads_aired: usize,
    subscription: Option<Subscription>,
}

struct Inner {
    events: Arc<EventChannel>,
    listeners: Arc<dyn ListenerProvider>,
    stats: Arc<dyn StatSink>,
    revenue: Arc<dyn RevenueSink>,
    timing: BreakTiming,
    rules: BreakRules,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct BreakScheduler {
    inner: Arc<Inner>,
}

impl BreakScheduler {
    pub fn new(
        schedule: BreakSchedule,
        timing: BreakTiming,
        rules: BreakRules,
        events: Arc<EventChannel>,
        listeners: Arc<dyn ListenerProvider>,
        stats: Arc<dyn StatSink>,
        revenue: Arc<dyn RevenueSink>,
    ) -> Self {
        BreakScheduler {
            inner: Arc::new(Inner {
                events,
                listeners,
                stats,
                revenue,
                timing,
                rules,
                state: Mutex::new(State {
                    schedule,
                    current: 0,
                    phase: BreakPhase::Idle,
                    show_start: None,
                    session: None,
                    timer: None,
                    dip: 0,
                    break_revenue: 0.0,
                    ads_aired: 0,
                    subscription: None,
                }),
            }),
        }
    }

    /// Begin counting show time from now and arm the first break.
    pub fn start(&self, session: &CancellationToken) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let subscription = self.inner.events.subscribe(move |e: &AdAired| {
            if let Some(inner) = weak.upgrade() {
                inner.record_ad(e.revenue);
            }
        });

        let breaks = {
            let mut st = self.inner.state.lock().unwrap();
            if let Some(old) = st.subscription.replace(subscription) {
                self.inner.events.unsubscribe(&old);
            }
            st.show_start = Some(Instant::now());
            st.session = Some(session.clone());
            st.current = 0;
            if st.schedule.is_empty() {
                st.phase = BreakPhase::Exhausted;
            } else {
                self.inner.arm(&mut st);
            }
            st.schedule.len()
        };
        tracing::info!(breaks, "break scheduler started");
        if breaks == 0 {
            self.inner.events.publish(AllBreaksCompleted);
        }
    }

    /// Queue the pending break. Only honoured while its window is open.
    pub fn queue_break(&self) -> bool {
        let index = {
            let mut st = self.inner.state.lock().unwrap();
            if st.phase != BreakPhase::WindowOpen {
                return false;
            }
            let current = st.current;
            let Some(config) = st.schedule.get_mut(current) else {
                return false;
            };
            if !config.mark_queued() {
                return false;
            }
            st.phase = BreakPhase::Queued;
            current
        };
        tracing::info!(index, "break queued");
        self.inner.events.publish(BreakQueued { index });
        true
    }

    /// Start the pending break now instead of waiting for its slot.
    pub fn start_break_now(&self) -> bool {
        let index = self.inner.state.lock().unwrap().current;
        self.inner.start_break(index)
    }

    /// Finish the break in progress: pay out, give listeners back, and arm the
    /// next break. Returns the break's revenue, or `None` if no break was playing.
    pub fn end_break(&self) -> Option<f64> {
        self.inner.end_break()
    }

    pub fn phase(&self) -> BreakPhase {
        self.inner.state.lock().unwrap().phase
    }

    pub fn schedule(&self) -> BreakSchedule {
        self.inner.state.lock().unwrap().schedule.clone()
    }

    pub fn timing(&self) -> BreakTiming {
        self.inner.timing
    }

    pub fn elapsed(&self) -> Duration {
        self.inner
            .state
            .lock()
            .unwrap()
            .show_start
            .map(|s| s.elapsed())
            .unwrap_or_default()
    }

    pub fn status(&self) -> BreakStatus {
        let st = self.inner.state.lock().unwrap();
        let elapsed = st.show_start.map(|s| s.elapsed()).unwrap_or_default();
        let pending = (st.phase != BreakPhase::Exhausted)
            .then(|| st.schedule.get(st.current))
            .flatten();
        BreakStatus {
            phase: st.phase,
            index: pending.map(|b| b.index()),
            elapsed,
            until_window: pending.map(|b| {
                b.scheduled_time()
                    .saturating_sub(self.inner.timing.window())
                    .saturating_sub(elapsed)
            }),
            until_break: pending.map(|b| b.scheduled_time().saturating_sub(elapsed)),
            queued: pending.is_some_and(|b| b.was_queued()),
            breaks_remaining: st.schedule.len().saturating_sub(st.current),
        }
    }

    /// Stop all timers and detach from the event channel.
    pub fn shutdown(&self) {
        let mut st = self.inner.state.lock().unwrap();
        if let Some(timer) = st.timer.take() {
            timer.cancel();
        }
        if let Some(sub) = st.subscription.take() {
            self.inner.events.unsubscribe(&sub);
        }
    }
}

impl Inner {
    /// Spawn the timer task for the current break. Caller holds the lock.
    fn arm(self: &Arc<Self>, st: &mut State) {
        let (Some(show_start), Some(session)) = (st.show_start, st.session.as_ref()) else {
            return;
        };
        let Some((index, offset)) = st
            .schedule
            .get(st.current)
            .map(|b| (b.index(), b.scheduled_time()))
        else {
            return;
        };
        let token = session.child_token();
        if let Some(old) = st.timer.replace(token.clone()) {
            old.cancel();
        }
        st.phase = BreakPhase::Idle;

        let at = show_start + offset;
        let timing = self.timing;
        let inner = self.clone();
        tracing::debug!(index, at = ?offset, "arming break");

        tokio::spawn(async move {
            if !until(at.checked_sub(timing.window()).unwrap_or(show_start), &token).await {
                return;
            }
            inner.open_window(index);
            if !until(at.checked_sub(timing.grace()).unwrap_or(show_start), &token).await {
                return;
            }
            inner.grace(index);
            if !until(at.checked_sub(timing.imminent()).unwrap_or(show_start), &token).await {
                return;
            }
            inner.imminent(index);
            if !until(at, &token).await {
                return;
            }
            inner.start_break(index);
        });
    }

    fn until_break(&self, st: &State, index: usize) -> Duration {
        let elapsed = st.show_start.map(|s| s.elapsed()).unwrap_or_default();
        st.schedule
            .get(index)
            .map(|b| b.scheduled_time().saturating_sub(elapsed))
            .unwrap_or_default()
    }

    fn open_window(&self, index: usize) {
        let until_break = {
            let mut st = self.state.lock().unwrap();
            if st.current != index || st.phase != BreakPhase::Idle {
                return;
            }
            st.phase = BreakPhase::WindowOpen;
            self.until_break(&st, index)
        };
        tracing::info!(index, "break window open");
        self.events.publish(BreakWindowOpened { index, until_break });
    }

    fn grace(&self, index: usize) {
        let (until_break, queued) = {
            let mut st = self.state.lock().unwrap();
            if st.current != index
                || !matches!(st.phase, BreakPhase::WindowOpen | BreakPhase::Queued)
            {
                return;
            }
            let queued = st.schedule.get(index).is_some_and(|b| b.was_queued());
            if queued {
                st.phase = BreakPhase::GracePeriod;
            }
            (self.until_break(&st, index), queued)
        };
        self.events.publish(BreakGracePeriod {
            index,
            until_break,
            queued,
        });
    }

    fn imminent(&self, index: usize) {
        let until_break = {
            let mut st = self.state.lock().unwrap();
            if st.current != index
                || !matches!(
                    st.phase,
                    BreakPhase::WindowOpen | BreakPhase::Queued | BreakPhase::GracePeriod
                )
            {
                return;
            }
            st.phase = BreakPhase::Imminent;
            self.until_break(&st, index)
        };
        self.events.publish(BreakImminent { index, until_break });
    }

    /// Idempotent: only the first caller for a given break gets through.
    fn start_break(&self, index: usize) -> bool {
        let (was_queued, listeners) = {
            let mut st = self.state.lock().unwrap();
            if st.current != index
                || matches!(st.phase, BreakPhase::Started | BreakPhase::Exhausted)
            {
                return false;
            }
            let Some(config) = st.schedule.get_mut(index) else {
                return false;
            };
            config.mark_played();
            let was_queued = config.was_queued();
            st.phase = BreakPhase::Started;
            if let Some(timer) = st.timer.take() {
                timer.cancel();
            }
            let listeners = self.listeners.current_listeners();
            st.dip = (listeners as f64 * self.rules.listener_dip).floor() as i64;
            st.break_revenue = 0.0;
            st.ads_aired = 0;
            (was_queued, st.dip)
        };

        if !was_queued {
            tracing::warn!(index, penalty = self.rules.unqueued_penalty, "break started unqueued");
            self.stats.modify(-self.rules.unqueued_penalty);
        }
        self.listeners.modify_listeners(-listeners);
        tracing::info!(index, was_queued, dip = listeners, "break started");
        self.events.publish(BreakStarted { index, was_queued });
        true
    }

    fn record_ad(&self, revenue: f64) {
        let mut st = self.state.lock().unwrap();
        if st.phase == BreakPhase::Started {
            st.break_revenue += revenue;
            st.ads_aired += 1;
        }
    }

    fn end_break(self: &Arc<Self>) -> Option<f64> {
        let (index, slots, dip, aired, earned) = {
            let st = self.state.lock().unwrap();
            if st.phase != BreakPhase::Started {
                return None;
            }
            let slots = st.schedule.get(st.current).map_or(0, |b| b.slots());
            (st.current, slots, st.dip, st.ads_aired, st.break_revenue)
        };

        let revenue = if aired == 0 {
            let owed = ad_revenue(slots, self.listeners.current_listeners());
            self.revenue.add_money(owed, "Ad Revenue");
            owed
        } else {
            earned
        };
        self.listeners.modify_listeners(dip);
        tracing::info!(index, revenue, "break ended");
        self.events.publish(BreakEnded { index, revenue });

        let exhausted = {
            let mut st = self.state.lock().unwrap();
            st.dip = 0;
            st.current += 1;
            if st.current < st.schedule.len() {
                self.arm(&mut st);
                false
            } else {
                st.phase = BreakPhase::Exhausted;
                true
            }
        };
        if exhausted {
            tracing::info!("all breaks completed");
            self.events.publish(AllBreaksCompleted);
        }
        Some(revenue)
    }
}

/// Sleep until `deadline`. False if the token fired first.
async fn until(deadline: Instant, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep_until(deadline) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::{Ledger, ListenerGauge, MoodMeter};

    struct Harness {
        scheduler: BreakScheduler,
        events: Arc<EventChannel>,
        listeners: Arc<ListenerGauge>,
        mood: Arc<MoodMeter>,
        ledger: Arc<Ledger>,
        log: Arc<Mutex<Vec<String>>>,
    }

    fn harness(breaks: usize, listeners: u32) -> Harness {
        let events = Arc::new(EventChannel::new());
        let gauge = Arc::new(ListenerGauge::new(listeners));
        let mood = Arc::new(MoodMeter::new(50.0));
        let ledger = Arc::new(Ledger::new());
        let schedule = BreakSchedule::generate(Duration::from_secs(600), breaks, 2).unwrap();
        let scheduler = BreakScheduler::new(
            schedule,
            BreakTiming::default(),
            BreakRules::default(),
            events.clone(),
            gauge.clone(),
            mood.clone(),
            ledger.clone(),
        );

        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        events.subscribe(move |e: &BreakWindowOpened| l.lock().unwrap().push(format!("window{}", e.index)));
        let l = log.clone();
        events.subscribe(move |e: &BreakGracePeriod| {
            l.lock().unwrap().push(format!("grace{}:{}", e.index, e.queued))
        });
        let l = log.clone();
        events.subscribe(move |e: &BreakImminent| l.lock().unwrap().push(format!("imminent{}", e.index)));
        let l = log.clone();
        events.subscribe(move |e: &BreakStarted| {
            l.lock().unwrap().push(format!("started{}:{}", e.index, e.was_queued))
        });
        let l = log.clone();
        events.subscribe(move |_: &AllBreaksCompleted| l.lock().unwrap().push("done".into()));

        Harness {
            scheduler,
            events,
            listeners: gauge,
            mood,
            ledger,
            log,
        }
    }

    async fn advance_to(secs: u64, origin: Instant) {
        tokio::time::sleep_until(origin + Duration::from_secs(secs)).await;
        // Let the timer task run its step.
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn phases_follow_thresholds() {
        let h = harness(2, 1000);
        let origin = Instant::now();
        h.scheduler.start(&CancellationToken::new());

        advance_to(179, origin).await;
        assert_eq!(h.scheduler.phase(), BreakPhase::Idle);
        advance_to(181, origin).await;
        assert_eq!(h.scheduler.phase(), BreakPhase::WindowOpen);

        assert!(h.scheduler.queue_break());
        assert!(!h.scheduler.queue_break());
        advance_to(191, origin).await;
        assert_eq!(h.scheduler.phase(), BreakPhase::GracePeriod);
        advance_to(196, origin).await;
        assert_eq!(h.scheduler.phase(), BreakPhase::Imminent);
        advance_to(201, origin).await;
        assert_eq!(h.scheduler.phase(), BreakPhase::Started);

        assert_eq!(
            *h.log.lock().unwrap(),
            vec!["window0", "grace0:true", "imminent0", "started0:true"]
        );
        assert_eq!(h.mood.value(), 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_outside_window_is_ignored() {
        let h = harness(1, 100);
        let origin = Instant::now();
        h.scheduler.start(&CancellationToken::new());
        assert!(!h.scheduler.queue_break());

        advance_to(197, origin).await;
        assert_eq!(h.scheduler.phase(), BreakPhase::Imminent);
        assert!(!h.scheduler.queue_break());
    }

    #[tokio::test(start_paused = true)]
    async fn unqueued_break_penalises_once() {
        let h = harness(1, 1000);
        let origin = Instant::now();
        h.scheduler.start(&CancellationToken::new());

        advance_to(201, origin).await;
        assert!(!h.scheduler.start_break_now());
        assert_eq!(h.mood.value(), 35.0);
        assert!(h.log.lock().unwrap().contains(&"grace0:false".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn listener_dip_is_restored_exactly() {
        let h = harness(1, 1010);
        h.scheduler.start(&CancellationToken::new());

        assert!(h.scheduler.start_break_now());
        assert_eq!(h.listeners.current_listeners(), 1010 - 50);
        // Audience drifts during the break; the dip comes back unchanged.
        h.listeners.modify_listeners(7);
        h.scheduler.end_break().unwrap();
        assert_eq!(h.listeners.current_listeners(), 1017);
    }

    #[tokio::test(start_paused = true)]
    async fn end_break_pays_formula_when_no_ads_aired() {
        let h = harness(1, 400);
        h.scheduler.start(&CancellationToken::new());
        h.scheduler.start_break_now();
        let revenue = h.scheduler.end_break().unwrap();
        // 400 - 5% = 380 listeners during the break, regional rate, two slots.
        assert!((revenue - 2.0 * 380.0 * 0.05).abs() < 1e-9);
        assert!((h.ledger.total() - revenue).abs() < 1e-9);
        assert!(h.scheduler.end_break().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn end_break_reports_aired_revenue() {
        let h = harness(1, 400);
        h.scheduler.start(&CancellationToken::new());
        h.scheduler.start_break_now();
        h.events.publish(AdAired {
            unit_id: "ad1".into(),
            tier: crate::unit::AdTier::RegionalBrand,
            listeners: 380,
            revenue: 19.0,
        });
        assert_eq!(h.scheduler.end_break(), Some(19.0));
        // The scheduler does not pay twice for ads that already paid.
        assert_eq!(h.ledger.total(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_and_timer_start_fire_once() {
        let h = harness(1, 100);
        let origin = Instant::now();
        h.scheduler.start(&CancellationToken::new());
        advance_to(195, origin).await;
        assert!(h.scheduler.start_break_now());
        advance_to(260, origin).await;
        let started = h
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("started"))
            .count();
        assert_eq!(started, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn last_break_exhausts_schedule() {
        let h = harness(2, 100);
        h.scheduler.start(&CancellationToken::new());
        for _ in 0..2 {
            assert!(h.scheduler.start_break_now());
            h.scheduler.end_break();
        }
        assert_eq!(h.scheduler.phase(), BreakPhase::Exhausted);
        assert!(!h.scheduler.start_break_now());
        assert_eq!(h.log.lock().unwrap().last().unwrap(), "done");
        assert_eq!(h.scheduler.status().index, None);
    }

    #[tokio::test(start_paused = true)]
    async fn late_arming_fires_past_thresholds_immediately() {
        let h = harness(2, 100);
        let origin = Instant::now();
        h.scheduler.start(&CancellationToken::new());
        advance_to(201, origin).await;
        // Hold the first break past the second one's window and grace marks.
        advance_to(390, origin).await;
        h.scheduler.end_break();
        advance_to(391, origin).await;

        assert_eq!(h.scheduler.phase(), BreakPhase::WindowOpen);
        assert_eq!(h.scheduler.status().until_break, Some(Duration::from_secs(9)));
        let log = h.log.lock().unwrap();
        assert!(log.contains(&"window1".to_string()));
        assert!(log.contains(&"grace1:false".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn session_cancel_stops_timers() {
        let h = harness(1, 100);
        let origin = Instant::now();
        let session = CancellationToken::new();
        h.scheduler.start(&session);
        session.cancel();
        advance_to(300, origin).await;
        assert_eq!(h.scheduler.phase(), BreakPhase::Idle);
        assert!(h.log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn status_counts_down() {
        let h = harness(2, 100);
        let origin = Instant::now();
        h.scheduler.start(&CancellationToken::new());
        advance_to(50, origin).await;
        let status = h.scheduler.status();
        assert_eq!(status.index, Some(0));
        assert_eq!(status.until_break, Some(Duration::from_secs(150)));
        assert_eq!(status.until_window, Some(Duration::from_secs(130)));
        assert_eq!(status.breaks_remaining, 2);
    }
}
