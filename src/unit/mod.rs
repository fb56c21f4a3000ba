//! Execution units: the smallest awaitable pieces of broadcast content.
//!
//! A unit is immutable once built. Every call to [`ExecutionUnit::execute`]
//! opens a fresh cancellation scope (a child of the token it is given), so
//! the timeline can cut the unit off without touching anything else.
//!
//! Lifecycle events, in order: `UnitStarted` before any work, then exactly
//! one of `UnitCompleted` or `UnitInterrupted`. The interrupted event is
//! published before `OnAirError::Cancelled` is returned.

mod advert;
mod control;
mod dialogue;
mod penalty;
mod transition;

pub use advert::{AdCatalog, AdTier, Advert, ad_revenue};
pub use control::force_disconnect;
pub use dialogue::DialogueLine;
pub use penalty::envelope_gain;

use crate::error::{OnAirError, Result};
use crate::events::{UnitCompleted, UnitInterrupted, UnitStarted};
use crate::stage::Stage;
use crate::station::ShowState;
use crate::wait::Cancelled;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Conversation,
    DialogueLine,
    Ad,
    AdBreak,
    Transition,
    Music,
    PutOnAir,
    WaitForBreak,
    PenaltyDelay,
}

impl UnitKind {
    /// Show state the timeline enters while a unit of this kind runs.
    pub fn show_state(self) -> Option<ShowState> {
        match self {
            UnitKind::Conversation | UnitKind::DialogueLine => Some(ShowState::Conversation),
            UnitKind::Ad | UnitKind::AdBreak => Some(ShowState::AdBreak),
            UnitKind::WaitForBreak => Some(ShowState::BetweenCallers),
            _ => None,
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnitKind::Conversation => "conversation",
            UnitKind::DialogueLine => "line",
            UnitKind::Ad => "ad",
            UnitKind::AdBreak => "ad-break",
            UnitKind::Transition => "transition",
            UnitKind::Music => "music",
            UnitKind::PutOnAir => "put-on-air",
            UnitKind::WaitForBreak => "wait-for-break",
            UnitKind::PenaltyDelay => "penalty-delay",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnitMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arc_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<u32>,
    /// 1-based position inside an ad sequence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ad_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ad_total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<AdTier>,
}

/// Read-only view of a unit handed to observers. Built fresh at each start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitProjection {
    pub id: String,
    pub kind: UnitKind,
    pub text: Option<String>,
    pub audio: Option<PathBuf>,
    pub duration: Duration,
    pub metadata: UnitMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Completed,
    /// Stopped at a safe point because a break was pending.
    EndedEarly,
}

#[derive(Debug, Clone)]
enum UnitBody {
    Conversation(Vec<DialogueLine>),
    Advert(Advert),
    AdSequence(Vec<Advert>),
    Cue,
    PutOnAir,
    WaitForBreak,
    PenaltyDelay,
}

#[derive(Debug, Clone)]
pub struct ExecutionUnit {
    id: String,
    kind: UnitKind,
    requires_wait: bool,
    duration: Duration,
    text: Option<String>,
    audio: Option<PathBuf>,
    metadata: UnitMetadata,
    body: UnitBody,
}

impl ExecutionUnit {
    fn build(id: impl Into<String>, kind: UnitKind, duration: Duration, body: UnitBody) -> Self {
        ExecutionUnit {
            id: id.into(),
            kind,
            requires_wait: true,
            duration,
            text: None,
            audio: None,
            metadata: UnitMetadata::default(),
            body,
        }
    }

    pub fn conversation(id: impl Into<String>, lines: Vec<DialogueLine>) -> Self {
        let duration = lines.iter().map(|l| l.duration).sum();
        Self::build(id, UnitKind::Conversation, duration, UnitBody::Conversation(lines))
    }

    pub fn advert(id: impl Into<String>, advert: Advert) -> Self {
        let audio = advert.audio.clone();
        let mut unit = Self::build(id, UnitKind::Ad, advert.duration, UnitBody::Advert(advert));
        unit.audio = audio;
        unit
    }

    pub fn ad_sequence(id: impl Into<String>, adverts: Vec<Advert>) -> Self {
        let duration = adverts.iter().map(|a| a.duration).sum();
        let mut unit = Self::build(id, UnitKind::AdBreak, duration, UnitBody::AdSequence(adverts));
        unit.text = Some("Commercial break".into());
        unit
    }

    /// Jingle, sweeper or filler. Waits out `duration` when `audio` is absent.
    pub fn transition(
        id: impl Into<String>,
        text: impl Into<String>,
        audio: Option<PathBuf>,
        duration: Duration,
    ) -> Self {
        let mut unit = Self::build(id, UnitKind::Transition, duration, UnitBody::Cue);
        unit.text = Some(text.into());
        unit.audio = audio;
        unit
    }

    pub fn music(id: impl Into<String>, audio: PathBuf, duration: Duration) -> Self {
        let mut unit = Self::build(id, UnitKind::Music, duration, UnitBody::Cue);
        unit.audio = Some(audio);
        unit
    }

    /// Promote the next on-hold caller. The only unit that does not wait.
    pub fn put_on_air(id: impl Into<String>) -> Self {
        let mut unit = Self::build(id, UnitKind::PutOnAir, Duration::ZERO, UnitBody::PutOnAir);
        unit.requires_wait = false;
        unit
    }

    pub fn wait_for_break(id: impl Into<String>, ceiling: Duration) -> Self {
        Self::build(id, UnitKind::WaitForBreak, ceiling, UnitBody::WaitForBreak)
    }

    pub fn penalty_delay(id: impl Into<String>, tone: Option<PathBuf>, duration: Duration) -> Self {
        let mut unit = Self::build(id, UnitKind::PenaltyDelay, duration, UnitBody::PenaltyDelay);
        unit.audio = tone;
        unit
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_metadata(mut self, metadata: UnitMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    /// False for control actions, which the timeline runs without a ceiling.
    pub fn requires_wait(&self) -> bool {
        self.requires_wait
    }

    /// Nominal length.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn metadata(&self) -> &UnitMetadata {
        &self.metadata
    }

    /// Hard limit after which the timeline gives up on this unit.
    pub fn ceiling(&self, margin: Duration) -> Duration {
        self.duration + margin
    }

    pub fn projection(&self) -> UnitProjection {
        UnitProjection {
            id: self.id.clone(),
            kind: self.kind,
            text: self.text.clone(),
            audio: self.audio.clone(),
            duration: self.duration,
            metadata: self.metadata.clone(),
        }
    }

    /// Run the unit to completion, or until `cancel` fires.
    pub async fn execute(&self, stage: &Stage, cancel: &CancellationToken) -> Result<UnitOutcome> {
        tracing::debug!(unit = %self.id, kind = %self.kind, "executing");
        match &self.body {
            UnitBody::Conversation(lines) => dialogue::run(self, lines, stage, cancel).await,
            UnitBody::Advert(advert) => {
                advert::run_advert(&self.id, advert, self.metadata.clone(), stage, cancel).await
            }
            UnitBody::AdSequence(adverts) => advert::run_sequence(self, adverts, stage, cancel).await,
            UnitBody::Cue => transition::run(self, stage, cancel).await,
            UnitBody::PutOnAir => control::put_on_air(self, stage, cancel).await,
            UnitBody::WaitForBreak => control::wait_for_break(self, stage, cancel).await,
            UnitBody::PenaltyDelay => penalty::run(self, stage, cancel).await,
        }
    }

    pub(crate) fn audio(&self) -> Option<&std::path::Path> {
        self.audio.as_deref()
    }

    pub(crate) fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

// ── Lifecycle scope ──────────────────────────────────────────────────────────

/// One execution's cancellation scope and event bookkeeping.
///
/// The child token is cancelled when the scope is dropped, so any task or
/// timer hanging off it dies with the unit.
pub(crate) struct Scope<'a> {
    stage: &'a Stage,
    projection: UnitProjection,
    token: CancellationToken,
    _guard: DropGuard,
}

impl<'a> Scope<'a> {
    pub(crate) fn open(stage: &'a Stage, projection: UnitProjection, parent: &CancellationToken) -> Self {
        let token = parent.child_token();
        Scope {
            stage,
            projection,
            _guard: token.clone().drop_guard(),
            token,
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Publish `UnitStarted` for the scope's own projection.
    pub(crate) fn start(&self, measured: Option<Duration>) {
        self.announce(self.projection.clone(), measured);
    }

    /// Publish `UnitStarted` for a sub-step (one line of a conversation).
    pub(crate) fn announce(&self, projection: UnitProjection, measured: Option<Duration>) {
        let nominal = projection.duration;
        self.stage.events.publish(UnitStarted {
            projection,
            nominal,
            measured,
        });
    }

    pub(crate) fn finish(self, result: std::result::Result<UnitOutcome, Cancelled>) -> Result<UnitOutcome> {
        let unit_id = self.projection.id.clone();
        match result {
            Ok(outcome) => {
                tracing::debug!(unit = %unit_id, ?outcome, "unit finished");
                self.stage.events.publish(UnitCompleted { unit_id, outcome });
                Ok(outcome)
            }
            Err(Cancelled) => {
                let reason = self.stage.interrupt_reason();
                tracing::debug!(unit = %unit_id, %reason, "unit interrupted");
                self.stage.events.publish(UnitInterrupted {
                    unit_id: unit_id.clone(),
                    reason,
                    projection: self.projection,
                });
                Err(OnAirError::Cancelled { unit_id, reason })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InterruptReason;
    use crate::stage::testing::rig;
    use std::sync::{Arc, Mutex};

    fn record<T: Clone + Send + 'static>(stage: &Stage) -> Arc<Mutex<Vec<T>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        stage.events.subscribe(move |e: &T| s.lock().unwrap().push(e.clone()));
        seen
    }

    #[test]
    fn only_put_on_air_skips_waiting() {
        assert!(!ExecutionUnit::put_on_air("p").requires_wait());
        assert!(ExecutionUnit::wait_for_break("w", Duration::from_secs(20)).requires_wait());
        assert!(ExecutionUnit::transition("t", "Sweeper", None, Duration::from_secs(3)).requires_wait());
    }

    #[test]
    fn conversation_duration_sums_lines() {
        let unit = ExecutionUnit::conversation(
            "c1",
            vec![
                DialogueLine::new("Vern", "You're on the air.", Duration::from_secs(3)),
                DialogueLine::new("Caller", "Long time listener.", Duration::from_secs(5)),
            ],
        );
        assert_eq!(unit.duration(), Duration::from_secs(8));
        assert_eq!(unit.ceiling(Duration::from_secs(10)), Duration::from_secs(18));
    }

    #[test]
    fn projection_serializes() {
        let unit = ExecutionUnit::transition("bumper", "Station ID", None, Duration::from_secs(3));
        let json = serde_json::to_value(unit.projection()).unwrap();
        assert_eq!(json["kind"], "transition");
        assert_eq!(json["text"], "Station ID");
    }

    #[tokio::test(start_paused = true)]
    async fn transition_publishes_started_then_completed() {
        let r = rig(100, 2);
        let started = record::<UnitStarted>(&r.stage);
        let completed = record::<UnitCompleted>(&r.stage);

        let unit = ExecutionUnit::transition("sweep", "Sweeper", None, Duration::from_secs(3));
        let outcome = unit.execute(&r.stage, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, UnitOutcome::Completed);
        assert_eq!(started.lock().unwrap().len(), 1);
        assert_eq!(started.lock().unwrap()[0].nominal, Duration::from_secs(3));
        assert_eq!(completed.lock().unwrap()[0].unit_id, "sweep");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_unit_reports_before_erroring() {
        let r = rig(100, 2);
        let interrupted = record::<UnitInterrupted>(&r.stage);
        let token = CancellationToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            t.cancel();
        });

        let unit = ExecutionUnit::music("opener", PathBuf::from("missing.ogg"), Duration::from_secs(30));
        let err = unit.execute(&r.stage, &token).await.unwrap_err();

        assert!(err.is_cancelled());
        let seen = interrupted.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].unit_id, "opener");
        assert_eq!(seen[0].reason, InterruptReason::UserAction);
    }

    #[tokio::test]
    async fn scope_token_dies_with_scope() {
        let r = rig(100, 1);
        let parent = CancellationToken::new();
        let child = {
            let scope = Scope::open(&r.stage, ExecutionUnit::put_on_air("p").projection(), &parent);
            scope.token().clone()
        };
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
