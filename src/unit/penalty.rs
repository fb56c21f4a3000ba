use super::{ExecutionUnit, Scope, UnitOutcome};
use crate::audio::Voice;
use crate::error::Result;
use crate::events::PenaltyTimerCompleted;
use crate::stage::Stage;
use crate::wait::Cancelled;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const FADE_IN: f32 = 1.0;
const HOLD: f32 = 2.0;
const FADE_OUT: f32 = 1.0;
const SILENCE: f32 = 1.0;
const CYCLE: f32 = FADE_IN + HOLD + FADE_OUT + SILENCE;
const ENVELOPE_TICK: Duration = Duration::from_millis(100);

/// Gain of the penalty tone `elapsed` into the delay.
///
/// Repeats every five seconds: one second up, two held, one down, one silent.
pub fn envelope_gain(elapsed: Duration) -> f32 {
    let t = elapsed.as_secs_f32() % CYCLE;
    if t < FADE_IN {
        t / FADE_IN
    } else if t < FADE_IN + HOLD {
        1.0
    } else if t < FADE_IN + HOLD + FADE_OUT {
        1.0 - (t - FADE_IN - HOLD) / FADE_OUT
    } else {
        0.0
    }
}

/// Restart the tone each cycle and ride its volume along the envelope.
async fn drive_envelope(tone: Option<(&mut Voice, &Path)>, started: Instant) {
    let Some((voice, path)) = tone else {
        return std::future::pending().await;
    };
    let mut cycle = None;
    loop {
        let elapsed = started.elapsed();
        let current = (elapsed.as_secs_f32() / CYCLE) as u64;
        if cycle != Some(current) {
            cycle = Some(current);
            drop(voice.play(path));
        }
        voice.set_volume(envelope_gain(elapsed));
        tokio::time::sleep(ENVELOPE_TICK).await;
    }
}

/// Dead air while the penalty countdown runs. Ends on the countdown's
/// completion event or after the unit's duration, whichever is first.
pub(super) async fn run(
    unit: &ExecutionUnit,
    stage: &Stage,
    cancel: &CancellationToken,
) -> Result<UnitOutcome> {
    let cue = stage.cue(unit.audio());
    let scope = Scope::open(stage, unit.projection(), cancel);
    scope.start(cue.measured());

    let (tx, rx) = oneshot::channel::<bool>();
    let tx = Mutex::new(Some(tx));
    let _subscription = stage.events.subscribe_scoped(move |e: &PenaltyTimerCompleted| {
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(e.was_successful);
        }
    });

    let mut tone = match unit.audio() {
        Some(path) if !cue.is_silent() => match stage.audio.acquire() {
            Ok(voice) => Some((voice, path)),
            Err(e) => {
                tracing::warn!("penalty tone skipped: {}", e);
                None
            }
        },
        _ => None,
    };
    let started = Instant::now();

    let result = tokio::select! {
        biased;
        _ = scope.token().cancelled() => Err(Cancelled),
        signal = rx => {
            let successful = signal.unwrap_or(false);
            tracing::info!(successful, "penalty countdown resolved");
            Ok(UnitOutcome::Completed)
        }
        _ = tokio::time::sleep(unit.duration()) => Ok(UnitOutcome::Completed),
        _ = drive_envelope(tone.as_mut().map(|(v, p)| (v, *p)), started) => Ok(UnitOutcome::Completed),
    };
    drop(tone);
    scope.finish(result)
}
