use super::{ExecutionUnit, Scope, UnitOutcome};
use crate::channel::EventChannel;
use crate::error::Result;
use crate::events::{BroadcastInterruption, CallerForceDisconnected, InterruptReason};
use crate::stage::Stage;
use crate::station::{CallerRepository, CallerState, ShowState};
use crate::wait::{Cancelled, first_of};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Cut off whoever is on air. Returns true if someone was.
pub fn force_disconnect(callers: &dyn CallerRepository, events: &EventChannel) -> bool {
    let Some(caller) = callers.on_air_caller() else {
        return false;
    };
    tracing::info!(caller = caller.id, "disconnecting '{}' for the break", caller.name);
    callers.set_caller_state(&caller, CallerState::Disconnected);
    callers.remove_caller(&caller);
    events.publish(CallerForceDisconnected {
        caller_id: caller.id,
        name: caller.name,
    });
    true
}

/// Promote the next caller. Failure ends the unit early and moves the show
/// to `DroppedCaller`; it is never an error.
pub(super) async fn put_on_air(
    unit: &ExecutionUnit,
    stage: &Stage,
    cancel: &CancellationToken,
) -> Result<UnitOutcome> {
    let scope = Scope::open(stage, unit.projection(), cancel);
    scope.start(None);
    if scope.token().is_cancelled() {
        return scope.finish(Err(Cancelled));
    }

    let outcome = match stage.callers.put_on_air() {
        Ok(caller) => {
            tracing::info!(caller = caller.id, "'{}' is on the air", caller.name);
            stage.timeline.set_state(ShowState::Conversation);
            UnitOutcome::Completed
        }
        Err(e) => {
            tracing::warn!("could not put a caller on air: {}", e);
            stage.timeline.set_state(ShowState::DroppedCaller);
            stage.events.publish(BroadcastInterruption {
                reason: InterruptReason::CallerDropped,
            });
            UnitOutcome::EndedEarly
        }
    };
    scope.finish(Ok(outcome))
}

/// Hold until the break (or show end) is announced, bounded by the unit's
/// duration, then make sure nobody is left on the line.
pub(super) async fn wait_for_break(
    unit: &ExecutionUnit,
    stage: &Stage,
    cancel: &CancellationToken,
) -> Result<UnitOutcome> {
    let scope = Scope::open(stage, unit.projection(), cancel);
    scope.start(None);

    let (tx, rx) = oneshot::channel::<InterruptReason>();
    let tx = Mutex::new(Some(tx));
    let heard = Arc::new(AtomicBool::new(false));
    let heard_in_handler = heard.clone();
    let subscription = stage.events.subscribe_scoped(move |e: &BroadcastInterruption| {
        if matches!(e.reason, InterruptReason::BreakStarting | InterruptReason::ShowEnding) {
            heard_in_handler.store(true, Ordering::SeqCst);
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(e.reason);
            }
        }
    });

    let waited = first_of(unit.duration(), rx, scope.token()).await;
    drop(subscription);
    force_disconnect(stage.callers.as_ref(), &stage.events);

    let result = match waited {
        Ok(_) => Ok(UnitOutcome::Completed),
        // The break announcement and the cancellation that follows it arrive
        // together; the wait still got what it was waiting for.
        Err(Cancelled) if heard.load(Ordering::SeqCst) => Ok(UnitOutcome::Completed),
        Err(Cancelled) => Err(Cancelled),
    };
    scope.finish(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StateChanged;
    use crate::stage::testing::rig;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test]
    async fn put_on_air_promotes_caller() {
        let r = rig(100, 1);
        r.callers.hold("Marla from Pahrump");
        let unit = ExecutionUnit::put_on_air("next_caller");
        unit.execute(&r.stage, &CancellationToken::new()).await.unwrap();

        assert_eq!(r.callers.on_air_caller().unwrap().name, "Marla from Pahrump");
        assert_eq!(r.stage.timeline.state(), ShowState::Conversation);
    }

    #[tokio::test]
    async fn put_on_air_without_callers_drops() {
        let r = rig(100, 1);
        let changes = Arc::new(Mutex::new(Vec::new()));
        let c = changes.clone();
        r.stage
            .events
            .subscribe(move |e: &StateChanged| c.lock().unwrap().push(e.to));

        let reasons = Arc::new(Mutex::new(Vec::new()));
        let rs = reasons.clone();
        r.stage
            .events
            .subscribe(move |e: &BroadcastInterruption| rs.lock().unwrap().push(e.reason));

        let unit = ExecutionUnit::put_on_air("next_caller");
        let outcome = unit.execute(&r.stage, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, UnitOutcome::EndedEarly);
        assert_eq!(*reasons.lock().unwrap(), vec![InterruptReason::CallerDropped]);
        assert_eq!(r.stage.timeline.state(), ShowState::DroppedCaller);
        assert_eq!(*changes.lock().unwrap(), vec![ShowState::DroppedCaller]);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ends_on_break_announcement_and_disconnects() {
        let r = rig(100, 1);
        r.callers.hold("Dale");
        r.callers.put_on_air().unwrap();
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let d = dropped.clone();
        r.stage
            .events
            .subscribe(move |e: &CallerForceDisconnected| d.lock().unwrap().push(e.name.clone()));

        let events = r.stage.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            events.publish(BroadcastInterruption {
                reason: InterruptReason::BreakStarting,
            });
        });

        let start = Instant::now();
        let unit = ExecutionUnit::wait_for_break("hold", Duration::from_secs(20));
        let outcome = unit.execute(&r.stage, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, UnitOutcome::Completed);
        assert_eq!(start.elapsed(), Duration::from_secs(7));
        assert!(r.callers.on_air_caller().is_none());
        assert_eq!(*dropped.lock().unwrap(), vec!["Dale"]);
        assert_eq!(r.stage.events.subscriber_count::<BroadcastInterruption>(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ignores_other_interruptions_and_hits_ceiling() {
        let r = rig(100, 1);
        let events = r.stage.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            events.publish(BroadcastInterruption {
                reason: InterruptReason::BreakImminent,
            });
        });

        let start = Instant::now();
        let unit = ExecutionUnit::wait_for_break("hold", Duration::from_secs(20));
        unit.execute(&r.stage, &CancellationToken::new()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_still_disconnects() {
        let r = rig(100, 1);
        r.callers.hold("Dale");
        r.callers.put_on_air().unwrap();
        let token = CancellationToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            t.cancel();
        });

        let unit = ExecutionUnit::wait_for_break("hold", Duration::from_secs(20));
        assert!(unit.execute(&r.stage, &token).await.is_err());
        assert!(r.callers.on_air_caller().is_none());
    }

    #[test]
    fn force_disconnect_without_caller_is_noop() {
        let r = rig(100, 1);
        assert!(!force_disconnect(r.stage.callers.as_ref(), &r.stage.events));
    }
}
