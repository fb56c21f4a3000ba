use super::{ExecutionUnit, Scope, UnitOutcome};
use crate::error::Result;
use crate::stage::Stage;
use tokio_util::sync::CancellationToken;

/// Transitions, fillers and music beds: play the asset if it is usable,
/// otherwise hold for the nominal duration.
pub(super) async fn run(
    unit: &ExecutionUnit,
    stage: &Stage,
    cancel: &CancellationToken,
) -> Result<UnitOutcome> {
    let cue = stage.cue(unit.audio());
    let scope = Scope::open(stage, unit.projection(), cancel);
    scope.start(cue.measured());
    if let Some(text) = unit.text() {
        tracing::debug!(unit = unit.id(), "{}", text);
    }

    let result = stage
        .play(&cue, unit.duration(), scope.token())
        .await
        .map(|()| UnitOutcome::Completed);
    scope.finish(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UnitStarted;
    use crate::stage::testing::rig;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn music_plays_its_own_length() {
        let r = rig(100, 2);
        r.backend.register("music/opener.mp3", Duration::from_secs(42));
        let unit = ExecutionUnit::music("opener", PathBuf::from("music/opener.mp3"), Duration::from_secs(30));

        let start = Instant::now();
        unit.execute(&r.stage, &CancellationToken::new()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(42));
        assert_eq!(r.backend.plays().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_transition_waits_nominal() {
        let r = rig(100, 2);
        let measured = Arc::new(Mutex::new(None));
        let m = measured.clone();
        r.stage
            .events
            .subscribe(move |e: &UnitStarted| *m.lock().unwrap() = Some(e.measured));

        let unit = ExecutionUnit::transition("return", "Back to the calls", None, Duration::from_secs(3));
        let start = Instant::now();
        unit.execute(&r.stage, &CancellationToken::new()).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(*measured.lock().unwrap(), Some(None));
    }
}
