use super::{ExecutionUnit, Scope, UnitKind, UnitMetadata, UnitOutcome, UnitProjection};
use crate::error::Result;
use crate::stage::Stage;
use crate::wait::Cancelled;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One spoken line of a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogueLine {
    pub speaker: String,
    pub text: String,
    pub audio: Option<PathBuf>,
    pub duration: Duration,
}

impl DialogueLine {
    pub fn new(speaker: impl Into<String>, text: impl Into<String>, duration: Duration) -> Self {
        DialogueLine {
            speaker: speaker.into(),
            text: text.into(),
            audio: None,
            duration,
        }
    }

    pub fn with_audio(mut self, path: impl Into<PathBuf>) -> Self {
        self.audio = Some(path.into());
        self
    }
}

fn line_projection(unit: &ExecutionUnit, index: usize, line: &DialogueLine) -> UnitProjection {
    UnitProjection {
        id: format!("{}_line{}", unit.id(), index + 1),
        kind: UnitKind::DialogueLine,
        text: Some(line.text.clone()),
        audio: line.audio.clone(),
        duration: line.duration,
        metadata: UnitMetadata {
            speaker: Some(line.speaker.clone()),
            ..unit.metadata().clone()
        },
    }
}

/// Play each line in order. A pending break ends the conversation at the
/// next line boundary without raising an error; the first line always airs.
pub(super) async fn run(
    unit: &ExecutionUnit,
    lines: &[DialogueLine],
    stage: &Stage,
    cancel: &CancellationToken,
) -> Result<UnitOutcome> {
    let scope = Scope::open(stage, unit.projection(), cancel);
    scope.start(None);
    let result = speak(unit, lines, stage, &scope).await;
    scope.finish(result)
}

async fn speak(
    unit: &ExecutionUnit,
    lines: &[DialogueLine],
    stage: &Stage,
    scope: &Scope<'_>,
) -> std::result::Result<UnitOutcome, Cancelled> {
    for (i, line) in lines.iter().enumerate() {
        if scope.token().is_cancelled() {
            return Err(Cancelled);
        }
        if i > 0 && stage.timeline.break_pending() {
            tracing::debug!(unit = unit.id(), line = i + 1, "break pending, wrapping up conversation");
            return Ok(UnitOutcome::EndedEarly);
        }
        let cue = stage.cue(line.audio.as_deref());
        scope.announce(line_projection(unit, i, line), cue.measured());
        stage.play(&cue, line.duration, scope.token()).await?;
    }
    Ok(UnitOutcome::Completed)
}
