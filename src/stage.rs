//! Stage: everything a unit may touch while it runs.
//!
//! One `Stage` is built per session and handed by reference to each unit's
//! `execute`. It also owns the playback helper every unit goes through, which
//! is where missing assets and an exhausted player pool turn into a silent
//! delay instead of an error.

use crate::audio::{PlaybackEnd, PlayerPool};
use crate::channel::EventChannel;
use crate::error::{OnAirError, Result};
use crate::events::InterruptReason;
use crate::station::{CallerRepository, ListenerProvider, RevenueSink};
use crate::timeline::TimelineHandle;
use crate::unit::AdCatalog;
use crate::wait::{Cancelled, sleep_or_cancel};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Durations units fall back on when nothing more specific is known.
#[derive(Debug, Clone, Copy)]
pub struct UnitTiming {
    pub line: Duration,
    pub penalty: Duration,
    pub wait_for_break: Duration,
    /// Added to a unit's length to get its hard ceiling.
    pub safety_margin: Duration,
}

impl Default for UnitTiming {
    fn default() -> Self {
        UnitTiming {
            line: Duration::from_secs(4),
            penalty: Duration::from_secs(20),
            wait_for_break: Duration::from_secs(20),
            safety_margin: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct Stage {
    pub events: Arc<EventChannel>,
    pub audio: PlayerPool,
    pub callers: Arc<dyn CallerRepository>,
    pub listeners: Arc<dyn ListenerProvider>,
    pub revenue: Arc<dyn RevenueSink>,
    pub timeline: Arc<TimelineHandle>,
    pub ads: Arc<AdCatalog>,
    pub timing: UnitTiming,
}

/// An audio reference after probing: either playable with a known length, or silence.
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    path: Option<PathBuf>,
    measured: Option<Duration>,
}

impl Cue {
    pub fn silent() -> Self {
        Cue {
            path: None,
            measured: None,
        }
    }

    pub fn measured(&self) -> Option<Duration> {
        self.measured
    }

    pub fn is_silent(&self) -> bool {
        self.path.is_none()
    }
}

impl Stage {
    /// Wire a stage around `events`, with a fresh timeline handle.
    pub fn new(
        events: Arc<EventChannel>,
        audio: PlayerPool,
        callers: Arc<dyn CallerRepository>,
        listeners: Arc<dyn ListenerProvider>,
        revenue: Arc<dyn RevenueSink>,
        ads: AdCatalog,
        timing: UnitTiming,
    ) -> Self {
        Stage {
            timeline: Arc::new(TimelineHandle::new(events.clone())),
            events,
            audio,
            callers,
            listeners,
            revenue,
            ads: Arc::new(ads),
            timing,
        }
    }

    /// Playable length of `path`, or why it cannot be played.
    pub fn measure(&self, path: &Path) -> Result<Duration> {
        self.audio
            .probe(path)
            .map_err(|source| OnAirError::AssetInvalid {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Probe `asset` once. Unusable files are logged and become silence.
    pub fn cue(&self, asset: Option<&Path>) -> Cue {
        let Some(path) = asset else {
            return Cue::silent();
        };
        match self.measure(path) {
            Ok(length) => Cue {
                path: Some(path.to_path_buf()),
                measured: Some(length),
            },
            Err(e) => {
                tracing::warn!("{}, falling back to silence", e);
                Cue::silent()
            }
        }
    }

    /// Play `cue`, or wait `nominal` if it is silent or no player is free.
    ///
    /// Cancellation drops the voice, which stops the player before returning.
    pub async fn play(
        &self,
        cue: &Cue,
        nominal: Duration,
        token: &CancellationToken,
    ) -> std::result::Result<(), Cancelled> {
        let (Some(path), Some(length)) = (cue.path.as_deref(), cue.measured) else {
            return sleep_or_cancel(nominal, token).await;
        };

        let mut voice = match self.audio.acquire() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("{}; '{}' replaced by silence", e, path.display());
                return sleep_or_cancel(nominal, token).await;
            }
        };

        let started = Instant::now();
        let done = voice.play(path);
        let ceiling = length + self.timing.safety_margin;

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Cancelled),
            end = done => match end {
                Ok(PlaybackEnd::Finished) | Ok(PlaybackEnd::Stopped) => Ok(()),
                Ok(PlaybackEnd::Failed(e)) => {
                    drop(voice);
                    tracing::warn!("playback of '{}' failed: {}", path.display(), e);
                    sleep_or_cancel(nominal.saturating_sub(started.elapsed()), token).await
                }
                Err(_) => {
                    drop(voice);
                    tracing::warn!("playback of '{}' lost its completion signal", path.display());
                    sleep_or_cancel(nominal.saturating_sub(started.elapsed()), token).await
                }
            },
            _ = tokio::time::sleep(ceiling) => {
                tracing::warn!("'{}' overran {:?}, cutting it off", path.display(), ceiling);
                Ok(())
            }
        }
    }

    /// Reason to report for a cancelled unit.
    pub fn interrupt_reason(&self) -> InterruptReason {
        self.timeline
            .last_interrupt()
            .unwrap_or(InterruptReason::UserAction)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::audio::DryRunBackend;
    use crate::station::{CallerBoard, Ledger, ListenerGauge};

    /// A stage wired to in-memory collaborators, with handles kept for assertions.
    pub struct Rig {
        pub stage: Stage,
        pub backend: Arc<DryRunBackend>,
        pub callers: Arc<CallerBoard>,
        pub listeners: Arc<ListenerGauge>,
        pub ledger: Arc<Ledger>,
    }

    pub fn rig(listeners: u32, pool_size: usize) -> Rig {
        let backend = Arc::new(DryRunBackend::new());
        let callers = Arc::new(CallerBoard::new());
        let gauge = Arc::new(ListenerGauge::new(listeners));
        let ledger = Arc::new(Ledger::new());
        let stage = Stage::new(
            Arc::new(EventChannel::new()),
            PlayerPool::new(backend.clone(), pool_size),
            callers.clone(),
            gauge.clone(),
            ledger.clone(),
            AdCatalog::default(),
            UnitTiming::default(),
        );
        Rig {
            stage,
            backend,
            callers,
            listeners: gauge,
            ledger,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::rig;
    use super::*;
    use crate::error::AssetError;

    #[tokio::test(start_paused = true)]
    async fn missing_asset_waits_nominal() {
        let r = rig(100, 2);
        let cue = r.stage.cue(Some(Path::new("nowhere.mp3")));
        assert!(cue.is_silent());

        let start = Instant::now();
        let token = CancellationToken::new();
        r.stage.play(&cue, Duration::from_secs(4), &token).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        assert!(r.backend.plays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn measured_asset_plays_for_its_length() {
        let r = rig(100, 2);
        r.backend.register("line.mp3", Duration::from_secs(6));
        let cue = r.stage.cue(Some(Path::new("line.mp3")));
        assert_eq!(cue.measured(), Some(Duration::from_secs(6)));

        let start = Instant::now();
        let token = CancellationToken::new();
        r.stage.play(&cue, Duration::from_secs(4), &token).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(6));
        assert_eq!(r.stage.audio.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_length_asset_is_silent() {
        let r = rig(100, 1);
        r.backend.register_broken("empty.mp3", AssetError::ZeroLength);
        assert!(r.stage.cue(Some(Path::new("empty.mp3"))).is_silent());
    }

    #[test]
    fn unusable_asset_is_reported_with_its_path() {
        let r = rig(100, 1);
        r.backend.register_broken("ads/local_1.mp3", AssetError::Corrupt("bad frame".into()));
        match r.stage.measure(Path::new("ads/local_1.mp3")) {
            Err(OnAirError::AssetInvalid { path, source }) => {
                assert_eq!(path, PathBuf::from("ads/local_1.mp3"));
                assert_eq!(source, AssetError::Corrupt("bad frame".into()));
            }
            other => panic!("expected AssetInvalid, got {:?}", other),
        }
        r.backend.register("bed.mp3", Duration::from_secs(30));
        assert_eq!(r.stage.measure(Path::new("bed.mp3")).unwrap(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_falls_back_without_blocking() {
        let r = rig(100, 1);
        r.backend.register("bed.mp3", Duration::from_secs(30));
        let _held = r.stage.audio.acquire().unwrap();

        let cue = r.stage.cue(Some(Path::new("bed.mp3")));
        let start = Instant::now();
        let token = CancellationToken::new();
        r.stage.play(&cue, Duration::from_secs(4), &token).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        assert!(r.backend.plays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_player() {
        let r = rig(100, 1);
        r.backend.register("line.mp3", Duration::from_secs(10));
        let cue = r.stage.cue(Some(Path::new("line.mp3")));

        let token = CancellationToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            t.cancel();
        });
        let result = r.stage.play(&cue, Duration::from_secs(4), &token).await;
        assert_eq!(result, Err(Cancelled));
        assert_eq!(r.backend.stops().len(), 1);
        assert_eq!(r.stage.audio.available(), 1);
    }
}
