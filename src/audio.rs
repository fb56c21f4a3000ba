//! Audio layer: bounded pool of player handles over a pluggable backend.
//!
//! Units never talk to a backend directly. They borrow a [`Voice`] from the
//! [`PlayerPool`]; dropping the voice stops whatever it was playing and hands
//! the handle back. The pool never blocks: when every handle is out,
//! `acquire` fails and the caller falls back to a silent delay.

use crate::asset;
use crate::error::{AssetError, OnAirError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::task::JoinHandle;

/// Index of a player handle inside the pool.
pub type VoiceId = usize;

/// How a playback request resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEnd {
    Finished,
    Stopped,
    Failed(String),
}

/// Something that can actually make (or pretend to make) sound.
pub trait AudioBackend: Send + Sync {
    /// Length of a playable asset.
    fn probe(&self, path: &Path) -> std::result::Result<Duration, AssetError>;

    /// Start `path` on `voice`, replacing anything already playing there.
    /// The receiver resolves once playback ends for any reason.
    fn play(&self, voice: VoiceId, path: &Path) -> oneshot::Receiver<PlaybackEnd>;

    /// Stop `voice`. No-op when it is idle.
    fn stop(&self, voice: VoiceId);

    fn set_volume(&self, voice: VoiceId, volume: f32);
}

// ── Pool ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PlayerPool {
    backend: Arc<dyn AudioBackend>,
    permits: Arc<Semaphore>,
    free: Arc<Mutex<Vec<VoiceId>>>,
    size: usize,
}

impl PlayerPool {
    pub fn new(backend: Arc<dyn AudioBackend>, size: usize) -> Self {
        PlayerPool {
            backend,
            permits: Arc::new(Semaphore::new(size)),
            free: Arc::new(Mutex::new((0..size).rev().collect())),
            size,
        }
    }

    /// Borrow a player handle without waiting.
    pub fn acquire(&self) -> Result<Voice> {
        let permit = self.permits.clone().try_acquire_owned().map_err(|_| {
            OnAirError::ResourceUnavailable(format!("all {} players busy", self.size))
        })?;
        let id = self
            .free
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| OnAirError::ResourceUnavailable("player pool out of sync".into()))?;
        tracing::debug!(voice = id, "player acquired");
        Ok(Voice {
            id,
            backend: self.backend.clone(),
            free: self.free.clone(),
            playing: false,
            _permit: permit,
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn probe(&self, path: &Path) -> std::result::Result<Duration, AssetError> {
        self.backend.probe(path)
    }
}

/// A borrowed player handle. Stops playback and returns itself to the pool on drop.
pub struct Voice {
    id: VoiceId,
    backend: Arc<dyn AudioBackend>,
    free: Arc<Mutex<Vec<VoiceId>>>,
    playing: bool,
    _permit: OwnedSemaphorePermit,
}

impl Voice {
    pub fn id(&self) -> VoiceId {
        self.id
    }

    pub fn play(&mut self, path: &Path) -> oneshot::Receiver<PlaybackEnd> {
        self.playing = true;
        self.backend.play(self.id, path)
    }

    pub fn set_volume(&self, volume: f32) {
        self.backend.set_volume(self.id, volume.clamp(0.0, 1.0));
    }

    pub fn stop(&mut self) {
        if std::mem::take(&mut self.playing) {
            self.backend.stop(self.id);
        }
    }
}

impl Drop for Voice {
    fn drop(&mut self) {
        self.stop();
        self.free.lock().unwrap().push(self.id);
        tracing::debug!(voice = self.id, "player released");
    }
}

// ── Dry run ──────────────────────────────────────────────────────────────────

/// Backend that plays nothing and just waits out each asset's length.
///
/// Durations come from [`register`](Self::register) first, then from probing
/// the file on disk. Every play, stop and volume change is recorded, which
/// makes it the audio fake in tests.
#[derive(Default)]
pub struct DryRunBackend {
    durations: Mutex<HashMap<PathBuf, Duration>>,
    broken: Mutex<HashMap<PathBuf, AssetError>>,
    active: Mutex<HashMap<VoiceId, JoinHandle<()>>>,
    plays: Mutex<Vec<(VoiceId, PathBuf)>>,
    stops: Mutex<Vec<VoiceId>>,
    volumes: Mutex<Vec<(VoiceId, f32)>>,
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `path` exists and lasts `duration`.
    pub fn register(&self, path: impl Into<PathBuf>, duration: Duration) {
        self.durations.lock().unwrap().insert(path.into(), duration);
    }

    /// Make probing `path` fail with `error`.
    pub fn register_broken(&self, path: impl Into<PathBuf>, error: AssetError) {
        self.broken.lock().unwrap().insert(path.into(), error);
    }

    pub fn plays(&self) -> Vec<(VoiceId, PathBuf)> {
        self.plays.lock().unwrap().clone()
    }

    /// Voices stopped while something was still playing on them.
    pub fn stops(&self) -> Vec<VoiceId> {
        self.stops.lock().unwrap().clone()
    }

    pub fn volumes(&self) -> Vec<(VoiceId, f32)> {
        self.volumes.lock().unwrap().clone()
    }

    fn length_of(&self, path: &Path) -> std::result::Result<Duration, AssetError> {
        if let Some(err) = self.broken.lock().unwrap().get(path) {
            return Err(err.clone());
        }
        if let Some(d) = self.durations.lock().unwrap().get(path) {
            return Ok(*d);
        }
        asset::probe(path)
    }
}

impl AudioBackend for DryRunBackend {
    fn probe(&self, path: &Path) -> std::result::Result<Duration, AssetError> {
        self.length_of(path)
    }

    fn play(&self, voice: VoiceId, path: &Path) -> oneshot::Receiver<PlaybackEnd> {
        let (tx, rx) = oneshot::channel();
        self.stop(voice);
        self.plays.lock().unwrap().push((voice, path.to_path_buf()));

        match self.length_of(path) {
            Ok(length) => {
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(length).await;
                    let _ = tx.send(PlaybackEnd::Finished);
                });
                self.active.lock().unwrap().insert(voice, handle);
            }
            Err(e) => {
                let _ = tx.send(PlaybackEnd::Failed(e.to_string()));
            }
        }
        rx
    }

    fn stop(&self, voice: VoiceId) {
        let Some(handle) = self.active.lock().unwrap().remove(&voice) else {
            return;
        };
        if !handle.is_finished() {
            handle.abort();
            self.stops.lock().unwrap().push(voice);
        }
    }

    fn set_volume(&self, voice: VoiceId, volume: f32) {
        self.volumes.lock().unwrap().push((voice, volume));
    }
}
