//! RodioBackend: dedicated audio thread with channel-based command dispatch.
//!
//! rodio's `OutputStream` is not `Send`, so the stream and every `Sink` live on
//! one thread. The backend only holds an `mpsc::Sender`, which is naturally
//! `Send + Sync`. End-of-playback detection happens inside the thread loop via
//! `recv_timeout` + `sink.empty()`.

use crate::asset;
use crate::audio::{AudioBackend, PlaybackEnd, VoiceId};
use crate::error::{AssetError, Result};
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::oneshot;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

enum AudioCmd {
    Play {
        voice: VoiceId,
        path: PathBuf,
        done: oneshot::Sender<PlaybackEnd>,
    },
    Stop(VoiceId),
    SetVolume(VoiceId, f32),
    Shutdown,
}

pub struct RodioBackend {
    tx: mpsc::Sender<AudioCmd>,
}

impl RodioBackend {
    /// Spawn the audio thread. The output device is opened lazily on first play.
    pub fn spawn() -> Result<Self> {
        let (tx, rx) = mpsc::channel::<AudioCmd>();
        std::thread::Builder::new()
            .name("audio-runtime".into())
            .spawn(move || audio_thread_loop(rx))?;
        Ok(RodioBackend { tx })
    }
}

impl Drop for RodioBackend {
    fn drop(&mut self) {
        let _ = self.tx.send(AudioCmd::Shutdown);
    }
}

impl AudioBackend for RodioBackend {
    fn probe(&self, path: &Path) -> std::result::Result<Duration, AssetError> {
        asset::probe(path)
    }

    fn play(&self, voice: VoiceId, path: &Path) -> oneshot::Receiver<PlaybackEnd> {
        let (done, rx) = oneshot::channel();
        if let Err(mpsc::SendError(cmd)) = self.tx.send(AudioCmd::Play {
            voice,
            path: path.to_path_buf(),
            done,
        }) {
            if let AudioCmd::Play { done, .. } = cmd {
                let _ = done.send(PlaybackEnd::Failed("audio thread has exited".into()));
            }
        }
        rx
    }

    fn stop(&self, voice: VoiceId) {
        let _ = self.tx.send(AudioCmd::Stop(voice));
    }

    fn set_volume(&self, voice: VoiceId, volume: f32) {
        let _ = self.tx.send(AudioCmd::SetVolume(voice, volume));
    }
}

struct Output {
    _stream: OutputStream,
    handle: OutputStreamHandle,
}

impl Output {
    fn open() -> std::result::Result<Self, String> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| format!("Failed to open audio output: {}", e))?;
        Ok(Output {
            _stream: stream,
            handle,
        })
    }

    fn start(&self, path: &Path) -> std::result::Result<Sink, String> {
        let sink = Sink::try_new(&self.handle)
            .map_err(|e| format!("Failed to create sink: {}", e))?;
        let file = File::open(path)
            .map_err(|e| format!("Cannot open '{}': {}", path.display(), e))?;
        let source = Decoder::new(BufReader::new(file))
            .map_err(|e| format!("Cannot decode '{}': {}", path.display(), e))?;
        sink.append(source);
        sink.play();
        Ok(sink)
    }
}

struct Playing {
    sink: Sink,
    done: oneshot::Sender<PlaybackEnd>,
}

fn audio_thread_loop(rx: mpsc::Receiver<AudioCmd>) {
    let mut output: Option<Output> = None;
    let mut voices: HashMap<VoiceId, Playing> = HashMap::new();

    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(AudioCmd::Play { voice, path, done }) => {
                if let Some(prev) = voices.remove(&voice) {
                    prev.sink.stop();
                    let _ = prev.done.send(PlaybackEnd::Stopped);
                }

                if output.is_none() {
                    match Output::open() {
                        Ok(o) => output = Some(o),
                        Err(e) => {
                            tracing::warn!("{}", e);
                            let _ = done.send(PlaybackEnd::Failed(e));
                            continue;
                        }
                    }
                }
                let Some(out) = output.as_ref() else {
                    continue;
                };

                match out.start(&path) {
                    Ok(sink) => {
                        voices.insert(voice, Playing { sink, done });
                    }
                    Err(e) => {
                        let _ = done.send(PlaybackEnd::Failed(e));
                    }
                }
            }

            Ok(AudioCmd::Stop(voice)) => {
                if let Some(p) = voices.remove(&voice) {
                    p.sink.stop();
                    let _ = p.done.send(PlaybackEnd::Stopped);
                }
            }

            Ok(AudioCmd::SetVolume(voice, volume)) => {
                if let Some(p) = voices.get(&voice) {
                    p.sink.set_volume(volume);
                }
            }

            Ok(AudioCmd::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                for (_, p) in voices.drain() {
                    p.sink.stop();
                    let _ = p.done.send(PlaybackEnd::Stopped);
                }
                break;
            }

            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        let finished: Vec<VoiceId> = voices
            .iter()
            .filter(|(_, p)| p.sink.empty())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            if let Some(p) = voices.remove(&id) {
                let _ = p.done.send(PlaybackEnd::Finished);
            }
        }
    }
}
