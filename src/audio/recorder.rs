//! Bounded-duration PCM capture with background transcoding and
//! transcription hand-off.

use crate::config::Config;
use crate::rules::types::{EventId, TranscriptionStatus};
use crate::store::EventStore;
use crate::transcription::TranscriptionQueue;
use crate::ws::EventHub;
use parking_lot::Mutex;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const SAMPLE_RATE: u32 = 171_000;
pub const SAMPLE_WIDTH: u32 = 2;
pub const CHANNELS: u32 = 1;
pub const MIN_DURATION_SEC: u64 = 10;
const FFMPEG_TIMEOUT: Duration = Duration::from_secs(60);

struct Capture {
    event_id: EventId,
    started: Instant,
    pcm: Vec<u8>,
}

struct RecorderState {
    capture: Option<Capture>,
}

pub struct Recorder {
    config: Config,
    store: Option<Arc<EventStore>>,
    transcription: Option<Arc<TranscriptionQueue>>,
    hub: Option<EventHub>,
    state: Mutex<RecorderState>,
}

impl Recorder {
    pub fn new(config: Config) -> Self {
        Recorder {
            config,
            store: None,
            transcription: None,
            hub: None,
            state: Mutex::new(RecorderState { capture: None }),
        }
    }

    pub fn with_collaborators(
        config: Config,
        store: Arc<EventStore>,
        transcription: Option<Arc<TranscriptionQueue>>,
        hub: EventHub,
    ) -> Self {
        Recorder {
            config,
            store: Some(store),
            transcription,
            hub: Some(hub),
            state: Mutex::new(RecorderState { capture: None }),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().capture.is_some()
    }

    pub fn buffered_len(&self) -> usize {
        self.state.lock().capture.as_ref().map(|c| c.pcm.len()).unwrap_or(0)
    }

    /// Finalizes any in-progress capture synchronously, then starts a new
    /// one. Never leaves two captures alive at once.
    pub fn start(self: &Arc<Self>, event_id: EventId) {
        let mut guard = self.state.lock();
        if let Some(prev) = guard.capture.take() {
            self.finalize_locked(prev);
        }
        guard.capture = Some(Capture {
            event_id,
            started: Instant::now(),
            pcm: Vec::new(),
        });
    }

    pub fn feed(self: &Arc<Self>, chunk: &[u8]) {
        let mut guard = self.state.lock();
        let exceeded = if let Some(cap) = &mut guard.capture {
            cap.pcm.extend_from_slice(chunk);
            cap.started.elapsed() >= Duration::from_secs(self.config.max_recording_sec)
        } else {
            false
        };
        if exceeded {
            if let Some(cap) = guard.capture.take() {
                self.finalize_locked(cap);
            }
        }
    }

    /// Returns `true` if the finalized capture was accepted (long enough),
    /// `false` if it was discarded or nothing was recording.
    pub fn stop(self: &Arc<Self>) -> bool {
        let mut guard = self.state.lock();
        match guard.capture.take() {
            Some(cap) => self.finalize_locked(cap),
            None => false,
        }
    }

    /// Discards if too short or empty, else spawns a background thread to
    /// transcode and enqueue transcription. Returns whether it was accepted.
    fn finalize_locked(self: &Arc<Self>, cap: Capture) -> bool {
        let elapsed = cap.started.elapsed();
        if elapsed.as_secs() < MIN_DURATION_SEC || cap.pcm.is_empty() {
            return false;
        }
        let this = Arc::clone(self);
        std::thread::spawn(move || this.save_and_transcribe(cap.event_id, cap.pcm));
        true
    }

    fn save_and_transcribe(&self, event_id: EventId, pcm: Vec<u8>) {
        let base = format!("{}/{}", self.config.audio_dir, event_id);
        let wav_path = format!("{base}.wav");
        let ogg_path = format!("{base}.ogg");
        let ogg_rel = format!("{event_id}.ogg");

        let result = (|| -> Result<(), crate::error::AudioError> {
            ffmpeg_convert_wav(&pcm, &wav_path)?;
            ffmpeg_convert_ogg(&pcm, &ogg_path)?;
            Ok(())
        })();

        let Some(store) = &self.store else { return };

        match result {
            Ok(()) => {
                // audio_path stores the Ogg filename only, not the directory.
                let _ = store.update_audio(event_id, &ogg_rel);
                match &self.transcription {
                    Some(q) => q.enqueue(event_id, wav_path),
                    None => {
                        let _ = store.clear_transcription_status(event_id);
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, event_id, "audio finalize failed");
                let _ = store.update_transcription_status(event_id, TranscriptionStatus::Error);
            }
        }

        if let Some(hub) = &self.hub {
            match store.get(event_id) {
                Ok(ev) => hub.publish(&ev),
                Err(e) => tracing::warn!(error = %e, event_id, "failed to reload event for broadcast"),
            }
        }
    }
}

fn raw_pcm_to_wav_args(input_path: &str, output_path: &str, sample_rate: u32) -> Vec<String> {
    vec![
        "-f".into(), "s16le".into(),
        "-ar".into(), SAMPLE_RATE.to_string(),
        "-ac".into(), CHANNELS.to_string(),
        "-i".into(), input_path.into(),
        "-ar".into(), sample_rate.to_string(),
        "-y".into(), output_path.into(),
    ]
}

fn ffmpeg_convert_wav(pcm: &[u8], output_path: &str) -> Result<(), crate::error::AudioError> {
    run_ffmpeg(pcm, &raw_pcm_to_wav_args("pipe:0", output_path, 16_000))
}

fn ffmpeg_convert_ogg(pcm: &[u8], output_path: &str) -> Result<(), crate::error::AudioError> {
    let args = vec![
        "-f".to_string(), "s16le".to_string(),
        "-ar".to_string(), SAMPLE_RATE.to_string(),
        "-ac".to_string(), CHANNELS.to_string(),
        "-i".to_string(), "pipe:0".to_string(),
        "-c:a".to_string(), "libopus".to_string(),
        "-b:a".to_string(), "48k".to_string(),
        "-y".to_string(), output_path.to_string(),
    ];
    run_ffmpeg(pcm, &args)
}

fn run_ffmpeg(pcm: &[u8], args: &[String]) -> Result<(), crate::error::AudioError> {
    use std::io::Write;

    let mut child = Command::new("ffmpeg")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(pcm)?;
    }

    let deadline = Instant::now() + FFMPEG_TIMEOUT;
    loop {
        if let Some(status) = child.try_wait()? {
            if status.success() {
                return Ok(());
            }
            return Err(crate::error::AudioError::FfmpegFailed(format!("exit status {status}")));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(crate::error::AudioError::Timeout(FFMPEG_TIMEOUT));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_config() -> Config {
        Config::from_env(&HashMap::<&str, &str>::new()).unwrap()
    }

    #[test]
    fn short_captures_are_discarded() {
        let recorder = Arc::new(Recorder::new(test_config()));
        recorder.start(1);
        recorder.feed(&[0u8; 100]);
        // Not enough elapsed time, so stop() should discard (finalize_locked
        // returns false) rather than spawn a transcode thread.
        recorder.stop();
        assert!(!recorder.is_recording());
    }

    #[test]
    fn start_finalizes_prior_capture_before_beginning_new_one() {
        let recorder = Arc::new(Recorder::new(test_config()));
        recorder.start(1);
        recorder.feed(&[0u8; 10]);
        recorder.start(2);
        assert!(recorder.is_recording());
        assert_eq!(recorder.buffered_len(), 0);
    }
}
