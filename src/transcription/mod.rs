//! Single-worker transcription job queue with lazy backend construction.

pub mod local;
pub mod remote;

use crate::config::{Config, TranscriptionEngine};
use crate::rules::types::{EventId, TranscriptionStatus};
use crate::store::EventStore;
use crate::ws::EventHub;
use crossbeam_channel::{unbounded, Sender};
use std::sync::Arc;
use std::time::Instant;

pub trait TranscriptionBackend: Send {
    fn transcribe(&mut self, wav_path: &str) -> Result<String, crate::error::TranscriptionError>;
}

enum Job {
    Transcribe { event_id: EventId, wav_path: String },
    Shutdown,
}

pub struct TranscriptionQueue {
    tx: Sender<Job>,
}

impl TranscriptionQueue {
    /// Spawns the single worker thread. The backend is constructed lazily on
    /// the first job, not here, so process startup never pays model-load
    /// cost when no transcription engine is configured to run yet.
    pub fn spawn(config: Config, store: Arc<EventStore>, hub: EventHub) -> Arc<Self> {
        let (tx, rx) = unbounded::<Job>();

        std::thread::Builder::new()
            .name("transcription".into())
            .spawn(move || {
                let mut backend: Option<Box<dyn TranscriptionBackend>> = None;
                let notify = |id: EventId| match store.get(id) {
                    Ok(ev) => hub.publish(&ev),
                    Err(e) => tracing::warn!(error = %e, event_id = id, "failed to reload event for broadcast"),
                };
                for job in rx {
                    match job {
                        Job::Shutdown => break,
                        Job::Transcribe { event_id, wav_path } => {
                            let _ = store.update_transcription_status(event_id, TranscriptionStatus::Transcribing);
                            notify(event_id);
                            if backend.is_none() {
                                backend = build_backend(&config);
                            }
                            let Some(backend) = backend.as_mut() else {
                                let _ = store.update_transcription_status(event_id, TranscriptionStatus::Error);
                                notify(event_id);
                                continue;
                            };
                            let started = Instant::now();
                            let elapsed_sec = || started.elapsed().as_secs_f64();
                            match backend.transcribe(&wav_path) {
                                Ok(text) => {
                                    let _ = store.update_transcription(event_id, &text, TranscriptionStatus::Done, Some(elapsed_sec()));
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, event_id, "transcription failed");
                                    let _ = store.update_transcription_status(event_id, TranscriptionStatus::Error);
                                }
                            }
                            notify(event_id);
                            tracing::debug!(event_id, elapsed_sec = elapsed_sec(), "transcription job done");
                        }
                    }
                }
            })
            .expect("failed to spawn transcription worker");

        Arc::new(TranscriptionQueue { tx })
    }

    pub fn enqueue(&self, event_id: EventId, wav_path: String) {
        let _ = self.tx.send(Job::Transcribe { event_id, wav_path });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Job::Shutdown);
    }
}

fn build_backend(config: &Config) -> Option<Box<dyn TranscriptionBackend>> {
    match config.transcription_engine {
        TranscriptionEngine::None => None,
        TranscriptionEngine::Local => Some(Box::new(local::LocalBackend::new(config))),
        TranscriptionEngine::Remote => Some(Box::new(remote::RemoteBackend::new(config))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn build_backend_returns_none_when_engine_is_none() {
        let env = HashMap::<&str, &str>::new();
        let config = Config::from_env(&env).unwrap();
        assert!(build_backend(&config).is_none());
    }
}
