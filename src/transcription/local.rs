//! Local speech-to-text via a lazily-loaded `whisper-rs` model.

use super::TranscriptionBackend;
use crate::config::Config;
use crate::error::TranscriptionError;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

pub struct LocalBackend {
    model_path: String,
    language: Option<String>,
    context: Option<WhisperContext>,
}

impl LocalBackend {
    pub fn new(config: &Config) -> Self {
        LocalBackend {
            model_path: config.transcription_model.clone(),
            language: config.transcription_language.clone(),
            context: None,
        }
    }

    fn context(&mut self) -> Result<&WhisperContext, TranscriptionError> {
        if self.context.is_none() {
            let ctx = WhisperContext::new_with_params(&self.model_path, WhisperContextParameters::default())
                .map_err(|e| TranscriptionError::Local(e.to_string()))?;
            self.context = Some(ctx);
        }
        Ok(self.context.as_ref().unwrap())
    }
}

impl TranscriptionBackend for LocalBackend {
    fn transcribe(&mut self, wav_path: &str) -> Result<String, TranscriptionError> {
        let samples = read_wav_mono_f32(wav_path).map_err(|e| TranscriptionError::Local(e.to_string()))?;
        let language = self.language.clone();
        let ctx = self.context()?;

        let mut state = ctx.create_state().map_err(|e| TranscriptionError::Local(e.to_string()))?;
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        if let Some(lang) = language.as_deref() {
            params.set_language(Some(lang));
        }
        params.set_print_progress(false);
        params.set_print_special(false);
        params.set_print_realtime(false);

        state
            .full(params, &samples)
            .map_err(|e| TranscriptionError::Local(e.to_string()))?;

        let num_segments = state.full_n_segments().map_err(|e| TranscriptionError::Local(e.to_string()))?;
        let mut parts = Vec::with_capacity(num_segments as usize);
        for i in 0..num_segments {
            let segment = state
                .full_get_segment_text(i)
                .map_err(|e| TranscriptionError::Local(e.to_string()))?;
            parts.push(segment);
        }
        Ok(parts.join(" ").trim().to_string())
    }
}

/// Reads a mono 16-bit PCM WAV file into normalized f32 samples, the input
/// format `whisper-rs` expects.
fn read_wav_mono_f32(path: &str) -> std::io::Result<Vec<f32>> {
    let bytes = std::fs::read(path)?;
    // Minimal WAV parse: assume a canonical 44-byte header (no extra chunks),
    // PCM16 mono, matching the files this process itself produces via ffmpeg.
    let data = bytes.get(44..).unwrap_or(&[]);
    Ok(data
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / i16::MAX as f32)
        .collect())
}
