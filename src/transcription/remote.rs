//! Remote speech-to-text via an HTTP `/asr` endpoint (e.g. a whisper-asr-webservice instance).

use super::TranscriptionBackend;
use crate::config::Config;
use crate::error::TranscriptionError;
use reqwest::blocking::{multipart, Client};

pub struct RemoteBackend {
    client: Client,
    base_url: String,
    language: Option<String>,
}

impl RemoteBackend {
    pub fn new(config: &Config) -> Self {
        let timeout = config.whisper_remote_timeout;
        RemoteBackend {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.whisper_remote_url.clone().unwrap_or_default(),
            language: config.transcription_language.clone(),
        }
    }
}

impl TranscriptionBackend for RemoteBackend {
    fn transcribe(&mut self, wav_path: &str) -> Result<String, TranscriptionError> {
        if self.base_url.is_empty() {
            return Err(TranscriptionError::Remote("WHISPER_REMOTE_URL not configured".into()));
        }
        let bytes = std::fs::read(wav_path).map_err(|e| TranscriptionError::Remote(e.to_string()))?;
        let part = multipart::Part::bytes(bytes)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::Remote(e.to_string()))?;
        let form = multipart::Form::new().part("audio_file", part);

        let mut req = self.client.post(format!("{}/asr", self.base_url)).multipart(form);
        if let Some(lang) = &self.language {
            req = req.query(&[("language", lang.as_str())]);
        }

        let resp = req.send().map_err(|e| TranscriptionError::Remote(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TranscriptionError::Remote(format!("status {}", resp.status())));
        }
        let text = resp.text().map_err(|e| TranscriptionError::Remote(e.to_string()))?;
        Ok(text.trim().to_string())
    }
}

