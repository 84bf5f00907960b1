//! Environment-variable configuration, mirroring the layout and defaults of
//! the original `config.py`: every setting is read once at startup and
//! invalid values abort the process rather than falling back silently.

use crate::error::ConfigError;
use std::collections::HashMap;
use std::time::Duration;

const MAX_STATIONS: usize = 4;
const MAX_SPAN_HZ: u64 = 2_000_000;

/// Channelizer sample rate: 171 000 x 14, an exact integer decimation ratio.
pub const RTL_SAMPLE_RATE_HZ: u32 = 2_394_000;
/// Single-station tuner output rate, and the demodulator's expected input rate.
pub const STATION_SAMPLE_RATE_HZ: u32 = 171_000;
pub const DECIMATION: usize = (RTL_SAMPLE_RATE_HZ / STATION_SAMPLE_RATE_HZ) as usize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishMode {
    Essential,
    All,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TranscriptionEngine {
    None,
    Local,
    Remote,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Original display strings, e.g. `"103.5M"`, one per `fm_frequencies_hz` entry.
    pub fm_frequencies: Vec<String>,
    pub fm_frequencies_hz: Vec<u64>,
    pub rtl_center_freq_hz: u64,
    pub rtl_device_index: u32,
    pub rtl_device_serial: Option<String>,
    pub rtl_gain: String,
    pub ppm_correction: i32,
    pub redsea_show_partial: bool,
    pub redsea_show_raw: bool,
    pub mqtt_host: Option<String>,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub publish_mode: PublishMode,
    pub web_ui_port: u16,
    pub event_retention_days: u32,
    pub db_path: String,
    pub audio_dir: String,
    pub record_event_types: Vec<String>,
    pub max_recording_sec: u64,
    pub transcription_engine: TranscriptionEngine,
    pub transcription_language: Option<String>,
    pub transcription_model: String,
    pub transcription_device: String,
    pub whisper_remote_url: Option<String>,
    pub whisper_remote_timeout: Duration,
    pub status_interval_sec: u64,
}

/// A minimal indirection over the process environment so tests can supply a
/// fake map instead of mutating real env vars.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<&str, &str> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).map(|v| v.to_string())
    }
}

fn env_bool(env: &dyn EnvSource, key: &str, default: bool) -> bool {
    match env.get(key) {
        None => default,
        Some(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
    }
}

fn env_int<T: std::str::FromStr>(env: &dyn EnvSource, key: &str, default: T) -> Result<T, ConfigError> {
    match env.get(key) {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name: key.to_string(),
            value: v,
        }),
    }
}

/// Parses a frequency with an optional trailing `M`/`K` suffix, e.g. "99.5M" or "99500K".
fn parse_freq_hz(raw: &str) -> Result<u64, ConfigError> {
    let s = raw.trim();
    let (number, multiplier) = if let Some(stripped) = s.strip_suffix(['M', 'm']) {
        (stripped, 1_000_000.0)
    } else if let Some(stripped) = s.strip_suffix(['K', 'k']) {
        (stripped, 1_000.0)
    } else {
        (s, 1.0)
    };
    let value: f64 = number.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name: "FM_FREQUENCIES".to_string(),
        value: raw.to_string(),
    })?;
    Ok((value * multiplier).round() as u64)
}

fn parse_fm_frequencies(raw: &str) -> Result<Vec<u64>, ConfigError> {
    let freqs: Result<Vec<u64>, ConfigError> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_freq_hz)
        .collect();
    let freqs = freqs?;
    if freqs.is_empty() {
        return Err(ConfigError::NoFrequencies);
    }
    if freqs.len() > MAX_STATIONS {
        return Err(ConfigError::TooManyFrequencies(freqs.len()));
    }
    let min = *freqs.iter().min().unwrap();
    let max = *freqs.iter().max().unwrap();
    if max - min > MAX_SPAN_HZ {
        return Err(ConfigError::FrequencySpanTooWide { span_hz: max - min });
    }
    Ok(freqs)
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_env(&ProcessEnv)
    }

    pub fn from_env(env: &dyn EnvSource) -> Result<Self, ConfigError> {
        let fm_frequencies_raw = env.get("FM_FREQUENCIES").unwrap_or_else(|| "103.5M".to_string());
        let fm_frequencies_hz = parse_fm_frequencies(&fm_frequencies_raw)?;
        let fm_frequencies: Vec<String> = fm_frequencies_raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let rtl_center_freq_hz = match env.get("RTL_CENTER_FREQ") {
            Some(v) => parse_freq_hz(&v)?,
            None => {
                let min = *fm_frequencies_hz.iter().min().unwrap();
                let max = *fm_frequencies_hz.iter().max().unwrap();
                (min + max) / 2
            }
        };

        let publish_mode = match env.get("PUBLISH_MODE").as_deref() {
            Some("all") => PublishMode::All,
            _ => PublishMode::Essential,
        };

        let transcription_engine = match env.get("TRANSCRIPTION_ENGINE").as_deref() {
            Some("local") => TranscriptionEngine::Local,
            Some("remote") => TranscriptionEngine::Remote,
            _ => TranscriptionEngine::None,
        };

        let record_event_types = env
            .get("RECORD_EVENT_TYPES")
            .unwrap_or_else(|| "traffic,emergency".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Config {
            fm_frequencies,
            fm_frequencies_hz,
            rtl_center_freq_hz,
            rtl_device_index: env_int(env, "RTL_DEVICE_INDEX", 0u32)?,
            rtl_device_serial: env.get("RTL_DEVICE_SERIAL"),
            rtl_gain: env.get("RTL_GAIN").unwrap_or_else(|| "8".to_string()),
            ppm_correction: env_int(env, "PPM_CORRECTION", 0i32)?,
            redsea_show_partial: env_bool(env, "REDSEA_SHOW_PARTIAL", true),
            redsea_show_raw: env_bool(env, "REDSEA_SHOW_RAW", false),
            mqtt_host: env.get("MQTT_HOST"),
            mqtt_port: env_int(env, "MQTT_PORT", 1883u16)?,
            mqtt_username: env.get("MQTT_USERNAME"),
            mqtt_password: env.get("MQTT_PASSWORD"),
            mqtt_topic_prefix: env.get("MQTT_TOPIC_PREFIX").unwrap_or_else(|| "rds".to_string()),
            publish_mode,
            web_ui_port: env_int(env, "WEB_UI_PORT", 8080u16)?,
            event_retention_days: env_int(env, "EVENT_RETENTION_DAYS", 30u32)?,
            db_path: env.get("DB_PATH").unwrap_or_else(|| "./events.db".to_string()),
            audio_dir: env.get("AUDIO_DIR").unwrap_or_else(|| "./audio".to_string()),
            record_event_types,
            max_recording_sec: env_int(env, "MAX_RECORDING_SEC", 600u64)?,
            transcription_engine,
            transcription_language: env.get("TRANSCRIPTION_LANGUAGE"),
            transcription_model: env.get("TRANSCRIPTION_MODEL").unwrap_or_else(|| "small".to_string()),
            transcription_device: env.get("TRANSCRIPTION_DEVICE").unwrap_or_else(|| "cpu".to_string()),
            whisper_remote_url: env.get("WHISPER_REMOTE_URL"),
            whisper_remote_timeout: Duration::from_secs(env_int(env, "WHISPER_REMOTE_TIMEOUT", 120u64)?),
            status_interval_sec: env_int(env, "STATUS_INTERVAL", 30u64)?,
        })
    }

    pub fn is_multi_station(&self) -> bool {
        self.fm_frequencies_hz.len() > 1
    }

    pub fn should_record(&self, event_type: &str) -> bool {
        self.record_event_types.iter().any(|t| t == event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_map(pairs: &[(&'static str, &'static str)]) -> HashMap<&'static str, &'static str> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn parses_single_frequency_with_suffix() {
        let env = env_map(&[("FM_FREQUENCIES", "99.5M")]);
        let cfg = Config::from_env(&env).unwrap();
        assert_eq!(cfg.fm_frequencies_hz, vec![99_500_000]);
        assert_eq!(cfg.rtl_center_freq_hz, 99_500_000);
    }

    #[test]
    fn auto_center_is_midpoint_of_multi_station_span() {
        let env = env_map(&[("FM_FREQUENCIES", "99.5M,101.1M")]);
        let cfg = Config::from_env(&env).unwrap();
        assert_eq!(cfg.rtl_center_freq_hz, (99_500_000 + 101_100_000) / 2);
        assert!(cfg.is_multi_station());
    }

    #[test]
    fn rejects_more_than_four_stations() {
        let env = env_map(&[("FM_FREQUENCIES", "88M,89M,90M,91M,92M")]);
        assert!(matches!(
            Config::from_env(&env),
            Err(ConfigError::TooManyFrequencies(5))
        ));
    }

    #[test]
    fn rejects_span_over_two_megahertz() {
        let env = env_map(&[("FM_FREQUENCIES", "88M,91M")]);
        assert!(matches!(
            Config::from_env(&env),
            Err(ConfigError::FrequencySpanTooWide { .. })
        ));
    }

    #[test]
    fn rejects_empty_frequency_list() {
        let env = env_map(&[("FM_FREQUENCIES", "")]);
        assert!(matches!(Config::from_env(&env), Err(ConfigError::NoFrequencies)));
    }
}
