//! Station event data model: the fields, enums and invariants that the
//! rules engine and the event store both operate on.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type Pi = String;
pub type EventId = i64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Traffic,
    Emergency,
    EonTraffic,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Traffic => "traffic",
            EventType::Emergency => "emergency",
            EventType::EonTraffic => "eon_traffic",
        };
        write!(f, "{s}")
    }
}

impl EventType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "traffic" => Some(EventType::Traffic),
            "emergency" => Some(EventType::Emergency),
            "eon_traffic" => Some(EventType::EonTraffic),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    Start,
    Update,
    Active,
    End,
    Received,
}

impl EventState {
    /// `start`, `update` and `active` are non-terminal: `ended_at` stays
    /// null and further transitions are still possible (I3).
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventState::End | EventState::Received)
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "start" => Some(EventState::Start),
            "update" => Some(EventState::Update),
            "active" => Some(EventState::Active),
            "end" => Some(EventState::End),
            "received" => Some(EventState::Received),
            _ => None,
        }
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventState::Start => "start",
            EventState::Update => "update",
            EventState::Active => "active",
            EventState::End => "end",
            EventState::Received => "received",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionStatus {
    Recording,
    Saving,
    Transcribing,
    Done,
    Error,
}

impl TranscriptionStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "recording" => Some(TranscriptionStatus::Recording),
            "saving" => Some(TranscriptionStatus::Saving),
            "transcribing" => Some(TranscriptionStatus::Transcribing),
            "done" => Some(TranscriptionStatus::Done),
            "error" => Some(TranscriptionStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for TranscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TranscriptionStatus::Recording => "recording",
            TranscriptionStatus::Saving => "saving",
            TranscriptionStatus::Transcribing => "transcribing",
            TranscriptionStatus::Done => "done",
            TranscriptionStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StationEvent {
    pub id: EventId,
    pub pi: Pi,
    pub event_type: EventType,
    pub severity: Severity,
    pub state: EventState,
    pub station_ps: Option<String>,
    pub frequency: Option<String>,
    pub radiotext: Vec<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub duration_sec: Option<i64>,
    pub audio_path: Option<String>,
    pub transcription: Option<String>,
    pub transcription_status: Option<TranscriptionStatus>,
    pub transcription_duration_sec: Option<f64>,
    pub created_at: String,
}

/// A tolerantly-parsed decoded RDS group line from the demodulator.
/// Every field is optional: unknown keys are ignored and missing fields
/// simply leave the corresponding update a no-op.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DecodedGroup {
    pub pi: Option<String>,
    pub group: Option<String>,
    pub ps: Option<String>,
    pub long_ps: Option<String>,
    pub partial_ps: Option<String>,
    pub prog_type: Option<String>,
    pub tp: Option<bool>,
    pub ta: Option<bool>,
    pub radiotext: Option<String>,
    pub partial_radiotext: Option<String>,
    pub other_network: Option<OtherNetwork>,
    pub clock_time: Option<String>,
    pub country: Option<String>,
    pub language: Option<String>,
    pub di: Option<serde_json::Value>,
    pub is_music: Option<bool>,
    pub bler: Option<f64>,
    pub alt_frequencies_a: Option<Vec<f64>>,
    pub alt_frequencies_b: Option<Vec<f64>>,
    pub radiotext_plus: Option<serde_json::Value>,
    pub timestamp: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtherNetwork {
    pub pi: String,
    pub ta: Option<bool>,
    pub ps: Option<String>,
    pub tp: Option<bool>,
    pub kilohertz: Option<f64>,
}

/// `prog_type` strings treated as alarm severity, matching redsea's
/// textual rendering of the RDS "alarm" PTY code (decimal 31 in Europe,
/// "Alarm - Loss of radio" in the US RBDS table).
pub const ALARM_PROG_TYPES: &[&str] = &["Alarm", "Alarm - Loss of radio"];

pub fn is_alarm_prog_type(prog_type: &str) -> bool {
    ALARM_PROG_TYPES.contains(&prog_type)
}
