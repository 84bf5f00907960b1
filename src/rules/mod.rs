//! The traffic/emergency event lifecycle state machine.
//!
//! One `RulesEngine` instance owns the active-event maps for every PI it has
//! seen; it never owns its collaborators (store, broker, recorder) — they
//! are passed in by reference so the engine stays trivially testable with
//! fakes, per the station-event lifecycle design.

pub mod types;

use crate::audio::Recorder;
use crate::broker::BrokerClient;
use crate::config::PublishMode;
use crate::rules::types::{
    is_alarm_prog_type, DecodedGroup, EventState, EventType, Pi, Severity, TranscriptionStatus,
};
use crate::store::EventStore;
use crate::ws::EventHub;
use chrono::{NaiveDateTime, Utc};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[derive(Clone, Debug)]
struct TrafficState {
    event_id: i64,
    started_at: String,
    radiotext: Vec<String>,
}

#[derive(Clone, Debug)]
struct EmergencyState {
    event_id: i64,
    started_at: String,
}

#[derive(Default)]
struct Dedup {
    seen: HashMap<(Pi, String), u64>,
}

impl Dedup {
    /// Returns true if this is the first time this (pi, topic) has carried
    /// this value — i.e. the caller should publish/act on it.
    fn changed(&mut self, pi: &str, topic: &str, value: &str) -> bool {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        let hash = hasher.finish();
        let key = (pi.to_string(), topic.to_string());
        let changed = self.seen.get(&key) != Some(&hash);
        if changed {
            self.seen.insert(key, hash);
        }
        changed
    }
}

/// Returns the group's own timestamp field, falling back to wall-clock
/// time if the demodulator did not supply one (`msg_ts` in the original).
fn msg_ts(group: &DecodedGroup) -> String {
    group
        .timestamp
        .clone()
        .unwrap_or_else(|| Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string())
}

pub struct RulesEngine {
    active_traffic: Mutex<HashMap<Pi, TrafficState>>,
    active_emergency: Mutex<HashMap<Pi, EmergencyState>>,
    dedup: Mutex<Dedup>,
    /// Last-known `(owner_pi, linked_pi) -> ta` for EON first-sight suppression.
    eon_known: Mutex<HashMap<(Pi, Pi), bool>>,
    record_types: Vec<String>,
    publish_mode: PublishMode,
}

impl RulesEngine {
    pub fn new(record_types: Vec<String>) -> Self {
        RulesEngine {
            active_traffic: Mutex::new(HashMap::new()),
            active_emergency: Mutex::new(HashMap::new()),
            dedup: Mutex::new(Dedup::default()),
            eon_known: Mutex::new(HashMap::new()),
            record_types,
            publish_mode: PublishMode::Essential,
        }
    }

    /// "all" mode additionally publishes retained per-PI topic updates for
    /// slowly changing fields (PS, TP) that "essential" mode omits.
    pub fn with_publish_mode(mut self, mode: PublishMode) -> Self {
        self.publish_mode = mode;
        self
    }

    fn should_record(&self, event_type: &str) -> bool {
        self.record_types.iter().any(|t| t == event_type)
    }

    /// Re-reads the event by id and broadcasts it to the live web console.
    /// A direct lookup-by-id, not a scan of recent `query` results, per the
    /// transcription-completion design note.
    fn notify(&self, store: &EventStore, hub: &EventHub, id: i64) {
        match store.get(id) {
            Ok(ev) => hub.publish(&ev),
            Err(e) => tracing::warn!(error = %e, event_id = id, "failed to reload event for broadcast"),
        }
    }

    /// Recovers from an unclean shutdown: any event left non-terminal in the
    /// store is closed (I5), and in-memory active-event maps start empty so
    /// the next group for each PI begins a fresh lifecycle.
    pub fn recover(&self, store: &EventStore) {
        match store.close_stale_on_startup() {
            Ok(n) if n > 0 => tracing::info!(count = n, "closed stale events on startup"),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "failed to close stale events"),
        }
    }

    /// One call per decoded group, per station. Dispatches every rule that
    /// applies to the fields actually present on `group`.
    #[allow(clippy::too_many_arguments)]
    pub fn on_group(
        &self,
        pi: &str,
        frequency: &str,
        group: &DecodedGroup,
        store: &EventStore,
        broker: &dyn BrokerClient,
        hub: &EventHub,
        recorder: Option<&Arc<Recorder>>,
    ) {
        if self.publish_mode == PublishMode::All {
            self.publish_extended(pi, group, broker);
        }
        if let Some(ta) = group.ta {
            if self.dedup.lock().changed(pi, "ta", &ta.to_string()) {
                self.on_ta_change(pi, ta, frequency, group, store, broker, hub, recorder);
            }
        }
        if let Some(prog_type) = &group.prog_type {
            if self.dedup.lock().changed(pi, "pty", prog_type) {
                if is_alarm_prog_type(prog_type) {
                    self.on_pty_alert(pi, prog_type, frequency, group, store, broker, hub, recorder);
                } else if self.active_emergency.lock().contains_key(pi) {
                    self.on_pty_normal(pi, group, store, broker, hub, recorder);
                }
            }
        }
        // Only complete RadioText (group type 2A/2B) is used for event
        // tracking; partial fragments are publish-only and never reach here.
        if let Some(rt) = &group.radiotext {
            self.on_radiotext(pi, rt, store, broker, hub);
        }
        if let Some(on) = &group.other_network {
            if let Some(ta) = on.ta {
                self.on_eon_ta(pi, &on.pi, ta, frequency, store, hub);
            }
        }
    }

    fn publish_if_changed(&self, pi: &str, topic: &str, value: &str, broker: &dyn BrokerClient) {
        if self.dedup.lock().changed(pi, topic, value) {
            let _ = broker.publish(&format!("{pi}/{topic}"), value);
        }
    }

    /// "PUBLISH_MODE=all" extended topic set: slowly changing station
    /// fields the "essential" mode omits. Gated on `publish_mode`, an
    /// ambient broker observability surface independent of which event
    /// types are configured to be recorded.
    fn publish_extended(&self, pi: &str, group: &DecodedGroup, broker: &dyn BrokerClient) {
        if let Some(ps) = group.ps.as_deref().or(group.partial_ps.as_deref()) {
            self.publish_if_changed(pi, "station/ps", ps.trim(), broker);
        }
        if let Some(tp) = group.tp {
            self.publish_if_changed(pi, "traffic/tp", &tp.to_string(), broker);
        }
        if let Some(lps) = &group.long_ps {
            self.publish_if_changed(pi, "station/long_ps", lps.trim(), broker);
        }
        if let Some(music) = group.is_music {
            self.publish_if_changed(pi, "programme/music", &music.to_string(), broker);
        }
        if let Some(di) = &group.di {
            self.publish_if_changed(pi, "programme/di", &di.to_string(), broker);
        }
        if let Some(ct) = &group.clock_time {
            // Unlike the other extended topics, clock ticks are published
            // unconditionally on every group that carries one (no dedup):
            // the value itself always changes.
            let _ = broker.publish(&format!("{pi}/clock"), ct);
        }
        if let Some(bler) = group.bler {
            let _ = broker.publish(&format!("{pi}/system/bler"), &bler.to_string());
        }
        if let Some(country) = &group.country {
            self.publish_if_changed(pi, "system/country", country, broker);
        }
        for (key, af) in [("alt_frequencies_a", &group.alt_frequencies_a), ("alt_frequencies_b", &group.alt_frequencies_b)] {
            if let Some(af) = af {
                if let Ok(encoded) = serde_json::to_string(af) {
                    self.publish_if_changed(pi, key, &encoded, broker);
                }
            }
        }
        if let Some(rtp) = &group.radiotext_plus {
            if let Ok(encoded) = serde_json::to_string(rtp) {
                self.publish_if_changed(pi, "programme/rt_plus", &encoded, broker);
            }
        }
        if let Some(on) = &group.other_network {
            let eon_topic = format!("eon/{}", on.pi);
            if let Ok(encoded) = serde_json::to_string(&serde_json::json!({
                "pi": on.pi, "ps": on.ps, "tp": on.tp, "ta": on.ta, "kilohertz": on.kilohertz,
            })) {
                self.publish_if_changed(pi, &eon_topic, &encoded, broker);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_ta_change(
        &self,
        pi: &str,
        ta: bool,
        frequency: &str,
        group: &DecodedGroup,
        store: &EventStore,
        broker: &dyn BrokerClient,
        hub: &EventHub,
        recorder: Option<&Arc<Recorder>>,
    ) {
        let ts = msg_ts(group);
        if ta {
            // A fresh TA 0→1 while one is already tracked (e.g. after a
            // missed end) finalizes the stale one first. The map lock is
            // held only long enough to pull the entry out; the store write
            // and notify that follow run with it released.
            let prev = self.active_traffic.lock().remove(pi);
            if let Some(prev) = prev {
                self.finish_traffic(store, hub, recorder, &prev, &ts);
            }
            match store.insert_event(
                pi,
                EventType::Traffic,
                Severity::Warning,
                EventState::Start,
                group.ps.as_deref(),
                Some(frequency),
                Some(&ts),
                &serde_json::json!({"prog_type": group.prog_type}),
            ) {
                Ok(id) => {
                    self.active_traffic.lock().insert(
                        pi.to_string(),
                        TrafficState { event_id: id, started_at: ts, radiotext: Vec::new() },
                    );
                    if let Some(rec) = recorder {
                        if self.should_record("traffic") {
                            rec.start(id);
                            let _ = store.update_transcription_status(id, TranscriptionStatus::Recording);
                        }
                    }
                    let _ = broker.publish(&format!("{pi}/traffic"), "start");
                    self.notify(store, hub, id);
                }
                Err(e) => tracing::error!(error = %e, pi, "failed to insert traffic event"),
            }
        } else {
            let state = self.active_traffic.lock().remove(pi);
            if let Some(state) = state {
                let id = state.event_id;
                self.finish_traffic(store, hub, recorder, &state, &ts);
                let _ = broker.publish(&format!("{pi}/traffic"), "end");
                self.notify(store, hub, id);
            }
        }
    }

    fn finish_traffic(&self, store: &EventStore, hub: &EventHub, recorder: Option<&Arc<Recorder>>, state: &TrafficState, ended_at: &str) {
        let has_audio = recorder.map(|r| r.stop()).unwrap_or(false);
        if has_audio {
            let _ = store.update_transcription_status(state.event_id, TranscriptionStatus::Saving);
        }
        let duration = duration_between(&state.started_at, ended_at);
        if let Err(e) = store.end_event(state.event_id, ended_at, duration, Some(&state.radiotext), None) {
            tracing::error!(error = %e, event_id = state.event_id, "failed to end traffic event");
        }
        self.notify(store, hub, state.event_id);
    }

    fn on_radiotext(&self, pi: &str, rt: &str, store: &EventStore, broker: &dyn BrokerClient, hub: &EventHub) {
        let update = {
            let mut active = self.active_traffic.lock();
            active.get_mut(pi).and_then(|state| {
                if state.radiotext.last().map(String::as_str) != Some(rt) {
                    state.radiotext.push(rt.to_string());
                    Some((state.event_id, state.radiotext.clone()))
                } else {
                    None
                }
            })
        };
        if let Some((id, radiotext)) = update {
            if let Err(e) = store.update_radiotext(id, &radiotext) {
                tracing::error!(error = %e, pi, "failed to update radiotext");
            }
            let _ = broker.publish(&format!("{pi}/radiotext"), rt);
            self.notify(store, hub, id);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_pty_alert(
        &self,
        pi: &str,
        prog_type: &str,
        frequency: &str,
        group: &DecodedGroup,
        store: &EventStore,
        broker: &dyn BrokerClient,
        hub: &EventHub,
        recorder: Option<&Arc<Recorder>>,
    ) {
        if self.active_emergency.lock().contains_key(pi) {
            return;
        }
        let ts = msg_ts(group);
        match store.insert_event(
            pi,
            EventType::Emergency,
            Severity::Critical,
            EventState::Active,
            group.ps.as_deref(),
            Some(frequency),
            Some(&ts),
            &serde_json::json!({"prog_type": prog_type}),
        ) {
            Ok(id) => {
                self.active_emergency.lock().insert(pi.to_string(), EmergencyState { event_id: id, started_at: ts });
                if let Some(rec) = recorder {
                    if self.should_record("emergency") {
                        rec.start(id);
                        let _ = store.update_transcription_status(id, TranscriptionStatus::Recording);
                    }
                }
                let _ = broker.publish(&format!("{pi}/emergency"), "active");
                self.notify(store, hub, id);
            }
            Err(e) => tracing::error!(error = %e, pi, "failed to insert emergency event"),
        }
    }

    fn on_pty_normal(&self, pi: &str, group: &DecodedGroup, store: &EventStore, broker: &dyn BrokerClient, hub: &EventHub, recorder: Option<&Arc<Recorder>>) {
        let Some(state) = self.active_emergency.lock().remove(pi) else { return };
        let ts = msg_ts(group);
        let has_audio = recorder.map(|r| r.stop()).unwrap_or(false);
        if has_audio {
            let _ = store.update_transcription_status(state.event_id, TranscriptionStatus::Saving);
        }
        let duration = duration_between(&state.started_at, &ts);
        if let Err(e) = store.end_event(state.event_id, &ts, duration, None, None) {
            tracing::error!(error = %e, event_id = state.event_id, "failed to end emergency event");
        }
        let _ = broker.publish(&format!("{pi}/emergency"), "end");
        self.notify(store, hub, state.event_id);
    }

    /// EON-TA transitions fire only once the `(owner_pi, linked_pi)` pair has
    /// been observed before, suppressing a spurious "event" for the first
    /// sighting of a linked station (startup, or a PI never seen before).
    fn on_eon_ta(&self, pi: &str, linked_pi: &str, ta: bool, frequency: &str, store: &EventStore, hub: &EventHub) {
        let key = (pi.to_string(), linked_pi.to_string());
        let mut known = self.eon_known.lock();
        match known.get(&key).copied() {
            None => {
                known.insert(key, ta);
            }
            Some(prev) if prev != ta => {
                known.insert(key, ta);
                drop(known);
                match store.insert_event(
                    linked_pi,
                    EventType::EonTraffic,
                    Severity::Info,
                    EventState::Received,
                    None,
                    Some(frequency),
                    None,
                    &serde_json::json!({"linked_from": pi, "ta": ta}),
                ) {
                    Ok(id) => self.notify(store, hub, id),
                    Err(e) => tracing::error!(error = %e, pi = linked_pi, "failed to insert eon_traffic event"),
                }
            }
            Some(_) => {}
        }
    }
}

/// Parses the stored `%Y-%m-%dT%H:%M:%S` timestamp prefix and returns the
/// whole-second delta, clamped to zero. Returns 0 on any parse failure
/// rather than erroring — an event is still ended even if its duration
/// cannot be computed.
fn duration_between(started_at: &str, ended_at: &str) -> i64 {
    let parse = |s: &str| NaiveDateTime::parse_from_str(s.get(..19).unwrap_or(s), "%Y-%m-%dT%H:%M:%S");
    match (parse(started_at), parse(ended_at)) {
        (Ok(start), Ok(end)) => (end - start).num_seconds().max(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::NullBroker;
    use crate::rules::types::OtherNetwork;
    use crate::ws::EventHub;

    fn temp_store() -> EventStore {
        let path = std::env::temp_dir().join(format!("rds_guard_rules_test_{}_{}.sqlite", std::process::id(), rand_suffix()));
        let _ = std::fs::remove_file(&path);
        EventStore::open(path).unwrap()
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos() as u64
    }

    fn engine() -> RulesEngine {
        RulesEngine::new(vec!["traffic".to_string(), "emergency".to_string()])
    }

    fn group(fields: &[(&str, &str)]) -> DecodedGroup {
        let mut g = DecodedGroup::default();
        for (k, v) in fields {
            match *k {
                "ta" => g.ta = Some(*v == "true"),
                "timestamp" => g.timestamp = Some(v.to_string()),
                "radiotext" => g.radiotext = Some(v.to_string()),
                "prog_type" => g.prog_type = Some(v.to_string()),
                _ => {}
            }
        }
        g
    }

    #[test]
    fn ta_cycle_with_radiotext_matches_scenario_1() {
        let store = temp_store();
        let engine = engine();
        let broker = NullBroker;
        let hub = EventHub::new();

        engine.on_group("A123", "103.5M", &group(&[("ta", "true"), ("timestamp", "2025-01-01T00:00:00")]), &store, &broker, &hub, None);
        engine.on_group("A123", "103.5M", &group(&[("radiotext", "X")]), &store, &broker, &hub, None);
        engine.on_group("A123", "103.5M", &group(&[("radiotext", "X")]), &store, &broker, &hub, None);
        engine.on_group("A123", "103.5M", &group(&[("radiotext", "Y")]), &store, &broker, &hub, None);
        engine.on_group("A123", "103.5M", &group(&[("ta", "false"), ("timestamp", "2025-01-01T00:00:30")]), &store, &broker, &hub, None);

        let (rows, total) = store.query(Some("traffic"), None, 10, 0).unwrap();
        assert_eq!(total, 1);
        let ev = &rows[0];
        assert_eq!(ev.state, EventState::End);
        assert_eq!(ev.radiotext, vec!["X", "Y"]);
        assert_eq!(ev.duration_sec, Some(30));
    }

    #[test]
    fn repeated_ta_true_does_not_create_a_second_event() {
        let store = temp_store();
        let engine = engine();
        let broker = NullBroker;
        let hub = EventHub::new();

        engine.on_group("12345", "103.5M", &group(&[("ta", "true")]), &store, &broker, &hub, None);
        engine.on_group("12345", "103.5M", &group(&[("ta", "true")]), &store, &broker, &hub, None);

        let (rows, _) = store.query(Some("traffic"), None, 10, 0).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn pty_alarm_opens_an_emergency_event_and_clears_on_non_alarm() {
        let store = temp_store();
        let engine = engine();
        let broker = NullBroker;
        let hub = EventHub::new();

        engine.on_group("12345", "103.5M", &group(&[("prog_type", "Alarm"), ("timestamp", "2025-01-01T00:00:00")]), &store, &broker, &hub, None);
        assert!(!store.get_active_events("12345").unwrap().is_empty());

        engine.on_group("12345", "103.5M", &group(&[("prog_type", "Pop"), ("timestamp", "2025-01-01T00:01:00")]), &store, &broker, &hub, None);
        assert!(store.get_active_events("12345").unwrap().is_empty());

        let (rows, _) = store.query(Some("emergency"), None, 10, 0).unwrap();
        assert_eq!(rows[0].duration_sec, Some(60));
        assert_eq!(rows[0].severity, Severity::Critical);
    }

    #[test]
    fn radiotext_suppresses_adjacent_duplicates() {
        let store = temp_store();
        let engine = engine();
        let broker = NullBroker;
        let hub = EventHub::new();

        engine.on_group("12345", "103.5M", &group(&[("ta", "true")]), &store, &broker, &hub, None);
        engine.on_group("12345", "103.5M", &group(&[("radiotext", "Accident on I-90")]), &store, &broker, &hub, None);
        engine.on_group("12345", "103.5M", &group(&[("radiotext", "Accident on I-90")]), &store, &broker, &hub, None);
        engine.on_group("12345", "103.5M", &group(&[("radiotext", "Cleared")]), &store, &broker, &hub, None);

        let id = store.get_active_traffic("12345").unwrap().unwrap().id;
        let ev = store.get(id).unwrap();
        assert_eq!(ev.radiotext, vec!["Accident on I-90", "Cleared"]);
    }

    #[test]
    fn eon_ta_first_sight_is_suppressed_then_fires_on_next_transition() {
        let store = temp_store();
        let engine = engine();
        let hub = EventHub::new();

        let mut first = DecodedGroup::default();
        first.other_network = Some(OtherNetwork { pi: "B456".into(), ta: Some(false), ps: None, tp: None, kilohertz: None });
        engine.on_eon_ta("A123", "B456", false, "103.5M", &store, &hub);

        let (rows, _) = store.query(Some("eon_traffic"), None, 10, 0).unwrap();
        assert!(rows.is_empty(), "first sighting must not create an event");

        engine.on_eon_ta("A123", "B456", true, "103.5M", &store, &hub);
        let (rows, _) = store.query(Some("eon_traffic"), None, 10, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, EventState::Received);
    }

    #[test]
    fn recover_closes_stale_non_terminal_events() {
        let store = temp_store();
        store
            .insert_event("12345", EventType::Traffic, Severity::Warning, EventState::Start, None, None, None, &serde_json::Value::Null)
            .unwrap();
        let engine = engine();
        engine.recover(&store);
        assert!(store.get_active_events("12345").unwrap().is_empty());
    }
}
