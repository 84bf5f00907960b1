//! RDS Guard supervisor binary.
//!
//! Starts the event store, the web console, an optional MQTT broker
//! client, the radio pipeline (single- or multi-station), and the
//! housekeeping workers (retention purge, periodic status), then blocks
//! the main thread until a shutdown signal arrives. Mirrors the
//! supervisor pattern of the original `rds_guard.py` `main()`.

use rds_guard::audio::Recorder;
use rds_guard::broker::{BrokerClient, MqttBroker, NullBroker};
use rds_guard::config::Config;
use rds_guard::pipeline::{self, PipelineStatus, StationConfig, StopSignal};
use rds_guard::rules::RulesEngine;
use rds_guard::stats::Stats;
use rds_guard::store::EventStore;
use rds_guard::transcription::TranscriptionQueue;
use rds_guard::ws::EventHub;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        frequencies = ?config.fm_frequencies,
        publish_mode = ?config.publish_mode,
        retention_days = config.event_retention_days,
        web_ui_port = config.web_ui_port,
        transcription_engine = ?config.transcription_engine,
        "RDS Guard starting"
    );

    let store = match EventStore::open(&config.db_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("failed to open event store at {}: {e}", config.db_path);
            std::process::exit(1);
        }
    };

    let hub = EventHub::new();

    let rules_engine = Arc::new(RulesEngine::new(config.record_event_types.clone()).with_publish_mode(config.publish_mode.clone()));
    // I5: any event left non-terminal by an unclean shutdown is closed
    // before normal operation resumes.
    rules_engine.recover(&store);

    let broker: Arc<dyn BrokerClient> = match &config.mqtt_host {
        Some(host) => Arc::new(MqttBroker::connect(
            host,
            config.mqtt_port,
            config.mqtt_username.as_deref(),
            config.mqtt_password.as_deref(),
            &config.mqtt_topic_prefix,
        )),
        None => Arc::new(NullBroker),
    };

    // The transcription worker is only spawned when an engine is
    // configured; with no engine, finalized captures simply clear their
    // `transcription_status` (see `Recorder::save_and_transcribe`).
    let transcription = if config.transcription_engine != rds_guard::config::TranscriptionEngine::None {
        Some(TranscriptionQueue::spawn(config.clone(), store.clone(), hub.clone()))
    } else {
        None
    };

    // Web console is started first and stays up regardless of whether the
    // radio pipeline or the broker ever come online.
    let _web_handle = rds_guard::web::spawn(config.web_ui_port, store.clone(), hub.clone());
    tracing::info!(port = config.web_ui_port, "web console listening");

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received");
            stop.set();
        })
        .expect("failed to install signal handler");
    }

    let stats = Arc::new(Stats::new());
    let status = Arc::new(PipelineStatus::new());

    let pipeline_handle = if config.is_multi_station() {
        spawn_multi_station(&config, &store, &broker, &rules_engine, &hub, &transcription, &stats, &status, &stop)
    } else {
        spawn_single_station(&config, &store, &broker, &rules_engine, &hub, &transcription, &stats, &status, &stop)
    };

    let purge_handle = spawn_retention_purge(config.clone(), store.clone(), stop.clone());
    let status_handle = spawn_status_publisher(config.clone(), broker.clone(), stats.clone(), status.clone(), stop.clone());

    tracing::info!("RDS Guard running — all systems started");
    stop.wait();

    tracing::info!("shutting down");
    if let Some(q) = &transcription {
        q.shutdown();
    }
    let _ = pipeline_handle.join();
    let _ = purge_handle.join();
    let _ = status_handle.join();
    tracing::info!("RDS Guard stopped");
}

#[allow(clippy::too_many_arguments)]
fn spawn_single_station(
    config: &Config,
    store: &Arc<EventStore>,
    broker: &Arc<dyn BrokerClient>,
    rules_engine: &Arc<RulesEngine>,
    hub: &EventHub,
    transcription: &Option<Arc<TranscriptionQueue>>,
    stats: &Arc<Stats>,
    status: &Arc<PipelineStatus>,
    stop: &Arc<StopSignal>,
) -> std::thread::JoinHandle<()> {
    let recorder = Arc::new(Recorder::with_collaborators(
        config.clone(),
        store.clone(),
        transcription.clone(),
        hub.clone(),
    ));
    let frequency = config.fm_frequencies[0].clone();

    let config = config.clone();
    let store = store.clone();
    let broker = broker.clone();
    let rules_engine = rules_engine.clone();
    let hub = hub.clone();
    let stats = stats.clone();
    let status = status.clone();
    let stop = stop.clone();

    std::thread::Builder::new()
        .name("pipeline".into())
        .spawn(move || {
            let tee_recorder = recorder.clone();
            let on_line = move |group: rds_guard::rules::types::DecodedGroup| {
                stats.record_group();
                let Some(pi) = group.pi.clone() else { return };
                rules_engine.on_group(&pi, &frequency, &group, &store, broker.as_ref(), &hub, Some(&recorder));
            };
            pipeline::run_single_station(&config, Some(tee_recorder), &status, &stop, on_line);
        })
        .expect("failed to spawn pipeline thread")
}

#[allow(clippy::too_many_arguments)]
fn spawn_multi_station(
    config: &Config,
    store: &Arc<EventStore>,
    broker: &Arc<dyn BrokerClient>,
    rules_engine: &Arc<RulesEngine>,
    hub: &EventHub,
    transcription: &Option<Arc<TranscriptionQueue>>,
    stats: &Arc<Stats>,
    status: &Arc<PipelineStatus>,
    stop: &Arc<StopSignal>,
) -> std::thread::JoinHandle<()> {
    let mut station_configs = Vec::with_capacity(config.fm_frequencies_hz.len());
    let mut on_lines: Vec<Box<dyn FnMut(rds_guard::rules::types::DecodedGroup) + Send>> =
        Vec::with_capacity(config.fm_frequencies_hz.len());

    for (freq_hz, frequency) in config.fm_frequencies_hz.iter().zip(config.fm_frequencies.iter()) {
        let recorder = Arc::new(Recorder::with_collaborators(
            config.clone(),
            store.clone(),
            transcription.clone(),
            hub.clone(),
        ));
        station_configs.push(StationConfig {
            frequency: frequency.clone(),
            freq_hz: *freq_hz,
            recorder: Some(recorder.clone()),
        });

        let frequency = frequency.clone();
        let store = store.clone();
        let broker = broker.clone();
        let rules_engine = rules_engine.clone();
        let hub = hub.clone();
        let stats = stats.clone();

        on_lines.push(Box::new(move |group: rds_guard::rules::types::DecodedGroup| {
            stats.record_group();
            let Some(pi) = group.pi.clone() else { return };
            rules_engine.on_group(&pi, &frequency, &group, &store, broker.as_ref(), &hub, Some(&recorder));
        }));
    }

    let config = config.clone();
    let status = status.clone();
    let stop = stop.clone();

    std::thread::Builder::new()
        .name("pipeline".into())
        .spawn(move || {
            pipeline::run_multi_station(&config, station_configs, &status, &stop, on_lines);
        })
        .expect("failed to spawn pipeline thread")
}

fn spawn_retention_purge(config: Config, store: Arc<EventStore>, stop: Arc<StopSignal>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("retention-purge".into())
        .spawn(move || {
            while !stop.is_set() {
                wait_or_stop(&stop, Duration::from_secs(3600));
                if stop.is_set() {
                    break;
                }
                match store.purge_older_than(config.event_retention_days) {
                    Ok(paths) => {
                        for ogg in &paths {
                            remove_audio_artifact(&config.audio_dir, ogg);
                        }
                        if !paths.is_empty() {
                            tracing::info!(count = paths.len(), "purged expired events and audio artifacts");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "retention purge failed"),
                }
            }
        })
        .expect("failed to spawn retention purge thread")
}

/// Removes both variants (Ogg, WAV) of a purged event's audio artifact.
/// `audio_path` stores only the Ogg filename, relative to `audio_dir`; the
/// WAV sibling shares the same base name in the same directory.
fn remove_audio_artifact(audio_dir: &str, ogg_filename: &str) {
    let ogg = std::path::Path::new(audio_dir).join(ogg_filename);
    let _ = std::fs::remove_file(&ogg);
    if let Some(stem) = ogg.file_stem() {
        let wav = std::path::Path::new(audio_dir).join(stem).with_extension("wav");
        let _ = std::fs::remove_file(wav);
    }
}

fn spawn_status_publisher(
    config: Config,
    broker: Arc<dyn BrokerClient>,
    stats: Arc<Stats>,
    status: Arc<PipelineStatus>,
    stop: Arc<StopSignal>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("status".into())
        .spawn(move || {
            let interval = Duration::from_secs(config.status_interval_sec.max(1));
            while !stop.is_set() {
                wait_or_stop(&stop, interval);
                if stop.is_set() {
                    break;
                }
                let snap = stats.snapshot();
                let pipeline_snap = status.snapshot();
                let payload = serde_json::json!({
                    "uptime_sec": snap.uptime_sec,
                    "groups_total": snap.groups_total,
                    "groups_per_sec": snap.groups_per_sec,
                    "pipeline_state": pipeline_snap.state,
                });
                if let Ok(text) = serde_json::to_string(&payload) {
                    let _ = broker.publish("system/status", &text);
                }
            }
        })
        .expect("failed to spawn status publisher thread")
}

/// Sleeps in short increments so the worker notices `stop` promptly
/// instead of only at the end of a long interval.
fn wait_or_stop(stop: &StopSignal, total: Duration) {
    let step = Duration::from_millis(200);
    let mut waited = Duration::ZERO;
    while waited < total {
        if stop.is_set() {
            return;
        }
        std::thread::sleep(step.min(total - waited));
        waited += step;
    }
}
