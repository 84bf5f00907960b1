//! Spawns and supervises the `rtl_fm`/`rtl_sdr` + `redsea` child processes
//! and feeds each station's decoded RDS line stream to a callback.
//!
//! Single station: `rtl_fm` (stdout=PCM) -> `AudioTee` -> `redsea` (stdout=ndjson).
//! Multi station:  `rtl_sdr` (stdout=IQ) -> `Channelizer` -> N * (`AudioTee` -> `redsea`).
//!
//! No FIFOs, no shell pipes: every child is a plain `std::process::Command`
//! with piped stdio, exactly as the original `pipeline.py` does it.

use crate::audio::{AudioTee, Recorder};
use crate::config::Config;
use crate::dsp::{blackman_sinc_lpf, Channelizer, Station, StationDsp};
use crate::error::PipelineError;
use parking_lot::Mutex;
use regex::Regex;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar};
use std::time::Duration;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
const FORCE_KILL_GRACE: Duration = Duration::from_secs(2);
const CHANNELIZER_BLOCK_LEN: usize = 16_384;
const FILTER_TAPS: usize = 127;
const LPF_CUTOFF_HZ: f32 = 80_000.0;
const MAX_PARSE_ERRORS_LOGGED: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    NotStarted,
    Starting,
    Running,
    Stopped,
    Error,
}

/// Thread-safe pipeline health status, mirroring the web-exposed
/// `PipelineStatus` of the original `pipeline.py`.
#[derive(Default)]
pub struct PipelineStatus {
    inner: Mutex<PipelineStatusInner>,
}

#[derive(Default)]
struct PipelineStatusInner {
    state: Option<PipelineState>,
    error_message: Option<String>,
    rtl_pid: Option<u32>,
    redsea_pid: Option<u32>,
    started_at: Option<String>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct PipelineStatusSnapshot {
    pub state: &'static str,
    pub error: Option<String>,
    pub rtl_pid: Option<u32>,
    pub redsea_pid: Option<u32>,
    pub started_at: Option<String>,
}

impl PipelineStatus {
    pub fn new() -> Self {
        PipelineStatus { inner: Mutex::new(PipelineStatusInner::default()) }
    }

    pub fn set_starting(&self) {
        let mut s = self.inner.lock();
        s.state = Some(PipelineState::Starting);
        s.error_message = None;
    }

    pub fn set_running(&self, rtl_pid: u32, redsea_pid: u32) {
        let mut s = self.inner.lock();
        s.state = Some(PipelineState::Running);
        s.error_message = None;
        s.rtl_pid = Some(rtl_pid);
        s.redsea_pid = Some(redsea_pid);
        s.started_at = Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string());
    }

    pub fn set_stopped(&self, message: Option<String>) {
        let mut s = self.inner.lock();
        s.state = Some(PipelineState::Stopped);
        s.error_message = message;
        s.rtl_pid = None;
        s.redsea_pid = None;
    }

    pub fn set_error(&self, message: String) {
        let mut s = self.inner.lock();
        s.state = Some(PipelineState::Error);
        s.error_message = Some(message);
        s.rtl_pid = None;
        s.redsea_pid = None;
    }

    pub fn snapshot(&self) -> PipelineStatusSnapshot {
        let s = self.inner.lock();
        let state = match s.state {
            None | Some(PipelineState::NotStarted) => "not_started",
            Some(PipelineState::Starting) => "starting",
            Some(PipelineState::Running) => "running",
            Some(PipelineState::Stopped) => "stopped",
            Some(PipelineState::Error) => "error",
        };
        PipelineStatusSnapshot {
            state,
            error: s.error_message.clone(),
            rtl_pid: s.rtl_pid,
            redsea_pid: s.redsea_pid,
            started_at: s.started_at.clone(),
        }
    }
}

/// A `threading.Event`-equivalent: every worker loop checks this at its
/// natural suspension point, matching the concurrency model's
/// cooperative-cancellation design.
#[derive(Default)]
pub struct StopSignal {
    flag: AtomicBool,
    condvar: Condvar,
    mutex: Mutex<()>,
}

impl StopSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(StopSignal::default())
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Blocks the calling thread until `set()` is called.
    pub fn wait(&self) {
        if self.is_set() {
            return;
        }
        let mut guard = self.mutex.lock();
        while !self.is_set() {
            self.condvar.wait(&mut guard);
        }
    }
}

fn build_rtl_fm_cmd(config: &Config, device_index: &str) -> Vec<String> {
    vec![
        "-M".into(), "fm".into(),
        "-l".into(), "0".into(),
        "-A".into(), "std".into(),
        "-p".into(), config.ppm_correction.to_string(),
        "-s".into(), "171k".into(),
        "-g".into(), config.rtl_gain.clone(),
        "-F".into(), "9".into(),
        "-d".into(), device_index.to_string(),
        "-f".into(), config.fm_frequencies[0].clone(),
    ]
}

fn build_rtl_sdr_cmd(config: &Config, center_freq_hz: u64, device_index: &str) -> Vec<String> {
    vec![
        "-f".into(), center_freq_hz.to_string(),
        "-s".into(), crate::config::RTL_SAMPLE_RATE_HZ.to_string(),
        "-g".into(), config.rtl_gain.clone(),
        "-p".into(), config.ppm_correction.to_string(),
        "-d".into(), device_index.to_string(),
        "-".into(),
    ]
}

fn build_redsea_cmd(config: &Config) -> Vec<String> {
    let mut cmd = vec!["-r".to_string(), "171k".to_string(), "-t".to_string(), "%Y-%m-%dT%H:%M:%S%f".to_string()];
    if config.redsea_show_partial {
        cmd.push("-p".to_string());
    }
    if config.redsea_show_raw {
        cmd.push("-R".to_string());
    }
    cmd.push("-E".to_string());
    cmd
}

/// Resolves `RTL_DEVICE_SERIAL` to a device index by shelling out to
/// `rtl_test` and matching its `"  N:  Vendor, Model, SN: <serial>"` banner.
/// Falls back to the configured numeric index on any failure: not found,
/// spawn failure, timeout, or no match.
fn resolve_device_serial(config: &Config) -> String {
    let Some(serial) = &config.rtl_device_serial else {
        return config.rtl_device_index.to_string();
    };

    tracing::info!(serial, "resolving RTL-SDR serial to device index");

    let output = match run_with_timeout("rtl_test", &[], Duration::from_secs(10)) {
        Ok(out) => out,
        Err(e) => {
            tracing::error!(error = %e, "rtl_test failed, falling back to configured device index");
            return config.rtl_device_index.to_string();
        }
    };

    let pattern = format!(r"(?im)^\s*(\d+):.*SN:\s*{}", regex::escape(serial));
    match Regex::new(&pattern).ok().and_then(|re| re.captures(&output)) {
        Some(caps) => {
            let index = caps[1].to_string();
            tracing::info!(serial, device_index = %index, "resolved RTL-SDR serial");
            index
        }
        None => {
            tracing::error!(serial, output = %output.trim(), "no RTL-SDR device found with that serial");
            config.rtl_device_index.to_string()
        }
    }
}

/// Runs a short-lived command to completion, combining stdout+stderr, or
/// returns an error if it does not exit within `timeout`.
fn run_with_timeout(binary: &str, args: &[&str], timeout: Duration) -> Result<String, PipelineError> {
    let mut child = Command::new(binary)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PipelineError::SpawnFailed { binary: binary.to_string(), source: e })?;

    let deadline = std::time::Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(PipelineError::DeviceResolution(format!("{binary} timed out")));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(PipelineError::SpawnFailed { binary: binary.to_string(), source: e }),
        }
    }

    let mut combined = String::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_string(&mut combined);
    }
    if let Some(mut err) = child.stderr.take() {
        let mut stderr_buf = String::new();
        let _ = err.read_to_string(&mut stderr_buf);
        combined.push_str(&stderr_buf);
    }
    Ok(combined)
}

/// Reads a child's stderr line by line and logs each one under `prefix`,
/// exiting cleanly when the stream closes.
fn spawn_stderr_reader(stream: impl Read + Send + 'static, prefix: &'static str) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("{prefix}-stderr"))
        .spawn(move || {
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                match line {
                    Ok(text) if !text.is_empty() => tracing::info!(source = prefix, "{text}"),
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        })
        .expect("failed to spawn stderr reader thread")
}

/// Terminates a child gracefully (SIGTERM-equivalent via `Child::kill`
/// preceded by a wait window), force-killing if it hasn't exited within
/// `SHUTDOWN_GRACE`. `std::process::Child` has no portable SIGTERM, so the
/// "graceful" step here is a best-effort `kill()` followed by the same
/// bounded wait-then-force sequence as the original's SIGTERM/SIGKILL pair.
fn terminate_process(child: &mut Child, name: &str) {
    match child.try_wait() {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(error = %e, name, "error polling child before terminate");
            return;
        }
    }

    tracing::info!(name, pid = child.id(), "terminating child process");
    if let Err(e) = child.kill() {
        tracing::warn!(error = %e, name, "failed to signal child");
        return;
    }

    let deadline = std::time::Instant::now() + SHUTDOWN_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => return,
        }
    }

    tracing::warn!(name, "child did not exit in time, forcing kill");
    let _ = child.kill();
    let force_deadline = std::time::Instant::now() + FORCE_KILL_GRACE;
    while std::time::Instant::now() < force_deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Reads redsea's ndjson stdout line by line, parsing each into a
/// `DecodedGroup` and invoking `on_line`. Malformed lines are counted: the
/// first `MAX_PARSE_ERRORS_LOGGED` are logged individually, the next one
/// logs a suppression notice, and the rest are silently dropped.
fn read_redsea_output(
    stdout: impl Read,
    stop: &StopSignal,
    mut on_line: impl FnMut(crate::rules::types::DecodedGroup),
) {
    let mut error_count = 0u32;
    let reader = BufReader::new(stdout);
    for line in reader.lines() {
        if stop.is_set() {
            break;
        }
        let Ok(text) = line else { break };
        if text.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&text) {
            Ok(group) => on_line(group),
            Err(e) => {
                error_count += 1;
                if error_count <= MAX_PARSE_ERRORS_LOGGED {
                    tracing::warn!(error = %e, line = %text, "failed to parse redsea output line");
                } else if error_count == MAX_PARSE_ERRORS_LOGGED + 1 {
                    tracing::warn!("suppressing further redsea parse-error logs this run");
                }
            }
        }
    }
}

/// One station's worth of wiring for the multi-station path: its display
/// frequency, its channelizer offset in Hz, and its `Recorder`.
pub struct StationConfig {
    pub frequency: String,
    pub freq_hz: u64,
    pub recorder: Option<Arc<Recorder>>,
}

/// Single-station pipeline: `rtl_fm` -> `AudioTee` -> `redsea`. Blocks the
/// calling thread until the subprocesses exit or `stop` is set. Does not
/// auto-restart; the caller's process supervisor (e.g. Docker) handles that.
pub fn run_single_station(
    config: &Config,
    recorder: Option<Arc<Recorder>>,
    status: &PipelineStatus,
    stop: &StopSignal,
    on_line: impl FnMut(crate::rules::types::DecodedGroup) + Send,
) {
    status.set_starting();

    let device_index = resolve_device_serial(config);
    let rtl_args = build_rtl_fm_cmd(config, &device_index);
    let redsea_args = build_redsea_cmd(config);

    tracing::info!(cmd = ?rtl_args, "starting rtl_fm");
    let rtl_proc = match Command::new("rtl_fm").args(&rtl_args).stdout(Stdio::piped()).stderr(Stdio::piped()).spawn() {
        Ok(p) => p,
        Err(e) => {
            status.set_error(format!("failed to spawn rtl_fm: {e}"));
            return;
        }
    };
    let mut rtl_proc = rtl_proc;
    tracing::info!(pid = rtl_proc.id(), "rtl_fm started");

    tracing::info!(cmd = ?redsea_args, "starting redsea");
    let redsea_proc = match Command::new("redsea")
        .args(&redsea_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(p) => p,
        Err(e) => {
            status.set_error(format!("failed to spawn redsea: {e}"));
            terminate_process(&mut rtl_proc, "rtl_fm");
            return;
        }
    };
    let mut redsea_proc = redsea_proc;
    tracing::info!(pid = redsea_proc.id(), "redsea started");

    let rtl_stderr = rtl_proc.stderr.take();
    let redsea_stderr = redsea_proc.stderr.take();
    if let Some(s) = rtl_stderr {
        spawn_stderr_reader(s, "rtl_fm");
    }
    if let Some(s) = redsea_stderr {
        spawn_stderr_reader(s, "redsea");
    }

    status.set_running(rtl_proc.id(), redsea_proc.id());
    tracing::info!("pipeline running, reading RDS data");

    let rtl_stdout = rtl_proc.stdout.take().expect("rtl_fm stdout was piped");
    let redsea_stdin = redsea_proc.stdin.take().expect("redsea stdin was piped");
    let redsea_stdout = redsea_proc.stdout.take().expect("redsea stdout was piped");

    // The reader thread exits on EOF once the watchdog below kills redsea;
    // `stop` is still threaded through so a malformed-line run also notices
    // a shutdown mid-stream rather than draining every buffered line first.
    std::thread::scope(|scope| {
        scope.spawn(|| {
            stop.wait();
            tracing::info!("shutdown requested, terminating pipeline subprocesses");
            terminate_process(&mut rtl_proc, "rtl_fm");
            terminate_process(&mut redsea_proc, "redsea");
        });

        let reader_handle = scope.spawn(|| read_redsea_output(redsea_stdout, stop, on_line));

        let mut tee = AudioTee::new(rtl_stdout, redsea_stdin, recorder);
        tee.run();

        let _ = reader_handle.join();
    });

    status.set_stopped(if stop.is_set() { Some("shutdown requested".to_string()) } else { Some("pipeline ended".to_string()) });
}

/// Multi-station pipeline: `rtl_sdr` -> `Channelizer` -> N * (`AudioTee` ->
/// `redsea`). Blocks the calling thread until `rtl_sdr` exits or `stop` is set.
pub fn run_multi_station(
    config: &Config,
    stations: Vec<StationConfig>,
    status: &PipelineStatus,
    stop: &StopSignal,
    on_lines: Vec<Box<dyn FnMut(crate::rules::types::DecodedGroup) + Send>>,
) {
    status.set_starting();

    let device_index = resolve_device_serial(config);
    let rtl_args = build_rtl_sdr_cmd(config, config.rtl_center_freq_hz, &device_index);
    let redsea_args = build_redsea_cmd(config);

    tracing::info!(cmd = ?rtl_args, stations = stations.len(), "starting rtl_sdr");
    let mut rtl_proc = match Command::new("rtl_sdr").args(&rtl_args).stdout(Stdio::piped()).stderr(Stdio::piped()).spawn() {
        Ok(p) => p,
        Err(e) => {
            status.set_error(format!("failed to spawn rtl_sdr: {e}"));
            return;
        }
    };
    tracing::info!(pid = rtl_proc.id(), "rtl_sdr started");

    if let Some(s) = rtl_proc.stderr.take() {
        spawn_stderr_reader(s, "rtl_sdr");
    }

    let rtl_stdout = rtl_proc.stdout.take().expect("rtl_sdr stdout was piped");

    let taps = blackman_sinc_lpf(LPF_CUTOFF_HZ / crate::config::RTL_SAMPLE_RATE_HZ as f32, FILTER_TAPS);

    let mut redsea_procs = Vec::with_capacity(stations.len());
    let mut channelizer_stations = Vec::with_capacity(stations.len());
    let mut tee_threads = Vec::with_capacity(stations.len());
    let mut reader_threads = Vec::with_capacity(stations.len());

    for (i, (sc, mut on_line)) in stations.into_iter().zip(on_lines.into_iter()).enumerate() {
        let mut redsea_proc = match Command::new("redsea")
            .args(&redsea_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(p) => p,
            Err(e) => {
                status.set_error(format!("failed to spawn redsea[{i}]: {e}"));
                terminate_process(&mut rtl_proc, "rtl_sdr");
                for rp in &mut redsea_procs {
                    terminate_process(rp, "redsea");
                }
                return;
            }
        };
        tracing::info!(pid = redsea_proc.id(), station = %sc.frequency, "redsea started");

        if let Some(s) = redsea_proc.stderr.take() {
            let prefix: &'static str = Box::leak(format!("redsea[{}]", sc.frequency).into_boxed_str());
            spawn_stderr_reader(s, prefix);
        }

        let (pipe_read, pipe_write) = os_pipe::pipe().expect("failed to create station pipe");
        let offset_hz = sc.freq_hz as f32 - config.rtl_center_freq_hz as f32;
        channelizer_stations.push(Station {
            dsp: StationDsp::new(offset_hz, crate::config::RTL_SAMPLE_RATE_HZ as f32, &taps, CHANNELIZER_BLOCK_LEN, crate::config::DECIMATION),
            sink: Box::new(pipe_write),
        });

        let redsea_stdin = redsea_proc.stdin.take().expect("redsea stdin was piped");
        let redsea_stdout = redsea_proc.stdout.take().expect("redsea stdout was piped");
        let recorder = sc.recorder.clone();

        let tee_handle = std::thread::Builder::new()
            .name(format!("tee-{}", sc.frequency))
            .spawn(move || {
                let mut tee = AudioTee::new(pipe_read, redsea_stdin, recorder);
                tee.run();
            })
            .expect("failed to spawn audio tee thread");
        tee_threads.push(tee_handle);

        let reader_handle = std::thread::Builder::new()
            .name(format!("redsea-reader-{}", sc.frequency))
            .spawn(move || {
                let reader = BufReader::new(redsea_stdout);
                let mut error_count = 0u32;
                for line in reader.lines() {
                    let Ok(text) = line else { break };
                    if text.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str(&text) {
                        Ok(group) => on_line(group),
                        Err(e) => {
                            error_count += 1;
                            if error_count <= MAX_PARSE_ERRORS_LOGGED {
                                tracing::warn!(error = %e, line = %text, "failed to parse redsea output line");
                            } else if error_count == MAX_PARSE_ERRORS_LOGGED + 1 {
                                tracing::warn!("suppressing further redsea parse-error logs this run");
                            }
                        }
                    }
                }
            })
            .expect("failed to spawn redsea reader thread");
        reader_threads.push(reader_handle);

        redsea_procs.push(redsea_proc);
    }

    let redsea_pid0 = redsea_procs.first().map(|p| p.id());
    status.set_running(rtl_proc.id(), redsea_pid0.unwrap_or(0));
    tracing::info!(stations = redsea_procs.len(), "multi-station pipeline running");

    let channelizer_stop = Arc::new(AtomicBool::new(false));
    let mut channelizer = Channelizer::new(rtl_stdout, channelizer_stations, CHANNELIZER_BLOCK_LEN, channelizer_stop.clone());

    std::thread::scope(|scope| {
        scope.spawn(|| {
            stop.wait();
            tracing::info!("shutdown requested, terminating multi-station pipeline");
            channelizer_stop.store(true, Ordering::SeqCst);
            terminate_process(&mut rtl_proc, "rtl_sdr");
            for rp in &mut redsea_procs {
                terminate_process(rp, "redsea");
            }
        });

        channelizer.run();
        let _ = rtl_proc.wait();

        for t in tee_threads {
            let _ = t.join();
        }
        for t in reader_threads {
            let _ = t.join();
        }
    });

    status.set_stopped(if stop.is_set() { Some("shutdown requested".to_string()) } else { Some("pipeline ended".to_string()) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_config() -> Config {
        Config::from_env(&HashMap::<&str, &str>::new()).unwrap()
    }

    #[test]
    fn rtl_fm_cmd_matches_documented_flag_order() {
        let cfg = test_config();
        let cmd = build_rtl_fm_cmd(&cfg, "0");
        assert_eq!(
            cmd,
            vec!["-M", "fm", "-l", "0", "-A", "std", "-p", "0", "-s", "171k", "-g", "8", "-F", "9", "-d", "0", "-f", "103.5M"]
        );
    }

    #[test]
    fn rtl_sdr_cmd_matches_documented_flag_order() {
        let cfg = test_config();
        let cmd = build_rtl_sdr_cmd(&cfg, 100_000_000, "0");
        assert_eq!(cmd, vec!["-f", "100000000", "-s", "2394000", "-g", "8", "-p", "0", "-d", "0", "-"]);
    }

    #[test]
    fn redsea_cmd_defaults_include_partial_but_not_raw() {
        let cfg = test_config();
        let cmd = build_redsea_cmd(&cfg);
        assert_eq!(cmd, vec!["-r", "171k", "-t", "%Y-%m-%dT%H:%M:%S%f", "-p", "-E"]);
    }

    #[test]
    fn device_serial_falls_back_to_index_when_not_configured() {
        let cfg = test_config();
        assert_eq!(resolve_device_serial(&cfg), "0");
    }

    #[test]
    fn stop_signal_wakes_a_waiting_thread() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            std::thread::spawn(move || stop.wait())
        };
        std::thread::sleep(Duration::from_millis(20));
        stop.set();
        waiter.join().unwrap();
    }
}
