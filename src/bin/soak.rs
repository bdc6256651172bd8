use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use adb_fleet_lib::app::config::load_config;
use adb_fleet_lib::app::dispatch::Services;
use adb_fleet_lib::app::models::BatchId;
use adb_fleet_lib::app::notify::{channel_emitter, Notification};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Args {
    out_dir: Option<PathBuf>,
    duration_secs: u64,
    interval_ms: u64,
    json: bool,
}

#[derive(Serialize)]
struct SoakSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    out_dir: String,
    iterations: usize,
    failures: usize,
    warnings: usize,
    checks: Vec<SoakIteration>,
}

#[derive(Serialize)]
struct SoakIteration {
    index: usize,
    status: &'static str, // pass|fail|warn
    devices: usize,
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut out_dir: Option<PathBuf> = None;
    let mut duration_secs: u64 = 120;
    let mut interval_ms: u64 = 500;
    let mut json = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--out" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--out requires a value".to_string())?;
                out_dir = Some(PathBuf::from(value));
            }
            "--duration-secs" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--duration-secs requires a value".to_string())?;
                duration_secs = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| "--duration-secs must be a number".to_string())?;
            }
            "--interval-ms" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--interval-ms requires a value".to_string())?;
                interval_ms = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| "--interval-ms must be a number".to_string())?;
            }
            "--json" => json = true,
            "-h" | "--help" => {
                return Err("Usage: cargo run --bin soak -- [--out DIR] [--duration-secs N] [--interval-ms N] [--json]\n".to_string());
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }

    Ok(Args {
        out_dir,
        duration_secs: duration_secs.max(10),
        interval_ms: interval_ms.clamp(200, 5000),
        json,
    })
}

/// Drains notifications until `batch_id` completes. Returns what the batch emitted.
fn wait_for_batch(
    rx: &Receiver<Notification>,
    batch_id: BatchId,
    timeout: Duration,
) -> Result<Vec<Notification>, String> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(Notification::BatchCompleted(summary)) if summary.batch_id == batch_id => {
                seen.push(Notification::BatchCompleted(summary));
                return Ok(seen);
            }
            Ok(note) => seen.push(note),
            Err(RecvTimeoutError::Timeout) => {
                return Err(format!("batch {batch_id} did not complete in {}s", timeout.as_secs()))
            }
            Err(RecvTimeoutError::Disconnected) => return Err("engine stopped".to_string()),
        }
    }
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = Uuid::new_v4().to_string();
    let out_dir = args.out_dir.unwrap_or_else(|| {
        let mut p = std::env::temp_dir();
        p.push(format!("adb_fleet_soak_{trace_id}"));
        p
    });
    let _ = fs::create_dir_all(&out_dir);

    let config = match load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Failed to load config: {err}");
            std::process::exit(1);
        }
    };
    let batch_timeout = Duration::from_secs(config.timeouts.default_secs.max(1) * 2);
    let (emitter, rx) = channel_emitter();
    let app_state = match adb_fleet_lib::start(config, Services::system(emitter)) {
        Ok(state) => state,
        Err(err) => {
            eprintln!("Failed to start engine: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = app_state.check_tools() {
        eprintln!("{err}");
        std::process::exit(1);
    }

    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let mut iterations: Vec<SoakIteration> = Vec::new();
    let mut failures = 0usize;
    let mut warnings = 0usize;

    let mut index = 0usize;
    while Instant::now() < deadline {
        index += 1;
        let iter_start = Instant::now();
        let mut status = "pass";
        let mut error: Option<String> = None;
        let mut online: Vec<String> = Vec::new();

        // 1) refresh -> collect online devices
        match app_state
            .refresh_devices()
            .map_err(|err| err.to_string())
            .and_then(|batch| wait_for_batch(&rx, batch, batch_timeout))
        {
            Ok(seen) => {
                for note in seen {
                    if let Notification::DevicesUpdated(devices) = note {
                        online = devices;
                    }
                }
            }
            Err(err) => {
                status = "fail";
                error = Some(format!("refresh failed: {err}"));
            }
        }

        // 2) basic info fan-out across everything online
        if status == "pass" && online.is_empty() {
            status = "warn";
            warnings += 1;
            error = Some("no online devices".to_string());
        } else if status == "pass" {
            match app_state
                .fetch_basic_info(&online)
                .map_err(|err| err.to_string())
                .and_then(|batch| wait_for_batch(&rx, batch, batch_timeout))
            {
                Ok(seen) => {
                    let failed = seen
                        .iter()
                        .filter(|note| {
                            matches!(note, Notification::OperationResult(notice) if !notice.success)
                        })
                        .count();
                    if failed > 0 {
                        status = "warn";
                        warnings += 1;
                        error = Some(format!("basic info failed on {failed} device(s)"));
                    }
                }
                Err(err) => {
                    status = "fail";
                    error = Some(format!("basic info failed: {err}"));
                }
            }
        }

        if status == "fail" {
            failures += 1;
        }
        iterations.push(SoakIteration {
            index,
            status,
            devices: online.len(),
            duration_ms: iter_start.elapsed().as_millis(),
            error,
        });
        std::thread::sleep(Duration::from_millis(args.interval_ms));
    }
    app_state.shutdown();

    let details_path = out_dir.join("soak_iterations.json");
    let _ = fs::write(
        &details_path,
        serde_json::to_string_pretty(&iterations).unwrap_or_default(),
    );

    let overall = if failures > 0 { "fail" } else { "pass" };
    let summary = SoakSummary {
        tool: "adb_fleet_soak",
        status: overall,
        trace_id,
        out_dir: out_dir.to_string_lossy().to_string(),
        iterations: iterations.len(),
        failures,
        warnings,
        checks: iterations,
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).unwrap_or_default()
        );
    } else {
        println!(
            "status: {}\niterations: {}\nfailures: {}\nwarnings: {}\nout: {}\n",
            summary.status, summary.iterations, summary.failures, summary.warnings, summary.out_dir
        );
    }

    if overall != "pass" {
        std::process::exit(1);
    }
}
