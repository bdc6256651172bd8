use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app::adb::apk::parse_aapt_badging;
use crate::app::adb::argv::{encode_input_text, Toolchain};
use crate::app::adb::bugreport::{
    bugreport_argv, extract_zips, find_bugreport_texts, output_dir_name, sanitize_name,
};
use crate::app::adb::monkey::{launch_argv, monkey_argv, Watchdog};
use crate::app::adb::parse::{
    find_line, is_connected, is_disconnected, online_addresses, parse_adb_devices,
    parse_android_version, parse_current_focus, parse_getprop_map, parse_mac_address,
    parse_meminfo_value, parse_monkey_pid, parse_pm_list_packages, reports_success,
};
use crate::app::adb::runner::{CommandOutcome, CommandRunner};
use crate::app::clock::Clock;
use crate::app::config::{MonkeySettings, TimeoutSettings};
use crate::app::models::{
    ApkInstallErrorCode, CommandResult, CommandUnit, DeviceMetadata, MonkeyArgs, MonkeyReport,
    OperationArgs, OperationKind, ResultPayload, UNKNOWN,
};

const DEVICE_SCREENSHOT_PATH: &str = "/sdcard/screenshot.png";
const NOT_AVAILABLE: &str = "N/A";

/// Everything a worker needs to turn one unit into one result.
#[derive(Clone)]
pub struct OperationContext {
    pub runner: Arc<dyn CommandRunner>,
    pub clock: Arc<dyn Clock>,
    pub tools: Toolchain,
    pub timeouts: TimeoutSettings,
    pub monkey: MonkeySettings,
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

fn make_dir(path: &Path) -> Result<(), String> {
    fs::create_dir_all(path).map_err(|err| format!("Failed to create {}: {err}", path.display()))
}

impl OperationContext {
    fn run(&self, unit: &CommandUnit, argv: &[String], timeout: Duration) -> CommandOutcome {
        debug!(trace_id = %unit.trace_id, device = %unit.device, argv = ?argv, "running command");
        let outcome = self.runner.run(argv, timeout);
        if !outcome.is_ok() {
            debug!(trace_id = %unit.trace_id, device = %unit.device, outcome = %outcome.describe(), "command failed");
        }
        outcome
    }

    /// Runs the unit's full step sequence. Every failure ends up inside the returned result.
    pub fn execute(&self, unit: &CommandUnit) -> CommandResult {
        let device = unit.device.as_str();
        let outcome: Result<ResultPayload, String> = match &unit.args {
            OperationArgs::Connect => self.connect(unit, device),
            OperationArgs::Disconnect => self.disconnect(unit, device),
            OperationArgs::RefreshDevices => self.refresh_devices(unit),
            OperationArgs::RestartDevice => self.restart_device(unit, device),
            OperationArgs::RestartAdb => self.restart_adb(unit),
            OperationArgs::FetchBasicInfo => self.basic_info(unit, device),
            OperationArgs::FetchFullInfo => self.full_info(unit, device),
            OperationArgs::Screenshot { save_path } => self.screenshot(unit, device, save_path),
            OperationArgs::SaveLogcat { save_path } => self.save_logcat(unit, device, save_path),
            OperationArgs::ClearLogcat => self.simple(unit, self.tools.adb_device(device, &["logcat", "-c"]), self.timeouts.default_secs),
            OperationArgs::InputText { text } => {
                let encoded = encode_input_text(text);
                self.simple(unit, self.tools.shell(device, &["input", "text", &encoded]), self.timeouts.default_secs)
            }
            OperationArgs::CurrentPackage => self.current_package(unit, device),
            OperationArgs::CurrentActivity => self.current_activity(unit, device),
            OperationArgs::InstallApk { apk_path, .. } => self.install(unit, device, apk_path),
            OperationArgs::UninstallApp { package } => self.expect_success(
                unit,
                self.tools.adb_device(device, &["uninstall", package]),
            ),
            OperationArgs::ClearAppData { package } => {
                self.expect_success(unit, self.tools.shell(device, &["pm", "clear", package]))
            }
            OperationArgs::RestartApp { package } => self.restart_app(unit, device, package),
            OperationArgs::ParseApk { apk_path } => self.parse_apk(unit, apk_path),
            OperationArgs::ListPackages => self.list_packages(unit, device),
            OperationArgs::KillMonkey => self.kill_monkey(unit, device),
            OperationArgs::MonkeyTest(args) => self.monkey_test(unit, device, args),
            OperationArgs::Bugreport { save_root } => self.bugreport(unit, device, save_root),
            OperationArgs::PullAnr { save_dir } => self.pull_anr(unit, device, save_dir),
            OperationArgs::Shell { args } => {
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                self.simple(unit, self.tools.adb_device(device, &args), self.timeouts.default_secs)
            }
        };
        match outcome {
            Ok(payload) => CommandResult::success(unit, payload),
            Err(message) => CommandResult::failure(unit, message),
        }
    }

    fn simple(&self, unit: &CommandUnit, argv: Vec<String>, timeout_secs: u64) -> Result<ResultPayload, String> {
        match self.run(unit, &argv, secs(timeout_secs)) {
            CommandOutcome::Ok { stdout } => Ok(ResultPayload::Output(stdout.trim().to_string())),
            other => Err(other.describe()),
        }
    }

    /// For `pm`-style commands that print `Success` on stdout.
    fn expect_success(&self, unit: &CommandUnit, argv: Vec<String>) -> Result<ResultPayload, String> {
        let outcome = self.run(unit, &argv, secs(self.timeouts.package_secs));
        let text = outcome.text();
        if outcome.is_ok() && reports_success(&text) {
            Ok(ResultPayload::Output(text))
        } else if outcome.is_ok() {
            Err(if text.is_empty() { "No Success reported".to_string() } else { text })
        } else {
            Err(outcome.describe())
        }
    }

    fn connect(&self, unit: &CommandUnit, device: &str) -> Result<ResultPayload, String> {
        let outcome = self.run(unit, &self.tools.adb(&["connect", device]), secs(self.timeouts.connect_secs));
        let text = outcome.text();
        match outcome.stdout() {
            Some(stdout) if is_connected(stdout) => Ok(ResultPayload::Output(text)),
            Some(_) => Err(text),
            None => Err(outcome.describe()),
        }
    }

    fn disconnect(&self, unit: &CommandUnit, device: &str) -> Result<ResultPayload, String> {
        let outcome = self.run(unit, &self.tools.adb(&["disconnect", device]), secs(self.timeouts.connect_secs));
        let text = outcome.text();
        match outcome.stdout() {
            Some(stdout) if is_disconnected(stdout) => Ok(ResultPayload::Output(text)),
            Some(_) => Err(text),
            None => Err(outcome.describe()),
        }
    }

    fn refresh_devices(&self, unit: &CommandUnit) -> Result<ResultPayload, String> {
        match self.run(unit, &self.tools.adb(&["devices"]), secs(self.timeouts.default_secs)) {
            CommandOutcome::Ok { stdout } => {
                Ok(ResultPayload::Devices(online_addresses(&parse_adb_devices(&stdout))))
            }
            other => Err(other.describe()),
        }
    }

    fn restart_device(&self, unit: &CommandUnit, device: &str) -> Result<ResultPayload, String> {
        let state = self.run(
            unit,
            &self.tools.adb_device(device, &["get-state"]),
            secs(self.timeouts.state_probe_secs),
        );
        match state.stdout().map(str::trim) {
            Some("device") => {}
            Some(other) => return Err(format!("Device not ready: {other}")),
            None => return Err(state.describe()),
        }
        // `adb reboot` often never returns before the transport drops.
        match self.run(unit, &self.tools.adb_device(device, &["reboot"]), secs(self.timeouts.reboot_secs)) {
            CommandOutcome::Ok { .. } | CommandOutcome::Timeout { .. } => Ok(ResultPayload::Restarting),
            other => Err(other.describe()),
        }
    }

    fn restart_adb(&self, unit: &CommandUnit) -> Result<ResultPayload, String> {
        let timeout = secs(self.timeouts.adb_server_secs);
        let kill = self.run(unit, &self.tools.adb(&["kill-server"]), timeout);
        if !kill.is_ok() {
            warn!(trace_id = %unit.trace_id, error = %kill.describe(), "kill-server failed");
        }
        self.clock.sleep(Duration::from_secs(1));
        match self.run(unit, &self.tools.adb(&["start-server"]), timeout) {
            CommandOutcome::Ok { .. } => Ok(ResultPayload::Output("adb server restarted".to_string())),
            other => Err(other.describe()),
        }
    }

    fn getprop(&self, unit: &CommandUnit, device: &str, key: &str) -> Result<String, String> {
        let outcome = self.run(
            unit,
            &self.tools.shell(device, &["getprop", key]),
            secs(self.timeouts.device_info_secs),
        );
        match outcome.stdout() {
            Some(value) => Ok(value.trim().to_string()),
            None => Err(outcome.describe()),
        }
    }

    fn basic_info(&self, unit: &CommandUnit, device: &str) -> Result<ResultPayload, String> {
        let mut first_error = None;
        let mut read_any = false;
        let mut read = |key: &str| match self.getprop(unit, device, key) {
            Ok(value) => {
                read_any = true;
                if value.is_empty() {
                    UNKNOWN.to_string()
                } else {
                    value
                }
            }
            Err(err) => {
                first_error.get_or_insert(err);
                UNKNOWN.to_string()
            }
        };
        let metadata = DeviceMetadata {
            model: read("ro.product.model"),
            brand: read("ro.product.brand"),
            os_version: read("ro.build.version.release"),
        };
        if read_any {
            Ok(ResultPayload::Info(metadata))
        } else {
            Err(first_error.unwrap_or_else(|| "No device properties readable".to_string()))
        }
    }

    fn full_info(&self, unit: &CommandUnit, device: &str) -> Result<ResultPayload, String> {
        let info_timeout = secs(self.timeouts.device_info_secs);
        let getprop = self.run(unit, &self.tools.shell(device, &["getprop"]), info_timeout);
        let Some(raw) = getprop.stdout() else {
            return Err(getprop.describe());
        };
        let props = parse_getprop_map(raw);
        if props.is_empty() {
            return Err("No device properties readable".to_string());
        }

        let mut info = BTreeMap::new();
        for (key, name) in [
            ("ro.product.model", "model"),
            ("ro.product.brand", "brand"),
            ("ro.build.version.release", "android_version"),
            ("ro.build.version.sdk", "sdk"),
            ("ro.serialno", "serial"),
            ("ro.product.cpu.abi", "abi"),
            ("ro.hardware", "hardware"),
            ("persist.sys.timezone", "timezone"),
        ] {
            let value = props
                .get(key)
                .filter(|value| !value.is_empty())
                .cloned()
                .unwrap_or_else(|| NOT_AVAILABLE.to_string());
            info.insert(name.to_string(), value);
        }

        let probe = |args: &[&str]| {
            self.run(unit, &self.tools.shell(device, args), info_timeout)
                .stdout()
                .map(str::to_string)
        };
        let storage = probe(&["df", "-h", "/data"])
            .and_then(|out| out.lines().last().map(|line| line.trim().to_string()));
        let meminfo = probe(&["cat", "/proc/meminfo"]);
        let size = probe(&["wm", "size"]).and_then(|out| {
            out.lines()
                .last()
                .and_then(|line| line.rsplit(':').next())
                .map(|value| value.trim().to_string())
        });
        let density = probe(&["wm", "density"]).and_then(|out| {
            out.lines()
                .last()
                .and_then(|line| line.rsplit(':').next())
                .map(|value| value.trim().to_string())
        });
        let mac = probe(&["ip", "addr", "show", "wlan0"]).and_then(|out| parse_mac_address(&out));

        let fallback = |value: Option<String>| value.unwrap_or_else(|| NOT_AVAILABLE.to_string());
        info.insert("storage_data".to_string(), fallback(storage));
        info.insert(
            "mem_total".to_string(),
            fallback(meminfo.as_deref().and_then(|out| parse_meminfo_value(out, "MemTotal"))),
        );
        info.insert(
            "mem_available".to_string(),
            fallback(meminfo.as_deref().and_then(|out| parse_meminfo_value(out, "MemAvailable"))),
        );
        info.insert("screen_size".to_string(), fallback(size));
        info.insert("screen_density".to_string(), fallback(density));
        info.insert("wlan_mac".to_string(), fallback(mac));
        Ok(ResultPayload::Properties(info))
    }

    fn screenshot(&self, unit: &CommandUnit, device: &str, save_path: &str) -> Result<ResultPayload, String> {
        let timeout = secs(self.timeouts.screenshot_secs);
        let capture = self.run(
            unit,
            &self.tools.shell(device, &["screencap", "-p", DEVICE_SCREENSHOT_PATH]),
            timeout,
        );
        if !capture.is_ok() {
            return Err(capture.describe());
        }
        let dir = PathBuf::from(save_path);
        make_dir(&dir)?;
        let target = dir.join(format!("{}.png", output_dir_name(device, OperationKind::Screenshot)));
        let target_str = target.to_string_lossy().to_string();
        let pull = self.run(
            unit,
            &self.tools.adb_device(device, &["pull", DEVICE_SCREENSHOT_PATH, &target_str]),
            timeout,
        );
        if !pull.is_ok() {
            return Err(pull.describe());
        }
        let cleanup = self.run(unit, &self.tools.shell(device, &["rm", DEVICE_SCREENSHOT_PATH]), timeout);
        if !cleanup.is_ok() {
            warn!(device, error = %cleanup.describe(), "failed to remove device screenshot");
        }
        Ok(ResultPayload::Saved { path: target_str })
    }

    fn save_logcat(&self, unit: &CommandUnit, device: &str, save_path: &str) -> Result<ResultPayload, String> {
        let outcome = self.run(
            unit,
            &self.tools.adb_device(device, &["logcat", "-d"]),
            secs(self.timeouts.logcat_dump_secs),
        );
        let CommandOutcome::Ok { stdout } = outcome else {
            return Err(outcome.describe());
        };
        let dir = PathBuf::from(save_path);
        make_dir(&dir)?;
        let target = dir.join(format!("{}.txt", output_dir_name(device, OperationKind::SaveLogcat)));
        fs::write(&target, stdout).map_err(|err| format!("Failed to write {}: {err}", target.display()))?;
        Ok(ResultPayload::Saved {
            path: target.to_string_lossy().to_string(),
        })
    }

    fn dumpsys_window(&self, unit: &CommandUnit, device: &str) -> CommandOutcome {
        self.run(
            unit,
            &self.tools.shell(device, &["dumpsys", "window"]),
            secs(self.timeouts.state_probe_secs),
        )
    }

    fn current_package(&self, unit: &CommandUnit, device: &str) -> Result<ResultPayload, String> {
        let outcome = self.dumpsys_window(unit, device);
        let Some(output) = outcome.stdout() else {
            return Err(outcome.describe());
        };
        let (package, activity) = parse_current_focus(output).map_err(|err| err.message())?;
        Ok(ResultPayload::Foreground { package, activity })
    }

    fn current_activity(&self, unit: &CommandUnit, device: &str) -> Result<ResultPayload, String> {
        let window = self.dumpsys_window(unit, device);
        let Some(window_out) = window.stdout() else {
            return Err(window.describe());
        };
        let activities = self.run(
            unit,
            &self.tools.shell(device, &["dumpsys", "activity", "activities"]),
            secs(self.timeouts.state_probe_secs),
        );
        let Some(activities_out) = activities.stdout() else {
            return Err(activities.describe());
        };
        Ok(ResultPayload::Activity {
            current_focus: find_line(window_out, "mCurrentFocus")
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            resumed_activity: find_line(activities_out, "mResumedActivity")
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        })
    }

    fn install(&self, unit: &CommandUnit, device: &str, apk_path: &str) -> Result<ResultPayload, String> {
        let outcome = self.run(
            unit,
            &self.tools.adb_device(device, &["install", "-r", apk_path]),
            secs(self.timeouts.install_secs),
        );
        match &outcome {
            CommandOutcome::Ok { stdout } => match ApkInstallErrorCode::from_output(stdout) {
                ApkInstallErrorCode::Success => Ok(ResultPayload::Output("Success".to_string())),
                code => Err(format!("{}: {}", code.code(), stdout.trim())),
            },
            CommandOutcome::ProcessError { stderr, .. } => {
                match ApkInstallErrorCode::from_output(stderr) {
                    ApkInstallErrorCode::Success | ApkInstallErrorCode::UnknownError => {
                        Err(outcome.describe())
                    }
                    code => Err(format!("{}: {}", code.code(), outcome.describe())),
                }
            }
            _ => Err(outcome.describe()),
        }
    }

    fn restart_app(&self, unit: &CommandUnit, device: &str, package: &str) -> Result<ResultPayload, String> {
        let timeout = secs(self.timeouts.default_secs);
        let stop = self.run(unit, &self.tools.shell(device, &["am", "force-stop", package]), timeout);
        if !stop.is_ok() {
            warn!(device, package, error = %stop.describe(), "force-stop failed");
        }
        match self.run(unit, &launch_argv(&self.tools, device, package), timeout) {
            CommandOutcome::Ok { .. } => Ok(ResultPayload::Output(format!("Restarted {package}"))),
            other => Err(other.describe()),
        }
    }

    fn parse_apk(&self, unit: &CommandUnit, apk_path: &str) -> Result<ResultPayload, String> {
        let outcome = self.run(unit, &self.tools.aapt_badging(apk_path), secs(self.timeouts.parse_apk_secs));
        let Some(output) = outcome.stdout() else {
            return Err(outcome.describe());
        };
        let info = parse_aapt_badging(apk_path, output);
        if info.package_name.is_none() {
            return Err(format!("Could not parse package name from: {apk_path}"));
        }
        Ok(ResultPayload::Apk(info))
    }

    fn list_packages(&self, unit: &CommandUnit, device: &str) -> Result<ResultPayload, String> {
        match self.run(
            unit,
            &self.tools.shell(device, &["pm", "list", "packages"]),
            secs(self.timeouts.package_secs),
        ) {
            CommandOutcome::Ok { stdout } => Ok(ResultPayload::Packages(parse_pm_list_packages(&stdout))),
            other => Err(other.describe()),
        }
    }

    fn kill_monkey(&self, unit: &CommandUnit, device: &str) -> Result<ResultPayload, String> {
        let timeout = secs(self.timeouts.state_probe_secs);
        let ps = self.run(unit, &self.tools.shell(device, &["ps", "-A"]), timeout);
        let Some(output) = ps.stdout() else {
            return Err(ps.describe());
        };
        let pid = parse_monkey_pid(output)
            .ok_or_else(|| "No monkey process is running on the device".to_string())?;
        match self.run(unit, &self.tools.shell(device, &["kill", &pid]), timeout) {
            CommandOutcome::Ok { .. } => Ok(ResultPayload::Output(format!("Monkey process (PID: {pid}) killed"))),
            other => Err(format!("Failed to kill monkey process (PID: {pid}): {}", other.describe())),
        }
    }

    fn monkey_test(&self, unit: &CommandUnit, device: &str, args: &MonkeyArgs) -> Result<ResultPayload, String> {
        let aux_timeout = secs(self.timeouts.monkey_aux_secs);
        let dir = Path::new(&args.save_dir).join(output_dir_name(device, OperationKind::MonkeyTest));
        make_dir(&dir)?;

        let clear = self.run(unit, &self.tools.adb_device(device, &["logcat", "-c"]), aux_timeout);
        if !clear.is_ok() {
            warn!(device, error = %clear.describe(), "logcat clear before monkey failed");
        }

        let logcat_path = dir.join("logcat.txt");
        let monkey_path = dir.join("monkey.txt");
        let mut logcat = self
            .runner
            .spawn_logged(&self.tools.adb_device(device, &["logcat", "-v", "time"]), &logcat_path)?;
        let argv = monkey_argv(
            &self.tools,
            device,
            &args.package,
            args.event_count,
            args.profile,
            self.monkey.seed,
        );
        let mut monkey = match self.runner.spawn_logged(&argv, &monkey_path) {
            Ok(process) => process,
            Err(err) => {
                logcat.terminate();
                return Err(err);
            }
        };
        info!(trace_id = %unit.trace_id, device, package = %args.package, "monkey started");

        let started = self.clock.now();
        let watchdog = Watchdog {
            runner: self.runner.as_ref(),
            clock: self.clock.as_ref(),
            tools: &self.tools,
            settings: &self.monkey,
            aux_timeout,
        };
        let report = watchdog.run(device, &args.package, monkey.as_mut());
        // Collector must never outlive the run, whichever way it ended.
        logcat.terminate();
        monkey.terminate();
        let report = report?;

        Ok(ResultPayload::Monkey(MonkeyReport {
            monkey_log: monkey_path.to_string_lossy().to_string(),
            logcat_log: logcat_path.to_string_lossy().to_string(),
            duration_secs: self.clock.now().saturating_duration_since(started).as_secs(),
            relaunches: report.relaunches,
            exit_code: report.exit_code,
        }))
    }

    fn bugreport(&self, unit: &CommandUnit, device: &str, save_root: &str) -> Result<ResultPayload, String> {
        let dir = Path::new(save_root).join(output_dir_name(device, OperationKind::Bugreport));
        make_dir(&dir)?;
        let major = self
            .getprop(unit, device, "ro.build.version.release")
            .ok()
            .and_then(|release| parse_android_version(&release))
            .map(|(major, _)| major);
        let argv = bugreport_argv(&self.tools, device, major, &dir);
        let outcome = self.run(unit, &argv, secs(self.timeouts.bugreport_secs));
        if !outcome.is_ok() {
            return Err(outcome.describe());
        }
        let extracted = extract_zips(&dir)?;
        debug!(device, files = extracted.len(), "bugreport archive extracted");

        for text in find_bugreport_texts(&dir) {
            let Some(convert) = self.tools.chkbugreport(&text.to_string_lossy()) else {
                break;
            };
            let converted = self.run(unit, &convert, secs(self.timeouts.bugreport_secs));
            if !converted.is_ok() {
                warn!(device, file = %text.display(), error = %converted.describe(), "bugreport html conversion failed");
            }
        }
        Ok(ResultPayload::Saved {
            path: dir.to_string_lossy().to_string(),
        })
    }

    fn pull_anr(&self, unit: &CommandUnit, device: &str, save_dir: &str) -> Result<ResultPayload, String> {
        let dir = Path::new(save_dir).join(format!("{}_anr", sanitize_name(device)));
        make_dir(&dir)?;
        let target = dir.to_string_lossy().to_string();
        match self.run(
            unit,
            &self.tools.adb_device(device, &["pull", "/data/anr", &target]),
            secs(self.timeouts.pull_anr_secs),
        ) {
            CommandOutcome::Ok { .. } => Ok(ResultPayload::Saved { path: target }),
            other => Err(other.describe()),
        }
    }
}
