use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolSettings {
    pub worker_count: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { worker_count: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutSettings {
    pub default_secs: u64,
    pub connect_secs: u64,
    pub device_info_secs: u64,
    pub install_secs: u64,
    pub package_secs: u64,
    pub screenshot_secs: u64,
    pub logcat_dump_secs: u64,
    pub parse_apk_secs: u64,
    pub state_probe_secs: u64,
    pub reboot_secs: u64,
    pub adb_server_secs: u64,
    pub bugreport_secs: u64,
    pub pull_anr_secs: u64,
    pub monkey_aux_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            default_secs: 30,
            connect_secs: 10,
            device_info_secs: 10,
            install_secs: 120,
            package_secs: 30,
            screenshot_secs: 30,
            logcat_dump_secs: 60,
            parse_apk_secs: 15,
            state_probe_secs: 10,
            reboot_secs: 3,
            adb_server_secs: 5,
            bugreport_secs: 900,
            pull_anr_secs: 120,
            monkey_aux_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FollowUpSettings {
    pub restart_refresh_delay_secs: f64,
    pub adb_restart_refresh_delay_secs: f64,
}

impl Default for FollowUpSettings {
    fn default() -> Self {
        Self {
            restart_refresh_delay_secs: 10.0,
            adb_restart_refresh_delay_secs: 3.0,
        }
    }
}

impl FollowUpSettings {
    pub fn restart_refresh_delay(&self) -> Duration {
        Duration::from_secs_f64(self.restart_refresh_delay_secs)
    }

    pub fn adb_restart_refresh_delay(&self) -> Duration {
        Duration::from_secs_f64(self.adb_restart_refresh_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonkeySettings {
    pub poll_interval_secs: u64,
    pub relaunch_cooldown_secs: u64,
    pub seed: u64,
}

impl Default for MonkeySettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            relaunch_cooldown_secs: 30,
            seed: 12345,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolSettings {
    pub adb_path: String,
    pub aapt_path: String,
    pub java_path: String,
    pub chkbugreport_jar: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            aapt_path: "aapt".to_string(),
            java_path: "java".to_string(),
            chkbugreport_jar: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub follow_up: FollowUpSettings,
    #[serde(default)]
    pub monkey: MonkeySettings,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub registry_path: String,
    #[serde(default)]
    pub output_path: String,
    #[serde(default)]
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            timeouts: TimeoutSettings::default(),
            follow_up: FollowUpSettings::default(),
            monkey: MonkeySettings::default(),
            tools: ToolSettings::default(),
            registry_path: String::new(),
            output_path: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl AppConfig {
    pub fn resolved_registry_path(&self) -> PathBuf {
        if self.registry_path.trim().is_empty() {
            home_dir().join(".adb_fleet").join("devices.yaml")
        } else {
            PathBuf::from(self.registry_path.trim())
        }
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("ADB_FLEET_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    home_dir().join(".adb_fleet_config.json")
}

pub fn backup_config_path() -> PathBuf {
    home_dir().join(".adb_fleet_config.backup.json")
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    save_config_to_path(config, &config_path(), &backup_config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), ""))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

fn valid_delay(value: f64) -> bool {
    value.is_finite() && (0.0..=3600.0).contains(&value)
}

pub fn validate_config(mut config: AppConfig) -> AppConfig {
    let defaults = AppConfig::default();
    if !(1..=32).contains(&config.pool.worker_count) {
        config.pool.worker_count = defaults.pool.worker_count;
    }

    let timeouts = &mut config.timeouts;
    let default_timeouts = &defaults.timeouts;
    for (value, fallback) in [
        (&mut timeouts.default_secs, default_timeouts.default_secs),
        (&mut timeouts.connect_secs, default_timeouts.connect_secs),
        (&mut timeouts.device_info_secs, default_timeouts.device_info_secs),
        (&mut timeouts.install_secs, default_timeouts.install_secs),
        (&mut timeouts.package_secs, default_timeouts.package_secs),
        (&mut timeouts.screenshot_secs, default_timeouts.screenshot_secs),
        (&mut timeouts.logcat_dump_secs, default_timeouts.logcat_dump_secs),
        (&mut timeouts.parse_apk_secs, default_timeouts.parse_apk_secs),
        (&mut timeouts.state_probe_secs, default_timeouts.state_probe_secs),
        (&mut timeouts.reboot_secs, default_timeouts.reboot_secs),
        (&mut timeouts.adb_server_secs, default_timeouts.adb_server_secs),
        (&mut timeouts.bugreport_secs, default_timeouts.bugreport_secs),
        (&mut timeouts.pull_anr_secs, default_timeouts.pull_anr_secs),
        (&mut timeouts.monkey_aux_secs, default_timeouts.monkey_aux_secs),
    ] {
        if *value == 0 {
            *value = fallback;
        }
    }

    if !valid_delay(config.follow_up.restart_refresh_delay_secs) {
        config.follow_up.restart_refresh_delay_secs =
            defaults.follow_up.restart_refresh_delay_secs;
    }
    if !valid_delay(config.follow_up.adb_restart_refresh_delay_secs) {
        config.follow_up.adb_restart_refresh_delay_secs =
            defaults.follow_up.adb_restart_refresh_delay_secs;
    }
    if config.monkey.poll_interval_secs == 0 {
        config.monkey.poll_interval_secs = defaults.monkey.poll_interval_secs;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"pool": {"worker_count": 8}, "timeouts": {"install_secs": 300}, "tools": {"adb_path": "/opt/adb"}}"#,
        )
        .expect("write");
        let config = load_config_from_path(&path).expect("load");
        assert_eq!(config.pool.worker_count, 8);
        assert_eq!(config.timeouts.install_secs, 300);
        assert_eq!(config.timeouts.connect_secs, 10);
        assert_eq!(config.tools.adb_path, "/opt/adb");
        assert_eq!(config.tools.aapt_path, "aapt");
        assert_eq!(config.follow_up.restart_refresh_delay_secs, 10.0);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().expect("tmp");
        let config = load_config_from_path(&dir.path().join("absent.json")).expect("load");
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = AppConfig::default();
        config.pool.worker_count = 0;
        config.timeouts.install_secs = 0;
        config.follow_up.restart_refresh_delay_secs = f64::NAN;
        config.follow_up.adb_restart_refresh_delay_secs = -1.0;
        config.monkey.poll_interval_secs = 0;
        let validated = validate_config(config);
        assert_eq!(validated.pool.worker_count, 4);
        assert_eq!(validated.timeouts.install_secs, 120);
        assert_eq!(validated.follow_up.restart_refresh_delay_secs, 10.0);
        assert_eq!(validated.follow_up.adb_restart_refresh_delay_secs, 3.0);
        assert_eq!(validated.monkey.poll_interval_secs, 15);
    }

    #[test]
    fn save_keeps_backup_of_previous_file() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("config.json");
        let backup = dir.path().join("config.backup.json");
        let mut config = AppConfig::default();
        save_config_to_path(&config, &path, &backup).expect("first save");
        config.pool.worker_count = 6;
        save_config_to_path(&config, &path, &backup).expect("second save");

        let previous = load_config_from_path(&backup).expect("backup");
        let current = load_config_from_path(&path).expect("current");
        assert_eq!(previous.pool.worker_count, 4);
        assert_eq!(current.pool.worker_count, 6);
    }

    #[test]
    fn registry_path_defaults_under_home() {
        let config = AppConfig::default();
        assert!(config
            .resolved_registry_path()
            .ends_with(Path::new(".adb_fleet").join("devices.yaml")));
        let custom = AppConfig {
            registry_path: "/tmp/fleet.yaml".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(custom.resolved_registry_path(), PathBuf::from("/tmp/fleet.yaml"));
    }
}
