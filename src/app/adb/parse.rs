use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::app::models::{DeviceMetadata, UNKNOWN};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub address: String,
    pub state: String,
    pub model: Option<String>,
}

pub fn parse_adb_devices(output: &str) -> Vec<DeviceEntry> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let model = tokens
                .iter()
                .skip(2)
                .find_map(|token| token.strip_prefix("model:"))
                .map(str::to_string);
            Some(DeviceEntry {
                address: tokens[0].to_string(),
                state: tokens[1].to_string(),
                model,
            })
        })
        .collect()
}

/// Addresses whose transport is fully online, in `adb devices` order.
pub fn online_addresses(entries: &[DeviceEntry]) -> Vec<String> {
    entries
        .iter()
        .filter(|entry| entry.state == "device")
        .map(|entry| entry.address.clone())
        .collect()
}

pub fn parse_getprop_map(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('[') {
            continue;
        }
        let Some((key_part, value_part)) = trimmed.split_once("]: [") else {
            continue;
        };
        let key = key_part.trim_start_matches('[').trim();
        let value = value_part.trim_end_matches(']').trim();
        if !key.is_empty() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

pub fn build_device_metadata(getprop_map: &HashMap<String, String>) -> DeviceMetadata {
    let pick = |key: &str| {
        getprop_map
            .get(key)
            .filter(|value| !value.is_empty())
            .cloned()
            .unwrap_or_else(|| UNKNOWN.to_string())
    };
    DeviceMetadata {
        model: pick("ro.product.model"),
        brand: pick("ro.product.brand"),
        os_version: pick("ro.build.version.release"),
    }
}

pub fn is_connected(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("connected") && !lower.contains("cannot") && !lower.contains("failed")
}

pub fn is_disconnected(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("disconnected") && !lower.contains("error")
}

/// `pm uninstall` / `pm clear` report their result as a bare `Success` line.
pub fn reports_success(output: &str) -> bool {
    output.lines().any(|line| line.trim() == "Success")
}

pub fn find_line(output: &str, needle: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains(needle))
        .map(|line| line.trim().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusError {
    Missing,
    Unparsable(String),
}

impl FocusError {
    pub fn message(&self) -> String {
        match self {
            FocusError::Missing => "No mCurrentFocus found".to_string(),
            FocusError::Unparsable(line) => format!("Could not parse package name from: {line}"),
        }
    }
}

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn focus_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"mCurrentFocus=Window\{.*?\s(\S+?)/(\S+)\}")
}

/// Package token directly in front of the `/` of a component name.
fn component_package_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"\s([A-Za-z0-9_.]+)/")
}

/// Extracts `(package, activity)` from `dumpsys window` output.
pub fn parse_current_focus(output: &str) -> Result<(String, String), FocusError> {
    let line = find_line(output, "mCurrentFocus").ok_or(FocusError::Missing)?;
    let caps = focus_re()
        .and_then(|re| re.captures(&line))
        .ok_or_else(|| FocusError::Unparsable(line.clone()))?;
    Ok((caps[1].to_string(), caps[2].to_string()))
}

/// Package currently in front. `mCurrentFocus` wins; `mFocusedApp` covers the moments
/// where focus is `null` during a transition.
pub fn parse_foreground_package(output: &str) -> Option<String> {
    let re = component_package_re()?;
    ["mCurrentFocus", "mFocusedApp"].iter().find_map(|needle| {
        let line = find_line(output, needle)?;
        re.captures(&line).map(|caps| caps[1].to_string())
    })
}

pub fn parse_pm_list_packages(output: &str) -> Vec<String> {
    let mut packages: Vec<String> = output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    packages.sort();
    packages.dedup();
    packages
}

/// PID of the on-device monkey runner from `ps -A` output.
pub fn parse_monkey_pid(ps_output: &str) -> Option<String> {
    ps_output
        .lines()
        .filter(|line| line.contains("com.android.commands.monkey"))
        .find_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            tokens
                .get(1)
                .filter(|pid| pid.chars().all(|c| c.is_ascii_digit()))
                .map(|pid| pid.to_string())
        })
}

pub fn parse_meminfo_value(output: &str, key: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim() == key {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

pub fn parse_mac_address(ip_output: &str) -> Option<String> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"link/ether\s+([0-9a-fA-F:]{17})")?
        .captures(ip_output)
        .map(|caps| caps[1].to_lowercase())
}

/// Major/minor from `ro.build.version.release` ("8.1.0", "14").
pub fn parse_android_version(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.trim().split('.');
    let major = parts.next()?.parse::<u32>().ok()?;
    let minor = parts
        .next()
        .map(|part| part.parse::<u32>().ok())
        .unwrap_or(Some(0))?;
    Some((major, minor))
}
