use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Pseudo-device address used by host-scoped operations (device list, adb server, aapt).
pub const HOST_TARGET: &str = "host";

pub const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceMetadata {
    #[serde(default = "unknown")]
    pub model: String,
    #[serde(default = "unknown")]
    pub brand: String,
    #[serde(default = "unknown")]
    pub os_version: String,
}

fn unknown() -> String {
    UNKNOWN.to_string()
}

impl Default for DeviceMetadata {
    fn default() -> Self {
        Self {
            model: unknown(),
            brand: unknown(),
            os_version: unknown(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub address: String,
    pub metadata: DeviceMetadata,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    Disconnect,
    RefreshDevices,
    RestartDevice,
    RestartAdb,
    FetchBasicInfo,
    FetchFullInfo,
    Screenshot,
    SaveLogcat,
    ClearLogcat,
    InputText,
    CurrentPackage,
    CurrentActivity,
    InstallApk,
    UninstallApp,
    ClearAppData,
    RestartApp,
    ParseApk,
    ListPackages,
    KillMonkey,
    MonkeyTest,
    Bugreport,
    PullAnr,
    Shell,
}

impl OperationKind {
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::Connect => "connect",
            OperationKind::Disconnect => "disconnect",
            OperationKind::RefreshDevices => "device refresh",
            OperationKind::RestartDevice => "restart",
            OperationKind::RestartAdb => "adb restart",
            OperationKind::FetchBasicInfo => "basic info",
            OperationKind::FetchFullInfo => "device info",
            OperationKind::Screenshot => "screenshot",
            OperationKind::SaveLogcat => "logcat save",
            OperationKind::ClearLogcat => "logcat clear",
            OperationKind::InputText => "input text",
            OperationKind::CurrentPackage => "current package",
            OperationKind::CurrentActivity => "current activity",
            OperationKind::InstallApk => "install",
            OperationKind::UninstallApp => "uninstall",
            OperationKind::ClearAppData => "clear data",
            OperationKind::RestartApp => "app restart",
            OperationKind::ParseApk => "apk parse",
            OperationKind::ListPackages => "package list",
            OperationKind::KillMonkey => "monkey kill",
            OperationKind::MonkeyTest => "monkey test",
            OperationKind::Bugreport => "bugreport",
            OperationKind::PullAnr => "anr pull",
            OperationKind::Shell => "shell",
        }
    }

    /// Operations that act on the host rather than on one device.
    pub fn is_host_scoped(&self) -> bool {
        matches!(
            self,
            OperationKind::RefreshDevices | OperationKind::RestartAdb | OperationKind::ParseApk
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MonkeyProfile {
    Mobile,
    Tv,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonkeyArgs {
    pub package: String,
    pub event_count: u32,
    pub profile: MonkeyProfile,
    pub save_dir: String,
}

/// Per-unit arguments. Each variant belongs to exactly one [`OperationKind`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationArgs {
    Connect,
    Disconnect,
    RefreshDevices,
    RestartDevice,
    RestartAdb,
    FetchBasicInfo,
    FetchFullInfo,
    Screenshot { save_path: String },
    SaveLogcat { save_path: String },
    ClearLogcat,
    InputText { text: String },
    CurrentPackage,
    CurrentActivity,
    InstallApk { apk_path: String, apk_name: String },
    UninstallApp { package: String },
    ClearAppData { package: String },
    RestartApp { package: String },
    ParseApk { apk_path: String },
    ListPackages,
    KillMonkey,
    MonkeyTest(MonkeyArgs),
    Bugreport { save_root: String },
    PullAnr { save_dir: String },
    Shell { args: Vec<String> },
}

impl OperationArgs {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationArgs::Connect => OperationKind::Connect,
            OperationArgs::Disconnect => OperationKind::Disconnect,
            OperationArgs::RefreshDevices => OperationKind::RefreshDevices,
            OperationArgs::RestartDevice => OperationKind::RestartDevice,
            OperationArgs::RestartAdb => OperationKind::RestartAdb,
            OperationArgs::FetchBasicInfo => OperationKind::FetchBasicInfo,
            OperationArgs::FetchFullInfo => OperationKind::FetchFullInfo,
            OperationArgs::Screenshot { .. } => OperationKind::Screenshot,
            OperationArgs::SaveLogcat { .. } => OperationKind::SaveLogcat,
            OperationArgs::ClearLogcat => OperationKind::ClearLogcat,
            OperationArgs::InputText { .. } => OperationKind::InputText,
            OperationArgs::CurrentPackage => OperationKind::CurrentPackage,
            OperationArgs::CurrentActivity => OperationKind::CurrentActivity,
            OperationArgs::InstallApk { .. } => OperationKind::InstallApk,
            OperationArgs::UninstallApp { .. } => OperationKind::UninstallApp,
            OperationArgs::ClearAppData { .. } => OperationKind::ClearAppData,
            OperationArgs::RestartApp { .. } => OperationKind::RestartApp,
            OperationArgs::ParseApk { .. } => OperationKind::ParseApk,
            OperationArgs::ListPackages => OperationKind::ListPackages,
            OperationArgs::KillMonkey => OperationKind::KillMonkey,
            OperationArgs::MonkeyTest(_) => OperationKind::MonkeyTest,
            OperationArgs::Bugreport { .. } => OperationKind::Bugreport,
            OperationArgs::PullAnr { .. } => OperationKind::PullAnr,
            OperationArgs::Shell { .. } => OperationKind::Shell,
        }
    }

    /// Short human label used in progress messages (apk name, package, ...).
    pub fn subject(&self) -> Option<&str> {
        match self {
            OperationArgs::InstallApk { apk_name, .. } => Some(apk_name),
            OperationArgs::UninstallApp { package }
            | OperationArgs::ClearAppData { package }
            | OperationArgs::RestartApp { package } => Some(package),
            OperationArgs::MonkeyTest(args) => Some(&args.package),
            OperationArgs::InputText { text } => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandUnit {
    pub batch_id: BatchId,
    pub device: String,
    pub kind: OperationKind,
    /// 1-based position of `device` in the submitted sequence.
    pub index: usize,
    pub total: usize,
    pub args: OperationArgs,
    pub trace_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ApkInfo {
    pub path: String,
    pub package_name: Option<String>,
    pub version_code: Option<String>,
    pub version_name: Option<String>,
    pub min_sdk_version: Option<String>,
    pub target_sdk_version: Option<String>,
    pub launchable_activity: Option<String>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonkeyReport {
    pub monkey_log: String,
    pub logcat_log: String,
    pub duration_secs: u64,
    pub relaunches: u32,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResultPayload {
    Output(String),
    Error(String),
    Saved { path: String },
    Devices(Vec<String>),
    Info(DeviceMetadata),
    Properties(BTreeMap<String, String>),
    Foreground { package: String, activity: String },
    Activity { current_focus: String, resumed_activity: String },
    Packages(Vec<String>),
    Apk(ApkInfo),
    Restarting,
    Monkey(MonkeyReport),
}

impl ResultPayload {
    pub fn summary(&self) -> String {
        match self {
            ResultPayload::Output(text) | ResultPayload::Error(text) => text.clone(),
            ResultPayload::Saved { path } => path.clone(),
            ResultPayload::Devices(devices) if devices.is_empty() => "no devices".to_string(),
            ResultPayload::Devices(devices) => devices.join(", "),
            ResultPayload::Info(meta) => {
                format!("{} {} (Android {})", meta.brand, meta.model, meta.os_version)
            }
            ResultPayload::Properties(props) => format!("{} properties", props.len()),
            ResultPayload::Foreground { package, activity } => format!("{package}/{activity}"),
            ResultPayload::Activity {
                current_focus,
                resumed_activity,
            } => format!("{current_focus} | {resumed_activity}"),
            ResultPayload::Packages(packages) => format!("{} packages", packages.len()),
            ResultPayload::Apk(info) => info
                .package_name
                .clone()
                .unwrap_or_else(|| info.path.clone()),
            ResultPayload::Restarting => "restarting".to_string(),
            ResultPayload::Monkey(report) => report.monkey_log.clone(),
        }
    }
}

/// Outcome of one [`CommandUnit`]; produced exactly once per unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub batch_id: BatchId,
    pub device: String,
    pub kind: OperationKind,
    pub index: usize,
    pub success: bool,
    pub payload: ResultPayload,
    /// Apk name or package the unit acted on, for progress messages.
    #[serde(default)]
    pub subject: Option<String>,
}

impl CommandResult {
    pub fn success(unit: &CommandUnit, payload: ResultPayload) -> Self {
        Self::from_unit(unit, true, payload)
    }

    pub fn failure(unit: &CommandUnit, message: impl Into<String>) -> Self {
        Self::from_unit(unit, false, ResultPayload::Error(message.into()))
    }

    pub fn from_unit(unit: &CommandUnit, success: bool, payload: ResultPayload) -> Self {
        Self {
            batch_id: unit.batch_id,
            device: unit.device.clone(),
            kind: unit.kind,
            index: unit.index,
            success,
            payload,
            subject: unit.args.subject().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApkInstallErrorCode {
    Success,
    InstallFailedAlreadyExists,
    InstallFailedUpdateIncompatible,
    InstallFailedOlderSdk,
    InstallFailedVersionDowngrade,
    InstallFailedInsufficientStorage,
    InstallParseFailedNoCertificates,
    InstallFailedInvalidApk,
    InstallFailedNoMatchingAbis,
    InstallFailedTestOnly,
    UnknownError,
}

impl ApkInstallErrorCode {
    const FAILURES: [ApkInstallErrorCode; 9] = [
        ApkInstallErrorCode::InstallFailedAlreadyExists,
        ApkInstallErrorCode::InstallFailedUpdateIncompatible,
        ApkInstallErrorCode::InstallFailedOlderSdk,
        ApkInstallErrorCode::InstallFailedVersionDowngrade,
        ApkInstallErrorCode::InstallFailedInsufficientStorage,
        ApkInstallErrorCode::InstallParseFailedNoCertificates,
        ApkInstallErrorCode::InstallFailedInvalidApk,
        ApkInstallErrorCode::InstallFailedNoMatchingAbis,
        ApkInstallErrorCode::InstallFailedTestOnly,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            ApkInstallErrorCode::Success => "SUCCESS",
            ApkInstallErrorCode::InstallFailedAlreadyExists => "INSTALL_FAILED_ALREADY_EXISTS",
            ApkInstallErrorCode::InstallFailedUpdateIncompatible => {
                "INSTALL_FAILED_UPDATE_INCOMPATIBLE"
            }
            ApkInstallErrorCode::InstallFailedOlderSdk => "INSTALL_FAILED_OLDER_SDK",
            ApkInstallErrorCode::InstallFailedVersionDowngrade => {
                "INSTALL_FAILED_VERSION_DOWNGRADE"
            }
            ApkInstallErrorCode::InstallFailedInsufficientStorage => {
                "INSTALL_FAILED_INSUFFICIENT_STORAGE"
            }
            ApkInstallErrorCode::InstallParseFailedNoCertificates => {
                "INSTALL_PARSE_FAILED_NO_CERTIFICATES"
            }
            ApkInstallErrorCode::InstallFailedInvalidApk => "INSTALL_FAILED_INVALID_APK",
            ApkInstallErrorCode::InstallFailedNoMatchingAbis => "INSTALL_FAILED_NO_MATCHING_ABIS",
            ApkInstallErrorCode::InstallFailedTestOnly => "INSTALL_FAILED_TEST_ONLY",
            ApkInstallErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    pub fn from_output(output: &str) -> Self {
        let upper = output.to_uppercase();
        if let Some(code) = Self::FAILURES
            .into_iter()
            .find(|code| upper.contains(code.code()))
        {
            return code;
        }
        if upper.contains("SUCCESS") {
            return ApkInstallErrorCode::Success;
        }
        ApkInstallErrorCode::UnknownError
    }
}
