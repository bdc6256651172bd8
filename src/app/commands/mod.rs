use uuid::Uuid;

use crate::app::adb::apk::{apk_display_name, normalize_apk_path};
use crate::app::adb::locator::{resolve_program, validate_program};
use crate::app::error::AppError;
use crate::app::models::{BatchId, Device, MonkeyArgs, MonkeyProfile, OperationArgs, OperationKind};
use crate::app::state::AppState;


fn require_text(value: &str, what: &str, trace_id: &str) -> Result<String, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation(format!("{what} is required"), trace_id));
    }
    Ok(trimmed.to_string())
}

fn require_apk(path: &str, trace_id: &str) -> Result<String, AppError> {
    let path = require_text(path, "APK path", trace_id)?;
    let resolved = normalize_apk_path(&path);
    if !resolved.is_file() {
        return Err(AppError::validation(format!("APK not found: {path}"), trace_id));
    }
    Ok(resolved.to_string_lossy().to_string())
}

/// Typed entry points. Each validates its inputs and submits exactly one batch.
impl AppState {
    fn submit_same(&self, devices: &[String], args: OperationArgs) -> Result<BatchId, AppError> {
        let kind = args.kind();
        self.dispatcher().submit(devices, kind, move |_, _| args.clone())
    }

    fn submit_to_dir(
        &self,
        devices: &[String],
        save_dir: &str,
        make_args: impl Fn(String) -> OperationArgs,
    ) -> Result<BatchId, AppError> {
        let dir = self.output_dir(save_dir)?.to_string_lossy().to_string();
        self.submit_same(devices, make_args(dir))
    }

    /// Fails with `ERR_DEPENDENCY` when a configured tool path is unusable.
    pub fn check_tools(&self) -> Result<(), AppError> {
        let trace_id = Uuid::new_v4().to_string();
        let tools = &self.config().tools;
        validate_program(&resolve_program(&tools.adb_path, "adb"))
            .map_err(|err| AppError::dependency(format!("adb: {err}"), &trace_id))?;
        validate_program(&resolve_program(&tools.aapt_path, "aapt"))
            .map_err(|err| AppError::dependency(format!("aapt: {err}"), &trace_id))?;
        Ok(())
    }

    pub fn devices(&self) -> Vec<Device> {
        self.registry().all()
    }

    pub fn connect(&self, address: &str) -> Result<BatchId, AppError> {
        let trace_id = Uuid::new_v4().to_string();
        let address = require_text(address, "Device address", &trace_id)?;
        self.submit_same(&[address], OperationArgs::Connect)
    }

    /// The registry entry survives; use [`AppState::forget_device`] to drop it.
    pub fn disconnect(&self, devices: &[String]) -> Result<BatchId, AppError> {
        self.submit_same(devices, OperationArgs::Disconnect)
    }

    pub fn forget_device(&self, address: &str) -> Result<bool, AppError> {
        self.registry().remove(address.trim())
    }

    pub fn refresh_devices(&self) -> Result<BatchId, AppError> {
        self.dispatcher().submit_host(OperationArgs::RefreshDevices)
    }

    pub fn restart_devices(&self, devices: &[String]) -> Result<BatchId, AppError> {
        self.submit_same(devices, OperationArgs::RestartDevice)
    }

    pub fn restart_adb_server(&self) -> Result<BatchId, AppError> {
        self.dispatcher().submit_host(OperationArgs::RestartAdb)
    }

    pub fn fetch_basic_info(&self, devices: &[String]) -> Result<BatchId, AppError> {
        self.submit_same(devices, OperationArgs::FetchBasicInfo)
    }

    pub fn fetch_full_info(&self, devices: &[String]) -> Result<BatchId, AppError> {
        self.submit_same(devices, OperationArgs::FetchFullInfo)
    }

    pub fn take_screenshots(&self, devices: &[String], save_dir: &str) -> Result<BatchId, AppError> {
        self.submit_to_dir(devices, save_dir, |save_path| OperationArgs::Screenshot { save_path })
    }

    pub fn save_logcat(&self, devices: &[String], save_dir: &str) -> Result<BatchId, AppError> {
        self.submit_to_dir(devices, save_dir, |save_path| OperationArgs::SaveLogcat { save_path })
    }

    pub fn clear_logcat(&self, devices: &[String]) -> Result<BatchId, AppError> {
        self.submit_same(devices, OperationArgs::ClearLogcat)
    }

    pub fn input_text(&self, devices: &[String], text: &str) -> Result<BatchId, AppError> {
        let trace_id = Uuid::new_v4().to_string();
        if text.is_empty() {
            return Err(AppError::validation("Text is required", &trace_id));
        }
        self.submit_same(
            devices,
            OperationArgs::InputText {
                text: text.to_string(),
            },
        )
    }

    pub fn current_package(&self, devices: &[String]) -> Result<BatchId, AppError> {
        self.submit_same(devices, OperationArgs::CurrentPackage)
    }

    pub fn current_activity(&self, devices: &[String]) -> Result<BatchId, AppError> {
        self.submit_same(devices, OperationArgs::CurrentActivity)
    }

    pub fn install_apk(&self, devices: &[String], apk_path: &str) -> Result<BatchId, AppError> {
        let trace_id = Uuid::new_v4().to_string();
        let apk_path = require_apk(apk_path, &trace_id)?;
        let apk_name = apk_display_name(&apk_path);
        self.submit_same(devices, OperationArgs::InstallApk { apk_path, apk_name })
    }

    pub fn uninstall_app(&self, devices: &[String], package: &str) -> Result<BatchId, AppError> {
        let trace_id = Uuid::new_v4().to_string();
        let package = require_text(package, "Package name", &trace_id)?;
        self.submit_same(devices, OperationArgs::UninstallApp { package })
    }

    pub fn clear_app_data(&self, devices: &[String], package: &str) -> Result<BatchId, AppError> {
        let trace_id = Uuid::new_v4().to_string();
        let package = require_text(package, "Package name", &trace_id)?;
        self.submit_same(devices, OperationArgs::ClearAppData { package })
    }

    pub fn restart_app(&self, devices: &[String], package: &str) -> Result<BatchId, AppError> {
        let trace_id = Uuid::new_v4().to_string();
        let package = require_text(package, "Package name", &trace_id)?;
        self.submit_same(devices, OperationArgs::RestartApp { package })
    }

    pub fn parse_apk(&self, apk_path: &str) -> Result<BatchId, AppError> {
        let trace_id = Uuid::new_v4().to_string();
        let apk_path = require_apk(apk_path, &trace_id)?;
        self.dispatcher()
            .submit_host(OperationArgs::ParseApk { apk_path })
    }

    pub fn list_packages(&self, devices: &[String]) -> Result<BatchId, AppError> {
        self.submit_same(devices, OperationArgs::ListPackages)
    }

    pub fn kill_monkey(&self, devices: &[String]) -> Result<BatchId, AppError> {
        self.submit_same(devices, OperationArgs::KillMonkey)
    }

    pub fn run_monkey(
        &self,
        devices: &[String],
        package: &str,
        event_count: u32,
        profile: MonkeyProfile,
        save_dir: &str,
    ) -> Result<BatchId, AppError> {
        let trace_id = Uuid::new_v4().to_string();
        let package = require_text(package, "Package name", &trace_id)?;
        if event_count == 0 {
            return Err(AppError::validation("Event count must be positive", &trace_id));
        }
        self.submit_to_dir(devices, save_dir, |save_dir| {
            OperationArgs::MonkeyTest(MonkeyArgs {
                package: package.clone(),
                event_count,
                profile,
                save_dir,
            })
        })
    }

    pub fn capture_bugreport(&self, devices: &[String], save_dir: &str) -> Result<BatchId, AppError> {
        self.submit_to_dir(devices, save_dir, |save_root| OperationArgs::Bugreport { save_root })
    }

    pub fn pull_anr(&self, devices: &[String], save_dir: &str) -> Result<BatchId, AppError> {
        self.submit_to_dir(devices, save_dir, |save_dir| OperationArgs::PullAnr { save_dir })
    }

    /// Raw adb arguments, appended after `-s <device>`.
    pub fn run_shell(&self, devices: &[String], args: &[String]) -> Result<BatchId, AppError> {
        let trace_id = Uuid::new_v4().to_string();
        if args.iter().all(|arg| arg.trim().is_empty()) {
            return Err(AppError::validation("Command is required", &trace_id));
        }
        self.dispatcher()
            .submit(devices, OperationKind::Shell, |_, _| OperationArgs::Shell {
                args: args.to_vec(),
            })
    }

    pub fn shutdown(&self) {
        self.dispatcher().shutdown();
    }
}
