use std::path::PathBuf;

use regex::Regex;

use crate::app::models::ApkInfo;

pub fn normalize_apk_path(path: &str) -> PathBuf {
    let trimmed = path.trim();
    if let Some(rest) = trimmed.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(trimmed)
}

/// File name shown in install progress messages.
pub fn apk_display_name(path: &str) -> String {
    normalize_apk_path(path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

fn capture(output: &str, pattern: &str) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    re.captures(output)
        .and_then(|caps| caps.get(1))
        .map(|value| value.as_str().to_string())
        .filter(|value| !value.is_empty())
}

/// Parses `aapt dump badging` output. Missing fields stay `None`.
pub fn parse_aapt_badging(path: &str, output: &str) -> ApkInfo {
    ApkInfo {
        path: path.to_string(),
        package_name: capture(output, r"package: name='([^']*)'"),
        version_code: capture(output, r"versionCode='([^']*)'"),
        version_name: capture(output, r"versionName='([^']*)'"),
        min_sdk_version: capture(output, r"(?m)^sdkVersion:'([^']*)'"),
        target_sdk_version: capture(output, r"(?m)^targetSdkVersion:'([^']*)'"),
        launchable_activity: capture(output, r"launchable-activity: name='([^']*)'"),
        label: capture(output, r"(?m)^application-label:'([^']*)'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BADGING: &str = "package: name='com.example.app' versionCode='42' versionName='1.4.2' platformBuildVersionName='14'\n\
sdkVersion:'24'\n\
targetSdkVersion:'34'\n\
application-label:'Example'\n\
application-label-en:'Example'\n\
launchable-activity: name='com.example.app.MainActivity'  label='Example' icon=''\n";

    #[test]
    fn parses_badging_fields() {
        let info = parse_aapt_badging("/tmp/app.apk", BADGING);
        assert_eq!(info.package_name.as_deref(), Some("com.example.app"));
        assert_eq!(info.version_code.as_deref(), Some("42"));
        assert_eq!(info.version_name.as_deref(), Some("1.4.2"));
        assert_eq!(info.min_sdk_version.as_deref(), Some("24"));
        assert_eq!(info.target_sdk_version.as_deref(), Some("34"));
        assert_eq!(
            info.launchable_activity.as_deref(),
            Some("com.example.app.MainActivity")
        );
        assert_eq!(info.label.as_deref(), Some("Example"));
    }

    #[test]
    fn garbage_output_yields_no_package() {
        let info = parse_aapt_badging("/tmp/bad.apk", "ERROR: dump failed because no AndroidManifest.xml found");
        assert_eq!(info.package_name, None);
        assert_eq!(info.path, "/tmp/bad.apk");
    }

    #[test]
    fn display_name_is_file_name() {
        assert_eq!(apk_display_name("/builds/out/app-release.apk"), "app-release.apk");
        assert!(normalize_apk_path("~/app.apk").ends_with("app.apk"));
    }
}
