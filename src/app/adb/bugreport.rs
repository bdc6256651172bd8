use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;
use zip::ZipArchive;

use crate::app::adb::argv::Toolchain;
use crate::app::models::OperationKind;

/// Replaces every non-word character so a device address is safe as a path segment.
pub fn sanitize_name(value: &str) -> String {
    match Regex::new(r"[^\w]") {
        Ok(re) => re.replace_all(value, "_").to_string(),
        Err(_) => value.to_string(),
    }
}

fn kind_slug(kind: OperationKind) -> String {
    kind.label().replace(' ', "_")
}

/// `<sanitized device>_<kind>_<HHMMSS>` in local time.
pub fn output_dir_name(device: &str, kind: OperationKind) -> String {
    format!(
        "{}_{}_{}",
        sanitize_name(device),
        kind_slug(kind),
        chrono::Local::now().format("%H%M%S")
    )
}

/// Android 8+ writes a zip into a directory; older releases stream text to one file.
pub fn bugreport_argv(
    tools: &Toolchain,
    device: &str,
    android_major: Option<u32>,
    target_dir: &Path,
) -> Vec<String> {
    let dir = target_dir.to_string_lossy().to_string();
    match android_major {
        Some(major) if major >= 8 => tools.adb_device(device, &["bugreport", &dir]),
        _ => {
            let file = target_dir
                .join(format!("bugreport_{}.txt", sanitize_name(device)))
                .to_string_lossy()
                .to_string();
            tools.adb_device(device, &["bugreport", &file])
        }
    }
}

/// Extracts every `*.zip` directly inside `dir` next to the archive.
pub fn extract_zips(dir: &Path) -> Result<Vec<PathBuf>, String> {
    let entries = fs::read_dir(dir).map_err(|err| format!("Failed to read {}: {err}", dir.display()))?;
    let mut extracted = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_zip = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);
        if !is_zip {
            continue;
        }
        let file = File::open(&path).map_err(|err| format!("Failed to open archive: {err}"))?;
        let mut archive = ZipArchive::new(file).map_err(|err| format!("Invalid archive: {err}"))?;
        for i in 0..archive.len() {
            let mut item = archive
                .by_index(i)
                .map_err(|err| format!("Failed to read archive: {err}"))?;
            let Some(relative) = item.enclosed_name() else {
                continue;
            };
            let target = dir.join(relative);
            if item.is_dir() {
                fs::create_dir_all(&target)
                    .map_err(|err| format!("Failed to create {}: {err}", target.display()))?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| format!("Failed to create {}: {err}", parent.display()))?;
            }
            let mut output = File::create(&target)
                .map_err(|err| format!("Failed to extract {}: {err}", target.display()))?;
            io::copy(&mut item, &mut output)
                .map_err(|err| format!("Failed to write {}: {err}", target.display()))?;
            extracted.push(target);
        }
    }
    Ok(extracted)
}

/// Recursively finds `bugreport*.txt` files under `dir`, sorted.
pub fn find_bugreport_texts(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("bugreport") && name.ends_with(".txt") {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}
