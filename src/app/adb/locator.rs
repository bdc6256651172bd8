use std::path::Path;

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

/// Configured tool path, or the bare program name to look up on PATH.
pub fn resolve_program(configured: &str, default_program: &str) -> String {
    let normalized = normalize_command_path(configured);
    if normalized.is_empty() {
        default_program.to_string()
    } else {
        normalized
    }
}

pub fn validate_program(program: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err("Tool command is empty".to_string());
    }
    let path = Path::new(program);
    if path.components().count() == 1 {
        // Bare name, resolved through PATH at spawn time.
        return Ok(());
    }
    if path.is_dir() {
        return Err(format!("{program} must point to an executable file"));
    }
    if !path.exists() {
        return Err(format!("Executable not found at {program}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_wrapping_quotes() {
        assert_eq!(
            normalize_command_path("  \"/opt/android/platform-tools/adb\"  "),
            "/opt/android/platform-tools/adb"
        );
        assert_eq!(
            normalize_command_path("'/opt/android/build-tools/aapt'"),
            "/opt/android/build-tools/aapt"
        );
    }

    #[test]
    fn resolves_empty_to_default_program() {
        assert_eq!(resolve_program("", "adb"), "adb");
        assert_eq!(resolve_program("   ", "aapt"), "aapt");
        assert_eq!(resolve_program("/usr/bin/java", "java"), "/usr/bin/java");
    }

    #[test]
    fn validates_paths() {
        assert!(validate_program("adb").is_ok());
        let err = validate_program("/this/path/should/not/exist/adb").unwrap_err();
        assert!(err.to_lowercase().contains("not found"));
        let dir = tempfile::tempdir().expect("tmp");
        assert!(validate_program(dir.path().to_str().unwrap()).is_err());
    }
}
