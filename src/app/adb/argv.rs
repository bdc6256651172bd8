use std::path::PathBuf;

use crate::app::adb::locator::resolve_program;
use crate::app::config::ToolSettings;

/// Resolved host tools used to build every argv the engine runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub adb: String,
    pub aapt: String,
    pub java: String,
    pub chkbugreport_jar: Option<PathBuf>,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self::from_settings(&ToolSettings::default())
    }
}

impl Toolchain {
    pub fn from_settings(settings: &ToolSettings) -> Self {
        let jar = resolve_program(&settings.chkbugreport_jar, "");
        Self {
            adb: resolve_program(&settings.adb_path, "adb"),
            aapt: resolve_program(&settings.aapt_path, "aapt"),
            java: resolve_program(&settings.java_path, "java"),
            chkbugreport_jar: if jar.is_empty() {
                None
            } else {
                Some(PathBuf::from(jar))
            },
        }
    }

    pub fn adb(&self, args: &[&str]) -> Vec<String> {
        let mut argv = vec![self.adb.clone()];
        argv.extend(args.iter().map(|arg| arg.to_string()));
        argv
    }

    pub fn adb_device(&self, device: &str, args: &[&str]) -> Vec<String> {
        let mut argv = vec![self.adb.clone(), "-s".to_string(), device.to_string()];
        argv.extend(args.iter().map(|arg| arg.to_string()));
        argv
    }

    pub fn shell(&self, device: &str, args: &[&str]) -> Vec<String> {
        let mut argv = self.adb_device(device, &["shell"]);
        argv.extend(args.iter().map(|arg| arg.to_string()));
        argv
    }

    pub fn aapt_badging(&self, apk_path: &str) -> Vec<String> {
        vec![
            self.aapt.clone(),
            "dump".to_string(),
            "badging".to_string(),
            apk_path.to_string(),
        ]
    }

    /// `None` when no chkbugreport jar is configured.
    pub fn chkbugreport(&self, bugreport_txt: &str) -> Option<Vec<String>> {
        let jar = self.chkbugreport_jar.as_ref()?;
        Some(vec![
            self.java.clone(),
            "-jar".to_string(),
            jar.to_string_lossy().to_string(),
            bugreport_txt.to_string(),
        ])
    }
}

/// `input text` treats a literal space as an argument separator.
pub fn encode_input_text(text: &str) -> String {
    text.replace(' ', "%s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_device_scoped_argv() {
        let tools = Toolchain::default();
        assert_eq!(
            tools.shell("10.0.0.5:5555", &["getprop", "ro.product.model"]),
            vec!["adb", "-s", "10.0.0.5:5555", "shell", "getprop", "ro.product.model"]
        );
        assert_eq!(tools.adb(&["devices"]), vec!["adb", "devices"]);
    }

    #[test]
    fn honours_configured_tool_paths() {
        let settings = ToolSettings {
            adb_path: "\"/opt/platform-tools/adb\"".to_string(),
            aapt_path: String::new(),
            java_path: "/usr/bin/java".to_string(),
            chkbugreport_jar: "/opt/chkbugreport.jar".to_string(),
        };
        let tools = Toolchain::from_settings(&settings);
        assert_eq!(tools.adb, "/opt/platform-tools/adb");
        assert_eq!(tools.aapt, "aapt");
        assert_eq!(
            tools.chkbugreport("/tmp/bugreport.txt"),
            Some(vec![
                "/usr/bin/java".to_string(),
                "-jar".to_string(),
                "/opt/chkbugreport.jar".to_string(),
                "/tmp/bugreport.txt".to_string()
            ])
        );
        assert_eq!(Toolchain::default().chkbugreport("/tmp/x.txt"), None);
    }

    #[test]
    fn encodes_spaces_for_input_text() {
        assert_eq!(encode_input_text("hello big world"), "hello%sbig%sworld");
        assert_eq!(encode_input_text("plain"), "plain");
    }
}
