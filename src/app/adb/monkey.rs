use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::adb::argv::Toolchain;
use crate::app::adb::parse::parse_foreground_package;
use crate::app::adb::runner::{BackgroundProcess, CommandRunner, ProcessExit};
use crate::app::clock::Clock;
use crate::app::config::MonkeySettings;
use crate::app::models::MonkeyProfile;

struct EventMix {
    throttle_ms: &'static str,
    touch: &'static str,
    motion: &'static str,
    nav: &'static str,
    majornav: &'static str,
    syskeys: &'static str,
    appswitch: &'static str,
    anyevent: &'static str,
}

fn event_mix(profile: MonkeyProfile) -> EventMix {
    match profile {
        MonkeyProfile::Mobile => EventMix {
            throttle_ms: "500",
            touch: "35",
            motion: "15",
            nav: "25",
            majornav: "10",
            syskeys: "2",
            appswitch: "10",
            anyevent: "3",
        },
        // D-pad driven: mostly navigation, no app switching.
        MonkeyProfile::Tv => EventMix {
            throttle_ms: "1000",
            touch: "21",
            motion: "5",
            nav: "67",
            majornav: "5",
            syskeys: "1",
            appswitch: "0",
            anyevent: "1",
        },
    }
}

pub fn monkey_argv(
    tools: &Toolchain,
    device: &str,
    package: &str,
    event_count: u32,
    profile: MonkeyProfile,
    seed: u64,
) -> Vec<String> {
    let mix = event_mix(profile);
    let seed = seed.to_string();
    let count = event_count.to_string();
    tools.shell(
        device,
        &[
            "monkey",
            "-p",
            package,
            "-v",
            "-v",
            "-v",
            "--throttle",
            mix.throttle_ms,
            "--ignore-crashes",
            "--ignore-timeouts",
            "--ignore-security-exceptions",
            "--pct-touch",
            mix.touch,
            "--pct-motion",
            mix.motion,
            "--pct-trackball",
            "0",
            "--pct-nav",
            mix.nav,
            "--pct-majornav",
            mix.majornav,
            "--pct-syskeys",
            mix.syskeys,
            "--pct-appswitch",
            mix.appswitch,
            "--pct-anyevent",
            mix.anyevent,
            "-s",
            &seed,
            &count,
        ],
    )
}

pub fn launch_argv(tools: &Toolchain, device: &str, package: &str) -> Vec<String> {
    tools.shell(
        device,
        &["monkey", "-p", package, "-c", "android.intent.category.LAUNCHER", "1"],
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogReport {
    pub relaunches: u32,
    pub exit_code: Option<i32>,
}

pub struct Watchdog<'a> {
    pub runner: &'a dyn CommandRunner,
    pub clock: &'a dyn Clock,
    pub tools: &'a Toolchain,
    pub settings: &'a MonkeySettings,
    pub aux_timeout: Duration,
}

impl Watchdog<'_> {
    /// Keeps `package` in front until `process` exits. A relaunch is attempted only when the
    /// cooldown has elapsed since the previous one.
    pub fn run(
        &self,
        device: &str,
        package: &str,
        process: &mut dyn BackgroundProcess,
    ) -> Result<WatchdogReport, String> {
        let interval = Duration::from_secs(self.settings.poll_interval_secs.max(1));
        let cooldown = Duration::from_secs(self.settings.relaunch_cooldown_secs);
        let mut last_relaunch: Option<Instant> = None;
        let mut relaunches = 0u32;

        loop {
            match process.poll()? {
                ProcessExit::Exited(exit_code) => {
                    info!(device, package, relaunches, ?exit_code, "monkey finished");
                    return Ok(WatchdogReport {
                        relaunches,
                        exit_code,
                    });
                }
                ProcessExit::Running => {}
            }

            let window = self
                .runner
                .run(&self.tools.shell(device, &["dumpsys", "window"]), self.aux_timeout);
            match window.stdout() {
                Some(output) => {
                    let foreground = parse_foreground_package(output);
                    let cooled_down = last_relaunch
                        .map(|at| self.clock.now().saturating_duration_since(at) > cooldown)
                        .unwrap_or(true);
                    if foreground.as_deref() != Some(package) && cooled_down {
                        debug!(device, package, ?foreground, "target app in background, relaunching");
                        self.relaunch(device, package);
                        last_relaunch = Some(self.clock.now());
                        relaunches += 1;
                    }
                }
                None => warn!(device, error = %window.describe(), "foreground probe failed"),
            }

            self.clock.sleep(interval);
        }
    }

    fn relaunch(&self, device: &str, package: &str) {
        let stop = self
            .runner
            .run(&self.tools.shell(device, &["am", "force-stop", package]), self.aux_timeout);
        if !stop.is_ok() {
            warn!(device, package, error = %stop.describe(), "force-stop failed");
        }
        let start = self
            .runner
            .run(&launch_argv(self.tools, device, package), self.aux_timeout);
        if !start.is_ok() {
            warn!(device, package, error = %start.describe(), "relaunch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tv_profile_uses_slower_throttle() {
        let tools = Toolchain::default();
        let mobile = monkey_argv(&tools, "dev1", "com.app", 500, MonkeyProfile::Mobile, 12345);
        let tv = monkey_argv(&tools, "dev1", "com.app", 500, MonkeyProfile::Tv, 12345);
        let throttle = |argv: &[String]| {
            let pos = argv.iter().position(|arg| arg == "--throttle").expect("throttle");
            argv[pos + 1].clone()
        };
        assert_eq!(throttle(&mobile), "500");
        assert_eq!(throttle(&tv), "1000");
        assert_eq!(&mobile[..4], ["adb", "-s", "dev1", "shell"]);
        assert_eq!(mobile.last().map(String::as_str), Some("500"));
        assert!(mobile.windows(2).any(|pair| pair[0] == "-s" && pair[1] == "12345"));
    }

    use crate::app::adb::runner::CommandOutcome;
    use crate::app::clock::ManualClock;
    use crate::app::testing::FakeRunner;

    fn watch(focus: &'static str) -> (WatchdogReport, FakeRunner) {
        let runner = FakeRunner::new(move |argv| CommandOutcome::Ok {
            stdout: if argv.iter().any(|arg| arg == "window") {
                focus.to_string()
            } else {
                String::new()
            },
        })
        .exit_spawned_after("--throttle", 2, Some(0));
        let clock = ManualClock::new();
        let tools = Toolchain::default();
        let settings = MonkeySettings::default();
        let dir = tempfile::tempdir().expect("tmp");
        let argv = monkey_argv(&tools, "dev1", "com.app", 100, MonkeyProfile::Mobile, 1);
        let mut process = runner
            .spawn_logged(&argv, &dir.path().join("monkey.txt"))
            .expect("spawn");
        let watchdog = Watchdog {
            runner: &runner,
            clock: &clock,
            tools: &tools,
            settings: &settings,
            aux_timeout: Duration::from_secs(5),
        };
        let report = watchdog.run("dev1", "com.app", process.as_mut()).expect("run");
        (report, runner)
    }

    #[test]
    fn relaunch_uses_launcher_intent() {
        let (report, runner) = watch("  mCurrentFocus=Window{1 u0 com.android.launcher3/.Launcher}\n");
        assert_eq!(report, WatchdogReport { relaunches: 1, exit_code: Some(0) });
        let tools = Toolchain::default();
        let launches: Vec<_> = runner
            .calls()
            .into_iter()
            .filter(|argv| *argv == launch_argv(&tools, "dev1", "com.app"))
            .collect();
        assert_eq!(launches.len(), 1);
        assert_eq!(runner.calls_matching("force-stop"), 1);
    }

    #[test]
    fn target_in_front_is_left_alone() {
        let (report, runner) = watch(
            "  mCurrentFocus=Window{1 u0 com.app/com.app.MainActivity}\n  mFocusedApp=ActivityRecord{2 u0 com.app/.MainActivity t12}\n",
        );
        assert_eq!(report.relaunches, 0);
        assert_eq!(runner.calls_matching("force-stop"), 0);
    }
}
