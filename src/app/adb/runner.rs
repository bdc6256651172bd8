use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Every way a single external command can end. Callers must handle all four.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommandOutcome {
    Ok { stdout: String },
    ProcessError { exit_code: Option<i32>, stderr: String },
    Timeout { elapsed_secs: u64 },
    SystemError { message: String },
}

impl CommandOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommandOutcome::Ok { .. })
    }

    pub fn stdout(&self) -> Option<&str> {
        match self {
            CommandOutcome::Ok { stdout } => Some(stdout.as_str()),
            _ => None,
        }
    }

    /// The trimmed stdout on success, the failure description otherwise.
    pub fn text(&self) -> String {
        match self {
            CommandOutcome::Ok { stdout } => stdout.trim().to_string(),
            _ => self.describe(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            CommandOutcome::Ok { stdout } => stdout.trim().to_string(),
            CommandOutcome::ProcessError { exit_code, stderr } => match exit_code {
                Some(code) => format!("Error: exit {code}: {}", stderr.trim()),
                None => format!("Error: terminated by signal: {}", stderr.trim()),
            },
            CommandOutcome::Timeout { elapsed_secs } => {
                format!("Timeout: command exceeded {elapsed_secs}s")
            }
            CommandOutcome::SystemError { message } => format!("SystemError: {message}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Running,
    Exited(Option<i32>),
}

/// A long-running child whose output goes to a file.
pub trait BackgroundProcess: Send {
    fn id(&self) -> u32;
    fn poll(&mut self) -> Result<ProcessExit, String>;
    /// Kills and reaps the process. Safe to call after it has exited.
    fn terminate(&mut self);
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, argv: &[String], timeout: Duration) -> CommandOutcome;

    fn spawn_logged(
        &self,
        argv: &[String],
        log_path: &Path,
    ) -> Result<Box<dyn BackgroundProcess>, String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, argv: &[String], timeout: Duration) -> CommandOutcome {
        let Some((program, args)) = argv.split_first() else {
            return CommandOutcome::SystemError {
                message: "Empty command line".to_string(),
            };
        };
        run_command_with_timeout(program, args, timeout)
    }

    fn spawn_logged(
        &self,
        argv: &[String],
        log_path: &Path,
    ) -> Result<Box<dyn BackgroundProcess>, String> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| "Empty command line".to_string())?;
        let stdout = File::create(log_path)
            .map_err(|err| format!("Failed to create {}: {err}", log_path.display()))?;
        let stderr = stdout
            .try_clone()
            .map_err(|err| format!("Failed to share log file handle: {err}"))?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|err| format!("Failed to spawn {program}: {err}"))?;
        debug!(pid = child.id(), program = %program, "spawned background process");
        Ok(Box::new(LoggedChild { child }))
    }
}

struct LoggedChild {
    child: Child,
}

impl BackgroundProcess for LoggedChild {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn poll(&mut self) -> Result<ProcessExit, String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(ProcessExit::Exited(status.code())),
            Ok(None) => Ok(ProcessExit::Running),
            Err(err) => Err(format!("Failed to poll process: {err}")),
        }
    }

    fn terminate(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

impl Drop for LoggedChild {
    fn drop(&mut self) {
        self.terminate();
    }
}

pub fn run_command_with_timeout(program: &str, args: &[String], timeout: Duration) -> CommandOutcome {
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            return CommandOutcome::SystemError {
                message: format!("Failed to spawn {program}: {err}"),
            }
        }
    };

    // Drain stdout/stderr in parallel; otherwise, a chatty child process can block once the pipe
    // buffer fills, and we will incorrectly hit the timeout.
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return CommandOutcome::SystemError {
            message: "Failed to capture command output".to_string(),
        };
    };
    let stdout_handle = spawn_drain(stdout);
    let stderr_handle = spawn_drain(stderr);

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    // Readers finish on their own once the pipes close; a grandchild that
                    // inherited them must not pin this worker.
                    drop(stdout_handle);
                    drop(stderr_handle);
                    warn!(program = %program, timeout_secs = timeout.as_secs(), "command timed out");
                    return CommandOutcome::Timeout {
                        elapsed_secs: start.elapsed().as_secs(),
                    };
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return CommandOutcome::SystemError {
                    message: format!("Failed to poll command: {err}"),
                };
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();
    let stdout = String::from_utf8_lossy(&stdout_bytes).to_string();
    let stderr = String::from_utf8_lossy(&stderr_bytes).to_string();

    match exit_code {
        Some(0) => CommandOutcome::Ok { stdout },
        exit_code => CommandOutcome::ProcessError {
            exit_code,
            // adb reports most failures on stdout; keep whichever stream has content.
            stderr: if stderr.trim().is_empty() { stdout } else { stderr },
        },
    }
}

fn spawn_drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 4096];
        loop {
            match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
                Err(_) => break,
            }
        }
        buffer
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[cfg(unix)]
    #[test]
    fn run_command_with_timeout_does_not_deadlock_on_large_stdout() {
        // Regression test: If stdout/stderr are piped but not drained, the child can block once
        // the pipe buffer fills, causing an otherwise-fast command to "hang" until we hit the
        // timeout.
        let argv = sh("i=0; while [ $i -lt 100000 ]; do echo 1234567890; i=$((i+1)); done");
        let outcome = ProcessRunner.run(&argv, Duration::from_secs(10));
        let stdout = outcome.stdout().expect("expected large-output command to succeed");
        assert!(
            stdout.len() >= 1_000_000,
            "expected stdout >= 1000000, got {}",
            stdout.len()
        );
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_process_error() {
        let outcome = ProcessRunner.run(&sh("echo boom >&2; exit 3"), Duration::from_secs(5));
        assert_eq!(
            outcome,
            CommandOutcome::ProcessError {
                exit_code: Some(3),
                stderr: "boom\n".to_string()
            }
        );
        assert!(outcome.describe().starts_with("Error: exit 3"));
    }

    #[test]
    fn missing_binary_is_system_error() {
        let argv = vec!["/definitely/not/a/real/binary".to_string()];
        let outcome = ProcessRunner.run(&argv, Duration::from_secs(5));
        assert!(matches!(outcome, CommandOutcome::SystemError { .. }));
    }

    #[test]
    fn empty_argv_is_system_error() {
        let outcome = ProcessRunner.run(&[], Duration::from_secs(5));
        assert!(matches!(outcome, CommandOutcome::SystemError { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn timeout_kills_and_reaps_child() {
        let dir = tempfile::tempdir().expect("tmp");
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());

        let start = Instant::now();
        let outcome = ProcessRunner.run(&sh(&script), Duration::from_millis(300));
        assert!(matches!(outcome, CommandOutcome::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));

        let pid = std::fs::read_to_string(&pid_file).expect("pid file");
        let proc_path = format!("/proc/{}", pid.trim());
        assert!(
            !Path::new(&proc_path).exists(),
            "process {} still present after timeout",
            pid.trim()
        );
    }

    #[cfg(unix)]
    #[test]
    fn spawn_logged_writes_output_and_terminates() {
        let dir = tempfile::tempdir().expect("tmp");
        let log = dir.path().join("out.txt");
        let mut process = ProcessRunner
            .spawn_logged(&sh("echo started; exec sleep 30"), &log)
            .expect("spawn");
        assert_eq!(process.poll().expect("poll"), ProcessExit::Running);
        std::thread::sleep(Duration::from_millis(200));
        process.terminate();
        assert!(matches!(process.poll().expect("poll"), ProcessExit::Exited(_)));
        let content = std::fs::read_to_string(&log).expect("log");
        assert!(content.contains("started"));
    }
}
