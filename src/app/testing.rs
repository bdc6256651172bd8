//! Scripted collaborators for engine tests.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::app::adb::runner::{BackgroundProcess, CommandOutcome, CommandRunner, ProcessExit};
use crate::app::notify::{Notification, NotificationEmitter};

type Respond = dyn Fn(&[String]) -> CommandOutcome + Send + Sync;

/// Answers every `run` from a closure and records the argv.
pub struct FakeRunner {
    respond: Box<Respond>,
    calls: Mutex<Vec<Vec<String>>>,
    spawned: Mutex<Vec<SpawnRecord>>,
    /// Spawned processes whose argv mentions this token exit after the given poll count.
    exit_after: Mutex<Option<(String, usize, Option<i32>)>>,
}

#[derive(Clone)]
pub struct SpawnRecord {
    pub argv: Vec<String>,
    pub terminated: Arc<AtomicBool>,
}

impl FakeRunner {
    pub fn new(respond: impl Fn(&[String]) -> CommandOutcome + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
            exit_after: Mutex::new(None),
        }
    }

    pub fn exit_spawned_after(self, token: &str, polls: usize, exit_code: Option<i32>) -> Self {
        *self.exit_after.lock().expect("exit_after") = Some((token.to_string(), polls, exit_code));
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn calls_matching(&self, token: &str) -> usize {
        self.calls()
            .iter()
            .filter(|argv| argv.iter().any(|arg| arg == token))
            .count()
    }

    pub fn spawned(&self) -> Vec<SpawnRecord> {
        self.spawned.lock().expect("spawned").clone()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, argv: &[String], _timeout: Duration) -> CommandOutcome {
        self.calls.lock().expect("calls").push(argv.to_vec());
        (self.respond)(argv)
    }

    fn spawn_logged(
        &self,
        argv: &[String],
        log_path: &Path,
    ) -> Result<Box<dyn BackgroundProcess>, String> {
        fs::write(log_path, "").map_err(|err| err.to_string())?;
        let terminated = Arc::new(AtomicBool::new(false));
        self.spawned.lock().expect("spawned").push(SpawnRecord {
            argv: argv.to_vec(),
            terminated: Arc::clone(&terminated),
        });
        let exit = self
            .exit_after
            .lock()
            .expect("exit_after")
            .clone()
            .filter(|(token, _, _)| argv.iter().any(|arg| arg == token))
            .map(|(_, polls, code)| (polls, code));
        Ok(Box::new(FakeProcess {
            id: self.spawned.lock().expect("spawned").len() as u32,
            polls: 0,
            exit,
            terminated,
        }))
    }
}

/// Runs until terminated, or until its scripted poll count is reached.
pub struct FakeProcess {
    id: u32,
    polls: usize,
    exit: Option<(usize, Option<i32>)>,
    terminated: Arc<AtomicBool>,
}

impl BackgroundProcess for FakeProcess {
    fn id(&self) -> u32 {
        self.id
    }

    fn poll(&mut self) -> Result<ProcessExit, String> {
        if self.terminated.load(Ordering::SeqCst) {
            return Ok(ProcessExit::Exited(None));
        }
        self.polls += 1;
        match self.exit {
            Some((after, code)) if self.polls > after => Ok(ProcessExit::Exited(code)),
            _ => Ok(ProcessExit::Running),
        }
    }

    fn terminate(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

/// One-way latch used to hold a worker until the test releases it.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().expect("gate") = true;
        self.cv.notify_all();
    }

    /// Blocks until opened; gives up after five seconds so a broken test cannot hang.
    pub fn wait(&self) {
        let guard = self.open.lock().expect("gate");
        let _ = self
            .cv
            .wait_timeout_while(guard, Duration::from_secs(5), |open| !*open)
            .expect("gate");
    }
}

#[derive(Clone, Default)]
pub struct Collector {
    seen: Arc<(Mutex<Vec<Notification>>, Condvar)>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitter(&self) -> NotificationEmitter {
        let seen = Arc::clone(&self.seen);
        Arc::new(move |notification| {
            let (list, cv) = &*seen;
            list.lock().expect("collector").push(notification);
            cv.notify_all();
        })
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.seen.0.lock().expect("collector").clone()
    }

    /// Waits until `done` holds over everything collected so far.
    pub fn wait_until(&self, done: impl Fn(&[Notification]) -> bool) -> Vec<Notification> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let (list, cv) = &*self.seen;
        let mut guard = list.lock().expect("collector");
        while !done(&guard) {
            let now = Instant::now();
            if now >= deadline {
                panic!("timed out waiting for notifications; got {:?}", *guard);
            }
            guard = cv.wait_timeout(guard, deadline - now).expect("collector").0;
        }
        guard.clone()
    }

    pub fn wait_for_batches(&self, count: usize) -> Vec<Notification> {
        self.wait_until(|seen| {
            seen.iter()
                .filter(|note| matches!(note, Notification::BatchCompleted(_)))
                .count()
                >= count
        })
    }
}
