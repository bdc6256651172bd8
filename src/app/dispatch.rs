use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::app::adb::argv::Toolchain;
use crate::app::adb::runner::{CommandRunner, ProcessRunner};
use crate::app::clock::{Clock, SystemClock};
use crate::app::config::AppConfig;
use crate::app::correlator::{Correlator, FollowUp};
use crate::app::error::AppError;
use crate::app::followup::FollowUpScheduler;
use crate::app::logging::{LogSink, TracingLogSink};
use crate::app::models::{
    BatchId, CommandResult, CommandUnit, OperationArgs, OperationKind, HOST_TARGET,
};
use crate::app::notify::NotificationEmitter;
use crate::app::operations::OperationContext;
use crate::app::pool::WorkerPool;
use crate::app::registry::DeviceRegistry;

/// External collaborators, injected so tests can script them.
#[derive(Clone)]
pub struct Services {
    pub runner: Arc<dyn CommandRunner>,
    pub emitter: NotificationEmitter,
    pub log_sink: Arc<dyn LogSink>,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    pub fn system(emitter: NotificationEmitter) -> Self {
        Self {
            runner: Arc::new(ProcessRunner),
            emitter,
            log_sink: Arc::new(TracingLogSink),
            clock: Arc::new(SystemClock),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Inner {
    pool: WorkerPool,
    correlator: Correlator,
    operations: OperationContext,
    follow_ups: FollowUpScheduler,
    accepting: AtomicBool,
}

impl Inner {
    fn submit<F>(self: &Arc<Self>, devices: &[String], kind: OperationKind, args_for: F) -> Result<BatchId, AppError>
    where
        F: Fn(&str, usize) -> OperationArgs,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(AppError::validation("Dispatcher is shut down", ""));
        }
        if devices.is_empty() {
            return Err(AppError::validation("No devices selected", ""));
        }
        let args: Vec<OperationArgs> = devices
            .iter()
            .enumerate()
            .map(|(position, device)| args_for(device, position + 1))
            .collect();
        if let Some(mismatch) = args.iter().find(|args| args.kind() != kind) {
            return Err(AppError::validation(
                format!("Arguments for {} submitted as {kind}", mismatch.kind()),
                "",
            ));
        }

        let total = devices.len();
        let batch_id = self.correlator.begin_batch(kind, total);
        info!(%batch_id, %kind, total, "batch submitted");
        for (position, (device, args)) in devices.iter().zip(args).enumerate() {
            let index = position + 1;
            let unit = CommandUnit {
                batch_id,
                device: device.clone(),
                kind,
                index,
                total,
                args,
                trace_id: format!("{batch_id}-{index}"),
            };
            let inner = Arc::clone(self);
            let queued = unit.clone();
            if let Err(err) = self.pool.execute(Box::new(move || inner.run_unit(queued))) {
                // The pool closed after the accepting check; the unit still owes a result.
                warn!(trace_id = %unit.trace_id, error = %err, "unit rejected by pool");
                self.deliver(CommandResult::failure(&unit, format!("SystemError: {}", err.error)));
            }
        }
        Ok(batch_id)
    }

    /// Outermost worker wrapper: whatever happens inside, exactly one result leaves.
    fn run_unit(self: &Arc<Self>, unit: CommandUnit) {
        debug!(trace_id = %unit.trace_id, device = %unit.device, kind = %unit.kind, index = unit.index, "unit started");
        let result = match panic::catch_unwind(AssertUnwindSafe(|| self.operations.execute(&unit))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(trace_id = %unit.trace_id, device = %unit.device, panic = %message, "unit panicked");
                CommandResult::failure(&unit, format!("SystemError: worker panicked: {message}"))
            }
        };
        info!(
            trace_id = %unit.trace_id,
            device = %unit.device,
            kind = %unit.kind,
            index = unit.index,
            success = result.success,
            "unit finished"
        );
        self.deliver(result);
    }

    fn deliver(self: &Arc<Self>, result: CommandResult) {
        let follow_ups = match panic::catch_unwind(AssertUnwindSafe(|| self.correlator.on_result(&result))) {
            Ok(follow_ups) => follow_ups,
            Err(payload) => {
                error!(batch_id = %result.batch_id, panic = %panic_message(payload.as_ref()), "correlator panicked");
                Vec::new()
            }
        };
        for follow_up in follow_ups {
            self.schedule(follow_up);
        }
    }

    fn schedule(self: &Arc<Self>, follow_up: FollowUp) {
        let (delay, label) = match &follow_up {
            FollowUp::RefreshDevices { delay } => (*delay, "refresh devices".to_string()),
            FollowUp::FetchBasicInfo { device, delay } => (*delay, format!("basic info {device}")),
        };
        if delay == Duration::ZERO {
            self.run_follow_up(follow_up);
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(self);
        let accepted = self.follow_ups.after(
            delay,
            label,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.run_follow_up(follow_up);
                }
            }),
        );
        if !accepted {
            debug!("follow-up dropped after shutdown");
        }
    }

    fn run_follow_up(self: &Arc<Self>, follow_up: FollowUp) {
        let submitted = match follow_up {
            FollowUp::RefreshDevices { .. } => self.submit(
                &[HOST_TARGET.to_string()],
                OperationKind::RefreshDevices,
                |_, _| OperationArgs::RefreshDevices,
            ),
            FollowUp::FetchBasicInfo { device, .. } => {
                self.submit(&[device], OperationKind::FetchBasicInfo, |_, _| {
                    OperationArgs::FetchBasicInfo
                })
            }
        };
        if let Err(err) = submitted {
            debug!(error = %err, "follow-up not submitted");
        }
    }
}

/// Fans batches out to the worker pool and routes every result through the correlator.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        config: &AppConfig,
        registry: Arc<DeviceRegistry>,
        services: Services,
        follow_ups: FollowUpScheduler,
    ) -> Result<Self, AppError> {
        let pool = WorkerPool::new(config.pool.worker_count, "adb-worker")?;
        let correlator = Correlator::new(
            registry,
            services.emitter,
            services.log_sink,
            config.follow_up.clone(),
        );
        let operations = OperationContext {
            runner: services.runner,
            clock: services.clock,
            tools: Toolchain::from_settings(&config.tools),
            timeouts: config.timeouts.clone(),
            monkey: config.monkey.clone(),
        };
        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                correlator,
                operations,
                follow_ups,
                accepting: AtomicBool::new(true),
            }),
        })
    }

    /// Queues one unit per device and returns at once. Index `n` is the device's 1-based
    /// position in `devices`.
    pub fn submit<F>(&self, devices: &[String], kind: OperationKind, args_for: F) -> Result<BatchId, AppError>
    where
        F: Fn(&str, usize) -> OperationArgs,
    {
        self.inner.submit(devices, kind, args_for)
    }

    /// Batch of one against the host pseudo-device.
    pub fn submit_host(&self, args: OperationArgs) -> Result<BatchId, AppError> {
        let kind = args.kind();
        self.inner
            .submit(&[HOST_TARGET.to_string()], kind, move |_, _| args.clone())
    }

    pub fn follow_ups(&self) -> &FollowUpScheduler {
        &self.inner.follow_ups
    }

    pub fn open_batches(&self) -> usize {
        self.inner.correlator.reducer().open_batches()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.pool.size()
    }

    /// Stops new submissions, cancels pending follow-ups and lets queued units finish.
    pub fn shutdown(&self) {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("dispatcher shutting down");
        self.inner.follow_ups.shutdown();
        self.inner.pool.shutdown();
    }
}
