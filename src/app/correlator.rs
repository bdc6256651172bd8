use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::app::batch::{BatchReducer, BatchSnapshot, Recorded};
use crate::app::config::FollowUpSettings;
use crate::app::logging::{LogLevel, LogSink};
use crate::app::models::{
    BatchId, CommandResult, DeviceMetadata, OperationKind, ResultPayload,
};
use crate::app::notify::{BatchSummary, Notification, NotificationEmitter, OperationNotice};
use crate::app::registry::DeviceRegistry;

/// Work the correlator asks the dispatcher to submit later (or right away for a zero delay).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    RefreshDevices { delay: Duration },
    FetchBasicInfo { device: String, delay: Duration },
}

/// What a handler sees: the result plus the batch counters after it was counted.
pub struct ResultContext<'a> {
    pub result: &'a CommandResult,
    pub total: usize,
}

type Handler = fn(&Correlator, &ResultContext<'_>) -> Vec<FollowUp>;

/// Kind-specific reducers. `None` falls through to the default handler.
fn handler_for(kind: OperationKind) -> Option<Handler> {
    match kind {
        OperationKind::Connect => Some(on_connect),
        OperationKind::RefreshDevices => Some(on_refresh_devices),
        OperationKind::RestartDevice => Some(on_restart_device),
        OperationKind::RestartAdb => Some(on_restart_adb),
        OperationKind::FetchBasicInfo => Some(on_basic_info),
        OperationKind::Disconnect
        | OperationKind::ClearLogcat
        | OperationKind::InputText
        | OperationKind::InstallApk
        | OperationKind::UninstallApp
        | OperationKind::ClearAppData
        | OperationKind::RestartApp
        | OperationKind::KillMonkey => Some(on_plain),
        OperationKind::FetchFullInfo
        | OperationKind::Screenshot
        | OperationKind::SaveLogcat
        | OperationKind::CurrentPackage
        | OperationKind::CurrentActivity
        | OperationKind::ParseApk
        | OperationKind::ListPackages
        | OperationKind::MonkeyTest
        | OperationKind::Bugreport
        | OperationKind::PullAnr => Some(on_detailed),
        OperationKind::Shell => None,
    }
}

pub struct Correlator {
    reducer: BatchReducer,
    registry: Arc<DeviceRegistry>,
    emit: NotificationEmitter,
    log: Arc<dyn LogSink>,
    follow_up: FollowUpSettings,
}

impl Correlator {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        emit: NotificationEmitter,
        log: Arc<dyn LogSink>,
        follow_up: FollowUpSettings,
    ) -> Self {
        Self {
            reducer: BatchReducer::new(),
            registry,
            emit,
            log,
            follow_up,
        }
    }

    pub fn begin_batch(&self, kind: OperationKind, total: usize) -> BatchId {
        self.reducer.begin(kind, total)
    }

    pub fn reducer(&self) -> &BatchReducer {
        &self.reducer
    }

    /// Counts `result`, notifies, and returns the follow-ups to schedule. Safe to call from
    /// any worker; holds no lock while emitting. The batch summary goes out only after every
    /// per-device notice of that batch has been emitted.
    pub fn on_result(&self, result: &CommandResult) -> Vec<FollowUp> {
        let snapshot = match self
            .reducer
            .record_result(result.batch_id, result.index, result.success)
        {
            Recorded::Progress(snapshot) | Recorded::Completed(snapshot) => snapshot,
            Recorded::Duplicate(_) => {
                warn!(
                    batch_id = %result.batch_id,
                    index = result.index,
                    device = %result.device,
                    "duplicate result ignored"
                );
                return Vec::new();
            }
            Recorded::Unknown => {
                warn!(batch_id = %result.batch_id, device = %result.device, "result for unknown batch");
                let context = ResultContext { result, total: 0 };
                return on_default(self, &context);
            }
        };
        let handled = panic::catch_unwind(AssertUnwindSafe(|| {
            self.dispatch_handler(result, snapshot.total)
        }));
        let mut follow_ups = handled.unwrap_or_else(|_| {
            error!(batch_id = %result.batch_id, device = %result.device, "result handler panicked");
            Vec::new()
        });
        if let Some(done) = self.reducer.notice_sent(result.batch_id) {
            follow_ups.extend(self.complete_batch(result.batch_id, &done));
        }
        follow_ups
    }

    fn dispatch_handler(&self, result: &CommandResult, total: usize) -> Vec<FollowUp> {
        let context = ResultContext { result, total };
        match handler_for(result.kind) {
            Some(handler) => handler(self, &context),
            None => on_default(self, &context),
        }
    }

    fn complete_batch(&self, batch_id: BatchId, snapshot: &BatchSnapshot) -> Vec<FollowUp> {
        let message = summary_message(snapshot);
        self.log.log(LogLevel::Info, &message);
        (self.emit)(Notification::BatchCompleted(BatchSummary {
            batch_id,
            kind: snapshot.kind,
            total: snapshot.total,
            succeeded: snapshot.succeeded,
            failed: snapshot.failed(),
            message,
        }));

        // One refresh per restart batch, once the last device has answered.
        if snapshot.kind == OperationKind::RestartDevice && snapshot.succeeded > 0 {
            return vec![FollowUp::RefreshDevices {
                delay: self.follow_up.restart_refresh_delay(),
            }];
        }
        Vec::new()
    }

    fn notify(&self, context: &ResultContext<'_>, level: LogLevel, message: String) {
        self.log.log(level, &message);
        let result = context.result;
        (self.emit)(Notification::OperationResult(OperationNotice {
            batch_id: result.batch_id,
            kind: result.kind,
            device: result.device.clone(),
            index: result.index,
            total: context.total,
            success: result.success,
            message,
            payload: result.payload.clone(),
        }));
    }

    fn notify_outcome(&self, context: &ResultContext<'_>, with_detail: bool) {
        let level = if context.result.success {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        self.notify(context, level, outcome_message(context, with_detail));
    }
}

fn position(context: &ResultContext<'_>) -> String {
    format!("({}/{})", context.result.index, context.total)
}

fn subject_part(result: &CommandResult) -> String {
    result
        .subject
        .as_deref()
        .map(|subject| format!(" {subject}"))
        .unwrap_or_default()
}

pub fn outcome_message(context: &ResultContext<'_>, with_detail: bool) -> String {
    let result = context.result;
    let label = result.kind.label();
    let position = position(context);
    let subject = subject_part(result);
    if result.success {
        let detail = if with_detail {
            format!(": {}", result.payload.summary())
        } else {
            String::new()
        };
        format!("✅ {label} success {position}{subject} on {}{detail}", result.device)
    } else {
        format!(
            "❌ {label} failed {position}{subject} on {}: {}",
            result.device,
            result.payload.summary()
        )
    }
}

pub fn summary_message(snapshot: &BatchSnapshot) -> String {
    format!(
        "🎯 {} complete: {}/{} devices, {} succeeded, {} failed",
        snapshot.kind.label(),
        snapshot.completed,
        snapshot.total,
        snapshot.succeeded,
        snapshot.failed()
    )
}

fn on_plain(correlator: &Correlator, context: &ResultContext<'_>) -> Vec<FollowUp> {
    correlator.notify_outcome(context, false);
    Vec::new()
}

fn on_detailed(correlator: &Correlator, context: &ResultContext<'_>) -> Vec<FollowUp> {
    correlator.notify_outcome(context, true);
    Vec::new()
}

/// Best-effort notice for kinds without a dedicated reducer.
fn on_default(correlator: &Correlator, context: &ResultContext<'_>) -> Vec<FollowUp> {
    let result = context.result;
    let icon = if result.success { "✅" } else { "❌" };
    let message = format!(
        "{icon} {} {} on {}: {}",
        result.kind.label(),
        position(context),
        result.device,
        result.payload.summary()
    );
    correlator.notify(context, LogLevel::Warning, message);
    Vec::new()
}

fn on_connect(correlator: &Correlator, context: &ResultContext<'_>) -> Vec<FollowUp> {
    correlator.notify_outcome(context, false);
    let result = context.result;
    if !result.success {
        return Vec::new();
    }
    if let Err(err) = correlator
        .registry
        .put_if_absent(&result.device, DeviceMetadata::default())
    {
        error!(device = %result.device, error = %err, "failed to register connected device");
    }
    vec![
        FollowUp::RefreshDevices {
            delay: Duration::ZERO,
        },
        FollowUp::FetchBasicInfo {
            device: result.device.clone(),
            delay: Duration::ZERO,
        },
    ]
}

fn on_refresh_devices(correlator: &Correlator, context: &ResultContext<'_>) -> Vec<FollowUp> {
    correlator.notify_outcome(context, true);
    if let ResultPayload::Devices(devices) = &context.result.payload {
        debug!(count = devices.len(), "device list refreshed");
        (correlator.emit)(Notification::DevicesUpdated(devices.clone()));
    }
    Vec::new()
}

fn on_restart_device(correlator: &Correlator, context: &ResultContext<'_>) -> Vec<FollowUp> {
    let result = context.result;
    if result.success {
        let message = format!("🔄 restarting {} {}", result.device, position(context));
        correlator.notify(context, LogLevel::Info, message);
    } else {
        correlator.notify_outcome(context, false);
    }
    // The refresh is scheduled per batch in `complete_batch`.
    Vec::new()
}

fn on_restart_adb(correlator: &Correlator, context: &ResultContext<'_>) -> Vec<FollowUp> {
    correlator.notify_outcome(context, false);
    if !context.result.success {
        return Vec::new();
    }
    vec![FollowUp::RefreshDevices {
        delay: correlator.follow_up.adb_restart_refresh_delay(),
    }]
}

fn on_basic_info(correlator: &Correlator, context: &ResultContext<'_>) -> Vec<FollowUp> {
    correlator.notify_outcome(context, true);
    let result = context.result;
    if let (true, ResultPayload::Info(metadata)) = (result.success, &result.payload) {
        match correlator.registry.put(&result.device, metadata.clone()) {
            Ok(changed) => debug!(device = %result.device, changed, "device info stored"),
            Err(err) => error!(device = %result.device, error = %err, "failed to store device info"),
        }
        (correlator.emit)(Notification::DeviceInfoUpdated {
            address: result.device.clone(),
            metadata: metadata.clone(),
        });
    }
    Vec::new()
}
