use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use serde::Serialize;

use crate::app::models::{BatchId, DeviceMetadata, OperationKind, ResultPayload};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OperationNotice {
    pub batch_id: BatchId,
    pub kind: OperationKind,
    pub device: String,
    pub index: usize,
    pub total: usize,
    pub success: bool,
    pub message: String,
    pub payload: ResultPayload,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub kind: OperationKind,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum Notification {
    DevicesUpdated(Vec<String>),
    OperationResult(OperationNotice),
    DeviceInfoUpdated {
        address: String,
        metadata: DeviceMetadata,
    },
    BatchCompleted(BatchSummary),
}

pub type NotificationEmitter = Arc<dyn Fn(Notification) + Send + Sync>;

/// Emitter that forwards into a channel drained by the UI thread.
pub fn channel_emitter() -> (NotificationEmitter, Receiver<Notification>) {
    let (tx, rx) = mpsc::channel();
    let emitter: NotificationEmitter = Arc::new(move |notification| {
        // Receiver gone means nobody is listening any more.
        let _ = tx.send(notification);
    });
    (emitter, rx)
}
