use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::record::RunStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Started { run_id: String, name: String },
    Log { run_id: String, msg: String },
    Scalar { run_id: String, name: String, value: f64, step: Option<u64> },
    Finished { run_id: String, status: RunStatus },
    Failed { run_id: String, kind: String, error: String },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::Started { run_id, .. }
            | RunEvent::Log { run_id, .. }
            | RunEvent::Scalar { run_id, .. }
            | RunEvent::Finished { run_id, .. }
            | RunEvent::Failed { run_id, .. } => run_id,
        }
    }
}

/// Optional event sink. Sending with no subscribers is not an error.
#[derive(Clone, Default)]
pub struct EventSink(Option<broadcast::Sender<RunEvent>>);

impl EventSink {
    pub fn new(tx: broadcast::Sender<RunEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn emit(&self, evt: RunEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(evt);
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EventSink").field(&self.0.is_some()).finish()
    }
}
