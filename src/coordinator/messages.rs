use tokio::sync::oneshot;

use crate::report::{Report, Snapshot};

use super::CoordinatorCore;

/// Closure executed on the coordinator worker with access to its state.
pub type CoordinatorFn = Box<dyn FnOnce(&mut CoordinatorCore) + Send>;

/// Closure executed on a report host worker against its hosted report.
pub type ReportFn = Box<dyn FnOnce(&mut dyn Report) + Send>;

/// Control request accepted by the coordinator.
pub enum ControlRequest {
    /// Run a closure on the coordinator worker.
    Call(CoordinatorFn),
    /// Shut down every report host, then the coordinator itself.
    Shutdown,
    /// Create and start a report host for the given report.
    AddReport(Box<dyn Report>),
    /// Shut down and remove the named report.
    DeleteReport(String),
    /// Capture a snapshot from the named report.
    GetReportSnapshot(String),
}

impl ControlRequest {
    /// Request kind label for the stats surface.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            ControlRequest::Call(_) => "call",
            ControlRequest::Shutdown => "shutdown",
            ControlRequest::AddReport(_) => "add_report",
            ControlRequest::DeleteReport(_) => "delete_report",
            ControlRequest::GetReportSnapshot(_) => "get_report_snapshot",
        }
    }
}

/// Outcome carried by generic control replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStatus {
    Ok,
    Error,
}

/// Reply to a control request. Every request produces exactly one response.
#[derive(Debug)]
pub enum ControlResponse {
    Generic {
        status: ControlStatus,
        message: String,
    },
    ReportSnapshot {
        snapshot: Snapshot,
    },
}

impl ControlResponse {
    pub fn ok() -> Self {
        ControlResponse::Generic {
            status: ControlStatus::Ok,
            message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlResponse::Generic {
            status: ControlStatus::Error,
            message: message.into(),
        }
    }

    /// True unless this is a generic error reply.
    pub fn is_ok(&self) -> bool {
        !matches!(
            self,
            ControlResponse::Generic {
                status: ControlStatus::Error,
                ..
            }
        )
    }

    /// Message of a generic reply; empty for snapshot replies.
    pub fn message(&self) -> &str {
        match self {
            ControlResponse::Generic { message, .. } => message,
            ControlResponse::ReportSnapshot { .. } => "",
        }
    }
}

/// A control request paired with its one-shot reply channel.
pub(crate) struct ControlEnvelope {
    pub request: ControlRequest,
    pub reply: oneshot::Sender<ControlResponse>,
}

/// Request executed on a report host worker: a closure plus the reply sent
/// once the closure has run.
pub(crate) struct ReportHostRequest {
    pub func: ReportFn,
    pub reply: oneshot::Sender<()>,
}
