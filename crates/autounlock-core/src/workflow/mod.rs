//! Workflow orchestration for key provisioning and its reports.

mod pipeline;

pub use pipeline::{
    process_devices, DeviceOutcome, DevicePipeline, DeviceResult, ProcessRequest, RunReport,
};

/// Severity levels used when reporting workflow events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowLevel {
    Info,
    Success,
    Warn,
    Error,
    Security,
}

/// Single line of output produced by a workflow step.
#[derive(Debug, Clone)]
pub struct WorkflowEvent {
    pub level: WorkflowLevel,
    pub message: String,
}

/// Aggregated report returned by any workflow entry point.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
}

impl WorkflowReport {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, level: WorkflowLevel, message: impl Into<String>) {
        self.events.push(event(level, message));
    }

    pub fn has_errors(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e.level, WorkflowLevel::Error))
    }
}

/// Mode switches for one processing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Plan and report only; no header or slot is touched.
    pub dry_run: bool,
    /// Place the archive in the download directory instead of the backup
    /// directory.
    pub download_mode: bool,
    /// Back up and archive headers without touching slots.
    pub headers_only: bool,
}

/// Convenience constructor that wraps the repeated boilerplate.
pub(crate) fn event(level: WorkflowLevel, message: impl Into<String>) -> WorkflowEvent {
    WorkflowEvent {
        level,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests;
