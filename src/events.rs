//! Structured pipeline events.
//!
//! Stages report what happened to each file through an [`EventSink`]. The
//! events are a side channel: stage results are returned as typed values,
//! and a sink only observes them.

use std::fmt;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::checkpoint::Stage;

/// Outcome attached to a [`PipelineEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Started,
    Succeeded,
    /// Work was already done in an earlier run.
    Skipped,
    Retrying,
    Failed,
    /// Permanently removed from later stages.
    Excluded,
    /// Another 10% of a transfer or load is done.
    Progress,
}

impl EventOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Skipped => "skipped",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
            Self::Excluded => "excluded",
            Self::Progress => "progress",
        }
    }
}

impl fmt::Display for EventOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation `{stage, file, outcome, detail}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineEvent {
    pub stage: Stage,
    pub file: String,
    pub outcome: EventOutcome,
    pub detail: Option<String>,
}

impl PipelineEvent {
    #[must_use]
    pub fn new(stage: Stage, file: impl Into<String>, outcome: EventOutcome) -> Self {
        Self {
            stage,
            file: file.into(),
            outcome,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Reports each 10% step of a known total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressMarks {
    total: u64,
    next_percent: u64,
}

impl ProgressMarks {
    /// `None` when the total is unknown or zero.
    #[must_use]
    pub fn new(total: Option<u64>) -> Option<Self> {
        total.filter(|total| *total > 0).map(|total| Self {
            total,
            next_percent: 10,
        })
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Returns the percentage reached when `done` crosses the next step.
    /// Several steps crossed at once are reported once.
    pub fn advance(&mut self, done: u64) -> Option<u8> {
        let percent = (u128::from(done) * 100 / u128::from(self.total)).min(100);
        let percent = u64::try_from(percent).unwrap_or(100);
        if percent < self.next_percent {
            return None;
        }
        self.next_percent = (percent / 10 + 1) * 10;
        u8::try_from(percent).ok()
    }
}

/// Receiver of pipeline events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Forwards events to `tracing`; failures are logged at `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PipelineEvent) {
        let detail = event.detail.as_deref().unwrap_or("");
        match event.outcome {
            EventOutcome::Failed | EventOutcome::Excluded | EventOutcome::Retrying => warn!(
                stage = %event.stage,
                file = %event.file,
                outcome = %event.outcome,
                detail,
                "pipeline event"
            ),
            _ => info!(
                stage = %event.stage,
                file = %event.file,
                outcome = %event.outcome,
                detail,
                "pipeline event"
            ),
        }
    }
}

/// Keeps every event in memory. Used by tests and by callers that render
/// their own report.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events for one stage and outcome.
    #[must_use]
    pub fn matching(&self, stage: Stage, outcome: EventOutcome) -> Vec<PipelineEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.stage == stage && event.outcome == outcome)
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_filters_by_stage_and_outcome() {
        let sink = MemorySink::new();
        sink.emit(PipelineEvent::new(
            Stage::Download,
            "Empresas0.zip",
            EventOutcome::Succeeded,
        ));
        sink.emit(
            PipelineEvent::new(Stage::Validate, "Empresas0.zip", EventOutcome::Failed)
                .with_detail("bad crc"),
        );

        let failed = sink.matching(Stage::Validate, EventOutcome::Failed);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].detail.as_deref(), Some("bad crc"));
        assert_eq!(sink.events().len(), 2);
    }

    #[test]
    fn test_progress_marks_report_each_tenth_once() {
        let mut marks = ProgressMarks::new(Some(1000)).unwrap();
        assert_eq!(marks.advance(50), None);
        assert_eq!(marks.advance(100), Some(10));
        assert_eq!(marks.advance(150), None);
        assert_eq!(marks.advance(420), Some(42));
        assert_eq!(marks.advance(480), None);
        assert_eq!(marks.advance(500), Some(50));
        assert_eq!(marks.advance(1000), Some(100));
        assert_eq!(marks.advance(1000), None);
    }

    #[test]
    fn test_progress_marks_need_a_known_total() {
        assert!(ProgressMarks::new(None).is_none());
        assert!(ProgressMarks::new(Some(0)).is_none());
    }
}
