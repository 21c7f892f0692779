//! Terminal spinner fed by pipeline events.

use std::time::Duration;

use cnpj_etl_core::events::EventOutcome;
use cnpj_etl_core::{EventSink, PipelineEvent, TracingSink};
use indicatif::{ProgressBar, ProgressStyle};

pub(crate) fn is_dumb_terminal() -> bool {
    std::env::var("TERM")
        .map(|value| value.eq_ignore_ascii_case("dumb"))
        .unwrap_or(false)
}

pub(crate) fn should_use_spinner(
    stderr_is_terminal: bool,
    quiet: bool,
    dumb_terminal: bool,
) -> bool {
    stderr_is_terminal && !quiet && !dumb_terminal
}

/// Shows the latest started or progress event on a spinner line. Every
/// other event goes to `tracing` with the spinner suspended.
pub(crate) struct ProgressSink {
    bar: ProgressBar,
}

impl ProgressSink {
    pub(crate) fn spinner() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    #[cfg(test)]
    fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl EventSink for ProgressSink {
    fn emit(&self, event: PipelineEvent) {
        match event.outcome {
            EventOutcome::Progress => self.bar.set_message(line(&event)),
            EventOutcome::Started => {
                self.bar.set_message(line(&event));
                self.bar.suspend(|| TracingSink.emit(event));
            }
            _ => self.bar.suspend(|| TracingSink.emit(event)),
        }
    }
}

fn line(event: &PipelineEvent) -> String {
    match event.detail.as_deref() {
        Some(detail) => format!("{} {} {detail}", event.stage, event.file),
        None => format!("{} {}", event.stage, event.file),
    }
}
