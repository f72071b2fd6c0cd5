//! `TerminalSink`: presentation-layer implementation of `ProgressSink`.
//!
//! Managers publish step events from background tasks; this sink turns them
//! into spinner lines on a TTY and plain `→ / ✓ / ✗` lines otherwise.

use std::sync::{Mutex, PoisonError};

use deployer_common::{ProgressEvent, ProgressStatus};
use indicatif::ProgressBar;
use owo_colors::OwoColorize as _;

use crate::application::ports::ProgressSink;
use crate::output::{OutputContext, Styles, progress};

pub struct TerminalSink {
    styles: Styles,
    quiet: bool,
    spinners: bool,
    current: Mutex<Option<ProgressBar>>,
}

impl TerminalSink {
    #[must_use]
    pub fn new(ctx: &OutputContext) -> Self {
        Self {
            styles: ctx.styles.clone(),
            quiet: ctx.quiet,
            spinners: ctx.show_progress(),
            current: Mutex::new(None),
        }
    }

    /// Line printed for `event` when no spinner is active.
    #[must_use]
    pub fn format_line(&self, event: &ProgressEvent) -> String {
        match event.status {
            ProgressStatus::Running => format!(
                "  {} {} {}",
                "→".style(self.styles.step),
                event.message,
                format!("[{}%]", event.progress_percent).style(self.styles.dim)
            ),
            ProgressStatus::Success => format!("  {} {}", "✓".style(self.styles.success), event.message),
            ProgressStatus::Failed => format!("  {} {}", "✗".style(self.styles.error), event.message),
        }
    }
}

impl ProgressSink for TerminalSink {
    fn emit(&self, _topic: &str, event: ProgressEvent) {
        if self.quiet {
            return;
        }
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.spinners {
            let line = self.format_line(&event);
            if event.status == ProgressStatus::Failed {
                eprintln!("{line}");
            } else {
                println!("{line}");
            }
            return;
        }
        match event.status {
            ProgressStatus::Running => {
                if let Some(old) = current.take() {
                    old.finish_and_clear();
                }
                *current = Some(progress::spinner(&event.message));
            }
            ProgressStatus::Success => match current.take() {
                Some(pb) => progress::finish_ok(&pb, &event.message),
                None => println!("{}", self.format_line(&event)),
            },
            ProgressStatus::Failed => match current.take() {
                Some(pb) => progress::finish_error(&pb, &event.message),
                None => eprintln!("{}", self.format_line(&event)),
            },
        }
    }
}

impl Drop for TerminalSink {
    fn drop(&mut self) {
        if let Some(pb) = self
            .current
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pb.finish_and_clear();
        }
    }
}
