use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;

use crate::reconcile::{RebuildPhase, RebuildProgress};

const TEMPLATE: &str = "[{elapsed_precise}] {msg:>10} {bar:40.cyan/blue} {pos}/{len} [{eta}]";

/// Terminal progress bar for `sync`, one bar per rebuild phase.
pub struct SyncProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl SyncProgress {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }
}

impl RebuildProgress for SyncProgress {
    fn start(&self, phase: RebuildPhase, total: usize) {
        let bar = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::with_template(TEMPLATE) {
            bar.set_style(style.progress_chars("##-"));
        }
        bar.set_message(phase.label());
        if let Ok(mut slot) = self.bar.lock() {
            *slot = Some(bar);
        }
    }

    fn advance(&self, count: usize) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(bar) = slot.as_ref() {
                bar.inc(count as u64);
            }
        }
    }

    fn finish(&self) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
            }
        }
    }
}
