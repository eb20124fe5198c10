use harvester_core::Stage;
use harvester_engine::{HarvestProgress, ProgressSink};
use indicatif::{ProgressBar, ProgressStyle};

/// Renders harvest progress as a terminal bar.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");
        bar.set_style(style);
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for BarProgress {
    fn emit(&self, event: HarvestProgress) {
        let label = match event.stage {
            Stage::Failed => "failed",
            _ => "done",
        };
        self.bar.set_position(event.completed as u64);
        self.bar.set_message(format!("{label} {}", event.url));
    }
}
