use crate::{HarvestSession, Stage};

/// Stage counts for progress display and the end-of-run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSummary {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl HarvestSession {
    pub fn summary(&self) -> SessionSummary {
        let mut summary = SessionSummary {
            total: self.urls().len(),
            ..SessionSummary::default()
        };
        for stage in self.stages() {
            match stage {
                Stage::Pending => summary.pending += 1,
                Stage::Fetching | Stage::Extracting => summary.in_flight += 1,
                Stage::Done => summary.succeeded += 1,
                Stage::Failed => summary.failed += 1,
            }
        }
        summary
    }
}
