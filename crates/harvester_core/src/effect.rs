use crate::{JobId, Stage};

/// Side effects requested by [`crate::update`]; executed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    LogFailure {
        url: String,
        cause: String,
    },
    Progress {
        job_id: JobId,
        url: String,
        stage: Stage,
        completed: usize,
        total: usize,
    },
}
