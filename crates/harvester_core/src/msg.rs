use crate::{JobId, ResultRecord, Stage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    /// A job moved forward to a non-terminal stage.
    StageChanged { job_id: JobId, stage: Stage },
    /// All fields were extracted for a job.
    Harvested { job_id: JobId, record: ResultRecord },
    /// Fetch or extraction failed for a job.
    Failed { job_id: JobId, cause: String },
}
