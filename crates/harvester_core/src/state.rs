use crate::{QueryMap, ResultMap, ResultRecord};

/// Index of a URL in the session's input list. Duplicated URLs get distinct ids.
pub type JobId = usize;

/// Per-URL processing stage. Stages only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Stage {
    #[default]
    Pending,
    Fetching,
    Extracting,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

/// Aggregate of one harvest run: inputs, per-URL stages, results and failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestSession {
    urls: Vec<String>,
    queries: QueryMap,
    stages: Vec<Stage>,
    results: ResultMap,
    failures: Vec<String>,
}

impl HarvestSession {
    pub fn new(urls: Vec<String>, queries: QueryMap) -> Self {
        let stages = vec![Stage::Pending; urls.len()];
        Self {
            urls,
            queries,
            stages,
            results: ResultMap::new(),
            failures: Vec::new(),
        }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn url(&self, job_id: JobId) -> Option<&str> {
        self.urls.get(job_id).map(String::as_str)
    }

    pub fn queries(&self) -> &QueryMap {
        &self.queries
    }

    pub fn results(&self) -> &ResultMap {
        &self.results
    }

    /// Failed URLs in completion order; a URL listed twice in the input may fail twice.
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn stage(&self, job_id: JobId) -> Option<Stage> {
        self.stages.get(job_id).copied()
    }

    pub fn is_complete(&self) -> bool {
        self.stages.iter().all(|stage| stage.is_terminal())
    }

    /// Jobs that have not reached `Done` or `Failed`.
    pub fn unfinished_jobs(&self) -> Vec<JobId> {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| !stage.is_terminal())
            .map(|(job_id, _)| job_id)
            .collect()
    }

    pub(crate) fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Move a job forward. Returns false for unknown jobs, terminal jobs and
    /// backwards moves, leaving the session untouched.
    pub(crate) fn advance(&mut self, job_id: JobId, stage: Stage) -> bool {
        match self.stages.get_mut(job_id) {
            Some(current) if !current.is_terminal() && stage > *current => {
                *current = stage;
                true
            }
            _ => false,
        }
    }

    /// A success for a URL supersedes failures recorded for earlier duplicates.
    pub(crate) fn record_success(&mut self, url: String, record: ResultRecord) {
        self.failures.retain(|failed| *failed != url);
        self.results.insert(url, record);
    }

    /// A failure is not recorded when a duplicate of the URL already succeeded.
    pub(crate) fn record_failure(&mut self, url: String) {
        if !self.results.contains_key(&url) {
            self.failures.push(url);
        }
    }
}
