use crate::{Effect, HarvestSession, JobId, Msg, Stage};

/// Pure aggregation step: applies a job message to the session and returns any effects.
///
/// Messages for unknown or already finished jobs are ignored, so every URL
/// ends in exactly one terminal stage.
pub fn update(mut session: HarvestSession, msg: Msg) -> (HarvestSession, Vec<Effect>) {
    let effects = match msg {
        Msg::StageChanged { job_id, stage } => {
            // Terminal stages are only reachable through Harvested/Failed.
            if !stage.is_terminal() {
                session.advance(job_id, stage);
            }
            Vec::new()
        }
        Msg::Harvested { job_id, record } => {
            if !session.advance(job_id, Stage::Done) {
                return (session, Vec::new());
            }
            let url = job_url(&session, job_id);
            session.record_success(url.clone(), record);
            vec![progress(&session, job_id, url, Stage::Done)]
        }
        Msg::Failed { job_id, cause } => {
            if !session.advance(job_id, Stage::Failed) {
                return (session, Vec::new());
            }
            let url = job_url(&session, job_id);
            session.record_failure(url.clone());
            vec![
                Effect::LogFailure {
                    url: url.clone(),
                    cause,
                },
                progress(&session, job_id, url, Stage::Failed),
            ]
        }
    };

    (session, effects)
}

fn job_url(session: &HarvestSession, job_id: JobId) -> String {
    session.url(job_id).unwrap_or_default().to_owned()
}

fn progress(session: &HarvestSession, job_id: JobId, url: String, stage: Stage) -> Effect {
    let summary = session.summary();
    Effect::Progress {
        job_id,
        url,
        stage,
        completed: summary.succeeded + summary.failed,
        total: summary.total,
    }
}
