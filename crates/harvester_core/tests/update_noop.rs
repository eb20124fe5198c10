use harvester_core::{update, HarvestSession, Msg, QueryMap, Stage};

#[test]
fn messages_for_unknown_jobs_are_ignored() {
    let session = HarvestSession::new(vec!["http://a".into()], QueryMap::new());
    let (next, effects) = update(
        session.clone(),
        Msg::Failed {
            job_id: 9,
            cause: "boom".into(),
        },
    );

    assert_eq!(session, next);
    assert!(effects.is_empty());
}

#[test]
fn stage_changes_never_move_backwards() {
    let session = HarvestSession::new(vec!["http://a".into()], QueryMap::new());
    let (session, _) = update(
        session,
        Msg::StageChanged {
            job_id: 0,
            stage: Stage::Extracting,
        },
    );
    let (session, effects) = update(
        session,
        Msg::StageChanged {
            job_id: 0,
            stage: Stage::Fetching,
        },
    );

    assert_eq!(session.stage(0), Some(Stage::Extracting));
    assert!(effects.is_empty());
}
