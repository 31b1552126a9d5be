use chrono::{DateTime, TimeZone, Utc};
use helpdesk_core::{DecisionTree, GraphDescription, OutcomeKind, SessionState};
use helpdesk_engine::{
    EngineConfig, OutcomeRecorder, SessionEngine, StatsReporter, StoreRecorder,
};
use helpdesk_storage::{HelpdeskStore, SharedStore};
use std::sync::Arc;
use tempfile::NamedTempFile;

fn ts(offset_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_771_855_200_000 + offset_ms)
        .single()
        .expect("valid timestamp")
}

fn tree() -> Arc<DecisionTree> {
    let description: GraphDescription = serde_json::from_value(serde_json::json!({
        "root": "q1",
        "nodes": {
            "q1": {"type": "question", "prompt": "Does the game launch?", "options": [
                {"label": "Yes", "next": "q2"},
                {"label": "No", "next": "sol_none"}
            ]},
            "q2": {"type": "question", "prompt": "Is the overlay visible?", "options": [
                {"label": "Yes", "next": "sol_A"},
                {"label": "No", "next": "sol_B"}
            ]},
            "sol_A": {"type": "solution", "prompt": "Toggle it with F6."},
            "sol_B": {"type": "solution", "prompt": "Reinstall the mod."},
            "sol_none": {"type": "solution", "prompt": "Check your Java install."}
        }
    }))
    .expect("description");
    Arc::new(DecisionTree::load(&description).expect("tree"))
}

#[test]
fn traversal_is_persisted_and_survives_reopen() {
    let file = NamedTempFile::new().expect("temp db");
    let session_id;
    {
        let store = SharedStore::new(HelpdeskStore::open(file.path()).expect("open"));
        let recorder = Arc::new(StoreRecorder::new(store.clone()));
        let engine = SessionEngine::new(tree(), recorder, EngineConfig::default());

        let (session, _) = engine.start("u1", "guild", ts(0)).expect("start");
        engine.choose(&session.session_id, "Yes", ts(1_000)).expect("q2");
        let step = engine
            .choose(&session.session_id, "Yes", ts(2_000))
            .expect("sol_A");
        assert!(step.is_solved());
        assert_eq!(
            engine.session(&session.session_id).expect("snapshot").state,
            SessionState::Solved
        );
        session_id = session.session_id;
    }

    let store = HelpdeskStore::open(file.path()).expect("reopen");
    let events = store
        .hit_events_for_session(&session_id)
        .expect("session events");
    let log: Vec<(&str, OutcomeKind)> = events
        .iter()
        .map(|event| (event.node_id.as_str(), event.kind))
        .collect();
    assert_eq!(
        log,
        vec![
            ("q1", OutcomeKind::Visited),
            ("q2", OutcomeKind::Visited),
            ("sol_A", OutcomeKind::Visited),
            ("sol_A", OutcomeKind::Solved),
        ]
    );
    assert_eq!(events[3].resolution_tag.as_deref(), Some("sol_A:solved"));

    let counts = store.counts_for("sol_A").expect("counts");
    assert_eq!((counts.visited, counts.solved), (1, 1));
}

#[test]
fn stats_rank_persisted_counters() {
    let store = SharedStore::new(HelpdeskStore::open_in_memory().expect("store"));
    let recorder = Arc::new(StoreRecorder::new(store));
    let engine = SessionEngine::new(tree(), recorder.clone(), EngineConfig::default());

    for (user, path) in [
        ("u1", ["Yes", "No"]),
        ("u2", ["Yes", "No"]),
        ("u3", ["Yes", "Yes"]),
    ] {
        let (session, _) = engine.start(user, "guild", ts(0)).expect("start");
        for label in path {
            engine.choose(&session.session_id, label, ts(1)).expect("step");
        }
    }
    let (abandoned, _) = engine.start("u4", "guild", ts(0)).expect("start");
    engine.abandon(&abandoned.session_id, ts(1)).expect("abandon");

    let reporter = StatsReporter::new(&*recorder);
    let visited: Vec<(String, u64)> = reporter
        .top_visited(3)
        .expect("visited")
        .into_iter()
        .map(|stat| (stat.node_id, stat.visited))
        .collect();
    assert_eq!(
        visited,
        vec![
            ("q1".to_string(), 4),
            ("q2".to_string(), 3),
            ("sol_B".to_string(), 2),
        ]
    );

    let solved = reporter.top_solved(5).expect("solved");
    assert_eq!(solved[0].node_id, "sol_B");
    assert_eq!(solved[1].node_id, "sol_A");
    assert_eq!(reporter.solve_rate("sol_B").expect("rate"), 1.0);
    assert_eq!(reporter.solve_rate("q1").expect("rate"), 0.0);
    assert_eq!(
        recorder.counts_for("sol_none").expect("untouched").visited,
        0
    );
}
