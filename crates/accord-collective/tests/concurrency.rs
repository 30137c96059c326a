//! Shared engines driven from many threads at once.

use accord_collective::{
    Agent, BroadcastEventSink, CapabilityRegistry, CollectiveEvent, FormationSettings,
    NegotiationEngine, NegotiationSettings, NegotiationSpec, NegotiationStatus, NegotiationType,
    Payload, PerformanceTracker, RoundStatus, TaskRequirement, TeamFormationEngine,
};
use std::sync::{Arc, Barrier};
use std::thread;
use tokio::sync::broadcast;

const THREADS: usize = 16;

fn engine_with(sink: Arc<BroadcastEventSink>, settings: NegotiationSettings) -> NegotiationEngine {
    NegotiationEngine::new(Arc::new(PerformanceTracker::default()), settings)
        .unwrap()
        .with_events(sink)
}

fn participants() -> Vec<String> {
    (0..THREADS).map(|i| format!("p{}", i)).collect()
}

fn concluded_events(mut rx: broadcast::Receiver<CollectiveEvent>) -> usize {
    let mut concluded = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, CollectiveEvent::NegotiationConcluded { .. }) {
            concluded += 1;
        }
    }
    concluded
}

#[test]
fn concurrent_submissions_land_in_one_round() {
    let sink = Arc::new(BroadcastEventSink::new(64));
    let engine = engine_with(sink, NegotiationSettings::default());
    let spec = NegotiationSpec::new(NegotiationType::TaskAllocation, "p0")
        .with_participants(participants());
    let id = engine.create_negotiation(spec).unwrap().negotiation_id;
    engine.start_new_round(&id).unwrap();

    let barrier = Barrier::new(THREADS);
    thread::scope(|s| {
        for participant in participants() {
            let (engine, id, barrier) = (&engine, &id, &barrier);
            s.spawn(move || {
                barrier.wait();
                engine
                    .submit_proposal(id, &participant, Payload::new())
                    .unwrap();
            });
        }
    });

    let negotiation = engine.negotiation(&id).unwrap();
    assert_eq!(negotiation.rounds.len(), 1);
    assert_eq!(negotiation.current_round, 1);
    assert_eq!(negotiation.rounds[0].status, RoundStatus::Active);
    assert_eq!(negotiation.rounds[0].proposals.len(), THREADS);
    assert_eq!(negotiation.status, NegotiationStatus::InProgress);
}

#[test]
fn racing_consensus_concludes_once() {
    let sink = Arc::new(BroadcastEventSink::new(64));
    let rx = sink.subscribe();
    let engine = engine_with(sink, NegotiationSettings::default());
    let spec = NegotiationSpec::new(NegotiationType::TaskAllocation, "p0")
        .with_participants(participants());
    let id = engine.create_negotiation(spec).unwrap().negotiation_id;
    engine.start_new_round(&id).unwrap();

    let barrier = Barrier::new(THREADS);
    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let (engine, id, barrier) = (&engine, &id, &barrier);
                s.spawn(move || {
                    let mut terms = Payload::new();
                    terms.insert("winner".to_string(), serde_json::json!(i));
                    barrier.wait();
                    engine.complete_current_round(id, true, terms)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let wins: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(wins, vec![&NegotiationStatus::Completed]);

    let negotiation = engine.negotiation(&id).unwrap();
    assert_eq!(negotiation.status, NegotiationStatus::Completed);
    assert_eq!(negotiation.rounds.len(), 1);
    assert_eq!(concluded_events(rx), 1);
}

#[test]
fn concurrent_reads_expire_deadline_once() {
    let sink = Arc::new(BroadcastEventSink::new(64));
    let rx = sink.subscribe();
    let settings = NegotiationSettings {
        deadline: Some(chrono::Duration::milliseconds(20)),
        ..NegotiationSettings::default()
    };
    let engine = engine_with(sink, settings);
    let spec = NegotiationSpec::new(NegotiationType::TaskAllocation, "a")
        .with_participants(["a", "b"]);
    let id = engine.create_negotiation(spec).unwrap().negotiation_id;
    engine.start_new_round(&id).unwrap();

    thread::sleep(std::time::Duration::from_millis(50));

    let barrier = Barrier::new(THREADS);
    thread::scope(|s| {
        for _ in 0..THREADS {
            let (engine, id, barrier) = (&engine, &id, &barrier);
            s.spawn(move || {
                barrier.wait();
                let negotiation = engine.negotiation(id).unwrap();
                assert_eq!(negotiation.status, NegotiationStatus::Failed);
            });
        }
    });

    assert_eq!(concluded_events(rx), 1);
}

#[test]
fn concurrent_formations_keep_assignment_counts() {
    let tracker = Arc::new(PerformanceTracker::default());
    let registry = Arc::new(CapabilityRegistry::new(tracker));
    for i in 0..4 {
        registry
            .register(Agent::new(format!("agent-{}", i), "worker").with_capability("c", 0.9))
            .unwrap();
    }
    let formation = TeamFormationEngine::new(registry.clone(), FormationSettings::default());

    let barrier = Barrier::new(THREADS);
    let teams: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let (formation, barrier) = (&formation, &barrier);
                s.spawn(move || {
                    let task = TaskRequirement::new(format!("task-{}", i))
                        .with_capability("c", 0.5)
                        .with_team_size(1, 1);
                    barrier.wait();
                    formation.form_team(&task, "minimal_size").unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(teams.len(), THREADS);
    assert_eq!(formation.active_teams().len(), THREADS);
    let assigned: u32 = registry.agents().iter().map(|a| a.active_teams).sum();
    assert_eq!(assigned as usize, THREADS);

    thread::scope(|s| {
        for team in &teams {
            let formation = &formation;
            s.spawn(move || formation.disband_team(&team.team_id).unwrap());
        }
    });
    assert!(registry.agents().iter().all(|a| a.active_teams == 0));
}
