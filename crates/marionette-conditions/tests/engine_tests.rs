// Integration tests for the condition engine

use std::sync::Arc;
use std::time::Duration;

use marionette_client::{ChannelGameApi, GridPathfinder, OpenMapLoader, SharedState};
use marionette_conditions::{
    ConditionEngine, ControlOp, EngineError, GroupStore, Value,
};
use marionette_events::{
    ClientAction, ConditionEvent, ConditionKind, EventBus, EventEnvelope, EventType,
    PacketDirection, PacketEvent,
};
use tokio::sync::{broadcast, mpsc};

struct Harness {
    engine: ConditionEngine,
    actions: mpsc::UnboundedReceiver<ClientAction>,
    events: broadcast::Receiver<EventEnvelope>,
}

fn harness_with(store: GroupStore, state: SharedState) -> Harness {
    let (action_tx, actions) = mpsc::unbounded_channel();
    let (bus, events) = EventBus::new(64);
    let engine = ConditionEngine::builder("tester")
        .with_api(Arc::new(ChannelGameApi::new(action_tx)))
        .with_pathfinder(Arc::new(GridPathfinder))
        .with_map_loader(Box::new(OpenMapLoader {
            width: 100,
            height: 100,
        }))
        .with_state(state)
        .with_group_store(store)
        .with_events(bus.create_sender(1))
        .build()
        .expect("Failed to build engine");
    Harness {
        engine,
        actions,
        events,
    }
}

fn harness() -> Harness {
    harness_with(GroupStore::new(), SharedState::default())
}

fn inbound(raw: &str) -> PacketEvent {
    PacketEvent::decode(PacketDirection::Inbound, raw)
}

fn condition_events(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<ConditionEvent> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        if let EventType::Condition(event) = envelope.event {
            events.push(event);
        }
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_packet_condition_sees_packet() {
    let h = harness();
    h.engine
        .add_condition(
            ConditionKind::RecvPacket,
            "gold",
            "parts = packet.split(\" \");\nif parts[0] == \"gold\" {\n    attrs.gold = int(parts[1]);\n}",
            true,
        )
        .unwrap();
    h.engine.start();

    assert_eq!(h.engine.dispatch_packet(&inbound("gold 150")), 1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.engine.attr("gold"), Value::Int(150));

    // Outbound packets only reach send_packet conditions
    let outbound = PacketEvent::decode(PacketDirection::Outbound, "gold 999");
    assert_eq!(h.engine.dispatch_packet(&outbound), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deactivating_periodic_cancels_it() {
    let h = harness();
    h.engine
        .add_condition(
            ConditionKind::Periodic,
            "tick",
            "attrs.n = attrs.n + 1;\nsleep(1);",
            true,
        )
        .unwrap();
    h.engine.start();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    let Value::Int(runs) = h.engine.attr("n") else {
        panic!("n should be an int");
    };
    assert!(runs >= 2, "expected at least 2 runs, got {}", runs);
    assert_eq!(h.engine.live_periodic(), 1);

    assert!(h.engine.set_active(ConditionKind::Periodic, 0, false).unwrap());
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.engine.attr("n"), Value::Int(runs));
    assert_eq!(h.engine.live_periodic(), 0);

    // Reactivation restarts it on the next supervisor pass
    h.engine.set_active(ConditionKind::Periodic, 0, true).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.engine.attr("n"), Value::Int(runs + 1));
}

#[tokio::test(start_paused = true)]
async fn test_cond_off_zero_keeps_caller_active() {
    let h = harness();
    h.engine
        .add_condition(ConditionKind::RecvPacket, "a_other", "x = 1;", true)
        .unwrap();
    h.engine
        .add_condition(ConditionKind::RecvPacket, "b_killer", "cond.off = 0;", true)
        .unwrap();
    h.engine
        .add_condition(ConditionKind::SendPacket, "c_send", "x = 1;", true)
        .unwrap();
    h.engine
        .add_condition(ConditionKind::Periodic, "d_loop", "sleep(5);", true)
        .unwrap();
    h.engine.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.engine.live_periodic(), 1);

    h.engine.dispatch_packet(&inbound("ping"));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let active: Vec<(String, bool)> = h
        .engine
        .sequence_index()
        .into_iter()
        .map(|entry| {
            let condition = h.engine.find(entry.kind, &entry.name).unwrap();
            (entry.name, condition.active)
        })
        .collect();
    assert_eq!(
        active,
        vec![
            ("a_other".to_string(), false),
            ("b_killer".to_string(), true),
            ("c_send".to_string(), false),
            ("d_loop".to_string(), false),
        ]
    );
    assert_eq!(h.engine.live_periodic(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_control_errors_are_not_fatal() {
    let h = harness();
    h.engine
        .add_condition(
            ConditionKind::RecvPacket,
            "bad_control",
            "cond.on = 0;\ncond.on = 99;\ncond.off = \"x\";\nattrs.reached = 1;",
            true,
        )
        .unwrap();
    h.engine.start();

    h.engine.dispatch_packet(&inbound("ping"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.engine.attr("reached"), Value::Int(1));
    assert_eq!(h.engine.conditions(ConditionKind::RecvPacket).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_condition_is_removed_once() {
    let mut h = harness();
    h.engine
        .add_condition(ConditionKind::RecvPacket, "broken", "x = 1 / 0;", true)
        .unwrap();
    h.engine
        .add_condition(ConditionKind::RecvPacket, "fine", "attrs.ok = 1;", true)
        .unwrap();
    h.engine.start();

    h.engine.dispatch_packet(&inbound("ping"));
    h.engine.dispatch_packet(&inbound("ping"));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let remaining: Vec<String> = h
        .engine
        .conditions(ConditionKind::RecvPacket)
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(remaining, vec!["fine".to_string()]);
    assert_eq!(h.engine.attr("ok"), Value::Int(1));

    let removed: Vec<ConditionEvent> = condition_events(&mut h.events)
        .into_iter()
        .filter(|e| matches!(e, ConditionEvent::Removed { .. }))
        .collect();
    assert_eq!(removed.len(), 1);
    match &removed[0] {
        ConditionEvent::Removed { name, error, .. } => {
            assert_eq!(name, "broken");
            assert!(error.as_deref().unwrap().contains("division by zero"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_source_is_recompiled_only_on_change() {
    let h = harness();
    h.engine
        .add_condition(ConditionKind::RecvPacket, "count", "attrs.n = attrs.n + 1;", true)
        .unwrap();
    assert_eq!(h.engine.compile_count(), 1);
    h.engine.start();

    for _ in 0..3 {
        h.engine.dispatch_packet(&inbound("ping"));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.engine.attr("n"), Value::Int(3));
    assert_eq!(h.engine.compile_count(), 1);

    h.engine
        .update_source(ConditionKind::RecvPacket, 0, "attrs.n = attrs.n + 10;")
        .unwrap();
    assert_eq!(h.engine.compile_count(), 2);

    let err = h
        .engine
        .update_source(ConditionKind::RecvPacket, 0, "attrs.n = ;")
        .unwrap_err();
    assert!(matches!(err, EngineError::Compile { .. }));
    assert_eq!(
        h.engine.conditions(ConditionKind::RecvPacket)[0].source,
        "attrs.n = attrs.n + 10;"
    );

    h.engine.dispatch_packet(&inbound("ping"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.engine.attr("n"), Value::Int(13));
    assert_eq!(h.engine.compile_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_add_rejects_bad_source_and_duplicates() {
    let h = harness();
    let err = h
        .engine
        .add_condition(ConditionKind::RecvPacket, "bad", "while {", true)
        .unwrap_err();
    assert!(matches!(err, EngineError::Compile { .. }));
    assert!(h.engine.conditions(ConditionKind::RecvPacket).is_empty());

    h.engine
        .add_condition(ConditionKind::RecvPacket, "dup", "x = 1;", true)
        .unwrap();
    let err = h
        .engine
        .add_condition(ConditionKind::RecvPacket, "dup", "x = 2;", true)
        .unwrap_err();
    assert!(matches!(err, EngineError::Registry(_)));

    // Same name under another kind is a different condition
    h.engine
        .add_condition(ConditionKind::SendPacket, "dup", "x = 2;", true)
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_control_uses_natural_order() {
    let h = harness();
    for (kind, name) in [
        (ConditionKind::Periodic, "attr10"),
        (ConditionKind::RecvPacket, "attr2"),
        (ConditionKind::SendPacket, "Attr1"),
    ] {
        h.engine.add_condition(kind, name, "x = 1;", false).unwrap();
    }

    let names: Vec<String> = h
        .engine
        .sequence_index()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["Attr1", "attr2", "attr10"]);

    let toggled = h.engine.control(ControlOp::On, &Value::Int(2)).unwrap();
    assert_eq!(toggled.len(), 1);
    assert_eq!(toggled[0].name, "attr2");
    assert!(h.engine.find(ConditionKind::RecvPacket, "attr2").unwrap().active);
    assert!(h.engine.time_since_last_change() < Duration::from_millis(1));
}

#[tokio::test(start_paused = true)]
async fn test_walk_without_path_reports_failure() {
    let mut h = harness();
    h.engine
        .add_condition(
            ConditionKind::RecvPacket,
            "walker",
            "attrs.ok = walk_to(500, 500);\nattrs.done = 1;",
            true,
        )
        .unwrap();
    h.engine.start();

    h.engine.dispatch_packet(&inbound("go"));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.engine.attr("done"), Value::Int(1));
    assert_eq!(h.engine.attr("ok"), Value::Bool(false));
    assert!(h.actions.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_stop_blocks_dispatch() {
    let h = harness();
    h.engine
        .add_condition(ConditionKind::RecvPacket, "any", "attrs.n = 1;", true)
        .unwrap();
    assert!(h.engine.is_stopped());
    assert_eq!(h.engine.dispatch_packet(&inbound("ping")), 0);

    h.engine.start();
    h.engine.stop();
    assert_eq!(h.engine.dispatch_packet(&inbound("ping")), 0);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.engine.attr("n"), Value::Int(0));
}

#[tokio::test(start_paused = true)]
async fn test_script_packets_reach_the_client() {
    let mut h = harness();
    h.engine
        .add_condition(
            ConditionKind::RecvPacket,
            "greeter",
            "send_packet(\"say hello\");\nqueries(0.5, false, true, false, false);",
            true,
        )
        .unwrap();
    h.engine.start();

    h.engine.dispatch_packet(&inbound("ping"));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(
        h.actions.try_recv().unwrap(),
        ClientAction::SendPacket("say hello".to_string())
    );
    assert_eq!(
        h.actions.try_recv().unwrap(),
        ClientAction::Query(marionette_events::QueryKind::Inventory)
    );
    assert!(h.actions.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_group_values_follow_the_leader() {
    let store = GroupStore::new();
    let first_state = SharedState::default();
    let first = harness_with(store.clone(), first_state.clone());
    let second_state = SharedState::default();
    let second = harness_with(store.clone(), second_state.clone());

    first
        .engine
        .add_condition(ConditionKind::RecvPacket, "writer", "group.target = 7;", true)
        .unwrap();
    first.engine.start();
    first.engine.dispatch_packet(&inbound("ping"));
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Nobody else sees values stored before the leader is known
    assert_eq!(second.engine.group().get("target", Value::Nil), Value::Nil);

    first_state.set_leader_id(Some(42));
    second_state.set_leader_id(Some(42));
    assert_eq!(first.engine.group().get("target", Value::Nil), Value::Int(7));

    second
        .engine
        .add_condition(
            ConditionKind::RecvPacket,
            "reader",
            "attrs.seen = group.get(\"target\", 0);",
            true,
        )
        .unwrap();
    second.engine.start();
    second.engine.dispatch_packet(&inbound("ping"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(second.engine.attr("seen"), Value::Int(7));
}

#[tokio::test(start_paused = true)]
async fn test_directory_round_trip() {
    let h = harness();
    h.engine
        .add_condition(ConditionKind::RecvPacket, "heal", "if player.hp_percent < 50 {\n    send_packet(\"u_s 1\");\n}", true)
        .unwrap();
    h.engine
        .add_periodic("loop2", "sleep(1);", false, 2.0)
        .unwrap();
    h.engine
        .add_condition(ConditionKind::SendPacket, "loop10", "x = 1;", true)
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let written = h.engine.export_dir(dir.path()).unwrap();
    assert_eq!(written.len(), 3);
    std::fs::write(dir.path().join("junk.txt"), "nonsense\n1\nx = 1;").unwrap();

    let other = harness();
    assert_eq!(other.engine.load_dir(dir.path()).unwrap(), 3);

    for kind in ConditionKind::ALL {
        let strip = |c: marionette_conditions::Condition| (c.name, c.source, c.active);
        let expected: Vec<_> = h.engine.conditions(kind).into_iter().map(strip).collect();
        let loaded: Vec<_> = other.engine.conditions(kind).into_iter().map(strip).collect();
        assert_eq!(loaded, expected);
    }
}

#[tokio::test(start_paused = true)]
async fn test_reset_forgets_everything() {
    let h = harness();
    h.engine
        .add_condition(ConditionKind::Periodic, "p", "attrs.n = 1;\nsleep(1);", true)
        .unwrap();
    h.engine
        .add_condition(ConditionKind::RecvPacket, "r", "x = 1;", true)
        .unwrap();
    h.engine.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.engine.live_periodic(), 1);

    h.engine.reset();
    h.engine.reset_attrs();
    assert!(h.engine.sequence_index().is_empty());
    assert_eq!(h.engine.live_periodic(), 0);
    assert_eq!(h.engine.running_count(), 0);
    assert_eq!(h.engine.attr("n"), Value::Int(0));
}

fn removed_names(events: &[ConditionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ConditionEvent::Removed { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

fn compile_failures(events: &[ConditionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ConditionEvent::CompileFailed { .. }))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_integer_overflow_removes_condition() {
    let mut h = harness();
    let overflow = "x = (-9223372036854775807 - 1) % -1;";
    h.engine
        .add_condition(ConditionKind::RecvPacket, "recv_overflow", overflow, true)
        .unwrap();
    h.engine
        .add_condition(ConditionKind::Periodic, "loop_overflow", overflow, true)
        .unwrap();
    h.engine
        .add_condition(
            ConditionKind::SendPacket,
            "range_overflow",
            "x = range(-9223372036854775807 - 1, 9223372036854775807);",
            true,
        )
        .unwrap();
    h.engine.start();

    h.engine.dispatch_packet(&inbound("ping"));
    h.engine
        .dispatch_packet(&PacketEvent::decode(PacketDirection::Outbound, "pong"));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(h.engine.sequence_index().is_empty());
    assert_eq!(h.engine.live_periodic(), 0);
    let mut removed = removed_names(&condition_events(&mut h.events));
    removed.sort();
    assert_eq!(removed, vec!["loop_overflow", "range_overflow", "recv_overflow"]);
}

#[tokio::test(start_paused = true)]
async fn test_updated_periodic_source_restarts_task() {
    let h = harness();
    h.engine
        .add_condition(
            ConditionKind::Periodic,
            "loop",
            "attrs.a = attrs.a + 1;\nsleep(1);",
            true,
        )
        .unwrap();
    assert_eq!(h.engine.compile_count(), 1);
    h.engine.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.engine.attr("a"), Value::Int(1));

    h.engine
        .update_source(
            ConditionKind::Periodic,
            0,
            "attrs.b = attrs.b + 1;\nsleep(1);",
        )
        .unwrap();
    assert_eq!(h.engine.compile_count(), 2);

    // The old task is cancelled mid-sleep and the new body starts on the next pass
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.engine.attr("b"), Value::Int(1));

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(h.engine.attr("a"), Value::Int(1));
    let Value::Int(runs) = h.engine.attr("b") else {
        panic!("b should be an int");
    };
    assert!(runs >= 2, "expected at least 2 runs, got {}", runs);
    assert_eq!(h.engine.live_periodic(), 1);
    assert_eq!(h.engine.compile_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_saved_sources_compile_when_scheduled() {
    let mut h = harness();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("loop.txt"), "periodical\n1\nattrs.n = ;").unwrap();
    std::fs::write(dir.path().join("reply.txt"), "recv_packet\n1\nif {").unwrap();
    assert_eq!(h.engine.load_dir(dir.path()).unwrap(), 2);
    assert_eq!(h.engine.compile_count(), 0);
    h.engine.start();

    // Several supervisor passes fail the same way and report it once
    tokio::time::sleep(Duration::from_millis(550)).await;
    let periodic = h.engine.conditions(ConditionKind::Periodic);
    assert_eq!(periodic.len(), 1);
    assert!(periodic[0].last_error.is_some());
    assert_eq!(h.engine.live_periodic(), 0);

    // A packet condition that does not compile is removed when triggered
    assert_eq!(h.engine.dispatch_packet(&inbound("ping")), 0);
    assert!(h.engine.conditions(ConditionKind::RecvPacket).is_empty());

    let events = condition_events(&mut h.events);
    assert_eq!(compile_failures(&events), 2);
    assert_eq!(removed_names(&events), vec!["reply"]);

    // Re-adding the same broken condition reports it again
    std::fs::remove_file(dir.path().join("loop.txt")).unwrap();
    assert_eq!(h.engine.load_dir(dir.path()).unwrap(), 1);
    h.engine.dispatch_packet(&inbound("ping"));
    assert_eq!(compile_failures(&condition_events(&mut h.events)), 1);

    h.engine
        .update_source(ConditionKind::Periodic, 0, "attrs.n = 1;\nsleep(1);")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.engine.attr("n"), Value::Int(1));
    assert_eq!(h.engine.conditions(ConditionKind::Periodic)[0].last_error, None);
    assert_eq!(h.engine.live_periodic(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subgroup_values_stay_within_party() {
    let store = GroupStore::new();
    let states: Vec<SharedState> = (0..3).map(|_| SharedState::default()).collect();
    for (state, index) in states.iter().zip([1, 1, 2]) {
        state.set_leader_id(Some(5));
        state.set_subgroup_index(Some(index));
    }
    let parties: Vec<Harness> = states
        .iter()
        .map(|state| harness_with(store.clone(), state.clone()))
        .collect();

    for h in &parties {
        h.engine
            .add_condition(
                ConditionKind::RecvPacket,
                "count",
                "subgroup.hits = subgroup.get(\"hits\") + 1;\nattrs.hits = subgroup.hits;",
                true,
            )
            .unwrap();
        h.engine.start();
    }
    for h in &parties {
        h.engine.dispatch_packet(&inbound("ping"));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(parties[0].engine.attr("hits"), Value::Int(1));
    assert_eq!(parties[1].engine.attr("hits"), Value::Int(2));
    assert_eq!(parties[2].engine.attr("hits"), Value::Int(1));
    assert_eq!(store.subgroup_count(5), 2);

    parties[0].engine.reset();
    assert_eq!(store.subgroup_count(5), 0);
}

#[tokio::test(start_paused = true)]
async fn test_subgroup_outside_party_fails_condition() {
    let h = harness();
    h.engine
        .add_condition(ConditionKind::RecvPacket, "lonely", "subgroup.x = 1;", true)
        .unwrap();
    h.engine.start();
    h.engine.dispatch_packet(&inbound("ping"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(h.engine.conditions(ConditionKind::RecvPacket).is_empty());
}
