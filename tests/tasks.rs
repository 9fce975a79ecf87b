//! Task submission, load balancing and response correlation across nodes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use agentmesh::net::MemoryNetwork;
use agentmesh::protocol::{encode, EnvelopeBuilder, MessageType, TaskOutcome};
use agentmesh::registry::AgentUpdate;
use agentmesh::{AgentStatus, Error, SessionStatus};
use common::*;

#[tokio::test(start_paused = true)]
async fn task_goes_to_capable_agent() {
    let net = MemoryNetwork::new();
    let a0 = start_node(&net, "a0", 10, &["terminal"], echo("a0"));
    let a1 = start_node(&net, "a1", 1, &["text-generation"], echo("a1"));
    let a2 = start_node(&net, "a2", 2, &["file-analysis"], echo("a2"));
    settle().await;

    let result = a0
        .node
        .submit_task("explain X", &caps(&["text-generation"]))
        .await
        .unwrap();

    assert_eq!(result.agent_id, "a1");
    assert_eq!(result.output, "Task processed by a1: explain X");
    // Consumed on delivery.
    assert!(a0.node.sessions().get(&result.session_id).is_none());

    let executed = a1.node.sessions().get(&result.session_id).unwrap();
    assert_eq!(executed.status, SessionStatus::Completed);
    assert!(a2.node.sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unresponsive_agent_times_out_then_goes_offline() {
    let net = MemoryNetwork::new();
    let a0 = start_node(&net, "a0", 10, &["terminal"], echo("a0"));
    let a1 = start_node(&net, "a1", 1, &["text-generation"], Arc::new(Stall));
    let a2 = start_node(&net, "a2", 2, &["file-analysis"], echo("a2"));
    settle().await;

    net.silence(a1.addr);
    let started = tokio::time::Instant::now();
    let err = a0
        .node
        .submit_task("explain X", &caps(&["text-generation"]))
        .await
        .unwrap_err();

    assert!(started.elapsed() >= Duration::from_secs(30));
    let (session_id, waited) = match err {
        Error::Timeout { session_id, waited } => (session_id, waited),
        other => panic!("expected timeout, got {:?}", other),
    };
    assert_eq!(waited, Duration::from_secs(30));

    let session = a0.node.sessions().get(&session_id).unwrap();
    assert_eq!(session.assigned_agent_id, "a1");
    assert_eq!(session.status, SessionStatus::TimedOut);
    assert!(a2.node.sessions().is_empty());

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(
        a0.node.registry().get("a1").unwrap().status,
        AgentStatus::Offline
    );
    assert!(a0
        .node
        .registry()
        .list_online(&caps(&["text-generation"]))
        .is_empty());

    let err = a0
        .node
        .submit_task("explain X", &caps(&["text-generation"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoAgentsAvailable));
}

#[tokio::test(start_paused = true)]
async fn back_to_back_tasks_follow_queue_depth() {
    let net = MemoryNetwork::new();
    let a0 = start_node(&net, "a0", 10, &["terminal"], echo("a0"));
    let _a1 = start_node(&net, "a1", 1, &["text-generation"], Arc::new(Stall));
    let _a2 = start_node(&net, "a2", 2, &["text-generation"], Arc::new(Stall));
    settle().await;

    let registry = a0.node.registry();
    let a2 = registry.get("a2").unwrap();
    registry.upsert(
        "a2",
        AgentUpdate::at(a2.last_seen, a2.last_sent_at).load(3, 0.0, 0.0),
    );
    assert_eq!(registry.get("a1").unwrap().queue_depth, 0);

    let required = caps(&["text-generation"]);
    let (first, second) = tokio::join!(
        a0.node.submit_task("first", &required),
        a0.node.submit_task("second", &required),
    );

    for result in [first, second] {
        let Err(Error::Timeout { session_id, .. }) = result else {
            panic!("expected timeout");
        };
        let session = a0.node.sessions().get(&session_id).unwrap();
        assert_eq!(session.assigned_agent_id, "a1");
    }
}

#[tokio::test(start_paused = true)]
async fn duplicate_response_changes_nothing() {
    let net = MemoryNetwork::new();
    let a0 = start_node(&net, "a0", 10, &["terminal"], echo("a0"));
    let a1 = start_node(&net, "a1", 1, &["text-generation"], echo("a1"));
    settle().await;

    let result = a0
        .node
        .submit_task("explain X", &caps(&["text-generation"]))
        .await
        .unwrap();

    let sessions_before = a0.node.sessions().snapshot();
    let record_before = a0.node.registry().get("a1").unwrap();

    let duplicate = EnvelopeBuilder::new(MessageType::TaskResponse, "a1")
        .to("a0")
        .session(&result.session_id)
        .timestamp(record_before.last_sent_at)
        .json(&TaskOutcome::Ok {
            output: "again".to_string(),
        })
        .unwrap()
        .build()
        .unwrap();
    let frame = encode(&duplicate, 8192).unwrap();
    net.inject(a1.addr, a0.addr, &frame).await.unwrap();
    net.inject(a1.addr, a0.addr, &frame).await.unwrap();
    settle().await;

    assert_eq!(a0.node.sessions().snapshot(), sessions_before);
    let record_after = a0.node.registry().get("a1").unwrap();
    assert_eq!(record_after.status, record_before.status);
    assert_eq!(record_after.queue_depth, record_before.queue_depth);
}

#[tokio::test(start_paused = true)]
async fn duplicate_request_executes_once() {
    let net = MemoryNetwork::new();
    let a0 = start_node(&net, "a0", 10, &["terminal"], echo("a0"));
    let counting = Arc::new(Counting::default());
    let a1 = start_node(&net, "a1", 1, &["text-generation"], counting.clone());
    settle().await;

    let request = EnvelopeBuilder::new(MessageType::TaskRequest, "a0")
        .to("a1")
        .session("dup-1")
        .text("explain X")
        .build()
        .unwrap();
    let frame = encode(&request, 8192).unwrap();
    net.inject(a0.addr, a1.addr, &frame).await.unwrap();
    net.inject(a0.addr, a1.addr, &frame).await.unwrap();
    settle().await;

    assert_eq!(counting.calls(), 1);
    assert_eq!(a1.node.sessions().len(), 1);
    // The response had no waiting session on a0 and was discarded.
    assert!(a0.node.sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn executor_failure_is_reported_to_submitter() {
    let net = MemoryNetwork::new();
    let a0 = start_node(&net, "a0", 10, &["terminal"], echo("a0"));
    let _a1 = start_node(&net, "a1", 1, &["text-generation"], Arc::new(Broken));
    settle().await;

    let err = a0
        .node
        .submit_task("explain X", &caps(&["text-generation"]))
        .await
        .unwrap_err();
    match err {
        Error::Remote { agent_id, message } => {
            assert_eq!(agent_id, "a1");
            assert!(message.contains("tool not installed"));
        }
        other => panic!("expected remote failure, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn no_agents_fails_fast() {
    let net = MemoryNetwork::new();
    let a0 = start_node(&net, "a0", 10, &["terminal"], echo("a0"));
    settle().await;

    let started = tokio::time::Instant::now();
    let err = a0.node.submit_task("explain X", &[]).await.unwrap_err();
    assert!(matches!(err, Error::NoAgentsAvailable));
    assert!(started.elapsed() < Duration::from_millis(1));
    assert!(a0.node.sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn oversized_task_is_rejected_before_dispatch() {
    let net = MemoryNetwork::new();
    let a0 = start_node(&net, "a0", 10, &["terminal"], echo("a0"));
    let _a1 = start_node(&net, "a1", 1, &["text-generation"], echo("a1"));
    settle().await;

    let huge = "x".repeat(8193);
    let err = a0.node.submit_task(&huge, &[]).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(a0.node.sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unreachable_target_fails_without_leaking_session() {
    let net = MemoryNetwork::new();
    let a0 = start_node(&net, "a0", 10, &["terminal"], echo("a0"));
    let a1 = start_node(&net, "a1", 1, &["text-generation"], echo("a1"));
    settle().await;

    let depth_before = a0.node.registry().get("a1").unwrap().queue_depth;
    net.isolate(a1.addr);
    let err = a0
        .node
        .submit_task("explain X", &caps(&["text-generation"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert!(a0.node.sessions().is_empty());
    assert_eq!(
        a0.node.registry().get("a1").unwrap().queue_depth,
        depth_before
    );
}

#[tokio::test(start_paused = true)]
async fn finished_sessions_are_collected() {
    let net = MemoryNetwork::new();
    let a0 = start_node(&net, "a0", 10, &["terminal"], echo("a0"));
    let a1 = start_node(&net, "a1", 1, &["text-generation"], echo("a1"));
    settle().await;

    a0.node
        .submit_task("explain X", &caps(&["text-generation"]))
        .await
        .unwrap();
    assert_eq!(a1.node.sessions().len(), 1);

    // Task timeout (30s) plus grace (60s), then the next cycle.
    tokio::time::sleep(Duration::from_secs(101)).await;
    assert!(a1.node.sessions().is_empty());
}
