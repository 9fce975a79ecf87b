//! Helpers for running several nodes over an in-process network.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentmesh::collaborators::{Collaborators, MemoryHealthDisplay, MemoryNotifier};
use agentmesh::executor::{EchoExecutor, ExecutionError, FailureCode, TaskExecutor};
use agentmesh::net::MemoryNetwork;
use agentmesh::{Node, Settings};
use async_trait::async_trait;

pub const PORT: u16 = 9877;

pub struct TestNode {
    pub node: Node,
    pub addr: SocketAddr,
    pub notifier: MemoryNotifier,
    pub health: MemoryHealthDisplay,
}

pub fn addr_of(host: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, host], PORT))
}

pub fn caps(list: &[&str]) -> Vec<String> {
    list.iter().map(|c| c.to_string()).collect()
}

pub fn settings(capabilities: &[&str]) -> Settings {
    Settings {
        capabilities: caps(capabilities),
        ..Settings::default()
    }
}

/// Attach a node at 10.0.0.<host> and start it.
pub fn start_node(
    net: &MemoryNetwork,
    agent_id: &str,
    host: u8,
    capabilities: &[&str],
    executor: Arc<dyn TaskExecutor>,
) -> TestNode {
    let settings = settings(capabilities);
    let addr = addr_of(host);
    let (transport, inbox) = net.attach(addr, settings.max_payload_bytes);
    let notifier = MemoryNotifier::default();
    let health = MemoryHealthDisplay::default();

    let node = Node::builder(settings)
        .agent_id(agent_id)
        .hostname(format!("host-{}", agent_id))
        .executor(executor)
        .collaborators(Collaborators {
            health: Arc::new(health.clone()),
            notifier: Arc::new(notifier.clone()),
        })
        .start(Arc::new(transport), inbox, PORT)
        .unwrap();

    TestNode {
        node,
        addr,
        notifier,
        health,
    }
}

pub fn echo(agent_id: &str) -> Arc<dyn TaskExecutor> {
    Arc::new(EchoExecutor::new(agent_id))
}

/// Let queued messages drain. Time is paused in these tests, so this only
/// advances the clock once every node is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Never finishes: an agent that accepted work and went quiet.
pub struct Stall;

#[async_trait]
impl TaskExecutor for Stall {
    fn name(&self) -> &str {
        "stall"
    }

    async fn execute(&self, _description: &str) -> Result<String, ExecutionError> {
        std::future::pending().await
    }
}

/// Counts invocations and echoes the description back.
#[derive(Default)]
pub struct Counting {
    pub calls: AtomicU32,
}

impl Counting {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    async fn execute(&self, description: &str) -> Result<String, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(description.to_string())
    }
}

/// Always fails without retry.
pub struct Broken;

#[async_trait]
impl TaskExecutor for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn execute(&self, _description: &str) -> Result<String, ExecutionError> {
        Err(ExecutionError::new(FailureCode::CliMissing, "tool not installed"))
    }
}
