//! agentmesh library root.
//!
//! Peer discovery, liveness tracking and load-balanced task hand-off between
//! AI agents on a local network.

pub mod cli;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod logging;
pub mod net;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod sessions;
pub mod sysload;

pub use cli::Commands;
pub use collaborators::{Collaborators, HealthDisplay, HealthSnapshot, StatusNotifier};
pub use config::{load_settings, Settings};
pub use error::{Error, Result};
pub use executor::TaskExecutor;
pub use node::{Node, NodeBuilder, TaskResult};
pub use registry::{AgentRecord, AgentRegistry, AgentStatus};
pub use sessions::{SessionStatus, SessionTable, TaskSession};
