//! CLI commands for agentmesh using clap.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::config::{get_settings_path, load_settings_or_default, save_settings, Settings};
use crate::node::Node;

/// agentmesh - peer discovery and task hand-off between AI agents on a LAN.
#[derive(Parser)]
#[command(name = "agentmesh")]
#[command(version)]
#[command(about = "Distributed AI agent mesh", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a mesh node until interrupted
    Run {
        #[command(flatten)]
        node: NodeArgs,

        /// Program that executes incoming tasks (the task text is appended)
        #[arg(long)]
        executor: Option<String>,

        /// Extra arguments passed to the executor before the task text
        #[arg(long = "executor-arg", allow_hyphen_values = true)]
        executor_args: Vec<String>,
    },

    /// Join the mesh briefly and submit one task
    Submit {
        /// Task description
        description: String,

        /// Capability the executing agent must have (repeatable)
        #[arg(short, long = "require")]
        require: Vec<String>,

        /// Seconds to wait for peers before submitting
        #[arg(long, default_value_t = 3)]
        wait: u64,

        #[command(flatten)]
        node: NodeArgs,
    },

    /// Join the mesh briefly and print what this node sees
    Status {
        /// Seconds to wait for peers before reporting
        #[arg(long, default_value_t = 3)]
        wait: u64,

        #[command(flatten)]
        node: NodeArgs,
    },

    /// Settings file commands
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print effective settings as JSON
    Show,

    /// Write default settings to ~/.agentmesh/settings.json
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Overrides applied on top of the settings file.
#[derive(Args, Debug, Default, Clone)]
pub struct NodeArgs {
    /// Unicast (TCP) port to listen on
    #[arg(long, env = "AGENTMESH_LISTEN_PORT")]
    pub listen_port: Option<u16>,

    /// Discovery (UDP) port
    #[arg(long, env = "AGENTMESH_DISCOVERY_PORT")]
    pub discovery_port: Option<u16>,

    /// Capability to advertise (repeatable; replaces the configured list)
    #[arg(short, long = "capability")]
    pub capabilities: Vec<String>,

    /// Fixed agent id
    #[arg(long, env = "AGENTMESH_AGENT_ID")]
    pub agent_id: Option<String>,
}

impl NodeArgs {
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(port) = self.listen_port {
            settings.listen_port = port;
        }
        if let Some(port) = self.discovery_port {
            settings.discovery_port = port;
        }
        if !self.capabilities.is_empty() {
            settings.capabilities = self.capabilities.clone();
        }
        if let Some(id) = &self.agent_id {
            settings.agent_id = Some(id.clone());
        }
    }
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Run {
                node,
                executor,
                executor_args,
            } => cmd_run(node, executor, executor_args).await,
            Command::Submit {
                description,
                require,
                wait,
                node,
            } => cmd_submit(description, require, *wait, node).await,
            Command::Status { wait, node } => cmd_status(*wait, node).await,
            Command::Config(cmd) => cmd_config(cmd),
        }
    }
}

fn settings_with(args: &NodeArgs) -> Settings {
    let mut settings = load_settings_or_default();
    args.apply(&mut settings);
    settings
}

/// Settings for a short-lived node: an ephemeral unicast port unless one was
/// asked for, so it can run next to a long-lived node on the same host.
fn transient_settings(args: &NodeArgs) -> Settings {
    let mut settings = settings_with(args);
    if args.listen_port.is_none() {
        settings.listen_port = 0;
    }
    settings
}

// Command implementations

async fn cmd_run(args: &NodeArgs, executor: &Option<String>, executor_args: &[String]) -> Result<()> {
    let mut settings = settings_with(args);
    if let Some(program) = executor {
        settings.executor.program = Some(program.clone());
        settings.executor.args = executor_args.to_vec();
    }

    let node = Node::builder(settings)
        .bind()
        .await
        .context("Failed to start node")?;

    println!("Agent {} listening on port {}", node.agent_id(), node.port());
    println!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    println!("\nStopping...");
    node.shutdown().await;
    Ok(())
}

async fn cmd_submit(description: &str, require: &[String], wait: u64, args: &NodeArgs) -> Result<()> {
    let node = Node::builder(transient_settings(args))
        .bind()
        .await
        .context("Failed to start node")?;

    tokio::time::sleep(Duration::from_secs(wait)).await;

    let result = node.submit_task(description, require).await;
    node.shutdown().await;

    match result {
        Ok(result) => {
            println!("{}", result.output);
            tracing::debug!(
                session = %result.session_id,
                "Task completed by {}",
                result.agent_id
            );
            Ok(())
        }
        Err(e) if e.is_timeout() => {
            anyhow::bail!("{} (no response from the assigned agent)", e)
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_status(wait: u64, args: &NodeArgs) -> Result<()> {
    let node = Node::builder(transient_settings(args))
        .bind()
        .await
        .context("Failed to start node")?;

    tokio::time::sleep(Duration::from_secs(wait)).await;
    print!("{}", node.status_report());

    node.shutdown().await;
    Ok(())
}

fn cmd_config(cmd: &ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show => {
            let settings = load_settings_or_default();
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        ConfigCommand::Init { force } => {
            let path = get_settings_path()?;
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            save_settings(&Settings::default(), &path)?;
            println!("Wrote default settings to {}", path.display());
        }
    }
    Ok(())
}
