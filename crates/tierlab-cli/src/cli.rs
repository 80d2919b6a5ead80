//! Command-line interface definition.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tierlab_core::LifecycleCommand;

/// Provision and tear down a load-balanced backend scenario on libvirt and
/// Open vSwitch.
#[derive(Parser, Debug)]
#[command(name = "tierlab")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Topology configuration file
    #[arg(short, long, global = true, env = "TIERLAB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Lifecycle state cache
    #[arg(long, global = true, env = "TIERLAB_STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Ignore the state cache and start from what the substrate reports
    #[arg(long, global = true)]
    pub refresh: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Create networks, disk images and VMs
    Define {
        /// Fail instead of reusing overlays left by an earlier define
        #[arg(long)]
        strict: bool,
    },

    /// Boot the backends, then the router
    Start,

    /// Shut down the router, then the backends
    Stop,

    /// Remove VMs, overlays and networks
    Undefine,

    /// Probe every resource and print its state
    Status,
}

impl Commands {
    /// Lifecycle command to execute; `None` for `status`.
    pub fn lifecycle(self) -> Option<LifecycleCommand> {
        match self {
            Commands::Define { .. } => Some(LifecycleCommand::Define),
            Commands::Start => Some(LifecycleCommand::Start),
            Commands::Stop => Some(LifecycleCommand::Stop),
            Commands::Undefine => Some(LifecycleCommand::Undefine),
            Commands::Status => None,
        }
    }

    /// Whether existing overlays may be reused.
    pub fn reuse_overlays(self) -> bool {
        !matches!(self, Commands::Define { strict: true })
    }
}
