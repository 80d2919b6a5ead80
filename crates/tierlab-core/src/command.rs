//! Lifecycle commands.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tierlab_vm::ResourceState;

/// One of the four lifecycle commands a topology can be driven through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleCommand {
    /// Create networks, images and VMs
    Define,
    /// Boot every VM
    Start,
    /// Shut every VM down
    Stop,
    /// Remove everything `define` created
    Undefine,
}

impl LifecycleCommand {
    /// All commands, in lifecycle order.
    pub const ALL: [LifecycleCommand; 4] = [
        LifecycleCommand::Define,
        LifecycleCommand::Start,
        LifecycleCommand::Stop,
        LifecycleCommand::Undefine,
    ];

    /// Settled state a VM ends up in after this command.
    pub fn vm_target(self) -> ResourceState {
        match self {
            LifecycleCommand::Define => ResourceState::Defined,
            LifecycleCommand::Start => ResourceState::Running,
            LifecycleCommand::Stop => ResourceState::Stopped,
            LifecycleCommand::Undefine => ResourceState::Absent,
        }
    }
}

impl fmt::Display for LifecycleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleCommand::Define => write!(f, "define"),
            LifecycleCommand::Start => write!(f, "start"),
            LifecycleCommand::Stop => write!(f, "stop"),
            LifecycleCommand::Undefine => write!(f, "undefine"),
        }
    }
}

impl FromStr for LifecycleCommand {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "define" => Ok(LifecycleCommand::Define),
            "start" => Ok(LifecycleCommand::Start),
            "stop" => Ok(LifecycleCommand::Stop),
            "undefine" => Ok(LifecycleCommand::Undefine),
            other => Err(CoreError::Config(format!(
                "unknown command '{other}' (expected define | start | stop | undefine)"
            ))),
        }
    }
}
