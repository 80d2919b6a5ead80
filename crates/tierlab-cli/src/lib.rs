//! # tierlab-cli
//!
//! Command-line front end for tierlab scenarios.
//!
//! ## Quick Start
//!
//! ```bash
//! echo '{"backendCount": 2, "debugLevel": "INFO"}' > tierlab.json
//! tierlab define
//! tierlab start
//! tierlab status
//! tierlab stop
//! tierlab undefine
//! ```
//!
//! Host paths are configured via environment variables:
//!
//! ```bash
//! export TIERLAB_BASE_IMAGE=/var/lib/tierlab/cdps-vm-base.qcow2
//! export TIERLAB_IMAGE_DIR=/var/lib/tierlab/images
//! export TIERLAB_SUDO=false
//! tierlab define --strict
//! ```
//!
//! ## Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | `0` | Every step succeeded |
//! | `1` | A step failed; re-run the command once the cause is fixed |
//! | `2` | Invalid configuration; nothing was changed |

pub mod app;
mod cli;
mod config;

pub use cli::{Cli, Commands};
pub use config::{CliConfig, ConfigError};
