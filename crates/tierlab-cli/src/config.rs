//! Host configuration for the `tierlab` binary.
//!
//! Paths and tuning are loaded from environment variables with sensible
//! defaults; command-line flags override them.

use std::path::PathBuf;
use std::time::Duration;
use tierlab_core::{CoreError, OrchestratorConfig};
use tierlab_vm::{ImageLayout, VirshConfig};

/// Configuration of the host the scenario runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliConfig {
    /// Topology configuration file.
    pub config_path: PathBuf,

    /// Shared base disk image.
    pub base_image: PathBuf,

    /// Image the base is materialized from when missing (optional).
    pub base_source: Option<PathBuf>,

    /// Directory holding per-VM overlays.
    pub image_dir: PathBuf,

    /// Lifecycle state cache.
    pub state_file: PathBuf,

    /// Run substrate tools through `sudo` (default: true).
    pub sudo: bool,

    /// Per-step timeout (default: 120s).
    pub step_timeout: Duration,

    /// Graceful shutdown window (default: 30s).
    pub stop_grace: Duration,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("base image not found: {} (set TIERLAB_BASE_SOURCE to create it)", .0.display())]
    MissingBase(PathBuf),

    #[error("base image source not found: {}", .0.display())]
    MissingBaseSource(PathBuf),

    #[error(transparent)]
    Orchestrator(#[from] CoreError),
}

impl Default for CliConfig {
    fn default() -> Self {
        let tuning = OrchestratorConfig::default();
        Self {
            config_path: PathBuf::from("tierlab.json"),
            base_image: PathBuf::from("cdps-vm-base.qcow2"),
            base_source: None,
            image_dir: PathBuf::from("images"),
            state_file: PathBuf::from(".tierlab-state.json"),
            sudo: true,
            step_timeout: tuning.step_timeout,
            stop_grace: tuning.stop_grace,
        }
    }
}

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `TIERLAB_CONFIG` | `tierlab.json` |
    /// | `TIERLAB_BASE_IMAGE` | `cdps-vm-base.qcow2` |
    /// | `TIERLAB_BASE_SOURCE` | unset |
    /// | `TIERLAB_IMAGE_DIR` | `images` |
    /// | `TIERLAB_STATE_FILE` | `.tierlab-state.json` |
    /// | `TIERLAB_SUDO` | `true` |
    /// | `TIERLAB_STEP_TIMEOUT` | `120` (seconds) |
    /// | `TIERLAB_STOP_GRACE` | `30` (seconds) |
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let seconds = |key: &str| {
            var(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
        };

        Self {
            config_path: var("TIERLAB_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(default.config_path),
            base_image: var("TIERLAB_BASE_IMAGE")
                .map(PathBuf::from)
                .unwrap_or(default.base_image),
            base_source: var("TIERLAB_BASE_SOURCE")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            image_dir: var("TIERLAB_IMAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.image_dir),
            state_file: var("TIERLAB_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or(default.state_file),
            sudo: var("TIERLAB_SUDO")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(default.sudo),
            step_timeout: seconds("TIERLAB_STEP_TIMEOUT").unwrap_or(default.step_timeout),
            stop_grace: seconds("TIERLAB_STOP_GRACE").unwrap_or(default.stop_grace),
        }
    }

    /// Apply command-line overrides.
    pub fn with_overrides(mut self, config: Option<PathBuf>, state_file: Option<PathBuf>) -> Self {
        if let Some(path) = config {
            self.config_path = path;
        }
        if let Some(path) = state_file {
            self.state_file = path;
        }
        self
    }

    /// Where images live.
    pub fn image_layout(&self) -> ImageLayout {
        let layout = ImageLayout::new(&self.base_image, &self.image_dir);
        match &self.base_source {
            Some(source) => layout.with_base_source(source),
            None => layout,
        }
    }

    /// Settings for the libvirt/Open vSwitch provider.
    pub fn virsh(&self) -> VirshConfig {
        VirshConfig {
            sudo: self.sudo,
            ..VirshConfig::default()
        }
    }

    /// Orchestrator tuning; `reuse_overlays` comes from the command line.
    pub fn orchestrator(&self, reuse_overlays: bool) -> Result<OrchestratorConfig, ConfigError> {
        Ok(OrchestratorConfig::builder()
            .step_timeout(self.step_timeout)
            .stop_grace(self.stop_grace)
            .reuse_overlays(reuse_overlays)
            .build()?)
    }

    /// Check that a base image is available or can be produced.
    ///
    /// Only `define` needs this; later commands never touch the base.
    pub fn validate_images(&self) -> Result<(), ConfigError> {
        if self.base_image.exists() {
            return Ok(());
        }
        match &self.base_source {
            None => Err(ConfigError::MissingBase(self.base_image.clone())),
            Some(source) if !source.exists() => {
                Err(ConfigError::MissingBaseSource(source.clone()))
            }
            Some(_) => Ok(()),
        }
    }
}
