//! Orchestrator tuning.

use crate::error::CoreError;
use std::time::Duration;
use tierlab_vm::OverlayPolicy;

/// How the orchestrator drives the substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Upper bound for any single mutating substrate call (default: 120s).
    pub step_timeout: Duration,
    /// Time a guest gets to shut down before it is forced off (default: 30s).
    pub stop_grace: Duration,
    /// Keep overlays left behind by an earlier `define` (default: true).
    pub reuse_overlays: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(120),
            stop_grace: Duration::from_secs(30),
            reuse_overlays: true,
        }
    }
}

impl OrchestratorConfig {
    /// Create a new config builder.
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }

    /// Overlay policy implied by `reuse_overlays`.
    pub fn overlay_policy(&self) -> OverlayPolicy {
        if self.reuse_overlays {
            OverlayPolicy::Reuse
        } else {
            OverlayPolicy::Exclusive
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.step_timeout.is_zero() {
            return Err(CoreError::Config("step_timeout must be > 0".into()));
        }
        // A graceful stop runs inside a step, so it has to fit.
        if self.stop_grace >= self.step_timeout {
            return Err(CoreError::Config(format!(
                "stop_grace ({}s) must be shorter than step_timeout ({}s)",
                self.stop_grace.as_secs(),
                self.step_timeout.as_secs()
            )));
        }
        Ok(())
    }
}

/// Builder for OrchestratorConfig.
#[derive(Debug, Default)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    /// Set the per-step timeout.
    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.config.step_timeout = timeout;
        self
    }

    /// Set the graceful shutdown window.
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.config.stop_grace = grace;
        self
    }

    /// Allow or forbid reusing existing overlays.
    pub fn reuse_overlays(mut self, reuse: bool) -> Self {
        self.config.reuse_overlays = reuse;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<OrchestratorConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
