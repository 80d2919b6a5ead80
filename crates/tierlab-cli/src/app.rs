//! Command dispatch.

use crate::cli::Commands;
use crate::config::CliConfig;
use tierlab_core::{
    build_topology, LifecycleState, Orchestrator, OrchestratorConfig, StateStore, Topology,
    TopologyConfig,
};
use tierlab_vm::{
    ImageBackend, ImageManager, QemuImg, ResourceProvider, ResourceState, VirshProvider,
};

/// Exit code when a lifecycle step failed.
pub const EXIT_FAILED: u8 = 1;

/// Exit code for configuration and validation errors.
pub const EXIT_INVALID: u8 = 2;

/// Everything needed to run a command, validated before any substrate call.
#[derive(Debug)]
pub struct Prepared {
    /// Topology to act on
    pub topology: Topology,
    /// Orchestrator tuning
    pub tuning: OrchestratorConfig,
}

/// Load and validate the topology and tuning for `command`.
pub fn prepare(command: Commands, config: &CliConfig) -> anyhow::Result<Prepared> {
    let topology_config = TopologyConfig::from_file(&config.config_path)?;
    let topology = build_topology(&topology_config)?;
    let tuning = config.orchestrator(command.reuse_overlays())?;
    if matches!(command, Commands::Define { .. }) {
        config.validate_images()?;
    }
    Ok(Prepared { topology, tuning })
}

/// Run `command` on the host substrate. Returns whether every step succeeded.
pub async fn run(
    command: Commands,
    config: &CliConfig,
    prepared: Prepared,
    refresh: bool,
) -> anyhow::Result<bool> {
    tracing::debug!(?config, "Configuration loaded");
    let orchestrator = Orchestrator::new(
        VirshProvider::new(config.virsh()),
        ImageManager::new(QemuImg::new(), config.image_layout()),
        prepared.tuning,
    );
    let store = StateStore::new(&config.state_file);
    dispatch(&orchestrator, command, &prepared.topology, &store, refresh).await
}

/// Run `command` with any orchestrator, persisting state through `store`.
pub async fn dispatch<P, B>(
    orchestrator: &Orchestrator<P, B>,
    command: Commands,
    topology: &Topology,
    store: &StateStore,
    refresh: bool,
) -> anyhow::Result<bool>
where
    P: ResourceProvider,
    B: ImageBackend,
{
    let state = if refresh {
        LifecycleState::new()
    } else {
        store.load()
    };

    let Some(lifecycle) = command.lifecycle() else {
        let state = orchestrator.reconcile(topology, state).await;
        persist(store, &state);
        for line in status_lines(topology, &state) {
            println!("{line}");
        }
        return Ok(true);
    };

    let run = orchestrator.execute(lifecycle, topology, state).await;
    persist(store, &run.state);
    println!("{}", run.report);
    Ok(run.report.is_success())
}

fn persist(store: &StateStore, state: &LifecycleState) {
    // The cache is rebuilt by probing, so losing it is not fatal.
    if let Err(e) = store.save(state) {
        tracing::warn!(error = %e, "Could not save state cache");
    }
}

/// One line per resource of `topology`, in define order.
pub fn status_lines(topology: &Topology, state: &LifecycleState) -> Vec<String> {
    topology
        .resource_ids()
        .into_iter()
        .map(|id| {
            let observed = state.get(&id).unwrap_or(ResourceState::Absent);
            format!("{:<28} {observed}", id.to_string())
        })
        .collect()
}
