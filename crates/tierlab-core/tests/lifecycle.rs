//! End-to-end lifecycle tests against the in-memory substrate.
//!
//! Run with: `cargo test -p tierlab-core --test lifecycle`

use std::path::{Path, PathBuf};
use tierlab_core::{
    build_topology, CoreError, LifecycleCommand, LifecycleState, Orchestrator,
    OrchestratorConfig, Outcome, StateStore, Topology, TopologyConfig,
};
use tierlab_vm::{
    Call, ImageLayout, ImageManager, MemorySubstrate, ResourceId, ResourceState, Role,
};

const BASE: &str = "/lab/cdps-vm-base.qcow2";
const GOLDEN: &str = "/lab/golden.qcow2";
const IMAGES: &str = "/lab/images";

type Lab = Orchestrator<MemorySubstrate, MemorySubstrate>;

fn lab(substrate: &MemorySubstrate, config: OrchestratorConfig) -> Lab {
    Orchestrator::new(
        substrate.clone(),
        ImageManager::new(substrate.clone(), ImageLayout::new(BASE, IMAGES)),
        config,
    )
}

fn overlay(vm: &str) -> PathBuf {
    Path::new(IMAGES).join(format!("{vm}.qcow2"))
}

fn scenario(json: &str) -> Topology {
    build_topology(&TopologyConfig::from_json_str(json).unwrap()).unwrap()
}

fn attach(vm: &str, network: &str) -> Call {
    Call::AttachInterface {
        vm: vm.into(),
        network: network.into(),
    }
}

/// The two-backend scenario from config file to teardown.
#[tokio::test]
async fn test_two_backend_scenario() {
    let substrate = MemorySubstrate::new().with_file(BASE);
    let orch = lab(&substrate, OrchestratorConfig::default());
    let topology = scenario(r#"{"backendCount": 2, "debugLevel": "INFO"}"#);

    let run = orch
        .execute(LifecycleCommand::Define, &topology, LifecycleState::new())
        .await;
    assert!(run.report.is_success(), "{}", run.report);
    assert_eq!(
        substrate.journal(),
        vec![
            Call::CreateNetwork("backend-net-1".into()),
            Call::CreateOverlay(overlay("backend-1")),
            Call::CreateOverlay(overlay("backend-2")),
            Call::CreateOverlay(overlay("router")),
            Call::CreateVm("backend-1".into()),
            attach("backend-1", "backend-net-1"),
            Call::CreateVm("backend-2".into()),
            attach("backend-2", "backend-net-1"),
            Call::CreateVm("router".into()),
            attach("router", "backend-net-1"),
        ]
    );
    assert_eq!(substrate.vm_disk("router"), Some(overlay("router")));

    substrate.clear_journal();
    let run = orch
        .execute(LifecycleCommand::Start, &topology, run.state)
        .await;
    assert!(run.report.is_success());
    assert_eq!(
        substrate.journal(),
        vec![
            Call::StartVm("backend-1".into()),
            Call::StartVm("backend-2".into()),
            Call::StartVm("router".into()),
        ]
    );

    substrate.clear_journal();
    let run = orch
        .execute(LifecycleCommand::Stop, &topology, run.state)
        .await;
    assert!(run.report.is_success());
    assert_eq!(
        substrate.journal(),
        vec![
            Call::StopVm("router".into()),
            Call::StopVm("backend-2".into()),
            Call::StopVm("backend-1".into()),
        ]
    );

    substrate.clear_journal();
    let run = orch
        .execute(LifecycleCommand::Undefine, &topology, run.state)
        .await;
    assert!(run.report.is_success());
    assert_eq!(
        substrate.journal(),
        vec![
            Call::DestroyVm("router".into()),
            Call::DestroyVm("backend-2".into()),
            Call::DestroyVm("backend-1".into()),
            Call::RemoveImage(overlay("router")),
            Call::RemoveImage(overlay("backend-2")),
            Call::RemoveImage(overlay("backend-1")),
            Call::DestroyNetwork("backend-net-1".into()),
        ]
    );

    // Operator-provided base survives; nothing else is left.
    assert!(substrate.has_file(Path::new(BASE)));
    assert!(!substrate.has_network("backend-net-1"));
    assert_eq!(substrate.vm_state("backend-1"), ResourceState::Absent);
    assert_eq!(
        run.state.iter().collect::<Vec<_>>(),
        vec![(&ResourceId::BaseImage, ResourceState::Defined)]
    );
}

/// Running any command twice: the second run changes nothing.
#[tokio::test]
async fn test_every_command_is_idempotent() {
    let substrate = MemorySubstrate::new().with_file(BASE);
    let orch = lab(&substrate, OrchestratorConfig::default());
    let topology = scenario(r#"{"backendCount": 3, "backendNetworks": 2, "uplink": true}"#);

    let mut state = LifecycleState::new();
    for command in LifecycleCommand::ALL {
        let first = orch.execute(command, &topology, state).await;
        assert!(first.report.is_success(), "{}", first.report);

        substrate.clear_journal();
        let second = orch.execute(command, &topology, first.state).await;
        assert!(second.report.is_success());
        assert_eq!(second.report.applied(), 0, "{command} applied changes twice");
        assert!(
            substrate.journal().is_empty(),
            "{command} repeated calls: {:?}",
            substrate.journal()
        );
        state = second.state;
    }
}

fn position(journal: &[Call], call: &Call) -> usize {
    journal
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("{call:?} missing from {journal:?}"))
}

/// Creation and teardown order hold for every supported topology shape.
#[tokio::test]
async fn test_order_holds_for_every_topology() {
    for backends in 1..=5u8 {
        for networks in 1..=backends {
            for uplink in [false, true] {
                let json = format!(
                    r#"{{"backendCount": {backends}, "backendNetworks": {networks}, "uplink": {uplink}}}"#
                );
                let topology = scenario(&json);
                let substrate = MemorySubstrate::new().with_file(BASE);
                let orch = lab(&substrate, OrchestratorConfig::default());

                let run = orch
                    .execute(LifecycleCommand::Define, &topology, LifecycleState::new())
                    .await;
                assert!(run.report.is_success(), "{json}: {}", run.report);
                let journal = substrate.journal();
                for vm in topology.vms() {
                    let created = position(&journal, &Call::CreateVm(vm.id.clone()));
                    assert!(position(&journal, &Call::CreateOverlay(overlay(&vm.id))) < created);
                    for network in vm.networks() {
                        assert!(
                            position(&journal, &Call::CreateNetwork(network.into())) < created,
                            "{json}: {} created before {network}",
                            vm.id
                        );
                    }
                }

                let run = orch
                    .execute(LifecycleCommand::Start, &topology, run.state)
                    .await;
                let run = orch
                    .execute(LifecycleCommand::Stop, &topology, run.state)
                    .await;
                substrate.clear_journal();
                let run = orch
                    .execute(LifecycleCommand::Undefine, &topology, run.state)
                    .await;
                assert!(run.report.is_success(), "{json}: {}", run.report);

                let journal = substrate.journal();
                let router = position(&journal, &Call::DestroyVm("router".into()));
                let first_network = topology
                    .networks()
                    .iter()
                    .map(|n| position(&journal, &Call::DestroyNetwork(n.id.clone())))
                    .min()
                    .unwrap();
                for vm in topology.vms().iter().filter(|vm| vm.role == Role::Backend) {
                    let destroyed = position(&journal, &Call::DestroyVm(vm.id.clone()));
                    assert!(router < destroyed, "{json}: {} destroyed before router", vm.id);
                    assert!(destroyed < first_network);
                }
                assert!(router < first_network);
            }
        }
    }
}

/// Define survives a failure halfway and picks up where it stopped.
#[tokio::test]
async fn test_define_resumes_after_failure() {
    let substrate = MemorySubstrate::new().with_file(BASE);
    let orch = lab(&substrate, OrchestratorConfig::default());
    let topology = scenario(r#"{"backendCount": 2}"#);
    substrate.fail_on(Call::CreateVm("backend-2".into()));

    let run = orch
        .execute(LifecycleCommand::Define, &topology, LifecycleState::new())
        .await;
    let failure = run.report.first_failure().unwrap();
    assert_eq!(failure.resource, ResourceId::Vm("backend-2".into()));
    assert!(matches!(
        &failure.outcome,
        Outcome::Failed(CoreError::Provider { command, target, .. })
            if *command == LifecycleCommand::Define && *target == ResourceState::Defined
    ));
    assert_eq!(run.report.not_attempted(), 1);
    assert_eq!(substrate.vm_state("router"), ResourceState::Absent);
    // No rollback.
    assert_eq!(substrate.vm_state("backend-1"), ResourceState::Defined);

    substrate.clear_journal();
    let run = orch
        .execute(LifecycleCommand::Define, &topology, run.state)
        .await;
    assert!(run.report.is_success());
    assert_eq!(
        substrate.journal(),
        vec![
            Call::CreateVm("backend-2".into()),
            attach("backend-2", "backend-net-1"),
            Call::CreateVm("router".into()),
            attach("router", "backend-net-1"),
        ]
    );
}

/// A VM defined without its interfaces gets them on the next define.
#[tokio::test]
async fn test_define_completes_partial_vm() {
    let substrate = MemorySubstrate::new().with_file(BASE);
    let orch = lab(&substrate, OrchestratorConfig::default());
    let topology = scenario(r#"{"backendCount": 1, "uplink": true}"#);
    substrate.fail_on(attach("router", "backend-net-1"));

    let run = orch
        .execute(LifecycleCommand::Define, &topology, LifecycleState::new())
        .await;
    assert_eq!(run.report.failed(), 1);

    substrate.clear_journal();
    let run = orch
        .execute(LifecycleCommand::Define, &topology, run.state)
        .await;
    assert!(run.report.is_success());
    // The uplink was attached before the failure.
    assert_eq!(substrate.journal(), vec![attach("router", "backend-net-1")]);
}

/// Transitional entries left by an interrupted run are never trusted.
#[tokio::test]
async fn test_interrupted_run_is_recovered() {
    let substrate = MemorySubstrate::new().with_file(BASE);
    let orch = lab(&substrate, OrchestratorConfig::default());
    let topology = scenario(r#"{"backendCount": 1}"#);

    let run = orch
        .execute(LifecycleCommand::Define, &topology, LifecycleState::new())
        .await;
    let mut state = run.state;
    // Process died right after marking the VM as starting.
    state.set(ResourceId::Vm("backend-1".into()), ResourceState::Starting);
    // And the cache claims a VM runs that was never started.
    state.set(ResourceId::Vm("router".into()), ResourceState::Running);

    substrate.clear_journal();
    let run = orch
        .execute(LifecycleCommand::Start, &topology, state)
        .await;
    assert!(run.report.is_success());
    assert_eq!(
        substrate.journal(),
        vec![
            Call::StartVm("backend-1".into()),
            Call::StartVm("router".into()),
        ]
    );
    assert!(run.state.iter().all(|(_, s)| !s.is_transitional()));
}

/// Reconcile rebuilds a lost cache from the substrate alone.
#[tokio::test]
async fn test_reconcile_rebuilds_state() {
    let substrate = MemorySubstrate::new().with_file(BASE);
    let orch = lab(&substrate, OrchestratorConfig::default());
    let topology = scenario(r#"{"backendCount": 2}"#);

    let run = orch
        .execute(LifecycleCommand::Define, &topology, LifecycleState::new())
        .await;
    let run = orch
        .execute(LifecycleCommand::Start, &topology, run.state)
        .await;
    substrate.set_vm_state("backend-2", ResourceState::Stopped);

    let rebuilt = orch.reconcile(&topology, LifecycleState::new()).await;
    assert_eq!(rebuilt.len(), 8);
    assert_eq!(
        rebuilt.get(&ResourceId::Vm("backend-2".into())),
        Some(ResourceState::Stopped)
    );
    assert_ne!(rebuilt, run.state);
    assert_eq!(
        rebuilt.get(&ResourceId::Overlay("router".into())),
        Some(ResourceState::Defined)
    );
}

/// Exclusive overlays: an existing overlay is an error, not a reuse.
#[tokio::test]
async fn test_strict_define_rejects_existing_overlay() {
    let substrate = MemorySubstrate::new()
        .with_file(BASE)
        .with_file(overlay("backend-1"));
    let strict = OrchestratorConfig::builder()
        .reuse_overlays(false)
        .build()
        .unwrap();
    let orch = lab(&substrate, strict);
    let topology = scenario(r#"{"backendCount": 1}"#);

    let run = orch
        .execute(LifecycleCommand::Define, &topology, LifecycleState::new())
        .await;
    let failure = run.report.first_failure().unwrap();
    assert_eq!(failure.resource, ResourceId::Overlay("backend-1".into()));
    assert!(matches!(
        &failure.outcome,
        Outcome::Failed(CoreError::ImageExists { path, .. }) if *path == overlay("backend-1")
    ));
    assert!(run.report.into_result().is_err());
}

/// A base materialized from a source image is removed with the last overlay.
#[tokio::test]
async fn test_managed_base_is_released() {
    let substrate = MemorySubstrate::new().with_file(GOLDEN);
    let orch = Orchestrator::new(
        substrate.clone(),
        ImageManager::new(
            substrate.clone(),
            ImageLayout::new(BASE, IMAGES).with_base_source(GOLDEN),
        ),
        OrchestratorConfig::default(),
    );
    let topology = scenario(r#"{"backendCount": 1}"#);

    let run = orch
        .execute(LifecycleCommand::Define, &topology, LifecycleState::new())
        .await;
    assert!(run.report.is_success());
    assert_eq!(substrate.journal()[1], Call::MaterializeBase(BASE.into()));

    substrate.clear_journal();
    let run = orch
        .execute(LifecycleCommand::Undefine, &topology, run.state)
        .await;
    assert!(run.report.is_success());
    assert_eq!(
        substrate.journal().last(),
        Some(&Call::RemoveImage(BASE.into()))
    );
    assert!(!substrate.has_file(Path::new(BASE)));
    assert!(substrate.has_file(Path::new(GOLDEN)));
    assert!(run.state.is_empty());
}

/// The cache survives process restarts through the state file.
#[tokio::test]
async fn test_state_file_between_invocations() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join(".tierlab-state.json"));
    let substrate = MemorySubstrate::new().with_file(BASE);
    let topology = scenario(r#"{"backendCount": 2}"#);

    for command in [LifecycleCommand::Define, LifecycleCommand::Start] {
        let orch = lab(&substrate, OrchestratorConfig::default());
        let run = orch.execute(command, &topology, store.load()).await;
        store.save(&run.state).unwrap();
        run.report.into_result().unwrap();
    }

    let state = store.try_load().unwrap();
    assert_eq!(
        state.get(&ResourceId::Vm("router".into())),
        Some(ResourceState::Running)
    );
    assert_eq!(
        state.get(&ResourceId::Network("backend-net-1".into())),
        Some(ResourceState::Defined)
    );
}
