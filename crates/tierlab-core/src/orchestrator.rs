//! The lifecycle orchestrator.
//!
//! Turns a lifecycle command into an ordered plan of per-resource steps and
//! runs them one at a time against a [`ResourceProvider`] and an
//! [`ImageManager`]. Every step observes its resource on the substrate first
//! and only calls the substrate when the resource is not already in the
//! step's target state, so re-running any command is safe.

use crate::command::LifecycleCommand;
use crate::config::OrchestratorConfig;
use crate::error::{CoreError, Result};
use crate::report::{CommandReport, Outcome, StepOutcome};
use crate::state::LifecycleState;
use crate::topology::Topology;
use std::future::Future;
use std::time::Instant;
use tierlab_vm::{
    ImageBackend, ImageManager, NetworkResource, OverlayPolicy, ResourceId, ResourceProvider,
    ResourceState, VmError, VmResource,
};
use tracing::{debug, error, info, instrument, warn};

/// One planned step: drive `resource` towards `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Resource the step acts on
    pub resource: ResourceId,
    /// Settled state the step aims for
    pub target: ResourceState,
}

impl Step {
    fn new(resource: ResourceId, target: ResourceState) -> Self {
        Self { resource, target }
    }
}

/// Result of [`Orchestrator::execute`].
#[derive(Debug)]
pub struct Execution {
    /// Lifecycle state after the command, reflecting what was observed
    pub state: LifecycleState,
    /// Per-step outcomes
    pub report: CommandReport,
}

/// Drives a [`Topology`] through define, start, stop and undefine.
pub struct Orchestrator<P, B> {
    provider: P,
    images: ImageManager<B>,
    config: OrchestratorConfig,
}

impl<P: ResourceProvider, B: ImageBackend> Orchestrator<P, B> {
    /// Create an orchestrator over a substrate.
    pub fn new(provider: P, images: ImageManager<B>, config: OrchestratorConfig) -> Self {
        Self {
            provider,
            images,
            config,
        }
    }

    /// The substrate provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The image manager.
    pub fn images(&self) -> &ImageManager<B> {
        &self.images
    }

    /// Active tuning.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Ordered steps `command` performs on `topology`.
    ///
    /// The order is fixed by resource kind: networks before images before
    /// VMs on the way up, the reverse on the way down, and the router always
    /// after the backends when starting (before them when stopping).
    pub fn plan(&self, command: LifecycleCommand, topology: &Topology) -> Vec<Step> {
        let vms = topology.vms();
        let vm_step =
            |vm: &VmResource| Step::new(ResourceId::Vm(vm.id.clone()), command.vm_target());
        match command {
            LifecycleCommand::Define => {
                let mut steps: Vec<Step> = topology
                    .networks()
                    .iter()
                    .map(|n| Step::new(ResourceId::Network(n.id.clone()), ResourceState::Defined))
                    .collect();
                steps.push(Step::new(ResourceId::BaseImage, ResourceState::Defined));
                steps.extend(vms.iter().map(|vm| {
                    Step::new(ResourceId::Overlay(vm.disk.clone()), ResourceState::Defined)
                }));
                steps.extend(vms.iter().map(vm_step));
                steps
            }
            LifecycleCommand::Start => vms.iter().map(vm_step).collect(),
            LifecycleCommand::Stop => vms.iter().rev().map(vm_step).collect(),
            LifecycleCommand::Undefine => {
                let mut steps: Vec<Step> = vms.iter().rev().map(vm_step).collect();
                steps.extend(vms.iter().rev().map(|vm| {
                    Step::new(ResourceId::Overlay(vm.disk.clone()), ResourceState::Absent)
                }));
                steps.extend(
                    topology
                        .networks()
                        .iter()
                        .rev()
                        .map(|n| Step::new(ResourceId::Network(n.id.clone()), ResourceState::Absent)),
                );
                // Operator-provided bases are kept.
                let base_target = if self.images.layout().base_source.is_some() {
                    ResourceState::Absent
                } else {
                    ResourceState::Defined
                };
                steps.push(Step::new(ResourceId::BaseImage, base_target));
                steps
            }
        }
    }

    /// Run `command` against `topology`, starting from `state`.
    ///
    /// Steps run strictly in plan order. The first failing step stops the
    /// command; nothing is rolled back and the remaining steps are reported
    /// as not attempted. The returned state always reflects what was last
    /// observed, so the same command can simply be run again.
    #[instrument(skip_all, fields(command = %command))]
    pub async fn execute(
        &self,
        command: LifecycleCommand,
        topology: &Topology,
        mut state: LifecycleState,
    ) -> Execution {
        let plan = self.plan(command, topology);
        info!(steps = plan.len(), "Executing {command}");

        let mut report = CommandReport::new(command);
        let mut stopped = false;

        for step in plan {
            if stopped {
                report.steps.push(StepOutcome {
                    resource: step.resource,
                    target: step.target,
                    outcome: Outcome::NotAttempted,
                });
                continue;
            }

            let started = Instant::now();
            let outcome = match self.apply(command, &step, topology, &mut state).await {
                Ok(true) => {
                    info!(
                        resource = %step.resource,
                        target = %step.target,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Applied"
                    );
                    Outcome::Applied
                }
                Ok(false) => {
                    debug!(resource = %step.resource, target = %step.target, "Already satisfied");
                    Outcome::AlreadySatisfied
                }
                Err(e) => {
                    error!(
                        resource = %step.resource,
                        target = %step.target,
                        error = %e,
                        "Step failed, stopping {command}"
                    );
                    self.refresh(&step.resource, &mut state).await;
                    stopped = true;
                    Outcome::Failed(e)
                }
            };

            report.steps.push(StepOutcome {
                resource: step.resource,
                target: step.target,
                outcome,
            });
        }

        info!(
            applied = report.applied(),
            satisfied = report.satisfied(),
            failed = report.failed(),
            "Finished {command}"
        );
        Execution { state, report }
    }

    /// Probe every resource of `topology` and record what the substrate
    /// reports. Resources that cannot be probed are dropped from the state.
    #[instrument(skip_all)]
    pub async fn reconcile(&self, topology: &Topology, mut state: LifecycleState) -> LifecycleState {
        for id in topology.resource_ids() {
            self.refresh(&id, &mut state).await;
        }
        state
    }

    /// Re-probe `id`, recording the result. A failed probe forgets the
    /// resource so the next run probes it again.
    async fn refresh(&self, id: &ResourceId, state: &mut LifecycleState) {
        match self.bounded(self.probe(id)).await {
            Ok(observed) => state.set(id.clone(), observed),
            Err(e) => {
                warn!(resource = %id, error = %e, "Could not probe resource");
                state.remove(id);
            }
        }
    }

    async fn probe(&self, id: &ResourceId) -> tierlab_vm::Result<ResourceState> {
        match id {
            ResourceId::BaseImage => self.images.probe_base().await,
            ResourceId::Overlay(vm) => self.images.probe_overlay(vm).await,
            ResourceId::Network(_) | ResourceId::Vm(_) => self.provider.query_state(id).await,
        }
    }

    /// Current state of `id` on the substrate. The cached entry is only
    /// compared against it.
    async fn observe(
        &self,
        id: &ResourceId,
        state: &mut LifecycleState,
    ) -> tierlab_vm::Result<ResourceState> {
        let observed = self.bounded(self.probe(id)).await?;
        match state.get(id) {
            Some(cached) if cached.is_transitional() => warn!(
                resource = %id,
                cached = %cached,
                observed = %observed,
                "Previous run was interrupted"
            ),
            Some(cached) if cached != observed => debug!(
                resource = %id,
                cached = %cached,
                observed = %observed,
                "Cached state was stale"
            ),
            None if observed != ResourceState::Absent => {
                debug!(resource = %id, observed = %observed, "Found uncached resource")
            }
            _ => {}
        }
        state.set(id.clone(), observed);
        Ok(observed)
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = tierlab_vm::Result<T>>,
    ) -> tierlab_vm::Result<T> {
        let limit = self.config.step_timeout;
        tokio::time::timeout(limit, op)
            .await
            .unwrap_or_else(|_| Err(VmError::Timeout(limit)))
    }

    /// Run one step. Returns whether the substrate was changed.
    async fn apply(
        &self,
        command: LifecycleCommand,
        step: &Step,
        topology: &Topology,
        state: &mut LifecycleState,
    ) -> Result<bool> {
        let ctx = StepContext { command, step };
        match (&step.resource, command) {
            (ResourceId::Network(id), LifecycleCommand::Define) => {
                let network = lookup_network(topology, id)?;
                self.define_network(&ctx, network, state).await
            }
            (ResourceId::Network(id), _) => self.destroy_network(&ctx, id, state).await,
            (ResourceId::BaseImage, LifecycleCommand::Define) => {
                self.define_base(&ctx, state).await
            }
            (ResourceId::BaseImage, _) => self.release_base(&ctx, state).await,
            (ResourceId::Overlay(vm), LifecycleCommand::Define) => {
                self.define_overlay(&ctx, vm, state).await
            }
            (ResourceId::Overlay(vm), _) => self.destroy_overlay(&ctx, vm, state).await,
            (ResourceId::Vm(id), command) => {
                let vm = lookup_vm(topology, id)?;
                match command {
                    LifecycleCommand::Define => self.define_vm(&ctx, vm, state).await,
                    LifecycleCommand::Start => self.start_vm(&ctx, vm, state).await,
                    LifecycleCommand::Stop => self.stop_vm(&ctx, vm, state).await,
                    LifecycleCommand::Undefine => self.destroy_vm(&ctx, vm, state).await,
                }
            }
        }
    }

    async fn define_network(
        &self,
        ctx: &StepContext<'_>,
        network: &NetworkResource,
        state: &mut LifecycleState,
    ) -> Result<bool> {
        let id = &ctx.step.resource;
        if self.observe(id, state).await.map_err(|e| ctx.fail(e))?.exists() {
            return Ok(false);
        }
        state.set(id.clone(), ResourceState::Defining);
        self.bounded(self.provider.create_network(network))
            .await
            .map_err(|e| ctx.fail(e))?;
        state.set(id.clone(), ResourceState::Defined);
        Ok(true)
    }

    async fn destroy_network(
        &self,
        ctx: &StepContext<'_>,
        network_id: &str,
        state: &mut LifecycleState,
    ) -> Result<bool> {
        let id = &ctx.step.resource;
        if self.observe(id, state).await.map_err(|e| ctx.fail(e))? == ResourceState::Absent {
            return Ok(false);
        }
        state.set(id.clone(), ResourceState::Destroying);
        self.bounded(self.provider.destroy_network(network_id))
            .await
            .map_err(|e| ctx.fail(e))?;
        state.set(id.clone(), ResourceState::Absent);
        Ok(true)
    }

    async fn define_base(&self, ctx: &StepContext<'_>, state: &mut LifecycleState) -> Result<bool> {
        let id = &ctx.step.resource;
        if self.observe(id, state).await.map_err(|e| ctx.fail(e))?.exists() {
            return Ok(false);
        }
        state.set(id.clone(), ResourceState::Defining);
        self.bounded(self.images.ensure_base())
            .await
            .map_err(|e| ctx.fail(e))?;
        state.set(id.clone(), ResourceState::Defined);
        Ok(true)
    }

    async fn release_base(&self, ctx: &StepContext<'_>, state: &mut LifecycleState) -> Result<bool> {
        let id = &ctx.step.resource;
        let observed = self.observe(id, state).await.map_err(|e| ctx.fail(e))?;
        if ctx.step.target != ResourceState::Absent || observed == ResourceState::Absent {
            return Ok(false);
        }
        state.set(id.clone(), ResourceState::Destroying);
        let removed = self
            .bounded(self.images.release_base())
            .await
            .map_err(|e| ctx.fail(e))?;
        state.set(
            id.clone(),
            if removed {
                ResourceState::Absent
            } else {
                ResourceState::Defined
            },
        );
        Ok(removed)
    }

    async fn define_overlay(
        &self,
        ctx: &StepContext<'_>,
        vm_id: &str,
        state: &mut LifecycleState,
    ) -> Result<bool> {
        let id = &ctx.step.resource;
        let policy = self.config.overlay_policy();
        let observed = self.observe(id, state).await.map_err(|e| ctx.fail(e))?;
        if observed.exists() && policy == OverlayPolicy::Reuse {
            return Ok(false);
        }
        // Under the exclusive policy the manager rejects an existing overlay.
        state.set(id.clone(), ResourceState::Defining);
        self.bounded(self.images.create_overlay(vm_id, policy))
            .await
            .map_err(|e| ctx.fail(e))?;
        state.set(id.clone(), ResourceState::Defined);
        Ok(true)
    }

    async fn destroy_overlay(
        &self,
        ctx: &StepContext<'_>,
        vm_id: &str,
        state: &mut LifecycleState,
    ) -> Result<bool> {
        let id = &ctx.step.resource;
        if self.observe(id, state).await.map_err(|e| ctx.fail(e))? == ResourceState::Absent {
            return Ok(false);
        }
        // The disk of a defined VM must not disappear under it.
        let owner = ResourceId::Vm(vm_id.to_string());
        let owner_state = self.observe(&owner, state).await.map_err(|e| ctx.fail(e))?;
        if owner_state != ResourceState::Absent {
            return Err(ctx.not_ready(owner, "absent", owner_state));
        }

        state.set(id.clone(), ResourceState::Destroying);
        self.bounded(self.images.destroy_overlay(vm_id))
            .await
            .map_err(|e| ctx.fail(e))?;
        state.set(id.clone(), ResourceState::Absent);
        Ok(true)
    }

    async fn define_vm(
        &self,
        ctx: &StepContext<'_>,
        vm: &VmResource,
        state: &mut LifecycleState,
    ) -> Result<bool> {
        let id = &ctx.step.resource;
        let mut changed = false;

        if !self.observe(id, state).await.map_err(|e| ctx.fail(e))?.exists() {
            let disk_id = ResourceId::Overlay(vm.disk.clone());
            let disk_state = self.observe(&disk_id, state).await.map_err(|e| ctx.fail(e))?;
            if !disk_state.exists() {
                return Err(ctx.not_ready(disk_id, "defined", disk_state));
            }
            self.require_networks(ctx, vm, state).await?;

            state.set(id.clone(), ResourceState::Defining);
            let disk = self.images.overlay(&vm.disk);
            self.bounded(self.provider.create_vm(vm, &disk))
                .await
                .map_err(|e| ctx.fail(e))?;
            state.set(id.clone(), ResourceState::Defined);
            changed = true;
        }

        // A previous run may have stopped between defining and attaching.
        let attached = self
            .bounded(self.provider.attached_networks(&vm.id))
            .await
            .map_err(|e| ctx.fail(e))?;
        for binding in &vm.interfaces {
            if attached.iter().any(|n| *n == binding.network) {
                continue;
            }
            debug!(vm = %vm.id, network = %binding.network, address = %binding.address, "Attaching interface");
            self.bounded(
                self.provider
                    .attach_interface(&vm.id, &binding.network, binding.address),
            )
            .await
            .map_err(|e| ctx.fail(e))?;
            changed = true;
        }
        Ok(changed)
    }

    async fn start_vm(
        &self,
        ctx: &StepContext<'_>,
        vm: &VmResource,
        state: &mut LifecycleState,
    ) -> Result<bool> {
        let id = &ctx.step.resource;
        let observed = self.observe(id, state).await.map_err(|e| ctx.fail(e))?;
        if observed == ResourceState::Absent {
            return Err(ctx.not_ready(id.clone(), "defined", observed));
        }
        self.require_networks(ctx, vm, state).await?;
        if observed == ResourceState::Running {
            return Ok(false);
        }

        state.set(id.clone(), ResourceState::Starting);
        self.bounded(self.provider.start_vm(&vm.id))
            .await
            .map_err(|e| ctx.fail(e))?;
        state.set(id.clone(), ResourceState::Running);
        Ok(true)
    }

    async fn stop_vm(
        &self,
        ctx: &StepContext<'_>,
        vm: &VmResource,
        state: &mut LifecycleState,
    ) -> Result<bool> {
        let id = &ctx.step.resource;
        match self.observe(id, state).await.map_err(|e| ctx.fail(e))? {
            ResourceState::Absent | ResourceState::Defined | ResourceState::Stopped => {
                return Ok(false)
            }
            _ => {}
        }

        state.set(id.clone(), ResourceState::Stopping);
        self.bounded(self.provider.stop_vm(&vm.id, self.config.stop_grace))
            .await
            .map_err(|e| ctx.fail(e))?;
        state.set(id.clone(), ResourceState::Stopped);
        Ok(true)
    }

    async fn destroy_vm(
        &self,
        ctx: &StepContext<'_>,
        vm: &VmResource,
        state: &mut LifecycleState,
    ) -> Result<bool> {
        let id = &ctx.step.resource;
        if self.observe(id, state).await.map_err(|e| ctx.fail(e))? == ResourceState::Absent {
            return Ok(false);
        }
        state.set(id.clone(), ResourceState::Destroying);
        self.bounded(self.provider.destroy_vm(&vm.id))
            .await
            .map_err(|e| ctx.fail(e))?;
        state.set(id.clone(), ResourceState::Absent);
        Ok(true)
    }

    /// Every network `vm` is bound to must exist.
    async fn require_networks(
        &self,
        ctx: &StepContext<'_>,
        vm: &VmResource,
        state: &mut LifecycleState,
    ) -> Result<()> {
        for network in vm.networks() {
            let net_id = ResourceId::Network(network.to_string());
            let observed = self.observe(&net_id, state).await.map_err(|e| ctx.fail(e))?;
            if !observed.exists() {
                return Err(ctx.not_ready(net_id, "defined", observed));
            }
        }
        Ok(())
    }
}

/// Error context of the step being run.
struct StepContext<'a> {
    command: LifecycleCommand,
    step: &'a Step,
}

impl StepContext<'_> {
    fn fail(&self, source: VmError) -> CoreError {
        match source {
            VmError::ImageExists(path) => CoreError::ImageExists {
                resource: self.step.resource.clone(),
                path,
            },
            source => CoreError::Provider {
                resource: self.step.resource.clone(),
                command: self.command,
                target: self.step.target,
                source,
            },
        }
    }

    fn not_ready(
        &self,
        dependency: ResourceId,
        required: &str,
        observed: ResourceState,
    ) -> CoreError {
        CoreError::DependencyNotReady {
            resource: self.step.resource.clone(),
            dependency,
            required: required.to_string(),
            observed,
        }
    }
}

fn lookup_network<'t>(topology: &'t Topology, id: &str) -> Result<&'t NetworkResource> {
    topology
        .network(id)
        .ok_or_else(|| CoreError::Validation(format!("network '{id}' is not part of the topology")))
}

fn lookup_vm<'t>(topology: &'t Topology, id: &str) -> Result<&'t VmResource> {
    topology
        .vm(id)
        .ok_or_else(|| CoreError::Validation(format!("VM '{id}' is not part of the topology")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{build_topology, TopologyConfig};
    use std::path::Path;
    use tierlab_vm::{Call, ImageLayout, MemorySubstrate};

    const BASE: &str = "/lab/cdps-vm-base.qcow2";

    fn orchestrator(substrate: &MemorySubstrate) -> Orchestrator<MemorySubstrate, MemorySubstrate> {
        Orchestrator::new(
            substrate.clone(),
            ImageManager::new(substrate.clone(), ImageLayout::new(BASE, "/lab/images")),
            OrchestratorConfig::default(),
        )
    }

    fn topology(backends: u8) -> Topology {
        build_topology(&TopologyConfig::new(backends)).unwrap()
    }

    fn ids(steps: &[Step]) -> Vec<String> {
        steps.iter().map(|s| s.resource.to_string()).collect()
    }

    #[test]
    fn test_define_plan_order() {
        let substrate = MemorySubstrate::new();
        let plan = orchestrator(&substrate).plan(LifecycleCommand::Define, &topology(2));
        assert_eq!(
            ids(&plan),
            vec![
                "network/backend-net-1",
                "image/base",
                "overlay/backend-1",
                "overlay/backend-2",
                "overlay/router",
                "vm/backend-1",
                "vm/backend-2",
                "vm/router",
            ]
        );
    }

    #[test]
    fn test_teardown_plans_reverse() {
        let substrate = MemorySubstrate::new();
        let orch = orchestrator(&substrate);
        let topo = topology(2);

        let stop = orch.plan(LifecycleCommand::Stop, &topo);
        assert_eq!(ids(&stop), vec!["vm/router", "vm/backend-2", "vm/backend-1"]);
        assert!(stop.iter().all(|s| s.target == ResourceState::Stopped));
        let undefine = orch.plan(LifecycleCommand::Undefine, &topo);
        assert_eq!(
            ids(&undefine),
            vec![
                "vm/router",
                "vm/backend-2",
                "vm/backend-1",
                "overlay/router",
                "overlay/backend-2",
                "overlay/backend-1",
                "network/backend-net-1",
                "image/base",
            ]
        );
        assert_eq!(undefine[0].target, ResourceState::Absent);
        // Operator-provided base is kept.
        assert_eq!(undefine.last().unwrap().target, ResourceState::Defined);
    }

    #[tokio::test]
    async fn test_define_then_start() {
        let substrate = MemorySubstrate::new().with_file(BASE);
        let orch = orchestrator(&substrate);
        let topo = topology(1);

        let run = orch
            .execute(LifecycleCommand::Define, &topo, LifecycleState::new())
            .await;
        assert!(run.report.is_success(), "{}", run.report);
        assert_eq!(run.report.applied(), 5);
        assert_eq!(run.report.satisfied(), 1); // base already there
        assert_eq!(
            run.state.get(&ResourceId::Vm("router".into())),
            Some(ResourceState::Defined)
        );

        let run = orch
            .execute(LifecycleCommand::Start, &topo, run.state)
            .await;
        assert!(run.report.is_success());
        assert_eq!(substrate.vm_state("backend-1"), ResourceState::Running);
        assert_eq!(substrate.vm_state("router"), ResourceState::Running);
    }

    #[tokio::test]
    async fn test_start_requires_definition() {
        let substrate = MemorySubstrate::new().with_file(BASE);
        let orch = orchestrator(&substrate);

        let run = orch
            .execute(LifecycleCommand::Start, &topology(1), LifecycleState::new())
            .await;
        let failure = run.report.first_failure().unwrap();
        assert_eq!(failure.resource, ResourceId::Vm("backend-1".into()));
        assert!(matches!(
            failure.outcome,
            Outcome::Failed(CoreError::DependencyNotReady { .. })
        ));
        assert_eq!(run.report.not_attempted(), 1);
        assert!(substrate.journal().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_missing_network() {
        // A defined VM whose network was removed behind our back.
        let substrate = MemorySubstrate::new().with_file("/lab/images/backend-1.qcow2");
        let orch = orchestrator(&substrate);
        let topo = topology(1);
        let vm = topo.vm("backend-1").unwrap();
        substrate
            .create_vm(vm, &orch.images().overlay("backend-1"))
            .await
            .unwrap();
        substrate.clear_journal();

        let run = orch
            .execute(LifecycleCommand::Start, &topo, LifecycleState::new())
            .await;
        let failure = run.report.first_failure().unwrap();
        assert_eq!(failure.resource, ResourceId::Vm("backend-1".into()));
        assert!(matches!(
            &failure.outcome,
            Outcome::Failed(CoreError::DependencyNotReady { dependency, .. })
                if *dependency == ResourceId::Network("backend-net-1".into())
        ));
        assert!(substrate.journal().is_empty());
    }

    #[tokio::test]
    async fn test_stop_absent_vm_is_noop() {
        let substrate = MemorySubstrate::new();
        let run = orchestrator(&substrate)
            .execute(LifecycleCommand::Stop, &topology(3), LifecycleState::new())
            .await;
        assert!(run.report.is_success());
        assert_eq!(run.report.satisfied(), 4);
        assert!(substrate.journal().is_empty());
    }

    #[tokio::test]
    async fn test_failed_step_is_reprobed() {
        let substrate = MemorySubstrate::new().with_file(BASE);
        let orch = orchestrator(&substrate);
        let topo = topology(1);
        substrate.fail_on(Call::AttachInterface {
            vm: "backend-1".into(),
            network: "backend-net-1".into(),
        });

        let run = orch
            .execute(LifecycleCommand::Define, &topo, LifecycleState::new())
            .await;
        assert_eq!(run.report.failed(), 1);
        // The VM was created before the attach failed; the state says so
        // instead of leaving the transitional mark behind.
        assert_eq!(
            run.state.get(&ResourceId::Vm("backend-1".into())),
            Some(ResourceState::Defined)
        );
        assert_eq!(run.state.get(&ResourceId::Vm("router".into())), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_step() {
        use async_trait::async_trait;
        use std::net::Ipv4Addr;
        use std::time::Duration;
        use tierlab_vm::DiskImage;

        /// Provider whose network creation never completes.
        struct Hanging(MemorySubstrate);

        #[async_trait]
        impl ResourceProvider for Hanging {
            async fn create_network(&self, _: &NetworkResource) -> tierlab_vm::Result<()> {
                std::future::pending().await
            }
            async fn destroy_network(&self, id: &str) -> tierlab_vm::Result<()> {
                self.0.destroy_network(id).await
            }
            async fn create_vm(&self, vm: &VmResource, disk: &DiskImage) -> tierlab_vm::Result<()> {
                self.0.create_vm(vm, disk).await
            }
            async fn destroy_vm(&self, id: &str) -> tierlab_vm::Result<()> {
                self.0.destroy_vm(id).await
            }
            async fn start_vm(&self, id: &str) -> tierlab_vm::Result<()> {
                self.0.start_vm(id).await
            }
            async fn stop_vm(&self, id: &str, grace: Duration) -> tierlab_vm::Result<()> {
                self.0.stop_vm(id, grace).await
            }
            async fn query_state(&self, id: &ResourceId) -> tierlab_vm::Result<ResourceState> {
                self.0.query_state(id).await
            }
            async fn attach_interface(
                &self,
                vm: &str,
                network: &str,
                address: Ipv4Addr,
            ) -> tierlab_vm::Result<()> {
                self.0.attach_interface(vm, network, address).await
            }
            async fn attached_networks(&self, vm: &str) -> tierlab_vm::Result<Vec<String>> {
                self.0.attached_networks(vm).await
            }
        }

        let substrate = MemorySubstrate::new().with_file(BASE);
        let orch = Orchestrator::new(
            Hanging(substrate.clone()),
            ImageManager::new(substrate.clone(), ImageLayout::new(BASE, "/lab/images")),
            OrchestratorConfig::builder()
                .step_timeout(Duration::from_millis(50))
                .stop_grace(Duration::from_millis(10))
                .build()
                .unwrap(),
        );

        let run = orch
            .execute(LifecycleCommand::Define, &topology(1), LifecycleState::new())
            .await;
        let failure = run.report.first_failure().unwrap();
        assert!(matches!(
            failure.outcome,
            Outcome::Failed(CoreError::Provider {
                source: VmError::Timeout(_),
                ..
            })
        ));
        assert_eq!(run.report.not_attempted(), 5);
        assert!(!substrate.has_file(Path::new("/lab/images/backend-1.qcow2")));
    }
}
