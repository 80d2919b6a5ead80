//! In-memory substrate for exercising orchestration without a hypervisor.
//!
//! [`MemorySubstrate`] implements both [`ResourceProvider`] and
//! [`ImageBackend`] over shared state, and records every mutating call in an
//! ordered journal so tests can assert on ordering and idempotency. Failures
//! can be injected per call.

use crate::error::{Result, VmError};
use crate::image::{DiskImage, ImageBackend};
use crate::provider::ResourceProvider;
use crate::resource::{NetworkResource, ResourceId, ResourceState, VmResource};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A mutating call made against the substrate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Call {
    /// `create_network(id)`
    CreateNetwork(String),
    /// `destroy_network(id)`
    DestroyNetwork(String),
    /// `create_vm(id)`
    CreateVm(String),
    /// `destroy_vm(id)`
    DestroyVm(String),
    /// `start_vm(id)`
    StartVm(String),
    /// `stop_vm(id)`
    StopVm(String),
    /// `attach_interface(vm, network)`
    AttachInterface {
        /// VM id
        vm: String,
        /// Network id
        network: String,
    },
    /// `materialize_base(base)`
    MaterializeBase(PathBuf),
    /// `create_overlay(overlay)`
    CreateOverlay(PathBuf),
    /// `remove(path)`
    RemoveImage(PathBuf),
}

#[derive(Debug, Clone)]
struct MemoryVm {
    state: ResourceState,
    disk: PathBuf,
    interfaces: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    networks: BTreeMap<String, NetworkResource>,
    vms: BTreeMap<String, MemoryVm>,
    files: BTreeSet<PathBuf>,
    journal: Vec<Call>,
    failures: Vec<Call>,
    probes: usize,
}

impl Inner {
    /// Journal `call` and consume a matching injected failure, if any.
    fn record(&mut self, call: Call) -> Result<()> {
        self.journal.push(call.clone());
        if let Some(pos) = self.failures.iter().position(|f| *f == call) {
            self.failures.remove(pos);
            return Err(VmError::Injected(format!("{call:?}")));
        }
        Ok(())
    }
}

/// Shared in-memory hypervisor, virtual switch and image store.
///
/// Cloning yields another handle to the same state.
#[derive(Debug, Clone, Default)]
pub struct MemorySubstrate {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySubstrate {
    /// Create an empty substrate.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Plain data; a panic elsewhere cannot leave it half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pretend an image file already exists, e.g. an operator-provided base.
    pub fn with_file(self, path: impl Into<PathBuf>) -> Self {
        self.lock().files.insert(path.into());
        self
    }

    /// Make the next occurrence of `call` fail. Each injection fires once.
    pub fn fail_on(&self, call: Call) {
        self.lock().failures.push(call);
    }

    /// Mutating calls made so far, in order. Failed attempts are included.
    pub fn journal(&self) -> Vec<Call> {
        self.lock().journal.clone()
    }

    /// Forget the recorded calls.
    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Number of read-only probes served.
    pub fn probes(&self) -> usize {
        self.lock().probes
    }

    /// Whether a network exists.
    pub fn has_network(&self, id: &str) -> bool {
        self.lock().networks.contains_key(id)
    }

    /// Whether an image file exists.
    pub fn has_file(&self, path: &Path) -> bool {
        self.lock().files.contains(path)
    }

    /// Current state of a VM (`Absent` when undefined).
    pub fn vm_state(&self, id: &str) -> ResourceState {
        self.lock()
            .vms
            .get(id)
            .map(|vm| vm.state)
            .unwrap_or(ResourceState::Absent)
    }

    /// Force a VM into `state` behind the orchestrator's back, as an operator
    /// or a crashed guest would.
    pub fn set_vm_state(&self, id: &str, state: ResourceState) {
        if let Some(vm) = self.lock().vms.get_mut(id) {
            vm.state = state;
        }
    }

    /// Disk a VM was defined with.
    pub fn vm_disk(&self, id: &str) -> Option<PathBuf> {
        self.lock().vms.get(id).map(|vm| vm.disk.clone())
    }
}

#[async_trait]
impl ResourceProvider for MemorySubstrate {
    async fn create_network(&self, network: &NetworkResource) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::CreateNetwork(network.id.clone()))?;
        inner.networks.insert(network.id.clone(), network.clone());
        Ok(())
    }

    async fn destroy_network(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::DestroyNetwork(id.to_string()))?;
        let in_use = inner
            .vms
            .iter()
            .any(|(_, vm)| vm.interfaces.iter().any(|n| n == id));
        if in_use {
            return Err(VmError::InvalidState {
                id: id.to_string(),
                expected: "no attached interfaces".into(),
                actual: "in use".into(),
            });
        }
        inner.networks.remove(id);
        Ok(())
    }

    async fn create_vm(&self, vm: &VmResource, disk: &DiskImage) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::CreateVm(vm.id.clone()))?;
        if !inner.files.contains(&disk.path) {
            return Err(VmError::NotFound(disk.path.display().to_string()));
        }
        inner.vms.entry(vm.id.clone()).or_insert_with(|| MemoryVm {
            state: ResourceState::Defined,
            disk: disk.path.clone(),
            interfaces: Vec::new(),
        });
        Ok(())
    }

    async fn destroy_vm(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::DestroyVm(id.to_string()))?;
        inner.vms.remove(id);
        Ok(())
    }

    async fn start_vm(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::StartVm(id.to_string()))?;
        let Inner { vms, networks, .. } = &mut *inner;
        let vm = vms
            .get_mut(id)
            .ok_or_else(|| VmError::NotFound(id.to_string()))?;
        if let Some(missing) = vm.interfaces.iter().find(|n| !networks.contains_key(*n)) {
            return Err(VmError::NotFound(format!("network {missing}")));
        }
        vm.state = ResourceState::Running;
        Ok(())
    }

    async fn stop_vm(&self, id: &str, _grace: Duration) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::StopVm(id.to_string()))?;
        if let Some(vm) = inner.vms.get_mut(id) {
            vm.state = ResourceState::Stopped;
        }
        Ok(())
    }

    async fn query_state(&self, id: &ResourceId) -> Result<ResourceState> {
        let mut inner = self.lock();
        inner.probes += 1;
        let state = match id {
            ResourceId::Network(net) => {
                if inner.networks.contains_key(net) {
                    ResourceState::Defined
                } else {
                    ResourceState::Absent
                }
            }
            ResourceId::Vm(vm) => inner
                .vms
                .get(vm)
                .map(|vm| vm.state)
                .unwrap_or(ResourceState::Absent),
            ResourceId::BaseImage | ResourceId::Overlay(_) => {
                return Err(VmError::NotFound(format!("{id} is not a provider resource")))
            }
        };
        Ok(state)
    }

    async fn attach_interface(
        &self,
        vm_id: &str,
        network_id: &str,
        _address: Ipv4Addr,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::AttachInterface {
            vm: vm_id.to_string(),
            network: network_id.to_string(),
        })?;
        if !inner.networks.contains_key(network_id) {
            return Err(VmError::NotFound(format!("network {network_id}")));
        }
        let vm = inner
            .vms
            .get_mut(vm_id)
            .ok_or_else(|| VmError::NotFound(vm_id.to_string()))?;
        if !vm.interfaces.iter().any(|n| n == network_id) {
            vm.interfaces.push(network_id.to_string());
        }
        Ok(())
    }

    async fn attached_networks(&self, vm_id: &str) -> Result<Vec<String>> {
        let mut inner = self.lock();
        inner.probes += 1;
        Ok(inner
            .vms
            .get(vm_id)
            .map(|vm| vm.interfaces.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ImageBackend for MemorySubstrate {
    async fn exists(&self, path: &Path) -> Result<bool> {
        let mut inner = self.lock();
        inner.probes += 1;
        Ok(inner.files.contains(path))
    }

    async fn materialize_base(&self, source: &Path, base: &Path) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::MaterializeBase(base.to_path_buf()))?;
        if !inner.files.contains(source) {
            return Err(VmError::NotFound(source.display().to_string()));
        }
        inner.files.insert(base.to_path_buf());
        Ok(())
    }

    async fn create_overlay(&self, base: &Path, overlay: &Path) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::CreateOverlay(overlay.to_path_buf()))?;
        if !inner.files.contains(base) {
            return Err(VmError::BaseMissing(base.to_path_buf()));
        }
        inner.files.insert(overlay.to_path_buf());
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let mut inner = self.lock();
        inner.record(Call::RemoveImage(path.to_path_buf()))?;
        inner.files.remove(path);
        Ok(())
    }

    async fn list_overlays(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut inner = self.lock();
        inner.probes += 1;
        Ok(inner
            .files
            .iter()
            .filter(|f| f.parent() == Some(dir))
            .filter(|f| f.extension().is_some_and(|ext| ext == "qcow2"))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageLayout, ImageManager, OverlayPolicy};
    use crate::resource::{NetworkKind, Subnet};

    fn network() -> NetworkResource {
        NetworkResource {
            id: "backend-net-1".into(),
            subnet: Subnet::new(Ipv4Addr::new(192, 168, 1, 64), 26).unwrap(),
            vlan: 100,
            kind: NetworkKind::IsolatedBackend,
            gateway: Ipv4Addr::new(192, 168, 1, 65),
        }
    }

    fn layout() -> ImageLayout {
        ImageLayout::new("/lab/base.qcow2", "/lab/images").with_base_source("/lab/golden.qcow2")
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let substrate = MemorySubstrate::new();
        substrate.fail_on(Call::CreateNetwork("backend-net-1".into()));

        assert!(substrate.create_network(&network()).await.is_err());
        assert!(!substrate.has_network("backend-net-1"));

        substrate.create_network(&network()).await.unwrap();
        assert!(substrate.has_network("backend-net-1"));
        assert_eq!(substrate.journal().len(), 2);
    }

    #[tokio::test]
    async fn test_overlay_lifecycle() {
        let substrate = MemorySubstrate::new().with_file("/lab/golden.qcow2");
        let images = ImageManager::new(substrate.clone(), layout());

        // Overlays need the base first.
        let err = images
            .create_overlay("backend-1", OverlayPolicy::Reuse)
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::BaseMissing(_)));

        images.ensure_base().await.unwrap();
        images.ensure_base().await.unwrap();
        images
            .create_overlay("backend-1", OverlayPolicy::Reuse)
            .await
            .unwrap();
        images
            .create_overlay("backend-1", OverlayPolicy::Reuse)
            .await
            .unwrap();
        let err = images
            .create_overlay("backend-1", OverlayPolicy::Exclusive)
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::ImageExists(_)));
        assert_eq!(images.overlays(), vec!["backend-1".to_string()]);

        assert_eq!(
            substrate.journal(),
            vec![
                Call::MaterializeBase("/lab/base.qcow2".into()),
                Call::CreateOverlay("/lab/images/backend-1.qcow2".into()),
            ]
        );

        // Base stays while an overlay references it.
        assert!(!images.release_base().await.unwrap());
        images.destroy_overlay("backend-1").await.unwrap();
        images.destroy_overlay("backend-1").await.unwrap();
        assert!(images.overlays().is_empty());
        assert!(images.release_base().await.unwrap());
        assert!(!substrate.has_file(Path::new("/lab/base.qcow2")));
    }

    #[tokio::test]
    async fn test_vm_lifecycle_on_network() {
        let substrate = MemorySubstrate::new().with_file("/lab/images/backend-1.qcow2");
        let images = ImageManager::new(substrate.clone(), layout());
        let vm = VmResource {
            id: "backend-1".into(),
            role: crate::Role::Backend,
            hostname: "backend-1".into(),
            interfaces: Vec::new(),
            disk: "backend-1".into(),
            desired: crate::DesiredPower::Running,
        };

        substrate.create_network(&network()).await.unwrap();
        substrate
            .create_vm(&vm, &images.overlay("backend-1"))
            .await
            .unwrap();
        substrate
            .attach_interface("backend-1", "backend-net-1", Ipv4Addr::new(192, 168, 1, 101))
            .await
            .unwrap();

        assert!(substrate.destroy_network("backend-net-1").await.is_err());
        substrate.start_vm("backend-1").await.unwrap();
        assert_eq!(substrate.vm_state("backend-1"), ResourceState::Running);

        substrate
            .stop_vm("backend-1", Duration::from_secs(1))
            .await
            .unwrap();
        substrate.destroy_vm("backend-1").await.unwrap();
        substrate.destroy_vm("backend-1").await.unwrap();
        assert_eq!(substrate.vm_state("backend-1"), ResourceState::Absent);
        substrate.destroy_network("backend-net-1").await.unwrap();
    }
}
