//! Capability interface over the hypervisor and virtual switch.

use crate::error::Result;
use crate::image::DiskImage;
use crate::resource::{NetworkResource, ResourceId, ResourceState, VmResource};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Trait for the virtualization substrate the orchestrator drives.
///
/// Every operation is idempotent with respect to its target state: creating
/// something that already exists, or destroying something that is already
/// gone, reports success. Implementations exist for libvirt + Open vSwitch
/// ([`VirshProvider`](crate::VirshProvider)) and for tests
/// ([`MemorySubstrate`](crate::MemorySubstrate)).
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Create a virtual switch segment.
    async fn create_network(&self, network: &NetworkResource) -> Result<()>;

    /// Remove a virtual switch segment. Succeeds if it is already absent.
    async fn destroy_network(&self, id: &str) -> Result<()>;

    /// Define a VM backed by `disk`, without any network interface.
    async fn create_vm(&self, vm: &VmResource, disk: &DiskImage) -> Result<()>;

    /// Remove a VM definition, forcing it off first if it runs. Succeeds if
    /// the VM is already absent.
    async fn destroy_vm(&self, id: &str) -> Result<()>;

    /// Boot a defined VM.
    async fn start_vm(&self, id: &str) -> Result<()>;

    /// Ask the guest to shut down, forcing it off once `grace` has elapsed.
    /// Succeeds if the VM is already off or absent.
    async fn stop_vm(&self, id: &str, grace: Duration) -> Result<()>;

    /// Probe the substrate for the current state of a network or VM.
    ///
    /// Image resources are probed through the
    /// [`ImageManager`](crate::ImageManager) instead.
    async fn query_state(&self, id: &ResourceId) -> Result<ResourceState>;

    /// Plug a persistent interface of `vm_id` into `network_id`. The address
    /// determines the interface's hardware address.
    async fn attach_interface(&self, vm_id: &str, network_id: &str, address: Ipv4Addr)
        -> Result<()>;

    /// Networks `vm_id` currently has interfaces on. Empty if the VM is
    /// absent.
    async fn attached_networks(&self, vm_id: &str) -> Result<Vec<String>>;
}
