//! # tierlab-vm
//!
//! Substrate layer for tierlab scenarios. Describes the resources a
//! topology is made of and drives the hypervisor, virtual switch and disk
//! images that back them.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tierlab_vm::{ImageLayout, ImageManager, OverlayPolicy, QemuImg};
//!
//! # async fn example() -> tierlab_vm::Result<()> {
//! let images = ImageManager::new(
//!     QemuImg::new(),
//!     ImageLayout::new("cdps-vm-base.qcow2", "images"),
//! );
//!
//! images.ensure_base().await?;
//! let disk = images.create_overlay("backend-1", OverlayPolicy::Reuse).await?;
//! println!("backend-1 boots from {}", disk.path.display());
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Resource model**: networks, VMs, interface bindings and lifecycle states
//! - **Provider trait**: [`ResourceProvider`], idempotent towards target states
//! - **libvirt + Open vSwitch**: [`VirshProvider`]
//! - **Copy-on-write disks**: [`ImageManager`] over qcow2 overlays
//! - **Test double**: [`MemorySubstrate`] with call journal and failure injection

mod builder;
mod error;
mod image;
mod memory;
mod provider;
mod resource;
mod tool;
mod virsh;

pub use builder::{interface_xml, DomainBuilder};
pub use error::{Result, VmError};
pub use image::{DiskImage, DiskKind, ImageBackend, ImageLayout, ImageManager, OverlayPolicy, QemuImg};
pub use memory::{Call, MemorySubstrate};
pub use provider::ResourceProvider;
pub use resource::{
    DesiredPower, InterfaceBinding, NetworkKind, NetworkResource, ResourceId, ResourceState, Role,
    Subnet, VmResource,
};
pub use tool::{ToolOutput, ToolRunner};
pub use virsh::{VirshConfig, VirshProvider};
