//! Builder for libvirt domain and interface definitions.

use crate::resource::InterfaceBinding;
use std::path::{Path, PathBuf};

/// Fluent builder producing the libvirt domain XML for a topology VM.
///
/// # Example
///
/// ```
/// use tierlab_vm::DomainBuilder;
///
/// let xml = DomainBuilder::new("backend-1")
///     .vcpus(1)
///     .memory_mib(512)
///     .disk("/var/lib/tierlab/images/backend-1.qcow2")
///     .build();
/// assert!(xml.contains("<name>backend-1</name>"));
/// ```
#[derive(Debug, Clone)]
pub struct DomainBuilder {
    name: String,
    vcpus: u8,
    memory_mib: u32,
    disk: PathBuf,
}

impl DomainBuilder {
    /// Create a builder with default resources (1 vCPU, 512 MiB, KVM).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vcpus: 1,
            memory_mib: 512,
            disk: PathBuf::new(),
        }
    }

    /// Set the number of virtual CPUs.
    pub fn vcpus(mut self, count: u8) -> Self {
        self.vcpus = count;
        self
    }

    /// Set the memory size in MiB.
    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.memory_mib = mib;
        self
    }

    /// Set the qcow2 disk image backing the domain.
    pub fn disk(mut self, path: impl AsRef<Path>) -> Self {
        self.disk = path.as_ref().to_path_buf();
        self
    }

    /// Render the domain definition.
    pub fn build(&self) -> String {
        format!(
            r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>{memory}</memory>
  <vcpu>{vcpus}</vcpu>
  <os>
    <type arch='x86_64'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
  </devices>
</domain>
"#,
            name = escape(&self.name),
            memory = self.memory_mib,
            vcpus = self.vcpus,
            disk = escape(&self.disk.to_string_lossy()),
        )
    }
}

/// Render an Open vSwitch bridge interface for `virsh attach-device`.
pub fn interface_xml(binding: &InterfaceBinding) -> String {
    format!(
        r#"<interface type='bridge'>
  <source bridge='{bridge}'/>
  <mac address='{mac}'/>
  <model type='virtio'/>
  <virtualport type='openvswitch'/>
</interface>
"#,
        bridge = escape(&binding.network),
        mac = binding.mac(),
    )
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}
