//! Resource model shared by the substrate adapters and the orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 subnet in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    /// Create a subnet. Host bits of `network` are cleared.
    ///
    /// Returns `None` for prefixes longer than 30, which leave no room for
    /// host addresses.
    pub fn new(network: Ipv4Addr, prefix: u8) -> Option<Self> {
        if prefix > 30 {
            return None;
        }
        let mask = Self::mask_bits(prefix);
        Some(Self {
            network: Ipv4Addr::from(u32::from(network) & mask),
            prefix,
        })
    }

    fn mask_bits(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        }
    }

    /// Network address.
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Broadcast address.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !Self::mask_bits(self.prefix))
    }

    /// Whether `addr` falls inside this subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask_bits(self.prefix) == u32::from(self.network)
    }

    /// Whether `addr` is a usable host address (inside, and neither the
    /// network nor the broadcast address).
    pub fn is_host(&self, addr: Ipv4Addr) -> bool {
        self.contains(addr) && addr != self.network && addr != self.broadcast()
    }

    /// Whether two subnets share any address.
    pub fn overlaps(&self, other: &Subnet) -> bool {
        self.contains(other.network) || other.contains(self.network)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Kind of virtual network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkKind {
    /// Isolated subnet shared by backends and the router
    #[serde(rename = "isolated-backend-net")]
    IsolatedBackend,
    /// Router-facing uplink towards clients
    #[serde(rename = "uplink-net")]
    Uplink,
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkKind::IsolatedBackend => write!(f, "isolated-backend-net"),
            NetworkKind::Uplink => write!(f, "uplink-net"),
        }
    }
}

/// A virtual switch segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResource {
    /// Unique network id, also used as the switch name
    pub id: String,
    /// Addressing of the segment
    pub subnet: Subnet,
    /// VLAN tag applied to the switch's internal port
    pub vlan: u16,
    /// Role of the segment in the topology
    pub kind: NetworkKind,
    /// Router address on this segment
    pub gateway: Ipv4Addr,
}

/// Role of a VM in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Web server behind the router
    Backend,
    /// Load-balancing router
    Router,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Backend => write!(f, "backend"),
            Role::Router => write!(f, "router"),
        }
    }
}

/// One VM interface attached to a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceBinding {
    /// Network id the interface is plugged into
    pub network: String,
    /// Address assigned to the interface
    pub address: Ipv4Addr,
}

impl InterfaceBinding {
    /// Locally administered MAC derived from the bound address, so that the
    /// same binding always yields the same hardware address.
    pub fn mac(&self) -> String {
        let [_, b, c, d] = self.address.octets();
        format!("52:54:00:{b:02x}:{c:02x}:{d:02x}")
    }
}

/// Power state a VM is expected to reach once the scenario is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredPower {
    /// Defined but never started
    Defined,
    /// Running
    Running,
    /// Shut down
    Stopped,
}

/// A virtual machine of the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmResource {
    /// Unique VM id (libvirt domain name)
    pub id: String,
    /// Role of the VM
    pub role: Role,
    /// Guest hostname
    pub hostname: String,
    /// Interfaces, in guest NIC order
    pub interfaces: Vec<InterfaceBinding>,
    /// Overlay image id backing the VM's disk
    pub disk: String,
    /// Power state after `start`
    pub desired: DesiredPower,
}

impl VmResource {
    /// Networks this VM depends on.
    pub fn networks(&self) -> impl Iterator<Item = &str> {
        self.interfaces.iter().map(|i| i.network.as_str())
    }
}

/// Identifier of any resource tracked in the lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ResourceId {
    /// A virtual network
    Network(String),
    /// The shared base disk image
    BaseImage,
    /// The overlay disk of a VM
    Overlay(String),
    /// A virtual machine
    Vm(String),
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Network(id) => write!(f, "network/{id}"),
            ResourceId::BaseImage => write!(f, "image/base"),
            ResourceId::Overlay(vm) => write!(f, "overlay/{vm}"),
            ResourceId::Vm(id) => write!(f, "vm/{id}"),
        }
    }
}

impl FromStr for ResourceId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "image/base" {
            return Ok(ResourceId::BaseImage);
        }
        let (kind, name) = s
            .split_once('/')
            .filter(|(_, name)| !name.is_empty())
            .ok_or_else(|| format!("malformed resource id: {s}"))?;
        match kind {
            "network" => Ok(ResourceId::Network(name.to_string())),
            "overlay" => Ok(ResourceId::Overlay(name.to_string())),
            "vm" => Ok(ResourceId::Vm(name.to_string())),
            _ => Err(format!("unknown resource kind in id: {s}")),
        }
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ResourceId {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Observed lifecycle state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    /// Does not exist on the substrate
    #[default]
    Absent,
    /// Creation in progress
    Defining,
    /// Exists, never started
    Defined,
    /// Boot in progress
    Starting,
    /// Running
    Running,
    /// Shutdown in progress
    Stopping,
    /// Exists, shut down
    Stopped,
    /// Removal in progress
    Destroying,
}

impl ResourceState {
    /// States recorded only while an operation is in flight. Finding one in a
    /// cache means a previous run was interrupted.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            ResourceState::Defining
                | ResourceState::Starting
                | ResourceState::Stopping
                | ResourceState::Destroying
        )
    }

    /// Whether the resource exists in a settled state.
    pub fn exists(self) -> bool {
        matches!(
            self,
            ResourceState::Defined | ResourceState::Running | ResourceState::Stopped
        )
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::Absent => "absent",
            ResourceState::Defining => "defining",
            ResourceState::Defined => "defined",
            ResourceState::Starting => "starting",
            ResourceState::Running => "running",
            ResourceState::Stopping => "stopping",
            ResourceState::Stopped => "stopped",
            ResourceState::Destroying => "destroying",
        };
        f.write_str(s)
    }
}
