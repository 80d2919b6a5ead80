//! Topology model: configuration parsing, deterministic construction and
//! validation.
//!
//! The same configuration always yields the same [`Topology`], so every
//! command can recompute the exact resource set a previous `define` created.

use crate::error::{CoreError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use tierlab_vm::{
    DesiredPower, InterfaceBinding, NetworkKind, NetworkResource, ResourceId, Role, Subnet,
    VmResource,
};

/// Smallest supported number of backends.
pub const MIN_BACKENDS: u8 = 1;

/// Largest supported number of backends.
pub const MAX_BACKENDS: u8 = 5;

/// Hostname of the load-balancing router.
pub const ROUTER_ID: &str = "router";

/// Id of the optional uplink network.
pub const UPLINK_ID: &str = "uplink-net";

/// Longest name Open vSwitch accepts for a bridge.
const MAX_SWITCH_NAME: usize = 15;

/// Log verbosity requested by the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Everything, including tool invocations
    Debug,
    /// Progress messages
    #[default]
    Info,
    /// Warnings and errors
    Warning,
    /// Errors only
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(CoreError::Config(format!(
                "debugLevel must be one of DEBUG, INFO, WARNING, ERROR (got '{other}')"
            ))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Configuration file as written by the user. Unknown keys are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(alias = "num_servers")]
    backend_count: Option<Value>,
    debug_level: Option<Value>,
    debug: Option<Value>,
    backend_networks: Option<Value>,
    uplink: Option<Value>,
}

/// Validated topology configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    /// Number of backend servers (1-5)
    pub backend_count: u8,
    /// Requested log verbosity
    pub log_level: LogLevel,
    /// Number of isolated backend subnets (1..=backend_count)
    pub backend_networks: u8,
    /// Whether the router gets an uplink network
    pub uplink: bool,
}

impl TopologyConfig {
    /// Configuration for `backend_count` backends on one subnet.
    pub fn new(backend_count: u8) -> Self {
        Self {
            backend_count,
            log_level: LogLevel::Info,
            backend_networks: 1,
            uplink: false,
        }
    }

    /// Spread the backends over `count` isolated subnets.
    pub fn with_backend_networks(mut self, count: u8) -> Self {
        self.backend_networks = count;
        self
    }

    /// Add the router-facing uplink network.
    pub fn with_uplink(mut self, uplink: bool) -> Self {
        self.uplink = uplink;
        self
    }

    /// Set the log verbosity.
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let object = match serde_json::from_str(json)
            .map_err(|e| CoreError::Config(format!("invalid JSON: {e}")))?
        {
            Value::Object(map) => map,
            other => {
                return Err(CoreError::Config(format!(
                    "configuration must be a JSON object, got {other}"
                )))
            }
        };
        let raw: RawConfig = serde_json::from_value(Value::Object(object))
            .map_err(|e| CoreError::Config(format!("invalid configuration: {e}")))?;

        let backend_count = match raw.backend_count {
            None => {
                return Err(CoreError::Config(
                    "missing required field 'backendCount'".into(),
                ))
            }
            Some(value) => small_int("backendCount", &value)?,
        };

        let log_level = match (raw.debug_level, raw.debug) {
            (Some(Value::String(level)), _) => level.parse()?,
            (Some(other), _) => {
                return Err(CoreError::Config(format!(
                    "debugLevel must be a string, got {other}"
                )))
            }
            (None, Some(Value::Bool(true))) => LogLevel::Debug,
            (None, Some(Value::Bool(false))) | (None, None) => LogLevel::Info,
            (None, Some(other)) => {
                return Err(CoreError::Config(format!(
                    "debug must be true or false, got {other}"
                )))
            }
        };

        let backend_networks = match raw.backend_networks {
            None => 1,
            Some(value) => small_int("backendNetworks", &value)?,
        };

        let uplink = match raw.uplink {
            None => false,
            Some(Value::Bool(b)) => b,
            Some(other) => {
                return Err(CoreError::Config(format!(
                    "uplink must be true or false, got {other}"
                )))
            }
        };

        let config = Self {
            backend_count,
            log_level,
            backend_networks,
            uplink,
        };
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BACKENDS..=MAX_BACKENDS).contains(&self.backend_count) {
            return Err(CoreError::Config(format!(
                "backendCount must be between {MIN_BACKENDS} and {MAX_BACKENDS}, got {}",
                self.backend_count
            )));
        }
        if self.backend_networks == 0 || self.backend_networks > self.backend_count {
            return Err(CoreError::Config(format!(
                "backendNetworks must be between 1 and backendCount ({}), got {}",
                self.backend_count, self.backend_networks
            )));
        }
        Ok(())
    }
}

fn small_int(field: &str, value: &Value) -> Result<u8> {
    let n = value
        .as_i64()
        .ok_or_else(|| CoreError::Config(format!("{field} must be an integer, got {value}")))?;
    u8::try_from(n)
        .map_err(|_| CoreError::Config(format!("{field} out of range, got {n}")))
}

/// The validated set of resources a scenario needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    backend_count: u8,
    log_level: LogLevel,
    networks: Vec<NetworkResource>,
    vms: Vec<VmResource>,
}

/// Derive the topology for `config`. Pure and deterministic.
pub fn build_topology(config: &TopologyConfig) -> Result<Topology> {
    config.validate()?;

    let mut networks = Vec::new();
    if config.uplink {
        networks.push(uplink_network()?);
    }
    let backend_nets = (0..config.backend_networks)
        .map(backend_network)
        .collect::<Result<Vec<_>>>()?;
    networks.extend(backend_nets.iter().cloned());

    let mut vms = Vec::with_capacity(usize::from(config.backend_count) + 1);
    for i in 1..=config.backend_count {
        let net = &backend_nets[usize::from((i - 1) % config.backend_networks)];
        let [a, b, c, _] = net.subnet.network().octets();
        let id = format!("backend-{i}");
        vms.push(VmResource {
            id: id.clone(),
            role: Role::Backend,
            hostname: id.clone(),
            interfaces: vec![InterfaceBinding {
                network: net.id.clone(),
                address: Ipv4Addr::new(a, b, c, 100 + i),
            }],
            disk: id,
            desired: DesiredPower::Running,
        });
    }

    // The router sits on every network; it is defined last so its routes can
    // refer to backend addresses.
    vms.push(VmResource {
        id: ROUTER_ID.into(),
        role: Role::Router,
        hostname: ROUTER_ID.into(),
        interfaces: networks
            .iter()
            .map(|n| InterfaceBinding {
                network: n.id.clone(),
                address: n.gateway,
            })
            .collect(),
        disk: ROUTER_ID.into(),
        desired: DesiredPower::Running,
    });

    Topology::from_parts(config.backend_count, config.log_level, networks, vms)
}

fn subnet(network: Ipv4Addr, prefix: u8) -> Result<Subnet> {
    Subnet::new(network, prefix)
        .ok_or_else(|| CoreError::Validation(format!("invalid subnet {network}/{prefix}")))
}

fn uplink_network() -> Result<NetworkResource> {
    Ok(NetworkResource {
        id: UPLINK_ID.into(),
        subnet: subnet(Ipv4Addr::new(192, 168, 1, 0), 26)?,
        vlan: 10,
        kind: NetworkKind::Uplink,
        gateway: Ipv4Addr::new(192, 168, 1, 1),
    })
}

fn backend_network(index: u8) -> Result<NetworkResource> {
    let third = 1 + index;
    Ok(NetworkResource {
        id: format!("backend-net-{}", index + 1),
        subnet: subnet(Ipv4Addr::new(192, 168, third, 64), 26)?,
        vlan: 100 + u16::from(index),
        kind: NetworkKind::IsolatedBackend,
        gateway: Ipv4Addr::new(192, 168, third, 65),
    })
}

impl Topology {
    /// Assemble a topology from explicit parts, checking every invariant.
    pub fn from_parts(
        backend_count: u8,
        log_level: LogLevel,
        networks: Vec<NetworkResource>,
        vms: Vec<VmResource>,
    ) -> Result<Self> {
        let topology = Self {
            backend_count,
            log_level,
            networks,
            vms,
        };
        topology.validate()?;
        Ok(topology)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CoreError::Validation(msg));

        if !(MIN_BACKENDS..=MAX_BACKENDS).contains(&self.backend_count) {
            return invalid(format!("backend count {} out of range", self.backend_count));
        }

        let mut nets = BTreeMap::new();
        for net in &self.networks {
            if net.id.is_empty()
                || net.id.len() > MAX_SWITCH_NAME
                || !net
                    .id
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            {
                return invalid(format!("invalid network id '{}'", net.id));
            }
            if nets.insert(net.id.as_str(), net).is_some() {
                return invalid(format!("duplicate network id '{}'", net.id));
            }
            if !net.subnet.is_host(net.gateway) {
                return invalid(format!(
                    "gateway {} is not a host address of {}",
                    net.gateway, net.subnet
                ));
            }
        }
        for (i, a) in self.networks.iter().enumerate() {
            for b in &self.networks[i + 1..] {
                if a.subnet.overlaps(&b.subnet) {
                    return invalid(format!(
                        "subnets of '{}' and '{}' overlap ({} / {})",
                        a.id, b.id, a.subnet, b.subnet
                    ));
                }
            }
        }

        let mut vm_ids = BTreeSet::new();
        let mut disks = BTreeSet::new();
        let mut addresses: BTreeMap<&str, BTreeMap<Ipv4Addr, &str>> = BTreeMap::new();
        let mut routers = 0;
        let mut backends = 0;

        for vm in &self.vms {
            if !vm_ids.insert(vm.id.as_str()) {
                return invalid(format!("duplicate VM id '{}'", vm.id));
            }
            if !disks.insert(vm.disk.as_str()) {
                return invalid(format!("disk '{}' is shared by several VMs", vm.disk));
            }

            for binding in &vm.interfaces {
                let Some(net) = nets.get(binding.network.as_str()) else {
                    return invalid(format!(
                        "VM '{}' references unknown network '{}'",
                        vm.id, binding.network
                    ));
                };
                if !net.subnet.is_host(binding.address) {
                    return invalid(format!(
                        "address {} of VM '{}' is not a host address of {}",
                        binding.address, vm.id, net.subnet
                    ));
                }
                let taken = addresses.entry(net.id.as_str()).or_default();
                if let Some(owner) = taken.insert(binding.address, vm.id.as_str()) {
                    return invalid(format!(
                        "address collision on '{}': {} used by '{}' and '{}'",
                        net.id, binding.address, owner, vm.id
                    ));
                }
            }

            match vm.role {
                Role::Backend => {
                    backends += 1;
                    let isolated: Vec<_> = vm
                        .interfaces
                        .iter()
                        .filter(|b| {
                            nets.get(b.network.as_str())
                                .is_some_and(|n| n.kind == NetworkKind::IsolatedBackend)
                        })
                        .collect();
                    if vm.interfaces.len() != 1 || isolated.len() != 1 {
                        return invalid(format!(
                            "backend '{}' must be bound to exactly one backend subnet",
                            vm.id
                        ));
                    }
                }
                Role::Router => {
                    routers += 1;
                    let missing = self
                        .networks
                        .iter()
                        .filter(|n| n.kind == NetworkKind::IsolatedBackend)
                        .find(|n| !vm.networks().any(|id| id == n.id));
                    if let Some(net) = missing {
                        return invalid(format!("router has no interface on '{}'", net.id));
                    }
                }
            }
        }

        if routers != 1 {
            return invalid(format!("expected exactly one router, found {routers}"));
        }
        if backends != usize::from(self.backend_count) {
            return invalid(format!(
                "expected {} backends, found {backends}",
                self.backend_count
            ));
        }
        Ok(())
    }

    /// Number of backends.
    pub fn backend_count(&self) -> u8 {
        self.backend_count
    }

    /// Requested log verbosity.
    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Networks in declaration order (uplink first, then backend subnets).
    pub fn networks(&self) -> &[NetworkResource] {
        &self.networks
    }

    /// VMs in dependency order: backends ascending, router last.
    pub fn vms(&self) -> &[VmResource] {
        &self.vms
    }

    /// Look up a network.
    pub fn network(&self, id: &str) -> Option<&NetworkResource> {
        self.networks.iter().find(|n| n.id == id)
    }

    /// Look up a VM.
    pub fn vm(&self, id: &str) -> Option<&VmResource> {
        self.vms.iter().find(|vm| vm.id == id)
    }

    /// Every resource a `define` of this topology creates, in define order.
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self
            .networks
            .iter()
            .map(|n| ResourceId::Network(n.id.clone()))
            .collect();
        ids.push(ResourceId::BaseImage);
        ids.extend(self.vms.iter().map(|vm| ResourceId::Overlay(vm.disk.clone())));
        ids.extend(self.vms.iter().map(|vm| ResourceId::Vm(vm.id.clone())));
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_requires_backend_count() {
        let err = TopologyConfig::from_json_str(r#"{"debugLevel": "INFO"}"#).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn test_config_bounds() {
        for bad in ["0", "6", "-1", "2.5", "\"3\""] {
            let json = format!(r#"{{"backendCount": {bad}}}"#);
            assert!(
                TopologyConfig::from_json_str(&json).is_err(),
                "accepted backendCount {bad}"
            );
        }
        for good in 1..=5 {
            let json = format!(r#"{{"backendCount": {good}}}"#);
            assert_eq!(
                TopologyConfig::from_json_str(&json).unwrap().backend_count,
                good
            );
        }
    }

    #[test]
    fn test_config_must_be_object() {
        for bad in ["[2]", "2", r#""backendCount""#, "null"] {
            assert!(
                matches!(TopologyConfig::from_json_str(bad), Err(CoreError::Config(_))),
                "accepted {bad}"
            );
        }
    }

    #[test]
    fn test_config_ignores_unknown_keys() {
        let config = TopologyConfig::from_json_str(
            r#"{"backendCount": 3, "debugLevel": "WARNING", "flavor": "large"}"#,
        )
        .unwrap();
        assert_eq!(config.backend_count, 3);
        assert_eq!(config.log_level, LogLevel::Warning);
        assert!(!config.uplink);
    }

    #[test]
    fn test_config_legacy_keys() {
        let config =
            TopologyConfig::from_json_str(r#"{"num_servers": 2, "debug": true}"#).unwrap();
        assert_eq!(config.backend_count, 2);
        assert_eq!(config.log_level, LogLevel::Debug);

        assert!(TopologyConfig::from_json_str(r#"{"backendCount": 2, "debug": "yes"}"#).is_err());
        assert!(
            TopologyConfig::from_json_str(r#"{"backendCount": 2, "debugLevel": "TRACE"}"#)
                .is_err()
        );
    }

    #[test]
    fn test_config_backend_networks_bounds() {
        assert!(
            TopologyConfig::from_json_str(r#"{"backendCount": 2, "backendNetworks": 3}"#)
                .is_err()
        );
        assert!(
            TopologyConfig::from_json_str(r#"{"backendCount": 2, "backendNetworks": 0}"#)
                .is_err()
        );
    }

    #[test]
    fn test_build_default_topology() {
        let topology = build_topology(&TopologyConfig::new(2)).unwrap();

        assert_eq!(topology.networks().len(), 1);
        let net = &topology.networks()[0];
        assert_eq!(net.id, "backend-net-1");
        assert_eq!(net.subnet.to_string(), "192.168.1.64/26");

        let ids: Vec<&str> = topology.vms().iter().map(|vm| vm.id.as_str()).collect();
        assert_eq!(ids, vec!["backend-1", "backend-2", "router"]);

        let b1 = topology.vm("backend-1").unwrap();
        assert_eq!(b1.interfaces[0].address, Ipv4Addr::new(192, 168, 1, 101));
        let router = topology.vm(ROUTER_ID).unwrap();
        assert_eq!(router.interfaces[0].address, Ipv4Addr::new(192, 168, 1, 65));
    }

    #[test]
    fn test_build_with_uplink_and_subnets() {
        let config = TopologyConfig::new(5)
            .with_backend_networks(2)
            .with_uplink(true);
        let topology = build_topology(&config).unwrap();

        let nets: Vec<&str> = topology.networks().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(nets, vec!["uplink-net", "backend-net-1", "backend-net-2"]);

        let b2 = topology.vm("backend-2").unwrap();
        assert_eq!(b2.interfaces[0].network, "backend-net-2");
        assert_eq!(b2.interfaces[0].address, Ipv4Addr::new(192, 168, 2, 102));
        let b3 = topology.vm("backend-3").unwrap();
        assert_eq!(b3.interfaces[0].network, "backend-net-1");

        let router = topology.vm(ROUTER_ID).unwrap();
        assert_eq!(router.interfaces.len(), 3);
        assert_eq!(router.interfaces[0].address, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn test_build_is_deterministic() {
        for n in MIN_BACKENDS..=MAX_BACKENDS {
            let config = TopologyConfig::new(n).with_uplink(n % 2 == 0);
            assert_eq!(
                build_topology(&config).unwrap(),
                build_topology(&config).unwrap()
            );
        }
    }

    #[test]
    fn test_resource_ids_in_define_order() {
        let topology = build_topology(&TopologyConfig::new(1)).unwrap();
        let ids: Vec<String> = topology
            .resource_ids()
            .iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(
            ids,
            vec![
                "network/backend-net-1",
                "image/base",
                "overlay/backend-1",
                "overlay/router",
                "vm/backend-1",
                "vm/router",
            ]
        );
    }

    #[test]
    fn test_address_collision_rejected() {
        let topology = build_topology(&TopologyConfig::new(2)).unwrap();
        let mut vms = topology.vms().to_vec();
        vms[1].interfaces[0].address = vms[0].interfaces[0].address;

        let err = Topology::from_parts(2, LogLevel::Info, topology.networks().to_vec(), vms)
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(ref msg) if msg.contains("collision")));
    }

    #[test]
    fn test_unknown_network_rejected() {
        let topology = build_topology(&TopologyConfig::new(1)).unwrap();
        let mut vms = topology.vms().to_vec();
        vms[0].interfaces[0].network = "nowhere".into();

        let err = Topology::from_parts(1, LogLevel::Info, topology.networks().to_vec(), vms)
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn test_shared_disk_rejected() {
        let topology = build_topology(&TopologyConfig::new(2)).unwrap();
        let mut vms = topology.vms().to_vec();
        vms[1].disk = vms[0].disk.clone();

        let err = Topology::from_parts(2, LogLevel::Info, topology.networks().to_vec(), vms)
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
