//! libvirt + Open vSwitch provider driven through `virsh` and `ovs-vsctl`.

use crate::builder::{interface_xml, DomainBuilder};
use crate::error::{Result, VmError};
use crate::image::DiskImage;
use crate::provider::ResourceProvider;
use crate::resource::{InterfaceBinding, NetworkResource, ResourceId, ResourceState, VmResource};
use crate::tool::ToolRunner;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Settings for [`VirshProvider`].
#[derive(Debug, Clone)]
pub struct VirshConfig {
    /// Run tools through `sudo`
    pub sudo: bool,
    /// libvirt connection URI
    pub connect_uri: String,
    /// Directory generated domain definitions are written to
    pub xml_dir: PathBuf,
    /// vCPUs per VM
    pub vcpus: u8,
    /// Memory per VM in MiB
    pub memory_mib: u32,
    /// How often a shutting-down domain is polled
    pub poll_interval: Duration,
}

impl Default for VirshConfig {
    fn default() -> Self {
        Self {
            sudo: true,
            connect_uri: "qemu:///system".into(),
            xml_dir: PathBuf::from("xmls"),
            vcpus: 1,
            memory_mib: 512,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// [`ResourceProvider`] backed by libvirt domains and Open vSwitch bridges.
#[derive(Debug, Clone)]
pub struct VirshProvider {
    config: VirshConfig,
    tools: ToolRunner,
}

impl VirshProvider {
    /// Create a provider.
    pub fn new(config: VirshConfig) -> Self {
        let tools = ToolRunner::new(config.sudo);
        Self { config, tools }
    }

    /// Provider settings.
    pub fn config(&self) -> &VirshConfig {
        &self.config
    }

    async fn virsh(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["-c", self.config.connect_uri.as_str()];
        full.extend_from_slice(args);
        self.tools.run("virsh", &full).await
    }

    async fn domain_state(&self, id: &str) -> Result<ResourceState> {
        let args = ["-c", self.config.connect_uri.as_str(), "domstate", id];
        let output = self.tools.output("virsh", &args).await?;
        if !output.success {
            if is_missing_domain(&output.stderr) {
                return Ok(ResourceState::Absent);
            }
            return Err(VmError::Command {
                program: format!("virsh domstate {id}"),
                status: format!("exit code {:?}", output.code),
                stderr: output.stderr,
            });
        }
        parse_domstate(output.stdout.trim())
    }

    async fn bridge_exists(&self, id: &str) -> Result<bool> {
        let output = self.tools.output("ovs-vsctl", &["br-exists", id]).await?;
        match output.code {
            Some(0) => Ok(true),
            // ovs-vsctl reports a missing bridge with exit status 2.
            Some(2) => Ok(false),
            _ => Err(VmError::Command {
                program: format!("ovs-vsctl br-exists {id}"),
                status: format!("exit code {:?}", output.code),
                stderr: output.stderr,
            }),
        }
    }

    async fn write_xml(&self, name: &str, xml: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config.xml_dir).await?;
        let path = self.config.xml_dir.join(format!("{name}.xml"));
        tokio::fs::write(&path, xml).await?;
        Ok(path)
    }

    async fn remove_xml(&self, name: &str) {
        let path = self.config.xml_dir.join(format!("{name}.xml"));
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove domain XML");
            }
        }
    }

    async fn wait_for_shutoff(&self, id: &str, grace: Duration) -> Result<bool> {
        let deadline = Instant::now() + grace;
        loop {
            let state = self.domain_state(id).await?;
            if !matches!(state, ResourceState::Running | ResourceState::Stopping) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[async_trait]
impl ResourceProvider for VirshProvider {
    #[instrument(skip(self, network), fields(network = %network.id))]
    async fn create_network(&self, network: &NetworkResource) -> Result<()> {
        let vlan = network.vlan.to_string();
        let tag = format!("tag={vlan}");
        self.tools
            .run(
                "ovs-vsctl",
                &[
                    "--may-exist",
                    "add-br",
                    &network.id,
                    "--",
                    "set",
                    "port",
                    &network.id,
                    &tag,
                ],
            )
            .await?;
        self.tools
            .run("ip", &["link", "set", "dev", &network.id, "up"])
            .await?;
        info!(subnet = %network.subnet, vlan = network.vlan, "Switch ready");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn destroy_network(&self, id: &str) -> Result<()> {
        self.tools
            .run("ovs-vsctl", &["--if-exists", "del-br", id])
            .await?;
        info!("Switch removed");
        Ok(())
    }

    #[instrument(skip(self, vm, disk), fields(vm = %vm.id))]
    async fn create_vm(&self, vm: &VmResource, disk: &DiskImage) -> Result<()> {
        // Redefining would drop interfaces attached since the first define.
        if self.domain_state(&vm.id).await? != ResourceState::Absent {
            info!("Domain already defined");
            return Ok(());
        }

        let disk_path = tokio::fs::canonicalize(&disk.path).await?;
        let xml = DomainBuilder::new(&vm.id)
            .vcpus(self.config.vcpus)
            .memory_mib(self.config.memory_mib)
            .disk(&disk_path)
            .build();
        let path = self.write_xml(&vm.id, &xml).await?;
        self.virsh(&["define", &path.to_string_lossy()]).await?;
        info!(xml = %path.display(), "Domain defined");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn destroy_vm(&self, id: &str) -> Result<()> {
        match self.domain_state(id).await? {
            ResourceState::Absent => {
                info!("Domain already absent");
                self.remove_xml(id).await;
                return Ok(());
            }
            ResourceState::Running | ResourceState::Stopping => {
                warn!("Domain still running, forcing it off");
                self.virsh(&["destroy", id]).await?;
            }
            _ => {}
        }
        self.virsh(&["undefine", id]).await?;
        self.remove_xml(id).await;
        info!("Domain undefined");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start_vm(&self, id: &str) -> Result<()> {
        match self.domain_state(id).await? {
            ResourceState::Running => return Ok(()),
            ResourceState::Absent => return Err(VmError::NotFound(id.to_string())),
            _ => {}
        }
        self.virsh(&["start", id]).await?;
        info!("Domain started");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop_vm(&self, id: &str, grace: Duration) -> Result<()> {
        if !matches!(
            self.domain_state(id).await?,
            ResourceState::Running | ResourceState::Stopping
        ) {
            return Ok(());
        }

        self.virsh(&["shutdown", id]).await?;
        if self.wait_for_shutoff(id, grace).await? {
            info!("Domain shut down");
            return Ok(());
        }

        warn!(grace_secs = grace.as_secs(), "Graceful shutdown timed out, forcing off");
        self.virsh(&["destroy", id]).await?;
        Ok(())
    }

    async fn query_state(&self, id: &ResourceId) -> Result<ResourceState> {
        match id {
            ResourceId::Network(net) => Ok(if self.bridge_exists(net).await? {
                ResourceState::Defined
            } else {
                ResourceState::Absent
            }),
            ResourceId::Vm(vm) => self.domain_state(vm).await,
            ResourceId::BaseImage | ResourceId::Overlay(_) => Err(VmError::NotFound(format!(
                "{id} is not a provider resource"
            ))),
        }
    }

    #[instrument(skip(self))]
    async fn attach_interface(
        &self,
        vm_id: &str,
        network_id: &str,
        address: Ipv4Addr,
    ) -> Result<()> {
        if self
            .attached_networks(vm_id)
            .await?
            .iter()
            .any(|n| n == network_id)
        {
            return Ok(());
        }

        let binding = InterfaceBinding {
            network: network_id.to_string(),
            address,
        };
        let name = format!("{vm_id}-{network_id}");
        let path = self.write_xml(&name, &interface_xml(&binding)).await?;
        let result = self
            .virsh(&["attach-device", vm_id, &path.to_string_lossy(), "--config"])
            .await;
        self.remove_xml(&name).await;
        result?;
        info!(mac = %binding.mac(), "Interface attached");
        Ok(())
    }

    async fn attached_networks(&self, vm_id: &str) -> Result<Vec<String>> {
        if self.domain_state(vm_id).await? == ResourceState::Absent {
            return Ok(Vec::new());
        }
        let listing = self.virsh(&["domiflist", vm_id]).await?;
        Ok(parse_domiflist(&listing))
    }
}

fn is_missing_domain(stderr: &str) -> bool {
    stderr.contains("failed to get domain") || stderr.contains("Domain not found")
}

/// Map `virsh domstate` output to a lifecycle state.
fn parse_domstate(state: &str) -> Result<ResourceState> {
    match state {
        "running" | "paused" | "idle" | "pmsuspended" => Ok(ResourceState::Running),
        "in shutdown" => Ok(ResourceState::Stopping),
        "shut off" | "crashed" => Ok(ResourceState::Stopped),
        other => Err(VmError::Parse {
            program: "virsh domstate".into(),
            output: other.to_string(),
        }),
    }
}

/// Extract the source bridges from `virsh domiflist` output.
fn parse_domiflist(listing: &str) -> Vec<String> {
    listing
        .lines()
        .skip_while(|line| !line.trim_start().starts_with('-'))
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(2))
        .map(str::to_string)
        .collect()
}
