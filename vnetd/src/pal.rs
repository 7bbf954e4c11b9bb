/// Platform abstraction for the host-side state the lifecycle algorithms
/// mutate. As in the rest of the stack the intention is testability: the
/// network types talk to these traits, the Linux implementation shells
/// out to the usual tools, and tests substitute mocks.
use crate::batch::Batch;
use crate::Result;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Everything a lifecycle phase needs from its surroundings: the batch
/// adapter (identity + key-value store) and the host-state backends.
pub struct Env<'a> {
    pub batch: &'a dyn Batch,
    pub host: &'a dyn HostNet,
    pub pci: &'a dyn HostPci,
}

/// SR-IOV device family. Determines how a virtual function is isolated:
/// pkey-index tables (mlx4) or explicit GUIDs with policy=Follow (mlx5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfType {
    Mlx4,
    Mlx5,
}

/// Network namespace a link command executes in; the root namespace by
/// default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Netns(Option<String>);

impl Netns {
    pub fn root() -> Self {
        Self(None)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self(Some(name.into()))
    }

    pub fn name(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// Firewall table a rule lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwTable {
    Filter,
    Nat,
}

/// Parameters of the DHCP/DNS server serving one NAT bridge. The pid
/// file doubles as the liveness marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsmasqConfig {
    pub bridge: String,
    pub pid_file: PathBuf,
    pub vm_hwaddr: String,
    pub vm_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub domain_name: String,
    pub dns_server: String,
    pub ntp_server: String,
}

/// Kernel and switch state: TAP/VETH devices, bridges, flow tables,
/// firewall rules, addressing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostNet: Send + Sync {
    // tap/veth devices
    async fn create_tap(&self, name: &str, user: &str) -> Result<()>;
    async fn delete_tap(&self, name: &str) -> Result<()>;
    async fn create_veth_pair(&self, name1: &str, name2: &str) -> Result<()>;
    async fn delete_veth(&self, name: &str, netns: &Netns) -> Result<()>;
    async fn dev_enable(&self, name: &str, netns: &Netns) -> Result<()>;
    async fn set_mtu(&self, dev: &str, mtu: u32, netns: &Netns) -> Result<()>;
    /// Ids (numeric suffixes) of all kernel network devices named
    /// `<prefix><id>`.
    async fn used_dev_ids(&self, prefix: &str) -> Result<Vec<u32>>;

    // namespaces
    async fn netns_add(&self, name: &str) -> Result<()>;
    async fn netns_delete(&self, name: &str) -> Result<()>;

    // addressing
    async fn ip_add_idemp(&self, ip: Ipv4Addr, bits: u8, dev: &str, netns: &Netns) -> Result<()>;
    async fn ip_route_add(&self, dest: &str, gw: Ipv4Addr, netns: &Netns) -> Result<()>;
    async fn arp_add(&self, ip: Ipv4Addr, hwaddr: &str, dev: &str) -> Result<()>;
    async fn arp_del(&self, ip: Ipv4Addr, hwaddr: &str, dev: &str) -> Result<()>;
    /// Address this host resolves to, used as the reverse-NAT target.
    async fn host_addr(&self) -> Result<Ipv4Addr>;

    // kernel bridge
    /// Whether `name` is a bridge, kernel or switch.
    async fn bridge_exists(&self, name: &str) -> Result<bool>;
    async fn bridge_add_port(&self, dev: &str, bridge: &str) -> Result<()>;

    // software switch
    async fn ovs_bridge_exists(&self, name: &str) -> Result<bool>;
    async fn ovs_add_bridge(&self, name: &str, hwaddr: Option<String>) -> Result<()>;
    async fn ovs_del_bridge(&self, name: &str) -> Result<()>;
    async fn ovs_add_port(&self, dev: &str, bridge: &str) -> Result<u32>;
    async fn ovs_del_port(&self, dev: &str, bridge: &str) -> Result<()>;
    async fn ovs_port_id(&self, dev: &str, bridge: &str) -> Result<u32>;
    async fn ovs_add_tunnel(
        &self,
        bridge: &str,
        name: &str,
        kind: &str,
        remote_host: &str,
        key: u32,
    ) -> Result<u32>;
    /// Install `flow` (match plus actions) in the given table at the
    /// given priority.
    async fn ovs_add_flow(&self, bridge: &str, table: u32, priority: u32, flow: &str)
        -> Result<()>;
    async fn ovs_del_flows(&self, bridge: &str, flow: &str) -> Result<()>;

    // firewall
    /// Append `rule` to `chain` unless the kernel already reports it.
    async fn ipt_append_rule_idemp(&self, rule: &str, chain: &str, table: FwTable) -> Result<()>;
    /// Delete `rule` from `chain` if the kernel reports it.
    async fn ipt_delete_rule_idemp(&self, rule: &str, chain: &str, table: FwTable) -> Result<()>;
    async fn ipt_set_policy(&self, chain: &str, policy: &str) -> Result<()>;
    async fn set_ip_forward(&self, enable: bool) -> Result<()>;

    // DHCP/DNS server
    async fn dnsmasq_is_running(&self, pid_file: &Path) -> Result<bool>;
    async fn start_dnsmasq(&self, config: &DnsmasqConfig) -> Result<()>;
    async fn stop_dnsmasq(&self, pid_file: &Path) -> Result<()>;
}

/// PCI passthrough state: driver bindings, SR-IOV virtual functions and
/// InfiniBand per-VF isolation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostPci: Send + Sync {
    /// Register the vendor/device id of `dev_addr` with `driver` so the
    /// driver accepts binds for that model.
    async fn enable_driver(&self, dev_addr: &str, driver: &str) -> Result<()>;
    /// Same, for the first virtual function of an InfiniBand device.
    async fn vf_enable_driver(&self, device: &str, driver: &str) -> Result<()>;
    /// Addresses currently bound to the passthrough driver.
    async fn list_vfio_devices(&self) -> Result<Vec<String>>;
    /// Bind to vfio-pci and hand the IOMMU group device node to `user`.
    async fn bind_vfio(&self, dev_addr: &str, user: &str) -> Result<()>;
    /// Unbind from vfio-pci and give the device back to `host_driver`.
    async fn unbind_vfio(&self, dev_addr: &str, host_driver: &str) -> Result<()>;

    /// First virtual function of `device` not yet bound to vfio-pci.
    async fn find_free_vf(&self, device: &str) -> Result<String>;
    /// Unbind every virtual function of `device` still under vfio-pci.
    /// Returns the addresses that were reclaimed.
    async fn cleanup_vfs(&self, device: &str) -> Result<Vec<String>>;

    // mlx4: pkey-index tables
    async fn vf_allow_host_pkeys(&self, device: &str, vf_addr: &str) -> Result<()>;
    async fn vf_clear_pkeys(&self, device: &str, vf_addr: &str) -> Result<()>;
    async fn vf_set_pkey(&self, device: &str, vf_addr: &str, pkey: u16) -> Result<()>;

    // mlx5: explicit GUIDs
    async fn vf_set_guid(
        &self,
        device: &str,
        vf_addr: &str,
        port_guid: &str,
        node_guid: &str,
    ) -> Result<()>;
    async fn vf_unset_guid(&self, device: &str, vf_addr: &str) -> Result<()>;

    /// GUID of the physical port, as written into the fabric manager
    /// records.
    async fn phys_port_guid(&self, device: &str) -> Result<String>;
}

// All host-local devices we own follow the `<prefix><id>` naming scheme,
// so leftovers from crashed jobs can be matched back by prefix.

pub fn dev_name_from_id(prefix: &str, id: u32) -> String {
    format!("{prefix}{id}")
}

pub fn id_from_dev_name(prefix: &str, name: &str) -> Option<u32> {
    name.strip_prefix(prefix)
        .filter(|suffix| !suffix.is_empty())
        .and_then(|suffix| suffix.parse().ok())
}

/// Lowest id not present in `used`.
pub fn free_dev_id(used: &[u32]) -> u32 {
    let mut used = used.to_vec();
    used.sort_unstable();
    used.dedup();
    for (pos, id) in used.iter().enumerate() {
        if (pos as u32) < *id {
            return pos as u32;
        }
    }
    used.len() as u32
}

pub fn free_dev_name(prefix: &str, used: &[u32]) -> String {
    dev_name_from_id(prefix, free_dev_id(used))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_naming() {
        assert_eq!("nattap7", dev_name_from_id("nattap", 7));
        assert_eq!(Some(7), id_from_dev_name("nattap", "nattap7"));
        assert_eq!(None, id_from_dev_name("nattap", "pvtap7"));
        assert_eq!(None, id_from_dev_name("nattap", "nattap"));
        assert_eq!(None, id_from_dev_name("nattap", "nattap7x"));
    }

    #[test]
    fn test_free_dev_id() {
        assert_eq!(0, free_dev_id(&[]));
        assert_eq!(0, free_dev_id(&[1, 2]));
        assert_eq!(1, free_dev_id(&[0, 2, 3]));
        assert_eq!(3, free_dev_id(&[2, 0, 1]));
    }

    #[test]
    fn test_netns() {
        assert_eq!(None, Netns::root().name());
        assert_eq!(Some("vmns0"), Netns::named("vmns0").name());
    }
}
