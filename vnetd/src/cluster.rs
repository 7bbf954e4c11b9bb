use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Ethernet interface descriptor handed over to the VM launcher.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct EthIface {
    pub network: String,
    pub tap: String,
    pub hwaddr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
}

/// VFIO passthrough descriptor handed over to the VM launcher.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct VfioIface {
    pub network: String,
    pub dev_addr: String,
}

/// One virtual machine of the job. `rank` is dense and starts at 0;
/// `host_rank` names the node the VM runs on.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Vm {
    pub rank: u32,
    pub host_rank: u32,
    pub networks: BTreeSet<String>,
    #[serde(default)]
    pub eth_ifaces: Vec<EthIface>,
    #[serde(default)]
    pub vfio_ifaces: Vec<VfioIface>,
}

impl Vm {
    pub fn new<I, S>(rank: u32, host_rank: u32, networks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rank,
            host_rank,
            networks: networks.into_iter().map(Into::into).collect(),
            eth_ifaces: vec![],
            vfio_ifaces: vec![],
        }
    }

    pub fn is_on_node(&self, node_rank: u32) -> bool {
        self.host_rank == node_rank
    }

    pub fn uses_network(&self, name: &str) -> bool {
        self.networks.contains(name)
    }

    pub fn add_eth_iface(
        &mut self,
        network: &str,
        tap: &str,
        hwaddr: &str,
        host_port: Option<u16>,
    ) {
        self.eth_ifaces.push(EthIface {
            network: network.to_string(),
            tap: tap.to_string(),
            hwaddr: hwaddr.to_string(),
            host_port,
        });
    }

    pub fn add_vfio_iface(&mut self, network: &str, dev_addr: &str) {
        self.vfio_ifaces.push(VfioIface {
            network: network.to_string(),
            dev_addr: dev_addr.to_string(),
        });
    }
}

/// The cluster descriptor: the ordered list of VM records for one job.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Cluster {
    pub vms: Vec<Vm>,
}

impl Cluster {
    pub fn new(vms: Vec<Vm>) -> Self {
        Self { vms }
    }

    /// Names of all networks referenced by any VM of the job.
    pub fn network_names(&self) -> BTreeSet<String> {
        self.vms
            .iter()
            .flat_map(|vm| vm.networks.iter().cloned())
            .collect()
    }

    /// VMs attached to the given network, cluster-wide.
    pub fn vms_on_network<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Vm> {
        self.vms.iter().filter(move |vm| vm.uses_network(name))
    }

    /// VMs of the given network running on this node.
    pub fn local_vms_on_network<'a>(
        &'a self,
        name: &'a str,
        node_rank: u32,
    ) -> impl Iterator<Item = &'a Vm> {
        self.vms_on_network(name)
            .filter(move |vm| vm.is_on_node(node_rank))
    }

    /// Host ranks touched by the given network, in ascending order.
    pub fn hosts_on_network(&self, name: &str) -> BTreeSet<u32> {
        self.vms_on_network(name).map(|vm| vm.host_rank).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_selection() {
        let cluster = Cluster::new(vec![
            Vm::new(0, 0, ["pv0", "natnet"]),
            Vm::new(1, 1, ["pv0"]),
            Vm::new(2, 1, ["ibnet"]),
        ]);
        assert_eq!(
            vec!["ibnet", "natnet", "pv0"],
            cluster.network_names().into_iter().collect::<Vec<_>>()
        );
        assert_eq!(2, cluster.vms_on_network("pv0").count());
        assert_eq!(1, cluster.local_vms_on_network("pv0", 1).count());
        assert_eq!(
            vec![0, 1],
            cluster.hosts_on_network("pv0").into_iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_launch_descriptors() {
        let mut vm = Vm::new(0, 0, ["natnet"]);
        vm.add_eth_iface("natnet", "nattap0", "52:54:00:44:ae:5e", Some(10022));
        vm.add_vfio_iface("ibnet", "0000:83:00.1");
        assert_eq!(Some(10022), vm.eth_ifaces[0].host_port);
        assert_eq!("0000:83:00.1", vm.vfio_ifaces[0].dev_addr);
    }
}
