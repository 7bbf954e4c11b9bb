use crate::cluster::Cluster;
use crate::config::validate_mac_prefix;
use crate::id_alloc::IdAllocator;
use crate::net::{dump_resources, gen_hwaddr, load_resources, vm_res_label, Network};
use crate::pal::{dev_name_from_id, free_dev_name, Env, Netns};
use crate::{Error, Result, KS_CLUSTER};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const TYPE: &str = "pv";

/// Tunnel keys are drawn from this range; the low values are left to
/// other users of the fabric.
const MIN_KEY: u32 = 1024;
const MAX_KEY: u32 = u16::MAX as u32;

const TUNNEL_KIND: &str = "vxlan";

/// Per-job private overlay: one software-switch bridge per host, linked
/// to the peer hosts by tunnels sharing one cluster-wide key, with a
/// static flow table instead of MAC learning.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PvSettings {
    #[serde(default = "default_mac_prefix")]
    pub mac_prefix: String,
    pub bridge_prefix: String,
    pub tap_prefix: String,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default)]
    pub host_if_suffix: String,
}

fn default_mac_prefix() -> String {
    "52:54:00".to_string()
}

fn default_mtu() -> u32 {
    1500
}

#[derive(Serialize, Deserialize, Debug)]
struct PvVmRes {
    tap_name: String,
    hwaddr: String,
    port_id: u32,
}

#[derive(Serialize, Deserialize, Debug)]
struct PvGlobal {
    bridge_name: String,
    tun_id: u32,
    master: u32,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct Record {
    #[serde(skip_serializing_if = "Option::is_none")]
    global: Option<PvGlobal>,
    #[serde(flatten)]
    vms: BTreeMap<String, PvVmRes>,
}

pub struct PvNetwork {
    name: String,
    settings: PvSettings,
    ida: IdAllocator,
}

impl PvNetwork {
    pub fn new(name: &str, settings: PvSettings) -> Result<Self> {
        validate_mac_prefix(&settings.mac_prefix)?;
        Ok(Self {
            name: name.to_string(),
            settings,
            ida: IdAllocator::new(
                format!("net/type/{TYPE}/key_alloc_state"),
                MAX_KEY - MIN_KEY + 1,
            ),
        })
    }

    fn key_label(&self) -> String {
        format!("{0}/{0}_key", self.name)
    }

    /// Bridge, ports, tunnels and flows for every VM of the network.
    async fn populate(
        &self,
        env: &Env<'_>,
        cluster: &Cluster,
        bridge: &str,
        tun_id: u32,
        record: &mut Record,
    ) -> Result<()> {
        let node_rank = env.batch.node_rank();

        env.host.ovs_add_bridge(bridge, None).await?;
        env.host
            .set_mtu(bridge, self.settings.mtu, &Netns::root())
            .await?;

        let mut host_tunnels: BTreeMap<u32, u32> = BTreeMap::new();
        let mut local_ports = vec![];
        for vm in cluster.vms_on_network(&self.name) {
            let hwaddr = gen_hwaddr(&self.settings.mac_prefix, vm.rank)?;
            if vm.is_on_node(node_rank) {
                let used = env.host.used_dev_ids(&self.settings.tap_prefix).await?;
                let tap_name = free_dev_name(&self.settings.tap_prefix, &used);
                env.host.create_tap(&tap_name, env.batch.batch_user()).await?;
                env.host.dev_enable(&tap_name, &Netns::root()).await?;
                env.host
                    .set_mtu(&tap_name, self.settings.mtu, &Netns::root())
                    .await?;
                let port_id = env.host.ovs_add_port(&tap_name, bridge).await?;
                local_ports.push(port_id);

                // Unicast straight to the destination tap.
                env.host
                    .ovs_add_flow(
                        bridge,
                        0,
                        3000,
                        &format!(
                            "idle_timeout=0,hard_timeout=0,dl_dst={hwaddr},actions=output:{port_id}"
                        ),
                    )
                    .await?;
                // Flood packets the VM sends to unknown destinations.
                env.host
                    .ovs_add_flow(
                        bridge,
                        0,
                        2000,
                        &format!("in_port={port_id},idle_timeout=0,hard_timeout=0,actions=flood"),
                    )
                    .await?;

                record.vms.insert(
                    vm_res_label(vm.rank),
                    PvVmRes {
                        tap_name,
                        hwaddr,
                        port_id,
                    },
                );
            } else {
                let tunnel_port = match host_tunnels.get(&vm.host_rank) {
                    Some(port) => *port,
                    None => {
                        let tun_name = format!("htun-{bridge}-{}", host_tunnels.len());
                        let remote = format!(
                            "{}{}",
                            env.batch.host_name(vm.host_rank),
                            self.settings.host_if_suffix
                        );
                        let port = env
                            .host
                            .ovs_add_tunnel(bridge, &tun_name, TUNNEL_KIND, &remote, tun_id)
                            .await?;
                        host_tunnels.insert(vm.host_rank, port);
                        port
                    }
                };
                // Unicast for a remote VM goes down its host's tunnel.
                env.host
                    .ovs_add_flow(
                        bridge,
                        0,
                        3000,
                        &format!(
                            "idle_timeout=0,hard_timeout=0,dl_dst={hwaddr},actions=output:{tunnel_port}"
                        ),
                    )
                    .await?;
            }
        }

        // Incoming broadcast goes to every local VM.
        if !local_ports.is_empty() {
            let ports = local_ports
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            env.host
                .ovs_add_flow(
                    bridge,
                    0,
                    1000,
                    &format!("idle_timeout=0,hard_timeout=0,actions=output:{ports}"),
                )
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Network for PvNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        TYPE
    }

    async fn init_node(&self, _env: &Env<'_>) -> Result<()> {
        Ok(())
    }

    async fn alloc_node_resources(&self, env: &Env<'_>, cluster: &Cluster) -> Result<()> {
        let node_rank = env.batch.node_rank();
        let hosts = cluster.hosts_on_network(&self.name);
        let Some(master) = hosts.first().copied() else {
            return Ok(());
        };
        if cluster
            .local_vms_on_network(&self.name, node_rank)
            .next()
            .is_none()
        {
            return Ok(());
        }

        if node_rank == master {
            info!("node is master for PV network {}", self.name);
        }
        let tun_id = MIN_KEY
            + self
                .ida
                .coll_alloc_one(env.batch, master, &self.key_label())
                .await?;

        let used = env.host.used_dev_ids(&self.settings.bridge_prefix).await?;
        let bridge_name = free_dev_name(&self.settings.bridge_prefix, &used);

        let mut record = Record {
            global: Some(PvGlobal {
                bridge_name: bridge_name.clone(),
                tun_id,
                master,
            }),
            vms: BTreeMap::new(),
        };
        if let Err(err) = self
            .populate(env, cluster, &bridge_name, tun_id, &mut record)
            .await
        {
            // keep what we got so a later free can reclaim it
            let _ = dump_resources(env, &self.name, &record).await;
            return Err(err);
        }
        dump_resources(env, &self.name, &record).await
    }

    async fn load_node_resources(&self, env: &Env<'_>, cluster: &mut Cluster) -> Result<()> {
        let node_rank = env.batch.node_rank();
        if cluster
            .local_vms_on_network(&self.name, node_rank)
            .next()
            .is_none()
        {
            return Ok(());
        }
        let record: Record = load_resources(env, &self.name).await?;
        for vm in cluster
            .vms
            .iter_mut()
            .filter(|vm| vm.is_on_node(node_rank) && vm.uses_network(&self.name))
        {
            let res = record
                .vms
                .get(&vm_res_label(vm.rank))
                .ok_or_else(|| Error::StateMissing(self.name.clone()))?;
            vm.add_eth_iface(&self.name, &res.tap_name, &res.hwaddr, None);
        }
        Ok(())
    }

    async fn free_node_resources(&self, env: &Env<'_>, cluster: &Cluster) -> Result<()> {
        let node_rank = env.batch.node_rank();
        if cluster
            .local_vms_on_network(&self.name, node_rank)
            .next()
            .is_none()
        {
            return Ok(());
        }
        let record: Record = load_resources(env, &self.name).await?;
        let global = record
            .global
            .ok_or_else(|| Error::StateMissing(self.name.clone()))?;

        for vm in cluster.local_vms_on_network(&self.name, node_rank) {
            let res = record
                .vms
                .get(&vm_res_label(vm.rank))
                .ok_or_else(|| Error::StateMissing(self.name.clone()))?;
            env.host
                .ovs_del_port(&res.tap_name, &global.bridge_name)
                .await?;
            env.host.delete_tap(&res.tap_name).await?;
        }
        env.host.ovs_del_bridge(&global.bridge_name).await?;

        if global.master == node_rank {
            self.ida
                .free_one(env.batch, global.tun_id - MIN_KEY)
                .await?;
            env.batch.delete_dir(KS_CLUSTER, &self.name).await?;
        }
        Ok(())
    }

    async fn cleanup_node(&self, env: &Env<'_>) -> Result<()> {
        for id in env.host.used_dev_ids(&self.settings.bridge_prefix).await? {
            warn!("deleting leftover bridge for {} network", self.name);
            let bridge = dev_name_from_id(&self.settings.bridge_prefix, id);
            if let Err(err) = env.host.ovs_del_bridge(&bridge).await {
                warn!("could not delete {bridge}: {err}");
            }
        }
        for id in env.host.used_dev_ids(&self.settings.tap_prefix).await? {
            warn!("deleting leftover tap for {} network", self.name);
            let tap = dev_name_from_id(&self.settings.tap_prefix, id);
            if let Err(err) = env.host.delete_tap(&tap).await {
                warn!("could not delete {tap}: {err}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use crate::batch::tests::MemBatch;
    use crate::cluster::Vm;
    use crate::pal::{MockHostNet, MockHostPci};
    use mockall::predicate::{always, eq};

    fn settings() -> PvSettings {
        serde_yaml::from_str("bridge-prefix: pvbr\ntap-prefix: pvtap\n").unwrap()
    }

    fn two_host_cluster() -> Cluster {
        Cluster::new(vec![Vm::new(0, 0, ["pv0"]), Vm::new(1, 1, ["pv0"])])
    }

    #[test]
    fn test_settings_defaults() {
        let settings = settings();
        assert_eq!("52:54:00", settings.mac_prefix);
        assert_eq!(1500, settings.mtu);
        assert_eq!("", settings.host_if_suffix);
    }

    #[test]
    fn test_bad_mac_prefix_rejected() {
        let mut settings = settings();
        settings.mac_prefix = "52:54:00:11:22:33".to_string();
        assert!(matches!(
            PvNetwork::new("pv0", settings),
            Err(Error::Config(_))
        ));
    }

    fn expect_local_vm_setup(host: &mut MockHostNet) {
        host.expect_used_dev_ids().returning(|_| Ok(vec![]));
        host.expect_ovs_add_bridge()
            .with(eq("pvbr0"), eq(None::<String>))
            .once()
            .returning(|_, _| Ok(()));
        host.expect_set_mtu().returning(|_, _, _| Ok(()));
        host.expect_create_tap()
            .with(eq("pvtap0"), always())
            .once()
            .returning(|_, _| Ok(()));
        host.expect_dev_enable().returning(|_, _| Ok(()));
        host.expect_ovs_add_port()
            .with(eq("pvtap0"), eq("pvbr0"))
            .once()
            .returning(|_, _| Ok(1));
    }

    #[tokio::test]
    async fn test_master_alloc_two_hosts() {
        let batch = MemBatch::new(0);
        let mut host = MockHostNet::new();
        expect_local_vm_setup(&mut host);
        // tunnel to host 1 with the collective key
        host.expect_ovs_add_tunnel()
            .with(
                eq("pvbr0"),
                eq("htun-pvbr0-0"),
                eq("vxlan"),
                eq("host1"),
                eq(1024),
            )
            .once()
            .returning(|_, _, _, _, _| Ok(2));
        // unicast to the local VM, flood-out for it, unicast to the
        // remote VM through the tunnel, broadcast catch-all
        host.expect_ovs_add_flow()
            .withf(|_, _, prio, flow| {
                *prio == 3000 && flow.contains("dl_dst=52:54:00:00:00:00,actions=output:1")
            })
            .once()
            .returning(|_, _, _, _| Ok(()));
        host.expect_ovs_add_flow()
            .withf(|_, _, prio, flow| {
                *prio == 2000 && flow.contains("in_port=1") && flow.contains("actions=flood")
            })
            .once()
            .returning(|_, _, _, _| Ok(()));
        host.expect_ovs_add_flow()
            .withf(|_, _, prio, flow| {
                *prio == 3000 && flow.contains("dl_dst=52:54:00:00:00:01,actions=output:2")
            })
            .once()
            .returning(|_, _, _, _| Ok(()));
        host.expect_ovs_add_flow()
            .withf(|_, _, prio, flow| *prio == 1000 && flow.ends_with("actions=output:1"))
            .once()
            .returning(|_, _, _, _| Ok(()));
        let pci = MockHostPci::new();
        let env = Env {
            batch: &batch,
            host: &host,
            pci: &pci,
        };

        let net = PvNetwork::new("pv0", settings()).unwrap();
        net.alloc_node_resources(&env, &two_host_cluster())
            .await
            .unwrap();

        // the first tunnel key of the range was allocated and broadcast
        assert_eq!(
            "0",
            batch
                .read_key("cluster", "pv0/pv0_key")
                .await
                .unwrap()
                .unwrap()
        );
        let record = batch.read_key("cluster", "pv0/0").await.unwrap().unwrap();
        assert!(record.contains("tun_id: 1024"));
        assert!(record.contains("bridge_name: pvbr0"));
        assert!(record.contains("vm-0"));
        assert!(!record.contains("vm-1"));
    }

    #[tokio::test]
    async fn test_no_local_vm_is_noop() {
        let batch = MemBatch::new(7);
        let host = MockHostNet::new();
        let pci = MockHostPci::new();
        let env = Env {
            batch: &batch,
            host: &host,
            pci: &pci,
        };

        let net = PvNetwork::new("pv0", settings()).unwrap();
        net.alloc_node_resources(&env, &two_host_cluster())
            .await
            .unwrap();
        assert!(batch.read_key("cluster", "pv0/7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_stray_bridges_and_taps() {
        let batch = MemBatch::new(0);
        let mut host = MockHostNet::new();
        host.expect_used_dev_ids()
            .with(eq("pvbr"))
            .returning(|_| Ok(vec![3]));
        host.expect_used_dev_ids()
            .with(eq("pvtap"))
            .returning(|_| Ok(vec![]));
        host.expect_ovs_del_bridge()
            .with(eq("pvbr3"))
            .once()
            .returning(|_| Ok(()));
        let pci = MockHostPci::new();
        let env = Env {
            batch: &batch,
            host: &host,
            pci: &pci,
        };

        let net = PvNetwork::new("pv0", settings()).unwrap();
        net.cleanup_node(&env).await.unwrap();
    }

    #[tokio::test]
    async fn test_master_free_releases_key() {
        let batch = MemBatch::new(0);
        // allocated bitmap with index 0 taken
        let mut bitmap = vec!['0'; (MAX_KEY - MIN_KEY + 1) as usize];
        bitmap[0] = '1';
        batch
            .write_key(
                "global",
                "net/type/pv/key_alloc_state",
                &bitmap.iter().collect::<String>(),
            )
            .await
            .unwrap();
        batch
            .write_key(
                "cluster",
                "pv0/0",
                "global:\n  bridge_name: pvbr0\n  tun_id: 1024\n  master: 0\n\
                 vm-0:\n  tap_name: pvtap0\n  hwaddr: 52:54:00:00:00:00\n  port_id: 1\n",
            )
            .await
            .unwrap();

        let mut host = MockHostNet::new();
        host.expect_ovs_del_port()
            .with(eq("pvtap0"), eq("pvbr0"))
            .once()
            .returning(|_, _| Ok(()));
        host.expect_delete_tap()
            .with(eq("pvtap0"))
            .once()
            .returning(|_| Ok(()));
        host.expect_ovs_del_bridge()
            .with(eq("pvbr0"))
            .once()
            .returning(|_| Ok(()));
        let pci = MockHostPci::new();
        let env = Env {
            batch: &batch,
            host: &host,
            pci: &pci,
        };

        let net = PvNetwork::new("pv0", settings()).unwrap();
        net.free_node_resources(&env, &two_host_cluster())
            .await
            .unwrap();

        let bitmap = batch
            .read_key("global", "net/type/pv/key_alloc_state")
            .await
            .unwrap()
            .unwrap();
        assert!(bitmap.starts_with('0'));
        assert!(batch.read_key("cluster", "pv0/0").await.unwrap().is_none());
    }
}
