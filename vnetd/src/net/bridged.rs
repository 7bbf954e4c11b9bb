use crate::cluster::Cluster;
use crate::net::{dump_resources, env_override, load_resources, vm_res_label, Network};
use crate::pal::{free_dev_name, Env, Netns};
use crate::{Error, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

pub const TYPE: &str = "bridged";

/// Attaches local VMs to a pre-existing host bridge through uniquely
/// named TAPs.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BridgedSettings {
    pub host_bridge: String,
    pub tap_prefix: String,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
}

fn default_mtu() -> u32 {
    1500
}

#[derive(Serialize, Deserialize, Debug)]
struct TapRes {
    tap_name: String,
}

type Record = BTreeMap<String, TapRes>;

pub struct BridgedNetwork {
    name: String,
    settings: BridgedSettings,
}

impl BridgedNetwork {
    pub fn new(name: &str, settings: BridgedSettings) -> Self {
        Self {
            name: name.to_string(),
            settings,
        }
    }

    async fn alloc_vm_res(&self, env: &Env<'_>) -> Result<TapRes> {
        let used = env.host.used_dev_ids(&self.settings.tap_prefix).await?;
        let tap_name = free_dev_name(&self.settings.tap_prefix, &used);

        env.host.create_tap(&tap_name, env.batch.batch_user()).await?;
        env.host.dev_enable(&tap_name, &Netns::root()).await?;
        env.host
            .set_mtu(&tap_name, self.settings.mtu, &Netns::root())
            .await?;
        env.host
            .bridge_add_port(&tap_name, &self.settings.host_bridge)
            .await?;
        Ok(TapRes { tap_name })
    }
}

/// Random locally-administered MAC under the 52:54:00 OUI.
fn random_hwaddr() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.gen_range(0x00..=0x7fu8),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

#[async_trait]
impl Network for BridgedNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        TYPE
    }

    async fn init_node(&self, env: &Env<'_>) -> Result<()> {
        if !env.host.bridge_exists(&self.settings.host_bridge).await? {
            return Err(Error::config(format!(
                "host bridge {} doesn't exist",
                self.settings.host_bridge
            )));
        }
        Ok(())
    }

    async fn alloc_node_resources(&self, env: &Env<'_>, cluster: &Cluster) -> Result<()> {
        let node_rank = env.batch.node_rank();
        let mut record = Record::new();
        for vm in cluster.local_vms_on_network(&self.name, node_rank) {
            match self.alloc_vm_res(env).await {
                Ok(res) => {
                    record.insert(vm_res_label(vm.rank), res);
                }
                Err(err) => {
                    // keep what we got so a later free can reclaim it
                    let _ = dump_resources(env, &self.name, &record).await;
                    return Err(err);
                }
            }
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
                .get(&vm_res_label(vm.rank))
                .ok_or_else(|| Error::StateMissing(self.name.clone()))?;
            let hwaddr = env_override(&self.name, "HWADDR").unwrap_or_else(random_hwaddr);
            vm.add_eth_iface(&self.name, &res.tap_name, &hwaddr, None);
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
        for vm in cluster.local_vms_on_network(&self.name, node_rank) {
            let res = record
                .get(&vm_res_label(vm.rank))
                .ok_or_else(|| Error::StateMissing(self.name.clone()))?;
            env.host.delete_tap(&res.tap_name).await?;
        }
        Ok(())
    }

    async fn cleanup_node(&self, env: &Env<'_>) -> Result<()> {
        for id in env.host.used_dev_ids(&self.settings.tap_prefix).await? {
            warn!("deleting leftover tap for {} network", self.name);
            let tap_name = crate::pal::dev_name_from_id(&self.settings.tap_prefix, id);
            if let Err(err) = env.host.delete_tap(&tap_name).await {
                warn!("could not delete {tap_name}: {err}");
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
    use mockall::predicate::eq;
    use serial_test::serial;

    fn settings() -> BridgedSettings {
        serde_yaml::from_str("host-bridge: br0\ntap-prefix: btap\n").unwrap()
    }

    fn cluster() -> Cluster {
        Cluster::new(vec![Vm::new(0, 0, ["ext"])])
    }

    #[test]
    fn test_settings_defaults() {
        assert_eq!(1500, settings().mtu);
        let explicit: BridgedSettings =
            serde_yaml::from_str("host-bridge: br0\ntap-prefix: btap\nmtu: 9000\n").unwrap();
        assert_eq!(9000, explicit.mtu);
        assert!(serde_yaml::from_str::<BridgedSettings>("tap-prefix: btap\n").is_err());
    }

    #[tokio::test]
    async fn test_init_requires_bridge() {
        let batch = MemBatch::new(0);
        let mut host = MockHostNet::new();
        host.expect_bridge_exists()
            .with(eq("br0"))
            .returning(|_| Ok(false));
        let pci = MockHostPci::new();
        let env = Env {
            batch: &batch,
            host: &host,
            pci: &pci,
        };

        let net = BridgedNetwork::new("ext", settings());
        assert!(matches!(net.init_node(&env).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_alloc_creates_tap() {
        let batch = MemBatch::new(0);
        let mut host = MockHostNet::new();
        host.expect_used_dev_ids()
            .with(eq("btap"))
            .returning(|_| Ok(vec![1, 2]));
        host.expect_create_tap()
            .with(eq("btap0"), eq("slurm"))
            .once()
            .returning(|_, _| Ok(()));
        host.expect_dev_enable().returning(|_, _| Ok(()));
        host.expect_set_mtu()
            .with(eq("btap0"), eq(1500), eq(Netns::root()))
            .returning(|_, _, _| Ok(()));
        host.expect_bridge_add_port()
            .with(eq("btap0"), eq("br0"))
            .once()
            .returning(|_, _| Ok(()));
        let pci = MockHostPci::new();
        let env = Env {
            batch: &batch,
            host: &host,
            pci: &pci,
        };

        let net = BridgedNetwork::new("ext", settings());
        net.alloc_node_resources(&env, &cluster()).await.unwrap();

        let record = batch.read_key("cluster", "ext/0").await.unwrap().unwrap();
        assert!(record.contains("vm-0"));
        assert!(record.contains("btap0"));
    }

    #[tokio::test]
    #[serial]
    async fn test_load_uses_hwaddr_override() {
        std::env::set_var("PCOCC_NET_EXT_HWADDR", "52:54:00:01:02:03");
        let batch = MemBatch::new(0);
        batch
            .write_key("cluster", "ext/0", "vm-0:\n  tap_name: btap0\n")
            .await
            .unwrap();
        let host = MockHostNet::new();
        let pci = MockHostPci::new();
        let env = Env {
            batch: &batch,
            host: &host,
            pci: &pci,
        };

        let net = BridgedNetwork::new("ext", settings());
        let mut cluster = cluster();
        net.load_node_resources(&env, &mut cluster).await.unwrap();
        std::env::remove_var("PCOCC_NET_EXT_HWADDR");

        assert_eq!("btap0", cluster.vms[0].eth_ifaces[0].tap);
        assert_eq!("52:54:00:01:02:03", cluster.vms[0].eth_ifaces[0].hwaddr);
    }

    #[tokio::test]
    #[serial]
    async fn test_load_generates_local_mac() {
        let batch = MemBatch::new(0);
        batch
            .write_key("cluster", "ext/0", "vm-0:\n  tap_name: btap0\n")
            .await
            .unwrap();
        let host = MockHostNet::new();
        let pci = MockHostPci::new();
        let env = Env {
            batch: &batch,
            host: &host,
            pci: &pci,
        };

        let net = BridgedNetwork::new("ext", settings());
        let mut cluster = cluster();
        net.load_node_resources(&env, &mut cluster).await.unwrap();

        let hwaddr = &cluster.vms[0].eth_ifaces[0].hwaddr;
        assert!(hwaddr.starts_with("52:54:00:"));
    }

    #[tokio::test]
    async fn test_free_without_record() {
        let batch = MemBatch::new(0);
        let host = MockHostNet::new();
        let pci = MockHostPci::new();
        let env = Env {
            batch: &batch,
            host: &host,
            pci: &pci,
        };

        let net = BridgedNetwork::new("ext", settings());
        let err = net.free_node_resources(&env, &cluster()).await.unwrap_err();
        assert!(matches!(err, Error::StateMissing(_)));
    }

    #[tokio::test]
    async fn test_cleanup_removes_stray_taps() {
        let batch = MemBatch::new(0);
        let mut host = MockHostNet::new();
        host.expect_used_dev_ids()
            .with(eq("btap"))
            .returning(|_| Ok(vec![7]));
        host.expect_delete_tap()
            .with(eq("btap7"))
            .once()
            .returning(|_| Ok(()));
        let pci = MockHostPci::new();
        let env = Env {
            batch: &batch,
            host: &host,
            pci: &pci,
        };

        let net = BridgedNetwork::new("ext", settings());
        net.cleanup_node(&env).await.unwrap();
    }
}
