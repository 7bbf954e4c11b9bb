use crate::cluster::Cluster;
use crate::net::hostib::VFIO_DRIVER;
use crate::net::{dump_resources, load_resources, vm_res_label, Network};
use crate::pal::Env;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

pub const TYPE: &str = "genericpci";

/// Passthrough of arbitrary PCI devices from a configured address list.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GenericPciSettings {
    pub host_device_addrs: Vec<String>,
    pub host_driver: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct PciRes {
    dev_addr: String,
}

type Record = BTreeMap<String, PciRes>;

pub struct GenericPciNetwork {
    name: String,
    settings: GenericPciSettings,
}

impl GenericPciNetwork {
    pub fn new(name: &str, settings: GenericPciSettings) -> Self {
        Self {
            name: name.to_string(),
            settings,
        }
    }

    async fn alloc_vm_res(&self, env: &Env<'_>) -> Result<PciRes> {
        let bound = env.pci.list_vfio_devices().await?;
        let dev_addr = self
            .settings
            .host_device_addrs
            .iter()
            .find(|addr| !bound.contains(addr))
            .cloned()
            .ok_or_else(|| {
                Error::exhausted(format!(
                    "unable to find a free PCI device for network {}",
                    self.name
                ))
            })?;
        env.pci.bind_vfio(&dev_addr, env.batch.batch_user()).await?;
        Ok(PciRes { dev_addr })
    }
}

#[async_trait]
impl Network for GenericPciNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        TYPE
    }

    async fn init_node(&self, env: &Env<'_>) -> Result<()> {
        for dev_addr in &self.settings.host_device_addrs {
            env.pci
                .enable_driver(dev_addr, &self.settings.host_driver)
                .await?;
            env.pci.enable_driver(dev_addr, VFIO_DRIVER).await?;
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
            vm.add_vfio_iface(&self.name, &res.dev_addr);
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
            env.pci
                .unbind_vfio(&res.dev_addr, &self.settings.host_driver)
                .await?;
        }
        Ok(())
    }

    async fn cleanup_node(&self, env: &Env<'_>) -> Result<()> {
        let bound = env.pci.list_vfio_devices().await?;
        let mut reclaimed = 0;
        for dev_addr in &self.settings.host_device_addrs {
            if bound.contains(dev_addr) {
                if let Err(err) = env
                    .pci
                    .unbind_vfio(dev_addr, &self.settings.host_driver)
                    .await
                {
                    warn!("could not unbind {dev_addr}: {err}");
                } else {
                    reclaimed += 1;
                }
            }
        }
        if reclaimed > 0 {
            warn!(
                "deleted {reclaimed} leftover PCI devices of {} network",
                self.name
            );
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

    fn settings() -> GenericPciSettings {
        GenericPciSettings {
            host_device_addrs: vec!["0000:83:00.0".to_string(), "0000:84:00.0".to_string()],
            host_driver: "nvidia".to_string(),
        }
    }

    fn cluster() -> Cluster {
        Cluster::new(vec![Vm::new(0, 0, ["gpu"])])
    }

    #[tokio::test]
    async fn test_init_registers_both_drivers() {
        let batch = MemBatch::new(0);
        let host = MockHostNet::new();
        let mut pci = MockHostPci::new();
        for addr in ["0000:83:00.0", "0000:84:00.0"] {
            pci.expect_enable_driver()
                .with(eq(addr), eq("nvidia"))
                .once()
                .returning(|_, _| Ok(()));
            pci.expect_enable_driver()
                .with(eq(addr), eq("vfio-pci"))
                .once()
                .returning(|_, _| Ok(()));
        }
        let env = Env {
            batch: &batch,
            host: &host,
            pci: &pci,
        };

        let net = GenericPciNetwork::new("gpu", settings());
        net.init_node(&env).await.unwrap();
    }

    #[tokio::test]
    async fn test_alloc_picks_first_free_device() {
        let batch = MemBatch::new(0);
        let host = MockHostNet::new();
        let mut pci = MockHostPci::new();
        pci.expect_list_vfio_devices()
            .returning(|| Ok(vec!["0000:83:00.0".to_string()]));
        pci.expect_bind_vfio()
            .with(eq("0000:84:00.0"), eq("slurm"))
            .once()
            .returning(|_, _| Ok(()));
        let env = Env {
            batch: &batch,
            host: &host,
            pci: &pci,
        };

        let net = GenericPciNetwork::new("gpu", settings());
        net.alloc_node_resources(&env, &cluster()).await.unwrap();

        let record = batch.read_key("cluster", "gpu/0").await.unwrap().unwrap();
        assert!(record.contains("0000:84:00.0"));
    }

    #[tokio::test]
    async fn test_alloc_exhaustion() {
        let batch = MemBatch::new(0);
        let host = MockHostNet::new();
        let mut pci = MockHostPci::new();
        pci.expect_list_vfio_devices().returning(|| {
            Ok(vec!["0000:83:00.0".to_string(), "0000:84:00.0".to_string()])
        });
        let env = Env {
            batch: &batch,
            host: &host,
            pci: &pci,
        };

        let net = GenericPciNetwork::new("gpu", settings());
        let err = net
            .alloc_node_resources(&env, &cluster())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_cleanup_unbinds_only_configured() {
        let batch = MemBatch::new(0);
        let host = MockHostNet::new();
        let mut pci = MockHostPci::new();
        pci.expect_list_vfio_devices().returning(|| {
            Ok(vec!["0000:84:00.0".to_string(), "0000:85:00.0".to_string()])
        });
        pci.expect_unbind_vfio()
            .with(eq("0000:84:00.0"), eq("nvidia"))
            .once()
            .returning(|_, _| Ok(()));
        let env = Env {
            batch: &batch,
            host: &host,
            pci: &pci,
        };

        let net = GenericPciNetwork::new("gpu", settings());
        net.cleanup_node(&env).await.unwrap();
    }
}
