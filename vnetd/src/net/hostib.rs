use crate::cluster::Cluster;
use crate::net::{dump_resources, env_override, load_resources, vm_res_label, Network};
use crate::pal::{Env, VfType};
use crate::vfio::device_vf_type;
use crate::{Error, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

pub const TYPE: &str = "hostib";

/// Host driver VFs are parked under while not assigned to a VM.
pub(crate) const STUB_DRIVER: &str = "pci-stub";
pub(crate) const VFIO_DRIVER: &str = "vfio-pci";

/// InfiniBand SR-IOV passthrough scoped to a single host: no
/// fabric-manager coordination, GUIDs are random per job.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct HostIbSettings {
    pub host_device: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub(crate) struct VfRes {
    pub vf_addr: String,
}

type Record = BTreeMap<String, VfRes>;

pub struct HostIbNetwork {
    name: String,
    settings: HostIbSettings,
}

/// Register the device's vendor/device id with the stub driver and the
/// passthrough driver. The stub must come first: new_id grabs every
/// unbound VF, and the stub is where they can sit safely.
pub(crate) async fn init_device_node(env: &Env<'_>, device: &str) -> Result<()> {
    env.pci.vf_enable_driver(device, STUB_DRIVER).await?;
    env.pci.vf_enable_driver(device, VFIO_DRIVER).await?;
    Ok(())
}

/// Unbind leftover VFs of `device` from the passthrough driver.
pub(crate) async fn cleanup_device_vfs(env: &Env<'_>, device: &str, net_name: &str) -> Result<()> {
    let reclaimed = env.pci.cleanup_vfs(device).await?;
    if !reclaimed.is_empty() {
        warn!(
            "deleted {} leftover VFs for {net_name} network",
            reclaimed.len()
        );
    }
    Ok(())
}

/// Release the VFs listed in `vms`: unbind from vfio and clear the
/// per-VF isolation state according to the device family.
pub(crate) async fn free_vfs<'a>(
    env: &Env<'_>,
    device: &str,
    vms: impl Iterator<Item = &'a VfRes>,
) -> Result<()> {
    let vf_type = device_vf_type(device)?;
    for res in vms {
        env.pci.unbind_vfio(&res.vf_addr, STUB_DRIVER).await?;
        match vf_type {
            VfType::Mlx4 => env.pci.vf_clear_pkeys(device, &res.vf_addr).await?,
            VfType::Mlx5 => env.pci.vf_unset_guid(device, &res.vf_addr).await?,
        }
    }
    Ok(())
}

fn gen_guid_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..6).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

impl HostIbNetwork {
    pub fn new(name: &str, settings: HostIbSettings) -> Self {
        Self {
            name: name.to_string(),
            settings,
        }
    }

    async fn alloc_vm_res(&self, env: &Env<'_>) -> Result<VfRes> {
        let device = &self.settings.host_device;
        let port_guid = env_override(&self.name, "PORT_GUID")
            .unwrap_or_else(|| format!("0xc1cc{}", gen_guid_suffix()));
        let node_guid = env_override(&self.name, "NODE_GUID")
            .unwrap_or_else(|| format!("0xd1cc{}", gen_guid_suffix()));

        let vf_addr = env.pci.find_free_vf(device).await?;
        env.pci.bind_vfio(&vf_addr, env.batch.batch_user()).await?;
        match device_vf_type(device)? {
            VfType::Mlx4 => env.pci.vf_allow_host_pkeys(device, &vf_addr).await?,
            VfType::Mlx5 => {
                env.pci
                    .vf_set_guid(device, &vf_addr, &port_guid, &node_guid)
                    .await?
            }
        }
        Ok(VfRes { vf_addr })
    }
}

#[async_trait]
impl Network for HostIbNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        TYPE
    }

    async fn init_node(&self, env: &Env<'_>) -> Result<()> {
        init_device_node(env, &self.settings.host_device).await
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
            vm.add_vfio_iface(&self.name, &res.vf_addr);
        }
        Ok(())
    }

    async fn free_node_resources(&self, env: &Env<'_>, cluster: &Cluster) -> Result<()> {
        let node_rank = env.batch.node_rank();
        let labels: Vec<String> = cluster
            .local_vms_on_network(&self.name, node_rank)
            .map(|vm| vm_res_label(vm.rank))
            .collect();
        if labels.is_empty() {
            return Ok(());
        }
        let record: Record = load_resources(env, &self.name).await?;
        let vms = labels
            .iter()
            .map(|label| {
                record
                    .get(label)
                    .ok_or_else(|| Error::StateMissing(self.name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        free_vfs(env, &self.settings.host_device, vms.into_iter()).await
    }

    async fn cleanup_node(&self, env: &Env<'_>) -> Result<()> {
        cleanup_device_vfs(env, &self.settings.host_device, &self.name).await
    }
}
