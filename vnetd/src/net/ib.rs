use crate::cluster::Cluster;
use crate::id_alloc::IdAllocator;
use crate::net::hostib::{self, VfRes};
use crate::net::{dump_resources, load_resources, vm_res_label, Network};
use crate::pal::{Env, VfType};
use crate::pkey_daemon::{PkeyDaemon, PkeyEntry};
use crate::vfio::device_vf_type;
use crate::{Error, Result, KS_CLUSTER, KS_GLOBAL};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

pub const TYPE: &str = "ib";

const SET_PKEY_ATTEMPTS: u32 = 5;

/// InfiniBand SR-IOV with fabric-wide isolation: one partition key per
/// (network, job), programmed into the subnet manager through the
/// fabric-manager key namespace.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct IbSettings {
    pub host_device: String,
    pub min_pkey: String,
    pub max_pkey: String,
    pub opensm_daemon: String,
    pub opensm_partition_cfg: String,
    pub opensm_partition_tpl: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
}

/// `0xNNNN`-style partition key.
pub(crate) fn parse_pkey(value: &str) -> Result<u16> {
    value
        .strip_prefix("0x")
        .filter(|hex| hex.len() == 4 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .and_then(|hex| u16::from_str_radix(hex, 16).ok())
        .ok_or_else(|| Error::config(format!("invalid pkey: {value}")))
}

pub(crate) fn format_pkey(pkey: u16) -> String {
    format!("0x{pkey:04x}")
}

fn guid(prefix: &str, rank: u32, pkey: u16) -> String {
    format!(
        "{prefix}{:02x}{:02x}00{:02x}{:02x}00",
        pkey >> 8,
        pkey & 0xff,
        (rank >> 8) & 0xff,
        rank & 0xff
    )
}

/// Port GUID of a VM, a pure function of rank and pkey so the master's
/// fabric-manager record and the per-host VF programming agree.
pub(crate) fn vm_port_guid(rank: u32, pkey: u16) -> String {
    guid("0xc0cc", rank, pkey)
}

pub(crate) fn vm_node_guid(rank: u32, pkey: u16) -> String {
    guid("0xd0cc", rank, pkey)
}

#[derive(Serialize, Deserialize, Debug)]
struct IbRecord {
    master: bool,
    pkey: u16,
    pkey_index: u32,
    #[serde(flatten)]
    vms: BTreeMap<String, VfRes>,
}

pub struct IbNetwork {
    name: String,
    settings: IbSettings,
    min_pkey: u16,
    ida: IdAllocator,
}

impl IbNetwork {
    pub fn new(name: &str, settings: IbSettings) -> Result<Self> {
        let min_pkey = parse_pkey(&settings.min_pkey)?;
        let max_pkey = parse_pkey(&settings.max_pkey)?;
        if min_pkey > max_pkey {
            return Err(Error::config(format!(
                "min-pkey {} is above max-pkey {}",
                settings.min_pkey, settings.max_pkey
            )));
        }
        Ok(Self {
            name: name.to_string(),
            settings,
            min_pkey,
            ida: IdAllocator::new(
                format!("net/type/{TYPE}/key_alloc_state"),
                (max_pkey - min_pkey) as u32 + 1,
            ),
        })
    }

    pub fn settings(&self) -> &IbSettings {
        &self.settings
    }

    fn guids_dir(&self) -> String {
        format!("{}/guids", self.name)
    }

    async fn setup_vf(&self, env: &Env<'_>, rank: u32, pkey: u16) -> Result<VfRes> {
        let device = &self.settings.host_device;
        let vf_addr = env.pci.find_free_vf(device).await?;
        env.pci.bind_vfio(&vf_addr, env.batch.batch_user()).await?;

        match device_vf_type(device)? {
            VfType::Mlx4 => {
                // The subnet manager may still be propagating the new
                // partition, retry with a growing backoff.
                let mut attempt = 0;
                loop {
                    match env.pci.vf_set_pkey(device, &vf_addr, pkey).await {
                        Ok(()) => break,
                        Err(err) => {
                            attempt += 1;
                            if attempt == SET_PKEY_ATTEMPTS {
                                return Err(err);
                            }
                            warn!("pkey not yet ready, sleeping...");
                            tokio::time::sleep(Duration::from_secs(u64::from(2 * attempt - 1)))
                                .await;
                        }
                    }
                }
            }
            VfType::Mlx5 => {
                env.pci
                    .vf_set_guid(
                        device,
                        &vf_addr,
                        &vm_port_guid(rank, pkey),
                        &vm_node_guid(rank, pkey),
                    )
                    .await?
            }
        }
        Ok(VfRes { vf_addr })
    }
}

#[async_trait]
impl Network for IbNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        TYPE
    }

    fn licenses(&self, cluster: &Cluster) -> Vec<String> {
        match &self.settings.license {
            Some(license) if cluster.vms_on_network(&self.name).next().is_some() => {
                vec![license.clone()]
            }
            _ => vec![],
        }
    }

    fn pkey_daemon(&self) -> Option<PkeyDaemon> {
        Some(PkeyDaemon::from_network(self))
    }

    async fn init_node(&self, env: &Env<'_>) -> Result<()> {
        hostib::init_device_node(env, &self.settings.host_device).await
    }

    async fn alloc_node_resources(&self, env: &Env<'_>, cluster: &Cluster) -> Result<()> {
        let node_rank = env.batch.node_rank();
        let hosts = cluster.hosts_on_network(&self.name);
        let local_vms: Vec<_> = cluster.local_vms_on_network(&self.name, node_rank).collect();
        if local_vms.is_empty() {
            return Ok(());
        }

        let master = hosts.first() == Some(&node_rank);
        if master {
            info!("node is master for IB network {}", self.name);
        }
        let pkey_index = self
            .ida
            .alloc_one(env.batch, master, &format!("{0}/{0}_pkey", self.name))
            .await?;
        let pkey = self.min_pkey + pkey_index as u16;
        info!("using pkey {} for network {}", format_pkey(pkey), self.name);

        // Every host publishes its physical port GUID.
        let host_guid = env.pci.phys_port_guid(&self.settings.host_device).await?;
        env.batch
            .write_key(
                KS_CLUSTER,
                &format!("{}/{node_rank}", self.guids_dir()),
                &host_guid,
            )
            .await?;

        // The master waits for the full set and hands the partition to
        // the fabric manager.
        if master {
            info!("collecting GUIDs from all hosts for {}", self.name);
            let entries = env
                .batch
                .wait_child_count(KS_CLUSTER, &self.guids_dir(), hosts.len())
                .await?;
            let sm_config = PkeyEntry {
                vf_guids: cluster
                    .vms_on_network(&self.name)
                    .map(|vm| vm_port_guid(vm.rank, pkey))
                    .collect(),
                host_guids: entries
                    .into_iter()
                    .map(|entry| entry.value.trim().to_string())
                    .collect(),
            };
            info!("requesting subnet manager update for {}", self.name);
            env.batch
                .write_key(
                    KS_GLOBAL,
                    &format!("opensm/pkeys/{}", format_pkey(pkey)),
                    &serde_yaml::to_string(&sm_config)?,
                )
                .await?;
        }

        let mut record = IbRecord {
            master,
            pkey,
            pkey_index,
            vms: BTreeMap::new(),
        };
        for vm in local_vms {
            match self.setup_vf(env, vm.rank, pkey).await {
                Ok(res) => {
                    record.vms.insert(vm_res_label(vm.rank), res);
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
        let record: IbRecord = load_resources(env, &self.name).await?;
        for vm in cluster
            .vms
            .iter_mut()
            .filter(|vm| vm.is_on_node(node_rank) && vm.uses_network(&self.name))
        {
            let res = record
                .vms
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
        // Load the record before anything else, the master branch below
        // depends on it.
        let record: IbRecord = load_resources(env, &self.name).await?;
        let vms = labels
            .iter()
            .map(|label| {
                record
                    .vms
                    .get(label)
                    .ok_or_else(|| Error::StateMissing(self.name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        hostib::free_vfs(env, &self.settings.host_device, vms.into_iter()).await?;

        if record.master {
            env.batch
                .delete_key(
                    KS_GLOBAL,
                    &format!("opensm/pkeys/{}", format_pkey(record.pkey)),
                )
                .await?;
            self.ida.free_one(env.batch, record.pkey_index).await?;
            env.batch.delete_dir(KS_CLUSTER, &self.name).await?;
        }
        Ok(())
    }

    async fn cleanup_node(&self, env: &Env<'_>) -> Result<()> {
        hostib::cleanup_device_vfs(env, &self.settings.host_device, &self.name).await
    }
}
