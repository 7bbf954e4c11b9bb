pub mod bridged;
pub mod genericpci;
pub mod hostib;
pub mod ib;
pub mod nat;
pub mod pv;

use crate::cluster::Cluster;
use crate::pal::Env;
use crate::{Error, Result, KS_CLUSTER};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::warn;

/// One configured virtual network. Implementations are immutable after
/// construction; all per-job state lives in the key-value store so the
/// free and load phases can run in independent invocations.
#[async_trait]
pub trait Network: Send + Sync {
    fn name(&self) -> &str;
    /// The catalog `type` tag this network was built from.
    fn kind(&self) -> &'static str;

    /// Batch licenses to hold while any VM uses this network.
    fn licenses(&self, cluster: &Cluster) -> Vec<String> {
        let _ = cluster;
        vec![]
    }

    /// The partition-key daemon serving this network on the fabric
    /// manager host. Only fabric-coordinated types provide one.
    fn pkey_daemon(&self) -> Option<crate::pkey_daemon::PkeyDaemon> {
        None
    }

    /// Create host-wide resources, once per host per job, before any VM.
    async fn init_node(&self, env: &Env<'_>) -> Result<()>;
    /// Create per-VM resources and persist the allocation record.
    async fn alloc_node_resources(&self, env: &Env<'_>, cluster: &Cluster) -> Result<()>;
    /// Read the allocation record back and attach interfaces to the VM
    /// launch descriptors.
    async fn load_node_resources(&self, env: &Env<'_>, cluster: &mut Cluster) -> Result<()>;
    /// Release per-VM and, on the master, cluster-wide resources.
    async fn free_node_resources(&self, env: &Env<'_>, cluster: &Cluster) -> Result<()>;
    /// Garbage-collect leftovers of crashed jobs, matched by name prefix.
    async fn cleanup_node(&self, env: &Env<'_>) -> Result<()>;
}

/// The set of configured networks, keyed by name; the per-phase entry
/// points select the networks the cluster references and wrap failures
/// with the offending network name.
pub struct Networks {
    nets: BTreeMap<String, Box<dyn Network>>,
}

impl std::fmt::Debug for Networks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Networks")
            .field("nets", &self.nets.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Networks {
    pub fn new(nets: BTreeMap<String, Box<dyn Network>>) -> Self {
        Self { nets }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Network> {
        self.nets.get(name).map(Box::as_ref)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    fn used(&self, cluster: &Cluster) -> Result<Vec<&dyn Network>> {
        let mut used = vec![];
        for name in cluster.network_names() {
            used.push(
                self.get(&name)
                    .ok_or_else(|| Error::config(format!("unknown network: {name}")))?,
            );
        }
        Ok(used)
    }

    pub async fn init_node(&self, env: &Env<'_>, cluster: &Cluster) -> Result<()> {
        for net in self.used(cluster)? {
            net.init_node(env)
                .await
                .map_err(|err| Error::setup(net.name(), err))?;
        }
        Ok(())
    }

    pub async fn alloc_node_resources(&self, env: &Env<'_>, cluster: &Cluster) -> Result<()> {
        for net in self.used(cluster)? {
            net.alloc_node_resources(env, cluster)
                .await
                .map_err(|err| Error::setup(net.name(), err))?;
        }
        Ok(())
    }

    pub async fn load_node_resources(&self, env: &Env<'_>, cluster: &mut Cluster) -> Result<()> {
        for name in cluster.network_names() {
            let net = self
                .get(&name)
                .ok_or_else(|| Error::config(format!("unknown network: {name}")))?;
            net.load_node_resources(env, cluster)
                .await
                .map_err(|err| Error::setup(name.clone(), err))?;
        }
        Ok(())
    }

    pub async fn free_node_resources(&self, env: &Env<'_>, cluster: &Cluster) -> Result<()> {
        for net in self.used(cluster)? {
            net.free_node_resources(env, cluster)
                .await
                .map_err(|err| Error::setup(net.name(), err))?;
        }
        Ok(())
    }

    /// Node recovery: every configured network reclaims whatever it can.
    /// Individual failures are logged and do not stop the sweep.
    pub async fn cleanup_node(&self, env: &Env<'_>) {
        for (name, net) in &self.nets {
            if let Err(err) = net.cleanup_node(env).await {
                warn!("cleanup of network {name} failed: {err}");
            }
        }
    }

    pub fn licenses(&self, cluster: &Cluster) -> Result<Vec<String>> {
        let mut licenses = vec![];
        for net in self.used(cluster)? {
            licenses.extend(net.licenses(cluster));
        }
        licenses.sort();
        licenses.dedup();
        Ok(licenses)
    }
}

pub(crate) fn vm_res_label(rank: u32) -> String {
    format!("vm-{rank}")
}

fn record_key(name: &str, node_rank: u32) -> String {
    format!("{name}/{node_rank}")
}

/// Persist this host's allocation record for `name`.
pub(crate) async fn dump_resources<T: Serialize + Sync>(
    env: &Env<'_>,
    name: &str,
    record: &T,
) -> Result<()> {
    let yaml = serde_yaml::to_string(record)?;
    env.batch
        .write_key(KS_CLUSTER, &record_key(name, env.batch.node_rank()), &yaml)
        .await
}

/// Load this host's allocation record for `name`, failing with
/// [`Error::StateMissing`] when no alloc ran here.
pub(crate) async fn load_resources<T: DeserializeOwned>(env: &Env<'_>, name: &str) -> Result<T> {
    let key = record_key(name, env.batch.node_rank());
    match env.batch.read_key(KS_CLUSTER, &key).await? {
        Some(yaml) => Ok(serde_yaml::from_str(&yaml)?),
        None => Err(Error::StateMissing(name.to_string())),
    }
}

/// Value of the `PCOCC_NET_<NAME>_<FIELD>` override for this network.
pub(crate) fn env_override(net_name: &str, field: &str) -> Option<String> {
    std::env::var(format!(
        "PCOCC_NET_{}_{field}",
        net_name.to_uppercase()
    ))
    .ok()
}

/// Deterministic MAC for a VM rank under a configured prefix. Unique for
/// ranks in `[0, 16^(12 - prefix_len))`.
pub(crate) fn gen_hwaddr(prefix: &str, num: u32) -> Result<String> {
    let suffix_len = 12 - prefix.replace(':', "").len();
    let max = 16u64.saturating_pow(suffix_len as u32);
    if u64::from(num) >= max {
        return Err(Error::config(format!(
            "rank {num} does not fit a MAC with prefix {prefix}"
        )));
    }
    let suffix = format!("{num:0suffix_len$x}");
    let suffix = suffix
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":");
    Ok(format!("{prefix}:{suffix}"))
}

pub(crate) fn ip_plus(base: Ipv4Addr, offset: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(base).wrapping_add(offset))
}
