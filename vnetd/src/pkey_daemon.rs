use crate::batch::{Batch, KvEntry};
use crate::net::ib::{parse_pkey, IbNetwork};
use crate::{Error, Result, KS_GLOBAL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use sysinfo::Signal;
use tokio::fs;
use tracing::{info, warn};

/// Fabric-manager key namespace watched by the daemon.
pub const PKEY_DIR: &str = "opensm/pkeys";

/// The subnet manager chokes on overlong lines, partition members are
/// written in chunks.
const GUID_CHUNK: usize = 128;

/// One fabric-manager partition record, written by job masters and read
/// back here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PkeyEntry {
    pub vf_guids: Vec<String>,
    pub host_guids: Vec<String>,
}

fn valid_guid(guid: &str) -> bool {
    guid.strip_prefix("0x")
        .map_or(false, |hex| hex.len() == 16 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Rewrites the subnet manager's partition configuration whenever the
/// fabric-manager keys change, then signals the subnet manager to
/// reload. Runs once per fabric manager host.
pub struct PkeyDaemon {
    opensm_daemon: String,
    partition_cfg: PathBuf,
    partition_tpl: PathBuf,
}

impl PkeyDaemon {
    pub fn new(
        opensm_daemon: impl Into<String>,
        partition_cfg: impl Into<PathBuf>,
        partition_tpl: impl Into<PathBuf>,
    ) -> Self {
        Self {
            opensm_daemon: opensm_daemon.into(),
            partition_cfg: partition_cfg.into(),
            partition_tpl: partition_tpl.into(),
        }
    }

    pub fn from_network(net: &IbNetwork) -> Self {
        let settings = net.settings();
        Self::new(
            settings.opensm_daemon.as_str(),
            settings.opensm_partition_cfg.as_str(),
            settings.opensm_partition_tpl.as_str(),
        )
    }

    /// Watch loop: react to every change of the pkey namespace.
    /// Transient store timeouts re-enter the loop.
    pub async fn run(&self, batch: &dyn Batch) -> Result<()> {
        loop {
            let (mut entries, mut index) = batch.read_dir(KS_GLOBAL, PKEY_DIR).await?;
            while entries.is_empty() {
                warn!("pkey directory doesn't exist yet");
                (entries, index) = match batch.wait_dir(KS_GLOBAL, PKEY_DIR, index, None).await {
                    Ok(listing) => listing,
                    Err(Error::Timeout(_)) => continue,
                    Err(err) => return Err(err),
                };
            }
            info!("pkey change detected: refreshing configuration");
            self.refresh(&entries).await?;

            loop {
                match batch.wait_dir(KS_GLOBAL, PKEY_DIR, index, None).await {
                    Ok(_) => break,
                    Err(Error::Timeout(_)) => continue,
                    Err(err) => return Err(err),
                }
            }
        }
    }

    /// One pass: validate the entries, render the partition file, swap
    /// it in place and nudge the subnet manager.
    pub async fn refresh(&self, entries: &[KvEntry]) -> Result<()> {
        let pkeys = collect_entries(entries);
        let template = fs::read_to_string(&self.partition_tpl)
            .await
            .map_err(|err| Error::io(format!("reading {}", self.partition_tpl.display()), err))?;
        let rendered = render_partitions(&template, &pkeys);
        self.install(&rendered).await?;

        let signaled = vn_utils::system::signal_processes_by_name(&self.opensm_daemon, Signal::Hangup);
        info!("sent SIGHUP to {signaled} {} processes", self.opensm_daemon);
        Ok(())
    }

    /// Replace the target through a rename so the subnet manager never
    /// reads a half-written file.
    async fn install(&self, content: &str) -> Result<()> {
        let file_name = self
            .partition_cfg
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::config(format!(
                    "bad partition config path: {}",
                    self.partition_cfg.display()
                ))
            })?;
        let tmp = self.partition_cfg.with_file_name(format!("{file_name}.tmp"));
        fs::write(&tmp, content)
            .await
            .map_err(|err| Error::io(format!("writing {}", tmp.display()), err))?;
        fs::rename(&tmp, &self.partition_cfg)
            .await
            .map_err(|err| Error::io(format!("installing {}", self.partition_cfg.display()), err))?;
        fs::set_permissions(&self.partition_cfg, std::fs::Permissions::from_mode(0o644))
            .await
            .map_err(|err| {
                Error::io(
                    format!("setting permissions on {}", self.partition_cfg.display()),
                    err,
                )
            })
    }
}

/// Keep the children whose name is a pkey and whose value passes the
/// entry schema; anything else is logged and skipped.
fn collect_entries(entries: &[KvEntry]) -> BTreeMap<String, PkeyEntry> {
    let mut pkeys = BTreeMap::new();
    for entry in entries {
        let name = entry.name();
        if parse_pkey(name).is_err() {
            warn!("invalid entry in pkey directory: {}", entry.key);
            continue;
        }
        match serde_yaml::from_str::<PkeyEntry>(&entry.value) {
            Ok(config)
                if config
                    .vf_guids
                    .iter()
                    .chain(config.host_guids.iter())
                    .all(|guid| valid_guid(guid)) =>
            {
                pkeys.insert(name.to_string(), config);
            }
            Ok(_) => warn!("misconfigured pkey {name}: malformed GUID"),
            Err(err) => warn!("misconfigured pkey {name}: {err}"),
        }
    }
    pkeys
}

fn render_partitions(template: &str, pkeys: &BTreeMap<String, PkeyEntry>) -> String {
    let mut out = String::from(template);
    out.push('\n');
    for (pkey, entry) in pkeys {
        let partline = format!("PK_{pkey}={pkey}");
        for chunk in entry.vf_guids.chunks(GUID_CHUNK) {
            out.push_str(&format!(
                "{partline} , ipoib, indx0 : {} ; \n",
                full_members(chunk)
            ));
        }
        for chunk in entry.host_guids.chunks(GUID_CHUNK) {
            out.push_str(&format!("{partline}: {} ; \n", full_members(chunk)));
        }
    }
    out
}

fn full_members(guids: &[String]) -> String {
    guids
        .iter()
        .map(|guid| format!("{guid}=full"))
        .collect::<Vec<_>>()
        .join(", ")
}
