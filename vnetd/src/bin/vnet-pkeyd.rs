use async_trait::async_trait;
use clap::Parser;
use eyre::{bail, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use vnetd::batch::{Batch, KvEntry};
use vnetd::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "vnet-pkeyd", about = "Partition-key daemon for the fabric manager host")]
struct Args {
    /// Network catalog file
    #[arg(long, default_value = "/etc/vnetd/networks.yaml")]
    catalog: PathBuf,
    /// Root directory of the file-backed key-value store
    #[arg(long, default_value = "/var/lib/vnetd/store")]
    store_dir: PathBuf,
    /// Log to journald instead of stderr
    #[arg(long)]
    journald: bool,
    /// Name of the fabric-coordinated network to serve
    network: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.journald {
        vn_utils::logging::setup_logging_with_journald("vnet-pkeyd")?;
    } else {
        vn_utils::logging::setup_logging();
    }

    let networks = vnetd::config::load(&args.catalog).await?;
    let Some(net) = networks.get(&args.network) else {
        bail!("no such network: {}", args.network);
    };
    let Some(daemon) = net.pkey_daemon() else {
        bail!(
            "network {} ({}) has no partition-key daemon",
            args.network,
            net.kind()
        );
    };

    let batch = FileBatch::new(args.store_dir);
    daemon.run(&batch).await?;
    Ok(())
}

/// Minimal file-backed store for running the daemon without a batch
/// system: one file per key under `<root>/<scope>/<key>`. Watches are
/// polled; compare-and-swap assumes a single local writer. Production
/// deployments embed the library against the site's batch adapter.
struct FileBatch {
    root: PathBuf,
    watch: tokio::sync::Mutex<WatchState>,
}

#[derive(Default)]
struct WatchState {
    index: u64,
    snapshots: BTreeMap<String, Vec<KvEntry>>,
}

impl FileBatch {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            watch: tokio::sync::Mutex::new(WatchState::default()),
        }
    }

    fn key_path(&self, scope: &str, key: &str) -> PathBuf {
        self.root.join(scope).join(key)
    }

    async fn list(&self, scope: &str, key: &str) -> vnetd::Result<Vec<KvEntry>> {
        let dir = self.key_path(scope, key);
        let mut entries = vec![];
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(Error::io(format!("listing {}", dir.display()), err)),
        };
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| Error::io(format!("listing {}", dir.display()), err))?
        {
            if !entry.path().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let value = tokio::fs::read_to_string(entry.path())
                .await
                .map_err(|err| Error::io(format!("reading {}", entry.path().display()), err))?;
            entries.push(KvEntry {
                key: format!("{}/{name}", key.trim_end_matches('/')),
                value,
            });
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

#[async_trait]
impl Batch for FileBatch {
    fn node_rank(&self) -> u32 {
        0
    }

    fn batch_user(&self) -> &str {
        "root"
    }

    fn host_name(&self, rank: u32) -> String {
        format!("host{rank}")
    }

    async fn read_key(&self, scope: &str, key: &str) -> vnetd::Result<Option<String>> {
        let path = self.key_path(scope, key);
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::io(format!("reading {}", path.display()), err)),
        }
    }

    async fn write_key(&self, scope: &str, key: &str, value: &str) -> vnetd::Result<()> {
        let path = self.key_path(scope, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| Error::io(format!("creating {}", parent.display()), err))?;
        }
        tokio::fs::write(&path, value)
            .await
            .map_err(|err| Error::io(format!("writing {}", path.display()), err))
    }

    async fn delete_key(&self, scope: &str, key: &str) -> vnetd::Result<()> {
        let path = self.key_path(scope, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io(format!("removing {}", path.display()), err)),
        }
    }

    async fn delete_dir(&self, scope: &str, key: &str) -> vnetd::Result<()> {
        let path = self.key_path(scope, key);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io(format!("removing {}", path.display()), err)),
        }
    }

    async fn compare_and_swap(
        &self,
        scope: &str,
        key: &str,
        old: Option<&str>,
        new: &str,
    ) -> vnetd::Result<bool> {
        // single local writer, a read-then-write is enough here
        if self.read_key(scope, key).await?.as_deref() != old {
            return Ok(false);
        }
        self.write_key(scope, key, new).await?;
        Ok(true)
    }

    async fn wait_key(
        &self,
        scope: &str,
        key: &str,
        timeout: Option<Duration>,
    ) -> vnetd::Result<String> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(value) = self.read_key(scope, key).await? {
                return Ok(value);
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Err(Error::Timeout(key.to_string()));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn read_dir(&self, scope: &str, key: &str) -> vnetd::Result<(Vec<KvEntry>, u64)> {
        let entries = self.list(scope, key).await?;
        let mut watch = self.watch.lock().await;
        let slot = format!("{scope}/{key}");
        if watch.snapshots.get(&slot) != Some(&entries) {
            watch.index += 1;
            watch.snapshots.insert(slot, entries.clone());
        }
        Ok((entries, watch.index))
    }

    async fn wait_dir(
        &self,
        scope: &str,
        key: &str,
        last_index: u64,
        timeout: Option<Duration>,
    ) -> vnetd::Result<(Vec<KvEntry>, u64)> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let (entries, index) = self.read_dir(scope, key).await?;
            if index > last_index {
                return Ok((entries, index));
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Err(Error::Timeout(key.to_string()));
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}
