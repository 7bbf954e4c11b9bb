use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

/// One child entry of a key-value store directory listing. `key` is the
/// full key path within its scope (e.g. `opensm/pkeys/0x2000`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
}

impl KvEntry {
    /// Last path segment of the entry key.
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Interface to the batch resource manager: node identity plus the shared
/// key-value store every collective step synchronizes through.
///
/// The store primitives the lifecycle algorithms rely on are a plain read,
/// an atomic compare-and-set, a blocking read with optional timeout and a
/// long-poll directory watch. All of them may block on the network.
#[async_trait]
pub trait Batch: Send + Sync {
    /// Rank of this host within the job allocation.
    fn node_rank(&self) -> u32;
    /// User the job runs as. TAPs and VFIO device nodes are handed to it.
    fn batch_user(&self) -> &str;
    /// Hostname of the node holding the given rank.
    fn host_name(&self, rank: u32) -> String;

    async fn read_key(&self, scope: &str, key: &str) -> Result<Option<String>>;
    async fn write_key(&self, scope: &str, key: &str, value: &str) -> Result<()>;
    async fn delete_key(&self, scope: &str, key: &str) -> Result<()>;
    /// Delete a whole subtree. Deleting a subtree that is already gone is
    /// not an error.
    async fn delete_dir(&self, scope: &str, key: &str) -> Result<()>;

    /// Atomically replace the value of `key` if it still equals `old`
    /// (`None` meaning the key must not exist). Returns false when the
    /// value changed under us and the swap was not applied.
    async fn compare_and_swap(
        &self,
        scope: &str,
        key: &str,
        old: Option<&str>,
        new: &str,
    ) -> Result<bool>;

    /// Block until `key` exists and return its value. `None` waits
    /// forever; an expired timeout yields [`Error::Timeout`].
    async fn wait_key(&self, scope: &str, key: &str, timeout: Option<Duration>) -> Result<String>;

    /// List the children of a directory key together with the store
    /// modification index to pass to [`Batch::wait_dir`].
    async fn read_dir(&self, scope: &str, key: &str) -> Result<(Vec<KvEntry>, u64)>;

    /// Long-poll: block until the directory changed past `last_index`,
    /// then return the new listing and index.
    async fn wait_dir(
        &self,
        scope: &str,
        key: &str,
        last_index: u64,
        timeout: Option<Duration>,
    ) -> Result<(Vec<KvEntry>, u64)>;

    /// Block until `dir` holds at least `count` children.
    async fn wait_child_count(&self, scope: &str, dir: &str, count: usize) -> Result<Vec<KvEntry>> {
        let (mut entries, mut index) = self.read_dir(scope, dir).await?;
        while entries.len() < count {
            (entries, index) = self.wait_dir(scope, dir, index, None).await?;
        }
        Ok(entries)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::{sleep, Instant};

    const POLL: Duration = Duration::from_millis(5);

    /// In-memory key-value store shared between cloned handles, used to
    /// exercise the collective algorithms without a real batch system.
    #[derive(Clone)]
    pub struct MemBatch {
        rank: u32,
        user: String,
        store: Arc<Mutex<BTreeMap<(String, String), String>>>,
        index: Arc<AtomicU64>,
    }

    impl MemBatch {
        pub fn new(rank: u32) -> Self {
            Self {
                rank,
                user: "slurm".to_string(),
                store: Arc::new(Mutex::new(BTreeMap::new())),
                index: Arc::new(AtomicU64::new(1)),
            }
        }

        /// Another rank's view on the same store.
        pub fn peer(&self, rank: u32) -> Self {
            let mut peer = self.clone();
            peer.rank = rank;
            peer
        }

        fn bump(&self) -> u64 {
            self.index.fetch_add(1, Ordering::SeqCst) + 1
        }

        fn list(&self, scope: &str, dir: &str) -> Vec<KvEntry> {
            let prefix = format!("{}/", dir.trim_end_matches('/'));
            self.store
                .lock()
                .unwrap()
                .iter()
                .filter(|((s, k), _)| s == scope && k.starts_with(&prefix))
                .map(|((_, k), v)| KvEntry {
                    key: k.clone(),
                    value: v.clone(),
                })
                .collect()
        }
    }

    #[async_trait]
    impl Batch for MemBatch {
        fn node_rank(&self) -> u32 {
            self.rank
        }

        fn batch_user(&self) -> &str {
            &self.user
        }

        fn host_name(&self, rank: u32) -> String {
            format!("host{rank}")
        }

        async fn read_key(&self, scope: &str, key: &str) -> Result<Option<String>> {
            Ok(self
                .store
                .lock()
                .unwrap()
                .get(&(scope.to_string(), key.to_string()))
                .cloned())
        }

        async fn write_key(&self, scope: &str, key: &str, value: &str) -> Result<()> {
            self.store
                .lock()
                .unwrap()
                .insert((scope.to_string(), key.to_string()), value.to_string());
            self.bump();
            Ok(())
        }

        async fn delete_key(&self, scope: &str, key: &str) -> Result<()> {
            self.store
                .lock()
                .unwrap()
                .remove(&(scope.to_string(), key.to_string()));
            self.bump();
            Ok(())
        }

        async fn delete_dir(&self, scope: &str, key: &str) -> Result<()> {
            let prefix = format!("{}/", key.trim_end_matches('/'));
            self.store
                .lock()
                .unwrap()
                .retain(|(s, k), _| !(s == scope && (k.starts_with(&prefix) || *k == prefix)));
            self.bump();
            Ok(())
        }

        async fn compare_and_swap(
            &self,
            scope: &str,
            key: &str,
            old: Option<&str>,
            new: &str,
        ) -> Result<bool> {
            let mut store = self.store.lock().unwrap();
            let slot = (scope.to_string(), key.to_string());
            if store.get(&slot).map(|s| s.as_str()) != old {
                return Ok(false);
            }
            store.insert(slot, new.to_string());
            drop(store);
            self.bump();
            Ok(true)
        }

        async fn wait_key(
            &self,
            scope: &str,
            key: &str,
            timeout: Option<Duration>,
        ) -> Result<String> {
            let deadline = timeout.map(|t| Instant::now() + t);
            loop {
                if let Some(value) = self.read_key(scope, key).await? {
                    return Ok(value);
                }
                if deadline.map_or(false, |d| Instant::now() >= d) {
                    return Err(Error::Timeout(key.to_string()));
                }
                sleep(POLL).await;
            }
        }

        async fn read_dir(&self, scope: &str, key: &str) -> Result<(Vec<KvEntry>, u64)> {
            Ok((self.list(scope, key), self.index.load(Ordering::SeqCst)))
        }

        async fn wait_dir(
            &self,
            scope: &str,
            key: &str,
            last_index: u64,
            timeout: Option<Duration>,
        ) -> Result<(Vec<KvEntry>, u64)> {
            let deadline = timeout.map(|t| Instant::now() + t);
            loop {
                let index = self.index.load(Ordering::SeqCst);
                if index > last_index {
                    return Ok((self.list(scope, key), index));
                }
                if deadline.map_or(false, |d| Instant::now() >= d) {
                    return Err(Error::Timeout(key.to_string()));
                }
                sleep(POLL).await;
            }
        }
    }

    #[tokio::test]
    async fn test_cas_and_wait() {
        let batch = MemBatch::new(0);
        assert!(batch
            .compare_and_swap("cluster", "k", None, "v1")
            .await
            .unwrap());
        assert!(!batch
            .compare_and_swap("cluster", "k", None, "v2")
            .await
            .unwrap());
        assert!(batch
            .compare_and_swap("cluster", "k", Some("v1"), "v2")
            .await
            .unwrap());
        assert_eq!("v2", batch.wait_key("cluster", "k", None).await.unwrap());

        let err = batch
            .wait_key("cluster", "absent", Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_dir_listing() {
        let batch = MemBatch::new(0);
        let (entries, index) = batch.read_dir("global", "a").await.unwrap();
        assert!(entries.is_empty());
        batch.write_key("global", "a/x", "1").await.unwrap();
        batch.write_key("global", "a/y", "2").await.unwrap();
        let (entries, new_index) = batch.wait_dir("global", "a", index, None).await.unwrap();
        assert!(new_index > index);
        assert_eq!(vec!["x", "y"], entries.iter().map(KvEntry::name).collect::<Vec<_>>());
        batch.delete_dir("global", "a").await.unwrap();
        let (entries, _) = batch.read_dir("global", "a").await.unwrap();
        assert!(entries.is_empty());
    }
}
