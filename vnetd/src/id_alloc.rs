use crate::batch::Batch;
use crate::{Error, Result, KS_CLUSTER, KS_GLOBAL};
use tracing::debug;

/// Cluster-wide allocator of small integers (tunnel keys, pkey indices),
/// built over the store's compare-and-set primitive.
///
/// State is a '0'/'1' bitmap under a per-network-type key in the global
/// scope. The master linearly scans for the lowest clear bit and CASes it
/// set, retrying on contention, then publishes the result under the
/// caller's label so non-master hosts can block on it.
pub struct IdAllocator {
    state_path: String,
    nb_ids: u32,
}

impl IdAllocator {
    pub fn new(state_path: impl Into<String>, nb_ids: u32) -> Self {
        Self {
            state_path: state_path.into(),
            nb_ids,
        }
    }

    /// Allocate one index in `[0, nb_ids)`. The master does the actual
    /// allocation and broadcasts it under `label` in the cluster scope;
    /// other hosts read it back.
    pub async fn alloc_one(&self, batch: &dyn Batch, master: bool, label: &str) -> Result<u32> {
        if master {
            let index = self.alloc_bit(batch).await?;
            debug!("allocated index {index} from {}", self.state_path);
            batch
                .write_key(KS_CLUSTER, label, &index.to_string())
                .await?;
            Ok(index)
        } else {
            let value = batch.wait_key(KS_CLUSTER, label, None).await?;
            value.trim().parse().map_err(|_| Error::BadValue {
                key: label.to_string(),
                err: format!("expected an index, got {value:?}"),
            })
        }
    }

    /// Collective allocation: the host holding `master_rank` allocates,
    /// everyone else reads the broadcast value.
    pub async fn coll_alloc_one(
        &self,
        batch: &dyn Batch,
        master_rank: u32,
        label: &str,
    ) -> Result<u32> {
        self.alloc_one(batch, batch.node_rank() == master_rank, label)
            .await
    }

    /// Return an index to the pool.
    pub async fn free_one(&self, batch: &dyn Batch, index: u32) -> Result<()> {
        loop {
            let current = batch.read_key(KS_GLOBAL, &self.state_path).await?;
            let mut bits = self.parse_bitmap(current.as_deref())?;
            let slot = index as usize;
            if slot >= bits.len() || !bits[slot] {
                return Err(Error::BadValue {
                    key: self.state_path.clone(),
                    err: format!("index {index} is not allocated"),
                });
            }
            bits[slot] = false;
            let new = Self::encode_bitmap(&bits);
            if batch
                .compare_and_swap(KS_GLOBAL, &self.state_path, current.as_deref(), &new)
                .await?
            {
                return Ok(());
            }
        }
    }

    async fn alloc_bit(&self, batch: &dyn Batch) -> Result<u32> {
        loop {
            let current = batch.read_key(KS_GLOBAL, &self.state_path).await?;
            let mut bits = self.parse_bitmap(current.as_deref())?;
            let index = bits.iter().position(|bit| !*bit).ok_or_else(|| {
                Error::exhausted(format!("no free index left in {}", self.state_path))
            })?;
            bits[index] = true;
            let new = Self::encode_bitmap(&bits);
            if batch
                .compare_and_swap(KS_GLOBAL, &self.state_path, current.as_deref(), &new)
                .await?
            {
                return Ok(index as u32);
            }
        }
    }

    fn parse_bitmap(&self, value: Option<&str>) -> Result<Vec<bool>> {
        match value {
            None => Ok(vec![false; self.nb_ids as usize]),
            Some(s) => {
                let bits: Vec<bool> = s
                    .trim()
                    .chars()
                    .map(|c| match c {
                        '0' => Ok(false),
                        '1' => Ok(true),
                        other => Err(Error::BadValue {
                            key: self.state_path.clone(),
                            err: format!("unexpected bitmap character {other:?}"),
                        }),
                    })
                    .collect::<Result<_>>()?;
                if bits.len() != self.nb_ids as usize {
                    return Err(Error::BadValue {
                        key: self.state_path.clone(),
                        err: format!("bitmap holds {} ids, expected {}", bits.len(), self.nb_ids),
                    });
                }
                Ok(bits)
            }
        }
    }

    fn encode_bitmap(bits: &[bool]) -> String {
        bits.iter().map(|bit| if *bit { '1' } else { '0' }).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::tests::MemBatch;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    const STATE: &str = "net/type/pv/key_alloc_state";

    #[tokio::test]
    async fn test_alloc_free_cycle() {
        let batch = MemBatch::new(0);
        let ida = IdAllocator::new(STATE, 4);

        assert_eq!(0, ida.alloc_one(&batch, true, "net0/net0_key").await.unwrap());
        assert_eq!(1, ida.alloc_one(&batch, true, "net1/net1_key").await.unwrap());
        ida.free_one(&batch, 0).await.unwrap();
        // a freed index becomes allocatable again
        assert_eq!(0, ida.alloc_one(&batch, true, "net2/net2_key").await.unwrap());
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let batch = MemBatch::new(0);
        let ida = IdAllocator::new(STATE, 2);
        ida.alloc_one(&batch, true, "a/a_key").await.unwrap();
        ida.alloc_one(&batch, true, "b/b_key").await.unwrap();
        let err = ida.alloc_one(&batch, true, "c/c_key").await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_double_free() {
        let batch = MemBatch::new(0);
        let ida = IdAllocator::new(STATE, 2);
        ida.alloc_one(&batch, true, "a/a_key").await.unwrap();
        ida.free_one(&batch, 0).await.unwrap();
        assert!(ida.free_one(&batch, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_non_master_reads_broadcast() {
        let master = MemBatch::new(0);
        let peer = master.peer(1);
        let ida = Arc::new(IdAllocator::new(STATE, 8));

        let reader = {
            let ida = ida.clone();
            let peer = peer.clone();
            tokio::spawn(async move { ida.coll_alloc_one(&peer, 0, "pv0/pv0_key").await })
        };
        let index = ida.coll_alloc_one(&master, 0, "pv0/pv0_key").await.unwrap();
        assert_eq!(index, reader.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_distinct() {
        let batch = MemBatch::new(0);
        let ida = Arc::new(IdAllocator::new(STATE, 64));

        let mut tasks = vec![];
        for i in 0..16 {
            let ida = ida.clone();
            let batch = batch.clone();
            tasks.push(tokio::spawn(async move {
                ida.alloc_one(&batch, true, &format!("net{i}/key")).await
            }));
        }
        let mut seen = BTreeSet::new();
        for task in tasks {
            let index = task.await.unwrap().unwrap();
            assert!(seen.insert(index), "index {index} handed out twice");
        }
    }
}
