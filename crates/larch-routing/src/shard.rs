//! Hash-routed sharding over child storages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use larch_core::BlobHub;
use larch_core::BlobRead;
use larch_core::BlobReadSeek;
use larch_core::BlobRef;
use larch_core::Error;
use larch_core::Result;
use larch_core::SizedBlobRef;
use larch_core::Storage;

use crate::merge::merge_enumerate;

/// Routes every ref to the child at `sum32(ref) % N`; enumeration
/// interleaves the children's streams preserving global order.
pub struct ShardStorage {
    shards: Vec<Arc<dyn Storage>>,
    hub: BlobHub,
}

impl ShardStorage {
    pub fn new(shards: Vec<Arc<dyn Storage>>) -> Result<ShardStorage> {
        if shards.is_empty() {
            return Err(Error::config("shard storage needs at least one backend"));
        }
        Ok(ShardStorage {
            shards,
            hub: BlobHub::new(),
        })
    }

    fn shard_index(&self, br: &BlobRef) -> usize {
        br.sum32() as usize % self.shards.len()
    }

    fn shard_for(&self, br: &BlobRef) -> &Arc<dyn Storage> {
        &self.shards[self.shard_index(br)]
    }

    /// Refs grouped by owning shard index.
    fn group_by_shard(&self, refs: &[BlobRef]) -> Vec<Vec<BlobRef>> {
        let mut groups = vec![Vec::new(); self.shards.len()];
        for br in refs {
            groups[self.shard_index(br)].push(br.clone());
        }
        groups
    }
}

#[async_trait]
impl Storage for ShardStorage {
    async fn receive(&self, expected: &BlobRef, body: BlobRead) -> Result<SizedBlobRef> {
        let sb = self.shard_for(expected).receive(expected, body).await?;
        self.hub.notify(expected);
        Ok(sb)
    }

    async fn fetch_streaming(&self, br: &BlobRef) -> Result<(BlobRead, u64)> {
        self.shard_for(br).fetch_streaming(br).await
    }

    fn fetch_supported(&self) -> bool {
        self.shards.iter().all(|s| s.fetch_supported())
    }

    async fn fetch(&self, br: &BlobRef) -> Result<(BlobReadSeek, u64)> {
        self.shard_for(br).fetch(br).await
    }

    async fn stat(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        refs: &[BlobRef],
        wait: Duration,
    ) -> Result<()> {
        let mut tasks = JoinSet::new();
        for (i, group) in self.group_by_shard(refs).into_iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            let shard = self.shards[i].clone();
            let dest = dest.clone();
            tasks.spawn(async move { shard.stat(dest, &group, wait).await });
        }
        drop(dest);
        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| Error::transient(format!("stat task failed: {e}")))??;
        }
        Ok(())
    }

    async fn enumerate_blobs(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        after: &str,
        limit: usize,
        wait: Duration,
    ) -> Result<()> {
        let mut tasks = JoinSet::new();
        let mut channels = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let shard = shard.clone();
            let after = after.to_string();
            let (tx, rx) = mpsc::channel(32);
            channels.push(rx);
            tasks.spawn(async move { shard.enumerate_blobs(tx, &after, limit, wait).await });
        }

        merge_enumerate(channels, &dest, limit).await?;
        drop(dest);

        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| Error::transient(format!("enumerate task failed: {e}")))??;
        }
        Ok(())
    }

    async fn remove(&self, refs: &[BlobRef]) -> Result<()> {
        for (i, group) in self.group_by_shard(refs).into_iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            self.shards[i].remove(&group).await?;
        }
        Ok(())
    }

    fn hub(&self) -> &BlobHub {
        &self.hub
    }
}

#[cfg(test)]
mod tests {
    use larch_core::storage::enumerate_all;
    use larch_core::storage::fetch_bytes;
    use larch_core::storage::receive_bytes;
    use larch_core::MemoryStorage;

    use super::*;

    fn sharded(n: usize) -> (ShardStorage, Vec<Arc<MemoryStorage>>) {
        let children: Vec<Arc<MemoryStorage>> =
            (0..n).map(|_| Arc::new(MemoryStorage::new())).collect();
        let shards = children.iter().map(|c| c.clone() as Arc<dyn Storage>).collect();
        (ShardStorage::new(shards).expect("shards"), children)
    }

    #[tokio::test]
    async fn routes_by_sum32() {
        let (shard, children) = sharded(3);
        let mut counts = vec![0usize; 3];
        for i in 0..30u32 {
            let sb = receive_bytes(&shard, format!("shard me {i}").as_bytes())
                .await
                .expect("receive");
            let want = sb.blob_ref.sum32() as usize % 3;
            counts[want] += 1;
            assert_eq!(children[want].len(), counts[want], "blob {i} on wrong shard");
            let data = fetch_bytes(&shard, &sb.blob_ref).await.expect("fetch");
            assert_eq!(&data[..], format!("shard me {i}").as_bytes());
        }
        assert_eq!(children.iter().map(|c| c.len()).sum::<usize>(), 30);
    }

    #[tokio::test]
    async fn enumerate_interleaves_in_order() {
        let (shard, _children) = sharded(4);
        let mut want = Vec::new();
        for i in 0..40u32 {
            let sb = receive_bytes(&shard, format!("x{i}").as_bytes()).await.expect("receive");
            want.push(sb.blob_ref.to_string());
        }
        want.sort();
        let got: Vec<String> = enumerate_all(&shard, 7)
            .await
            .expect("enumerate")
            .into_iter()
            .map(|sb| sb.blob_ref.to_string())
            .collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn stat_fans_out() {
        let (shard, _children) = sharded(3);
        let mut refs = Vec::new();
        for i in 0..9u32 {
            refs.push(receive_bytes(&shard, format!("s{i}").as_bytes()).await.expect("r").blob_ref);
        }
        refs.push(BlobRef::sha1_from_bytes(b"absent"));

        let got = larch_core::storage::stat_all(&shard, &refs).await.expect("stat");
        assert_eq!(got.len(), 9);
    }

    #[tokio::test]
    async fn remove_routes_to_owning_shard() {
        let (shard, _children) = sharded(2);
        let sb = receive_bytes(&shard, b"to delete").await.expect("receive");
        shard.remove(std::slice::from_ref(&sb.blob_ref)).await.expect("remove");
        assert!(!larch_core::storage::has_blob(&shard, &sb.blob_ref).await.expect("stat"));
    }
}
