//! Replicated writes over several child storages.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::warn;

use larch_core::storage::read_all_verified;
use larch_core::BlobHub;
use larch_core::BlobRead;
use larch_core::BlobReadSeek;
use larch_core::BlobRef;
use larch_core::Error;
use larch_core::Result;
use larch_core::SizedBlobRef;
use larch_core::Storage;

use crate::merge::merge_enumerate;

/// Broadcasts every write to all children, succeeding once a quorum has
/// acked; reads try children in configured order and fall through on
/// retriable failures.
pub struct ReplicaStorage {
    backends: Vec<Arc<dyn Storage>>,
    min_writes: usize,
    hub: BlobHub,
}

impl ReplicaStorage {
    /// `min_writes` children must ack a receive for it to succeed.
    pub fn new(backends: Vec<Arc<dyn Storage>>, min_writes: usize) -> Result<ReplicaStorage> {
        if backends.is_empty() {
            return Err(Error::config("replica storage needs at least one backend"));
        }
        if min_writes == 0 || min_writes > backends.len() {
            return Err(Error::config(format!(
                "minWritesForSuccess {min_writes} out of range for {} backends",
                backends.len()
            )));
        }
        Ok(ReplicaStorage {
            backends,
            min_writes,
            hub: BlobHub::new(),
        })
    }
}

#[async_trait]
impl Storage for ReplicaStorage {
    async fn receive(&self, expected: &BlobRef, body: BlobRead) -> Result<SizedBlobRef> {
        // Buffer once, verified, then broadcast.
        let data = read_all_verified(expected, body).await?;

        let mut tasks = JoinSet::new();
        for backend in &self.backends {
            let backend = backend.clone();
            let expected = expected.clone();
            let data: Bytes = data.clone();
            tasks.spawn(async move {
                let body: BlobRead = Box::new(std::io::Cursor::new(data));
                backend.receive(&expected, body).await
            });
        }

        let mut acked: Option<SizedBlobRef> = None;
        let mut successes = 0;
        let mut first_err: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(|e| Error::transient(format!("receive task failed: {e}"))) {
                Ok(Ok(sb)) => {
                    successes += 1;
                    acked.get_or_insert(sb);
                }
                Ok(Err(e)) | Err(e) => {
                    warn!(blob = %expected, error = %e, "replica: backend write failed");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        match acked {
            Some(sb) if successes >= self.min_writes => {
                self.hub.notify(expected);
                Ok(sb)
            }
            _ => Err(first_err
                .unwrap_or_else(|| Error::transient("replica: quorum not reached"))),
        }
    }

    async fn fetch_streaming(&self, br: &BlobRef) -> Result<(BlobRead, u64)> {
        let mut last_err = Error::NotFound;
        for backend in &self.backends {
            match backend.fetch_streaming(br).await {
                Ok(found) => return Ok(found),
                Err(e) if e.is_retriable_read() => last_err = e,
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    fn fetch_supported(&self) -> bool {
        self.backends.iter().any(|b| b.fetch_supported())
    }

    async fn fetch(&self, br: &BlobRef) -> Result<(BlobReadSeek, u64)> {
        let mut last_err = Error::NotFound;
        for backend in self.backends.iter().filter(|b| b.fetch_supported()) {
            match backend.fetch(br).await {
                Ok(found) => return Ok(found),
                Err(e) if e.is_retriable_read() => last_err = e,
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn stat(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        refs: &[BlobRef],
        wait: Duration,
    ) -> Result<()> {
        // Union of the children's answers, each ref reported once.
        let (agg_tx, mut agg_rx) = mpsc::channel(refs.len().max(1));
        let mut tasks = JoinSet::new();
        for backend in &self.backends {
            let backend = backend.clone();
            let refs = refs.to_vec();
            let agg_tx = agg_tx.clone();
            tasks.spawn(async move { backend.stat(agg_tx, &refs, wait).await });
        }
        drop(agg_tx);

        let mut seen = HashSet::new();
        while let Some(sb) = agg_rx.recv().await {
            if seen.insert(sb.blob_ref.clone()) && dest.send(sb).await.is_err() {
                return Ok(());
            }
        }

        let mut errors = 0;
        let mut first_err = None;
        let total = self.backends.len();
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(|e| Error::transient(format!("stat task failed: {e}"))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) | Err(e) => {
                    errors += 1;
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            // A healthy child answered for every replica, so a down
            // sibling only costs coverage it uniquely had.
            Some(e) if errors == total => Err(e),
            _ => Ok(()),
        }
    }

    async fn enumerate_blobs(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        after: &str,
        limit: usize,
        wait: Duration,
    ) -> Result<()> {
        let mut tasks = JoinSet::new();
        let mut channels = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            let backend = backend.clone();
            let after = after.to_string();
            let (tx, rx) = mpsc::channel(32);
            channels.push(rx);
            tasks.spawn(async move { backend.enumerate_blobs(tx, &after, limit, wait).await });
        }

        merge_enumerate(channels, &dest, limit).await?;
        drop(dest);

        let mut errors = 0;
        let mut first_err = None;
        let total = self.backends.len();
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(|e| Error::transient(format!("enumerate task failed: {e}"))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) | Err(e) => {
                    errors += 1;
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) if errors == total => Err(e),
            _ => Ok(()),
        }
    }

    async fn remove(&self, refs: &[BlobRef]) -> Result<()> {
        let mut tasks = JoinSet::new();
        for backend in &self.backends {
            let backend = backend.clone();
            let refs = refs.to_vec();
            tasks.spawn(async move { backend.remove(&refs).await });
        }
        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(|e| Error::transient(format!("remove task failed: {e}"))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) | Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn hub(&self) -> &BlobHub {
        &self.hub
    }
}
