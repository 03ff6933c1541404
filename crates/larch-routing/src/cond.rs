//! Conditional write routing.
//!
//! A cond storage inspects each received blob and routes it to one of
//! two write destinations — the stock predicate separates schema blobs
//! (which an indexer wants to see) from opaque data. Reads and
//! enumeration go to a fixed backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use larch_core::storage::read_all_verified;
use larch_core::BlobHub;
use larch_core::BlobRead;
use larch_core::BlobReadSeek;
use larch_core::BlobRef;
use larch_core::Result;
use larch_core::SizedBlobRef;
use larch_core::Storage;
use larch_schema::model::is_schema_blob;

/// Where writes go, chosen per blob.
pub enum WriteRule {
    /// Every write to one backend.
    Always(Arc<dyn Storage>),
    /// Schema blobs to `then`, everything else to `otherwise`.
    IfSchema {
        then: Arc<dyn Storage>,
        otherwise: Arc<dyn Storage>,
    },
}

impl WriteRule {
    fn pick(&self, data: &[u8]) -> &Arc<dyn Storage> {
        match self {
            WriteRule::Always(storage) => storage,
            WriteRule::IfSchema { then, otherwise } => {
                if is_schema_blob(data) {
                    then
                } else {
                    otherwise
                }
            }
        }
    }
}

/// Storage routing writes by a predicate on the blob's bytes.
pub struct CondStorage {
    write: WriteRule,
    read: Arc<dyn Storage>,
    remove: Option<Arc<dyn Storage>>,
    hub: BlobHub,
}

impl CondStorage {
    pub fn new(write: WriteRule, read: Arc<dyn Storage>) -> CondStorage {
        CondStorage {
            write,
            read,
            remove: None,
            hub: BlobHub::new(),
        }
    }

    /// Route removes somewhere other than the read backend.
    pub fn with_remove_target(mut self, remove: Arc<dyn Storage>) -> CondStorage {
        self.remove = Some(remove);
        self
    }
}

#[async_trait]
impl Storage for CondStorage {
    async fn receive(&self, expected: &BlobRef, body: BlobRead) -> Result<SizedBlobRef> {
        // The predicate needs the bytes, so buffer (verified) first.
        let data = read_all_verified(expected, body).await?;
        let target = self.write.pick(&data);
        let body: BlobRead = Box::new(std::io::Cursor::new(data));
        let sb = target.receive(expected, body).await?;
        self.hub.notify(expected);
        Ok(sb)
    }

    async fn fetch_streaming(&self, br: &BlobRef) -> Result<(BlobRead, u64)> {
        self.read.fetch_streaming(br).await
    }

    fn fetch_supported(&self) -> bool {
        self.read.fetch_supported()
    }

    async fn fetch(&self, br: &BlobRef) -> Result<(BlobReadSeek, u64)> {
        self.read.fetch(br).await
    }

    async fn stat(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        refs: &[BlobRef],
        wait: Duration,
    ) -> Result<()> {
        self.read.stat(dest, refs, wait).await
    }

    async fn enumerate_blobs(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        after: &str,
        limit: usize,
        wait: Duration,
    ) -> Result<()> {
        self.read.enumerate_blobs(dest, after, limit, wait).await
    }

    async fn remove(&self, refs: &[BlobRef]) -> Result<()> {
        match &self.remove {
            Some(target) => target.remove(refs).await,
            None => self.read.remove(refs).await,
        }
    }

    fn hub(&self) -> &BlobHub {
        &self.hub
    }
}
