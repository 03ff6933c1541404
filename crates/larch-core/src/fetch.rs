//! Seekable fetch over any storage.
//!
//! Seekable fetch is a capability some backends advertise
//! ([`Storage::fetch_supported`]). Readers that need seeking over an
//! arbitrary storage go through [`StorageSeekFetcher`], which uses the
//! native seekable fetch when available and otherwise materializes a
//! seekable view by spooling the stream to a scratch file.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::blobref::BlobRef;
use crate::error::Result;
use crate::storage::BlobReadSeek;
use crate::storage::Storage;

/// Anything that can produce a seekable reader for a blob.
#[async_trait]
pub trait SeekFetcher: Send + Sync {
    /// Open a seekable reader positioned at byte 0, with the blob length.
    async fn fetch(&self, br: &BlobRef) -> Result<(BlobReadSeek, u64)>;
}

/// [`SeekFetcher`] over any [`Storage`].
pub struct StorageSeekFetcher {
    storage: Arc<dyn Storage>,
}

impl StorageSeekFetcher {
    pub fn new(storage: Arc<dyn Storage>) -> StorageSeekFetcher {
        StorageSeekFetcher { storage }
    }

    /// The wrapped storage.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }
}

#[async_trait]
impl SeekFetcher for StorageSeekFetcher {
    async fn fetch(&self, br: &BlobRef) -> Result<(BlobReadSeek, u64)> {
        if self.storage.fetch_supported() {
            return self.storage.fetch(br).await;
        }

        // Spool the stream to a scratch file to get a seekable view.
        let (mut body, size) = self.storage.fetch_streaming(br).await?;
        let spool = tempfile::tempfile()?;
        let mut file = tokio::fs::File::from_std(spool);
        let copied = tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;
        file.rewind().await?;
        debug!(blob = %br, copied, "spooled streaming fetch to scratch file");
        Ok((Box::new(file), size))
    }
}
