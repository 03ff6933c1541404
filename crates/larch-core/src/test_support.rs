//! Storage test doubles shared across the workspace's test suites.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::blobref::BlobRef;
use crate::blobref::SizedBlobRef;
use crate::error::Error;
use crate::error::Result;
use crate::hub::BlobHub;
use crate::storage::BlobRead;
use crate::storage::BlobReadSeek;
use crate::storage::Storage;

/// Wrapper counting operations against an inner storage.
///
/// Used to observe dedup behavior: a second write of identical content
/// must not issue chunk receives.
pub struct CountingStorage {
    inner: Arc<dyn Storage>,
    receives: AtomicUsize,
    stats: AtomicUsize,
    fetches: AtomicUsize,
}

impl CountingStorage {
    pub fn new(inner: Arc<dyn Storage>) -> CountingStorage {
        CountingStorage {
            inner,
            receives: AtomicUsize::new(0),
            stats: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Number of receive calls so far.
    pub fn receive_count(&self) -> usize {
        self.receives.load(Ordering::SeqCst)
    }

    /// Number of stat calls so far.
    pub fn stat_count(&self) -> usize {
        self.stats.load(Ordering::SeqCst)
    }

    /// Number of fetch calls (streaming or seekable) so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for CountingStorage {
    async fn receive(&self, expected: &BlobRef, body: BlobRead) -> Result<SizedBlobRef> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        self.inner.receive(expected, body).await
    }

    async fn fetch_streaming(&self, br: &BlobRef) -> Result<(BlobRead, u64)> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_streaming(br).await
    }

    fn fetch_supported(&self) -> bool {
        self.inner.fetch_supported()
    }

    async fn fetch(&self, br: &BlobRef) -> Result<(BlobReadSeek, u64)> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(br).await
    }

    async fn stat(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        refs: &[BlobRef],
        wait: Duration,
    ) -> Result<()> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        self.inner.stat(dest, refs, wait).await
    }

    async fn enumerate_blobs(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        after: &str,
        limit: usize,
        wait: Duration,
    ) -> Result<()> {
        self.inner.enumerate_blobs(dest, after, limit, wait).await
    }

    async fn remove(&self, refs: &[BlobRef]) -> Result<()> {
        self.inner.remove(refs).await
    }

    fn hub(&self) -> &BlobHub {
        self.inner.hub()
    }
}

/// Storage whose every operation fails with a transient error, standing in
/// for an unreachable replica.
#[derive(Default)]
pub struct UnavailableStorage {
    hub: BlobHub,
}

impl UnavailableStorage {
    pub fn new() -> UnavailableStorage {
        UnavailableStorage::default()
    }

    fn down<T>() -> Result<T> {
        Err(Error::transient("storage unavailable"))
    }
}

#[async_trait]
impl Storage for UnavailableStorage {
    async fn receive(&self, _expected: &BlobRef, _body: BlobRead) -> Result<SizedBlobRef> {
        Self::down()
    }

    async fn fetch_streaming(&self, _br: &BlobRef) -> Result<(BlobRead, u64)> {
        Self::down()
    }

    async fn stat(
        &self,
        _dest: mpsc::Sender<SizedBlobRef>,
        _refs: &[BlobRef],
        _wait: Duration,
    ) -> Result<()> {
        Self::down()
    }

    async fn enumerate_blobs(
        &self,
        _dest: mpsc::Sender<SizedBlobRef>,
        _after: &str,
        _limit: usize,
        _wait: Duration,
    ) -> Result<()> {
        Self::down()
    }

    async fn remove(&self, _refs: &[BlobRef]) -> Result<()> {
        Self::down()
    }

    fn hub(&self) -> &BlobHub {
        &self.hub
    }
}
