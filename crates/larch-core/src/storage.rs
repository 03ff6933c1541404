//! The storage backend contract.
//!
//! A [`Storage`] is anything that can receive, serve, stat, enumerate, and
//! remove blobs. Multiple tasks may call into one storage concurrently; a
//! storage must never hold an internal lock while sending into a
//! caller-supplied sink, and a dropped sink stops production without error.
//!
//! Sinks are bounded `tokio::sync::mpsc` senders. The callee closes the
//! sink by dropping its sender when it is done producing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeek;
use tokio::sync::mpsc;

use crate::blobref::BlobHash;
use crate::blobref::BlobRef;
use crate::blobref::SizedBlobRef;
use crate::error::Error;
use crate::error::Result;
use crate::hub::BlobHub;

/// A readable blob body, positioned at byte 0.
pub type BlobRead = Box<dyn AsyncRead + Send + Unpin>;

/// Trait combining AsyncRead + AsyncSeek for seekable blob readers.
///
/// Needed because a `dyn` trait object can only name one non-auto trait;
/// this supertrait lets `dyn AsyncReadSeek` stand in for both.
pub trait AsyncReadSeek: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> AsyncReadSeek for T {}

/// A seekable blob body.
pub type BlobReadSeek = Box<dyn AsyncReadSeek>;

/// Contract implemented by every blob storage backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Consume `body` to EOF while hashing, verify the computed reference
    /// equals `expected`, persist the blob atomically, and announce the
    /// arrival on the hub.
    ///
    /// Receiving an already-present blob is a success returning its
    /// existing size. After a successful receive returns, a stat on the
    /// same reference by any caller observes it present.
    async fn receive(&self, expected: &BlobRef, body: BlobRead) -> Result<SizedBlobRef>;

    /// Open a readable stream over the blob, positioned at byte 0, along
    /// with the full blob length. `Error::NotFound` if absent.
    async fn fetch_streaming(&self, br: &BlobRef) -> Result<(BlobRead, u64)>;

    /// Whether [`fetch`](Self::fetch) is supported. Seekable fetch is
    /// strictly stronger than streaming fetch and a backend advertises the
    /// capability explicitly.
    fn fetch_supported(&self) -> bool {
        false
    }

    /// Open a seekable reader over the blob. Backends that do not
    /// advertise the capability return `Error::Unsupported`; callers that
    /// need seeking over any storage use
    /// [`StorageSeekFetcher`](crate::fetch::StorageSeekFetcher).
    async fn fetch(&self, br: &BlobRef) -> Result<(BlobReadSeek, u64)> {
        let _ = br;
        Err(Error::Unsupported { operation: "fetch" })
    }

    /// Write a [`SizedBlobRef`] into `dest` for every listed blob that is
    /// present. With a non-zero `wait`, block up to that long for any
    /// missing blob to appear, then report whatever is present. The sink
    /// is closed by the callee.
    async fn stat(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        refs: &[BlobRef],
        wait: Duration,
    ) -> Result<()>;

    /// Emit present blobs in strictly ascending canonical-string order,
    /// each exactly once, each greater than `after`, up to `limit` items.
    ///
    /// If fewer than `limit` are found and `wait` is non-zero, block until
    /// the deadline or a hub wake-up, then scan once more (continuing
    /// after the last emitted reference). The sink is closed by the
    /// callee.
    async fn enumerate_blobs(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        after: &str,
        limit: usize,
        wait: Duration,
    ) -> Result<()>;

    /// Best-effort removal; absence is not an error.
    async fn remove(&self, refs: &[BlobRef]) -> Result<()>;

    /// The hub announcing this storage's blob arrivals.
    fn hub(&self) -> &BlobHub;
}

/// Read a body to EOF while hashing it against `expected`, returning the
/// verified bytes. Shared by backends that buffer before persisting.
pub async fn read_all_verified(expected: &BlobRef, mut body: BlobRead) -> Result<Bytes> {
    let mut hash = expected
        .hash()
        .ok_or_else(|| Error::malformed(format!("unsupported hash name in {expected}")))?;
    let mut data = Vec::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = body.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hash.update(&buf[..n]);
        data.extend_from_slice(&buf[..n]);
    }
    verify_digest(expected, &hash)?;
    Ok(Bytes::from(data))
}

/// `MismatchedDigest` unless the hash state's digest equals `expected`.
pub fn verify_digest(expected: &BlobRef, hash: &BlobHash) -> Result<()> {
    if expected.hash_matches(hash) {
        return Ok(());
    }
    Err(Error::MismatchedDigest {
        expected: expected.to_string(),
        computed: BlobRef::from_hash(hash).to_string(),
    })
}

/// Whether the storage currently has the blob, via a no-wait stat.
pub async fn has_blob(storage: &dyn Storage, br: &BlobRef) -> Result<bool> {
    let (tx, mut rx) = mpsc::channel(1);
    storage.stat(tx, std::slice::from_ref(br), Duration::ZERO).await?;
    Ok(rx.recv().await.is_some())
}

/// No-wait stat of several references, collected into a vec.
pub async fn stat_all(storage: &dyn Storage, refs: &[BlobRef]) -> Result<Vec<SizedBlobRef>> {
    let (tx, mut rx) = mpsc::channel(refs.len().max(1));
    storage.stat(tx, refs, Duration::ZERO).await?;
    let mut out = Vec::new();
    while let Some(sb) = rx.recv().await {
        out.push(sb);
    }
    Ok(out)
}

/// Hash `data`, then receive it under its own reference.
pub async fn receive_bytes(storage: &dyn Storage, data: &[u8]) -> Result<SizedBlobRef> {
    let br = BlobRef::sha1_from_bytes(data);
    let body: BlobRead = Box::new(std::io::Cursor::new(data.to_vec()));
    storage.receive(&br, body).await
}

/// Fetch a whole blob into memory.
pub async fn fetch_bytes(storage: &dyn Storage, br: &BlobRef) -> Result<Bytes> {
    let (mut body, size) = storage.fetch_streaming(br).await?;
    let mut data = Vec::with_capacity(size as usize);
    body.read_to_end(&mut data).await?;
    Ok(Bytes::from(data))
}

/// Enumerate every blob in the storage into a vec, paging internally.
pub async fn enumerate_all(storage: &dyn Storage, page: usize) -> Result<Vec<SizedBlobRef>> {
    let mut out: Vec<SizedBlobRef> = Vec::new();
    let mut after = String::new();
    loop {
        let (tx, mut rx) = mpsc::channel(page.max(1));
        storage.enumerate_blobs(tx, &after, page, Duration::ZERO).await?;
        let mut got = 0;
        while let Some(sb) = rx.recv().await {
            after = sb.blob_ref.to_string();
            out.push(sb);
            got += 1;
        }
        if got < page {
            return Ok(out);
        }
    }
}

/// Convenience alias for trait-object storages.
pub type DynStorage = Arc<dyn Storage>;
