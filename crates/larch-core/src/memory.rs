//! In-memory blob storage.
//!
//! Reference backend used by tests and as the target of small composite
//! configurations: a single mutex over an ordered map of blobs.

use std::collections::BTreeMap;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::blobref::BlobRef;
use crate::blobref::SizedBlobRef;
use crate::error::Result;
use crate::hub::BlobHub;
use crate::storage::read_all_verified;
use crate::storage::BlobRead;
use crate::storage::BlobReadSeek;
use crate::storage::Storage;

/// Blob storage over an in-memory ordered map.
#[derive(Default)]
pub struct MemoryStorage {
    blobs: parking_lot::Mutex<BTreeMap<BlobRef, Bytes>>,
    hub: BlobHub,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }

    /// Number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn receive(&self, expected: &BlobRef, body: BlobRead) -> Result<SizedBlobRef> {
        let data = read_all_verified(expected, body).await?;
        let size = data.len() as u64;
        self.blobs.lock().insert(expected.clone(), data);
        debug!(blob = %expected, size, "memory: blob received");
        self.hub.notify(expected);
        Ok(SizedBlobRef::new(expected.clone(), size))
    }

    async fn fetch_streaming(&self, br: &BlobRef) -> Result<(BlobRead, u64)> {
        let (body, size) = self.fetch(br).await?;
        Ok((Box::new(body), size))
    }

    fn fetch_supported(&self) -> bool {
        true
    }

    async fn fetch(&self, br: &BlobRef) -> Result<(BlobReadSeek, u64)> {
        let data = self
            .blobs
            .lock()
            .get(br)
            .cloned()
            .ok_or(crate::Error::NotFound)?;
        let size = data.len() as u64;
        Ok((Box::new(std::io::Cursor::new(data)), size))
    }

    async fn stat(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        refs: &[BlobRef],
        wait: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + wait;
        let mut missing: Vec<BlobRef> = refs.to_vec();
        loop {
            let mut present = Vec::new();
            {
                let blobs = self.blobs.lock();
                missing.retain(|br| match blobs.get(br) {
                    Some(data) => {
                        present.push(SizedBlobRef::new(br.clone(), data.len() as u64));
                        false
                    }
                    None => true,
                });
            }
            for sb in present {
                if dest.send(sb).await.is_err() {
                    return Ok(());
                }
            }
            if missing.is_empty() {
                return Ok(());
            }
            let now = Instant::now();
            if wait.is_zero() || now >= deadline {
                return Ok(());
            }
            if !self.hub.wait_any(deadline - now).await {
                return Ok(());
            }
        }
    }

    async fn enumerate_blobs(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        after: &str,
        limit: usize,
        wait: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + wait;
        let mut after = after.to_string();
        let mut remain = limit;
        let mut rescanned = false;
        loop {
            let batch: Vec<SizedBlobRef> = {
                let blobs = self.blobs.lock();
                blobs
                    .iter()
                    .filter(|(br, _)| br.to_string() > after)
                    .take(remain)
                    .map(|(br, data)| SizedBlobRef::new(br.clone(), data.len() as u64))
                    .collect()
            };
            for sb in batch {
                after = sb.blob_ref.to_string();
                remain -= 1;
                if dest.send(sb).await.is_err() {
                    return Ok(());
                }
            }
            let now = Instant::now();
            if remain == 0 || wait.is_zero() || now >= deadline || rescanned {
                return Ok(());
            }
            if !self.hub.wait_any(deadline - now).await {
                return Ok(());
            }
            // One additional scan after a wake-up, continuing past the
            // last emitted reference.
            rescanned = true;
        }
    }

    async fn remove(&self, refs: &[BlobRef]) -> Result<()> {
        let mut blobs = self.blobs.lock();
        for br in refs {
            blobs.remove(br);
        }
        Ok(())
    }

    fn hub(&self) -> &BlobHub {
        &self.hub
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::enumerate_all;
    use crate::storage::fetch_bytes;
    use crate::storage::has_blob;
    use crate::storage::receive_bytes;

    #[tokio::test]
    async fn receive_then_stat_and_fetch() {
        let store = MemoryStorage::new();
        let sb = receive_bytes(&store, b"hello world").await.expect("receive");
        assert_eq!(sb.size, 11);
        assert!(has_blob(&store, &sb.blob_ref).await.expect("stat"));
        let data = fetch_bytes(&store, &sb.blob_ref).await.expect("fetch");
        assert_eq!(&data[..], b"hello world");
    }

    #[tokio::test]
    async fn receive_rejects_mismatched_digest() {
        let store = MemoryStorage::new();
        let wrong = BlobRef::sha1_from_bytes(b"other bytes");
        let body: BlobRead = Box::new(std::io::Cursor::new(b"hello".to_vec()));
        let err = store.receive(&wrong, body).await.expect_err("should fail");
        assert!(matches!(err, crate::Error::MismatchedDigest { .. }));
        assert!(!has_blob(&store, &wrong).await.expect("stat"));
    }

    #[tokio::test]
    async fn receive_succeeds_iff_hash_matches() {
        // Property: hash_matches(H(bytes)) <=> receive(ref, bytes) succeeds.
        let store = MemoryStorage::new();
        let data = b"some blob";
        let right = BlobRef::sha1_from_bytes(data);
        let mut hash = right.hash().expect("sha1");
        hash.update(data);
        assert!(right.hash_matches(&hash));
        let body: BlobRead = Box::new(std::io::Cursor::new(data.to_vec()));
        assert!(store.receive(&right, body).await.is_ok());
    }

    #[tokio::test]
    async fn receive_is_idempotent() {
        let store = MemoryStorage::new();
        let first = receive_bytes(&store, b"dup").await.expect("first");
        let second = receive_bytes(&store, b"dup").await.expect("second");
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn fetch_missing_is_not_found() {
        let store = MemoryStorage::new();
        let br = BlobRef::sha1_from_bytes(b"nope");
        match store.fetch_streaming(&br).await {
            Err(err) => assert!(matches!(err, crate::Error::NotFound)),
            Ok(_) => panic!("missing"),
        }
    }

    #[tokio::test]
    async fn enumerate_is_ordered_and_exactly_once_across_pages() {
        let store = MemoryStorage::new();
        let mut want = Vec::new();
        for i in 0..25u32 {
            let sb = receive_bytes(&store, format!("blob number {i}").as_bytes())
                .await
                .expect("receive");
            want.push(sb.blob_ref.to_string());
        }
        want.sort();

        // Page through with a small limit, using the last ref as `after`.
        let got: Vec<String> = enumerate_all(&store, 4)
            .await
            .expect("enumerate")
            .into_iter()
            .map(|sb| sb.blob_ref.to_string())
            .collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn enumerate_respects_after_and_limit() {
        let store = MemoryStorage::new();
        for i in 0..10u32 {
            receive_bytes(&store, format!("x{i}").as_bytes()).await.expect("receive");
        }
        let all = enumerate_all(&store, 100).await.expect("enumerate");
        let after = all[3].blob_ref.to_string();

        let (tx, mut rx) = mpsc::channel(16);
        store
            .enumerate_blobs(tx, &after, 2, Duration::ZERO)
            .await
            .expect("enumerate");
        let mut got = Vec::new();
        while let Some(sb) = rx.recv().await {
            got.push(sb.blob_ref.to_string());
        }
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], all[4].blob_ref.to_string());
        assert_eq!(got[1], all[5].blob_ref.to_string());
    }

    #[tokio::test]
    async fn enumerate_long_poll_sees_late_blob() {
        let store = Arc::new(MemoryStorage::new());
        let writer = store.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            receive_bytes(writer.as_ref(), b"late arrival").await.expect("receive");
        });

        let (tx, mut rx) = mpsc::channel(4);
        store
            .enumerate_blobs(tx, "", 10, Duration::from_secs(5))
            .await
            .expect("enumerate");
        let got = rx.recv().await.expect("should see the late blob");
        assert_eq!(got.blob_ref, BlobRef::sha1_from_bytes(b"late arrival"));
        handle.await.expect("writer task");
    }

    #[tokio::test]
    async fn stat_long_poll_sees_late_blob() {
        let store = Arc::new(MemoryStorage::new());
        let br = BlobRef::sha1_from_bytes(b"awaited");
        let writer = store.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            receive_bytes(writer.as_ref(), b"awaited").await.expect("receive");
        });

        let (tx, mut rx) = mpsc::channel(1);
        store
            .stat(tx, std::slice::from_ref(&br), Duration::from_secs(5))
            .await
            .expect("stat");
        assert_eq!(rx.recv().await.map(|sb| sb.blob_ref), Some(br));
        handle.await.expect("writer task");
    }

    #[tokio::test]
    async fn remove_is_best_effort() {
        let store = MemoryStorage::new();
        let sb = receive_bytes(&store, b"to remove").await.expect("receive");
        let missing = BlobRef::sha1_from_bytes(b"never stored");
        store.remove(&[sb.blob_ref.clone(), missing]).await.expect("remove");
        assert!(!has_blob(&store, &sb.blob_ref).await.expect("stat"));
    }
}
