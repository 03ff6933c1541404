//! Local-disk blob storage.
//!
//! A blob `h-d…` in partition `p` under root `R` lives at
//!
//! ```text
//! R/partition/<p>/<h>/<d[0:3]>/<d[3:6]>/<h>-<d>.dat
//! ```
//!
//! Receives write to a temp file in the destination directory, fsync,
//! then rename into place; atomicity comes from the rename, no per-blob
//! locks are held. Enumeration walks the fan-out tree lexically (see
//! [`enumerate`]).

mod enumerate;

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::instrument;

use larch_core::storage::verify_digest;
use larch_core::BlobHub;
use larch_core::BlobRead;
use larch_core::BlobReadSeek;
use larch_core::BlobRef;
use larch_core::Error;
use larch_core::Result;
use larch_core::SizedBlobRef;
use larch_core::Storage;

/// Sequence for in-progress temp file names within this process.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Blob storage rooted at a directory on the local filesystem.
pub struct DiskStorage {
    root: PathBuf,
    partition: String,
    hub: BlobHub,
}

impl DiskStorage {
    /// Storage over the `default` partition under `root`, creating the
    /// partition directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<DiskStorage> {
        DiskStorage::with_partition(root, "default")
    }

    /// Storage over a named partition under `root`.
    pub fn with_partition(root: impl Into<PathBuf>, partition: impl Into<String>) -> Result<DiskStorage> {
        let root = root.into();
        let partition = partition.into();
        if partition.is_empty() || partition.contains('/') {
            return Err(Error::config(format!("invalid partition name {partition:?}")));
        }
        let ds = DiskStorage {
            root,
            partition,
            hub: BlobHub::new(),
        };
        std::fs::create_dir_all(ds.partition_root())?;
        Ok(ds)
    }

    /// The partition this storage reads and writes.
    pub fn partition(&self) -> &str {
        &self.partition
    }

    fn partition_root(&self) -> PathBuf {
        self.root.join("partition").join(&self.partition)
    }

    /// Fan-out directory for a blob: two levels of three digest chars
    /// under the hash-name directory. Short digests use fewer levels.
    fn blob_dir(&self, br: &BlobRef) -> PathBuf {
        let mut dir = self.partition_root().join(br.hash_name());
        let digest = br.digest();
        if digest.len() >= 3 {
            dir.push(&digest[..3]);
        }
        if digest.len() >= 6 {
            dir.push(&digest[3..6]);
        }
        dir
    }

    fn blob_path(&self, br: &BlobRef) -> PathBuf {
        self.blob_dir(br).join(format!("{br}.dat"))
    }

    async fn stat_one(&self, br: &BlobRef) -> Option<SizedBlobRef> {
        let meta = tokio::fs::metadata(self.blob_path(br)).await.ok()?;
        meta.is_file().then(|| SizedBlobRef::new(br.clone(), meta.len()))
    }
}

fn io_fetch_err(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound
    } else {
        e.into()
    }
}

#[async_trait]
impl Storage for DiskStorage {
    #[instrument(skip(self, body), fields(blob = %expected))]
    async fn receive(&self, expected: &BlobRef, mut body: BlobRead) -> Result<SizedBlobRef> {
        let mut hash = expected
            .hash()
            .ok_or_else(|| Error::malformed(format!("unsupported hash name in {expected}")))?;

        let dir = self.blob_dir(expected);
        tokio::fs::create_dir_all(&dir).await?;

        // Temp file in the destination directory so the rename stays on
        // one filesystem.
        let tmp_path = dir.join(format!(
            ".tmp-{}-{}",
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let write_result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            let mut size = 0u64;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = body.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hash.update(&buf[..n]);
                file.write_all(&buf[..n]).await?;
                size += n as u64;
            }
            file.sync_all().await?;
            verify_digest(expected, &hash)?;
            Ok::<u64, Error>(size)
        }
        .await;

        let size = match write_result {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(e);
            }
        };

        let final_path = self.blob_path(expected);
        if let Ok(meta) = tokio::fs::metadata(&final_path).await {
            if meta.len() == size {
                // Collision with an already-present blob of matching
                // size: success.
                let _ = tokio::fs::remove_file(&tmp_path).await;
                self.hub.notify(expected);
                return Ok(SizedBlobRef::new(expected.clone(), size));
            }
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        debug!(size, "localdisk: blob written");
        self.hub.notify(expected);
        Ok(SizedBlobRef::new(expected.clone(), size))
    }

    async fn fetch_streaming(&self, br: &BlobRef) -> Result<(BlobRead, u64)> {
        let (file, size) = self.fetch(br).await?;
        Ok((Box::new(file), size))
    }

    fn fetch_supported(&self) -> bool {
        true
    }

    async fn fetch(&self, br: &BlobRef) -> Result<(BlobReadSeek, u64)> {
        let path = self.blob_path(br);
        let file = tokio::fs::File::open(&path).await.map_err(io_fetch_err)?;
        let size = file.metadata().await?.len();
        Ok((Box::new(file), size))
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
            let mut still_missing = Vec::new();
            for br in missing {
                match self.stat_one(&br).await {
                    Some(sb) => {
                        if dest.send(sb).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => still_missing.push(br),
                }
            }
            missing = still_missing;
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
        let mut state = enumerate::WalkState {
            after: after.to_string(),
            remain: limit,
        };
        let mut rescanned = false;
        loop {
            let keep_going =
                enumerate::read_blobs(self.partition_root(), String::new(), &mut state, &dest)
                    .await?;
            let now = Instant::now();
            if !keep_going || state.remain == 0 || wait.is_zero() || now >= deadline || rescanned {
                return Ok(());
            }
            if !self.hub.wait_any(deadline - now).await {
                return Ok(());
            }
            // One more scan after the wake-up, continuing past the last
            // emitted reference.
            rescanned = true;
        }
    }

    async fn remove(&self, refs: &[BlobRef]) -> Result<()> {
        for br in refs {
            match tokio::fs::remove_file(self.blob_path(br)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            // The empty leaf directory is left in place.
        }
        Ok(())
    }

    fn hub(&self) -> &BlobHub {
        &self.hub
    }
}

/// Root path of a partition, for tools that need the on-disk location.
pub fn partition_root(root: &Path, partition: &str) -> PathBuf {
    root.join("partition").join(partition)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use larch_core::storage::enumerate_all;
    use larch_core::storage::fetch_bytes;
    use larch_core::storage::has_blob;
    use larch_core::storage::receive_bytes;
    use tokio::io::AsyncSeekExt;

    use super::*;

    fn disk(dir: &tempfile::TempDir) -> DiskStorage {
        DiskStorage::new(dir.path()).expect("create storage")
    }

    #[tokio::test]
    async fn receive_writes_fanout_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ds = disk(&dir);
        let sb = receive_bytes(&ds, b"fan out").await.expect("receive");

        let digest = sb.blob_ref.digest();
        let want = dir
            .path()
            .join("partition/default/sha1")
            .join(&digest[..3])
            .join(&digest[3..6])
            .join(format!("{}.dat", sb.blob_ref));
        let meta = std::fs::metadata(&want).expect("blob file exists");
        assert_eq!(meta.len(), 7);
    }

    #[tokio::test]
    async fn round_trip_and_seek() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ds = disk(&dir);
        let sb = receive_bytes(&ds, b"0123456789").await.expect("receive");

        let data = fetch_bytes(&ds, &sb.blob_ref).await.expect("fetch");
        assert_eq!(&data[..], b"0123456789");

        assert!(ds.fetch_supported());
        let (mut r, size) = ds.fetch(&sb.blob_ref).await.expect("fetch");
        assert_eq!(size, 10);
        r.seek(std::io::SeekFrom::Start(6)).await.expect("seek");
        let mut rest = String::new();
        r.read_to_string(&mut rest).await.expect("read");
        assert_eq!(rest, "6789");
    }

    #[tokio::test]
    async fn mismatched_digest_leaves_no_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ds = disk(&dir);
        let wrong = BlobRef::sha1_from_bytes(b"something else");
        let body: BlobRead = Box::new(std::io::Cursor::new(b"actual bytes".to_vec()));
        let err = ds.receive(&wrong, body).await.expect_err("should fail");
        assert!(matches!(err, Error::MismatchedDigest { .. }));
        assert!(!has_blob(&ds, &wrong).await.expect("stat"));

        // Neither the final file nor any temp file survives.
        let mut found = Vec::new();
        let mut stack = vec![dir.path().to_path_buf()];
        while let Some(d) = stack.pop() {
            for entry in std::fs::read_dir(&d).expect("read_dir") {
                let entry = entry.expect("entry");
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    found.push(path);
                }
            }
        }
        assert!(found.is_empty(), "leftover files: {found:?}");
    }

    #[tokio::test]
    async fn receive_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ds = disk(&dir);
        let first = receive_bytes(&ds, b"again").await.expect("first");
        let second = receive_bytes(&ds, b"again").await.expect("second");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn enumerate_is_sorted_and_pages_exactly_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ds = disk(&dir);
        let mut want = Vec::new();
        for i in 0..20u32 {
            let sb = receive_bytes(&ds, format!("disk blob {i}").as_bytes())
                .await
                .expect("receive");
            want.push(sb.blob_ref.to_string());
        }
        want.sort();

        let got: Vec<String> = enumerate_all(&ds, 3)
            .await
            .expect("enumerate")
            .into_iter()
            .map(|sb| sb.blob_ref.to_string())
            .collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn enumerate_respects_after() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ds = disk(&dir);
        for i in 0..8u32 {
            receive_bytes(&ds, format!("a{i}").as_bytes()).await.expect("receive");
        }
        let all = enumerate_all(&ds, 100).await.expect("enumerate");
        let after = all[2].blob_ref.to_string();

        let (tx, mut rx) = mpsc::channel(16);
        ds.enumerate_blobs(tx, &after, 100, Duration::ZERO).await.expect("enumerate");
        let mut got = Vec::new();
        while let Some(sb) = rx.recv().await {
            got.push(sb.blob_ref.to_string());
        }
        let want: Vec<String> = all[3..].iter().map(|sb| sb.blob_ref.to_string()).collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn enumerate_long_poll_sees_late_blob() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ds = Arc::new(disk(&dir));
        let writer = ds.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            receive_bytes(writer.as_ref(), b"late disk blob").await.expect("receive");
        });

        let (tx, mut rx) = mpsc::channel(4);
        ds.enumerate_blobs(tx, "", 10, Duration::from_secs(5))
            .await
            .expect("enumerate");
        let got = rx.recv().await.expect("should see the late blob");
        assert_eq!(got.blob_ref, BlobRef::sha1_from_bytes(b"late disk blob"));
        handle.await.expect("writer task");
    }

    #[tokio::test]
    async fn remove_unlinks_and_ignores_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ds = disk(&dir);
        let sb = receive_bytes(&ds, b"bye").await.expect("receive");
        let missing = BlobRef::sha1_from_bytes(b"never there");
        ds.remove(&[sb.blob_ref.clone(), missing]).await.expect("remove");
        assert!(!has_blob(&ds, &sb.blob_ref).await.expect("stat"));
        // The leaf directory survives the unlink.
        assert!(ds.blob_dir(&sb.blob_ref).is_dir());
    }

    #[tokio::test]
    async fn partitions_are_disjoint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = DiskStorage::with_partition(dir.path(), "a").expect("a");
        let b = DiskStorage::with_partition(dir.path(), "b").expect("b");
        let sb = receive_bytes(&a, b"only in a").await.expect("receive");
        assert!(has_blob(&a, &sb.blob_ref).await.expect("stat a"));
        assert!(!has_blob(&b, &sb.blob_ref).await.expect("stat b"));
    }
}
