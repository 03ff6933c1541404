//! Ordered enumeration over the fan-out tree.
//!
//! Directory names at each level are a prefix of the canonical blob
//! strings below them, so walking the levels in lexical order yields refs
//! in ascending canonical order, and subtrees wholly below `after` can be
//! pruned by comparing prefixes.

use std::path::PathBuf;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use larch_core::BlobRef;
use larch_core::Result;
use larch_core::SizedBlobRef;

/// Cursor state threaded through the recursive walk. `after` advances to
/// each emitted ref, so a rescan continues where the last one stopped.
pub(crate) struct WalkState {
    pub after: String,
    pub remain: usize,
}

/// Walk `dir` in sorted order, emitting refs greater than `state.after`
/// until `state.remain` hits zero. Returns false when the sink is closed.
pub(crate) fn read_blobs<'a>(
    dir: PathBuf,
    blob_prefix: String,
    state: &'a mut WalkState,
    dest: &'a mpsc::Sender<SizedBlobRef>,
) -> BoxFuture<'a, Result<bool>> {
    Box::pin(async move {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();

        for name in names {
            if state.remain == 0 {
                return Ok(true);
            }
            let full = dir.join(&name);
            let meta = match tokio::fs::metadata(&full).await {
                Ok(meta) => meta,
                // Raced with a remove; skip.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            if meta.is_dir() {
                // The hash-name level contributes "<hash>-", deeper
                // levels contribute digest characters.
                let new_prefix = if blob_prefix.is_empty() {
                    format!("{name}-")
                } else {
                    format!("{blob_prefix}{name}")
                };
                if !state.after.is_empty() {
                    let cl = new_prefix.len().min(state.after.len());
                    if new_prefix.as_bytes()[..cl] < state.after.as_bytes()[..cl] {
                        // Every ref below this subtree sorts before
                        // `after`.
                        continue;
                    }
                }
                if !read_blobs(full, new_prefix, state, dest).await? {
                    return Ok(false);
                }
                continue;
            }

            if meta.is_file() {
                let Some(blob_name) = name.strip_suffix(".dat") else {
                    continue;
                };
                if blob_name <= state.after.as_str() {
                    continue;
                }
                let Some(br) = BlobRef::parse(blob_name) else {
                    continue;
                };
                if dest.send(SizedBlobRef::new(br, meta.len())).await.is_err() {
                    return Ok(false);
                }
                state.after = blob_name.to_string();
                state.remain -= 1;
            }
        }

        Ok(true)
    })
}
