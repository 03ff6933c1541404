//! Ordered merge of child enumeration streams.

use tokio::sync::mpsc;

use larch_core::Result;
use larch_core::SizedBlobRef;

/// Merge already-sorted child streams into `dest`, preserving global
/// ascending canonical order and emitting each ref exactly once (equal
/// heads from several children collapse), up to `limit` items.
pub(crate) async fn merge_enumerate(
    mut children: Vec<mpsc::Receiver<SizedBlobRef>>,
    dest: &mpsc::Sender<SizedBlobRef>,
    limit: usize,
) -> Result<()> {
    let mut heads: Vec<Option<SizedBlobRef>> = Vec::with_capacity(children.len());
    for rx in &mut children {
        heads.push(rx.recv().await);
    }

    let mut sent = 0;
    while sent < limit {
        let mut min_idx: Option<usize> = None;
        for i in 0..heads.len() {
            if heads[i].is_none() {
                continue;
            }
            min_idx = match min_idx {
                None => Some(i),
                Some(j) => {
                    let i_smaller = match (&heads[i], &heads[j]) {
                        (Some(a), Some(b)) => a.blob_ref < b.blob_ref,
                        _ => false,
                    };
                    if i_smaller {
                        Some(i)
                    } else {
                        Some(j)
                    }
                }
            };
        }
        let Some(idx) = min_idx else {
            break;
        };
        let Some(sb) = heads[idx].take() else {
            break;
        };
        heads[idx] = children[idx].recv().await;

        // Drop equal heads from the other children so replicas of the
        // same blob emit once.
        for i in 0..heads.len() {
            while matches!(&heads[i], Some(h) if h.blob_ref == sb.blob_ref) {
                heads[i] = children[i].recv().await;
            }
        }

        if dest.send(sb).await.is_err() {
            return Ok(());
        }
        sent += 1;
    }
    Ok(())
}
