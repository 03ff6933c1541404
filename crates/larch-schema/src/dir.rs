//! Directory resolution over static-sets.
//!
//! A directory schema blob points at a static-set whose members are the
//! schema blobs of the directory's children. Name lookup probes every
//! member concurrently and takes the first match, cancelling the rest.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::io::AsyncReadExt;

use larch_core::first_match;
use larch_core::BlobRef;
use larch_core::Error;
use larch_core::Result;
use larch_core::SeekFetcher;

use crate::model::Schema;
use crate::model::SchemaKind;

/// Fetch and decode a schema blob.
pub async fn fetch_schema(fetcher: &dyn SeekFetcher, br: &BlobRef) -> Result<Schema> {
    let (mut r, _size) = fetcher.fetch(br).await?;
    let mut data = Vec::new();
    r.read_to_end(&mut data).await?;
    Schema::parse_bytes(&data)
}

/// Resolve a directory blob to its member refs, via its static-set.
///
/// The directory must carry `entries`; an empty directory is a
/// static-set with no members. Duplicate members collapse.
pub async fn directory_entries(fetcher: &dyn SeekFetcher, dir_ref: &BlobRef) -> Result<Vec<BlobRef>> {
    let dir = fetch_schema(fetcher, dir_ref).await?;
    let SchemaKind::Directory(dir) = &dir.kind else {
        return Err(Error::malformed(format!(
            "expected \"directory\" schema blob, got {:?}",
            dir.kind_name()
        )));
    };

    let set = fetch_schema(fetcher, &dir.entries).await?;
    let SchemaKind::StaticSet(set) = &set.kind else {
        return Err(Error::malformed(format!(
            "expected \"static-set\" schema blob, got {:?}",
            set.kind_name()
        )));
    };

    let mut seen = HashSet::new();
    Ok(set
        .members
        .iter()
        .filter(|m| seen.insert((*m).clone()))
        .cloned()
        .collect())
}

/// Find the member of a directory carrying the given file name,
/// racing the member fetches and cancelling stragglers on the first hit.
pub async fn lookup_member(
    fetcher: Arc<dyn SeekFetcher>,
    dir_ref: &BlobRef,
    name: &str,
) -> Result<Option<BlobRef>> {
    let members = directory_entries(fetcher.as_ref(), dir_ref).await?;
    let name = name.to_string();
    let probes = members.into_iter().map(|member| {
        let fetcher = fetcher.clone();
        let name = name.clone();
        async move {
            let schema = fetch_schema(fetcher.as_ref(), &member).await.ok()?;
            schema.has_file_name(&name).then_some(member)
        }
    });
    Ok(first_match(probes).await)
}

#[cfg(test)]
mod tests {
    use larch_core::storage::receive_bytes;
    use larch_core::MemoryStorage;
    use larch_core::Storage;
    use larch_core::StorageSeekFetcher;

    use super::*;
    use crate::camli_json::to_camli_json;
    use crate::model::ContentPart;

    async fn store_schema(storage: &dyn Storage, schema: &Schema) -> BlobRef {
        let json = to_camli_json(schema).expect("serialize");
        receive_bytes(storage, json.as_bytes()).await.expect("receive").blob_ref
    }

    async fn fixture() -> (Arc<dyn Storage>, Arc<dyn SeekFetcher>) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let fetcher: Arc<dyn SeekFetcher> = Arc::new(StorageSeekFetcher::new(storage.clone()));
        (storage, fetcher)
    }

    async fn file_member(storage: &dyn Storage, name: &str, content: &[u8]) -> BlobRef {
        let blob = receive_bytes(storage, content).await.expect("blob").blob_ref;
        let schema =
            Schema::file(name, content.len() as u64, vec![ContentPart::leaf(blob, content.len() as u64)])
                .expect("schema");
        store_schema(storage, &schema).await
    }

    #[tokio::test]
    async fn lookup_finds_named_member() {
        let (storage, fetcher) = fixture().await;
        let a = file_member(storage.as_ref(), "a.txt", b"aaa").await;
        let b = file_member(storage.as_ref(), "b.txt", b"bbb").await;
        let set = store_schema(storage.as_ref(), &Schema::static_set(vec![a, b.clone()])).await;
        let dir = store_schema(storage.as_ref(), &Schema::directory("photos", set)).await;

        let found = lookup_member(fetcher.clone(), &dir, "b.txt").await.expect("lookup");
        assert_eq!(found, Some(b));
        let missing = lookup_member(fetcher, &dir, "c.txt").await.expect("lookup");
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn empty_directory_is_empty_static_set() {
        let (storage, fetcher) = fixture().await;
        let set = store_schema(storage.as_ref(), &Schema::static_set(vec![])).await;
        let dir = store_schema(storage.as_ref(), &Schema::directory("empty", set)).await;
        let entries = directory_entries(fetcher.as_ref(), &dir).await.expect("entries");
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn directory_without_entries_is_malformed() {
        let (storage, fetcher) = fixture().await;
        let json = br#"{"camliVersion": 1, "camliType": "directory", "fileName": "broken"}"#;
        let root = receive_bytes(storage.as_ref(), json).await.expect("receive").blob_ref;
        let err = directory_entries(fetcher.as_ref(), &root).await.expect_err("no entries");
        assert!(matches!(err, Error::Malformed { .. }));
    }

    #[tokio::test]
    async fn non_directory_is_rejected() {
        let (storage, fetcher) = fixture().await;
        let set = store_schema(storage.as_ref(), &Schema::static_set(vec![])).await;
        let err = directory_entries(fetcher.as_ref(), &set).await.expect_err("not a dir");
        assert!(matches!(err, Error::Malformed { .. }));
    }
}
