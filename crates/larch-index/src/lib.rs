//! Blob metadata and claim indexing.
//!
//! An index records what it learns from received blobs — sizes, schema
//! types, claims — and answers the queries the search layer needs:
//! recent permanodes, a permanode's claims, blob mime types, file info,
//! and content-level dedup lookups.
//!
//! Claim evaluation is pure and lives here ([`permanode_attrs`]); the
//! concrete [`SqliteIndex`] stores its rows in SQLite and doubles as a
//! [`Storage`](larch_core::Storage) so it can sit behind a replica and
//! index everything the blob server receives.

pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::mpsc;

use larch_core::BlobRef;
use larch_core::Result;
pub use larch_schema::ClaimType;
pub use sqlite::SqliteIndex;

/// Mime type prefix for schema blobs; the suffix is the `camliType`.
pub const CAMLI_TYPE_MIME_PREFIX: &str = "application/json; camliType=";

/// Mime type reported for non-schema blobs.
pub const GENERIC_MIME_TYPE: &str = "application/octet-stream";

/// An indexed attribute-change claim on a permanode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// The claim blob itself.
    pub blob_ref: BlobRef,
    pub signer: BlobRef,
    pub permanode: BlobRef,
    pub date: DateTime<Utc>,
    pub claim_type: ClaimType,
    /// Attribute being changed; empty for malformed/foreign claims.
    pub attr: String,
    /// New value; empty means "no value" (attribute-wide delete).
    pub value: String,
}

/// A permanode with the time of its most recent claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentPermanode {
    pub permanode: BlobRef,
    pub signer: BlobRef,
    pub last_mod: DateTime<Utc>,
}

/// Size, name, and mime type recorded for a file schema blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub file_name: String,
    pub mime_type: String,
}

/// Queries exposed to the search and describe layer.
#[async_trait]
pub trait Index: Send + Sync {
    /// Most-recently-modified permanodes owned by any of `owners`,
    /// newest first, up to `limit`. The sink is closed by the callee.
    async fn get_recent_permanodes(
        &self,
        dest: mpsc::Sender<RecentPermanode>,
        owners: &[BlobRef],
        limit: usize,
    ) -> Result<()>;

    /// All claims by `owner` on `permanode`, sorted by claim date
    /// ascending, ties broken by blobref.
    async fn get_owner_claims(&self, permanode: &BlobRef, owner: &BlobRef) -> Result<Vec<Claim>>;

    /// `application/json; camliType=<kind>` and size for schema blobs,
    /// a generic type for everything else. `NotFound` for unknown blobs.
    async fn get_blob_mime_type(&self, br: &BlobRef) -> Result<(String, u64)>;

    /// Recorded file info for a file schema blob.
    async fn get_file_info(&self, br: &BlobRef) -> Result<FileInfo>;

    /// File schema blobs whose first content bytes are `bytes_ref`;
    /// the content-level dedup lookup.
    async fn existing_file_schemas(&self, bytes_ref: &BlobRef) -> Result<Vec<BlobRef>>;
}

/// Sort claims into application order: claim date ascending, ties broken
/// deterministically by the claim's own blobref.
pub fn sort_claims(claims: &mut [Claim]) {
    claims.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.blob_ref.cmp(&b.blob_ref)));
}

/// Evaluate a permanode's attributes from its claims.
///
/// Claims apply in date order: `set-attribute` clears then appends,
/// `add-attribute` appends if absent, `del-attribute` with a value
/// removes it, `del-attribute` without one deletes the attribute.
pub fn permanode_attrs(claims: &[Claim]) -> BTreeMap<String, Vec<String>> {
    let mut sorted = claims.to_vec();
    sort_claims(&mut sorted);

    let mut attrs: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for claim in &sorted {
        match claim.claim_type {
            ClaimType::DelAttribute => {
                if claim.value.is_empty() {
                    attrs.remove(&claim.attr);
                } else if let Some(values) = attrs.get_mut(&claim.attr) {
                    values.retain(|v| v != &claim.value);
                }
            }
            ClaimType::SetAttribute | ClaimType::AddAttribute => {
                if claim.claim_type == ClaimType::SetAttribute {
                    attrs.remove(&claim.attr);
                }
                if claim.value.is_empty() {
                    continue;
                }
                let values = attrs.entry(claim.attr.clone()).or_default();
                if !values.contains(&claim.value) {
                    values.push(claim.value.clone());
                }
            }
        }
    }
    attrs
}
