//! Core types and contracts for the larch blob store.
//!
//! Everything in the system speaks in terms of this crate:
//!
//! - [`BlobRef`] / [`SizedBlobRef`] — hash-named references to immutable
//!   blobs, with the hash registry behind them
//! - [`Storage`] — the backend contract (receive / fetch / stat /
//!   enumerate / remove) every blob server implements
//! - [`BlobHub`] — best-effort in-process notification of blob arrivals
//! - [`SeekFetcher`] and its adapters — the capability split between
//!   streaming and seekable fetches
//! - [`MemoryStorage`] — the in-memory reference backend
//!
//! Backends live in their own crates (`larch-disk`, `larch-routing`,
//! `larch-index`) and only depend on the traits here.

pub mod blobref;
pub mod error;
pub mod fetch;
pub mod hub;
pub mod memory;
pub mod race;
pub mod storage;
pub mod test_support;

pub use blobref::BlobHash;
pub use blobref::BlobRef;
pub use blobref::SizedBlobRef;
pub use error::Error;
pub use error::Result;
pub use fetch::SeekFetcher;
pub use fetch::StorageSeekFetcher;
pub use hub::BlobHub;
pub use memory::MemoryStorage;
pub use race::first_match;
pub use storage::AsyncReadSeek;
pub use storage::BlobRead;
pub use storage::BlobReadSeek;
pub use storage::Storage;
