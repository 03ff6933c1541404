//! SQLite-backed index.
//!
//! The index is itself a [`Storage`]: every received blob is hashed,
//! verified, and recorded as metadata rows — `blobs` for sizes and schema
//! types, `claims` for attribute changes, `files` for file schemas — and
//! stat/enumerate answer from the `blobs` table in canonical order. Blob
//! bytes are not retained; the index sits beside a real blob store,
//! typically both behind a replica.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::params;
use rusqlite::params_from_iter;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use snafu::ResultExt;
use snafu::Snafu;
use tokio::sync::mpsc;
use tracing::debug;

use larch_core::storage::read_all_verified;
use larch_core::BlobHub;
use larch_core::BlobRead;
use larch_core::BlobRef;
use larch_core::Error;
use larch_core::Result;
use larch_core::SizedBlobRef;
use larch_core::Storage;
use larch_schema::model::ClaimSchema;
use larch_schema::Schema;
use larch_schema::SchemaKind;

use crate::Claim;
use crate::FileInfo;
use crate::Index;
use crate::RecentPermanode;
use crate::CAMLI_TYPE_MIME_PREFIX;
use crate::GENERIC_MIME_TYPE;

/// Errors from the SQLite layer.
#[derive(Debug, Snafu)]
pub enum IndexError {
    #[snafu(display("failed to open index database at {}: {source}", path.display()))]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[snafu(display("failed to execute SQL statement: {source}"))]
    Execute { source: rusqlite::Error },

    #[snafu(display("failed to query index: {source}"))]
    Query { source: rusqlite::Error },
}

impl From<IndexError> for Error {
    fn from(err: IndexError) -> Error {
        Error::transient(err.to_string())
    }
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS blobs (
    blobref TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    type TEXT
);
CREATE TABLE IF NOT EXISTS claims (
    blobref TEXT PRIMARY KEY,
    signer TEXT NOT NULL,
    permanode TEXT NOT NULL,
    date INTEGER NOT NULL,
    claimtype TEXT NOT NULL,
    attr TEXT NOT NULL,
    value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS claims_permanode ON claims (permanode, signer);
CREATE TABLE IF NOT EXISTS files (
    fileschemaref TEXT PRIMARY KEY,
    bytesref TEXT,
    size INTEGER NOT NULL,
    filename TEXT NOT NULL,
    mimetype TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS files_bytesref ON files (bytesref);
";

/// Index over a SQLite database, also usable as a (metadata-only)
/// storage backend.
pub struct SqliteIndex {
    conn: Mutex<Connection>,
    hub: BlobHub,
}

impl SqliteIndex {
    /// Open or create the index database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<SqliteIndex> {
        let path = path.as_ref();
        let conn = Connection::open(path).context(OpenDatabaseSnafu { path })?;
        SqliteIndex::with_connection(conn)
    }

    /// In-memory index, used by tests and throwaway configurations.
    pub fn open_in_memory() -> Result<SqliteIndex> {
        let conn = Connection::open_in_memory().context(OpenDatabaseSnafu {
            path: PathBuf::from(":memory:"),
        })?;
        SqliteIndex::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<SqliteIndex> {
        conn.execute_batch(SCHEMA_SQL).context(ExecuteSnafu)?;
        Ok(SqliteIndex {
            conn: Mutex::new(conn),
            hub: BlobHub::new(),
        })
    }

    fn record_blob(&self, br: &BlobRef, size: u64, data: &[u8]) -> Result<()> {
        let schema = Schema::parse_bytes(data).ok();
        let kind = schema.as_ref().map(|s| s.kind_name());

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO blobs (blobref, size, type) VALUES (?1, ?2, ?3)",
            params![br.to_string(), size as i64, kind],
        )
        .context(ExecuteSnafu)?;

        let Some(schema) = schema else {
            return Ok(());
        };
        match &schema.kind {
            SchemaKind::Claim(claim) => {
                self.record_claim(&conn, br, schema.signer.as_ref(), claim)?
            }
            SchemaKind::File(file) => {
                let bytes_ref = file.content_parts.first().and_then(|p| {
                    p.blob_ref
                        .as_ref()
                        .or(p.sub_file_blob_ref.as_ref())
                        .map(|r| r.to_string())
                });
                conn.execute(
                    "INSERT OR REPLACE INTO files
                     (fileschemaref, bytesref, size, filename, mimetype)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        br.to_string(),
                        bytes_ref,
                        file.size as i64,
                        file.file_name.0.to_string_lossy().into_owned(),
                        GENERIC_MIME_TYPE,
                    ],
                )
                .context(ExecuteSnafu)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn record_claim(
        &self,
        conn: &Connection,
        br: &BlobRef,
        signer: Option<&BlobRef>,
        claim: &ClaimSchema,
    ) -> Result<()> {
        // Unsigned claims are recorded with an empty signer; signature
        // verification is delegated to an external signer.
        let signer = signer.map(|s| s.to_string()).unwrap_or_default();
        conn.execute(
            "INSERT OR REPLACE INTO claims
             (blobref, signer, permanode, date, claimtype, attr, value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                br.to_string(),
                signer,
                claim.permanode.to_string(),
                date_to_nanos(&claim.claim_date),
                claim.claim_type.to_string(),
                claim.attribute.clone().unwrap_or_default(),
                claim.value.clone().unwrap_or_default(),
            ],
        )
        .context(ExecuteSnafu)?;
        Ok(())
    }

    fn stat_present(&self, refs: &[BlobRef]) -> Result<Vec<SizedBlobRef>> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; refs.len()].join(", ");
        let sql = format!("SELECT blobref, size FROM blobs WHERE blobref IN ({placeholders})");
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).context(QuerySnafu)?;
        let rows = stmt
            .query_map(
                params_from_iter(refs.iter().map(|r| r.to_string())),
                |row| {
                    let blobref: String = row.get(0)?;
                    let size: i64 = row.get(1)?;
                    Ok((blobref, size))
                },
            )
            .context(QuerySnafu)?;

        let mut out = Vec::new();
        for row in rows {
            let (blobref, size) = row.context(QuerySnafu)?;
            if let Some(br) = BlobRef::parse(&blobref) {
                out.push(SizedBlobRef::new(br, size as u64));
            }
        }
        Ok(out)
    }
}

fn date_to_nanos(date: &DateTime<Utc>) -> i64 {
    // In range for any plausible claim date (1677..2262).
    date.timestamp_nanos_opt().unwrap_or_default()
}

fn nanos_to_date(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(nanos.div_euclid(1_000_000_000), nanos.rem_euclid(1_000_000_000) as u32)
        .unwrap_or_default()
}

#[async_trait]
impl Index for SqliteIndex {
    async fn get_recent_permanodes(
        &self,
        dest: mpsc::Sender<RecentPermanode>,
        owners: &[BlobRef],
        limit: usize,
    ) -> Result<()> {
        if owners.is_empty() {
            return Ok(());
        }
        let recent = {
            let placeholders = vec!["?"; owners.len()].join(", ");
            let sql = format!(
                "SELECT permanode, signer, MAX(date) AS last
                 FROM claims WHERE signer IN ({placeholders})
                 GROUP BY permanode ORDER BY last DESC LIMIT {limit}"
            );
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&sql).context(QuerySnafu)?;
            let rows = stmt
                .query_map(
                    params_from_iter(owners.iter().map(|o| o.to_string())),
                    |row| {
                        let permanode: String = row.get(0)?;
                        let signer: String = row.get(1)?;
                        let nanos: i64 = row.get(2)?;
                        Ok((permanode, signer, nanos))
                    },
                )
                .context(QuerySnafu)?;

            let mut out = Vec::new();
            for row in rows {
                let (permanode, signer, nanos) = row.context(QuerySnafu)?;
                let (Some(permanode), Some(signer)) =
                    (BlobRef::parse(&permanode), BlobRef::parse(&signer))
                else {
                    continue;
                };
                out.push(RecentPermanode {
                    permanode,
                    signer,
                    last_mod: nanos_to_date(nanos),
                });
            }
            out
        };

        for r in recent {
            if dest.send(r).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn get_owner_claims(&self, permanode: &BlobRef, owner: &BlobRef) -> Result<Vec<Claim>> {
        let mut claims = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT blobref, date, claimtype, attr, value
                     FROM claims WHERE permanode = ?1 AND signer = ?2",
                )
                .context(QuerySnafu)?;
            let rows = stmt
                .query_map(params![permanode.to_string(), owner.to_string()], |row| {
                    let blobref: String = row.get(0)?;
                    let nanos: i64 = row.get(1)?;
                    let claimtype: String = row.get(2)?;
                    let attr: String = row.get(3)?;
                    let value: String = row.get(4)?;
                    Ok((blobref, nanos, claimtype, attr, value))
                })
                .context(QuerySnafu)?;

            let mut out = Vec::new();
            for row in rows {
                let (blobref, nanos, claimtype, attr, value) = row.context(QuerySnafu)?;
                let Some(blob_ref) = BlobRef::parse(&blobref) else {
                    continue;
                };
                let Some(claim_type) = parse_claim_type(&claimtype) else {
                    continue;
                };
                out.push(Claim {
                    blob_ref,
                    signer: owner.clone(),
                    permanode: permanode.clone(),
                    date: nanos_to_date(nanos),
                    claim_type,
                    attr,
                    value,
                });
            }
            out
        };
        crate::sort_claims(&mut claims);
        Ok(claims)
    }

    async fn get_blob_mime_type(&self, br: &BlobRef) -> Result<(String, u64)> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT size, type FROM blobs WHERE blobref = ?1",
                params![br.to_string()],
                |row| {
                    let size: i64 = row.get(0)?;
                    let kind: Option<String> = row.get(1)?;
                    Ok((size, kind))
                },
            )
            .optional()
            .context(QuerySnafu)?
        };
        let (size, kind) = row.ok_or(Error::NotFound)?;
        let mime = match kind {
            Some(kind) => format!("{CAMLI_TYPE_MIME_PREFIX}{kind}"),
            None => GENERIC_MIME_TYPE.to_string(),
        };
        Ok((mime, size as u64))
    }

    async fn get_file_info(&self, br: &BlobRef) -> Result<FileInfo> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT size, filename, mimetype FROM files WHERE fileschemaref = ?1",
                params![br.to_string()],
                |row| {
                    let size: i64 = row.get(0)?;
                    let file_name: String = row.get(1)?;
                    let mime_type: String = row.get(2)?;
                    Ok(FileInfo {
                        size: size as u64,
                        file_name,
                        mime_type,
                    })
                },
            )
            .optional()
            .context(QuerySnafu)?
        };
        row.ok_or(Error::NotFound)
    }

    async fn existing_file_schemas(&self, bytes_ref: &BlobRef) -> Result<Vec<BlobRef>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT fileschemaref FROM files WHERE bytesref = ?1 ORDER BY fileschemaref")
            .context(QuerySnafu)?;
        let rows = stmt
            .query_map(params![bytes_ref.to_string()], |row| row.get::<_, String>(0))
            .context(QuerySnafu)?;

        let mut out = Vec::new();
        for row in rows {
            if let Some(br) = BlobRef::parse(&row.context(QuerySnafu)?) {
                out.push(br);
            }
        }
        Ok(out)
    }
}

fn parse_claim_type(s: &str) -> Option<larch_schema::ClaimType> {
    use larch_schema::ClaimType;
    match s {
        "set-attribute" => Some(ClaimType::SetAttribute),
        "add-attribute" => Some(ClaimType::AddAttribute),
        "del-attribute" => Some(ClaimType::DelAttribute),
        _ => None,
    }
}

#[async_trait]
impl Storage for SqliteIndex {
    async fn receive(&self, expected: &BlobRef, body: BlobRead) -> Result<SizedBlobRef> {
        let data = read_all_verified(expected, body).await?;
        let size = data.len() as u64;
        self.record_blob(expected, size, &data)?;
        debug!(blob = %expected, size, "index: blob recorded");
        self.hub.notify(expected);
        Ok(SizedBlobRef::new(expected.clone(), size))
    }

    /// The index keeps metadata only; blob bytes live in the storage
    /// beside it.
    async fn fetch_streaming(&self, _br: &BlobRef) -> Result<(BlobRead, u64)> {
        Err(Error::Unsupported {
            operation: "fetch_streaming",
        })
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
            let present = self.stat_present(&missing)?;
            missing.retain(|br| !present.iter().any(|sb| &sb.blob_ref == br));
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
            let batch = {
                let conn = self.conn.lock();
                let mut stmt = conn
                    .prepare(
                        "SELECT blobref, size FROM blobs
                         WHERE blobref > ?1 ORDER BY blobref LIMIT ?2",
                    )
                    .context(QuerySnafu)?;
                let rows = stmt
                    .query_map(params![after, remain as i64], |row| {
                        let blobref: String = row.get(0)?;
                        let size: i64 = row.get(1)?;
                        Ok((blobref, size))
                    })
                    .context(QuerySnafu)?;

                let mut out = Vec::new();
                for row in rows {
                    let (blobref, size) = row.context(QuerySnafu)?;
                    if let Some(br) = BlobRef::parse(&blobref) {
                        out.push(SizedBlobRef::new(br, size as u64));
                    }
                }
                out
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
            rescanned = true;
        }
    }

    async fn remove(&self, refs: &[BlobRef]) -> Result<()> {
        let conn = self.conn.lock();
        for br in refs {
            let key = br.to_string();
            conn.execute("DELETE FROM blobs WHERE blobref = ?1", params![key])
                .context(ExecuteSnafu)?;
            conn.execute("DELETE FROM claims WHERE blobref = ?1", params![key])
                .context(ExecuteSnafu)?;
            conn.execute("DELETE FROM files WHERE fileschemaref = ?1", params![key])
                .context(ExecuteSnafu)?;
        }
        Ok(())
    }

    fn hub(&self) -> &BlobHub {
        &self.hub
    }
}
