//! File writers: byte streams in, deduplicated blob DAGs out.
//!
//! Two modes:
//!
//! - [`write_file_from_reader`]: fixed 1 MiB chunks and a flat
//!   content-parts list. Simple, but insertions shift every later chunk.
//! - [`write_file_from_reader_rolling`]: content-defined chunking on
//!   rollsum split points, assembled into a hash tree of fragment schema
//!   blobs whose branching follows split strength.
//!
//! Both stat every chunk against the storage before uploading and verify
//! each upload's ack, so rewriting existing content uploads nothing.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use larch_core::storage::has_blob;
use larch_core::BlobRef;
use larch_core::Error;
use larch_core::Result;
use larch_core::SizedBlobRef;
use larch_core::Storage;

use crate::camli_json::to_camli_json;
use crate::model::ContentPart;
use crate::model::Schema;
use crate::rollsum::RollSum;

/// Chunk size for the naive writer.
const NAIVE_CHUNK_SIZE: u64 = 1 << 20;

/// Hard ceiling on a rolling chunk: a split is forced once a chunk grows
/// this large, bounding memory and fetch granularity on pathological
/// inputs that never hit a natural split point.
pub const MAX_CHUNK_SIZE: usize = 1 << 20;

/// Cap on chunk uploads in flight from a single writer.
const MAX_IN_FLIGHT_UPLOADS: usize = 8;

/// Upload `data` under `br` unless the storage already has it, verifying
/// the ack on upload.
async fn upload_if_absent(storage: &dyn Storage, br: &BlobRef, data: Bytes) -> Result<()> {
    if has_blob(storage, br).await? {
        debug!(blob = %br, "chunk already present, skipping upload");
        return Ok(());
    }
    let size = data.len() as u64;
    let ack = storage.receive(br, Box::new(std::io::Cursor::new(data))).await?;
    let expect = SizedBlobRef::new(br.clone(), size);
    if ack != expect {
        return Err(Error::transient(format!("wrote {expect}, got {ack} ack'd")));
    }
    Ok(())
}

/// Serialize a schema blob and upload it if absent, returning its ref.
async fn upload_schema(storage: &dyn Storage, schema: &Schema) -> Result<BlobRef> {
    let json = to_camli_json(schema)?;
    let br = BlobRef::sha1_from_bytes(json.as_bytes());
    upload_if_absent(storage, &br, Bytes::from(json)).await?;
    Ok(br)
}

/// Write a "file" schema blob composed of fixed-size chunks of `r`,
/// uploading the chunks, and return the schema blob's ref.
pub async fn write_file_from_reader<R>(
    storage: Arc<dyn Storage>,
    file_name: &str,
    mut r: R,
) -> Result<BlobRef>
where
    R: AsyncRead + Unpin,
{
    let mut parts = Vec::new();
    let mut size = 0u64;
    loop {
        let mut chunk = Vec::new();
        let n = (&mut r).take(NAIVE_CHUNK_SIZE).read_to_end(&mut chunk).await? as u64;
        if n == 0 {
            break;
        }
        let br = BlobRef::sha1_from_bytes(&chunk);
        upload_if_absent(storage.as_ref(), &br, Bytes::from(chunk)).await?;
        size += n;
        parts.push(ContentPart::leaf(br, n));
        if n < NAIVE_CHUNK_SIZE {
            break;
        }
    }

    let schema = Schema::file(file_name, size, parts)?;
    upload_schema(storage.as_ref(), &schema).await
}

/// A chunk of file content between two split points. Spans with children
/// are the interior nodes of the hash tree; the children cover the bytes
/// before `from`.
struct Span {
    from: u64,
    to: u64,
    bits: u32,
    br: BlobRef,
    children: Vec<Span>,
}

impl Span {
    fn size(&self) -> u64 {
        self.children.iter().map(Span::size).sum::<u64>() + (self.to - self.from)
    }
}

/// Bounded fan-out of chunk uploads.
struct ChunkUploader {
    storage: Arc<dyn Storage>,
    slots: Arc<Semaphore>,
    tasks: JoinSet<Result<()>>,
}

impl ChunkUploader {
    fn new(storage: Arc<dyn Storage>) -> ChunkUploader {
        ChunkUploader {
            storage,
            slots: Arc::new(Semaphore::new(MAX_IN_FLIGHT_UPLOADS)),
            tasks: JoinSet::new(),
        }
    }

    async fn spawn(&mut self, br: BlobRef, data: Bytes) -> Result<()> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::transient("upload semaphore closed"))?;
        let storage = self.storage.clone();
        self.tasks.spawn(async move {
            let _permit = permit;
            upload_if_absent(storage.as_ref(), &br, data).await
        });
        // Surface failures from already-finished uploads early.
        while let Some(done) = self.tasks.try_join_next() {
            done.map_err(|e| Error::transient(format!("upload task failed: {e}")))??;
        }
        Ok(())
    }

    async fn join_all(mut self) -> Result<()> {
        while let Some(done) = self.tasks.join_next().await {
            done.map_err(|e| Error::transient(format!("upload task failed: {e}")))??;
        }
        Ok(())
    }
}

/// Write a "file" schema blob composed of content-defined chunks of `r`,
/// uploading chunks and intermediate fragment schemas, and return the
/// root schema blob's ref.
pub async fn write_file_from_reader_rolling<R>(
    storage: Arc<dyn Storage>,
    file_name: &str,
    mut r: R,
) -> Result<BlobRef>
where
    R: AsyncRead + Unpin,
{
    let mut uploads = ChunkUploader::new(storage.clone());
    // The stack of spans, cut on interesting rollsum boundaries.
    let mut spans: Vec<Span> = Vec::new();
    let mut rs = RollSum::new();
    let mut n: u64 = 0;
    let mut last: u64 = 0;
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 32 * 1024];

    loop {
        let read = r.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        for &c in &buf[..read] {
            pending.push(c);
            n += 1;
            rs.roll(c);

            let (split, bits) = if rs.on_split() {
                (true, rs.bits())
            } else if pending.len() >= MAX_CHUNK_SIZE {
                // Forced split at the ceiling, with minimum strength.
                (true, crate::rollsum::BLOB_BITS)
            } else {
                (false, 0)
            };
            if !split {
                continue;
            }

            // Spans on the stack with a weaker score become children of
            // this one, turning strong splits into tree levels.
            let mut children_from = spans.len();
            while children_from > 0 && spans[children_from - 1].bits < bits {
                children_from -= 1;
            }
            let children = spans.split_off(children_from);

            let chunk = Bytes::from(std::mem::take(&mut pending));
            let br = BlobRef::sha1_from_bytes(&chunk);
            uploads.spawn(br.clone(), chunk).await?;
            spans.push(Span {
                from: last,
                to: n,
                bits,
                br,
                children,
            });
            last = n;
        }
    }

    if n != last {
        let chunk = Bytes::from(std::mem::take(&mut pending));
        let br = BlobRef::sha1_from_bytes(&chunk);
        uploads.spawn(br.clone(), chunk).await?;
        spans.push(Span {
            from: last,
            to: n,
            bits: 0,
            br,
            children: Vec::new(),
        });
    }

    // All leaf chunks must be durable before the schema tree references
    // them.
    uploads.join_all().await?;

    upload_spans_as_file(storage.as_ref(), file_name, false, n, &spans).await
}

/// Emit the schema blob for a span list: children's fragments first, then
/// leaf parts, recursively.
fn upload_spans_as_file<'a>(
    storage: &'a dyn Storage,
    file_name: &'a str,
    fragment: bool,
    size: u64,
    spans: &'a [Span],
) -> BoxFuture<'a, Result<BlobRef>> {
    Box::pin(async move {
        let mut parts = Vec::new();
        add_content_parts(storage, &mut parts, spans).await?;
        let schema = if fragment {
            Schema::fragment(size, parts)?
        } else {
            Schema::file(file_name, size, parts)?
        };
        upload_schema(storage, &schema).await
    })
}

fn add_content_parts<'a>(
    storage: &'a dyn Storage,
    dst: &'a mut Vec<ContentPart>,
    spans: &'a [Span],
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        for span in spans {
            if !span.children.is_empty() {
                let children_size: u64 = span.children.iter().map(Span::size).sum();
                let sub =
                    upload_spans_as_file(storage, "", true, children_size, &span.children).await?;
                dst.push(ContentPart::sub_file(sub, children_size));
            }
            if span.from != span.to {
                dst.push(ContentPart::leaf(span.br.clone(), span.to - span.from));
            }
        }
        Ok(())
    })
}
