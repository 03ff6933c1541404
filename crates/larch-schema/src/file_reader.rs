//! Seekable streaming over a file's content-part DAG.
//!
//! A [`FileReader`] walks the content parts of a "file" schema blob in
//! order, fetching leaf chunks and recursing into sub-file fragments as
//! the cursor crosses them. The last-used leaf reader and sub-reader are
//! cached, so sequential reads over a chunk issue one fetch.
//!
//! The reader is single-owner: it is not safe to share across tasks.

use std::io::SeekFrom;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;

use larch_core::BlobRef;
use larch_core::BlobReadSeek;
use larch_core::Error;
use larch_core::Result;
use larch_core::SeekFetcher;

use crate::model::ContentPart;
use crate::model::Schema;
use crate::model::SchemaKind;

struct LeafReader {
    br: BlobRef,
    reader: BlobReadSeek,
    pos: u64,
}

struct SubReader {
    part_index: usize,
    reader: Box<FileReader>,
}

/// Streaming reader reconstructing a file's bytes from its schema blob.
pub struct FileReader {
    fetcher: Arc<dyn SeekFetcher>,
    size: u64,
    parts: Vec<ContentPart>,
    /// Index into `parts`.
    ci: usize,
    /// Bytes already consumed from the current part.
    ccon: u64,
    /// Declared size minus bytes returned; negative means the parts
    /// overflow the declared size.
    remain: i64,
    closed: bool,
    leaf: Option<LeafReader>,
    sub: Option<SubReader>,
}

impl std::fmt::Debug for FileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReader")
            .field("size", &self.size)
            .field("parts", &self.parts)
            .field("ci", &self.ci)
            .field("ccon", &self.ccon)
            .field("remain", &self.remain)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl FileReader {
    /// Fetch and decode `file_ref`, which must be a "file" schema blob.
    pub async fn new(fetcher: Arc<dyn SeekFetcher>, file_ref: &BlobRef) -> Result<FileReader> {
        let (mut r, _size) = fetcher.fetch(file_ref).await?;
        let mut data = Vec::new();
        r.read_to_end(&mut data).await?;
        let schema = Schema::parse_bytes(&data)?;
        FileReader::from_schema(fetcher, &schema)
    }

    /// Reader over an already-decoded file schema.
    pub fn from_schema(fetcher: Arc<dyn SeekFetcher>, schema: &Schema) -> Result<FileReader> {
        let SchemaKind::File(file) = &schema.kind else {
            return Err(Error::malformed(format!(
                "expected \"file\" schema blob, got {:?}",
                schema.kind_name()
            )));
        };
        Ok(FileReader {
            fetcher,
            size: file.size,
            parts: file.content_parts.clone(),
            ci: 0,
            ccon: 0,
            remain: file.size as i64,
            closed: false,
            leaf: None,
            sub: None,
        })
    }

    /// Declared size of the file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read up to `buf.len()` bytes at the cursor. `Ok(0)` signals end of
    /// stream (given a non-empty `buf`).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_inner(buf).await
    }

    /// Advance the cursor without fetching, returning how many bytes were
    /// actually skipped (less than `n` if the stream is shorter).
    pub fn skip(&mut self, n: u64) -> u64 {
        if self.closed {
            return 0;
        }
        let wanted = n;
        let mut n = n;
        while n > 0 && self.ci < self.parts.len() {
            let part_size = self.parts[self.ci].size;
            let to_skip = n.min(part_size - self.ccon);
            self.ccon += to_skip;
            self.remain -= to_skip as i64;
            n -= to_skip;
            if self.ccon == part_size {
                self.ci += 1;
                self.ccon = 0;
            }
        }
        // Cached readers no longer line up with the cursor.
        self.leaf = None;
        self.sub = None;
        wanted - n
    }

    /// Release cached readers and mark the reader closed. Further
    /// operations fail with `Closed`.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.leaf = None;
        self.sub = None;
        self.closed = true;
        Ok(())
    }

    /// Drain the remainder of the stream into a vec.
    pub async fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    fn read_inner<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            if self.closed {
                return Err(Error::Closed);
            }
            if buf.is_empty() {
                return Ok(0);
            }

            // Advance past finished (or empty) parts.
            loop {
                if self.ci >= self.parts.len() {
                    self.leaf = None;
                    self.sub = None;
                    if self.remain > 0 {
                        // Declared size larger than the sum of parts.
                        return Err(Error::SizeMismatch);
                    }
                    return Ok(0);
                }
                if self.ccon == self.parts[self.ci].size {
                    self.ci += 1;
                    self.ccon = 0;
                    continue;
                }
                break;
            }

            let part = self.parts[self.ci].clone();
            if part.blob_ref.is_some() && part.sub_file_blob_ref.is_some() {
                return Err(Error::malformed(format!(
                    "content part {} has both blobRef and subFileBlobRef",
                    self.ci
                )));
            }

            let readable = ((part.size - self.ccon).min(buf.len() as u64)) as usize;
            let n = if let Some(sub_ref) = &part.sub_file_blob_ref {
                let sub = self.sub_reader(sub_ref, part.offset).await?;
                sub.read(&mut buf[..readable]).await?
            } else if let Some(leaf_ref) = &part.blob_ref {
                let want_pos = part.offset + self.ccon;
                let leaf = self.leaf_reader(leaf_ref, want_pos).await?;
                let n = leaf.reader.read(&mut buf[..readable]).await?;
                leaf.pos += n as u64;
                n
            } else {
                // Neither ref set: a zero-filled span.
                buf[..readable].fill(0);
                readable
            };

            if n == 0 && readable > 0 {
                return Err(Error::malformed(format!(
                    "content part {} ended {} bytes early",
                    self.ci,
                    part.size - self.ccon
                )));
            }
            self.ccon += n as u64;
            self.remain -= n as i64;
            if self.remain < 0 {
                // Content parts sum to more than the declared size.
                return Err(Error::SizeMismatch);
            }
            Ok(n)
        })
    }

    /// Cached or fresh sub-file reader for the current part, positioned
    /// at the part's offset plus whatever was already consumed.
    async fn sub_reader(&mut self, sub_ref: &BlobRef, offset: u64) -> Result<&mut FileReader> {
        let cached = matches!(&self.sub, Some(s) if s.part_index == self.ci);
        if !cached {
            let mut sub = FileReader::new(self.fetcher.clone(), sub_ref).await?;
            sub.skip(offset + self.ccon);
            self.sub = Some(SubReader {
                part_index: self.ci,
                reader: Box::new(sub),
            });
        }
        match self.sub.as_mut() {
            Some(s) => Ok(&mut s.reader),
            None => unreachable!(),
        }
    }

    /// Cached or fresh leaf chunk reader, seeked to `pos`.
    async fn leaf_reader(&mut self, leaf_ref: &BlobRef, pos: u64) -> Result<&mut LeafReader> {
        let cached = matches!(&self.leaf, Some(l) if &l.br == leaf_ref);
        if !cached {
            let (reader, _size) = self.fetcher.fetch(leaf_ref).await?;
            self.leaf = Some(LeafReader {
                br: leaf_ref.clone(),
                reader,
                pos: 0,
            });
        }
        let Some(leaf) = self.leaf.as_mut() else {
            unreachable!()
        };
        if leaf.pos != pos {
            leaf.reader.seek(SeekFrom::Start(pos)).await?;
            leaf.pos = pos;
        }
        Ok(leaf)
    }
}
