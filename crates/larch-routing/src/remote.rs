//! Remote storage over the HTTP blob protocol.
//!
//! Speaks the wire protocol a blob-server prefix handler serves —
//! `camli/<ref>` fetches, `camli/stat`, `camli/upload` (multipart),
//! `camli/enumerate-blobs`, `camli/remove` — making another server
//! usable as a storage backend. Authentication is the shared secret,
//! sent as HTTP basic auth.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use larch_core::storage::read_all_verified;
use larch_core::BlobHub;
use larch_core::BlobRead;
use larch_core::BlobReadSeek;
use larch_core::BlobRef;
use larch_core::Error;
use larch_core::Result;
use larch_core::SizedBlobRef;
use larch_core::Storage;

#[derive(Debug, Deserialize)]
struct WireBlob {
    #[serde(rename = "blobRef")]
    blob_ref: String,
    size: u64,
}

impl WireBlob {
    fn sized(&self) -> Option<SizedBlobRef> {
        BlobRef::parse(&self.blob_ref).map(|br| SizedBlobRef::new(br, self.size))
    }
}

#[derive(Debug, Deserialize)]
struct StatResponse {
    #[serde(default)]
    stat: Vec<WireBlob>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    received: Vec<WireBlob>,
}

#[derive(Debug, Deserialize)]
struct EnumerateResponse {
    #[serde(default)]
    blobs: Vec<WireBlob>,
    #[serde(rename = "continueAfter", default)]
    continue_after: Option<String>,
}

/// Blob storage backed by another blob server over HTTP.
pub struct RemoteStorage {
    base_url: String,
    password: Option<String>,
    client: reqwest::Client,
    hub: BlobHub,
}

impl RemoteStorage {
    /// `base_url` is the server prefix, e.g. `http://host:3179/bs`.
    pub fn new(base_url: impl Into<String>, password: Option<String>) -> RemoteStorage {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        RemoteStorage {
            base_url,
            password,
            client: reqwest::Client::new(),
            hub: BlobHub::new(),
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/camli/{suffix}", self.base_url)
    }

    fn authed(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.password {
            Some(password) => rb.basic_auth("", Some(password)),
            None => rb,
        }
    }

    async fn send(&self, rb: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = self
            .authed(rb)
            .send()
            .await
            .map_err(|e| Error::transient(format!("remote request failed: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound);
        }
        if !resp.status().is_success() {
            return Err(Error::transient(format!(
                "remote returned HTTP {}",
                resp.status()
            )));
        }
        Ok(resp)
    }

    /// Form fields `blob1..blobN` plus the protocol version.
    fn blob_form(refs: &[BlobRef], wait: Duration) -> Vec<(String, String)> {
        let mut form = vec![("camliversion".to_string(), "1".to_string())];
        if !wait.is_zero() {
            form.push(("maxwaitsec".to_string(), wait.as_secs().to_string()));
        }
        for (i, br) in refs.iter().enumerate() {
            form.push((format!("blob{}", i + 1), br.to_string()));
        }
        form
    }
}

#[async_trait]
impl Storage for RemoteStorage {
    async fn receive(&self, expected: &BlobRef, body: BlobRead) -> Result<SizedBlobRef> {
        let data = read_all_verified(expected, body).await?;
        let size = data.len() as u64;

        let part = reqwest::multipart::Part::bytes(data.to_vec()).file_name(expected.to_string());
        let form = reqwest::multipart::Form::new().part(expected.to_string(), part);
        let resp = self
            .send(self.client.post(self.url("upload")).multipart(form))
            .await?;
        let parsed: UploadResponse = resp
            .json()
            .await
            .map_err(|e| Error::transient(format!("bad upload response: {e}")))?;

        let acked = parsed
            .received
            .iter()
            .filter_map(WireBlob::sized)
            .find(|sb| &sb.blob_ref == expected)
            .ok_or_else(|| Error::transient(format!("remote did not ack {expected}")))?;
        if acked.size != size {
            return Err(Error::transient(format!(
                "remote ack'd {} bytes for {expected}, wrote {size}",
                acked.size
            )));
        }
        debug!(blob = %expected, size, "remote: blob uploaded");
        self.hub.notify(expected);
        Ok(acked)
    }

    async fn fetch_streaming(&self, br: &BlobRef) -> Result<(BlobRead, u64)> {
        let (body, size) = self.fetch(br).await?;
        Ok((Box::new(body), size))
    }

    fn fetch_supported(&self) -> bool {
        // Fetches buffer the response body, which is trivially seekable.
        true
    }

    async fn fetch(&self, br: &BlobRef) -> Result<(BlobReadSeek, u64)> {
        let resp = self.send(self.client.get(self.url(&br.to_string()))).await?;
        let data = resp
            .bytes()
            .await
            .map_err(|e| Error::transient(format!("remote body read failed: {e}")))?;
        let size = data.len() as u64;
        Ok((Box::new(std::io::Cursor::new(data)), size))
    }

    async fn stat(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        refs: &[BlobRef],
        wait: Duration,
    ) -> Result<()> {
        if refs.is_empty() {
            return Ok(());
        }
        let form = Self::blob_form(refs, wait);
        let resp = self.send(self.client.post(self.url("stat")).form(&form)).await?;
        let parsed: StatResponse = resp
            .json()
            .await
            .map_err(|e| Error::transient(format!("bad stat response: {e}")))?;
        for sb in parsed.stat.iter().filter_map(WireBlob::sized) {
            if dest.send(sb).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn enumerate_blobs(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        after: &str,
        limit: usize,
        wait: Duration,
    ) -> Result<()> {
        let mut after = after.to_string();
        let mut remain = limit;
        let mut wait = wait;
        while remain > 0 {
            let mut query = vec![
                ("after".to_string(), after.clone()),
                ("limit".to_string(), remain.to_string()),
            ];
            if !wait.is_zero() {
                query.push(("maxwaitsec".to_string(), wait.as_secs().to_string()));
                // Only the first page long-polls.
                wait = Duration::ZERO;
            }
            let resp = self
                .send(self.client.get(self.url("enumerate-blobs")).query(&query))
                .await?;
            let parsed: EnumerateResponse = resp
                .json()
                .await
                .map_err(|e| Error::transient(format!("bad enumerate response: {e}")))?;

            for sb in parsed.blobs.iter().filter_map(WireBlob::sized) {
                if remain == 0 {
                    break;
                }
                after = sb.blob_ref.to_string();
                remain -= 1;
                if dest.send(sb).await.is_err() {
                    return Ok(());
                }
            }
            match parsed.continue_after {
                Some(next) if remain > 0 => after = next,
                _ => break,
            }
        }
        Ok(())
    }

    async fn remove(&self, refs: &[BlobRef]) -> Result<()> {
        if refs.is_empty() {
            return Ok(());
        }
        let form = Self::blob_form(refs, Duration::ZERO);
        self.send(self.client.post(self.url("remove")).form(&form)).await?;
        Ok(())
    }

    fn hub(&self) -> &BlobHub {
        &self.hub
    }
}
