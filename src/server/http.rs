//! The blob protocol over a storage prefix.
//!
//! - `GET  camli/<ref>` — fetch raw bytes, 404 when absent
//! - `GET  camli/enumerate-blobs?after=&limit=&maxwaitsec=`
//! - `GET/POST camli/stat` with `blob<k>=<ref>` fields
//! - `POST camli/upload` — multipart, fields named by ref
//! - `POST camli/remove` with `blob<k>=<ref>` fields

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::extract::Multipart;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Form;
use axum::Json;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use larch_core::storage::fetch_bytes;
use larch_core::BlobRead;
use larch_core::BlobRef;
use larch_core::Error;
use larch_core::Result;
use larch_core::SizedBlobRef;
use larch_core::Storage;

use super::error_response;

/// Default and maximum page size for enumeration.
const DEFAULT_ENUMERATE_LIMIT: usize = 1000;
const MAX_ENUMERATE_LIMIT: usize = 10_000;

/// Ceiling on `maxwaitsec` long-polls.
const MAX_WAIT: Duration = Duration::from_secs(600);

/// Whole-request body limit for uploads.
const MAX_UPLOAD_BYTES: usize = 32 << 20;

#[derive(Clone)]
struct BlobState {
    storage: Arc<dyn Storage>,
}

/// Blob-protocol routes for one storage, relative to its prefix.
pub fn blob_routes(storage: Arc<dyn Storage>) -> Router {
    Router::new()
        .route("/camli/enumerate-blobs", get(enumerate))
        .route("/camli/stat", get(stat_get).post(stat_post))
        .route("/camli/upload", post(upload))
        .route("/camli/remove", post(remove))
        .route("/camli/:blobref", get(fetch))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(BlobState { storage })
}

fn wire_blob(sb: &SizedBlobRef) -> Value {
    json!({"blobRef": sb.blob_ref.to_string(), "size": sb.size})
}

fn capped_wait(seconds: Option<u64>) -> Duration {
    Duration::from_secs(seconds.unwrap_or(0)).min(MAX_WAIT)
}

/// Pull `blob1..blobN` fields out of a form or query map.
fn refs_from_map(map: &HashMap<String, String>) -> Result<Vec<BlobRef>> {
    let mut refs = Vec::new();
    for n in 1.. {
        let Some(value) = map.get(&format!("blob{n}")) else {
            break;
        };
        let br = BlobRef::parse(value)
            .ok_or_else(|| Error::malformed(format!("bogus blobref for blob{n}: {value:?}")))?;
        refs.push(br);
    }
    Ok(refs)
}

async fn fetch(State(state): State<BlobState>, Path(blobref): Path<String>) -> Response {
    let Some(br) = BlobRef::parse(&blobref) else {
        return error_response(&Error::malformed(format!("invalid blobref {blobref:?}")));
    };
    match fetch_bytes(state.storage.as_ref(), &br).await {
        Ok(data) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct EnumerateQuery {
    #[serde(default)]
    after: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    maxwaitsec: Option<u64>,
}

async fn enumerate(
    State(state): State<BlobState>,
    Query(query): Query<EnumerateQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ENUMERATE_LIMIT)
        .min(MAX_ENUMERATE_LIMIT);
    let wait = capped_wait(query.maxwaitsec);

    let (tx, mut rx) = mpsc::channel(limit.max(1));
    if let Err(e) = state
        .storage
        .enumerate_blobs(tx, &query.after, limit, wait)
        .await
    {
        return error_response(&e);
    }

    let mut blobs = Vec::new();
    while let Some(sb) = rx.recv().await {
        blobs.push(sb);
    }
    let mut body = json!({
        "blobs": blobs.iter().map(wire_blob).collect::<Vec<_>>(),
        "canLongPoll": true,
    });
    if blobs.len() == limit {
        if let (Some(last), Some(obj)) = (blobs.last(), body.as_object_mut()) {
            obj.insert(
                "continueAfter".to_string(),
                Value::String(last.blob_ref.to_string()),
            );
        }
    }
    Json(body).into_response()
}

async fn stat_get(
    state: State<BlobState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    handle_stat(state, params).await
}

async fn stat_post(
    state: State<BlobState>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    handle_stat(state, params).await
}

async fn handle_stat(
    State(state): State<BlobState>,
    params: HashMap<String, String>,
) -> Response {
    let refs = match refs_from_map(&params) {
        Ok(refs) => refs,
        Err(e) => return error_response(&e),
    };
    let wait = capped_wait(params.get("maxwaitsec").and_then(|s| s.parse().ok()));

    let (tx, mut rx) = mpsc::channel(refs.len().max(1));
    if let Err(e) = state.storage.stat(tx, &refs, wait).await {
        return error_response(&e);
    }
    let mut stat = Vec::new();
    while let Some(sb) = rx.recv().await {
        stat.push(wire_blob(&sb));
    }
    Json(json!({"stat": stat, "canLongPoll": true})).into_response()
}

async fn upload(State(state): State<BlobState>, mut multipart: Multipart) -> Response {
    let mut received = Vec::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return error_response(&Error::malformed(format!("bad multipart body: {e}")))
            }
        };
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let Some(br) = BlobRef::parse(&name) else {
            warn!(field = %name, "upload: skipping field not named by a blobref");
            continue;
        };
        let data = match field.bytes().await {
            Ok(data) => data,
            Err(e) => {
                return error_response(&Error::malformed(format!("bad multipart body: {e}")))
            }
        };
        let body: BlobRead = Box::new(std::io::Cursor::new(data));
        match state.storage.receive(&br, body).await {
            Ok(sb) => received.push(wire_blob(&sb)),
            Err(e) => return error_response(&e),
        }
    }
    Json(json!({"received": received})).into_response()
}

async fn remove(
    State(state): State<BlobState>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    let refs = match refs_from_map(&params) {
        Ok(refs) => refs,
        Err(e) => return error_response(&e),
    };
    if let Err(e) = state.storage.remove(&refs).await {
        return error_response(&e);
    }
    Json(json!({
        "removed": refs.iter().map(|br| br.to_string()).collect::<Vec<_>>(),
    }))
    .into_response()
}
