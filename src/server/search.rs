//! Search and describe endpoints over an index.
//!
//! Response shapes follow the `error`/`errorType` convention: lookup
//! problems are reported inside the JSON body rather than as transport
//! errors.

use std::sync::Arc;

use axum::extract::Query;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::Json;
use axum::Router;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use larch_core::BlobRef;
use larch_index::permanode_attrs;
use larch_index::Index;
use larch_index::CAMLI_TYPE_MIME_PREFIX;
use larch_schema::model::format_claim_date;

/// Number of results served by the recent-permanodes endpoint.
const RECENT_LIMIT: usize = 50;

/// Describe depth for the describe endpoint; recent uses a shallower
/// pass per result.
const DESCRIBE_DEPTH: usize = 4;
const RECENT_DESCRIBE_DEPTH: usize = 2;

/// Serves search queries for one owner over one index.
pub struct SearchHandler {
    index: Arc<dyn Index>,
    owner: BlobRef,
}

pub fn search_routes(handler: Arc<SearchHandler>) -> Router {
    Router::new()
        .route("/camli/search", get(recent))
        .route("/camli/search/recent", get(recent))
        .route("/camli/search/claims", get(claims))
        .route("/camli/search/files", get(files))
        .route("/camli/search/describe", get(describe))
        .with_state(handler)
}

impl SearchHandler {
    pub fn new(index: Arc<dyn Index>, owner: BlobRef) -> SearchHandler {
        SearchHandler { index, owner }
    }

    /// Describe a blob into `out` under its ref string, recursing into a
    /// permanode's content and members up to `depth`.
    fn describe<'a>(
        &'a self,
        out: &'a mut Map<String, Value>,
        br: &'a BlobRef,
        depth: usize,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let key = br.to_string();
            if depth == 0 || out.contains_key(&key) {
                return;
            }
            let (mime, size) = match self.index.get_blob_mime_type(br).await {
                Ok(found) => found,
                Err(_) => return,
            };

            let mut entry = Map::new();
            entry.insert("type".to_string(), json!(mime));
            entry.insert("size".to_string(), json!(size));
            let camli_type = mime.strip_prefix(CAMLI_TYPE_MIME_PREFIX).map(str::to_string);
            if let Some(kind) = &camli_type {
                entry.insert("camliType".to_string(), json!(kind));
            }
            out.insert(key.clone(), Value::Object(entry));

            match camli_type.as_deref() {
                Some("permanode") => {
                    let claims = match self.index.get_owner_claims(br, &self.owner).await {
                        Ok(claims) => claims,
                        Err(e) => {
                            warn!(permanode = %br, error = %e, "error getting claims");
                            return;
                        }
                    };
                    let attrs = permanode_attrs(&claims);

                    // Content and members get described one level deeper.
                    let mut more = Vec::new();
                    if let Some(content) = attrs.get("camliContent").and_then(|v| v.last()) {
                        if let Some(cbr) = BlobRef::parse(content) {
                            more.push(cbr);
                        }
                    }
                    for member in attrs.get("camliMember").into_iter().flatten() {
                        if let Some(mbr) = BlobRef::parse(member) {
                            more.push(mbr);
                        }
                    }

                    let attrs_json: Map<String, Value> = attrs
                        .into_iter()
                        .map(|(attr, values)| (attr, json!(values)))
                        .collect();
                    if let Some(Value::Object(entry)) = out.get_mut(&key) {
                        entry.insert(
                            "permanode".to_string(),
                            json!({"attr": Value::Object(attrs_json)}),
                        );
                    }

                    for sub in more {
                        self.describe(out, &sub, depth - 1).await;
                    }
                }
                Some("file") => {
                    if let Ok(info) = self.index.get_file_info(br).await {
                        if let Some(Value::Object(entry)) = out.get_mut(&key) {
                            entry.insert(
                                "file".to_string(),
                                json!({
                                    "size": info.size,
                                    "fileName": info.file_name,
                                    "mimeType": info.mime_type,
                                }),
                            );
                        }
                    }
                }
                _ => {}
            }
        })
    }
}

fn input_error(msg: &str) -> Response {
    Json(json!({"error": msg, "errorType": "input"})).into_response()
}

fn server_error(err: &larch_core::Error) -> Response {
    Json(json!({"error": err.to_string(), "errorType": "server"})).into_response()
}

async fn recent(State(handler): State<Arc<SearchHandler>>) -> Response {
    let (tx, mut rx) = mpsc::channel(RECENT_LIMIT);
    if let Err(e) = handler
        .index
        .get_recent_permanodes(tx, std::slice::from_ref(&handler.owner), RECENT_LIMIT)
        .await
    {
        return server_error(&e);
    }

    let mut ret = Map::new();
    let mut recent = Vec::new();
    let mut permanodes = Vec::new();
    while let Some(result) = rx.recv().await {
        recent.push(json!({
            "blobref": result.permanode.to_string(),
            "owner": result.signer.to_string(),
            "modtime": result.last_mod.to_rfc3339(),
        }));
        permanodes.push(result.permanode);
    }
    for permanode in &permanodes {
        handler.describe(&mut ret, permanode, RECENT_DESCRIBE_DEPTH).await;
    }
    ret.insert("recent".to_string(), Value::Array(recent));
    Json(Value::Object(ret)).into_response()
}

#[derive(Deserialize)]
struct ClaimsQuery {
    #[serde(default)]
    permanode: String,
}

async fn claims(
    State(handler): State<Arc<SearchHandler>>,
    Query(query): Query<ClaimsQuery>,
) -> Response {
    let Some(permanode) = BlobRef::parse(&query.permanode) else {
        return input_error("Missing or invalid 'permanode' param");
    };
    let claims = match handler.index.get_owner_claims(&permanode, &handler.owner).await {
        Ok(claims) => claims,
        Err(e) => return server_error(&e),
    };

    let claims: Vec<Value> = claims
        .iter()
        .map(|claim| {
            let mut entry = Map::new();
            entry.insert("blobref".to_string(), json!(claim.blob_ref.to_string()));
            entry.insert("signer".to_string(), json!(claim.signer.to_string()));
            entry.insert("permanode".to_string(), json!(claim.permanode.to_string()));
            entry.insert("date".to_string(), json!(format_claim_date(&claim.date)));
            entry.insert("type".to_string(), json!(claim.claim_type.to_string()));
            if !claim.attr.is_empty() {
                entry.insert("attr".to_string(), json!(claim.attr));
            }
            if !claim.value.is_empty() {
                entry.insert("value".to_string(), json!(claim.value));
            }
            Value::Object(entry)
        })
        .collect();
    Json(json!({"claims": claims})).into_response()
}

#[derive(Deserialize)]
struct FilesQuery {
    #[serde(default)]
    bytesref: String,
}

async fn files(
    State(handler): State<Arc<SearchHandler>>,
    Query(query): Query<FilesQuery>,
) -> Response {
    let Some(bytes_ref) = BlobRef::parse(&query.bytesref) else {
        return input_error("Missing or invalid 'bytesref' param");
    };
    match handler.index.existing_file_schemas(&bytes_ref).await {
        Ok(files) => {
            let files: Vec<String> = files.iter().map(|br| br.to_string()).collect();
            Json(json!({"files": files})).into_response()
        }
        Err(e) => server_error(&e),
    }
}

#[derive(Deserialize)]
struct DescribeQuery {
    #[serde(default)]
    blobref: String,
}

async fn describe(
    State(handler): State<Arc<SearchHandler>>,
    Query(query): Query<DescribeQuery>,
) -> Response {
    let Some(br) = BlobRef::parse(&query.blobref) else {
        return input_error("Missing or invalid 'blobref' param");
    };
    let mut ret = Map::new();
    handler.describe(&mut ret, &br, DESCRIBE_DEPTH).await;
    Json(Value::Object(ret)).into_response()
}
