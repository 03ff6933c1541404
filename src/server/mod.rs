//! HTTP surface: the blob protocol and search endpoints.

pub mod http;
pub mod search;

use axum::extract::Request;
use axum::extract::State;
use axum::http::header;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::middleware;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::Json;
use axum::Router;
use base64::Engine;
use serde_json::json;

use larch_core::Error;

use crate::loader::Handler;
use crate::loader::Loader;

/// Build the full router: every storage prefix gets the blob protocol,
/// search handlers get their endpoints, and a configured password wraps
/// everything in the shared-secret check.
pub fn build_app(loader: &Loader, password: Option<String>) -> Router {
    let mut app = Router::new();
    for (prefix, handler) in loader.handlers() {
        let routes = match handler {
            Handler::Storage(storage) => http::blob_routes(storage.clone()),
            Handler::Index { storage, .. } => http::blob_routes(storage.clone()),
            Handler::Search(handler) => search::search_routes(handler.clone()),
        };
        let routes = match &password {
            Some(password) => routes.layer(middleware::from_fn_with_state(
                password.clone(),
                require_auth,
            )),
            None => routes,
        };
        app = if prefix == "/" {
            app.merge(routes)
        } else {
            app.nest(prefix.trim_end_matches('/'), routes)
        };
    }
    app
}

/// Map the error taxonomy onto HTTP statuses with the JSON error body.
pub(crate) fn error_response(err: &Error) -> Response {
    let (status, error_type) = match err {
        Error::NotFound => (StatusCode::NOT_FOUND, "input"),
        Error::Malformed { .. } | Error::MismatchedDigest { .. } => {
            (StatusCode::BAD_REQUEST, "input")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "server"),
    };
    (
        status,
        Json(json!({"error": err.to_string(), "errorType": error_type})),
    )
        .into_response()
}

async fn require_auth(
    State(password): State<String>,
    request: Request,
    next: Next,
) -> Response {
    if password_ok(request.headers(), &password) {
        return next.run(request).await;
    }
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"larch\"")],
        Json(json!({"error": "authentication required", "errorType": "input"})),
    )
        .into_response()
}

/// The shared secret rides in basic auth; the user part is ignored.
fn password_ok(headers: &HeaderMap, password: &str) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(userpass) = String::from_utf8(decoded) else {
        return false;
    };
    match userpass.split_once(':') {
        Some((_user, pass)) => pass == password,
        None => false,
    }
}
