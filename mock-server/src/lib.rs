use std::{collections::BTreeMap, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::RwLock};

/// Largest body `/bytes/{n}` will generate.
pub const MAX_GENERATED_BYTES: usize = 16 * 1024 * 1024;

/// A request body the server received on `/echo`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    pub method: String,
    pub bytes: usize,
    pub content_type: Option<String>,
}

pub type Uploads = Arc<RwLock<Vec<Upload>>>;

pub fn app() -> Router {
    let uploads: Uploads = Arc::new(RwLock::new(Vec::new()));
    Router::new()
        .route("/bytes/{n}", get(bytes))
        .route("/echo", post(echo).put(echo))
        .route("/uploads", get(list_uploads))
        .route("/status/{code}", get(status))
        .route("/slow/{ms}", get(slow))
        .route("/headers", get(headers))
        .route("/redirect/{n}", get(redirect))
        .with_state(uploads)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

/// The deterministic body served by `/bytes/{n}`: `a..z` repeated.
pub fn pattern(n: usize) -> Vec<u8> {
    (0..n).map(|i| b'a' + (i % 26) as u8).collect()
}

async fn bytes(Path(n): Path<usize>) -> Result<Response, StatusCode> {
    if n > MAX_GENERATED_BYTES {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], pattern(n)).into_response())
}

async fn echo(
    State(uploads): State<Uploads>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    uploads.write().await.push(Upload {
        method: method.to_string(),
        bytes: body.len(),
        content_type: content_type.clone(),
    });
    let content_type = content_type.unwrap_or_else(|| "application/octet-stream".to_string());
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

async fn list_uploads(State(uploads): State<Uploads>) -> Json<Vec<Upload>> {
    Json(uploads.read().await.clone())
}

async fn status(Path(code): Path<u16>) -> Result<(StatusCode, String), StatusCode> {
    let status = StatusCode::from_u16(code).map_err(|_| StatusCode::BAD_REQUEST)?;
    Ok((status, format!("status {code}")))
}

async fn slow(Path(ms): Path<u64>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    "done"
}

async fn headers(headers: HeaderMap) -> Json<BTreeMap<String, String>> {
    Json(
        headers
            .iter()
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
            .collect(),
    )
}

async fn redirect(Path(n): Path<u32>) -> Response {
    let location = match n {
        0 => "/bytes/8".to_string(),
        n => format!("/redirect/{}", n - 1),
    };
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}
