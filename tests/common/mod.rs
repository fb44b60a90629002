//! In-process stand-ins for a buffer server and the database.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use cellstore::{
    transformation_cache::{ExecutionOutput, ExecutionRequest, Executor, TransformationError},
    Buffer, Checksum,
};
use futures_lite::future::Boxed;
use parking_lot::Mutex;
use serde_json::{json, Value as Json};
use url::Url;

pub fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

async fn serve(app: Router) -> anyhow::Result<Url> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr: SocketAddr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, app).await });
    Ok(format!("http://{addr}/").parse()?)
}

/// A buffer server: `GET /has`, `GET /<hex>` and `PUT /<hex>`.
#[derive(Debug, Clone, Default)]
pub struct BufferServer {
    buffers: Arc<Mutex<HashMap<String, Bytes>>>,
    puts: Arc<AtomicUsize>,
}

impl BufferServer {
    pub async fn spawn(&self) -> anyhow::Result<Url> {
        let app = Router::new()
            .route("/has", get(has))
            .route("/{hex}", get(get_buffer).put(put_buffer))
            .with_state(self.clone());
        serve(app).await
    }

    pub fn insert(&self, data: impl Into<Bytes>) -> Checksum {
        let data = data.into();
        let checksum = Checksum::new(&data);
        self.buffers.lock().insert(checksum.to_hex(), data);
        checksum
    }

    /// Stores `data` under the checksum of something else.
    pub fn insert_corrupt(&self, checksum: &Checksum, data: impl Into<Bytes>) {
        self.buffers.lock().insert(checksum.to_hex(), data.into());
    }

    pub fn contains(&self, checksum: &Checksum) -> bool {
        self.buffers.lock().contains_key(&checksum.to_hex())
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

async fn has(State(server): State<BufferServer>, body: String) -> Response {
    let Ok(hexes) = serde_json::from_str::<Vec<String>>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let buffers = server.buffers.lock();
    let answer: Vec<bool> = hexes.iter().map(|hex| buffers.contains_key(hex)).collect();
    axum::Json(answer).into_response()
}

async fn get_buffer(State(server): State<BufferServer>, Path(hex): Path<String>) -> Response {
    match server.buffers.lock().get(&hex) {
        Some(data) => data.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn put_buffer(
    State(server): State<BufferServer>,
    Path(hex): Path<String>,
    body: Bytes,
) -> StatusCode {
    if Checksum::new(&body).to_hex() != hex {
        return StatusCode::BAD_REQUEST;
    }
    server.puts.fetch_add(1, Ordering::SeqCst);
    server.buffers.lock().insert(hex, body);
    StatusCode::OK
}

/// The database: `GET` and `PUT` of JSON requests on `/`.
///
/// Records are keyed by the request without its `value`.
#[derive(Debug, Clone, Default)]
pub struct DatabaseServer {
    records: Arc<Mutex<HashMap<String, Json>>>,
    contests: Arc<Mutex<Vec<Json>>>,
    refuse_contests: Arc<Mutex<bool>>,
}

impl DatabaseServer {
    pub async fn spawn(&self) -> anyhow::Result<Url> {
        let app = Router::new()
            .route("/", get(db_get).put(db_put))
            .with_state(self.clone());
        serve(app).await
    }

    fn key(request: &Json) -> String {
        let mut request = request.clone();
        if let Some(map) = request.as_object_mut() {
            map.remove("value");
        }
        request.to_string()
    }

    /// Seeds a record, as if some other client had stored it.
    pub fn insert(&self, request: Json, value: Json) {
        self.records.lock().insert(Self::key(&request), value);
    }

    pub fn get(&self, request: Json) -> Option<Json> {
        self.records.lock().get(&Self::key(&request)).cloned()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.records
            .lock()
            .keys()
            .filter(|key| {
                serde_json::from_str::<Json>(key).is_ok_and(|request| request["type"] == kind)
            })
            .count()
    }

    pub fn contests(&self) -> Vec<Json> {
        self.contests.lock().clone()
    }

    pub fn refuse_contests(&self, refuse: bool) {
        *self.refuse_contests.lock() = refuse;
    }
}

async fn db_get(State(db): State<DatabaseServer>, body: String) -> Response {
    let Ok(request) = serde_json::from_str::<Json>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if request["type"] == "protocol" {
        return axum::Json(json!(["seamless", "database", "0.3"])).into_response();
    }
    match db.get(request) {
        Some(Json::String(text)) => text.into_response(),
        Some(value) => value.to_string().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn db_put(State(db): State<DatabaseServer>, body: String) -> Response {
    let Ok(request) = serde_json::from_str::<Json>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if request["type"] == "contest" {
        db.contests.lock().push(request.clone());
        if *db.refuse_contests.lock() {
            return (StatusCode::BAD_REQUEST, "Result confirmed by others").into_response();
        }
        let transformation = json!({"type": "transformation", "checksum": request["checksum"]});
        db.records.lock().remove(&DatabaseServer::key(&transformation));
        return "Result withdrawn".into_response();
    }
    let value = request.get("value").cloned().unwrap_or(Json::Null);
    db.records.lock().insert(DatabaseServer::key(&request), value);
    StatusCode::OK.into_response()
}

/// Adds one to the plain number of pin `a`.
#[derive(Debug, Default)]
pub struct Increment {
    runs: AtomicUsize,
}

impl Increment {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Executor for Increment {
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Boxed<Result<ExecutionOutput, TransformationError>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let failed = |msg: &str| TransformationError::Failed(msg.to_string());
            let input = request.transformation.pins["a"]
                .checksum
                .ok_or_else(|| failed("no input"))?;
            let buffer = request
                .buffers
                .get(&input, true)
                .await
                .ok_or_else(|| failed("missing input"))?;
            let n: i64 = serde_json::from_slice(&buffer).map_err(|_| failed("not a number"))?;
            let out = Buffer::new(format!("{}\n", n + 1));
            let result = out.checksum();
            request.buffers.cache(&result, out).await;
            Ok(ExecutionOutput {
                result: Some(result),
                logs: format!("{n} + 1\n"),
                metadata: Some(json!({"Executor": "increment"})),
            })
        })
    }
}
