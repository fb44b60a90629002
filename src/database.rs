//! Client for the provenance database.
//!
//! The database is a single HTTP endpoint. Every request is a JSON document with a `type`
//! field naming the relation and a `checksum` field naming the key; `GET` reads a relation
//! and `PUT` writes one. An inactive client turns every call into a silent no-op.

use std::{sync::Arc, time::Duration};

use backon::{BackoffBuilder, ExponentialBuilder};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tracing::{debug, warn};
use url::Url;

use crate::{
    buffer_info::BufferInfo,
    celltype::Celltype,
    checksum::Checksum,
    deep_structure::{HashPattern, PathItem},
    expression::Expression,
    serialize::json_dumps,
};

/// Protocol versions this client understands.
pub const PROTOCOLS: &[[&str; 3]] = &[["seamless", "database", "0.3"]];

/// Error talking to the database.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DatabaseError {
    #[error("Cannot connect to the database at {0}")]
    Connect(Url),
    #[error("Incorrect database protocol")]
    Protocol,
    #[error("Database request failed with status {status}: {text}")]
    Status { status: u16, text: String },
    #[error("Database request failed: {0}")]
    Http(String),
    #[error("Malformed database response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for DatabaseError {
    fn from(value: reqwest::Error) -> Self {
        // keep the error Clone
        Self::Http(value.to_string())
    }
}

/// Key of the syntactic-to-semantic relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SemKey {
    pub checksum: Checksum,
    pub celltype: Celltype,
    pub subcelltype: Option<String>,
}

impl SemKey {
    pub fn new(checksum: Checksum, celltype: Celltype, subcelltype: Option<&str>) -> Self {
        Self {
            checksum,
            celltype,
            subcelltype: subcelltype.map(ToString::to_string),
        }
    }
}

/// Response to a `contest` request. A 200 status means the result was withdrawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContestResponse {
    pub status: u16,
    pub text: String,
}

/// An expression as stored in the `rev_expression` relation.
#[derive(Debug, Clone, Deserialize)]
struct RevExpression {
    checksum: Checksum,
    celltype: Celltype,
    #[serde(default)]
    path: Vec<PathItem>,
    target_celltype: Celltype,
    #[serde(default)]
    target_subcelltype: Option<String>,
    #[serde(default)]
    hash_pattern: Option<HashPattern>,
    #[serde(default)]
    target_hash_pattern: Option<HashPattern>,
    result: Checksum,
}

/// Database client. Clones share the connection.
#[derive(Debug, Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    http_client: reqwest::Client,
    url: RwLock<Option<Url>>,
}

impl Default for Database {
    fn default() -> Self {
        Self::inactive()
    }
}

impl Database {
    /// A client that is not connected to anything.
    pub fn inactive() -> Self {
        Self {
            inner: Arc::new(Inner {
                http_client: reqwest::Client::new(),
                url: RwLock::new(None),
            }),
        }
    }

    /// Connects to the database at `url`, checking the protocol version.
    ///
    /// Connection failures are retried up to `trials` times.
    pub async fn connect(url: Url, trials: usize) -> Result<Self, DatabaseError> {
        let db = Self::inactive();
        db.do_connect(url, trials).await?;
        Ok(db)
    }

    async fn do_connect(&self, url: Url, trials: usize) -> Result<(), DatabaseError> {
        let mut backoff = ExponentialBuilder::new()
            .with_min_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_secs(1))
            .with_max_times(trials.saturating_sub(1))
            .build();
        loop {
            let response = self
                .inner
                .http_client
                .get(url.clone())
                .body(json!({"type": "protocol"}).to_string())
                .send()
                .await;
            match response {
                Ok(response) => {
                    if response.status() != reqwest::StatusCode::OK {
                        return Err(DatabaseError::Status {
                            status: response.status().as_u16(),
                            text: response.text().await.unwrap_or_default(),
                        });
                    }
                    let protocol: Vec<String> = response
                        .json()
                        .await
                        .map_err(|_| DatabaseError::Protocol)?;
                    if !PROTOCOLS.iter().any(|p| p.as_slice() == protocol.as_slice()) {
                        return Err(DatabaseError::Protocol);
                    }
                    debug!(%url, "connected to database");
                    *self.inner.url.write() = Some(url);
                    return Ok(());
                }
                Err(err) if err.is_connect() || err.is_timeout() => {
                    let Some(delay) = backoff.next() else {
                        warn!(%url, "giving up on database connection");
                        return Err(DatabaseError::Connect(url));
                    };
                    debug!(%url, ?delay, "database not reachable, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.url.read().is_some()
    }

    pub fn url(&self) -> Option<Url> {
        self.inner.url.read().clone()
    }

    async fn put(&self, request: Json) -> Result<(), DatabaseError> {
        let Some(response) = self.put_raw(&request).await? else {
            return Ok(());
        };
        if response.status != 200 {
            return Err(DatabaseError::Status {
                status: response.status,
                text: response.text,
            });
        }
        Ok(())
    }

    async fn put_raw(&self, request: &Json) -> Result<Option<ContestResponse>, DatabaseError> {
        let Some(url) = self.url() else {
            return Ok(None);
        };
        let response = self
            .inner
            .http_client
            .put(url)
            .body(request.to_string())
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        Ok(Some(ContestResponse { status, text }))
    }

    /// Sends a `GET` request. `None` for an inactive client or an unknown key.
    async fn get(&self, request: Json) -> Result<Option<bytes::Bytes>, DatabaseError> {
        let Some(url) = self.url() else {
            return Ok(None);
        };
        let response = self
            .inner
            .http_client
            .get(url)
            .body(request.to_string())
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.as_u16() >= 400 {
            return Err(DatabaseError::Status {
                status: status.as_u16(),
                text: response.text().await.unwrap_or_default(),
            });
        }
        Ok(Some(response.bytes().await?))
    }

    async fn get_checksum(&self, request: Json) -> Result<Option<Checksum>, DatabaseError> {
        let kind = request["type"].clone();
        let key = request["checksum"].clone();
        let Some(body) = self.get(request).await? else {
            return Ok(None);
        };
        let text = std::str::from_utf8(&body)
            .map_err(|_| DatabaseError::Malformed("checksum is not UTF-8".into()))?;
        let checksum = text
            .trim()
            .parse()
            .map_err(|_| DatabaseError::Malformed(truncated(text)))?;
        debug!("GET {} {}", kind, key);
        Ok(Some(checksum))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        request: Json,
    ) -> Result<Option<T>, DatabaseError> {
        let kind = request["type"].clone();
        let key = request["checksum"].clone();
        let Some(body) = self.get(request).await? else {
            return Ok(None);
        };
        debug!("GET {} {}", kind, key);
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|_| DatabaseError::Malformed(truncated(&String::from_utf8_lossy(&body))))
    }

    pub async fn set_transformation_result(
        &self,
        tf_checksum: &Checksum,
        result: &Checksum,
    ) -> Result<(), DatabaseError> {
        debug!("SET transformation {tf_checksum}");
        self.put(json!({"type": "transformation", "checksum": tf_checksum, "value": result}))
            .await
    }

    pub async fn get_transformation_result(
        &self,
        tf_checksum: &Checksum,
    ) -> Result<Option<Checksum>, DatabaseError> {
        self.get_checksum(json!({"type": "transformation", "checksum": tf_checksum}))
            .await
    }

    pub async fn set_elision_result(
        &self,
        elision_checksum: &Checksum,
        result: &Checksum,
    ) -> Result<(), DatabaseError> {
        debug!("SET elision {elision_checksum}");
        self.put(json!({"type": "elision", "checksum": elision_checksum, "value": result}))
            .await
    }

    pub async fn get_elision_result(
        &self,
        elision_checksum: &Checksum,
    ) -> Result<Option<Checksum>, DatabaseError> {
        self.get_checksum(json!({"type": "elision", "checksum": elision_checksum}))
            .await
    }

    /// Records the syntactic checksums a semantic checksum was derived from.
    pub async fn set_sem2syn(
        &self,
        key: &SemKey,
        syn_checksums: &[Checksum],
    ) -> Result<(), DatabaseError> {
        let mut value: Vec<String> = syn_checksums.iter().map(Checksum::to_hex).collect();
        value.sort();
        value.dedup();
        self.put(json!({
            "type": "semantic_to_syntactic",
            "checksum": key.checksum,
            "celltype": key.celltype,
            "subcelltype": key.subcelltype,
            "value": value,
        }))
        .await
    }

    pub async fn get_sem2syn(&self, key: &SemKey) -> Result<Option<Vec<Checksum>>, DatabaseError> {
        let hexes: Option<Vec<String>> = self
            .get_json(json!({
                "type": "semantic_to_syntactic",
                "checksum": key.checksum,
                "celltype": key.celltype,
                "subcelltype": key.subcelltype,
            }))
            .await?;
        let Some(hexes) = hexes else {
            return Ok(None);
        };
        hexes
            .iter()
            .map(|s| {
                s.trim()
                    .parse()
                    .map_err(|_| DatabaseError::Malformed(truncated(s)))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    pub async fn set_buffer_info(
        &self,
        checksum: &Checksum,
        info: &BufferInfo,
    ) -> Result<(), DatabaseError> {
        self.put(json!({"type": "buffer_info", "checksum": checksum, "value": info}))
            .await
    }

    pub async fn get_buffer_info(
        &self,
        checksum: &Checksum,
    ) -> Result<Option<BufferInfo>, DatabaseError> {
        self.get_json(json!({"type": "buffer_info", "checksum": checksum}))
            .await
    }

    /// Records only the length of a buffer.
    pub async fn set_buffer_length(
        &self,
        checksum: &Checksum,
        length: u64,
    ) -> Result<(), DatabaseError> {
        let info = BufferInfo {
            length: Some(length),
            ..Default::default()
        };
        self.set_buffer_info(checksum, &info).await
    }

    fn expression_request(expression: &Expression) -> Json {
        let mut request = json!({
            "type": "expression",
            "checksum": expression.checksum(),
            "celltype": expression.celltype(),
            "path": expression.path(),
            "target_celltype": expression.target_celltype(),
        });
        if let Some(hp) = expression.hash_pattern() {
            request["hash_pattern"] = Json::from(hp.clone());
        }
        if let Some(hp) = expression.target_hash_pattern() {
            request["target_hash_pattern"] = Json::from(hp.clone());
        }
        request
    }

    pub async fn set_expression(
        &self,
        expression: &Expression,
        result: &Checksum,
    ) -> Result<(), DatabaseError> {
        let mut request = Self::expression_request(expression);
        request["value"] = json!(result);
        debug!("SET expression {expression}");
        self.put(request).await
    }

    pub async fn get_expression(
        &self,
        expression: &Expression,
    ) -> Result<Option<Checksum>, DatabaseError> {
        self.get_checksum(Self::expression_request(expression)).await
    }

    /// Stores execution metadata of a transformation, as indented JSON text.
    pub async fn set_metadata(
        &self,
        tf_checksum: &Checksum,
        metadata: &Json,
    ) -> Result<(), DatabaseError> {
        if !self.is_active() {
            return Ok(());
        }
        let value = String::from_utf8_lossy(&json_dumps(metadata)).into_owned();
        debug!("SET metadata {tf_checksum}");
        self.put(json!({"type": "metadata", "checksum": tf_checksum, "value": value}))
            .await
    }

    pub async fn get_metadata(
        &self,
        tf_checksum: &Checksum,
    ) -> Result<Option<Json>, DatabaseError> {
        self.get_json(json!({"type": "metadata", "checksum": tf_checksum}))
            .await
    }

    /// Records the result of a structured cell join, keyed by the join dict checksum.
    pub async fn set_structured_cell_join(
        &self,
        join_checksum: &Checksum,
        result: &Checksum,
    ) -> Result<(), DatabaseError> {
        debug!("SET structured_cell_join {join_checksum}");
        self.put(json!({
            "type": "structured_cell_join",
            "checksum": join_checksum,
            "value": result,
        }))
        .await
    }

    pub async fn get_structured_cell_join(
        &self,
        join_checksum: &Checksum,
    ) -> Result<Option<Checksum>, DatabaseError> {
        self.get_checksum(json!({"type": "structured_cell_join", "checksum": join_checksum}))
            .await
    }

    /// Contests a previously recorded transformation result.
    ///
    /// Never fails on a status code; the caller inspects the response.
    pub async fn contest(
        &self,
        tf_checksum: &Checksum,
        result: &Checksum,
    ) -> Result<Option<ContestResponse>, DatabaseError> {
        self.put_raw(&json!({"type": "contest", "checksum": tf_checksum, "result": result}))
            .await
    }

    /// Expressions known to evaluate to `result`.
    pub async fn get_rev_expression(
        &self,
        result: &Checksum,
    ) -> Result<Option<Vec<Expression>>, DatabaseError> {
        let found: Option<Vec<RevExpression>> = self
            .get_json(json!({"type": "rev_expression", "checksum": result}))
            .await?;
        let Some(found) = found.filter(|f| !f.is_empty()) else {
            return Ok(None);
        };
        let mut expressions = Vec::with_capacity(found.len());
        for e in found {
            if e.result != *result {
                return Err(DatabaseError::Malformed(format!(
                    "rev_expression for {result} returned result {}",
                    e.result
                )));
            }
            let expression = Expression::new(
                e.checksum,
                e.path,
                e.celltype,
                e.target_celltype,
                e.target_subcelltype,
                e.hash_pattern,
                e.target_hash_pattern,
            )
            .map_err(|err| DatabaseError::Malformed(err.to_string()))?;
            expressions.push(expression);
        }
        Ok(Some(expressions))
    }

    /// Checksums of join dicts known to evaluate to `result`.
    pub async fn get_rev_join(
        &self,
        result: &Checksum,
    ) -> Result<Option<Vec<Checksum>>, DatabaseError> {
        let found: Option<Vec<Checksum>> = self
            .get_json(json!({"type": "rev_join", "checksum": result}))
            .await?;
        Ok(found.filter(|f| !f.is_empty()))
    }

    /// Checksums of transformations known to evaluate to `result`.
    pub async fn get_rev_transformations(
        &self,
        result: &Checksum,
    ) -> Result<Option<Vec<Checksum>>, DatabaseError> {
        let found: Option<Vec<Checksum>> = self
            .get_json(json!({"type": "rev_transformations", "checksum": result}))
            .await?;
        Ok(found.filter(|f| !f.is_empty()))
    }
}

fn truncated(s: &str) -> String {
    s.chars().take(1000).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inactive_is_a_noop() -> anyhow::Result<()> {
        let db = Database::inactive();
        let checksum = Checksum::new(b"42\n");
        assert!(!db.is_active());
        db.set_transformation_result(&checksum, &checksum).await?;
        assert_eq!(db.get_transformation_result(&checksum).await?, None);
        assert_eq!(db.get_buffer_info(&checksum).await?, None);
        assert_eq!(db.contest(&checksum, &checksum).await?, None);
        assert_eq!(db.get_rev_join(&checksum).await?, None);
        Ok(())
    }

    #[test]
    fn semkey_serializes_celltype_lowercase() {
        let key = SemKey::new(Checksum::EMPTY_DICT, Celltype::Python, Some("transformer"));
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json["celltype"], "python");
        assert_eq!(json["subcelltype"], "transformer");
    }
}
