//! The network boundary.
//!
//! The cache does not own an HTTP client. A [Transport] implementation executes a
//! [ComposedRequest] and hands back the decoded [GraphQLResponse]; [Cache::fetch] drives one
//! request to completion (or abort) and normalizes the result.

use crate::{
    cache::Cache, error::CacheError, normalize::NormalizeReport, query::ComposedRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::watch;

/// One element of a GraphQL error path: a response key or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(index) => write!(f, "{index}"),
            PathSegment::Key(key) => write!(f, "{key}"),
        }
    }
}

/// Render a path as `author.books.edges.0.node`.
pub fn render_path(path: &[PathSegment]) -> String {
    path.iter()
        .map(|segment| segment.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLError {
    pub fn new(message: &str) -> Self {
        GraphQLError {
            message: message.to_string(),
            path: None,
            extensions: None,
        }
    }

    pub fn at<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PathSegment>,
    {
        self.path = Some(path.into_iter().map(Into::into).collect());
        self
    }

    pub fn path(&self) -> &[PathSegment] {
        self.path.as_deref().unwrap_or_default()
    }
}

/// A response document: `{ "data": ..., "errors": [...] }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResponse {
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub errors: Vec<GraphQLError>,
}

impl GraphQLResponse {
    pub fn from_json(text: &str) -> Result<GraphQLResponse, CacheError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Executes composed requests. Implementations own the wire (HTTP, websocket, fixtures, ...).
pub trait Transport: Sync {
    fn execute(
        &self,
        request: &ComposedRequest,
    ) -> impl std::future::Future<Output = Result<GraphQLResponse, CacheError>> + Send;
}

/// Owner side of an abort signal.
#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<bool>,
}

impl Default for AbortController {
    fn default() -> Self {
        AbortController::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        AbortController { tx }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the controller aborts. Never resolves if the controller is dropped first.
    pub async fn aborted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Completed(NormalizeReport),
    /// The request was aborted; nothing was written to the cache.
    Aborted,
}

impl Cache {
    /// Execute `request` and normalize its response, unless `signal` aborts first. An aborted
    /// request never reaches [Cache::serialize].
    #[tracing::instrument(skip_all, fields(operations = ?request.operations))]
    pub async fn fetch<T: Transport>(
        &self,
        transport: &T,
        request: &ComposedRequest,
        mut signal: AbortSignal,
    ) -> Result<FetchOutcome, CacheError> {
        if signal.is_aborted() {
            return Ok(FetchOutcome::Aborted);
        }
        let response = tokio::select! {
            biased;
            _ = signal.aborted() => {
                tracing::debug!("[Cache::fetch] Request aborted in flight");
                return Ok(FetchOutcome::Aborted);
            }
            response = transport.execute(request) => response?,
        };
        if signal.is_aborted() {
            return Ok(FetchOutcome::Aborted);
        }
        let report = self.serialize_response(&request.expectations, &response)?;
        Ok(FetchOutcome::Completed(report))
    }
}
