//! src/services/index_gateway.rs
//!
//! IndexGateway: The boundary to the secondary search index. The index holds
//! `SearchDocument` projections keyed by the product id string. Backends must
//! validate a document before sending it and must treat deleting an absent
//! document as success.

use crate::models::{search::SearchDocument, validation::Violations};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use validator::Validate;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("document rejected before indexing: {0}")]
    Invalid(Violations),
    #[error("document id `{path}` does not match body id `{body}`")]
    IdMismatch { path: String, body: String },
    #[error("index responded with status {status}: {body}")]
    Backend { status: u16, body: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("malformed index response: {0}")]
    Malformed(String),
    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Documents matching a query plus the total number of hits across all pages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHits {
    pub documents: Vec<SearchDocument>,
    pub total: u64,
}

#[async_trait]
pub trait IndexGateway: Send + Sync {
    /// Insert or replace the document stored under `id`.
    async fn upsert(&self, id: &str, document: &SearchDocument) -> IndexResult<()>;

    /// Remove the document stored under `id`. Absent documents are not an error.
    async fn delete_by_id(&self, id: &str) -> IndexResult<()>;

    /// Run a compiled query document.
    async fn search(&self, query: &Value) -> IndexResult<SearchHits>;

    /// Create the index and its mappings if they do not exist yet.
    async fn ensure_index(&self) -> IndexResult<()> {
        Ok(())
    }

    async fn ping(&self) -> IndexResult<()>;

    /// Short backend name for logs and readiness output.
    fn backend(&self) -> &'static str;
}

pub type SharedIndex = Arc<dyn IndexGateway>;

/// Structural check every backend runs before accepting a document.
pub fn ensure_indexable(id: &str, document: &SearchDocument) -> IndexResult<()> {
    document
        .validate()
        .map_err(|errors| IndexError::Invalid(errors.into()))?;
    if document.id != id {
        return Err(IndexError::IdMismatch {
            path: id.to_string(),
            body: document.id.clone(),
        });
    }
    Ok(())
}
