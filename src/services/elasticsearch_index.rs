//! src/services/elasticsearch_index.rs
//!
//! Elasticsearch backend for the IndexGateway, talking to the REST API over
//! reqwest. Documents live under `{base_url}/{index}/_doc/{id}`.

use super::index_gateway::{IndexError, IndexGateway, IndexResult, SearchHits, ensure_indexable};
use crate::models::search::SearchDocument;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ElasticsearchIndex {
    client: Client,
    base_url: String,
    index: String,
}

impl ElasticsearchIndex {
    pub fn new(base_url: &str, index: &str, timeout: Duration) -> IndexResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.to_string(),
        })
    }

    fn doc_url(&self, id: &str) -> String {
        format!("{}/{}/_doc/{}", self.base_url, self.index, id)
    }

    /// Settings and mappings the compiled queries rely on: `.keyword`
    /// sub-fields for every string, numeric price and quantity.
    fn index_definition() -> Value {
        let text_with_keyword = json!({
            "type": "text",
            "fields": {"keyword": {"type": "keyword", "ignore_above": 256}}
        });
        json!({
            "settings": {"number_of_shards": 1},
            "mappings": {
                "dynamic_templates": [{
                    "strings_with_keyword": {
                        "match_mapping_type": "string",
                        "mapping": text_with_keyword
                    }
                }],
                "properties": {
                    "id": text_with_keyword,
                    "name": text_with_keyword,
                    "description": {"type": "text"},
                    "brand": text_with_keyword,
                    "specs": {"type": "object", "dynamic": true},
                    "price": {"type": "double"},
                    "quantity": {"type": "long"},
                    "created_by": {"type": "keyword"},
                    "created_at": {"type": "date"},
                    "updated_at": {"type": "date"}
                }
            }
        })
    }

    async fn fail(response: Response) -> IndexError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        warn!(status, %body, "index request failed");
        IndexError::Backend { status, body }
    }
}

#[async_trait]
impl IndexGateway for ElasticsearchIndex {
    async fn upsert(&self, id: &str, document: &SearchDocument) -> IndexResult<()> {
        ensure_indexable(id, document)?;
        let response = self
            .client
            .put(self.doc_url(id))
            .json(document)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }
        debug!(%id, index = %self.index, "indexed document");
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> IndexResult<()> {
        let response = self.client.delete(self.doc_url(id)).send().await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(%id, "document already absent from index");
                Ok(())
            }
            _ => Err(Self::fail(response).await),
        }
    }

    async fn search(&self, query: &Value) -> IndexResult<SearchHits> {
        let url = format!(
            "{}/{}/_search?track_total_hits=true",
            self.base_url, self.index
        );
        let response = self.client.post(url).json(query).send().await?;
        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }
        let body: Value = response.json().await?;
        parse_search_response(&body)
    }

    async fn ensure_index(&self) -> IndexResult<()> {
        let response = self
            .client
            .put(format!("{}/{}", self.base_url, self.index))
            .json(&Self::index_definition())
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            info!(index = %self.index, "created search index");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if already_exists(status, &body) {
            debug!(index = %self.index, "search index already exists");
            return Ok(());
        }
        warn!(status = status.as_u16(), %body, "creating search index failed");
        Err(IndexError::Backend {
            status: status.as_u16(),
            body,
        })
    }

    /// Cluster health rather than the index itself, so a fresh cluster is ready
    /// before the first document lands.
    async fn ping(&self) -> IndexResult<()> {
        let response = self
            .client
            .get(format!("{}/_cluster/health", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::fail(response).await);
        }
        let health: Value = response.json().await?;
        if !cluster_usable(&health) {
            return Err(IndexError::Backend {
                status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                body: health.to_string(),
            });
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "elasticsearch"
    }
}

/// A create-index call against an existing index answers 400 with
/// `resource_already_exists_exception`.
fn already_exists(status: StatusCode, body: &str) -> bool {
    status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception")
}

/// Green and yellow clusters serve reads and writes; red does not.
fn cluster_usable(health: &Value) -> bool {
    matches!(
        health.get("status").and_then(Value::as_str),
        Some("green" | "yellow")
    )
}

/// Extract `_source` documents and the total hit count from a search response.
fn parse_search_response(body: &Value) -> IndexResult<SearchHits> {
    let hits = body
        .get("hits")
        .ok_or_else(|| IndexError::Malformed("response has no `hits`".into()))?;

    let total = match hits.get("total") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(total) => total.get("value").and_then(Value::as_u64),
        None => None,
    }
    .ok_or_else(|| IndexError::Malformed("response has no total hit count".into()))?;

    let documents = hits
        .get("hits")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(|hit| {
            let source = hit
                .get("_source")
                .ok_or_else(|| IndexError::Malformed("hit without `_source`".into()))?;
            serde_json::from_value(source.clone())
                .map_err(|err| IndexError::Malformed(err.to_string()))
        })
        .collect::<IndexResult<Vec<SearchDocument>>>()?;

    Ok(SearchHits { documents, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source(name: &str) -> Value {
        json!({
            "id": "3f0c1f9e-8d8e-4a59-9d43-5f1f6c1d2a10",
            "name": name,
            "description": "",
            "category": ["laptop"],
            "brand": "Acme",
            "color": null,
            "specs": {"ram": "16GB"},
            "price": 999.5,
            "quantity": 4,
            "created_by": "00000000-0000-0000-0000-000000000000",
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-01T10:00:00Z"
        })
    }

    #[test]
    fn parses_hits_and_object_total() {
        let body = json!({
            "hits": {
                "total": {"value": 42, "relation": "eq"},
                "hits": [{"_id": "a", "_source": source("Laptop")}]
            }
        });
        let hits = parse_search_response(&body).unwrap();
        assert_eq!(hits.total, 42);
        assert_eq!(hits.documents[0].name, "Laptop");
        assert_eq!(hits.documents[0].quantity, 4);
    }

    #[test]
    fn accepts_legacy_numeric_total() {
        let body = json!({"hits": {"total": 0, "hits": []}});
        let hits = parse_search_response(&body).unwrap();
        assert_eq!(hits.total, 0);
        assert!(hits.documents.is_empty());
    }

    #[test]
    fn missing_hits_is_malformed() {
        let err = parse_search_response(&json!({"error": "boom"})).unwrap_err();
        assert!(matches!(err, IndexError::Malformed(_)));
    }

    #[test]
    fn existing_index_counts_as_created() {
        let body = r#"{"error":{"type":"resource_already_exists_exception"},"status":400}"#;
        assert!(already_exists(StatusCode::BAD_REQUEST, body));
        assert!(!already_exists(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"type":"mapper_parsing_exception"}}"#
        ));
        assert!(!already_exists(StatusCode::INTERNAL_SERVER_ERROR, body));
    }

    #[test]
    fn red_cluster_is_not_usable() {
        assert!(cluster_usable(&json!({"status": "green"})));
        assert!(cluster_usable(&json!({"status": "yellow"})));
        assert!(!cluster_usable(&json!({"status": "red"})));
        assert!(!cluster_usable(&json!({})));
    }

    #[test]
    fn index_definition_maps_keyword_fields() {
        let definition = ElasticsearchIndex::index_definition();
        let properties = &definition["mappings"]["properties"];
        assert_eq!(properties["id"]["fields"]["keyword"]["type"], "keyword");
        assert_eq!(properties["brand"]["fields"]["keyword"]["type"], "keyword");
        assert_eq!(properties["price"]["type"], "double");
        assert_eq!(
            definition["mappings"]["dynamic_templates"][0]["strings_with_keyword"]["mapping"]
                ["fields"]["keyword"]["type"],
            "keyword"
        );
    }

    #[test]
    fn doc_url_trims_trailing_slash() {
        let index =
            ElasticsearchIndex::new("http://localhost:9200/", "products", Duration::from_secs(1))
                .unwrap();
        assert_eq!(
            index.doc_url("abc"),
            "http://localhost:9200/products/_doc/abc"
        );
    }
}
