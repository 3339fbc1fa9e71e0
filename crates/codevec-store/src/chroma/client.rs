//! Minimal Chroma HTTP API client (v2 routes, default tenant and database).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Result, StoreError};
use crate::types::Metadata;

const COLLECTIONS: &str = "api/v2/tenants/default_tenant/databases/default_database/collections";

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionModel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl CollectionModel {
    #[must_use]
    pub fn metadata(&self) -> Metadata {
        self.metadata.clone().unwrap_or_default()
    }
}

/// Columnar result of `get`.
#[derive(Debug, Default, Deserialize)]
pub struct GetResponse {
    pub ids: Vec<String>,
    #[serde(default)]
    pub documents: Option<Vec<Option<String>>>,
    #[serde(default)]
    pub metadatas: Option<Vec<Option<Metadata>>>,
}

/// Columnar result of `query`, one row per query embedding.
#[derive(Debug, Default, Deserialize)]
pub struct QueryResponse {
    pub ids: Vec<Vec<String>>,
    #[serde(default)]
    pub documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    pub metadatas: Option<Vec<Vec<Option<Metadata>>>>,
    #[serde(default)]
    pub distances: Option<Vec<Vec<Option<f32>>>>,
}

#[derive(Debug, Serialize)]
pub struct AddRecords<'a> {
    pub ids: Vec<String>,
    pub embeddings: &'a [Vec<f32>],
    pub documents: Vec<&'a str>,
    pub metadatas: Vec<Metadata>,
}

#[derive(Debug, Deserialize)]
struct PreflightChecks {
    max_batch_size: usize,
}

#[derive(Clone)]
pub struct ChromaClient {
    http: reqwest::Client,
    base_url: String,
}

impl std::fmt::Debug for ChromaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromaClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ChromaClient {
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Backend {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    /// Largest number of records accepted by one `add`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn max_batch_size(&self) -> Result<usize> {
        let response = self.http.get(self.url("api/v2/pre-flight-checks")).send().await?;
        let checks: PreflightChecks = Self::read(response).await?;
        Ok(checks.max_batch_size)
    }

    /// # Errors
    ///
    /// Returns an error if the request fails or the server rejects the metadata.
    pub async fn get_or_create_collection(
        &self,
        name: &str,
        metadata: &Metadata,
    ) -> Result<CollectionModel> {
        let response = self
            .http
            .post(self.url(COLLECTIONS))
            .json(&json!({ "name": name, "metadata": metadata, "get_or_create": true }))
            .send()
            .await?;
        Self::read(response).await
    }

    /// `None` when the collection does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn get_collection(&self, name: &str) -> Result<Option<CollectionModel>> {
        let response = self
            .http
            .get(self.url(&format!("{COLLECTIONS}/{name}")))
            .send()
            .await?;
        if is_missing(response.status()) {
            return Ok(None);
        }
        Self::read(response).await.map(Some)
    }

    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn list_collections(&self) -> Result<Vec<CollectionModel>> {
        let response = self.http.get(self.url(COLLECTIONS)).send().await?;
        Self::read(response).await
    }

    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("{COLLECTIONS}/{name}")))
            .send()
            .await?;
        if is_missing(response.status()) {
            return Ok(());
        }
        Self::read::<Value>(response).await.map(|_| ())
    }

    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn count(&self, collection_id: &str) -> Result<usize> {
        let response = self
            .http
            .get(self.url(&format!("{COLLECTIONS}/{collection_id}/count")))
            .send()
            .await?;
        Self::read(response).await
    }

    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn add(&self, collection_id: &str, records: &AddRecords<'_>) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("{COLLECTIONS}/{collection_id}/add")))
            .json(records)
            .send()
            .await?;
        Self::read::<Value>(response).await.map(|_| ())
    }

    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn get(
        &self,
        collection_id: &str,
        filter: Option<Value>,
        include: &[&str],
    ) -> Result<GetResponse> {
        let mut body = json!({ "include": include });
        if let Some(filter) = filter {
            body["where"] = filter;
        }
        let response = self
            .http
            .post(self.url(&format!("{COLLECTIONS}/{collection_id}/get")))
            .json(&body)
            .send()
            .await?;
        Self::read(response).await
    }

    /// Whether any record matches `filter`, fetching at most one id.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn any(&self, collection_id: &str, filter: Value) -> Result<bool> {
        let response = self
            .http
            .post(self.url(&format!("{COLLECTIONS}/{collection_id}/get")))
            .json(&json!({ "where": filter, "limit": 1, "include": [] }))
            .send()
            .await?;
        let found: GetResponse = Self::read(response).await?;
        Ok(!found.ids.is_empty())
    }

    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn query(
        &self,
        collection_id: &str,
        embeddings: &[Vec<f32>],
        n_results: usize,
        filter: Option<Value>,
    ) -> Result<QueryResponse> {
        let mut body = json!({
            "query_embeddings": embeddings,
            "n_results": n_results,
            "include": ["documents", "metadatas", "distances"],
        });
        if let Some(filter) = filter {
            body["where"] = filter;
        }
        let response = self
            .http
            .post(self.url(&format!("{COLLECTIONS}/{collection_id}/query")))
            .json(&body)
            .send()
            .await?;
        Self::read(response).await
    }

    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn delete_where(&self, collection_id: &str, filter: Value) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("{COLLECTIONS}/{collection_id}/delete")))
            .json(&json!({ "where": filter }))
            .send()
            .await?;
        Self::read::<Value>(response).await.map(|_| ())
    }
}

fn is_missing(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::NOT_FOUND
}

/// Combine `where` clauses; `None` when there are none.
#[must_use]
pub fn and_filter(mut clauses: Vec<Value>) -> Option<Value> {
    match clauses.len() {
        0 => None,
        1 => clauses.pop(),
        _ => Some(json!({ "$and": clauses })),
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn client(server: &MockServer) -> ChromaClient {
        ChromaClient::new(reqwest::Client::new(), &format!("{}/", server.uri()))
    }

    #[test]
    fn and_filter_shapes() {
        assert!(and_filter(vec![]).is_none());
        let single = json!({"path": {"$in": ["/a"]}});
        assert_eq!(and_filter(vec![single.clone()]), Some(single.clone()));
        let both = and_filter(vec![single.clone(), json!({"start": {"$gte": 0}})]).unwrap();
        assert_eq!(both["$and"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_collection_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/{COLLECTIONS}/nope")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        assert!(client(&server).await.get_collection("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_or_create_sends_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{COLLECTIONS}")))
            .and(body_partial_json(json!({"name": "abc", "get_or_create": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "uuid-1", "name": "abc", "metadata": {"hostname": "box"}
            })))
            .mount(&server)
            .await;

        let mut meta = Metadata::new();
        meta.insert("hostname".into(), "box".into());
        let created = client(&server)
            .await
            .get_or_create_collection("abc", &meta)
            .await
            .unwrap();
        assert_eq!(created.id, "uuid-1");
        assert_eq!(created.metadata()["hostname"], "box");
    }

    #[tokio::test]
    async fn server_error_is_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/pre-flight-checks"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .mount(&server)
            .await;
        let err = client(&server).await.max_batch_size().await.unwrap_err();
        assert!(matches!(err, StoreError::Backend { status: 500, .. }));
    }

    #[tokio::test]
    async fn query_parses_columnar_rows() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/{COLLECTIONS}/c1/query")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ids": [["a", "b"]],
                "documents": [["x", "y"]],
                "metadatas": [[{"path": "/p"}, null]],
                "distances": [[0.1, 0.2]]
            })))
            .mount(&server)
            .await;
        let rows = client(&server)
            .await
            .query("c1", &[vec![0.0]], 2, None)
            .await
            .unwrap();
        assert_eq!(rows.ids[0], ["a", "b"]);
        assert_eq!(rows.distances.unwrap()[0][1], Some(0.2));
        assert!(rows.metadatas.unwrap()[0][1].is_none());
    }
}
