//! Concrete collaborators: snapshot sources and HTTP providers.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use watchkeeper_kernel::{
    AnalysisError, AnalysisProvider, AnalysisReport, FetchError, NarrativeFacts,
    NarrativeProvider, SnapshotSource,
};
use watchkeeper_types::Snapshot;

use crate::config::EndpointConfig;

fn build_http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(timeout).build()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    format!("{} {}", status, truncate(&body, 320))
}

/// Polls a JSON endpoint with GET.
pub struct HttpSnapshotSource {
    source_id: String,
    url: String,
    bearer_token: Option<String>,
    client: Client,
}

impl HttpSnapshotSource {
    pub fn new(
        source_id: impl Into<String>,
        url: impl Into<String>,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            source_id: source_id.into(),
            url: url.into(),
            bearer_token,
            client: build_http_client(timeout)?,
        })
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self) -> Result<Snapshot, FetchError> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Source(format!("GET {} failed: {}", self.url, e)))?;
        if !response.status().is_success() {
            return Err(FetchError::Source(error_body(response).await));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Source(format!("invalid snapshot JSON: {}", e)))?;
        Ok(Snapshot::new(self.source_id.clone(), data))
    }
}

/// Re-reads a JSON file on every poll.
pub struct FileSnapshotSource {
    source_id: String,
    path: PathBuf,
}

impl FileSnapshotSource {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl SnapshotSource for FileSnapshotSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self) -> Result<Snapshot, FetchError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            FetchError::Source(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        let data: Value = serde_json::from_slice(&bytes).map_err(|e| {
            FetchError::Source(format!("invalid JSON in {}: {}", self.path.display(), e))
        })?;
        Ok(Snapshot::new(self.source_id.clone(), data))
    }
}

/// POSTs the snapshot and expects `{risks, actions, treasury_summary}`.
pub struct HttpAnalysisProvider {
    url: String,
    bearer_token: Option<String>,
    client: Client,
}

impl HttpAnalysisProvider {
    pub fn from_endpoint(url: &str, endpoint: &EndpointConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            url: url.to_string(),
            bearer_token: endpoint.bearer_token.clone(),
            client: build_http_client(endpoint.request_timeout())?,
        })
    }
}

#[async_trait]
impl AnalysisProvider for HttpAnalysisProvider {
    async fn analyze(&self, snapshot: &Snapshot) -> Result<AnalysisReport, AnalysisError> {
        let mut request = self.client.post(&self.url).json(snapshot);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AnalysisError::Provider(format!("analysis request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(AnalysisError::Provider(error_body(response).await));
        }

        response
            .json()
            .await
            .map_err(|e| AnalysisError::Provider(format!("invalid analysis response: {}", e)))
    }
}

#[derive(Deserialize)]
struct NarrativeResponse {
    text: String,
}

/// POSTs numeric facts and expects `{text}`.
pub struct HttpNarrativeProvider {
    url: String,
    bearer_token: Option<String>,
    client: Client,
}

impl HttpNarrativeProvider {
    pub fn from_endpoint(url: &str, endpoint: &EndpointConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            url: url.to_string(),
            bearer_token: endpoint.bearer_token.clone(),
            client: build_http_client(endpoint.request_timeout())?,
        })
    }
}

#[async_trait]
impl NarrativeProvider for HttpNarrativeProvider {
    async fn narrate(&self, facts: &NarrativeFacts) -> Result<String, AnalysisError> {
        let mut request = self.client.post(&self.url).json(facts);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AnalysisError::Provider(format!("narrative request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(AnalysisError::Provider(error_body(response).await));
        }

        let body: NarrativeResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Provider(format!("invalid narrative response: {}", e)))?;
        Ok(body.text)
    }
}
