use std::path::PathBuf;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// Receives the documents produced by a run.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Store the documents of one metric.
    async fn index(&self, metric_name: &str, documents: Vec<Value>) -> Result<()>;
}

/// Writes every metric as a JSON array in `<directory>/<metric>.json`.
pub struct LocalIndexer {
    directory: PathBuf,
}

impl LocalIndexer {
    /// Create an indexer writing below the directory, created on first use.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

#[async_trait]
impl Indexer for LocalIndexer {
    async fn index(&self, metric_name: &str, documents: Vec<Value>) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self.directory.join(format!("{metric_name}.json"));
        let body = serde_json::to_vec_pretty(&documents)?;
        tokio::fs::write(&path, body).await?;
        info!(path = %path.display(), documents = documents.len(), "documents written");
        Ok(())
    }
}

/// Sends documents to an Elasticsearch or OpenSearch index through the bulk api.
pub struct ElasticIndexer {
    client: reqwest::Client,
    server: String,
    index: String,
}

impl ElasticIndexer {
    /// Create an indexer for the index on the server.
    pub fn new(server: &str, index: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            server: server.trim_end_matches('/').to_owned(),
            index: index.to_owned(),
        }
    }
}

/// Newline delimited bulk request creating every document.
pub fn bulk_body(index: &str, documents: &[Value]) -> Result<String> {
    let action = serde_json::to_string(&json!({ "index": { "_index": index } }))?;
    let mut body = String::new();
    for document in documents {
        body.push_str(&action);
        body.push('\n');
        body.push_str(&serde_json::to_string(document)?);
        body.push('\n');
    }
    Ok(body)
}

#[async_trait]
impl Indexer for ElasticIndexer {
    async fn index(&self, metric_name: &str, documents: Vec<Value>) -> Result<()> {
        if documents.is_empty() {
            debug!(metric_name, "no documents to index");
            return Ok(());
        }
        let resp = self
            .client
            .post(format!("{}/{}/_bulk", self.server, self.index))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(bulk_body(&self.index, &documents)?)
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!(
                "bulk request for {metric_name} failed: {}",
                resp.text().await?
            )
        }

        #[derive(serde::Deserialize)]
        struct Response {
            errors: bool,
        }
        let data: Response = resp.json().await?;
        if data.errors {
            bail!("bulk request for {metric_name} rejected some documents")
        }
        info!(metric_name, index = %self.index, documents = documents.len(), "documents indexed");
        Ok(())
    }
}
