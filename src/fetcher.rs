use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::FetchError;

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Snapshot of a fetched detail page. Owns the raw body; strategies query
/// the parsed DOM built from it by the extractor.
#[derive(Debug, Clone)]
pub struct Document {
    url: String,
    status: u16,
    html: String,
    fetched_at: DateTime<Utc>,
}

impl Document {
    pub fn new(url: String, status: u16, html: String) -> Self {
        Document {
            url,
            status,
            html,
            fetched_at: Utc::now(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn html(&self) -> &str {
        &self.html
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

/// One navigation session. Each pool worker owns exactly one for its
/// lifetime; sessions are never shared across workers. Implementations must
/// not retry internally; retries are the pipeline's decision.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Document, FetchError>;
}

/// Builds one exclusive fetcher session per worker.
pub type FetcherFactory =
    std::sync::Arc<dyn Fn() -> Result<Box<dyn PageFetcher>, FetchError> + Send + Sync>;

/// Plain HTTP session over reqwest. One client per worker so connection
/// state stays private to that worker.
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Navigation(format!("client setup: {}", e)))?;
        Ok(HttpFetcher { client, timeout })
    }

    fn classify(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            e.into()
        }
    }

    /// Factory handing each worker its own session.
    pub fn factory(timeout: Duration) -> FetcherFactory {
        std::sync::Arc::new(move || {
            HttpFetcher::new(timeout).map(|f| Box::new(f) as Box<dyn PageFetcher>)
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Document, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Http(status.as_u16()));
        }
        let html = resp.text().await.map_err(|e| self.classify(e))?;
        Ok(Document::new(url.to_string(), status.as_u16(), html))
    }
}
