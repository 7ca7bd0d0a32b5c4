//! Job payloads of the crawl.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Queue of page-fetch jobs.
pub const FETCH_PAGE_QUEUE: &str = "fetch-page";

/// Queue of data-extraction jobs.
pub const EXTRACT_DATA_QUEUE: &str = "extract-data";

/// A unit of crawl work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrawlJob {
    /// Fetch a page and expand it according to its step's configuration
    FetchPage { extraction_id: Uuid, page_id: Uuid },
    /// Extract entities from a fetched detail page
    ExtractData { extraction_id: Uuid, page_id: Uuid },
}

impl CrawlJob {
    pub fn queue(&self) -> &'static str {
        match self {
            CrawlJob::FetchPage { .. } => FETCH_PAGE_QUEUE,
            CrawlJob::ExtractData { .. } => EXTRACT_DATA_QUEUE,
        }
    }

    pub fn extraction_id(&self) -> Uuid {
        match self {
            CrawlJob::FetchPage { extraction_id, .. } | CrawlJob::ExtractData { extraction_id, .. } => {
                *extraction_id
            }
        }
    }

    pub fn page_id(&self) -> Uuid {
        match self {
            CrawlJob::FetchPage { page_id, .. } | CrawlJob::ExtractData { page_id, .. } => *page_id,
        }
    }

    /// Dedup key: one pending job per queue, extraction and URL.
    pub fn dedup_key(&self, url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.queue().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.extraction_id().as_bytes());
        hasher.update(b"\n");
        hasher.update(url.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
