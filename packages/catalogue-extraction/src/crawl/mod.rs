//! Recipe execution.
//!
//! - [`jobs::CrawlJob`] - payloads of the fetch-page and extract-data queues
//! - [`orchestrator::CrawlOrchestrator`] - the [`JobHandler`](crate::jobs::JobHandler)
//!   that fetches pages, expands pagination and links, and extracts data

pub mod jobs;
pub mod orchestrator;

pub use jobs::{CrawlJob, EXTRACT_DATA_QUEUE, FETCH_PAGE_QUEUE};
pub use orchestrator::CrawlOrchestrator;
