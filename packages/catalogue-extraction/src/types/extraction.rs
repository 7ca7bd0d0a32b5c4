//! Extraction runs and the crawl tree they execute.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use uuid::Uuid;

use crate::types::recipe::{PageType, RecipeConfiguration};
use crate::types::status::{ExtractionStatus, Lifecycle, PageStatus};

/// LLM token consumption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
    }
}

/// Per-step download and extraction counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStats {
    pub step_id: Uuid,
    pub downloads_attempted: u64,
    pub downloads_succeeded: u64,
    pub extractions_attempted: u64,
    pub extractions_succeeded: u64,
}

/// Derived progress summary of an extraction.
///
/// Always recomputed from the pages; never edited directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionStats {
    pub steps: Vec<StepStats>,
}

impl CompletionStats {
    /// Recompute stats from the steps and pages of one extraction.
    pub fn compute(steps: &[CrawlStep], pages: &[CrawlPage]) -> Self {
        let steps = steps
            .iter()
            .map(|step| {
                let mut stats = StepStats {
                    step_id: step.id,
                    ..Default::default()
                };
                for page in pages.iter().filter(|p| p.crawl_step_id == step.id) {
                    if page.status.is_terminal() {
                        stats.downloads_attempted += 1;
                    }
                    if page.status == PageStatus::Success {
                        stats.downloads_succeeded += 1;
                    }
                    if let Some(data_status) = page.data_status {
                        if data_status.is_terminal() {
                            stats.extractions_attempted += 1;
                        }
                        if data_status == PageStatus::Success {
                            stats.extractions_succeeded += 1;
                        }
                    }
                }
                stats
            })
            .collect();
        Self { steps }
    }

    pub fn downloads_attempted(&self) -> u64 {
        self.steps.iter().map(|s| s.downloads_attempted).sum()
    }

    pub fn downloads_succeeded(&self) -> u64 {
        self.steps.iter().map(|s| s.downloads_succeeded).sum()
    }

    pub fn extractions_attempted(&self) -> u64 {
        self.steps.iter().map(|s| s.extractions_attempted).sum()
    }

    pub fn extractions_succeeded(&self) -> u64 {
        self.steps.iter().map(|s| s.extractions_succeeded).sum()
    }
}

/// One execution of a recipe against live pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub id: Uuid,
    pub catalogue_id: Uuid,
    pub recipe_id: Uuid,
    pub status: ExtractionStatus,
    pub completion_stats: CompletionStats,
    pub token_usage: TokenUsage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Extraction {
    pub fn new(catalogue_id: Uuid, recipe_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            catalogue_id,
            recipe_id,
            status: ExtractionStatus::Waiting,
            completion_stats: CompletionStats::default(),
            token_usage: TokenUsage::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// How the pages of a step were reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    /// The recipe's entry URL
    FetchRoot,
    /// Additional pages of a paginated index
    FetchPaginated,
    /// Pages discovered through a link pattern
    FetchLinks,
}

/// One node of the executed navigation tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlStep {
    pub id: Uuid,
    pub extraction_id: Uuid,
    pub parent_step_id: Option<Uuid>,
    pub step: StepKind,

    /// Configuration fragment describing the pages of this step
    pub configuration: RecipeConfiguration,

    pub page_type: PageType,

    /// Step levels below the extraction root (root is 0)
    pub depth: usize,

    pub created_at: DateTime<Utc>,
}

impl CrawlStep {
    pub fn root(extraction_id: Uuid, configuration: RecipeConfiguration) -> Self {
        Self {
            id: Uuid::new_v4(),
            extraction_id,
            parent_step_id: None,
            step: StepKind::FetchRoot,
            page_type: configuration.page_type,
            configuration,
            depth: 0,
            created_at: Utc::now(),
        }
    }

    /// A step nested under `self`.
    pub fn child(&self, step: StepKind, configuration: RecipeConfiguration) -> Self {
        Self {
            id: Uuid::new_v4(),
            extraction_id: self.extraction_id,
            parent_step_id: Some(self.id),
            step,
            page_type: configuration.page_type,
            configuration,
            depth: self.depth + 1,
            created_at: Utc::now(),
        }
    }
}

/// One fetched URL under a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlPage {
    pub id: Uuid,
    pub extraction_id: Uuid,
    pub crawl_step_id: Uuid,

    /// Normalized URL; unique per extraction
    pub url: String,

    pub status: PageStatus,
    pub fetch_failure_reason: Option<String>,

    /// Status of the data extraction job (detail pages only)
    pub data_status: Option<PageStatus>,
    pub data_failure_reason: Option<String>,
    pub data_extraction_started_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrawlPage {
    pub fn new(step: &CrawlStep, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            extraction_id: step.extraction_id,
            crawl_step_id: step.id,
            url: url.into(),
            status: PageStatus::Waiting,
            fetch_failure_reason: None,
            data_status: None,
            data_failure_reason: None,
            data_extraction_started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the fetch and any data extraction have settled.
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() && self.data_status.map_or(true, |s| s.is_terminal())
    }

    /// Whether either job of this page ended in error.
    pub fn has_failed(&self) -> bool {
        self.status == PageStatus::Error || self.data_status == Some(PageStatus::Error)
    }
}
