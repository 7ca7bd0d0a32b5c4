//! Catalogue Recipe Extraction Library
//!
//! Discovers and executes reusable "recipes" for extracting structured
//! records (courses, programs, credentials, competencies) from an
//! institution's public web catalogue.
//!
//! # Design Philosophy
//!
//! **"Resilience to a noisy oracle"**
//!
//! - Every LLM judgement is retried with backoff and decided by majority vote
//! - Extracted fields are verified against the page text, not trusted
//! - Crawls are queued jobs; status lives in the store, never in memory
//! - Library handles mechanics, collaborators handle I/O
//!
//! # Usage
//!
//! ```rust,ignore
//! use catalogue_extraction::{CatalogueService, CatalogueType, EngineConfig, MemoryJobQueue, MemoryStore};
//!
//! let service = CatalogueService::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryJobQueue::new()),
//!     Arc::new(HttpBrowser::new()?),
//!     Arc::new(OpenAiLlm::from_env()?),
//!     EngineConfig::from_env()?,
//! );
//!
//! let catalogue = service.create_catalogue("State", "https://catalog.state.edu", CatalogueType::Courses).await?;
//! let recipe = service.create_recipe(catalogue.id, "https://catalog.state.edu/courses").await?;
//! let recipe = service.detect_recipe(recipe.id).await?;
//! let extraction = service.start_extraction(recipe.id).await?;
//! service.worker(JobWorkerConfig::default()).run_until_idle(CancellationToken::new()).await;
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Collaborator abstractions (Llm, Browser, JobQueue, Store)
//! - [`types`] - Recipes, extractions, crawl steps and pages, items
//! - [`consensus`] - Exponential retry and best-of-N voting
//! - [`pipeline`] - Classifier, detector, chunker and extractor
//! - [`crawl`] - Crawl jobs and their orchestrator
//! - [`jobs`] - In-memory job queue and the job worker
//! - [`stores`] - Storage implementations (MemoryStore)
//! - [`browser`] - Browser implementations (HttpBrowser)
//! - [`service`] - The CatalogueService façade
//! - `testing` - Mock implementations for tests (`testing` feature)

pub mod browser;
pub mod consensus;
pub mod crawl;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod pipeline;
pub mod service;
pub mod stores;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod traits;
pub mod types;

#[cfg(feature = "openai")]
pub mod ai;

// Re-export core types at crate root
pub use error::{
    ChunkingError, DetectionError, Error, FetchError, LlmError, QueueError, Result, StoreError,
    TransitionError,
};
pub use traits::{
    browser::{ApiCatalogue, Browser},
    llm::{Llm, LlmTask, ToolRequest, ToolResponse, ToolSchema},
    queue::{ClaimedJob, EnqueueResult, FailureKind, JobOptions, JobQueue},
    store::{CatalogueStore, ContentStore, CrawlStore, DatasetStore, ExtractionStore, Store},
};
pub use types::{
    catalogue::{Catalogue, CatalogueType, FieldKind, FieldSpec},
    config::{
        ChunkerConfig, ClassifierConfig, CrawlConfig, DetectorConfig, EngineConfig,
        ExtractorConfig, RetryPolicy,
    },
    extraction::{
        CompletionStats, CrawlPage, CrawlStep, Extraction, StepKind, StepStats, TokenUsage,
    },
    item::{DataItem, Dataset, Entity, FieldInclusion, TextInclusion},
    page::{PageContent, RenderedPage},
    recipe::{
        ApiProvider, PageType, PaginationConfiguration, Recipe, RecipeConfiguration,
        UrlPatternType,
    },
    status::{ExtractionStatus, Lifecycle, PageStatus, RecipeDetectionStatus},
};

// Re-export the consensus utility
pub use consensus::{best_out_of, exponential_retry};

// Re-export pipeline components
pub use pipeline::{
    ContentChunker, EntityExtractor, PageClassification, PageClassifier, PageInput,
    PageTypeVerdict, RecipeDetector, VerifiedEntity,
};

// Re-export crawl execution
pub use crawl::{CrawlJob, CrawlOrchestrator, EXTRACT_DATA_QUEUE, FETCH_PAGE_QUEUE};
pub use jobs::{DeadLetter, JobHandler, JobWorker, JobWorkerConfig, MemoryJobQueue};

// Re-export implementations
pub use browser::HttpBrowser;
pub use service::{CatalogueService, UrlRegexpPreview};
pub use stores::MemoryStore;

// Re-export testing utilities
#[cfg(any(test, feature = "testing"))]
pub use testing::{MockApiCatalogue, MockBrowser, MockLlm};
