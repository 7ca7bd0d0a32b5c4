//! Storage traits for catalogues, recipes, extractions and their crawl trees.
//!
//! The storage layer is split into focused traits:
//! - `CatalogueStore`: Catalogues and recipes
//! - `ExtractionStore`: Extraction runs
//! - `CrawlStore`: Crawl steps and pages
//! - `ContentStore`: Page content blobs, kept out of band
//! - `DatasetStore`: Datasets and extracted items
//! - `Store`: Composite trait combining all of them

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    catalogue::Catalogue,
    extraction::{CompletionStats, CrawlPage, CrawlStep, Extraction, TokenUsage},
    item::{DataItem, Dataset},
    page::PageContent,
    recipe::Recipe,
    status::ExtractionStatus,
};

/// Catalogues and their recipes.
#[async_trait]
pub trait CatalogueStore: Send + Sync {
    async fn insert_catalogue(&self, catalogue: &Catalogue) -> Result<()>;

    async fn get_catalogue(&self, id: Uuid) -> Result<Catalogue>;

    async fn insert_recipe(&self, recipe: &Recipe) -> Result<()>;

    async fn get_recipe(&self, id: Uuid) -> Result<Recipe>;

    /// Replace a recipe. `is_default` is left untouched; use
    /// [`CatalogueStore::set_default_recipe`].
    async fn update_recipe(&self, recipe: &Recipe) -> Result<()>;

    async fn list_recipes(&self, catalogue_id: Uuid) -> Result<Vec<Recipe>>;

    /// Make `recipe_id` the only default recipe of its catalogue.
    ///
    /// Clearing the previous default and setting the new one is atomic.
    async fn set_default_recipe(&self, recipe_id: Uuid) -> Result<Recipe>;
}

/// Extraction runs.
#[async_trait]
pub trait ExtractionStore: Send + Sync {
    async fn insert_extraction(&self, extraction: &Extraction) -> Result<()>;

    async fn get_extraction(&self, id: Uuid) -> Result<Extraction>;

    /// Move an extraction from `from` to `to`, checking the current status
    /// and the transition under the same lock.
    ///
    /// Fails with [`Error::Transition`](crate::error::Error::Transition) when
    /// the stored status is not `from` or the transition is illegal; nothing
    /// is written in that case.
    async fn transition_extraction(
        &self,
        id: Uuid,
        from: ExtractionStatus,
        to: ExtractionStatus,
    ) -> Result<Extraction>;

    /// Overwrite only the completion stats of an extraction.
    async fn set_completion_stats(&self, id: Uuid, stats: &CompletionStats) -> Result<()>;

    async fn list_extractions(
        &self,
        status: Option<ExtractionStatus>,
    ) -> Result<Vec<Extraction>>;

    /// Add LLM usage to an extraction's running total.
    async fn add_token_usage(&self, id: Uuid, usage: TokenUsage) -> Result<()>;

    /// Mark activity on an extraction without other changes.
    async fn touch_extraction(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Remove an extraction with its steps, pages, content, dataset and items.
    async fn delete_extraction(&self, id: Uuid) -> Result<()>;
}

/// Crawl steps and pages.
#[async_trait]
pub trait CrawlStore: Send + Sync {
    async fn insert_step(&self, step: &CrawlStep) -> Result<()>;

    async fn get_step(&self, id: Uuid) -> Result<CrawlStep>;

    /// Return the child of `step.parent_step_id` with the same kind, inserting
    /// `step` if there is none. Atomic.
    async fn get_or_insert_child_step(&self, step: &CrawlStep) -> Result<CrawlStep>;

    async fn list_steps(&self, extraction_id: Uuid) -> Result<Vec<CrawlStep>>;

    /// Insert `page` unless its extraction already has a page with the same
    /// URL. The check and the insert are atomic. Returns whether it was
    /// inserted.
    async fn insert_page_if_absent(&self, page: &CrawlPage) -> Result<bool>;

    async fn get_page(&self, id: Uuid) -> Result<CrawlPage>;

    /// Replace a page, bumping `updated_at`.
    async fn update_page(&self, page: &CrawlPage) -> Result<()>;

    async fn list_pages(&self, extraction_id: Uuid) -> Result<Vec<CrawlPage>>;
}

/// Out-of-band page content.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put_content(&self, page_id: Uuid, content: &PageContent) -> Result<()>;

    async fn get_content(&self, page_id: Uuid) -> Result<Option<PageContent>>;
}

/// Datasets and extracted items.
#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// Return the dataset of an extraction, creating it if needed. Atomic.
    async fn get_or_create_dataset(
        &self,
        catalogue_id: Uuid,
        extraction_id: Uuid,
    ) -> Result<Dataset>;

    /// Replace every item extracted from `page_id` with `items`.
    async fn replace_items(&self, page_id: Uuid, items: &[DataItem]) -> Result<()>;

    async fn list_items(&self, dataset_id: Uuid) -> Result<Vec<DataItem>>;
}

/// Composite storage trait combining all stores.
///
/// This is the main trait used by the detector, orchestrator and service.
pub trait Store:
    CatalogueStore + ExtractionStore + CrawlStore + ContentStore + DatasetStore
{
}

// Blanket implementation: anything implementing all five traits is a Store
impl<T> Store for T where
    T: CatalogueStore + ExtractionStore + CrawlStore + ContentStore + DatasetStore
{
}
