//! The CatalogueService - main entry point for the extraction library.
//!
//! Each operation is a thin adapter over the detector, classifier and crawl
//! orchestrator, persisting status changes through the [`Store`].
//!
//! # Example
//!
//! ```rust,ignore
//! let service = CatalogueService::new(store, queue, browser, llm, EngineConfig::default());
//!
//! let catalogue = service
//!     .create_catalogue("State University", "https://catalog.state.edu", CatalogueType::Courses)
//!     .await?;
//! let recipe = service.create_recipe(catalogue.id, "https://catalog.state.edu/courses").await?;
//! let recipe = service.detect_recipe(recipe.id).await?;
//!
//! let extraction = service.start_extraction(recipe.id).await?;
//! service.worker(JobWorkerConfig::default()).run_until_idle(shutdown).await;
//! ```

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::crawl::orchestrator::CrawlOrchestrator;
use crate::error::{Error, Result};
use crate::jobs::worker::{JobWorker, JobWorkerConfig};
use crate::pipeline::chunker::ContentChunker;
use crate::pipeline::classifier::{PageClassifier, PageInput};
use crate::pipeline::detector::RecipeDetector;
use crate::pipeline::extractor::EntityExtractor;
use crate::pipeline::links::{extract_links, normalize_url};
use crate::traits::browser::{ApiCatalogue, Browser};
use crate::traits::llm::Llm;
use crate::traits::queue::JobQueue;
use crate::traits::store::Store;
use crate::types::catalogue::{Catalogue, CatalogueType};
use crate::types::config::EngineConfig;
use crate::types::extraction::Extraction;
use crate::types::item::DataItem;
use crate::types::page::PageContent;
use crate::types::recipe::{PageType, PaginationConfiguration, Recipe, RecipeConfiguration};
use crate::types::status::{ExtractionStatus, Lifecycle, RecipeDetectionStatus};

/// A detected link pattern and the links it matches.
#[derive(Debug, Clone, Serialize)]
pub struct UrlRegexpPreview {
    pub regexp: String,
    pub links: Vec<String>,
}

/// Catalogue, recipe and extraction operations.
pub struct CatalogueService {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    browser: Arc<dyn Browser>,
    llm: Arc<dyn Llm>,
    classifier: PageClassifier,
    detector: RecipeDetector,
    orchestrator: Arc<CrawlOrchestrator>,
    config: EngineConfig,
}

impl CatalogueService {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        browser: Arc<dyn Browser>,
        llm: Arc<dyn Llm>,
        config: EngineConfig,
    ) -> Self {
        let classifier = PageClassifier::new(llm.clone(), config.retry, config.classifier.clone());
        let detector = RecipeDetector::new(classifier.clone(), browser.clone(), config.detector.clone())
            .with_proxy(config.crawl.proxy.clone());
        let orchestrator = Arc::new(build_orchestrator(&store, &queue, &browser, &llm, &config, None));

        Self {
            store,
            queue,
            browser,
            llm,
            classifier,
            detector,
            orchestrator,
            config,
        }
    }

    /// Serve API-provider recipes through `api`.
    pub fn with_api_catalogue(mut self, api: Arc<dyn ApiCatalogue>) -> Self {
        self.orchestrator = Arc::new(build_orchestrator(
            &self.store,
            &self.queue,
            &self.browser,
            &self.llm,
            &self.config,
            Some(api),
        ));
        self.detector = self.detector.with_api_support(true);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> Arc<CrawlOrchestrator> {
        self.orchestrator.clone()
    }

    /// A worker executing this service's crawl jobs.
    pub fn worker(&self, config: JobWorkerConfig) -> JobWorker {
        JobWorker::with_config(self.queue.clone(), self.orchestrator.clone(), config)
    }

    // =========================================================================
    // Catalogues and recipes
    // =========================================================================

    pub async fn create_catalogue(
        &self,
        name: &str,
        url: &str,
        catalogue_type: CatalogueType,
    ) -> Result<Catalogue> {
        let catalogue = Catalogue::new(name, url, catalogue_type);
        self.store.insert_catalogue(&catalogue).await?;
        info!(catalogue_id = %catalogue.id, name, ?catalogue_type, "catalogue created");
        Ok(catalogue)
    }

    /// Create a recipe awaiting detection. The first recipe of a catalogue
    /// becomes its default.
    pub async fn create_recipe(&self, catalogue_id: Uuid, url: &str) -> Result<Recipe> {
        let url = crawlable(url)?;
        let recipe = Recipe::new(catalogue_id, url);
        self.store.insert_recipe(&recipe).await?;
        let recipe = self.store.get_recipe(recipe.id).await?;
        info!(
            recipe_id = %recipe.id,
            catalogue_id = %catalogue_id,
            url = %recipe.url,
            is_default = recipe.is_default,
            "recipe created"
        );
        Ok(recipe)
    }

    /// Detect a recipe's configuration.
    ///
    /// A failed detection is not an error of this call: the recipe is
    /// returned with status `Error` and the reason in `failure_reason`.
    pub async fn detect_recipe(&self, recipe_id: Uuid) -> Result<Recipe> {
        let mut recipe = self.store.get_recipe(recipe_id).await?;
        let catalogue = self.store.get_catalogue(recipe.catalogue_id).await?;

        recipe.status = recipe.status.transition(RecipeDetectionStatus::InProgress)?;
        recipe.failure_reason = None;
        self.store.update_recipe(&recipe).await?;

        match self.detector.detect(&recipe.url, catalogue.catalogue_type).await {
            Ok(configuration) => {
                info!(
                    recipe_id = %recipe_id,
                    depth = configuration.depth(),
                    "recipe detection succeeded"
                );
                recipe.configuration = Some(configuration);
                recipe.status = recipe.status.transition(RecipeDetectionStatus::Success)?;
            }
            Err(e) => {
                warn!(recipe_id = %recipe_id, error = %e, "recipe detection failed");
                recipe.failure_reason = Some(e.to_string());
                recipe.status = recipe.status.transition(RecipeDetectionStatus::Error)?;
            }
        }
        self.store.update_recipe(&recipe).await?;
        self.store.get_recipe(recipe_id).await
    }

    /// Replace a recipe's configuration by hand.
    pub async fn reconfigure_recipe(
        &self,
        recipe_id: Uuid,
        configuration: RecipeConfiguration,
    ) -> Result<Recipe> {
        configuration.validate().map_err(Error::InvalidConfiguration)?;

        let mut recipe = self.store.get_recipe(recipe_id).await?;
        recipe.status = recipe.status.transition(RecipeDetectionStatus::Success)?;
        recipe.configuration = Some(configuration);
        recipe.failure_reason = None;
        self.store.update_recipe(&recipe).await?;
        info!(recipe_id = %recipe_id, "recipe reconfigured");
        self.store.get_recipe(recipe_id).await
    }

    /// Make a recipe its catalogue's only default.
    pub async fn set_default_recipe(&self, recipe_id: Uuid) -> Result<Recipe> {
        let recipe = self.store.set_default_recipe(recipe_id).await?;
        info!(recipe_id = %recipe_id, catalogue_id = %recipe.catalogue_id, "default recipe set");
        Ok(recipe)
    }

    /// Detect the pagination of one page without persisting anything.
    pub async fn preview_pagination(
        &self,
        url: &str,
        catalogue_type: CatalogueType,
    ) -> Result<Option<PaginationConfiguration>> {
        let content = self.fetch_content(url).await?;
        self.classifier
            .detect_pagination(PageInput::from_content(&content, catalogue_type))
            .await
    }

    /// Detect the link pattern of one page and list the links it matches,
    /// without persisting anything.
    pub async fn preview_url_regexp(
        &self,
        url: &str,
        catalogue_type: CatalogueType,
        page_type: PageType,
    ) -> Result<UrlRegexpPreview> {
        let content = self.fetch_content(url).await?;
        let regexp = self
            .classifier
            .detect_url_regexp(PageInput::from_content(&content, catalogue_type), page_type)
            .await?;
        let compiled = Regex::new(&regexp)
            .map_err(|e| Error::InvalidConfiguration(format!("link regexp does not compile: {e}")))?;
        let links = extract_links(&content.markdown, &content.url, &compiled);
        Ok(UrlRegexpPreview { regexp, links })
    }

    // =========================================================================
    // Extractions
    // =========================================================================

    /// Start an extraction of a successfully configured recipe.
    pub async fn start_extraction(&self, recipe_id: Uuid) -> Result<Extraction> {
        let recipe = self.store.get_recipe(recipe_id).await?;
        let configuration = match (&recipe.status, &recipe.configuration) {
            (RecipeDetectionStatus::Success, Some(configuration)) => configuration.clone(),
            _ => {
                return Err(Error::InvalidConfiguration(format!(
                    "recipe {recipe_id} has no usable configuration (status {:?})",
                    recipe.status
                )))
            }
        };

        let mut extraction = Extraction::new(recipe.catalogue_id, recipe.id);
        self.store.insert_extraction(&extraction).await?;
        self.orchestrator
            .seed(&mut extraction, configuration, &recipe.url)
            .await?;
        info!(extraction_id = %extraction.id, recipe_id = %recipe_id, "extraction started");
        self.store.get_extraction(extraction.id).await
    }

    /// Cancel an extraction. Jobs already queued return without effect.
    pub async fn cancel_extraction(&self, extraction_id: Uuid) -> Result<Extraction> {
        let current = self.store.get_extraction(extraction_id).await?;
        let extraction = self
            .store
            .transition_extraction(extraction_id, current.status, ExtractionStatus::Cancelled)
            .await?;
        info!(extraction_id = %extraction_id, "extraction cancelled");
        Ok(extraction)
    }

    /// Re-enqueue only the errored fetches and data extractions.
    pub async fn retry_failed(&self, extraction_id: Uuid) -> Result<usize> {
        self.orchestrator.retry_failed(extraction_id).await
    }

    /// Delete an extraction with its steps, pages, content, dataset and
    /// items. A running extraction is cancelled first.
    pub async fn destroy_extraction(&self, extraction_id: Uuid) -> Result<()> {
        let extraction = self.store.get_extraction(extraction_id).await?;
        if extraction.status.accepts_work() {
            self.cancel_extraction(extraction_id).await?;
        }
        self.store.delete_extraction(extraction_id).await?;
        info!(extraction_id = %extraction_id, "extraction destroyed");
        Ok(())
    }

    /// The extraction with freshly computed completion stats.
    pub async fn extraction_stats(&self, extraction_id: Uuid) -> Result<Extraction> {
        self.orchestrator.refresh_stats(extraction_id).await
    }

    /// Items extracted so far.
    pub async fn extraction_items(&self, extraction_id: Uuid) -> Result<Vec<DataItem>> {
        let extraction = self.store.get_extraction(extraction_id).await?;
        let dataset = self
            .store
            .get_or_create_dataset(extraction.catalogue_id, extraction.id)
            .await?;
        self.store.list_items(dataset.id).await
    }

    /// Move in-progress extractions idle for longer than `max_idle` to
    /// `Stale`. Returns their ids.
    pub async fn mark_stale_extractions(&self, max_idle: Duration) -> Result<Vec<Uuid>> {
        let max_idle = chrono::Duration::from_std(max_idle)
            .map_err(|e| Error::InvalidConfiguration(format!("max idle out of range: {e}")))?;
        let cutoff = Utc::now() - max_idle;

        let mut stale = Vec::new();
        for extraction in self
            .store
            .list_extractions(Some(ExtractionStatus::InProgress))
            .await?
        {
            if extraction.updated_at >= cutoff {
                continue;
            }
            match self
                .store
                .transition_extraction(extraction.id, ExtractionStatus::InProgress, ExtractionStatus::Stale)
                .await
            {
                Ok(_) => {}
                // Completed or cancelled since listing
                Err(Error::Transition(_)) => continue,
                Err(e) => return Err(e),
            }
            warn!(
                extraction_id = %extraction.id,
                last_activity = %extraction.updated_at,
                "extraction marked stale"
            );
            stale.push(extraction.id);
        }
        Ok(stale)
    }

    async fn fetch_content(&self, url: &str) -> Result<PageContent> {
        let url = crawlable(url)?;
        let rendered = self
            .browser
            .fetch(&url, self.config.crawl.proxy.as_deref())
            .await?;
        Ok(PageContent::new(url, self.browser.to_markdown(&rendered.html)).with_screenshot(rendered.screenshot))
    }
}

fn build_orchestrator(
    store: &Arc<dyn Store>,
    queue: &Arc<dyn JobQueue>,
    browser: &Arc<dyn Browser>,
    llm: &Arc<dyn Llm>,
    config: &EngineConfig,
    api: Option<Arc<dyn ApiCatalogue>>,
) -> CrawlOrchestrator {
    let chunker = ContentChunker::new(llm.clone(), config.retry, config.chunker.clone());
    let extractor = EntityExtractor::new(llm.clone(), config.retry, config.extractor.clone());
    let orchestrator = CrawlOrchestrator::new(
        store.clone(),
        queue.clone(),
        browser.clone(),
        llm.clone(),
        chunker,
        extractor,
        config.retry,
        config.crawl.clone(),
    );
    match api {
        Some(api) => orchestrator.with_api_catalogue(api),
        None => orchestrator,
    }
}

fn crawlable(url: &str) -> Result<String> {
    normalize_url(url).ok_or_else(|| Error::InvalidConfiguration(format!("{url} is not a crawlable URL")))
}
