//! Crawl orchestrator - executes a recipe as page-fetch and data-extraction
//! jobs.
//!
//! The orchestrator owns no in-memory crawl state. Every job reloads its
//! extraction, step and page from the store, so any number of workers can
//! run it and a cancelled extraction is noticed at the next job's entry.
//!
//! ```text
//! seed ─► FetchPage(root)
//!            ├─ DETAIL ─────────► ExtractData(page) ─► DataItems
//!            ├─ pagination ─────► FetchPage(page 2..n)   [FETCH_PAGINATED]
//!            └─ link pattern ───► FetchPage(link)        [FETCH_LINKS]
//! ```

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::consensus::exponential_retry;
use crate::crawl::jobs::{CrawlJob, EXTRACT_DATA_QUEUE, FETCH_PAGE_QUEUE};
use crate::error::{Error, Result};
use crate::jobs::worker::JobHandler;
use crate::pipeline::chunker::ContentChunker;
use crate::pipeline::extractor::EntityExtractor;
use crate::pipeline::links::{extract_links, normalize_url, resolve_link};
use crate::pipeline::prompts::{format_discover_related_links_prompt, SYSTEM_PROMPT};
use crate::pipeline::responses::{self, decode, RelatedLinksArgs};
use crate::traits::browser::{ApiCatalogue, Browser};
use crate::traits::llm::{Llm, LlmTask, ToolRequest};
use crate::traits::queue::{ClaimedJob, JobOptions, JobQueue};
use crate::traits::store::Store;
use crate::types::catalogue::{Catalogue, CatalogueType};
use crate::types::config::{CrawlConfig, RetryPolicy};
use crate::types::extraction::{
    CompletionStats, CrawlPage, CrawlStep, Extraction, StepKind, TokenUsage,
};
use crate::types::item::DataItem;
use crate::types::page::PageContent;
use crate::types::recipe::{ApiProvider, PageType, RecipeConfiguration};
use crate::types::status::{ExtractionStatus, Lifecycle, PageStatus};

/// Which of a page's two jobs an outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fetch,
    Data,
}

/// Executes recipes as queued jobs.
pub struct CrawlOrchestrator {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    browser: Arc<dyn Browser>,
    llm: Arc<dyn Llm>,
    api: Option<Arc<dyn ApiCatalogue>>,
    chunker: ContentChunker,
    extractor: EntityExtractor,
    retry: RetryPolicy,
    config: CrawlConfig,
}

impl CrawlOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        browser: Arc<dyn Browser>,
        llm: Arc<dyn Llm>,
        chunker: ContentChunker,
        extractor: EntityExtractor,
        retry: RetryPolicy,
        config: CrawlConfig,
    ) -> Self {
        Self {
            store,
            queue,
            browser,
            llm,
            api: None,
            chunker,
            extractor,
            retry,
            config,
        }
    }

    /// Serve API-provider configurations through `api`.
    pub fn with_api_catalogue(mut self, api: Arc<dyn ApiCatalogue>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    /// Start `extraction` at `url` with `configuration`: create the root
    /// step and page and enqueue the root fetch.
    pub async fn seed(
        &self,
        extraction: &mut Extraction,
        configuration: RecipeConfiguration,
        url: &str,
    ) -> Result<CrawlPage> {
        let url = normalize_url(url)
            .ok_or_else(|| Error::InvalidConfiguration(format!("recipe URL {url} is not crawlable")))?;

        *extraction = self
            .store
            .transition_extraction(extraction.id, extraction.status, ExtractionStatus::InProgress)
            .await?;

        let root = CrawlStep::root(extraction.id, configuration);
        self.store.insert_step(&root).await?;

        let page = CrawlPage::new(&root, &url);
        self.store.insert_page_if_absent(&page).await?;
        self.submit(
            CrawlJob::FetchPage {
                extraction_id: extraction.id,
                page_id: page.id,
            },
            &url,
            JobOptions::default(),
        )
        .await?;

        info!(extraction_id = %extraction.id, step_id = %root.id, url = %url, "extraction seeded");
        Ok(page)
    }

    /// Re-enqueue every errored fetch and data extraction of an extraction.
    ///
    /// Returns the number of jobs enqueued.
    pub async fn retry_failed(&self, extraction_id: Uuid) -> Result<usize> {
        let extraction = self.store.get_extraction(extraction_id).await?;
        if extraction.status != ExtractionStatus::InProgress {
            self.store
                .transition_extraction(extraction_id, extraction.status, ExtractionStatus::InProgress)
                .await?;
        }

        let mut enqueued = 0;
        for mut page in self.store.list_pages(extraction_id).await? {
            if page.status == PageStatus::Error {
                page.status = page.status.transition(PageStatus::Waiting)?;
                page.fetch_failure_reason = None;
                self.store.update_page(&page).await?;
                self.submit(
                    CrawlJob::FetchPage {
                        extraction_id,
                        page_id: page.id,
                    },
                    &page.url,
                    JobOptions::default(),
                )
                .await?;
                enqueued += 1;
            } else if page.data_status == Some(PageStatus::Error) {
                page.data_status = Some(PageStatus::Error.transition(PageStatus::Waiting)?);
                page.data_failure_reason = None;
                self.store.update_page(&page).await?;
                self.submit(
                    CrawlJob::ExtractData {
                        extraction_id,
                        page_id: page.id,
                    },
                    &page.url,
                    JobOptions::default(),
                )
                .await?;
                enqueued += 1;
            }
        }

        info!(extraction_id = %extraction_id, enqueued, "retrying failed items");
        if enqueued == 0 {
            self.maybe_complete(extraction_id).await?;
        }
        Ok(enqueued)
    }

    /// Recompute the completion stats of an extraction.
    ///
    /// Only the stats are written, so a status change made meanwhile by a
    /// job or an operator is kept.
    pub async fn refresh_stats(&self, extraction_id: Uuid) -> Result<Extraction> {
        let steps = self.store.list_steps(extraction_id).await?;
        let pages = self.store.list_pages(extraction_id).await?;
        let stats = CompletionStats::compute(&steps, &pages);
        self.store.set_completion_stats(extraction_id, &stats).await?;
        self.store.get_extraction(extraction_id).await
    }

    // =========================================================================
    // Fetch jobs
    // =========================================================================

    async fn handle_fetch(&self, job: &ClaimedJob, extraction_id: Uuid, page_id: Uuid) -> Result<()> {
        let Some(extraction) = self.active_extraction(extraction_id).await? else {
            return Ok(());
        };

        let mut page = self.store.get_page(page_id).await?;
        if page.status.is_terminal() {
            debug!(page_id = %page_id, status = ?page.status, "page already fetched");
            return Ok(());
        }
        page.status = page.status.transition(PageStatus::InProgress)?;
        self.store.update_page(&page).await?;

        let outcome = self.fetch_and_expand(&extraction, &mut page).await;
        self.settle(job, page_id, Phase::Fetch, outcome).await
    }

    async fn fetch_and_expand(&self, extraction: &Extraction, page: &mut CrawlPage) -> Result<()> {
        let step = self.store.get_step(page.crawl_step_id).await?;
        let rendered = self
            .browser
            .fetch(&page.url, self.config.proxy.as_deref())
            .await?;

        if self.active_extraction(extraction.id).await?.is_none() {
            return Err(Error::Cancelled);
        }

        let content = PageContent::new(&page.url, self.browser.to_markdown(&rendered.html))
            .with_screenshot(rendered.screenshot);
        self.store.put_content(page.id, &content).await?;
        debug!(
            page_id = %page.id,
            url = %page.url,
            tokens = content.estimated_tokens(),
            "page content stored"
        );

        if let Some(provider) = step.configuration.api_provider {
            return self.import_from_api(extraction, &step, page, provider).await;
        }

        match step.configuration.page_type {
            PageType::Detail => {
                page.data_status = Some(PageStatus::Waiting);
                self.store.update_page(page).await?;
                self.submit(
                    CrawlJob::ExtractData {
                        extraction_id: extraction.id,
                        page_id: page.id,
                    },
                    &page.url,
                    JobOptions::default(),
                )
                .await?;

                let catalogue = self.store.get_catalogue(extraction.catalogue_id).await?;
                if catalogue.catalogue_type.is_exploratory() {
                    self.discover_related(extraction, &step, page, &content, catalogue.catalogue_type)
                        .await?;
                }
            }
            PageType::DetailLinks | PageType::CategoryLinks => {
                self.expand_pagination(&step, page).await?;
                self.expand_links(&step, page, &content).await?;
            }
        }
        Ok(())
    }

    /// Enqueue the other pages of a paginated index. Pages reached through
    /// pagination are not paginated again.
    async fn expand_pagination(&self, step: &CrawlStep, page: &CrawlPage) -> Result<()> {
        if step.step == StepKind::FetchPaginated {
            return Ok(());
        }
        let Some(pagination) = &step.configuration.pagination else {
            return Ok(());
        };

        let child = step.child(StepKind::FetchPaginated, step.configuration.clone());
        let enqueued = self.enqueue_children(&child, pagination.page_urls()).await?;
        info!(
            page_id = %page.id,
            total_pages = pagination.total_pages,
            enqueued,
            "pagination expanded"
        );
        Ok(())
    }

    /// Enqueue the pages matched by the step's link pattern.
    async fn expand_links(&self, step: &CrawlStep, page: &CrawlPage, content: &PageContent) -> Result<()> {
        let configuration = &step.configuration;
        let pattern = configuration.link_regexp.as_deref().ok_or_else(|| {
            Error::InvalidConfiguration(format!("{} step has no link regexp", configuration.page_type))
        })?;
        let links_configuration = configuration.links.as_deref().ok_or_else(|| {
            Error::InvalidConfiguration(format!("{} step has no links level", configuration.page_type))
        })?;
        let regexp = Regex::new(pattern)
            .map_err(|e| Error::InvalidConfiguration(format!("link regexp does not compile: {e}")))?;

        let links = extract_links(&content.markdown, &page.url, &regexp);
        let child = step.child(StepKind::FetchLinks, links_configuration.clone());
        let enqueued = self.enqueue_children(&child, links.clone()).await?;
        info!(
            page_id = %page.id,
            url = %page.url,
            links = links.len(),
            enqueued,
            "links expanded"
        );
        Ok(())
    }

    /// Ask the model for related pages of an exploratory catalogue.
    async fn discover_related(
        &self,
        extraction: &Extraction,
        step: &CrawlStep,
        page: &CrawlPage,
        content: &PageContent,
        catalogue_type: CatalogueType,
    ) -> Result<()> {
        if step.depth >= self.config.max_step_depth {
            debug!(page_id = %page.id, depth = step.depth, "exploration depth reached");
            return Ok(());
        }

        let llm = &self.llm;
        let prompt = format_discover_related_links_prompt(catalogue_type, &page.url, &content.markdown);
        let prompt = &prompt;
        let response = exponential_retry(&self.retry, LlmTask::DiscoverRelatedLinks.as_str(), move || {
            let request = ToolRequest {
                task: LlmTask::DiscoverRelatedLinks,
                system: SYSTEM_PROMPT.to_string(),
                prompt: prompt.clone(),
                image: None,
                tool: responses::related_links_tool(),
            };
            async move { llm.call_tool(request).await.map_err(Error::from) }
        })
        .await?;
        self.store
            .add_token_usage(extraction.id, response.usage)
            .await?;

        let urls = decode::<RelatedLinksArgs>(response.output)?
            .map(|args| args.urls)
            .unwrap_or_default();
        let links = traceable_links(&urls, &page.url, &content.markdown);
        if links.is_empty() {
            return Ok(());
        }

        let child = step.child(StepKind::FetchLinks, RecipeConfiguration::detail());
        let enqueued = self.enqueue_children(&child, links).await?;
        info!(page_id = %page.id, enqueued, "related pages discovered");
        Ok(())
    }

    /// Enqueue unseen `urls` under `child` (or its existing equivalent).
    async fn enqueue_children(&self, child: &CrawlStep, urls: Vec<String>) -> Result<usize> {
        if urls.is_empty() {
            return Ok(0);
        }
        if child.depth > self.config.max_step_depth {
            warn!(
                parent_step_id = ?child.parent_step_id,
                depth = child.depth,
                max_step_depth = self.config.max_step_depth,
                "step depth limit reached, not enqueuing"
            );
            return Ok(0);
        }

        let step = self.store.get_or_insert_child_step(child).await?;
        let options = JobOptions::default()
            .with_delay(self.config.child_delay)
            .with_lifo(self.config.lifo)
            .with_max_attempts(self.config.max_job_attempts);

        let mut jobs = Vec::new();
        for url in urls {
            let Some(url) = normalize_url(&url) else {
                continue;
            };
            let page = CrawlPage::new(&step, &url);
            if !self.store.insert_page_if_absent(&page).await? {
                continue;
            }
            let job = CrawlJob::FetchPage {
                extraction_id: step.extraction_id,
                page_id: page.id,
            };
            jobs.push((job.to_payload(), Some(job.dedup_key(&url))));
        }

        let enqueued = jobs.len();
        if enqueued > 0 {
            self.queue.submit_jobs(FETCH_PAGE_QUEUE, jobs, options).await?;
        }
        debug!(step_id = %step.id, depth = step.depth, enqueued, "child pages enqueued");
        Ok(enqueued)
    }

    /// Import the entities of an API-backed catalogue in place of crawling.
    async fn import_from_api(
        &self,
        extraction: &Extraction,
        step: &CrawlStep,
        page: &mut CrawlPage,
        provider: ApiProvider,
    ) -> Result<()> {
        let api = self.api.as_ref().ok_or_else(|| {
            Error::InvalidConfiguration(format!(
                "no API catalogue collaborator configured for {provider:?}"
            ))
        })?;
        let catalogue = self.store.get_catalogue(extraction.catalogue_id).await?;
        let entities = api
            .fetch_entities(provider, &page.url, catalogue.catalogue_type)
            .await?;

        let dataset = self
            .store
            .get_or_create_dataset(extraction.catalogue_id, extraction.id)
            .await?;
        let items: Vec<DataItem> = entities
            .into_iter()
            .map(|fields| DataItem {
                id: Uuid::new_v4(),
                dataset_id: dataset.id,
                crawl_page_id: page.id,
                entity_type: catalogue.catalogue_type.entity_name().to_string(),
                fields,
                text_inclusion: Default::default(),
                verified: true,
                created_at: Utc::now(),
            })
            .collect();
        self.store.replace_items(page.id, &items).await?;
        info!(
            page_id = %page.id,
            step_id = %step.id,
            provider = ?provider,
            items = items.len(),
            "entities imported from catalogue API"
        );
        Ok(())
    }

    // =========================================================================
    // Data extraction jobs
    // =========================================================================

    async fn handle_extract(&self, job: &ClaimedJob, extraction_id: Uuid, page_id: Uuid) -> Result<()> {
        let Some(extraction) = self.active_extraction(extraction_id).await? else {
            return Ok(());
        };

        let mut page = self.store.get_page(page_id).await?;
        let data_status = page.data_status.unwrap_or_default();
        if data_status.is_terminal() {
            debug!(page_id = %page_id, status = ?data_status, "page data already extracted");
            return Ok(());
        }
        page.data_status = Some(data_status.transition(PageStatus::InProgress)?);
        page.data_extraction_started_at = Some(Utc::now());
        self.store.update_page(&page).await?;

        let outcome = self.extract_page(&extraction, &page).await;
        self.settle(job, page_id, Phase::Data, outcome).await
    }

    async fn extract_page(&self, extraction: &Extraction, page: &CrawlPage) -> Result<()> {
        let content = self
            .store
            .get_content(page.id)
            .await?
            .ok_or_else(|| crate::error::StoreError::not_found("page content", page.id))?;
        let catalogue: Catalogue = self.store.get_catalogue(extraction.catalogue_id).await?;

        let mut usage = TokenUsage::default();
        let outcome = self
            .extractor
            .extract_document(&self.chunker, &content.markdown, catalogue.catalogue_type, &mut usage)
            .await;
        if usage.total() > 0 {
            self.store.add_token_usage(extraction.id, usage).await?;
        }
        let entities = outcome?;

        let dataset = self
            .store
            .get_or_create_dataset(catalogue.id, extraction.id)
            .await?;
        let items: Vec<DataItem> = entities
            .into_iter()
            .map(|entity| DataItem {
                id: Uuid::new_v4(),
                dataset_id: dataset.id,
                crawl_page_id: page.id,
                entity_type: catalogue.catalogue_type.entity_name().to_string(),
                fields: entity.fields,
                text_inclusion: entity.inclusion,
                verified: entity.verified,
                created_at: Utc::now(),
            })
            .collect();
        self.store.replace_items(page.id, &items).await?;

        let verified = items.iter().filter(|item| item.verified).count();
        info!(
            extraction_id = %extraction.id,
            page_id = %page.id,
            items = items.len(),
            verified,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "page data extracted"
        );
        Ok(())
    }

    // =========================================================================
    // Shared job plumbing
    // =========================================================================

    /// The extraction if it still accepts work.
    async fn active_extraction(&self, extraction_id: Uuid) -> Result<Option<Extraction>> {
        let extraction = self.store.get_extraction(extraction_id).await?;
        if extraction.status.accepts_work() {
            Ok(Some(extraction))
        } else {
            info!(
                extraction_id = %extraction_id,
                status = ?extraction.status,
                "extraction no longer accepts work, skipping job"
            );
            Ok(None)
        }
    }

    /// Record the outcome of a job on its page.
    ///
    /// The page is reloaded so that only the fields of `phase` are written.
    /// A retryable failure with attempts left puts the page back to waiting
    /// and returns the error so the queue reschedules the job. Any other
    /// failure is recorded on the page; the error is still returned so the
    /// queue drops the job.
    async fn settle(
        &self,
        job: &ClaimedJob,
        page_id: Uuid,
        phase: Phase,
        outcome: Result<()>,
    ) -> Result<()> {
        let mut page = self.store.get_page(page_id).await?;
        let (status, reason) = match &outcome {
            Ok(()) => (PageStatus::Success, None),
            Err(Error::Cancelled) => {
                debug!(page_id = %page.id, ?phase, "extraction cancelled during job");
                (PageStatus::Waiting, None)
            }
            Err(e) if e.is_retryable() && !job.is_final_attempt() => {
                warn!(
                    page_id = %page.id,
                    url = %page.url,
                    ?phase,
                    attempt = job.attempt,
                    error = %e,
                    "page job failed, will retry"
                );
                (PageStatus::Waiting, None)
            }
            Err(e) => {
                error!(
                    page_id = %page.id,
                    url = %page.url,
                    ?phase,
                    attempt = job.attempt,
                    error = %e,
                    "page job failed"
                );
                (PageStatus::Error, Some(e.to_string()))
            }
        };

        match phase {
            Phase::Fetch => {
                page.status = page.status.transition(status)?;
                page.fetch_failure_reason = reason;
            }
            Phase::Data => {
                let current = page.data_status.unwrap_or(PageStatus::InProgress);
                page.data_status = Some(current.transition(status)?);
                page.data_failure_reason = reason;
            }
        }
        page.updated_at = Utc::now();
        self.store.update_page(&page).await?;

        if matches!(outcome, Err(Error::Cancelled)) {
            return Ok(());
        }
        self.store.touch_extraction(page.extraction_id, Utc::now()).await?;
        if status.is_terminal() {
            self.maybe_complete(page.extraction_id).await?;
        }
        outcome
    }

    /// Complete the extraction once no page has outstanding work.
    async fn maybe_complete(&self, extraction_id: Uuid) -> Result<()> {
        let pages = self.store.list_pages(extraction_id).await?;
        if !pages.iter().all(CrawlPage::is_settled) {
            return Ok(());
        }

        let steps = self.store.list_steps(extraction_id).await?;
        let stats = CompletionStats::compute(&steps, &pages);
        match self
            .store
            .transition_extraction(extraction_id, ExtractionStatus::InProgress, ExtractionStatus::Complete)
            .await
        {
            Ok(_) => {}
            // Cancelled, stale, or completed by a sibling job
            Err(Error::Transition(e)) => {
                debug!(extraction_id = %extraction_id, error = %e, "extraction not completed");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.store.set_completion_stats(extraction_id, &stats).await?;

        info!(
            extraction_id = %extraction_id,
            pages = pages.len(),
            downloads_succeeded = stats.downloads_succeeded(),
            extractions_succeeded = stats.extractions_succeeded(),
            "extraction complete"
        );
        Ok(())
    }

    async fn submit(&self, job: CrawlJob, url: &str, options: JobOptions) -> Result<()> {
        let options = options
            .with_dedup_key(job.dedup_key(url))
            .with_max_attempts(self.config.max_job_attempts);
        let result = self.queue.submit_job(job.queue(), job.to_payload(), options).await?;
        if !result.is_created() {
            debug!(job_id = %result.job_id(), url, "job already queued");
        }
        Ok(())
    }
}

/// URLs from the model that can be found on the page, resolved and
/// normalized.
fn traceable_links(urls: &[String], page_url: &str, content: &str) -> Vec<String> {
    let Ok(base) = Url::parse(page_url) else {
        return Vec::new();
    };
    urls.iter()
        .filter(|url| content.contains(url.as_str()))
        .filter_map(|url| resolve_link(&base, url))
        .collect()
}

#[async_trait]
impl JobHandler for CrawlOrchestrator {
    fn queues(&self) -> Vec<&'static str> {
        // Finish extracting fetched pages before fetching more
        vec![EXTRACT_DATA_QUEUE, FETCH_PAGE_QUEUE]
    }

    async fn handle(&self, job: &ClaimedJob) -> Result<()> {
        match job.deserialize::<CrawlJob>()? {
            CrawlJob::FetchPage {
                extraction_id,
                page_id,
            } => self.handle_fetch(job, extraction_id, page_id).await,
            CrawlJob::ExtractData {
                extraction_id,
                page_id,
            } => self.handle_extract(job, extraction_id, page_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traceable_links_must_appear_in_content() {
        let content = "See [outcomes](/outcomes/math) and the [home page](https://a.edu)";
        let links = traceable_links(
            &[
                "/outcomes/math".to_string(),
                "/outcomes/invented".to_string(),
            ],
            "https://a.edu/programs/math",
            content,
        );
        assert_eq!(links, vec!["https://a.edu/outcomes/math"]);
    }
}
