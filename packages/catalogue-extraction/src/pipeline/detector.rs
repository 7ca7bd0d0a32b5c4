//! Recipe configuration detector.
//!
//! Walks a catalogue from its entry page down to its detail pages, one level
//! at a time. At each links-bearing level a random sample of outbound links
//! is fetched and classified; the sample must agree on a single page type
//! before the walk descends through it. The levels are then folded into a
//! [`RecipeConfiguration`] tree.

use futures::future::join_all;
use indexmap::IndexMap;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{DetectionError, Error, Result};
use crate::pipeline::classifier::{PageClassifier, PageInput, PageTypeVerdict};
use crate::pipeline::links::extract_links;
use crate::pipeline::prompts::prompt_version_hash;
use crate::traits::browser::Browser;
use crate::types::catalogue::CatalogueType;
use crate::types::config::DetectorConfig;
use crate::types::page::PageContent;
use crate::types::recipe::{ApiProvider, PageType, PaginationConfiguration, RecipeConfiguration};

/// One links-bearing level found during the walk.
struct LinkLevel {
    page_type: PageType,
    link_regexp: String,
    pagination: Option<PaginationConfiguration>,
}

/// A sampled child page and its classification.
struct ClassifiedChild {
    content: PageContent,
    verdict: PageTypeVerdict,
}

/// Infers a recipe configuration for a previously unseen catalogue.
#[derive(Clone)]
pub struct RecipeDetector {
    classifier: PageClassifier,
    browser: Arc<dyn Browser>,
    config: DetectorConfig,
    proxy: Option<String>,
    /// Whether API-provider recipes can be served.
    api_support: bool,
}

impl RecipeDetector {
    pub fn new(classifier: PageClassifier, browser: Arc<dyn Browser>, config: DetectorConfig) -> Self {
        Self {
            classifier,
            browser,
            config,
            proxy: None,
            api_support: false,
        }
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Answer with an API recipe when a provider signature is found.
    ///
    /// Without it, signature matches are ignored and the pages are
    /// classified as usual.
    pub fn with_api_support(mut self, enabled: bool) -> Self {
        self.api_support = enabled;
        self
    }

    /// Detect the configuration of the catalogue rooted at `url`.
    pub async fn detect(&self, url: &str, catalogue_type: CatalogueType) -> Result<RecipeConfiguration> {
        info!(
            url,
            catalogue_type = ?catalogue_type,
            prompt_version = %prompt_version_hash(),
            "detecting recipe configuration"
        );

        let (html, root) = self.fetch(url).await?;
        match ApiProvider::detect(&html) {
            Some(provider) if self.api_support => {
                info!(url, provider = ?provider, "structured catalogue API detected");
                return Ok(RecipeConfiguration::api(provider));
            }
            Some(provider) => {
                info!(url, provider = ?provider, "catalogue API detected but not configured, detecting pages")
            }
            None => {}
        }

        let mut page = root;
        let mut verdict = self
            .classifier
            .classify_page_type(PageInput::from_content(&page, catalogue_type))
            .await?;
        let mut levels: Vec<LinkLevel> = Vec::new();

        for level in 1.. {
            let page_type = verdict.or_detail();
            if !page_type.has_links() {
                break;
            }
            if level >= self.config.max_levels {
                return Err(DetectionError::ExceededMaxDepth {
                    max_levels: self.config.max_levels,
                }
                .into());
            }

            let (link_level, links) = self.inspect_level(&page, page_type, catalogue_type).await?;
            let children = self.classify_sample(&page.url, &links, catalogue_type).await?;
            let agreed = agreed_page_type(&children)?;
            debug!(level, url = %page.url, child_type = %agreed, "children agree");
            levels.push(link_level);

            // All children agree, so any of them stands for the next level
            let Some(next) = children.into_iter().next() else {
                break;
            };
            page = next.content;
            verdict = next.verdict;
        }

        let configuration = levels
            .into_iter()
            .rev()
            .fold(RecipeConfiguration::detail(), |child, level| {
                let node = RecipeConfiguration::links(level.page_type, level.link_regexp, child);
                match level.pagination {
                    Some(pagination) => node.with_pagination(pagination),
                    None => node,
                }
            });
        info!(url, depth = configuration.depth(), "recipe configuration detected");
        Ok(configuration)
    }

    /// Pagination, link pattern and discovered links of a links-bearing page.
    async fn inspect_level(
        &self,
        page: &PageContent,
        page_type: PageType,
        catalogue_type: CatalogueType,
    ) -> Result<(LinkLevel, Vec<String>)> {
        let input = PageInput::from_content(page, catalogue_type);
        let pagination = self.classifier.detect_pagination(input).await?;

        let link_regexp = match self.classifier.detect_url_regexp(input, page_type).await {
            Ok(regexp) => regexp,
            Err(e) if e.is_retryable() => {
                warn!(url = %page.url, error = %e, "link pattern not detected");
                return Err(DetectionError::LinkPatternMissing {
                    url: page.url.clone(),
                }
                .into());
            }
            Err(e) => return Err(e),
        };

        let regexp = Regex::new(&link_regexp)
            .map_err(|e| DetectionError::bad_response(format!("regexp does not compile: {e}")))?;
        let links = extract_links(&page.markdown, &page.url, &regexp);
        if links.is_empty() {
            return Err(DetectionError::NoLinks {
                url: page.url.clone(),
            }
            .into());
        }
        debug!(url = %page.url, links = links.len(), "links discovered");

        Ok((
            LinkLevel {
                page_type,
                link_regexp,
                pagination,
            },
            links,
        ))
    }

    /// Fetch and classify a random sample of `links` concurrently.
    ///
    /// Children that fail to fetch are skipped.
    async fn classify_sample(
        &self,
        parent_url: &str,
        links: &[String],
        catalogue_type: CatalogueType,
    ) -> Result<Vec<ClassifiedChild>> {
        let sample = sample_links(links, self.config.sample_size);
        let futures = sample.iter().map(|url| async move {
            let content = match self.fetch(url).await {
                Ok((_, content)) => content,
                Err(e) => {
                    warn!(url = %url, error = %e, "sampled child fetch failed, skipping");
                    return Ok(None);
                }
            };
            let verdict = self
                .classifier
                .classify_page_type(PageInput::from_content(&content, catalogue_type))
                .await?;
            Ok::<_, Error>(Some(ClassifiedChild { content, verdict }))
        });

        let mut children = Vec::with_capacity(sample.len());
        for outcome in join_all(futures).await {
            if let Some(child) = outcome? {
                children.push(child);
            }
        }

        if children.is_empty() {
            return Err(DetectionError::ChildrenUnavailable {
                url: parent_url.to_string(),
            }
            .into());
        }
        Ok(children)
    }

    async fn fetch(&self, url: &str) -> Result<(String, PageContent)> {
        let rendered = self.browser.fetch(url, self.proxy.as_deref()).await?;
        let markdown = self.browser.to_markdown(&rendered.html);
        let content = PageContent::new(rendered.url, markdown).with_screenshot(rendered.screenshot);
        Ok((rendered.html, content))
    }
}

/// Up to `size` links picked at random.
fn sample_links(links: &[String], size: usize) -> Vec<String> {
    let mut sample = links.to_vec();
    fastrand::shuffle(&mut sample);
    sample.truncate(size.max(1));
    sample
}

/// The single page type every child agrees on. Undetectable children count
/// as DETAIL.
fn agreed_page_type(children: &[ClassifiedChild]) -> std::result::Result<PageType, DetectionError> {
    let mut counts: IndexMap<PageType, usize> = IndexMap::new();
    for child in children {
        *counts.entry(child.verdict.or_detail()).or_default() += 1;
    }

    match counts.len() {
        1 => Ok(*counts.keys().next().unwrap_or(&PageType::Detail)),
        _ => {
            let summary = counts
                .iter()
                .map(|(page_type, count)| format!("{page_type} x{count}"))
                .collect::<Vec<_>>()
                .join(", ");
            Err(DetectionError::MixedContent { summary })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBrowser, MockLlm};
    use crate::types::config::{ClassifierConfig, RetryPolicy};

    const INDEX_URL: &str = "https://a.edu/courses";

    fn index_page(ids: &[u32]) -> String {
        let mut page = String::from("# Courses\n\n");
        for id in ids {
            page.push_str(&format!("[BIO {id}](/course/{id})\n"));
        }
        page
    }

    fn detector(llm: &MockLlm, browser: MockBrowser, config: DetectorConfig) -> RecipeDetector {
        let classifier = PageClassifier::new(
            Arc::new(llm.clone()),
            RetryPolicy::immediate(1),
            ClassifierConfig::default().with_votes(1),
        );
        RecipeDetector::new(classifier, Arc::new(browser), config)
    }

    fn course_site(ids: &[u32]) -> MockBrowser {
        let mut browser = MockBrowser::new().with_page(INDEX_URL, index_page(ids));
        for id in ids {
            browser = browser.with_page(
                format!("https://a.edu/course/{id}"),
                format!("# BIO {id}\n\nA course."),
            );
        }
        browser
    }

    #[tokio::test]
    async fn test_index_of_detail_pages() {
        let ids = [101, 102, 103];
        let llm = MockLlm::new()
            .with_page_type("DETAIL_LINKS")
            .with_no_pagination()
            .with_url_regexp(r"/course/\d+", &["/course/101"])
            .with_default_page_type("DETAIL");
        let config = detector(&llm, course_site(&ids), DetectorConfig::default())
            .detect(INDEX_URL, CatalogueType::Courses)
            .await
            .unwrap();

        assert_eq!(
            config,
            RecipeConfiguration::links(PageType::DetailLinks, r"/course/\d+", RecipeConfiguration::detail())
        );
        assert_eq!(llm.calls_for(crate::traits::llm::LlmTask::ClassifyPageType), 4);
    }

    #[tokio::test]
    async fn test_sample_is_bounded() {
        let ids: Vec<u32> = (100..130).collect();
        let llm = MockLlm::new()
            .with_page_type("DETAIL_LINKS")
            .with_no_pagination()
            .with_url_regexp(r"/course/\d+", &["/course/100"])
            .with_default_page_type("DETAIL");
        let browser = course_site(&ids);
        detector(&llm, browser.clone(), DetectorConfig::default().with_sample_size(5))
            .detect(INDEX_URL, CatalogueType::Courses)
            .await
            .unwrap();
        // Root plus five sampled children
        assert_eq!(browser.fetched().len(), 6);
    }

    #[tokio::test]
    async fn test_disagreeing_children_are_mixed_content() {
        let ids = [101, 102];
        let llm = MockLlm::new()
            .with_page_type("DETAIL_LINKS")
            .with_no_pagination()
            .with_url_regexp(r"/course/\d+", &["/course/101"])
            .with_page_type("DETAIL")
            .with_page_type("CATEGORY_LINKS");
        let err = detector(&llm, course_site(&ids), DetectorConfig::default())
            .detect(INDEX_URL, CatalogueType::Courses)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Detection(DetectionError::MixedContent { .. })));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unknown_children_count_as_detail() {
        let ids = [101, 102];
        let llm = MockLlm::new()
            .with_page_type("DETAIL_LINKS")
            .with_no_pagination()
            .with_url_regexp(r"/course/\d+", &["/course/101"])
            .with_page_type("UNKNOWN")
            .with_page_type("DETAIL");
        let config = detector(&llm, course_site(&ids), DetectorConfig::default())
            .detect(INDEX_URL, CatalogueType::Courses)
            .await
            .unwrap();
        assert_eq!(config.depth(), 2);
    }

    #[tokio::test]
    async fn test_depth_bound() {
        let ids = [101];
        let llm = MockLlm::new()
            .with_page_type("CATEGORY_LINKS")
            .with_no_pagination()
            .with_url_regexp(r"/course/\d+", &["/course/101"])
            .with_page_type("DETAIL_LINKS");
        let err = detector(&llm, course_site(&ids), DetectorConfig::default().with_max_levels(2))
            .detect(INDEX_URL, CatalogueType::Courses)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Detection(DetectionError::ExceededMaxDepth { max_levels: 2 })
        ));
    }

    #[tokio::test]
    async fn test_api_provider_short_circuits() {
        let browser = MockBrowser::new().with_page(
            INDEX_URL,
            r#"<script src="https://app.coursedog.com/embed.js"></script>"#,
        );
        let llm = MockLlm::new();
        let config = detector(&llm, browser, DetectorConfig::default())
            .with_api_support(true)
            .detect(INDEX_URL, CatalogueType::Courses)
            .await
            .unwrap();
        assert_eq!(config.api_provider, Some(ApiProvider::Coursedog));
        assert_eq!(llm.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_api_signature_without_api_support_classifies_pages() {
        let browser = MockBrowser::new().with_page(
            INDEX_URL,
            r#"<script src="https://app.coursedog.com/embed.js"></script><h1>BIO 101</h1>"#,
        );
        let llm = MockLlm::new().with_page_type("DETAIL");
        let config = detector(&llm, browser, DetectorConfig::default())
            .detect(INDEX_URL, CatalogueType::Courses)
            .await
            .unwrap();
        assert_eq!(config, RecipeConfiguration::detail());
        assert_eq!(config.api_provider, None);
        assert_eq!(llm.calls_for(crate::traits::llm::LlmTask::ClassifyPageType), 1);
    }

    #[tokio::test]
    async fn test_missing_link_pattern() {
        let llm = MockLlm::new()
            .with_page_type("DETAIL_LINKS")
            .with_no_pagination()
            .with_url_regexp("/course/(", &[]);
        let err = detector(&llm, course_site(&[101]), DetectorConfig::default())
            .detect(INDEX_URL, CatalogueType::Courses)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Detection(DetectionError::LinkPatternMissing { .. })));
    }

    #[tokio::test]
    async fn test_pattern_without_crawlable_links() {
        let browser = MockBrowser::new().with_page(INDEX_URL, "Contact mailto:registrar@a.edu");
        let llm = MockLlm::new()
            .with_page_type("DETAIL_LINKS")
            .with_no_pagination()
            .with_url_regexp(r"mailto:\S+", &["mailto:registrar@a.edu"]);
        let err = detector(&llm, browser, DetectorConfig::default())
            .detect(INDEX_URL, CatalogueType::Courses)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Detection(DetectionError::NoLinks { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_children() {
        let browser = MockBrowser::new().with_page(INDEX_URL, index_page(&[101, 102]));
        let llm = MockLlm::new()
            .with_page_type("DETAIL_LINKS")
            .with_no_pagination()
            .with_url_regexp(r"/course/\d+", &["/course/101"]);
        let err = detector(&llm, browser, DetectorConfig::default())
            .detect(INDEX_URL, CatalogueType::Courses)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Detection(DetectionError::ChildrenUnavailable { .. })));
    }
}
