//! Page classifier - role, pagination and link pattern of a catalogue page.
//!
//! Each step is voted on with [`best_out_of`], and each vote is retried with
//! [`exponential_retry`]. Model answers are decoded into closed response
//! types and then checked against the page content; an answer that cannot be
//! traced back to the page is a bad response and gets retried.

use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::consensus::{best_out_of, exponential_retry};
use crate::error::{DetectionError, Error, Result};
use crate::pipeline::links::{raw_matches, resolve_link};
use crate::pipeline::prompts::{
    format_classify_page_type_prompt, format_detect_pagination_prompt,
    format_detect_url_regexp_prompt, SYSTEM_PROMPT,
};
use crate::pipeline::responses::{
    self, decode, decode_required, PageTypeAnswer, PageTypeArgs, PaginationArgs, UrlRegexpArgs,
};
use crate::traits::llm::{Llm, LlmTask, ToolRequest, ToolResponse, ToolSchema};
use crate::types::catalogue::CatalogueType;
use crate::types::config::{ClassifierConfig, RetryPolicy};
use crate::types::page::PageContent;
use crate::types::recipe::{PageType, PaginationConfiguration, UrlPatternType};

/// Outcome of page type classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageTypeVerdict {
    Known(PageType),
    /// The model could not place the page
    Unknown,
}

impl PageTypeVerdict {
    /// The page type, defaulting an undetectable page to DETAIL.
    pub fn or_detail(self) -> PageType {
        match self {
            PageTypeVerdict::Known(page_type) => page_type,
            PageTypeVerdict::Unknown => PageType::Detail,
        }
    }
}

/// A page handed to the classifier.
#[derive(Debug, Clone, Copy)]
pub struct PageInput<'a> {
    pub url: &'a str,
    pub content: &'a str,
    pub screenshot: Option<&'a str>,
    pub catalogue_type: CatalogueType,
}

impl<'a> PageInput<'a> {
    pub fn new(url: &'a str, content: &'a str, catalogue_type: CatalogueType) -> Self {
        Self {
            url,
            content,
            screenshot: None,
            catalogue_type,
        }
    }

    pub fn from_content(content: &'a PageContent, catalogue_type: CatalogueType) -> Self {
        Self {
            url: &content.url,
            content: &content.markdown,
            screenshot: content.screenshot.as_deref(),
            catalogue_type,
        }
    }
}

/// Full classification of one page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageClassification {
    pub verdict: PageTypeVerdict,
    pub pagination: Option<PaginationConfiguration>,
    /// Set for links-bearing pages when a pattern was found
    pub link_regexp: Option<String>,
}

/// LLM-backed page classifier.
#[derive(Clone)]
pub struct PageClassifier {
    llm: Arc<dyn Llm>,
    retry: RetryPolicy,
    config: ClassifierConfig,
}

impl PageClassifier {
    pub fn new(llm: Arc<dyn Llm>, retry: RetryPolicy, config: ClassifierConfig) -> Self {
        Self { llm, retry, config }
    }

    /// Run every classification step that applies to the page.
    ///
    /// A links-bearing page whose link pattern could not be detected comes
    /// back with `link_regexp: None`.
    pub async fn classify(&self, page: PageInput<'_>) -> Result<PageClassification> {
        let verdict = self.classify_page_type(page).await?;
        let page_type = verdict.or_detail();
        if !page_type.has_links() {
            return Ok(PageClassification {
                verdict,
                pagination: None,
                link_regexp: None,
            });
        }

        let pagination = self.detect_pagination(page).await?;
        let link_regexp = match self.detect_url_regexp(page, page_type).await {
            Ok(regexp) => Some(regexp),
            Err(e) if e.is_retryable() => {
                info!(url = page.url, error = %e, "link pattern not detected");
                None
            }
            Err(e) => return Err(e),
        };

        Ok(PageClassification {
            verdict,
            pagination,
            link_regexp,
        })
    }

    /// Classify the page's role.
    pub async fn classify_page_type(&self, page: PageInput<'_>) -> Result<PageTypeVerdict> {
        let this = self;
        let verdict = best_out_of(
            self.config.votes,
            LlmTask::ClassifyPageType.as_str(),
            move || {
                exponential_retry(&this.retry, LlmTask::ClassifyPageType.as_str(), move || {
                    this.classify_page_type_once(page)
                })
            },
            |verdict| *verdict,
        )
        .await?;
        info!(url = page.url, ?verdict, "page type classified");
        Ok(verdict)
    }

    /// Detect the pagination scheme. `None` means the page is not paginated.
    pub async fn detect_pagination(
        &self,
        page: PageInput<'_>,
    ) -> Result<Option<PaginationConfiguration>> {
        let this = self;
        let pagination = best_out_of(
            self.config.votes,
            LlmTask::DetectPagination.as_str(),
            move || {
                exponential_retry(&this.retry, LlmTask::DetectPagination.as_str(), move || {
                    this.detect_pagination_once(page)
                })
            },
            |pagination| pagination.clone(),
        )
        .await?;
        debug!(url = page.url, ?pagination, "pagination detected");
        Ok(pagination)
    }

    /// Detect one regular expression matching the page's outbound links of
    /// the role implied by `page_type`.
    pub async fn detect_url_regexp(&self, page: PageInput<'_>, page_type: PageType) -> Result<String> {
        let this = self;
        let regexp = best_out_of(
            self.config.votes,
            LlmTask::DetectUrlRegexp.as_str(),
            move || {
                exponential_retry(&this.retry, LlmTask::DetectUrlRegexp.as_str(), move || {
                    this.detect_url_regexp_once(page, page_type)
                })
            },
            |regexp| regexp.clone(),
        )
        .await?;
        debug!(url = page.url, regexp = %regexp, "link pattern detected");
        Ok(regexp)
    }

    async fn classify_page_type_once(&self, page: PageInput<'_>) -> Result<PageTypeVerdict> {
        let prompt = format_classify_page_type_prompt(page.catalogue_type, page.url, page.content);
        let response = self
            .call(LlmTask::ClassifyPageType, page, prompt, responses::page_type_tool())
            .await?;
        decode_page_type(response.output).map_err(Error::from)
    }

    async fn detect_pagination_once(
        &self,
        page: PageInput<'_>,
    ) -> Result<Option<PaginationConfiguration>> {
        let prompt = format_detect_pagination_prompt(page.url, page.content);
        let response = self
            .call(LlmTask::DetectPagination, page, prompt, responses::pagination_tool())
            .await?;
        let Some(args) = decode::<PaginationArgs>(response.output)? else {
            return Ok(None);
        };
        validate_pagination(args, page.url, page.content).map_err(Error::from)
    }

    async fn detect_url_regexp_once(&self, page: PageInput<'_>, page_type: PageType) -> Result<String> {
        let prompt = format_detect_url_regexp_prompt(
            page.catalogue_type,
            page_type.as_str(),
            page_type == PageType::DetailLinks,
            page.url,
            page.content,
        );
        let response = self
            .call(LlmTask::DetectUrlRegexp, page, prompt, responses::url_regexp_tool())
            .await?;
        let args: UrlRegexpArgs =
            decode_required(response.output, LlmTask::DetectUrlRegexp.as_str())?;
        validate_url_regexp(&args, page.url, page.content).map_err(Error::from)
    }

    async fn call(
        &self,
        task: LlmTask,
        page: PageInput<'_>,
        prompt: String,
        tool: ToolSchema,
    ) -> Result<ToolResponse> {
        let response = self
            .llm
            .call_tool(ToolRequest {
                task,
                system: SYSTEM_PROMPT.to_string(),
                prompt,
                image: page.screenshot.map(str::to_string),
                tool,
            })
            .await?;
        debug!(
            task = %task,
            url = page.url,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            "llm call"
        );
        Ok(response)
    }
}

/// Decode a page type answer. No tool call and `UNKNOWN` both mean unknown.
pub fn decode_page_type(
    output: Option<serde_json::Value>,
) -> std::result::Result<PageTypeVerdict, DetectionError> {
    Ok(match decode::<PageTypeArgs>(output)?.map(|args| args.page_type) {
        None | Some(PageTypeAnswer::Unknown) => PageTypeVerdict::Unknown,
        Some(PageTypeAnswer::Detail) => PageTypeVerdict::Known(PageType::Detail),
        Some(PageTypeAnswer::DetailLinks) => PageTypeVerdict::Known(PageType::DetailLinks),
        Some(PageTypeAnswer::CategoryLinks) => PageTypeVerdict::Known(PageType::CategoryLinks),
    })
}

/// Check a pagination answer against the page it came from.
pub fn validate_pagination(
    args: PaginationArgs,
    page_url: &str,
    content: &str,
) -> std::result::Result<Option<PaginationConfiguration>, DetectionError> {
    if !args.paginated {
        return Ok(None);
    }

    let raw_type = args
        .url_pattern_type
        .ok_or_else(|| DetectionError::bad_response("pagination without url_pattern_type"))?;
    let url_pattern_type = UrlPatternType::parse(&raw_type)
        .ok_or_else(|| DetectionError::UnknownPaginationType(raw_type.clone()))?;
    let url_pattern = args
        .url_pattern
        .ok_or_else(|| DetectionError::bad_response("pagination without url_pattern"))?;
    let total_pages = args
        .total_pages
        .ok_or_else(|| DetectionError::bad_response("pagination without total_pages"))?;
    if total_pages <= 1 {
        return Ok(None);
    }

    let placeholder = url_pattern_type.placeholder();
    let Some(placeholder_at) = url_pattern.find(placeholder) else {
        return Err(DetectionError::bad_response(format!(
            "pattern {url_pattern} lacks {placeholder}"
        )));
    };

    let offset_step = match url_pattern_type {
        UrlPatternType::Offset => match args.offset_step {
            Some(step) if step > 0 => Some(step),
            _ => {
                return Err(DetectionError::bad_response(
                    "offset pagination without a positive offset_step",
                ))
            }
        },
        UrlPatternType::PageNum => None,
    };

    let pagination = PaginationConfiguration {
        url_pattern_type,
        url_pattern,
        total_pages,
        offset_step,
    };

    let rendered = Url::parse(&pagination.render(1)).map_err(|_| {
        DetectionError::bad_response(format!("pattern {} is not an absolute URL", pagination.url_pattern))
    })?;
    if !matches!(rendered.scheme(), "http" | "https") {
        return Err(DetectionError::bad_response(format!(
            "pattern {} is not an http(s) URL",
            pagination.url_pattern
        )));
    }

    if !is_traceable(&pagination.url_pattern[..placeholder_at], &rendered, page_url, content) {
        return Err(DetectionError::bad_response(format!(
            "pattern {} does not appear in the page",
            pagination.url_pattern
        )));
    }

    Ok(Some(pagination))
}

/// Whether the part of a pattern before its placeholder can be seen in the
/// page, either as written or relative to the page.
fn is_traceable(prefix: &str, rendered: &Url, page_url: &str, content: &str) -> bool {
    if content.contains(prefix) {
        return true;
    }

    // Path-relative form: strip scheme and host
    let origin = rendered.origin().ascii_serialization();
    let relative = prefix.strip_prefix(origin.as_str()).unwrap_or(prefix);
    if !relative.is_empty() && relative != "/" && content.contains(relative) {
        return true;
    }

    // Query-relative form ("?page=2") on the page's own path
    if let Some(query_at) = relative.find('?') {
        let same_path = Url::parse(page_url)
            .map(|page| page.path() == rendered.path())
            .unwrap_or(false);
        let query_prefix = &relative[query_at..];
        if same_path && query_prefix.len() > 1 && content.contains(query_prefix) {
            return true;
        }
    }

    false
}

/// Check a link pattern answer: it must compile and find every example.
pub fn validate_url_regexp(
    args: &UrlRegexpArgs,
    page_url: &str,
    content: &str,
) -> std::result::Result<String, DetectionError> {
    let regexp = Regex::new(&args.regexp)
        .map_err(|e| DetectionError::bad_response(format!("regexp does not compile: {e}")))?;

    let matches = raw_matches(content, &regexp);
    let base = Url::parse(page_url).ok();
    let resolved: Vec<String> = base
        .as_ref()
        .map(|base| matches.iter().filter_map(|m| resolve_link(base, m)).collect())
        .unwrap_or_default();

    for example in &args.examples {
        let found_raw = matches.iter().any(|m| m == example);
        let found_resolved = base
            .as_ref()
            .and_then(|base| resolve_link(base, example))
            .is_some_and(|example| resolved.contains(&example));
        if !found_raw && !found_resolved {
            return Err(DetectionError::bad_response(format!(
                "example {example} is not matched by {}",
                args.regexp
            )));
        }
    }

    Ok(args.regexp.clone())
}
