//! Recipe types - the recursive navigation configuration for a catalogue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::types::status::RecipeDetectionStatus;

/// Role of a page within a catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageType {
    /// Page describes one or more entities directly
    Detail,
    /// Index page linking to detail pages
    DetailLinks,
    /// Index page linking to further index pages
    CategoryLinks,
}

impl PageType {
    /// Whether pages of this type are followed through outbound links.
    pub fn has_links(self) -> bool {
        !matches!(self, PageType::Detail)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PageType::Detail => "DETAIL",
            PageType::DetailLinks => "DETAIL_LINKS",
            PageType::CategoryLinks => "CATEGORY_LINKS",
        }
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a paginated URL encodes the page position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlPatternType {
    PageNum,
    Offset,
}

impl UrlPatternType {
    /// Placeholder that must appear in the URL pattern.
    pub fn placeholder(self) -> &'static str {
        match self {
            UrlPatternType::PageNum => "{page_num}",
            UrlPatternType::Offset => "{offset}",
        }
    }

    /// Parse the detector's spelling of a pattern type.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "page_num" | "page_number" | "pagenum" => Some(UrlPatternType::PageNum),
            "offset" => Some(UrlPatternType::Offset),
            _ => None,
        }
    }
}

/// Pagination scheme of an index page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaginationConfiguration {
    pub url_pattern_type: UrlPatternType,

    /// Absolute URL containing the placeholder for `url_pattern_type`
    pub url_pattern: String,

    pub total_pages: u32,

    /// Increment between consecutive offsets (offset patterns only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_step: Option<u32>,
}

impl PaginationConfiguration {
    /// Substitute the placeholder with a concrete value.
    pub fn render(&self, value: u64) -> String {
        self.url_pattern
            .replace(self.url_pattern_type.placeholder(), &value.to_string())
    }

    /// URLs of pages 2 through `total_pages`, in order.
    ///
    /// The first page is the index the pattern was found on, so it is
    /// never repeated here.
    pub fn page_urls(&self) -> Vec<String> {
        (1..u64::from(self.total_pages))
            .map(|index| match self.url_pattern_type {
                UrlPatternType::PageNum => self.render(index + 1),
                UrlPatternType::Offset => {
                    self.render(index * u64::from(self.offset_step.unwrap_or(1)))
                }
            })
            .collect()
    }

    /// Whether the pattern carries the placeholder of its own type.
    pub fn has_placeholder(&self) -> bool {
        self.url_pattern
            .contains(self.url_pattern_type.placeholder())
    }
}

/// Structured catalogue platforms detected by page signature.
///
/// Sites on these platforms expose their data through an API, so page
/// structure detection is skipped entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiProvider {
    Coursedog,
    Kuali,
    Acalog,
}

impl ApiProvider {
    const SIGNATURES: &'static [(ApiProvider, &'static [&'static str])] = &[
        (ApiProvider::Coursedog, &["app.coursedog.com", "coursedog-static"]),
        (ApiProvider::Kuali, &["kuali.co/api", "kuali-catalog", "catalog.kuali.co"]),
        (ApiProvider::Acalog, &["gateway.acalog.com", "acalogapi", "acalog acms"]),
    ];

    /// Detect a provider from raw page HTML.
    pub fn detect(html: &str) -> Option<Self> {
        let html = html.to_ascii_lowercase();
        Self::SIGNATURES
            .iter()
            .find(|(_, needles)| needles.iter().any(|needle| html.contains(needle)))
            .map(|(provider, _)| *provider)
    }
}

/// Recursive navigation configuration.
///
/// Each level describes the pages at that depth; `links` describes the
/// pages reached by following `link_regexp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeConfiguration {
    pub page_type: PageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_regexp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationConfiguration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Box<RecipeConfiguration>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_provider: Option<ApiProvider>,
}

impl RecipeConfiguration {
    /// A leaf level of detail pages.
    pub fn detail() -> Self {
        Self {
            page_type: PageType::Detail,
            link_regexp: None,
            pagination: None,
            links: None,
            api_provider: None,
        }
    }

    /// A links-bearing level.
    pub fn links(page_type: PageType, link_regexp: impl Into<String>, child: Self) -> Self {
        Self {
            page_type,
            link_regexp: Some(link_regexp.into()),
            pagination: None,
            links: Some(Box::new(child)),
            api_provider: None,
        }
    }

    /// A configuration served by a structured API.
    pub fn api(provider: ApiProvider) -> Self {
        Self {
            api_provider: Some(provider),
            ..Self::detail()
        }
    }

    pub fn with_pagination(mut self, pagination: PaginationConfiguration) -> Self {
        self.pagination = Some(pagination);
        self
    }

    /// Number of levels in the tree (a single detail page is 1).
    pub fn depth(&self) -> usize {
        1 + self.links.as_ref().map_or(0, |child| child.depth())
    }

    /// Check the tree invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.api_provider.is_some()
            && (self.page_type != PageType::Detail || self.links.is_some())
        {
            return Err("API configurations must be a single DETAIL level".to_string());
        }

        match self.page_type {
            PageType::Detail => {
                if self.links.is_some() {
                    return Err("DETAIL level must not have links".to_string());
                }
                if self.pagination.is_some() {
                    return Err("DETAIL level must not be paginated".to_string());
                }
            }
            page_type => {
                let regexp = self
                    .link_regexp
                    .as_deref()
                    .ok_or_else(|| format!("{page_type} level is missing a link regexp"))?;
                regex::Regex::new(regexp)
                    .map_err(|e| format!("{page_type} link regexp does not compile: {e}"))?;
                let child = self
                    .links
                    .as_deref()
                    .ok_or_else(|| format!("{page_type} level is missing its links level"))?;
                child.validate()?;
            }
        }

        if let Some(pagination) = &self.pagination {
            if !pagination.has_placeholder() {
                return Err(format!(
                    "pagination pattern {} lacks {}",
                    pagination.url_pattern,
                    pagination.url_pattern_type.placeholder()
                ));
            }
            if pagination.url_pattern_type == UrlPatternType::Offset
                && pagination.offset_step.unwrap_or(0) == 0
            {
                return Err("offset pagination requires a positive offset step".to_string());
            }
        }

        Ok(())
    }
}

/// A navigation recipe for one catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub id: Uuid,
    pub catalogue_id: Uuid,
    pub url: String,
    pub configuration: Option<RecipeConfiguration>,
    pub status: RecipeDetectionStatus,

    /// Human-readable reason when `status` is `Error`
    pub failure_reason: Option<String>,

    pub is_default: bool,
    pub is_template: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recipe {
    /// Create a recipe awaiting detection.
    pub fn new(catalogue_id: Uuid, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            catalogue_id,
            url: url.into(),
            configuration: None,
            status: RecipeDetectionStatus::Waiting,
            failure_reason: None,
            is_default: false,
            is_template: false,
            created_at: now,
            updated_at: now,
        }
    }
}
