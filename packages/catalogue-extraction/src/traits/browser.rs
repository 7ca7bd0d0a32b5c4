//! Browser trait for rendering catalogue pages.

use async_trait::async_trait;

use crate::error::{FetchError, Result};
use crate::types::catalogue::CatalogueType;
use crate::types::item::Entity;
use crate::types::page::RenderedPage;
use crate::types::recipe::ApiProvider;

/// Browser collaborator that renders a page and simplifies its HTML.
///
/// Failures are page-level: the orchestrator records them on the crawl page
/// and carries on with sibling pages.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Render `url`, optionally through `proxy`.
    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&str>,
    ) -> std::result::Result<RenderedPage, FetchError>;

    /// Convert rendered HTML into the simplified content fed to the LLM.
    fn to_markdown(&self, html: &str) -> String;
}

/// Structured catalogue API for sites on a known provider platform.
#[async_trait]
pub trait ApiCatalogue: Send + Sync {
    /// Fetch every entity of `catalogue_type` published at `url`.
    async fn fetch_entities(
        &self,
        provider: ApiProvider,
        url: &str,
        catalogue_type: CatalogueType,
    ) -> Result<Vec<Entity>>;
}
