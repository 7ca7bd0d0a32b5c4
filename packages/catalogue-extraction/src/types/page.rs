//! Page types - rendered pages and their simplified content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A page as returned by the browser collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedPage {
    /// Final URL after redirects
    pub url: String,

    pub html: String,

    /// Screenshot as an image data URL, when the browser can take one
    pub screenshot: Option<String>,
}

/// Simplified content of a page, stored out of band per crawl page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageContent {
    pub url: String,

    /// Markdown rendering used for classification and extraction
    pub markdown: String,

    pub screenshot: Option<String>,

    /// SHA-256 hash of the markdown
    pub content_hash: String,

    pub fetched_at: DateTime<Utc>,
}

impl PageContent {
    pub fn new(url: impl Into<String>, markdown: impl Into<String>) -> Self {
        let markdown = markdown.into();
        let content_hash = Self::hash_content(&markdown);
        Self {
            url: url.into(),
            markdown,
            screenshot: None,
            content_hash,
            fetched_at: Utc::now(),
        }
    }

    pub fn with_screenshot(mut self, screenshot: Option<String>) -> Self {
        self.screenshot = screenshot;
        self
    }

    /// Compute SHA-256 hash of content.
    pub fn hash_content(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Estimated token count (four characters per token, rounded up).
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.markdown)
    }
}

/// Estimate the token count of a text.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = PageContent::new("https://a.edu", "# Courses");
        let b = PageContent::new("https://a.edu", "# Courses");
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.content_hash.len(), 64);
    }
}
