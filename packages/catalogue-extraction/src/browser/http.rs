//! HTTP browser - plain reqwest fetches with htmd markdown conversion.
//!
//! No JavaScript rendering and no screenshots; suitable for the many
//! catalogues served as static HTML.

use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, FetchError, Result};
use crate::traits::browser::Browser;
use crate::types::page::RenderedPage;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; CatalogueBot/1.0)";

/// [`Browser`] backed by a reqwest client.
pub struct HttpBrowser {
    client: reqwest::Client,
    user_agent: String,
    timeout: Duration,
}

impl HttpBrowser {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let user_agent = DEFAULT_USER_AGENT.to_string();
        let client = build_client(&user_agent, timeout, None)?;
        Ok(Self {
            client,
            user_agent,
            timeout,
        })
    }

    /// Set a custom user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Result<Self> {
        self.user_agent = user_agent.into();
        self.client = build_client(&self.user_agent, self.timeout, None)?;
        Ok(self)
    }

    fn client_for(&self, url: &str, proxy: Option<&str>) -> std::result::Result<reqwest::Client, FetchError> {
        match proxy {
            None => Ok(self.client.clone()),
            Some(proxy) => build_client(&self.user_agent, self.timeout, Some(proxy)).map_err(|e| {
                FetchError::Http {
                    url: url.to_string(),
                    source: Box::new(e),
                }
            }),
        }
    }
}

fn build_client(user_agent: &str, timeout: Duration, proxy: Option<&str>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .redirect(reqwest::redirect::Policy::limited(5));
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| Error::InvalidConfiguration(format!("invalid proxy {proxy}: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| Error::InvalidConfiguration(format!("failed to create HTTP client: {e}")))
}

fn map_reqwest(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout { url: url.to_string() }
    } else if e.is_builder() {
        FetchError::InvalidUrl { url: url.to_string() }
    } else {
        FetchError::Http {
            url: url.to_string(),
            source: Box::new(e),
        }
    }
}

#[async_trait]
impl Browser for HttpBrowser {
    async fn fetch(&self, url: &str, proxy: Option<&str>) -> std::result::Result<RenderedPage, FetchError> {
        debug!(url, proxied = proxy.is_some(), "HTTP fetch starting");
        let response = self
            .client_for(url, proxy)?
            .get(url)
            .send()
            .await
            .map_err(|e| map_reqwest(url, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url, status = status.as_u16(), "HTTP fetch failed");
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let final_url = response.url().to_string();
        let html = response.text().await.map_err(|e| map_reqwest(url, e))?;
        debug!(url, final_url = %final_url, bytes = html.len(), "HTTP fetch complete");

        Ok(RenderedPage {
            url: final_url,
            html,
            screenshot: None,
        })
    }

    fn to_markdown(&self, html: &str) -> String {
        htmd::convert(html).unwrap_or_else(|e| {
            warn!(error = %e, "markdown conversion failed, stripping tags");
            strip_tags(html)
        })
    }
}

fn strip_tags(html: &str) -> String {
    static TAG: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(tag) = TAG.get_or_init(|| Regex::new(r"(?s)<script.*?</script>|<style.*?</style>|<[^>]+>").ok()) else {
        return html.to_string();
    };
    tag.replace_all(html, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_keeps_links() {
        let browser = HttpBrowser::new().unwrap();
        let markdown = browser.to_markdown(
            r#"<html><body><h1>Courses</h1><a href="/courses/bio-101">BIO 101</a></body></html>"#,
        );
        assert!(markdown.contains("# Courses"));
        assert!(markdown.contains("[BIO 101](/courses/bio-101)"));
    }

    #[test]
    fn test_strip_tags_drops_scripts() {
        assert_eq!(
            strip_tags("<p>Intro <b>to</b></p><script>var x = 1;</script> Biology"),
            "Intro to Biology"
        );
    }

    #[test]
    fn test_invalid_proxy_is_a_configuration_error() {
        let browser = HttpBrowser::new().unwrap();
        assert!(browser.client_for("https://a.edu", Some("not a proxy ::")).is_err());
    }
}
