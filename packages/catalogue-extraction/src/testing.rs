//! Testing utilities including mock implementations.
//!
//! These are useful for testing applications that use the extraction library
//! without making real LLM or network calls.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use crate::error::{FetchError, LlmError, Result};
use crate::traits::browser::{ApiCatalogue, Browser};
use crate::traits::llm::{Llm, LlmTask, ToolRequest, ToolResponse};
use crate::types::catalogue::CatalogueType;
use crate::types::extraction::TokenUsage;
use crate::types::item::Entity;
use crate::types::page::RenderedPage;
use crate::types::recipe::ApiProvider;

type Responder = Arc<dyn Fn(&ToolRequest) -> Option<Value> + Send + Sync>;

/// A scripted answer: tool arguments, no tool call, or a transport failure.
#[derive(Debug, Clone)]
enum Scripted {
    Output(Option<Value>),
    TransportError(String),
}

#[derive(Default)]
struct MockLlmState {
    scripted: HashMap<LlmTask, VecDeque<Scripted>>,
    responders: HashMap<LlmTask, Responder>,
    defaults: HashMap<LlmTask, Scripted>,
    usage: TokenUsage,
    calls: Vec<MockLlmCall>,
}

/// Record of a call made to the mock LLM.
#[derive(Debug, Clone)]
pub struct MockLlmCall {
    pub task: LlmTask,
    pub prompt: String,
    pub has_image: bool,
}

/// A mock LLM with responses scripted per task.
///
/// For each call the mock answers with, in order: the next queued response
/// for the task, the task's responder, the task's default. With none of
/// those it fails with a non-retryable [`LlmError::Config`]. Clones share
/// state, so a test can keep a handle for assertions.
#[derive(Clone, Default)]
pub struct MockLlm {
    state: Arc<RwLock<MockLlmState>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue raw tool arguments for `task`; `None` is a declined tool call.
    pub fn with_response(self, task: LlmTask, output: Option<Value>) -> Self {
        self.push(task, Scripted::Output(output))
    }

    /// Answer `task` with `output` whenever its queue is empty.
    pub fn with_default(self, task: LlmTask, output: Option<Value>) -> Self {
        self.state
            .write()
            .unwrap()
            .defaults
            .insert(task, Scripted::Output(output));
        self
    }

    /// Answer `task` from the request whenever its queue is empty.
    pub fn with_responder(
        self,
        task: LlmTask,
        responder: impl Fn(&ToolRequest) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.state
            .write()
            .unwrap()
            .responders
            .insert(task, Arc::new(responder));
        self
    }

    /// Queue a retryable transport failure for `task`.
    pub fn with_transport_error(self, task: LlmTask) -> Self {
        self.push(task, Scripted::TransportError("connection reset".to_string()))
    }

    /// Token usage reported by every response.
    pub fn with_usage(self, usage: TokenUsage) -> Self {
        self.state.write().unwrap().usage = usage;
        self
    }

    pub fn with_page_type(self, page_type: &str) -> Self {
        self.with_response(LlmTask::ClassifyPageType, Some(json!({"page_type": page_type})))
    }

    pub fn with_default_page_type(self, page_type: &str) -> Self {
        self.with_default(LlmTask::ClassifyPageType, Some(json!({"page_type": page_type})))
    }

    pub fn with_no_pagination(self) -> Self {
        self.with_response(LlmTask::DetectPagination, Some(json!({"paginated": false})))
    }

    pub fn with_pagination(
        self,
        url_pattern_type: &str,
        url_pattern: &str,
        total_pages: u32,
        offset_step: Option<u32>,
    ) -> Self {
        self.with_response(
            LlmTask::DetectPagination,
            Some(json!({
                "paginated": true,
                "url_pattern_type": url_pattern_type,
                "url_pattern": url_pattern,
                "total_pages": total_pages,
                "offset_step": offset_step,
            })),
        )
    }

    pub fn with_url_regexp(self, regexp: &str, examples: &[&str]) -> Self {
        self.with_response(
            LlmTask::DetectUrlRegexp,
            Some(json!({"regexp": regexp, "examples": examples})),
        )
    }

    pub fn with_should_chunk(self, multiple_entities: bool) -> Self {
        self.with_response(
            LlmTask::ShouldChunk,
            Some(json!({"multiple_entities": multiple_entities})),
        )
    }

    pub fn with_split(self, split_regexp: &str, expected_count: usize, first_entity_title: &str) -> Self {
        self.with_response(
            LlmTask::SplitChunks,
            Some(json!({
                "split_regexp": split_regexp,
                "expected_count": expected_count,
                "first_entity_title": first_entity_title,
            })),
        )
    }

    pub fn with_entities(self, entities: Vec<Value>) -> Self {
        self.with_response(LlmTask::ExtractEntities, Some(json!({"entities": entities})))
    }

    pub fn with_reextracted(self, entity: Value) -> Self {
        self.with_response(LlmTask::ReExtractEntity, Some(json!({"entity": entity})))
    }

    pub fn with_related_links(self, urls: &[&str]) -> Self {
        self.with_response(LlmTask::DiscoverRelatedLinks, Some(json!({"urls": urls})))
    }

    /// Get all calls made to this mock.
    pub fn calls(&self) -> Vec<MockLlmCall> {
        self.state.read().unwrap().calls.clone()
    }

    pub fn total_calls(&self) -> usize {
        self.state.read().unwrap().calls.len()
    }

    pub fn calls_for(&self, task: LlmTask) -> usize {
        self.state
            .read()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.task == task)
            .count()
    }

    /// Prompts sent for `task`, in call order.
    pub fn prompts_for(&self, task: LlmTask) -> Vec<String> {
        self.state
            .read()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.task == task)
            .map(|call| call.prompt.clone())
            .collect()
    }

    fn push(self, task: LlmTask, scripted: Scripted) -> Self {
        self.state
            .write()
            .unwrap()
            .scripted
            .entry(task)
            .or_default()
            .push_back(scripted);
        self
    }
}

#[async_trait]
impl Llm for MockLlm {
    async fn call_tool(&self, request: ToolRequest) -> std::result::Result<ToolResponse, LlmError> {
        let (scripted, responder, usage) = {
            let mut state = self.state.write().unwrap();
            state.calls.push(MockLlmCall {
                task: request.task,
                prompt: request.prompt.clone(),
                has_image: request.image.is_some(),
            });
            let queued = state
                .scripted
                .get_mut(&request.task)
                .and_then(VecDeque::pop_front);
            let responder = state.responders.get(&request.task).cloned();
            let default = state.defaults.get(&request.task).cloned();
            let scripted = match (queued, &responder) {
                (Some(queued), _) => Some(queued),
                (None, Some(_)) => None,
                (None, None) => default,
            };
            (scripted, responder, state.usage)
        };

        let output = match scripted {
            Some(Scripted::Output(output)) => output,
            Some(Scripted::TransportError(reason)) => return Err(LlmError::Transport(reason)),
            None => match responder {
                Some(responder) => responder(&request),
                None => {
                    return Err(LlmError::Config(format!(
                        "no scripted response for {}",
                        request.task
                    )))
                }
            },
        };

        Ok(ToolResponse {
            output,
            usage,
        })
    }
}

#[derive(Debug, Clone)]
enum MockPage {
    Html(String),
    Status(u16),
    /// Times out this many more times, then serves the page
    Flaky { failures: usize, html: String },
}

/// A mock browser serving predefined pages.
///
/// Unknown URLs fail with HTTP 404. `to_markdown` returns the HTML as is,
/// so tests can write pages directly in markdown.
#[derive(Clone, Default)]
pub struct MockBrowser {
    pages: Arc<RwLock<HashMap<String, MockPage>>>,
    fetched: Arc<RwLock<Vec<String>>>,
}

impl MockBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a predefined page.
    pub fn with_page(self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.insert(url, MockPage::Html(html.into()))
    }

    /// Make a URL fail with an HTTP status.
    pub fn with_status(self, url: impl Into<String>, status: u16) -> Self {
        self.insert(url, MockPage::Status(status))
    }

    /// Make a URL time out `failures` times before it is served.
    pub fn with_flaky_page(
        self,
        url: impl Into<String>,
        failures: usize,
        html: impl Into<String>,
    ) -> Self {
        self.insert(
            url,
            MockPage::Flaky {
                failures,
                html: html.into(),
            },
        )
    }

    /// URLs fetched so far, in order.
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.read().unwrap().clone()
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.fetched
            .read()
            .unwrap()
            .iter()
            .filter(|fetched| fetched.as_str() == url)
            .count()
    }

    fn insert(self, url: impl Into<String>, page: MockPage) -> Self {
        self.pages.write().unwrap().insert(url.into(), page);
        self
    }
}

#[async_trait]
impl Browser for MockBrowser {
    async fn fetch(
        &self,
        url: &str,
        _proxy: Option<&str>,
    ) -> std::result::Result<RenderedPage, FetchError> {
        self.fetched.write().unwrap().push(url.to_string());

        let mut pages = self.pages.write().unwrap();
        let html = match pages.get_mut(url) {
            Some(MockPage::Html(html)) => html.clone(),
            Some(MockPage::Status(status)) => {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: *status,
                })
            }
            Some(MockPage::Flaky { failures, html }) => {
                if *failures > 0 {
                    *failures -= 1;
                    return Err(FetchError::Timeout {
                        url: url.to_string(),
                    });
                }
                html.clone()
            }
            None => {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: 404,
                })
            }
        };

        Ok(RenderedPage {
            url: url.to_string(),
            html,
            screenshot: None,
        })
    }

    fn to_markdown(&self, html: &str) -> String {
        html.to_string()
    }
}

/// A mock structured catalogue API returning fixed entities.
#[derive(Clone, Default)]
pub struct MockApiCatalogue {
    entities: Arc<RwLock<Vec<Entity>>>,
    calls: Arc<RwLock<Vec<(ApiProvider, String)>>>,
}

impl MockApiCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(self, entity: Value) -> Self {
        if let Value::Object(fields) = entity {
            self.entities.write().unwrap().push(fields);
        }
        self
    }

    pub fn calls(&self) -> Vec<(ApiProvider, String)> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl ApiCatalogue for MockApiCatalogue {
    async fn fetch_entities(
        &self,
        provider: ApiProvider,
        url: &str,
        _catalogue_type: CatalogueType,
    ) -> Result<Vec<Entity>> {
        self.calls.write().unwrap().push((provider, url.to_string()));
        Ok(self.entities.read().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::responses::page_type_tool;

    fn request(task: LlmTask) -> ToolRequest {
        ToolRequest {
            task,
            system: String::new(),
            prompt: "prompt".to_string(),
            image: None,
            tool: page_type_tool(),
        }
    }

    #[tokio::test]
    async fn test_queue_then_default_then_error() {
        let llm = MockLlm::new()
            .with_page_type("DETAIL")
            .with_default_page_type("DETAIL_LINKS");
        let first = llm.call_tool(request(LlmTask::ClassifyPageType)).await.unwrap();
        assert_eq!(first.output.unwrap()["page_type"], "DETAIL");
        let second = llm.call_tool(request(LlmTask::ClassifyPageType)).await.unwrap();
        assert_eq!(second.output.unwrap()["page_type"], "DETAIL_LINKS");

        let err = llm.call_tool(request(LlmTask::ShouldChunk)).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(llm.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_queued_response_precedes_responder() {
        let llm = MockLlm::new()
            .with_page_type("DETAIL")
            .with_responder(LlmTask::ClassifyPageType, |request| {
                Some(json!({ "page_type": request.prompt.to_uppercase() }))
            })
            .with_transport_error(LlmTask::ShouldChunk);

        let queued = llm.call_tool(request(LlmTask::ClassifyPageType)).await.unwrap();
        assert_eq!(queued.output.unwrap()["page_type"], "DETAIL");
        let answered = llm.call_tool(request(LlmTask::ClassifyPageType)).await.unwrap();
        assert_eq!(answered.output.unwrap()["page_type"], "PROMPT");

        let err = llm.call_tool(request(LlmTask::ShouldChunk)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_flaky_page_recovers() {
        let browser = MockBrowser::new().with_flaky_page("https://a.edu", 1, "ok");
        assert!(browser.fetch("https://a.edu", None).await.is_err());
        assert_eq!(browser.fetch("https://a.edu", None).await.unwrap().html, "ok");
        assert_eq!(browser.fetch_count("https://a.edu"), 2);
    }
}
