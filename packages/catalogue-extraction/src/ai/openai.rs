//! OpenAI implementation of the Llm trait.
//!
//! Sends each [`ToolRequest`] as a chat completion offering exactly one
//! function tool, and returns the function arguments of the first tool call.
//!
//! # Example
//!
//! ```rust,ignore
//! use catalogue_extraction::ai::OpenAiLlm;
//!
//! let llm = OpenAiLlm::new("sk-...").with_model("gpt-4o");
//! let service = CatalogueService::new(store, queue, browser, Arc::new(llm), config);
//! ```

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::traits::llm::{Llm, ToolRequest, ToolResponse};
use crate::types::extraction::TokenUsage;

/// OpenAI-backed [`Llm`].
#[derive(Clone)]
pub struct OpenAiLlm {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiLlm {
    /// Create a new OpenAI client with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: "gpt-4o".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    /// Create from environment variable `OPENAI_API_KEY`.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| LlmError::Config("OPENAI_API_KEY not set".into()))?;
        Ok(Self::new(api_key))
    }

    /// Set the chat model (default: gpt-4o).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set a custom base URL (for Azure, proxies, etc.).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Get the current model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, request: &ToolRequest) -> Value {
        let user_content = match &request.image {
            Some(image) => json!([
                { "type": "text", "text": request.prompt },
                { "type": "image_url", "image_url": { "url": image } },
            ]),
            None => json!(request.prompt),
        };

        json!({
            "model": self.model,
            "temperature": 0.0,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": user_content },
            ],
            "tools": [{
                "type": "function",
                "function": {
                    "name": request.tool.name,
                    "description": request.tool.description,
                    "parameters": request.tool.parameters,
                },
            }],
            "tool_choice": "auto",
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize, Serialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Arguments of the first call to `tool_name`, or `None` when the model
/// answered without calling it.
fn tool_output(response: ChatResponse, tool_name: &str) -> Result<Option<Value>, LlmError> {
    let call = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.tool_calls.into_iter().find(|c| c.function.name == tool_name));

    match call {
        None => Ok(None),
        Some(call) => serde_json::from_str(&call.function.arguments)
            .map(Some)
            // Retryable: the next sample may be well-formed
            .map_err(|e| LlmError::Transport(format!("tool arguments are not JSON: {e}"))),
    }
}

#[async_trait]
impl Llm for OpenAiLlm {
    async fn call_tool(&self, request: ToolRequest) -> Result<ToolResponse, LlmError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.request_body(&request))
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(task = %request.task, "OpenAI rate limited");
            return Err(LlmError::RateLimited);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::NOT_FOUND {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::Config(format!("OpenAI API error {status}: {error_text}")));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::Transport(format!("OpenAI API error {status}: {error_text}")));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        let usage = chat_response
            .usage
            .as_ref()
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        let output = tool_output(chat_response, &request.tool.name)?;

        debug!(
            task = %request.task,
            called = output.is_some(),
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "tool call completed"
        );
        Ok(ToolResponse { output, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::llm::{LlmTask, ToolSchema};

    fn request(image: Option<&str>) -> ToolRequest {
        ToolRequest {
            task: LlmTask::ClassifyPageType,
            system: "system".to_string(),
            prompt: "prompt".to_string(),
            image: image.map(str::to_string),
            tool: ToolSchema {
                name: "set_page_type".to_string(),
                description: "Set the page type".to_string(),
                parameters: json!({ "type": "object" }),
            },
        }
    }

    #[test]
    fn test_request_body_offers_one_tool() {
        let body = OpenAiLlm::new("sk-test").request_body(&request(None));
        assert_eq!(body["tools"][0]["function"]["name"], "set_page_type");
        assert_eq!(body["messages"][1]["content"], "prompt");
    }

    #[test]
    fn test_request_body_attaches_image() {
        let body = OpenAiLlm::new("sk-test").request_body(&request(Some("data:image/png;base64,AA")));
        assert_eq!(
            body["messages"][1]["content"][1]["image_url"]["url"],
            "data:image/png;base64,AA"
        );
    }

    #[test]
    fn test_missing_tool_call_is_no_output() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{ "message": { "content": "I cannot tell." } }]
        }))
        .unwrap();
        assert_eq!(tool_output(response, "set_page_type").unwrap(), None);
    }

    #[test]
    fn test_tool_arguments_are_decoded() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{ "message": { "tool_calls": [{
                "function": { "name": "set_page_type", "arguments": "{\"page_type\":\"DETAIL\"}" }
            }] } }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3 }
        }))
        .unwrap();
        assert_eq!(
            tool_output(response, "set_page_type").unwrap(),
            Some(json!({ "page_type": "DETAIL" }))
        );
    }
}
