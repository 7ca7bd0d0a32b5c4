//! LLM trait for structured tool-call completions.
//!
//! Every classification and extraction step asks the model to call a single
//! tool whose parameters are the structured answer. The trait only moves
//! JSON; decoding and validation of each task's answer live in the pipeline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::LlmError;
use crate::types::extraction::TokenUsage;

/// The pipeline task a request belongs to.
///
/// Used for logging and by mocks to script responses per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmTask {
    ClassifyPageType,
    DetectPagination,
    DetectUrlRegexp,
    ShouldChunk,
    SplitChunks,
    ExtractEntities,
    ReExtractEntity,
    DiscoverRelatedLinks,
}

impl LlmTask {
    pub fn as_str(self) -> &'static str {
        match self {
            LlmTask::ClassifyPageType => "classify_page_type",
            LlmTask::DetectPagination => "detect_pagination",
            LlmTask::DetectUrlRegexp => "detect_url_regexp",
            LlmTask::ShouldChunk => "should_chunk",
            LlmTask::SplitChunks => "split_chunks",
            LlmTask::ExtractEntities => "extract_entities",
            LlmTask::ReExtractEntity => "re_extract_entity",
            LlmTask::DiscoverRelatedLinks => "discover_related_links",
        }
    }
}

impl fmt::Display for LlmTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single tool the model is asked to call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,

    /// JSON schema of the tool's parameters
    pub parameters: serde_json::Value,
}

/// A structured completion request.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub task: LlmTask,

    /// System instructions
    pub system: String,

    /// User prompt, usually the page content plus task context
    pub prompt: String,

    /// Optional screenshot as an image data URL
    pub image: Option<String>,

    pub tool: ToolSchema,
}

/// A structured completion response.
#[derive(Debug, Clone, Default)]
pub struct ToolResponse {
    /// Tool-call arguments; `None` when the model declined to call the tool
    pub output: Option<serde_json::Value>,

    pub usage: TokenUsage,
}

impl ToolResponse {
    pub fn called(output: serde_json::Value) -> Self {
        Self {
            output: Some(output),
            usage: TokenUsage::default(),
        }
    }

    pub fn no_tool_call() -> Self {
        Self::default()
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// LLM completion collaborator.
///
/// Implementations wrap a specific provider and must map transport failures
/// to [`LlmError::Transport`] or [`LlmError::RateLimited`] so they are retried.
#[async_trait]
pub trait Llm: Send + Sync {
    /// Ask the model to answer by calling `request.tool`.
    async fn call_tool(&self, request: ToolRequest) -> Result<ToolResponse, LlmError>;
}
