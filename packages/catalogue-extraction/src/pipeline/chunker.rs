//! Content chunker - splits long multi-entity pages into per-entity chunks.

use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::consensus::exponential_retry;
use crate::error::{ChunkingError, Error, Result};
use crate::pipeline::prompts::{
    format_should_chunk_prompt, format_split_chunks_prompt, SYSTEM_PROMPT,
};
use crate::pipeline::responses::{self, decode_required, ShouldChunkArgs, SplitChunksArgs};
use crate::pipeline::verify::normalize;
use crate::traits::llm::{Llm, LlmTask, ToolRequest};
use crate::types::catalogue::CatalogueType;
use crate::types::config::{ChunkerConfig, RetryPolicy};
use crate::types::extraction::TokenUsage;
use crate::types::page::estimate_tokens;

/// Allowed difference between the actual and expected chunk counts.
///
/// Exact for five or fewer entities, otherwise 10% rounded.
pub fn chunk_tolerance(expected: usize) -> usize {
    if expected <= 5 {
        0
    } else {
        (expected as f64 * 0.1).round() as usize
    }
}

/// Whether `actual` chunks are acceptable when `expected` were announced.
pub fn within_tolerance(actual: usize, expected: usize) -> bool {
    actual.abs_diff(expected) <= chunk_tolerance(expected)
}

/// Split `content` at the start of every match of the proposed pattern.
///
/// Returns the reason for rejection when the split is unusable.
pub fn apply_split(
    content: &str,
    args: &SplitChunksArgs,
) -> std::result::Result<Vec<String>, String> {
    let regexp = Regex::new(&args.split_regexp)
        .map_err(|e| format!("split regexp {} does not compile: {e}", args.split_regexp))?;

    let mut starts: Vec<usize> = regexp.find_iter(content).map(|m| m.start()).collect();
    starts.dedup();
    if starts.is_empty() {
        return Err(format!("split regexp {} matched nothing", args.split_regexp));
    }

    let mut bounds = Vec::with_capacity(starts.len() + 1);
    if starts[0] > 0 {
        bounds.push(0);
    }
    bounds.extend(starts);

    let mut chunks: Vec<String> = bounds
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = bounds.get(i + 1).copied().unwrap_or(content.len());
            content[start..end].trim().to_string()
        })
        .filter(|chunk| !chunk.is_empty())
        .collect();

    let title = normalize(&args.first_entity_title);
    if !title.is_empty() {
        let Some(first) = chunks.iter().position(|chunk| normalize(chunk).contains(&title)) else {
            return Err(format!(
                "first entity title \"{}\" not found in any chunk",
                args.first_entity_title
            ));
        };
        chunks.drain(..first);
    }

    if !within_tolerance(chunks.len(), args.expected_count) {
        return Err(format!(
            "expected {} chunks but the split produced {}",
            args.expected_count,
            chunks.len()
        ));
    }

    Ok(chunks)
}

/// LLM-backed content chunker.
#[derive(Clone)]
pub struct ContentChunker {
    llm: Arc<dyn Llm>,
    retry: RetryPolicy,
    config: ChunkerConfig,
}

impl ContentChunker {
    pub fn new(llm: Arc<dyn Llm>, retry: RetryPolicy, config: ChunkerConfig) -> Self {
        Self { llm, retry, config }
    }

    /// Whether the page is both oversized and lists several entities.
    pub async fn should_chunk(
        &self,
        content: &str,
        catalogue_type: CatalogueType,
        usage: &mut TokenUsage,
    ) -> Result<bool> {
        let tokens = estimate_tokens(content);
        if tokens <= self.config.token_threshold {
            return Ok(false);
        }

        let llm = &self.llm;
        let (args, call_usage) =
            exponential_retry(&self.retry, LlmTask::ShouldChunk.as_str(), move || async move {
                let response = llm
                    .call_tool(ToolRequest {
                        task: LlmTask::ShouldChunk,
                        system: SYSTEM_PROMPT.to_string(),
                        prompt: format_should_chunk_prompt(catalogue_type, content),
                        image: None,
                        tool: responses::should_chunk_tool(),
                    })
                    .await?;
                let args: ShouldChunkArgs =
                    decode_required(response.output, LlmTask::ShouldChunk.as_str())?;
                Ok::<_, Error>((args, response.usage))
            })
            .await?;
        *usage += call_usage;

        debug!(tokens, multiple = args.multiple_entities, "chunk check");
        Ok(args.multiple_entities)
    }

    /// Split a long page into per-entity chunks.
    ///
    /// Each rejected attempt's reason is fed into the next prompt.
    pub async fn split_chunks(
        &self,
        content: &str,
        catalogue_type: CatalogueType,
        usage: &mut TokenUsage,
    ) -> Result<Vec<String>> {
        let mut rejections: Vec<String> = Vec::new();

        for attempt in 1..=self.config.max_attempts {
            let prompt = format_split_chunks_prompt(catalogue_type, content, &rejections);
            let llm = &self.llm;
            let prompt = &prompt;
            let response = exponential_retry(&self.retry, LlmTask::SplitChunks.as_str(), move || {
                let request = ToolRequest {
                    task: LlmTask::SplitChunks,
                    system: SYSTEM_PROMPT.to_string(),
                    prompt: prompt.clone(),
                    image: None,
                    tool: responses::split_chunks_tool(),
                };
                async move { llm.call_tool(request).await.map_err(Error::from) }
            })
            .await?;
            *usage += response.usage;

            let outcome =
                decode_required::<SplitChunksArgs>(response.output, LlmTask::SplitChunks.as_str())
                    .map_err(|e| e.to_string())
                    .and_then(|args| apply_split(content, &args));

            match outcome {
                Ok(chunks) => {
                    info!(attempt, chunks = chunks.len(), "page split into chunks");
                    return Ok(chunks);
                }
                Err(reason) => {
                    warn!(attempt, reason = %reason, "split rejected");
                    rejections.push(reason);
                }
            }
        }

        Err(ChunkingError::Exhausted {
            attempts: self.config.max_attempts,
            last_reason: rejections.pop().unwrap_or_default(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLlm;
    use proptest::prelude::*;

    fn split(regexp: &str, expected: usize, title: &str) -> SplitChunksArgs {
        SplitChunksArgs {
            split_regexp: regexp.to_string(),
            expected_count: expected,
            first_entity_title: title.to_string(),
        }
    }

    fn listing(n: usize) -> String {
        let mut content = String::from("# Course Listing\n\nSearch | Print\n\n");
        for i in 0..n {
            content.push_str(&format!(
                "## BIO {} - Topic {i}\n\nDescription of topic {i}.\n\n",
                100 + i
            ));
        }
        content
    }

    #[test]
    fn test_tolerance() {
        assert_eq!(chunk_tolerance(5), 0);
        assert_eq!(chunk_tolerance(6), 1);
        assert_eq!(chunk_tolerance(20), 2);
        assert_eq!(chunk_tolerance(25), 3);
    }

    #[test]
    fn test_split_trims_leading_junk() {
        let chunks = apply_split(&listing(3), &split(r"## BIO \d+", 3, "BIO 100 - Topic 0")).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].starts_with("## BIO 100"));
        assert!(chunks[2].contains("Description of topic 2."));
    }

    #[test]
    fn test_split_rejects_count_mismatch() {
        let err = apply_split(&listing(3), &split(r"## BIO \d+", 4, "BIO 100")).unwrap_err();
        assert!(err.contains("expected 4"));
    }

    #[test]
    fn test_split_rejects_invalid_regexp() {
        let err = apply_split(&listing(3), &split(r"## BIO (", 3, "BIO 100")).unwrap_err();
        assert!(err.contains("does not compile"));
    }

    #[test]
    fn test_split_rejects_missing_title() {
        let err = apply_split(&listing(3), &split(r"## BIO \d+", 3, "CHEM 999")).unwrap_err();
        assert!(err.contains("not found"));
    }

    #[tokio::test]
    async fn test_short_page_is_never_chunked() {
        let llm = MockLlm::new();
        let chunker = ContentChunker::new(
            Arc::new(llm.clone()),
            RetryPolicy::immediate(1),
            ChunkerConfig::default(),
        );
        let mut usage = TokenUsage::default();
        assert!(!chunker
            .should_chunk("short", CatalogueType::Courses, &mut usage)
            .await
            .unwrap());
        assert_eq!(llm.calls_for(LlmTask::ShouldChunk), 0);
    }

    #[tokio::test]
    async fn test_rejection_is_fed_back() {
        let llm = MockLlm::new()
            .with_split(r"## BIO \d+", 7, "BIO 100")
            .with_split(r"## BIO \d+", 12, "BIO 100");
        let chunker = ContentChunker::new(
            Arc::new(llm.clone()),
            RetryPolicy::immediate(1),
            ChunkerConfig::default(),
        );
        let mut usage = TokenUsage::default();
        let chunks = chunker
            .split_chunks(&listing(12), CatalogueType::Courses, &mut usage)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 12);

        let prompts = llm.prompts_for(LlmTask::SplitChunks);
        assert!(!prompts[0].contains("Previous attempts"));
        assert!(prompts[1].contains("expected 7 chunks but the split produced 12"));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail_the_page() {
        let llm = MockLlm::new()
            .with_split("(", 3, "x")
            .with_split("(", 3, "x");
        let chunker = ContentChunker::new(
            Arc::new(llm),
            RetryPolicy::immediate(1),
            ChunkerConfig::default().with_max_attempts(2),
        );
        let mut usage = TokenUsage::default();
        let err = chunker
            .split_chunks(&listing(3), CatalogueType::Courses, &mut usage)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Chunking(ChunkingError::Exhausted { attempts: 2, .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_small_counts_require_exact_match(expected in 0usize..=5, actual in 0usize..50) {
            prop_assert_eq!(within_tolerance(actual, expected), actual == expected);
        }

        #[test]
        fn prop_large_counts_allow_ten_percent(expected in 6usize..1000, delta in 0usize..200) {
            let bound = ((expected as f64) * 0.1).round() as usize;
            prop_assert_eq!(within_tolerance(expected + delta, expected), delta <= bound);
            if delta <= expected {
                prop_assert_eq!(within_tolerance(expected - delta, expected), delta <= bound);
            }
        }
    }
}
