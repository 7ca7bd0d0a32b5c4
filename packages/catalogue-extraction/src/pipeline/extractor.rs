//! Entity extraction with text-inclusion verification.
//!
//! Each content unit (a page or one of its chunks) is extracted against the
//! catalogue type's field schema, and every entity is verified field by field
//! against that unit. Entities failing verification get focused
//! re-extractions that show the model its own rejected answer.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::consensus::exponential_retry;
use crate::error::{Error, Result};
use crate::pipeline::chunker::ContentChunker;
use crate::pipeline::prompts::{
    format_extract_entities_prompt, format_reextract_entity_prompt, SYSTEM_PROMPT,
};
use crate::pipeline::responses::{
    self, decode_required, ExtractEntitiesArgs, ReExtractEntityArgs,
};
use crate::pipeline::verify::{verify_entity, EntityVerification, VerificationContext};
use crate::traits::llm::{Llm, LlmTask, ToolRequest, ToolResponse, ToolSchema};
use crate::types::catalogue::CatalogueType;
use crate::types::config::{ExtractorConfig, RetryPolicy};
use crate::types::extraction::TokenUsage;
use crate::types::item::{Entity, TextInclusion};

/// An extracted entity with its final verification report.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedEntity {
    pub fields: Entity,
    pub inclusion: TextInclusion,
    pub verified: bool,

    /// Focused re-extractions spent on this entity
    pub reextractions: usize,
}

/// LLM-backed entity extractor.
#[derive(Clone)]
pub struct EntityExtractor {
    llm: Arc<dyn Llm>,
    retry: RetryPolicy,
    config: ExtractorConfig,
}

impl EntityExtractor {
    pub fn new(llm: Arc<dyn Llm>, retry: RetryPolicy, config: ExtractorConfig) -> Self {
        Self { llm, retry, config }
    }

    /// Extract a whole page, chunking it first when it is oversized and lists
    /// several entities.
    pub async fn extract_document(
        &self,
        chunker: &ContentChunker,
        content: &str,
        catalogue_type: CatalogueType,
        usage: &mut TokenUsage,
    ) -> Result<Vec<VerifiedEntity>> {
        if !chunker.should_chunk(content, catalogue_type, usage).await? {
            return self.extract_unit(content, catalogue_type, usage).await;
        }

        let chunks = chunker.split_chunks(content, catalogue_type, usage).await?;
        let mut entities = Vec::new();
        for (index, chunk) in chunks.iter().enumerate() {
            debug!(chunk = index, "extracting chunk");
            entities.extend(self.extract_unit(chunk, catalogue_type, usage).await?);
        }
        Ok(entities)
    }

    /// Extract and verify the entities of one content unit.
    pub async fn extract_unit(
        &self,
        content: &str,
        catalogue_type: CatalogueType,
        usage: &mut TokenUsage,
    ) -> Result<Vec<VerifiedEntity>> {
        let prompt = format_extract_entities_prompt(catalogue_type, content);
        let (args, call_usage) = self
            .call_decoded::<ExtractEntitiesArgs>(
                LlmTask::ExtractEntities,
                prompt,
                responses::extract_entities_tool(catalogue_type),
            )
            .await?;
        *usage += call_usage;

        let context = VerificationContext::new(content);
        let mut results = Vec::with_capacity(args.entities.len());
        for entity in args.entities {
            let verification = verify_entity(&entity, catalogue_type, &context);
            let result = if verification.verified {
                VerifiedEntity {
                    fields: entity,
                    inclusion: verification.inclusion,
                    verified: true,
                    reextractions: 0,
                }
            } else {
                self.reextract(entity, verification, content, catalogue_type, &context, usage)
                    .await?
            };
            results.push(result);
        }

        let verified = results.iter().filter(|e| e.verified).count();
        info!(
            entities = results.len(),
            verified,
            entity_type = catalogue_type.entity_name(),
            "content unit extracted"
        );
        Ok(results)
    }

    async fn reextract(
        &self,
        mut entity: Entity,
        mut verification: EntityVerification,
        content: &str,
        catalogue_type: CatalogueType,
        context: &VerificationContext,
        usage: &mut TokenUsage,
    ) -> Result<VerifiedEntity> {
        let mut attempts = 0;
        while !verification.verified && attempts < self.config.max_reextractions {
            attempts += 1;
            warn!(
                attempt = attempts,
                failed_fields = ?verification.failed_fields,
                "entity failed verification, re-extracting"
            );

            let previous = serde_json::Value::Object(entity.clone());
            let prompt = format_reextract_entity_prompt(
                catalogue_type,
                &previous,
                &verification.failed_fields,
                content,
            );
            let (args, call_usage) = self
                .call_decoded::<ReExtractEntityArgs>(
                    LlmTask::ReExtractEntity,
                    prompt,
                    responses::reextract_entity_tool(catalogue_type),
                )
                .await?;
            *usage += call_usage;

            entity = args.entity;
            verification = verify_entity(&entity, catalogue_type, context);
        }

        Ok(VerifiedEntity {
            fields: entity,
            inclusion: verification.inclusion,
            verified: verification.verified,
            reextractions: attempts,
        })
    }

    /// Call the LLM and decode its answer, retrying transport failures and
    /// malformed answers.
    async fn call_decoded<T: serde::de::DeserializeOwned + Send>(
        &self,
        task: LlmTask,
        prompt: String,
        tool: ToolSchema,
    ) -> Result<(T, TokenUsage)> {
        let llm = &self.llm;
        let prompt = &prompt;
        let tool = &tool;
        exponential_retry(&self.retry, task.as_str(), move || async move {
            let response: ToolResponse = llm
                .call_tool(ToolRequest {
                    task,
                    system: SYSTEM_PROMPT.to_string(),
                    prompt: prompt.clone(),
                    image: None,
                    tool: tool.clone(),
                })
                .await?;
            let args: T = decode_required(response.output, task.as_str())?;
            Ok::<_, Error>((args, response.usage))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLlm;
    use crate::types::config::ChunkerConfig;
    use serde_json::json;

    const PAGE: &str = "## BIO 101 Intro to Biology\n\nCells, genetics and evolution.";

    fn extractor(llm: &MockLlm) -> EntityExtractor {
        EntityExtractor::new(
            Arc::new(llm.clone()),
            RetryPolicy::immediate(2),
            ExtractorConfig::default(),
        )
    }

    fn course(name: &str) -> serde_json::Value {
        json!({
            "course_id": "BIO 101",
            "course_name": name,
            "course_description": "Cells, genetics and evolution.",
        })
    }

    #[tokio::test]
    async fn test_verified_entity_needs_no_retry() {
        let llm = MockLlm::new().with_entities(vec![course("Intro to Biology")]);
        let mut usage = TokenUsage::default();
        let entities = extractor(&llm)
            .extract_unit(PAGE, CatalogueType::Courses, &mut usage)
            .await
            .unwrap();
        assert_eq!(entities.len(), 1);
        assert!(entities[0].verified);
        assert_eq!(llm.calls_for(LlmTask::ReExtractEntity), 0);
    }

    #[tokio::test]
    async fn test_failed_entity_is_reextracted_with_prior_answer() {
        let llm = MockLlm::new()
            .with_entities(vec![course("Introduction to Biology")])
            .with_reextracted(course("Intro to Biology"));
        let mut usage = TokenUsage::default();
        let entities = extractor(&llm)
            .extract_unit(PAGE, CatalogueType::Courses, &mut usage)
            .await
            .unwrap();
        assert!(entities[0].verified);
        assert_eq!(entities[0].reextractions, 1);

        let prompts = llm.prompts_for(LlmTask::ReExtractEntity);
        assert!(prompts[0].contains("Introduction to Biology"));
        assert!(prompts[0].contains("course_name"));
    }

    #[tokio::test]
    async fn test_reextraction_is_bounded() {
        let llm = MockLlm::new()
            .with_entities(vec![course("Made Up")])
            .with_reextracted(course("Made Up"))
            .with_reextracted(course("Made Up"))
            .with_reextracted(course("Made Up"));
        let mut usage = TokenUsage::default();
        let entities = extractor(&llm)
            .extract_unit(PAGE, CatalogueType::Courses, &mut usage)
            .await
            .unwrap();
        assert!(!entities[0].verified);
        assert_eq!(entities[0].reextractions, 3);
        assert!(!entities[0].inclusion["course_name"].full);
        assert_eq!(llm.calls_for(LlmTask::ReExtractEntity), 3);
    }

    #[tokio::test]
    async fn test_usage_is_accumulated() {
        let llm = MockLlm::new()
            .with_entities(vec![course("Intro to Biology")])
            .with_usage(TokenUsage::new(100, 20));
        let mut usage = TokenUsage::default();
        extractor(&llm)
            .extract_unit(PAGE, CatalogueType::Courses, &mut usage)
            .await
            .unwrap();
        assert_eq!(usage, TokenUsage::new(100, 20));
    }

    #[tokio::test]
    async fn test_long_page_is_extracted_per_chunk() {
        let mut page = String::from("# All courses\n\n");
        for i in 0..3 {
            page.push_str(&format!("## BIO 10{i}\n\nTopic {i} description.\n\n"));
        }
        let llm = MockLlm::new()
            .with_should_chunk(true)
            .with_split(r"## BIO \d+", 3, "BIO 100")
            .with_entities(vec![json!({"course_id": "BIO 100"})])
            .with_entities(vec![json!({"course_id": "BIO 101"})])
            .with_entities(vec![json!({"course_id": "BIO 102"})]);
        let chunker = ContentChunker::new(
            Arc::new(llm.clone()),
            RetryPolicy::immediate(1),
            ChunkerConfig::default().with_token_threshold(10),
        );
        let mut usage = TokenUsage::default();
        let entities = extractor(&llm)
            .extract_document(&chunker, &page, CatalogueType::Courses, &mut usage)
            .await
            .unwrap();
        assert_eq!(entities.len(), 3);
        assert!(entities.iter().all(|e| e.verified));
        let prompts = llm.prompts_for(LlmTask::ExtractEntities);
        assert!(prompts[1].contains("BIO 101") && !prompts[1].contains("BIO 102"));
    }
}
