//! Closed response types for each LLM task.
//!
//! The model's tool-call arguments are decoded into these types before any
//! validation runs. Each type also supplies the JSON schema of its tool.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::DetectionError;
use crate::traits::llm::ToolSchema;
use crate::types::catalogue::{CatalogueType, FieldKind};
use crate::types::item::Entity;

// =============================================================================
// Tool arguments
// =============================================================================

/// Page role as answered by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageTypeAnswer {
    Detail,
    DetailLinks,
    CategoryLinks,
    Unknown,
}

/// Arguments of the page type tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PageTypeArgs {
    /// The page's role in the catalogue.
    pub page_type: PageTypeAnswer,
}

/// Arguments of the pagination tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PaginationArgs {
    /// Whether the page has pagination controls.
    pub paginated: bool,

    /// "page_num" or "offset".
    #[serde(default)]
    pub url_pattern_type: Option<String>,

    /// Absolute URL containing {page_num} or {offset}.
    #[serde(default)]
    pub url_pattern: Option<String>,

    /// Total number of pages.
    #[serde(default)]
    pub total_pages: Option<u32>,

    /// Offset increment between consecutive pages.
    #[serde(default)]
    pub offset_step: Option<u32>,
}

/// Arguments of the link pattern tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct UrlRegexpArgs {
    /// Regular expression matching every relevant link target.
    pub regexp: String,

    /// Link targets copied from the page that the expression matches.
    #[serde(default)]
    pub examples: Vec<String>,
}

/// Arguments of the chunk confirmation tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ShouldChunkArgs {
    /// Whether the page lists several distinct records.
    pub multiple_entities: bool,
}

/// Arguments of the split tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SplitChunksArgs {
    /// Regular expression matching the start of every record.
    pub split_regexp: String,

    /// Number of records on the page.
    pub expected_count: usize,

    /// Title text of the first record, exactly as written.
    pub first_entity_title: String,
}

/// Arguments of the related link tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RelatedLinksArgs {
    /// URLs of related pages, as they appear in the content.
    #[serde(default)]
    pub urls: Vec<String>,
}

/// Arguments of the entity extraction tool.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractEntitiesArgs {
    #[serde(default)]
    pub entities: Vec<Entity>,
}

/// Arguments of the focused re-extraction tool.
#[derive(Debug, Clone, Deserialize)]
pub struct ReExtractEntityArgs {
    pub entity: Entity,
}

// =============================================================================
// Tool schemas
// =============================================================================

fn tool<T: JsonSchema>(name: &str, description: &str) -> ToolSchema {
    let schema = schemars::schema_for!(T);
    ToolSchema {
        name: name.to_string(),
        description: description.to_string(),
        parameters: serde_json::to_value(schema).unwrap_or_else(|_| json!({"type": "object"})),
    }
}

pub fn page_type_tool() -> ToolSchema {
    tool::<PageTypeArgs>("classify_page_type", "Record the page's role in the catalogue")
}

pub fn pagination_tool() -> ToolSchema {
    tool::<PaginationArgs>("record_pagination", "Record the page's pagination scheme")
}

pub fn url_regexp_tool() -> ToolSchema {
    tool::<UrlRegexpArgs>("record_link_pattern", "Record the link pattern of the page")
}

pub fn should_chunk_tool() -> ToolSchema {
    tool::<ShouldChunkArgs>("record_multiple_entities", "Record whether the page lists several records")
}

pub fn split_chunks_tool() -> ToolSchema {
    tool::<SplitChunksArgs>("record_split_pattern", "Record how to split the page into records")
}

pub fn related_links_tool() -> ToolSchema {
    tool::<RelatedLinksArgs>("record_related_links", "Record links to related pages")
}

/// JSON schema of one entity of `catalogue_type`.
pub fn entity_schema(catalogue_type: CatalogueType) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for field in catalogue_type.schema() {
        let property = match field.kind {
            FieldKind::Text => json!({"type": "string", "description": field.description}),
            FieldKind::TextList => json!({
                "type": "array",
                "items": {"type": "string"},
                "description": field.description,
            }),
        };
        properties.insert(field.name.to_string(), property);
        if field.required {
            required.push(field.name);
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

pub fn extract_entities_tool(catalogue_type: CatalogueType) -> ToolSchema {
    ToolSchema {
        name: "record_entities".to_string(),
        description: format!("Record every {} found", catalogue_type.entity_name()),
        parameters: json!({
            "type": "object",
            "properties": {
                "entities": {"type": "array", "items": entity_schema(catalogue_type)},
            },
            "required": ["entities"],
        }),
    }
}

pub fn reextract_entity_tool(catalogue_type: CatalogueType) -> ToolSchema {
    ToolSchema {
        name: "record_entity".to_string(),
        description: format!("Record the corrected {}", catalogue_type.entity_name()),
        parameters: json!({
            "type": "object",
            "properties": {"entity": entity_schema(catalogue_type)},
            "required": ["entity"],
        }),
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode tool-call arguments.
///
/// `None` means the model did not call the tool. Arguments that do not fit
/// the closed type are a bad detector response.
pub fn decode<T: DeserializeOwned>(
    output: Option<serde_json::Value>,
) -> Result<Option<T>, DetectionError> {
    output
        .map(|value| {
            serde_json::from_value(value)
                .map_err(|e| DetectionError::bad_response(format!("malformed tool arguments: {e}")))
        })
        .transpose()
}

/// Decode tool-call arguments that must be present.
pub fn decode_required<T: DeserializeOwned>(
    output: Option<serde_json::Value>,
    task: &str,
) -> Result<T, DetectionError> {
    decode(output)?.ok_or_else(|| DetectionError::bad_response(format!("{task}: no tool call")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_type_args_schema() {
        let schema = schemars::schema_for!(PageTypeArgs);
        assert!(schema.schema.object.is_some());
    }

    #[test]
    fn test_decode_unknown_page_type_string_is_bad_response() {
        let err = decode::<PageTypeArgs>(Some(json!({"page_type": "LISTING"}))).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_decode_no_tool_call() {
        assert!(decode::<PageTypeArgs>(None).unwrap().is_none());
        assert!(decode_required::<ShouldChunkArgs>(None, "should_chunk").is_err());
    }

    #[test]
    fn test_entity_schema_lists_required_fields() {
        let schema = entity_schema(CatalogueType::Courses);
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&json!("course_id")));
        assert!(!required.contains(&json!("course_credits_min")));
        assert_eq!(
            schema["properties"]["course_prerequisites"]["type"],
            "array"
        );
    }
}
