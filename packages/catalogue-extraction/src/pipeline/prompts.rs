//! LLM prompts for page classification, chunking and entity extraction.
//!
//! Each prompt asks for a single tool call; the tool's parameter schema comes
//! from the response types in [`super::responses`].

use sha2::{Digest, Sha256};

use crate::types::catalogue::{CatalogueType, FieldKind};

/// System prompt shared by every catalogue task.
pub const SYSTEM_PROMPT: &str = "You analyse pages of institutional course \
catalogues. Answer only by calling the provided tool. Copy text exactly as it \
appears on the page; never invent values.";

/// Prompt for classifying a page's role in the catalogue.
pub const CLASSIFY_PAGE_TYPE_PROMPT: &str = r#"Classify this page from a {entity} catalogue.

Page types:
- DETAIL: the page itself describes one or more {entity} records with their full details
- DETAIL_LINKS: the page lists links, each leading to a page describing a {entity}
- CATEGORY_LINKS: the page lists links to category or department pages, which in turn list {entity} links

If none of these apply, answer UNKNOWN.

Page URL: {url}
Page Content:
{content}"#;

/// Prompt for detecting the pagination scheme of an index page.
pub const DETECT_PAGINATION_PROMPT: &str = r#"Does this catalogue index page have pagination controls?

If it does, give a URL pattern for the pages, using {page_num} where the page number goes or {offset} where a record offset goes. The pattern must be an absolute URL built from links that appear on the page. Also give the total number of pages, and for offset patterns the offset increment between pages.

If the page is not paginated, set paginated to false.

Page URL: {url}
Page Content:
{content}"#;

/// Prompt for detecting the link pattern of an index page.
pub const DETECT_URL_REGEXP_PROMPT: &str = r#"This page is a {page_type} page of a {entity} catalogue.

Write one regular expression that matches the URLs of every {target} linked from this page, and nothing else. The expression is applied to the page content below, so it must match the link targets as they are written there.

Also list up to five example URLs, copied exactly from the content, that the expression matches.

Page URL: {url}
Page Content:
{content}"#;

/// Prompt for confirming that a long page lists several entities.
pub const SHOULD_CHUNK_PROMPT: &str = r#"Does this page list several distinct {entity} records, each with its own details, one after another?

Page Content:
{content}"#;

/// Prompt for deriving a split pattern for a long page.
pub const SPLIT_CHUNKS_PROMPT: &str = r#"This page lists many {entity} records. Give a regular expression that matches the start of every record, so the page can be split into one chunk per record.

Also give the number of records on the page and the title text of the first record, exactly as written.
{feedback}
Page Content:
{content}"#;

/// Prompt for extracting entities from a page or chunk.
pub const EXTRACT_ENTITIES_PROMPT: &str = r#"Extract every {entity} described in the content below.

Fields:
{fields}

Copy values exactly as they appear. Leave a field out when the content does not state it.

Content:
{content}"#;

/// Prompt for re-extracting one entity whose previous answer failed verification.
pub const REEXTRACT_ENTITY_PROMPT: &str = r#"You previously extracted this {entity} from the content below, but these fields were not found in the content word for word: {failed_fields}.

Previous answer:
{previous}

Fields:
{fields}

Extract the {entity} again, copying each value exactly from the content.

Content:
{content}"#;

/// Prompt for finding pages related to competencies.
pub const DISCOVER_RELATED_LINKS_PROMPT: &str = r#"This page belongs to a {entity} catalogue. List the URLs linked from it that lead to further {entity} content (for example outcomes, standards or framework pages). Only list URLs that appear in the content.

Page URL: {url}
Page Content:
{content}"#;

/// Format the page type classification prompt.
pub fn format_classify_page_type_prompt(
    catalogue_type: CatalogueType,
    url: &str,
    content: &str,
) -> String {
    CLASSIFY_PAGE_TYPE_PROMPT
        .replace("{entity}", catalogue_type.entity_name())
        .replace("{url}", url)
        .replace("{content}", content)
}

/// Format the pagination detection prompt.
pub fn format_detect_pagination_prompt(url: &str, content: &str) -> String {
    DETECT_PAGINATION_PROMPT
        .replace("{url}", url)
        .replace("{content}", content)
}

/// Format the link pattern prompt.
pub fn format_detect_url_regexp_prompt(
    catalogue_type: CatalogueType,
    page_type: &str,
    links_to_details: bool,
    url: &str,
    content: &str,
) -> String {
    let entity = catalogue_type.entity_name();
    let target = if links_to_details {
        format!("{entity} detail pages")
    } else {
        "category pages".to_string()
    };
    DETECT_URL_REGEXP_PROMPT
        .replace("{page_type}", page_type)
        .replace("{target}", &target)
        .replace("{entity}", entity)
        .replace("{url}", url)
        .replace("{content}", content)
}

/// Format the chunk confirmation prompt.
pub fn format_should_chunk_prompt(catalogue_type: CatalogueType, content: &str) -> String {
    SHOULD_CHUNK_PROMPT
        .replace("{entity}", catalogue_type.entity_name())
        .replace("{content}", content)
}

/// Format the split prompt, including feedback on rejected attempts.
pub fn format_split_chunks_prompt(
    catalogue_type: CatalogueType,
    content: &str,
    rejections: &[String],
) -> String {
    let feedback = if rejections.is_empty() {
        String::new()
    } else {
        let mut feedback = String::from("\nPrevious attempts were rejected:\n");
        for (i, reason) in rejections.iter().enumerate() {
            feedback.push_str(&format!("{}. {}\n", i + 1, reason));
        }
        feedback
    };
    SPLIT_CHUNKS_PROMPT
        .replace("{entity}", catalogue_type.entity_name())
        .replace("{feedback}", &feedback)
        .replace("{content}", content)
}

/// Format the entity extraction prompt.
pub fn format_extract_entities_prompt(catalogue_type: CatalogueType, content: &str) -> String {
    EXTRACT_ENTITIES_PROMPT
        .replace("{entity}", catalogue_type.entity_name())
        .replace("{fields}", &format_fields(catalogue_type))
        .replace("{content}", content)
}

/// Format the focused re-extraction prompt.
pub fn format_reextract_entity_prompt(
    catalogue_type: CatalogueType,
    previous: &serde_json::Value,
    failed_fields: &[String],
    content: &str,
) -> String {
    let previous = serde_json::to_string_pretty(previous).unwrap_or_default();
    REEXTRACT_ENTITY_PROMPT
        .replace("{entity}", catalogue_type.entity_name())
        .replace("{failed_fields}", &failed_fields.join(", "))
        .replace("{previous}", &previous)
        .replace("{fields}", &format_fields(catalogue_type))
        .replace("{content}", content)
}

/// Format the related link discovery prompt.
pub fn format_discover_related_links_prompt(
    catalogue_type: CatalogueType,
    url: &str,
    content: &str,
) -> String {
    DISCOVER_RELATED_LINKS_PROMPT
        .replace("{entity}", catalogue_type.entity_name())
        .replace("{url}", url)
        .replace("{content}", content)
}

fn format_fields(catalogue_type: CatalogueType) -> String {
    catalogue_type
        .schema()
        .iter()
        .map(|field| {
            let required = if field.required { "required" } else { "optional" };
            let kind = match field.kind {
                FieldKind::Text => "text",
                FieldKind::TextList => "list of text",
            };
            format!("- {} ({kind}, {required}): {}", field.name, field.description)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Hash of the prompt templates, for tracing which prompt produced a recipe.
pub fn prompt_version_hash() -> String {
    let mut hasher = Sha256::new();
    for prompt in [
        CLASSIFY_PAGE_TYPE_PROMPT,
        DETECT_PAGINATION_PROMPT,
        DETECT_URL_REGEXP_PROMPT,
        SHOULD_CHUNK_PROMPT,
        SPLIT_CHUNKS_PROMPT,
        EXTRACT_ENTITIES_PROMPT,
        REEXTRACT_ENTITY_PROMPT,
    ] {
        hasher.update(prompt.as_bytes());
    }
    hex::encode(&hasher.finalize()[..8])
}
