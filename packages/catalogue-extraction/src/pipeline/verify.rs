//! Text-inclusion verification of extracted entities.
//!
//! A field is verified when its normalized value occurs verbatim in the
//! normalized source content. Normalization removes markdown link syntax,
//! lowercases, and drops everything that is not alphanumeric, so whitespace
//! and punctuation differences never fail a field.

use regex::Regex;
use std::sync::OnceLock;

use crate::types::catalogue::CatalogueType;
use crate::types::item::{Entity, FieldInclusion, TextInclusion};

fn markdown_link() -> Option<&'static Regex> {
    static LINK: OnceLock<Option<Regex>> = OnceLock::new();
    LINK.get_or_init(|| Regex::new(r"!?\[([^\]]*)\]\([^)]*\)").ok())
        .as_ref()
}

/// Replace `[text](url)` and `![alt](url)` with their text.
pub fn strip_markdown_links(text: &str) -> String {
    match markdown_link() {
        Some(link) => link.replace_all(text, "$1").into_owned(),
        None => text.to_string(),
    }
}

/// Normalize text for containment checks.
pub fn normalize(text: &str) -> String {
    strip_markdown_links(text)
        .chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Content prepared for verifying many fields.
pub struct VerificationContext {
    normalized: String,
}

impl VerificationContext {
    pub fn new(content: &str) -> Self {
        Self {
            normalized: normalize(content),
        }
    }

    /// Inclusion of one text value, or `None` if it is blank.
    pub fn text_inclusion(&self, value: &str) -> Option<FieldInclusion> {
        let normalized = normalize(value);
        if normalized.is_empty() {
            return None;
        }
        let full = self.normalized.contains(&normalized);
        let partial = full
            || strip_markdown_links(value)
                .split_whitespace()
                .map(normalize)
                .filter(|word| !word.is_empty())
                .all(|word| self.normalized.contains(&word));
        Some(FieldInclusion { full, partial })
    }

    /// Inclusion of a JSON field value, or `None` if it is absent.
    ///
    /// A list is fully included only when every element is.
    pub fn value_inclusion(&self, value: &serde_json::Value) -> Option<FieldInclusion> {
        use serde_json::Value;
        match value {
            Value::Null => None,
            Value::String(s) => self.text_inclusion(s),
            Value::Bool(b) => self.text_inclusion(&b.to_string()),
            Value::Number(n) => self.text_inclusion(&n.to_string()),
            Value::Array(items) => {
                let inclusions: Vec<FieldInclusion> =
                    items.iter().filter_map(|item| self.value_inclusion(item)).collect();
                if inclusions.is_empty() {
                    return None;
                }
                Some(FieldInclusion {
                    full: inclusions.iter().all(|i| i.full),
                    partial: inclusions.iter().all(|i| i.partial),
                })
            }
            Value::Object(_) => self.text_inclusion(&value.to_string()),
        }
    }
}

/// Verification result for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityVerification {
    pub inclusion: TextInclusion,

    /// Every required field is absent or fully included
    pub verified: bool,

    /// Required fields present but not fully included
    pub failed_fields: Vec<String>,
}

/// Verify every schema field of `entity` against the context.
pub fn verify_entity(
    entity: &Entity,
    catalogue_type: CatalogueType,
    context: &VerificationContext,
) -> EntityVerification {
    let mut inclusion = TextInclusion::new();
    let mut failed_fields = Vec::new();

    for field in catalogue_type.schema() {
        let Some(field_inclusion) = entity
            .get(field.name)
            .and_then(|value| context.value_inclusion(value))
        else {
            continue;
        };
        if field.required && !field_inclusion.full {
            failed_fields.push(field.name.to_string());
        }
        inclusion.insert(field.name.to_string(), field_inclusion);
    }

    EntityVerification {
        inclusion,
        verified: failed_fields.is_empty(),
        failed_fields,
    }
}
