//! Extracted records and their verification reports.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raw structured fields of one entity as returned by the extractor.
pub type Entity = serde_json::Map<String, serde_json::Value>;

/// Whether a field's value was found in the source content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInclusion {
    /// The whole normalized value occurs in the content
    pub full: bool,
    /// Every normalized word of the value occurs in the content
    pub partial: bool,
}

/// Per-field inclusion report, in schema order.
pub type TextInclusion = IndexMap<String, FieldInclusion>;

/// Aggregates the items of one extraction for one catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: Uuid,
    pub catalogue_id: Uuid,
    pub extraction_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Dataset {
    pub fn new(catalogue_id: Uuid, extraction_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            catalogue_id,
            extraction_id,
            created_at: Utc::now(),
        }
    }
}

/// One extracted structured entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataItem {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub crawl_page_id: Uuid,
    pub entity_type: String,
    pub fields: Entity,
    pub text_inclusion: TextInclusion,

    /// Every required field present was fully included
    pub verified: bool,

    pub created_at: DateTime<Utc>,
}
