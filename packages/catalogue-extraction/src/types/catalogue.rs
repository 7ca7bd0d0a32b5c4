//! Catalogues and the entity schemas extracted from them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of records a catalogue publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CatalogueType {
    Courses,
    LearningPrograms,
    Credentials,
    Competencies,
}

/// Value shape of an entity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    TextList,
}

/// One field of an entity schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
    pub kind: FieldKind,
}

impl FieldSpec {
    const fn required(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            required: true,
            kind: FieldKind::Text,
        }
    }

    const fn optional(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            required: false,
            kind: FieldKind::Text,
        }
    }

    const fn list(self) -> Self {
        Self {
            kind: FieldKind::TextList,
            ..self
        }
    }
}

const COURSE_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("course_id", "Course code, e.g. \"MATH 221\""),
    FieldSpec::required("course_name", "Course title without the code"),
    FieldSpec::required(
        "course_description",
        "Full course description exactly as written",
    ),
    FieldSpec::optional("course_credits_min", "Minimum credit hours"),
    FieldSpec::optional("course_credits_max", "Maximum credit hours"),
    FieldSpec::optional("course_prerequisites", "Prerequisite course codes").list(),
];

const LEARNING_PROGRAM_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("learning_program_name", "Program name"),
    FieldSpec::required(
        "learning_program_description",
        "Program description exactly as written",
    ),
    FieldSpec::optional("learning_program_type", "Degree or award type, e.g. \"B.S.\""),
    FieldSpec::optional("learning_program_level", "Undergraduate, graduate, etc."),
];

const CREDENTIAL_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("credential_name", "Credential name"),
    FieldSpec::required(
        "credential_description",
        "Credential description exactly as written",
    ),
    FieldSpec::optional("credential_type", "Certificate, license, badge, etc."),
];

const COMPETENCY_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("competency_text", "Competency statement exactly as written"),
    FieldSpec::optional("competency_label", "Short label for the competency"),
    FieldSpec::optional("competency_category", "Grouping heading the competency sits under"),
    FieldSpec::optional("competency_framework", "Framework the competency belongs to"),
];

impl CatalogueType {
    /// Entity field schema for this catalogue type.
    pub fn schema(self) -> &'static [FieldSpec] {
        match self {
            CatalogueType::Courses => COURSE_FIELDS,
            CatalogueType::LearningPrograms => LEARNING_PROGRAM_FIELDS,
            CatalogueType::Credentials => CREDENTIAL_FIELDS,
            CatalogueType::Competencies => COMPETENCY_FIELDS,
        }
    }

    /// Whether extraction may discover pages beyond the recipe.
    pub fn is_exploratory(self) -> bool {
        matches!(self, CatalogueType::Competencies)
    }

    /// Singular entity name used in prompts and data items.
    pub fn entity_name(self) -> &'static str {
        match self {
            CatalogueType::Courses => "course",
            CatalogueType::LearningPrograms => "learning program",
            CatalogueType::Credentials => "credential",
            CatalogueType::Competencies => "competency",
        }
    }

    pub fn required_fields(self) -> impl Iterator<Item = &'static FieldSpec> {
        self.schema().iter().filter(|f| f.required)
    }
}

/// A public catalogue belonging to an institution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalogue {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub catalogue_type: CatalogueType,
}

impl Catalogue {
    pub fn new(name: impl Into<String>, url: impl Into<String>, catalogue_type: CatalogueType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            url: url.into(),
            catalogue_type,
        }
    }
}
