//! Detection and extraction pipeline.
//!
//! - [`classifier`] - page role, pagination and link pattern of one page
//! - [`detector`] - recursive recipe configuration detection
//! - [`chunker`] - per-entity chunking of long pages
//! - [`extractor`] - entity extraction with text-inclusion verification
//! - [`links`] - link discovery and URL normalization

pub mod chunker;
pub mod classifier;
pub mod detector;
pub mod extractor;
pub mod links;
pub mod prompts;
pub mod responses;
pub mod verify;

pub use chunker::{apply_split, chunk_tolerance, within_tolerance, ContentChunker};
pub use classifier::{PageClassification, PageClassifier, PageInput, PageTypeVerdict};
pub use detector::RecipeDetector;
pub use extractor::{EntityExtractor, VerifiedEntity};
pub use links::{extract_links, normalize_url};
pub use prompts::prompt_version_hash;
pub use verify::{normalize, verify_entity, EntityVerification, VerificationContext};
