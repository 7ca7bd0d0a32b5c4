//! Typed errors for the catalogue extraction library.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so that callers can
//! tell retryable transport failures apart from structural detection failures.

use thiserror::Error;

/// Top-level error for every library operation.
#[derive(Debug, Error)]
pub enum Error {
    /// Recipe configuration could not be detected
    #[error(transparent)]
    Detection(#[from] DetectionError),

    /// A page could not be split into entity chunks
    #[error(transparent)]
    Chunking(#[from] ChunkingError),

    /// LLM collaborator failed
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// Browser collaborator failed to render a page
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Persistence collaborator failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Job queue collaborator failed
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// An illegal lifecycle transition was requested
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// A recipe configuration violates its tree invariants
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The extraction was cancelled while the operation ran
    #[error("extraction cancelled")]
    Cancelled,
}

impl Error {
    /// Whether another attempt might succeed.
    ///
    /// Transport failures and malformed detector output are retryable;
    /// structural failures (unknown pagination type, mixed content, depth)
    /// are not, because the same input produces the same outcome.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Detection(e) => e.is_retryable(),
            Error::Llm(e) => e.is_retryable(),
            Error::Fetch(e) => e.is_retryable(),
            Error::Queue(QueueError::Unavailable(_)) => true,
            _ => false,
        }
    }
}

/// Errors raised while detecting a recipe configuration.
#[derive(Debug, Error)]
pub enum DetectionError {
    /// The detector returned a value violating its structural contract
    #[error("bad detector response: {0}")]
    BadResponse(String),

    /// The detector named a pagination scheme the crawler cannot follow
    #[error("unknown pagination type: {0}")]
    UnknownPaginationType(String),

    /// Sampled child pages disagreed on their page type
    #[error("mixed content, cannot determine configuration: {summary}")]
    MixedContent { summary: String },

    /// Links-bearing pages nested deeper than the detector allows
    #[error("exceeded max category depth ({max_levels} levels)")]
    ExceededMaxDepth { max_levels: usize },

    /// A links-bearing page has no usable link pattern
    #[error("link pattern not detected for {url}")]
    LinkPatternMissing { url: String },

    /// The link pattern matched nothing on the page
    #[error("no links found on {url}")]
    NoLinks { url: String },

    /// None of the sampled child pages could be fetched
    #[error("no sampled child page of {url} could be fetched")]
    ChildrenUnavailable { url: String },
}

impl DetectionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DetectionError::BadResponse(_))
    }

    pub fn bad_response(reason: impl Into<String>) -> Self {
        DetectionError::BadResponse(reason.into())
    }
}

/// Errors raised by the content chunker.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Every split attempt was rejected
    #[error("could not split page into chunks after {attempts} attempts: {last_reason}")]
    Exhausted { attempts: usize, last_reason: String },
}

/// Errors from the LLM collaborator.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Network or API failure
    #[error("LLM transport error: {0}")]
    Transport(String),

    /// Provider rate limit hit
    #[error("LLM rate limited")]
    RateLimited,

    /// Collaborator is misconfigured (missing key, bad model)
    #[error("LLM config error: {0}")]
    Config(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Transport(_) | LlmError::RateLimited)
    }
}

/// Page-level fetch failures. Recorded on the page, never fatal to an extraction.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Request timed out
    #[error("timeout fetching {url}")]
    Timeout { url: String },

    /// Non-success status code
    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    /// robots.txt disallows the URL
    #[error("robots.txt disallows {url}")]
    RobotsDisallowed { url: String },

    /// Invalid URL
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// Any other transport failure
    #[error("fetch failed for {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::Http { .. } => true,
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A uniqueness or ownership constraint was violated
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// Backend failure
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Job queue failures.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Queue cannot accept or hand out work right now
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// A claimed job's payload could not be decoded
    #[error("invalid job payload for {job_type}: {reason}")]
    InvalidPayload { job_type: String, reason: String },

    /// Unknown job id
    #[error("job not found: {0}")]
    JobNotFound(uuid::Uuid),
}

/// An illegal status transition.
#[derive(Debug, Error)]
#[error("illegal {entity} transition {from} -> {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, Error>;
