//! Configuration for detection, chunking, extraction and crawling.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Exponential backoff policy for a single noisy operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first. Default: 3.
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on each subsequent retry.
    /// Default: 500ms.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// A policy that retries immediately. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Delay to wait after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Page classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Votes per classification step (`bestOutOf` n). Default: 3.
    pub votes: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self { votes: 3 }
    }
}

impl ClassifierConfig {
    pub fn with_votes(mut self, votes: usize) -> Self {
        self.votes = votes.max(1);
        self
    }
}

/// Content chunker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Pages above this estimated token count are chunk candidates.
    ///
    /// Default: 15000.
    pub token_threshold: usize,

    /// Split attempts before the page fails. Default: 10.
    pub max_attempts: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            token_threshold: 15_000,
            max_attempts: 10,
        }
    }
}

impl ChunkerConfig {
    pub fn with_token_threshold(mut self, threshold: usize) -> Self {
        self.token_threshold = threshold;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

/// Entity extractor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Focused re-extractions for an entity that fails verification.
    ///
    /// Default: 3.
    pub max_reextractions: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_reextractions: 3,
        }
    }
}

impl ExtractorConfig {
    pub fn with_max_reextractions(mut self, max: usize) -> Self {
        self.max_reextractions = max;
        self
    }
}

/// Recipe detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Navigation levels explored before giving up. Default: 3.
    pub max_levels: usize,

    /// Child links sampled to confirm a level. Default: 5.
    pub sample_size: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_levels: 3,
            sample_size: 5,
        }
    }
}

impl DetectorConfig {
    pub fn with_max_levels(mut self, levels: usize) -> Self {
        self.max_levels = levels;
        self
    }

    pub fn with_sample_size(mut self, size: usize) -> Self {
        self.sample_size = size.max(1);
        self
    }
}

/// Crawl orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Exploratory discovery stops at this many step levels below the root.
    ///
    /// Default: 8.
    pub max_step_depth: usize,

    /// Scheduling delay applied to newly discovered child pages.
    ///
    /// Default: 1s.
    pub child_delay: Duration,

    /// Push newly discovered children to the front of the queue.
    ///
    /// Default: true (depth-first, keeps the frontier small).
    pub lifo: bool,

    /// Proxy handed to the browser for every fetch.
    pub proxy: Option<String>,

    /// Attempts per job before its failure is recorded. Default: 3.
    pub max_job_attempts: u32,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_step_depth: 8,
            child_delay: Duration::from_secs(1),
            lifo: true,
            proxy: None,
            max_job_attempts: 3,
        }
    }
}

impl CrawlConfig {
    pub fn with_child_delay(mut self, delay: Duration) -> Self {
        self.child_delay = delay;
        self
    }

    pub fn with_lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_max_step_depth(mut self, depth: usize) -> Self {
        self.max_step_depth = depth;
        self
    }

    pub fn with_max_job_attempts(mut self, attempts: u32) -> Self {
        self.max_job_attempts = attempts.max(1);
        self
    }
}

/// All engine settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub classifier: ClassifierConfig,
    pub chunker: ChunkerConfig,
    pub extractor: ExtractorConfig,
    pub detector: DetectorConfig,
    pub crawl: CrawlConfig,
}

impl EngineConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `CATALOGUE_*` environment variables.
    ///
    /// Unset variables keep their default; unparsable values are an error.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse("CATALOGUE_RETRY_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = env_parse("CATALOGUE_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("CATALOGUE_CLASSIFIER_VOTES")? {
            config.classifier = config.classifier.with_votes(v);
        }
        if let Some(v) = env_parse("CATALOGUE_CHUNK_TOKEN_THRESHOLD")? {
            config.chunker.token_threshold = v;
        }
        if let Some(v) = env_parse("CATALOGUE_CHUNK_ATTEMPTS")? {
            config.chunker = config.chunker.with_max_attempts(v);
        }
        if let Some(v) = env_parse("CATALOGUE_MAX_REEXTRACTIONS")? {
            config.extractor.max_reextractions = v;
        }
        if let Some(v) = env_parse("CATALOGUE_DETECT_MAX_LEVELS")? {
            config.detector.max_levels = v;
        }
        if let Some(v) = env_parse("CATALOGUE_DETECT_SAMPLE_SIZE")? {
            config.detector = config.detector.with_sample_size(v);
        }
        if let Some(v) = env_parse("CATALOGUE_CRAWL_MAX_DEPTH")? {
            config.crawl.max_step_depth = v;
        }
        if let Some(v) = env_parse("CATALOGUE_CRAWL_CHILD_DELAY_MS")? {
            config.crawl.child_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("CATALOGUE_CRAWL_LIFO")? {
            config.crawl.lifo = v;
        }
        if let Some(v) = env_parse("CATALOGUE_CRAWL_JOB_ATTEMPTS")? {
            config.crawl = config.crawl.with_max_job_attempts(v);
        }
        config.crawl.proxy = env::var("CATALOGUE_CRAWL_PROXY").ok().or(config.crawl.proxy);

        Ok(config)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_chunker(mut self, chunker: ChunkerConfig) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn with_extractor(mut self, extractor: ExtractorConfig) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_detector(mut self, detector: DetectorConfig) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_crawl(mut self, crawl: CrawlConfig) -> Self {
        self.crawl = crawl;
        self
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::InvalidConfiguration(format!("{key}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.detector.max_levels, 3);
        assert_eq!(config.detector.sample_size, 5);
        assert_eq!(config.chunker.token_threshold, 15_000);
        assert_eq!(config.chunker.max_attempts, 10);
        assert_eq!(config.extractor.max_reextractions, 3);
        assert_eq!(config.crawl.max_step_depth, 8);
        assert!(config.crawl.lifo);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_builders_clamp_zero() {
        let config = ClassifierConfig::default().with_votes(0);
        assert_eq!(config.votes, 1);
    }
}
