//! Lifecycle state machines for recipes, extractions and crawl pages.
//!
//! Every status change in the crate goes through [`Lifecycle::transition`],
//! so an illegal move (for example completing a cancelled extraction) is
//! rejected instead of silently persisted.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TransitionError;

/// Shared transition logic for status enums.
pub trait Lifecycle: Copy + fmt::Debug + PartialEq {
    /// Entity name used in transition errors.
    const ENTITY: &'static str;

    /// Whether `next` may follow `self`.
    fn can_transition_to(self, next: Self) -> bool;

    /// Whether no further transition is expected without operator action.
    fn is_terminal(self) -> bool;

    /// Validate and perform a transition.
    fn transition(self, next: Self) -> Result<Self, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                entity: Self::ENTITY,
                from: format!("{self:?}"),
                to: format!("{next:?}"),
            })
        }
    }
}

/// Status of recipe configuration detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipeDetectionStatus {
    #[default]
    Waiting,
    InProgress,
    Success,
    Error,
}

impl Lifecycle for RecipeDetectionStatus {
    const ENTITY: &'static str = "recipe";

    fn can_transition_to(self, next: Self) -> bool {
        use RecipeDetectionStatus::*;
        matches!(
            (self, next),
            (Waiting, InProgress)
                | (InProgress, Success)
                | (InProgress, Error)
                // Re-detection
                | (Success, InProgress)
                | (Error, InProgress)
                // Manual reconfiguration
                | (Waiting, Success)
                | (Success, Success)
                | (Error, Success)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// Status of one extraction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionStatus {
    #[default]
    Waiting,
    InProgress,
    Complete,
    Cancelled,
    Stale,
}

impl ExtractionStatus {
    /// Whether jobs belonging to this extraction may still run.
    pub fn accepts_work(self) -> bool {
        matches!(self, Self::Waiting | Self::InProgress)
    }
}

impl Lifecycle for ExtractionStatus {
    const ENTITY: &'static str = "extraction";

    fn can_transition_to(self, next: Self) -> bool {
        use ExtractionStatus::*;
        matches!(
            (self, next),
            (Waiting, InProgress)
                | (Waiting, Cancelled)
                | (InProgress, Complete)
                | (InProgress, Cancelled)
                | (InProgress, Stale)
                // Retrying failed items reopens the run
                | (Complete, InProgress)
                | (Stale, InProgress)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Stale)
    }
}

/// Status of a crawl page (fetch) or of its data extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageStatus {
    #[default]
    Waiting,
    InProgress,
    Success,
    Error,
}

impl Lifecycle for PageStatus {
    const ENTITY: &'static str = "page";

    fn can_transition_to(self, next: Self) -> bool {
        use PageStatus::*;
        matches!(
            (self, next),
            (Waiting, InProgress)
                | (InProgress, Success)
                | (InProgress, Error)
                // Job rescheduled after a retryable failure
                | (InProgress, Waiting)
                // Retry failed items
                | (Error, Waiting)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}
