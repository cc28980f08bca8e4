//! Per-file conversion state machine.
//!
//! `Pending -> Loaded -> AliasesResolved -> Materialized -> Written ->
//! SizeChecked -> Verified -> Done`, with `Failed` reachable from any
//! non-terminal state. Stages are never skipped and nothing is retried.

use std::fmt;

use serde::Serialize;

use crate::error::{ConvertError, ConvertResult};

/// Where a single file's conversion currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConversionState {
    Pending,
    Loaded,
    AliasesResolved,
    Materialized,
    Written,
    SizeChecked,
    Verified,
    Done,
    /// Terminal failure. `stage` names the step that was being attempted.
    Failed { stage: String, reason: String },
}

impl ConversionState {
    /// The state that follows this one on success, if any.
    #[must_use]
    pub fn successor(&self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::Loaded),
            Self::Loaded => Some(Self::AliasesResolved),
            Self::AliasesResolved => Some(Self::Materialized),
            Self::Materialized => Some(Self::Written),
            Self::Written => Some(Self::SizeChecked),
            Self::SizeChecked => Some(Self::Verified),
            Self::Verified => Some(Self::Done),
            Self::Done | Self::Failed { .. } => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Loaded => "loaded",
            Self::AliasesResolved => "aliases_resolved",
            Self::Materialized => "materialized",
            Self::Written => "written",
            Self::SizeChecked => "size_checked",
            Self::Verified => "verified",
            Self::Done => "done",
            Self::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for ConversionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { stage, reason } => write!(f, "failed at {}: {}", stage, reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Tracks one file through the pipeline, rejecting out-of-order steps.
#[derive(Debug, Clone)]
pub struct FileConversion {
    state: ConversionState,
}

impl Default for FileConversion {
    fn default() -> Self {
        Self::new()
    }
}

impl FileConversion {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ConversionState::Pending,
        }
    }

    pub fn state(&self) -> &ConversionState {
        &self.state
    }

    /// Move to `next`, which must be the direct successor of the current state.
    ///
    /// # Errors
    ///
    /// Returns `ConvertError::InvalidStateTransition` otherwise; the state is
    /// left unchanged.
    pub fn advance(&mut self, next: ConversionState) -> ConvertResult<()> {
        if self.state.successor().as_ref() != Some(&next) {
            return Err(ConvertError::InvalidStateTransition {
                from: self.state.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        tracing::trace!("{} -> {}", self.state.as_str(), next.as_str());
        self.state = next;
        Ok(())
    }

    /// Record `error` against the step after the current state.
    ///
    /// Failing an already terminal conversion leaves it as it is.
    pub fn fail(&mut self, error: &ConvertError) {
        if self.state.is_terminal() {
            return;
        }
        let stage = self
            .state
            .successor()
            .map_or("unknown", |s| s.as_str())
            .to_string();
        self.state = ConversionState::Failed {
            stage,
            reason: error.to_string(),
        };
    }

    /// Consume the tracker, returning its final state.
    #[must_use]
    pub fn into_state(self) -> ConversionState {
        self.state
    }
}
