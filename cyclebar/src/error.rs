use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors reported by barrier operations.
///
/// Nothing in this crate retries on its own. Callers decide what to do with
/// [`BarrierError::NotFound`], the only kind for which
/// [`BarrierError::is_retryable`] returns `true`.
#[derive(Error, Debug)]
pub enum BarrierError {
    #[error("barrier {uri} not found (leader has not created it yet, or it is stale)")]
    NotFound { uri: String },

    #[error("barrier {uri} is already live with {existing} participants (requested {requested})")]
    AlreadyExists {
        uri: String,
        existing: u32,
        requested: u32,
    },

    #[error("barrier {uri} expects {expected} participants, opener supplied {supplied}")]
    MismatchedParticipantCount {
        uri: String,
        expected: u32,
        supplied: u32,
    },

    #[error("barrier {uri} has been closed")]
    BarrierClosed { uri: String },

    #[error("barrier {uri} timed out after {waited:?} waiting for cycle {cycle}")]
    BarrierTimeout {
        uri: String,
        cycle: u64,
        waited: Duration,
    },

    #[error("barrier {uri} was not closed before its handle went away")]
    ResourceLeak { uri: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid barrier uri {0:?}")]
    InvalidUri(String),

    #[error("{uri} does not hold a barrier of this layout: {reason}")]
    Corrupt { uri: String, reason: String },

    #[error("barrier {uri}: {source}")]
    Io {
        uri: String,
        #[source]
        source: io::Error,
    },
}

impl BarrierError {
    /// Only a follower racing ahead of its leader is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BarrierError::NotFound { .. })
    }

    pub(crate) fn io(uri: &str, source: io::Error) -> Self {
        BarrierError::Io {
            uri: uri.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BarrierError>;
