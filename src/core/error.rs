//! Error types for registry operations.

use thiserror::Error;

/// Business failures reported by the [`Registry`](crate::core::Registry).
///
/// None of these are fatal; callers turn them into structured responses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// An occupant with this key is already present.
    #[error("occupant already present: {0}")]
    Duplicate(String),
    /// Every slot is taken and the caller asked not to wait.
    #[error("pool full")]
    Full,
    /// Every slot stayed taken for the whole wait timeout.
    #[error("pool full: wait timed out")]
    WaitTimedOut,
    /// No record exists for this key.
    #[error("occupant not found: {0}")]
    NotFound(String),
    /// The occupant already left.
    #[error("occupant already released: {0}")]
    AlreadyReleased(String),
    /// The registry stopped accepting blocking admissions.
    #[error("registry closed")]
    Closed,
    /// Rates must be finite and strictly positive.
    #[error("rates must be positive numbers")]
    InvalidRate,
}

impl RegistryError {
    /// True for both flavours of capacity exhaustion.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        matches!(self, Self::Full | Self::WaitTimedOut)
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            RegistryError::Duplicate("AB123".into()).to_string(),
            "occupant already present: AB123"
        );
        assert_eq!(RegistryError::Full.to_string(), "pool full");
        assert_eq!(RegistryError::InvalidRate.to_string(), "rates must be positive numbers");
    }

    #[test]
    fn test_is_full() {
        assert!(RegistryError::Full.is_full());
        assert!(RegistryError::WaitTimedOut.is_full());
        assert!(!RegistryError::NotFound("x".into()).is_full());
    }
}
