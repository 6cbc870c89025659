use thiserror::Error;

/// Failure taxonomy shared by every component of the goal engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GoalError {
    /// Malformed goal or profile, or an allocation that cannot be normalized.
    #[error("validation error: {0}")]
    Validation(String),

    /// A parameter path that has no value and no default.
    #[error("parameter not found: {0}")]
    NotFound(String),

    /// Degenerate or empty simulation output, or an abandoned run.
    #[error("computation error: {0}")]
    Computation(String),

    /// Single-flight wait timed out or a lock was poisoned.
    #[error("concurrency error: {0}")]
    Concurrency(String),

    /// Persistence or configuration IO.
    #[error("storage error: {0}")]
    Storage(String),
}

impl GoalError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn computation(msg: impl Into<String>) -> Self {
        Self::Computation(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, GoalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_category_and_message() {
        let err = GoalError::validation("target_amount must be > 0");
        assert_eq!(
            err.to_string(),
            "validation error: target_amount must be > 0"
        );
        assert!(err.is_validation());

        let err = GoalError::NotFound("asset_returns.equity.expected_return".into());
        assert!(err.to_string().starts_with("parameter not found"));
        assert!(!err.is_validation());
    }
}
