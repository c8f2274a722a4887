use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid approval rule: {0}")]
    InvalidRule(String),
    #[error("document amount must not be negative, got {amount}")]
    NegativeAmount { amount: Decimal },
    #[error("invalid delegation: {0}")]
    InvalidDelegation(String),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

/// Faults the caller is expected to surface or retry. Business outcomes such as an
/// unauthorized decider are reported through result values, never through this type.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    /// Stable machine-readable class, used in structured command output.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Domain(_) => "domain",
            Self::Persistence(_) => "persistence",
            Self::Integration(_) => "integration",
            Self::Configuration(_) => "configuration",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Integration(_))
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use crate::errors::{ApplicationError, DomainError};

    #[test]
    fn domain_error_converts_into_application_error() {
        let error =
            ApplicationError::from(DomainError::NegativeAmount { amount: Decimal::NEGATIVE_ONE });

        assert_eq!(error.class(), "domain");
        assert!(!error.is_retryable());
        assert_eq!(error.to_string(), "document amount must not be negative, got -1");
    }

    #[test]
    fn store_failures_are_retryable() {
        let error = ApplicationError::Persistence("database lock timeout".to_owned());

        assert_eq!(error.class(), "persistence");
        assert!(error.is_retryable());
    }
}
