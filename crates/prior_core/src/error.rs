//! Error types for prior configuration and computation.

use thiserror::Error;

/// Main error type for prior operations.
#[derive(Error, Debug)]
pub enum PriorError {
    /// Two volumes that must share a grid do not.
    #[error("geometry mismatch: {explanation}")]
    Geometry { explanation: String },

    /// A configuration value is unusable (irregular weights array,
    /// negative penalisation factor, missing kappa volume, ...).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An operation the prior does not implement was invoked.
    #[error("'{operation}' is not implemented by the '{prior}' prior")]
    Unimplemented {
        operation: &'static str,
        prior: &'static str,
    },

    /// A computation was invoked before a successful `set_up`.
    #[error("the '{prior}' prior was used before set_up")]
    NotSetUp { prior: &'static str },
}

/// Result type for prior operations.
pub type Result<T> = std::result::Result<T, PriorError>;

impl PriorError {
    /// Create a geometry mismatch error.
    pub fn geometry(explanation: impl Into<String>) -> Self {
        Self::Geometry {
            explanation: explanation.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an unimplemented-operation error.
    pub fn unimplemented(operation: &'static str, prior: &'static str) -> Self {
        Self::Unimplemented { operation, prior }
    }

    /// Create a used-before-set_up error.
    pub fn not_set_up(prior: &'static str) -> Self {
        Self::NotSetUp { prior }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PriorError::geometry("shapes differ");
        assert!(matches!(err, PriorError::Geometry { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = PriorError::invalid_configuration("weights array is irregular");
        assert_eq!(
            err.to_string(),
            "invalid configuration: weights array is irregular"
        );

        let err = PriorError::unimplemented("compute_Hessian", "Quadratic");
        assert!(err.to_string().contains("compute_Hessian"));
        assert!(err.to_string().contains("Quadratic"));
    }

    #[test]
    fn test_not_set_up_display() {
        let err = PriorError::not_set_up("Quadratic");
        assert_eq!(err.to_string(), "the 'Quadratic' prior was used before set_up");
    }
}
