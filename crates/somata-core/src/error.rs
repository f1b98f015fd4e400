//! Error types for the foundation layer

use thiserror::Error;

/// Result type for foundation operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while constructing or validating core types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Invalid parameter value
    #[error("Invalid parameter {parameter}: {value} (expected {constraint})")]
    InvalidParameter {
        /// Parameter name
        parameter: String,
        /// Invalid value
        value: String,
        /// Constraint description
        constraint: String,
    },

    /// Unknown ligand name
    #[error("Unknown ligand: {name}")]
    UnknownLigand {
        /// Name that failed to parse
        name: String,
    },
}

impl CoreError {
    /// Create an invalid parameter error
    pub fn invalid_parameter(
        parameter: impl Into<String>,
        value: impl Into<String>,
        constraint: impl Into<String>,
    ) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            value: value.into(),
            constraint: constraint.into(),
        }
    }

    /// Create an unknown ligand error
    pub fn unknown_ligand(name: impl Into<String>) -> Self {
        Self::UnknownLigand { name: name.into() }
    }
}
