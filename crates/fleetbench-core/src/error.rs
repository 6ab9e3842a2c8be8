//! Core domain errors.

use thiserror::Error;

/// Core domain errors for FleetBench.
#[derive(Debug, Error)]
pub enum CoreError {
    /// GPU model has no registered provider.
    #[error("Unknown GPU '{0}': no provider registered for it")]
    UnknownGpu(String),

    /// Invalid VM state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Recipe override key is not a known recipe field.
    #[error("Unknown recipe key: {0}")]
    UnknownRecipeKey(String),

    /// Recipe override value has the wrong type for its key.
    #[error("Invalid value for '{key}': expected {expected}")]
    InvalidRecipeValue { key: String, expected: &'static str },

    /// Recipe failed validation.
    #[error("Invalid recipe: {0}")]
    InvalidRecipe(String),
}
