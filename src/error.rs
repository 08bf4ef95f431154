use thiserror::Error;

use crate::address::Address;

/// Errors raised by the inference engine itself.
///
/// Errors coming out of user model code are `anyhow::Error`s and are
/// propagated unchanged; these variants cover misuse of the engine and
/// invalid inputs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PplError {
    #[error("Address {address} was recorded twice in one trace")]
    AddressCollision { address: Address },

    #[error("Proposal network inference requested but no proposal network is available")]
    MissingInferenceNetwork,

    #[error("Cannot add to an empirical distribution after it was finalized")]
    IllegalPosteriorMutation,

    #[error("Empirical distribution is not finalized")]
    PosteriorNotFinalized,

    #[error("Empirical distribution has no entries")]
    EmptyPosterior,

    #[error("Invalid parameter for {distribution}: {reason}")]
    InvalidParameter {
        distribution: &'static str,
        reason: String,
    },

    #[error("Invalid weight {0}, weights must be finite and non-negative")]
    InvalidWeight(f64),

    #[error("Expected a {expected} value, found {found}")]
    ValueType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Address index failure: {0}")]
    AddressIndex(String),
}

pub type Result<T> = std::result::Result<T, PplError>;

pub(crate) fn invalid_param(distribution: &'static str, reason: impl Into<String>) -> PplError {
    PplError::InvalidParameter {
        distribution,
        reason: reason.into(),
    }
}
