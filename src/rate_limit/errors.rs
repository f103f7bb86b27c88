//! Rate limiter errors.
//!
//! `Exceeded` means busy and is retryable. `Configuration` and
//! `InvalidPermit` mean the permit itself is misconfigured; retrying cannot
//! help.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded for permit '{name}' after waiting {waited:?}")]
    Exceeded { name: String, waited: Duration },

    #[error("Permit template '{template}' requires parameter '{placeholder}'")]
    Configuration {
        template: String,
        placeholder: String,
    },

    #[error("Invalid permit '{name}': {reason}")]
    InvalidPermit { name: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RateLimitError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Exceeded { .. } | Self::Store(_))
    }

    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::InvalidPermit { .. })
    }
}

pub type RateLimitResult<T> = Result<T, RateLimitError>;
