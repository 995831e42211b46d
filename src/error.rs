//! Typed errors raised by the training engine.
//!
//! Most functions in the crate return `anyhow::Result`; these variants are the ones a
//! caller may want to match on after `anyhow::Error::downcast_ref::<EngineError>()`.

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Misconfiguration or a broken caller contract. Never silently corrected.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// The variant does not support the requested mode.
    #[error("{0}")]
    NotImplemented(String),

    /// The scheduler's configured prediction type is neither `epsilon` nor `v_prediction`.
    #[error("Unknown prediction type {0}")]
    UnknownPredictionType(String),

    /// Checkpoint export was asked for a sub-network it cannot publish.
    #[error("These keys are supported: {allowed:?}, but got {got:?}")]
    UnknownSaveKey { allowed: Vec<String>, got: Vec<String> },

    /// A pretrained model directory lacks a sub-network the variant needs.
    #[error("missing component: {0}")]
    MissingComponent(String),
}

/// Shorthand for `Err(EngineError::ContractViolation(..).into())`.
macro_rules! contract_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::EngineError::ContractViolation(format!($($arg)*)).into())
    };
}

pub(crate) use contract_bail;
