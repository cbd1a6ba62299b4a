//! Errors in the library.
use thiserror::Error;

/// Errors in the library.
///
/// Nothing here is recoverable within the training core: configuration
/// errors and unsupported-feature errors are surfaced to the operator as
/// a hard stop, and a failed training step aborts the run.
#[derive(Error, Debug)]
pub enum TwirlError {
    /// Invalid configuration, shape, or precondition.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A feature that is intentionally out of scope.
    ///
    /// These mark deferred code paths (critic training, behavior cloning,
    /// pretrain mixing, shared actor-critic, custom single prompt mode),
    /// rejected when the configuration is validated.
    #[error("Unsupported feature: {0}")]
    Unsupported(String),

    /// Action sequences longer than the verified maximum.
    ///
    /// The interaction between right padding, EOS truncation and
    /// reweighting is unverified beyond this length; the losses refuse to
    /// compute a possibly wrong answer.
    #[error(
        "Action sequences of length {len} exceed the verified maximum of {max}; \
         check EOS/padding handling before lifting this limit"
    )]
    SequenceTooLong {
        /// Length of the action part of the offending batch.
        len: i64,
        /// Maximum verified action length.
        max: i64,
    },

    /// Record key error.
    #[error("Record key error: {0}")]
    RecordKey(String),

    /// Record value type error.
    #[error("Record value type error: {0}")]
    RecordValueType(String),
}
