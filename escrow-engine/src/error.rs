//! Error types for the escrow system
//!
//! Errors fall into a small taxonomy that callers act on differently:
//! validation and conflict errors are rejected synchronously and never
//! partially applied, provisional proofs and not-ready conditions are retried
//! later, provider errors are swallowed at the scheduler boundary, and invalid
//! proofs are terminal and hand over to dispute resolution.

use thiserror::Error;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Malformed input (payout sets, fee rates, ids, hashes)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Revealed preimage does not hash to the commitment
    #[error("Preimage mismatch: sha256(preimage) = {actual}, commitment = {expected}")]
    PreimageMismatch { expected: String, actual: String },

    /// Proof cannot be verified yet (insufficient depth or missing data)
    #[error("Proof provisional: {0}")]
    ProofProvisional(String),

    /// Proof is cryptographically wrong
    #[error("Proof invalid: {0}")]
    ProofInvalid(String),

    /// Operation requested before its preconditions are met on chain
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Funding-data or ingestion source failure
    #[error("Provider error: {0}")]
    Provider(String),

    /// Conflicting request against an already-held resource
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Claim deadline elapsed before the submission arrived
    #[error("Claim expired: {0}")]
    ClaimExpired(String),

    /// Entity lookup failure
    #[error("Not found: {0}")]
    NotFound(String),

    /// State machine transition errors
    #[error("Invalid state transition: {from_state} -> {to_state}: {reason}")]
    StateTransition {
        from_state: String,
        to_state: String,
        reason: String,
    },

    /// Missing or wrong API key for a privileged operation
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence backend errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Script construction or evaluation errors
    #[error("Script error: {0}")]
    Script(String),

    /// PSBT construction errors
    #[error("PSBT error: {0}")]
    Psbt(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a preimage mismatch error
    pub fn preimage_mismatch<S: Into<String>>(expected: S, actual: S) -> Self {
        Self::PreimageMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a provisional proof error
    pub fn proof_provisional<S: Into<String>>(msg: S) -> Self {
        Self::ProofProvisional(msg.into())
    }

    /// Create an invalid proof error
    pub fn proof_invalid<S: Into<String>>(msg: S) -> Self {
        Self::ProofInvalid(msg.into())
    }

    /// Create a not-ready error
    pub fn not_ready<S: Into<String>>(msg: S) -> Self {
        Self::NotReady(msg.into())
    }

    /// Create a provider error
    pub fn provider<S: Into<String>>(msg: S) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a claim expired error
    pub fn claim_expired<S: Into<String>>(msg: S) -> Self {
        Self::ClaimExpired(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(from_state: S, to_state: S, reason: S) -> Self {
        Self::StateTransition {
            from_state: from_state.into(),
            to_state: to_state.into(),
            reason: reason.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a script error
    pub fn script<S: Into<String>>(msg: S) -> Self {
        Self::Script(msg.into())
    }

    /// Create a PSBT error
    pub fn psbt<S: Into<String>>(msg: S) -> Self {
        Self::Psbt(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable code returned to callers
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::PreimageMismatch { .. } => "preimage_mismatch",
            Self::ProofProvisional(_) => "proof_provisional",
            Self::ProofInvalid(_) => "proof_invalid",
            Self::NotReady(_) => "not_ready",
            Self::Provider(_) => "provider_error",
            Self::Conflict(_) => "conflict",
            Self::ClaimExpired(_) => "claim_expired",
            Self::NotFound(_) => "not_found",
            Self::StateTransition { .. } => "invalid_state_transition",
            Self::Unauthorized(_) => "unauthorized",
            Self::Config(_) => "config_error",
            Self::Storage(_) => "storage_error",
            Self::Script(_) => "script_error",
            Self::Psbt(_) => "psbt_error",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the caller should retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProofProvisional(_) | Self::NotReady(_) | Self::Provider(_)
        )
    }
}

impl From<sqlx::Error> for EscrowError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for EscrowError {
    fn from(err: reqwest::Error) -> Self {
        Self::Provider(err.to_string())
    }
}

impl From<::config::ConfigError> for EscrowError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<hex::FromHexError> for EscrowError {
    fn from(err: hex::FromHexError) -> Self {
        Self::Validation(format!("invalid hex: {}", err))
    }
}
