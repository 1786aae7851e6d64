//! Error types for the swap broker.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the swap broker.
#[derive(Error, Debug)]
pub enum Error {
    /// Customer public key failed validation.
    #[error("invalid pubkey")]
    InvalidPubkey,

    /// Payment hash is not 32 hex-encoded bytes.
    #[error("invalid payment hash")]
    InvalidPaymentHash,

    /// Preimage does not hash to the swap's payment hash.
    #[error("invalid preimage")]
    InvalidPreimage,

    /// Witness-script operand has the wrong length.
    #[error("invalid script operand: {0}")]
    InvalidOperand(String),

    /// Amount does not clear the dust limit.
    #[error("amount must not be less than the dust limit")]
    BelowDust,

    /// Amount is below the configured minimum.
    #[error("amount is less than the minimum")]
    BelowMinimum,

    /// Amount is above the configured maximum.
    #[error("amount is greater than the maximum")]
    AboveMaximum,

    /// The broker cannot cover the on-chain leg right now.
    #[error("not enough liquidity at the moment")]
    InsufficientLiquidity,

    /// The node returned no usable feerate.
    #[error("unable to estimate fee")]
    FeeEstimationUnavailable,

    /// The hold invoice could not be created.
    #[error("could not create invoice: {0}")]
    InvoiceCreation(String),

    /// Swap not found in either store tier.
    #[error("swap not found: {0}")]
    SwapNotFound(String),

    /// Bitcoin node RPC failure.
    #[error("chain node error: {0}")]
    ChainRpc(String),

    /// Lightning node RPC failure.
    #[error("lightning node error: {0}")]
    LightningRpc(String),

    /// Swap store operation failed.
    #[error("store error: {0}")]
    Store(String),

    /// Parse error.
    #[error("parse error: {0}")]
    Parse(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error is a client-side validation failure.
    ///
    /// Validation failures map to HTTP 400; everything else is a 500.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidPubkey
                | Error::InvalidPaymentHash
                | Error::InvalidOperand(_)
                | Error::BelowDust
                | Error::BelowMinimum
                | Error::AboveMaximum
        )
    }
}
