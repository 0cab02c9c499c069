use serde::Serialize;
use thiserror::Error;

/// A structured error suitable for returning to the host runtime as `error.data`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolError {
    pub code: &'static str,
    pub message: String,
}

impl ToolError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Every failure a call can end with. All of them are terminal for the call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("ERC-721 import requires a tokenId")]
    MissingTokenId,

    #[error("token not found: {0}")]
    TokenNotFound(String),

    #[error("no AES key for this account")]
    KeyUnavailable,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("balance decryption failed")]
    DecryptionFailed,

    #[error("no active account")]
    NoActiveAccount,

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("account busy")]
    AccountBusy,
}

impl VaultError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidAddress(_) => "invalid_address",
            Self::MissingTokenId => "missing_token_id",
            Self::TokenNotFound(_) => "token_not_found",
            Self::KeyUnavailable => "key_unavailable",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::DecryptionFailed => "decryption_failed",
            Self::NoActiveAccount => "no_active_account",
            Self::UnsupportedMethod(_) => "unsupported_method",
            Self::AccountBusy => "account_busy",
        }
    }

    /// JSON-RPC error code used on the wire.
    pub const fn rpc_code(&self) -> i64 {
        match self {
            Self::UnsupportedMethod(_) => -32601,
            Self::InvalidRequest(_) => -32602,
            Self::InvalidAddress(_)
            | Self::MissingTokenId
            | Self::TokenNotFound(_)
            | Self::KeyUnavailable
            | Self::StorageUnavailable(_)
            | Self::DecryptionFailed
            | Self::NoActiveAccount
            | Self::AccountBusy => -32000,
        }
    }

    pub fn storage(e: impl std::fmt::Display) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}

impl From<VaultError> for ToolError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::AccountBusy => Self::new(
                e.code(),
                "another call for this account is in flight; retry once it completes",
            ),
            VaultError::KeyUnavailable => Self::new(
                e.code(),
                "no AES key for this account; create one with getOrCreateKey",
            ),
            VaultError::InvalidRequest(_)
            | VaultError::InvalidAddress(_)
            | VaultError::MissingTokenId
            | VaultError::TokenNotFound(_)
            | VaultError::StorageUnavailable(_)
            | VaultError::DecryptionFailed
            | VaultError::NoActiveAccount
            | VaultError::UnsupportedMethod(_) => Self::new(e.code(), e.to_string()),
        }
    }
}

/// Find the taxonomy error carried by a report, if any.
pub fn classify(e: &eyre::Report) -> Option<&VaultError> {
    e.chain().find_map(|cause| cause.downcast_ref::<VaultError>())
}
