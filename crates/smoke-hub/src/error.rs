//! Caller-facing error codes and the JSON envelopes they travel in.
//!
//! Codes are stable: clients switch on them to tell failure causes apart.

use serde::Serialize;
use thiserror::Error;

use crate::{
    allocator::AllocatorError,
    channel::ChannelError,
    codec::CodecError,
};

/// Stable numeric error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    InternalServerError = 600,
    ConnectAddressAllocationError = 700,
    ConnectChannelInitializeError = 701,
    ConnectIdentitySerializeError = 702,
    ConnectEncryptionError = 703,
    ForwardHttpStreamError = 800,
    ForwardDeserializeError = 801,
    ForwardDecryptionError = 802,
    ForwardDeserializeIdentityError = 803,
    ForwardIdentityVerificationError = 804,
    ForwardSerializeError = 805,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::InternalServerError => "internal server error.",
            ErrorCode::ConnectAddressAllocationError => "unable to allocate address.",
            ErrorCode::ConnectChannelInitializeError => "unable to initialize data channel.",
            ErrorCode::ConnectIdentitySerializeError => "unable to serialize identity.",
            ErrorCode::ConnectEncryptionError => "unable to encrypt identity.",
            ErrorCode::ForwardHttpStreamError => "unable to read from http input stream.",
            ErrorCode::ForwardDeserializeError => "unable to deserialize user request.",
            ErrorCode::ForwardDecryptionError => "unable to decrypt user identity",
            ErrorCode::ForwardDeserializeIdentityError => "unable to deserialize identity",
            ErrorCode::ForwardIdentityVerificationError => "unable to verify user identity.",
            ErrorCode::ForwardSerializeError => "unable to serialize forwarded message.",
        }
    }
}

/// Every way a connect or forward request can fail.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("address allocation failed: {0}")]
    AddressAllocation(#[source] AllocatorError),

    #[error("channel initialization failed: {0}")]
    ChannelInitialize(#[source] ChannelError),

    #[error("identity serialization failed: {0}")]
    IdentitySerialize(#[source] serde_json::Error),

    #[error("identity encryption failed: {0}")]
    Encryption(#[source] CodecError),

    #[error("failed to read request body: {0}")]
    HttpStream(String),

    #[error("malformed forward request: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("identity decryption failed: {0}")]
    Decryption(#[source] CodecError),

    #[error("malformed identity: {0}")]
    DeserializeIdentity(#[source] serde_json::Error),

    #[error("identity issued to {issued_to} presented from {presented_from}")]
    IdentityVerification {
        issued_to: String,
        presented_from: String,
    },

    #[error("forwarded message serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::RateLimited { .. } => ErrorCode::InternalServerError,
            RelayError::AddressAllocation(_) => ErrorCode::ConnectAddressAllocationError,
            RelayError::ChannelInitialize(_) => ErrorCode::ConnectChannelInitializeError,
            RelayError::IdentitySerialize(_) => ErrorCode::ConnectIdentitySerializeError,
            RelayError::Encryption(_) => ErrorCode::ConnectEncryptionError,
            RelayError::HttpStream(_) => ErrorCode::ForwardHttpStreamError,
            RelayError::Deserialize(_) => ErrorCode::ForwardDeserializeError,
            RelayError::Decryption(_) => ErrorCode::ForwardDecryptionError,
            RelayError::DeserializeIdentity(_) => ErrorCode::ForwardDeserializeIdentityError,
            RelayError::IdentityVerification { .. } => ErrorCode::ForwardIdentityVerificationError,
            RelayError::Serialize(_) => ErrorCode::ForwardSerializeError,
        }
    }
}

/// Emitted verbatim when an envelope itself cannot be serialized.
pub const FALLBACK_ERROR_BODY: &str =
    r#"{"error":{"code":600,"message":"internal server error."}}"#;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: &'static str,
}

/// `{"error": {"code": .., "message": ..}}`
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

impl From<ErrorCode> for ErrorEnvelope {
    fn from(code: ErrorCode) -> Self {
        Self {
            error: ErrorBody {
                code: code.code(),
                message: code.message(),
            },
        }
    }
}

/// `{"data": ..}`
#[derive(Debug, Serialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}
