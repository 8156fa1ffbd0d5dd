//! Typed error kinds surfaced to HTTP callers and callbacks.
//!
//! Admission errors are returned synchronously to the requester; the display
//! strings double as the wire-visible error messages, so changing them changes
//! the external contract.

use crate::models::Protocol;

#[derive(Debug, thiserror::Error)]
pub enum TssError {
    // admission
    #[error("duplicated messageId")]
    DuplicatedMessageId,
    #[error("{0} operation is running")]
    OperationIsRunning(String),
    #[error("keygen file exists")]
    KeygenFileExist,
    #[error("wrong derivation path")]
    WrongDerivationPath,
    #[error("wrong crypto protocol")]
    WrongCryptoProtocol,
    #[error("crypto protocol not found in request")]
    InvalidCryptoFound,
    #[error("wrong operation")]
    WrongOperation,

    // data absence
    #[error("no eddsa keygen data found")]
    EddsaNoKeygenDataFound,
    #[error("no ecdsa keygen data found")]
    EcdsaNoKeygenDataFound,
    #[error("no eddsa meta data found")]
    EddsaNoMetaDataFound,
    #[error("no ecdsa meta data found")]
    EcdsaNoMetaDataFound,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TssError {
    pub fn no_keygen_data(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Eddsa => TssError::EddsaNoKeygenDataFound,
            Protocol::Ecdsa => TssError::EcdsaNoKeygenDataFound,
        }
    }

    pub fn no_meta_data(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Eddsa => TssError::EddsaNoMetaDataFound,
            Protocol::Ecdsa => TssError::EcdsaNoMetaDataFound,
        }
    }
}
