use std::path::PathBuf;

use alloy::{
    primitives::Address,
    signers::local::LocalSignerError,
    transports::{RpcError, TransportErrorKind},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no usable rpc endpoints remain")]
    NoEndpoints,

    #[error("failed to start any seeders")]
    NoSeeders,

    #[error("no account available")]
    NoAccounts,

    #[error("no receivers available")]
    NoReceivers,

    #[error(transparent)]
    Keystore(#[from] KeystoreError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("keystore io error")]
    Io(#[from] std::io::Error),

    #[error("malformed keystore file {0}")]
    Malformed(PathBuf),

    #[error("unknown account {0}")]
    UnknownAccount(Address),

    #[error("account {0} is locked")]
    Locked(Address),

    #[error("signer error")]
    Signer(#[from] LocalSignerError),

    #[error("failed to sign: {0}")]
    Sign(String),
}

/// Error returned by an RPC endpoint. The remote message is preserved
/// verbatim so failed submissions can be classified.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ClientError {
    pub message: String,
}

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> TxErrorKind {
        TxErrorKind::classify(&self.message)
    }
}

impl From<RpcError<TransportErrorKind>> for ClientError {
    fn from(err: RpcError<TransportErrorKind>) -> Self {
        let message = match &err {
            RpcError::ErrorResp(payload) => payload.message.to_string(),
            _ => err.to_string(),
        };
        Self { message }
    }
}

/// How a transaction submission failed, matched against the node's error
/// strings. Matching is case-sensitive; "known transaction" is a prefix
/// because the node appends the tx hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxErrorKind {
    NonceTooLow,
    KnownOrUnderpriced,
    LowFunds,
    PoolFull,
    Other,
}

impl TxErrorKind {
    pub fn classify(msg: &str) -> Self {
        if msg == "nonce too low" {
            TxErrorKind::NonceTooLow
        } else if msg == "replacement transaction underpriced"
            || msg.starts_with("known transaction")
        {
            TxErrorKind::KnownOrUnderpriced
        } else if msg == "insufficient funds for gas * price + value" {
            TxErrorKind::LowFunds
        } else if msg == "transaction pool limit reached" {
            TxErrorKind::PoolFull
        } else {
            TxErrorKind::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TxErrorKind;

    #[test]
    fn classifies_node_errors() {
        for (msg, kind) in [
            ("nonce too low", TxErrorKind::NonceTooLow),
            (
                "replacement transaction underpriced",
                TxErrorKind::KnownOrUnderpriced,
            ),
            (
                "known transaction: 0xdeadbeef",
                TxErrorKind::KnownOrUnderpriced,
            ),
            (
                "insufficient funds for gas * price + value",
                TxErrorKind::LowFunds,
            ),
            ("transaction pool limit reached", TxErrorKind::PoolFull),
            ("connection refused", TxErrorKind::Other),
            // Case and whitespace must match the node exactly.
            ("Nonce too low", TxErrorKind::Other),
            ("nonce too low ", TxErrorKind::Other),
        ] {
            assert_eq!(TxErrorKind::classify(msg), kind, "message: {msg:?}");
        }
    }
}
