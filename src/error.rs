//! High-level errors aggregated at the application boundary.

use crate::{protocol::error::ProtocolError, session::error::SessionError, wallet::WalletError};

/// Everything a node binary has to handle at its top level.
#[derive(Debug)]
pub enum AppError {
    /// Standard IO errors during file operations.
    IO(std::io::Error),
    /// Wire-protocol violations.
    Protocol(ProtocolError),
    /// Session packet-handling failures.
    Session(SessionError),
    /// Wallet connector failures.
    Wallet(WalletError),
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<ProtocolError> for AppError {
    fn from(value: ProtocolError) -> Self {
        Self::Protocol(value)
    }
}

impl From<SessionError> for AppError {
    fn from(value: SessionError) -> Self {
        Self::Session(value)
    }
}

impl From<WalletError> for AppError {
    fn from(value: WalletError) -> Self {
        Self::Wallet(value)
    }
}
