//! All session related errors.

use crate::{
    protocol::{error::ProtocolError, packet::Command},
    utill::Currency,
    wallet::WalletError,
};

/// Represents errors during packet handling.
///
/// A returned error marks the packet as bad for peer scoring. Conditions
/// the protocol absorbs (unknown orders, stale states, failed signature
/// pinning) are not errors; handlers log and drop those.
#[derive(Debug)]
pub enum SessionError {
    /// Malformed or unauthenticated packet.
    Protocol(ProtocolError),
    /// Wallet connector failure that could not be absorbed.
    Wallet(WalletError),
    /// No handler bound for this command in the session's role.
    NoHandler(Command),
    /// No connector registered for a currency named by the packet.
    NoConnector(Currency),
    /// Static description of a general failure condition.
    General(&'static str),
}

impl From<ProtocolError> for SessionError {
    fn from(value: ProtocolError) -> Self {
        Self::Protocol(value)
    }
}

impl From<WalletError> for SessionError {
    fn from(value: WalletError) -> Self {
        Self::Wallet(value)
    }
}
