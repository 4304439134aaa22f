//! All wire-protocol related errors.

use bitcoin::secp256k1;

/// Represents errors raised while encoding, decoding or authenticating
/// packets and while inspecting contract scripts.
///
/// A protocol error always means the offending packet is dropped and counted
/// against the sender; it never cancels an order.
#[derive(Debug)]
pub enum ProtocolError {
    /// Frame carries a protocol version other than ours.
    WrongVersion {
        /// The version this build speaks.
        expected: u32,
        /// The version found in the frame.
        received: u32,
    },
    /// Packet body size does not satisfy the command's declared bounds.
    WrongSize {
        /// Minimum (or exact) size the command requires.
        need: usize,
        /// Size actually received.
        received: usize,
    },
    /// A body field read ran past the end of the packet.
    Truncated,
    /// Command code not part of the protocol.
    UnknownCommand(u32),
    /// Currency code is not valid zero-padded ASCII.
    BadCurrency,
    /// A NUL-terminated string field is unterminated or not UTF-8.
    BadString,
    /// Packet signature does not verify against the expected key.
    BadSignature,
    /// A contract script does not have the expected shape.
    BadContract(&'static str),
    /// Cryptographic error from secp256k1.
    Secp(secp256k1::Error),
}

impl From<secp256k1::Error> for ProtocolError {
    fn from(value: secp256k1::Error) -> Self {
        Self::Secp(value)
    }
}
