//! The signed fixed-layout packet codec.
//!
//! Every protocol message travels in one frame:
//!
//! ```text
//! version(4) | command(4) | size(4) | timestamp(4) | pubkey(33) | signature(64) | body(size)
//! ```
//!
//! All integers are little-endian. The signature is a compact ECDSA signature
//! over the double-SHA256 of the whole frame with the signature field zeroed,
//! so a packet authenticates its header and body at once. Unicast packets
//! carry the destination session id as the first 20 body bytes; a node
//! silently drops unicast frames not addressed to it.

use std::fmt::{self, Display};

use bitcoin::{
    hashes::{sha256d, Hash, HashEngine},
    secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey},
};

use super::error::ProtocolError;
use crate::utill::{now_ts, Currency};

/// Version spoken by this build. Frames with any other version are rejected
/// at decode.
pub const PROTOCOL_VERSION: u32 = 3;

/// Byte length of the fixed frame header.
pub const HEADER_SIZE: usize = 113;
/// Raw chain address length.
pub const ADDRESS_SIZE: usize = 20;
/// Hash and order-id length.
pub const HASH_SIZE: usize = 32;
/// Compressed secp256k1 public key length.
pub const PUBKEY_SIZE: usize = 33;
/// Compact ECDSA signature length.
pub const SIGNATURE_SIZE: usize = 64;
/// Zero-padded currency code length.
pub const CURRENCY_SIZE: usize = 8;

/// Closed set of protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Placeholder dispatched for malformed traffic.
    Invalid,
    /// Maker's order broadcast.
    Transaction,
    /// Facilitator's signed echo of an admitted order.
    PendingTransaction,
    /// Taker's acceptance of a pending order.
    TransactionAccepting,
    /// Facilitator asks both traders to hold the order.
    TransactionHold,
    /// Trader's acknowledgment of a hold.
    TransactionHoldApply,
    /// Facilitator hands each trader its side of the trade.
    TransactionInit,
    /// Trader finished initializing (role B: fee published).
    TransactionInitialized,
    /// Facilitator asks the Maker to create its deposit.
    TransactionCreateA,
    /// Maker's deposit created and broadcast.
    TransactionCreatedA,
    /// Facilitator asks the Taker to create its deposit.
    TransactionCreateB,
    /// Taker's deposit created and broadcast.
    TransactionCreatedB,
    /// Facilitator asks the Maker to redeem the Taker's deposit.
    TransactionConfirmA,
    /// Maker redeemed; carries the revealing pay txid.
    TransactionConfirmedA,
    /// Facilitator hands the Maker's pay txid to the Taker.
    TransactionConfirmB,
    /// Taker redeemed.
    TransactionConfirmedB,
    /// Signed cancellation with a reason code.
    TransactionCancel,
    /// Trade complete, broadcast by the facilitator.
    TransactionFinished,
    /// Reserved peer chat relay.
    XChatMessage,
    /// Reserved service announcement ping.
    ServicesPing,
}

impl Command {
    /// Wire code of the command.
    pub fn to_u32(self) -> u32 {
        match self {
            Command::Invalid => 0,
            Command::Transaction => 1,
            Command::PendingTransaction => 2,
            Command::TransactionAccepting => 3,
            Command::TransactionHold => 4,
            Command::TransactionHoldApply => 5,
            Command::TransactionInit => 6,
            Command::TransactionInitialized => 7,
            Command::TransactionCreateA => 8,
            Command::TransactionCreatedA => 9,
            Command::TransactionCreateB => 10,
            Command::TransactionCreatedB => 11,
            Command::TransactionConfirmA => 12,
            Command::TransactionConfirmedA => 13,
            Command::TransactionConfirmB => 14,
            Command::TransactionConfirmedB => 15,
            Command::TransactionCancel => 16,
            Command::TransactionFinished => 17,
            Command::XChatMessage => 18,
            Command::ServicesPing => 19,
        }
    }

    /// Looks up the command for a wire code.
    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            0 => Command::Invalid,
            1 => Command::Transaction,
            2 => Command::PendingTransaction,
            3 => Command::TransactionAccepting,
            4 => Command::TransactionHold,
            5 => Command::TransactionHoldApply,
            6 => Command::TransactionInit,
            7 => Command::TransactionInitialized,
            8 => Command::TransactionCreateA,
            9 => Command::TransactionCreatedA,
            10 => Command::TransactionCreateB,
            11 => Command::TransactionCreatedB,
            12 => Command::TransactionConfirmA,
            13 => Command::TransactionConfirmedA,
            14 => Command::TransactionConfirmB,
            15 => Command::TransactionConfirmedB,
            16 => Command::TransactionCancel,
            17 => Command::TransactionFinished,
            18 => Command::XChatMessage,
            19 => Command::ServicesPing,
            _ => return None,
        })
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One protocol frame.
///
/// Built with the `append_*` methods, then signed. Freshly built packets
/// carry an empty signature until [`Packet::sign`] runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    command: Command,
    timestamp: u32,
    pubkey: [u8; PUBKEY_SIZE],
    signature: [u8; SIGNATURE_SIZE],
    body: Vec<u8>,
}

impl Packet {
    /// Starts an empty packet for `command`, stamped with the current time.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            timestamp: now_ts() as u32,
            pubkey: [0u8; PUBKEY_SIZE],
            signature: [0u8; SIGNATURE_SIZE],
            body: Vec::new(),
        }
    }

    /// The packet's command.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Body length in bytes.
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /// The packet body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The signer's public key as claimed in the header.
    pub fn pubkey(&self) -> &[u8; PUBKEY_SIZE] {
        &self.pubkey
    }

    /// Header timestamp (UTC seconds, truncated to 32 bits).
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Appends raw bytes to the body.
    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    /// Appends a 20-byte chain address.
    pub fn append_address(&mut self, addr: &[u8; ADDRESS_SIZE]) {
        self.body.extend_from_slice(addr);
    }

    /// Appends a 32-byte hash.
    pub fn append_hash(&mut self, hash: &[u8; HASH_SIZE]) {
        self.body.extend_from_slice(hash);
    }

    /// Appends a little-endian u32.
    pub fn append_u32(&mut self, value: u32) {
        self.body.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a little-endian u64.
    pub fn append_u64(&mut self, value: u64) {
        self.body.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends an eight-byte currency code.
    pub fn append_currency(&mut self, currency: Currency) {
        self.body.extend_from_slice(&currency.to_wire());
    }

    /// Appends a compressed public key.
    pub fn append_pubkey(&mut self, pubkey: &[u8; PUBKEY_SIZE]) {
        self.body.extend_from_slice(pubkey);
    }

    /// Appends a NUL-terminated string.
    pub fn append_cstr(&mut self, value: &str) {
        self.body.extend_from_slice(value.as_bytes());
        self.body.push(0);
    }

    /// Serializes the full frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.body.len());
        out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        out.extend_from_slice(&self.command.to_u32().to_le_bytes());
        out.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.pubkey);
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.body);
        out
    }

    /// Parses a frame, rejecting version and size mismatches.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::WrongSize {
                need: HEADER_SIZE,
                received: bytes.len(),
            });
        }

        let version = u32::from_le_bytes(bytes[0..4].try_into().expect("4 bytes"));
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::WrongVersion {
                expected: PROTOCOL_VERSION,
                received: version,
            });
        }

        let code = u32::from_le_bytes(bytes[4..8].try_into().expect("4 bytes"));
        let command = Command::from_u32(code).ok_or(ProtocolError::UnknownCommand(code))?;

        let size = u32::from_le_bytes(bytes[8..12].try_into().expect("4 bytes")) as usize;
        if bytes.len() != HEADER_SIZE + size {
            return Err(ProtocolError::WrongSize {
                need: HEADER_SIZE + size,
                received: bytes.len(),
            });
        }

        let timestamp = u32::from_le_bytes(bytes[12..16].try_into().expect("4 bytes"));
        let pubkey: [u8; PUBKEY_SIZE] = bytes[16..49].try_into().expect("33 bytes");
        let signature: [u8; SIGNATURE_SIZE] = bytes[49..113].try_into().expect("64 bytes");

        Ok(Self {
            command,
            timestamp,
            pubkey,
            signature,
            body: bytes[HEADER_SIZE..].to_vec(),
        })
    }

    /// Double-SHA256 of the frame with the signature field zeroed.
    fn sighash(&self) -> [u8; 32] {
        let mut engine = sha256d::Hash::engine();
        engine.input(&PROTOCOL_VERSION.to_le_bytes());
        engine.input(&self.command.to_u32().to_le_bytes());
        engine.input(&(self.body.len() as u32).to_le_bytes());
        engine.input(&self.timestamp.to_le_bytes());
        engine.input(&self.pubkey);
        engine.input(&[0u8; SIGNATURE_SIZE]);
        engine.input(&self.body);
        sha256d::Hash::from_engine(engine).to_byte_array()
    }

    /// Signs the packet, setting the header pubkey to the signer's key.
    pub fn sign(&mut self, secret: &SecretKey) {
        let secp = Secp256k1::new();
        self.pubkey = PublicKey::from_secret_key(&secp, secret).serialize();
        let message = Message::from_digest(self.sighash());
        self.signature = secp.sign_ecdsa(&message, secret).serialize_compact();
    }

    /// True iff the signature verifies against `pubkey`.
    pub fn verify(&self, pubkey: &[u8; PUBKEY_SIZE]) -> bool {
        let secp = Secp256k1::new();
        let Ok(key) = PublicKey::from_slice(pubkey) else {
            return false;
        };
        let Ok(signature) = Signature::from_compact(&self.signature) else {
            return false;
        };
        let message = Message::from_digest(self.sighash());
        secp.verify_ecdsa(&message, &signature, &key).is_ok()
    }

    /// True iff the first 20 body bytes equal `session_id`.
    ///
    /// Unicast packets carry their destination there; everything else is not
    /// for this session.
    pub fn addressed_to(&self, session_id: &[u8; ADDRESS_SIZE]) -> bool {
        self.body.len() >= ADDRESS_SIZE && self.body[..ADDRESS_SIZE] == session_id[..]
    }
}

/// Sequential reader over a packet body.
pub struct PacketReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> PacketReader<'a> {
    /// Starts reading `packet`'s body from the beginning.
    pub fn new(packet: &'a Packet) -> Self {
        Self {
            data: packet.body(),
            offset: 0,
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.offset + len > self.data.len() {
            return Err(ProtocolError::Truncated);
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Reads a 20-byte chain address.
    pub fn read_address(&mut self) -> Result<[u8; ADDRESS_SIZE], ProtocolError> {
        Ok(self.take(ADDRESS_SIZE)?.try_into().expect("20 bytes"))
    }

    /// Reads a 32-byte hash.
    pub fn read_hash(&mut self) -> Result<[u8; HASH_SIZE], ProtocolError> {
        Ok(self.take(HASH_SIZE)?.try_into().expect("32 bytes"))
    }

    /// Reads a compressed public key.
    pub fn read_pubkey(&mut self) -> Result<[u8; PUBKEY_SIZE], ProtocolError> {
        Ok(self.take(PUBKEY_SIZE)?.try_into().expect("33 bytes"))
    }

    /// Reads a little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    /// Reads a little-endian u64.
    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    /// Reads an eight-byte currency code.
    pub fn read_currency(&mut self) -> Result<Currency, ProtocolError> {
        let bytes: [u8; CURRENCY_SIZE] = self.take(CURRENCY_SIZE)?.try_into().expect("8 bytes");
        Currency::from_wire(bytes).ok_or(ProtocolError::BadCurrency)
    }

    /// Reads `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        self.take(len)
    }

    /// Reads a NUL-terminated UTF-8 string, consuming the terminator.
    pub fn read_cstr(&mut self) -> Result<&'a str, ProtocolError> {
        let rest = &self.data[self.offset..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(ProtocolError::BadString)?;
        let value = std::str::from_utf8(&rest[..nul]).map_err(|_| ProtocolError::BadString)?;
        self.offset += nul + 1;
        Ok(value)
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::key::rand::thread_rng;

    fn keypair() -> (SecretKey, PublicKey) {
        Secp256k1::new().generate_keypair(&mut thread_rng())
    }

    fn sample_packet() -> Packet {
        let mut packet = Packet::new(Command::TransactionHold);
        packet.append_address(&[7u8; 20]);
        packet.append_hash(&[9u8; 32]);
        packet
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut packet = Packet::new(Command::Transaction);
        packet.append_hash(&[1u8; 32]);
        packet.append_address(&[2u8; 20]);
        packet.append_currency(Currency::new("XLT").unwrap());
        packet.append_u64(42 * crate::utill::COIN);
        packet.append_u32(7);
        packet.append_cstr("deadbeef");

        let (sk, _) = keypair();
        packet.sign(&sk);

        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);

        let mut reader = PacketReader::new(&decoded);
        assert_eq!(reader.read_hash().unwrap(), [1u8; 32]);
        assert_eq!(reader.read_address().unwrap(), [2u8; 20]);
        assert_eq!(reader.read_currency().unwrap().as_str(), "XLT");
        assert_eq!(reader.read_u64().unwrap(), 42 * crate::utill::COIN);
        assert_eq!(reader.read_u32().unwrap(), 7);
        assert_eq!(reader.read_cstr().unwrap(), "deadbeef");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn decode_rejects_wrong_version() {
        let mut bytes = sample_packet().encode();
        bytes[0] = PROTOCOL_VERSION as u8 + 1;
        assert!(matches!(
            Packet::decode(&bytes),
            Err(ProtocolError::WrongVersion { .. })
        ));
    }

    #[test]
    fn decode_rejects_size_mismatch() {
        let mut bytes = sample_packet().encode();
        bytes.pop();
        assert!(matches!(
            Packet::decode(&bytes),
            Err(ProtocolError::WrongSize { .. })
        ));

        let mut bytes = sample_packet().encode();
        bytes.push(0);
        assert!(matches!(
            Packet::decode(&bytes),
            Err(ProtocolError::WrongSize { .. })
        ));
    }

    #[test]
    fn decode_rejects_truncated_header() {
        assert!(matches!(
            Packet::decode(&[0u8; HEADER_SIZE - 1]),
            Err(ProtocolError::WrongSize { .. })
        ));
    }

    #[test]
    fn decode_rejects_unknown_command() {
        let mut bytes = sample_packet().encode();
        bytes[4..8].copy_from_slice(&999u32.to_le_bytes());
        assert!(matches!(
            Packet::decode(&bytes),
            Err(ProtocolError::UnknownCommand(999))
        ));
    }

    #[test]
    fn sign_and_verify() {
        let (sk, pk) = keypair();
        let mut packet = sample_packet();
        packet.sign(&sk);

        assert!(packet.verify(&pk.serialize()));
        assert_eq!(packet.pubkey(), &pk.serialize());

        let (_, other) = keypair();
        assert!(!packet.verify(&other.serialize()));
    }

    #[test]
    fn tampered_body_fails_verification() {
        let (sk, pk) = keypair();
        let mut packet = sample_packet();
        packet.sign(&sk);

        let mut bytes = packet.encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = Packet::decode(&bytes).unwrap();
        assert!(!tampered.verify(&pk.serialize()));
    }

    #[test]
    fn unsigned_packet_does_not_verify() {
        let (_, pk) = keypair();
        assert!(!sample_packet().verify(&pk.serialize()));
    }

    #[test]
    fn addressed_to_matches_prefix() {
        let packet = sample_packet();
        assert!(packet.addressed_to(&[7u8; 20]));
        assert!(!packet.addressed_to(&[8u8; 20]));

        let empty = Packet::new(Command::TransactionFinished);
        assert!(!empty.addressed_to(&[0u8; 20]));
    }

    #[test]
    fn command_codes_round_trip() {
        for code in 0..20 {
            let command = Command::from_u32(code).unwrap();
            assert_eq!(command.to_u32(), code);
        }
        assert!(Command::from_u32(20).is_none());
    }
}
