//! Deposit contract construction and inspection.
//!
//! The deposit output is a P2SH whose redeem script has two spend paths:
//! the depositor itself after the lock-time expires (refund path), or the
//! counterparty with the 32-byte secret preimage (redeem path). Spending
//! through the redeem path reveals the preimage on-chain, which is what
//! lets the other trader complete its own redemption.

use bitcoin::{
    hashes::{hash160, Hash},
    opcodes::all::{
        OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_CLTV, OP_DROP, OP_DUP, OP_ELSE, OP_ENDIF, OP_EQUAL,
        OP_EQUALVERIFY, OP_HASH160, OP_IF,
    },
    script::{Builder, Instruction},
    secp256k1::PublicKey,
    ScriptBuf,
};

use super::error::ProtocolError;

/// RIPEMD160(SHA256) of a secret preimage; committed in the deposit script.
pub fn hashed_secret(secret: &[u8; 32]) -> [u8; 20] {
    hash160::Hash::hash(secret).to_byte_array()
}

/// Key id (hash160 of the compressed serialization) of a public key.
pub fn pubkey_id(pubkey: &PublicKey) -> [u8; 20] {
    hash160::Hash::hash(&pubkey.serialize()).to_byte_array()
}

/// Script id of a redeem script; the payload of the P2SH address the
/// counterparty must verify on-chain.
pub fn script_id(script: &ScriptBuf) -> [u8; 20] {
    hash160::Hash::hash(script.as_bytes()).to_byte_array()
}

/// Builds the deposit redeem script.
///
/// ```text
/// OP_IF
///   <lock_time> OP_CLTV OP_DROP
///   OP_DUP OP_HASH160 <h160(self_pub)> OP_EQUALVERIFY OP_CHECKSIG
/// OP_ELSE
///   OP_DUP OP_HASH160 <h160(other_pub)> OP_EQUALVERIFY OP_CHECKSIGVERIFY
///   OP_HASH160 <hashed_secret> OP_EQUAL
/// OP_ENDIF
/// ```
///
/// The refund branch needs `<sig> <self_pub> 1`; the redeem branch needs
/// `<secret> <sig> <other_pub> 0`.
pub fn create_deposit_unlock_script(
    self_pub: &PublicKey,
    other_pub: &PublicKey,
    hashed_secret: &[u8; 20],
    lock_time: u32,
) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_IF)
        .push_int(lock_time as i64)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(pubkey_id(self_pub))
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ELSE)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(pubkey_id(other_pub))
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_opcode(OP_HASH160)
        .push_slice(*hashed_secret)
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_ENDIF)
        .into_script()
}

/// Reads the lock-time committed in a deposit redeem script.
pub fn read_lock_time(script: &ScriptBuf) -> Result<u32, ProtocolError> {
    let mut instructions = script.instructions();

    match instructions.next() {
        Some(Ok(Instruction::Op(op))) if op == OP_IF => {}
        _ => return Err(ProtocolError::BadContract("missing OP_IF prologue")),
    }

    match instructions.next() {
        Some(Ok(Instruction::PushBytes(bytes))) => {
            let value = decode_script_num(bytes.as_bytes())
                .ok_or(ProtocolError::BadContract("unreadable lock time"))?;
            u32::try_from(value).map_err(|_| ProtocolError::BadContract("lock time out of range"))
        }
        _ => Err(ProtocolError::BadContract("missing lock time push")),
    }
}

/// Reads the hashed secret committed in a deposit redeem script.
///
/// The script pushes three 20-byte items; the hashed secret is the last one.
pub fn read_hashed_secret(script: &ScriptBuf) -> Result<[u8; 20], ProtocolError> {
    let mut pushes = Vec::new();
    for instruction in script.instructions() {
        match instruction {
            Ok(Instruction::PushBytes(bytes)) if bytes.len() == 20 => {
                pushes.push(bytes.as_bytes().try_into().expect("20 bytes"));
            }
            Ok(_) => {}
            Err(_) => return Err(ProtocolError::BadContract("malformed script")),
        }
    }
    if pushes.len() != 3 {
        return Err(ProtocolError::BadContract("wrong number of hash pushes"));
    }
    Ok(pushes[2])
}

// Minimal little-endian script number with a sign bit in the top byte.
fn decode_script_num(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() || bytes.len() > 5 {
        return None;
    }
    let mut value: i64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        let byte = if i == bytes.len() - 1 {
            byte & 0x7f
        } else {
            *byte
        };
        value |= (byte as i64) << (8 * i);
    }
    if bytes[bytes.len() - 1] & 0x80 != 0 {
        value = -value;
    }
    Some(value)
}
