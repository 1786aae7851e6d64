//! HTLC witness-script construction and P2WSH address derivation.
//!
//! The swap contract pays the customer on preimage reveal and refunds the
//! broker key holder after the locktime:
//!
//! ```text
//! OP_HASH160 <RIPEMD160(image)> OP_EQUAL
//! OP_IF
//!     <broker_pubkey>
//! OP_ELSE
//!     <locktime> OP_CHECKLOCKTIMEVERIFY OP_DROP
//!     <customer_pubkey>
//! OP_ENDIF
//! OP_CHECKSIG
//! ```
//!
//! `image` is the invoice payment hash (the SHA-256 of the preimage), so the
//! embedded constant equals `HASH160(preimage)` and a single `OP_HASH160` on
//! the revealed preimage satisfies the claim branch.

use crate::error::{Error, Result};
use crate::types::Network;
use bitcoin::hashes::{Hash, ripemd160};
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CLTV, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUAL, OP_HASH160, OP_IF,
};
use bitcoin::script::{Builder, Instruction};
use bitcoin::{Address, Script, ScriptBuf};

/// Outputs below this are non-standard.
pub const DUST_LIMIT: u64 = 565;

/// Operands recovered from a witness script.
///
/// The image itself is not recoverable (the script commits to its
/// RIPEMD-160); `image_hash` is what the script embeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcParts {
    pub image_hash: [u8; 20],
    pub broker: [u8; 33],
    pub customer: [u8; 33],
    pub locktime: u32,
}

/// Build the HTLC witness script.
///
/// `image` is the 32-byte payment hash, `broker` and `customer` are
/// compressed public keys, `locktime` an absolute block height serialised
/// as a minimal CScriptNum.
pub fn build_witness_script(
    image: &[u8],
    broker: &[u8],
    customer: &[u8],
    locktime: u32,
) -> Result<ScriptBuf> {
    let image: [u8; 32] = image
        .try_into()
        .map_err(|_| Error::InvalidOperand(format!("image must be 32 bytes, got {}", image.len())))?;
    let broker: [u8; 33] = broker.try_into().map_err(|_| {
        Error::InvalidOperand(format!("broker pubkey must be 33 bytes, got {}", broker.len()))
    })?;
    let customer: [u8; 33] = customer.try_into().map_err(|_| {
        Error::InvalidOperand(format!(
            "customer pubkey must be 33 bytes, got {}",
            customer.len()
        ))
    })?;

    let image_hash = ripemd160::Hash::hash(&image);

    let script = Builder::new()
        .push_opcode(OP_HASH160)
        .push_slice(image_hash.to_byte_array())
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_slice(broker)
        .push_opcode(OP_ELSE)
        .push_int(i64::from(locktime))
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_slice(customer)
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_CHECKSIG)
        .into_script();

    Ok(script)
}

/// Derive the P2WSH address committing to `script` on `network`.
pub fn p2wsh_address(script: &Script, network: Network) -> Address {
    Address::p2wsh(script, network.to_bitcoin_network())
}

/// Parse a witness script produced by [`build_witness_script`].
///
/// Rejects anything that does not match the exact opcode layout.
pub fn parse_witness_script(script: &Script) -> Result<HtlcParts> {
    let malformed = |what: &str| Error::Parse(format!("malformed witness script: {}", what));

    let mut instructions = Vec::new();
    for item in script.instructions() {
        instructions.push(item.map_err(|e| Error::Parse(format!("invalid script: {}", e)))?);
    }

    if instructions.len() != 12 {
        return Err(malformed("wrong instruction count"));
    }

    expect_op(&instructions, 0, OP_HASH160)?;
    let image_hash: [u8; 20] = expect_push(&instructions, 1, 20)?
        .try_into()
        .expect("length checked");
    expect_op(&instructions, 2, OP_EQUAL)?;
    expect_op(&instructions, 3, OP_IF)?;
    let broker: [u8; 33] = expect_push(&instructions, 4, 33)?
        .try_into()
        .expect("length checked");
    expect_op(&instructions, 5, OP_ELSE)?;
    let locktime = match &instructions[6] {
        Instruction::PushBytes(push) => decode_scriptnum(push.as_bytes())?,
        Instruction::Op(op) => {
            let code = op.to_u8();
            let pushnum_1 = bitcoin::opcodes::all::OP_PUSHNUM_1.to_u8();
            let pushnum_16 = bitcoin::opcodes::all::OP_PUSHNUM_16.to_u8();
            if (pushnum_1..=pushnum_16).contains(&code) {
                i64::from(code - pushnum_1 + 1)
            } else {
                return Err(malformed("expected locktime push"));
            }
        }
    };
    expect_op(&instructions, 7, OP_CLTV)?;
    expect_op(&instructions, 8, OP_DROP)?;
    let customer: [u8; 33] = expect_push(&instructions, 9, 33)?
        .try_into()
        .expect("length checked");
    expect_op(&instructions, 10, OP_ENDIF)?;
    expect_op(&instructions, 11, OP_CHECKSIG)?;

    let locktime = u32::try_from(locktime).map_err(|_| malformed("locktime out of range"))?;

    Ok(HtlcParts {
        image_hash,
        broker,
        customer,
        locktime,
    })
}

fn expect_op(instructions: &[Instruction<'_>], idx: usize, op: bitcoin::Opcode) -> Result<()> {
    match instructions[idx] {
        Instruction::Op(found) if found == op => Ok(()),
        _ => Err(Error::Parse(format!(
            "malformed witness script: expected {:?} at {}",
            op, idx
        ))),
    }
}

fn expect_push<'a>(instructions: &'a [Instruction<'_>], idx: usize, len: usize) -> Result<&'a [u8]> {
    match &instructions[idx] {
        Instruction::PushBytes(push) if push.len() == len => Ok(push.as_bytes()),
        _ => Err(Error::Parse(format!(
            "malformed witness script: expected {}-byte push at {}",
            len, idx
        ))),
    }
}

/// Decode a minimally-encoded CScriptNum.
fn decode_scriptnum(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 5 {
        return Err(Error::Parse("scriptnum too large".to_string()));
    }
    // Minimal encoding: the top byte may only be a sign extension when the
    // next byte has its high bit set.
    let last = bytes[bytes.len() - 1];
    if last & 0x7f == 0 && (bytes.len() == 1 || bytes[bytes.len() - 2] & 0x80 == 0) {
        return Err(Error::Parse("scriptnum not minimally encoded".to_string()));
    }

    let mut value: i64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        value |= i64::from(byte & if i == bytes.len() - 1 { 0x7f } else { 0xff }) << (8 * i);
    }
    if last & 0x80 != 0 {
        value = -value;
    }
    Ok(value)
}
