//! Script Builder/Interpreter - commitment and redeem script templates
//!
//! The escrow output is a P2WSH whose witness script has two branches:
//!
//! ```text
//! OP_IF
//!     OP_SHA256 <commitment_hash> OP_EQUALVERIFY
//!     <payout_digest> OP_DROP
//!     OP_TRUE
//! OP_ELSE
//!     <timeout_blocks> OP_CHECKSEQUENCEVERIFY OP_DROP
//!     <fallback_digest> OP_DROP
//!     <fallback_pubkey> OP_CHECKSIG      (or OP_TRUE without a key)
//! OP_ENDIF
//! ```
//!
//! The payout and fallback digests bind the script to one payout split and
//! one fallback destination, so the derived address changes whenever either
//! changes. Everything here is pure: identical inputs produce byte-identical
//! scripts and addresses.

use std::str::FromStr;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CSV, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUAL, OP_EQUALVERIFY, OP_IF,
    OP_PUSHNUM_1, OP_PUSHNUM_16, OP_SHA256,
};
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::{Address, Script, ScriptBuf};
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1};
use serde::{Deserialize, Serialize};

use crate::{config::Network, error::EscrowError, models::Payout, EscrowResult};

/// Length of a commitment digest
pub const COMMITMENT_HASH_LEN: usize = 32;

/// Parameters keying a commitment/redeem script pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptParams {
    pub commitment_hash: Vec<u8>,
    pub payouts: Vec<Payout>,
    pub fallback_address: String,
    pub timeout_blocks: u16,
    /// Key that must sign the timeout spend; anyone can sweep to the fallback without it
    pub fallback_pubkey: Option<PublicKey>,
}

/// Scripts and addresses derived from [`ScriptParams`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSet {
    pub commitment_script: ScriptBuf,
    pub redeem_script: ScriptBuf,
    pub commitment_address: Address,
    pub payout_scripts: Vec<ScriptBuf>,
    pub payout_amounts: Vec<u64>,
    pub fallback_script: ScriptBuf,
}

impl ScriptSet {
    /// P2WSH output script locking the escrow
    pub fn commitment_script_pubkey(&self) -> ScriptBuf {
        self.commitment_address.script_pubkey()
    }
}

/// Branch of the redeem script satisfied by a witness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Reveal,
    Timeout,
}

/// Witness stack supplied to the interpreter, bottom item first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptWitness {
    pub items: Vec<Vec<u8>>,
}

impl ScriptWitness {
    /// Witness selecting the reveal branch
    pub fn reveal(preimage: &[u8]) -> Self {
        Self {
            items: vec![preimage.to_vec(), vec![1]],
        }
    }

    /// Witness selecting the timeout branch, optionally signed
    pub fn timeout(signature: Option<Vec<u8>>) -> Self {
        let mut items = Vec::new();
        if let Some(sig) = signature {
            items.push(sig);
        }
        items.push(Vec::new());
        Self { items }
    }
}

/// Spend context the interpreter checks against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Blocks since the escrow output confirmed
    pub relative_age: u32,
    /// Digest signed by the fallback key
    pub sighash: Option<[u8; 32]>,
}

/// Interpreter verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub passed: bool,
    pub branch: Option<Branch>,
    pub failure: Option<String>,
}

impl Evaluation {
    fn fail(branch: Option<Branch>, reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            branch,
            failure: Some(reason.into()),
        }
    }
}

/// Builds commitment/redeem scripts for one network
#[derive(Debug, Clone, Copy)]
pub struct ScriptBuilder {
    network: Network,
}

impl ScriptBuilder {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Derive every script and address for an escrow, rejecting bad
    /// parameters before any bytes are produced
    pub fn derive(&self, params: &ScriptParams, budget_sats: u64) -> EscrowResult<ScriptSet> {
        validate_params(params, budget_sats)?;

        let payout_scripts = params
            .payouts
            .iter()
            .map(|p| self.script_pubkey_for(&p.address))
            .collect::<EscrowResult<Vec<_>>>()?;
        let fallback_script = self.script_pubkey_for(&params.fallback_address)?;

        let commitment_script = build_commitment_script(&params.commitment_hash)?;
        let redeem_script = build_redeem_script(
            &params.commitment_hash,
            &payout_digest(&payout_scripts, &params.payouts),
            &sha256::Hash::hash(fallback_script.as_bytes()).to_byte_array(),
            params.timeout_blocks,
            params.fallback_pubkey.as_ref(),
        )?;
        let commitment_address =
            Address::p2wsh(&redeem_script, self.network.to_bitcoin_network());

        Ok(ScriptSet {
            commitment_script,
            redeem_script,
            commitment_address,
            payout_scripts,
            payout_amounts: params.payouts.iter().map(|p| p.amount_sats).collect(),
            fallback_script,
        })
    }

    /// Parse an address and check it belongs to this network
    pub fn script_pubkey_for(&self, address: &str) -> EscrowResult<ScriptBuf> {
        let parsed = Address::from_str(address.trim())
            .map_err(|e| EscrowError::validation(format!("invalid address {}: {}", address, e)))?
            .require_network(self.network.to_bitcoin_network())
            .map_err(|e| {
                EscrowError::validation(format!(
                    "address {} is not a {} address: {}",
                    address,
                    self.network.name(),
                    e
                ))
            })?;
        Ok(parsed.script_pubkey())
    }
}

fn validate_params(params: &ScriptParams, budget_sats: u64) -> EscrowResult<()> {
    if params.commitment_hash.is_empty() {
        return Err(EscrowError::validation("commitment hash cannot be empty"));
    }

    if params.commitment_hash.len() != COMMITMENT_HASH_LEN {
        return Err(EscrowError::validation(format!(
            "commitment hash must be {} bytes, got {}",
            COMMITMENT_HASH_LEN,
            params.commitment_hash.len()
        )));
    }

    if params.payouts.is_empty() {
        return Err(EscrowError::validation("payout set cannot be empty"));
    }

    if params.payouts.iter().any(|p| p.amount_sats == 0) {
        return Err(EscrowError::validation("payout amounts must be greater than 0"));
    }

    let total = params
        .payouts
        .iter()
        .try_fold(0u64, |acc, p| acc.checked_add(p.amount_sats))
        .ok_or_else(|| EscrowError::validation("payout sum overflows"))?;
    if total > budget_sats {
        return Err(EscrowError::validation(format!(
            "payout sum {} sats exceeds budget {}",
            total, budget_sats
        )));
    }

    if params.timeout_blocks == 0 {
        return Err(EscrowError::validation("timeout must be at least one block"));
    }

    if params.fallback_address.trim().is_empty() {
        return Err(EscrowError::validation("fallback address cannot be empty"));
    }

    Ok(())
}

/// `OP_SHA256 <hash> OP_EQUAL`
pub fn build_commitment_script(commitment_hash: &[u8]) -> EscrowResult<ScriptBuf> {
    let builder = push_data(Builder::new().push_opcode(OP_SHA256), commitment_hash)?;
    Ok(builder.push_opcode(OP_EQUAL).into_script())
}

fn build_redeem_script(
    commitment_hash: &[u8],
    payout_digest: &[u8; 32],
    fallback_digest: &[u8; 32],
    timeout_blocks: u16,
    fallback_pubkey: Option<&PublicKey>,
) -> EscrowResult<ScriptBuf> {
    let mut builder = Builder::new().push_opcode(OP_IF).push_opcode(OP_SHA256);
    builder = push_data(builder, commitment_hash)?.push_opcode(OP_EQUALVERIFY);
    builder = push_data(builder, payout_digest)?
        .push_opcode(OP_DROP)
        .push_opcode(OP_PUSHNUM_1)
        .push_opcode(OP_ELSE)
        .push_int(i64::from(timeout_blocks))
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP);
    builder = push_data(builder, fallback_digest)?.push_opcode(OP_DROP);
    builder = match fallback_pubkey {
        Some(pubkey) => push_data(builder, &pubkey.serialize())?.push_opcode(OP_CHECKSIG),
        None => builder.push_opcode(OP_PUSHNUM_1),
    };
    Ok(builder.push_opcode(OP_ENDIF).into_script())
}

/// Digest binding the ordered payout split
fn payout_digest(scripts: &[ScriptBuf], payouts: &[Payout]) -> [u8; 32] {
    let mut data = Vec::new();
    for (script, payout) in scripts.iter().zip(payouts) {
        data.extend_from_slice(script.as_bytes());
        data.extend_from_slice(&payout.amount_sats.to_le_bytes());
    }
    sha256::Hash::hash(&data).to_byte_array()
}

fn push_data(builder: Builder, data: &[u8]) -> EscrowResult<Builder> {
    let bytes = PushBytesBuf::try_from(data.to_vec())
        .map_err(|e| EscrowError::script(format!("push too large: {}", e)))?;
    Ok(builder.push_slice(bytes))
}

/// SHA-256 of a preimage
pub fn sha256_digest(data: &[u8]) -> [u8; 32] {
    sha256::Hash::hash(data).to_byte_array()
}

/// Evaluate `script` against `witness`.
///
/// Supports the opcode subset used by the escrow templates; anything else
/// fails evaluation rather than being skipped. The final stack must hold
/// exactly one true element.
pub fn interpret(script: &Script, witness: &ScriptWitness, ctx: &ExecutionContext) -> Evaluation {
    let mut stack: Vec<Vec<u8>> = witness.items.clone();
    // Execution flag per open OP_IF
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut branch = None;

    for instruction in script.instructions() {
        let executing = exec_stack.iter().all(|e| *e);
        let instruction = match instruction {
            Ok(i) => i,
            Err(e) => return Evaluation::fail(branch, format!("malformed script: {}", e)),
        };

        let op = match instruction {
            Instruction::PushBytes(bytes) => {
                if executing {
                    stack.push(bytes.as_bytes().to_vec());
                }
                continue;
            }
            Instruction::Op(op) => op,
        };

        match op {
            OP_IF => {
                let taken = if executing {
                    let Some(top) = stack.pop() else {
                        return Evaluation::fail(branch, "OP_IF on empty stack");
                    };
                    let taken = cast_to_bool(&top);
                    if branch.is_none() {
                        branch = Some(if taken { Branch::Reveal } else { Branch::Timeout });
                    }
                    taken
                } else {
                    false
                };
                exec_stack.push(taken);
                continue;
            }
            OP_ELSE => {
                let Some(last) = exec_stack.last_mut() else {
                    return Evaluation::fail(branch, "OP_ELSE without OP_IF");
                };
                *last = !*last;
                continue;
            }
            OP_ENDIF => {
                if exec_stack.pop().is_none() {
                    return Evaluation::fail(branch, "OP_ENDIF without OP_IF");
                }
                continue;
            }
            _ => {}
        }

        if !executing {
            continue;
        }

        let code = op.to_u8();
        if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&code) {
            stack.push(vec![code - OP_PUSHNUM_1.to_u8() + 1]);
            continue;
        }

        match op {
            OP_SHA256 => {
                let Some(top) = stack.pop() else {
                    return Evaluation::fail(branch, "OP_SHA256 on empty stack");
                };
                stack.push(sha256_digest(&top).to_vec());
            }
            OP_EQUAL | OP_EQUALVERIFY => {
                let (Some(a), Some(b)) = (stack.pop(), stack.pop()) else {
                    return Evaluation::fail(branch, "OP_EQUAL needs two items");
                };
                if op == OP_EQUALVERIFY {
                    if a != b {
                        return Evaluation::fail(branch, "hash lock not satisfied");
                    }
                } else {
                    stack.push(if a == b { vec![1] } else { Vec::new() });
                }
            }
            OP_DROP => {
                if stack.pop().is_none() {
                    return Evaluation::fail(branch, "OP_DROP on empty stack");
                }
            }
            OP_CSV => {
                let Some(top) = stack.last() else {
                    return Evaluation::fail(branch, "OP_CSV on empty stack");
                };
                let Some(required) = decode_script_num(top) else {
                    return Evaluation::fail(branch, "OP_CSV operand is not a number");
                };
                if required < 0 || i64::from(ctx.relative_age) < required {
                    return Evaluation::fail(
                        branch,
                        format!(
                            "relative timeout not reached: age {} < {}",
                            ctx.relative_age, required
                        ),
                    );
                }
            }
            OP_CHECKSIG => {
                let (Some(pubkey), Some(sig)) = (stack.pop(), stack.pop()) else {
                    return Evaluation::fail(branch, "OP_CHECKSIG needs two items");
                };
                let valid = ctx
                    .sighash
                    .map(|digest| verify_signature(&pubkey, &sig, digest))
                    .unwrap_or(false);
                stack.push(if valid { vec![1] } else { Vec::new() });
            }
            other => {
                return Evaluation::fail(branch, format!("unsupported opcode {:?}", other));
            }
        }
    }

    if !exec_stack.is_empty() {
        return Evaluation::fail(branch, "unbalanced conditional");
    }

    match stack.as_slice() {
        [top] if cast_to_bool(top) => Evaluation {
            passed: true,
            branch,
            failure: None,
        },
        [_] => Evaluation::fail(branch, "script evaluated to false"),
        _ => Evaluation::fail(branch, format!("stack not clean: {} items", stack.len())),
    }
}

/// ECDSA check of a witness signature (trailing sighash flag stripped)
fn verify_signature(pubkey: &[u8], sig: &[u8], digest: [u8; 32]) -> bool {
    let Some((_flag, der)) = sig.split_last() else {
        return false;
    };
    let (Ok(pubkey), Ok(signature)) = (PublicKey::from_slice(pubkey), Signature::from_der(der))
    else {
        return false;
    };
    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&Message::from_digest(digest), &signature, &pubkey)
        .is_ok()
}

fn cast_to_bool(bytes: &[u8]) -> bool {
    for (i, b) in bytes.iter().enumerate() {
        if *b != 0 {
            // negative zero is false
            return !(i == bytes.len() - 1 && *b == 0x80);
        }
    }
    false
}

/// Minimal little-endian sign-magnitude script number, at most 5 bytes
fn decode_script_num(bytes: &[u8]) -> Option<i64> {
    if bytes.len() > 5 {
        return None;
    }
    let Some((last, _)) = bytes.split_last() else {
        return Some(0);
    };
    let mut value: i64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        value |= i64::from(*b) << (8 * i);
    }
    if last & 0x80 != 0 {
        value &= !(0x80_i64 << (8 * (bytes.len() - 1)));
        value = -value;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::regtest_address as test_address;
    use secp256k1::SecretKey;

    fn params(preimage: &[u8]) -> ScriptParams {
        ScriptParams {
            commitment_hash: sha256_digest(preimage).to_vec(),
            payouts: vec![Payout::new(test_address(1), 500), Payout::new(test_address(2), 500)],
            fallback_address: test_address(9),
            timeout_blocks: 144,
            fallback_pubkey: None,
        }
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let builder = ScriptBuilder::new(Network::Regtest);
        let a = builder.derive(&params(b"pixel"), 1_000).unwrap();
        let b = builder.derive(&params(b"pixel"), 1_000).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.payout_scripts.len(), 2);
        assert_eq!(a.payout_amounts, vec![500, 500]);

        let c = builder.derive(&params(b"other"), 1_000).unwrap();
        assert_ne!(a.commitment_address, c.commitment_address);
    }

    #[test]
    fn test_payout_split_changes_address() {
        let builder = ScriptBuilder::new(Network::Regtest);
        let base = builder.derive(&params(b"pixel"), 1_000).unwrap();
        let mut reordered = params(b"pixel");
        reordered.payouts.swap(0, 1);
        let other = builder.derive(&reordered, 1_000).unwrap();
        assert_ne!(base.redeem_script, other.redeem_script);
    }

    #[test]
    fn test_rejects_bad_params() {
        let builder = ScriptBuilder::new(Network::Regtest);

        let mut empty = params(b"pixel");
        empty.payouts.clear();
        assert!(matches!(builder.derive(&empty, 1_000), Err(EscrowError::Validation(_))));

        assert!(matches!(
            builder.derive(&params(b"pixel"), 999),
            Err(EscrowError::Validation(_))
        ));

        let mut no_hash = params(b"pixel");
        no_hash.commitment_hash.clear();
        assert!(matches!(builder.derive(&no_hash, 1_000), Err(EscrowError::Validation(_))));

        let mut wrong_net = params(b"pixel");
        wrong_net.fallback_address = Address::p2wsh(
            &ScriptBuf::from_bytes(vec![3]),
            bitcoin::Network::Bitcoin,
        )
        .to_string();
        assert!(builder.derive(&wrong_net, 1_000).is_err());
    }

    #[test]
    fn test_commitment_script_hash_lock() {
        let hash = sha256_digest(b"pixel");
        let script = build_commitment_script(&hash).unwrap();
        let ok = interpret(
            &script,
            &ScriptWitness { items: vec![b"pixel".to_vec()] },
            &ExecutionContext::default(),
        );
        assert!(ok.passed);

        let bad = interpret(
            &script,
            &ScriptWitness { items: vec![b"pixels".to_vec()] },
            &ExecutionContext::default(),
        );
        assert!(!bad.passed);
    }

    #[test]
    fn test_reveal_branch() {
        let set = ScriptBuilder::new(Network::Regtest)
            .derive(&params(b"pixel"), 1_000)
            .unwrap();

        let eval = interpret(
            &set.redeem_script,
            &ScriptWitness::reveal(b"pixel"),
            &ExecutionContext::default(),
        );
        assert!(eval.passed, "{:?}", eval.failure);
        assert_eq!(eval.branch, Some(Branch::Reveal));

        let wrong = interpret(
            &set.redeem_script,
            &ScriptWitness::reveal(b"forged"),
            &ExecutionContext::default(),
        );
        assert!(!wrong.passed);
        assert_eq!(wrong.branch, Some(Branch::Reveal));
    }

    #[test]
    fn test_timeout_branch_respects_age() {
        let set = ScriptBuilder::new(Network::Regtest)
            .derive(&params(b"pixel"), 1_000)
            .unwrap();

        let early = interpret(
            &set.redeem_script,
            &ScriptWitness::timeout(None),
            &ExecutionContext { relative_age: 143, sighash: None },
        );
        assert!(!early.passed);
        assert_eq!(early.branch, Some(Branch::Timeout));

        let late = interpret(
            &set.redeem_script,
            &ScriptWitness::timeout(None),
            &ExecutionContext { relative_age: 144, sighash: None },
        );
        assert!(late.passed, "{:?}", late.failure);
        assert_eq!(late.branch, Some(Branch::Timeout));
    }

    #[test]
    fn test_timeout_branch_requires_signature() {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&secp, &secret);
        let digest = sha256_digest(b"spend");

        let mut p = params(b"pixel");
        p.fallback_pubkey = Some(pubkey);
        let set = ScriptBuilder::new(Network::Regtest).derive(&p, 1_000).unwrap();

        let mut sig = secp
            .sign_ecdsa(&Message::from_digest(digest), &secret)
            .serialize_der()
            .to_vec();
        sig.push(0x01);

        let ctx = ExecutionContext { relative_age: 200, sighash: Some(digest) };
        let signed = interpret(&set.redeem_script, &ScriptWitness::timeout(Some(sig)), &ctx);
        assert!(signed.passed, "{:?}", signed.failure);

        let forged = interpret(
            &set.redeem_script,
            &ScriptWitness::timeout(Some(vec![0x30, 0x01])),
            &ctx,
        );
        assert!(!forged.passed);
        let unsigned = interpret(&set.redeem_script, &ScriptWitness::timeout(None), &ctx);
        assert!(!unsigned.passed);
        assert_eq!(unsigned.branch, Some(Branch::Timeout));

        let unsigned_keyless = ScriptBuilder::new(Network::Regtest)
            .derive(&params(b"pixel"), 1_000)
            .unwrap();
        assert_ne!(unsigned_keyless.redeem_script, set.redeem_script);
    }

    #[test]
    fn test_script_num_decoding() {
        assert_eq!(decode_script_num(&[]), Some(0));
        assert_eq!(decode_script_num(&[0x90, 0x00]), Some(144));
        assert_eq!(decode_script_num(&[0x81]), Some(-1));
        assert_eq!(decode_script_num(&[0; 6]), None);
    }
}
