//! Merkle Proof Verifier
//!
//! Recomputes a block's transaction merkle root from a txid and a sibling
//! path, Bitcoin style: double SHA-256 over internal byte order, with the
//! last node of an odd level paired with itself. Txids and sibling hashes
//! travel in display (byte-reversed) hex, the way explorers print them.
//!
//! Root mismatch and insufficient depth are distinct outcomes: the first is
//! [`ProofStatus::Invalid`] and terminal, the second is
//! [`ProofStatus::Provisional`] and retried on a later tick.

use bitcoin::block::Header;
use bitcoin::hashes::{sha256d, Hash};
use serde::{Deserialize, Serialize};

use crate::{
    config::Network,
    error::EscrowError,
    models::{ProofStatus, ProofStep, SiblingPosition},
    EscrowResult,
};

/// Deepest path accepted; a block would need more than 2^32 transactions to exceed it
pub const MAX_PATH_DEPTH: usize = 32;

/// Network-dependent validation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParams {
    pub network: Network,
    /// Display-hex merkle root of the genesis block
    pub genesis_merkle_root: String,
    pub max_path_depth: usize,
}

impl NetworkParams {
    pub fn for_network(network: Network) -> Self {
        let genesis = bitcoin::constants::genesis_block(network.to_bitcoin_network());
        Self {
            network,
            genesis_merkle_root: genesis.header.merkle_root.to_string(),
            max_path_depth: MAX_PATH_DEPTH,
        }
    }
}

/// Inclusion claim as reported by a funding-data provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofCandidate {
    pub txid: String,
    pub block_height: u64,
    pub merkle_root: String,
    pub path: Vec<ProofStep>,
}

/// Network-aware proof verifier
#[derive(Debug, Clone)]
pub struct MerkleVerifier {
    params: NetworkParams,
}

impl MerkleVerifier {
    pub fn new(network: Network) -> Self {
        Self {
            params: NetworkParams::for_network(network),
        }
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    /// Whether `txid` hashes up to `header_merkle_root` along `path`
    pub fn verify_inclusion(
        &self,
        txid: &str,
        block_height: u64,
        header_merkle_root: &str,
        path: &[ProofStep],
    ) -> bool {
        if path.len() > self.params.max_path_depth {
            return false;
        }

        // The genesis block holds only the coinbase; its root is fixed per network
        if block_height == 0
            && (!path.is_empty() || !eq_hex(header_merkle_root, &self.params.genesis_merkle_root))
        {
            return false;
        }

        match (recompute_root(txid, path), decode_hash(header_merkle_root)) {
            (Ok(computed), Ok(claimed)) => computed == claimed,
            _ => false,
        }
    }

    /// Classify a candidate against the current tip
    pub fn evaluate(
        &self,
        candidate: &ProofCandidate,
        tip_height: u64,
        required_depth: u32,
    ) -> ProofStatus {
        if !self.verify_inclusion(
            &candidate.txid,
            candidate.block_height,
            &candidate.merkle_root,
            &candidate.path,
        ) {
            return ProofStatus::Invalid;
        }

        match depth(tip_height, candidate.block_height) {
            Some(d) if d >= required_depth => ProofStatus::Confirmed,
            _ => ProofStatus::Provisional,
        }
    }
}

/// Blocks built on top of `block_height`; `None` when the block is above the tip
pub fn depth(tip_height: u64, block_height: u64) -> Option<u32> {
    tip_height
        .checked_sub(block_height)
        .map(|d| u32::try_from(d).unwrap_or(u32::MAX))
}

/// Root reached by folding `path` into `txid`, in internal byte order
pub fn recompute_root(txid: &str, path: &[ProofStep]) -> EscrowResult<[u8; 32]> {
    let mut current = decode_hash(txid)?;
    for step in path {
        let sibling = decode_hash(&step.sibling)?;
        current = match step.position {
            SiblingPosition::Left => hash_pair(&sibling, &current),
            SiblingPosition::Right => hash_pair(&current, &sibling),
        };
    }
    Ok(current)
}

/// Merkle root of a block's txids, in display hex
pub fn compute_root(txids: &[String]) -> EscrowResult<String> {
    if txids.is_empty() {
        return Err(EscrowError::validation("cannot compute root of an empty block"));
    }

    let mut level = txids
        .iter()
        .map(|t| decode_hash(t))
        .collect::<EscrowResult<Vec<_>>>()?;
    while level.len() > 1 {
        level = next_level(&level);
    }
    Ok(encode_hash(&level[0]))
}

/// Inclusion path for the txid at `index`
pub fn build_proof(txids: &[String], index: usize) -> EscrowResult<Vec<ProofStep>> {
    if index >= txids.len() {
        return Err(EscrowError::validation(format!(
            "leaf index {} out of range for {} txids",
            index,
            txids.len()
        )));
    }

    let mut level = txids
        .iter()
        .map(|t| decode_hash(t))
        .collect::<EscrowResult<Vec<_>>>()?;
    let mut pos = index;
    let mut path = Vec::new();

    while level.len() > 1 {
        let sibling_pos = if pos % 2 == 0 { pos + 1 } else { pos - 1 };
        // odd level: last node pairs with itself
        let sibling = level.get(sibling_pos).unwrap_or(&level[pos]);
        path.push(ProofStep {
            sibling: encode_hash(sibling),
            position: if pos % 2 == 0 {
                SiblingPosition::Right
            } else {
                SiblingPosition::Left
            },
        });
        level = next_level(&level);
        pos /= 2;
    }

    Ok(path)
}

/// Convert an explorer proof (`merkle` siblings + leaf `pos`) into flagged steps
pub fn path_from_position(siblings: &[String], pos: u64) -> Vec<ProofStep> {
    siblings
        .iter()
        .enumerate()
        .map(|(level, sibling)| ProofStep {
            sibling: sibling.clone(),
            position: if (pos >> level) & 1 == 0 {
                SiblingPosition::Right
            } else {
                SiblingPosition::Left
            },
        })
        .collect()
}

/// Merkle root (display hex) of a raw 80-byte block header
pub fn header_merkle_root(raw_header_hex: &str) -> EscrowResult<String> {
    let bytes = hex::decode(raw_header_hex.trim())?;
    let header: Header = bitcoin::consensus::deserialize(&bytes)
        .map_err(|e| EscrowError::validation(format!("invalid block header: {}", e)))?;
    Ok(header.merkle_root.to_string())
}

fn next_level(level: &[[u8; 32]]) -> Vec<[u8; 32]> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_pair(left, right),
            [single] => hash_pair(single, single),
            _ => unreachable!("chunks(2) yields one or two items"),
        })
        .collect()
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256d::Hash::hash(&buf).to_byte_array()
}

/// Display hex to internal byte order
pub fn decode_hash(display_hex: &str) -> EscrowResult<[u8; 32]> {
    let bytes = hex::decode(display_hex.trim())?;
    let mut out: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
        EscrowError::validation(format!("hash must be 32 bytes, got {}", b.len()))
    })?;
    out.reverse();
    Ok(out)
}

/// Internal byte order to display hex
pub fn encode_hash(internal: &[u8; 32]) -> String {
    let mut bytes = *internal;
    bytes.reverse();
    hex::encode(bytes)
}

fn eq_hex(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn txids(n: u8) -> Vec<String> {
        (0..n).map(|i| hex::encode([i.wrapping_add(1); 32])).collect()
    }

    #[test]
    fn test_round_trip_every_leaf() {
        let verifier = MerkleVerifier::new(Network::Regtest);
        for n in 1..=9u8 {
            let ids = txids(n);
            let root = compute_root(&ids).unwrap();
            for (i, id) in ids.iter().enumerate() {
                let path = build_proof(&ids, i).unwrap();
                assert!(verifier.verify_inclusion(id, 10, &root, &path), "n={} i={}", n, i);
            }
        }
    }

    #[test]
    fn test_single_tx_block_has_empty_path() {
        let ids = txids(1);
        assert_eq!(compute_root(&ids).unwrap(), ids[0]);
        assert!(build_proof(&ids, 0).unwrap().is_empty());
    }

    #[test]
    fn test_genesis_block() {
        let verifier = MerkleVerifier::new(Network::Mainnet);
        let root = verifier.params().genesis_merkle_root.clone();
        // the genesis coinbase txid equals the genesis merkle root
        assert!(verifier.verify_inclusion(&root, 0, &root, &[]));

        let other = txids(1).remove(0);
        assert!(!verifier.verify_inclusion(&other, 0, &other, &[]));
    }

    #[test]
    fn test_header_root_parsing() {
        let genesis = bitcoin::constants::genesis_block(bitcoin::Network::Bitcoin);
        let raw = hex::encode(bitcoin::consensus::serialize(&genesis.header));
        assert_eq!(
            header_merkle_root(&raw).unwrap(),
            NetworkParams::for_network(Network::Mainnet).genesis_merkle_root
        );
        assert!(header_merkle_root("00").is_err());
    }

    #[test]
    fn test_explorer_position_matches_built_path() {
        let ids = txids(7);
        for i in 0..ids.len() {
            let built = build_proof(&ids, i).unwrap();
            let siblings: Vec<String> = built.iter().map(|s| s.sibling.clone()).collect();
            assert_eq!(path_from_position(&siblings, i as u64), built);
        }
    }

    #[test]
    fn test_evaluate_distinguishes_invalid_from_provisional() {
        let verifier = MerkleVerifier::new(Network::Regtest);
        let ids = txids(4);
        let candidate = ProofCandidate {
            txid: ids[2].clone(),
            block_height: 100,
            merkle_root: compute_root(&ids).unwrap(),
            path: build_proof(&ids, 2).unwrap(),
        };

        assert_eq!(verifier.evaluate(&candidate, 103, 6), ProofStatus::Provisional);
        assert_eq!(verifier.evaluate(&candidate, 106, 6), ProofStatus::Confirmed);
        assert_eq!(verifier.evaluate(&candidate, 90, 1), ProofStatus::Provisional);

        let forged = ProofCandidate {
            merkle_root: ids[0].clone(),
            ..candidate
        };
        assert_eq!(verifier.evaluate(&forged, 200, 6), ProofStatus::Invalid);
    }

    #[test]
    fn test_malformed_hex_never_verifies() {
        let verifier = MerkleVerifier::new(Network::Regtest);
        let ids = txids(2);
        let root = compute_root(&ids).unwrap();
        assert!(!verifier.verify_inclusion("zz", 5, &root, &[]));
        assert!(!verifier.verify_inclusion(&ids[0], 5, "abcd", &[]));
    }

    proptest! {
        #[test]
        fn prop_valid_paths_verify_and_any_flip_fails(
            leaves in prop::collection::vec(any::<[u8; 32]>(), 2..48),
            leaf in any::<prop::sample::Index>(),
            step in any::<prop::sample::Index>(),
            byte in 0usize..32,
            bit in 0u8..8,
        ) {
            let ids: Vec<String> = leaves.iter().map(hex::encode).collect();
            let index = leaf.index(ids.len());
            let root = compute_root(&ids).unwrap();
            let path = build_proof(&ids, index).unwrap();
            let verifier = MerkleVerifier::new(Network::Regtest);

            prop_assert!(verifier.verify_inclusion(&ids[index], 1, &root, &path));

            let mut tampered = path.clone();
            let s = step.index(tampered.len());
            let mut sibling = hex::decode(&tampered[s].sibling).unwrap();
            sibling[byte] ^= 1 << bit;
            tampered[s].sibling = hex::encode(sibling);

            prop_assert!(!verifier.verify_inclusion(&ids[index], 1, &root, &tampered));
        }
    }
}
