//! Esplora REST provider (blockstream.info, mempool.space or self-hosted).
//!
//! Uses five endpoints:
//!
//! * `GET /blocks/tip/height`
//! * `GET /tx/{txid}/status`
//! * `GET /tx/{txid}/merkle-proof`
//! * `GET /block/{hash}/header`
//! * `GET /address/{address}/utxo`
//!
//! The header is fetched separately so the merkle root comes from the block
//! itself rather than from the proof endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::debug;

use super::{AddressOutput, ChainObservation, FundingProvider};
use crate::{
    error::EscrowError,
    merkle::{header_merkle_root, path_from_position},
    EscrowResult,
};

#[derive(Debug, Deserialize)]
struct TxStatus {
    confirmed: bool,
    block_height: Option<u64>,
    block_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MerkleProofResponse {
    block_height: u64,
    merkle: Vec<String>,
    pos: u64,
}

#[derive(Debug, Deserialize)]
struct Utxo {
    txid: String,
    vout: u32,
    value: u64,
    status: TxStatus,
}

impl From<Utxo> for AddressOutput {
    fn from(utxo: Utxo) -> Self {
        Self {
            txid: utxo.txid,
            vout: utxo.vout,
            value_sats: utxo.value,
            confirmed: utxo.status.confirmed,
            block_height: utxo.status.block_height,
        }
    }
}

/// Esplora-backed funding provider
pub struct EsploraFundingProvider {
    client: Client,
    base_url: String,
}

impl EsploraFundingProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> EscrowResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("escrow-engine/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET `endpoint`; `None` on 404
    async fn get(&self, endpoint: &str) -> EscrowResult<Option<reqwest::Response>> {
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self.client.get(&url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::TOO_MANY_REQUESTS => Err(EscrowError::provider(format!(
                "rate limited by {}",
                self.base_url
            ))),
            status if !status.is_success() => Err(EscrowError::provider(format!(
                "GET {} returned {}",
                endpoint, status
            ))),
            _ => Ok(Some(response)),
        }
    }

    async fn get_text(&self, endpoint: &str) -> EscrowResult<Option<String>> {
        match self.get(endpoint).await? {
            Some(response) => Ok(Some(response.text().await?)),
            None => Ok(None),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> EscrowResult<Option<T>> {
        match self.get(endpoint).await? {
            Some(response) => Ok(Some(response.json::<T>().await?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl FundingProvider for EsploraFundingProvider {
    fn name(&self) -> &str {
        "esplora"
    }

    async fn tip_height(&self) -> EscrowResult<u64> {
        let body = self
            .get_text("/blocks/tip/height")
            .await?
            .ok_or_else(|| EscrowError::provider("tip height endpoint not found"))?;
        body.trim()
            .parse()
            .map_err(|e| EscrowError::provider(format!("invalid tip height '{}': {}", body, e)))
    }

    async fn lookup(&self, txid: &str) -> EscrowResult<Option<ChainObservation>> {
        let Some(status) = self
            .get_json::<TxStatus>(&format!("/tx/{}/status", txid))
            .await?
        else {
            return Ok(None);
        };

        let (true, Some(block_hash)) = (status.confirmed, status.block_hash) else {
            debug!("{} not yet confirmed", txid);
            return Ok(None);
        };

        let Some(proof) = self
            .get_json::<MerkleProofResponse>(&format!("/tx/{}/merkle-proof", txid))
            .await?
        else {
            return Ok(None);
        };

        if status.block_height.is_some_and(|h| h != proof.block_height) {
            // reorg between the two calls; try again next tick
            return Ok(None);
        }

        let header = self
            .get_text(&format!("/block/{}/header", block_hash))
            .await?
            .ok_or_else(|| EscrowError::provider(format!("header for {} not found", block_hash)))?;

        Ok(Some(ChainObservation {
            txid: txid.to_string(),
            block_height: proof.block_height,
            block_hash: Some(block_hash),
            merkle_root: header_merkle_root(&header)?,
            path: path_from_position(&proof.merkle, proof.pos),
        }))
    }

    async fn address_outputs(&self, address: &str) -> EscrowResult<Vec<AddressOutput>> {
        let utxos = self
            .get_json::<Vec<Utxo>>(&format!("/address/{}/utxo", address))
            .await?
            .unwrap_or_default();
        Ok(utxos.into_iter().map(AddressOutput::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let provider =
            EsploraFundingProvider::new("https://mempool.space/signet/api/", Duration::from_secs(5))
                .unwrap();
        assert_eq!(provider.base_url(), "https://mempool.space/signet/api");
        assert_eq!(provider.name(), "esplora");
    }

    #[test]
    fn test_proof_response_shape() {
        let proof: MerkleProofResponse = serde_json::from_str(
            r#"{"block_height": 812345, "merkle": ["aa", "bb"], "pos": 2}"#,
        )
        .unwrap();
        let path = path_from_position(&proof.merkle, proof.pos);
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].position, crate::models::SiblingPosition::Right);
        assert_eq!(path[1].position, crate::models::SiblingPosition::Left);
    }

    #[test]
    fn test_utxo_response_shape() {
        let utxos: Vec<Utxo> = serde_json::from_str(
            r#"[
                {"txid": "ab", "vout": 1, "value": 5000,
                 "status": {"confirmed": true, "block_height": 812345, "block_hash": "cd", "block_time": 1}},
                {"txid": "ef", "vout": 0, "value": 700, "status": {"confirmed": false}}
            ]"#,
        )
        .unwrap();
        let outputs: Vec<AddressOutput> = utxos.into_iter().map(AddressOutput::from).collect();
        assert_eq!(outputs[0].vout, 1);
        assert_eq!(outputs[0].block_height, Some(812345));
        assert!(outputs[0].confirmed);
        assert!(!outputs[1].confirmed);
        assert_eq!(outputs[1].value_sats, 700);
    }
}
