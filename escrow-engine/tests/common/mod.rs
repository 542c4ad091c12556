#![allow(dead_code)]

use std::sync::Arc;

use bitcoin::{Address, ScriptBuf};
use escrow_engine::{
    escrow::{NewContract, NewGoal, NewTask},
    ingestion::FixtureIngestionSource,
    models::Contract,
    provider::{MockFundingProvider, MockProviderConfig},
    store::EscrowStore,
    EngineConfig, EscrowNode, Network,
};

/// Deterministic regtest P2WSH address distinct per `seed`
pub fn regtest_address(seed: u8) -> String {
    Address::p2wsh(
        &ScriptBuf::from_bytes(vec![seed, 0x51]),
        bitcoin::Network::Regtest,
    )
    .to_string()
}

pub fn regtest_config() -> EngineConfig {
    EngineConfig {
        network: Network::Regtest,
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub node: EscrowNode,
    pub chain: Arc<MockFundingProvider>,
    pub feed: Arc<FixtureIngestionSource>,
}

pub async fn harness(config: EngineConfig) -> Harness {
    let chain = Arc::new(MockFundingProvider::new(MockProviderConfig::default()));
    let feed = Arc::new(FixtureIngestionSource::default());
    let node = EscrowNode::with_sources(
        config,
        Arc::new(EscrowStore::in_memory()),
        chain.clone(),
        feed.clone(),
    )
    .await
    .unwrap();
    Harness { node, chain, feed }
}

/// Contract with one goal holding one task per entry of `task_budgets`
pub async fn contract(node: &EscrowNode, budget_sats: u64, task_budgets: &[u64]) -> Contract {
    node.escrow()
        .create_contract(NewContract {
            id: None,
            title: "Pixel mural".to_string(),
            total_budget_sats: budget_sats,
            goals: vec![NewGoal {
                title: "Paint".to_string(),
                tasks: task_budgets
                    .iter()
                    .enumerate()
                    .map(|(i, budget)| NewTask {
                        title: format!("Tile {}", i),
                        budget_sats: *budget,
                        difficulty: None,
                        requirements: vec![],
                    })
                    .collect(),
            }],
            skills: vec!["art".to_string()],
            proposal_id: None,
        })
        .await
        .unwrap()
}
