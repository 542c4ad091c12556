//! Bitcoin commitment escrow engine
//!
//! This crate implements a non-custodial escrow that releases funds only once
//! a cryptographic commitment has been honored on chain:
//! - Hash-locked P2WSH scripts with a relative-timeout fallback
//! - Merkle inclusion proofs checked against block headers
//! - Confirmation-depth tracking for funding, reveal and sweep transactions
//! - Unsigned PSBT templates for every step (nothing is signed or broadcast)
//! - Background reconciliation against a funding-data provider
//! - Memory or PostgreSQL persistence

pub mod config;
pub mod dispute;
pub mod error;
pub mod escort;
pub mod escrow;
pub mod ingestion;
pub mod merkle;
pub mod models;
pub mod monitor;
pub mod node;
pub mod provider;
pub mod scheduler;
pub mod script;
pub mod store;
pub mod tasks;

pub use config::{EngineConfig, Network};
pub use error::EscrowError;
pub use node::EscrowNode;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
