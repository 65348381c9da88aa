//! On-chain observation: balance and contract polling over resolved RPC
//! sessions. All access is read-only.

pub mod abi;
pub mod balance;
pub mod contracts;
pub mod types;

use alloy::providers::RootProvider;

/// A per-network session connection, resolved once at the start of a cycle
/// and reused for every read on that network until the cycle ends.
pub struct Session {
    pub network: String,
    pub currency: String,
    pub provider: RootProvider,
}
