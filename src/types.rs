//! Shared types for the swap broker.

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Bitcoin network type.
///
/// Parsed from the `chain` field of the node's `getblockchaininfo` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Bitcoin mainnet.
    Bitcoin,
    /// Bitcoin testnet.
    Testnet,
    /// Signet.
    Signet,
    /// Bitcoin regtest (local development).
    Regtest,
}

impl Network {
    /// Convert to bitcoin crate's Network type.
    pub fn to_bitcoin_network(self) -> bitcoin::Network {
        match self {
            Network::Bitcoin => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

impl std::str::FromStr for Network {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "main" | "bitcoin" | "mainnet" => Ok(Network::Bitcoin),
            "test" | "testnet" | "testnet3" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            _ => Err(crate::error::Error::Parse(format!(
                "unknown network: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Bitcoin => write!(f, "main"),
            Network::Testnet => write!(f, "test"),
            Network::Signet => write!(f, "signet"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

/// Swap lifecycle status.
///
/// Transitions form a DAG:
///   pending → accepted → settled
///   pending → canceled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapStatus {
    /// Created; waiting for the customer to pay the hold invoice.
    Pending,
    /// Invoice accepted and on-chain HTLC funded; waiting for the sweep.
    Accepted,
    /// Preimage revealed and invoice settled.
    Settled,
    /// Funding failed; record lingers briefly for polling clients.
    Canceled,
}

impl SwapStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SwapStatus::Pending => "pending",
            SwapStatus::Accepted => "accepted",
            SwapStatus::Settled => "settled",
            SwapStatus::Canceled => "canceled",
        }
    }
}

/// A submarine swap record.
///
/// This is the persisted document; the pending tier and the durable tier
/// both store it verbatim as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Swap {
    /// 128-bit random identifier, lowercase hex.
    pub id: String,
    pub status: SwapStatus,
    /// On-chain payout amount in satoshi.
    pub value: u64,
    /// Bech32 hold-invoice payment request.
    pub invoice: String,
    /// P2WSH address of the HTLC.
    pub address: String,
    /// Absolute block height of the refund branch.
    pub locktime: u32,
    pub fee_network: u64,
    pub fee_service: u64,
    /// Full witness script, hex.
    pub redeem_script: String,
    /// SHA-256 payment hash, 64 hex chars.
    pub payment_hash: String,
    /// Revealed preimage, hex; present only once settled.
    pub preimage: Option<String>,
    /// Seconds the pending record may live in the cache.
    pub expiry: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding_txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding_vout: Option<u32>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Generate a fresh swap identifier: 16 random bytes, lowercase hex.
pub fn new_swap_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
