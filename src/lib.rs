//! Submarine swap broker core.
//!
//! A non-custodial service exchanging an off-chain Lightning payment for an
//! on-chain payment: the customer presents a payment hash and a public key,
//! the broker locks a hold invoice to that hash and funds a matching
//! on-chain HTLC, and settlement happens when the customer's sweep reveals
//! the preimage on the chain.
//!
//! The node handles and store tiers are traits; production wires LND over
//! REST, Bitcoin Core over JSON-RPC and SQLite underneath, while tests run
//! the same coordinator against in-memory fakes.
//!
//! # Example
//!
//! ```rust,ignore
//! use subswap::{Coordinator, SwapLimits};
//!
//! let coordinator = Coordinator::new(store, lnd, chain, watchonly, network, limits);
//! let swap = coordinator.create(&pubkey_hex, 200_000, &payment_hash_hex).await?;
//! ```

pub mod api;
pub mod chain;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod htlc;
pub mod lightning;
pub mod store;
pub mod types;
pub mod watcher;

pub use chain::{BitcoinNode, BitcoindRpcClient, DecodedTransaction, DecodedVin};
pub use config::Config;
pub use coordinator::{Coordinator, SwapLimits};
pub use error::{Error, Result};
pub use lightning::{InvoiceState, LightningNode, LndRestClient};
pub use store::{DurableStore, PendingStore, SwapStore};
pub use types::{Network, Swap, SwapStatus};
pub use watcher::ChainWatcher;
