//! Two-tier persistence for swap records.
//!
//! Swaps live in exactly one of two tiers at a time:
//! - the *pending* tier: a TTL-bounded cache keyed by swap id, where records
//!   vanish when the customer fails to pay in time;
//! - the *durable* tier: a document store holding accepted and settled swaps
//!   indefinitely, queryable by funding outpoint for the chain watcher.
//!
//! [`SwapStore`] is the single logical API over both tiers. Promotion inserts
//! durably *before* deleting the cache entry; reads prefer the cache so the
//! brief double-presence window during promotion is harmless.

use crate::error::{Error, Result};
use crate::types::{Swap, SwapStatus};
use async_trait::async_trait;
use std::time::Duration;

pub mod memory;
pub mod sqlite;

/// TTL cache holding pending swaps.
#[async_trait]
pub trait PendingStore: Send + Sync {
    /// Store `swap` under its id for at most `ttl`.
    ///
    /// Overwrites any existing entry, resetting its deadline.
    async fn put(&self, swap: &Swap, ttl: Duration) -> Result<()>;

    /// Get a pending swap by id.
    ///
    /// Returns `Ok(None)` once the entry has expired.
    async fn get(&self, id: &str) -> Result<Option<Swap>>;

    /// Drop the entry, if present.
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Durable document store for accepted and settled swaps.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert or overwrite the record for `swap.id`.
    ///
    /// Idempotent so that an interrupted promotion can be retried.
    async fn insert(&self, swap: &Swap) -> Result<()>;

    /// Get a swap by id.
    async fn get(&self, id: &str) -> Result<Option<Swap>>;

    /// Rewrite the record for `swap.id`.
    async fn update(&self, swap: &Swap) -> Result<()>;

    /// Find the accepted swap funded by `(funding_txid, funding_vout)`.
    async fn find_accepted_by_outpoint(&self, txid: &str, vout: u32) -> Result<Option<Swap>>;
}

/// The logical swap store combining both tiers.
///
/// Generic over the backing implementations, mirroring how the rest of the
/// broker receives its collaborators.
pub struct SwapStore<P: PendingStore, D: DurableStore> {
    pending: P,
    durable: D,
}

impl<P: PendingStore, D: DurableStore> SwapStore<P, D> {
    pub fn new(pending: P, durable: D) -> Self {
        Self { pending, durable }
    }

    /// Record a freshly created swap in the pending tier.
    pub async fn put_pending(&self, swap: &Swap, ttl: Duration) -> Result<()> {
        self.pending.put(swap, ttl).await
    }

    /// Look up a swap in either tier, preferring the cache.
    pub async fn get(&self, id: &str) -> Result<Option<Swap>> {
        if let Some(swap) = self.pending.get(id).await? {
            return Ok(Some(swap));
        }
        self.durable.get(id).await
    }

    /// Move a swap from the pending tier into the durable tier.
    ///
    /// The durable insert happens first; a crash between the two steps
    /// leaves a duplicate that [`SwapStore::get`] resolves in the cache's
    /// favour until the entry expires or the promotion is retried.
    pub async fn promote_to_durable(&self, swap: &Swap) -> Result<()> {
        self.durable.insert(swap).await?;
        self.pending.delete(&swap.id).await
    }

    /// Rewrite a durable record.
    pub async fn update(&self, swap: &Swap) -> Result<()> {
        self.durable.update(swap).await
    }

    /// Rewrite a pending record with a short remaining lifetime.
    ///
    /// Used for the funding-failure branch: the canceled record stays
    /// pollable until the short TTL lapses.
    pub async fn cancel_pending(&self, swap: &Swap, ttl: Duration) -> Result<()> {
        self.pending.put(swap, ttl).await
    }

    /// Durable lookup restricted to accepted swaps.
    pub async fn get_accepted(&self, id: &str) -> Result<Option<Swap>> {
        Ok(self
            .durable
            .get(id)
            .await?
            .filter(|swap| swap.status == SwapStatus::Accepted))
    }

    /// Watcher query: the accepted swap funded by the given outpoint.
    pub async fn find_accepted_by_outpoint(&self, txid: &str, vout: u32) -> Result<Option<Swap>> {
        self.durable.find_accepted_by_outpoint(txid, vout).await
    }
}

pub(crate) fn lock_poisoned() -> Error {
    Error::Store("store lock poisoned".to_string())
}
