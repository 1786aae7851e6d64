//! In-process store backends.
//!
//! [`MemoryPendingStore`] is the shipped pending tier: pending state is
//! ephemeral by contract, so a TTL map inside the broker process satisfies
//! it. [`MemoryDurableStore`] backs tests; production uses the SQLite tier.

use super::{DurableStore, PendingStore, lock_poisoned};
use crate::error::Result;
use crate::types::{Swap, SwapStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct PendingEntry {
    swap: Swap,
    expires_at: Instant,
}

/// TTL-bounded cache of pending swaps, keyed by swap id.
#[derive(Default)]
pub struct MemoryPendingStore {
    entries: RwLock<HashMap<String, PendingEntry>>,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingStore for MemoryPendingStore {
    async fn put(&self, swap: &Swap, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| lock_poisoned())?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(
            swap.id.clone(),
            PendingEntry {
                swap: swap.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Swap>> {
        let mut entries = self.entries.write().map_err(|_| lock_poisoned())?;
        match entries.get(id) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.swap.clone())),
            Some(_) => {
                entries.remove(id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| lock_poisoned())?;
        entries.remove(id);
        Ok(())
    }
}

/// In-memory durable tier for tests.
#[derive(Default)]
pub struct MemoryDurableStore {
    swaps: RwLock<HashMap<String, Swap>>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn insert(&self, swap: &Swap) -> Result<()> {
        let mut swaps = self.swaps.write().map_err(|_| lock_poisoned())?;
        swaps.insert(swap.id.clone(), swap.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Swap>> {
        let swaps = self.swaps.read().map_err(|_| lock_poisoned())?;
        Ok(swaps.get(id).cloned())
    }

    async fn update(&self, swap: &Swap) -> Result<()> {
        let mut swaps = self.swaps.write().map_err(|_| lock_poisoned())?;
        if swaps.contains_key(&swap.id) {
            swaps.insert(swap.id.clone(), swap.clone());
        }
        Ok(())
    }

    async fn find_accepted_by_outpoint(&self, txid: &str, vout: u32) -> Result<Option<Swap>> {
        let swaps = self.swaps.read().map_err(|_| lock_poisoned())?;
        Ok(swaps
            .values()
            .find(|swap| {
                swap.status == SwapStatus::Accepted
                    && swap.funding_txid.as_deref() == Some(txid)
                    && swap.funding_vout == Some(vout)
            })
            .cloned())
    }
}
