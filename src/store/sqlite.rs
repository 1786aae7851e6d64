//! SQLite-backed durable tier.
//!
//! One `swaps` table stores the JSON swap record verbatim next to the
//! columns the watcher queries by. WAL mode keeps the request worker and
//! the watcher from blocking each other.

use super::DurableStore;
use crate::error::{Error, Result};
use crate::types::{Swap, SwapStatus};
use async_trait::async_trait;
use rusqlite::OptionalExtension;
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS swaps (
    id           TEXT PRIMARY KEY,
    status       TEXT NOT NULL,
    funding_txid TEXT,
    funding_vout INTEGER,
    record       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS swaps_outpoint
    ON swaps (funding_txid, funding_vout, status);
";

/// Durable swap store on a SQLite file.
pub struct SqliteDurableStore {
    conn: Connection,
}

impl SqliteDurableStore {
    /// Open (creating if needed) the store at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .await
            .map_err(|e| Error::Store(format!("failed to open {}: {}", path.display(), e)))?;
        Self::init(conn).await
    }

    /// Open an in-memory store, used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| Error::Store(format!("failed to open in-memory store: {}", e)))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Store(format!("failed to initialise schema: {}", e)))?;
        Ok(Self { conn })
    }

    async fn upsert(&self, swap: &Swap) -> Result<()> {
        let id = swap.id.clone();
        let status = swap.status.as_str().to_string();
        let funding_txid = swap.funding_txid.clone();
        let funding_vout = swap.funding_vout;
        let record = serde_json::to_string(swap)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO swaps (id, status, funding_txid, funding_vout, record)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (id) DO UPDATE SET
                         status = excluded.status,
                         funding_txid = excluded.funding_txid,
                         funding_vout = excluded.funding_vout,
                         record = excluded.record",
                    rusqlite::params![id, status, funding_txid, funding_vout, record],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| Error::Store(format!("failed to write swap: {}", e)))
    }

    fn decode(record: String) -> Result<Swap> {
        serde_json::from_str(&record).map_err(Error::from)
    }
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn insert(&self, swap: &Swap) -> Result<()> {
        self.upsert(swap).await
    }

    async fn get(&self, id: &str) -> Result<Option<Swap>> {
        let id = id.to_string();
        let record = self
            .conn
            .call(move |conn| {
                let record = conn
                    .query_row("SELECT record FROM swaps WHERE id = ?1", [id], |row| {
                        row.get::<_, String>(0)
                    })
                    .optional()?;
                Ok(record)
            })
            .await
            .map_err(|e| Error::Store(format!("failed to read swap: {}", e)))?;

        record.map(Self::decode).transpose()
    }

    async fn update(&self, swap: &Swap) -> Result<()> {
        self.upsert(swap).await
    }

    async fn find_accepted_by_outpoint(&self, txid: &str, vout: u32) -> Result<Option<Swap>> {
        let txid = txid.to_string();
        let status = SwapStatus::Accepted.as_str();
        let record = self
            .conn
            .call(move |conn| {
                let record = conn
                    .query_row(
                        "SELECT record FROM swaps
                         WHERE funding_txid = ?1 AND funding_vout = ?2 AND status = ?3",
                        rusqlite::params![txid, vout, status],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(record)
            })
            .await
            .map_err(|e| Error::Store(format!("failed to query outpoint: {}", e)))?;

        record.map(Self::decode).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{new_swap_id, unix_now};

    fn accepted_swap() -> Swap {
        let now = unix_now();
        Swap {
            id: new_swap_id(),
            status: SwapStatus::Accepted,
            value: 200_000,
            invoice: "lnbcrt1invoice".to_string(),
            address: "bcrt1qaddress".to_string(),
            locktime: 106,
            fee_network: 141,
            fee_service: 1000,
            redeem_script: "a914".to_string(),
            payment_hash: "22".repeat(32),
            preimage: None,
            expiry: 7200,
            funding_txid: Some("ef".repeat(32)),
            funding_vout: Some(1),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn round_trips_the_record() {
        let store = SqliteDurableStore::open_in_memory().await.unwrap();
        let swap = accepted_swap();

        store.insert(&swap).await.unwrap();
        let found = store.get(&swap.id).await.unwrap().unwrap();
        assert_eq!(found.id, swap.id);
        assert_eq!(found.payment_hash, swap.payment_hash);
        assert_eq!(found.funding_vout, Some(1));

        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn outpoint_query_tracks_status() {
        let store = SqliteDurableStore::open_in_memory().await.unwrap();
        let mut swap = accepted_swap();
        store.insert(&swap).await.unwrap();

        let txid = swap.funding_txid.clone().unwrap();
        let found = store
            .find_accepted_by_outpoint(&txid, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, swap.id);

        // Wrong vout misses.
        assert!(
            store
                .find_accepted_by_outpoint(&txid, 0)
                .await
                .unwrap()
                .is_none()
        );

        // Settling removes the swap from the watcher query.
        swap.status = SwapStatus::Settled;
        swap.preimage = Some("ab".repeat(32));
        store.update(&swap).await.unwrap();
        assert!(
            store
                .find_accepted_by_outpoint(&txid, 1)
                .await
                .unwrap()
                .is_none()
        );

        let found = store.get(&swap.id).await.unwrap().unwrap();
        assert_eq!(found.status, SwapStatus::Settled);
        assert_eq!(found.preimage, swap.preimage);
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let store = SqliteDurableStore::open_in_memory().await.unwrap();
        let swap = accepted_swap();
        store.insert(&swap).await.unwrap();
        store.insert(&swap).await.unwrap();
        assert!(store.get(&swap.id).await.unwrap().is_some());
    }
}
