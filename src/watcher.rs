//! Chain watcher: observes raw transactions and settles swept swaps.
//!
//! A dedicated thread blocks on the node's ZeroMQ `rawtx` publication and
//! feeds a bounded queue; the async consumer matches each transaction's
//! single input against accepted swaps, pulls the preimage out of the
//! witness stack and settles the corresponding hold invoice. Every
//! per-message failure is logged and dropped; the loop never stops for one
//! bad transaction.

use crate::chain::BitcoinNode;
use crate::error::{Error, Result};
use crate::lightning::LightningNode;
use crate::store::{DurableStore, PendingStore, SwapStore};
use crate::types::{SwapStatus, unix_now};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Witness stack length of the HTLC success branch:
/// `signature, pubkey, preimage, 0x01, script`.
const CLAIM_WITNESS_LEN: usize = 5;
/// Position of the preimage within that stack.
const PREIMAGE_WITNESS_INDEX: usize = 2;

/// Connect a SUB socket to the node's raw-transaction publisher.
///
/// Returns the receiving end of a bounded queue of raw transaction bodies.
/// The subscriber thread exits when the receiver is dropped.
pub fn subscribe_raw_tx(endpoint: &str, capacity: usize) -> Result<mpsc::Receiver<Vec<u8>>> {
    let context = zmq::Context::new();
    let socket = context
        .socket(zmq::SUB)
        .map_err(|e| Error::ChainRpc(format!("cannot create zmq socket: {}", e)))?;
    socket
        .set_rcvhwm(0)
        .map_err(|e| Error::ChainRpc(format!("cannot configure zmq socket: {}", e)))?;
    socket
        .set_subscribe(b"rawtx")
        .map_err(|e| Error::ChainRpc(format!("cannot subscribe to rawtx: {}", e)))?;
    socket
        .connect(endpoint)
        .map_err(|e| Error::ChainRpc(format!("cannot connect to {}: {}", endpoint, e)))?;

    let (tx, rx) = mpsc::channel(capacity);
    std::thread::spawn(move || {
        loop {
            let frames = match socket.recv_multipart(0) {
                Ok(frames) => frames,
                Err(e) => {
                    log::warn!("zmq receive failed: {}", e);
                    continue;
                }
            };
            // Messages are 3-frame multipart: [topic, body, sequence].
            if frames.len() != 3 || frames[0] != b"rawtx" {
                continue;
            }
            let body = frames.into_iter().nth(1).unwrap_or_default();
            if tx.blocking_send(body).is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

/// The raw-transaction consumer.
pub struct ChainWatcher<P: PendingStore, D: DurableStore> {
    store: Arc<SwapStore<P, D>>,
    lightning: Arc<dyn LightningNode>,
    chain: Arc<dyn BitcoinNode>,
}

impl<P: PendingStore, D: DurableStore> ChainWatcher<P, D> {
    pub fn new(
        store: Arc<SwapStore<P, D>>,
        lightning: Arc<dyn LightningNode>,
        chain: Arc<dyn BitcoinNode>,
    ) -> Self {
        Self {
            store,
            lightning,
            chain,
        }
    }

    /// Consume the queue until the publisher side closes.
    pub async fn run(self, mut rx: mpsc::Receiver<Vec<u8>>) {
        log::info!("chain watcher running");
        while let Some(raw) = rx.recv().await {
            if let Err(e) = self.handle_raw_tx(&raw).await {
                log::warn!("dropped raw-tx message: {}", e);
            }
        }
        log::info!("raw-tx stream closed, chain watcher exiting");
    }

    /// Process one raw transaction.
    ///
    /// Idempotent: a replayed sweep finds no accepted swap (or an
    /// already-settled invoice) and changes nothing.
    pub async fn handle_raw_tx(&self, raw: &[u8]) -> Result<()> {
        let decoded = self.chain.decode_raw_tx(raw).await?;

        // Swap sweeps spend exactly the one HTLC input.
        if decoded.vin.len() != 1 {
            return Ok(());
        }
        let vin = &decoded.vin[0];
        if vin.coinbase.is_some() {
            return Ok(());
        }
        let (Some(prev_txid), Some(prev_vout)) = (vin.txid.as_deref(), vin.vout) else {
            return Ok(());
        };

        let Some(mut swap) = self
            .store
            .find_accepted_by_outpoint(prev_txid, prev_vout)
            .await?
        else {
            return Ok(());
        };

        if vin.txinwitness.len() != CLAIM_WITNESS_LEN {
            log::debug!(
                "spend of swap {} outpoint with witness length {}, ignoring",
                swap.id,
                vin.txinwitness.len()
            );
            return Ok(());
        }

        let Ok(preimage) = hex::decode(&vin.txinwitness[PREIMAGE_WITNESS_INDEX]) else {
            return Ok(());
        };
        if hex::encode(Sha256::digest(&preimage)) != swap.payment_hash {
            log::debug!("witness preimage does not match swap {}", swap.id);
            return Ok(());
        }

        if !self.lightning.settle_invoice(&preimage).await? {
            // Replay: the invoice is already settled.
            log::debug!("invoice for swap {} already settled", swap.id);
            return Ok(());
        }

        swap.status = SwapStatus::Settled;
        swap.preimage = Some(hex::encode(&preimage));
        swap.updated_at = unix_now();
        self.store.update(&swap).await?;

        log::info!("swap {} swept in {}, invoice settled", swap.id, decoded.txid);
        Ok(())
    }
}
