//! The swap coordinator.
//!
//! Ties together script construction, the hold invoice, the watched
//! on-chain address and the two store tiers. Three operations: `create` a
//! pending swap, `lookup` (which performs the funding transition once the
//! invoice locks), and the manual `settle` fallback for when the chain
//! watcher has not yet seen the sweep.

use crate::chain::{self, BitcoinNode};
use crate::error::{Error, Result};
use crate::htlc;
use crate::lightning::{InvoiceState, LightningNode};
use crate::store::{DurableStore, PendingStore, SwapStore};
use crate::types::{Network, Swap, SwapStatus, new_swap_id, unix_now};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Blocks between creation height and the refund branch.
const LOCKTIME_DELTA: u32 = 6;
/// Expected seconds per block.
const BLOCK_INTERVAL_SECS: u64 = 600;
/// The pending TTL is twice the locktime horizon.
const EXPIRY_MARGIN: u64 = 2;
/// How long a canceled record stays pollable.
const CANCEL_TTL: Duration = Duration::from_secs(600);
/// Invoice-level expiry passed to the node.
const INVOICE_EXPIRY_SECS: u64 = 3600;
/// Confirmation target for funding fee estimates.
const FEE_TARGET_CONF: u32 = 1;

/// Amount bounds and service fee rate.
#[derive(Debug, Clone, Copy)]
pub struct SwapLimits {
    pub min_amount: u64,
    pub max_amount: u64,
    /// Service fee in percent of the swap value.
    pub service_feerate: f64,
}

/// The broker state machine.
///
/// Generic over the store tiers; the node handles are process-wide
/// collaborators supplied at construction.
pub struct Coordinator<P: PendingStore, D: DurableStore> {
    store: Arc<SwapStore<P, D>>,
    lightning: Arc<dyn LightningNode>,
    chain: Arc<dyn BitcoinNode>,
    watchonly: Arc<dyn BitcoinNode>,
    network: Network,
    limits: SwapLimits,
}

impl<P: PendingStore, D: DurableStore> Coordinator<P, D> {
    pub fn new(
        store: Arc<SwapStore<P, D>>,
        lightning: Arc<dyn LightningNode>,
        chain: Arc<dyn BitcoinNode>,
        watchonly: Arc<dyn BitcoinNode>,
        network: Network,
        limits: SwapLimits,
    ) -> Self {
        Self {
            store,
            lightning,
            chain,
            watchonly,
            network,
            limits,
        }
    }

    /// Create a pending swap: build the HTLC, create the hold invoice and
    /// cache the record for the customer to pay against.
    pub async fn create(&self, pubkey: &str, value: u64, payment_hash: &str) -> Result<Swap> {
        if pubkey.len() < 64 {
            return Err(Error::InvalidPubkey);
        }
        if value <= htlc::DUST_LIMIT {
            return Err(Error::BelowDust);
        }
        if value < self.limits.min_amount {
            return Err(Error::BelowMinimum);
        }
        if value > self.limits.max_amount {
            return Err(Error::AboveMaximum);
        }
        if payment_hash.len() != 64 {
            return Err(Error::InvalidPaymentHash);
        }

        let image = hex::decode(payment_hash).map_err(|_| Error::InvalidPaymentHash)?;
        let customer = hex::decode(pubkey).map_err(|_| Error::InvalidPubkey)?;

        let broker_address = self.chain.new_address().await?;
        let broker_pubkey = self.chain.address_pubkey(&broker_address).await?;
        let broker = hex::decode(&broker_pubkey)
            .map_err(|e| Error::ChainRpc(format!("node returned bad pubkey: {}", e)))?;

        let height = self.chain.block_count().await?;
        let locktime = u32::try_from(height)
            .map_err(|_| Error::ChainRpc(format!("block height {} out of range", height)))?
            + LOCKTIME_DELTA;

        let script = htlc::build_witness_script(&image, &broker, &customer, locktime)?;
        let address = htlc::p2wsh_address(&script, self.network);

        let estimate = self
            .lightning
            .estimate_fee(&address.to_string(), value, FEE_TARGET_CONF)
            .await?;
        if estimate.feerate_sat_per_byte == 0 {
            return Err(Error::FeeEstimationUnavailable);
        }
        let fee_network = estimate.fee_sat / estimate.feerate_sat_per_byte;
        let fee_service = (value as f64 * self.limits.service_feerate / 100.0) as u64;

        let balance = match self.lightning.wallet_balance().await {
            Ok(balance) => balance.effective(),
            Err(_) => 0,
        };
        if value + fee_network > balance {
            return Err(Error::InsufficientLiquidity);
        }

        let invoice = self
            .lightning
            .create_hold_invoice(
                payment_hash,
                value + fee_network + fee_service,
                INVOICE_EXPIRY_SECS,
            )
            .await
            .map_err(|e| match e {
                Error::InvoiceCreation(_) => e,
                other => Error::InvoiceCreation(other.to_string()),
            })?;

        let expiry = BLOCK_INTERVAL_SECS * u64::from(LOCKTIME_DELTA) * EXPIRY_MARGIN;
        let now = unix_now();
        let swap = Swap {
            id: new_swap_id(),
            status: SwapStatus::Pending,
            value,
            invoice: invoice.payment_request,
            address: address.to_string(),
            locktime,
            fee_network,
            fee_service,
            redeem_script: hex::encode(script.as_bytes()),
            payment_hash: payment_hash.to_string(),
            preimage: None,
            expiry,
            funding_txid: None,
            funding_vout: None,
            created_at: now,
            updated_at: now,
        };

        self.store
            .put_pending(&swap, Duration::from_secs(expiry))
            .await?;

        log::info!(
            "created swap {} for {} sat, htlc {} locktime {}",
            swap.id,
            swap.value,
            swap.address,
            swap.locktime
        );
        Ok(swap)
    }

    /// Look a swap up by id.
    ///
    /// A pending swap whose invoice has locked is funded on the way out.
    pub async fn lookup(&self, id: &str) -> Result<Swap> {
        let swap = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::SwapNotFound(id.to_string()))?;

        if swap.status == SwapStatus::Pending {
            let state = self.lightning.lookup_invoice(&swap.payment_hash).await?;
            if state == InvoiceState::Accepted {
                return self.fund(swap).await;
            }
        }
        Ok(swap)
    }

    /// Manual settlement fallback.
    ///
    /// Only accepted swaps can settle, and only with the preimage behind
    /// the payment hash.
    pub async fn settle(&self, id: &str, preimage_hex: &str) -> Result<Swap> {
        let mut swap = self
            .store
            .get_accepted(id)
            .await?
            .ok_or_else(|| Error::SwapNotFound(id.to_string()))?;

        let preimage = hex::decode(preimage_hex).map_err(|_| Error::InvalidPreimage)?;
        if hex::encode(Sha256::digest(&preimage)) != swap.payment_hash {
            return Err(Error::InvalidPreimage);
        }

        if !self.lightning.settle_invoice(&preimage).await? {
            return Err(Error::InvalidPreimage);
        }

        swap.status = SwapStatus::Settled;
        swap.preimage = Some(preimage_hex.to_lowercase());
        swap.updated_at = unix_now();
        self.store.update(&swap).await?;

        log::info!("settled swap {} manually", swap.id);
        Ok(swap)
    }

    /// The funding transition: the customer's Lightning HTLC has locked,
    /// so put the on-chain leg in place.
    ///
    /// The descriptor import must precede the send so the watch-only wallet
    /// sees the funding output, and every later spend of it, from the start.
    async fn fund(&self, mut swap: Swap) -> Result<Swap> {
        let descriptor = chain::checksummed_descriptor(&format!("addr({})", swap.address))?;
        self.watchonly.import_descriptor(&descriptor).await?;

        match self.lightning.send_coins(&swap.address, swap.value).await? {
            Some(txid) => {
                let utxos = self.lightning.list_unspent(0).await?;
                let change = utxos
                    .iter()
                    .find(|utxo| utxo.txid == txid)
                    .ok_or_else(|| {
                        Error::LightningRpc(format!("no wallet utxo for funding tx {}", txid))
                    })?;
                // list_unspent reports our change output; the HTLC is the
                // other output of the same transaction.
                let vout = if change.output_index == 0 { 1 } else { 0 };

                swap.funding_txid = Some(txid);
                swap.funding_vout = Some(vout);
                swap.status = SwapStatus::Accepted;
                swap.updated_at = unix_now();
                self.store.promote_to_durable(&swap).await?;

                log::info!(
                    "swap {} funded at {}:{}",
                    swap.id,
                    swap.funding_txid.as_deref().unwrap_or_default(),
                    vout
                );
            }
            None => {
                swap.status = SwapStatus::Canceled;
                swap.updated_at = unix_now();
                self.store.cancel_pending(&swap, CANCEL_TTL).await?;
                self.lightning.cancel_invoice(&swap.payment_hash).await?;

                log::warn!("swap {} canceled: funding broadcast failed", swap.id);
            }
        }
        Ok(swap)
    }
}
