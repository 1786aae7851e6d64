//! End-to-end broker scenarios over in-memory fakes.
//!
//! The fakes stand in for the Lightning and Bitcoin nodes; the coordinator,
//! watcher and swap store under test are the production implementations.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use subswap::chain::{BitcoinNode, DecodedTransaction, DecodedVin};
use subswap::lightning::{
    FeeEstimate, HoldInvoice, InvoiceState, LightningNode, Utxo, WalletBalance,
};
use subswap::store::memory::{MemoryDurableStore, MemoryPendingStore};
use subswap::{
    ChainWatcher, Coordinator, Error, Network, Result, Swap, SwapLimits, SwapStatus, SwapStore,
};

const FUNDING_TXID: &str = "dd00000000000000000000000000000000000000000000000000000000000000";
const BROKER_ADDRESS: &str = "bcrt1qbrokerchange";

fn customer_pubkey() -> String {
    hex::encode([0x03u8; 33])
}

fn broker_pubkey() -> String {
    hex::encode([0x02u8; 33])
}

fn preimage() -> [u8; 32] {
    [0x42u8; 32]
}

fn payment_hash() -> String {
    hex::encode(Sha256::digest(preimage()))
}

/// Scriptable Lightning node double.
struct FakeLightning {
    invoice_state: Mutex<InvoiceState>,
    invoice_settled: Mutex<bool>,
    created_invoices: Mutex<Vec<(String, u64)>>,
    canceled_invoices: Mutex<Vec<String>>,
    settled_preimages: Mutex<Vec<Vec<u8>>>,
    send_txid: Mutex<Option<String>>,
    utxos: Mutex<Vec<Utxo>>,
    balance: Mutex<WalletBalance>,
    fee: Mutex<FeeEstimate>,
}

impl FakeLightning {
    fn new() -> Self {
        Self {
            invoice_state: Mutex::new(InvoiceState::Open),
            invoice_settled: Mutex::new(false),
            created_invoices: Mutex::new(Vec::new()),
            canceled_invoices: Mutex::new(Vec::new()),
            settled_preimages: Mutex::new(Vec::new()),
            send_txid: Mutex::new(Some(FUNDING_TXID.to_string())),
            utxos: Mutex::new(vec![Utxo {
                txid: FUNDING_TXID.to_string(),
                output_index: 0,
            }]),
            balance: Mutex::new(WalletBalance {
                total_balance: 10_000_000,
                reserved_balance_anchor_chan: 0,
            }),
            fee: Mutex::new(FeeEstimate {
                fee_sat: 2820,
                feerate_sat_per_byte: 20,
            }),
        }
    }

    fn set_invoice_state(&self, state: InvoiceState) {
        *self.invoice_state.lock().unwrap() = state;
    }

    fn set_send_txid(&self, txid: Option<&str>) {
        *self.send_txid.lock().unwrap() = txid.map(str::to_string);
    }

    fn set_change_index(&self, output_index: u32) {
        *self.utxos.lock().unwrap() = vec![Utxo {
            txid: FUNDING_TXID.to_string(),
            output_index,
        }];
    }

    fn set_balance(&self, total: u64, reserved: u64) {
        *self.balance.lock().unwrap() = WalletBalance {
            total_balance: total,
            reserved_balance_anchor_chan: reserved,
        };
    }

    fn set_feerate(&self, feerate_sat_per_byte: u64) {
        self.fee.lock().unwrap().feerate_sat_per_byte = feerate_sat_per_byte;
    }

    fn created_invoice_count(&self) -> usize {
        self.created_invoices.lock().unwrap().len()
    }
}

#[async_trait]
impl LightningNode for FakeLightning {
    async fn create_hold_invoice(
        &self,
        payment_hash: &str,
        value: u64,
        _expiry: u64,
    ) -> Result<HoldInvoice> {
        self.created_invoices
            .lock()
            .unwrap()
            .push((payment_hash.to_string(), value));
        Ok(HoldInvoice {
            payment_request: format!("lnbcrt1fake{}", value),
        })
    }

    async fn lookup_invoice(&self, _payment_hash: &str) -> Result<InvoiceState> {
        Ok(*self.invoice_state.lock().unwrap())
    }

    async fn settle_invoice(&self, preimage: &[u8]) -> Result<bool> {
        let mut settled = self.invoice_settled.lock().unwrap();
        if *settled {
            return Ok(false);
        }
        *settled = true;
        self.settled_preimages
            .lock()
            .unwrap()
            .push(preimage.to_vec());
        Ok(true)
    }

    async fn cancel_invoice(&self, payment_hash: &str) -> Result<()> {
        self.canceled_invoices
            .lock()
            .unwrap()
            .push(payment_hash.to_string());
        Ok(())
    }

    async fn send_coins(&self, _address: &str, _value: u64) -> Result<Option<String>> {
        Ok(self.send_txid.lock().unwrap().clone())
    }

    async fn list_unspent(&self, _min_confs: u32) -> Result<Vec<Utxo>> {
        Ok(self.utxos.lock().unwrap().clone())
    }

    async fn wallet_balance(&self) -> Result<WalletBalance> {
        Ok(*self.balance.lock().unwrap())
    }

    async fn estimate_fee(
        &self,
        _address: &str,
        _value: u64,
        _target_conf: u32,
    ) -> Result<FeeEstimate> {
        Ok(*self.fee.lock().unwrap())
    }
}

/// Bitcoin node double; `decode_raw_tx` parses the JSON the test feeds it.
struct FakeChain {
    height: u64,
    imported_descriptors: Mutex<Vec<String>>,
}

impl FakeChain {
    fn new(height: u64) -> Self {
        Self {
            height,
            imported_descriptors: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BitcoinNode for FakeChain {
    async fn new_address(&self) -> Result<String> {
        Ok(BROKER_ADDRESS.to_string())
    }

    async fn address_pubkey(&self, _address: &str) -> Result<String> {
        Ok(broker_pubkey())
    }

    async fn block_count(&self) -> Result<u64> {
        Ok(self.height)
    }

    async fn decode_raw_tx(&self, raw: &[u8]) -> Result<DecodedTransaction> {
        serde_json::from_slice(raw).map_err(|e| Error::ChainRpc(format!("decode failed: {}", e)))
    }

    async fn import_descriptor(&self, descriptor: &str) -> Result<()> {
        self.imported_descriptors
            .lock()
            .unwrap()
            .push(descriptor.to_string());
        Ok(())
    }
}

struct TestBroker {
    coordinator: Coordinator<MemoryPendingStore, MemoryDurableStore>,
    watcher: ChainWatcher<MemoryPendingStore, MemoryDurableStore>,
    store: Arc<SwapStore<MemoryPendingStore, MemoryDurableStore>>,
    lightning: Arc<FakeLightning>,
    chain: Arc<FakeChain>,
}

fn broker() -> TestBroker {
    let store = Arc::new(SwapStore::new(
        MemoryPendingStore::new(),
        MemoryDurableStore::new(),
    ));
    let lightning = Arc::new(FakeLightning::new());
    let chain = Arc::new(FakeChain::new(100));

    let coordinator = Coordinator::new(
        store.clone(),
        lightning.clone(),
        chain.clone(),
        chain.clone(),
        Network::Regtest,
        SwapLimits {
            min_amount: 100_000,
            max_amount: 100_000_000,
            service_feerate: 0.5,
        },
    );
    let watcher = ChainWatcher::new(store.clone(), lightning.clone(), chain.clone());

    TestBroker {
        coordinator,
        watcher,
        store,
        lightning,
        chain,
    }
}

/// A sweep of the swap's funding outpoint, as the node would decode it.
fn sweep_message(swap: &Swap, preimage: &[u8]) -> Vec<u8> {
    let tx = DecodedTransaction {
        txid: "ff".repeat(32),
        vin: vec![DecodedVin {
            txid: swap.funding_txid.clone(),
            vout: swap.funding_vout,
            coinbase: None,
            txinwitness: vec![
                "3044022000".to_string(),
                customer_pubkey(),
                hex::encode(preimage),
                "01".to_string(),
                swap.redeem_script.clone(),
            ],
        }],
    };
    serde_json::to_vec(&tx).unwrap()
}

#[tokio::test]
async fn happy_path_create_fund_sweep() {
    let broker = broker();

    let swap = broker
        .coordinator
        .create(&customer_pubkey(), 200_000, &payment_hash())
        .await
        .unwrap();

    assert_eq!(swap.status, SwapStatus::Pending);
    assert_eq!(swap.locktime, 106); // height 100 + 6
    assert_eq!(swap.expiry, 7200);
    assert_eq!(swap.fee_network, 141); // 2820 / 20
    assert_eq!(swap.fee_service, 1000); // 0.5% of 200_000
    assert!(swap.funding_txid.is_none());
    assert!(swap.preimage.is_none());

    // The hold invoice covers value + both fees and is locked to our hash.
    let created = broker.lightning.created_invoices.lock().unwrap().clone();
    assert_eq!(created, vec![(payment_hash(), 201_141)]);

    // The address commits to the redeem script.
    let script =
        bitcoin::ScriptBuf::from_bytes(hex::decode(&swap.redeem_script).unwrap());
    let derived = subswap::htlc::p2wsh_address(&script, Network::Regtest);
    assert_eq!(derived.to_string(), swap.address);

    // Customer pays; lookup performs the funding transition.
    broker.lightning.set_invoice_state(InvoiceState::Accepted);
    let swap = broker.coordinator.lookup(&swap.id).await.unwrap();
    assert_eq!(swap.status, SwapStatus::Accepted);
    assert_eq!(swap.funding_txid.as_deref(), Some(FUNDING_TXID));
    // Change sits at vout 0, so the HTLC is the other output.
    assert_eq!(swap.funding_vout, Some(1));

    let imported = broker.chain.imported_descriptors.lock().unwrap().clone();
    assert_eq!(imported.len(), 1);
    assert!(imported[0].starts_with(&format!("addr({})", swap.address)));
    assert!(imported[0].contains('#'));

    // Promoted: visible in the durable tier, queryable by outpoint.
    assert!(broker.store.get_accepted(&swap.id).await.unwrap().is_some());
    assert!(
        broker
            .store
            .find_accepted_by_outpoint(FUNDING_TXID, 1)
            .await
            .unwrap()
            .is_some()
    );

    // The customer sweeps the HTLC; the watcher settles the invoice.
    broker
        .watcher
        .handle_raw_tx(&sweep_message(&swap, &preimage()))
        .await
        .unwrap();

    let settled = broker.store.get(&swap.id).await.unwrap().unwrap();
    assert_eq!(settled.status, SwapStatus::Settled);
    assert_eq!(settled.preimage.as_deref(), Some(hex::encode(preimage()).as_str()));
    assert_eq!(
        broker.lightning.settled_preimages.lock().unwrap().as_slice(),
        &[preimage().to_vec()]
    );
}

#[tokio::test]
async fn watcher_replays_are_idempotent() {
    let broker = broker();
    let swap = broker
        .coordinator
        .create(&customer_pubkey(), 200_000, &payment_hash())
        .await
        .unwrap();
    broker.lightning.set_invoice_state(InvoiceState::Accepted);
    let swap = broker.coordinator.lookup(&swap.id).await.unwrap();

    let message = sweep_message(&swap, &preimage());
    for _ in 0..3 {
        broker.watcher.handle_raw_tx(&message).await.unwrap();
    }

    let settled = broker.store.get(&swap.id).await.unwrap().unwrap();
    assert_eq!(settled.status, SwapStatus::Settled);
    assert_eq!(broker.lightning.settled_preimages.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn manual_settle_path() {
    let broker = broker();
    let swap = broker
        .coordinator
        .create(&customer_pubkey(), 200_000, &payment_hash())
        .await
        .unwrap();
    broker.lightning.set_invoice_state(InvoiceState::Accepted);
    let swap = broker.coordinator.lookup(&swap.id).await.unwrap();

    let settled = broker
        .coordinator
        .settle(&swap.id, &hex::encode(preimage()))
        .await
        .unwrap();
    assert_eq!(settled.status, SwapStatus::Settled);
    assert_eq!(
        settled.preimage.as_deref(),
        Some(hex::encode(preimage()).as_str())
    );

    // No longer accepted, so a second settle cannot find it.
    assert!(matches!(
        broker
            .coordinator
            .settle(&swap.id, &hex::encode(preimage()))
            .await,
        Err(Error::SwapNotFound(_))
    ));
}

#[tokio::test]
async fn settle_rejects_wrong_preimage() {
    let broker = broker();
    let swap = broker
        .coordinator
        .create(&customer_pubkey(), 200_000, &payment_hash())
        .await
        .unwrap();
    broker.lightning.set_invoice_state(InvoiceState::Accepted);
    let swap = broker.coordinator.lookup(&swap.id).await.unwrap();

    let wrong = hex::encode([0x99u8; 32]);
    assert!(matches!(
        broker.coordinator.settle(&swap.id, &wrong).await,
        Err(Error::InvalidPreimage)
    ));

    // State unchanged.
    let unchanged = broker.store.get(&swap.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, SwapStatus::Accepted);
    assert!(unchanged.preimage.is_none());
}

#[tokio::test]
async fn funding_failure_cancels_the_swap() {
    let broker = broker();
    let swap = broker
        .coordinator
        .create(&customer_pubkey(), 200_000, &payment_hash())
        .await
        .unwrap();

    broker.lightning.set_invoice_state(InvoiceState::Accepted);
    broker.lightning.set_send_txid(None);

    let canceled = broker.coordinator.lookup(&swap.id).await.unwrap();
    assert_eq!(canceled.status, SwapStatus::Canceled);
    assert!(canceled.funding_txid.is_none());
    assert_eq!(
        broker.lightning.canceled_invoices.lock().unwrap().as_slice(),
        &[payment_hash()]
    );

    // The canceled record stays pollable on its short TTL.
    let polled = broker.coordinator.lookup(&swap.id).await.unwrap();
    assert_eq!(polled.status, SwapStatus::Canceled);
    assert!(broker.store.get_accepted(&swap.id).await.unwrap().is_none());
}

#[tokio::test]
async fn change_at_other_index_flips_the_vout_policy() {
    let broker = broker();
    let swap = broker
        .coordinator
        .create(&customer_pubkey(), 200_000, &payment_hash())
        .await
        .unwrap();

    broker.lightning.set_invoice_state(InvoiceState::Accepted);
    broker.lightning.set_change_index(1);

    let funded = broker.coordinator.lookup(&swap.id).await.unwrap();
    assert_eq!(funded.funding_vout, Some(0));
}

#[tokio::test]
async fn insufficient_liquidity_creates_no_invoice() {
    let broker = broker();
    broker.lightning.set_balance(100_000, 0);

    let result = broker
        .coordinator
        .create(&customer_pubkey(), 200_000, &payment_hash())
        .await;
    assert!(matches!(result, Err(Error::InsufficientLiquidity)));
    assert_eq!(broker.lightning.created_invoice_count(), 0);
}

#[tokio::test]
async fn reserved_balance_reduces_liquidity() {
    let broker = broker();
    // 200_000 + 141 > 250_000 - 50_000
    broker.lightning.set_balance(250_000, 50_000);

    let result = broker
        .coordinator
        .create(&customer_pubkey(), 200_000, &payment_hash())
        .await;
    assert!(matches!(result, Err(Error::InsufficientLiquidity)));
}

#[tokio::test]
async fn missing_feerate_fails_fee_estimation() {
    let broker = broker();
    broker.lightning.set_feerate(0);

    let result = broker
        .coordinator
        .create(&customer_pubkey(), 200_000, &payment_hash())
        .await;
    assert!(matches!(result, Err(Error::FeeEstimationUnavailable)));
}

#[tokio::test]
async fn amount_and_input_boundaries() {
    let broker = broker();
    let pubkey = customer_pubkey();
    let hash = payment_hash();

    assert!(matches!(
        broker.coordinator.create(&pubkey, 565, &hash).await,
        Err(Error::BelowDust)
    ));
    assert!(matches!(
        broker.coordinator.create(&pubkey, 566, &hash).await,
        Err(Error::BelowMinimum)
    ));
    assert!(matches!(
        broker.coordinator.create(&pubkey, 99_999, &hash).await,
        Err(Error::BelowMinimum)
    ));
    assert!(matches!(
        broker.coordinator.create(&pubkey, 100_000_001, &hash).await,
        Err(Error::AboveMaximum)
    ));

    // Both ends of the allowed range pass.
    let at_min = broker.coordinator.create(&pubkey, 100_000, &hash).await.unwrap();
    assert_eq!(at_min.status, SwapStatus::Pending);
    let at_max = broker
        .coordinator
        .create(&pubkey, 100_000_000, &hash)
        .await
        .unwrap();
    assert_eq!(at_max.status, SwapStatus::Pending);

    // Malformed inputs.
    assert!(matches!(
        broker.coordinator.create(&pubkey[..63], 200_000, &hash).await,
        Err(Error::InvalidPubkey)
    ));
    assert!(matches!(
        broker.coordinator.create(&pubkey, 200_000, &hash[..63]).await,
        Err(Error::InvalidPaymentHash)
    ));
    let long_hash = format!("{}a", hash);
    assert!(matches!(
        broker.coordinator.create(&pubkey, 200_000, &long_hash).await,
        Err(Error::InvalidPaymentHash)
    ));
}

#[tokio::test]
async fn lookup_of_unknown_swap_fails() {
    let broker = broker();
    assert!(matches!(
        broker.coordinator.lookup("deadbeef").await,
        Err(Error::SwapNotFound(_))
    ));
}

#[tokio::test]
async fn watcher_discards_non_sweeps() {
    let broker = broker();
    let swap = broker
        .coordinator
        .create(&customer_pubkey(), 200_000, &payment_hash())
        .await
        .unwrap();
    broker.lightning.set_invoice_state(InvoiceState::Accepted);
    let swap = broker.coordinator.lookup(&swap.id).await.unwrap();

    // Two inputs.
    let two_inputs = DecodedTransaction {
        txid: "ee".repeat(32),
        vin: vec![
            DecodedVin {
                txid: swap.funding_txid.clone(),
                vout: swap.funding_vout,
                ..Default::default()
            },
            DecodedVin::default(),
        ],
    };
    broker
        .watcher
        .handle_raw_tx(&serde_json::to_vec(&two_inputs).unwrap())
        .await
        .unwrap();

    // Coinbase.
    let coinbase = DecodedTransaction {
        txid: "ee".repeat(32),
        vin: vec![DecodedVin {
            coinbase: Some("04ffff001d".to_string()),
            ..Default::default()
        }],
    };
    broker
        .watcher
        .handle_raw_tx(&serde_json::to_vec(&coinbase).unwrap())
        .await
        .unwrap();

    // Unknown outpoint.
    let unknown = DecodedTransaction {
        txid: "ee".repeat(32),
        vin: vec![DecodedVin {
            txid: Some("ab".repeat(32)),
            vout: Some(0),
            txinwitness: vec!["aa".into(), "bb".into(), hex::encode(preimage()), "01".into(), "cc".into()],
            ..Default::default()
        }],
    };
    broker
        .watcher
        .handle_raw_tx(&serde_json::to_vec(&unknown).unwrap())
        .await
        .unwrap();

    // Right outpoint, wrong witness arity.
    let mut short_witness = sweep_message(&swap, &preimage());
    let mut decoded: DecodedTransaction = serde_json::from_slice(&short_witness).unwrap();
    decoded.vin[0].txinwitness.pop();
    short_witness = serde_json::to_vec(&decoded).unwrap();
    broker.watcher.handle_raw_tx(&short_witness).await.unwrap();

    // Right outpoint, preimage that does not match the payment hash.
    let wrong_preimage = sweep_message(&swap, &[0x99u8; 32]);
    broker.watcher.handle_raw_tx(&wrong_preimage).await.unwrap();

    // Nothing settled, swap still accepted.
    let unchanged = broker.store.get(&swap.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, SwapStatus::Accepted);
    assert!(broker.lightning.settled_preimages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn watcher_and_manual_settle_race_safely() {
    let broker = broker();
    let swap = broker
        .coordinator
        .create(&customer_pubkey(), 200_000, &payment_hash())
        .await
        .unwrap();
    broker.lightning.set_invoice_state(InvoiceState::Accepted);
    let swap = broker.coordinator.lookup(&swap.id).await.unwrap();

    // Manual settle wins the race...
    broker
        .coordinator
        .settle(&swap.id, &hex::encode(preimage()))
        .await
        .unwrap();

    // ...and the watcher's late observation is a harmless no-op.
    broker
        .watcher
        .handle_raw_tx(&sweep_message(&swap, &preimage()))
        .await
        .unwrap();

    let settled = broker.store.get(&swap.id).await.unwrap().unwrap();
    assert_eq!(settled.status, SwapStatus::Settled);
    assert_eq!(broker.lightning.settled_preimages.lock().unwrap().len(), 1);
}
