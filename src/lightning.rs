//! Lightning node façade.
//!
//! [`LightningNode`] is the interface the coordinator and watcher depend on;
//! [`LndRestClient`] implements it against LND's REST API. Hold-invoice
//! settlement is driven entirely by the broker: the invoice locks when the
//! customer pays and settles only when we present the preimage.

use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Invoice lifecycle as reported by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InvoiceState {
    Open,
    Accepted,
    Settled,
    Canceled,
}

/// A freshly created hold invoice.
#[derive(Debug, Clone)]
pub struct HoldInvoice {
    pub payment_request: String,
}

/// On-chain wallet balance split.
#[derive(Debug, Clone, Copy)]
pub struct WalletBalance {
    pub total_balance: u64,
    pub reserved_balance_anchor_chan: u64,
}

impl WalletBalance {
    /// Liquidity actually spendable for funding swaps.
    pub fn effective(&self) -> u64 {
        self.total_balance
            .saturating_sub(self.reserved_balance_anchor_chan)
    }
}

/// Fee estimate for an on-chain send.
#[derive(Debug, Clone, Copy)]
pub struct FeeEstimate {
    pub fee_sat: u64,
    pub feerate_sat_per_byte: u64,
}

/// A wallet UTXO, reduced to what the funding transition needs.
#[derive(Debug, Clone)]
pub struct Utxo {
    pub txid: String,
    pub output_index: u32,
}

/// Operations the broker needs from its Lightning node.
#[async_trait]
pub trait LightningNode: Send + Sync {
    /// Create a hold invoice locked to `payment_hash` (hex).
    async fn create_hold_invoice(
        &self,
        payment_hash: &str,
        value: u64,
        expiry: u64,
    ) -> Result<HoldInvoice>;

    /// Current state of the invoice with `payment_hash` (hex).
    async fn lookup_invoice(&self, payment_hash: &str) -> Result<InvoiceState>;

    /// Settle the held invoice whose hash matches `preimage`.
    ///
    /// Returns `true` on the node's empty success response, `false` on any
    /// non-empty response (e.g. the invoice was already settled).
    async fn settle_invoice(&self, preimage: &[u8]) -> Result<bool>;

    /// Cancel the held invoice with `payment_hash` (hex).
    async fn cancel_invoice(&self, payment_hash: &str) -> Result<()>;

    /// Broadcast an on-chain send; `None` when the node reports no txid.
    async fn send_coins(&self, address: &str, value: u64) -> Result<Option<String>>;

    /// Wallet UTXOs with at least `min_confs` confirmations.
    async fn list_unspent(&self, min_confs: u32) -> Result<Vec<Utxo>>;

    /// On-chain wallet balance.
    async fn wallet_balance(&self) -> Result<WalletBalance>;

    /// Estimate the fee to send `value` sat to `address`.
    async fn estimate_fee(&self, address: &str, value: u64, target_conf: u32)
    -> Result<FeeEstimate>;
}

// Wire types. LND's REST surface encodes int64 fields as JSON strings and
// byte fields as base64.

#[derive(Serialize)]
struct HoldInvoiceRequest {
    hash: String,
    value: String,
    expiry: String,
}

#[derive(Deserialize)]
struct HoldInvoiceResponse {
    #[serde(default)]
    payment_request: Option<String>,
}

#[derive(Deserialize)]
struct LookupInvoiceResponse {
    state: InvoiceState,
}

#[derive(Serialize)]
struct SettleInvoiceRequest {
    preimage: String,
}

#[derive(Serialize)]
struct CancelInvoiceRequest {
    payment_hash: String,
}

#[derive(Serialize)]
struct SendCoinsRequest {
    addr: String,
    amount: String,
}

#[derive(Deserialize)]
struct SendCoinsResponse {
    #[serde(default)]
    txid: Option<String>,
}

#[derive(Deserialize)]
struct ListUnspentResponse {
    #[serde(default)]
    utxos: Vec<RpcUtxo>,
}

#[derive(Deserialize)]
struct RpcUtxo {
    outpoint: RpcOutPoint,
}

#[derive(Deserialize)]
struct RpcOutPoint {
    txid_str: String,
    #[serde(default)]
    output_index: u32,
}

#[derive(Deserialize)]
struct WalletBalanceResponse {
    #[serde(default)]
    total_balance: String,
    #[serde(default)]
    reserved_balance_anchor_chan: String,
}

#[derive(Deserialize)]
struct EstimateFeeResponse {
    #[serde(default)]
    fee_sat: Option<String>,
    #[serde(default)]
    feerate_sat_per_byte: Option<String>,
}

#[derive(Deserialize)]
struct LndError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn parse_sat(field: &str, value: &str) -> Result<u64> {
    if value.is_empty() {
        return Ok(0);
    }
    value
        .parse::<u64>()
        .map_err(|e| Error::Parse(format!("bad {} from node: {}", field, e)))
}

/// LND REST API client.
#[derive(Debug, Clone)]
pub struct LndRestClient {
    base_url: String,
    client: reqwest::Client,
}

impl LndRestClient {
    /// Create a client for the node at `base_url`.
    ///
    /// `macaroon` is a path to the admin macaroon or an already-hex-encoded
    /// macaroon; `certificate` a path to the node's TLS certificate. Without
    /// a certificate the self-signed cert is accepted as-is.
    pub fn new(
        base_url: impl Into<String>,
        macaroon: Option<String>,
        certificate: Option<String>,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(macaroon) = macaroon {
            let macaroon_hex = if Path::new(&macaroon).exists() {
                let bytes = std::fs::read(&macaroon)
                    .map_err(|e| Error::Config(format!("cannot read macaroon: {}", e)))?;
                hex::encode(bytes)
            } else {
                macaroon
            };
            headers.insert(
                "Grpc-Metadata-macaroon",
                macaroon_hex
                    .parse()
                    .map_err(|_| Error::Config("macaroon is not a valid header value".into()))?,
            );
        }

        let mut builder = reqwest::Client::builder().default_headers(headers);
        builder = match certificate {
            Some(path) => {
                let pem = std::fs::read(&path)
                    .map_err(|e| Error::Config(format!("cannot read tls certificate: {}", e)))?;
                let cert = reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| Error::Config(format!("bad tls certificate: {}", e)))?;
                builder.add_root_certificate(cert)
            }
            None => builder.danger_accept_invalid_certs(true),
        };

        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("cannot build http client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::LightningRpc(format!("failed to reach {}: {}", url, e)))?;
        Self::decode_response(url, response).await
    }

    async fn post_json<T: serde::de::DeserializeOwned, R: Serialize>(
        &self,
        url: &str,
        body: &R,
    ) -> Result<T> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::LightningRpc(format!("failed to reach {}: {}", url, e)))?;
        Self::decode_response(url, response).await
    }

    async fn decode_response<T: serde::de::DeserializeOwned>(
        url: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        if !response.status().is_success() {
            let error: LndError = response.json().await.unwrap_or(LndError {
                message: None,
                error: None,
            });
            let message = error
                .message
                .or(error.error)
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(Error::LightningRpc(message));
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::LightningRpc(format!("failed to read response: {}", e)))?;

        log::debug!("lnd {} response: {}", url, text);

        serde_json::from_str(&text)
            .map_err(|e| Error::Parse(format!("failed to parse node response: {}", e)))
    }

    fn hash_base64(payment_hash: &str) -> Result<String> {
        let bytes = hex::decode(payment_hash)
            .map_err(|e| Error::Parse(format!("bad payment hash: {}", e)))?;
        Ok(BASE64.encode(bytes))
    }
}

#[async_trait]
impl LightningNode for LndRestClient {
    async fn create_hold_invoice(
        &self,
        payment_hash: &str,
        value: u64,
        expiry: u64,
    ) -> Result<HoldInvoice> {
        let url = format!("{}/v2/invoices/hodl", self.base_url);
        let request = HoldInvoiceRequest {
            hash: Self::hash_base64(payment_hash)?,
            value: value.to_string(),
            expiry: expiry.to_string(),
        };
        let response: HoldInvoiceResponse = self.post_json(&url, &request).await?;
        match response.payment_request {
            Some(payment_request) if !payment_request.is_empty() => {
                Ok(HoldInvoice { payment_request })
            }
            _ => Err(Error::InvoiceCreation(
                "node returned no payment request".to_string(),
            )),
        }
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> Result<InvoiceState> {
        let url = format!("{}/v1/invoice/{}", self.base_url, payment_hash);
        let response: LookupInvoiceResponse = self.get_json(&url).await?;
        Ok(response.state)
    }

    async fn settle_invoice(&self, preimage: &[u8]) -> Result<bool> {
        let url = format!("{}/v2/invoices/settle", self.base_url);
        let request = SettleInvoiceRequest {
            preimage: BASE64.encode(preimage),
        };
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::LightningRpc(format!("failed to reach {}: {}", url, e)))?;

        if !response.status().is_success() {
            log::debug!("settle rejected with status {}", response.status());
            return Ok(false);
        }
        let text = response
            .text()
            .await
            .map_err(|e| Error::LightningRpc(format!("failed to read response: {}", e)))?;
        let trimmed = text.trim();
        Ok(trimmed.is_empty() || trimmed == "{}")
    }

    async fn cancel_invoice(&self, payment_hash: &str) -> Result<()> {
        let url = format!("{}/v2/invoices/cancel", self.base_url);
        let request = CancelInvoiceRequest {
            payment_hash: Self::hash_base64(payment_hash)?,
        };
        let _: serde_json::Value = self.post_json(&url, &request).await?;
        Ok(())
    }

    async fn send_coins(&self, address: &str, value: u64) -> Result<Option<String>> {
        let url = format!("{}/v1/transactions", self.base_url);
        let request = SendCoinsRequest {
            addr: address.to_string(),
            amount: value.to_string(),
        };
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::LightningRpc(format!("failed to reach {}: {}", url, e)))?;

        if !response.status().is_success() {
            log::warn!("send_coins rejected with status {}", response.status());
            return Ok(None);
        }
        let parsed: SendCoinsResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(format!("failed to parse send response: {}", e)))?;
        Ok(parsed.txid.filter(|txid| !txid.is_empty()))
    }

    async fn list_unspent(&self, min_confs: u32) -> Result<Vec<Utxo>> {
        let url = format!(
            "{}/v1/utxos?min_confs={}&max_confs={}",
            self.base_url,
            min_confs,
            i32::MAX
        );
        let response: ListUnspentResponse = self.get_json(&url).await?;
        Ok(response
            .utxos
            .into_iter()
            .map(|utxo| Utxo {
                txid: utxo.outpoint.txid_str,
                output_index: utxo.outpoint.output_index,
            })
            .collect())
    }

    async fn wallet_balance(&self) -> Result<WalletBalance> {
        let url = format!("{}/v1/balance/blockchain", self.base_url);
        let response: WalletBalanceResponse = self.get_json(&url).await?;
        Ok(WalletBalance {
            total_balance: parse_sat("total_balance", &response.total_balance)?,
            reserved_balance_anchor_chan: parse_sat(
                "reserved_balance_anchor_chan",
                &response.reserved_balance_anchor_chan,
            )?,
        })
    }

    async fn estimate_fee(
        &self,
        address: &str,
        value: u64,
        target_conf: u32,
    ) -> Result<FeeEstimate> {
        let url = format!("{}/v1/transactions/fee", self.base_url);
        let query = [
            ("target_conf".to_string(), target_conf.to_string()),
            (format!("AddrToAmount[{}]", address), value.to_string()),
        ];
        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::LightningRpc(format!("failed to reach {}: {}", url, e)))?;
        let response: EstimateFeeResponse = Self::decode_response(&url, response).await?;

        Ok(FeeEstimate {
            fee_sat: parse_sat("fee_sat", response.fee_sat.as_deref().unwrap_or(""))?,
            feerate_sat_per_byte: parse_sat(
                "feerate_sat_per_byte",
                response.feerate_sat_per_byte.as_deref().unwrap_or(""),
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_state_matches_node_strings() {
        let state: InvoiceState = serde_json::from_str("\"ACCEPTED\"").unwrap();
        assert_eq!(state, InvoiceState::Accepted);
        let state: InvoiceState = serde_json::from_str("\"OPEN\"").unwrap();
        assert_eq!(state, InvoiceState::Open);
        assert!(serde_json::from_str::<InvoiceState>("\"accepted\"").is_err());
    }

    #[test]
    fn balance_effective_subtracts_reserve() {
        let balance = WalletBalance {
            total_balance: 1_000_000,
            reserved_balance_anchor_chan: 50_000,
        };
        assert_eq!(balance.effective(), 950_000);

        let upside_down = WalletBalance {
            total_balance: 10,
            reserved_balance_anchor_chan: 20,
        };
        assert_eq!(upside_down.effective(), 0);
    }

    #[test]
    fn sat_fields_parse_with_empty_default() {
        assert_eq!(parse_sat("fee_sat", "").unwrap(), 0);
        assert_eq!(parse_sat("fee_sat", "1234").unwrap(), 1234);
        assert!(parse_sat("fee_sat", "12.5").is_err());
    }

    #[test]
    fn hold_invoice_request_encodes_hash_base64() {
        let hash = "11".repeat(32);
        let encoded = LndRestClient::hash_base64(&hash).unwrap();
        assert_eq!(encoded, BASE64.encode([0x11u8; 32]));
    }
}
