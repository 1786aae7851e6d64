//! Environment configuration.

use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Broker configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the HTTP API.
    pub api_host: String,
    pub api_port: u16,

    /// Service fee in percent of the swap value.
    pub service_feerate: f64,
    pub min_amount: u64,
    pub max_amount: u64,

    /// Bitcoin node RPC URL, credentials in the userinfo.
    pub btc_url: String,
    /// The node's `zmqpubrawtx` endpoint.
    pub btc_zmq_raw_tx: String,

    /// LND REST host.
    pub lnd_host: String,
    /// Path to the admin macaroon, or the macaroon hex.
    pub lnd_macaroon: Option<String>,
    /// Path to the node TLS certificate.
    pub lnd_certificate: Option<String>,

    /// Working directory for the durable store.
    pub data_dir: PathBuf,
}

impl Config {
    /// Read configuration from the environment, creating the data directory.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: parse_var("API_PORT", 9652)?,
            service_feerate: parse_var("SWAP_SERVICE_FEERATE", 0.5)?,
            min_amount: parse_var("SWAP_MIN_AMOUNT", 100_000)?,
            max_amount: parse_var("SWAP_MAX_AMOUNT", 100_000_000)?,
            btc_url: require("BTC_URL")?,
            btc_zmq_raw_tx: require("BTC_ZMQ_RAW_TX")?,
            lnd_host: env::var("LND_HOST")
                .unwrap_or_else(|_| "https://127.0.0.1:8080".to_string()),
            lnd_macaroon: env::var("LND_MACAROON").ok(),
            lnd_certificate: env::var("LND_CERTIFICATE").ok(),
            data_dir: data_dir()?,
        })
    }
}

fn require(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("missing environment variable: {}", name)))
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|e| Error::Config(format!("bad value for {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}

fn data_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| Error::Config("no home directory".to_string()))?;
    let dir = home.join("submarine-swap").join("data");
    std::fs::create_dir_all(&dir)
        .map_err(|e| Error::Config(format!("cannot create {}: {}", dir.display(), e)))?;
    Ok(dir)
}
