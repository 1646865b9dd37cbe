use std::env;

use alloy_primitives::{Address, U256};
use alloy_signer_local::PrivateKeySigner;

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    // Server
    pub host: String,
    pub port: u16,
    pub max_inflight_per_connection: usize,

    // Ethereum
    pub eth_rpc_url: String,
    pub eth_rpc_url_fallback: Option<String>,
    pub eth_ws_url: String,
    pub eth_ws_url_fallback: Option<String>,
    pub payment_service_address: Address,
    pub service_manager_address: Address,
    pub batcher_signer: PrivateKeySigner,

    // Fees
    pub aggregator_fee_percentage_multiplier: u64,
    pub aggregator_gas_cost: u64,
    pub respond_to_task_fee_multiplier: u64,
    pub batch_cost_margin: U256,

    // Finalization
    pub block_interval: u64,
    pub batch_size_interval: usize,
    pub max_batch_proof_qty: usize,
    pub max_batch_byte_size: usize,
    pub max_proof_size: usize,

    // Submission
    pub transaction_wait_timeout_secs: u64,
    pub gas_base_bump_percentage: u64,
    pub gas_bump_incremental_percentage: u64,
    pub gas_bump_percentage_limit: u64,
    pub time_to_wait_before_bump_secs: u64,
    pub max_batch_retries: u32,

    // Pre-verification
    pub pre_verification_is_enabled: bool,
    pub verification_timeout_secs: u64,
    pub verifier_workers: usize,

    // Non-paying policy
    pub non_paying_address: Option<Address>,
    pub non_paying_replacement_signer: Option<PrivateKeySigner>,

    // Object storage
    pub storage_backend: StorageBackend,
    pub s3_bucket_name: String,
    pub s3_region: String,
    pub s3_endpoint: Option<String>,
    pub download_base_url: String,
    pub upload_timeout_secs: u64,

    // Observability
    pub metrics_port: Option<u16>,
    pub telemetry_ip_port_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    S3,
    Memory,
}

impl BatcherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let eth_rpc_url = require_env("ETH_RPC_URL")?;
        validate_http_url(&eth_rpc_url, "ETH_RPC_URL")?;
        let eth_rpc_url_fallback = optional_env("ETH_RPC_URL_FALLBACK");
        if let Some(url) = &eth_rpc_url_fallback {
            validate_http_url(url, "ETH_RPC_URL_FALLBACK")?;
        }
        let eth_ws_url = require_env("ETH_WS_URL")?;
        validate_ws_url(&eth_ws_url, "ETH_WS_URL")?;
        let eth_ws_url_fallback = optional_env("ETH_WS_URL_FALLBACK");
        if let Some(url) = &eth_ws_url_fallback {
            validate_ws_url(url, "ETH_WS_URL_FALLBACK")?;
        }

        let payment_service_address = parse_address(&require_env("PAYMENT_SERVICE_ADDRESS")?, "PAYMENT_SERVICE_ADDRESS")?;
        let service_manager_address = parse_address(&require_env("SERVICE_MANAGER_ADDRESS")?, "SERVICE_MANAGER_ADDRESS")?;
        let batcher_signer = parse_signer(&require_env("BATCHER_PRIVATE_KEY")?, "BATCHER_PRIVATE_KEY")?;

        let non_paying_address = optional_env("NON_PAYING_ADDRESS")
            .map(|v| parse_address(&v, "NON_PAYING_ADDRESS"))
            .transpose()?;
        let non_paying_replacement_signer = optional_env("NON_PAYING_REPLACEMENT_PRIVATE_KEY")
            .map(|v| parse_signer(&v, "NON_PAYING_REPLACEMENT_PRIVATE_KEY"))
            .transpose()?;
        if non_paying_address.is_some() != non_paying_replacement_signer.is_some() {
            return Err(ConfigError::Invalid(
                "NON_PAYING_ADDRESS".into(),
                "address and replacement key must be set together".into(),
            ));
        }

        let gas_base_bump_percentage: u64 = parse_env_or("GAS_BASE_BUMP_PERCENTAGE", 5)?;
        let gas_bump_incremental_percentage: u64 =
            parse_env_or("GAS_BUMP_INCREMENTAL_PERCENTAGE", 5)?;
        let gas_bump_percentage_limit: u64 = parse_env_or("GAS_BUMP_PERCENTAGE_LIMIT", 50)?;
        if gas_bump_percentage_limit < gas_base_bump_percentage {
            return Err(ConfigError::Invalid(
                "GAS_BUMP_PERCENTAGE_LIMIT".into(),
                "must be >= GAS_BASE_BUMP_PERCENTAGE".into(),
            ));
        }

        let max_proof_size: usize = parse_env_or("MAX_PROOF_SIZE", 64 * 1024 * 1024)?;
        let max_batch_byte_size: usize = parse_env_or("MAX_BATCH_BYTE_SIZE", 256 * 1024 * 1024)?;
        if max_proof_size > max_batch_byte_size {
            return Err(ConfigError::Invalid(
                "MAX_PROOF_SIZE".into(),
                "must not exceed MAX_BATCH_BYTE_SIZE".into(),
            ));
        }
        let batch_size_interval: usize = parse_env_or("BATCH_SIZE_INTERVAL", 8 * 1024 * 1024)?;
        let max_batch_proof_qty: usize = parse_env_or("MAX_BATCH_PROOF_QTY", 256)?;
        if max_batch_proof_qty == 0 {
            return Err(ConfigError::Invalid(
                "MAX_BATCH_PROOF_QTY".into(),
                "must be > 0".into(),
            ));
        }
        let block_interval: u64 = parse_env_or("BLOCK_INTERVAL", 20)?;
        if block_interval == 0 {
            return Err(ConfigError::Invalid(
                "BLOCK_INTERVAL".into(),
                "must be > 0".into(),
            ));
        }

        let storage_backend = match optional_env("STORAGE_BACKEND").as_deref() {
            None | Some("s3") => StorageBackend::S3,
            Some("memory") => StorageBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid(
                    "STORAGE_BACKEND".into(),
                    format!("unknown backend '{other}'"),
                ))
            }
        };
        let s3_bucket_name = match storage_backend {
            StorageBackend::S3 => require_env("S3_BUCKET_NAME")?,
            StorageBackend::Memory => optional_env("S3_BUCKET_NAME").unwrap_or_default(),
        };
        let download_base_url = match storage_backend {
            StorageBackend::S3 => require_env("DOWNLOAD_BASE_URL")?,
            StorageBackend::Memory => optional_env("DOWNLOAD_BASE_URL").unwrap_or_default(),
        };

        let verifier_workers: usize = parse_env_or(
            "VERIFIER_WORKERS",
            std::thread::available_parallelism().map_or(4, usize::from),
        )?;
        if verifier_workers == 0 {
            return Err(ConfigError::Invalid(
                "VERIFIER_WORKERS".into(),
                "must be > 0".into(),
            ));
        }

        Ok(Self {
            host: env::var("BATCHER_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parse_env_or("BATCHER_PORT", 8080)?,
            max_inflight_per_connection: parse_env_or("MAX_INFLIGHT_PER_CONNECTION", 16)?,
            eth_rpc_url,
            eth_rpc_url_fallback,
            eth_ws_url,
            eth_ws_url_fallback,
            payment_service_address,
            service_manager_address,
            batcher_signer,
            aggregator_fee_percentage_multiplier: parse_env_or(
                "AGGREGATOR_FEE_PERCENTAGE_MULTIPLIER",
                125,
            )?,
            aggregator_gas_cost: parse_env_or("AGGREGATOR_GAS_COST", 400_000)?,
            respond_to_task_fee_multiplier: parse_env_or("RESPOND_TO_TASK_FEE_MULTIPLIER", 5)?,
            batch_cost_margin: U256::from(parse_env_or::<u128>("BATCH_COST_MARGIN_WEI", 0)?),
            block_interval,
            batch_size_interval,
            max_batch_proof_qty,
            max_batch_byte_size,
            max_proof_size,
            transaction_wait_timeout_secs: parse_env_or("TRANSACTION_WAIT_TIMEOUT", 300)?,
            gas_base_bump_percentage,
            gas_bump_incremental_percentage,
            gas_bump_percentage_limit,
            time_to_wait_before_bump_secs: parse_env_or("TIME_TO_WAIT_BEFORE_BUMP", 36)?,
            max_batch_retries: parse_env_or("MAX_BATCH_RETRIES", 2)?,
            pre_verification_is_enabled: parse_env_or("PRE_VERIFICATION_IS_ENABLED", true)?,
            verification_timeout_secs: parse_env_or("VERIFICATION_TIMEOUT", 30)?,
            verifier_workers,
            non_paying_address,
            non_paying_replacement_signer,
            storage_backend,
            s3_bucket_name,
            s3_region: env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into()),
            s3_endpoint: optional_env("S3_ENDPOINT"),
            download_base_url,
            upload_timeout_secs: parse_env_or("UPLOAD_TIMEOUT", 60)?,
            metrics_port: optional_env("METRICS_PORT")
                .map(|v| {
                    v.parse::<u16>().map_err(|_| {
                        ConfigError::Invalid("METRICS_PORT".into(), format!("could not parse '{v}'"))
                    })
                })
                .transpose()?,
            telemetry_ip_port_address: optional_env("TELEMETRY_IP_PORT_ADDRESS"),
        })
    }
}

fn require_env(name: &str) -> Result<String, ConfigError> {
    env::var(name)
        .map_err(|_| ConfigError::Missing(name.into()))
        .and_then(|v| {
            if v.is_empty() {
                Err(ConfigError::Missing(name.into()))
            } else {
                Ok(v)
            }
        })
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.is_empty())
}

fn parse_env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::Invalid(name.into(), format!("could not parse '{v}'"))),
        _ => Ok(default),
    }
}

fn parse_address(value: &str, name: &str) -> Result<Address, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(name.into(), "must be a 0x-prefixed address".into()))
}

fn parse_signer(value: &str, name: &str) -> Result<PrivateKeySigner, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(name.into(), "must be a 32-byte hex private key".into()))
}

fn validate_http_url(url: &str, name: &str) -> Result<(), ConfigError> {
    let lower = url.to_lowercase();
    if lower.starts_with("https://") {
        return Ok(());
    }
    // http:// only for localhost/dev
    if lower.starts_with("http://") {
        let host = lower.trim_start_matches("http://");
        if host.starts_with("localhost") || host.starts_with("127.0.0.1") || host.starts_with("[::1]")
        {
            return Ok(());
        }
        return Err(ConfigError::Invalid(
            name.into(),
            "must use HTTPS for non-localhost URLs".into(),
        ));
    }
    Err(ConfigError::Invalid(
        name.into(),
        "must start with https:// (or http:// for localhost)".into(),
    ))
}

fn validate_ws_url(url: &str, name: &str) -> Result<(), ConfigError> {
    let lower = url.to_lowercase();
    if lower.starts_with("wss://") {
        return Ok(());
    }
    if lower.starts_with("ws://") {
        let host = lower.trim_start_matches("ws://");
        if host.starts_with("localhost") || host.starts_with("127.0.0.1") || host.starts_with("[::1]")
        {
            return Ok(());
        }
        return Err(ConfigError::Invalid(
            name.into(),
            "must use WSS for non-localhost URLs".into(),
        ));
    }
    Err(ConfigError::Invalid(
        name.into(),
        "must start with wss:// (or ws:// for localhost)".into(),
    ))
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(String),
    Invalid(String, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(name) => write!(f, "missing required env var: {name}"),
            ConfigError::Invalid(name, reason) => {
                write!(f, "invalid env var {name}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation_requires_tls_off_localhost() {
        assert!(validate_http_url("https://mainnet.example", "X").is_ok());
        assert!(validate_http_url("http://localhost:8545", "X").is_ok());
        assert!(validate_http_url("http://10.0.0.1:8545", "X").is_err());
        assert!(validate_ws_url("wss://mainnet.example", "X").is_ok());
        assert!(validate_ws_url("ws://127.0.0.1:8546", "X").is_ok());
        assert!(validate_ws_url("ws://10.0.0.1:8546", "X").is_err());
        assert!(validate_ws_url("https://nope", "X").is_err());
    }
}
