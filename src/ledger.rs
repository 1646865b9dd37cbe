//! Cached view of the payment contract's per-user ledger.
//!
//! Reads go through the primary RPC and fail over to the fallback; cached
//! entries are invalidated by the contract's balance/lock events delivered
//! over the websocket RPC. The batcher never calls balance-mutating
//! methods — writes happen only through `createNewTask`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types_eth::Filter;
use alloy_sol_types::SolEvent;
use dashmap::DashMap;
use futures_util::StreamExt;
use rand::Rng;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::contracts::{AlignedServiceManager, BatcherPaymentService};
use crate::error::BatcherError;
use crate::storage::{BatchLog, BatchState};
use crate::verifier::DisabledVerifiers;

const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RPC_ATTEMPTS: u32 = 4;
const BACKOFF_BASE_MS: u64 = 250;
const BLOCK_POLL_INTERVAL: Duration = Duration::from_secs(5);
const EVENT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserLedger {
    pub balance: U256,
    pub nonce: u64,
    pub unlock_block: u64,
}

pub struct FeeLedgerClient {
    primary: DynProvider,
    fallback: Option<DynProvider>,
    ws_urls: Vec<String>,
    payment_service: Address,
    service_manager: Address,
    cache: DashMap<Address, UserLedger>,
    latches: DashMap<Address, Arc<Mutex<()>>>,
    degraded: AtomicBool,
    latest_block: AtomicU64,
}

impl FeeLedgerClient {
    pub async fn connect(
        rpc_url: &str,
        rpc_url_fallback: Option<&str>,
        ws_url: &str,
        ws_url_fallback: Option<&str>,
        payment_service: Address,
        service_manager: Address,
    ) -> Result<Self, BatcherError> {
        let primary = ProviderBuilder::new()
            .connect(rpc_url)
            .await
            .map_err(|e| BatcherError::Rpc(format!("primary rpc: {e}")))?
            .erased();
        let fallback = match rpc_url_fallback {
            Some(url) => Some(
                ProviderBuilder::new()
                    .connect(url)
                    .await
                    .map_err(|e| BatcherError::Rpc(format!("fallback rpc: {e}")))?
                    .erased(),
            ),
            None => None,
        };
        let mut ws_urls = vec![ws_url.to_string()];
        if let Some(url) = ws_url_fallback {
            ws_urls.push(url.to_string());
        }
        Ok(Self {
            primary,
            fallback,
            ws_urls,
            payment_service,
            service_manager,
            cache: DashMap::new(),
            latches: DashMap::new(),
            degraded: AtomicBool::new(false),
            latest_block: AtomicU64::new(0),
        })
    }

    /// Per-submitter latch. Balance checks and nonce reservations for one
    /// submitter run under this lock so they are atomic per account.
    pub async fn latch(&self, account: Address) -> OwnedMutexGuard<()> {
        let lock = {
            let entry = self
                .latches
                .entry(account)
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(entry.value())
        };
        lock.lock_owned().await
    }

    pub fn invalidate(&self, account: Address) {
        if self.cache.remove(&account).is_some() {
            debug!(%account, "ledger cache invalidated");
        }
    }

    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn providers(&self) -> impl Iterator<Item = &DynProvider> {
        std::iter::once(&self.primary).chain(self.fallback.as_ref())
    }

    /// Returns the cached ledger entry for `account`, fetching from chain on
    /// a miss.
    pub async fn get(&self, account: Address) -> Result<UserLedger, BatcherError> {
        if let Some(cached) = self.cache.get(&account) {
            return Ok(*cached.value());
        }
        let ledger = self.fetch_ledger(account).await?;
        self.cache.insert(account, ledger);
        Ok(ledger)
    }

    /// Forces a fresh on-chain read, refreshing the cache. Used at seal time
    /// when the cached view is not good enough.
    pub async fn get_fresh(&self, account: Address) -> Result<UserLedger, BatcherError> {
        let ledger = self.fetch_ledger(account).await?;
        self.cache.insert(account, ledger);
        Ok(ledger)
    }

    async fn fetch_ledger(&self, account: Address) -> Result<UserLedger, BatcherError> {
        self.with_failover("user ledger", |provider| async move {
            let contract = BatcherPaymentService::new(self.payment_service, provider);
            let balance =
                tokio::time::timeout(RPC_CALL_TIMEOUT, contract.user_balances(account).call())
                    .await
                    .map_err(|_| "user_balances timed out".to_string())?
                    .map_err(|e| e.to_string())?;
            let nonce =
                tokio::time::timeout(RPC_CALL_TIMEOUT, contract.user_nonces(account).call())
                    .await
                    .map_err(|_| "user_nonces timed out".to_string())?
                    .map_err(|e| e.to_string())?;
            let unlock_block =
                tokio::time::timeout(RPC_CALL_TIMEOUT, contract.user_unlock_block(account).call())
                    .await
                    .map_err(|_| "user_unlock_block timed out".to_string())?
                    .map_err(|e| e.to_string())?;
            Ok(UserLedger {
                balance,
                nonce: nonce.to::<u64>(),
                unlock_block: unlock_block.to::<u64>(),
            })
        })
        .await
    }

    pub async fn gas_price(&self) -> Result<U256, BatcherError> {
        self.with_failover("gas price", |provider| async move {
            tokio::time::timeout(RPC_CALL_TIMEOUT, provider.get_gas_price())
                .await
                .map_err(|_| "eth_gasPrice timed out".to_string())?
                .map(U256::from)
                .map_err(|e| e.to_string())
        })
        .await
    }

    pub async fn is_verifier_disabled(&self, verifier_idx: u8) -> Result<bool, BatcherError> {
        self.with_failover("verifier bitmap", |provider| async move {
            let contract = AlignedServiceManager::new(self.service_manager, provider);
            tokio::time::timeout(
                RPC_CALL_TIMEOUT,
                contract.isVerifierDisabled(verifier_idx).call(),
            )
            .await
            .map_err(|_| "isVerifierDisabled timed out".to_string())?
            .map_err(|e| e.to_string())
        })
        .await
    }

    /// Last block number observed by the block watcher; fetched on demand
    /// before the watcher has ticked.
    pub async fn latest_block(&self) -> Result<u64, BatcherError> {
        let cached = self.latest_block.load(Ordering::Relaxed);
        if cached != 0 {
            return Ok(cached);
        }
        let block = self
            .with_failover("block number", |provider| async move {
                tokio::time::timeout(RPC_CALL_TIMEOUT, provider.get_block_number())
                    .await
                    .map_err(|_| "eth_blockNumber timed out".to_string())?
                    .map_err(|e| e.to_string())
            })
            .await?;
        self.latest_block.store(block, Ordering::Relaxed);
        Ok(block)
    }

    /// Jittered-backoff failover across primary and fallback providers.
    /// After the attempt ceiling the client reports degraded mode.
    async fn with_failover<T, F, Fut>(&self, what: &str, call: F) -> Result<T, BatcherError>
    where
        F: Fn(DynProvider) -> Fut,
        Fut: std::future::Future<Output = Result<T, String>>,
    {
        let mut last_err = String::new();
        for attempt in 0..MAX_RPC_ATTEMPTS {
            for (i, provider) in self.providers().enumerate() {
                match call(provider.clone()).await {
                    Ok(value) => {
                        self.degraded.store(false, Ordering::Relaxed);
                        return Ok(value);
                    }
                    Err(e) => {
                        warn!(what, attempt, provider = i, error = %e, "rpc call failed");
                        last_err = e;
                    }
                }
            }
            if attempt + 1 < MAX_RPC_ATTEMPTS {
                let jitter = rand::thread_rng().gen_range(0..BACKOFF_BASE_MS);
                let backoff = BACKOFF_BASE_MS * 2u64.pow(attempt) + jitter;
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }
        self.degraded.store(true, Ordering::Relaxed);
        Err(BatcherError::Rpc(format!("{what}: {last_err}")))
    }

    /// Polls the block number to drive the finalizer's block-interval
    /// trigger.
    pub fn spawn_block_watcher(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(BLOCK_POLL_INTERVAL);
            loop {
                interval.tick().await;
                for provider in client.providers() {
                    match provider.get_block_number().await {
                        Ok(block) => {
                            client.latest_block.store(block, Ordering::Relaxed);
                            break;
                        }
                        Err(e) => debug!(error = %e, "block watcher poll failed"),
                    }
                }
            }
        });
    }

    /// Subscribes to payment-service and service-manager events over the
    /// websocket RPC, reconnecting with the fallback endpoint on failure.
    pub fn spawn_event_listener(
        self: &Arc<Self>,
        disabled: Arc<DisabledVerifiers>,
        batch_log: Arc<BatchLog>,
    ) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ws_idx = 0usize;
            loop {
                let url = &client.ws_urls[ws_idx % client.ws_urls.len()];
                match client.listen_once(url, &disabled, &batch_log).await {
                    Ok(()) => info!(url, "event subscription closed, reconnecting"),
                    Err(e) => warn!(url, error = %e, "event subscription failed"),
                }
                ws_idx += 1;
                tokio::time::sleep(EVENT_RECONNECT_BACKOFF).await;
            }
        });
    }

    async fn listen_once(
        &self,
        ws_url: &str,
        disabled: &DisabledVerifiers,
        batch_log: &BatchLog,
    ) -> Result<(), BatcherError> {
        let provider = ProviderBuilder::new()
            .connect(ws_url)
            .await
            .map_err(|e| BatcherError::Rpc(format!("ws connect: {e}")))?;
        let filter =
            Filter::new().address(vec![self.payment_service, self.service_manager]);
        let subscription = provider
            .subscribe_logs(&filter)
            .await
            .map_err(|e| BatcherError::Rpc(format!("subscribe_logs: {e}")))?;
        info!(ws_url, "subscribed to contract events");

        let mut stream = subscription.into_stream();
        while let Some(log) = stream.next().await {
            if let Some(block) = log.block_number {
                self.latest_block.fetch_max(block, Ordering::Relaxed);
            }
            let Some(topic0) = log.topic0().copied() else {
                continue;
            };
            if topic0 == BatcherPaymentService::BatcherBalanceUpdated::SIGNATURE_HASH {
                if let Ok(ev) = log.log_decode::<BatcherPaymentService::BatcherBalanceUpdated>() {
                    self.invalidate(ev.inner.data.user);
                }
            } else if topic0 == BatcherPaymentService::BalanceLocked::SIGNATURE_HASH {
                if let Ok(ev) = log.log_decode::<BatcherPaymentService::BalanceLocked>() {
                    self.invalidate(ev.inner.data.user);
                }
            } else if topic0 == BatcherPaymentService::BalanceUnlocked::SIGNATURE_HASH {
                if let Ok(ev) = log.log_decode::<BatcherPaymentService::BalanceUnlocked>() {
                    self.invalidate(ev.inner.data.user);
                }
            } else if topic0 == BatcherPaymentService::NewBatchV3::SIGNATURE_HASH {
                if let Ok(ev) = log.log_decode::<BatcherPaymentService::NewBatchV3>() {
                    let root = ev.inner.data.batchMerkleRoot;
                    info!(merkle_root = %root, block = ?log.block_number, "batch task on-chain");
                    // A bump that lands after the submission budget gave up
                    // still counts; the record catches up here.
                    batch_log.update(root, |rec| {
                        if rec.state != BatchState::Confirmed {
                            rec.state = BatchState::Confirmed;
                        }
                    });
                }
            } else if topic0 == BatcherPaymentService::BatchVerified::SIGNATURE_HASH {
                if let Ok(ev) = log.log_decode::<BatcherPaymentService::BatchVerified>() {
                    let root = ev.inner.data.batchMerkleRoot;
                    info!(merkle_root = %root, block = ?log.block_number, "batch verified by quorum");
                    metrics::counter!("batcher_batches_verified").increment(1);
                    batch_log.update(root, |rec| rec.verified_block = log.block_number);
                }
            } else if topic0 == AlignedServiceManager::VerifierDisabled::SIGNATURE_HASH {
                if let Ok(ev) = log.log_decode::<AlignedServiceManager::VerifierDisabled>() {
                    disabled.set(ev.inner.data.verifierIdx, true);
                    info!(verifier = ev.inner.data.verifierIdx, "verifier disabled");
                }
            } else if topic0 == AlignedServiceManager::VerifierEnabled::SIGNATURE_HASH {
                if let Ok(ev) = log.log_decode::<AlignedServiceManager::VerifierEnabled>() {
                    disabled.set(ev.inner.data.verifierIdx, false);
                    info!(verifier = ev.inner.data.verifierIdx, "verifier enabled");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ledger_is_copyable_cache_value() {
        let ledger = UserLedger {
            balance: U256::from(100),
            nonce: 3,
            unlock_block: 0,
        };
        let copy = ledger;
        assert_eq!(copy, ledger);
    }
}
