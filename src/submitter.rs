//! On-chain submission engine.
//!
//! Sends `createNewTask` with exponential gas-price bumps. The transaction
//! nonce is fixed before the first send and held constant across bumps, so
//! every retry is a replacement transaction. Distinct batches may submit
//! concurrently up to a small pool limit; the wallet nonce is serialized.

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_network::EthereumWallet;
use alloy_primitives::{Address, B256, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types_eth::{BlockNumberOrTag, Filter};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolEvent;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use crate::config::BatcherConfig;
use crate::contracts::BatcherPaymentService;
use crate::error::BatcherError;

const MAX_CONCURRENT_SUBMISSIONS: usize = 4;
const SEND_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Everything the payment service needs to anchor one batch.
#[derive(Debug, Clone)]
pub struct SealedBatch {
    pub merkle_root: B256,
    pub data_pointer: String,
    pub submitters: Vec<Address>,
    pub aggregator_fee: U256,
    pub fee_per_proof: U256,
    pub respond_to_task_fee_limit: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Task is on-chain, either via our transaction or a previously
    /// submitted duplicate root.
    Confirmed { tx_hash: Option<B256> },
    /// The contract rejected the task; resending the same batch cannot
    /// succeed.
    Rejected { reason: RevertReason },
    /// Not included within the submission budget, bump ceiling exhausted.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertReason {
    InsufficientFunds,
    InvalidQuorumThreshold,
    Other(String),
}

/// Gas bump percentage for 0-indexed attempt `i`:
/// `min(base + i × incremental, limit)`.
pub fn bump_percent(base: u64, incremental: u64, limit: u64, attempt: u32) -> u64 {
    (base + attempt as u64 * incremental).min(limit)
}

/// Number of distinct bump levels before the ceiling:
/// `ceil((limit - base) / incremental) + 1`.
pub fn max_bump_attempts(base: u64, incremental: u64, limit: u64) -> u32 {
    if incremental == 0 || limit <= base {
        return 1;
    }
    ((limit - base).div_ceil(incremental) + 1) as u32
}

fn apply_bump(fee: u128, percent: u64) -> u128 {
    fee + fee * percent as u128 / 100
}

/// Classifies a send-path error string into a terminal revert or a
/// transient failure worth retrying. The payment service surfaces custom
/// errors by name in the RPC error payload.
fn classify_revert(message: &str) -> Option<RevertReason> {
    if message.contains("BatchAlreadySubmitted") {
        // handled by the caller via the prior-event probe
        return Some(RevertReason::Other("BatchAlreadySubmitted".into()));
    }
    if message.contains("InsufficientFunds") {
        return Some(RevertReason::InsufficientFunds);
    }
    if message.contains("InvalidQuorumThreshold") {
        return Some(RevertReason::InvalidQuorumThreshold);
    }
    if message.contains("revert") || message.contains("execution reverted") {
        return Some(RevertReason::Other(message.to_string()));
    }
    None
}

pub struct SubmissionEngine {
    provider: DynProvider,
    payment_service: Address,
    wallet_address: Address,
    gas_base_bump_percentage: u64,
    gas_bump_incremental_percentage: u64,
    gas_bump_percentage_limit: u64,
    time_to_wait_before_bump: Duration,
    transaction_wait_timeout: Duration,
    /// Serializes wallet-nonce allocation across concurrent submissions.
    nonce_lock: Mutex<()>,
    permits: Semaphore,
}

impl SubmissionEngine {
    pub async fn connect(cfg: &BatcherConfig) -> Result<Arc<Self>, BatcherError> {
        let signer: PrivateKeySigner = cfg.batcher_signer.clone();
        let wallet_address = signer.address();
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect(&cfg.eth_rpc_url)
            .await
            .map_err(|e| BatcherError::Rpc(format!("submitter rpc: {e}")))?
            .erased();
        Ok(Arc::new(Self {
            provider,
            payment_service: cfg.payment_service_address,
            wallet_address,
            gas_base_bump_percentage: cfg.gas_base_bump_percentage,
            gas_bump_incremental_percentage: cfg.gas_bump_incremental_percentage,
            gas_bump_percentage_limit: cfg.gas_bump_percentage_limit,
            time_to_wait_before_bump: Duration::from_secs(cfg.time_to_wait_before_bump_secs),
            transaction_wait_timeout: Duration::from_secs(cfg.transaction_wait_timeout_secs),
            nonce_lock: Mutex::new(()),
            permits: Semaphore::new(MAX_CONCURRENT_SUBMISSIONS),
        }))
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet_address
    }

    /// Submits one sealed batch, returning how it ended. Only infrastructure
    /// failures (rpc down before the first send) surface as `Err`.
    pub async fn submit(&self, batch: &SealedBatch) -> Result<SubmitOutcome, BatcherError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BatcherError::Internal("submission pool closed".into()))?;

        let contract = BatcherPaymentService::new(self.payment_service, self.provider.clone());
        let fees = self
            .provider
            .estimate_eip1559_fees()
            .await
            .map_err(|e| BatcherError::Rpc(format!("fee estimate: {e}")))?;

        let deadline = Instant::now() + self.transaction_wait_timeout;
        let bump_ceiling = max_bump_attempts(
            self.gas_base_bump_percentage,
            self.gas_bump_incremental_percentage,
            self.gas_bump_percentage_limit,
        );

        // The wallet nonce is fixed once, before the first send, and reused
        // for every replacement.
        let mut nonce_guard = Some(self.nonce_lock.lock().await);
        let tx_nonce = self
            .provider
            .get_transaction_count(self.wallet_address)
            .pending()
            .await
            .map_err(|e| BatcherError::Rpc(format!("nonce fetch: {e}")))?;

        let mut attempt: u32 = 0;
        loop {
            let percent = bump_percent(
                self.gas_base_bump_percentage,
                self.gas_bump_incremental_percentage,
                self.gas_bump_percentage_limit,
                attempt,
            );
            let max_fee = apply_bump(fees.max_fee_per_gas, percent);
            let priority = apply_bump(fees.max_priority_fee_per_gas, percent);

            info!(
                merkle_root = %batch.merkle_root,
                attempt,
                percent,
                tx_nonce,
                "sending createNewTask"
            );
            let send_result = contract
                .createNewTask(
                    batch.merkle_root,
                    batch.data_pointer.clone(),
                    batch.submitters.clone(),
                    batch.aggregator_fee,
                    batch.fee_per_proof,
                    batch.respond_to_task_fee_limit,
                )
                .nonce(tx_nonce)
                .max_fee_per_gas(max_fee)
                .max_priority_fee_per_gas(priority)
                .send()
                .await;

            let pending = match send_result {
                Ok(pending) => pending,
                Err(e) => {
                    let message = e.to_string();
                    match classify_revert(&message) {
                        Some(RevertReason::Other(reason))
                            if reason.contains("BatchAlreadySubmitted") =>
                        {
                            info!(merkle_root = %batch.merkle_root, "root already on-chain");
                            return Ok(SubmitOutcome::Confirmed { tx_hash: None });
                        }
                        Some(reason) => {
                            warn!(merkle_root = %batch.merkle_root, ?reason, "task reverted");
                            return Ok(SubmitOutcome::Rejected { reason });
                        }
                        None => {
                            warn!(merkle_root = %batch.merkle_root, error = %message, "send failed");
                            if Instant::now() + SEND_RETRY_BACKOFF >= deadline {
                                return Ok(SubmitOutcome::TimedOut);
                            }
                            tokio::time::sleep(SEND_RETRY_BACKOFF).await;
                            continue;
                        }
                    }
                }
            };
            // The transaction is in the mempool; later batches may now
            // allocate the next wallet nonce.
            nonce_guard.take();

            let tx_hash = *pending.tx_hash();
            let wait = self
                .time_to_wait_before_bump
                .min(deadline.saturating_duration_since(Instant::now()));
            match pending.with_timeout(Some(wait)).get_receipt().await {
                Ok(receipt) => {
                    if receipt.status() {
                        info!(merkle_root = %batch.merkle_root, %tx_hash, "task included");
                        return Ok(SubmitOutcome::Confirmed {
                            tx_hash: Some(tx_hash),
                        });
                    }
                    // Included but reverted: a replacement with the same
                    // calldata cannot do better.
                    warn!(merkle_root = %batch.merkle_root, %tx_hash, "task reverted on-chain");
                    if self.prior_batch_event(batch.merkle_root).await?.is_some() {
                        return Ok(SubmitOutcome::Confirmed { tx_hash: None });
                    }
                    return Ok(SubmitOutcome::Rejected {
                        reason: RevertReason::Other("task reverted on-chain".into()),
                    });
                }
                Err(e) => {
                    warn!(
                        merkle_root = %batch.merkle_root,
                        %tx_hash,
                        attempt,
                        error = %e,
                        "not included before bump window"
                    );
                }
            }

            attempt += 1;
            if attempt >= bump_ceiling || Instant::now() >= deadline {
                warn!(merkle_root = %batch.merkle_root, attempt, "submission budget exhausted");
                return Ok(SubmitOutcome::TimedOut);
            }
        }
    }

    /// Looks for an existing `NewBatchV3` event for `root`. A duplicate-root
    /// revert means someone (possibly an earlier bump of ours) already
    /// created this task; the batch is then confirmed without resending.
    pub async fn prior_batch_event(&self, root: B256) -> Result<Option<u64>, BatcherError> {
        let filter = Filter::new()
            .address(self.payment_service)
            .event_signature(BatcherPaymentService::NewBatchV3::SIGNATURE_HASH)
            .topic1(root)
            .from_block(BlockNumberOrTag::Earliest);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| BatcherError::Rpc(format!("get_logs: {e}")))?;
        Ok(logs.first().and_then(|log| log.block_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_schedule_saturates_at_the_limit() {
        // base 5, +5 per attempt, limit 20
        assert_eq!(bump_percent(5, 5, 20, 0), 5);
        assert_eq!(bump_percent(5, 5, 20, 1), 10);
        assert_eq!(bump_percent(5, 5, 20, 3), 20);
        assert_eq!(bump_percent(5, 5, 20, 10), 20);
    }

    #[test]
    fn attempt_ceiling_matches_the_schedule() {
        // ceil((20-5)/5)+1 = 4 attempts: 5, 10, 15, 20
        assert_eq!(max_bump_attempts(5, 5, 20), 4);
        // ceil((50-5)/10)+1 = 6 attempts: 5, 15, 25, 35, 45, 50
        assert_eq!(max_bump_attempts(5, 10, 50), 6);
        assert_eq!(max_bump_attempts(5, 0, 50), 1);
        assert_eq!(max_bump_attempts(50, 10, 50), 1);
    }

    #[test]
    fn last_attempt_before_ceiling_reaches_the_limit() {
        for (base, inc, limit) in [(5u64, 5u64, 20u64), (5, 10, 50), (3, 7, 40)] {
            let attempts = max_bump_attempts(base, inc, limit);
            assert_eq!(bump_percent(base, inc, limit, attempts - 1), limit);
            if attempts >= 2 {
                assert!(bump_percent(base, inc, limit, attempts - 2) < limit);
            }
        }
    }

    #[test]
    fn bump_applies_to_both_fee_components() {
        assert_eq!(apply_bump(1_000, 0), 1_000);
        assert_eq!(apply_bump(1_000, 5), 1_050);
        assert_eq!(apply_bump(1_000, 20), 1_200);
    }

    #[test]
    fn revert_classification() {
        assert_eq!(
            classify_revert("execution reverted: InsufficientFunds()"),
            Some(RevertReason::InsufficientFunds)
        );
        assert_eq!(
            classify_revert("custom error InvalidQuorumThreshold"),
            Some(RevertReason::InvalidQuorumThreshold)
        );
        assert!(matches!(
            classify_revert("execution reverted: BatchAlreadySubmitted()"),
            Some(RevertReason::Other(r)) if r.contains("BatchAlreadySubmitted")
        ));
        assert_eq!(classify_revert("connection refused"), None);
    }
}
