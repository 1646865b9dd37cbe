//! Batch finalizer.
//!
//! A single background task owns the open batch. Each tick it checks the
//! finalization triggers, freezes a selection off the priority queue,
//! re-confirms the fee ledger, uploads the payload, computes the Merkle
//! root, and hands the sealed batch to the submission engine. Entries only
//! leave through a terminal reply: an inclusion proof or a typed error.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::config::BatcherConfig;
use crate::error::RejectKind;
use crate::fees;
use crate::ledger::FeeLedgerClient;
use crate::merkle::MerkleTree;
use crate::queue::{PendingEntry, PriorityQueue, QueueStats};
use crate::storage::{batch_key, BatchLog, BatchRecord, BatchState, ObjectStore};
use crate::submitter::{RevertReason, SealedBatch, SubmissionEngine, SubmitOutcome};
use crate::types::{EntryState, SubmitReply, VerificationData};

const TICK_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
struct FinalizerPolicy {
    block_interval: u64,
    batch_size_interval: usize,
    max_batch_proof_qty: usize,
    max_batch_byte_size: usize,
    aggregator_gas_cost: u64,
    aggregator_fee_percentage_multiplier: u64,
    respond_to_task_fee_multiplier: u64,
    batch_cost_margin: U256,
    upload_timeout: Duration,
    max_batch_retries: u32,
}

/// True when any finalization trigger holds for a non-empty queue.
fn should_finalize(
    stats: &QueueStats,
    current_block: u64,
    block_interval: u64,
    batch_size_interval: usize,
    max_batch_proof_qty: usize,
) -> bool {
    if stats.entries == 0 {
        return false;
    }
    stats.bytes >= batch_size_interval
        || stats.entries >= max_batch_proof_qty
        || stats
            .oldest_enqueued_block
            .is_some_and(|oldest| current_block.saturating_sub(oldest) >= block_interval)
}

/// Drops lowest-fee entries until the batch covers the aggregator cost with
/// margin. Returns the trimmed-out entries; `selected` keeps key order.
fn trim_to_margin(
    selected: &mut Vec<PendingEntry>,
    aggregator_fee: U256,
    margin: U256,
) -> Vec<PendingEntry> {
    let mut trimmed = Vec::new();
    while let Some(fee_per_proof) = selected.iter().map(|e| e.data.max_fee).min() {
        if fees::covers_aggregator_cost(fee_per_proof, selected.len(), aggregator_fee, margin) {
            break;
        }
        // selection is fee-descending, so the minimum is at the tail
        trimmed.push(selected.pop().expect("selection is non-empty"));
    }
    trimmed
}

/// How many of a payer's entries a balance covers at `fee_per_proof` each.
fn entries_covered(balance: U256, fee_per_proof: U256) -> usize {
    if fee_per_proof.is_zero() {
        return usize::MAX;
    }
    (balance / fee_per_proof).try_into().unwrap_or(usize::MAX)
}

pub struct Finalizer<S: ObjectStore> {
    queue: Arc<PriorityQueue>,
    ledger: Arc<FeeLedgerClient>,
    submitter: Arc<SubmissionEngine>,
    store: Arc<S>,
    batch_log: Arc<BatchLog>,
    policy: FinalizerPolicy,
}

impl<S: ObjectStore> Finalizer<S> {
    pub fn new(
        cfg: &BatcherConfig,
        queue: Arc<PriorityQueue>,
        ledger: Arc<FeeLedgerClient>,
        submitter: Arc<SubmissionEngine>,
        store: Arc<S>,
        batch_log: Arc<BatchLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            ledger,
            submitter,
            store,
            batch_log,
            policy: FinalizerPolicy {
                block_interval: cfg.block_interval,
                batch_size_interval: cfg.batch_size_interval,
                max_batch_proof_qty: cfg.max_batch_proof_qty,
                max_batch_byte_size: cfg.max_batch_byte_size,
                aggregator_gas_cost: cfg.aggregator_gas_cost,
                aggregator_fee_percentage_multiplier: cfg.aggregator_fee_percentage_multiplier,
                respond_to_task_fee_multiplier: cfg.respond_to_task_fee_multiplier,
                batch_cost_margin: cfg.batch_cost_margin,
                upload_timeout: Duration::from_secs(cfg.upload_timeout_secs),
                max_batch_retries: cfg.max_batch_retries,
            },
        })
    }

    pub fn spawn(self: &Arc<Self>) {
        let finalizer = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = finalizer.tick().await {
                    warn!(error = %e, "finalizer tick failed");
                }
            }
        });
    }

    async fn tick(self: &Arc<Self>) -> Result<(), crate::error::BatcherError> {
        let stats = self.queue.stats();
        if stats.entries == 0 {
            return Ok(());
        }
        let current_block = self.ledger.latest_block().await?;
        if !should_finalize(
            &stats,
            current_block,
            self.policy.block_interval,
            self.policy.batch_size_interval,
            self.policy.max_batch_proof_qty,
        ) {
            return Ok(());
        }
        self.seal(current_block).await
    }

    /// Freezes a selection, prices it, re-confirms the ledger, uploads the
    /// payload, and hands off to the submission engine. A selection that
    /// cannot pay for itself is deferred, not dropped.
    async fn seal(self: &Arc<Self>, current_block: u64) -> Result<(), crate::error::BatcherError> {
        let mut selected = self.queue.take_selection(
            self.policy.max_batch_proof_qty,
            self.policy.max_batch_byte_size,
        );
        if selected.is_empty() {
            return Ok(());
        }

        let gas_price = match self.ledger.gas_price().await {
            Ok(price) => price,
            Err(e) => {
                for entry in selected {
                    self.queue.requeue(entry);
                }
                return Err(e);
            }
        };
        let aggregator_fee = fees::aggregator_fee(
            gas_price,
            self.policy.aggregator_gas_cost,
            self.policy.aggregator_fee_percentage_multiplier,
        );

        loop {
            for entry in trim_to_margin(&mut selected, aggregator_fee, self.policy.batch_cost_margin)
            {
                debug!(payer = %entry.payer, nonce = entry.data.nonce, "below margin, back to queue");
                self.queue.requeue(entry);
            }
            if selected.is_empty() {
                debug!("selection cannot cover aggregator cost, deferring batch");
                return Ok(());
            }
            let fee_per_proof = selected
                .iter()
                .map(|e| e.data.max_fee)
                .min()
                .expect("selection is non-empty");

            if self.confirm_ledger(&mut selected, fee_per_proof).await? {
                // evictions changed the selection; reprice and recheck
                continue;
            }

            let batch = self
                .assemble(&selected, fee_per_proof, aggregator_fee, gas_price, current_block)
                .await;
            match batch {
                Ok((sealed, tree)) => {
                    for entry in &mut selected {
                        entry.state = EntryState::InBatch;
                    }
                    self.spawn_submission(sealed, tree, selected);
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "batch assembly failed, returning entries");
                    for entry in selected {
                        self.fail_or_requeue(entry, RejectKind::StorageUnavailable);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Re-confirms balances and nonces against the chain for every selected
    /// payer. Evicted entries are answered immediately. Returns true when
    /// anything was evicted.
    async fn confirm_ledger(
        &self,
        selected: &mut Vec<PendingEntry>,
        fee_per_proof: U256,
    ) -> Result<bool, crate::error::BatcherError> {
        let mut payers: Vec<Address> = selected.iter().map(|e| e.payer).collect();
        payers.sort_unstable();
        payers.dedup();

        let mut evict: Vec<(usize, RejectKind)> = Vec::new();
        for payer in payers {
            let _latch = self.ledger.latch(payer).await;
            let ledger = self.ledger.get_fresh(payer).await?;

            // indices of this payer's entries, in nonce order
            let mut owned: Vec<usize> = selected
                .iter()
                .enumerate()
                .filter(|(_, e)| e.payer == payer)
                .map(|(i, _)| i)
                .collect();
            owned.sort_by_key(|&i| selected[i].data.nonce);

            let first_nonce = selected[owned[0]].data.nonce;
            if ledger.nonce != first_nonce {
                for &i in &owned {
                    evict.push((i, RejectKind::InvalidNonce));
                }
                continue;
            }
            let covered = entries_covered(ledger.balance, fee_per_proof);
            for &i in owned.iter().skip(covered) {
                evict.push((i, RejectKind::InsufficientBalance));
            }
        }

        if evict.is_empty() {
            return Ok(false);
        }
        evict.sort_by_key(|(i, _)| std::cmp::Reverse(*i));
        for (i, kind) in evict {
            let mut entry = selected.remove(i);
            warn!(payer = %entry.payer, nonce = entry.data.nonce, %kind, "evicted at seal");
            counter!("batcher_entries_evicted").increment(1);
            entry.state = EntryState::Rejected;
            entry.reply.send(SubmitReply::reject(kind));
            self.queue.release_in_flight(entry.payer);
        }
        Ok(true)
    }

    /// Serializes the payload, uploads it, and computes the Merkle root.
    async fn assemble(
        &self,
        selected: &[PendingEntry],
        fee_per_proof: U256,
        aggregator_fee: U256,
        gas_price: U256,
        current_block: u64,
    ) -> Result<(SealedBatch, MerkleTree), crate::error::BatcherError> {
        let leaves: Vec<B256> = selected.iter().map(|e| e.fingerprint).collect();
        let tree = MerkleTree::from_leaves(leaves)
            .ok_or_else(|| crate::error::BatcherError::Internal("empty selection".into()))?;
        let merkle_root = tree.root();

        self.batch_log.insert(BatchRecord::new(
            merkle_root,
            selected.len(),
            fee_per_proof,
            current_block,
        ));

        let payload: Vec<&VerificationData> = selected
            .iter()
            .map(|e| &e.data.verification_data)
            .collect();
        let bytes = crate::types::to_cbor(&payload)?;
        let key = batch_key(merkle_root);
        let data_pointer =
            tokio::time::timeout(self.policy.upload_timeout, self.store.put(&key, bytes))
                .await
                .map_err(|_| crate::error::BatcherError::Storage("upload timed out".into()))??;

        let submitters: Vec<Address> = selected.iter().map(|e| e.payer).collect();
        let respond_to_task_fee_limit = fees::respond_to_task_fee_limit(
            gas_price,
            self.policy.aggregator_gas_cost,
            self.policy.respond_to_task_fee_multiplier,
        );

        self.batch_log.update(merkle_root, |rec| {
            rec.data_pointer = Some(data_pointer.clone());
            rec.sealed_block = Some(current_block);
        });
        info!(
            %merkle_root,
            entries = selected.len(),
            %fee_per_proof,
            pointer = %data_pointer,
            "batch sealed"
        );
        counter!("batcher_batches_sealed").increment(1);

        Ok((
            SealedBatch {
                merkle_root,
                data_pointer,
                submitters,
                aggregator_fee,
                fee_per_proof,
                respond_to_task_fee_limit,
            },
            tree,
        ))
    }

    /// Distinct batches may submit in parallel; each submission task owns
    /// its entries until they reach a terminal reply.
    fn spawn_submission(
        self: &Arc<Self>,
        sealed: SealedBatch,
        tree: MerkleTree,
        entries: Vec<PendingEntry>,
    ) {
        let finalizer = Arc::clone(self);
        tokio::spawn(async move {
            finalizer.submit_and_settle(sealed, tree, entries).await;
        });
    }

    async fn submit_and_settle(
        &self,
        sealed: SealedBatch,
        tree: MerkleTree,
        mut entries: Vec<PendingEntry>,
    ) {
        let root = sealed.merkle_root;
        self.batch_log.update(root, |rec| {
            rec.state = BatchState::Submitted;
            rec.submit_attempts += 1;
        });

        let outcome = match self.submitter.submit(&sealed).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(merkle_root = %root, error = %e, "submission errored");
                SubmitOutcome::TimedOut
            }
        };

        match outcome {
            SubmitOutcome::Confirmed { tx_hash } => {
                self.batch_log.update(root, |rec| {
                    rec.state = BatchState::Confirmed;
                    rec.tx_hash = tx_hash;
                });
                info!(merkle_root = %root, entries = entries.len(), "batch confirmed");
                counter!("batcher_batches_confirmed").increment(1);
                counter!("batcher_entries_confirmed").increment(entries.len() as u64);
                for (index, mut entry) in entries.into_iter().enumerate() {
                    let proof = tree.proof(index).unwrap_or_default();
                    entry.state = EntryState::Confirmed;
                    entry.reply.send(SubmitReply::Inclusion {
                        batch_merkle_root: root,
                        merkle_proof: proof,
                        index_in_batch: index as u32,
                    });
                    self.ledger.invalidate(entry.payer);
                    self.queue.release_in_flight(entry.payer);
                }
            }
            SubmitOutcome::Rejected {
                reason: RevertReason::InsufficientFunds,
            } => {
                self.batch_log.update(root, |rec| {
                    rec.state = BatchState::Failed;
                    rec.error = Some("InsufficientFunds".into());
                });
                counter!("batcher_batches_failed").increment(1);
                // Reject the payers the chain says cannot pay; the rest
                // re-enter the queue.
                for mut entry in entries.drain(..) {
                    self.ledger.invalidate(entry.payer);
                    let broke = match self.ledger.get(entry.payer).await {
                        Ok(ledger) => ledger.balance < sealed.fee_per_proof,
                        Err(_) => false,
                    };
                    if broke {
                        entry.state = EntryState::Rejected;
                        entry
                            .reply
                            .send(SubmitReply::reject(RejectKind::InsufficientBalance));
                        self.queue.release_in_flight(entry.payer);
                    } else {
                        self.fail_or_requeue(entry, RejectKind::BatchSubmissionFailed);
                    }
                }
            }
            SubmitOutcome::Rejected { reason } => {
                warn!(merkle_root = %root, ?reason, "batch rejected on-chain");
                self.batch_log.update(root, |rec| {
                    rec.state = BatchState::Failed;
                    rec.error = Some(format!("{reason:?}"));
                });
                counter!("batcher_batches_failed").increment(1);
                for entry in entries {
                    self.fail_or_requeue(entry, RejectKind::BatchSubmissionFailed);
                }
            }
            SubmitOutcome::TimedOut => {
                self.batch_log.update(root, |rec| {
                    rec.state = BatchState::Failed;
                    rec.error = Some("submission budget exhausted".into());
                });
                counter!("batcher_batches_failed").increment(1);
                for entry in entries {
                    self.fail_or_requeue(entry, RejectKind::BatchSubmissionFailed);
                }
            }
        }
    }

    /// Bounded retry: the entry re-enters the queue until its retry budget
    /// is spent, then the failure is surfaced.
    fn fail_or_requeue(&self, mut entry: PendingEntry, kind: RejectKind) {
        entry.retries += 1;
        if entry.retries > self.policy.max_batch_retries {
            entry.state = EntryState::Rejected;
            entry.reply.send(SubmitReply::reject(kind));
            self.queue.release_in_flight(entry.payer);
        } else {
            self.queue.requeue(entry);
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EntryReply;
    use crate::types::{NoncedVerificationData, ProvingSystem};

    fn entry(fee: u64) -> PendingEntry {
        let data = VerificationData {
            proving_system: ProvingSystem::Sp1,
            proof: vec![fee as u8],
            public_input: None,
            verification_key: None,
            vm_program_code: None,
            proof_generator_addr: Address::ZERO,
        };
        let fingerprint = data.fingerprint();
        PendingEntry {
            data: NoncedVerificationData {
                verification_data: data,
                max_fee: U256::from(fee),
                nonce: 0,
            },
            sender: Address::ZERO,
            payer: Address::ZERO,
            fingerprint,
            size_bytes: 1,
            enqueued_block: 0,
            arrival: 0,
            state: EntryState::Verified,
            retries: 0,
            reply: EntryReply::discard(),
        }
    }

    fn stats(entries: usize, bytes: usize, oldest: Option<u64>) -> QueueStats {
        QueueStats {
            entries,
            bytes,
            oldest_enqueued_block: oldest,
        }
    }

    #[test]
    fn triggers_fire_on_size_count_or_age() {
        // empty queue never triggers
        assert!(!should_finalize(&stats(0, 0, None), 100, 10, 1024, 8));
        // byte threshold
        assert!(should_finalize(&stats(1, 2048, Some(100)), 100, 10, 1024, 8));
        // count threshold
        assert!(should_finalize(&stats(8, 10, Some(100)), 100, 10, 1024, 8));
        // block age
        assert!(should_finalize(&stats(1, 10, Some(90)), 100, 10, 1024, 8));
        // nothing yet
        assert!(!should_finalize(&stats(1, 10, Some(95)), 100, 10, 1024, 8));
    }

    #[test]
    fn one_entry_batch_seals_when_margin_holds() {
        // scenario: single entry sealed by the block timer, fee > aggregator fee
        let mut selected = vec![entry(10_000)];
        let trimmed = trim_to_margin(&mut selected, U256::from(1_000), U256::ZERO);
        assert!(trimmed.is_empty());
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn trim_drops_lowest_fees_until_covered() {
        // fees descending (selection order); aggregator fee 100
        let mut selected = vec![entry(60), entry(40), entry(5)];
        // 3 × 5 = 15 ≤ 100 → drop 5; 2 × 40 = 80 ≤ 100 → drop 40; 1 × 60 ≤ 100 → drop 60
        let trimmed = trim_to_margin(&mut selected, U256::from(100), U256::ZERO);
        assert_eq!(trimmed.len(), 3);
        assert!(selected.is_empty());

        let mut selected = vec![entry(60), entry(60), entry(5)];
        // 3 × 5 = 15 ≤ 100 → drop 5; 2 × 60 = 120 > 100 → keep
        let trimmed = trim_to_margin(&mut selected, U256::from(100), U256::ZERO);
        assert_eq!(trimmed.len(), 1);
        assert_eq!(trimmed[0].data.max_fee, U256::from(5u64));
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn margin_is_added_to_the_bar() {
        let mut selected = vec![entry(51), entry(51)];
        // 2 × 51 = 102 > 100 without margin
        assert!(trim_to_margin(&mut selected, U256::from(100), U256::ZERO).is_empty());
        // but not > 100 + 5
        let trimmed = trim_to_margin(&mut selected, U256::from(100), U256::from(5));
        assert_eq!(trimmed.len(), 2);
    }

    #[test]
    fn balance_coverage_counts_whole_entries() {
        assert_eq!(entries_covered(U256::from(100), U256::from(30)), 3);
        assert_eq!(entries_covered(U256::from(29), U256::from(30)), 0);
        assert_eq!(entries_covered(U256::from(90), U256::from(30)), 3);
        assert_eq!(entries_covered(U256::ZERO, U256::from(30)), 0);
    }
}
