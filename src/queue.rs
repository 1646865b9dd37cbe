//! Fee-priority queue of pending entries.
//!
//! Ordering is `(max_fee desc, arrival asc)`. Entries are indexed by
//! `(payer, nonce)` for replace-by-fee and by fingerprint for dedup. All
//! operations take one short critical section; no I/O happens under the
//! lock.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::{Mutex, PoisonError};

use alloy_primitives::{Address, B256, U256};
use tokio::sync::oneshot;

use crate::error::RejectKind;
use crate::types::{EntryState, NoncedVerificationData, SubmitReply};

/// One-shot terminal reply channel owned by the connection task. Sending is
/// idempotent: only the first terminal reply goes out.
#[derive(Debug)]
pub struct EntryReply {
    tx: Option<oneshot::Sender<SubmitReply>>,
}

impl EntryReply {
    pub fn new(tx: oneshot::Sender<SubmitReply>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Reply sink for entries nobody is waiting on (tests, draining).
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn send(&mut self, reply: SubmitReply) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(reply);
        }
    }
}

#[derive(Debug)]
pub struct PendingEntry {
    pub data: NoncedVerificationData,
    /// Signature-recovered submitter.
    pub sender: Address,
    /// Billing identity after the non-paying rewrite; ledger checks and the
    /// task's submitter list use this.
    pub payer: Address,
    pub fingerprint: B256,
    pub size_bytes: usize,
    pub enqueued_block: u64,
    pub arrival: u64,
    pub state: EntryState,
    pub retries: u32,
    pub reply: EntryReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapKey {
    max_fee: U256,
    arrival: u64,
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher fee wins; ties go to the earlier arrival.
        self.max_fee
            .cmp(&other.max_fee)
            .then(other.arrival.cmp(&self.arrival))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct HeapItem {
    key: HeapKey,
    id: u64,
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key).then(other.id.cmp(&self.id))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<HeapItem>,
    entries: HashMap<u64, PendingEntry>,
    by_account: HashMap<Address, BTreeMap<u64, u64>>,
    by_fingerprint: HashMap<B256, u64>,
    /// Entries currently owned by a sealing/submitting batch, per payer.
    /// They still count toward the expected-nonce window.
    in_flight: HashMap<Address, u64>,
    total_bytes: usize,
    next_id: u64,
    next_arrival: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    Replaced,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub entries: usize,
    pub bytes: usize,
    pub oldest_enqueued_block: Option<u64>,
}

#[derive(Debug, Default)]
pub struct PriorityQueue {
    inner: Mutex<Inner>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of entries this payer has pending or in flight; the next
    /// acceptable nonce is `ledger_nonce + pending_window`.
    pub fn pending_window(&self, payer: Address) -> u64 {
        let inner = self.lock();
        let queued = inner
            .by_account
            .get(&payer)
            .map_or(0, |nonces| nonces.len() as u64);
        queued + inner.in_flight.get(&payer).copied().unwrap_or(0)
    }

    /// Admits, replaces, or rejects an entry. `ledger_nonce` is the payer's
    /// current on-chain nonce at enqueue time. A rejected entry receives its
    /// terminal reply here, preserving the one-reply-per-submission rule.
    pub fn push(
        &self,
        mut entry: PendingEntry,
        ledger_nonce: u64,
    ) -> Result<PushOutcome, RejectKind> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        entry.state = EntryState::Queued;

        let nonce = entry.data.nonce;
        let payer = entry.payer;
        let nonces = inner.by_account.entry(payer).or_default();

        if let Some(&existing_id) = nonces.get(&nonce) {
            // Replace-by-fee: same (payer, nonce) supersedes only with an
            // equal or higher fee.
            let existing_fee = inner.entries[&existing_id].data.max_fee;
            if entry.data.max_fee < existing_fee {
                return Err(Self::reject(entry, RejectKind::InvalidNonce));
            }
            // The replacement must keep the per-payer fee sequence
            // non-increasing with respect to the previous nonce.
            if let Some((_, &prev_id)) = nonces.range(..nonce).next_back() {
                if entry.data.max_fee > inner.entries[&prev_id].data.max_fee {
                    return Err(Self::reject(entry, RejectKind::InvalidNonce));
                }
            }
            if entry.fingerprint != inner.entries[&existing_id].fingerprint
                && inner.by_fingerprint.contains_key(&entry.fingerprint)
            {
                return Err(Self::reject(entry, RejectKind::InvalidNonce));
            }

            let mut old = inner
                .entries
                .remove(&existing_id)
                .expect("index points at a live entry");
            inner.by_fingerprint.remove(&old.fingerprint);
            inner.total_bytes -= old.size_bytes;
            old.reply.send(SubmitReply::Error {
                error_kind: RejectKind::InvalidNonce,
                message: "superseded by a replacement submission".to_string(),
            });

            entry.arrival = old.arrival;
            let id = inner.next_id;
            inner.next_id += 1;
            nonces.insert(nonce, id);
            inner.by_fingerprint.insert(entry.fingerprint, id);
            inner.total_bytes += entry.size_bytes;
            inner.heap.push(HeapItem {
                key: HeapKey {
                    max_fee: entry.data.max_fee,
                    arrival: entry.arrival,
                },
                id,
            });
            inner.entries.insert(id, entry);
            return Ok(PushOutcome::Replaced);
        }

        // A fresh nonce must extend the contiguous run.
        let window = nonces.len() as u64 + inner.in_flight.get(&payer).copied().unwrap_or(0);
        if nonce != ledger_nonce + window {
            return Err(Self::reject(entry, RejectKind::InvalidNonce));
        }
        // The fee sequence is non-increasing across a payer's nonces.
        if let Some((_, &tail_id)) = nonces.iter().next_back() {
            if entry.data.max_fee > inner.entries[&tail_id].data.max_fee {
                return Err(Self::reject(entry, RejectKind::InvalidNonce));
            }
        }
        if inner.by_fingerprint.contains_key(&entry.fingerprint) {
            return Err(Self::reject(entry, RejectKind::InvalidNonce));
        }

        entry.arrival = inner.next_arrival;
        inner.next_arrival += 1;
        let id = inner.next_id;
        inner.next_id += 1;
        nonces.insert(nonce, id);
        inner.by_fingerprint.insert(entry.fingerprint, id);
        inner.total_bytes += entry.size_bytes;
        inner.heap.push(HeapItem {
            key: HeapKey {
                max_fee: entry.data.max_fee,
                arrival: entry.arrival,
            },
            id,
        });
        inner.entries.insert(id, entry);
        Ok(PushOutcome::Queued)
    }

    /// Removes the top entries in key order, stopping before the first entry
    /// that would exceed either cap. Taken entries are accounted as in
    /// flight until [`Self::requeue`] or [`Self::release_in_flight`].
    pub fn take_selection(&self, max_count: usize, max_bytes: usize) -> Vec<PendingEntry> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let mut taken = Vec::new();
        let mut bytes = 0usize;

        while taken.len() < max_count {
            let id = match inner.heap.peek() {
                Some(item) => item.id,
                None => break,
            };
            // Superseded entries leave stale heap items behind; skip them.
            if !inner.entries.contains_key(&id) {
                inner.heap.pop();
                continue;
            }
            let size = inner.entries[&id].size_bytes;
            if bytes + size > max_bytes {
                break;
            }
            inner.heap.pop();
            let mut entry = inner
                .entries
                .remove(&id)
                .expect("peeked entry is still live");
            Self::unindex(inner, &entry);
            bytes += size;
            entry.state = EntryState::InBatch;
            *inner.in_flight.entry(entry.payer).or_default() += 1;
            taken.push(entry);
        }
        taken
    }

    fn reject(mut entry: PendingEntry, kind: RejectKind) -> RejectKind {
        entry.state = EntryState::Rejected;
        entry.reply.send(SubmitReply::reject(kind));
        kind
    }

    fn unindex(inner: &mut Inner, entry: &PendingEntry) {
        if let Some(nonces) = inner.by_account.get_mut(&entry.payer) {
            nonces.remove(&entry.data.nonce);
            if nonces.is_empty() {
                inner.by_account.remove(&entry.payer);
            }
        }
        inner.by_fingerprint.remove(&entry.fingerprint);
        inner.total_bytes -= entry.size_bytes;
    }

    /// Returns an in-flight entry to the queue (failed batch, margin trim).
    /// Admission checks are skipped: the entry was already admitted and its
    /// nonce slot is still reserved by the in-flight window.
    pub fn requeue(&self, mut entry: PendingEntry) {
        let mut inner = self.lock();
        let inner = &mut *inner;
        Self::release(inner, entry.payer);
        entry.state = EntryState::Queued;
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .by_account
            .entry(entry.payer)
            .or_default()
            .insert(entry.data.nonce, id);
        inner.by_fingerprint.insert(entry.fingerprint, id);
        inner.total_bytes += entry.size_bytes;
        inner.heap.push(HeapItem {
            key: HeapKey {
                max_fee: entry.data.max_fee,
                arrival: entry.arrival,
            },
            id,
        });
        inner.entries.insert(id, entry);
    }

    /// Marks one in-flight entry of `payer` terminal (confirmed or
    /// rejected), shrinking the expected-nonce window.
    pub fn release_in_flight(&self, payer: Address) {
        let mut inner = self.lock();
        Self::release(&mut inner, payer);
    }

    fn release(inner: &mut Inner, payer: Address) {
        if let Some(count) = inner.in_flight.get_mut(&payer) {
            *count -= 1;
            if *count == 0 {
                inner.in_flight.remove(&payer);
            }
        }
    }

    /// Empties the queue, answering every entry with `kind`. Shutdown path:
    /// open batches are discarded and still-connected clients see the
    /// rejection before their stream closes.
    pub fn drain_and_reject(&self, kind: RejectKind) -> usize {
        let mut inner = self.lock();
        let inner = &mut *inner;
        inner.heap.clear();
        inner.by_account.clear();
        inner.by_fingerprint.clear();
        inner.in_flight.clear();
        inner.total_bytes = 0;
        let drained = inner.entries.len();
        for (_, mut entry) in inner.entries.drain() {
            entry.state = EntryState::Rejected;
            entry.reply.send(SubmitReply::reject(kind));
        }
        drained
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            entries: inner.entries.len(),
            bytes: inner.total_bytes,
            oldest_enqueued_block: inner.entries.values().map(|e| e.enqueued_block).min(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProvingSystem, VerificationData};
    use alloy_primitives::keccak256;

    fn entry(payer: u8, nonce: u64, fee: u64, proof: Vec<u8>) -> PendingEntry {
        let data = VerificationData {
            proving_system: ProvingSystem::Sp1,
            proof,
            public_input: None,
            verification_key: None,
            vm_program_code: None,
            proof_generator_addr: Address::repeat_byte(payer),
        };
        let fingerprint = data.fingerprint();
        let size_bytes = data.payload_len();
        PendingEntry {
            data: NoncedVerificationData {
                verification_data: data,
                max_fee: U256::from(fee),
                nonce,
            },
            sender: Address::repeat_byte(payer),
            payer: Address::repeat_byte(payer),
            fingerprint,
            size_bytes,
            enqueued_block: 0,
            arrival: 0,
            state: EntryState::Verified,
            retries: 0,
            reply: EntryReply::discard(),
        }
    }

    #[test]
    fn replace_by_fee_accepts_equal_or_higher() {
        let q = PriorityQueue::new();
        q.push(entry(1, 0, 20, vec![1]), 0).unwrap();
        // higher fee replaces
        assert_eq!(
            q.push(entry(1, 0, 30, vec![2]), 0).unwrap(),
            PushOutcome::Replaced
        );
        assert_eq!(q.stats().entries, 1);
        let taken = q.take_selection(10, usize::MAX);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].data.max_fee, U256::from(30u64));
    }

    #[test]
    fn replace_by_fee_rejects_lower() {
        let q = PriorityQueue::new();
        q.push(entry(1, 0, 20, vec![1]), 0).unwrap();
        assert_eq!(
            q.push(entry(1, 0, 10, vec![2]), 0).unwrap_err(),
            RejectKind::InvalidNonce
        );
        let taken = q.take_selection(10, usize::MAX);
        assert_eq!(taken[0].data.max_fee, U256::from(20u64));
    }

    #[tokio::test]
    async fn superseded_entry_gets_a_terminal_reply() {
        let q = PriorityQueue::new();
        let (tx, rx) = oneshot::channel();
        let mut first = entry(1, 0, 20, vec![1]);
        first.reply = EntryReply::new(tx);
        q.push(first, 0).unwrap();
        q.push(entry(1, 0, 30, vec![2]), 0).unwrap();

        match rx.await.unwrap() {
            SubmitReply::Error { error_kind, .. } => {
                assert_eq!(error_kind, RejectKind::InvalidNonce)
            }
            other => panic!("expected error reply, got {other:?}"),
        }
    }

    #[test]
    fn selection_order_is_fee_then_arrival() {
        let q = PriorityQueue::new();
        q.push(entry(1, 0, 50, vec![1]), 0).unwrap();
        q.push(entry(2, 0, 10, vec![2]), 0).unwrap();
        q.push(entry(3, 0, 20, vec![3]), 0).unwrap();
        let taken = q.take_selection(10, usize::MAX);
        let fees: Vec<u64> = taken.iter().map(|e| e.data.max_fee.to::<u64>()).collect();
        assert_eq!(fees, vec![50, 20, 10]);
    }

    #[test]
    fn equal_fees_preserve_arrival_order() {
        let q = PriorityQueue::new();
        q.push(entry(1, 0, 10, vec![1]), 0).unwrap();
        q.push(entry(2, 0, 10, vec![2]), 0).unwrap();
        q.push(entry(3, 0, 10, vec![3]), 0).unwrap();
        let taken = q.take_selection(10, usize::MAX);
        let payers: Vec<Address> = taken.iter().map(|e| e.payer).collect();
        assert_eq!(
            payers,
            vec![
                Address::repeat_byte(1),
                Address::repeat_byte(2),
                Address::repeat_byte(3)
            ]
        );
    }

    #[test]
    fn nonce_must_be_contiguous() {
        let q = PriorityQueue::new();
        assert_eq!(
            q.push(entry(1, 1, 10, vec![1]), 0).unwrap_err(),
            RejectKind::InvalidNonce
        );
        q.push(entry(1, 0, 10, vec![1]), 0).unwrap();
        assert_eq!(
            q.push(entry(1, 2, 10, vec![2]), 0).unwrap_err(),
            RejectKind::InvalidNonce
        );
        q.push(entry(1, 1, 10, vec![2]), 0).unwrap();
    }

    #[test]
    fn newer_nonce_cannot_raise_the_fee() {
        let q = PriorityQueue::new();
        q.push(entry(1, 0, 10, vec![1]), 0).unwrap();
        assert_eq!(
            q.push(entry(1, 1, 11, vec![2]), 0).unwrap_err(),
            RejectKind::InvalidNonce
        );
        q.push(entry(1, 1, 10, vec![2]), 0).unwrap();
        q.push(entry(1, 2, 9, vec![3]), 0).unwrap();
    }

    #[test]
    fn replacement_cannot_exceed_previous_nonce_fee() {
        let q = PriorityQueue::new();
        q.push(entry(1, 0, 10, vec![1]), 0).unwrap();
        q.push(entry(1, 1, 8, vec![2]), 0).unwrap();
        // bumping nonce 1 above nonce 0's fee breaks monotonicity
        assert_eq!(
            q.push(entry(1, 1, 11, vec![3]), 0).unwrap_err(),
            RejectKind::InvalidNonce
        );
        // bumping within the bound is fine
        q.push(entry(1, 1, 10, vec![3]), 0).unwrap();
    }

    #[test]
    fn duplicate_fingerprint_is_rejected() {
        let q = PriorityQueue::new();
        q.push(entry(1, 0, 10, vec![42]), 0).unwrap();
        // same payload from another payer
        assert_eq!(
            q.push(entry(1, 1, 10, vec![42]), 0).unwrap_err(),
            RejectKind::InvalidNonce
        );
    }

    #[test]
    fn selection_respects_caps() {
        let q = PriorityQueue::new();
        for i in 0..5u8 {
            q.push(entry(i + 1, 0, 10, vec![i; 10]), 0).unwrap();
        }
        assert_eq!(q.take_selection(3, usize::MAX).len(), 3);
        assert_eq!(q.take_selection(10, 15).len(), 1);
        assert_eq!(q.stats().entries, 1);
    }

    #[test]
    fn in_flight_window_keeps_nonce_accounting() {
        let q = PriorityQueue::new();
        q.push(entry(1, 0, 10, vec![1]), 0).unwrap();
        q.push(entry(1, 1, 10, vec![2]), 0).unwrap();
        let taken = q.take_selection(10, usize::MAX);
        assert_eq!(taken.len(), 2);

        // While the batch is in flight, the next nonce is still 2.
        assert_eq!(q.pending_window(Address::repeat_byte(1)), 2);
        q.push(entry(1, 2, 10, vec![3]), 0).unwrap();

        // A failed batch returns its entries; nothing is lost.
        for e in taken {
            q.requeue(e);
        }
        assert_eq!(q.stats().entries, 3);
        assert_eq!(q.pending_window(Address::repeat_byte(1)), 3);
    }

    #[test]
    fn release_in_flight_shrinks_the_window() {
        let q = PriorityQueue::new();
        q.push(entry(1, 0, 10, vec![1]), 0).unwrap();
        let taken = q.take_selection(10, usize::MAX);
        assert_eq!(taken.len(), 1);
        assert_eq!(q.pending_window(Address::repeat_byte(1)), 1);
        q.release_in_flight(Address::repeat_byte(1));
        // Confirmed on-chain: ledger nonce is now 1, window is empty.
        assert_eq!(q.pending_window(Address::repeat_byte(1)), 0);
        q.push(entry(1, 1, 10, vec![2]), 1).unwrap();
    }

    #[tokio::test]
    async fn drain_rejects_every_queued_entry() {
        let q = PriorityQueue::new();
        let (tx, rx) = oneshot::channel();
        let mut first = entry(1, 0, 10, vec![1]);
        first.reply = EntryReply::new(tx);
        q.push(first, 0).unwrap();
        q.push(entry(2, 0, 10, vec![2]), 0).unwrap();

        assert_eq!(q.drain_and_reject(RejectKind::Internal), 2);
        assert_eq!(q.stats().entries, 0);
        assert_eq!(q.stats().bytes, 0);
        match rx.await.unwrap() {
            SubmitReply::Error { error_kind, .. } => {
                assert_eq!(error_kind, RejectKind::Internal)
            }
            other => panic!("expected error reply, got {other:?}"),
        }
    }

    #[test]
    fn stats_track_bytes_and_oldest_block() {
        let q = PriorityQueue::new();
        let mut a = entry(1, 0, 10, vec![0; 8]);
        a.enqueued_block = 100;
        let mut b = entry(2, 0, 10, vec![1; 4]);
        b.enqueued_block = 90;
        q.push(a, 0).unwrap();
        q.push(b, 0).unwrap();
        let stats = q.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.bytes, 12);
        assert_eq!(stats.oldest_enqueued_block, Some(90));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Random single-account workloads never break nonce
            /// contiguity: the accepted nonce set is always a prefix run.
            #[test]
            fn accepted_nonces_form_a_contiguous_run(
                ops in proptest::collection::vec((0u64..6, 1u64..100), 1..40)
            ) {
                let q = PriorityQueue::new();
                for (nonce, fee) in ops {
                    let mut e = entry(1, nonce, fee, vec![nonce as u8, fee as u8]);
                    e.fingerprint = keccak256([nonce as u8, fee as u8, 0xfe]);
                    let _ = q.push(e, 0);
                }
                let taken = q.take_selection(usize::MAX - 1, usize::MAX);
                let mut nonces: Vec<u64> =
                    taken.iter().map(|e| e.data.nonce).collect();
                nonces.sort_unstable();
                for (i, n) in nonces.iter().enumerate() {
                    prop_assert_eq!(*n, i as u64);
                }
            }
        }
    }
}
