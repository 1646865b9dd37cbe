//! Pre-verification worker pool.
//!
//! Submissions are handed over through a bounded channel; a full channel is
//! backpressure (`RateLimited` at the connection). Verification itself is
//! CPU-bound and runs on blocking worker threads behind `catch_unwind`, so a
//! fault inside a native verifier library poisons one job, not the process;
//! the pool picks up the next job with a fresh blocking thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy_primitives::B256;
use ark_ff::PrimeField;
use ark_serialize::CanonicalDeserialize;
use ark_snark::SNARK;
use dashmap::DashMap;
use jf_plonk::proof_system::structs::{Proof as PlonkProof, VerifyingKey as PlonkVerifyingKey};
use jf_plonk::proof_system::{PlonkKzgSnark, UniversalSNARK};
use jf_plonk::transcript::StandardTranscript;
use once_cell::sync::Lazy;
use sp1_sdk::{CpuProver, Prover, ProverClient, SP1ProofWithPublicValues, SP1VerifyingKey};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, warn};

use crate::types::{ProvingSystem, VerificationData};

static SP1_PROVER: Lazy<CpuProver> = Lazy::new(|| ProverClient::builder().cpu().build());

/// Bitmap of proving systems the service manager has disabled. Bit position
/// is [`ProvingSystem::as_u8`].
#[derive(Debug, Default)]
pub struct DisabledVerifiers(AtomicU32);

impl DisabledVerifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_disabled(&self, system: ProvingSystem) -> bool {
        self.0.load(Ordering::Relaxed) & (1 << system.as_u8()) != 0
    }

    pub fn set(&self, verifier_idx: u8, disabled: bool) {
        if disabled {
            self.0.fetch_or(1 << verifier_idx, Ordering::Relaxed);
        } else {
            self.0.fetch_and(!(1 << verifier_idx), Ordering::Relaxed);
        }
    }
}

const RECENT_TTL_SECS: u64 = 3600;
const MAX_RECENT_ENTRIES: usize = 50_000;

/// Recently verified fingerprints with their verdicts. A fingerprint is
/// pre-verified at most once; re-submissions are answered from this set.
#[derive(Debug, Default)]
pub struct RecentFingerprints {
    verdicts: DashMap<B256, (bool, u64)>,
    eviction_counter: AtomicU64,
}

impl RecentFingerprints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fingerprint: B256) -> Option<bool> {
        let now = now_epoch();
        self.verdicts.get(&fingerprint).and_then(|entry| {
            let (verdict, at) = *entry.value();
            (now.saturating_sub(at) < RECENT_TTL_SECS).then_some(verdict)
        })
    }

    pub fn insert(&self, fingerprint: B256, verdict: bool) {
        let now = now_epoch();
        self.verdicts.insert(fingerprint, (verdict, now));

        // Amortized eviction, off the hot path most of the time.
        let count = self.eviction_counter.fetch_add(1, Ordering::Relaxed);
        if count % 100 == 0 && self.verdicts.len() > MAX_RECENT_ENTRIES {
            self.verdicts
                .retain(|_, (_, at)| now.saturating_sub(*at) < RECENT_TTL_SECS);
        }
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid(String),
    Disabled,
}

pub struct VerifyJob {
    pub data: VerificationData,
    pub verdict_tx: oneshot::Sender<Verdict>,
}

/// Handle used by connection tasks to submit verification jobs.
#[derive(Clone)]
pub struct VerifierPool {
    job_tx: mpsc::Sender<VerifyJob>,
}

impl VerifierPool {
    /// Spawns the dispatcher. `workers` bounds how many verifications run at
    /// once; `enabled == false` turns the pool into a pass-through
    /// (pre-verification disabled, required true in production).
    pub fn spawn(
        workers: usize,
        enabled: bool,
        disabled: Arc<DisabledVerifiers>,
        recent: Arc<RecentFingerprints>,
        timeout: Duration,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel(workers * 4);
        tokio::spawn(Self::run(job_rx, workers, enabled, disabled, recent, timeout));
        Self { job_tx }
    }

    /// Non-blocking hand-off; a full channel is the caller's backpressure
    /// signal.
    pub fn try_submit(&self, job: VerifyJob) -> Result<(), VerifyJob> {
        self.job_tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
        })
    }

    async fn run(
        mut job_rx: mpsc::Receiver<VerifyJob>,
        workers: usize,
        enabled: bool,
        disabled: Arc<DisabledVerifiers>,
        recent: Arc<RecentFingerprints>,
        timeout: Duration,
    ) {
        let semaphore = Arc::new(Semaphore::new(workers));
        while let Some(job) = job_rx.recv().await {
            let system = job.data.proving_system;
            if disabled.is_disabled(system) {
                let _ = job.verdict_tx.send(Verdict::Disabled);
                continue;
            }
            if !enabled {
                let _ = job.verdict_tx.send(Verdict::Valid);
                continue;
            }
            let fingerprint = job.data.fingerprint();
            if let Some(verdict) = recent.get(fingerprint) {
                debug!(%fingerprint, verdict, "fingerprint already pre-verified");
                let _ = job.verdict_tx.send(if verdict {
                    Verdict::Valid
                } else {
                    Verdict::Invalid("proof failed pre-verification".into())
                });
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let recent = Arc::clone(&recent);
            tokio::spawn(async move {
                let _permit = permit;
                let verdict = verify_isolated(job.data, timeout).await;
                recent.insert(fingerprint, verdict == Verdict::Valid);
                let _ = job.verdict_tx.send(verdict);
            });
        }
        warn!("verifier pool channel closed, shutting down");
    }
}

/// Runs one verification on a blocking thread, isolating panics from native
/// verifier code and bounding the wall-clock time.
async fn verify_isolated(data: VerificationData, timeout: Duration) -> Verdict {
    let system = data.proving_system;
    let handle =
        tokio::task::spawn_blocking(move || catch_unwind(AssertUnwindSafe(|| verify_entry(&data))));
    match tokio::time::timeout(timeout, handle).await {
        Err(_) => {
            warn!(%system, "verification timed out");
            Verdict::Invalid("verification timed out".into())
        }
        Ok(Err(join_err)) => {
            warn!(%system, error = %join_err, "verifier worker died");
            Verdict::Invalid("verifier worker failed".into())
        }
        Ok(Ok(Err(_panic))) => {
            warn!(%system, "verifier library fault isolated");
            Verdict::Invalid("verifier fault".into())
        }
        Ok(Ok(Ok(Ok(())))) => Verdict::Valid,
        Ok(Ok(Ok(Err(reason)))) => Verdict::Invalid(reason),
    }
}

/// Pure, side-effect-free verification of a single entry against its
/// verification key and public inputs.
pub fn verify_entry(data: &VerificationData) -> Result<(), String> {
    match data.proving_system {
        ProvingSystem::Groth16Bn254 => verify_groth16_bn254(data),
        ProvingSystem::PlonkBn254 => verify_plonk_bn254(data),
        ProvingSystem::PlonkBls12_381 => verify_plonk_bls12_381(data),
        ProvingSystem::Sp1 => verify_sp1(data),
        ProvingSystem::Risc0 => verify_risc0(data),
    }
}

fn field_elements<F: PrimeField>(bytes: &[u8]) -> Result<Vec<F>, String> {
    if bytes.len() % 32 != 0 {
        return Err("public input is not a sequence of 32-byte words".into());
    }
    Ok(bytes.chunks(32).map(F::from_be_bytes_mod_order).collect())
}

fn verify_groth16_bn254(data: &VerificationData) -> Result<(), String> {
    let vk_bytes = data
        .verification_key
        .as_ref()
        .ok_or("missing verification key")?;
    let vk = ark_groth16::VerifyingKey::<ark_bn254::Bn254>::deserialize_compressed(
        vk_bytes.as_slice(),
    )
    .map_err(|e| format!("verification key: {e}"))?;
    let proof =
        ark_groth16::Proof::<ark_bn254::Bn254>::deserialize_compressed(data.proof.as_slice())
            .map_err(|e| format!("proof: {e}"))?;
    let inputs =
        field_elements::<ark_bn254::Fr>(data.public_input.as_deref().unwrap_or_default())?;

    let pvk = ark_groth16::Groth16::<ark_bn254::Bn254>::process_vk(&vk)
        .map_err(|e| format!("verification key: {e}"))?;
    let valid =
        ark_groth16::Groth16::<ark_bn254::Bn254>::verify_with_processed_vk(&pvk, &inputs, &proof)
            .map_err(|e| format!("verification: {e}"))?;
    if valid {
        Ok(())
    } else {
        Err("proof does not verify".into())
    }
}

fn verify_plonk_bn254(data: &VerificationData) -> Result<(), String> {
    let vk_bytes = data
        .verification_key
        .as_ref()
        .ok_or("missing verification key")?;
    let vk = PlonkVerifyingKey::<ark_bn254::Bn254>::deserialize_compressed(vk_bytes.as_slice())
        .map_err(|e| format!("verification key: {e}"))?;
    let proof = PlonkProof::<ark_bn254::Bn254>::deserialize_compressed(data.proof.as_slice())
        .map_err(|e| format!("proof: {e}"))?;
    let inputs = field_elements::<ark_bn254::Fr>(data.public_input.as_deref().unwrap_or_default())?;

    PlonkKzgSnark::<ark_bn254::Bn254>::verify::<StandardTranscript>(&vk, &inputs, &proof, None)
        .map_err(|e| format!("verification: {e}"))
}

fn verify_plonk_bls12_381(data: &VerificationData) -> Result<(), String> {
    let vk_bytes = data
        .verification_key
        .as_ref()
        .ok_or("missing verification key")?;
    let vk =
        PlonkVerifyingKey::<ark_bls12_381::Bls12_381>::deserialize_compressed(vk_bytes.as_slice())
            .map_err(|e| format!("verification key: {e}"))?;
    let proof =
        PlonkProof::<ark_bls12_381::Bls12_381>::deserialize_compressed(data.proof.as_slice())
            .map_err(|e| format!("proof: {e}"))?;
    let inputs =
        field_elements::<ark_bls12_381::Fr>(data.public_input.as_deref().unwrap_or_default())?;

    PlonkKzgSnark::<ark_bls12_381::Bls12_381>::verify::<StandardTranscript>(
        &vk, &inputs, &proof, None,
    )
    .map_err(|e| format!("verification: {e}"))
}

fn verify_sp1(data: &VerificationData) -> Result<(), String> {
    let vk_bytes = data
        .vm_program_code
        .as_ref()
        .ok_or("missing sp1 verifying key")?;
    let proof: SP1ProofWithPublicValues =
        bincode::deserialize(&data.proof).map_err(|e| format!("proof: {e}"))?;
    let vk: SP1VerifyingKey =
        bincode::deserialize(vk_bytes).map_err(|e| format!("verifying key: {e}"))?;
    if let Some(expected) = &data.public_input {
        if proof.public_values.as_slice() != expected.as_slice() {
            return Err("public values mismatch".into());
        }
    }
    SP1_PROVER
        .verify(&proof, &vk)
        .map_err(|e| format!("verification: {e}"))
}

fn verify_risc0(data: &VerificationData) -> Result<(), String> {
    let image_id_bytes = data.vm_program_code.as_ref().ok_or("missing image id")?;
    let image_id: [u8; 32] = image_id_bytes
        .as_slice()
        .try_into()
        .map_err(|_| "image id must be 32 bytes".to_string())?;
    let receipt: risc0_zkvm::Receipt =
        bincode::deserialize(&data.proof).map_err(|e| format!("receipt: {e}"))?;
    if let Some(expected) = &data.public_input {
        if &receipt.journal.bytes != expected {
            return Err("journal mismatch".into());
        }
    }
    receipt
        .verify(image_id)
        .map_err(|e| format!("verification: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    fn garbage(system: ProvingSystem) -> VerificationData {
        VerificationData {
            proving_system: system,
            proof: vec![0xde, 0xad, 0xbe, 0xef],
            public_input: Some(vec![0u8; 32]),
            verification_key: Some(vec![0x01, 0x02]),
            vm_program_code: Some(vec![0u8; 32]),
            proof_generator_addr: Address::ZERO,
        }
    }

    #[test]
    fn garbage_proofs_are_invalid_not_fatal() {
        for system in ProvingSystem::ALL {
            assert!(verify_entry(&garbage(system)).is_err(), "{system}");
        }
    }

    #[test]
    fn missing_components_are_reported() {
        let mut data = garbage(ProvingSystem::Groth16Bn254);
        data.verification_key = None;
        assert_eq!(
            verify_entry(&data).unwrap_err(),
            "missing verification key".to_string()
        );

        let mut data = garbage(ProvingSystem::Risc0);
        data.vm_program_code = Some(vec![0u8; 31]);
        assert_eq!(
            verify_entry(&data).unwrap_err(),
            "image id must be 32 bytes".to_string()
        );
    }

    #[test]
    fn disabled_bitmap_round_trips() {
        let disabled = DisabledVerifiers::new();
        assert!(!disabled.is_disabled(ProvingSystem::Sp1));
        disabled.set(ProvingSystem::Sp1.as_u8(), true);
        assert!(disabled.is_disabled(ProvingSystem::Sp1));
        assert!(!disabled.is_disabled(ProvingSystem::Risc0));
        disabled.set(ProvingSystem::Sp1.as_u8(), false);
        assert!(!disabled.is_disabled(ProvingSystem::Sp1));
    }

    #[test]
    fn recent_set_caches_verdicts() {
        let recent = RecentFingerprints::new();
        let fp = B256::repeat_byte(1);
        assert_eq!(recent.get(fp), None);
        recent.insert(fp, true);
        assert_eq!(recent.get(fp), Some(true));
        recent.insert(fp, false);
        assert_eq!(recent.get(fp), Some(false));
    }

    #[tokio::test]
    async fn disabled_system_fails_fast_without_running() {
        let disabled = Arc::new(DisabledVerifiers::new());
        disabled.set(ProvingSystem::Groth16Bn254.as_u8(), true);
        let pool = VerifierPool::spawn(
            2,
            true,
            Arc::clone(&disabled),
            Arc::new(RecentFingerprints::new()),
            Duration::from_secs(5),
        );

        let (tx, rx) = oneshot::channel();
        pool.try_submit(VerifyJob {
            data: garbage(ProvingSystem::Groth16Bn254),
            verdict_tx: tx,
        })
        .unwrap_or_else(|_| panic!("channel full"));
        assert_eq!(rx.await.unwrap(), Verdict::Disabled);
    }

    #[tokio::test]
    async fn pass_through_when_pre_verification_disabled() {
        let pool = VerifierPool::spawn(
            2,
            false,
            Arc::new(DisabledVerifiers::new()),
            Arc::new(RecentFingerprints::new()),
            Duration::from_secs(5),
        );
        let (tx, rx) = oneshot::channel();
        pool.try_submit(VerifyJob {
            data: garbage(ProvingSystem::PlonkBn254),
            verdict_tx: tx,
        })
        .unwrap_or_else(|_| panic!("channel full"));
        assert_eq!(rx.await.unwrap(), Verdict::Valid);
    }

    #[tokio::test]
    async fn duplicate_fingerprint_is_answered_from_the_recent_set() {
        let recent = Arc::new(RecentFingerprints::new());
        let data = garbage(ProvingSystem::Sp1);
        recent.insert(data.fingerprint(), true);

        let pool = VerifierPool::spawn(
            2,
            true,
            Arc::new(DisabledVerifiers::new()),
            Arc::clone(&recent),
            Duration::from_secs(5),
        );
        let (tx, rx) = oneshot::channel();
        pool.try_submit(VerifyJob {
            data,
            verdict_tx: tx,
        })
        .unwrap_or_else(|_| panic!("channel full"));
        // answered Valid without re-running the (garbage) verifier
        assert_eq!(rx.await.unwrap(), Verdict::Valid);
    }
}
