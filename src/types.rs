use alloy_primitives::{keccak256, Address, Signature, B256, U256};
use serde::{Deserialize, Serialize};

use crate::error::RejectKind;

/// Proving systems accepted by the batcher. The `u8` id doubles as the bit
/// position in the on-chain disabled-verifier bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvingSystem {
    Groth16Bn254,
    PlonkBn254,
    PlonkBls12_381,
    Sp1,
    Risc0,
}

impl ProvingSystem {
    pub const ALL: [ProvingSystem; 5] = [
        ProvingSystem::Groth16Bn254,
        ProvingSystem::PlonkBn254,
        ProvingSystem::PlonkBls12_381,
        ProvingSystem::Sp1,
        ProvingSystem::Risc0,
    ];

    pub const fn as_u8(self) -> u8 {
        match self {
            ProvingSystem::Groth16Bn254 => 0,
            ProvingSystem::PlonkBn254 => 1,
            ProvingSystem::PlonkBls12_381 => 2,
            ProvingSystem::Sp1 => 3,
            ProvingSystem::Risc0 => 4,
        }
    }
}

impl std::fmt::Display for ProvingSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProvingSystem::Groth16Bn254 => "groth16_bn254",
            ProvingSystem::PlonkBn254 => "plonk_bn254",
            ProvingSystem::PlonkBls12_381 => "plonk_bls12_381",
            ProvingSystem::Sp1 => "sp1",
            ProvingSystem::Risc0 => "risc0",
        };
        f.write_str(s)
    }
}

/// The verifier-relevant payload of one submission. Which of the optional
/// components must be present depends on the proving system:
///
/// - Groth16/Plonk carry `verification_key` and `public_input`;
/// - SP1 carries `vm_program_code` (the serialized verifying key);
/// - Risc0 carries `vm_program_code` (the 32-byte image id) and
///   `public_input` (the expected journal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationData {
    pub proving_system: ProvingSystem,
    pub proof: Vec<u8>,
    pub public_input: Option<Vec<u8>>,
    pub verification_key: Option<Vec<u8>>,
    pub vm_program_code: Option<Vec<u8>>,
    /// Identity stamped into the Merkle leaf. Not the payer.
    pub proof_generator_addr: Address,
}

impl VerificationData {
    pub fn proof_commitment(&self) -> B256 {
        keccak256(&self.proof)
    }

    pub fn pub_input_commitment(&self) -> B256 {
        keccak256(self.public_input.as_deref().unwrap_or_default())
    }

    /// Commitment over the proving-system-specific auxiliary data: the vm
    /// program when present, otherwise the verification key, otherwise empty.
    pub fn aux_commitment(&self) -> B256 {
        match (&self.vm_program_code, &self.verification_key) {
            (Some(code), _) => keccak256(code),
            (None, Some(vk)) => keccak256(vk),
            (None, None) => keccak256([0u8; 0]),
        }
    }

    /// The Merkle leaf preimage:
    /// `proof_commitment ‖ pub_input_commitment ‖ aux_commitment ‖ proof_generator_addr`.
    pub fn fingerprint_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 * 3 + 20);
        out.extend_from_slice(self.proof_commitment().as_slice());
        out.extend_from_slice(self.pub_input_commitment().as_slice());
        out.extend_from_slice(self.aux_commitment().as_slice());
        out.extend_from_slice(self.proof_generator_addr.as_slice());
        out
    }

    /// The Merkle leaf: keccak over [`Self::fingerprint_bytes`].
    pub fn fingerprint(&self) -> B256 {
        keccak256(self.fingerprint_bytes())
    }

    /// Serialized size used for queue byte accounting and batch size caps.
    pub fn payload_len(&self) -> usize {
        self.proof.len()
            + self.public_input.as_ref().map_or(0, Vec::len)
            + self.verification_key.as_ref().map_or(0, Vec::len)
            + self.vm_program_code.as_ref().map_or(0, Vec::len)
    }
}

/// [`VerificationData`] plus the fee/nonce pair the submitter signed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoncedVerificationData {
    pub verification_data: VerificationData,
    pub max_fee: U256,
    pub nonce: u64,
}

impl NoncedVerificationData {
    /// The digest clients sign with `personal_sign`: keccak over the CBOR
    /// encoding of the nonced payload.
    pub fn signing_digest(&self) -> Result<B256, ciborium::ser::Error<std::io::Error>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(keccak256(&buf))
    }
}

/// One client→server frame: a CBOR map carrying the nonced payload and a
/// 65-byte EIP-191 signature over its digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub verification_data: VerificationData,
    pub max_fee: U256,
    pub nonce: u64,
    pub signature: Vec<u8>,
}

impl SubmitRequest {
    pub fn nonced(&self) -> NoncedVerificationData {
        NoncedVerificationData {
            verification_data: self.verification_data.clone(),
            max_fee: self.max_fee,
            nonce: self.nonce,
        }
    }

    /// Recovers the submitter address from the EIP-191 signature. Failure of
    /// any step maps to `InvalidSignature`.
    pub fn recover_submitter(&self) -> Result<Address, RejectKind> {
        if self.signature.len() != 65 {
            return Err(RejectKind::InvalidSignature);
        }
        let signature = Signature::try_from(self.signature.as_slice())
            .map_err(|_| RejectKind::InvalidSignature)?;
        let digest = self
            .nonced()
            .signing_digest()
            .map_err(|_| RejectKind::InvalidSignature)?;
        signature
            .recover_address_from_msg(digest.as_slice())
            .map_err(|_| RejectKind::InvalidSignature)
    }
}

/// One server→client frame: either the terminal inclusion acknowledgment or
/// a typed error. Exactly one terminal reply is sent per submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubmitReply {
    Inclusion {
        batch_merkle_root: B256,
        merkle_proof: Vec<B256>,
        index_in_batch: u32,
    },
    Error {
        error_kind: RejectKind,
        message: String,
    },
}

impl SubmitReply {
    pub fn reject(kind: RejectKind) -> Self {
        SubmitReply::Error {
            error_kind: kind,
            message: kind.public_message().to_string(),
        }
    }
}

/// Lifecycle of one entry from receipt to terminal acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Received,
    Verified,
    Queued,
    InBatch,
    Confirmed,
    Rejected,
}

pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, crate::error::BatcherError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| crate::error::BatcherError::Wire(e.to_string()))?;
    Ok(buf)
}

pub fn from_cbor<T: for<'de> Deserialize<'de>>(
    bytes: &[u8],
) -> Result<T, crate::error::BatcherError> {
    ciborium::from_reader(bytes).map_err(|e| crate::error::BatcherError::Wire(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    fn sample_data() -> VerificationData {
        VerificationData {
            proving_system: ProvingSystem::Sp1,
            proof: vec![1, 2, 3, 4],
            public_input: Some(vec![5, 6]),
            verification_key: None,
            vm_program_code: Some(vec![7; 32]),
            proof_generator_addr: Address::repeat_byte(0xaa),
        }
    }

    #[test]
    fn fingerprint_is_stable_and_commits_to_all_fields() {
        let data = sample_data();
        let fp = data.fingerprint();
        assert_eq!(fp, data.fingerprint());

        let mut tampered = data.clone();
        tampered.proof[0] ^= 1;
        assert_ne!(fp, tampered.fingerprint());

        let mut regen = data.clone();
        regen.proof_generator_addr = Address::repeat_byte(0xbb);
        assert_ne!(fp, regen.fingerprint());
    }

    #[test]
    fn aux_commitment_prefers_vm_program() {
        let mut data = sample_data();
        let with_program = data.aux_commitment();
        data.vm_program_code = None;
        data.verification_key = Some(vec![9, 9]);
        assert_ne!(with_program, data.aux_commitment());
        data.verification_key = None;
        assert_eq!(data.aux_commitment(), keccak256([0u8; 0]));
    }

    #[test]
    fn submit_request_round_trips_through_cbor() {
        let request = SubmitRequest {
            verification_data: sample_data(),
            max_fee: U256::from(10_000_000_000_000_000u64),
            nonce: 3,
            signature: vec![0; 65],
        };
        let bytes = to_cbor(&request).unwrap();
        let back: SubmitRequest = from_cbor(&bytes).unwrap();
        assert_eq!(back.nonce, 3);
        assert_eq!(back.max_fee, request.max_fee);
        assert_eq!(back.verification_data, request.verification_data);
    }

    #[test]
    fn recover_submitter_matches_signer() {
        let signer = PrivateKeySigner::random();
        let nonced = NoncedVerificationData {
            verification_data: sample_data(),
            max_fee: U256::from(42u64),
            nonce: 0,
        };
        let digest = nonced.signing_digest().unwrap();
        let signature = signer.sign_message_sync(digest.as_slice()).unwrap();

        let request = SubmitRequest {
            verification_data: nonced.verification_data.clone(),
            max_fee: nonced.max_fee,
            nonce: nonced.nonce,
            signature: signature.as_bytes().to_vec(),
        };
        assert_eq!(request.recover_submitter().unwrap(), signer.address());
    }

    #[test]
    fn recover_submitter_rejects_garbage() {
        let request = SubmitRequest {
            verification_data: sample_data(),
            max_fee: U256::ZERO,
            nonce: 0,
            signature: vec![0xff; 64],
        };
        assert_eq!(
            request.recover_submitter().unwrap_err(),
            RejectKind::InvalidSignature
        );
    }
}
