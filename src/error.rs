use serde::{Deserialize, Serialize};

/// Client-facing error taxonomy. Every rejected submission is answered with
/// exactly one of these kinds; anything the client cannot act on collapses
/// into `Internal` with the detail kept in server logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    InvalidSignature,
    InvalidNonce,
    InsufficientBalance,
    MalformedProof,
    VerifierDisabled,
    ProofTooLarge,
    RateLimited,
    BatchSubmissionFailed,
    RpcUnavailable,
    StorageUnavailable,
    Internal,
}

impl RejectKind {
    /// Sanitized message shown to clients. Internal details are logged
    /// server-side only.
    pub fn public_message(self) -> &'static str {
        match self {
            RejectKind::InvalidSignature => "signature does not match submitter",
            RejectKind::InvalidNonce => "nonce is not the next expected value",
            RejectKind::InsufficientBalance => "submitter balance does not cover the fee",
            RejectKind::MalformedProof => "proof failed pre-verification",
            RejectKind::VerifierDisabled => "proving system is currently disabled",
            RejectKind::ProofTooLarge => "proof exceeds the maximum size",
            RejectKind::RateLimited => "too many in-flight submissions",
            RejectKind::BatchSubmissionFailed => "batch could not be anchored on-chain",
            RejectKind::RpcUnavailable => "upstream rpc unavailable",
            RejectKind::StorageUnavailable => "object storage unavailable",
            RejectKind::Internal => "internal error",
        }
    }
}

impl std::fmt::Display for RejectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectKind::InvalidSignature => "invalid_signature",
            RejectKind::InvalidNonce => "invalid_nonce",
            RejectKind::InsufficientBalance => "insufficient_balance",
            RejectKind::MalformedProof => "malformed_proof",
            RejectKind::VerifierDisabled => "verifier_disabled",
            RejectKind::ProofTooLarge => "proof_too_large",
            RejectKind::RateLimited => "rate_limited",
            RejectKind::BatchSubmissionFailed => "batch_submission_failed",
            RejectKind::RpcUnavailable => "rpc_unavailable",
            RejectKind::StorageUnavailable => "storage_unavailable",
            RejectKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Internal error type for the batch pipeline. Converted to a [`RejectKind`]
/// at the connection boundary via [`BatcherError::reject_kind`].
#[derive(Debug, thiserror::Error)]
pub enum BatcherError {
    #[error("rpc: {0}")]
    Rpc(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("submission: {0}")]
    Submission(String),
    #[error("ledger: {0}")]
    Ledger(String),
    #[error("wire: {0}")]
    Wire(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl BatcherError {
    pub fn reject_kind(&self) -> RejectKind {
        match self {
            BatcherError::Rpc(_) => RejectKind::RpcUnavailable,
            BatcherError::Storage(_) => RejectKind::StorageUnavailable,
            BatcherError::Submission(_) => RejectKind::BatchSubmissionFailed,
            BatcherError::Ledger(_) => RejectKind::RpcUnavailable,
            BatcherError::Wire(_) | BatcherError::Internal(_) => RejectKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_kind_round_trips_through_cbor() {
        let mut buf = Vec::new();
        ciborium::into_writer(&RejectKind::InvalidNonce, &mut buf).unwrap();
        let back: RejectKind = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(back, RejectKind::InvalidNonce);
    }

    #[test]
    fn internal_errors_never_leak_detail() {
        let err = BatcherError::Internal("database password is hunter2".into());
        assert_eq!(err.reject_kind(), RejectKind::Internal);
        assert_eq!(err.reject_kind().public_message(), "internal error");
    }
}
