//! Streaming connection server.
//!
//! Clients hold one long-lived WebSocket and send CBOR submission frames.
//! Every submission gets exactly one terminal reply, delivered in
//! submission order on that connection. Rejections that can be decided
//! synchronously (signature, limits, window) are answered immediately;
//! accepted entries are answered when their batch settles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::RejectKind;
use crate::fees::NonPayingPolicy;
use crate::ledger::FeeLedgerClient;
use crate::queue::{EntryReply, PendingEntry, PriorityQueue};
use crate::storage::BatchLog;
use crate::types::{
    from_cbor, to_cbor, EntryState, SubmitReply, SubmitRequest,
};
use crate::verifier::{Verdict, VerifierPool, VerifyJob};

/// Slack on top of the proof size limit for the CBOR envelope.
const FRAME_OVERHEAD: usize = 1024 * 1024;

pub struct AppState {
    pub queue: Arc<PriorityQueue>,
    pub ledger: Arc<FeeLedgerClient>,
    pub verifier: VerifierPool,
    pub batch_log: Arc<BatchLog>,
    pub non_paying: Option<NonPayingPolicy>,
    pub max_proof_size: usize,
    pub max_inflight_per_connection: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "aligned-batcher",
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.queue.stats();
    Json(json!({
        "queued_entries": stats.entries,
        "queued_bytes": stats.bytes,
        "oldest_enqueued_block": stats.oldest_enqueued_block,
        "tracked_batches": state.batch_log.len(),
        "rpc_degraded": state.ledger.degraded(),
    }))
}

async fn ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let max_frame = state.max_proof_size + FRAME_OVERHEAD;
    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| handle_connection(socket, state))
}

/// One reply slot per submission, kept in submission order.
enum ReplySlot {
    /// Decided synchronously.
    Immediate(SubmitReply),
    /// Resolved when the entry reaches a terminal state.
    Pending(oneshot::Receiver<SubmitReply>),
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    info!("client connected");
    counter!("batcher_connections_opened").increment(1);

    let (mut sink, mut stream) = socket.split();
    let (slot_tx, mut slot_rx) = mpsc::unbounded_channel::<ReplySlot>();
    let in_flight = Arc::new(AtomicUsize::new(0));

    // Writer half: drains reply slots in submission order. A dropped reply
    // channel (discarded batch at shutdown) surfaces as `Internal`.
    let writer_in_flight = Arc::clone(&in_flight);
    let writer = tokio::spawn(async move {
        while let Some(slot) = slot_rx.recv().await {
            let reply = match slot {
                ReplySlot::Immediate(reply) => reply,
                ReplySlot::Pending(rx) => {
                    let reply = rx
                        .await
                        .unwrap_or_else(|_| SubmitReply::reject(RejectKind::Internal));
                    writer_in_flight.fetch_sub(1, Ordering::Relaxed);
                    reply
                }
            };
            let bytes = match to_cbor(&reply) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "failed to encode reply");
                    break;
                }
            };
            if sink.send(Message::Binary(bytes)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Binary(data)) => {
                if handle_frame(&state, &data, &slot_tx, &in_flight).is_break() {
                    break;
                }
            }
            Ok(Message::Text(_)) => {
                // Binary protocol only; a text frame is a fatal violation.
                let _ = slot_tx.send(ReplySlot::Immediate(SubmitReply::Error {
                    error_kind: RejectKind::Internal,
                    message: "text frames are not supported".into(),
                }));
                break;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    drop(slot_tx);
    let _ = writer.await;
    counter!("batcher_connections_closed").increment(1);
    info!("client disconnected");
}

/// Synchronous part of submission handling: decode, authenticate, check
/// limits, reserve the reply slot. The slow path (verification, ledger,
/// enqueue) continues in a spawned task so the connection keeps reading.
fn handle_frame(
    state: &Arc<AppState>,
    data: &[u8],
    slot_tx: &mpsc::UnboundedSender<ReplySlot>,
    in_flight: &Arc<AtomicUsize>,
) -> std::ops::ControlFlow<()> {
    let request: SubmitRequest = match from_cbor(data) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "undecodable submission frame");
            let _ = slot_tx.send(ReplySlot::Immediate(SubmitReply::Error {
                error_kind: RejectKind::Internal,
                message: "undecodable submission frame".into(),
            }));
            return std::ops::ControlFlow::Break(());
        }
    };

    let reject = |kind: RejectKind| {
        counter!("batcher_submissions_rejected").increment(1);
        let _ = slot_tx.send(ReplySlot::Immediate(SubmitReply::reject(kind)));
        std::ops::ControlFlow::Continue(())
    };

    // structural limits before any crypto
    if !within_size_limit(&request.verification_data, state.max_proof_size) {
        return reject(RejectKind::ProofTooLarge);
    }

    let sender = match request.recover_submitter() {
        Ok(sender) => sender,
        Err(kind) => return reject(kind),
    };

    // bounded in-flight window per connection
    if in_flight.load(Ordering::Relaxed) >= state.max_inflight_per_connection {
        return reject(RejectKind::RateLimited);
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    let payer = NonPayingPolicy::payer_for(state.non_paying.as_ref(), sender);

    // hand the CPU-bound part to the pre-verifier pool
    let (verdict_tx, verdict_rx) = oneshot::channel();
    let job = VerifyJob {
        data: request.verification_data.clone(),
        verdict_tx,
    };
    if state.verifier.try_submit(job).is_err() {
        return reject(RejectKind::RateLimited);
    }

    in_flight.fetch_add(1, Ordering::Relaxed);
    let _ = slot_tx.send(ReplySlot::Pending(reply_rx));
    counter!("batcher_submissions_received").increment(1);

    let state = Arc::clone(state);
    let slot_probe = slot_tx.clone();
    tokio::spawn(async move {
        settle_submission(state, request, sender, payer, verdict_rx, reply_tx, slot_probe).await;
    });
    std::ops::ControlFlow::Continue(())
}

/// An entry at exactly `max_proof_size` is accepted; one byte over fails.
fn within_size_limit(data: &crate::types::VerificationData, max_proof_size: usize) -> bool {
    data.proof.len() <= max_proof_size && data.payload_len() <= max_proof_size
}

/// Awaits the verification verdict, re-checks the ledger under the payer's
/// latch, and enqueues. Any rejection resolves the reserved reply slot.
async fn settle_submission(
    state: Arc<AppState>,
    request: SubmitRequest,
    sender: alloy_primitives::Address,
    payer: alloy_primitives::Address,
    verdict_rx: oneshot::Receiver<Verdict>,
    reply_tx: oneshot::Sender<SubmitReply>,
    slot_probe: mpsc::UnboundedSender<ReplySlot>,
) {
    let mut reply = EntryReply::new(reply_tx);

    let verdict = match verdict_rx.await {
        Ok(verdict) => verdict,
        Err(_) => {
            reply.send(SubmitReply::reject(RejectKind::Internal));
            return;
        }
    };
    match verdict {
        Verdict::Valid => {}
        Verdict::Disabled => {
            counter!("batcher_submissions_rejected").increment(1);
            reply.send(SubmitReply::reject(RejectKind::VerifierDisabled));
            return;
        }
        Verdict::Invalid(reason) => {
            debug!(%sender, reason, "proof failed pre-verification");
            counter!("batcher_submissions_rejected").increment(1);
            reply.send(SubmitReply::reject(RejectKind::MalformedProof));
            return;
        }
    }

    // The connection dropping cancels entries that are still this side of
    // the queue; once queued they live or die by the batch outcome.
    if slot_probe.is_closed() {
        debug!(%sender, "connection gone before enqueue, dropping entry");
        return;
    }

    // Balance and nonce checks are atomic per payer under the latch.
    let _latch = state.ledger.latch(payer).await;
    let ledger = match state.ledger.get(payer).await {
        Ok(ledger) => ledger,
        Err(e) => {
            warn!(%payer, error = %e, "ledger read failed");
            reply.send(SubmitReply::reject(e.reject_kind()));
            return;
        }
    };
    if ledger.unlock_block != 0 {
        // funds are being withdrawn; do not take new work against them
        reply.send(SubmitReply::reject(RejectKind::InsufficientBalance));
        return;
    }
    if ledger.balance < request.max_fee {
        counter!("batcher_submissions_rejected").increment(1);
        reply.send(SubmitReply::reject(RejectKind::InsufficientBalance));
        return;
    }

    let data = request.nonced();
    let fingerprint = data.verification_data.fingerprint();
    let size_bytes = data.verification_data.payload_len();
    let enqueued_block = state.ledger.latest_block().await.unwrap_or_default();
    let entry = PendingEntry {
        data,
        sender,
        payer,
        fingerprint,
        size_bytes,
        enqueued_block,
        arrival: 0,
        state: EntryState::Verified,
        retries: 0,
        reply,
    };

    match state.queue.push(entry, ledger.nonce) {
        Ok(outcome) => {
            debug!(%payer, nonce = request.nonce, ?outcome, "entry queued");
            counter!("batcher_submissions_queued").increment(1);
        }
        Err(kind) => {
            // the queue already delivered the terminal reply
            debug!(%payer, nonce = request.nonce, %kind, "entry rejected by queue");
            counter!("batcher_submissions_rejected").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProvingSystem, VerificationData};
    use alloy_primitives::{Address, U256};

    #[test]
    fn reply_slots_resolve_in_submission_order() {
        // Immediate slots carry the reply; pending ones carry the receiver.
        // Ordering is positional in the channel, which the writer drains
        // sequentially, so a resolved later entry cannot overtake an
        // unresolved earlier one.
        let (slot_tx, mut slot_rx) = mpsc::unbounded_channel::<ReplySlot>();
        let (tx1, rx1) = oneshot::channel();
        slot_tx.send(ReplySlot::Pending(rx1)).unwrap();
        slot_tx
            .send(ReplySlot::Immediate(SubmitReply::reject(
                RejectKind::RateLimited,
            )))
            .unwrap();

        // later submission resolves first
        tx1.send(SubmitReply::reject(RejectKind::MalformedProof))
            .unwrap();

        match slot_rx.try_recv().unwrap() {
            ReplySlot::Pending(rx) => match rx.blocking_recv().unwrap() {
                SubmitReply::Error { error_kind, .. } => {
                    assert_eq!(error_kind, RejectKind::MalformedProof)
                }
                other => panic!("unexpected reply {other:?}"),
            },
            ReplySlot::Immediate(_) => panic!("first slot should be pending"),
        }
        match slot_rx.try_recv().unwrap() {
            ReplySlot::Immediate(SubmitReply::Error { error_kind, .. }) => {
                assert_eq!(error_kind, RejectKind::RateLimited)
            }
            _ => panic!("second slot should be immediate"),
        }
    }

    #[test]
    fn proof_size_boundary_is_exact() {
        let data = |n: usize| VerificationData {
            proving_system: ProvingSystem::Sp1,
            proof: vec![0u8; n],
            public_input: None,
            verification_key: None,
            vm_program_code: None,
            proof_generator_addr: Address::ZERO,
        };
        assert!(within_size_limit(&data(32), 32));
        assert!(!within_size_limit(&data(33), 32));

        // auxiliary components count toward the payload limit
        let mut padded = data(20);
        padded.public_input = Some(vec![0u8; 13]);
        assert!(!within_size_limit(&padded, 32));
        padded.public_input = Some(vec![0u8; 12]);
        assert!(within_size_limit(&padded, 32));
    }

    #[test]
    fn request_types_are_shared_with_the_wire() {
        let request = SubmitRequest {
            verification_data: VerificationData {
                proving_system: ProvingSystem::Sp1,
                proof: vec![0u8; 4],
                public_input: None,
                verification_key: None,
                vm_program_code: None,
                proof_generator_addr: Address::ZERO,
            },
            max_fee: U256::from(1u64),
            nonce: 0,
            signature: vec![0u8; 65],
        };
        let bytes = to_cbor(&request).unwrap();
        let decoded: SubmitRequest = from_cbor(&bytes).unwrap();
        assert_eq!(decoded.verification_data, request.verification_data);
    }
}
