mod config;
mod connection;
mod contracts;
mod error;
mod fees;
mod finalizer;
mod ledger;
mod merkle;
mod queue;
mod storage;
mod submitter;
mod types;
mod verifier;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{BatcherConfig, StorageBackend};
use crate::connection::AppState;
use crate::error::RejectKind;
use crate::fees::NonPayingPolicy;
use crate::finalizer::Finalizer;
use crate::ledger::FeeLedgerClient;
use crate::queue::PriorityQueue;
use crate::storage::{BatchLog, MemoryStore, S3Store};
use crate::submitter::SubmissionEngine;
use crate::types::ProvingSystem;
use crate::verifier::{DisabledVerifiers, RecentFingerprints, VerifierPool};

#[tokio::main]
async fn main() {
    // env-filter: RUST_LOG=aligned_batcher=debug,info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aligned_batcher=info,tower_http=info".into()),
        )
        .init();

    let config = match BatcherConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[aligned-batcher] configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Some(port) = config.metrics_port {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            eprintln!("[aligned-batcher] metrics exporter error: {e}");
            std::process::exit(1);
        }
        info!(%addr, "prometheus exporter listening");
    }

    info!(
        host = %config.host,
        port = config.port,
        payment_service = %config.payment_service_address,
        service_manager = %config.service_manager_address,
        pre_verification = config.pre_verification_is_enabled,
        workers = config.verifier_workers,
        "starting batcher"
    );
    if let Some(sink) = &config.telemetry_ip_port_address {
        info!(sink, "telemetry sink configured");
    }

    let ledger = match FeeLedgerClient::connect(
        &config.eth_rpc_url,
        config.eth_rpc_url_fallback.as_deref(),
        &config.eth_ws_url,
        config.eth_ws_url_fallback.as_deref(),
        config.payment_service_address,
        config.service_manager_address,
    )
    .await
    {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("[aligned-batcher] rpc error: {e}");
            std::process::exit(1);
        }
    };

    // Boot-time state from contract queries: the disabled-verifier bitmap.
    let disabled = Arc::new(DisabledVerifiers::new());
    for system in ProvingSystem::ALL {
        match ledger.is_verifier_disabled(system.as_u8()).await {
            Ok(is_disabled) => disabled.set(system.as_u8(), is_disabled),
            Err(e) => {
                eprintln!("[aligned-batcher] failed to read verifier bitmap: {e}");
                std::process::exit(1);
            }
        }
    }
    ledger.spawn_block_watcher();

    let recent = Arc::new(RecentFingerprints::new());
    let verifier = VerifierPool::spawn(
        config.verifier_workers,
        config.pre_verification_is_enabled,
        Arc::clone(&disabled),
        recent,
        Duration::from_secs(config.verification_timeout_secs),
    );
    if !config.pre_verification_is_enabled {
        warn!("pre-verification is DISABLED; queued proofs are not checked before batching");
    }

    let queue = Arc::new(PriorityQueue::new());
    let batch_log = Arc::new(BatchLog::new());
    batch_log.spawn_eviction_task();
    ledger.spawn_event_listener(Arc::clone(&disabled), Arc::clone(&batch_log));

    let submitter = match SubmissionEngine::connect(&config).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("[aligned-batcher] submitter error: {e}");
            std::process::exit(1);
        }
    };
    info!(wallet = %submitter.wallet_address(), "submission wallet ready");

    let non_paying = config.non_paying_address.map(|address| NonPayingPolicy {
        address,
        replacement: config
            .non_paying_replacement_signer
            .as_ref()
            .map(|signer| signer.address())
            .expect("validated together with the address"),
    });
    if let Some(policy) = &non_paying {
        info!(address = %policy.address, replacement = %policy.replacement, "non-paying policy active");
    }

    match config.storage_backend {
        StorageBackend::S3 => {
            let store = match S3Store::new(
                &config.s3_bucket_name,
                &config.s3_region,
                config.s3_endpoint.as_deref(),
                &config.download_base_url,
            ) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    eprintln!("[aligned-batcher] storage error: {e}");
                    std::process::exit(1);
                }
            };
            Finalizer::new(
                &config,
                Arc::clone(&queue),
                Arc::clone(&ledger),
                Arc::clone(&submitter),
                store,
                Arc::clone(&batch_log),
            )
            .spawn();
        }
        StorageBackend::Memory => {
            warn!("using in-memory object store; operators cannot fetch payloads");
            Finalizer::new(
                &config,
                Arc::clone(&queue),
                Arc::clone(&ledger),
                Arc::clone(&submitter),
                Arc::new(MemoryStore::new()),
                Arc::clone(&batch_log),
            )
            .spawn();
        }
    }

    let state = Arc::new(AppState {
        queue: Arc::clone(&queue),
        ledger: Arc::clone(&ledger),
        verifier,
        batch_log,
        non_paying,
        max_proof_size: config.max_proof_size,
        max_inflight_per_connection: config.max_inflight_per_connection,
    });
    let app = connection::router(state);

    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("[aligned-batcher] invalid listen address: {e}");
            std::process::exit(1);
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("[aligned-batcher] failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    info!(%addr, "batcher listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(queue))
        .await
    {
        eprintln!("[aligned-batcher] server error: {e}");
        std::process::exit(1);
    }

    info!("batcher shut down");
}

async fn shutdown_signal(queue: Arc<PriorityQueue>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }

    // Open batches never survive a restart; the payment contract replay
    // makes queued work safe to drop. Still-connected clients get their
    // terminal reply before the server stops accepting writes.
    let stats = queue.stats();
    if stats.entries > 0 {
        let drained = queue.drain_and_reject(RejectKind::Internal);
        warn!(
            drained,
            bytes = stats.bytes,
            "discarded queued entries on shutdown"
        );
    }
}
