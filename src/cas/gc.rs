//! Background garbage collection for the content-addressed store.
//!
//! A blob becomes collectible once its refcount has dropped to (or below)
//! `gc_min_refcount` and it has not been accessed for `gc_max_age`. Deleting
//! a blob entry releases its chunk references; chunks that reach zero
//! refcount as a result are purged from the backend in the same pass.

use crate::cas::store::ContentStore;
use crate::config::CasConfig;
use crate::error::Result;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument};

/// Summary of a single GC pass, returned for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    /// Blobs whose entries were removed.
    pub blobs_collected: usize,
    /// Chunks physically deleted from the backend.
    pub chunks_collected: usize,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Run a single GC pass over `store`, collecting blobs eligible per
/// `config.gc_max_age` / `config.gc_min_refcount`.
#[instrument(skip(store, config))]
pub async fn collect_once(store: &ContentStore, config: &CasConfig) -> Result<GcReport> {
    let mut report = GcReport::default();
    let max_age_secs = config.gc_max_age.as_secs();
    let now = now_secs();

    for digest in store.list().await {
        let Some(entry) = store.blob_entry(&digest) else {
            continue;
        };
        if entry.refcount > config.gc_min_refcount {
            continue;
        }
        let age = now.saturating_sub(entry.last_accessed);
        if age < max_age_secs {
            continue;
        }

        let freed_chunks = store.remove_blob_entry(&digest).await?;
        report.blobs_collected += 1;
        debug!(blob = %digest, freed_chunks = freed_chunks.len(), "collected blob");

        for chunk_digest in freed_chunks {
            store.purge_chunk(&chunk_digest).await?;
            report.chunks_collected += 1;
        }
    }

    // Loose chunks a crashed or abandoned transfer left behind: held by no
    // blob, so nothing but this sweep will ever reclaim them.
    for chunk_digest in store.zero_refcount_chunks() {
        store.purge_chunk(&chunk_digest).await?;
        report.chunks_collected += 1;
    }

    let hot = store.hot_blobs(HOT_ACCESS_THRESHOLD);
    if !hot.is_empty() {
        debug!(hot_blobs = hot.len(), "access-count pass marked hot blobs");
    }

    if report.blobs_collected > 0 || report.chunks_collected > 0 {
        info!(
            blobs = report.blobs_collected,
            chunks = report.chunks_collected,
            "gc pass reclaimed storage"
        );
    }

    Ok(report)
}

/// Reads since creation past which a blob counts as hot.
const HOT_ACCESS_THRESHOLD: u64 = 100;

/// Run GC passes on `config.gc_interval` until `shutdown` resolves. Intended
/// to be spawned as a background task by `node::NodeHandle::start`, never
/// from a constructor.
pub async fn run_periodic(
    store: Arc<ContentStore>,
    config: CasConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.gc_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = collect_once(&store, &config).await {
                    tracing::warn!(error = %e, "gc pass failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
