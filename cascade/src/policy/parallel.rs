//! Parallel batch evaluation — JoinSet fan-out over id-sorted chunks.
//!
//! ```text
//! LogitCache (sorted by segment id)
//!     │  split into contiguous chunks
//!     ▼
//! JoinSet::spawn(chunk_i) × N   (Semaphore: `workers` at a time)
//!     │  each chunk runs on the blocking pool
//!     ▼
//! merge by chunk index → Vec<Decision> in segment-id order
//! ```
//!
//! Decisions are independent per input, so the only coordination is the
//! merge. Cancelling the token aborts the batch: no partial decision list is
//! ever returned.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::evaluator::{Decision, PolicyEvaluator};
use crate::error::{CascadeError, CascadeResult};
use crate::scores::LogitCache;

/// Chunks per worker, so a slow chunk does not idle the rest of the pool
const CHUNKS_PER_WORKER: usize = 4;

type ChunkOutcome = CascadeResult<(usize, Option<Vec<Decision>>)>;

/// Evaluate every entry of `cache` on up to `workers` blocking threads.
///
/// Returns the same decisions, in the same order, as
/// [`PolicyEvaluator::evaluate_cache`]. Fails with [`CascadeError::Cancelled`]
/// when `cancel` fires before the batch completes, and with the first
/// per-input error otherwise.
pub async fn evaluate_parallel(
    evaluator: Arc<PolicyEvaluator>,
    cache: Arc<LogitCache>,
    workers: usize,
    cancel: CancellationToken,
) -> CascadeResult<Vec<Decision>> {
    cache.ensure_profile(evaluator.profile())?;
    let total = cache.len();
    let workers = workers.max(1);
    let chunk_size = total.div_ceil(workers * CHUNKS_PER_WORKER).max(1);
    let num_chunks = total.div_ceil(chunk_size);

    let sem = Arc::new(Semaphore::new(workers));
    let batch = cancel.child_token();
    let completed = Arc::new(AtomicUsize::new(0));
    let mut join_set: JoinSet<ChunkOutcome> = JoinSet::new();

    for index in 0..num_chunks {
        let start = index * chunk_size;
        let end = (start + chunk_size).min(total);
        join_set.spawn(run_chunk(
            index,
            start..end,
            evaluator.clone(),
            cache.clone(),
            sem.clone(),
            batch.clone(),
            completed.clone(),
        ));
    }

    let mut chunks: Vec<Option<Vec<Decision>>> = vec![None; num_chunks];
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                batch.cancel();
                join_set.abort_all();
                let done = completed.load(Ordering::Relaxed);
                warn!(
                    completed = done,
                    total,
                    "policy evaluation cancelled; discarding partial decisions"
                );
                return Err(CascadeError::Cancelled { completed: done, total });
            }
            next = join_set.join_next() => match next {
                None => break,
                Some(Ok(Ok((index, Some(decisions))))) => {
                    debug!(chunk = index, decisions = decisions.len(), "chunk evaluated");
                    chunks[index] = Some(decisions);
                }
                // Chunk observed the token; the cancelled branch reports it
                Some(Ok(Ok((_, None)))) => {}
                Some(Ok(Err(e))) => {
                    batch.cancel();
                    join_set.abort_all();
                    return Err(e);
                }
                Some(Err(e)) => {
                    batch.cancel();
                    join_set.abort_all();
                    return Err(CascadeError::Worker { message: e.to_string() });
                }
            }
        }
    }

    let mut decisions = Vec::with_capacity(total);
    for chunk in chunks {
        match chunk {
            Some(chunk) => decisions.extend(chunk),
            None => {
                return Err(CascadeError::Cancelled {
                    completed: completed.load(Ordering::Relaxed),
                    total,
                })
            }
        }
    }

    info!(
        variant = %evaluator.variant().label,
        decisions = decisions.len(),
        workers,
        chunks = num_chunks,
        "policy evaluated in parallel"
    );
    Ok(decisions)
}

/// Decide one contiguous slice of the cache on the blocking pool.
///
/// `None` means the batch was cancelled before the slice finished.
async fn run_chunk(
    index: usize,
    range: Range<usize>,
    evaluator: Arc<PolicyEvaluator>,
    cache: Arc<LogitCache>,
    sem: Arc<Semaphore>,
    batch: CancellationToken,
    completed: Arc<AtomicUsize>,
) -> ChunkOutcome {
    let _permit = sem.acquire_owned().await.map_err(|e| CascadeError::Worker {
        message: e.to_string(),
    })?;
    if batch.is_cancelled() {
        return Ok((index, None));
    }
    tokio::task::spawn_blocking(move || -> ChunkOutcome {
        let mut decisions = Vec::with_capacity(range.len());
        for entry in &cache.entries[range] {
            if batch.is_cancelled() {
                return Ok((index, None));
            }
            decisions.push(evaluator.decide(entry)?);
            completed.fetch_add(1, Ordering::Relaxed);
        }
        Ok((index, Some(decisions)))
    })
    .await
    .map_err(|e| CascadeError::Worker {
        message: e.to_string(),
    })?
}

/// Worker count when none is configured
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
