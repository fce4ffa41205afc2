//! Full block retrieval for filter-hit heights
//!
//! Subchain tasks hand the fetcher the candidate heights of one scan pass and
//! receive a [`BlockJob`] streaming blocks back as they arrive, in whatever
//! order the source answers. Commit ordering is the subchain's concern; the
//! fetcher only bounds concurrency and verifies that each block hashes to the
//! hash it was requested by.

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedSender;

use bitcoin::{Block, BlockHash};

use crate::client::{self, FetchRequest};
use crate::error::FetchError;

const MAX_BLOCK_ATTEMPTS: u32 = 3;
const MAX_INFLIGHT_BLOCKS: usize = 8;

/// A batch of in-flight block requests.
///
/// Results stream out of order; a failed height reports its error after the
/// bounded retry budget is spent so the owning subchain can abort the pass.
pub(crate) struct BlockJob {
    receiver: mpsc::Receiver<(u64, Result<Block, FetchError>)>,
}

impl BlockJob {
    /// The next completed block, or `None` when every height has reported.
    pub(crate) async fn next(&mut self) -> Option<(u64, Result<Block, FetchError>)> {
        self.receiver.recv().await
    }
}

/// Starts fetching the given blocks with bounded concurrency.
///
/// Requires [`crate::client::fetch::fetch`] to be running concurrently,
/// connected via the `fetch_request` channel.
pub(crate) fn get_job(
    fetch_request_sender: UnboundedSender<FetchRequest>,
    blocks: Vec<(u64, BlockHash)>,
) -> BlockJob {
    let (sender, receiver) = mpsc::channel(blocks.len().max(1));

    tokio::spawn(async move {
        let mut pending = blocks.into_iter();
        let mut inflight = FuturesUnordered::new();

        loop {
            while inflight.len() < MAX_INFLIGHT_BLOCKS {
                let Some((height, hash)) = pending.next() else {
                    break;
                };
                let request_sender = fetch_request_sender.clone();
                inflight.push(async move {
                    (height, fetch_block(&request_sender, height, hash).await)
                });
            }

            let Some(result) = inflight.next().await else {
                break;
            };
            // receiver dropped means the job was abandoned mid-pass
            if sender.send(result).await.is_err() {
                break;
            }
        }
    });

    BlockJob { receiver }
}

// fetches one block, re-requesting on failure or hash mismatch up to the
// attempt budget.
async fn fetch_block(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    height: u64,
    hash: BlockHash,
) -> Result<Block, FetchError> {
    let mut last_error = FetchError::Disconnected;

    for attempt in 1..=MAX_BLOCK_ATTEMPTS {
        match client::get_block(fetch_request_sender, height, hash).await {
            Ok(block) => {
                let got = block.block_hash();
                if got == hash {
                    return Ok(block);
                }
                tracing::warn!(
                    "Block at height {} hashed to {}, expected {} (attempt {})",
                    height,
                    got,
                    hash,
                    attempt
                );
                last_error =
                    FetchError::Transient(format!("block hash mismatch at height {}", height));
            }
            Err(FetchError::Disconnected) => return Err(FetchError::Disconnected),
            Err(error) => {
                tracing::warn!(
                    "Block fetch at height {} failed (attempt {}): {}",
                    height,
                    attempt,
                    error
                );
                last_error = error;
            }
        }
    }

    Err(last_error)
}
