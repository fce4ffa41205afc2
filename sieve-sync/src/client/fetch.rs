//! Queue and prioritise fetch requests to fetch data from the chain source

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::client::FetchRequest;
use crate::error::FetchError;
use crate::interface::ChainSource;

const MAX_REQUEST_ATTEMPTS: u32 = 3;
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Receives [`crate::client::FetchRequest`]'s via an [`tokio::sync::mpsc::UnboundedReceiver`]
/// for queueing, prioritisation and fetching from the chain source.
/// Returns the data specified in the [`crate::client::FetchRequest`] variant via the provided
/// [`tokio::sync::oneshot::Sender`].
///
/// Allows all requests to the source to be handled from a single task for efficiency and also
/// enables request prioritisation for further performance enhancement
pub async fn fetch<CS>(
    mut fetch_request_receiver: UnboundedReceiver<FetchRequest>,
    source: Arc<CS>,
) -> Result<(), FetchError>
where
    CS: ChainSource,
{
    let mut fetch_request_queue: Vec<FetchRequest> = Vec::new();

    loop {
        // `fetch` returns `Ok` here when all requests have been handled and the
        // fetch_request channel is closed on sync completion.
        if receive_fetch_requests(&mut fetch_request_receiver, &mut fetch_request_queue).await {
            return Ok(());
        }

        let fetch_request = select_fetch_request(&mut fetch_request_queue);

        if let Some(request) = fetch_request {
            fetch_from_source(source.as_ref(), request).await;
        }
    }
}

// receives fetch requests and populates the fetch request queue
//
// returns `true` if the fetch request channel is closed and all fetch requests have been
// completed, signalling sync is complete and no longer needs to fetch data from the source.
async fn receive_fetch_requests(
    receiver: &mut UnboundedReceiver<FetchRequest>,
    fetch_request_queue: &mut Vec<FetchRequest>,
) -> bool {
    // if there are no fetch requests to process, sleep until the next fetch request is received
    // or channel is closed
    if fetch_request_queue.is_empty() {
        if let Some(fetch_request) = receiver.recv().await {
            fetch_request_queue.push(fetch_request);
        }
    }
    // receive all remaining fetch requests from channel
    // when channel is empty return `false` to continue fetching data from the source
    // when channel is closed and all fetch requests are processed, return `true`
    loop {
        match receiver.try_recv() {
            Ok(fetch_request) => fetch_request_queue.push(fetch_request),
            Err(tokio::sync::mpsc::error::TryRecvError::Empty) => break,
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected) => {
                if fetch_request_queue.is_empty() {
                    return true;
                } else {
                    break;
                }
            }
        }
    }

    false
}

// selects the next fetch request to be processed, tip queries first, then headers,
// then filters, then blocks, so the oracles are never starved by bulk block fetches.
// returns `None` if the queue is empty.
fn select_fetch_request(fetch_request_queue: &mut Vec<FetchRequest>) -> Option<FetchRequest> {
    fetch_request_queue
        .iter()
        .enumerate()
        .min_by_key(|(_, request)| request_priority(request))
        .map(|(index, _)| index)
        .map(|index| fetch_request_queue.remove(index))
}

fn request_priority(request: &FetchRequest) -> u8 {
    match request {
        FetchRequest::ChainTip(_) => 0,
        FetchRequest::CommonAncestor(_, _) => 0,
        FetchRequest::HeaderRange(_, _) => 1,
        FetchRequest::FilterRange(_, _) => 2,
        FetchRequest::Block(_, _) => 3,
    }
}

async fn fetch_from_source<CS>(source: &CS, fetch_request: FetchRequest)
where
    CS: ChainSource,
{
    match fetch_request {
        FetchRequest::ChainTip(sender) => {
            tracing::debug!("Fetching chain tip.");
            let result = with_retries("chain tip", || source.chain_tip()).await;
            let _ = sender.send(result);
        }
        FetchRequest::CommonAncestor(sender, local) => {
            tracing::debug!("Fetching common ancestor of {}.", local);
            let result = with_retries("common ancestor", || source.common_ancestor(local)).await;
            let _ = sender.send(result);
        }
        FetchRequest::HeaderRange(sender, range) => {
            tracing::debug!("Fetching headers. {:?}", &range);
            let result = with_retries("header range", || source.header_range(range.clone())).await;
            let _ = sender.send(result);
        }
        FetchRequest::FilterRange(sender, range) => {
            tracing::debug!("Fetching filters. {:?}", &range);
            let result = with_retries("filter range", || source.filter_range(range.clone())).await;
            let _ = sender.send(result);
        }
        FetchRequest::Block(sender, (height, hash)) => {
            tracing::debug!("Fetching block at height {}.", height);
            let result = with_retries("block", || source.block(height, hash)).await;
            let _ = sender.send(result);
        }
    }
}

// runs one source call under the fetch timeout, retrying transient failures with
// doubling backoff up to the bounded attempt budget.
async fn with_retries<T, F, Fut>(request: &str, mut call: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut backoff = INITIAL_BACKOFF;

    for attempt in 1..=MAX_REQUEST_ATTEMPTS {
        match tokio::time::timeout(FETCH_TIMEOUT, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(FetchError::Transient(reason))) => {
                tracing::warn!(
                    "Transient failure fetching {} (attempt {}): {}",
                    request,
                    attempt,
                    reason
                );
            }
            Ok(Err(error)) => return Err(error),
            Err(_) => {
                tracing::warn!("Timed out fetching {} (attempt {})", request, attempt);
            }
        }

        if attempt < MAX_REQUEST_ATTEMPTS {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    Err(FetchError::RetriesExhausted {
        request: request.to_string(),
        attempts: MAX_REQUEST_ATTEMPTS,
    })
}
