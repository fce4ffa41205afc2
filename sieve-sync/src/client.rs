//! Module for handling all requests to the chain source

use std::ops::Range;

use tokio::sync::{mpsc::UnboundedSender, oneshot};

use bitcoin::{block::Header, Block, BlockHash};

use crate::error::FetchError;
use crate::interface::FilterChunk;
use crate::primitives::Position;

pub mod fetch;

/// Fetch requests are created and sent to the [`crate::client::fetch::fetch`] task whenever
/// data from the chain source is required.
///
/// Each variant includes a [`tokio::sync::oneshot::Sender`] for returning the fetched data
/// to the requester.
#[derive(Debug)]
pub enum FetchRequest {
    /// Gets the position of the best chain tip from the source.
    ChainTip(oneshot::Sender<Result<Position, FetchError>>),
    /// Gets the highest position on the best chain that is an ancestor of the
    /// given local position.
    CommonAncestor(oneshot::Sender<Result<Position, FetchError>>, Position),
    /// Gets the specified range of block headers from the source (end exclusive).
    HeaderRange(oneshot::Sender<Result<Vec<Header>, FetchError>>, Range<u64>),
    /// Gets the specified range of compact filters from the source (end exclusive).
    FilterRange(
        oneshot::Sender<Result<Vec<FilterChunk>, FetchError>>,
        Range<u64>,
    ),
    /// Gets a full block by height and hash.
    Block(oneshot::Sender<Result<Block, FetchError>>, (u64, BlockHash)),
}

/// Gets the position of the best chain tip from the source.
///
/// Requires [`crate::client::fetch::fetch`] to be running concurrently, connected via the
/// `fetch_request` channel.
pub async fn get_chain_tip(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
) -> Result<Position, FetchError> {
    let (sender, receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::ChainTip(sender))
        .map_err(|_| FetchError::Disconnected)?;

    receiver.await.map_err(|_| FetchError::Disconnected)?
}

/// Gets the highest position on the best chain that is an ancestor of `local`.
///
/// Requires [`crate::client::fetch::fetch`] to be running concurrently, connected via the
/// `fetch_request` channel.
pub async fn get_common_ancestor(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    local: Position,
) -> Result<Position, FetchError> {
    let (sender, receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::CommonAncestor(sender, local))
        .map_err(|_| FetchError::Disconnected)?;

    receiver.await.map_err(|_| FetchError::Disconnected)?
}

/// Gets the specified range of block headers from the source (end exclusive).
///
/// Requires [`crate::client::fetch::fetch`] to be running concurrently, connected via the
/// `fetch_request` channel.
pub async fn get_header_range(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    range: Range<u64>,
) -> Result<Vec<Header>, FetchError> {
    let (sender, receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::HeaderRange(sender, range))
        .map_err(|_| FetchError::Disconnected)?;

    receiver.await.map_err(|_| FetchError::Disconnected)?
}

/// Gets the specified range of compact filters from the source (end exclusive).
///
/// Requires [`crate::client::fetch::fetch`] to be running concurrently, connected via the
/// `fetch_request` channel.
pub async fn get_filter_range(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    range: Range<u64>,
) -> Result<Vec<FilterChunk>, FetchError> {
    let (sender, receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::FilterRange(sender, range))
        .map_err(|_| FetchError::Disconnected)?;

    receiver.await.map_err(|_| FetchError::Disconnected)?
}

/// Gets a full block by height and hash.
///
/// Requires [`crate::client::fetch::fetch`] to be running concurrently, connected via the
/// `fetch_request` channel.
pub async fn get_block(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    height: u64,
    hash: BlockHash,
) -> Result<Block, FetchError> {
    let (sender, receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::Block(sender, (height, hash)))
        .map_err(|_| FetchError::Disconnected)?;

    receiver.await.map_err(|_| FetchError::Disconnected)?
}
