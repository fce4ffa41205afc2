//! Header and filter oracle tasks
//!
//! Two stacked [`DownloadManager`] instances keep the canonical header chain
//! and the corresponding compact-filter chain synchronized to the best known
//! tip. The header oracle validates linkage and detects reorgs; the filter
//! oracle verifies each filter against the chained filter headers and
//! publishes checkpoints consumed by the subchain tasks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Mutex, RwLock};

use bitcoin::bip158::BlockFilter;
use bitcoin::block::Header;
use bitcoin::{BlockHash, FilterHeader};

use crate::client::{self, FetchRequest};
use crate::downloader::{Batch, DownloadItem, DownloadManager};
use crate::error::{FetchError, ItemValidationError, SyncError};
use crate::primitives::{Checkpoint, Position};

const TIP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_INFLIGHT_BATCHES: usize = 4;
const INITIAL_BATCH_SIZE: u32 = 250;
const MAX_BATCH_SIZE: u32 = 1_000;

/// Oracle pipeline phase, tracked for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OracleState {
    Idle,
    Requesting,
    Validating,
    Committed,
    Failed,
}

/// One validated header awaiting in-order delivery.
pub(crate) struct HeaderItem {
    pub(crate) height: u64,
    pub(crate) header: Header,
}

impl DownloadItem for HeaderItem {
    fn index(&self) -> u64 {
        self.height
    }

    fn validate(&self, previous: Option<&Self>) -> Result<(), ItemValidationError> {
        if let Some(previous) = previous {
            let expected = previous.header.block_hash();
            if self.header.prev_blockhash != expected {
                return Err(ItemValidationError::HeaderLink {
                    height: self.height,
                    prev_hash: self.header.prev_blockhash,
                    expected,
                });
            }
        }
        Ok(())
    }

    fn checkpoint(&self) -> Option<Checkpoint> {
        None
    }
}

/// One compact filter awaiting verification against the chained headers.
pub(crate) struct FilterItem {
    pub(crate) height: u64,
    pub(crate) block_hash: BlockHash,
    pub(crate) filter_header: FilterHeader,
    pub(crate) filter: Vec<u8>,
}

impl DownloadItem for FilterItem {
    fn index(&self) -> u64 {
        self.height
    }

    fn validate(&self, previous: Option<&Self>) -> Result<(), ItemValidationError> {
        if let Some(previous) = previous {
            let computed =
                BlockFilter::new(&self.filter).filter_header(&previous.filter_header);
            if computed != self.filter_header {
                return Err(ItemValidationError::FilterHeaderMismatch {
                    height: self.height,
                    advertised: self.filter_header,
                    computed,
                });
            }
        }
        Ok(())
    }

    fn checkpoint(&self) -> Option<Checkpoint> {
        Some(Checkpoint::from_parts(
            Position::from_parts(self.height as i64, self.block_hash),
            self.filter_header,
        ))
    }
}

/// In-memory view of the validated header chain, shared between the oracles
/// and the subchain tasks.
pub(crate) struct HeaderChain {
    anchor: Position,
    headers: BTreeMap<u64, Header>,
}

impl HeaderChain {
    pub(crate) fn new(anchor: Position) -> Self {
        Self {
            anchor,
            headers: BTreeMap::new(),
        }
    }

    pub(crate) fn tip(&self) -> Position {
        self.headers
            .iter()
            .next_back()
            .map(|(height, header)| Position::from_parts(*height as i64, header.block_hash()))
            .unwrap_or(self.anchor)
    }

    pub(crate) fn hash_at(&self, height: u64) -> Option<BlockHash> {
        if self.anchor.height() == height as i64 {
            return Some(self.anchor.hash());
        }
        self.headers.get(&height).map(|header| header.block_hash())
    }

    pub(crate) fn extend(&mut self, height: u64, header: Header) {
        self.headers.insert(height, header);
    }

    /// Drops all headers above the reorg ancestor.
    pub(crate) fn rollback(&mut self, ancestor: Position) {
        self.headers
            .retain(|height, _| (*height as i64) <= ancestor.height());
        if self.headers.is_empty() {
            self.anchor = ancestor;
        }
    }

    /// Drops headers below `height`; they are no longer needed once every
    /// subchain has scanned past them.
    pub(crate) fn prune_below(&mut self, height: u64) {
        let retained = self.headers.split_off(&height);
        if let Some((&anchor_height, header)) = self.headers.iter().next_back() {
            self.anchor = Position::from_parts(anchor_height as i64, header.block_hash());
        }
        self.headers = retained;
    }

    fn item_at(&self, height: i64) -> Option<HeaderItem> {
        if height < 0 {
            return None;
        }
        self.headers.get(&(height as u64)).map(|header| HeaderItem {
            height: height as u64,
            header: *header,
        })
    }
}

/// One verified filter retained for subchain consumption.
#[derive(Clone)]
pub(crate) struct FilterRecord {
    pub(crate) block_hash: BlockHash,
    pub(crate) filter_header: FilterHeader,
    pub(crate) filter: Vec<u8>,
}

/// In-memory store of verified filters, shared between the filter oracle and
/// the subchain tasks and pruned once all subchains have moved past a height.
pub(crate) struct FilterChain {
    records: BTreeMap<u64, FilterRecord>,
}

impl FilterChain {
    pub(crate) fn new() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, height: u64, record: FilterRecord) {
        self.records.insert(height, record);
    }

    pub(crate) fn get(&self, height: u64) -> Option<&FilterRecord> {
        self.records.get(&height)
    }

    pub(crate) fn rollback(&mut self, ancestor: Position) {
        self.records
            .retain(|height, _| (*height as i64) <= ancestor.height());
    }

    pub(crate) fn prune_below(&mut self, height: u64) {
        self.records = self.records.split_off(&height);
    }

    fn item_at(&self, height: i64) -> Option<FilterItem> {
        if height < 0 {
            return None;
        }
        self.records.get(&(height as u64)).map(|record| FilterItem {
            height: height as u64,
            block_hash: record.block_hash,
            filter_header: record.filter_header,
            filter: record.filter.clone(),
        })
    }
}

/// Keeps the validated header chain synchronized to the source's best tip
/// and initiates reorg handling when the chains diverge.
pub(crate) struct HeaderOracle {
    manager: DownloadManager<HeaderItem>,
    previous: Option<HeaderItem>,
    state: OracleState,
    fetch_request_sender: UnboundedSender<FetchRequest>,
    header_chain: Arc<RwLock<HeaderChain>>,
    header_lock: Arc<Mutex<()>>,
    tip_sender: watch::Sender<Position>,
    reorg_sender: UnboundedSender<Position>,
    shutdown: watch::Receiver<bool>,
}

impl HeaderOracle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        start_height: u64,
        fetch_request_sender: UnboundedSender<FetchRequest>,
        header_chain: Arc<RwLock<HeaderChain>>,
        header_lock: Arc<Mutex<()>>,
        tip_sender: watch::Sender<Position>,
        reorg_sender: UnboundedSender<Position>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            manager: DownloadManager::new(start_height, INITIAL_BATCH_SIZE, MAX_BATCH_SIZE),
            previous: None,
            state: OracleState::Idle,
            fetch_request_sender,
            header_chain,
            header_lock,
            tip_sender,
            reorg_sender,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) -> Result<(), SyncError> {
        tracing::info!("Header oracle started.");

        let mut interval = tokio::time::interval(TIP_POLL_INTERVAL);
        let mut inflight: FuturesUnordered<
            BoxFuture<'static, (Batch, Result<Vec<Header>, FetchError>)>,
        > = FuturesUnordered::new();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = interval.tick() => {
                    if self.poll_tip().await? {
                        break;
                    }
                    self.spawn_batches(&mut inflight);
                }
                Some((batch, result)) = inflight.next(), if !inflight.is_empty() => {
                    match result {
                        Ok(headers) => {
                            let items = headers
                                .into_iter()
                                .enumerate()
                                .map(|(offset, header)| HeaderItem {
                                    height: batch.start() + offset as u64,
                                    header,
                                })
                                .collect();
                            self.manager.complete(&batch, items)?;
                            self.deliver().await?;
                        }
                        Err(FetchError::Disconnected) => break,
                        Err(error) => {
                            tracing::warn!("Header batch failed: {}", error);
                            self.set_state(OracleState::Failed);
                            self.manager.fail(&batch);
                        }
                    }
                    self.spawn_batches(&mut inflight);
                }
            }
        }

        tracing::info!("Header oracle shut down.");
        Ok(())
    }

    // polls the source's best tip, extending the download target when the
    // chain grew and resolving a reorg when it shrank or changed identity.
    // returns `true` when the fetch task has gone away and sync is ending.
    async fn poll_tip(&mut self) -> Result<bool, SyncError> {
        let tip = match client::get_chain_tip(&self.fetch_request_sender).await {
            Ok(tip) => tip,
            Err(FetchError::Disconnected) => return Ok(true),
            Err(error) => {
                tracing::warn!("Chain tip query failed: {}", error);
                return Ok(false);
            }
        };

        let local = self.header_chain.read().await.tip();
        if tip == local {
            return Ok(false);
        }

        if tip.height() > local.height() {
            self.manager.set_target((tip.height() + 1) as u64);
        } else {
            // same or lower height with a different identity
            self.resolve_reorg().await?;
        }

        Ok(false)
    }

    fn spawn_batches(
        &mut self,
        inflight: &mut FuturesUnordered<
            BoxFuture<'static, (Batch, Result<Vec<Header>, FetchError>)>,
        >,
    ) {
        while inflight.len() < MAX_INFLIGHT_BATCHES {
            let Some(batch) = self
                .manager
                .request_batch(self.manager.suggested_batch_size())
            else {
                break;
            };
            self.set_state(OracleState::Requesting);

            let sender = self.fetch_request_sender.clone();
            inflight.push(
                async move {
                    let result = client::get_header_range(&sender, batch.range()).await;
                    (batch, result)
                }
                .boxed(),
            );
        }
    }

    // delivers buffered headers in height order, validating linkage against
    // the previously delivered header and publishing the advancing tip.
    async fn deliver(&mut self) -> Result<(), SyncError> {
        self.set_state(OracleState::Validating);
        let mut link_broken = false;

        loop {
            let validated = match self.manager.ready() {
                Some(item) => item.validate(self.previous.as_ref()),
                None => break,
            };
            match validated {
                Ok(()) => {
                    let Some(item) = self.manager.pop_ready() else {
                        break;
                    };
                    let tip = {
                        let mut chain = self.header_chain.write().await;
                        chain.extend(item.height, item.header);
                        chain.tip()
                    };
                    let _ = self.tip_sender.send(tip);
                    self.previous = Some(item);
                    self.set_state(OracleState::Committed);
                }
                Err(error) => {
                    tracing::warn!("Header rejected: {}", error);
                    self.set_state(OracleState::Failed);
                    self.manager.reject_ready();
                    link_broken = true;
                    break;
                }
            }
        }

        if link_broken {
            // a link break at the frontier is either bad data or a reorg;
            // the chain-validity oracle decides which
            self.resolve_reorg().await?;
        }

        Ok(())
    }

    // asks the chain-validity oracle for the common ancestor, then rolls
    // local state back to it under the header lock and notifies the engine.
    // the lock is never held across the network round trip; subchain
    // rollbacks stay unblocked while the query is outstanding.
    async fn resolve_reorg(&mut self) -> Result<(), SyncError> {
        let local = self.header_chain.read().await.tip();
        let ancestor = match client::get_common_ancestor(&self.fetch_request_sender, local).await {
            Ok(ancestor) => ancestor,
            Err(error) => {
                // retried on the next tip poll
                tracing::warn!("Common ancestor query failed: {}", error);
                return Ok(());
            }
        };

        let _guard = self.header_lock.lock().await;
        if self.header_chain.read().await.tip() != local {
            // the tip moved while the query was outstanding; the stale
            // ancestor is discarded and the next poll re-resolves
            return Ok(());
        }

        if ancestor != local {
            tracing::info!("Reorg detected. Rolling back from {} to {}", local, ancestor);
            self.header_chain.write().await.rollback(ancestor);
            let _ = self.tip_sender.send(ancestor);
            self.reorg_sender
                .send(ancestor)
                .map_err(|_| SyncError::ChannelClosed("sync"))?;
        }

        self.manager.reorg((ancestor.height() + 1) as u64);
        self.previous = self.header_chain.read().await.item_at(ancestor.height());

        Ok(())
    }

    fn set_state(&mut self, state: OracleState) {
        if self.state != state {
            tracing::trace!("Header oracle {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}

/// Keeps the verified filter chain synchronized to the validated header
/// chain, publishing a checkpoint for every verified filter.
pub(crate) struct FilterOracle {
    manager: DownloadManager<FilterItem>,
    previous: Option<FilterItem>,
    state: OracleState,
    fetch_request_sender: UnboundedSender<FetchRequest>,
    header_chain: Arc<RwLock<HeaderChain>>,
    filter_chain: Arc<RwLock<FilterChain>>,
    tip_receiver: watch::Receiver<Position>,
    checkpoint_sender: watch::Sender<Checkpoint>,
    reorg_receiver: UnboundedReceiver<Position>,
    shutdown: watch::Receiver<bool>,
}

impl FilterOracle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        start_height: u64,
        fetch_request_sender: UnboundedSender<FetchRequest>,
        header_chain: Arc<RwLock<HeaderChain>>,
        filter_chain: Arc<RwLock<FilterChain>>,
        tip_receiver: watch::Receiver<Position>,
        checkpoint_sender: watch::Sender<Checkpoint>,
        reorg_receiver: UnboundedReceiver<Position>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            manager: DownloadManager::new(start_height, INITIAL_BATCH_SIZE, MAX_BATCH_SIZE),
            previous: None,
            state: OracleState::Idle,
            fetch_request_sender,
            header_chain,
            filter_chain,
            tip_receiver,
            checkpoint_sender,
            reorg_receiver,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) -> Result<(), SyncError> {
        tracing::info!("Filter oracle started.");

        let mut inflight: FuturesUnordered<
            BoxFuture<'static, (Batch, Result<Vec<crate::interface::FilterChunk>, FetchError>)>,
        > = FuturesUnordered::new();

        // only request filters for heights whose headers are already verified
        let initial_tip = *self.tip_receiver.borrow();
        if initial_tip.height() >= 0 {
            self.manager.set_target((initial_tip.height() + 1) as u64);
            self.spawn_batches(&mut inflight);
        }

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                changed = self.tip_receiver.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let tip = *self.tip_receiver.borrow();
                    if tip.height() >= 0 {
                        self.manager.set_target((tip.height() + 1) as u64);
                    }
                    self.spawn_batches(&mut inflight);
                }
                Some(ancestor) = self.reorg_receiver.recv() => {
                    self.handle_reorg(ancestor).await;
                    self.spawn_batches(&mut inflight);
                }
                Some((batch, result)) = inflight.next(), if !inflight.is_empty() => {
                    match result {
                        Ok(chunks) => {
                            let items = chunks
                                .into_iter()
                                .enumerate()
                                .map(|(offset, chunk)| FilterItem {
                                    height: batch.start() + offset as u64,
                                    block_hash: chunk.block_hash,
                                    filter_header: chunk.filter_header,
                                    filter: chunk.filter,
                                })
                                .collect();
                            self.manager.complete(&batch, items)?;
                            self.deliver().await;
                        }
                        Err(FetchError::Disconnected) => break,
                        Err(error) => {
                            tracing::warn!("Filter batch failed: {}", error);
                            self.set_state(OracleState::Failed);
                            self.manager.fail(&batch);
                        }
                    }
                    self.spawn_batches(&mut inflight);
                }
            }
        }

        tracing::info!("Filter oracle shut down.");
        Ok(())
    }

    fn spawn_batches(
        &mut self,
        inflight: &mut FuturesUnordered<
            BoxFuture<'static, (Batch, Result<Vec<crate::interface::FilterChunk>, FetchError>)>,
        >,
    ) {
        while inflight.len() < MAX_INFLIGHT_BATCHES {
            let Some(batch) = self
                .manager
                .request_batch(self.manager.suggested_batch_size())
            else {
                break;
            };
            self.set_state(OracleState::Requesting);

            let sender = self.fetch_request_sender.clone();
            inflight.push(
                async move {
                    let result = client::get_filter_range(&sender, batch.range()).await;
                    (batch, result)
                }
                .boxed(),
            );
        }
    }

    // delivers buffered filters in height order, verifying both the chained
    // filter header and the binding to the validated header chain.
    async fn deliver(&mut self) {
        self.set_state(OracleState::Validating);

        loop {
            let verdict = {
                let Some(item) = self.manager.ready() else {
                    break;
                };
                match self.header_chain.read().await.hash_at(item.height) {
                    // header chain no longer covers this height; wait for
                    // the header oracle to catch up or reorg
                    None => return,
                    Some(expected) if expected != item.block_hash => {
                        Err(ItemValidationError::BlockHashMismatch {
                            height: item.height,
                            got: item.block_hash,
                            expected,
                        })
                    }
                    Some(_) => item.validate(self.previous.as_ref()),
                }
            };

            match verdict {
                Ok(()) => {
                    let Some(item) = self.manager.pop_ready() else {
                        break;
                    };
                    let checkpoint = Checkpoint::from_parts(
                        Position::from_parts(item.height as i64, item.block_hash),
                        item.filter_header,
                    );
                    self.filter_chain.write().await.insert(
                        item.height,
                        FilterRecord {
                            block_hash: item.block_hash,
                            filter_header: item.filter_header,
                            filter: item.filter.clone(),
                        },
                    );
                    let _ = self.checkpoint_sender.send(checkpoint);
                    self.previous = Some(item);
                    self.set_state(OracleState::Committed);
                }
                Err(error) => {
                    tracing::warn!("Filter rejected: {}", error);
                    self.set_state(OracleState::Failed);
                    self.manager.reject_ready();
                }
            }
        }
    }

    async fn handle_reorg(&mut self, ancestor: Position) {
        tracing::info!("Filter oracle rolling back to {}", ancestor);

        let mut filters = self.filter_chain.write().await;
        filters.rollback(ancestor);
        self.previous = filters.item_at(ancestor.height());
        let checkpoint = self
            .previous
            .as_ref()
            .and_then(|item| item.checkpoint())
            .unwrap_or_else(Checkpoint::genesis);
        drop(filters);

        let _ = self.checkpoint_sender.send(checkpoint);
        self.manager.reorg((ancestor.height() + 1) as u64);
    }

    fn set_state(&mut self, state: OracleState) {
        if self.state != state {
            tracing::trace!("Filter oracle {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}
