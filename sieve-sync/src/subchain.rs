//! Per-subchain scanning task
//!
//! One task per (subaccount, branch) pair. Each task owns its subchain's
//! keyspace in the ledger index and is its sole writer; tasks share nothing
//! but the read side of the header and filter chains and the fetch channel,
//! so subchains scan concurrently without coordination.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Mutex, RwLock};

use bitcoin::bip158::BlockFilter;
use bitcoin::{Block, OutPoint};

use crate::block_fetcher;
use crate::client::FetchRequest;
use crate::error::{IndexError, MatchError, SyncError};
use crate::index::LedgerIndex;
use crate::interface::KeySource;
use crate::matcher;
use crate::oracle::FilterChain;
use crate::primitives::{Checkpoint, Match, Position, SubchainId, SyncUpdate};

/// Derivation indices kept indexed ahead of the highest hit.
const LOOKAHEAD: u32 = 20;
/// Filters examined per scan pass.
const SCAN_BATCH: u64 = 100;
/// Delay before retrying a pass abandoned on block-fetch failure, doubled
/// per consecutive abandonment up to the cap.
const PASS_RETRY_DELAY: Duration = Duration::from_millis(200);
const MAX_PASS_RETRY_DELAY: Duration = Duration::from_secs(5);

fn next_retry_delay(current: Duration) -> Duration {
    (current * 2).min(MAX_PASS_RETRY_DELAY)
}

/// Lifecycle of a subchain task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubchainState {
    /// Scanning forward.
    Normal,
    /// Rolling back to a reorg ancestor.
    Reorging,
    /// Draining before exit.
    ShuttingDown,
    /// Terminal.
    Stopped,
}

/// Events that drive [`SubchainState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubchainEvent {
    /// A reorg message arrived.
    ReorgDetected,
    /// Rollback committed.
    ReorgResolved,
    /// Shutdown was requested.
    ShutdownRequested,
    /// All pending work is flushed.
    Drained,
}

impl SubchainState {
    /// The explicit transition table. Returns `None` for transitions the
    /// lifecycle does not permit.
    pub fn transition(self, event: SubchainEvent) -> Option<Self> {
        match (self, event) {
            (SubchainState::Normal, SubchainEvent::ReorgDetected) => Some(SubchainState::Reorging),
            (SubchainState::Reorging, SubchainEvent::ReorgResolved) => Some(SubchainState::Normal),
            (SubchainState::Normal, SubchainEvent::ShutdownRequested) => {
                Some(SubchainState::ShuttingDown)
            }
            (SubchainState::Reorging, SubchainEvent::ShutdownRequested) => {
                Some(SubchainState::ShuttingDown)
            }
            (SubchainState::ShuttingDown, SubchainEvent::Drained) => Some(SubchainState::Stopped),
            _ => None,
        }
    }
}

/// Control messages delivered to a subchain task.
#[derive(Debug, Clone, Copy)]
pub enum SubchainMessage {
    /// Reload scan state and top up the lookahead window.
    Init,
    /// Drive the lifecycle state machine with an event.
    ChangeState(SubchainEvent),
    /// Roll back to the given common ancestor, then resume scanning.
    Reorg(Position),
}

/// Control surface of one running subchain task.
#[derive(Clone)]
pub struct SubchainHandle {
    sender: UnboundedSender<SubchainMessage>,
}

impl SubchainHandle {
    pub(crate) fn new() -> (Self, UnboundedReceiver<SubchainMessage>) {
        let (sender, receiver) = unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Instructs the task to reload its scan state and top up the lookahead
    /// window, after elements were registered behind its back.
    pub fn init(&self) -> Result<(), SyncError> {
        self.sender
            .send(SubchainMessage::Init)
            .map_err(|_| SyncError::ChannelClosed("subchain"))
    }

    /// Drives the task's lifecycle state machine. Events the current state
    /// does not permit are logged and ignored.
    pub fn change_state(&self, event: SubchainEvent) -> Result<(), SyncError> {
        self.sender
            .send(SubchainMessage::ChangeState(event))
            .map_err(|_| SyncError::ChannelClosed("subchain"))
    }

    /// Instructs the task to roll back to `ancestor`.
    pub fn process_reorg(&self, ancestor: Position) -> Result<(), SyncError> {
        self.sender
            .send(SubchainMessage::Reorg(ancestor))
            .map_err(|_| SyncError::ChannelClosed("subchain"))
    }

    /// Instructs the task to drain and stop.
    pub fn shutdown(&self) -> Result<(), SyncError> {
        self.change_state(SubchainEvent::ShutdownRequested)
    }
}

/// The scanning task for one subchain.
pub(crate) struct SubchainTask<K: KeySource> {
    subchain: SubchainId,
    state: SubchainState,
    index: LedgerIndex,
    key_source: Arc<K>,
    fetch_request_sender: UnboundedSender<FetchRequest>,
    filter_chain: Arc<RwLock<FilterChain>>,
    header_lock: Arc<Mutex<()>>,
    checkpoint_receiver: watch::Receiver<Checkpoint>,
    message_receiver: UnboundedReceiver<SubchainMessage>,
    messages_closed: bool,
    progress_sender: UnboundedSender<SyncUpdate>,
    shutdown: watch::Receiver<bool>,
    highest_hit: Option<u32>,
    retry_delay: Duration,
}

impl<K: KeySource> SubchainTask<K> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        subchain: SubchainId,
        index: LedgerIndex,
        key_source: Arc<K>,
        fetch_request_sender: UnboundedSender<FetchRequest>,
        filter_chain: Arc<RwLock<FilterChain>>,
        header_lock: Arc<Mutex<()>>,
        checkpoint_receiver: watch::Receiver<Checkpoint>,
        message_receiver: UnboundedReceiver<SubchainMessage>,
        progress_sender: UnboundedSender<SyncUpdate>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            subchain,
            state: SubchainState::Normal,
            index,
            key_source,
            fetch_request_sender,
            filter_chain,
            header_lock,
            checkpoint_receiver,
            message_receiver,
            messages_closed: false,
            progress_sender,
            shutdown,
            highest_hit: None,
            retry_delay: PASS_RETRY_DELAY,
        }
    }

    pub(crate) async fn run(mut self) -> Result<(), SyncError> {
        tracing::info!("{} task started.", self.subchain);

        self.handle_message(SubchainMessage::Init).await?;

        loop {
            if *self.shutdown.borrow() && self.state == SubchainState::Normal {
                self.transition(SubchainEvent::ShutdownRequested)?;
            }
            loop {
                match self.message_receiver.try_recv() {
                    Ok(message) => self.handle_message(message).await?,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.messages_closed = true;
                        break;
                    }
                }
            }

            match self.state {
                SubchainState::Normal => {
                    if !self.scan_pass().await? {
                        self.wait_for_work().await?;
                    }
                }
                SubchainState::Reorging => {
                    // rollback always completes within message handling
                    return Err(SyncError::InvariantViolation(format!(
                        "{} left in Reorging state",
                        self.subchain
                    )));
                }
                SubchainState::ShuttingDown => {
                    self.blocking(move |index| index.flush()).await?;
                    self.transition(SubchainEvent::Drained)?;
                }
                SubchainState::Stopped => break,
            }
        }

        tracing::info!("{} task stopped.", self.subchain);
        Ok(())
    }

    // parks until a new checkpoint, a control message, or shutdown.
    async fn wait_for_work(&mut self) -> Result<(), SyncError> {
        let mut shutdown = self.shutdown.clone();
        let mut checkpoints = self.checkpoint_receiver.clone();
        let mut pending = None;

        tokio::select! {
            _ = shutdown.changed() => {}
            _ = checkpoints.changed() => {}
            message = self.message_receiver.recv(), if !self.messages_closed => {
                match message {
                    Some(message) => pending = Some(message),
                    None => self.messages_closed = true,
                }
            }
        }

        if let Some(message) = pending {
            self.handle_message(message).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: SubchainMessage) -> Result<(), SyncError> {
        match message {
            SubchainMessage::Init => {
                let subchain = self.subchain;
                let recorded = self
                    .blocking(move |index| index.matches_for(subchain))
                    .await?;
                self.highest_hit = recorded.iter().map(|(_, hit)| hit.element().index()).max();
                self.ensure_lookahead().await?;
            }
            SubchainMessage::ChangeState(event) => {
                if self.state.transition(event).is_some() {
                    self.transition(event)?;
                } else {
                    tracing::warn!("{}: ignoring {:?} in {:?}", self.subchain, event, self.state);
                }
            }
            SubchainMessage::Reorg(ancestor) => {
                if matches!(
                    self.state,
                    SubchainState::ShuttingDown | SubchainState::Stopped
                ) {
                    return Ok(());
                }
                self.transition(SubchainEvent::ReorgDetected)?;

                // hold the header lock so the rollback and the oracle's view
                // of the ancestor cannot interleave
                let guard = self.header_lock.lock().await;
                let subchain = self.subchain;
                self.blocking(move |index| index.reorg(subchain, ancestor))
                    .await?;
                drop(guard);

                let _ = self
                    .progress_sender
                    .send(SyncUpdate::from_parts(self.subchain, ancestor));
                self.transition(SubchainEvent::ReorgResolved)?;
            }
        }
        Ok(())
    }

    // one bounded scan pass. Returns `false` when there was nothing to scan.
    async fn scan_pass(&mut self) -> Result<bool, SyncError> {
        let subchain = self.subchain;
        let cursor = self
            .blocking(move |index| index.scan_cursor(subchain))
            .await?;
        let checkpoint = *self.checkpoint_receiver.borrow();
        if checkpoint.position().height() <= cursor.last_scanned().height() {
            return Ok(false);
        }

        let start = (cursor.last_scanned().height() + 1) as u64;
        let end = ((checkpoint.position().height() + 1) as u64).min(start + SCAN_BATCH);

        // snapshot the verified filters for this range
        let mut records = Vec::new();
        {
            let filters = self.filter_chain.read().await;
            for height in start..end {
                match filters.get(height) {
                    Some(record) => records.push((height, record.clone())),
                    None => break,
                }
            }
        }
        if records.is_empty() {
            return Ok(false);
        }

        let patterns = self.blocking(move |index| index.patterns(subchain)).await?;
        let parsed = matcher::parse_patterns(&patterns)?;

        // probabilistic test: which heights could contain a hit
        let mut candidates = Vec::new();
        if !parsed.is_empty() {
            for (height, record) in &records {
                let hit = BlockFilter::new(&record.filter)
                    .match_any(&record.block_hash, &mut parsed.queries())
                    .map_err(|error| MatchError::FilterDecode {
                        height: *height,
                        reason: error.to_string(),
                    })?;
                if hit {
                    candidates.push((*height, record.block_hash));
                }
            }
        }
        tracing::debug!(
            "{}: scanning {}..{}, {} candidate(s)",
            subchain,
            start,
            end,
            candidates.len()
        );

        let candidate_heights: BTreeSet<u64> = candidates.iter().map(|(height, _)| *height).collect();
        let mut job = block_fetcher::get_job(self.fetch_request_sender.clone(), candidates);
        let mut arrived: BTreeMap<u64, Block> = BTreeMap::new();
        // filter-only suffix awaiting a single cursor-advance commit
        let mut deferred: Option<Position> = None;

        for (height, record) in &records {
            let position = Position::from_parts(*height as i64, record.block_hash);
            if !candidate_heights.contains(height) {
                deferred = Some(position);
                continue;
            }

            while !arrived.contains_key(height) {
                match job.next().await {
                    Some((arrived_height, Ok(block))) => {
                        arrived.insert(arrived_height, block);
                    }
                    Some((failed_height, Err(error))) => {
                        // the committed prefix stands; the rest of the range
                        // is retried on the next pass, after a backoff
                        tracing::warn!(
                            "{}: abandoning pass, block at height {} failed: {}",
                            subchain,
                            failed_height,
                            error
                        );
                        tokio::time::sleep(self.retry_delay).await;
                        self.retry_delay = next_retry_delay(self.retry_delay);
                        return Ok(true);
                    }
                    None => {
                        return Err(SyncError::InvariantViolation(format!(
                            "block job ended before height {}",
                            height
                        )))
                    }
                }
            }
            let block = arrived.remove(height).ok_or_else(|| {
                SyncError::InvariantViolation(format!("block at height {} vanished", height))
            })?;

            // flush the filter-only prefix so commits stay height-ordered
            if let Some(prefix) = deferred.take() {
                self.commit(prefix, Vec::new(), Vec::new()).await?;
            }

            let outpoints: Vec<OutPoint> = block
                .txdata
                .iter()
                .flat_map(|transaction| transaction.input.iter())
                .map(|input| input.previous_output)
                .filter(|outpoint| !outpoint.is_null())
                .collect();
            let spent = self
                .blocking(move |index| index.lookup_spent_scripts(subchain, &outpoints))
                .await?;

            let found = matcher::match_block(&block, &parsed, &spent);
            for hit in &found.matches {
                let index = hit.element().index();
                self.highest_hit = Some(self.highest_hit.map_or(index, |highest| highest.max(index)));
            }
            if !found.matches.is_empty() {
                tracing::info!(
                    "{}: {} match(es) at height {}",
                    subchain,
                    found.matches.len(),
                    height
                );
            }
            self.commit(position, found.matches, found.output_scripts)
                .await?;
        }

        if let Some(prefix) = deferred.take() {
            self.commit(prefix, Vec::new(), Vec::new()).await?;
        }

        self.retry_delay = PASS_RETRY_DELAY;
        self.ensure_lookahead().await?;
        Ok(true)
    }

    // records one block's results and the cursor advance atomically, then
    // publishes progress.
    async fn commit(
        &mut self,
        position: Position,
        matches: Vec<Match>,
        output_scripts: Vec<(OutPoint, Vec<u8>)>,
    ) -> Result<(), SyncError> {
        let subchain = self.subchain;
        self.blocking(move |index| {
            index.record_scan(subchain, position, &matches, &output_scripts)
        })
        .await?;
        let _ = self
            .progress_sender
            .send(SyncUpdate::from_parts(subchain, position));
        Ok(())
    }

    // tops the indexed pattern set up to the lookahead window past the
    // highest element hit so far.
    async fn ensure_lookahead(&mut self) -> Result<(), SyncError> {
        let subchain = self.subchain;
        let cursor = self
            .blocking(move |index| index.scan_cursor(subchain))
            .await?;
        let next = cursor.last_indexed().map(|index| index + 1).unwrap_or(0);
        let target = self
            .highest_hit
            .map(|index| index + 1 + LOOKAHEAD)
            .unwrap_or(LOOKAHEAD);
        if next >= target {
            return Ok(());
        }

        let elements = self
            .key_source
            .derive_elements(subchain, next..target)
            .map_err(|error| SyncError::KeyDerivation(format!("{:?}", error)))?;
        self.blocking(move |index| index.add_elements(subchain, &elements).map(|_| ()))
            .await?;
        tracing::debug!("{}: indexed elements {}..{}", subchain, next, target);
        Ok(())
    }

    fn transition(&mut self, event: SubchainEvent) -> Result<(), SyncError> {
        match self.state.transition(event) {
            Some(next) => {
                tracing::trace!("{} {:?} -> {:?}", self.subchain, self.state, next);
                self.state = next;
                Ok(())
            }
            None => Err(SyncError::InvariantViolation(format!(
                "{}: invalid transition {:?} on {:?}",
                self.subchain, event, self.state
            ))),
        }
    }

    async fn blocking<T, F>(&self, operation: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(LedgerIndex) -> Result<T, IndexError> + Send + 'static,
    {
        let index = self.index.clone();
        tokio::task::spawn_blocking(move || operation(index))
            .await
            .map_err(|error| {
                SyncError::InvariantViolation(format!("ledger task panicked: {}", error))
            })?
            .map_err(SyncError::from)
    }
}

#[cfg(test)]
mod tests {
    use std::ops::Range;

    use super::*;
    use crate::primitives::{Branch, Element, SubaccountId};

    struct StaticKeys;

    impl KeySource for StaticKeys {
        type Error = String;

        fn derive_elements(
            &self,
            subchain: SubchainId,
            range: Range<u32>,
        ) -> Result<Vec<Element>, Self::Error> {
            Ok(range
                .map(|index| Element::from_parts(index, subchain, vec![0xAB, index as u8]))
                .collect())
        }
    }

    #[test]
    fn abandoned_pass_delay_doubles_up_to_the_cap() {
        let mut delay = PASS_RETRY_DELAY;
        delay = next_retry_delay(delay);
        assert_eq!(delay, PASS_RETRY_DELAY * 2);

        for _ in 0..10 {
            delay = next_retry_delay(delay);
        }
        assert_eq!(delay, MAX_PASS_RETRY_DELAY);
    }

    #[tokio::test]
    async fn handle_surface_drives_the_task_lifecycle() {
        let index = LedgerIndex::temporary().unwrap();
        let subchain = index
            .subchain_id(SubaccountId::from_bytes([1u8; 32]), Branch::External)
            .unwrap();

        let (fetch_request_sender, _fetch_request_receiver) = unbounded_channel();
        let (handle, message_receiver) = SubchainHandle::new();
        let (progress_sender, _progress_receiver) = unbounded_channel();
        let (_checkpoint_sender, checkpoint_receiver) = watch::channel(Checkpoint::genesis());
        let (_shutdown_sender, shutdown) = watch::channel(false);

        let task = tokio::spawn(
            SubchainTask::new(
                subchain,
                index.clone(),
                Arc::new(StaticKeys),
                fetch_request_sender,
                Arc::new(RwLock::new(FilterChain::new())),
                Arc::new(Mutex::new(())),
                checkpoint_receiver,
                message_receiver,
                progress_sender,
                shutdown,
            )
            .run(),
        );

        handle.init().unwrap();
        // an event the lifecycle does not permit is ignored, not fatal
        handle.change_state(SubchainEvent::ReorgResolved).unwrap();
        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();

        // startup indexed the lookahead window
        assert_eq!(
            index.scan_cursor(subchain).unwrap().last_indexed(),
            Some(LOOKAHEAD - 1)
        );
    }

    #[test]
    fn lifecycle_transitions_follow_the_table() {
        let state = SubchainState::Normal;

        let reorging = state.transition(SubchainEvent::ReorgDetected).unwrap();
        assert_eq!(reorging, SubchainState::Reorging);
        assert_eq!(
            reorging.transition(SubchainEvent::ReorgResolved).unwrap(),
            SubchainState::Normal
        );

        let draining = reorging
            .transition(SubchainEvent::ShutdownRequested)
            .unwrap();
        assert_eq!(draining, SubchainState::ShuttingDown);
        assert_eq!(
            draining.transition(SubchainEvent::Drained).unwrap(),
            SubchainState::Stopped
        );
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        assert_eq!(
            SubchainState::Normal.transition(SubchainEvent::ReorgResolved),
            None
        );
        assert_eq!(
            SubchainState::Normal.transition(SubchainEvent::Drained),
            None
        );
        assert_eq!(
            SubchainState::Stopped.transition(SubchainEvent::ShutdownRequested),
            None
        );
        assert_eq!(
            SubchainState::ShuttingDown.transition(SubchainEvent::ReorgDetected),
            None
        );
    }
}
