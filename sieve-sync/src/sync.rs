//! Entrypoint for syncing watched subchains to the chain tip
//!
//! [`sync`] wires the actors together and then orchestrates: it forwards
//! reorg notices from the header oracle to the filter oracle and every
//! subchain task, prunes the in-memory chains behind the slowest cursor, and
//! fans shutdown out when the caller's token flips.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::client::fetch;
use crate::error::{IndexError, SyncError};
use crate::index::LedgerIndex;
use crate::interface::{ChainSource, KeySource};
use crate::oracle::{FilterChain, FilterOracle, HeaderChain, HeaderOracle};
use crate::primitives::{Checkpoint, Position, SubchainId, SyncUpdate};
use crate::subchain::{SubchainHandle, SubchainTask};

const PRUNE_INTERVAL: Duration = Duration::from_secs(1);
/// Heights kept below the slowest cursor so reorg rollback has headers to
/// anchor against.
const PRUNE_MARGIN: u64 = 100;

/// Syncs every subchain registered in `index` to the source's best tip and
/// keeps following it until the shutdown token flips.
///
/// Progress is reported per committed block on `progress_sender`. Returns
/// when every task has drained after shutdown, or with the first fatal error.
pub async fn sync<CS, K>(
    source: Arc<CS>,
    key_source: Arc<K>,
    index: LedgerIndex,
    mut shutdown: watch::Receiver<bool>,
    progress_sender: UnboundedSender<SyncUpdate>,
) -> Result<(), SyncError>
where
    CS: ChainSource,
    K: KeySource,
{
    let startup_index = index.clone();
    let subchains: Vec<(SubchainId, Position)> =
        tokio::task::spawn_blocking(move || -> Result<_, IndexError> {
            let mut list = Vec::new();
            for (id, _, _) in startup_index.subchains()? {
                list.push((id, startup_index.scan_cursor(id)?.last_scanned()));
            }
            Ok(list)
        })
        .await
        .map_err(|error| SyncError::InvariantViolation(format!("ledger task panicked: {}", error)))??;

    if subchains.is_empty() {
        return Err(SyncError::InvariantViolation(
            "no subchains registered".to_string(),
        ));
    }
    let start_height = subchains
        .iter()
        .map(|(_, position)| position.height() + 1)
        .min()
        .unwrap_or(0)
        .max(0) as u64;
    tracing::info!(
        "Syncing {} subchain(s) from height {}.",
        subchains.len(),
        start_height
    );

    let (fetch_request_sender, fetch_request_receiver) = unbounded_channel();
    let fetcher: JoinHandle<Result<(), crate::error::FetchError>> =
        tokio::spawn(fetch::fetch(fetch_request_receiver, source));

    let header_chain = Arc::new(RwLock::new(HeaderChain::new(Position::none())));
    let filter_chain = Arc::new(RwLock::new(FilterChain::new()));
    let header_lock = Arc::new(Mutex::new(()));
    let (tip_sender, tip_receiver) = watch::channel(Position::none());
    let (checkpoint_sender, checkpoint_receiver) = watch::channel(Checkpoint::genesis());
    let (reorg_sender, mut reorg_receiver) = unbounded_channel();
    let (filter_reorg_sender, filter_reorg_receiver) = unbounded_channel();

    let mut tasks: Vec<JoinHandle<Result<(), SyncError>>> = Vec::new();

    tasks.push(tokio::spawn(
        HeaderOracle::new(
            start_height,
            fetch_request_sender.clone(),
            header_chain.clone(),
            header_lock.clone(),
            tip_sender,
            reorg_sender,
            shutdown.clone(),
        )
        .run(),
    ));
    tasks.push(tokio::spawn(
        FilterOracle::new(
            start_height,
            fetch_request_sender.clone(),
            header_chain.clone(),
            filter_chain.clone(),
            tip_receiver,
            checkpoint_sender,
            filter_reorg_receiver,
            shutdown.clone(),
        )
        .run(),
    ));

    let mut handles: Vec<SubchainHandle> = Vec::new();
    for (subchain, _) in &subchains {
        let (handle, message_receiver) = SubchainHandle::new();
        handles.push(handle);
        tasks.push(tokio::spawn(
            SubchainTask::new(
                *subchain,
                index.clone(),
                key_source.clone(),
                fetch_request_sender.clone(),
                filter_chain.clone(),
                header_lock.clone(),
                checkpoint_receiver.clone(),
                message_receiver,
                progress_sender.clone(),
                shutdown.clone(),
            )
            .run(),
        ));
    }
    drop(progress_sender);

    let mut prune_interval = tokio::time::interval(PRUNE_INTERVAL);
    let mut reorgs_open = true;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                for handle in &handles {
                    let _ = handle.shutdown();
                }
                break;
            }
            ancestor = reorg_receiver.recv(), if reorgs_open => {
                match ancestor {
                    Some(ancestor) => {
                        let _ = filter_reorg_sender.send(ancestor);
                        for handle in &handles {
                            if let Err(error) = handle.process_reorg(ancestor) {
                                tracing::warn!("Reorg notice not delivered: {}", error);
                            }
                        }
                    }
                    None => reorgs_open = false,
                }
            }
            _ = prune_interval.tick() => {
                prune(&index, &header_chain, &filter_chain).await;
            }
        }
    }

    drop(fetch_request_sender);
    drop(handles);

    let mut result = Ok(());
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::error!("Sync task failed: {}", error);
                if result.is_ok() {
                    result = Err(error);
                }
            }
            Err(error) => {
                if result.is_ok() {
                    result = Err(SyncError::InvariantViolation(format!(
                        "sync task panicked: {}",
                        error
                    )));
                }
            }
        }
    }
    match fetcher.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            if result.is_ok() {
                result = Err(error.into());
            }
        }
        Err(error) => {
            if result.is_ok() {
                result = Err(SyncError::InvariantViolation(format!(
                    "fetch task panicked: {}",
                    error
                )));
            }
        }
    }

    result
}

// drops in-memory headers and filters every subchain has scanned past,
// keeping a margin for reorg rollback.
async fn prune(
    index: &LedgerIndex,
    header_chain: &Arc<RwLock<HeaderChain>>,
    filter_chain: &Arc<RwLock<FilterChain>>,
) {
    let index = index.clone();
    let slowest = tokio::task::spawn_blocking(move || -> Result<Option<i64>, IndexError> {
        let mut slowest = None;
        for (id, _, _) in index.subchains()? {
            let height = index.scan_cursor(id)?.last_scanned().height();
            slowest = Some(slowest.map_or(height, |current: i64| current.min(height)));
        }
        Ok(slowest)
    })
    .await;

    let slowest = match slowest {
        Ok(Ok(slowest)) => slowest,
        Ok(Err(error)) => {
            tracing::warn!("Prune pass skipped: {}", error);
            return;
        }
        Err(_) => return,
    };

    if let Some(slowest) = slowest {
        if slowest > PRUNE_MARGIN as i64 {
            let below = slowest as u64 - PRUNE_MARGIN;
            header_chain.write().await.prune_below(below);
            filter_chain.write().await.prune_below(below);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::ops::Range;

    use tokio::sync::mpsc::UnboundedReceiver;

    use bitcoin::absolute::LockTime;
    use bitcoin::bip158::{BlockFilter, Error as Bip158Error};
    use bitcoin::block::{Header, Version as BlockVersion};
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{
        Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction,
        TxIn, TxMerkleNode, TxOut, Txid, Witness,
    };

    use super::*;
    use crate::error::FetchError;
    use crate::interface::FilterChunk;
    use crate::primitives::{Branch, Element, PatternId, SubaccountId};

    fn script_for(subchain: u32, index: u32) -> ScriptBuf {
        let mut bytes = vec![0x00, 0x14];
        bytes.extend(std::iter::repeat(0xA0u8 + subchain as u8).take(18));
        bytes.extend_from_slice(&index.to_be_bytes());
        ScriptBuf::from_bytes(bytes)
    }

    struct MockKeys;

    impl KeySource for MockKeys {
        type Error = String;

        fn derive_elements(
            &self,
            subchain: SubchainId,
            range: Range<u32>,
        ) -> Result<Vec<Element>, Self::Error> {
            Ok(range
                .map(|index| {
                    Element::from_parts(
                        index,
                        subchain,
                        script_for(subchain.index(), index).to_bytes(),
                    )
                })
                .collect())
        }
    }

    struct ChainState {
        blocks: Vec<Block>,
        prevouts: HashMap<OutPoint, ScriptBuf>,
        ancestor_override: Option<Position>,
        block_failures: u32,
    }

    struct MockChain {
        state: std::sync::Mutex<ChainState>,
    }

    impl MockChain {
        fn new() -> Self {
            Self {
                state: std::sync::Mutex::new(ChainState {
                    blocks: Vec::new(),
                    prevouts: HashMap::new(),
                    ancestor_override: None,
                    block_failures: 0,
                }),
            }
        }

        fn add_block(&self, scripts: Vec<ScriptBuf>, spends: Vec<OutPoint>) -> Txid {
            let mut state = self.state.lock().unwrap();
            Self::push_block(&mut state, scripts, spends)
        }

        fn push_block(state: &mut ChainState, scripts: Vec<ScriptBuf>, spends: Vec<OutPoint>) -> Txid {
            let height = state.blocks.len() as u32;
            let prev_blockhash = state
                .blocks
                .last()
                .map(|block| block.block_hash())
                .unwrap_or_else(BlockHash::all_zeros);

            // a leading coinbase keeps payload transactions non-first, so
            // their prevout scripts enter the block's filter; the height in
            // the script_sig keeps coinbase txids distinct
            let coinbase = Transaction {
                version: Version::TWO,
                lock_time: LockTime::ZERO,
                input: vec![TxIn {
                    previous_output: OutPoint::null(),
                    script_sig: ScriptBuf::from_bytes(height.to_be_bytes().to_vec()),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                }],
                output: vec![TxOut {
                    value: Amount::from_sat(50_000),
                    script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
                }],
            };

            let mut txdata = vec![coinbase];
            if !scripts.is_empty() || !spends.is_empty() {
                // a per-block marker output keeps payload txids distinct
                let mut marker = vec![0x6A, 0x04];
                marker.extend_from_slice(&height.to_be_bytes());
                let mut outputs = vec![ScriptBuf::from_bytes(marker)];
                outputs.extend(scripts);

                txdata.push(Transaction {
                    version: Version::TWO,
                    lock_time: LockTime::ZERO,
                    input: spends
                        .into_iter()
                        .map(|previous_output| TxIn {
                            previous_output,
                            script_sig: ScriptBuf::new(),
                            sequence: Sequence::MAX,
                            witness: Witness::new(),
                        })
                        .collect(),
                    output: outputs
                        .into_iter()
                        .map(|script_pubkey| TxOut {
                            value: Amount::from_sat(50_000),
                            script_pubkey,
                        })
                        .collect(),
                });
            }

            let txid = txdata.last().map(Transaction::compute_txid).unwrap();
            for transaction in &txdata {
                let transaction_txid = transaction.compute_txid();
                for (vout, output) in transaction.output.iter().enumerate() {
                    state.prevouts.insert(
                        OutPoint::new(transaction_txid, vout as u32),
                        output.script_pubkey.clone(),
                    );
                }
            }

            state.blocks.push(Block {
                header: Header {
                    version: BlockVersion::TWO,
                    prev_blockhash,
                    merkle_root: TxMerkleNode::all_zeros(),
                    time: height,
                    bits: CompactTarget::from_consensus(0x1d00_ffff),
                    nonce: 0,
                },
                txdata,
            });
            txid
        }

        fn extend_empty(&self, count: usize) {
            let mut state = self.state.lock().unwrap();
            for _ in 0..count {
                Self::push_block(&mut state, Vec::new(), Vec::new());
            }
        }

        fn tip(&self) -> Position {
            let state = self.state.lock().unwrap();
            Self::tip_of(&state)
        }

        fn tip_of(state: &ChainState) -> Position {
            Position::from_parts(
                state.blocks.len() as i64 - 1,
                state.blocks.last().map(|block| block.block_hash()).unwrap_or_else(BlockHash::all_zeros),
            )
        }

        /// Replaces everything above `ancestor_height` with `new_blocks`
        /// empty blocks on a diverging branch.
        fn reorg(&self, ancestor_height: u64, new_blocks: usize) {
            let mut state = self.state.lock().unwrap();
            state.blocks.truncate(ancestor_height as usize + 1);
            state.ancestor_override = Some(Self::tip_of(&state));
            for _ in 0..new_blocks {
                // nonzero nonce forces different hashes than the old branch
                let height = state.blocks.len() as u32;
                let marker = ScriptBuf::from_bytes(vec![0x6A, 0x01, 0xEE]);
                Self::push_block(&mut state, vec![marker], Vec::new());
                state.blocks.last_mut().unwrap().header.nonce = 0xDEAD_0000 | height;
                // relink: nonce change rewrites this hash, successors are
                // pushed afterwards so their prev links stay correct
            }
        }

        fn set_block_failures(&self, failures: u32) {
            self.state.lock().unwrap().block_failures = failures;
        }

        fn filters(state: &ChainState) -> Vec<FilterChunk> {
            let mut previous = bitcoin::FilterHeader::all_zeros();
            let mut chunks = Vec::new();
            for block in &state.blocks {
                let filter = BlockFilter::new_script_filter(block, |outpoint| {
                    state
                        .prevouts
                        .get(outpoint)
                        .cloned()
                        .ok_or(Bip158Error::UtxoMissing(*outpoint))
                })
                .unwrap();
                let filter_header = filter.filter_header(&previous);
                previous = filter_header;
                chunks.push(FilterChunk {
                    block_hash: block.block_hash(),
                    filter_header,
                    filter: filter.content,
                });
            }
            chunks
        }
    }

    #[async_trait::async_trait]
    impl ChainSource for MockChain {
        async fn chain_tip(&self) -> Result<Position, FetchError> {
            Ok(Self::tip_of(&self.state.lock().unwrap()))
        }

        async fn common_ancestor(&self, local: Position) -> Result<Position, FetchError> {
            let state = self.state.lock().unwrap();
            if local.is_none() {
                return Ok(local);
            }
            let height = local.height() as usize;
            if height < state.blocks.len() && state.blocks[height].block_hash() == local.hash() {
                return Ok(local);
            }
            Ok(state.ancestor_override.unwrap())
        }

        async fn header_range(&self, range: Range<u64>) -> Result<Vec<Header>, FetchError> {
            let state = self.state.lock().unwrap();
            let end = (range.end as usize).min(state.blocks.len());
            Ok(state.blocks[range.start as usize..end]
                .iter()
                .map(|block| block.header)
                .collect())
        }

        async fn filter_range(&self, range: Range<u64>) -> Result<Vec<FilterChunk>, FetchError> {
            let state = self.state.lock().unwrap();
            let chunks = Self::filters(&state);
            let end = (range.end as usize).min(chunks.len());
            Ok(chunks[range.start as usize..end].to_vec())
        }

        async fn block(&self, height: u64, _hash: BlockHash) -> Result<Block, FetchError> {
            let mut state = self.state.lock().unwrap();
            if state.block_failures > 0 {
                state.block_failures -= 1;
                return Err(FetchError::Transient("induced failure".to_string()));
            }
            state
                .blocks
                .get(height as usize)
                .cloned()
                .ok_or_else(|| FetchError::Transient(format!("no block at height {}", height)))
        }
    }

    fn spawn_engine(
        source: &Arc<MockChain>,
        index: &LedgerIndex,
    ) -> (
        JoinHandle<Result<(), SyncError>>,
        watch::Sender<bool>,
        UnboundedReceiver<SyncUpdate>,
    ) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);
        let (progress_sender, progress_receiver) = unbounded_channel();
        let task = tokio::spawn(sync(
            source.clone(),
            Arc::new(MockKeys),
            index.clone(),
            shutdown_receiver,
            progress_sender,
        ));
        (task, shutdown_sender, progress_receiver)
    }

    async fn wait_for(
        progress: &mut UnboundedReceiver<SyncUpdate>,
        subchain: SubchainId,
        position: Position,
    ) {
        tokio::time::timeout(Duration::from_secs(60), async {
            while let Some(update) = progress.recv().await {
                if update.subchain() == subchain && update.position() == position {
                    return;
                }
            }
            panic!("progress channel closed before {} reached {}", subchain, position);
        })
        .await
        .unwrap();
    }

    #[test]
    fn spend_block_filter_matches_the_spent_script() {
        let source = MockChain::new();
        source.extend_empty(3);
        let funding_txid = source.add_block(vec![script_for(0, 0)], Vec::new());
        source.add_block(Vec::new(), vec![OutPoint::new(funding_txid, 1)]);

        let state = source.state.lock().unwrap();
        let chunks = MockChain::filters(&state);
        let queries = [script_for(0, 0).to_bytes()];

        // the spend transaction carries no watched output; only its spent
        // prevout script can make the block a candidate
        let spend = &chunks[4];
        assert!(BlockFilter::new(&spend.filter)
            .match_any(&spend.block_hash, &mut queries.iter().map(Vec::as_slice))
            .unwrap());

        let empty = &chunks[2];
        assert!(!BlockFilter::new(&empty.filter)
            .match_any(&empty.block_hash, &mut queries.iter().map(Vec::as_slice))
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn engine_finds_output_and_input_matches() {
        let source = Arc::new(MockChain::new());
        source.extend_empty(100);
        let funding_txid = source.add_block(vec![script_for(0, 0)], Vec::new());
        let funding = OutPoint::new(funding_txid, 1);
        source.extend_empty(9);
        let spend_txid = source.add_block(Vec::new(), vec![funding]);
        source.extend_empty(10);

        let index = LedgerIndex::temporary().unwrap();
        let subchain = index
            .subchain_id(SubaccountId::from_bytes([1u8; 32]), Branch::External)
            .unwrap();

        let (engine, shutdown, mut progress) = spawn_engine(&source, &index);
        wait_for(&mut progress, subchain, source.tip()).await;
        shutdown.send(true).unwrap();
        engine.await.unwrap().unwrap();

        let recorded = index.matches_for(subchain).unwrap();
        assert_eq!(recorded.len(), 2);
        assert!(recorded.iter().any(|(height, hit)| {
            *height == 100
                && matches!(hit, crate::primitives::Match::Output { txid, vout: 1, .. } if *txid == funding_txid)
        }));
        assert!(recorded.iter().any(|(height, hit)| {
            *height == 110
                && matches!(hit, crate::primitives::Match::Input { txid, outpoint, .. }
                    if *txid == spend_txid && *outpoint == funding)
        }));

        let pattern = PatternId::from_parts(subchain, 0);
        let mut transactions = index.lookup_transactions(pattern).unwrap();
        transactions.sort_by_key(|(_, height)| *height);
        assert_eq!(transactions, vec![(funding_txid, 100), (spend_txid, 110)]);

        // the lookahead window is indexed past the hit
        assert!(index.scan_cursor(subchain).unwrap().last_indexed().unwrap() >= 20);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reorg_unwinds_matches_on_the_abandoned_branch() {
        let source = Arc::new(MockChain::new());
        source.extend_empty(100);
        source.add_block(vec![script_for(0, 0)], Vec::new());
        source.extend_empty(5);

        let index = LedgerIndex::temporary().unwrap();
        let subchain = index
            .subchain_id(SubaccountId::from_bytes([1u8; 32]), Branch::External)
            .unwrap();

        let (engine, shutdown, mut progress) = spawn_engine(&source, &index);
        wait_for(&mut progress, subchain, source.tip()).await;
        assert_eq!(index.matches_for(subchain).unwrap().len(), 1);

        // the branch carrying the match is abandoned
        source.reorg(99, 8);
        let new_tip = source.tip();
        wait_for(&mut progress, subchain, new_tip).await;
        shutdown.send(true).unwrap();
        engine.await.unwrap().unwrap();

        assert!(index.matches_for(subchain).unwrap().is_empty());
        assert_eq!(index.scan_cursor(subchain).unwrap().last_scanned(), new_tip);
        assert!(index
            .lookup_transactions(PatternId::from_parts(subchain, 0))
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flaky_block_fetches_do_not_duplicate_matches() {
        let source = Arc::new(MockChain::new());
        source.extend_empty(100);
        let funding_txid = source.add_block(vec![script_for(0, 0)], Vec::new());
        source.extend_empty(5);
        source.set_block_failures(2);

        let index = LedgerIndex::temporary().unwrap();
        let subchain = index
            .subchain_id(SubaccountId::from_bytes([1u8; 32]), Branch::External)
            .unwrap();

        let (engine, shutdown, mut progress) = spawn_engine(&source, &index);
        wait_for(&mut progress, subchain, source.tip()).await;
        shutdown.send(true).unwrap();
        engine.await.unwrap().unwrap();

        let recorded = index.matches_for(subchain).unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, 100);
        assert_eq!(recorded[0].1.txid(), funding_txid);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subchains_scan_concurrently_without_crosstalk() {
        let source = Arc::new(MockChain::new());
        source.extend_empty(100);
        source.add_block(vec![script_for(0, 0)], Vec::new());
        source.add_block(vec![script_for(1, 0)], Vec::new());
        source.extend_empty(5);

        let index = LedgerIndex::temporary().unwrap();
        let first = index
            .subchain_id(SubaccountId::from_bytes([1u8; 32]), Branch::External)
            .unwrap();
        let second = index
            .subchain_id(SubaccountId::from_bytes([1u8; 32]), Branch::Internal)
            .unwrap();

        let (engine, shutdown, mut progress) = spawn_engine(&source, &index);
        let tip = source.tip();
        // one consumer for both subchains; either may reach the tip first
        tokio::time::timeout(Duration::from_secs(60), async {
            let mut reached = std::collections::HashSet::new();
            while reached.len() < 2 {
                let update = progress.recv().await.expect("progress channel closed");
                if update.position() == tip {
                    reached.insert(update.subchain());
                }
            }
        })
        .await
        .unwrap();
        shutdown.send(true).unwrap();
        engine.await.unwrap().unwrap();

        let first_matches = index.matches_for(first).unwrap();
        let second_matches = index.matches_for(second).unwrap();
        assert_eq!(first_matches.len(), 1);
        assert_eq!(first_matches[0].0, 100);
        assert_eq!(second_matches.len(), 1);
        assert_eq!(second_matches[0].0, 101);
    }
}
