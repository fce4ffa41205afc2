//! Generic pipelined download manager
//!
//! One instance drives the ordered download of a single item kind (headers,
//! filters, blocks). The manager owns an ordered frontier and a set of
//! non-overlapping batch reservations; completions may arrive out of order
//! and are buffered until they can be delivered strictly in index order.
//! All mutation happens on the owning actor's task; concurrency comes from
//! the in-flight fetches whose results re-enter through that task.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use crate::error::{DownloadError, ItemValidationError};
use crate::primitives::Checkpoint;

const MIN_BATCH_SIZE: u32 = 1;
const BATCH_SIZE_INCREMENT: u32 = 1;

/// A downloadable item delivered by a [`DownloadManager`].
pub(crate) trait DownloadItem: Send + 'static {
    /// The item's position in the download sequence.
    fn index(&self) -> u64;

    /// Validates this item against the previously delivered one.
    fn validate(&self, previous: Option<&Self>) -> Result<(), ItemValidationError>;

    /// The checkpoint this item publishes once delivered, if any.
    fn checkpoint(&self) -> Option<Checkpoint>;
}

/// An in-flight reservation of a contiguous index range, owned exclusively
/// by one outstanding fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Batch {
    id: u64,
    start: u64,
    count: u32,
}

impl Batch {
    /// The reserved index range (end exclusive).
    pub(crate) fn range(&self) -> Range<u64> {
        self.start..self.start + u64::from(self.count)
    }

    pub(crate) fn start(&self) -> u64 {
        self.start
    }
}

/// Pipelined fetch bookkeeping for one item kind.
pub(crate) struct DownloadManager<I> {
    // next index to deliver to the consumer
    frontier: u64,
    // exclusive upper bound of indices eligible for reservation
    target: u64,
    // disjoint unreserved ranges, keyed by start
    unreserved: BTreeMap<u64, u64>,
    // live reservations by batch id
    reservations: HashMap<u64, Batch>,
    // fetched items waiting for in-order delivery
    buffered: BTreeMap<u64, I>,
    next_batch_id: u64,
    batch_size: u32,
    max_batch_size: u32,
}

impl<I> DownloadManager<I>
where
    I: DownloadItem,
{
    pub(crate) fn new(frontier: u64, batch_size: u32, max_batch_size: u32) -> Self {
        Self {
            frontier,
            target: frontier,
            unreserved: BTreeMap::new(),
            reservations: HashMap::new(),
            buffered: BTreeMap::new(),
            next_batch_id: 0,
            batch_size: batch_size.clamp(MIN_BATCH_SIZE, max_batch_size),
            max_batch_size,
        }
    }

    /// Extends the reservation ceiling to `target` (exclusive). Shrinking is
    /// only possible through [`DownloadManager::reorg`].
    pub(crate) fn set_target(&mut self, target: u64) {
        if target > self.target {
            self.insert_unreserved(self.target..target);
            self.target = target;
        }
    }

    /// Reserves up to `count` of the lowest unfetched, unreserved indices.
    /// Returns `None` when nothing is outstanding.
    pub(crate) fn request_batch(&mut self, count: u32) -> Option<Batch> {
        if count == 0 {
            return None;
        }

        let (&start, &end) = self.unreserved.iter().next()?;
        self.unreserved.remove(&start);

        let take = u64::from(count).min(end - start);
        if start + take < end {
            self.unreserved.insert(start + take, end);
        }

        let batch = Batch {
            id: self.next_batch_id,
            start,
            count: take as u32,
        };
        self.next_batch_id += 1;
        self.reservations.insert(batch.id, batch);

        Some(batch)
    }

    /// Marks a reserved batch's entries as fetched. Items are buffered until
    /// deliverable in index order. Duplicate completion of an already-handled
    /// batch or an already-delivered index is a no-op; indices the provider
    /// failed to return become eligible for re-reservation.
    pub(crate) fn complete(&mut self, batch: &Batch, items: Vec<I>) -> Result<(), DownloadError> {
        let Some(reserved) = self.reservations.get(&batch.id).copied() else {
            // duplicate or reorg-invalidated completion
            return Ok(());
        };
        let range = reserved.range();

        if let Some(item) = items.iter().find(|item| !range.contains(&item.index())) {
            return Err(DownloadError::ForeignIndex {
                index: item.index(),
                start: range.start,
                end: range.end,
            });
        }
        self.reservations.remove(&batch.id);

        for item in items {
            let index = item.index();
            if index < self.frontier {
                continue;
            }
            self.buffered.insert(index, item);
        }

        // any reserved index the provider did not return goes back to the pool
        let mut missing_start: Option<u64> = None;
        for index in range.clone() {
            let present = index < self.frontier || self.buffered.contains_key(&index);
            match (present, missing_start) {
                (false, None) => missing_start = Some(index),
                (true, Some(start)) => {
                    self.insert_unreserved(start..index);
                    missing_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = missing_start {
            self.insert_unreserved(start..range.end);
        }

        self.batch_size = (self.batch_size + BATCH_SIZE_INCREMENT).min(self.max_batch_size);

        Ok(())
    }

    /// Releases a reservation without marking anything fetched; the range
    /// becomes eligible for re-reservation.
    pub(crate) fn fail(&mut self, batch: &Batch) {
        if let Some(reserved) = self.reservations.remove(&batch.id) {
            self.insert_unreserved(reserved.range());
            self.shrink_batch_size();
        }
    }

    /// Invalidates all buffered and reserved state and resets the frontier.
    /// The target collapses to the new frontier; the owner re-extends it once
    /// the new tip is known.
    pub(crate) fn reorg(&mut self, new_frontier: u64) {
        self.frontier = new_frontier;
        self.target = new_frontier;
        self.unreserved.clear();
        self.reservations.clear();
        self.buffered.clear();
    }

    /// The next in-order item, if it has been fetched.
    pub(crate) fn ready(&self) -> Option<&I> {
        self.buffered.get(&self.frontier)
    }

    /// Delivers the next in-order item and advances the frontier.
    pub(crate) fn pop_ready(&mut self) -> Option<I> {
        let item = self.buffered.remove(&self.frontier)?;
        self.frontier += 1;
        Some(item)
    }

    /// Drops the next in-order item (failed validation) and re-queues its
    /// index for fetching.
    pub(crate) fn reject_ready(&mut self) {
        if self.buffered.remove(&self.frontier).is_some() {
            self.insert_unreserved(self.frontier..self.frontier + 1);
            self.shrink_batch_size();
        }
    }

    /// Current adaptive batch size: grown additively on completion, halved
    /// on failure or rejection.
    pub(crate) fn suggested_batch_size(&self) -> u32 {
        self.batch_size
    }

    /// `true` while any index remains unreserved, reserved, or undelivered.
    pub(crate) fn has_outstanding(&self) -> bool {
        !self.unreserved.is_empty() || !self.reservations.is_empty() || !self.buffered.is_empty()
    }

    fn shrink_batch_size(&mut self) {
        self.batch_size = (self.batch_size / 2).max(MIN_BATCH_SIZE);
    }

    fn insert_unreserved(&mut self, range: Range<u64>) {
        if range.start < range.end {
            self.unreserved.insert(range.start, range.end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestItem(u64);

    impl DownloadItem for TestItem {
        fn index(&self) -> u64 {
            self.0
        }

        fn validate(&self, _previous: Option<&Self>) -> Result<(), ItemValidationError> {
            Ok(())
        }

        fn checkpoint(&self) -> Option<Checkpoint> {
            None
        }
    }

    fn items(range: Range<u64>) -> Vec<TestItem> {
        range.map(TestItem).collect()
    }

    fn drain(manager: &mut DownloadManager<TestItem>) -> Vec<u64> {
        let mut delivered = Vec::new();
        while let Some(item) = manager.pop_ready() {
            delivered.push(item.index());
        }
        delivered
    }

    #[test]
    fn delivers_in_order_across_out_of_order_completions() {
        let mut manager = DownloadManager::new(0, 4, 16);
        manager.set_target(12);

        let first = manager.request_batch(4).unwrap();
        let second = manager.request_batch(4).unwrap();
        let third = manager.request_batch(4).unwrap();
        assert_eq!(first.range(), 0..4);
        assert_eq!(second.range(), 4..8);
        assert_eq!(third.range(), 8..12);

        manager.complete(&third, items(8..12)).unwrap();
        assert!(manager.ready().is_none());
        manager.complete(&first, items(0..4)).unwrap();
        assert_eq!(drain(&mut manager), vec![0, 1, 2, 3]);

        manager.complete(&second, items(4..8)).unwrap();
        assert_eq!(drain(&mut manager), vec![4, 5, 6, 7, 8, 9, 10, 11]);
        assert!(!manager.has_outstanding());
    }

    #[test]
    fn duplicate_complete_is_a_no_op() {
        let mut manager = DownloadManager::new(0, 4, 16);
        manager.set_target(4);

        let batch = manager.request_batch(4).unwrap();
        manager.complete(&batch, items(0..4)).unwrap();
        assert_eq!(drain(&mut manager), vec![0, 1, 2, 3]);

        manager.complete(&batch, items(0..4)).unwrap();
        assert!(manager.ready().is_none());
        assert!(!manager.has_outstanding());
    }

    #[test]
    fn failed_batch_is_re_reservable() {
        let mut manager: DownloadManager<TestItem> = DownloadManager::new(10, 4, 16);
        manager.set_target(14);

        let batch = manager.request_batch(4).unwrap();
        assert!(manager.request_batch(4).is_none());

        manager.fail(&batch);
        let retry = manager.request_batch(4).unwrap();
        assert_eq!(retry.range(), 10..14);
    }

    #[test]
    fn partial_completion_requeues_missing_indices() {
        let mut manager = DownloadManager::new(0, 6, 16);
        manager.set_target(6);

        let batch = manager.request_batch(6).unwrap();
        // provider returned only the edges of the range
        manager
            .complete(&batch, vec![TestItem(0), TestItem(1), TestItem(5)])
            .unwrap();
        assert_eq!(drain(&mut manager), vec![0, 1]);

        let retry = manager.request_batch(6).unwrap();
        assert_eq!(retry.range(), 2..5);
    }

    #[test]
    fn foreign_index_is_rejected() {
        let mut manager = DownloadManager::new(0, 4, 16);
        manager.set_target(4);

        let batch = manager.request_batch(4).unwrap();
        let result = manager.complete(&batch, vec![TestItem(7)]);
        assert!(matches!(
            result,
            Err(DownloadError::ForeignIndex { index: 7, .. })
        ));

        // the reservation survives a malformed completion
        manager.fail(&batch);
        assert_eq!(manager.request_batch(4).unwrap().range(), 0..4);
    }

    #[test]
    fn reorg_invalidates_buffered_and_reserved_state() {
        let mut manager = DownloadManager::new(0, 4, 16);
        manager.set_target(12);

        let first = manager.request_batch(4).unwrap();
        let second = manager.request_batch(4).unwrap();
        manager.complete(&second, items(4..8)).unwrap();

        manager.reorg(3);
        // a stale completion after the reorg is ignored
        manager.complete(&first, items(0..4)).unwrap();
        assert!(manager.ready().is_none());
        assert!(!manager.has_outstanding());

        manager.set_target(12);
        let retry = manager.request_batch(16).unwrap();
        assert_eq!(retry.range().start, 3);
        assert!(retry.range().end <= 12);
    }

    #[test]
    fn batch_size_adapts_to_outcomes() {
        let mut manager = DownloadManager::new(0, 8, 16);
        manager.set_target(1000);

        let batch = manager.request_batch(8).unwrap();
        manager.fail(&batch);
        assert_eq!(manager.suggested_batch_size(), 4);

        let batch = manager.request_batch(4).unwrap();
        manager.fail(&batch);
        assert_eq!(manager.suggested_batch_size(), 2);

        for expected in [3, 4, 5] {
            let batch = manager.request_batch(manager.suggested_batch_size()).unwrap();
            manager.complete(&batch, items(batch.range())).unwrap();
            assert_eq!(manager.suggested_batch_size(), expected);
        }
    }

    #[test]
    fn rejected_item_is_refetchable() {
        let mut manager = DownloadManager::new(0, 4, 16);
        manager.set_target(2);

        let batch = manager.request_batch(4).unwrap();
        manager.complete(&batch, items(0..2)).unwrap();

        manager.reject_ready();
        assert!(manager.ready().is_none());

        let retry = manager.request_batch(4).unwrap();
        assert_eq!(retry.range(), 0..1);
        manager.complete(&retry, items(0..1)).unwrap();
        assert_eq!(drain(&mut manager), vec![0, 1]);
    }
}
