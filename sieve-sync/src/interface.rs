//! Traits for interfacing external collaborators with the sync engine

use std::fmt::Debug;
use std::ops::Range;

use async_trait::async_trait;

use bitcoin::{Block, BlockHash, FilterHeader};

use crate::error::FetchError;
use crate::primitives::{Element, Position, SubchainId};

/// One height of compact-filter data as served by the chain source.
#[derive(Debug, Clone)]
pub struct FilterChunk {
    /// Hash of the block the filter summarizes.
    pub block_hash: BlockHash,
    /// Chained filter header advertised for this height.
    pub filter_header: FilterHeader,
    /// Raw filter contents.
    pub filter: Vec<u8>,
}

/// The peer transport and chain-validity oracle, consumed as a single seam.
///
/// Connection management, peer selection and proof-of-work validation happen
/// behind this trait; the engine only issues range requests and reacts to the
/// answers. All requests flow through the single fetch task
/// ([`crate::client::fetch::fetch`]), never directly through this trait from
/// other actors.
#[async_trait]
pub trait ChainSource: Send + Sync + 'static {
    /// Returns the current best tip.
    async fn chain_tip(&self) -> Result<Position, FetchError>;

    /// Returns the highest position on the current best chain that is an
    /// ancestor of (or equal to) the given local position.
    async fn common_ancestor(&self, local: Position) -> Result<Position, FetchError>;

    /// Returns block headers for the given height range (end exclusive).
    async fn header_range(
        &self,
        range: Range<u64>,
    ) -> Result<Vec<bitcoin::block::Header>, FetchError>;

    /// Returns compact filters for the given height range (end exclusive).
    async fn filter_range(&self, range: Range<u64>) -> Result<Vec<FilterChunk>, FetchError>;

    /// Returns the full block with the given height and hash.
    async fn block(&self, height: u64, hash: BlockHash) -> Result<Block, FetchError>;
}

/// The key-derivation collaborator producing new elements on demand.
///
/// Derivation itself (keys, script construction) is out of scope; the engine
/// only asks for the elements of a derivation index range so it can keep a
/// lookahead window of indexed patterns ahead of the highest hit.
pub trait KeySource: Send + Sync + 'static {
    /// Errors associated with deriving elements.
    type Error: Debug;

    /// Derives the elements for `range` of derivation indices on `subchain`.
    fn derive_elements(
        &self,
        subchain: SubchainId,
        range: Range<u32>,
    ) -> Result<Vec<Element>, Self::Error>;
}
