//! Module for primitive structs associated with the sync engine

use std::cmp::Ordering;
use std::fmt;

use getset::{CopyGetters, Getters};

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, FilterHeader, OutPoint, Txid};

/// A point on the best chain.
///
/// Height `-1` together with the all-zero hash is the "none" position, used
/// for subchains that have not scanned any block yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Position {
    /// Block height, `-1` for none.
    height: i64,
    /// Hash of the block at this height.
    hash: BlockHash,
}

impl Position {
    /// The position of a subchain that has scanned nothing.
    pub fn none() -> Self {
        Self {
            height: -1,
            hash: BlockHash::all_zeros(),
        }
    }

    /// Creates a new position from parts.
    pub fn from_parts(height: i64, hash: BlockHash) -> Self {
        Self { height, hash }
    }

    /// Returns `true` if this is the "none" position.
    pub fn is_none(&self) -> bool {
        self.height < 0
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.height
            .cmp(&other.height)
            .then_with(|| self.hash.to_byte_array().cmp(&other.hash.to_byte_array()))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.height, self.hash)
    }
}

/// Opaque identifier of a wallet subaccount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubaccountId([u8; 32]);

impl SubaccountId {
    /// Creates a subaccount id from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw bytes of this id.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for SubaccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Opaque identifier of the identity owning one or more subaccounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId([u8; 32]);

impl OwnerId {
    /// Creates an owner id from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw bytes of this id.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Derivation branch of a subaccount, scanned independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    /// Receive branch.
    External,
    /// Change branch.
    Internal,
}

impl Branch {
    /// Stable single-byte encoding used in index keys.
    pub fn as_u8(&self) -> u8 {
        match self {
            Branch::External => 0,
            Branch::Internal => 1,
        }
    }

    /// Inverse of [`Branch::as_u8`].
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Branch::External),
            1 => Some(Branch::Internal),
            _ => None,
        }
    }
}

/// Kind of subaccount, populated once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubaccountType {
    /// BIP32 hierarchical-deterministic subaccount.
    Hd,
    /// Imported single keys.
    Imported,
    /// Payment-code derived subaccount.
    PaymentCode,
    /// Notification scripts.
    Notification,
}

impl SubaccountType {
    /// Stable single-byte encoding used in index values.
    pub fn as_u8(&self) -> u8 {
        match self {
            SubaccountType::Hd => 0,
            SubaccountType::Imported => 1,
            SubaccountType::PaymentCode => 2,
            SubaccountType::Notification => 3,
        }
    }

    /// Inverse of [`SubaccountType::as_u8`].
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(SubaccountType::Hd),
            1 => Some(SubaccountType::Imported),
            2 => Some(SubaccountType::PaymentCode),
            3 => Some(SubaccountType::Notification),
            _ => None,
        }
    }
}

/// Compact identifier of one (subaccount, branch) pair, allocated by the
/// ledger index and stable for the lifetime of the subaccount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubchainId(u32);

impl SubchainId {
    /// Creates a subchain id from its raw index.
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// The raw index of this subchain.
    pub fn index(&self) -> u32 {
        self.0
    }

    /// Big-endian key encoding.
    pub fn to_be_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for SubchainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subchain-{}", self.0)
    }
}

/// Identifier of one derived element within a subchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct ElementId {
    /// Owning subchain.
    subchain: SubchainId,
    /// Derivation index within the subchain.
    index: u32,
}

impl ElementId {
    /// Creates an element id from parts.
    pub fn from_parts(subchain: SubchainId, index: u32) -> Self {
        Self { subchain, index }
    }
}

/// Identifier of one distinct pattern byte string within a subchain; a
/// compact substitute for the byte string in index keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct PatternId {
    /// Owning subchain.
    subchain: SubchainId,
    /// Allocation index of the distinct byte string within the subchain.
    index: u32,
}

impl PatternId {
    /// Creates a pattern id from parts.
    pub fn from_parts(subchain: SubchainId, index: u32) -> Self {
        Self { subchain, index }
    }
}

/// One derived script at a specific index within a subchain, immutable once
/// created.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct Element {
    /// Derivation index.
    #[getset(get_copy = "pub")]
    derivation_index: u32,
    /// Owning subchain.
    #[getset(get_copy = "pub")]
    subchain: SubchainId,
    /// Raw script bytes produced by key derivation.
    #[getset(get = "pub")]
    script: Vec<u8>,
}

impl Element {
    /// Creates an element from parts.
    pub fn from_parts(derivation_index: u32, subchain: SubchainId, script: Vec<u8>) -> Self {
        Self {
            derivation_index,
            subchain,
            script,
        }
    }

    /// The id of this element.
    pub fn id(&self) -> ElementId {
        ElementId::from_parts(self.subchain, self.derivation_index)
    }
}

/// A watched byte string together with the element it belongs to.
///
/// Several elements may share one byte string; the byte string's identity is
/// carried by [`PatternId`].
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct Pattern {
    /// Element this pattern was derived from.
    #[getset(get_copy = "pub")]
    element: ElementId,
    /// Identity of the distinct byte string.
    #[getset(get_copy = "pub")]
    id: PatternId,
    /// The byte string matched against script data.
    #[getset(get = "pub")]
    bytes: Vec<u8>,
}

impl Pattern {
    /// Creates a pattern from parts.
    pub fn from_parts(element: ElementId, id: PatternId, bytes: Vec<u8>) -> Self {
        Self { element, id, bytes }
    }
}

/// A confirmed hit of one pattern in one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Match {
    /// A transaction output script contained the pattern.
    Output {
        /// Transaction containing the output.
        txid: Txid,
        /// Output index.
        vout: u32,
        /// Element that was hit.
        element: ElementId,
        /// Distinct byte string that was hit.
        pattern: PatternId,
    },
    /// A transaction input spent an output whose indexed script contained
    /// the pattern.
    Input {
        /// Spending transaction.
        txid: Txid,
        /// Outpoint being spent.
        outpoint: OutPoint,
        /// Element that was hit.
        element: ElementId,
        /// Distinct byte string that was hit.
        pattern: PatternId,
    },
}

impl Match {
    /// The transaction this match refers to.
    pub fn txid(&self) -> Txid {
        match self {
            Match::Output { txid, .. } | Match::Input { txid, .. } => *txid,
        }
    }

    /// The element that was hit.
    pub fn element(&self) -> ElementId {
        match self {
            Match::Output { element, .. } | Match::Input { element, .. } => *element,
        }
    }

    /// The distinct byte string that was hit.
    pub fn pattern(&self) -> PatternId {
        match self {
            Match::Output { pattern, .. } | Match::Input { pattern, .. } => *pattern,
        }
    }
}

/// Durable bookmark of how far a subchain has been scanned and indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct ScanCursor {
    /// Last block scanned for this subchain.
    last_scanned: Position,
    /// Highest derivation index for which elements have been created, if any.
    last_indexed: Option<u32>,
}

impl ScanCursor {
    /// Creates a cursor from parts.
    pub fn from_parts(last_scanned: Position, last_indexed: Option<u32>) -> Self {
        Self {
            last_scanned,
            last_indexed,
        }
    }

    /// The cursor of a freshly created subchain.
    pub fn blank() -> Self {
        Self {
            last_scanned: Position::none(),
            last_indexed: None,
        }
    }
}

/// A verified point of the filter chain published by the filter oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Checkpoint {
    /// Position of the newest verified filter.
    position: Position,
    /// Chained filter header at that position.
    filter_header: FilterHeader,
}

impl Checkpoint {
    /// Creates a checkpoint from parts.
    pub fn from_parts(position: Position, filter_header: FilterHeader) -> Self {
        Self {
            position,
            filter_header,
        }
    }

    /// The checkpoint before any filter has been verified.
    pub fn genesis() -> Self {
        Self {
            position: Position::none(),
            filter_header: FilterHeader::all_zeros(),
        }
    }
}

/// Progress event emitted whenever a subchain's cursor advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct SyncUpdate {
    /// Subchain that advanced.
    subchain: SubchainId,
    /// New last-scanned position.
    position: Position,
}

impl SyncUpdate {
    /// Creates an update from parts.
    pub fn from_parts(subchain: SubchainId, position: Position) -> Self {
        Self { subchain, position }
    }
}
