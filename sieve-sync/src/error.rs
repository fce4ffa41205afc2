//! Top level error module for the crate

use bitcoin::{BlockHash, FilterHeader};

use crate::primitives::{PatternId, Position, SubchainId};

/// Top level error enum encapsulating any error that may occur during sync
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Errors fetching data from the chain source.
    #[error("Fetch error. {0}")]
    Fetch(#[from] FetchError),
    /// Errors in the download pipeline bookkeeping.
    #[error("Download error. {0}")]
    Download(#[from] DownloadError),
    /// Validation failure of a downloaded item.
    #[error("Validation error. {0}")]
    Validation(#[from] ItemValidationError),
    /// Errors from the persistent ledger index.
    #[error("Index error. {0}")]
    Index(#[from] IndexError),
    /// Errors parsing the watched pattern set.
    #[error("Match error. {0}")]
    Match(#[from] MatchError),
    /// Key derivation collaborator failed.
    #[error("Key derivation error. {0}")]
    KeyDerivation(String),
    /// A state invariant was violated; unrecoverable logic error.
    #[error("Invariant violation. {0}")]
    InvariantViolation(String),
    /// A required channel to another task was closed.
    #[error("Channel to {0} task closed")]
    ChannelClosed(&'static str),
}

/// Errors fetching data from the chain source.
///
/// Transient failures and timeouts are retried inside the fetch task and the
/// block fetcher; only retry exhaustion escalates to the owning subchain.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Recoverable failure reported by the source.
    #[error("Transient fetch failure. {0}")]
    Transient(String),
    /// The source did not answer within the fetch timeout.
    #[error("Fetch timed out. {0}")]
    Timeout(&'static str),
    /// The bounded retry budget was exhausted.
    #[error("Fetch retries exhausted after {attempts} attempts. {request}")]
    RetriesExhausted {
        /// Description of the failed request.
        request: String,
        /// Number of attempts made.
        attempts: u32,
    },
    /// The fetch task is no longer running.
    #[error("Fetch task disconnected")]
    Disconnected,
}

/// Errors in the download manager's reservation bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// A completed item's index lies outside its batch's reserved range.
    #[error("Item index {index} outside batch range {start}..{end}")]
    ForeignIndex {
        /// Offending item index.
        index: u64,
        /// Reserved range start.
        start: u64,
        /// Reserved range end (exclusive).
        end: u64,
    },
}

/// Validation failure of a downloaded header or filter.
///
/// Treated as a peer-quality signal: the offending item is dropped and
/// re-requested, never committed.
#[derive(Debug, thiserror::Error)]
pub enum ItemValidationError {
    /// A header does not link to its predecessor.
    #[error("Header at height {height} links to {prev_hash}, expected {expected}")]
    HeaderLink {
        /// Height of the offending header.
        height: u64,
        /// The `prev_blockhash` the header carries.
        prev_hash: BlockHash,
        /// Hash of the previously delivered header.
        expected: BlockHash,
    },
    /// A filter's chained header does not match the advertised one.
    #[error("Filter header mismatch at height {height}: advertised {advertised}, computed {computed}")]
    FilterHeaderMismatch {
        /// Height of the offending filter.
        height: u64,
        /// Header advertised by the source.
        advertised: FilterHeader,
        /// Header computed from the filter contents.
        computed: FilterHeader,
    },
    /// A filter was keyed to a block hash not on the verified header chain.
    #[error("Filter at height {height} keyed to {got}, header chain has {expected}")]
    BlockHashMismatch {
        /// Height of the offending filter.
        height: u64,
        /// Block hash the source returned.
        got: BlockHash,
        /// Block hash on the verified header chain.
        expected: BlockHash,
    },
}

/// Errors from the persistent ledger index.
///
/// Storage failures are fatal to the affected subchain; it halts and reports
/// upward rather than guessing at recovery.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Underlying key-value store failure.
    #[error("Storage error. {0}")]
    Storage(#[from] sled::Error),
    /// A stored record failed to decode.
    #[error("Corrupt index record. {0}")]
    Corrupt(String),
    /// An operation referenced a subchain the index has never seen.
    #[error("Unknown {0}")]
    UnknownSubchain(SubchainId),
    /// A cursor write would move the cursor backwards outside of a reorg.
    #[error("Cursor regression for {subchain}: {current} -> {requested}")]
    CursorRegression {
        /// Affected subchain.
        subchain: SubchainId,
        /// Currently recorded position.
        current: Position,
        /// Rejected new position.
        requested: Position,
    },
}

impl From<sled::transaction::TransactionError<IndexError>> for IndexError {
    fn from(error: sled::transaction::TransactionError<IndexError>) -> Self {
        match error {
            sled::transaction::TransactionError::Abort(error) => error,
            sled::transaction::TransactionError::Storage(error) => IndexError::Storage(error),
        }
    }
}

/// Errors parsing the watched pattern set.
///
/// A bad pattern set is a corruption signal; the affected block batch is
/// aborted and never partially committed.
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    /// An empty pattern would match every script.
    #[error("Empty pattern bytes for {0:?}")]
    EmptyPattern(PatternId),
    /// The probabilistic filter test failed to decode a filter.
    #[error("Filter decode failure at height {height}. {reason}")]
    FilterDecode {
        /// Height of the offending filter.
        height: u64,
        /// Decoder error text.
        reason: String,
    },
}
