//! Wallet-side chain synchronization and transaction-matching engine.
//!
//! Keeps a set of watched script patterns synchronized with the best chain
//! through compact block filters: validated headers and verified filters feed
//! per-subchain scanning tasks, which fetch only candidate blocks, run them
//! through the matching engine, and commit matches together with scan
//! progress to an embedded transactional index.
//!
//! Entrypoint: [`crate::sync::sync`]. Peer transport and key derivation are
//! supplied by the caller through [`crate::interface::ChainSource`] and
//! [`crate::interface::KeySource`].

#![warn(missing_docs)]

pub mod account;
pub(crate) mod block_fetcher;
pub mod client;
pub(crate) mod downloader;
pub mod error;
pub mod index;
pub mod interface;
pub(crate) mod matcher;
pub(crate) mod oracle;
pub mod primitives;
pub mod subchain;
pub mod sync;
