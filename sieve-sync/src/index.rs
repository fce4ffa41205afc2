//! Persistent ledger index
//!
//! All durable state lives here, in one embedded [`sled`] database with a
//! tree per record family. Scan results for a block are committed in a single
//! multi-tree transaction together with the cursor advance, so a crash can
//! never leave a cursor ahead of its recorded matches. Reorg rollback deletes
//! everything above the common ancestor the same way.
//!
//! Concurrency discipline: each subchain task is the sole writer of its own
//! keyspace (its subchain id prefixes every key it writes), so range scans
//! performed outside a transaction cannot race with another writer.

use std::collections::HashMap;
use std::path::Path;

use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use sled::Transactional;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::{BlockHash, OutPoint, Txid};

use crate::error::IndexError;
use crate::primitives::{
    Branch, Element, ElementId, Match, OwnerId, Pattern, PatternId, Position, ScanCursor,
    SubaccountId, SubaccountType, SubchainId,
};

const TREE_META: &str = "meta";
const TREE_SUBCHAINS: &str = "subchains";
const TREE_SUBCHAIN_REV: &str = "subchain_rev";
const TREE_ACCOUNTS: &str = "accounts";
const TREE_OWNERS: &str = "owners";
const TREE_CURSORS: &str = "cursors";
const TREE_ELEMENTS: &str = "elements";
const TREE_PATTERNS: &str = "patterns";
const TREE_PATTERN_INDEX: &str = "pattern_index";
const TREE_PATTERN_OWNERS: &str = "pattern_owners";
const TREE_MATCHES: &str = "matches";
const TREE_TX_INDEX: &str = "tx_index";
const TREE_TX_REV: &str = "tx_rev";
const TREE_OUTPOINTS: &str = "outpoints";
const TREE_CONTACTS: &str = "contacts";

const KEY_NEXT_SUBCHAIN: &[u8] = b"next_subchain";

const MATCH_KIND_OUTPUT: u8 = 0;
const MATCH_KIND_INPUT: u8 = 1;

/// Handle to the persistent ledger index. Cheap to clone; all clones share
/// the same database.
#[derive(Clone)]
pub struct LedgerIndex {
    db: sled::Db,
    meta: sled::Tree,
    subchains: sled::Tree,
    subchain_rev: sled::Tree,
    accounts: sled::Tree,
    owners: sled::Tree,
    cursors: sled::Tree,
    elements: sled::Tree,
    patterns: sled::Tree,
    pattern_index: sled::Tree,
    pattern_owners: sled::Tree,
    matches: sled::Tree,
    tx_index: sled::Tree,
    tx_rev: sled::Tree,
    outpoints: sled::Tree,
    contacts: sled::Tree,
}

impl LedgerIndex {
    /// Opens (or creates) the index at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        Self::from_db(sled::open(path)?)
    }

    /// Opens a throwaway in-memory-backed index, for tests.
    pub fn temporary() -> Result<Self, IndexError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, IndexError> {
        Ok(Self {
            meta: db.open_tree(TREE_META)?,
            subchains: db.open_tree(TREE_SUBCHAINS)?,
            subchain_rev: db.open_tree(TREE_SUBCHAIN_REV)?,
            accounts: db.open_tree(TREE_ACCOUNTS)?,
            owners: db.open_tree(TREE_OWNERS)?,
            cursors: db.open_tree(TREE_CURSORS)?,
            elements: db.open_tree(TREE_ELEMENTS)?,
            patterns: db.open_tree(TREE_PATTERNS)?,
            pattern_index: db.open_tree(TREE_PATTERN_INDEX)?,
            pattern_owners: db.open_tree(TREE_PATTERN_OWNERS)?,
            matches: db.open_tree(TREE_MATCHES)?,
            tx_index: db.open_tree(TREE_TX_INDEX)?,
            tx_rev: db.open_tree(TREE_TX_REV)?,
            outpoints: db.open_tree(TREE_OUTPOINTS)?,
            contacts: db.open_tree(TREE_CONTACTS)?,
            db,
        })
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<(), IndexError> {
        self.db.flush()?;
        Ok(())
    }

    /// Registers a subaccount with its owning identity, idempotently. The
    /// account record and the owner secondary index move together in one
    /// atomic transaction.
    pub fn register_account(
        &self,
        subaccount: SubaccountId,
        owner: OwnerId,
        kind: SubaccountType,
    ) -> Result<(), IndexError> {
        [&self.accounts, &self.owners]
            .transaction(|trees: &Vec<TransactionalTree>| {
                let (accounts, owners) = (&trees[0], &trees[1]);

                if let Some(value) = accounts.get(subaccount.as_bytes())? {
                    let (existing_owner, _) =
                        decode_account(&value).map_err(ConflictableTransactionError::Abort)?;
                    if existing_owner != owner {
                        owners.remove(owner_key(&existing_owner, &subaccount))?;
                    }
                }

                accounts.insert(subaccount.as_bytes(), encode_account(&owner, kind))?;
                owners.insert(owner_key(&owner, &subaccount), &[])?;
                Ok(())
            })
            .map_err(|error: sled::transaction::TransactionError<IndexError>| {
                IndexError::from(error)
            })
    }

    /// The owner and kind recorded for a subaccount.
    pub fn account(
        &self,
        subaccount: SubaccountId,
    ) -> Result<Option<(OwnerId, SubaccountType)>, IndexError> {
        self.accounts
            .get(subaccount.as_bytes())?
            .map(|value| decode_account(&value))
            .transpose()
    }

    /// Reassigns every subaccount of `from` to `to` in one atomic
    /// transaction, returning how many subaccounts moved. Used when two
    /// identities are discovered to be the same party.
    pub fn merge_owner(&self, from: OwnerId, to: OwnerId) -> Result<u32, IndexError> {
        let keys: Vec<sled::IVec> = self
            .owners
            .scan_prefix(from.as_bytes())
            .keys()
            .collect::<Result<_, _>>()?;
        let mut subaccounts = Vec::with_capacity(keys.len());
        for key in &keys {
            subaccounts.push(SubaccountId::from_bytes(array::<32>(&key[32..64])?));
        }

        [&self.accounts, &self.owners]
            .transaction(|trees: &Vec<TransactionalTree>| {
                let (accounts, owners) = (&trees[0], &trees[1]);
                let mut moved = 0u32;

                for (key, subaccount) in keys.iter().zip(&subaccounts) {
                    let Some(value) = accounts.get(subaccount.as_bytes())? else {
                        return Err(ConflictableTransactionError::Abort(IndexError::Corrupt(
                            format!("owner entry without account record for {}", subaccount),
                        )));
                    };
                    let (_, kind) =
                        decode_account(&value).map_err(ConflictableTransactionError::Abort)?;

                    accounts.insert(subaccount.as_bytes(), encode_account(&to, kind))?;
                    owners.insert(owner_key(&to, subaccount), &[])?;
                    owners.remove(key.as_ref())?;
                    moved += 1;
                }

                Ok(moved)
            })
            .map_err(|error: sled::transaction::TransactionError<IndexError>| {
                IndexError::from(error)
            })
    }

    /// The subchain id for a (subaccount, branch) pair, allocating one on
    /// first use.
    pub fn subchain_id(
        &self,
        subaccount: SubaccountId,
        branch: Branch,
    ) -> Result<SubchainId, IndexError> {
        let key = subchain_key(&subaccount, branch);

        if let Some(value) = self.subchains.get(&key)? {
            return Ok(SubchainId::from_index(u32::from_be_bytes(array::<4>(
                &value,
            )?)));
        }

        let next = self
            .meta
            .update_and_fetch(KEY_NEXT_SUBCHAIN, |current| {
                let next = match current {
                    Some(bytes) => u32::from_be_bytes(bytes.try_into().unwrap_or([0u8; 4])) + 1,
                    None => 0,
                };
                Some(next.to_be_bytes().to_vec())
            })?
            .ok_or_else(|| IndexError::Corrupt("subchain counter missing".to_string()))?;
        let id = SubchainId::from_index(u32::from_be_bytes(array::<4>(&next)?));

        self.subchains.insert(&key, id.to_be_bytes().to_vec())?;
        self.subchain_rev.insert(id.to_be_bytes(), key.to_vec())?;
        self.cursors
            .insert(id.to_be_bytes(), encode_cursor(&ScanCursor::blank()))?;

        tracing::info!("Allocated {} for {} {:?}", id, subaccount, branch);
        Ok(id)
    }

    /// All known subchains with the (subaccount, branch) pair each belongs to.
    pub fn subchains(&self) -> Result<Vec<(SubchainId, SubaccountId, Branch)>, IndexError> {
        let mut result = Vec::new();
        for entry in self.subchain_rev.iter() {
            let (key, value) = entry?;
            let id = SubchainId::from_index(u32::from_be_bytes(array::<4>(&key)?));
            let subaccount = SubaccountId::from_bytes(array::<32>(&value[..32])?);
            let branch = Branch::from_u8(value[32]).ok_or_else(|| {
                IndexError::Corrupt(format!("bad branch byte {} for {}", value[32], id))
            })?;
            result.push((id, subaccount, branch));
        }
        Ok(result)
    }

    /// Adds newly derived elements to a subchain, allocating pattern ids for
    /// byte strings not seen before. Returns the patterns (new and existing)
    /// of the added elements. Idempotent for already-known elements.
    pub fn add_elements(
        &self,
        subchain: SubchainId,
        elements: &[Element],
    ) -> Result<Vec<Pattern>, IndexError> {
        let cursor = self.scan_cursor(subchain)?;
        let mut highest = cursor.last_indexed();
        let mut added = Vec::with_capacity(elements.len());

        for element in elements {
            self.elements
                .insert(element_key(subchain, element.derivation_index()), element.script().clone())?;

            let digest = sha256::Hash::hash(element.script()).to_byte_array();
            let mut index_key = subchain.to_be_bytes().to_vec();
            index_key.extend_from_slice(&digest);

            let pattern_index = match self.pattern_index.get(&index_key)? {
                Some(value) => u32::from_be_bytes(array::<4>(&value)?),
                None => {
                    let next = self.next_pattern_index(subchain)?;
                    self.pattern_index
                        .insert(&index_key, next.to_be_bytes().to_vec())?;
                    self.patterns
                        .insert(pattern_key(subchain, next), element.script().clone())?;
                    next
                }
            };
            let pattern_id = PatternId::from_parts(subchain, pattern_index);

            self.pattern_owners.insert(
                pattern_owner_key(pattern_id, element.derivation_index()),
                &[],
            )?;
            // first element to produce a script owns the contact entry
            if self.contacts.get(digest)?.is_none() {
                self.contacts
                    .insert(digest, encode_element_id(&element.id()))?;
            }

            highest = Some(match highest {
                Some(current) => current.max(element.derivation_index()),
                None => element.derivation_index(),
            });
            added.push(Pattern::from_parts(
                element.id(),
                pattern_id,
                element.script().clone(),
            ));
        }

        // the cursor is written last so a crash mid-add re-adds the elements
        if highest != cursor.last_indexed() {
            let updated = ScanCursor::from_parts(cursor.last_scanned(), highest);
            self.cursors
                .insert(subchain.to_be_bytes(), encode_cursor(&updated))?;
        }

        Ok(added)
    }

    fn next_pattern_index(&self, subchain: SubchainId) -> Result<u32, IndexError> {
        let mut key = b"next_pattern:".to_vec();
        key.extend_from_slice(&subchain.to_be_bytes());
        let next = self
            .meta
            .update_and_fetch(key, |current| {
                let next = match current {
                    Some(bytes) => u32::from_be_bytes(bytes.try_into().unwrap_or([0u8; 4])) + 1,
                    None => 0,
                };
                Some(next.to_be_bytes().to_vec())
            })?
            .ok_or_else(|| IndexError::Corrupt("pattern counter missing".to_string()))?;
        Ok(u32::from_be_bytes(array::<4>(&next)?))
    }

    /// The full watched pattern set of a subchain.
    pub fn patterns(&self, subchain: SubchainId) -> Result<Vec<Pattern>, IndexError> {
        let mut bytes_by_index: HashMap<u32, Vec<u8>> = HashMap::new();
        for entry in self.patterns.scan_prefix(subchain.to_be_bytes()) {
            let (key, value) = entry?;
            let index = u32::from_be_bytes(array::<4>(&key[4..8])?);
            bytes_by_index.insert(index, value.to_vec());
        }

        let mut result = Vec::new();
        for entry in self.pattern_owners.scan_prefix(subchain.to_be_bytes()) {
            let (key, _) = entry?;
            let pattern_index = u32::from_be_bytes(array::<4>(&key[4..8])?);
            let element_index = u32::from_be_bytes(array::<4>(&key[8..12])?);
            let bytes = bytes_by_index.get(&pattern_index).ok_or_else(|| {
                IndexError::Corrupt(format!(
                    "pattern owner without pattern bytes for {} index {}",
                    subchain, pattern_index
                ))
            })?;
            result.push(Pattern::from_parts(
                ElementId::from_parts(subchain, element_index),
                PatternId::from_parts(subchain, pattern_index),
                bytes.clone(),
            ));
        }
        Ok(result)
    }

    /// The scan cursor of a subchain.
    pub fn scan_cursor(&self, subchain: SubchainId) -> Result<ScanCursor, IndexError> {
        let value = self
            .cursors
            .get(subchain.to_be_bytes())?
            .ok_or(IndexError::UnknownSubchain(subchain))?;
        decode_cursor(&value)
    }

    /// Records the matches of one scanned block and advances the cursor, in
    /// one atomic transaction.
    ///
    /// Re-recording the current cursor position is a no-op (idempotent
    /// restart after a crash between commit and acknowledgement); moving the
    /// cursor backwards by any other means is rejected.
    pub fn record_scan(
        &self,
        subchain: SubchainId,
        position: Position,
        matches: &[Match],
        output_scripts: &[(OutPoint, Vec<u8>)],
    ) -> Result<(), IndexError> {
        let current = self.scan_cursor(subchain)?;
        if position == current.last_scanned() {
            return Ok(());
        }
        if position.height() <= current.last_scanned().height() {
            return Err(IndexError::CursorRegression {
                subchain,
                current: current.last_scanned(),
                requested: position,
            });
        }

        let height = position.height() as u64;
        let cursor_value = encode_cursor(&ScanCursor::from_parts(
            position,
            current.last_indexed(),
        ));

        let mut match_entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(matches.len());
        let mut tx_entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(matches.len());
        let mut rev_entries: Vec<Vec<u8>> = Vec::with_capacity(matches.len());
        for hit in matches {
            match_entries.push((
                match_key(subchain, height, hit),
                hit.pattern().index().to_be_bytes().to_vec(),
            ));
            tx_entries.push((
                tx_index_key(hit.pattern(), &hit.txid()),
                height.to_be_bytes().to_vec(),
            ));
            rev_entries.push(tx_rev_key(subchain, height, hit.pattern(), &hit.txid()));
        }

        let mut outpoint_entries: Vec<(Vec<u8>, Vec<u8>)> =
            Vec::with_capacity(output_scripts.len());
        for (outpoint, script) in output_scripts {
            let mut value = height.to_be_bytes().to_vec();
            value.extend_from_slice(script);
            outpoint_entries.push((outpoint_key(subchain, outpoint), value));
        }

        [
            &self.cursors,
            &self.matches,
            &self.tx_index,
            &self.tx_rev,
            &self.outpoints,
        ]
        .transaction(|trees: &Vec<TransactionalTree>| {
            let (cursors, matches, tx_index, tx_rev, outpoints) =
                (&trees[0], &trees[1], &trees[2], &trees[3], &trees[4]);

            for (key, value) in &match_entries {
                matches.insert(key.as_slice(), value.as_slice())?;
            }
            for (key, value) in &tx_entries {
                tx_index.insert(key.as_slice(), value.as_slice())?;
            }
            for key in &rev_entries {
                tx_rev.insert(key.as_slice(), &[])?;
            }
            for (key, value) in &outpoint_entries {
                outpoints.insert(key.as_slice(), value.as_slice())?;
            }
            cursors.insert(&subchain.to_be_bytes(), cursor_value.as_slice())?;

            Ok(())
        })
        .map_err(|error: sled::transaction::TransactionError<IndexError>| IndexError::from(error))
    }

    /// Rolls one subchain back to the common ancestor, deleting every record
    /// above it and rewinding the cursor, in one atomic transaction.
    ///
    /// A cursor at or below the ancestor is left untouched. Elements and
    /// patterns are never rolled back; derivation is not chain state.
    pub fn reorg(&self, subchain: SubchainId, ancestor: Position) -> Result<(), IndexError> {
        let current = self.scan_cursor(subchain)?;

        // the subchain task is the sole writer of these prefixes, so
        // collecting doomed keys outside the transaction is race-free
        let mut doomed_matches = Vec::new();
        let mut doomed_tx_rev = Vec::new();
        let mut doomed_tx_index = Vec::new();
        for entry in self.matches.scan_prefix(subchain.to_be_bytes()) {
            let (key, _) = entry?;
            let height = u64::from_be_bytes(array::<8>(&key[4..12])?);
            if height as i64 > ancestor.height() {
                doomed_matches.push(key);
            }
        }
        for entry in self.tx_rev.scan_prefix(subchain.to_be_bytes()) {
            let (key, _) = entry?;
            let height = u64::from_be_bytes(array::<8>(&key[4..12])?);
            if height as i64 > ancestor.height() {
                let pattern = PatternId::from_parts(
                    subchain,
                    u32::from_be_bytes(array::<4>(&key[12..16])?),
                );
                let txid = Txid::from_byte_array(array::<32>(&key[16..48])?);
                doomed_tx_index.push(tx_index_key(pattern, &txid));
                doomed_tx_rev.push(key);
            }
        }
        let mut doomed_outpoints = Vec::new();
        for entry in self.outpoints.scan_prefix(subchain.to_be_bytes()) {
            let (key, value) = entry?;
            let height = u64::from_be_bytes(array::<8>(&value[..8])?);
            if height as i64 > ancestor.height() {
                doomed_outpoints.push(key);
            }
        }

        let rewind = current.last_scanned().height() > ancestor.height();
        let cursor_value =
            encode_cursor(&ScanCursor::from_parts(ancestor, current.last_indexed()));

        [
            &self.cursors,
            &self.matches,
            &self.tx_index,
            &self.tx_rev,
            &self.outpoints,
        ]
        .transaction(|trees: &Vec<TransactionalTree>| {
            let (cursors, matches, tx_index, tx_rev, outpoints) =
                (&trees[0], &trees[1], &trees[2], &trees[3], &trees[4]);

            for key in &doomed_matches {
                matches.remove(key.as_ref())?;
            }
            for key in &doomed_tx_index {
                tx_index.remove(key.as_slice())?;
            }
            for key in &doomed_tx_rev {
                tx_rev.remove(key.as_ref())?;
            }
            for key in &doomed_outpoints {
                outpoints.remove(key.as_ref())?;
            }
            if rewind {
                cursors.insert(&subchain.to_be_bytes(), cursor_value.as_slice())?;
            }

            Ok::<(), ConflictableTransactionError<IndexError>>(())
        })
        .map_err(|error: sled::transaction::TransactionError<IndexError>| IndexError::from(error))?;

        tracing::info!(
            "Rolled {} back to {} ({} matches removed)",
            subchain,
            ancestor,
            doomed_matches.len()
        );
        Ok(())
    }

    /// All recorded matches of a subchain with the height each was found at.
    pub fn matches_for(&self, subchain: SubchainId) -> Result<Vec<(u64, Match)>, IndexError> {
        let mut result = Vec::new();
        for entry in self.matches.scan_prefix(subchain.to_be_bytes()) {
            let (key, value) = entry?;
            result.push(decode_match(subchain, &key, &value)?);
        }
        Ok(result)
    }

    /// All transactions a pattern was hit in, with confirmation heights.
    pub fn lookup_transactions(
        &self,
        pattern: PatternId,
    ) -> Result<Vec<(Txid, u64)>, IndexError> {
        let mut prefix = pattern.subchain().to_be_bytes().to_vec();
        prefix.extend_from_slice(&pattern.index().to_be_bytes());

        let mut result = Vec::new();
        for entry in self.tx_index.scan_prefix(prefix) {
            let (key, value) = entry?;
            let txid = Txid::from_byte_array(array::<32>(&key[8..40])?);
            let height = u64::from_be_bytes(array::<8>(&value)?);
            result.push((txid, height));
        }
        Ok(result)
    }

    /// The element that first produced `script`, if any. Answers "is this
    /// script one of ours" for address-book style lookups.
    pub fn lookup_contact(&self, script: &[u8]) -> Result<Option<ElementId>, IndexError> {
        let digest = sha256::Hash::hash(script).to_byte_array();
        self.contacts
            .get(digest)?
            .map(|value| decode_element_id(&value))
            .transpose()
    }

    /// The indexed scripts of previously matched outputs among `outpoints`,
    /// scoped to one subchain. Feeds input matching.
    pub fn lookup_spent_scripts(
        &self,
        subchain: SubchainId,
        outpoints: &[OutPoint],
    ) -> Result<HashMap<OutPoint, Vec<u8>>, IndexError> {
        let mut result = HashMap::new();
        for outpoint in outpoints {
            if let Some(value) = self.outpoints.get(outpoint_key(subchain, outpoint))? {
                result.insert(*outpoint, value[8..].to_vec());
            }
        }
        Ok(result)
    }
}

fn array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], IndexError> {
    bytes
        .try_into()
        .map_err(|_| IndexError::Corrupt(format!("expected {} bytes, got {}", N, bytes.len())))
}

fn owner_key(owner: &OwnerId, subaccount: &SubaccountId) -> Vec<u8> {
    let mut key = owner.as_bytes().to_vec();
    key.extend_from_slice(subaccount.as_bytes());
    key
}

fn subchain_key(subaccount: &SubaccountId, branch: Branch) -> Vec<u8> {
    let mut key = subaccount.as_bytes().to_vec();
    key.push(branch.as_u8());
    key
}

fn element_key(subchain: SubchainId, index: u32) -> Vec<u8> {
    let mut key = subchain.to_be_bytes().to_vec();
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn pattern_key(subchain: SubchainId, index: u32) -> Vec<u8> {
    let mut key = subchain.to_be_bytes().to_vec();
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn pattern_owner_key(pattern: PatternId, element_index: u32) -> Vec<u8> {
    let mut key = pattern.subchain().to_be_bytes().to_vec();
    key.extend_from_slice(&pattern.index().to_be_bytes());
    key.extend_from_slice(&element_index.to_be_bytes());
    key
}

fn outpoint_key(subchain: SubchainId, outpoint: &OutPoint) -> Vec<u8> {
    let mut key = subchain.to_be_bytes().to_vec();
    key.extend_from_slice(outpoint.txid.as_ref());
    key.extend_from_slice(&outpoint.vout.to_be_bytes());
    key
}

fn tx_index_key(pattern: PatternId, txid: &Txid) -> Vec<u8> {
    let mut key = pattern.subchain().to_be_bytes().to_vec();
    key.extend_from_slice(&pattern.index().to_be_bytes());
    key.extend_from_slice(txid.as_ref());
    key
}

fn tx_rev_key(subchain: SubchainId, height: u64, pattern: PatternId, txid: &Txid) -> Vec<u8> {
    let mut key = subchain.to_be_bytes().to_vec();
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(&pattern.index().to_be_bytes());
    key.extend_from_slice(txid.as_ref());
    key
}

fn match_key(subchain: SubchainId, height: u64, hit: &Match) -> Vec<u8> {
    let mut key = subchain.to_be_bytes().to_vec();
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(hit.txid().as_ref());
    match hit {
        Match::Output { vout, .. } => {
            key.push(MATCH_KIND_OUTPUT);
            key.extend_from_slice(&vout.to_be_bytes());
        }
        Match::Input { outpoint, .. } => {
            key.push(MATCH_KIND_INPUT);
            key.extend_from_slice(outpoint.txid.as_ref());
            key.extend_from_slice(&outpoint.vout.to_be_bytes());
        }
    }
    key.extend_from_slice(&hit.element().index().to_be_bytes());
    key
}

fn decode_match(
    subchain: SubchainId,
    key: &[u8],
    value: &[u8],
) -> Result<(u64, Match), IndexError> {
    let height = u64::from_be_bytes(array::<8>(&key[4..12])?);
    let txid = Txid::from_byte_array(array::<32>(&key[12..44])?);
    let pattern = PatternId::from_parts(subchain, u32::from_be_bytes(array::<4>(value)?));

    let hit = match key[44] {
        MATCH_KIND_OUTPUT => Match::Output {
            txid,
            vout: u32::from_be_bytes(array::<4>(&key[45..49])?),
            element: ElementId::from_parts(subchain, u32::from_be_bytes(array::<4>(&key[49..53])?)),
            pattern,
        },
        MATCH_KIND_INPUT => Match::Input {
            txid,
            outpoint: OutPoint::new(
                Txid::from_byte_array(array::<32>(&key[45..77])?),
                u32::from_be_bytes(array::<4>(&key[77..81])?),
            ),
            element: ElementId::from_parts(subchain, u32::from_be_bytes(array::<4>(&key[81..85])?)),
            pattern,
        },
        other => {
            return Err(IndexError::Corrupt(format!(
                "unknown match kind byte {}",
                other
            )))
        }
    };
    Ok((height, hit))
}

fn encode_account(owner: &OwnerId, kind: SubaccountType) -> Vec<u8> {
    let mut value = owner.as_bytes().to_vec();
    value.push(kind.as_u8());
    value
}

fn decode_account(value: &[u8]) -> Result<(OwnerId, SubaccountType), IndexError> {
    let owner = OwnerId::from_bytes(array::<32>(&value[..32])?);
    let kind = SubaccountType::from_u8(value[32])
        .ok_or_else(|| IndexError::Corrupt(format!("bad subaccount type byte {}", value[32])))?;
    Ok((owner, kind))
}

fn encode_element_id(element: &ElementId) -> Vec<u8> {
    let mut value = element.subchain().to_be_bytes().to_vec();
    value.extend_from_slice(&element.index().to_be_bytes());
    value
}

fn decode_element_id(value: &[u8]) -> Result<ElementId, IndexError> {
    Ok(ElementId::from_parts(
        SubchainId::from_index(u32::from_be_bytes(array::<4>(&value[..4])?)),
        u32::from_be_bytes(array::<4>(&value[4..8])?),
    ))
}

fn encode_cursor(cursor: &ScanCursor) -> Vec<u8> {
    let mut value = cursor.last_scanned().height().to_be_bytes().to_vec();
    value.extend_from_slice(&cursor.last_scanned().hash().to_byte_array());
    let last_indexed = cursor.last_indexed().map(i64::from).unwrap_or(-1);
    value.extend_from_slice(&last_indexed.to_be_bytes());
    value
}

fn decode_cursor(value: &[u8]) -> Result<ScanCursor, IndexError> {
    if value.len() != 48 {
        return Err(IndexError::Corrupt(format!(
            "cursor record of {} bytes",
            value.len()
        )));
    }
    let height = i64::from_be_bytes(array::<8>(&value[..8])?);
    let hash = BlockHash::from_byte_array(array::<32>(&value[8..40])?);
    let last_indexed_raw = i64::from_be_bytes(array::<8>(&value[40..48])?);
    let last_indexed = (last_indexed_raw >= 0).then_some(last_indexed_raw as u32);
    Ok(ScanCursor::from_parts(
        Position::from_parts(height, hash),
        last_indexed,
    ))
}
