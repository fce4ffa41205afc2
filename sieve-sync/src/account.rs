//! In-memory cache over the ledger index's ownership records

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::IndexError;
use crate::index::LedgerIndex;
use crate::primitives::{ElementId, OwnerId, SubaccountId, SubaccountType};

/// Lazily-populated mirror of the `accounts` and `contacts` trees.
///
/// Reads fall through to the [`LedgerIndex`] on a miss; writes go through to
/// the index first and then update the maps. Locks are held only across map
/// access, never across storage calls.
pub struct AccountCache {
    index: LedgerIndex,
    accounts: RwLock<HashMap<SubaccountId, (OwnerId, SubaccountType)>>,
    contacts: RwLock<HashMap<Vec<u8>, ElementId>>,
}

impl AccountCache {
    /// Creates a cache over the given index.
    pub fn new(index: LedgerIndex) -> Self {
        Self {
            index,
            accounts: RwLock::new(HashMap::new()),
            contacts: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a subaccount, write-through.
    pub fn register_account(
        &self,
        subaccount: SubaccountId,
        owner: OwnerId,
        kind: SubaccountType,
    ) -> Result<(), IndexError> {
        self.index.register_account(subaccount, owner, kind)?;
        self.accounts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(subaccount, (owner, kind));
        Ok(())
    }

    /// Reassigns every subaccount of `from` to `to`. The account map is
    /// dropped wholesale; entries repopulate on next read.
    pub fn merge_owner(&self, from: OwnerId, to: OwnerId) -> Result<u32, IndexError> {
        let moved = self.index.merge_owner(from, to)?;
        self.accounts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        Ok(moved)
    }

    /// The owner and kind of a subaccount.
    pub fn account(
        &self,
        subaccount: SubaccountId,
    ) -> Result<Option<(OwnerId, SubaccountType)>, IndexError> {
        if let Some(found) = self
            .accounts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&subaccount)
        {
            return Ok(Some(*found));
        }

        let found = self.index.account(subaccount)?;
        if let Some(found) = found {
            self.accounts
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(subaccount, found);
        }
        Ok(found)
    }

    /// The element that produced `script`, if it is one of ours.
    pub fn contact(&self, script: &[u8]) -> Result<Option<ElementId>, IndexError> {
        if let Some(found) = self
            .contacts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(script)
        {
            return Ok(Some(*found));
        }

        let found = self.index.lookup_contact(script)?;
        if let Some(element) = found {
            self.contacts
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(script.to_vec(), element);
        }
        Ok(found)
    }
}
