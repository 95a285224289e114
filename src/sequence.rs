//! Per-account sequence number allocation
//!
//! Bridges the ledger's pending sequence number with in-flight allocations.
//! Each account has its own async mutex, so concurrent workers submitting
//! from the same account get unique, gapless numbers while different
//! accounts never contend.

use crate::errors::LedgerError;
use crate::ports::LedgerClient;
use crate::types::Account;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Next sequence number to hand out; `None` until seeded from the ledger
type Slot = Arc<Mutex<Option<u64>>>;

pub struct SequenceAllocator {
    ledger: Arc<dyn LedgerClient>,
    slots: DashMap<String, Slot>,
}

impl std::fmt::Debug for SequenceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceAllocator")
            .field("accounts", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl SequenceAllocator {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            ledger,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, address: &str) -> Slot {
        self.slots
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Allocate the next sequence number for `account`
    pub async fn next(&self, account: &Account) -> Result<u64, LedgerError> {
        let slot = self.slot(&account.address);
        let mut cached = slot.lock().await;

        let value = match *cached {
            Some(next) => next,
            None => {
                let pending = self.ledger.allocate_sequence(account).await?;
                debug!(account = %account.address, pending, "Seeded sequence cache from ledger");
                pending
            }
        };
        *cached = Some(value + 1);
        Ok(value)
    }

    /// The ledger expects at least `sequence` next, typically after it
    /// accepted `sequence - 1`. Never moves the cache backwards.
    pub async fn observe(&self, account: &Account, sequence: u64) {
        let slot = self.slot(&account.address);
        let mut cached = slot.lock().await;
        let updated = cached.map_or(sequence, |current| current.max(sequence));
        if *cached != Some(updated) {
            debug!(account = %account.address, sequence = updated, "Sequence cache corrected");
        }
        *cached = Some(updated);
    }

    /// Give back `sequence` after a submission the ledger did not accept.
    ///
    /// Only the most recent allocation can be returned; anything handed out
    /// after it is left alone and the next mismatch resync repairs the gap.
    pub async fn release(&self, account: &Account, sequence: u64) -> bool {
        let Some(slot) = self.slots.get(&account.address).map(|s| s.clone()) else {
            return false;
        };
        let mut cached = slot.lock().await;
        if *cached == Some(sequence + 1) {
            *cached = Some(sequence);
            debug!(account = %account.address, sequence, "Released unused sequence");
            true
        } else {
            false
        }
    }

    /// Reset the cache to the ledger's pending sequence after a mismatch.
    /// The ledger is authoritative here, so the cache may move backwards.
    pub async fn resync(&self, account: &Account) -> Result<u64, LedgerError> {
        let slot = self.slot(&account.address);
        let mut cached = slot.lock().await;
        let pending = self.ledger.allocate_sequence(account).await?;
        if *cached != Some(pending) {
            debug!(
                account = %account.address,
                previous = ?*cached,
                pending,
                "Sequence cache reset from ledger"
            );
        }
        *cached = Some(pending);
        Ok(pending)
    }

    /// Cached next value, if seeded
    pub async fn peek(&self, account: &Account) -> Option<u64> {
        let slot = self.slots.get(&account.address).map(|s| s.clone())?;
        let cached = slot.lock().await;
        *cached
    }
}
