//! Backing-store contract for the chain tables.
//!
//! Logical tables share one backend namespace: every key carries a one-byte
//! table tag, so a backend needs a single ordered key space rather than one
//! handle per table. Writes travel as a [`Batch`], an ordered map of tagged
//! keys where the last write to a key wins and `None` marks a delete; the
//! backend applies the whole batch atomically.

use std::collections::BTreeMap;
use std::fmt;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    /// The backend rejected an operation. `table` names the table involved,
    /// or `"batch"` for a multi-table write.
    Backend {
        table: &'static str,
        message: String,
    },
    /// A shared handle was poisoned by a panicking writer.
    Poisoned,
}

impl StoreError {
    pub fn backend(table: &'static str, message: impl Into<String>) -> Self {
        StoreError::Backend {
            table,
            message: message.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend { table, message } => write!(f, "{table}: {message}"),
            StoreError::Poisoned => write!(f, "store handle poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Logical tables, multiplexed onto the backend by key tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Table {
    Blocks,
    Heights,
    Transactions,
    Spends,
    History,
    Stealth,
    Meta,
}

impl Table {
    pub const fn tag(self) -> u8 {
        match self {
            Table::Blocks => b'B',
            Table::Heights => b'H',
            Table::Transactions => b'T',
            Table::Spends => b'S',
            Table::History => b'A',
            Table::Stealth => b'X',
            Table::Meta => b'M',
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Table::Blocks => "blocks",
            Table::Heights => "heights",
            Table::Transactions => "transactions",
            Table::Spends => "spends",
            Table::History => "history",
            Table::Stealth => "stealth",
            Table::Meta => "meta",
        }
    }
}

/// A table key with its tag prepended, as stored in the backend.
pub fn tagged(table: Table, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(table.tag());
    out.extend_from_slice(key);
    out
}

/// An atomic group of writes across tables.
///
/// Entries are ordered by tagged key and deduplicated: writing a key twice
/// keeps the later value, and a remove after an insert collapses to the
/// remove. `None` marks a delete.
#[derive(Debug, Default)]
pub struct Batch {
    entries: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, table: Table, key: &[u8], value: impl Into<Vec<u8>>) {
        self.entries.insert(tagged(table, key), Some(value.into()));
    }

    pub fn remove(&mut self, table: Table, key: &[u8]) {
        self.entries.insert(tagged(table, key), None);
    }

    /// Tagged keys with their final values, in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_slice(), value.as_deref()))
    }

    pub fn into_entries(self) -> BTreeMap<Vec<u8>, Option<Vec<u8>>> {
        self.entries
    }
}

/// Storage contract: point reads, ordered prefix scans, atomic batches.
pub trait Backend: Send + Sync {
    fn read(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Visit entries of `table` whose key starts with `prefix`, in ascending
    /// key order, until exhausted or the visitor returns false. Keys are
    /// presented without the table tag.
    fn scan(
        &self,
        table: Table,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), StoreError>;

    /// Apply every entry of `batch` as one atomic write.
    fn apply(&self, batch: Batch) -> Result<(), StoreError>;

    /// Flush buffered writes to durable media. Volatile backends ignore it.
    fn persist(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
