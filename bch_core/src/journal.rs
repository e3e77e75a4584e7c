//! The journal, as the accounting subsystem sees it: a sequence counter that
//! versions every commit, and the list of keys not yet flushed to their
//! trees. At mount the list is handed to replay in insertion order; replay
//! is the only consumer that interprets version order.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::bkey::{BkeyI, KeyValue};
use crate::btree::BtreeId;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalKey {
    pub btree: BtreeId,
    pub k: BkeyI,
}

impl JournalKey {
    pub fn is_accounting(&self) -> bool {
        self.btree == BtreeId::Accounting && matches!(self.k.v, KeyValue::Accounting(_))
    }
}

pub struct Journal {
    seq: AtomicU64,
    pub keys: Mutex<Vec<JournalKey>>,
}

impl Journal {
    pub fn new() -> Self {
        Journal { seq: AtomicU64::new(1), keys: Mutex::new(Vec::new()) }
    }

    pub fn from_parts(seq: u64, keys: Vec<JournalKey>) -> Self {
        Journal { seq: AtomicU64::new(seq.max(1)), keys: Mutex::new(keys) }
    }

    pub fn cur_seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    /// Sequence number for the next commit; monotone.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn append(&self, keys: impl IntoIterator<Item = JournalKey>) {
        self.keys.lock().extend(keys);
    }

    /// Clean shutdown: everything has been flushed.
    pub fn clear(&self) {
        self.keys.lock().clear();
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}
