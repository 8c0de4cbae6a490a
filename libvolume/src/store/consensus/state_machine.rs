//! Replicated key-value state machine with conditional transactions.
//!
//! Committed raft entries carry a [`Proposal`]; applying it evaluates the
//! transaction's comparisons against the current map and runs either the
//! `success` or the `failure` branch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A guard evaluated before a transaction's operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Compare {
    /// The key has never been written or was deleted.
    Absent(String),
    /// The key currently holds a value.
    Present(String),
    /// The key currently holds exactly `value`.
    ValueEquals { key: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Op {
    Put { key: String, value: String },
    Delete { key: String },
}

/// All-or-nothing conditional update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Txn {
    pub compare: Vec<Compare>,
    pub success: Vec<Op>,
    #[serde(default)]
    pub failure: Vec<Op>,
}

impl Txn {
    pub fn when(compare: Vec<Compare>) -> Self {
        Self {
            compare,
            ..Default::default()
        }
    }

    pub fn and_then(mut self, ops: Vec<Op>) -> Self {
        self.success = ops;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxnResponse {
    /// `true` when every comparison held and the success branch ran.
    pub succeeded: bool,
}

/// Payload of a normal raft entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    /// Lets the proposing member match the applied entry to its caller.
    pub id: Uuid,
    pub txn: Txn,
}

/// The applied state of the keyspace.
#[derive(Debug, Default)]
pub struct KvStateMachine {
    data: BTreeMap<String, String>,
    applied_index: u64,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Values of every key starting with `prefix`, in key order.
    pub fn scan_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.data
            .range(prefix.to_owned()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    /// Advance the applied index past an entry that carries no transaction.
    pub fn mark_applied(&mut self, index: u64) {
        self.applied_index = self.applied_index.max(index);
    }

    /// Apply `txn` committed at `index`.
    pub fn apply(&mut self, index: u64, txn: &Txn) -> TxnResponse {
        let succeeded = txn.compare.iter().all(|c| self.holds(c));
        let ops = if succeeded { &txn.success } else { &txn.failure };
        for op in ops {
            match op {
                Op::Put { key, value } => {
                    self.data.insert(key.clone(), value.clone());
                }
                Op::Delete { key } => {
                    self.data.remove(key);
                }
            }
        }
        self.mark_applied(index);
        TxnResponse { succeeded }
    }

    fn holds(&self, compare: &Compare) -> bool {
        match compare {
            Compare::Absent(key) => !self.data.contains_key(key),
            Compare::Present(key) => self.data.contains_key(key),
            Compare::ValueEquals { key, value } => self.data.get(key) == Some(value),
        }
    }
}
