//! Durable raft log.
//!
//! Raft reads from an in-memory [`MemStorage`]; every mutation is mirrored
//! into a `sled` database so the member can rebuild its log, hard state and
//! membership after a restart.

use std::path::Path;

use protobuf::Message as PbMessage;
use raft::prelude::{ConfState, Entry, HardState};
use raft::storage::MemStorage;
use raft::Storage;
use tracing::{debug, info};

use super::ConsensusError;

const TREE_LOG: &str = "raft_log";
const TREE_STATE: &str = "raft_state";

const KEY_HARD_STATE: &[u8] = b"hard_state";
const KEY_CONF_STATE: &[u8] = b"conf_state";

fn index_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

/// Raft storage persisted to disk.
pub struct DiskStorage {
    mem: MemStorage,
    db: sled::Db,
    log: sled::Tree,
    state: sled::Tree,
}

impl DiskStorage {
    /// Open (or create) the log under `path`.
    ///
    /// A fresh log is seeded with `voters` as the initial membership. An
    /// existing log must have been seeded with the same voters.
    pub fn open(path: &Path, voters: &[u64]) -> Result<Self, ConsensusError> {
        let db = sled::open(path)?;
        let log = db.open_tree(TREE_LOG)?;
        let state = db.open_tree(TREE_STATE)?;

        let persisted = match state.get(KEY_CONF_STATE)? {
            Some(buf) => Some(ConfState::parse_from_bytes(&buf)?),
            None => None,
        };

        let Some(conf_state) = persisted else {
            let mem = MemStorage::new_with_conf_state(ConfState::from((
                voters.to_vec(),
                Vec::<u64>::new(),
            )));
            let storage = Self {
                mem,
                db,
                log,
                state,
            };
            let initial = storage.mem.initial_state()?;
            storage.persist_conf_state(&initial.conf_state)?;
            storage.persist_hard_state(&initial.hard_state)?;
            info!(?voters, path = %path.display(), "seeded new raft log");
            return Ok(storage);
        };

        let mut members = conf_state.get_voters().to_vec();
        members.sort_unstable();
        if members != voters {
            return Err(ConsensusError::Layout(format!(
                "persisted members {members:?} differ from configured members {voters:?}"
            )));
        }

        let hard_state = match state.get(KEY_HARD_STATE)? {
            Some(buf) => Some(HardState::parse_from_bytes(&buf)?),
            None => None,
        };

        let mut entries = Vec::new();
        for item in log.iter() {
            let (_, value) = item?;
            entries.push(Entry::parse_from_bytes(&value)?);
        }

        let mem = MemStorage::new_with_conf_state(conf_state);
        {
            let mut core = mem.wl();
            core.append(&entries)?;
            if let Some(hs) = hard_state {
                core.set_hardstate(hs);
            }
        }
        info!(
            entries = entries.len(),
            path = %path.display(),
            "restored raft log"
        );

        Ok(Self {
            mem,
            db,
            log,
            state,
        })
    }

    /// The storage handed to the raft node.
    pub fn raft_storage(&self) -> MemStorage {
        self.mem.clone()
    }

    /// Append (or overwrite from the first index of) `entries`.
    pub fn append(&self, entries: &[Entry]) -> Result<(), ConsensusError> {
        let Some(last) = entries.last() else {
            return Ok(());
        };
        self.mem.wl().append(entries)?;

        let mut batch = sled::Batch::default();
        for entry in entries {
            batch.insert(index_key(entry.index).to_vec(), entry.write_to_bytes()?);
        }
        // Entries past the new tail were superseded by a new leader.
        for item in self.log.range(index_key(last.index + 1)..) {
            let (key, _) = item?;
            batch.remove(key);
        }
        self.log.apply_batch(batch)?;
        debug!(first = entries[0].index, last = last.index, "appended raft entries");
        Ok(())
    }

    pub fn set_hard_state(&self, hs: &HardState) -> Result<(), ConsensusError> {
        self.mem.wl().set_hardstate(hs.clone());
        self.persist_hard_state(hs)
    }

    pub fn set_commit(&self, commit: u64) -> Result<(), ConsensusError> {
        let hs = {
            let mut core = self.mem.wl();
            core.mut_hard_state().set_commit(commit);
            core.hard_state().clone()
        };
        self.persist_hard_state(&hs)
    }

    pub fn set_conf_state(&self, cs: &ConfState) -> Result<(), ConsensusError> {
        self.mem.wl().set_conf_state(cs.clone());
        self.persist_conf_state(cs)
    }

    pub fn flush(&self) -> Result<(), ConsensusError> {
        self.db.flush()?;
        Ok(())
    }

    fn persist_hard_state(&self, hs: &HardState) -> Result<(), ConsensusError> {
        self.state.insert(KEY_HARD_STATE, hs.write_to_bytes()?)?;
        Ok(())
    }

    fn persist_conf_state(&self, cs: &ConfState) -> Result<(), ConsensusError> {
        self.state.insert(KEY_CONF_STATE, cs.write_to_bytes()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.set_data(data.to_vec().into());
        e
    }

    #[test]
    fn log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = DiskStorage::open(dir.path(), &[1]).unwrap();
            let first = storage.raft_storage().first_index().unwrap();
            storage
                .append(&[entry(first, 1, b"a"), entry(first + 1, 1, b"b")])
                .unwrap();
            let mut hs = HardState::default();
            hs.term = 1;
            hs.vote = 1;
            hs.commit = first + 1;
            storage.set_hard_state(&hs).unwrap();
            storage.flush().unwrap();
        }

        let storage = DiskStorage::open(dir.path(), &[1]).unwrap();
        let raft = storage.raft_storage();
        let first = raft.first_index().unwrap();
        assert_eq!(raft.last_index().unwrap(), first + 1);
        let state = raft.initial_state().unwrap();
        assert_eq!(state.hard_state.commit, first + 1);
        assert_eq!(state.conf_state.get_voters(), &[1]);
    }

    #[test]
    fn conflicting_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let storage = DiskStorage::open(dir.path(), &[1]).unwrap();
            let first = storage.raft_storage().first_index().unwrap();
            storage
                .append(&[
                    entry(first, 1, b"a"),
                    entry(first + 1, 1, b"b"),
                    entry(first + 2, 1, b"c"),
                ])
                .unwrap();
            storage.append(&[entry(first + 1, 2, b"x")]).unwrap();
            storage.flush().unwrap();
            first
        };

        let storage = DiskStorage::open(dir.path(), &[1]).unwrap();
        assert_eq!(storage.raft_storage().last_index().unwrap(), first + 1);
    }

    #[test]
    fn membership_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        DiskStorage::open(dir.path(), &[1]).unwrap().flush().unwrap();

        let err = DiskStorage::open(dir.path(), &[1, 2, 3])
            .err()
            .expect("mismatch must fail");
        assert!(matches!(err, ConsensusError::Layout(_)));
    }
}
