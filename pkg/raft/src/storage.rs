//! Log & Stable Store (LSS): the crate's `openraft` storage adapter.
//!
//! `openraft` 0.9 only exposes the log-storage/state-machine split
//! (`RaftLogStorage` + `RaftStateMachine`) as sealed traits, so this
//! implements the older combined `RaftStorage` trait (plus the un-sealed
//! `RaftLogReader` and `RaftSnapshotBuilder`) and hands the result to
//! `openraft::storage::Adaptor`, which is what `Raft::new` actually wants.

use crate::fsm::Fsm;
use crate::snapshot_store::SnapshotStore;
use crate::types::{FsmResponse, NodeId, TypeConfig};
use openraft::storage::{Adaptor, RaftSnapshotBuilder, RaftStorage, Snapshot};
use openraft::{
	BasicNode, Entry, EntryPayload, LogId, LogState, OptionalSend, RaftLogReader, SnapshotMeta, StorageError,
	StorageIOError, StoredMembership, Vote,
};
use raftkv_core::errors::*;
use std::io::{self, Cursor};
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

/// Most-recent-wins cache over the tail of the log, kept to bound read
/// amplification during replication. Any entry it returns must equal the
/// entry durably stored in `log_tree` at the same index.
struct LogCache {
	capacity: usize,
	entries: std::collections::BTreeMap<u64, Entry<TypeConfig>>,
}

impl LogCache {
	fn new(capacity: usize) -> Self {
		LogCache { capacity, entries: Default::default() }
	}

	fn insert(&mut self, entry: Entry<TypeConfig>) {
		self.entries.insert(entry.log_id.index, entry);
		while self.entries.len() > self.capacity {
			let oldest = *self.entries.keys().next().unwrap();
			self.entries.remove(&oldest);
		}
	}

	fn get(&self, index: u64) -> Option<Entry<TypeConfig>> {
		self.entries.get(&index).cloned()
	}

	fn truncate_since(&mut self, index: u64) {
		self.entries.split_off(&index);
	}

	fn purge_upto(&mut self, index: u64) {
		let tail = self.entries.split_off(&(index + 1));
		self.entries = tail;
	}
}

fn io_err(err: impl std::fmt::Display) -> io::Error {
	io::Error::new(io::ErrorKind::Other, err.to_string())
}

/// The combined log + stable-metadata + state-machine storage backing a
/// single node's `openraft` instance. `log_tree` holds one entry per index;
/// `meta_tree` holds the vote, last-purged log id, and last-membership.
/// State-machine application is delegated to [`Fsm`], which owns the PKV
/// handle.
pub struct RaftStore {
	log_tree: sled::Tree,
	meta_tree: sled::Tree,
	cache: Mutex<LogCache>,
	vote: RwLock<Option<Vote<NodeId>>>,
	last_purged: RwLock<Option<LogId<NodeId>>>,
	last_applied: RwLock<Option<LogId<NodeId>>>,
	membership: RwLock<StoredMembership<NodeId, BasicNode>>,
	fsm: Arc<Fsm>,
	snapshots: Arc<SnapshotStore>,
}

const LOG_CACHE_CAPACITY: usize = 512;

impl RaftStore {
	pub fn open<P: AsRef<Path>>(dir: P, fsm: Arc<Fsm>, snapshots: Arc<SnapshotStore>) -> Result<RaftStore> {
		let db = sled::open(dir.as_ref())
			.chain_err(|| ErrorKind::Storage(format!("opening raft log at {}", dir.as_ref().display())))?;
		let log_tree = db.open_tree("log").chain_err(|| ErrorKind::Storage("opening log tree".into()))?;
		let meta_tree = db.open_tree("meta").chain_err(|| ErrorKind::Storage("opening meta tree".into()))?;

		let vote = meta_tree
			.get("vote")
			.chain_err(|| ErrorKind::Storage("reading vote".into()))?
			.and_then(|bytes| serde_json::from_slice(&bytes).ok());
		let last_purged = meta_tree
			.get("last_purged")
			.chain_err(|| ErrorKind::Storage("reading last_purged".into()))?
			.and_then(|bytes| serde_json::from_slice(&bytes).ok());
		let last_applied = meta_tree
			.get("last_applied")
			.chain_err(|| ErrorKind::Storage("reading last_applied".into()))?
			.and_then(|bytes| serde_json::from_slice(&bytes).ok());
		let membership = meta_tree
			.get("membership")
			.chain_err(|| ErrorKind::Storage("reading membership".into()))?
			.and_then(|bytes| serde_json::from_slice(&bytes).ok())
			.unwrap_or_default();

		Ok(RaftStore {
			log_tree,
			meta_tree,
			cache: Mutex::new(LogCache::new(LOG_CACHE_CAPACITY)),
			vote: RwLock::new(vote),
			last_purged: RwLock::new(last_purged),
			last_applied: RwLock::new(last_applied),
			membership: RwLock::new(membership),
			fsm,
			snapshots,
		})
	}

	fn index_key(index: u64) -> [u8; 8] {
		index.to_be_bytes()
	}

	fn load_entry(&self, index: u64) -> Result<Option<Entry<TypeConfig>>> {
		if let Some(entry) = self.cache.lock().unwrap().get(index) {
			return Ok(Some(entry));
		}
		match self.log_tree.get(Self::index_key(index)).chain_err(|| ErrorKind::Storage("reading log entry".into()))? {
			Some(bytes) => {
				let entry: Entry<TypeConfig> =
					serde_json::from_slice(&bytes).chain_err(|| ErrorKind::Decode("decoding log entry".into()))?;
				Ok(Some(entry))
			}
			None => Ok(None),
		}
	}

	fn persist_meta(&self, key: &str, value: &impl serde::Serialize) -> Result<()> {
		let bytes = serde_json::to_vec(value).chain_err(|| ErrorKind::Decode("encoding raft metadata".into()))?;
		self.meta_tree.insert(key, bytes).chain_err(|| ErrorKind::Storage(format!("writing {}", key)))?;
		self.meta_tree.flush().chain_err(|| ErrorKind::Storage("flushing raft metadata".into()))?;
		Ok(())
	}
}

impl RaftLogReader<TypeConfig> for RaftStore {
	async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + std::fmt::Debug + OptionalSend>(
		&mut self,
		range: RB,
	) -> std::result::Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
		let start = match range.start_bound() {
			std::ops::Bound::Included(&n) => n,
			std::ops::Bound::Excluded(&n) => n + 1,
			std::ops::Bound::Unbounded => 0,
		};
		let end = match range.end_bound() {
			std::ops::Bound::Included(&n) => n + 1,
			std::ops::Bound::Excluded(&n) => n,
			std::ops::Bound::Unbounded => u64::MAX,
		};

		let mut out = Vec::new();
		for index in start..end {
			match self.load_entry(index).map_err(|e| StorageIOError::read_logs(&io_err(e)))? {
				Some(entry) => out.push(entry),
				None => break,
			}
		}
		Ok(out)
	}
}

impl RaftSnapshotBuilder<TypeConfig> for RaftStore {
	async fn build_snapshot(&mut self) -> std::result::Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
		let last_applied = *self.last_applied.read().unwrap();
		let last_membership = self.membership.read().unwrap().clone();

		let sink = self.snapshots.create_sink().map_err(|e| StorageIOError::write_snapshot(None, &io_err(e)))?;
		let handle = self.snapshots.finalize(sink).map_err(|e| StorageIOError::write_snapshot(None, &io_err(e)))?;

		let snapshot_id =
			last_applied.map(|id| format!("{}-{}", id.leader_id.term, id.index)).unwrap_or_else(|| "0-0".into());

		let meta = SnapshotMeta { last_log_id: last_applied, last_membership, snapshot_id };

		Ok(Snapshot { meta, snapshot: Box::new(Cursor::new(handle.read_all().unwrap_or_default())) })
	}
}

impl RaftStorage<TypeConfig> for RaftStore {
	type LogReader = LogReaderHandle;
	type SnapshotBuilder = SnapshotBuilderHandle;

	async fn get_log_state(&mut self) -> std::result::Result<LogState<TypeConfig>, StorageError<NodeId>> {
		let last_purged_log_id = *self.last_purged.read().unwrap();
		let last_log_id = match self.log_tree.last().map_err(|e| StorageIOError::read_logs(&io_err(e)))? {
			Some((key, _)) => {
				let index = u64::from_be_bytes(key.as_ref().try_into().map_err(|_| {
					StorageIOError::read_logs(&io_err("malformed log index key"))
				})?);
				self.load_entry(index).map_err(|e| StorageIOError::read_logs(&io_err(e)))?.map(|e| e.log_id)
			}
			None => last_purged_log_id,
		};
		Ok(LogState { last_purged_log_id, last_log_id })
	}

	async fn save_vote(&mut self, vote: &Vote<NodeId>) -> std::result::Result<(), StorageError<NodeId>> {
		self.persist_meta("vote", vote).map_err(|e| StorageIOError::write_vote(&io_err(e)))?;
		*self.vote.write().unwrap() = Some(*vote);
		Ok(())
	}

	async fn read_vote(&mut self) -> std::result::Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
		Ok(*self.vote.read().unwrap())
	}

	async fn get_log_reader(&mut self) -> Self::LogReader {
		LogReaderHandle(self.clone_handle())
	}

	async fn append_to_log<I>(&mut self, entries: I) -> std::result::Result<(), StorageError<NodeId>>
	where
		I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
	{
		let mut cache = self.cache.lock().unwrap();
		for entry in entries {
			let bytes = serde_json::to_vec(&entry).map_err(|e| StorageIOError::write_logs(&io_err(e)))?;
			self.log_tree
				.insert(Self::index_key(entry.log_id.index), bytes)
				.map_err(|e| StorageIOError::write_logs(&io_err(e)))?;
			cache.insert(entry);
		}
		self.log_tree.flush().map_err(|e| StorageIOError::write_logs(&io_err(e)))?;
		Ok(())
	}

	async fn delete_conflict_logs_since(
		&mut self,
		log_id: LogId<NodeId>,
	) -> std::result::Result<(), StorageError<NodeId>> {
		let from = Self::index_key(log_id.index);
		let keys: Vec<_> = self.log_tree.range(from..).keys().filter_map(|k| k.ok()).collect();
		for key in keys {
			self.log_tree.remove(key).map_err(|e| StorageIOError::write_logs(&io_err(e)))?;
		}
		self.cache.lock().unwrap().truncate_since(log_id.index);
		Ok(())
	}

	async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> std::result::Result<(), StorageError<NodeId>> {
		let upto = Self::index_key(log_id.index);
		let keys: Vec<_> = self.log_tree.range(..=upto).keys().filter_map(|k| k.ok()).collect();
		for key in keys {
			self.log_tree.remove(key).map_err(|e| StorageIOError::write_logs(&io_err(e)))?;
		}
		self.persist_meta("last_purged", &log_id).map_err(|e| StorageIOError::write_logs(&io_err(e)))?;
		*self.last_purged.write().unwrap() = Some(log_id);
		self.cache.lock().unwrap().purge_upto(log_id.index);
		Ok(())
	}

	async fn last_applied_state(
		&mut self,
	) -> std::result::Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>> {
		Ok((*self.last_applied.read().unwrap(), self.membership.read().unwrap().clone()))
	}

	async fn apply_to_state_machine(
		&mut self,
		entries: &[Entry<TypeConfig>],
	) -> std::result::Result<Vec<FsmResponse>, StorageError<NodeId>> {
		let mut results = Vec::with_capacity(entries.len());
		let mut membership_changed = false;
		for entry in entries {
			*self.last_applied.write().unwrap() = Some(entry.log_id);
			let response = match &entry.payload {
				EntryPayload::Blank => None,
				EntryPayload::Normal(payload) => self.fsm.apply(payload),
				EntryPayload::Membership(membership) => {
					*self.membership.write().unwrap() = StoredMembership::new(Some(entry.log_id), membership.clone());
					membership_changed = true;
					None
				}
			};
			results.push(response);
		}
		if let Some(last) = *self.last_applied.read().unwrap() {
			self.persist_meta("last_applied", &last).map_err(|e| StorageIOError::write(&io_err(e)))?;
		}
		// Membership changes arrive as ordinary log entries (not only via
		// snapshot install); they must be as durable as `last_applied` or a
		// restart loses the voter set a restored node thinks it has.
		if membership_changed {
			self.persist_meta("membership", &*self.membership.read().unwrap()).map_err(|e| StorageIOError::write(&io_err(e)))?;
		}
		Ok(results)
	}

	async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
		SnapshotBuilderHandle(self.clone_handle())
	}

	async fn begin_receiving_snapshot(
		&mut self,
	) -> std::result::Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
		Ok(Box::new(Cursor::new(Vec::new())))
	}

	async fn install_snapshot(
		&mut self,
		meta: &SnapshotMeta<NodeId, BasicNode>,
		_snapshot: Box<Cursor<Vec<u8>>>,
	) -> std::result::Result<(), StorageError<NodeId>> {
		*self.last_applied.write().unwrap() = meta.last_log_id;
		*self.membership.write().unwrap() = meta.last_membership.clone();
		self.persist_meta("membership", &*self.membership.read().unwrap()).map_err(|e| StorageIOError::write(&io_err(e)))?;
		Ok(())
	}

	async fn get_current_snapshot(
		&mut self,
	) -> std::result::Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
		match self.snapshots.latest() {
			Some(handle) => {
				let last_applied = *self.last_applied.read().unwrap();
				let last_membership = self.membership.read().unwrap().clone();
				let snapshot_id =
					last_applied.map(|id| format!("{}-{}", id.leader_id.term, id.index)).unwrap_or_else(|| "0-0".into());
				let meta = SnapshotMeta { last_log_id: last_applied, last_membership, snapshot_id };
				Ok(Some(Snapshot { meta, snapshot: Box::new(Cursor::new(handle.read_all().unwrap_or_default())) }))
			}
			None => Ok(None),
		}
	}
}

/// `RaftStorage::get_log_reader`/`get_snapshot_builder` require `Self`-like
/// handles that can be produced from `&mut self` without borrowing it for
/// the `Raft` instance's lifetime; since every field here is already behind
/// an `Arc`/lock, a clone is cheap and correct.
impl RaftStore {
	fn clone_handle(&self) -> RaftStore {
		RaftStore {
			log_tree: self.log_tree.clone(),
			meta_tree: self.meta_tree.clone(),
			cache: Mutex::new(LogCache::new(LOG_CACHE_CAPACITY)),
			vote: RwLock::new(*self.vote.read().unwrap()),
			last_purged: RwLock::new(*self.last_purged.read().unwrap()),
			last_applied: RwLock::new(*self.last_applied.read().unwrap()),
			membership: RwLock::new(self.membership.read().unwrap().clone()),
			fsm: self.fsm.clone(),
			snapshots: self.snapshots.clone(),
		}
	}
}

pub struct LogReaderHandle(RaftStore);

impl RaftLogReader<TypeConfig> for LogReaderHandle {
	async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + std::fmt::Debug + OptionalSend>(
		&mut self,
		range: RB,
	) -> std::result::Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
		self.0.try_get_log_entries(range).await
	}
}

pub struct SnapshotBuilderHandle(RaftStore);

impl RaftSnapshotBuilder<TypeConfig> for SnapshotBuilderHandle {
	async fn build_snapshot(&mut self) -> std::result::Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
		self.0.build_snapshot().await
	}
}

pub type LogStore = Adaptor<TypeConfig, RaftStore>;
pub type StateMachineStore = Adaptor<TypeConfig, RaftStore>;

/// Splits a [`RaftStore`] into the `(log_store, state_machine)` pair
/// `Raft::new` expects.
pub fn into_adapted(store: RaftStore) -> (LogStore, StateMachineStore) {
	Adaptor::new(store)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pkv::Pkv;
	use crate::types::CommandPayload;
	use openraft::{LeaderId, Membership};
	use serde_json::json;

	fn fixture() -> (tempfile::TempDir, RaftStore) {
		let dir = tempfile::tempdir().unwrap();
		let pkv = Pkv::open(dir.path().join("pkv")).unwrap();
		let fsm = Arc::new(Fsm::new(pkv));
		let snapshots = Arc::new(SnapshotStore::open(dir.path().join("snapshots")).unwrap());
		let store = RaftStore::open(dir.path().join("log"), fsm, snapshots).unwrap();
		(dir, store)
	}

	fn entry(index: u64, payload: CommandPayload) -> Entry<TypeConfig> {
		Entry {
			log_id: LogId { leader_id: LeaderId::new(1, 1), index },
			payload: EntryPayload::Normal(payload),
		}
	}

	#[tokio::test]
	async fn append_then_read_round_trips() {
		let (_dir, mut store) = fixture();
		store.append_to_log(vec![entry(1, CommandPayload::set("a", json!(1)))]).await.unwrap();
		let read = store.try_get_log_entries(1..2).await.unwrap();
		assert_eq!(read.len(), 1);
		assert_eq!(read[0].log_id.index, 1);
	}

	#[tokio::test]
	async fn vote_persists() {
		let (_dir, mut store) = fixture();
		let vote = Vote { leader_id: LeaderId::new(3, 1), committed: true };
		store.save_vote(&vote).await.unwrap();
		assert_eq!(store.read_vote().await.unwrap(), Some(vote));
	}

	#[tokio::test]
	async fn apply_dispatches_to_fsm() {
		let (_dir, mut store) = fixture();
		let entries = vec![entry(1, CommandPayload::set("k", json!("v")))];
		let results = store.apply_to_state_machine(&entries).await.unwrap();
		assert_eq!(results, vec![Some(json!("v"))]);
	}

	#[tokio::test]
	async fn membership_change_persists_across_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let pkv = Pkv::open(dir.path().join("pkv")).unwrap();
		let fsm = Arc::new(Fsm::new(pkv));
		let snapshots = Arc::new(SnapshotStore::open(dir.path().join("snapshots")).unwrap());
		let log_dir = dir.path().join("log");

		let membership = Membership::new(vec![std::collections::BTreeSet::from([1u64, 2u64])], None);
		let entry = Entry {
			log_id: LogId { leader_id: LeaderId::new(1, 1), index: 1 },
			payload: EntryPayload::Membership(membership),
		};

		{
			let mut store = RaftStore::open(&log_dir, fsm.clone(), snapshots.clone()).unwrap();
			store.apply_to_state_machine(&[entry]).await.unwrap();
		}

		// Reopening must see the same voter set without replaying the log,
		// since RaftStore::open only reads meta, not entries.
		let mut reopened = RaftStore::open(&log_dir, fsm, snapshots).unwrap();
		let (_, stored) = reopened.last_applied_state().await.unwrap();
		let mut voters: Vec<_> = stored.membership().voter_ids().collect();
		voters.sort();
		assert_eq!(voters, vec![1, 2]);
	}

	#[tokio::test]
	async fn purge_upto_drops_cache_and_log() {
		let (_dir, mut store) = fixture();
		store
			.append_to_log(vec![
				entry(1, CommandPayload::set("a", json!(1))),
				entry(2, CommandPayload::set("b", json!(2))),
			])
			.await
			.unwrap();
		store.purge_logs_upto(LogId { leader_id: LeaderId::new(1, 1), index: 1 }).await.unwrap();
		let read = store.try_get_log_entries(1..3).await.unwrap();
		assert_eq!(read.len(), 1);
		assert_eq!(read[0].log_id.index, 2);
	}
}
