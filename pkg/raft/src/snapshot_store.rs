//! Snapshot Store (SS): a directory of finalized, immutable snapshot files
//! with bounded retention.

use raftkv_core::errors::*;
use std::fs::{self, File};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// How many finalized snapshots are kept around on each finalize. Older ones
/// are unlinked; any reader already holding one keeps it alive until it's
/// dropped, since unlinking a file a process has open does not reclaim its
/// bytes.
const RETENTION: usize = 2;

/// An open sink for a snapshot still being written. Dropped without calling
/// [`SnapshotStore::finalize`], the partial file is left behind under a
/// `.partial` name and never listed.
pub struct SnapshotSink {
	path: PathBuf,
	file: File,
}

impl Write for SnapshotSink {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		self.file.write(buf)
	}

	fn flush(&mut self) -> std::io::Result<()> {
		self.file.flush()
	}
}

/// A finalized snapshot. Holding this `Arc` keeps the underlying file's
/// bytes readable even after retention unlinks its directory entry.
pub struct SnapshotHandle {
	seq: u64,
	file: Mutex<File>,
}

impl SnapshotHandle {
	/// Reads the entire snapshot from the beginning.
	pub fn read_all(&self) -> Result<Vec<u8>> {
		let mut file = self.file.lock().unwrap();
		file.rewind().chain_err(|| ErrorKind::Storage("seeking snapshot".into()))?;
		let mut buf = Vec::new();
		file.read_to_end(&mut buf).chain_err(|| ErrorKind::Storage("reading snapshot".into()))?;
		Ok(buf)
	}

	pub fn seq(&self) -> u64 {
		self.seq
	}
}

pub struct SnapshotStore {
	dir: PathBuf,
	next_seq: AtomicU64,
	finalized: Mutex<Vec<Arc<SnapshotHandle>>>,
}

impl SnapshotStore {
	pub fn open<P: AsRef<Path>>(dir: P) -> Result<SnapshotStore> {
		let dir = dir.as_ref().to_path_buf();
		fs::create_dir_all(&dir).chain_err(|| ErrorKind::Storage(format!("creating snapshot dir {}", dir.display())))?;

		let mut existing: Vec<(u64, PathBuf)> = fs::read_dir(&dir)
			.chain_err(|| ErrorKind::Storage("listing snapshot dir".into()))?
			.filter_map(|entry| entry.ok())
			.filter_map(|entry| {
				let path = entry.path();
				let seq = path.file_stem()?.to_str()?.strip_prefix("snapshot-")?.parse::<u64>().ok()?;
				Some((seq, path))
			})
			.collect();
		existing.sort_by_key(|(seq, _)| *seq);

		let next_seq = existing.last().map(|(seq, _)| seq + 1).unwrap_or(0);
		let finalized = existing
			.into_iter()
			.filter_map(|(seq, path)| {
				let file = File::open(&path).ok()?;
				Some(Arc::new(SnapshotHandle { seq, file: Mutex::new(file) }))
			})
			.collect();

		Ok(SnapshotStore { dir, next_seq: AtomicU64::new(next_seq), finalized: Mutex::new(finalized) })
	}

	fn path_for(&self, seq: u64) -> PathBuf {
		self.dir.join(format!("snapshot-{:020}.bin", seq))
	}

	/// Opens a new sink to write a snapshot's bytes into. Call
	/// [`finalize`](Self::finalize) once the payload is complete.
	pub fn create_sink(&self) -> Result<SnapshotSink> {
		let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
		let path = self.path_for(seq);
		let file =
			File::create(&path).chain_err(|| ErrorKind::Storage(format!("creating snapshot file {}", path.display())))?;
		Ok(SnapshotSink { path, file })
	}

	/// Commits `sink`'s bytes as the newest snapshot and enforces retention.
	pub fn finalize(&self, mut sink: SnapshotSink) -> Result<Arc<SnapshotHandle>> {
		sink.flush().chain_err(|| ErrorKind::Storage("flushing snapshot".into()))?;
		sink.file.sync_all().chain_err(|| ErrorKind::Storage("syncing snapshot".into()))?;

		let seq = sink
			.path
			.file_stem()
			.and_then(|s| s.to_str())
			.and_then(|s| s.strip_prefix("snapshot-"))
			.and_then(|s| s.parse::<u64>().ok())
			.unwrap_or(0);

		let reader =
			File::open(&sink.path).chain_err(|| ErrorKind::Storage("reopening snapshot for reading".into()))?;
		let handle = Arc::new(SnapshotHandle { seq, file: Mutex::new(reader) });

		let mut finalized = self.finalized.lock().unwrap();
		finalized.push(handle.clone());
		finalized.sort_by_key(|h| h.seq);

		while finalized.len() > RETENTION {
			let oldest = finalized.remove(0);
			let path = self.path_for(oldest.seq);
			let _ = fs::remove_file(path);
		}

		Ok(handle)
	}

	/// The most recently finalized snapshot, if any.
	pub fn latest(&self) -> Option<Arc<SnapshotHandle>> {
		self.finalized.lock().unwrap().last().cloned()
	}

	/// All retained snapshots, newest first.
	pub fn list(&self) -> Vec<Arc<SnapshotHandle>> {
		let mut handles = self.finalized.lock().unwrap().clone();
		handles.reverse();
		handles
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn finalize_then_read_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let store = SnapshotStore::open(dir.path()).unwrap();
		let mut sink = store.create_sink().unwrap();
		sink.write_all(b"hello").unwrap();
		let handle = store.finalize(sink).unwrap();
		assert_eq!(handle.read_all().unwrap(), b"hello");
	}

	#[test]
	fn retention_keeps_only_newest_two() {
		let dir = tempfile::tempdir().unwrap();
		let store = SnapshotStore::open(dir.path()).unwrap();
		for i in 0..5u8 {
			let mut sink = store.create_sink().unwrap();
			sink.write_all(&[i]).unwrap();
			store.finalize(sink).unwrap();
		}
		assert_eq!(store.list().len(), 2);
		assert_eq!(store.list()[0].read_all().unwrap(), vec![4]);
		assert_eq!(store.list()[1].read_all().unwrap(), vec![3]);
	}

	#[test]
	fn reader_survives_retention_unlink() {
		let dir = tempfile::tempdir().unwrap();
		let store = SnapshotStore::open(dir.path()).unwrap();

		let mut sink = store.create_sink().unwrap();
		sink.write_all(b"first").unwrap();
		let first = store.finalize(sink).unwrap();

		for i in 0..3u8 {
			let mut sink = store.create_sink().unwrap();
			sink.write_all(&[i]).unwrap();
			store.finalize(sink).unwrap();
		}

		// `first` has been pushed out of retention, but the handle is still readable.
		assert_eq!(first.read_all().unwrap(), b"first");
	}
}
