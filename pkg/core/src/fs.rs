use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Holds an exclusive advisory lock on a `.lock` file inside a directory for
/// as long as it's alive. Used to make sure two processes never open the same
/// `volume_dir` at once.
pub struct DirLock {
	file: File,
	path: PathBuf,
}

impl DirLock {
	/// Creates `dir` if missing and takes an exclusive, non-blocking lock on
	/// `dir/.lock`. Fails immediately (rather than blocking) if another
	/// process already holds it.
	pub fn open<P: AsRef<Path>>(dir: P) -> io::Result<DirLock> {
		let dir = dir.as_ref();
		fs::create_dir_all(dir)?;

		let path = dir.join(".lock");
		let file = OpenOptions::new()
			.create(true)
			.write(true)
			.open(&path)?;

		file.try_lock_exclusive().map_err(|_| {
			io::Error::new(
				io::ErrorKind::WouldBlock,
				format!("volume directory {} is locked by another process", dir.display()),
			)
		})?;

		Ok(DirLock { file, path })
	}
}

impl Drop for DirLock {
	fn drop(&mut self) {
		let _ = fs2::FileExt::unlock(&self.file);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lock_excludes_second_open() {
		let dir = tempfile::tempdir().unwrap();
		let first = DirLock::open(dir.path()).unwrap();
		let second = DirLock::open(dir.path());
		assert!(second.is_err());
		drop(first);
		assert!(DirLock::open(dir.path()).is_ok());
	}
}
