use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use lru::LruCache;
use tracing::debug;

use crate::archive::ArchiveHandle;
use crate::error::FsResult;

struct CacheEntry {
	mtime: SystemTime,
	archive: Arc<ArchiveHandle>,
}

/// A bounded LRU of opened archives, keyed by host path, with mtime-based invalidation.
///
/// The lock is held only for the duration of map mutation; archive I/O and stream reads never
/// happen while it's held.
pub struct ArchiveCache {
	inner: Mutex<LruCache<PathBuf, CacheEntry>>,
}

impl ArchiveCache {
	pub fn new(capacity: std::num::NonZeroUsize) -> Self {
		Self {
			inner: Mutex::new(LruCache::new(capacity)),
		}
	}

	/// Returns a shared archive reference for `path`, opening it on first access and
	/// re-opening it if the on-disk mtime has advanced past the cached one.
	pub fn get(&self, path: &Path) -> FsResult<Arc<ArchiveHandle>> {
		let current_mtime = std::fs::metadata(path)?.modified()?;

		let mut guard = self.inner.lock().unwrap();

		if let Some(entry) = guard.get(path) {
			if current_mtime <= entry.mtime {
				return Ok(Arc::clone(&entry.archive));
			}

			// Stale: drop the lock before reopening, since opening performs I/O.
			let stale = guard.pop(path);
			drop(guard);
			if let Some(stale) = stale {
				debug!(path = %path.display(), "closing stale cached archive");
				close_if_unreferenced(stale.archive);
			}
			return self.insert_fresh(path, current_mtime);
		}

		drop(guard);
		self.insert_fresh(path, current_mtime)
	}

	fn insert_fresh(&self, path: &Path, mtime: SystemTime) -> FsResult<Arc<ArchiveHandle>> {
		let archive = Arc::new(ArchiveHandle::open(path, mtime)?);

		let mut guard = self.inner.lock().unwrap();
		let evicted = guard.push(
			path.to_path_buf(),
			CacheEntry {
				mtime,
				archive: Arc::clone(&archive),
			},
		);
		drop(guard);

		if let Some((evicted_path, evicted_entry)) = evicted {
			if evicted_path != path {
				debug!(path = %evicted_path.display(), "evicting least-recently-used archive");
				close_if_unreferenced(evicted_entry.archive);
			}
		}

		Ok(archive)
	}

	#[cfg(test)]
	fn len(&self) -> usize {
		self.inner.lock().unwrap().len()
	}

	#[cfg(test)]
	fn contains(&self, path: &Path) -> bool {
		self.inner.lock().unwrap().contains(path)
	}
}

/// Closes the archive if no open stream still borrows it (i.e. the cache held the only
/// remaining strong reference). Otherwise the last stream's `Drop` will close it later.
fn close_if_unreferenced(archive: Arc<ArchiveHandle>) {
	match Arc::try_unwrap(archive) {
		Ok(archive) => archive.close(),
		Err(_) => {
			debug!("archive still referenced by open streams; deferring close");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use tempfile::tempdir;

	fn write_zip(path: &Path) {
		let file = std::fs::File::create(path).unwrap();
		let mut writer = zip::ZipWriter::new(file);
		writer.start_file("f.txt", zip::write::FileOptions::default()).unwrap();
		writer.write_all(b"hi").unwrap();
		writer.finish().unwrap();
	}

	#[test]
	fn caches_and_reuses_archive() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("a.zip");
		write_zip(&path);

		let cache = ArchiveCache::new(std::num::NonZeroUsize::new(2).unwrap());
		let first = cache.get(&path).unwrap();
		let second = cache.get(&path).unwrap();
		assert!(Arc::ptr_eq(&first, &second));
	}

	#[test]
	fn invalidates_on_mtime_change() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("a.zip");
		write_zip(&path);

		let cache = ArchiveCache::new(std::num::NonZeroUsize::new(2).unwrap());
		let first = cache.get(&path).unwrap();

		// Bump the mtime forward so the cached entry is considered stale.
		let newer = SystemTime::now() + std::time::Duration::from_secs(5);
		filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(newer)).unwrap();

		let second = cache.get(&path).unwrap();
		assert!(!Arc::ptr_eq(&first, &second));
	}

	#[test]
	fn evicts_least_recently_used_on_overflow() {
		let dir = tempdir().unwrap();
		let a = dir.path().join("a.zip");
		let b = dir.path().join("b.zip");
		let c = dir.path().join("c.zip");
		write_zip(&a);
		write_zip(&b);
		write_zip(&c);

		let cache = ArchiveCache::new(std::num::NonZeroUsize::new(2).unwrap());
		cache.get(&a).unwrap();
		cache.get(&b).unwrap();
		cache.get(&c).unwrap();

		assert_eq!(cache.len(), 2);
		assert!(!cache.contains(&a));
		assert!(cache.contains(&b));
		assert!(cache.contains(&c));
	}
}
