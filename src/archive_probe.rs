use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;

use lru::LruCache;

/// Decides whether a host path is a valid ZIP archive, memoized by `(path, mtime)` so a
/// modified file invalidates any previous positive or negative result.
pub struct ArchiveProbe {
	memo: Mutex<LruCache<(std::path::PathBuf, SystemTime), bool>>,
}

impl ArchiveProbe {
	pub fn new(capacity: std::num::NonZeroUsize) -> Self {
		Self {
			memo: Mutex::new(LruCache::new(capacity)),
		}
	}

	pub fn with_default_capacity() -> Self {
		Self::new(std::num::NonZeroUsize::new(2048).unwrap())
	}

	/// Validates the end-of-central-directory record by delegating to the `zip` crate's own
	/// archive-opening check, caching the result under `(path, mtime)`.
	pub fn is_archive(&self, path: &Path, mtime: SystemTime) -> bool {
		let key = (path.to_path_buf(), mtime);

		if let Some(hit) = self.memo.lock().unwrap().get(&key) {
			return *hit;
		}

		let result = probe(path);
		self.memo.lock().unwrap().put(key, result);
		result
	}
}

fn probe(path: &Path) -> bool {
	match File::open(path) {
		Ok(file) => zip::ZipArchive::new(file).is_ok(),
		Err(_) => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use tempfile::tempdir;

	fn write_minimal_zip(path: &Path) {
		let file = File::create(path).unwrap();
		let mut writer = zip::ZipWriter::new(file);
		writer
			.start_file("f.txt", zip::write::FileOptions::default())
			.unwrap();
		writer.write_all(b"hi").unwrap();
		writer.finish().unwrap();
	}

	#[test]
	fn recognizes_valid_archive() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("a.zip");
		write_minimal_zip(&path);

		let probe = ArchiveProbe::with_default_capacity();
		let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
		assert!(probe.is_archive(&path, mtime));
	}

	#[test]
	fn rejects_non_archive() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("not-a-zip.txt");
		std::fs::write(&path, b"plain text").unwrap();

		let probe = ArchiveProbe::with_default_capacity();
		let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
		assert!(!probe.is_archive(&path, mtime));
	}

	#[test]
	fn memoized_result_ignores_content_changes_until_mtime_key_changes() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("a.zip");
		write_minimal_zip(&path);

		let probe = ArchiveProbe::with_default_capacity();
		let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
		assert!(probe.is_archive(&path, mtime));

		// Corrupt the file on disk without changing the mtime key we probe with: the memoized
		// result must still be returned, proving the cache is keyed and not re-validated.
		std::fs::write(&path, b"now definitely not a zip").unwrap();
		assert!(probe.is_archive(&path, mtime));
	}
}
