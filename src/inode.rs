use std::collections::HashMap;
use std::sync::Mutex;

/// Reserved inode number for the mount root.
pub const ROOT_INO: u64 = 1;

/// Bidirectional virtual-path ⇄ inode table.
///
/// `fuser`'s protocol is inode-indexed (`lookup` returns an `ino`, later calls address the
/// same node by `ino`), unlike the path-indexed FUSE binding the original system was built
/// against. This table is pure bridging: every other component in this crate still operates
/// on virtual path strings; this is the only place `ino -> path` translation happens.
pub struct InodeTable {
	inner: Mutex<Inner>,
}

struct Inner {
	next_ino: u64,
	path_to_ino: HashMap<String, u64>,
	ino_to_path: HashMap<u64, String>,
}

impl InodeTable {
	pub fn new() -> Self {
		let mut path_to_ino = HashMap::new();
		let mut ino_to_path = HashMap::new();
		path_to_ino.insert("/".to_string(), ROOT_INO);
		ino_to_path.insert(ROOT_INO, "/".to_string());

		Self {
			inner: Mutex::new(Inner {
				next_ino: ROOT_INO + 1,
				path_to_ino,
				ino_to_path,
			}),
		}
	}

	/// Returns the inode for `path`, allocating a fresh one if this path hasn't been seen yet.
	pub fn ino_for(&self, path: &str) -> u64 {
		let mut guard = self.inner.lock().unwrap();
		if let Some(ino) = guard.path_to_ino.get(path) {
			return *ino;
		}

		let ino = guard.next_ino;
		guard.next_ino += 1;
		guard.path_to_ino.insert(path.to_string(), ino);
		guard.ino_to_path.insert(ino, path.to_string());
		ino
	}

	/// Returns the virtual path for `ino`, if known.
	pub fn path_for(&self, ino: u64) -> Option<String> {
		self.inner.lock().unwrap().ino_to_path.get(&ino).cloned()
	}
}

impl Default for InodeTable {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn root_is_preallocated() {
		let table = InodeTable::new();
		assert_eq!(table.ino_for("/"), ROOT_INO);
		assert_eq!(table.path_for(ROOT_INO), Some("/".to_string()));
	}

	#[test]
	fn same_path_returns_same_inode() {
		let table = InodeTable::new();
		let a = table.ino_for("/foo/bar");
		let b = table.ino_for("/foo/bar");
		assert_eq!(a, b);
	}

	#[test]
	fn distinct_paths_get_distinct_inodes() {
		let table = InodeTable::new();
		let a = table.ino_for("/foo");
		let b = table.ino_for("/bar");
		assert_ne!(a, b);
		assert_eq!(table.path_for(a), Some("/foo".to_string()));
		assert_eq!(table.path_for(b), Some("/bar".to_string()));
	}
}
