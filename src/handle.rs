use std::collections::HashMap;
use std::fs::File;
use std::sync::{Arc, Mutex};

use crate::archive::ArchiveHandle;

/// Per-open state for a single FUSE file handle.
pub enum OpenHandle {
	/// A stream reading one entry out of an opened archive. Holding the `Arc` keeps the
	/// archive alive even if the cache evicts it in the meantime (invariant I3).
	ArchiveEntry { archive: Arc<ArchiveHandle>, subpath: String },

	/// A passthrough host file, opened read-only. The per-handle mutex serializes concurrent
	/// reads on the same descriptor.
	Passthrough(Mutex<File>),
}

/// Dense integer allocator plus a tagged-variant table, replacing the original parity-encoded
/// file-handle scheme (see design notes): a single `u64` space, dispatched on the enum variant
/// at `release` rather than on handle-id parity.
pub struct HandleTable {
	inner: Mutex<HandleTableInner>,
}

struct HandleTableInner {
	next_id: u64,
	table: HashMap<u64, OpenHandle>,
}

impl HandleTable {
	pub fn new() -> Self {
		Self {
			inner: Mutex::new(HandleTableInner {
				next_id: 1,
				table: HashMap::new(),
			}),
		}
	}

	/// Allocates a new handle id and stores `handle` under it.
	pub fn insert(&self, handle: OpenHandle) -> u64 {
		let mut guard = self.inner.lock().unwrap();
		let id = guard.next_id;
		guard.next_id += 1;
		guard.table.insert(id, handle);
		id
	}

	/// Runs `f` against the handle stored under `fh`, if any.
	pub fn with<R>(&self, fh: u64, f: impl FnOnce(&OpenHandle) -> R) -> Option<R> {
		let guard = self.inner.lock().unwrap();
		guard.table.get(&fh).map(f)
	}

	/// Removes and returns the handle stored under `fh`, for use on release.
	pub fn remove(&self, fh: u64) -> Option<OpenHandle> {
		self.inner.lock().unwrap().table.remove(&fh)
	}
}

impl Default for HandleTable {
	fn default() -> Self {
		Self::new()
	}
}
