use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use chrono::{Local, LocalResult, NaiveDate, NaiveTime, TimeZone};
use zip::CompressionMethod;

use crate::error::{FsError, FsResult};

/// Metadata for a single entry in an archive's central directory.
#[derive(Debug, Clone)]
pub struct EntryMeta {
	pub name: String,
	pub is_dir: bool,
	pub size: u64,
	pub mtime: SystemTime,
}

/// An opened, parsed ZIP archive.
///
/// The central directory listing is parsed once at open time and kept outside the
/// positioning-token lock, so metadata lookups (`getattr`, `readdir`) never block on
/// concurrent reads. The lock only guards operations that touch the underlying `File`.
pub struct ArchiveHandle {
	pub host_path: PathBuf,
	pub mtime: SystemTime,
	listing: HashMap<String, EntryMeta>,
	names: Vec<String>,
	token: Mutex<ZipFileAccess>,
}

struct ZipFileAccess {
	archive: zip::ZipArchive<File>,
	/// A second, independently-seekable handle onto the same file, used to fast-path reads of
	/// `Stored` (uncompressed) entries directly rather than through the entry reader.
	raw: File,
}

impl ArchiveHandle {
	pub fn open(host_path: &Path, mtime: SystemTime) -> FsResult<Self> {
		let file = File::open(host_path)?;
		let raw = file.try_clone()?;
		let mut archive = zip::ZipArchive::new(file).map_err(|e| FsError::Io(zip_err_to_io(e)))?;

		let mut listing = HashMap::with_capacity(archive.len());
		let mut names = Vec::with_capacity(archive.len());
		for i in 0..archive.len() {
			let entry = archive.by_index(i).map_err(|e| FsError::Io(zip_err_to_io(e)))?;
			let name = entry.name().to_string();
			let meta = EntryMeta {
				name: name.clone(),
				is_dir: entry.is_dir(),
				size: entry.size(),
				mtime: entry_mtime(&entry, mtime),
			};
			names.push(name.clone());
			listing.insert(name, meta);
		}

		Ok(Self {
			host_path: host_path.to_path_buf(),
			mtime,
			listing,
			names,
			token: Mutex::new(ZipFileAccess { archive, raw }),
		})
	}

	/// Looks up an entry by its exact intra-archive name.
	pub fn entry(&self, subpath: &str) -> Option<&EntryMeta> {
		self.listing.get(subpath)
	}

	/// Looks up `subpath` as an explicit directory entry, stored in the central directory with
	/// a trailing slash (as opposed to an implicit directory that exists only as a prefix of
	/// some other entry's name).
	pub fn explicit_dir(&self, subpath: &str) -> Option<&EntryMeta> {
		if subpath.is_empty() {
			return None;
		}
		self.listing.get(&format!("{}/", subpath.trim_end_matches('/')))
	}

	/// True if `subpath` is a prefix (directory component) of some entry's name.
	pub fn has_descendant(&self, subpath: &str) -> bool {
		let prefix = if subpath.is_empty() {
			String::new()
		} else {
			format!("{}/", subpath.trim_end_matches('/'))
		};
		self.names.iter().any(|n| n.starts_with(&prefix) && n.len() > prefix.len())
	}

	/// Immediate children of `subpath`: direct files under it and deduplicated subdirectory
	/// names for deeper descendants.
	pub fn list_children(&self, subpath: &str) -> Vec<(String, bool)> {
		let prefix = if subpath.is_empty() {
			String::new()
		} else {
			format!("{}/", subpath.trim_end_matches('/'))
		};

		let mut files = Vec::new();
		let mut subdirs: Vec<String> = Vec::new();

		for name in &self.names {
			let Some(rest) = name.strip_prefix(prefix.as_str()) else {
				continue;
			};
			if rest.is_empty() {
				continue;
			}

			match rest.find('/') {
				None => files.push((rest.to_string(), false)),
				Some(idx) => {
					let dir_name = rest[..idx].to_string();
					if !subdirs.contains(&dir_name) {
						subdirs.push(dir_name);
					}
				}
			}
		}

		let mut result: Vec<(String, bool)> = subdirs.into_iter().map(|d| (d, true)).collect();
		result.extend(files);
		result
	}

	/// Reads `size` bytes starting at `offset` from the named entry.
	///
	/// `zip`'s per-entry reader is forward-only, so a genuine seek is implemented by reopening
	/// the entry reader from byte zero and discarding up to `offset` bytes, except for `Stored`
	/// (uncompressed) entries, which seek directly in the backing file. Reading past end of
	/// entry returns fewer bytes than requested rather than an error.
	pub fn read_entry(&self, subpath: &str, offset: u64, size: usize) -> FsResult<Vec<u8>> {
		let mut guard = self.token.lock().unwrap();
		let access = &mut *guard;

		let compression = {
			let entry = access.archive.by_name(subpath).map_err(|_| FsError::NotFound)?;
			entry.compression()
		};

		if compression == CompressionMethod::Stored {
			return self.read_stored(access, subpath, offset, size);
		}

		let mut entry = access.archive.by_name(subpath).map_err(|_| FsError::NotFound)?;

		let mut discard = vec![0u8; 64 * 1024];
		let mut remaining = offset;
		while remaining > 0 {
			let chunk = remaining.min(discard.len() as u64) as usize;
			let read = entry.read(&mut discard[..chunk]).map_err(FsError::Io)?;
			if read == 0 {
				// Offset lies past the end of the (decompressed) entry: benign EOF.
				return Ok(Vec::new());
			}
			remaining -= read as u64;
		}

		let mut buf = vec![0u8; size];
		let mut total = 0usize;
		while total < size {
			let read = entry.read(&mut buf[total..]).map_err(FsError::Io)?;
			if read == 0 {
				break;
			}
			total += read;
		}
		buf.truncate(total);
		Ok(buf)
	}

	fn read_stored(
		&self,
		access: &mut ZipFileAccess,
		subpath: &str,
		offset: u64,
		size: usize,
	) -> FsResult<Vec<u8>> {
		use std::io::{Seek, SeekFrom};

		let (data_start, entry_size) = {
			let entry = access.archive.by_name(subpath).map_err(|_| FsError::NotFound)?;
			(entry.data_start(), entry.size())
		};

		// Clamp to the entry's own bounds: the backing `File` carries the whole archive, so an
		// unclamped read past end-of-entry would spill into the next local header / central
		// directory rather than signalling EOF.
		let size = size.min(entry_size.saturating_sub(offset) as usize);

		access
			.raw
			.seek(SeekFrom::Start(data_start + offset))
			.map_err(FsError::Io)?;

		let mut buf = vec![0u8; size];
		let mut total = 0usize;
		while total < size {
			let read = access.raw.read(&mut buf[total..]).map_err(FsError::Io)?;
			if read == 0 {
				break;
			}
			total += read;
		}
		buf.truncate(total);
		Ok(buf)
	}

	/// Closes the archive. Dropping the underlying file handles is infallible in practice; this
	/// method exists so callers have a single, explicit place to log a close failure should one
	/// ever surface (per the eviction error-handling contract).
	pub fn close(self) {
		drop(self.token.into_inner().unwrap());
	}
}

/// Converts a `zip` crate error into an `io::Error` for uniform propagation through `FsError`.
fn zip_err_to_io(e: zip::result::ZipError) -> std::io::Error {
	match e {
		zip::result::ZipError::Io(io) => io,
		other => std::io::Error::new(std::io::ErrorKind::Other, other),
	}
}

/// Interprets a stored DOS date/time as local time with dst-flag "unknown", falling back to
/// the archive's own mtime on any conversion failure.
fn entry_mtime(entry: &zip::read::ZipFile, archive_mtime: SystemTime) -> SystemTime {
	let dt = entry.last_modified();

	let naive_date = NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32);
	let naive_time = NaiveTime::from_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32);

	let (Some(date), Some(time)) = (naive_date, naive_time) else {
		return archive_mtime;
	};

	let naive = date.and_time(time);
	let local = match Local.from_local_datetime(&naive) {
		LocalResult::Single(dt) => Some(dt),
		LocalResult::Ambiguous(earliest, _latest) => Some(earliest),
		LocalResult::None => None,
	};

	match local {
		Some(dt) => SystemTime::from(dt),
		None => archive_mtime,
	}
}
