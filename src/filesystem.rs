use std::ffi::{CString, OsStr};
use std::fs::{self, File, OpenOptions};
use std::mem::MaybeUninit;
use std::num::NonZeroUsize;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use fuser::{
	FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
	ReplyEntry, ReplyOpen, ReplyStatfs, Request,
};
use tracing::debug;

use crate::archive::EntryMeta;
use crate::archive_probe::ArchiveProbe;
use crate::cache::ArchiveCache;
use crate::error::{FsError, FsResult};
use crate::handle::{HandleTable, OpenHandle};
use crate::inode::{InodeTable, ROOT_INO};
use crate::name_mapper::{NameMapper, RejectedSuffixes};
use crate::path_resolver::PathResolver;

/// How long the kernel may cache an entry's attributes before re-asking.
const TTL: Duration = Duration::from_secs(1);

/// The read-only, archive-transparent filesystem.
///
/// Every `fuser::Filesystem` method below is a thin dispatcher: it translates the inode it
/// receives to a virtual path (via `inodes`), calls one of the `*_for` inner methods that do the
/// actual work and return `FsResult<_>`, and converts the result to a FUSE reply at the boundary.
/// That boundary is the only place an `FsError` becomes an errno (see `FsError::errno`), and the
/// only place a panic inside an inner method would otherwise escape to the kernel bridge.
pub struct ZipRoFs {
	root: PathBuf,
	mapper: NameMapper,
	probe: ArchiveProbe,
	cache: ArchiveCache,
	handles: HandleTable,
	inodes: InodeTable,
	rejected: RejectedSuffixes,
	async_read: bool,
}

impl ZipRoFs {
	pub fn new(root: PathBuf, cache_capacity: NonZeroUsize, async_read: bool) -> Self {
		Self {
			root,
			// The `.d.Zip` rewrite rule is the system's only mapping convention; unlike the other
			// mount options it isn't exposed on the command line in the source this is grounded on.
			mapper: NameMapper::StripSuffix,
			probe: ArchiveProbe::with_default_capacity(),
			cache: ArchiveCache::new(cache_capacity),
			handles: HandleTable::new(),
			inodes: InodeTable::new(),
			rejected: RejectedSuffixes::default_set(),
			async_read,
		}
	}

	fn resolver(&self) -> PathResolver<'_> {
		PathResolver::new(&self.root, &self.mapper, &self.probe)
	}

	fn host_path(&self, vpath: &str) -> PathBuf {
		self.mapper.virtual_to_host(&self.root, vpath)
	}

	fn path_for_ino(&self, ino: u64) -> FsResult<String> {
		self.inodes.path_for(ino).ok_or(FsError::NotFound)
	}

	fn child_vpath(parent: &str, name: &OsStr) -> FsResult<String> {
		let name = name.to_str().ok_or(FsError::NotFound)?;
		Ok(if parent == "/" {
			format!("/{}", name)
		} else {
			format!("{}/{}", parent, name)
		})
	}

	fn attr_for(&self, ino: u64, vpath: &str) -> FsResult<FileAttr> {
		if self.rejected.is_rejected(vpath) {
			return Err(FsError::NotFound);
		}

		match self.resolver().resolve(vpath)? {
			None => {
				let hpath = self.host_path(vpath);
				let meta = fs::symlink_metadata(&hpath)?;
				Ok(host_attr(ino, &meta))
			}
			Some(resolved) if resolved.subpath.is_empty() => {
				let meta = fs::symlink_metadata(&resolved.host_archive_path)?;
				Ok(archive_root_attr(ino, &meta))
			}
			Some(resolved) => {
				let archive = self.cache.get(&resolved.host_archive_path)?;
				if let Some(entry) = archive.entry(&resolved.subpath) {
					Ok(entry_attr(ino, entry))
				} else if let Some(entry) = archive.explicit_dir(&resolved.subpath) {
					Ok(entry_attr(ino, entry))
				} else if archive.has_descendant(&resolved.subpath) {
					Ok(implicit_dir_attr(ino, archive.mtime))
				} else {
					Err(FsError::NotFound)
				}
			}
		}
	}

	fn readdir_for(&self, vpath: &str) -> FsResult<Vec<(String, FileType)>> {
		let mut entries = vec![(".".to_string(), FileType::Directory), ("..".to_string(), FileType::Directory)];

		match self.resolver().resolve(vpath)? {
			None => {
				let hpath = self.host_path(vpath);
				for dirent in fs::read_dir(&hpath)? {
					let dirent = dirent?;
					let raw_name = dirent.file_name().to_string_lossy().into_owned();
					let name = self.mapper.host_name_to_virtual(&raw_name);
					let mut kind = map_file_type(dirent.file_type()?);

					// A regular file that probes as an archive is presented as a directory of
					// its entries, so d_type must agree with what `getattr` reports for it.
					if kind == FileType::RegularFile {
						if let Ok(metadata) = dirent.metadata() {
							if let Ok(mtime) = metadata.modified() {
								if self.probe.is_archive(&hpath.join(&raw_name), mtime) {
									kind = FileType::Directory;
								}
							}
						}
					}

					entries.push((name, kind));
				}
			}
			Some(resolved) => {
				let archive = self.cache.get(&resolved.host_archive_path)?;
				for (name, is_dir) in archive.list_children(&resolved.subpath) {
					entries.push((name, if is_dir { FileType::Directory } else { FileType::RegularFile }));
				}
			}
		}

		Ok(entries)
	}

	fn access_for(&self, vpath: &str, mask: i32) -> FsResult<()> {
		if self.rejected.is_rejected(vpath) {
			return Err(FsError::NotFound);
		}

		if self.resolver().resolve(vpath)?.is_some() {
			if mask & libc::W_OK != 0 {
				return Err(FsError::ReadOnly);
			}
			return Ok(());
		}

		let hpath = self.host_path(vpath);
		let c_path = CString::new(hpath.as_os_str().as_bytes()).map_err(|_| FsError::NotFound)?;
		let rc = unsafe { libc::access(c_path.as_ptr(), mask) };
		if rc == 0 {
			Ok(())
		} else {
			Err(FsError::PermissionDenied)
		}
	}

	fn open_for(&self, vpath: &str, flags: i32) -> FsResult<u64> {
		if self.rejected.is_rejected(vpath) {
			return Err(FsError::NotFound);
		}

		const WRITE_FLAGS: i32 = libc::O_WRONLY | libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC | libc::O_APPEND;
		if flags & WRITE_FLAGS != 0 {
			return Err(FsError::ReadOnly);
		}

		match self.resolver().resolve(vpath)? {
			Some(resolved) if !resolved.subpath.is_empty() => {
				let archive = self.cache.get(&resolved.host_archive_path)?;
				if archive.entry(&resolved.subpath).is_none() {
					return Err(FsError::NotFound);
				}

				let fh = self.handles.insert(OpenHandle::ArchiveEntry {
					archive,
					subpath: resolved.subpath,
				});
				Ok(fh)
			}
			// The archive's own virtual directory has no subpath; it isn't a file to open.
			Some(_) => Err(FsError::NotFound),
			None => {
				let hpath = self.host_path(vpath);
				let file = OpenOptions::new().read(true).open(&hpath)?;
				let fh = self.handles.insert(OpenHandle::Passthrough(Mutex::new(file)));
				Ok(fh)
			}
		}
	}

	fn read_for(&self, fh: u64, offset: i64, size: u32) -> FsResult<Vec<u8>> {
		let offset = offset.max(0) as u64;

		self.handles
			.with(fh, |handle| match handle {
				OpenHandle::ArchiveEntry { archive, subpath } => archive.read_entry(subpath, offset, size as usize),
				OpenHandle::Passthrough(file) => read_passthrough(file, offset, size as usize),
			})
			.unwrap_or(Err(FsError::BadFileDescriptor))
	}

	fn release_for(&self, fh: u64) {
		// Dropping the handle drops its `File`/`Arc<ArchiveHandle>`; both close on last drop.
		// Per the release contract, this never fails the client even if an underlying close does.
		self.handles.remove(fh);
	}

	fn statfs_for(&self, vpath: &str) -> FsResult<libc::statvfs> {
		let hpath = self.host_path(vpath);
		let c_path = CString::new(hpath.as_os_str().as_bytes()).map_err(|_| FsError::NotFound)?;

		let mut buf: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
		let rc = unsafe { libc::statvfs(c_path.as_ptr(), buf.as_mut_ptr()) };
		if rc != 0 {
			return Err(std::io::Error::last_os_error().into());
		}

		Ok(unsafe { buf.assume_init() })
	}
}

fn read_passthrough(file: &Mutex<File>, offset: u64, size: usize) -> FsResult<Vec<u8>> {
	use std::io::{Read, Seek, SeekFrom};

	let mut file = file.lock().unwrap();
	file.seek(SeekFrom::Start(offset))?;

	let mut buf = vec![0u8; size];
	let mut total = 0usize;
	while total < size {
		let read = file.read(&mut buf[total..])?;
		if read == 0 {
			break;
		}
		total += read;
	}
	buf.truncate(total);
	Ok(buf)
}

fn map_file_type(ft: fs::FileType) -> FileType {
	if ft.is_dir() {
		FileType::Directory
	} else if ft.is_symlink() {
		FileType::Symlink
	} else {
		FileType::RegularFile
	}
}

/// The uid/gid presented for synthetic (archive-backed) entries: the mounting process's own,
/// since the archive itself carries no ownership information worth preserving.
fn mount_owner() -> (u32, u32) {
	unsafe { (libc::getuid(), libc::getgid()) }
}

fn host_attr(ino: u64, meta: &fs::Metadata) -> FileAttr {
	FileAttr {
		ino,
		size: meta.size(),
		blocks: meta.blocks(),
		atime: to_system_time(meta.atime(), meta.atime_nsec()),
		mtime: to_system_time(meta.mtime(), meta.mtime_nsec()),
		ctime: to_system_time(meta.ctime(), meta.ctime_nsec()),
		crtime: to_system_time(meta.ctime(), meta.ctime_nsec()),
		kind: map_file_type(meta.file_type()),
		perm: meta.permissions().mode() as u16,
		nlink: meta.nlink() as u32,
		uid: meta.uid(),
		gid: meta.gid(),
		rdev: meta.rdev() as u32,
		blksize: meta.blksize() as u32,
		flags: 0,
	}
}

/// The virtual directory standing in for an archive itself: real metadata, forced directory mode.
fn archive_root_attr(ino: u64, meta: &fs::Metadata) -> FileAttr {
	let mut attr = host_attr(ino, meta);
	attr.kind = FileType::Directory;
	attr.perm = 0o555 & (meta.permissions().mode() as u16 | 0o555);
	attr.nlink = attr.nlink.max(2);
	attr
}

fn entry_attr(ino: u64, entry: &EntryMeta) -> FileAttr {
	let (uid, gid) = mount_owner();
	let size = entry.size;
	FileAttr {
		ino,
		size,
		blocks: (size + 511) / 512,
		atime: entry.mtime,
		mtime: entry.mtime,
		ctime: entry.mtime,
		crtime: entry.mtime,
		kind: if entry.is_dir { FileType::Directory } else { FileType::RegularFile },
		perm: 0o555,
		nlink: if entry.is_dir { 2 } else { 1 },
		uid,
		gid,
		rdev: 0,
		blksize: 512,
		flags: 0,
	}
}

/// A directory that exists only because some entry names it as a path prefix (no explicit
/// central-directory record of its own); there's no stored size or timestamp to report.
fn implicit_dir_attr(ino: u64, archive_mtime: SystemTime) -> FileAttr {
	let (uid, gid) = mount_owner();
	FileAttr {
		ino,
		size: 0,
		blocks: 0,
		atime: archive_mtime,
		mtime: archive_mtime,
		ctime: archive_mtime,
		crtime: archive_mtime,
		kind: FileType::Directory,
		perm: 0o555,
		nlink: 2,
		uid,
		gid,
		rdev: 0,
		blksize: 512,
		flags: 0,
	}
}

fn to_system_time(secs: i64, nsecs: i64) -> SystemTime {
	if secs >= 0 {
		SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
	} else {
		SystemTime::UNIX_EPOCH - Duration::new((-secs) as u64, 0)
	}
}

impl Filesystem for ZipRoFs {
	fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), libc::c_int> {
		if self.async_read {
			let _ = config.add_capabilities(fuser::consts::FUSE_ASYNC_READ);
		}
		// When `async` isn't requested, leaving the capability unset is sufficient: `fuser` never
		// enables FUSE_CAP_ASYNC_READ unless a `Filesystem::init` asks for it, which is the
		// idiomatic equivalent of the source's direct `conn.async_read = 0; conn.want &= ~1`.
		Ok(())
	}

	fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
		let result = (|| -> FsResult<FileAttr> {
			let parent_path = self.path_for_ino(parent)?;
			let vpath = Self::child_vpath(&parent_path, name)?;
			let ino = self.inodes.ino_for(&vpath);
			self.attr_for(ino, &vpath)
		})();

		debug!(parent, name = ?name, "lookup");
		match result {
			Ok(attr) => reply.entry(&TTL, &attr, 0),
			Err(e) => reply.error(e.errno()),
		}
	}

	fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
		let result = (|| -> FsResult<FileAttr> {
			let vpath = self.path_for_ino(ino)?;
			self.attr_for(ino, &vpath)
		})();

		debug!(ino, "getattr");
		match result {
			Ok(attr) => reply.attr(&TTL, &attr),
			Err(e) => reply.error(e.errno()),
		}
	}

	fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
		let result = (|| -> FsResult<()> {
			let vpath = self.path_for_ino(ino)?;
			self.access_for(&vpath, mask)
		})();

		debug!(ino, mask, "access");
		match result {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e.errno()),
		}
	}

	fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
		reply.opened(0, 0);
	}

	fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
		reply.ok();
	}

	fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
		let result = (|| -> FsResult<Vec<(String, FileType, u64)>> {
			let vpath = self.path_for_ino(ino)?;
			let entries = self.readdir_for(&vpath)?;

			// Resolve (and, for unseen names, allocate) each child's inode up front, so later
			// `lookup`s on names already seen via `readdir` resolve to the same inode.
			Ok(entries
				.into_iter()
				.map(|(name, kind)| {
					let child_ino = if name == "." || name == ".." {
						ino
					} else if vpath == "/" {
						self.inodes.ino_for(&format!("/{}", name))
					} else {
						self.inodes.ino_for(&format!("{}/{}", vpath, name))
					};
					(name, kind, child_ino)
				})
				.collect())
		})();

		debug!(ino, offset, "readdir");
		match result {
			Ok(entries) => {
				for (i, (name, kind, child_ino)) in entries.into_iter().enumerate().skip(offset as usize) {
					if reply.add(child_ino, (i + 1) as i64, kind, &name) {
						break;
					}
				}
				reply.ok();
			}
			Err(e) => reply.error(e.errno()),
		}
	}

	fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
		let result = (|| -> FsResult<u64> {
			let vpath = self.path_for_ino(ino)?;
			self.open_for(&vpath, flags)
		})();

		debug!(ino, flags, "open");
		match result {
			Ok(fh) => reply.opened(fh, 0),
			Err(e) => reply.error(e.errno()),
		}
	}

	fn read(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		fh: u64,
		offset: i64,
		size: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: ReplyData,
	) {
		debug!(ino, fh, offset, size, "read");
		match self.read_for(fh, offset, size) {
			Ok(data) => reply.data(&data),
			Err(e) => reply.error(e.errno()),
		}
	}

	fn release(
		&mut self,
		_req: &Request<'_>,
		_ino: u64,
		fh: u64,
		_flags: i32,
		_lock_owner: Option<u64>,
		_flush: bool,
		reply: ReplyEmpty,
	) {
		debug!(fh, "release");
		self.release_for(fh);
		reply.ok();
	}

	fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
		let result = (|| -> FsResult<libc::statvfs> {
			let vpath = self.path_for_ino(ino)?;
			self.statfs_for(&vpath)
		})();

		debug!(ino, "statfs");
		match result {
			Ok(stat) => reply.statfs(
				stat.f_blocks,
				stat.f_bfree,
				stat.f_bavail,
				stat.f_files,
				stat.f_ffree,
				stat.f_bsize as u32,
				stat.f_namemax as u32,
				stat.f_frsize as u32,
			),
			Err(e) => reply.error(e.errno()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use tempfile::tempdir;

	fn write_zip(path: &std::path::Path, entries: &[(&str, &[u8])]) {
		let file = File::create(path).unwrap();
		let mut writer = zip::ZipWriter::new(file);
		for (name, data) in entries {
			writer.start_file(*name, zip::write::FileOptions::default()).unwrap();
			writer.write_all(data).unwrap();
		}
		writer.finish().unwrap();
	}

	fn fs_over(root: &std::path::Path) -> ZipRoFs {
		ZipRoFs::new(root.to_path_buf(), NonZeroUsize::new(8).unwrap(), false)
	}

	#[test]
	fn passthrough_file_reads_and_attrs_match_host() {
		let dir = tempdir().unwrap();
		std::fs::write(dir.path().join("a.txt"), b"hello\n").unwrap();

		let fs = fs_over(dir.path());
		let attr = fs.attr_for(2, "/a.txt").unwrap();
		assert_eq!(attr.size, 6);
		assert_eq!(attr.kind, FileType::RegularFile);

		let fh = fs.open_for("/a.txt", libc::O_RDONLY).unwrap();
		let data = fs.read_for(fh, 0, 6).unwrap();
		assert_eq!(data, b"hello\n");
		fs.release_for(fh);
	}

	#[test]
	fn archive_entry_is_transparent() {
		let dir = tempdir().unwrap();
		write_zip(&dir.path().join("b.zip"), &[("x/y.txt", b"HELLO")]);

		let fs = fs_over(dir.path());

		// The archive itself must be advertised as a directory in its parent's listing, not as
		// the regular file it is on the host.
		let root_entries = fs.readdir_for("/").unwrap();
		assert!(root_entries.iter().any(|(n, k)| n == "b.zip" && *k == FileType::Directory));

		let entries = fs.readdir_for("/b.zip").unwrap();
		assert!(entries.iter().any(|(n, k)| n == "x" && *k == FileType::Directory));

		let entries = fs.readdir_for("/b.zip/x").unwrap();
		assert!(entries.iter().any(|(n, _)| n == "y.txt"));

		let attr = fs.attr_for(5, "/b.zip/x/y.txt").unwrap();
		assert_eq!(attr.size, 5);

		let fh = fs.open_for("/b.zip/x/y.txt", libc::O_RDONLY).unwrap();
		let data = fs.read_for(fh, 0, 5).unwrap();
		assert_eq!(data, b"HELLO");
		fs.release_for(fh);
	}

	#[test]
	fn strip_suffix_mode_presents_hidden_directory() {
		let dir = tempdir().unwrap();
		write_zip(&dir.path().join("data.d.Zip"), &[("f.bin", b"\x01\x02\x03")]);

		let fs = fs_over(dir.path());
		let root_entries = fs.readdir_for("/").unwrap();
		assert!(root_entries.iter().any(|(n, k)| n == "data.d" && *k == FileType::Directory));
		assert!(!root_entries.iter().any(|(n, _)| n == "data.d.Zip"));

		let attr = fs.attr_for(2, "/data.d").unwrap();
		assert_eq!(attr.kind, FileType::Directory);

		let fh = fs.open_for("/data.d/f.bin", libc::O_RDONLY).unwrap();
		let data = fs.read_for(fh, 0, 3).unwrap();
		assert_eq!(data, b"\x01\x02\x03");
		fs.release_for(fh);
	}

	#[test]
	fn write_flags_are_rejected() {
		let dir = tempdir().unwrap();
		write_zip(&dir.path().join("b.zip"), &[("x/y.txt", b"HELLO")]);

		let fs = fs_over(dir.path());
		let err = fs.open_for("/b.zip/x/y.txt", libc::O_WRONLY).unwrap_err();
		assert_eq!(err.errno(), libc::EROFS);

		let err = fs.access_for("/b.zip/x/y.txt", libc::W_OK).unwrap_err();
		assert_eq!(err.errno(), libc::EROFS);
	}

	#[test]
	fn explicit_empty_directory_stats_as_directory() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("g.zip");
		{
			let file = File::create(&path).unwrap();
			let mut writer = zip::ZipWriter::new(file);
			writer.add_directory("emptydir", zip::write::FileOptions::default()).unwrap();
			writer.finish().unwrap();
		}

		let fs = fs_over(dir.path());
		let attr = fs.attr_for(5, "/g.zip/emptydir").unwrap();
		assert_eq!(attr.kind, FileType::Directory);
	}

	#[test]
	fn concurrent_opens_read_independently() {
		let dir = tempdir().unwrap();
		write_zip(&dir.path().join("c.zip"), &[("big.bin", &[7u8; 4096])]);

		let fs = fs_over(dir.path());
		let fh1 = fs.open_for("/c.zip/big.bin", libc::O_RDONLY).unwrap();
		let fh2 = fs.open_for("/c.zip/big.bin", libc::O_RDONLY).unwrap();
		assert_ne!(fh1, fh2);

		fs.release_for(fh1);
		let data = fs.read_for(fh2, 0, 4096).unwrap();
		assert_eq!(data.len(), 4096);
		assert!(data.iter().all(|b| *b == 7));
	}
}
