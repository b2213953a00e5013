use std::path::{Path, PathBuf};

use crate::archive_probe::ArchiveProbe;
use crate::name_mapper::NameMapper;

/// The outcome of resolving a virtual path that traverses an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
	/// The archive's real path on the host filesystem.
	pub host_archive_path: PathBuf,

	/// The path within the archive's central directory, with no leading slash. Empty denotes
	/// the archive root.
	pub subpath: String,
}

/// Walks a virtual path left-to-right, finds the first segment that resolves to an archive,
/// and splits it into (archive host path, intra-archive subpath).
pub struct PathResolver<'a> {
	root: &'a Path,
	mapper: &'a NameMapper,
	probe: &'a ArchiveProbe,
}

impl<'a> PathResolver<'a> {
	pub fn new(root: &'a Path, mapper: &'a NameMapper, probe: &'a ArchiveProbe) -> Self {
		Self { root, mapper, probe }
	}

	/// Returns `None` if no prefix of `vpath` resolves to an archive; the shortest matching
	/// prefix wins (outermost archive).
	pub fn resolve(&self, vpath: &str) -> std::io::Result<Option<Resolved>> {
		let trimmed = vpath.trim_start_matches('/');
		if trimmed.is_empty() {
			return Ok(None);
		}

		let mut host_acc = String::new();

		let segments: Vec<&str> = trimmed.split('/').collect();
		for (i, segment) in segments.iter().enumerate() {
			let host_dir = if host_acc.is_empty() {
				self.root.to_path_buf()
			} else {
				self.root.join(&host_acc)
			};

			let rewritten = self.mapper.reverse_segment(&host_dir, segment);
			let is_rewrite_candidate = rewritten.is_some();
			let host_segment = rewritten.unwrap_or_else(|| segment.to_string());

			if !host_acc.is_empty() {
				host_acc.push('/');
			}
			host_acc.push_str(&host_segment);

			let is_suffix_candidate = segment.ends_with(".zip") || segment.ends_with(".Zip");

			if is_rewrite_candidate || is_suffix_candidate {
				let candidate_host_path = self.root.join(&host_acc);
				if let Ok(metadata) = std::fs::metadata(&candidate_host_path) {
					if let Ok(mtime) = metadata.modified() {
						if self.probe.is_archive(&candidate_host_path, mtime) {
							let subpath = segments[i + 1..].join("/");
							return Ok(Some(Resolved {
								host_archive_path: candidate_host_path,
								subpath,
							}));
						}
					}
				}
			}
		}

		Ok(None)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use tempfile::tempdir;

	fn write_zip(path: &std::path::Path) {
		let file = std::fs::File::create(path).unwrap();
		let mut writer = zip::ZipWriter::new(file);
		writer
			.start_file("x/y.txt", zip::write::FileOptions::default())
			.unwrap();
		writer.write_all(b"HELLO").unwrap();
		writer.finish().unwrap();
	}

	#[test]
	fn resolves_zip_suffix_archive_and_subpath() {
		let dir = tempdir().unwrap();
		write_zip(&dir.path().join("b.zip"));

		let mapper = NameMapper::Identity;
		let probe = ArchiveProbe::with_default_capacity();
		let resolver = PathResolver::new(dir.path(), &mapper, &probe);

		let resolved = resolver.resolve("/b.zip/x/y.txt").unwrap().unwrap();
		assert_eq!(resolved.host_archive_path, dir.path().join("b.zip"));
		assert_eq!(resolved.subpath, "x/y.txt");
	}

	#[test]
	fn resolves_archive_root_itself() {
		let dir = tempdir().unwrap();
		write_zip(&dir.path().join("b.zip"));

		let mapper = NameMapper::Identity;
		let probe = ArchiveProbe::with_default_capacity();
		let resolver = PathResolver::new(dir.path(), &mapper, &probe);

		let resolved = resolver.resolve("/b.zip").unwrap().unwrap();
		assert_eq!(resolved.subpath, "");
	}

	#[test]
	fn non_archive_path_resolves_to_none() {
		let dir = tempdir().unwrap();
		std::fs::write(dir.path().join("plain.txt"), b"hi").unwrap();

		let mapper = NameMapper::Identity;
		let probe = ArchiveProbe::with_default_capacity();
		let resolver = PathResolver::new(dir.path(), &mapper, &probe);

		assert!(resolver.resolve("/plain.txt").unwrap().is_none());
	}

	#[test]
	fn strip_suffix_mode_resolves_through_rewritten_name() {
		let dir = tempdir().unwrap();
		write_zip(&dir.path().join("data.d.Zip"));

		let mapper = NameMapper::StripSuffix;
		let probe = ArchiveProbe::with_default_capacity();
		let resolver = PathResolver::new(dir.path(), &mapper, &probe);

		let resolved = resolver.resolve("/data.d/x/y.txt").unwrap().unwrap();
		assert_eq!(resolved.host_archive_path, dir.path().join("data.d.Zip"));
		assert_eq!(resolved.subpath, "x/y.txt");
	}

	#[test]
	fn shortest_matching_prefix_wins() {
		// An archive containing another archive-looking name is not followed past one level;
		// the outermost archive is the one that matches first during the left-to-right walk.
		let dir = tempdir().unwrap();
		write_zip(&dir.path().join("outer.zip"));

		let mapper = NameMapper::Identity;
		let probe = ArchiveProbe::with_default_capacity();
		let resolver = PathResolver::new(dir.path(), &mapper, &probe);

		let resolved = resolver.resolve("/outer.zip/x/y.txt").unwrap().unwrap();
		assert_eq!(resolved.host_archive_path, dir.path().join("outer.zip"));
	}
}
