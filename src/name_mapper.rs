use std::path::Path;

use wildmatch::WildMatch;

/// The literal suffix an on-disk archive must end with to be presented under a `.d` name.
const STRIP_SUFFIX: &str = ".d.Zip";

/// The length of `STRIP_SUFFIX`, hidden from the virtual name.
const HIDDEN_LEN: usize = 4; // ".Zip"

/// Bidirectional rewrite between virtual names and on-disk archive names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameMapper {
	/// Virtual names equal on-disk names.
	Identity,

	/// On-disk archives ending in `.d.Zip` are presented as `.d` directories.
	StripSuffix,
}

impl NameMapper {
	/// Strips the hidden suffix from an on-disk name, for use when enumerating a directory.
	pub fn host_name_to_virtual(&self, name: &str) -> String {
		match self {
			Self::Identity => name.to_string(),
			Self::StripSuffix => match name.strip_suffix(STRIP_SUFFIX) {
				Some(stem) => format!("{}.d", stem),
				None => name.to_string(),
			},
		}
	}

	/// Given the directory a virtual segment lives in and the segment itself, returns the
	/// on-disk name that segment should resolve to, if the reverse rule applies and the
	/// rewritten candidate exists on disk.
	///
	/// Pure otherwise: the only I/O performed is the existence check required to decide
	/// whether the rewrite applies.
	pub fn reverse_segment(&self, host_dir: &Path, segment: &str) -> Option<String> {
		match self {
			Self::Identity => None,
			Self::StripSuffix => {
				let stem = segment.strip_suffix(".d")?;
				let candidate = format!("{}{}", stem, STRIP_SUFFIX);
				if host_dir.join(&candidate).is_file() {
					Some(candidate)
				} else {
					None
				}
			}
		}
	}

	/// Given a full virtual path, produces the host path by applying the reverse rule
	/// segment-wise. If no archive is matched anywhere in the path, the result is simply
	/// `root` joined with the virtual path unchanged.
	pub fn virtual_to_host(&self, root: &Path, vpath: &str) -> std::path::PathBuf {
		let trimmed = vpath.trim_start_matches('/');
		if trimmed.is_empty() {
			return root.to_path_buf();
		}

		let mut acc = String::new();
		for segment in trimmed.split('/') {
			if segment.is_empty() {
				continue;
			}

			let host_dir = if acc.is_empty() {
				root.to_path_buf()
			} else {
				root.join(&acc)
			};

			let host_segment = self
				.reverse_segment(&host_dir, segment)
				.unwrap_or_else(|| segment.to_string());

			if !acc.is_empty() {
				acc.push('/');
			}
			acc.push_str(&host_segment);
		}

		root.join(&acc)
	}

	/// The length of `vpath` that corresponds to a given on-disk archive path: the number of
	/// characters shared between the virtual and host representations of the archive's own
	/// path, used to slice the intra-archive subpath out of a full path string.
	pub fn virtual_segment_length(&self, host_archive_path: &str) -> usize {
		match self {
			Self::Identity => host_archive_path.len(),
			Self::StripSuffix => match host_archive_path.ends_with(STRIP_SUFFIX) {
				true => host_archive_path.len() - HIDDEN_LEN,
				false => host_archive_path.len(),
			},
		}
	}
}

/// Path suffixes that must be reported as nonexistent, to prevent clients from creating
/// auxiliary files the read-only layer cannot host.
pub struct RejectedSuffixes {
	patterns: Vec<WildMatch>,
}

impl RejectedSuffixes {
	pub fn new(patterns: &[&str]) -> Self {
		Self {
			patterns: patterns.iter().map(|p| WildMatch::new(p)).collect(),
		}
	}

	/// The default set of rejected auxiliary-file suffixes.
	pub fn default_set() -> Self {
		Self::new(&["*/analysis.tdf-journal", "*/analysis.tdf-wal"])
	}

	pub fn is_rejected(&self, vpath: &str) -> bool {
		self.patterns.iter().any(|p| p.matches(vpath))
	}
}
