use std::fmt::{self, Display};
use std::io;

/// The closed error taxonomy surfaced to FUSE callers.
///
/// Every `fuser::Filesystem` method is a thin dispatcher around an inner method
/// returning `Result<_, FsError>`; the dispatcher is the single place an error
/// becomes a FUSE reply (see `errno`).
#[derive(Debug)]
pub enum FsError {
	/// Indicates that a path does not exist in the host tree or in an archive's central directory.
	NotFound,

	/// Indicates that a write-class operation was attempted against the read-only mount.
	ReadOnly,

	/// Indicates that the host filesystem denied access.
	PermissionDenied,

	/// Indicates that a handle was used in a way that required seeking but did not support it.
	BadFileDescriptor,

	/// Indicates that opening or reading an archive failed for a reason that isn't one of the above.
	Io(io::Error),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
	/// Maps this error to the errno reported to the FUSE client.
	pub fn errno(&self) -> i32 {
		match self {
			Self::NotFound => libc::ENOENT,
			Self::ReadOnly => libc::EROFS,
			Self::PermissionDenied => libc::EACCES,
			Self::BadFileDescriptor => libc::EBADF,
			Self::Io(_) => libc::EIO,
		}
	}
}

impl Display for FsError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::NotFound => write!(f, "no such file or directory"),
			Self::ReadOnly => write!(f, "read-only file system"),
			Self::PermissionDenied => write!(f, "permission denied"),
			Self::BadFileDescriptor => write!(f, "bad file descriptor"),
			Self::Io(e) => write!(f, "i/o error [{}]", e),
		}
	}
}

impl std::error::Error for FsError {}

impl From<io::Error> for FsError {
	fn from(e: io::Error) -> Self {
		match e.kind() {
			io::ErrorKind::NotFound => Self::NotFound,
			io::ErrorKind::PermissionDenied => Self::PermissionDenied,
			_ => Self::Io(e),
		}
	}
}
