use thiserror::Error;

/// Errno-style failure kinds returned by every fallible operation.
///
/// Each variant carries a human-readable detail string; the variant itself is
/// the machine-checkable classification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Errno {
  /// Invalid argument
  #[error("invalid argument: {0}")]
  EINVAL(String),
  /// No such file or directory
  #[error("no such file or directory: {0}")]
  ENOENT(String),
  /// File exists
  #[error("file exists: {0}")]
  EEXIST(String),
  /// Not a directory
  #[error("not a directory: {0}")]
  ENOTDIR(String),
  /// Is a directory
  #[error("is a directory: {0}")]
  EISDIR(String),
  /// Directory not empty
  #[error("directory not empty: {0}")]
  ENOTEMPTY(String),
  /// Name too long
  #[error("name too long: {0}")]
  ENAMETOOLONG(String),
  /// No space left on device
  #[error("no space left on device: {0}")]
  ENOSPC(String),
  /// I/O error on the backing file
  #[error("i/o error: {0}")]
  EIO(String),
  /// Corrupted or foreign filesystem image
  #[error("bad filesystem: {0}")]
  EBADFS(String),
}

impl From<std::io::Error> for Errno {
  fn from(err: std::io::Error) -> Self {
    Errno::EIO(err.to_string())
  }
}

// vim:ts=2 sw=2
