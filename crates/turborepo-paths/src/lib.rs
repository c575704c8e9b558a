//! Path types for the task runner.
//!
//! Distinguishing the role a path plays at the type level has repeatedly
//! saved us from a class of bugs where a repo-relative path gets joined
//! onto the wrong base, or a Windows path ends up inside a tar archive.
//!
//! - `AbsoluteSystemPath{,Buf}`: absolute, system separators.
//! - `AnchoredSystemPath{,Buf}`: relative to some anchor (usually the repo
//!   root or a package directory), system separators.
//! - `RelativeUnixPath{,Buf}`: relative with `/` separators, used anywhere
//!   the bytes must be identical across platforms (tar entries, hashing).
//!
//! Conversions between the absolute and anchored families always require
//! an explicit anchor.

mod absolute_system_path;
mod absolute_system_path_buf;
mod anchored_system_path;
mod anchored_system_path_buf;
mod relative_unix_path;
mod relative_unix_path_buf;

use std::io;

pub use absolute_system_path::AbsoluteSystemPath;
pub use absolute_system_path_buf::AbsoluteSystemPathBuf;
pub use anchored_system_path::AnchoredSystemPath;
pub use anchored_system_path_buf::AnchoredSystemPathBuf;
pub use relative_unix_path::RelativeUnixPath;
pub use relative_unix_path_buf::RelativeUnixPathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("Path is non-UTF-8: {0}")]
    InvalidUnicode(String),
    #[error("Path is not absolute: {0}")]
    NotAbsolute(String),
    #[error("Path is not relative: {0}")]
    NotRelative(String),
    #[error("Path {0} is not a prefix of {1}")]
    NotParent(String, String),
    #[error("IO Error {0}")]
    IO(#[from] io::Error),
}

impl PathError {
    pub fn is_io_error(&self, kind: io::ErrorKind) -> bool {
        matches!(self, PathError::IO(err) if err.kind() == kind)
    }
}

/// Converts `/`-delimited input to the system separator. On unix this is
/// the identity.
pub(crate) fn from_slash(raw: &str) -> String {
    #[cfg(windows)]
    {
        raw.replace('/', "\\")
    }
    #[cfg(not(windows))]
    {
        raw.to_string()
    }
}

/// Converts system separators to `/`. On unix this is the identity.
pub(crate) fn to_slash(raw: &str) -> String {
    #[cfg(windows)]
    {
        raw.replace('\\', "/")
    }
    #[cfg(not(windows))]
    {
        raw.to_string()
    }
}
