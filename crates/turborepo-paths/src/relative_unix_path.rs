use std::fmt;

use crate::{from_slash, AnchoredSystemPathBuf, PathError, RelativeUnixPathBuf};

/// A relative path with unix separators. The representation the rest of
/// the system treats as canonical: tar entry names, fingerprint inputs and
/// run-summary keys are all unix-delimited regardless of platform.
#[derive(Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RelativeUnixPath(str);

impl RelativeUnixPath {
    pub fn new<P: AsRef<str> + ?Sized>(value: &P) -> Result<&Self, PathError> {
        let path = value.as_ref();
        if path.starts_with('/') {
            return Err(PathError::NotRelative(path.to_string()));
        }
        Ok(unsafe { Self::new_unchecked(path) })
    }

    pub(crate) unsafe fn new_unchecked(value: &str) -> &Self {
        &*(value as *const str as *const Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_system_path_buf(&self) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf::from_raw(from_slash(&self.0))
            .expect("relative unix paths are relative")
    }
}

impl ToOwned for RelativeUnixPath {
    type Owned = RelativeUnixPathBuf;

    fn to_owned(&self) -> Self::Owned {
        RelativeUnixPathBuf::new_unchecked(self.0.to_string())
    }
}

impl AsRef<RelativeUnixPath> for RelativeUnixPath {
    fn as_ref(&self) -> &RelativeUnixPath {
        self
    }
}

impl fmt::Display for RelativeUnixPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
