use std::{fmt, path::Path};

use camino::{Utf8Components, Utf8Path};

use crate::{AnchoredSystemPathBuf, PathError, RelativeUnixPathBuf};

#[derive(Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct AnchoredSystemPath(Utf8Path);

impl ToOwned for AnchoredSystemPath {
    type Owned = AnchoredSystemPathBuf;

    fn to_owned(&self) -> Self::Owned {
        AnchoredSystemPathBuf(self.0.to_owned())
    }
}

impl AsRef<AnchoredSystemPath> for AnchoredSystemPath {
    fn as_ref(&self) -> &AnchoredSystemPath {
        self
    }
}

impl AsRef<Path> for AnchoredSystemPath {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}

impl fmt::Display for AnchoredSystemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AnchoredSystemPath {
    pub fn new<P: AsRef<str> + ?Sized>(path: &P) -> Result<&Self, PathError> {
        let path = Utf8Path::new(path.as_ref());
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.to_string()));
        }
        Ok(unsafe { Self::new_unchecked(path) })
    }

    pub(crate) unsafe fn new_unchecked(path: &Utf8Path) -> &Self {
        &*(path as *const Utf8Path as *const Self)
    }

    pub fn empty() -> &'static Self {
        unsafe { Self::new_unchecked(Utf8Path::new("")) }
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn components(&self) -> Utf8Components<'_> {
        self.0.components()
    }

    pub fn parent(&self) -> Option<&AnchoredSystemPath> {
        self.0
            .parent()
            .map(|path| unsafe { AnchoredSystemPath::new_unchecked(path) })
    }

    pub fn join_component(&self, segment: &str) -> AnchoredSystemPathBuf {
        debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
        AnchoredSystemPathBuf(self.0.join(segment))
    }

    pub fn join_components(&self, segments: &[&str]) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf(self.0.join(segments.join(std::path::MAIN_SEPARATOR_STR)))
    }

    /// Renders this path with unix separators, the form stored in tar
    /// archives and fed to the hasher.
    pub fn to_unix(&self) -> RelativeUnixPathBuf {
        RelativeUnixPathBuf::new_unchecked(crate::to_slash(self.0.as_str()))
    }
}
