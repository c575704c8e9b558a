use std::{borrow::Borrow, fmt, ops::Deref, path::Path};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::{from_slash, AbsoluteSystemPath, AnchoredSystemPath, PathError};

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct AnchoredSystemPathBuf(pub(crate) Utf8PathBuf);

impl AnchoredSystemPathBuf {
    /// Strips `root` from `path`. This is the only way to produce an
    /// anchored path from an absolute one; a path outside the anchor is
    /// rejected rather than silently escaping it.
    pub fn new(
        root: &AbsoluteSystemPath,
        path: &AbsoluteSystemPath,
    ) -> Result<Self, PathError> {
        let stripped_path = path
            .as_path()
            .strip_prefix(root.as_path())
            .map_err(|_| PathError::NotParent(root.to_string(), path.to_string()))?;
        Ok(AnchoredSystemPathBuf(stripped_path.to_owned()))
    }

    /// Accepts raw `/`-delimited input (e.g. deserialized config or tar
    /// entry names) and converts to the system separator.
    pub fn from_raw(raw: impl AsRef<str>) -> Result<Self, PathError> {
        let raw = raw.as_ref();
        let system = Utf8PathBuf::from(from_slash(raw));
        if system.is_absolute() {
            return Err(PathError::NotRelative(raw.to_string()));
        }
        Ok(Self(system))
    }

    pub fn from_system_path(path: &Path) -> Result<Self, PathError> {
        let utf8 = path
            .to_str()
            .ok_or_else(|| PathError::InvalidUnicode(path.to_string_lossy().into_owned()))?;
        Self::from_raw(utf8)
    }

    pub fn push(&mut self, segment: &str) {
        self.0.push(segment);
    }
}

impl Deref for AnchoredSystemPathBuf {
    type Target = AnchoredSystemPath;

    fn deref(&self) -> &Self::Target {
        unsafe { AnchoredSystemPath::new_unchecked(self.0.as_path()) }
    }
}

impl Borrow<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn borrow(&self) -> &AnchoredSystemPath {
        self
    }
}

impl AsRef<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn as_ref(&self) -> &AnchoredSystemPath {
        self
    }
}

impl AsRef<Path> for AnchoredSystemPathBuf {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}

impl TryFrom<&str> for AnchoredSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::from_raw(value)
    }
}

impl fmt::Display for AnchoredSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AbsoluteSystemPathBuf;

    fn root() -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf::new(if cfg!(windows) { r"C:\repo" } else { "/repo" }).unwrap()
    }

    #[test]
    fn test_strip_root() {
        let root = root();
        let file = root.join_components(&["packages", "a", "lib.js"]);
        let anchored = AnchoredSystemPathBuf::new(&root, &file).unwrap();
        assert_eq!(anchored.to_unix().as_str(), "packages/a/lib.js");
    }

    #[test]
    fn test_escape_is_rejected() {
        let root = root();
        let sibling = root.parent().unwrap().join_component("outside");
        let err = AnchoredSystemPathBuf::new(&root, &sibling).unwrap_err();
        assert!(matches!(err, PathError::NotParent(_, _)));
    }

    #[test]
    fn test_absolute_raw_is_rejected() {
        let raw = if cfg!(windows) { r"C:\foo" } else { "/foo" };
        assert!(AnchoredSystemPathBuf::from_raw(raw).is_err());
    }
}
