use std::{
    fmt, fs,
    fs::{File, Metadata, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use camino::{Utf8Components, Utf8Path};
use path_clean::PathClean;

use crate::{AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf, PathError};

#[derive(Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct AbsoluteSystemPath(Utf8Path);

impl ToOwned for AbsoluteSystemPath {
    type Owned = AbsoluteSystemPathBuf;

    fn to_owned(&self) -> Self::Owned {
        AbsoluteSystemPathBuf(self.0.to_owned())
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPath {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self
    }
}

impl AsRef<Path> for AbsoluteSystemPath {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}

impl fmt::Display for AbsoluteSystemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AbsoluteSystemPath {
    /// Validates that the given value is absolute and uses system
    /// separators. Does *not* perform the automatic conversion that
    /// `AbsoluteSystemPathBuf::new` does.
    pub fn new<P: AsRef<str> + ?Sized>(value: &P) -> Result<&Self, PathError> {
        let path = Utf8Path::new(value.as_ref());
        if path.is_relative() {
            return Err(PathError::NotAbsolute(path.to_string()));
        }
        Ok(unsafe { Self::new_unchecked(path) })
    }

    pub fn from_std_path(path: &Path) -> Result<&Self, PathError> {
        let path = Utf8Path::from_path(path)
            .ok_or_else(|| PathError::InvalidUnicode(path.to_string_lossy().into_owned()))?;
        if path.is_relative() {
            return Err(PathError::NotAbsolute(path.to_string()));
        }
        Ok(unsafe { Self::new_unchecked(path) })
    }

    /// Callers must guarantee the path is absolute and system-delimited.
    pub(crate) unsafe fn new_unchecked(path: &Utf8Path) -> &Self {
        // Relies on the representation of AbsoluteSystemPath being just a
        // Utf8Path, the same way Utf8Path relies on just being a str.
        &*(path as *const Utf8Path as *const Self)
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.0
    }

    pub fn as_std_path(&self) -> &Path {
        self.0.as_std_path()
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn components(&self) -> Utf8Components<'_> {
        self.0.components()
    }

    pub fn ancestors(&self) -> impl Iterator<Item = &AbsoluteSystemPath> {
        self.0
            .ancestors()
            .map(|ancestor| unsafe { Self::new_unchecked(ancestor) })
    }

    pub fn parent(&self) -> Option<&AbsoluteSystemPath> {
        self.0
            .parent()
            .map(|p| unsafe { AbsoluteSystemPath::new_unchecked(p) })
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn extension(&self) -> Option<&str> {
        self.0.extension()
    }

    /// True when `other` is underneath (or equal to) `self`.
    pub fn contains(&self, other: &AbsoluteSystemPath) -> bool {
        other.0.starts_with(&self.0)
    }

    // intended for joining literals or obviously single-token strings
    pub fn join_component(&self, segment: &str) -> AbsoluteSystemPathBuf {
        debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
        AbsoluteSystemPathBuf(
            Utf8Path::from_path(self.0.as_std_path().join(segment).clean().as_path())
                .expect("joined utf8 paths are utf8")
                .to_owned(),
        )
    }

    // intended for joining a path composed of literals
    pub fn join_components(&self, segments: &[&str]) -> AbsoluteSystemPathBuf {
        debug_assert!(!segments
            .iter()
            .any(|segment| segment.contains(std::path::MAIN_SEPARATOR)));
        AbsoluteSystemPathBuf(
            Utf8Path::from_path(
                self.0
                    .as_std_path()
                    .join(segments.join(std::path::MAIN_SEPARATOR_STR))
                    .clean()
                    .as_path(),
            )
            .expect("joined utf8 paths are utf8")
            .to_owned(),
        )
    }

    /// Computes the anchored path of `path` relative to `self`. Fails with
    /// `NotParent` when the result would escape the anchor.
    pub fn anchor(&self, path: &AbsoluteSystemPath) -> Result<AnchoredSystemPathBuf, PathError> {
        AnchoredSystemPathBuf::new(self, path)
    }

    /// Joins an anchored path back onto this path.
    pub fn resolve(&self, path: impl AsRef<AnchoredSystemPath>) -> AbsoluteSystemPathBuf {
        let path = path.as_ref();
        if path.as_str().is_empty() {
            return self.to_owned();
        }
        AbsoluteSystemPathBuf(self.0.join(path.as_path()))
    }

    pub fn exists(&self) -> bool {
        self.0.as_std_path().exists()
    }

    pub fn create_dir_all(&self) -> Result<(), io::Error> {
        fs::create_dir_all(&self.0)
    }

    /// Ensures the parent directory of this path exists.
    pub fn ensure_dir(&self) -> Result<(), io::Error> {
        if let Some(parent) = self.0.parent() {
            fs::create_dir_all(parent)
        } else {
            Ok(())
        }
    }

    pub fn open(&self) -> Result<File, io::Error> {
        File::open(&self.0)
    }

    pub fn open_with_options(&self, open_options: OpenOptions) -> Result<File, io::Error> {
        open_options.open(&self.0)
    }

    pub fn read_to_string(&self) -> Result<String, io::Error> {
        fs::read_to_string(&self.0)
    }

    pub fn read(&self) -> Result<Vec<u8>, io::Error> {
        fs::read(&self.0)
    }

    pub fn create_with_contents(&self, contents: impl AsRef<[u8]>) -> Result<(), io::Error> {
        fs::write(&self.0, contents)
    }

    pub fn rename(&self, to: &AbsoluteSystemPath) -> Result<(), io::Error> {
        fs::rename(&self.0, &to.0)
    }

    pub fn remove_file(&self) -> Result<(), io::Error> {
        fs::remove_file(&self.0)
    }

    pub fn remove_dir_all(&self) -> Result<(), io::Error> {
        fs::remove_dir_all(&self.0)
    }

    // note that this is *not* lstat. If this is a symlink, it
    // will return metadata for the target.
    pub fn stat(&self) -> Result<Metadata, PathError> {
        Ok(fs::metadata(&self.0)?)
    }

    // The equivalent of lstat. Returns the metadata for this file,
    // even if it is a symlink.
    pub fn symlink_metadata(&self) -> Result<Metadata, PathError> {
        Ok(fs::symlink_metadata(&self.0)?)
    }

    pub fn read_link(&self) -> Result<PathBuf, io::Error> {
        fs::read_link(&self.0)
    }

    pub fn symlink_to_file<P: AsRef<Path>>(&self, to: P) -> Result<(), PathError> {
        #[cfg(not(windows))]
        std::os::unix::fs::symlink(to.as_ref(), &self.0)?;
        #[cfg(windows)]
        std::os::windows::fs::symlink_file(to.as_ref(), &self.0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_absolute_path() -> anyhow::Result<()> {
        #[cfg(unix)]
        {
            let absolute_path = AbsoluteSystemPath::new("/foo/bar")?;
            assert_eq!(absolute_path.to_string(), "/foo/bar");
            assert!(AbsoluteSystemPath::new("foo/bar").is_err());
        }

        #[cfg(windows)]
        {
            let absolute_path = AbsoluteSystemPath::new(r"C:\foo\bar")?;
            assert_eq!(absolute_path.to_string(), r"C:\foo\bar");
        }

        Ok(())
    }

    #[test]
    fn test_contains() {
        let root = AbsoluteSystemPath::new(if cfg!(windows) {
            r"C:\repo"
        } else {
            "/repo"
        })
        .unwrap();
        let inside = root.join_components(&["packages", "a"]);
        let outside = root.parent().unwrap().join_component("other");
        assert!(root.contains(&inside));
        assert!(!root.contains(&outside));
    }

    #[test]
    fn test_anchor_and_resolve_round_trip() {
        let root = AbsoluteSystemPath::new(if cfg!(windows) {
            r"C:\repo"
        } else {
            "/repo"
        })
        .unwrap();
        let file = root.join_components(&["packages", "a", "index.js"]);
        let anchored = root.anchor(&file).unwrap();
        assert_eq!(root.resolve(&anchored), file);
    }
}
