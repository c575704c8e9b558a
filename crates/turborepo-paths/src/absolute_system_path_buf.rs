use std::{borrow::Borrow, fmt, ops::Deref, path::Path};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::{from_slash, AbsoluteSystemPath, PathError};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct AbsoluteSystemPathBuf(pub(crate) Utf8PathBuf);

impl AbsoluteSystemPathBuf {
    /// Creates a new `AbsoluteSystemPathBuf`, converting `/` delimited
    /// input to the system separator first. Errors if the path is not
    /// absolute.
    pub fn new(unchecked_path: impl Into<String>) -> Result<Self, PathError> {
        let raw: String = unchecked_path.into();
        let system = Utf8PathBuf::from(from_slash(&raw));
        if system.is_relative() {
            return Err(PathError::NotAbsolute(raw));
        }
        Ok(Self(system))
    }

    /// Anchors `unknown` at `base` if it is relative, otherwise validates
    /// it as absolute. Used for user-supplied config values like
    /// `--cache-dir`.
    pub fn from_unknown(base: &AbsoluteSystemPath, unknown: impl AsRef<Utf8Path>) -> Self {
        let unknown = unknown.as_ref();
        if unknown.is_absolute() {
            Self(unknown.to_owned())
        } else {
            Self(
                Utf8PathBuf::from_path_buf(
                    path_clean::clean(base.as_std_path().join(unknown.as_std_path())),
                )
                .expect("clean of utf8 path is utf8"),
            )
        }
    }

    pub fn cwd() -> Result<Self, PathError> {
        let cwd = std::env::current_dir()?;
        let cwd = Utf8PathBuf::from_path_buf(cwd)
            .map_err(|p| PathError::InvalidUnicode(p.to_string_lossy().into_owned()))?;
        Ok(Self(cwd))
    }

    pub fn as_absolute_path(&self) -> &AbsoluteSystemPath {
        self
    }

    pub fn into_inner(self) -> Utf8PathBuf {
        self.0
    }
}

impl TryFrom<&str> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&Path> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &Path) -> Result<Self, Self::Error> {
        let utf8 = value
            .to_str()
            .ok_or_else(|| PathError::InvalidUnicode(value.to_string_lossy().into_owned()))?;
        Self::new(utf8)
    }
}

impl Deref for AbsoluteSystemPathBuf {
    type Target = AbsoluteSystemPath;

    fn deref(&self) -> &Self::Target {
        unsafe { AbsoluteSystemPath::new_unchecked(self.0.as_path()) }
    }
}

impl Borrow<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn borrow(&self) -> &AbsoluteSystemPath {
        self
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self
    }
}

impl AsRef<Path> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}

impl fmt::Display for AbsoluteSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_input_is_rejected() {
        assert!(AbsoluteSystemPathBuf::new("some/dir").is_err());
    }

    #[test]
    fn test_from_unknown() {
        let base = AbsoluteSystemPathBuf::new(if cfg!(windows) { r"C:\repo" } else { "/repo" })
            .unwrap();
        let relative = AbsoluteSystemPathBuf::from_unknown(&base, ".turbo/cache");
        assert_eq!(relative, base.join_components(&[".turbo", "cache"]));

        let absolute = AbsoluteSystemPathBuf::from_unknown(&base, base.as_path());
        assert_eq!(absolute, base);
    }
}
