use std::{io::Read, path::Component};

use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};

use crate::CacheError;

pub struct CacheReader<'a> {
    reader: Box<dyn Read + 'a>,
}

impl<'a> CacheReader<'a> {
    pub fn from_reader(reader: impl Read + 'a, is_compressed: bool) -> Result<Self, CacheError> {
        let reader: Box<dyn Read> = if is_compressed {
            Box::new(zstd::Decoder::new(reader)?)
        } else {
            Box::new(reader)
        };

        Ok(CacheReader { reader })
    }

    pub fn open(path: &AbsoluteSystemPath) -> Result<CacheReader<'static>, CacheError> {
        let file = path.open()?;
        let is_compressed = path.extension() == Some("zst");

        let reader: Box<dyn Read> = if is_compressed {
            Box::new(zstd::Decoder::new(file)?)
        } else {
            Box::new(file)
        };

        Ok(CacheReader { reader })
    }

    /// Restores every entry under `anchor`, returning the anchored paths
    /// that were written. Entries that would land outside the anchor are
    /// rejected.
    pub fn restore(
        &mut self,
        anchor: &AbsoluteSystemPath,
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        let mut restored = Vec::new();
        anchor.create_dir_all()?;

        let mut tr = tar::Archive::new(&mut self.reader);

        // Symlinks whose targets don't exist yet are deferred: entries are
        // written depth-first, so a link can precede the file it points
        // at. We retry the deferred set until it stops shrinking; if it
        // stops shrinking while non-empty the links either chain to
        // nothing or form a cycle.
        let mut deferred_symlinks: Vec<(AnchoredSystemPathBuf, String)> = Vec::new();

        for entry in tr.entries()? {
            let mut entry = entry?;
            let anchored = {
                let entry_path = entry.path()?;
                checked_entry_path(&entry_path)?
            };

            match entry.header().entry_type() {
                tar::EntryType::Directory => {
                    let target = anchor.resolve(&anchored);
                    target.create_dir_all()?;
                    restored.push(anchored);
                }
                tar::EntryType::Regular => {
                    let target = anchor.resolve(&anchored);
                    target.ensure_dir()?;
                    let mut options = std::fs::OpenOptions::new();
                    options.write(true).create(true).truncate(true);
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::OpenOptionsExt;
                        if let Ok(mode) = entry.header().mode() {
                            options.mode(mode);
                        }
                    }
                    let mut file = target.open_with_options(options)?;
                    std::io::copy(&mut entry, &mut file)?;
                    restored.push(anchored);
                }
                tar::EntryType::Symlink => {
                    let linkname = entry
                        .header()
                        .link_name()?
                        .ok_or_else(|| CacheError::InvalidFilePath(anchored.to_string()))?;
                    let linkname = linkname.to_string_lossy().into_owned();
                    match restore_symlink(anchor, &anchored, &linkname) {
                        Ok(()) => restored.push(anchored),
                        Err(CacheError::LinkTargetDoesNotExist(_)) => {
                            deferred_symlinks.push((anchored, linkname));
                        }
                        Err(e) => return Err(e),
                    }
                }
                ty => return Err(CacheError::RestoreUnsupportedFileType(ty)),
            }
        }

        while !deferred_symlinks.is_empty() {
            let before = deferred_symlinks.len();
            let mut still_deferred = Vec::new();
            for (anchored, linkname) in deferred_symlinks {
                match restore_symlink(anchor, &anchored, &linkname) {
                    Ok(()) => restored.push(anchored),
                    Err(CacheError::LinkTargetDoesNotExist(_)) => {
                        still_deferred.push((anchored, linkname));
                    }
                    Err(e) => return Err(e),
                }
            }
            if still_deferred.len() == before {
                // no progress: mutually-referencing links
                return Err(CacheError::CycleDetected);
            }
            deferred_symlinks = still_deferred;
        }

        Ok(restored)
    }
}

/// Validates a tar entry path: it must be relative and must not traverse
/// upward out of the anchor.
fn checked_entry_path(entry_path: &std::path::Path) -> Result<AnchoredSystemPathBuf, CacheError> {
    for component in entry_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(CacheError::InvalidFilePath(
                    entry_path.to_string_lossy().into_owned(),
                ));
            }
            _ => {}
        }
    }
    AnchoredSystemPathBuf::from_system_path(entry_path)
        .map_err(|_| CacheError::InvalidFilePath(entry_path.to_string_lossy().into_owned()))
}

fn restore_symlink(
    anchor: &AbsoluteSystemPath,
    anchored: &AnchoredSystemPathBuf,
    linkname: &str,
) -> Result<(), CacheError> {
    let link_path = anchor.resolve(anchored);
    link_path.ensure_dir()?;

    // The canonical target (link directory + linkname) must stay inside
    // the anchor, even via `..` hops.
    let link_dir = link_path.parent().expect("links have parent directories");
    let resolved = AbsoluteSystemPathBuf::from_unknown(link_dir, linkname);
    if !anchor.contains(&resolved) {
        return Err(CacheError::LinkOutsideOfDirectory(linkname.to_string()));
    }

    if !resolved.exists() {
        return Err(CacheError::LinkTargetDoesNotExist(linkname.to_string()));
    }

    // Replace any stale link from a previous restore.
    if link_path.symlink_metadata().is_ok() {
        link_path.remove_file()?;
    }
    link_path.symlink_to_file(linkname)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::tempdir;
    use turbopath::AnchoredSystemPathBuf;

    use super::*;
    use crate::cache_archive::CacheWriter;

    fn make_tar(entries: &[(&str, Option<&str>)]) -> Vec<u8> {
        // (path, Some(contents)) = regular file, (path, None) = directory
        let mut body = Vec::new();
        let mut builder = tar::Builder::new(&mut body);
        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            let name = header.as_old_mut().name.as_mut();
            let path_bytes = path.as_bytes();
            name[..path_bytes.len()].copy_from_slice(path_bytes);
            match contents {
                Some(contents) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(contents.len() as u64);
                    header.set_cksum();
                    builder.append(&header, contents.as_bytes()).unwrap();
                }
                None => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, std::io::empty()).unwrap();
                }
            }
        }
        builder.finish().unwrap();
        drop(builder);
        body
    }

    #[test]
    fn test_path_traversal_is_rejected() {
        let dir = tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();

        let body = make_tar(&[("../escape.txt", Some("gotcha"))]);
        let mut reader = CacheReader::from_reader(body.as_slice(), false).unwrap();
        let err = reader.restore(&root).unwrap_err();
        assert!(matches!(err, CacheError::InvalidFilePath(_)), "{err}");
    }

    #[test]
    fn test_corrupt_archive_is_an_error() {
        let dir = tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();

        let garbage = b"definitely not a tarball".to_vec();
        let mut reader = CacheReader::from_reader(garbage.as_slice(), false).unwrap();
        assert!(reader.restore(&root).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_round_trip() -> Result<()> {
        let src_dir = tempdir()?;
        let src_root = AbsoluteSystemPathBuf::try_from(src_dir.path())?;
        let file = src_root.join_component("real.txt");
        file.create_with_contents("real contents")?;
        let link = src_root.join_component("link.txt");
        link.symlink_to_file("real.txt")?;

        let archive_path = src_root.join_component("archive.tar");
        let mut writer = CacheWriter::create(&archive_path)?;
        // link first: restore must defer it until real.txt exists
        writer.add_file(&src_root, &AnchoredSystemPathBuf::from_raw("link.txt")?)?;
        writer.add_file(&src_root, &AnchoredSystemPathBuf::from_raw("real.txt")?)?;
        writer.finish()?;

        let dst_dir = tempdir()?;
        let dst_root = AbsoluteSystemPathBuf::try_from(dst_dir.path())?;
        let mut reader = CacheReader::open(&archive_path)?;
        let restored = reader.restore(&dst_root)?;
        assert_eq!(restored.len(), 2);

        let restored_link = dst_root.join_component("link.txt");
        assert_eq!(restored_link.read_to_string()?, "real contents");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escaping_anchor_is_rejected() -> Result<()> {
        let src_dir = tempdir()?;
        let src_root = AbsoluteSystemPathBuf::try_from(src_dir.path())?;

        let mut body = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut body);
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            builder.append_link(&mut header, "evil-link", "../../etc/passwd")?;
            builder.finish()?;
        }

        let mut reader = CacheReader::from_reader(body.as_slice(), false)?;
        let err = reader.restore(&src_root).unwrap_err();
        assert!(matches!(err, CacheError::LinkOutsideOfDirectory(_)), "{err}");
        Ok(())
    }
}
