use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::debug;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use turborepo_pidlock::{Pidlock, PidlockError};

use crate::{
    cache_archive::{CacheReader, CacheWriter},
    CacheError, CacheHitMetadata, CacheSource,
};

/// On-disk cache tier. Artifacts live at `{hash}.tar.zst` with a sidecar
/// `{hash}-meta.json` carrying the originating duration.
pub struct FSCache {
    cache_directory: AbsoluteSystemPathBuf,
}

#[derive(Debug, Deserialize, Serialize)]
struct CacheMetadata {
    hash: String,
    duration: u64,
}

impl CacheMetadata {
    fn read(path: &AbsoluteSystemPath) -> Result<CacheMetadata, CacheError> {
        serde_json::from_str(&path.read_to_string()?).map_err(CacheError::InvalidMetadata)
    }
}

impl FSCache {
    fn resolve_cache_dir(
        repo_root: &AbsoluteSystemPath,
        cache_dir: &Utf8Path,
    ) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf::from_unknown(repo_root, cache_dir)
    }

    #[tracing::instrument(skip_all)]
    pub fn new(cache_dir: &Utf8Path, repo_root: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let cache_directory = Self::resolve_cache_dir(repo_root, cache_dir);
        debug!("FSCache resolved cache_directory={}", cache_directory);
        cache_directory.create_dir_all()?;

        Ok(FSCache { cache_directory })
    }

    #[tracing::instrument(skip_all)]
    pub fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let uncompressed_cache_path = self.cache_directory.join_component(&format!("{hash}.tar"));
        let compressed_cache_path = self
            .cache_directory
            .join_component(&format!("{hash}.tar.zst"));

        let cache_path = if uncompressed_cache_path.exists() {
            uncompressed_cache_path
        } else if compressed_cache_path.exists() {
            compressed_cache_path
        } else {
            debug!(
                "FSCache::fetch cache miss for hash {} in {}",
                hash, self.cache_directory
            );
            return Ok(None);
        };

        let mut cache_reader = CacheReader::open(&cache_path)?;
        let restored_files = cache_reader.restore(anchor)?;

        let meta = CacheMetadata::read(
            &self
                .cache_directory
                .join_component(&format!("{hash}-meta.json")),
        )?;

        Ok(Some((
            CacheHitMetadata {
                time_saved: meta.duration,
                source: CacheSource::Local,
            },
            restored_files,
        )))
    }

    #[tracing::instrument(skip_all)]
    pub(crate) fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        let uncompressed_exists = self
            .cache_directory
            .join_component(&format!("{hash}.tar"))
            .exists();
        let compressed_exists = self
            .cache_directory
            .join_component(&format!("{hash}.tar.zst"))
            .exists();

        if !uncompressed_exists && !compressed_exists {
            return Ok(None);
        }

        let duration = CacheMetadata::read(
            &self
                .cache_directory
                .join_component(&format!("{hash}-meta.json")),
        )
        .map(|meta| meta.duration)
        .unwrap_or(0);

        Ok(Some(CacheHitMetadata {
            time_saved: duration,
            source: CacheSource::Local,
        }))
    }

    /// Removes the artifact and metadata for a fingerprint. Used when a
    /// local entry turns out to be corrupt.
    pub(crate) fn evict(&self, hash: &str) {
        for name in [
            format!("{hash}.tar"),
            format!("{hash}.tar.zst"),
            format!("{hash}-meta.json"),
        ] {
            let path = self.cache_directory.join_component(&name);
            if path.exists() {
                let _ = path.remove_file();
            }
        }
    }

    #[tracing::instrument(skip_all)]
    pub fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        // Advisory per-fingerprint lock so two invocations on the same
        // machine never archive the same fingerprint concurrently. Losing
        // the race is fine: the other holder is writing identical content.
        let lock_path = self.cache_directory.join_component(&format!("{hash}.lock"));
        let mut lock = Pidlock::new(lock_path.as_std_path().to_owned());
        match lock.acquire() {
            Ok(()) => {}
            Err(PidlockError::AlreadyOwned | PidlockError::LockExists(_)) => {
                debug!("fingerprint {hash} is being written by another process, skipping");
                return Ok(());
            }
            Err(e) => {
                debug!("unable to take cache lock for {hash}: {e}, writing anyway");
            }
        }

        let cache_path = self
            .cache_directory
            .join_component(&format!("{hash}.tar.zst"));

        let mut cache_item = CacheWriter::create(&cache_path)?;
        for file in files {
            cache_item.add_file(anchor, file)?;
        }
        // Atomic rename from temp to final path.
        cache_item.finish()?;

        let metadata_path = self
            .cache_directory
            .join_component(&format!("{hash}-meta.json"));

        let meta = CacheMetadata {
            hash: hash.to_string(),
            duration,
        };

        let meta_json = serde_json::to_string(&meta).map_err(CacheError::MetadataWriteFailure)?;

        // Same write-to-temp-then-rename pattern as the tarball.
        let temp_metadata_path = self
            .cache_directory
            .join_component(&format!(".{hash}-meta.json.{}.tmp", std::process::id()));

        temp_metadata_path.create_with_contents(&meta_json)?;
        temp_metadata_path.rename(&metadata_path)?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use camino::Utf8Path;
    use tempfile::tempdir;
    use turbopath::AnchoredSystemPath;

    use super::*;

    fn setup_repo() -> Result<(tempfile::TempDir, AbsoluteSystemPathBuf)> {
        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPathBuf::try_from(repo_root.path())?;
        let dist = repo_root_path.join_components(&["dist", "index.js"]);
        dist.ensure_dir()?;
        dist.create_with_contents("built output")?;
        Ok((repo_root, repo_root_path))
    }

    #[test]
    fn test_fetch_miss_then_hit() -> Result<()> {
        let (_tmp, repo_root) = setup_repo()?;
        let cache = FSCache::new(Utf8Path::new(""), &repo_root)?;

        assert!(cache.fetch(&repo_root, "0123456789abcdef")?.is_none());

        let files = vec![
            AnchoredSystemPathBuf::from_raw("dist")?,
            AnchoredSystemPathBuf::from_raw("dist/index.js")?,
        ];
        cache.put(&repo_root, "0123456789abcdef", &files, 40)?;

        let (status, restored) = cache.fetch(&repo_root, "0123456789abcdef")?.unwrap();
        assert_eq!(
            status,
            CacheHitMetadata {
                time_saved: 40,
                source: CacheSource::Local
            }
        );
        assert_eq!(restored.len(), files.len());
        for (expected, actual) in files.iter().zip(restored.iter()) {
            let actual: &AnchoredSystemPath = actual;
            assert_eq!(&**expected, actual);
        }
        Ok(())
    }

    #[test]
    fn test_exists_does_not_materialize() -> Result<()> {
        let (_tmp, repo_root) = setup_repo()?;
        let cache = FSCache::new(Utf8Path::new("cache"), &repo_root)?;

        assert!(cache.exists("beef")?.is_none());

        let files = vec![AnchoredSystemPathBuf::from_raw("dist/index.js")?];
        cache.put(&repo_root, "beef", &files, 10)?;

        // remove the restored target to prove exists() doesn't write
        let probe = cache.exists("beef")?;
        assert_eq!(
            probe,
            Some(CacheHitMetadata {
                time_saved: 10,
                source: CacheSource::Local
            })
        );
        Ok(())
    }

    #[test]
    fn test_corrupt_entry_fetch_errors_and_evict_clears() -> Result<()> {
        let (_tmp, repo_root) = setup_repo()?;
        let cache = FSCache::new(Utf8Path::new("cache"), &repo_root)?;

        let artifact = cache
            .cache_directory
            .join_component("corrupt.tar.zst");
        artifact.create_with_contents("not a zstd stream")?;

        assert!(cache.fetch(&repo_root, "corrupt").is_err());

        cache.evict("corrupt");
        assert!(cache.fetch(&repo_root, "corrupt")?.is_none());
        Ok(())
    }

    #[test]
    fn test_concurrent_writes_same_hash() -> Result<()> {
        let (_tmp, repo_root) = setup_repo()?;
        let files = vec![AnchoredSystemPathBuf::from_raw("dist/index.js")?];

        let caches: Vec<_> = (0..3)
            .map(|_| FSCache::new(Utf8Path::new("cache"), &repo_root))
            .collect::<Result<_, _>>()?;

        std::thread::scope(|scope| {
            for cache in &caches {
                let files = files.clone();
                let repo_root = repo_root.clone();
                scope.spawn(move || cache.put(&repo_root, "samehash", &files, 7));
            }
        });

        // the cache must be readable afterwards, with no leftover temp
        // files or locks
        let cache = FSCache::new(Utf8Path::new("cache"), &repo_root)?;
        assert!(cache.fetch(&repo_root, "samehash")?.is_some());

        let cache_dir = repo_root.join_component("cache");
        let leftovers: Vec<_> = std::fs::read_dir(cache_dir.as_std_path())?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp") || name.ends_with(".lock"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
        Ok(())
    }
}
