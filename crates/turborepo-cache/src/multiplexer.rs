use tracing::{debug, warn};
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use turborepo_api_client::{APIAuth, APIClient};

use crate::{fs::FSCache, http::HTTPCache, CacheError, CacheHitMetadata, CacheOpts};

pub struct CacheMultiplexer {
    fs: Option<FSCache>,
    http: Option<HTTPCache>,
    remote_read_only: bool,
}

impl CacheMultiplexer {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        api_client: Option<APIClient>,
        api_auth: Option<APIAuth>,
    ) -> Result<Self, CacheError> {
        let use_fs_cache = !opts.skip_filesystem;
        let use_http_cache = !opts.skip_remote;

        // These two flags are not mutually exclusive, so it is possible to
        // configure yourself out of having a cache at all. Warn rather
        // than fail the build over it.
        if !use_fs_cache && !use_http_cache {
            warn!("no caches are enabled");
        }

        let fs_cache = use_fs_cache
            .then(|| FSCache::new(&opts.cache_dir, repo_root))
            .transpose()?;

        let http_cache = match (use_http_cache, api_client, api_auth) {
            (true, Some(client), Some(auth)) if auth.is_linked() => {
                Some(HTTPCache::new(client, opts, repo_root.to_owned(), auth))
            }
            _ => None,
        };

        Ok(CacheMultiplexer {
            fs: fs_cache,
            http: http_cache,
            remote_read_only: opts.remote_cache_read_only,
        })
    }

    #[tracing::instrument(skip_all)]
    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        key: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        if let Some(fs) = &self.fs {
            fs.put(anchor, key, files, duration)?;
        }

        if self.remote_read_only {
            return Ok(());
        }

        if let Some(http) = &self.http {
            // Remote write failures never fail the task; the artifact is
            // already on disk locally.
            if let Err(err) = http.put(anchor, key, files, duration).await {
                warn!("failed to put to remote cache: {err}");
            }
        }

        Ok(())
    }

    /// Local tier first; a local miss (or a corrupt local entry, which
    /// gets evicted) falls through to the remote tier, whose artifacts are
    /// written back to the local tier.
    #[tracing::instrument(skip_all)]
    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        key: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        if let Some(fs) = &self.fs {
            match fs.fetch(anchor, key) {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => {}
                Err(err) => {
                    warn!("local cache entry for {key} is unusable: {err}, evicting");
                    fs.evict(key);
                }
            }
        }

        if let Some(http) = &self.http {
            match http.fetch(key).await {
                Ok(Some((hit, files))) => {
                    // Write-through: the restored files are on disk, so the
                    // local tier can archive them for next time.
                    if let Some(fs) = &self.fs {
                        if let Err(err) = fs.put(anchor, key, &files, hit.time_saved) {
                            warn!("failed to write remote hit through to local cache: {err}");
                        }
                    }
                    return Ok(Some((hit, files)));
                }
                Ok(None) => {}
                Err(err) if err.is_corrupt() => return Err(err),
                Err(err) => {
                    // Transport problems degrade to a miss.
                    debug!("remote cache fetch for {key} failed: {err}");
                }
            }
        }

        Ok(None)
    }

    #[tracing::instrument(skip_all)]
    pub async fn exists(&self, key: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        if let Some(fs) = &self.fs {
            if let Some(hit) = fs.exists(key)? {
                return Ok(Some(hit));
            }
        }

        if let Some(http) = &self.http {
            match http.exists(key).await {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => {}
                Err(err) => debug!("remote cache probe for {key} failed: {err}"),
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;

    #[tokio::test]
    async fn test_local_only_round_trip() -> Result<()> {
        let repo = tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(repo.path())?;
        let out = repo_root.join_component("out.txt");
        out.create_with_contents("output")?;

        let opts = CacheOpts {
            skip_remote: true,
            ..CacheOpts::default()
        };
        let cache = CacheMultiplexer::new(&opts, &repo_root, None, None)?;

        let files = vec![turbopath::AnchoredSystemPathBuf::from_raw("out.txt")?];
        cache.put(&repo_root, "cafe", &files, 12).await?;

        let hit = cache.fetch(&repo_root, "cafe").await?;
        assert!(hit.is_some());
        assert!(cache.exists("cafe").await?.is_some());
        assert!(cache.fetch(&repo_root, "not-there").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_local_entry_is_evicted() -> Result<()> {
        let repo = tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(repo.path())?;

        let opts = CacheOpts {
            skip_remote: true,
            ..CacheOpts::default()
        };
        let cache = CacheMultiplexer::new(&opts, &repo_root, None, None)?;

        // plant a corrupt artifact
        let artifact = repo_root.join_components(&[".turbo", "cache", "bad.tar.zst"]);
        artifact.ensure_dir()?;
        artifact.create_with_contents("garbage")?;

        // corrupt entries read as a miss, and the entry is gone afterwards
        assert!(cache.fetch(&repo_root, "bad").await?.is_none());
        assert!(!artifact.exists());
        Ok(())
    }
}
