use futures::{stream::FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::warn;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use turborepo_api_client::{APIAuth, APIClient};

use crate::{multiplexer::CacheMultiplexer, CacheError, CacheHitMetadata, CacheOpts};

const WARNING_CUTOFF: u8 = 4;

/// A cache whose writes happen in the background on a bounded worker
/// pool. Reads go straight to the underlying tiers; `shutdown` drains
/// every queued write before returning so a run never exits with uploads
/// silently in flight.
#[derive(Clone)]
pub struct AsyncCache {
    real_cache: Arc<CacheMultiplexer>,
    writer_sender: mpsc::Sender<WorkerRequest>,
}

enum WorkerRequest {
    WriteRequest {
        anchor: AbsoluteSystemPathBuf,
        key: String,
        duration: u64,
        files: Vec<AnchoredSystemPathBuf>,
    },
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

impl AsyncCache {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        api_client: Option<APIClient>,
        api_auth: Option<APIAuth>,
    ) -> Result<AsyncCache, CacheError> {
        let max_workers = opts.workers.max(1) as usize;
        let real_cache = Arc::new(CacheMultiplexer::new(
            opts, repo_root, api_client, api_auth,
        )?);
        let (writer_sender, mut write_consumer) = mpsc::channel(1);

        // The consumer task owns the queue; individual writes run as
        // spawned tasks gated by the semaphore so at most `max_workers`
        // archive/upload at once.
        let worker_real_cache = real_cache.clone();
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(max_workers));
            let mut workers = FuturesUnordered::new();
            let mut warnings_emitted: u8 = 0;
            let mut shutdown_callback: Option<oneshot::Sender<()>> = None;

            while let Some(request) = write_consumer.recv().await {
                match request {
                    WorkerRequest::WriteRequest {
                        anchor,
                        key,
                        duration,
                        files,
                    } => {
                        let semaphore = semaphore.clone();
                        let real_cache = worker_real_cache.clone();
                        workers.push(tokio::spawn(async move {
                            let _permit = semaphore
                                .acquire()
                                .await
                                .expect("cache write semaphore closed");
                            real_cache.put(&anchor, &key, &files, duration).await
                        }));
                    }
                    WorkerRequest::Flush(callback) => {
                        while let Some(result) = workers.next().await {
                            if let Ok(Err(err)) = result {
                                if warnings_emitted < WARNING_CUTOFF {
                                    warnings_emitted += 1;
                                    warn!("cache write failed: {err}");
                                }
                            }
                        }
                        callback.send(()).ok();
                    }
                    WorkerRequest::Shutdown(callback) => {
                        shutdown_callback = Some(callback);
                        break;
                    }
                }
            }

            while let Some(result) = workers.next().await {
                if let Ok(Err(err)) = result {
                    warn!("cache write failed: {err}");
                }
            }
            if let Some(callback) = shutdown_callback {
                callback.send(()).ok();
            }
        });

        Ok(AsyncCache {
            real_cache,
            writer_sender,
        })
    }

    #[tracing::instrument(skip_all)]
    pub async fn put(
        &self,
        anchor: AbsoluteSystemPathBuf,
        key: String,
        files: Vec<AnchoredSystemPathBuf>,
        duration: u64,
    ) -> Result<(), CacheError> {
        self.writer_sender
            .send(WorkerRequest::WriteRequest {
                anchor,
                key,
                duration,
                files,
            })
            .await
            .map_err(|_| CacheError::CacheShuttingDown)
    }

    #[tracing::instrument(skip_all)]
    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        key: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        self.real_cache.fetch(anchor, key).await
    }

    #[tracing::instrument(skip_all)]
    pub async fn exists(&self, key: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        self.real_cache.exists(key).await
    }

    /// Waits for every queued write to land without closing the cache.
    #[tracing::instrument(skip_all)]
    pub async fn wait(&self) -> Result<(), CacheError> {
        let (tx, rx) = oneshot::channel();
        self.writer_sender
            .send(WorkerRequest::Flush(tx))
            .await
            .map_err(|_| CacheError::CacheShuttingDown)?;
        rx.await.ok();
        Ok(())
    }

    /// Flushes queued writes and closes the cache; later puts fail with
    /// `CacheShuttingDown`.
    #[tracing::instrument(skip_all)]
    pub async fn shutdown(&self) -> Result<(), CacheError> {
        let (tx, rx) = oneshot::channel();
        self.writer_sender
            .send(WorkerRequest::Shutdown(tx))
            .await
            .map_err(|_| CacheError::CacheShuttingDown)?;
        rx.await.ok();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_writes_visible_after_wait() -> Result<()> {
        let repo = tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(repo.path())?;
        let out = repo_root.join_component("out.txt");
        out.create_with_contents("output")?;

        let opts = CacheOpts {
            skip_remote: true,
            ..CacheOpts::default()
        };
        let cache = AsyncCache::new(&opts, &repo_root, None, None)?;

        cache
            .put(
                repo_root.clone(),
                "abcd".into(),
                vec![AnchoredSystemPathBuf::from_raw("out.txt")?],
                3,
            )
            .await?;
        cache.wait().await?;

        assert!(cache.exists("abcd").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_put_after_shutdown_fails() -> Result<()> {
        let repo = tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(repo.path())?;

        let opts = CacheOpts {
            skip_remote: true,
            ..CacheOpts::default()
        };
        let cache = AsyncCache::new(&opts, &repo_root, None, None)?;
        cache.shutdown().await?;

        let result = cache
            .put(repo_root.clone(), "abcd".into(), Vec::new(), 0)
            .await;
        assert!(matches!(result, Err(CacheError::CacheShuttingDown)));
        Ok(())
    }
}
