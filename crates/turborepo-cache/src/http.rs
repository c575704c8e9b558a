use std::io::Write;

use tracing::debug;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use turborepo_api_client::{APIAuth, APIClient, Response};

use crate::{
    cache_archive::{CacheReader, CacheWriter},
    signature_authentication::ArtifactSignatureAuthenticator,
    CacheError, CacheHitMetadata, CacheOpts, CacheSource,
};

pub struct HTTPCache {
    client: APIClient,
    signer_verifier: Option<ArtifactSignatureAuthenticator>,
    repo_root: AbsoluteSystemPathBuf,
    api_auth: APIAuth,
}

impl HTTPCache {
    #[tracing::instrument(skip_all)]
    pub fn new(
        client: APIClient,
        opts: &CacheOpts,
        repo_root: AbsoluteSystemPathBuf,
        api_auth: APIAuth,
    ) -> HTTPCache {
        let signer_verifier = if opts
            .remote_cache_opts
            .as_ref()
            .is_some_and(|remote_cache_opts| remote_cache_opts.signature)
        {
            Some(ArtifactSignatureAuthenticator::new(
                api_auth
                    .team_id
                    .as_deref()
                    .unwrap_or_default()
                    .as_bytes()
                    .to_vec(),
                None,
            ))
        } else {
            None
        };

        HTTPCache {
            client,
            signer_verifier,
            repo_root,
            api_auth,
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let mut artifact_body = Vec::new();
        self.write(&mut artifact_body, anchor, files)?;

        let tag = self
            .signer_verifier
            .as_ref()
            .map(|signer| signer.generate_tag(hash.as_bytes(), &artifact_body))
            .transpose()?;

        debug!("uploading {}", hash);

        self.client
            .put_artifact(hash, artifact_body, duration, tag.as_deref(), &self.api_auth)
            .await
            .map_err(|err| Self::convert_api_error(hash, err))?;

        debug!("uploaded {}", hash);
        Ok(())
    }

    fn write(
        &self,
        writer: impl Write,
        anchor: &AbsoluteSystemPath,
        files: &[AnchoredSystemPathBuf],
    ) -> Result<(), CacheError> {
        let mut cache_archive = CacheWriter::from_writer(writer, true)?;
        for file in files {
            cache_archive.add_file(anchor, file)?;
        }

        Ok(())
    }

    #[tracing::instrument(skip_all)]
    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        let Some(response) = self
            .client
            .artifact_exists(hash, &self.api_auth)
            .await
            .map_err(|err| Self::convert_api_error(hash, err))?
        else {
            return Ok(None);
        };

        let duration = Self::get_duration_from_response(&response)?;

        Ok(Some(CacheHitMetadata {
            source: CacheSource::Remote,
            time_saved: duration,
        }))
    }

    fn get_duration_from_response(response: &Response) -> Result<u64, CacheError> {
        if let Some(duration_value) = response.headers().get("x-artifact-duration") {
            let duration = duration_value
                .to_str()
                .map_err(|_| CacheError::InvalidDuration)?;

            duration
                .parse::<u64>()
                .map_err(|_| CacheError::InvalidDuration)
        } else {
            Ok(0)
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn fetch(
        &self,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let Some(response) = self
            .client
            .fetch_artifact(hash, &self.api_auth)
            .await
            .map_err(|err| Self::convert_api_error(hash, err))?
        else {
            return Ok(None);
        };

        let duration = Self::get_duration_from_response(&response)?;

        let body = if let Some(signer_verifier) = &self.signer_verifier {
            let expected_tag = response
                .headers()
                .get("x-artifact-tag")
                .ok_or(CacheError::ArtifactTagMissing)?;

            let expected_tag = expected_tag
                .to_str()
                .map_err(|_| CacheError::InvalidTag)?
                .to_string();

            let body = response
                .bytes()
                .await
                .map_err(|e| CacheError::ApiClientError(Box::new(e.into())))?;
            let is_valid = signer_verifier.validate(hash.as_bytes(), &body, &expected_tag)?;

            if !is_valid {
                return Err(CacheError::InvalidTag);
            }

            body
        } else {
            response
                .bytes()
                .await
                .map_err(|e| CacheError::ApiClientError(Box::new(e.into())))?
        };

        let files = Self::restore_tar(&self.repo_root, &body)?;

        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Remote,
                time_saved: duration,
            },
            files,
        )))
    }

    #[tracing::instrument(skip_all)]
    pub(crate) fn restore_tar(
        root: &AbsoluteSystemPath,
        body: &[u8],
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        let mut cache_reader = CacheReader::from_reader(body, true)?;
        cache_reader.restore(root)
    }

    fn convert_api_error(hash: &str, err: turborepo_api_client::Error) -> CacheError {
        if err.is_timeout() {
            CacheError::TimeoutError(hash.to_string())
        } else if err.is_connect() {
            CacheError::ConnectError
        } else {
            err.into()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        // a reqwest timeout can't be synthesized cheaply; exercise the
        // status-based branch instead
        let err = HTTPCache::convert_api_error(
            "hash",
            turborepo_api_client::Error::UnknownStatus {
                code: "forbidden".into(),
                message: "Not authorized".into(),
            },
        );
        assert_eq!(
            err.to_string(),
            "failed to contact remote cache: Unknown status forbidden: Not authorized"
        );
    }
}
