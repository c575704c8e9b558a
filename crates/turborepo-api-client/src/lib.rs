#![deny(clippy::all)]

//! HTTP client for the remote artifact cache.
//!
//! A thin wrapper over reqwest that knows the artifact endpoints, the
//! auth header, and the team scoping query params. Everything else about
//! remote caching (tags, fallbacks, write-through) lives in
//! `turborepo-cache`.

use std::time::Duration;

pub use reqwest::Response;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error making HTTP request: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("Unable to parse API url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unknown status {code}: {message}")]
    UnknownStatus { code: String, message: String },
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ReqwestError(e) if e.is_timeout())
    }

    pub fn is_connect(&self) -> bool {
        matches!(self, Error::ReqwestError(e) if e.is_connect())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct APIAuth {
    pub team_id: Option<String>,
    pub token: String,
    pub team_slug: Option<String>,
}

impl APIAuth {
    /// The cache endpoints require either a team id or a team slug next
    /// to the token.
    pub fn is_linked(&self) -> bool {
        self.team_id.is_some() || self.team_slug.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct APIClient {
    client: reqwest::Client,
    base_url: String,
}

impl APIClient {
    pub fn new(
        base_url: impl AsRef<str>,
        timeout: Option<Duration>,
        version: &str,
    ) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(format!("turbo {version}"))
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()?;

        Ok(APIClient {
            client,
            base_url: base_url.as_ref().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn artifact_url(&self, hash: &str, auth: &APIAuth) -> Result<Url, Error> {
        let mut url = Url::parse(&format!("{}/v8/artifacts/{}", self.base_url, hash))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(team_id) = auth.team_id.as_deref() {
                query.append_pair("teamId", team_id);
            }
            if let Some(team_slug) = auth.team_slug.as_deref() {
                query.append_pair("slug", team_slug);
            }
        }
        Ok(url)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn put_artifact(
        &self,
        hash: &str,
        artifact_body: Vec<u8>,
        duration: u64,
        tag: Option<&str>,
        auth: &APIAuth,
    ) -> Result<(), Error> {
        let url = self.artifact_url(hash, auth)?;
        let mut request = self
            .client
            .put(url)
            .header("Content-Type", "application/octet-stream")
            .header("x-artifact-duration", duration.to_string())
            .bearer_auth(&auth.token)
            .body(artifact_body);

        if let Some(tag) = tag {
            request = request.header("x-artifact-tag", tag);
        }

        let response = request.send().await?;
        Self::handle_status(response).await?;
        Ok(())
    }

    /// Fetches an artifact. `None` means the cache doesn't have it.
    pub async fn fetch_artifact(
        &self,
        hash: &str,
        auth: &APIAuth,
    ) -> Result<Option<Response>, Error> {
        let url = self.artifact_url(hash, auth)?;
        let response = self.client.get(url).bearer_auth(&auth.token).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::handle_status(response).await?))
    }

    /// Existence probe. Doesn't download the artifact body.
    pub async fn artifact_exists(
        &self,
        hash: &str,
        auth: &APIAuth,
    ) -> Result<Option<Response>, Error> {
        let url = self.artifact_url(hash, auth)?;
        let response = self.client.head(url).bearer_auth(&auth.token).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::handle_status(response).await?))
    }

    async fn handle_status(response: Response) -> Result<Response, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let code = match status {
            reqwest::StatusCode::FORBIDDEN | reqwest::StatusCode::UNAUTHORIZED => {
                "forbidden".to_string()
            }
            status => status.as_u16().to_string(),
        };
        let message = response.text().await.unwrap_or_default();
        Err(Error::UnknownStatus { code, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> APIAuth {
        APIAuth {
            team_id: Some("team_slug".into()),
            token: "token".into(),
            team_slug: None,
        }
    }

    #[test]
    fn test_artifact_url_carries_team() -> anyhow::Result<()> {
        let client = APIClient::new("https://cache.example.com/", None, "2.0.0")?;
        let url = client.artifact_url("deadbeef", &auth())?;
        assert_eq!(
            url.as_str(),
            "https://cache.example.com/v8/artifacts/deadbeef?teamId=team_slug"
        );
        Ok(())
    }

    #[test]
    fn test_is_linked() {
        assert!(auth().is_linked());
        let unlinked = APIAuth {
            team_id: None,
            token: "token".into(),
            team_slug: None,
        };
        assert!(!unlinked.is_linked());
    }
}
