use std::env;

use base64::{prelude::BASE64_STANDARD, Engine};
use hmac::{Hmac, Mac};
use os_str_bytes::OsStringBytes;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error(
        "signature secret key not found. You must specify a secret key in the \
         TURBO_REMOTE_CACHE_SIGNATURE_KEY environment variable"
    )]
    NoSignatureSecretKey,
    #[error("base64 encoding error: {0}")]
    Base64EncodingError(#[from] base64::DecodeError),
    #[error(transparent)]
    Hmac(#[from] hmac::digest::InvalidLength),
}

/// Computes and verifies the detached HMAC-SHA256 tags attached to remote
/// artifacts. The MAC covers the artifact hash, the team id, and the
/// payload bytes, so a tag can't be replayed for a different fingerprint
/// or team.
#[derive(Debug)]
pub struct ArtifactSignatureAuthenticator {
    pub(crate) team_id: Vec<u8>,
    // An override for testing purposes (avoids env var race conditions)
    pub(crate) secret_key_override: Option<Vec<u8>>,
}

impl ArtifactSignatureAuthenticator {
    pub fn new(team_id: Vec<u8>, secret_key_override: Option<Vec<u8>>) -> Self {
        Self {
            team_id,
            secret_key_override,
        }
    }

    // HMAC-SHA256 has no key length limit, although keys longer than 64
    // bytes get hashed down first.
    fn secret_key(&self) -> Result<Vec<u8>, SignatureError> {
        if let Some(secret_key) = &self.secret_key_override {
            return Ok(secret_key.to_vec());
        }

        Ok(env::var_os("TURBO_REMOTE_CACHE_SIGNATURE_KEY")
            .ok_or(SignatureError::NoSignatureSecretKey)?
            .into_raw_vec())
    }

    fn construct_metadata(&self, hash: &[u8]) -> Vec<u8> {
        let mut metadata = hash.to_vec();
        metadata.extend_from_slice(&self.team_id);
        metadata
    }

    fn get_tag_generator(&self, hash: &[u8]) -> Result<HmacSha256, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret_key()?)?;
        mac.update(&self.construct_metadata(hash));
        Ok(mac)
    }

    #[tracing::instrument(skip_all)]
    pub fn generate_tag(
        &self,
        hash: &[u8],
        artifact_body: &[u8],
    ) -> Result<String, SignatureError> {
        let mut hmac_ctx = self.get_tag_generator(hash)?;

        hmac_ctx.update(artifact_body);
        let hmac_output = hmac_ctx.finalize();
        Ok(BASE64_STANDARD.encode(hmac_output.into_bytes()))
    }

    #[tracing::instrument(skip_all)]
    pub fn validate(
        &self,
        hash: &[u8],
        artifact_body: &[u8],
        expected_tag: &str,
    ) -> Result<bool, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret_key()?)?;
        mac.update(&self.construct_metadata(hash));
        mac.update(artifact_body);

        let expected_bytes = BASE64_STANDARD.decode(expected_tag)?;
        Ok(mac.verify_slice(&expected_bytes).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    fn authenticator(key: &[u8], team: &[u8]) -> ArtifactSignatureAuthenticator {
        ArtifactSignatureAuthenticator {
            team_id: team.to_vec(),
            secret_key_override: Some(key.to_vec()),
        }
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let signer = authenticator(b"x3vq8mFz0J", b"tH7sL1Rn9K");
        let hash = b"d5b7e4688f";
        let body = &[5u8, 72, 219, 39, 156];

        let tag = signer.generate_tag(hash, body)?;
        assert!(signer.validate(hash, body, &tag)?);

        // a forged tag fails
        let bad_tag = BASE64_STANDARD.encode(b"bad tag");
        assert!(!signer.validate(hash, body, &bad_tag)?);
        Ok(())
    }

    #[test]
    fn test_key_rotation_invalidates_tag() -> Result<()> {
        let signer = authenticator(b"original key", b"team");
        let hash = b"a1c8f3e3d7";
        let body = &[128u8, 234, 49, 67, 96];
        let tag = signer.generate_tag(hash, body)?;

        let rotated = authenticator(b"some other key", b"team");
        assert!(!rotated.validate(hash, body, &tag)?);
        Ok(())
    }

    #[test]
    fn test_tag_bound_to_hash_and_team() -> Result<()> {
        let signer = authenticator(b"key", b"team-a");
        let tag = signer.generate_tag(b"hash-1", b"body")?;

        // same key, different team
        let other_team = authenticator(b"key", b"team-b");
        assert!(!other_team.validate(b"hash-1", b"body", &tag)?);

        // same team, different hash
        assert!(!signer.validate(b"hash-2", b"body", &tag)?);
        Ok(())
    }
}
