//! Stable content and structure hashing.
//!
//! Everything that ends up in a fingerprint flows through this crate. The
//! hash function is xxh64: fast, 64-bit, and stable across platforms as
//! long as the input bytes are stable. Byte stability is the job of
//! [`CanonicalEncoder`]: structures encode themselves into a canonical
//! byte stream (sorted map keys, order-preserving arrays, explicit
//! present/absent tags) before hashing, so the result is independent of
//! map iteration order or the order fields were inserted.

mod encoder;
mod traits;

use std::io::Read;

pub use encoder::CanonicalEncoder;
use turbopath::AbsoluteSystemPath;
pub use traits::TurboHash;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot hash {path}: not a regular file")]
    NotRegularFile { path: String },
    #[error("cannot hash {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Hex-encode a u64 into a fixed 16-byte stack buffer.
/// Avoids the heap allocation that `hex::encode()` would perform.
#[inline]
pub fn hex_encode_u64(value: u64, buf: &mut [u8; 16]) -> &str {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let bytes = value.to_be_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        buf[i * 2] = HEX_CHARS[(b >> 4) as usize];
        buf[i * 2 + 1] = HEX_CHARS[(b & 0x0f) as usize];
    }
    // SAFETY: buf is filled with ASCII hex characters only.
    unsafe { std::str::from_utf8_unchecked(buf) }
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let out = xxhash_rust::xxh64::xxh64(bytes, 0);
    let mut hex_buf = [0u8; 16];
    hex_encode_u64(out, &mut hex_buf).to_owned()
}

/// Hashes the byte contents of a file. Symlinks are followed; anything
/// that doesn't resolve to a regular file (device, socket, directory) is
/// an error rather than a silent empty hash.
pub fn hash_file(path: &AbsoluteSystemPath) -> Result<String, Error> {
    let io_err = |source| Error::Io {
        path: path.to_string(),
        source,
    };

    let metadata = std::fs::metadata(path.as_std_path()).map_err(io_err)?;
    if !metadata.is_file() {
        return Err(Error::NotRegularFile {
            path: path.to_string(),
        });
    }

    let mut file = path.open().map_err(io_err)?;
    let mut hasher = xxhash_rust::xxh64::Xxh64::new(0);
    let mut buffer = [0u8; 8192];
    loop {
        let n = file.read(&mut buffer).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    let mut hex_buf = [0u8; 16];
    Ok(hex_encode_u64(hasher.digest(), &mut hex_buf).to_owned())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;

    #[test]
    fn test_hex_encode_u64() {
        let mut buf = [0u8; 16];
        assert_eq!(hex_encode_u64(0, &mut buf), "0000000000000000");
        assert_eq!(hex_encode_u64(u64::MAX, &mut buf), "ffffffffffffffff");
        assert_eq!(hex_encode_u64(0xdeadbeef, &mut buf), "00000000deadbeef");
    }

    #[test]
    fn test_hash_file_stable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let file = root.join_component("input.txt");
        file.create_with_contents("hello turbo")?;

        let first = hash_file(&file)?;
        let second = hash_file(&file)?;
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);

        file.create_with_contents("hello turbo!")?;
        assert_ne!(first, hash_file(&file)?);
        Ok(())
    }

    #[test]
    fn test_hash_file_missing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let missing = root.join_component("nope");
        assert!(hash_file(&missing).is_err());
        Ok(())
    }

    #[test]
    fn test_hash_file_directory_is_not_regular() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let err = hash_file(&root).unwrap_err();
        assert!(matches!(err, Error::NotRegularFile { .. }));
        Ok(())
    }
}
