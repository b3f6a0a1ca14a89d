use std::path::Path;

use color_eyre::Result;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const CHUNK_SIZE: usize = 1024 * 1024;

/// Streaming SHA-256 over a file, hex-encoded. Snapshots run to hundreds of
/// gigabytes, so the file is never held in memory.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of an in-memory buffer (sidecar documents).
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// The same digest in the base64 form object stores expect for
/// checksum-verified uploads.
pub fn hex_sha256_to_base64(hex_digest: &str) -> Result<String> {
    use base64::Engine;
    let raw = hex::decode(hex_digest)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_and_buffer_digests_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        tokio::fs::write(&path, b"snapshot contents").await.unwrap();

        let from_file = sha256_file(&path).await.unwrap();
        let from_bytes = sha256_bytes(b"snapshot contents");
        assert_eq!(from_file, from_bytes);
    }

    #[test]
    fn base64_conversion_matches_known_digest() {
        // sha256("") in both encodings
        let hex_digest = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let b64 = hex_sha256_to_base64(hex_digest).unwrap();
        assert_eq!(b64, "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=");
    }
}
