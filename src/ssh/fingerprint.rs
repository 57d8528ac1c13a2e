//! Host key fingerprints

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::Digest;

/// Digest used to fingerprint a host key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShaAlgorithm {
    Md5,
    #[default]
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl ShaAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            ShaAlgorithm::Md5 => "MD5",
            ShaAlgorithm::Sha1 => "SHA1",
            ShaAlgorithm::Sha224 => "SHA224",
            ShaAlgorithm::Sha256 => "SHA256",
            ShaAlgorithm::Sha384 => "SHA384",
            ShaAlgorithm::Sha512 => "SHA512",
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            ShaAlgorithm::Md5 => md5::Md5::digest(data).to_vec(),
            ShaAlgorithm::Sha1 => sha1::Sha1::digest(data).to_vec(),
            ShaAlgorithm::Sha224 => sha2::Sha224::digest(data).to_vec(),
            ShaAlgorithm::Sha256 => sha2::Sha256::digest(data).to_vec(),
            ShaAlgorithm::Sha384 => sha2::Sha384::digest(data).to_vec(),
            ShaAlgorithm::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }
}

/// Render a digest: colon separated lowercase hex up to 20 bytes, base64 above.
pub fn render_digest(digest: &[u8]) -> String {
    if digest.len() <= 20 {
        digest
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    } else {
        STANDARD.encode(digest)
    }
}

/// Display form `ALGO:fingerprint` of a raw host key blob.
pub fn fingerprint(algorithm: ShaAlgorithm, key: &[u8]) -> String {
    format!(
        "{}:{}",
        algorithm.name(),
        render_digest(&algorithm.digest(key))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_and_sha1_render_as_hex() {
        let md5 = fingerprint(ShaAlgorithm::Md5, b"abc");
        assert_eq!(md5, "MD5:90:01:50:98:3c:d2:4f:b0:d6:96:3f:7d:28:e1:7f:72");

        let sha1 = fingerprint(ShaAlgorithm::Sha1, b"abc");
        assert_eq!(
            sha1,
            "SHA1:a9:99:3e:36:47:06:81:6a:ba:3e:25:71:78:50:c2:6c:9c:d0:d8:9d"
        );
    }

    #[test]
    fn test_sha256_renders_as_base64() {
        let sha256 = fingerprint(ShaAlgorithm::Sha256, b"abc");
        assert_eq!(
            sha256,
            "SHA256:ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0="
        );
    }

    #[test]
    fn test_digest_lengths() {
        assert_eq!(ShaAlgorithm::Sha224.digest(b"").len(), 28);
        assert_eq!(ShaAlgorithm::Sha384.digest(b"").len(), 48);
        assert_eq!(ShaAlgorithm::Sha512.digest(b"").len(), 64);

        let sha512 = fingerprint(ShaAlgorithm::Sha512, b"");
        let rendered = sha512.strip_prefix("SHA512:").unwrap();
        assert!(!rendered.contains(':'));
        assert!(rendered.ends_with("=="));
    }
}
