use core::fmt;

/// SHA-384 digest length
pub const DIGEST_LEN: usize = 48;

/// Digest followed by a big-endian u32 image length. No header, no version byte.
pub const SIGNATURE_RECORD_LEN: usize = DIGEST_LEN + 4;

/// Contents of a `<firmware>.sig` release asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRecord {
    digest: [u8; DIGEST_LEN],
    image_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureFormatError {
    pub received: usize,
}

impl fmt::Display for SignatureFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "signature record is {} bytes, expected exactly {}",
            self.received, SIGNATURE_RECORD_LEN
        )
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SignatureFormatError {}

impl SignatureRecord {
    pub fn new(digest: [u8; DIGEST_LEN], image_len: u32) -> Self {
        Self { digest, image_len }
    }

    /// Decode a downloaded record. Anything other than exactly 52 bytes is
    /// rejected before the contents are looked at.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignatureFormatError> {
        if bytes.len() != SIGNATURE_RECORD_LEN {
            return Err(SignatureFormatError {
                received: bytes.len(),
            });
        }

        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes[..DIGEST_LEN]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[DIGEST_LEN..]);

        Ok(Self {
            digest,
            image_len: u32::from_be_bytes(len),
        })
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_RECORD_LEN] {
        let mut out = [0u8; SIGNATURE_RECORD_LEN];
        out[..DIGEST_LEN].copy_from_slice(&self.digest);
        out[DIGEST_LEN..].copy_from_slice(&self.image_len.to_be_bytes());
        out
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    pub fn image_len(&self) -> u32 {
        self.image_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_is_big_endian() {
        let mut raw = [0xAAu8; SIGNATURE_RECORD_LEN];
        raw[48..].copy_from_slice(&[0x00, 0x01, 0x02, 0x03]);

        let record = SignatureRecord::from_bytes(&raw).unwrap();
        assert_eq!(record.image_len(), 0x0001_0203);
        assert_eq!(record.digest(), &[0xAA; DIGEST_LEN]);
        assert_eq!(record.to_bytes(), raw);
    }

    #[test]
    fn test_wrong_sizes_rejected() {
        for len in [0, 1, 48, 51, 53, 64, 512] {
            let raw = [0u8; 512];
            assert_eq!(
                SignatureRecord::from_bytes(&raw[..len]),
                Err(SignatureFormatError { received: len })
            );
        }
    }
}
