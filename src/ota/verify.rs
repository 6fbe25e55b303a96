use sha2::{Digest, Sha384};

use common::{SignatureRecord, DIGEST_LEN};

use crate::error::LifecycleError;
use crate::platform::{FlashStore, SECTOR_SIZE};

/// SHA-384 over the first `len` bytes of a slot, read back in sector chunks
pub fn slot_digest(flash: &dyn FlashStore, label: &str, len: u32) -> Result<[u8; DIGEST_LEN], LifecycleError> {
    let mut hasher = Sha384::new();
    let mut buf = vec![0u8; SECTOR_SIZE as usize];
    let mut offset = 0u32;

    while offset < len {
        let n = (len - offset).min(SECTOR_SIZE);
        let chunk = &mut buf[..n as usize];
        flash
            .read(label, offset, chunk)
            .map_err(|e| LifecycleError::flash("read", label, e))?;
        hasher.update(&*chunk);
        offset += n;
    }

    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

/// Check a freshly written slot against its signature record.
///
/// The signed length has to equal the length the image headers describe, and
/// the digest over that many bytes has to equal the signed digest. Returns the
/// verified length.
pub fn verify_slot(flash: &dyn FlashStore, label: &str, signature: &SignatureRecord) -> Result<u32, LifecycleError> {
    let image = flash
        .image_info(label)
        .map_err(|e| LifecycleError::flash("read image metadata", label, e))?
        .ok_or_else(|| LifecycleError::MissingImage {
            slot: label.to_string(),
        })?;

    let expected_len = signature.image_len();
    if expected_len != image.image_len {
        return Err(LifecycleError::LengthMismatch {
            signed: expected_len,
            actual: image.image_len,
        });
    }
    info!("ota::verify: Image length verified ({} bytes)", expected_len);

    let computed = slot_digest(flash, label, expected_len)?;
    trace!("ota::verify: {} SHA-384 {}", label, hex::encode(computed));
    if &computed != signature.digest() {
        return Err(LifecycleError::DigestMismatch {
            slot: label.to_string(),
            expected: hex::encode(signature.digest()),
            computed: hex::encode(computed),
        });
    }

    info!("ota::verify: Signature verified for {}", label);
    Ok(expected_len)
}
