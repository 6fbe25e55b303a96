//! Builds well-formed ESP application images for the simulator and tests

use sha2::{Digest, Sha256, Sha384};

use common::{SignatureRecord, DIGEST_LEN};

use crate::platform::esp_image::{APP_DESC_MAGIC, IMAGE_MAGIC};

const APP_DESC_LEN: usize = 256;
const DROM_LOAD_ADDR: u32 = 0x3F40_0020;
const IROM_LOAD_ADDR: u32 = 0x400D_0020;
const CHECKSUM_SEED: u8 = 0xEF;

/// Two segments: the app descriptor carrying `version`, then `payload`
pub fn build_image(version: &str, payload: &[u8]) -> Vec<u8> {
    let mut desc = vec![0u8; APP_DESC_LEN];
    desc[..4].copy_from_slice(&APP_DESC_MAGIC.to_le_bytes());
    let version = version.as_bytes();
    let n = version.len().min(31);
    desc[16..16 + n].copy_from_slice(&version[..n]);
    desc[48..48 + 7].copy_from_slice(b"lcm-sim");

    let mut code = payload.to_vec();
    code.resize(payload.len().div_ceil(4) * 4, 0);

    let mut image = Vec::with_capacity(24 + 16 + desc.len() + code.len() + 48);
    image.push(IMAGE_MAGIC);
    image.push(2);
    image.push(0x02); // DIO
    image.push(0x20); // 40 MHz, 4 MB
    image.extend_from_slice(&IROM_LOAD_ADDR.to_le_bytes());
    image.extend_from_slice(&[0xEE, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    image.push(1); // SHA-256 appended

    let mut checksum = CHECKSUM_SEED;
    for (addr, data) in [(DROM_LOAD_ADDR, &desc), (IROM_LOAD_ADDR, &code)] {
        image.extend_from_slice(&addr.to_le_bytes());
        image.extend_from_slice(&(data.len() as u32).to_le_bytes());
        image.extend_from_slice(data);
        checksum = data.iter().fold(checksum, |acc, b| acc ^ b);
    }

    while (image.len() + 1) % 16 != 0 {
        image.push(0);
    }
    image.push(checksum);

    let hash = Sha256::digest(&image);
    image.extend_from_slice(&hash);
    image
}

/// Signature record covering all of `image`
pub fn sign_image(image: &[u8]) -> SignatureRecord {
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&Sha384::digest(image));
    SignatureRecord::new(digest, image.len() as u32)
}
