//! ESP-IDF application image headers.
//!
//! Computes the image length the same way the second-stage bootloader does
//! (segments, checksum byte padded to 16, optional appended SHA-256) and pulls
//! the version string out of the `esp_app_desc_t` at the start of the first
//! segment. Works on anything that can read bytes at an offset, so it serves
//! both the partition adapter on the device and the in-memory flash.

use anyhow::Result;

use super::flash::ImageInfo;

pub const IMAGE_MAGIC: u8 = 0xE9;
pub const APP_DESC_MAGIC: u32 = 0xABCD_5432;

pub const HEADER_LEN: u32 = 24;
pub const SEGMENT_HEADER_LEN: u32 = 8;
pub const MAX_SEGMENTS: u8 = 16;
pub const APPENDED_HASH_LEN: u32 = 32;

/// `esp_app_desc_t`: magic, secure_version, reserv1[2], then version[32]
const APP_DESC_VERSION_OFFSET: u32 = 16;
const APP_DESC_VERSION_LEN: usize = 32;

const HASH_APPENDED_OFFSET: usize = 23;

/// Walk the image headers in a slot of `slot_size` bytes. Returns `None` when
/// the bytes do not form a complete image that fits the slot.
pub fn read_image_info<F>(slot_size: u32, mut read_at: F) -> Result<Option<ImageInfo>>
where
    F: FnMut(u32, &mut [u8]) -> Result<()>,
{
    if slot_size < HEADER_LEN {
        return Ok(None);
    }

    let mut header = [0u8; HEADER_LEN as usize];
    read_at(0, &mut header)?;
    if header[0] != IMAGE_MAGIC {
        return Ok(None);
    }

    let segments = header[1];
    if segments == 0 || segments > MAX_SEGMENTS {
        return Ok(None);
    }

    let mut version = String::new();
    let mut pos = HEADER_LEN;
    for index in 0..segments {
        let Some(data_start) = pos.checked_add(SEGMENT_HEADER_LEN) else {
            return Ok(None);
        };
        if data_start > slot_size {
            return Ok(None);
        }

        let mut segment = [0u8; SEGMENT_HEADER_LEN as usize];
        read_at(pos, &mut segment)?;
        let data_len = u32::from_le_bytes([segment[4], segment[5], segment[6], segment[7]]);

        let Some(data_end) = data_start.checked_add(data_len) else {
            return Ok(None);
        };
        if data_end > slot_size {
            return Ok(None);
        }

        if index == 0 && data_len >= APP_DESC_VERSION_OFFSET + APP_DESC_VERSION_LEN as u32 {
            version = read_app_version(data_start, &mut read_at)?.unwrap_or_default();
        }

        pos = data_end;
    }

    // One checksum byte, then pad to a 16-byte boundary
    let mut image_len = (pos + 1 + 15) & !15;
    if header[HASH_APPENDED_OFFSET] == 1 {
        image_len += APPENDED_HASH_LEN;
    }
    if image_len > slot_size {
        return Ok(None);
    }

    Ok(Some(ImageInfo { version, image_len }))
}

fn read_app_version<F>(desc_start: u32, read_at: &mut F) -> Result<Option<String>>
where
    F: FnMut(u32, &mut [u8]) -> Result<()>,
{
    let mut magic = [0u8; 4];
    read_at(desc_start, &mut magic)?;
    if u32::from_le_bytes(magic) != APP_DESC_MAGIC {
        return Ok(None);
    }

    let mut raw = [0u8; APP_DESC_VERSION_LEN];
    read_at(desc_start + APP_DESC_VERSION_OFFSET, &mut raw)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    Ok(Some(String::from_utf8_lossy(&raw[..end]).into_owned()))
}
