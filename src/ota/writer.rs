use std::io::{ErrorKind as IoErrorKind, Read};

use crate::error::LifecycleError;
use crate::platform::{FlashStore, SlotInfo, SECTOR_SIZE};

const CHUNK: usize = SECTOR_SIZE as usize;
const PROGRESS_EVERY: u32 = 100 * 1024;

/// Exclusive write access to one application slot for one update attempt.
///
/// The slot is erased up front. Unless [`SlotWriteGuard::commit`] is called the
/// first sector is erased again on drop, which invalidates the image header so
/// the half-written slot never looks like a bootable image.
pub struct SlotWriteGuard<'a> {
    flash: &'a mut dyn FlashStore,
    slot: SlotInfo,
    written: u32,
    committed: bool,
}

impl<'a> SlotWriteGuard<'a> {
    pub fn begin(flash: &'a mut dyn FlashStore, slot: SlotInfo) -> Result<Self, LifecycleError> {
        info!(
            "ota::writer: Erasing {} ({} bytes) for new image",
            slot.label, slot.size
        );
        flash
            .erase_slot(&slot.label)
            .map_err(|e| LifecycleError::flash("erase", &slot.label, e))?;

        Ok(Self {
            flash,
            slot,
            written: 0,
            committed: false,
        })
    }

    pub fn slot(&self) -> &SlotInfo {
        &self.slot
    }

    /// Read access for verifying what was written
    pub fn flash(&self) -> &dyn FlashStore {
        &*self.flash
    }

    /// Append `data` after what was written so far
    pub fn write(&mut self, data: &[u8]) -> Result<(), LifecycleError> {
        let end = self
            .written
            .checked_add(data.len() as u32)
            .filter(|end| *end <= self.slot.size)
            .ok_or_else(|| LifecycleError::ImageTooLarge {
                slot: self.slot.label.clone(),
                capacity: self.slot.size,
            })?;

        self.flash
            .write(&self.slot.label, self.written, data)
            .map_err(|e| LifecycleError::flash("write", &self.slot.label, e))?;
        self.written = end;
        Ok(())
    }

    /// Copy `body` into the slot chunk by chunk until EOF
    pub fn stream_from(&mut self, body: &mut dyn Read, url: &str, expected: Option<u64>) -> Result<u32, LifecycleError> {
        let mut buf = vec![0u8; CHUNK];
        let mut next_report = PROGRESS_EVERY;

        loop {
            let n = match body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
                Err(e) => return Err(LifecycleError::network(url, e)),
            };
            self.write(&buf[..n])?;

            if self.written >= next_report {
                match expected {
                    Some(total) if total > 0 => info!(
                        "ota::writer: Written {} KB / {} KB ({:.1}%)",
                        self.written / 1024,
                        total / 1024,
                        (self.written as f32 / total as f32) * 100.0
                    ),
                    _ => info!("ota::writer: Written {} KB", self.written / 1024),
                }
                next_report = self.written - self.written % PROGRESS_EVERY + PROGRESS_EVERY;
            }
        }

        info!("ota::writer: Stream complete, {} bytes in {}", self.written, self.slot.label);
        Ok(self.written)
    }

    /// Keep the slot contents. Only call once the image has been verified.
    pub fn commit(mut self) -> SlotInfo {
        self.committed = true;
        self.slot.clone()
    }
}

impl Drop for SlotWriteGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        warn!(
            "ota::writer: Discarding unverified image in {} ({} bytes written)",
            self.slot.label, self.written
        );
        let len = SECTOR_SIZE.min(self.slot.size);
        if let Err(err) = self.flash.erase_range(&self.slot.label, 0, len) {
            error!(
                "ota::writer: Could not invalidate {}: {:#}",
                self.slot.label, err
            );
        }
    }
}
