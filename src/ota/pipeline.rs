use common::VersionTriple;

use crate::config::UpdateConfig;
use crate::error::{ErrorKind, LifecycleError};
use crate::platform::{FlashStore, HttpClient, System};
use crate::release::ReleaseResolver;
use crate::slots::SlotManager;
use crate::state::{InstalledFirmwareRecord, PersistentStateStore};

use super::download::Downloader;
use super::verify::verify_slot;
use super::writer::SlotWriteGuard;
use super::UpdateOutcome;

/// One update attempt against one device.
///
/// Borrows everything it touches for the whole attempt; the caller holds the
/// flash lock while it runs. Restarting is left to the caller, see
/// [`UpdateOutcome::requires_restart`].
pub struct UpdatePipeline<'a> {
    flash: &'a mut dyn FlashStore,
    state: &'a mut PersistentStateStore,
    http: &'a mut dyn HttpClient,
    system: &'a dyn System,
    config: &'a UpdateConfig,
}

impl<'a> UpdatePipeline<'a> {
    pub fn new(
        flash: &'a mut dyn FlashStore,
        state: &'a mut PersistentStateStore,
        http: &'a mut dyn HttpClient,
        system: &'a dyn System,
        config: &'a UpdateConfig,
    ) -> Self {
        Self {
            flash,
            state,
            http,
            system,
            config,
        }
    }

    /// Install the newest qualifying release of `repo` if it is newer than
    /// what is installed, or re-activate the installed image when an update
    /// was requested but nothing newer exists
    pub fn check_and_update(&mut self, repo: &str, prerelease: bool) -> Result<UpdateOutcome, LifecycleError> {
        let installed = self.installed_record();
        let baseline = installed
            .as_ref()
            .map(|record| record.version.clone())
            .unwrap_or_else(|| self.system.running_version());
        let local = VersionTriple::parse(&baseline);
        if local.is_valid() {
            info!("ota::pipeline: Current firmware version {}", local);
        } else {
            warn!(
                "ota::pipeline: Current version {:?} is not a version, assuming an update is needed",
                baseline
            );
        }

        let release = ReleaseResolver::new(&mut *self.http, self.config).resolve(repo, prerelease)?;

        if local.is_valid() && !release.version.is_newer_than(&local) {
            info!(
                "ota::pipeline: Up to date ({} installed, {} available)",
                local, release.version
            );
            if self.update_requested() {
                return self.reactivate(installed, &baseline);
            }
            return Ok(UpdateOutcome::UpToDate);
        }

        info!("ota::pipeline: Updating {} -> {}", baseline, release.version);
        self.install_from_urls(&release.firmware_url, &release.signature_url, Some(&release.tag))
    }

    /// Download, write and verify the image at `firmware_url`, then make it
    /// the boot target. `tag` supplies the recorded version; without a usable
    /// tag the version embedded in the image is recorded instead.
    pub fn install_from_urls(
        &mut self,
        firmware_url: &str,
        signature_url: &str,
        tag: Option<&str>,
    ) -> Result<UpdateOutcome, LifecycleError> {
        info!("ota::pipeline: Downloading signature from {}", signature_url);
        let signature = Downloader::new(&mut *self.http, self.config).fetch_signature(signature_url)?;

        let installed = self.installed_record();
        let slot = SlotManager::new(&mut *self.flash).select_next_free_slot(installed.as_ref())?;
        info!("ota::pipeline: Using slot {} ({} bytes)", slot.label, slot.size);

        info!("ota::pipeline: Starting transfer from {}", firmware_url);
        let response = Downloader::new(&mut *self.http, self.config).open(firmware_url)?;
        let expected = response.content_length();
        let mut body = response.body;

        let mut guard = SlotWriteGuard::begin(&mut *self.flash, slot)?;
        guard.stream_from(&mut body, firmware_url, expected)?;

        let label = guard.slot().label.clone();
        if let Err(err) = verify_slot(guard.flash(), &label, &signature) {
            if err.kind() == ErrorKind::Verification {
                error!("ota::pipeline: Rejecting image in {}: {}", label, err);
            }
            return Err(err);
        }

        let version = match tag.map(VersionTriple::parse) {
            Some(version) if version.is_valid() => version.to_string(),
            _ => {
                let embedded = guard
                    .flash()
                    .image_info(&label)
                    .map_err(|e| LifecycleError::flash("read image metadata", &label, e))?
                    .map(|image| image.version)
                    .unwrap_or_default();
                warn!(
                    "ota::pipeline: Tag {:?} unusable, recording embedded version {:?}",
                    tag, embedded
                );
                embedded
            }
        };
        let slot = guard.commit();

        SlotManager::new(&mut *self.flash).set_boot_slot(&slot.label)?;
        SlotManager::record_installed(&mut self.state, &version, &slot.label)?;
        if self.update_requested() {
            self.state.set_update_requested(false)?;
        }

        info!("ota::pipeline: Installed {} in {}, restart required", version, slot.label);
        Ok(UpdateOutcome::Installed {
            version,
            slot: slot.label,
        })
    }

    fn reactivate(
        &mut self,
        installed: Option<InstalledFirmwareRecord>,
        baseline: &str,
    ) -> Result<UpdateOutcome, LifecycleError> {
        let mut slots = SlotManager::new(&mut *self.flash);
        let record = match installed {
            Some(record) => record,
            None => InstalledFirmwareRecord::new(baseline, slots.running_slot()?),
        };

        let slot = slots.locate_installed(&record).map_err(|err| {
            error!("ota::pipeline: Cannot re-activate {}: {}", record.version, err);
            err
        })?;
        let change = slots.set_boot_slot(&slot.label)?;
        let running = slots.running_slot()?;

        self.state.set_update_requested(false)?;

        let restart = change.changed() || running != slot.label;
        info!(
            "ota::pipeline: Re-activated {} in {} (restart: {})",
            record.version, slot.label, restart
        );
        Ok(UpdateOutcome::Reactivated {
            slot: slot.label,
            change,
            restart,
        })
    }

    fn installed_record(&mut self) -> Option<InstalledFirmwareRecord> {
        self.state.installed_firmware().unwrap_or_else(|err| {
            warn!("ota::pipeline: Could not read installed record: {}", err);
            None
        })
    }

    fn update_requested(&mut self) -> bool {
        self.state.update_requested().unwrap_or_else(|err| {
            warn!("ota::pipeline: Could not read update flag: {}", err);
            false
        })
    }
}
