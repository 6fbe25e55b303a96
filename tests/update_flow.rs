use esp32_lifecycle::actions::{ButtonMap, ButtonPress};
use esp32_lifecycle::config::{RestartConfig, UpdateConfig};
use esp32_lifecycle::error::ErrorKind;
use esp32_lifecycle::ota::UpdateOutcome;
use esp32_lifecycle::platform::{FlashStore, ResetReason};
use esp32_lifecycle::restart::BootDecision;
use esp32_lifecycle::sim::image::{build_image, sign_image};
use esp32_lifecycle::sim::{CannedResponse, MemFlash, SimBoard};
use esp32_lifecycle::slots::BootSlotChange;
use esp32_lifecycle::state::{InstalledFirmwareRecord, PostResetReason};
use esp32_lifecycle::tasks::{handle_press, run_update_check};

const LATEST: &str = "https://api.github.com/repos/acme/lamp/releases/latest";
const DOWNLOAD: &str = "https://github.com/acme/lamp/releases/download";

fn config() -> UpdateConfig {
    UpdateConfig {
        repo: Some("acme/lamp".into()),
        ..UpdateConfig::default()
    }
}

fn board(factory_version: &str) -> SimBoard {
    let flash = MemFlash::esp32_4mb();
    flash
        .flash_image("factory", &build_image(factory_version, &[0x11; 2048]))
        .unwrap();
    SimBoard::new(flash, ResetReason::PowerOn, factory_version)
}

fn firmware_url(tag: &str) -> String {
    format!("{}/{}/main.bin", DOWNLOAD, tag)
}

fn signature_url(tag: &str) -> String {
    format!("{}/{}/main.bin.sig", DOWNLOAD, tag)
}

fn publish(board: &SimBoard, tag: &str) {
    let feed = format!(
        r#"{{
            "tag_name": "{tag}",
            "prerelease": false,
            "assets": [
                {{"name": "main.bin", "browser_download_url": "{fw}"}},
                {{"name": "main.bin.sig", "browser_download_url": "{sig}"}}
            ]
        }}"#,
        tag = tag,
        fw = firmware_url(tag),
        sig = signature_url(tag),
    );
    board.http.route(LATEST, CannedResponse::json(feed));
}

/// Serve `image` and a signature computed over `signed`
fn serve(board: &SimBoard, tag: &str, image: &[u8], signed: &[u8]) {
    board
        .http
        .route(&firmware_url(tag), CannedResponse::binary(image.to_vec()));
    board.http.route(
        &signature_url(tag),
        CannedResponse::binary(sign_image(signed).to_bytes().to_vec()),
    );
}

#[test]
fn test_up_to_date_transfers_nothing() {
    let board = board("1.2.0");
    publish(&board, "v1.2.0");
    let before = board.flash.stats();

    let mut device = board.device();
    let outcome = device.check_for_update(&config()).unwrap();

    assert_eq!(outcome, UpdateOutcome::UpToDate);
    assert_eq!(board.http.request_count(&firmware_url("v1.2.0")), 0);
    assert_eq!(board.http.request_count(&signature_url("v1.2.0")), 0);
    assert_eq!(board.flash.stats(), before);
    assert_eq!(board.state().installed_firmware().unwrap(), None);
    assert_eq!(board.system.restarts(), 0);
}

#[test]
fn test_newer_release_is_installed_and_booted() {
    let board = board("1.0.0");
    publish(&board, "v1.2.0");
    let image = build_image("1.2.0", &[0x5A; 20_000]);
    serve(&board, "v1.2.0", &image, &image);
    board.state().set_update_requested(true).unwrap();

    let mut device = board.device();
    let outcome = device.check_for_update(&config()).unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Installed {
            version: "1.2.0".into(),
            slot: "ota_0".into()
        }
    );

    let mut state = board.state();
    assert_eq!(board.flash.boot_slot().unwrap(), "ota_0");
    assert_eq!(
        state.installed_firmware().unwrap(),
        Some(InstalledFirmwareRecord::new("1.2.0", "ota_0"))
    );
    assert!(!state.update_requested().unwrap());
    assert_eq!(board.system.restarts(), 1);

    assert_eq!(board.power_cycle(ResetReason::Software).unwrap(), "ota_0");
    let report = board.device().boot(&RestartConfig::default()).unwrap();
    assert_eq!(report.running_slot, "ota_0");
    assert_eq!(report.decision, BootDecision::Idle);
    assert_eq!(report.post_reset, Some(PostResetReason::Update));

    board.http.clear_requests();
    let outcome = board.device().check_for_update(&config()).unwrap();
    assert_eq!(outcome, UpdateOutcome::UpToDate);
    assert_eq!(board.http.request_count(&firmware_url("v1.2.0")), 0);
}

#[test]
fn test_digest_mismatch_changes_nothing_bootable() {
    let board = board("1.0.0");
    publish(&board, "v1.2.0");
    let image = build_image("1.2.0", &[0x5A; 20_000]);
    let mut tampered = image.clone();
    tampered[4000] ^= 0x01;
    serve(&board, "v1.2.0", &tampered, &image);

    let mut device = board.device();
    let err = device.check_for_update(&config()).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Verification);
    assert_eq!(board.flash.boot_slot().unwrap(), "factory");
    assert_eq!(board.flash.image_info("ota_0").unwrap(), None);
    assert_eq!(board.state().installed_firmware().unwrap(), None);
    assert_eq!(board.system.restarts(), 0);
}

#[test]
fn test_worker_check_swallows_failures() {
    let board = board("1.0.0");
    publish(&board, "v1.2.0");
    // no firmware routes: the signature fetch is refused

    let device = board.device().shared();
    assert_eq!(run_update_check(&device, &config()), None);
    assert_eq!(board.flash.boot_slot().unwrap(), "factory");
    assert_eq!(board.system.restarts(), 0);
}

#[test]
fn test_download_follows_redirect_to_storage_host() {
    let board = board("1.0.0");
    publish(&board, "v1.2.0");
    let image = build_image("1.2.0", &[0x42; 9000]);
    let storage = "https://objects.githubusercontent.com/github-production-release-asset/1234?sig=abc";
    board.http.route(
        &firmware_url("v1.2.0"),
        CannedResponse::redirect(302, storage),
    );
    board.http.route(storage, CannedResponse::binary(image.clone()));
    board.http.route(
        &signature_url("v1.2.0"),
        CannedResponse::binary(sign_image(&image).to_bytes().to_vec()),
    );

    let outcome = board.device().check_for_update(&config()).unwrap();
    assert!(matches!(outcome, UpdateOutcome::Installed { .. }));
    assert_eq!(board.http.request_count(storage), 1);

    let firmware_request = board
        .http
        .requests()
        .into_iter()
        .find(|request| request.url == firmware_url("v1.2.0"))
        .unwrap();
    assert!(!firmware_request.follow_redirects);
}

#[test]
fn test_requested_update_reactivates_installed_slot() {
    let board = board("1.0.0");
    publish(&board, "v1.2.0");
    let image = build_image("1.2.0", &[0x5A; 20_000]);
    serve(&board, "v1.2.0", &image, &image);

    board.device().check_for_update(&config()).unwrap();
    board.power_cycle(ResetReason::Software).unwrap();

    // single press: flag the update and fall back to factory
    let device = board.device().shared();
    handle_press(&device, &ButtonMap::default(), ButtonPress::Single).unwrap();
    assert_eq!(board.flash.boot_slot().unwrap(), "factory");
    assert_eq!(board.power_cycle(ResetReason::Software).unwrap(), "factory");
    drop(device);

    board.http.clear_requests();
    let restarts = board.system.restarts();
    let outcome = board.device().check_for_update(&config()).unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Reactivated {
            slot: "ota_0".into(),
            change: BootSlotChange::Changed {
                previous: "factory".into()
            },
            restart: true
        }
    );
    assert_eq!(board.http.request_count(&firmware_url("v1.2.0")), 0);
    assert_eq!(board.flash.boot_slot().unwrap(), "ota_0");
    assert!(!board.state().update_requested().unwrap());
    assert_eq!(board.system.restarts(), restarts + 1);
}
