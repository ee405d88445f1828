//! End-to-end pipeline tests.
//!
//! Every test builds into its own temporary directory with a fixed
//! timestamp and no installer unless stated otherwise.

mod helpers;

use std::fs;

use autoinstall_builder::archive::bundle_digest;
use autoinstall_builder::assets::digest::sha256_hex;
use autoinstall_builder::assets::SourcingMode;
use autoinstall_builder::cache::AssetCache;
use autoinstall_builder::generate::{autoinstall, first_boot, installer, BUNDLE_DIR};
use autoinstall_builder::pipeline::{run_build, BuildLog, Stage, StageStatus};
use autoinstall_builder::BuildError;
use helpers::{read_tree, MockServer, TestEnv, PASSPHRASE, USER};
use pretty_assertions::assert_eq;

fn status_of(log: &BuildLog, stage: Stage) -> Option<StageStatus> {
    log.record(stage).map(|r| r.status)
}

// =============================================================================
// Happy paths
// =============================================================================

#[test]
fn encrypted_dell_workstation_produces_full_bundle() {
    let env = TestEnv::new();
    let config = env.write_config(&format!(
        r#"
[hardware]
vendor = "dell"
[encryption]
passphrase = "{}"
[packages]
apt_packages = ["git", "vim"]
{}
"#,
        PASSPHRASE, USER
    ));

    let report = run_build(&env.options(&config)).unwrap();

    let classes: Vec<&str> = report.classes.iter().collect();
    assert_eq!(
        &classes[..5],
        &["UBUNTU", "UBUNTU_DESKTOP", "AMD64", "HARDWARE_DELL", "UBUNTU_ENCRYPTED"]
    );
    assert!(report.classes.contains("DEVELOPMENT"));
    assert_eq!(classes.last(), Some(&"LAST"));

    let bundle = report.bundle_dir.clone().unwrap();
    assert_eq!(bundle, env.output.join(BUNDLE_DIR));
    let packages =
        fs::read_to_string(bundle.join("fai-config/package_config/UBUNTU_DESKTOP")).unwrap();
    for wanted in ["git", "vim", "cryptsetup", "lvm2", "fwupd"] {
        assert!(
            packages.lines().any(|l| l == wanted),
            "missing {} in:\n{}",
            wanted,
            packages
        );
    }

    let user_data = fs::read_to_string(bundle.join(autoinstall::USER_DATA)).unwrap();
    assert!(user_data.starts_with("#cloud-config"));
    assert!(user_data.contains("dm_crypt"));
    assert!(bundle.join("fai-config/disk_config/UBUNTU_ENCRYPTED").is_file());

    // Stage records are complete and in order.
    let stages: Vec<Stage> = report.log.stages.iter().map(|r| r.stage).collect();
    assert_eq!(stages, Stage::ALL.to_vec());
    assert_eq!(
        status_of(&report.log, Stage::InvokeInstaller),
        Some(StageStatus::Skipped)
    );
    assert_eq!(report.log.status, StageStatus::Success);

    // Secrets never reach the logs.
    let log_json = fs::read_to_string(&report.log_path).unwrap();
    assert!(!log_json.contains(PASSPHRASE));
    assert!(!log_json.contains("s3cret-pass"));
    assert_eq!(report.bundle_digest, Some(bundle_digest(&bundle).unwrap()));
}

#[cfg(unix)]
#[test]
fn secret_bearing_artifacts_are_owner_only() {
    let env = TestEnv::new();
    let config = env.write_config(&format!(
        "[encryption]\npassphrase = \"{}\"\n{}",
        PASSPHRASE, USER
    ));
    let report = run_build(&env.options(&config)).unwrap();
    let bundle = report.bundle_dir.unwrap();

    assert_eq!(helpers::mode_of(&bundle.join(autoinstall::USER_DATA)), 0o600);
    assert_eq!(
        helpers::mode_of(&bundle.join("fai-config/disk_config/UBUNTU_ENCRYPTED")),
        0o600
    );
    assert_eq!(helpers::mode_of(&bundle.join(installer::CLASS_SCRIPT)), 0o755);
}

#[test]
fn plain_build_carries_no_luks_content() {
    let env = TestEnv::new();
    let config = env.write_config(&format!("[encryption]\nenabled = false\n{}", USER));

    let report = run_build(&env.options(&config)).unwrap();
    assert!(report.classes.contains("DISK_PLAIN"));

    let tree = read_tree(&report.bundle_dir.unwrap());
    assert!(tree.contains_key("fai-config/disk_config/DISK_PLAIN"));
    for (path, bytes) in &tree {
        let text = String::from_utf8_lossy(bytes);
        for needle in ["LUKS", "luks", "cryptsetup", "dm_crypt"] {
            assert!(!text.contains(needle), "'{}' found in {}", needle, path);
        }
    }
}

#[test]
fn fixed_timestamp_builds_are_byte_identical() {
    let env = TestEnv::new();
    env.write_file("debs/tool_1.0_amd64.deb", b"!<arch>\ndebian-binary");
    env.write_file("scripts/setup.sh", b"#!/bin/sh\necho setup\n");
    env.write_file("scripts/enroll.sh", b"#!/bin/sh\necho enroll\n");
    let config = env.write_config(&format!(
        r#"
[encryption]
passphrase = "{}"
[[packages.debs]]
local_path = "debs/tool_1.0_amd64.deb"
[[first_boot.scripts]]
local_path = "scripts/setup.sh"
[[first_boot.scripts]]
local_path = "scripts/enroll.sh"
type = "manual"
{}
"#,
        PASSPHRASE, USER
    ));

    let first_out = env.output.join("first");
    let second_out = env.output.join("second");
    let mut first_opts = env.options_into(&config, &first_out);
    first_opts.archive = true;
    let mut second_opts = env.options_into(&config, &second_out);
    second_opts.archive = true;

    let first = run_build(&first_opts).unwrap();
    let second = run_build(&second_opts).unwrap();

    assert_eq!(first.bundle_digest, second.bundle_digest);
    let first_tree = read_tree(&first.bundle_dir.unwrap());
    let second_tree = read_tree(&second.bundle_dir.unwrap());
    assert_eq!(
        first_tree.keys().collect::<Vec<_>>(),
        second_tree.keys().collect::<Vec<_>>()
    );
    assert!(first_tree == second_tree, "bundle contents differ");
    assert_eq!(
        fs::read(first.archive.unwrap()).unwrap(),
        fs::read(second.archive.unwrap()).unwrap()
    );

    // Staged asset names follow declaration order.
    assert!(first_tree.contains_key("first-boot/assets/packages/tool_1.0_amd64.deb"));
    assert!(first_tree.contains_key("first-boot/assets/scripts/01-setup.sh"));
    assert!(first_tree.contains_key("first-boot/assets/scripts/02-enroll.sh"));
    assert!(first_tree.contains_key(first_boot::UNIT));
    let manual = String::from_utf8(first_tree[first_boot::MANUAL_LIST].clone()).unwrap();
    assert!(manual.contains("02-enroll.sh"));
    assert!(!manual.contains("01-setup.sh"));
}

#[test]
fn skipping_every_generation_stage_publishes_nothing() {
    let env = TestEnv::new();
    let config = env.write_config(&format!("[encryption]\nenabled = false\n{}", USER));
    let mut opts = env.options(&config);
    opts.skips.autoinstall = true;
    opts.skips.installer_config = true;
    opts.skips.first_boot = true;
    opts.installer = Some("true".to_string());

    let report = run_build(&opts).unwrap();
    assert_eq!(report.bundle_dir, None);
    assert_eq!(status_of(&report.log, Stage::Publish), Some(StageStatus::Skipped));
    assert_eq!(
        status_of(&report.log, Stage::InvokeInstaller),
        Some(StageStatus::Skipped)
    );
    assert!(!env.output.join(BUNDLE_DIR).exists());
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn invalid_configuration_maps_to_exit_code_2() {
    let env = TestEnv::new();
    let config = env.write_config(&format!(
        "[hardware]\nvendor = \"acme\"\n[encryption]\nenabled = false\n{}",
        USER
    ));

    let err = run_build(&env.options(&config)).unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(matches!(
        err,
        BuildError::StageFailed {
            stage: Stage::Validate,
            ..
        }
    ));

    let log = BuildLog::load(&env.output).unwrap();
    assert_eq!(log.status, StageStatus::Failed);
    assert_eq!(log.stages.len(), 1);
    assert!(log.stages[0].error.as_deref().unwrap().contains("hardware.vendor"));
    assert!(!env.output.join(BUNDLE_DIR).exists());
}

#[test]
fn type_errors_are_reported_with_every_other_problem() {
    let env = TestEnv::new();
    let config = env.write_config(&format!(
        "[hardware]\nvendor = \"acme\"\n[encryption]\npassphrase = \"{}\"\nkey_size = \"big\"\n{}",
        PASSPHRASE, USER
    ));

    let err = run_build(&env.options(&config)).unwrap_err();
    assert_eq!(err.exit_code(), 2);
    match err.root_cause() {
        BuildError::ConfigValidation(invalid) => {
            assert!(invalid.mentions("encryption.key_size"), "{}", invalid);
            assert!(invalid.mentions("hardware.vendor"), "{}", invalid);
            assert!(!invalid.mentions("<document>"), "{}", invalid);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn debs_sharing_a_file_name_fail_validation() {
    let env = TestEnv::new();
    env.write_file("a/tool_1.0_amd64.deb", b"first");
    env.write_file("b/tool_1.0_amd64.deb", b"second");
    let config = env.write_config(&format!(
        "[encryption]\nenabled = false\n\
         [[packages.debs]]\nlocal_path = \"a/tool_1.0_amd64.deb\"\n\
         [[packages.debs]]\nlocal_path = \"b/tool_1.0_amd64.deb\"\n{}",
        USER
    ));

    let err = run_build(&env.options(&config)).unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(matches!(
        err,
        BuildError::StageFailed {
            stage: Stage::Validate,
            ..
        }
    ));
    let log = BuildLog::load(&env.output).unwrap();
    let error = log.stages[0].error.as_deref().unwrap();
    assert!(error.contains("packages.debs[1].local_path"), "{}", error);
}

#[test]
fn build_error_wins_when_the_log_cannot_be_written() {
    let env = TestEnv::new();
    // A directory where the JSON log should go makes the log write fail.
    fs::create_dir_all(env.output.join("build-log.json")).unwrap();
    let config = env.write_config(&format!(
        "[hardware]\nvendor = \"acme\"\n[encryption]\nenabled = false\n{}",
        USER
    ));

    let err = run_build(&env.options(&config)).unwrap_err();
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn failed_rebuild_keeps_previous_bundle() {
    let env = TestEnv::new();
    let config = env.write_config(&format!("[encryption]\nenabled = false\n{}", USER));
    let good = run_build(&env.options(&config)).unwrap();
    let digest = good.bundle_digest.unwrap();

    env.write_config(&format!(
        "[encryption]\nenabled = false\n[[packages.debs]]\nlocal_path = \"missing_1.0_amd64.deb\"\n{}",
        USER
    ));
    let err = run_build(&env.options(&config)).unwrap_err();
    assert!(matches!(err.root_cause(), BuildError::NotFound { asset, .. } if asset == "missing_1.0_amd64"));
    assert_eq!(err.exit_code(), 1);

    let bundle = env.output.join(BUNDLE_DIR);
    assert_eq!(bundle_digest(&bundle).unwrap(), digest);
    let log = BuildLog::load(&env.output).unwrap();
    assert_eq!(status_of(&log, Stage::AcquireAssets), Some(StageStatus::Failed));
    assert_eq!(log.record(Stage::Publish), None);
}

#[test]
fn cancelled_build_maps_to_exit_code_130() {
    let env = TestEnv::new();
    let config = env.write_config(&format!("[encryption]\nenabled = false\n{}", USER));
    let opts = env.options(&config);
    opts.cancel.cancel();

    let err = run_build(&opts).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.exit_code(), 130);
    let log = BuildLog::load(&env.output).unwrap();
    assert_eq!(log.status, StageStatus::Cancelled);
}

// =============================================================================
// Installer
// =============================================================================

#[cfg(unix)]
#[test]
fn installer_success_records_iso_path() {
    let env = TestEnv::new();
    let config = env.write_config(&format!("[encryption]\nenabled = false\n{}", USER));
    let mut opts = env.options(&config);
    opts.installer = Some("true".to_string());

    let report = run_build(&opts).unwrap();
    assert_eq!(
        report.iso_path,
        Some(env.output.join("ubuntu-24.04-desktop-generic.iso"))
    );
    assert_eq!(
        status_of(&report.log, Stage::InvokeInstaller),
        Some(StageStatus::Success)
    );
}

#[cfg(unix)]
#[test]
fn installer_failure_maps_to_exit_code_3_and_keeps_bundle() {
    let env = TestEnv::new();
    let config = env.write_config(&format!("[encryption]\nenabled = false\n{}", USER));
    let mut opts = env.options(&config);
    opts.installer = Some("false".to_string());

    let err = run_build(&opts).unwrap_err();
    assert_eq!(err.exit_code(), 3);
    assert!(matches!(err.root_cause(), BuildError::ExternalTool { .. }));
    assert!(env.output.join(BUNDLE_DIR).join(autoinstall::USER_DATA).is_file());
    let log = BuildLog::load(&env.output).unwrap();
    assert_eq!(status_of(&log, Stage::Publish), Some(StageStatus::Success));
    assert_eq!(
        status_of(&log, Stage::InvokeInstaller),
        Some(StageStatus::Failed)
    );
}

#[test]
fn missing_installer_program_is_reported() {
    let env = TestEnv::new();
    let config = env.write_config(&format!("[encryption]\nenabled = false\n{}", USER));
    let mut opts = env.options(&config);
    opts.installer = Some("definitely-not-an-installer-xyz".to_string());

    let err = run_build(&opts).unwrap_err();
    assert_eq!(err.exit_code(), 3);
    assert!(err.root_cause().to_string().contains("definitely-not-an-installer-xyz"));
}

// =============================================================================
// Remote assets
// =============================================================================

fn remote_deb_config(url: &str, checksum: &str) -> String {
    format!(
        "[encryption]\nenabled = false\n[[packages.debs]]\nurl = \"{}\"\nchecksum = \"{}\"\n{}",
        url, checksum, USER
    )
}

#[test]
fn checksum_mismatch_admits_nothing_to_cache() {
    let body = b"!<arch>\nserved".to_vec();
    let server = MockServer::start(vec![(200, body.clone())]);
    let env = TestEnv::new();
    let wrong = sha256_hex(b"something else");
    let config = env.write_config(&remote_deb_config(&server.url("tool_1.0_amd64.deb"), &wrong));

    let err = run_build(&env.options(&config)).unwrap_err();
    match err.root_cause() {
        BuildError::Integrity {
            asset,
            expected,
            actual,
        } => {
            assert_eq!(asset, "tool_1.0_amd64");
            assert_eq!(expected, &wrong);
            assert_eq!(actual, &sha256_hex(&body));
        }
        other => panic!("expected integrity error, got {:?}", other),
    }

    let cache = AssetCache::open(&env.cache).unwrap();
    assert!(cache.get(&sha256_hex(&body)).unwrap().is_none());
    assert_eq!(cache.status().unwrap().blobs, 0);
}

#[test]
fn transient_errors_are_retried_then_served_offline() {
    let body = b"!<arch>\nretried".to_vec();
    let server = MockServer::start(vec![(503, Vec::new()), (200, body.clone())]);
    let env = TestEnv::new();
    let sum = sha256_hex(&body);
    let config = env.write_config(&remote_deb_config(&server.url("tool_1.0_amd64.deb"), &sum));

    let report = run_build(&env.options(&config)).unwrap();
    assert_eq!(server.hits(), 2);
    let bundle = report.bundle_dir.unwrap();
    assert_eq!(
        fs::read(bundle.join("first-boot/assets/packages/tool_1.0_amd64.deb")).unwrap(),
        body
    );

    // Offline rebuild is served from the cache without touching the server.
    let mut offline = env.options(&config);
    offline.mode = SourcingMode::Local;
    let again = run_build(&offline).unwrap();
    assert_eq!(server.hits(), 2);
    assert_eq!(again.bundle_digest, report.bundle_digest);
}

#[test]
fn permanent_http_errors_fail_without_retry() {
    let server = MockServer::start(vec![(404, Vec::new())]);
    let env = TestEnv::new();
    let config = env.write_config(&remote_deb_config(
        &server.url("tool_1.0_amd64.deb"),
        &sha256_hex(b"x"),
    ));

    let err = run_build(&env.options(&config)).unwrap_err();
    assert_eq!(server.hits(), 1);
    match err.root_cause() {
        BuildError::Network { message, .. } => assert!(message.contains("404")),
        other => panic!("expected network error, got {:?}", other),
    }
}
