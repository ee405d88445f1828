//! Property-based tests for class resolution.
//!
//! Documents are generated from the knobs that drive the rule table and
//! must always validate; the resolved class list is then checked for the
//! ordering and uniqueness guarantees installers rely on.

use std::collections::HashSet;

use autoinstall_builder::classes::{category_of, resolve_classes};
use autoinstall_builder::generate::resolve_packages;
use autoinstall_builder::BuildConfiguration;
use proptest::prelude::*;

// ============================================================================
// Generated documents
// ============================================================================

const KNOWN_PACKAGES: &[&str] = &[
    "git", "vim", "nodejs", "vlc", "gimp", "libreoffice", "evince", "ufw", "clamav", "docker.io",
    "htop", "tmux",
];

#[derive(Debug, Clone)]
struct Knobs {
    vendor: &'static str,
    encrypted: bool,
    key_size: u32,
    target_ssd: bool,
    disk_gb: Option<u32>,
    apt: Vec<&'static str>,
    dhcp: bool,
    sudo: bool,
    ssh_key: bool,
    automated_scripts: usize,
    manual_scripts: usize,
    first_boot: bool,
}

impl Knobs {
    fn document(&self) -> String {
        let mut doc = String::new();
        doc.push_str(&format!(
            "[hardware]\nvendor = \"{}\"\ntarget_ssd = {}\n",
            self.vendor, self.target_ssd
        ));
        if let Some(gb) = self.disk_gb {
            doc.push_str(&format!("disk_size_min_gb = {}\n", gb));
        }
        doc.push_str(&format!("[encryption]\nenabled = {}\n", self.encrypted));
        if self.encrypted {
            doc.push_str(&format!(
                "passphrase = \"Correct-Horse-42\"\nkey_size = {}\n",
                self.key_size
            ));
        }
        let apt: Vec<String> = self.apt.iter().map(|p| format!("\"{}\"", p)).collect();
        doc.push_str(&format!("[packages]\napt_packages = [{}]\n", apt.join(", ")));
        doc.push_str(&format!(
            "[network]\ndhcp = {}\n[user]\nusername = \"ada\"\npassword = \"s3cret-pass\"\nsudo_nopasswd = {}\n",
            self.dhcp, self.sudo
        ));
        if self.ssh_key {
            doc.push_str("ssh_authorized_keys = [\"ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIE ada@box\"]\n");
        }
        doc.push_str(&format!("[first_boot]\nenabled = {}\n", self.first_boot));
        for i in 0..self.automated_scripts {
            doc.push_str(&format!(
                "[[first_boot.scripts]]\nurl = \"https://example.org/auto-{}.sh\"\n",
                i
            ));
        }
        for i in 0..self.manual_scripts {
            doc.push_str(&format!(
                "[[first_boot.scripts]]\nurl = \"https://example.org/manual-{}.sh\"\ntype = \"manual\"\n",
                i
            ));
        }
        doc
    }

    fn config(&self) -> BuildConfiguration {
        let doc = self.document();
        match BuildConfiguration::from_toml_str(&doc) {
            Ok(config) => config,
            Err(err) => panic!("generated document rejected: {}\n{}", err, doc),
        }
    }
}

fn knobs() -> impl Strategy<Value = Knobs> {
    (
        prop::sample::select(vec!["dell", "lenovo", "hp", "generic"]),
        any::<bool>(),
        prop::sample::select(vec![256u32, 512]),
        any::<bool>(),
        prop::option::of(20u32..2000),
        prop::sample::subsequence(KNOWN_PACKAGES.to_vec(), 0..6),
        (any::<bool>(), any::<bool>(), any::<bool>()),
        (0usize..3, 0usize..3, any::<bool>()),
    )
        .prop_map(
            |(vendor, encrypted, key_size, target_ssd, disk_gb, apt, access, scripts)| Knobs {
                vendor,
                encrypted,
                key_size,
                target_ssd,
                disk_gb,
                apt,
                dhcp: access.0,
                sudo: access.1,
                ssh_key: access.2,
                automated_scripts: scripts.0,
                manual_scripts: scripts.1,
                first_boot: scripts.2,
            },
        )
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn resolution_is_deterministic(k in knobs()) {
        let config = k.config();
        prop_assert_eq!(resolve_classes(&config), resolve_classes(&config));
        // A second parse of the same document resolves identically too.
        prop_assert_eq!(resolve_classes(&config), resolve_classes(&k.config()));
    }

    #[test]
    fn classes_are_unique_and_framed(k in knobs()) {
        let classes = resolve_classes(&k.config());
        let tags: Vec<&str> = classes.iter().collect();

        let unique: HashSet<&str> = tags.iter().copied().collect();
        prop_assert_eq!(unique.len(), tags.len());
        prop_assert_eq!(&tags[..3], &["UBUNTU", "UBUNTU_DESKTOP", "AMD64"]);
        prop_assert_eq!(tags.last().copied(), Some("LAST"));
    }

    #[test]
    fn categories_never_go_backwards(k in knobs()) {
        let config = k.config();
        let classes = resolve_classes(&config);
        let categories: Vec<_> = classes
            .iter()
            .map(|tag| category_of(&config, tag))
            .collect();
        prop_assert!(categories.iter().all(Option::is_some));
        prop_assert!(categories.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn exactly_one_disk_layout_class(k in knobs()) {
        let classes = resolve_classes(&k.config());
        prop_assert!(classes.contains("UBUNTU_ENCRYPTED") != classes.contains("DISK_PLAIN"));
        prop_assert_eq!(classes.contains("UBUNTU_ENCRYPTED"), k.encrypted);
        prop_assert_eq!(
            classes.iter().any(|t| t.starts_with("LUKS_")),
            k.encrypted
        );
    }

    #[test]
    fn first_boot_classes_need_enabled_first_boot(k in knobs()) {
        let classes = resolve_classes(&k.config());
        prop_assert_eq!(
            classes.contains("FIRSTBOOT_AUTOMATED"),
            k.first_boot && k.automated_scripts > 0
        );
        prop_assert_eq!(
            classes.contains("FIRSTBOOT_MANUAL"),
            k.first_boot && k.manual_scripts > 0
        );
    }

    #[test]
    fn package_list_is_unique_and_keeps_user_order(k in knobs()) {
        let config = k.config();
        let packages = resolve_packages(&config);
        let unique: HashSet<&String> = packages.iter().collect();
        prop_assert_eq!(unique.len(), packages.len());

        let positions: Vec<usize> = k
            .apt
            .iter()
            .map(|p| packages.iter().position(|q| q == p).unwrap())
            .collect();
        prop_assert!(positions.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(packages.iter().any(|p| p == "cryptsetup"), k.encrypted);
    }
}
