//! Installer class resolution.
//!
//! Classes are opaque uppercase tags the installer uses to select disk
//! layouts, package lists and hooks. They are derived from the configuration
//! by walking [`RULES`] once, top to bottom. The table order is the output
//! order, so adding a rule means deciding where its tag belongs.

use std::collections::HashSet;
use std::fmt;

use crate::config::{BuildConfiguration, HardwareVendor, ScriptType};

/// Ordered, duplicate-free list of class tags.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassSet {
    tags: Vec<String>,
}

impl ClassSet {
    fn push(&mut self, tag: String) {
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.tags
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Space-separated form used in the installer environment.
    pub fn joined(&self) -> String {
        self.tags.join(" ")
    }
}

impl fmt::Display for ClassSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined())
    }
}

/// Rule categories, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    Base,
    Hardware,
    Storage,
    Encryption,
    Software,
    Network,
    Access,
    FirstBoot,
    Terminal,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Base => "base",
            Category::Hardware => "hardware",
            Category::Storage => "storage",
            Category::Encryption => "encryption",
            Category::Software => "software",
            Category::Network => "network",
            Category::Access => "access",
            Category::FirstBoot => "first-boot",
            Category::Terminal => "terminal",
        }
    }
}

enum Tag {
    Fixed(&'static str),
    Derived(fn(&BuildConfiguration) -> String),
}

pub struct Rule {
    pub category: Category,
    when: fn(&BuildConfiguration) -> bool,
    tag: Tag,
}

impl Rule {
    const fn fixed(
        category: Category,
        when: fn(&BuildConfiguration) -> bool,
        tag: &'static str,
    ) -> Self {
        Self {
            category,
            when,
            tag: Tag::Fixed(tag),
        }
    }

    const fn derived(
        category: Category,
        when: fn(&BuildConfiguration) -> bool,
        tag: fn(&BuildConfiguration) -> String,
    ) -> Self {
        Self {
            category,
            when,
            tag: Tag::Derived(tag),
        }
    }

    fn apply(&self, config: &BuildConfiguration) -> Option<String> {
        if !(self.when)(config) {
            return None;
        }
        Some(match &self.tag {
            Tag::Fixed(tag) => (*tag).to_string(),
            Tag::Derived(f) => f(config),
        })
    }
}

/// Disk size at or above which `DISK_LARGE` is selected.
pub const LARGE_DISK_GB: u32 = 500;

pub const DEVELOPMENT_PACKAGES: &[&str] = &[
    "git",
    "vim",
    "code",
    "build-essential",
    "python3-pip",
    "nodejs",
    "npm",
];
pub const MULTIMEDIA_PACKAGES: &[&str] = &["vlc", "gimp", "audacity", "obs-studio", "ffmpeg"];
pub const OFFICE_PACKAGES: &[&str] = &["libreoffice", "thunderbird", "evince"];
pub const SECURITY_PACKAGES: &[&str] = &["ufw", "fail2ban", "clamav", "apparmor-utils"];
pub const DOCKER_PACKAGES: &[&str] = &["docker.io", "docker-ce", "docker-compose", "docker"];

fn always(_: &BuildConfiguration) -> bool {
    true
}

fn uses_any(config: &BuildConfiguration, set: &[&str]) -> bool {
    config
        .packages
        .apt
        .iter()
        .chain(config.packages.snaps.iter())
        .any(|p| set.contains(&p.as_str()))
}

fn has_script_type(config: &BuildConfiguration, kind: ScriptType) -> bool {
    config.active_scripts().iter().any(|s| s.kind == kind)
}

/// The class rule table.
pub static RULES: &[Rule] = &[
    Rule::fixed(Category::Base, always, "UBUNTU"),
    Rule::fixed(Category::Base, always, "UBUNTU_DESKTOP"),
    Rule::fixed(Category::Base, always, "AMD64"),
    Rule::derived(
        Category::Hardware,
        |c| c.hardware.vendor != HardwareVendor::Generic,
        |c| format!("HARDWARE_{}", c.hardware.vendor.as_str().to_ascii_uppercase()),
    ),
    Rule::fixed(Category::Storage, |c| c.hardware.target_ssd, "TARGET_SSD"),
    Rule::fixed(
        Category::Storage,
        |c| matches!(c.hardware.disk_size_min_gb, Some(gb) if gb >= LARGE_DISK_GB),
        "DISK_LARGE",
    ),
    Rule::fixed(
        Category::Storage,
        |c| matches!(c.hardware.disk_size_min_gb, Some(gb) if gb < LARGE_DISK_GB),
        "DISK_STANDARD",
    ),
    Rule::fixed(Category::Encryption, |c| c.encryption.enabled, "UBUNTU_ENCRYPTED"),
    Rule::derived(
        Category::Encryption,
        |c| c.encryption.enabled,
        |c| format!("LUKS_{}", c.encryption.cipher.class_fragment()),
    ),
    Rule::derived(
        Category::Encryption,
        |c| c.encryption.enabled,
        |c| format!("LUKS_KEYSIZE_{}", c.encryption.key_size.bits()),
    ),
    Rule::fixed(Category::Encryption, |c| !c.encryption.enabled, "DISK_PLAIN"),
    Rule::fixed(Category::Software, |c| c.has_custom_packages(), "CUSTOM_SOFTWARE"),
    Rule::fixed(
        Category::Software,
        |c| uses_any(c, DEVELOPMENT_PACKAGES),
        "DEVELOPMENT",
    ),
    Rule::fixed(
        Category::Software,
        |c| uses_any(c, MULTIMEDIA_PACKAGES),
        "MULTIMEDIA",
    ),
    Rule::fixed(Category::Software, |c| uses_any(c, OFFICE_PACKAGES), "OFFICE"),
    Rule::fixed(
        Category::Software,
        |c| uses_any(c, SECURITY_PACKAGES),
        "SECURITY",
    ),
    Rule::fixed(Category::Software, |c| uses_any(c, DOCKER_PACKAGES), "DOCKER"),
    Rule::fixed(Category::Network, |c| c.network.dhcp, "NETWORK_DHCP"),
    Rule::fixed(Category::Network, |c| !c.network.dhcp, "NETWORK_STATIC"),
    Rule::fixed(
        Category::Access,
        |c| !c.user.ssh_authorized_keys.is_empty(),
        "SSH_KEYS",
    ),
    Rule::fixed(Category::Access, |c| c.user.sudo_nopasswd, "SUDO_NOPASSWD"),
    Rule::fixed(
        Category::FirstBoot,
        |c| has_script_type(c, ScriptType::Automated),
        "FIRSTBOOT_AUTOMATED",
    ),
    Rule::fixed(
        Category::FirstBoot,
        |c| has_script_type(c, ScriptType::Manual),
        "FIRSTBOOT_MANUAL",
    ),
    Rule::fixed(Category::Terminal, always, "LAST"),
];

/// Resolve the class list for a configuration.
pub fn resolve_classes(config: &BuildConfiguration) -> ClassSet {
    let mut set = ClassSet::default();
    for rule in RULES {
        if let Some(tag) = rule.apply(config) {
            set.push(tag);
        }
    }
    set
}

/// Category of the rule that produced `tag`, if any rule can produce it.
pub fn category_of(config: &BuildConfiguration, tag: &str) -> Option<Category> {
    RULES
        .iter()
        .find(|rule| rule.apply(config).as_deref() == Some(tag))
        .map(|rule| rule.category)
}

/// Verify that every referenced tag was emitted, naming the ones that were not.
pub fn missing_classes<'a>(set: &ClassSet, referenced: &[&'a str]) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    referenced
        .iter()
        .copied()
        .filter(|tag| !set.contains(tag) && seen.insert(*tag))
        .collect()
}
