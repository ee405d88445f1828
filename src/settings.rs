//! Tool settings.
//!
//! Read from the process environment, which the binary first seeds from an
//! optional `.env` file via `dotenvy`. Command-line flags take precedence
//! over everything here.

use std::path::PathBuf;

use crate::cache::AssetCache;
use crate::error::ConfigValidationError;

pub const ENV_CACHE_DIR: &str = "AUTOINSTALL_CACHE_DIR";
pub const ENV_OUTPUT_DIR: &str = "AUTOINSTALL_OUTPUT_DIR";
pub const ENV_ASSETS_ROOT: &str = "AUTOINSTALL_ASSETS_ROOT";
pub const ENV_CONCURRENCY: &str = "AUTOINSTALL_CONCURRENCY";
pub const ENV_FETCH_RETRIES: &str = "AUTOINSTALL_FETCH_RETRIES";
pub const ENV_INSTALLER: &str = "AUTOINSTALL_INSTALLER";

pub const DEFAULT_OUTPUT_DIR: &str = "output";
pub const DEFAULT_ASSETS_ROOT: &str = "local_assets";
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_FETCH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Content-addressed asset cache (default: `<user cache>/autoinstall-builder`)
    pub cache_dir: PathBuf,
    /// Where `bundle/` and the build logs go (default: `output`)
    pub output_dir: PathBuf,
    /// Root scanned in auto-scan mode (default: `local_assets`)
    pub assets_root: PathBuf,
    pub concurrency: usize,
    /// Attempts per remote asset, first try included.
    pub fetch_attempts: u32,
    /// Installer program; `None` means the default `fai-cd`.
    pub installer: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigValidationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigValidationError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut problems = Vec::new();

        let concurrency = match get(ENV_CONCURRENCY) {
            None => DEFAULT_CONCURRENCY,
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if (1..=64).contains(&n) => n,
                _ => {
                    problems.push((ENV_CONCURRENCY, format!("expected 1..=64, got '{}'", raw)));
                    DEFAULT_CONCURRENCY
                }
            },
        };
        let fetch_attempts = match get(ENV_FETCH_RETRIES) {
            None => DEFAULT_FETCH_ATTEMPTS,
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(n) if (1..=10).contains(&n) => n,
                _ => {
                    problems.push((ENV_FETCH_RETRIES, format!("expected 1..=10, got '{}'", raw)));
                    DEFAULT_FETCH_ATTEMPTS
                }
            },
        };
        if !problems.is_empty() {
            return Err(ConfigValidationError {
                problems: problems
                    .into_iter()
                    .map(|(field, message)| crate::error::FieldError::new(field, message))
                    .collect(),
            });
        }

        Ok(Self {
            cache_dir: get(ENV_CACHE_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(AssetCache::default_root),
            output_dir: get(ENV_OUTPUT_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            assets_root: get(ENV_ASSETS_ROOT)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ASSETS_ROOT)),
            concurrency,
            fetch_attempts,
            installer: get(ENV_INSTALLER),
        })
    }

    /// Print settings for debugging.
    pub fn print(&self) {
        println!("Settings:");
        println!("  {}: {}", ENV_CACHE_DIR, self.cache_dir.display());
        println!("  {}: {}", ENV_OUTPUT_DIR, self.output_dir.display());
        println!("  {}: {}", ENV_ASSETS_ROOT, self.assets_root.display());
        println!("  {}: {}", ENV_CONCURRENCY, self.concurrency);
        println!("  {}: {}", ENV_FETCH_RETRIES, self.fetch_attempts);
        println!(
            "  {}: {}",
            ENV_INSTALLER,
            self.installer
                .as_deref()
                .unwrap_or(crate::preflight::DEFAULT_INSTALLER)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.output_dir, PathBuf::from("output"));
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.fetch_attempts, 3);
        assert_eq!(settings.installer, None);
        assert!(settings.cache_dir.ends_with("autoinstall-builder"));
    }

    #[test]
    fn environment_overrides_defaults() {
        let settings = Settings::from_lookup(lookup(&[
            (ENV_CACHE_DIR, "/tmp/cache"),
            (ENV_CONCURRENCY, "8"),
            (ENV_INSTALLER, "/usr/sbin/fai-cd"),
        ]))
        .unwrap();
        assert_eq!(settings.cache_dir, PathBuf::from("/tmp/cache"));
        assert_eq!(settings.concurrency, 8);
        assert_eq!(settings.installer.as_deref(), Some("/usr/sbin/fai-cd"));
    }

    #[test]
    fn bad_numbers_are_all_reported() {
        let err = Settings::from_lookup(lookup(&[
            (ENV_CONCURRENCY, "0"),
            (ENV_FETCH_RETRIES, "many"),
        ]))
        .unwrap_err();
        assert!(err.mentions(ENV_CONCURRENCY));
        assert!(err.mentions(ENV_FETCH_RETRIES));
    }
}
