//! Installer artifact builder for Ubuntu desktop fleets.
//!
//! Turns one declarative build configuration into the artifacts an external
//! installer needs:
//!
//! - **Class tags** - ordered, deterministic FAI classes
//! - **Disk layout** - plain or LUKS + LVM descriptor
//! - **Package list** - base, user, encryption and vendor packages
//! - **Autoinstall** - subiquity `user-data` / `meta-data`
//! - **First-boot bundle** - staged debs and scripts plus a oneshot unit
//!
//! # Architecture
//!
//! ```text
//! config ──► classes ─────────────┐
//!    │                            ▼
//!    └────► assets (+ cache) ──► generate ──► bundle/ ──► installer
//!                                   ▲
//!                     pipeline drives every stage
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use autoinstall_builder::pipeline::{run_build, BuildOptions};
//!
//! let opts = BuildOptions::new("build.toml", "output");
//! let report = run_build(&opts)?;
//! println!("{}", report.classes);
//! # Ok::<(), autoinstall_builder::BuildError>(())
//! ```

pub mod archive;
pub mod assets;
pub mod cache;
pub mod cancel;
pub mod classes;
pub mod config;
pub mod error;
mod fsutil;
pub mod generate;
pub mod pipeline;
pub mod preflight;
pub mod settings;

pub use cancel::CancelFlag;
pub use classes::{resolve_classes, ClassSet};
pub use config::BuildConfiguration;
pub use error::{BuildError, BuildResult, ConfigValidationError, FieldError};
pub use pipeline::{run_build, BuildOptions, BuildReport, Stage, StageSkips};
