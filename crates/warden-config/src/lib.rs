//! Warden Config - layered configuration and the hardening gate.
//!
//! Configuration merges four layers, later layers winning:
//! built-in defaults, a YAML/JSON config file, environment variables,
//! and CLI flag overrides. Secret references (`env`/`file`/`vault`)
//! are resolved at startup; missing secrets abort. The production
//! hardening gate evaluates the deployment checklist and reports the
//! full list of failures so operators fix them in one pass.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod error;
pub mod hardening;
pub mod loader;
pub mod secrets;
pub mod types;

pub use error::{ConfigError, ConfigResult};
pub use hardening::{HardeningCheck, HardeningReport, evaluate_hardening};
pub use loader::{Overrides, load, load_from};
pub use secrets::{SecretRef, SecretResolver};
pub use types::Config;
