//! Warden Capabilities - signed, time-bounded, scoped permission grants.
//!
//! A capability token grants an agent a set of permissions. Tokens are:
//! - Authenticated by a keyed MAC under a long-lived process secret
//! - Verified in constant time
//! - Time-bounded (optional expiry, lazily pruned)
//! - Scoped to resources by exact match, `/`-separated prefix, or glob
//!
//! Expired or revoked tokens fail closed.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod error;
pub mod manager;
pub mod permission;
pub mod store;
pub mod token;

pub use error::{CapabilityError, CapabilityResult};
pub use manager::{CapabilityManager, CheckResult, GrantRequest, Granter};
pub use permission::{CapabilityCategory, Permission};
pub use store::CapabilityStore;
pub use token::{CapabilityToken, SigningSecrets};
