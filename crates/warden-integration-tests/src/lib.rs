//! End-to-end scenario tests for the Warden control plane.
//!
//! The tests live in `tests/`; this crate intentionally exports
//! nothing.
