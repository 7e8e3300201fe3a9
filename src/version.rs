//! Engine version information.
//!
//! The version is part of the start/finish banners the host adapter prints, and the agent reports it in its
//! startup log line, so both sides of a context can be matched up in mixed logs.
//!
//! ## Notes
//!
//! - The value is taken from Cargo metadata (`CARGO_PKG_VERSION`) at compile time.
//! - Prefer this constant over repeating `env!("CARGO_PKG_VERSION")` in multiple places.

/// The testhost version string (for example, `0.1.0-alpha.1`).
pub const TESTHOST_VERSION: &str = env!("CARGO_PKG_VERSION");
