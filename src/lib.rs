//! android-debug Library
//!
//! Command line front end for native and managed remote debugging of
//! Android processes. All device work lives in the `adbg-*` crates; this
//! crate parses arguments and reports progress as NDJSON events.

pub mod cli;
pub mod headless;
pub mod signals;

// Re-export main entry points
pub use cli::Args;
pub use headless::run;
