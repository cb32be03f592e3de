//! Common building blocks shared by all Sisyphus crates.
//!
//! This holds the immutable [`Settings`] record, the logging
//! initialisation and the small unit parsers (memory sizes, wall time).
//!

pub use logging::*;
pub use settings::*;
pub use units::*;

mod logging;
mod settings;
mod units;

/// Crate name/version pair, for the version banner.
///
pub fn version() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
