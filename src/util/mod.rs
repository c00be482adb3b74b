//! Process-level helpers.
//!
//! - [`telemetry`] - Logging and OpenTelemetry setup (feature `telemetry`)

#[cfg(feature = "telemetry")]
pub mod telemetry;

#[cfg(feature = "telemetry")]
pub use telemetry::*;
