//! Hardware probing and model support filtering.
//!
//! The probe builds a [`probe::HardwareSnapshot`] once per process (cached
//! on disk across restarts, keyed by application version); the support
//! filter uses it to decide which catalog entries can run on this host and
//! why the rest cannot.

pub mod cache;
pub mod probe;
pub mod stats;
pub mod support;

pub use cache::load_or_probe;
pub use probe::{DeviceInfo, HardwareSnapshot};
pub use support::SupportFilter;
