//! The model catalog: merged registry of built-in, user-registered, and
//! auto-discovered models with their derived download state.
//!
//! [`store::Catalog`] is the public face; `sources` owns the three on-disk
//! JSON files, `discovery` the `.gguf` scan, and `resolve` the
//! checkpoint-to-path rules.

pub mod discovery;
pub mod resolve;
pub mod sources;
pub mod store;

pub use store::{Catalog, CatalogPaths, UserModelSpec};
