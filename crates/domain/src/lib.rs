//! Shared domain types for the lemonade gateway.
//!
//! Everything the other crates agree on lives here: the error enum, the
//! model catalog entities (recipes, device classes, entries), typed recipe
//! options with their merge rules, and the server configuration.

pub mod config;
pub mod error;
pub mod model;
pub mod options;

pub use error::{Error, Result};
