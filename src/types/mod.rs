//! Shared types for elohim-stash

pub mod error;

pub use error::{Result, StashError};
