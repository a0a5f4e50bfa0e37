//! Tidewire Protocol - Core types and constants.
//!
//! This module has minimal dependencies and is always included.

mod constants;
mod error;

pub use constants::*;
pub use error::*;
