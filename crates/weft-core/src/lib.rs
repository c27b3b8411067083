//! # weft-core
//! Foundation types, constants and traits shared by the Weft crates.

pub mod constants;
pub mod error;
pub mod traits;
pub mod types;
