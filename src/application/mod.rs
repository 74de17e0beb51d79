//! Application services backing the demo HTTP surface.

pub mod error;
pub mod items;
pub mod settings;
