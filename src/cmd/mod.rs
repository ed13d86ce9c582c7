//! Command-line entry points.

pub mod extract;
pub mod schema;
pub mod serve;
