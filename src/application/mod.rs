//! Application services layer.

pub mod articles;
pub mod error;
pub mod repos;
