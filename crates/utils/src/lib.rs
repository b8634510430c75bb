//! Shared error types for the murk crates.

pub mod errors;
