//! Utilities shared by the providers and the configuration loader.
pub mod file;
