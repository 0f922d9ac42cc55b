//! Common types used by the various key custody components.
pub mod error;
pub mod util;

