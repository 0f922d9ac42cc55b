//! The _keycustody_ library crate.
//!
//! Generates and uses private keys held by a PKCS#11 module, a cloud KMS,
//! or an in-memory store for tests, behind the [`crypto::Provider`]
//! contract. Keys are referenced by `pkcs11:` URIs, never by their bytes.

pub mod commons;
pub mod config;
pub mod constants;
pub mod crypto;
