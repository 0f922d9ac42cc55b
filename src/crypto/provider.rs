//! The capabilities every key custody backend offers.
use std::{fmt, sync::Arc};

use serde::Serialize;

use crate::commons::error::Error;
use crate::crypto::keys::{Curve, KeyPurpose, PrivateKey};

//------------ Provider ------------------------------------------------------

/// A backend that generates and holds private keys.
///
/// One provider is bound to one backend connection for its whole life: a
/// token in a PKCS#11 module, a KMS account and region, or an in-memory
/// key store. Calls may come from many threads at once and each of them
/// blocks until the backend answers.
///
/// Once [`Provider::close`] was called, every other call fails with
/// [`Error::Closed`].
pub trait Provider: fmt::Debug + Send + Sync {
    /// The manufacturer name this provider is registered under.
    fn manufacturer(&self) -> &str;

    fn model(&self) -> &str;

    /// Generates an RSA key pair.
    ///
    /// An empty label is replaced by a generated one. Keys shorter than
    /// 2048 bits are refused.
    fn generate_rsa_key(&self, label: &str, bits: u32, purpose: KeyPurpose) -> Result<Arc<dyn PrivateKey>, Error>;

    /// Generates an ECDSA key pair on the given curve.
    fn generate_ecdsa_key(&self, label: &str, curve: Curve) -> Result<Arc<dyn PrivateKey>, Error>;

    /// Returns the id and label of a key of this provider.
    fn identify_key(&self, key: &dyn PrivateKey) -> Result<(String, String), Error>;

    /// Returns a key reference URI for the key, and its private key bytes
    /// if the backend allows those to leave it at all.
    fn export_key(&self, key_id: &str) -> Result<(String, Option<Vec<u8>>), Error>;

    fn get_key(&self, key_id: &str) -> Result<Arc<dyn PrivateKey>, Error>;

    /// The key management capability, for backends that have one.
    fn key_manager(&self) -> Option<&dyn KeyManager> {
        None
    }

    /// Releases the backend.
    fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

//------------ KeyManager ----------------------------------------------------

/// Enumeration and removal of keys, for backends with slots and tokens.
pub trait KeyManager: Send + Sync {
    /// The slot the provider works with.
    fn current_slot_id(&self) -> u64;

    fn enum_tokens(&self, current_only: bool) -> Result<Vec<SlotTokenInfo>, Error>;

    /// Lists the private keys in a slot whose label starts with `prefix`.
    fn enum_keys(&self, slot: u64, prefix: &str) -> Result<Vec<KeyDescription>, Error>;

    /// Removes both halves of a key pair. This cannot be undone.
    fn destroy_key_pair_on_slot(&self, slot: u64, key_id: &str) -> Result<(), Error>;

    /// Finds a key pair by id and/or label. An empty id or label matches
    /// any.
    fn find_key_pair_on_slot(&self, slot: u64, key_id: &str, label: &str) -> Result<Arc<dyn PrivateKey>, Error>;

    fn key_info(&self, slot: u64, key_id: &str, include_public: bool) -> Result<KeyDescription, Error>;
}

//------------ SlotTokenInfo -------------------------------------------------

/// A snapshot of a slot and the token in it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SlotTokenInfo {
    pub id: u64,
    pub description: String,
    pub label: String,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub flags: u64,
}

impl fmt::Display for SlotTokenInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "slot {}: '{}' ({} {}), serial '{}', token '{}', flags {:#x}",
            self.id, self.description, self.manufacturer, self.model, self.serial, self.label, self.flags
        )
    }
}

//------------ KeyDescription ------------------------------------------------

/// What is known about a key without using it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct KeyDescription {
    pub id: String,
    pub label: String,

    /// RSA, ECDSA, DSA or whatever else the backend calls it.
    pub algorithm: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_pem: Option<String>,
}
