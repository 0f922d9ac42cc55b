#![allow(dead_code)] // Different tests use different parts.

use std::fs;
use std::path::{Path, PathBuf};

use keycustody::crypto::signers::pkcs11::mockmodule::MockModule;
use keycustody::crypto::signers::pkcs11::Pkcs11Provider;
use keycustody::crypto::{HashAlg, PrivateKey, SignerOpts};
use keycustody::config::TokenConfig;
use secrecy::SecretString;

pub const TOKEN_LABEL: &str = "keycustody-test";
pub const PIN: &str = "1234";

/// The config for the single token of [`mock_module`].
pub fn mock_config() -> TokenConfig {
    TokenConfig::new("SoftHSM", "SoftHSM v2")
        .with_token_label(TOKEN_LABEL)
        .with_pin(SecretString::new(PIN.to_string()))
}

pub fn mock_module() -> MockModule {
    MockModule::with_token(TOKEN_LABEL, PIN)
}

pub fn mock_provider() -> Pkcs11Provider<MockModule> {
    Pkcs11Provider::open_with(&mock_config(), mock_module()).unwrap()
}

/// Signs a SHA-256 digest of `data` and checks the signature.
pub fn sign_and_verify(key: &dyn PrivateKey, data: &[u8], opts: SignerOpts) {
    let digest = opts.hash.digest(data).unwrap();
    let signature = key.sign(&digest, &opts).unwrap();
    assert!(
        key.public_key().verify(&digest, &signature, &opts).unwrap(),
        "signature over {:?} did not verify",
        String::from_utf8_lossy(data)
    );
}

pub fn sha256_opts() -> SignerOpts {
    SignerOpts::hash(HashAlg::Sha256)
}

/// Writes a token config file and returns its path.
pub fn write_config(dir: &Path, name: &str, json: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, json).unwrap();
    path
}
