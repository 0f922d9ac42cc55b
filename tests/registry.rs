//! Loads providers from token config files and uses them through `Crypto`.

use std::sync::Arc;

use keycustody::commons::error::Error;
use keycustody::config::TokenConfig;
use keycustody::crypto::signers::pkcs11::Pkcs11Provider;
use keycustody::crypto::{Curve, KeyPurpose, Loader, Provider, ProviderRegistry};

mod common;

/// A loader that opens the token named in the config in a fresh mock
/// module, the way the native loader would open the configured library.
fn mock_loader() -> Loader {
    Arc::new(|config: &TokenConfig| {
        let provider = Pkcs11Provider::open_with(config, common::mock_module())?;
        Ok(Arc::new(provider) as Arc<dyn Provider>)
    })
}

fn registry() -> ProviderRegistry {
    let registry = ProviderRegistry::with_defaults();
    registry.register("SoftHSM", mock_loader()).unwrap();
    registry
}

#[test]
fn load_default_and_additional_provider() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("user.pin"), format!("{}\n", common::PIN)).unwrap();
    let hsm = common::write_config(
        dir.path(),
        "hsm.json",
        &format!(
            r#"{{
                "Manufacturer": "SoftHSM",
                "Model": "SoftHSM v2",
                "TokenLabel": "{}",
                "Pin": "file:user.pin",
                "Attributes": "MaxSessions=4"
            }}"#,
            common::TOKEN_LABEL
        ),
    );
    let inmem = common::write_config(dir.path(), "inmem.json", r#"{"Manufacturer": "inmem", "Model": "test"}"#);

    let crypto = registry().load(&hsm, &[inmem]).unwrap();
    assert_eq!(crypto.manufacturers(), vec!["SoftHSM", "inmem"]);
    assert_eq!(crypto.default().manufacturer(), "SoftHSM");

    let key = crypto
        .default()
        .generate_rsa_key("registry", 2048, KeyPurpose::Signing)
        .unwrap();
    let (id, _) = crypto.default().identify_key(key.as_ref()).unwrap();
    let (uri, _) = crypto.default().export_key(&id).unwrap();

    let loaded = crypto.load_private_key(&uri).unwrap();
    assert_eq!(loaded.public_key(), key.public_key());
    common::sign_and_verify(loaded.as_ref(), b"loaded by uri", common::sha256_opts());

    let soft = crypto.by_manufacturer("inmem").unwrap();
    let soft_key = soft.generate_ecdsa_key("soft", Curve::P256).unwrap();
    common::sign_and_verify(soft_key.as_ref(), b"in memory", common::sha256_opts());

    crypto.close().unwrap();
    assert!(matches!(
        crypto.default().get_key(&id).unwrap_err().kind(),
        Error::Closed
    ));
}

#[test]
fn wrong_pin_fails_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let hsm = common::write_config(
        dir.path(),
        "hsm.json",
        &format!(
            r#"{{"Manufacturer": "SoftHSM", "TokenLabel": "{}", "Pin": "0000"}}"#,
            common::TOKEN_LABEL
        ),
    );
    assert!(registry().load(&hsm, &[]).is_err());
}

#[test]
fn unregistered_manufacturer_fails_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let inmem = common::write_config(dir.path(), "inmem.json", r#"{"Manufacturer": "inmem"}"#);
    let acme = common::write_config(dir.path(), "acme.json", r#"{"Manufacturer": "Acme"}"#);

    let err = registry().load(&inmem, &[acme]).unwrap_err();
    assert!(matches!(err, Error::NotRegistered(name) if name == "Acme"));
}

#[test]
fn provider_from_token_uri() {
    let config = TokenConfig::from_uri(&format!(
        "pkcs11:manufacturer=SoftHSM;model=SoftHSM%20v2;token={}?pin-value={}",
        common::TOKEN_LABEL,
        common::PIN
    ))
    .unwrap();
    let provider = registry().load_provider_from_config(&config).unwrap();
    assert_eq!(provider.model(), "SoftHSM v2");
    provider.generate_ecdsa_key("from-uri", Curve::P521).unwrap();
}
