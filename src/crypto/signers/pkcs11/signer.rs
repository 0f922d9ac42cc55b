use std::{any::Any, fmt, sync::Arc};

use chrono::Utc;
use log::{debug, info, warn};

use crate::commons::error::Error;
use crate::config::TokenConfig;
use crate::constants::{KEY_ID_RANDOM_BYTES, KEY_LABEL_RANDOM_BYTES, MIN_RSA_KEY_BITS, RSA_PUBLIC_EXPONENT};
use crate::crypto::{
    codec::{self, OaepParams, PssParams},
    keys::{Curve, DecrypterOpts, KeyPurpose, PrivateKey, PublicKey, SignerOpts},
    keyuri::KeyUri,
    provider::{KeyDescription, KeyManager, Provider, SlotTokenInfo},
    signers::pkcs11::{
        driver::{Pkcs11Driver, TokenSelector},
        module::{Attribute, AttributeType, KeyType, Mechanism, Module, ModuleError, ObjectClass, ObjectHandle, Session},
    },
};

//------------ Pkcs11Provider ------------------------------------------------

/// A provider keeping its keys in a token of a PKCS#11 module.
///
/// Keys are generated inside the token as non-extractable token objects.
/// The private key handles returned carry only the object handle and the
/// public key, all private key operations are done by the module.
pub struct Pkcs11Provider<M: Module> {
    manufacturer: String,
    model: String,
    driver: Arc<Pkcs11Driver<M>>,
}

impl<M: Module> Pkcs11Provider<M> {
    pub fn new(manufacturer: &str, model: &str, driver: Pkcs11Driver<M>) -> Self {
        Pkcs11Provider {
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            driver: Arc::new(driver),
        }
    }

    /// Opens the token selected by the config in an already loaded module.
    pub fn open_with(config: &TokenConfig, module: M) -> Result<Self, Error> {
        let selector = TokenSelector {
            serial: config.token_serial().to_string(),
            label: config.token_label().to_string(),
        };
        let max_sessions = config.max_sessions()?;
        let driver = Pkcs11Driver::open(module, &selector, config.pin().cloned(), max_sessions)?;
        info!(
            "[{}] PKCS#11 provider ready, token '{}' in slot {}",
            config.manufacturer(),
            driver.token().label,
            driver.slot()
        );
        Ok(Self::new(config.manufacturer(), config.model(), driver))
    }

    pub fn driver(&self) -> &Pkcs11Driver<M> {
        &self.driver
    }

    /// Draws random bytes from the token's RNG.
    pub fn random_bytes(&self, len: usize) -> Result<Vec<u8>, Error> {
        self.driver.random_bytes(len)
    }

    /// Returns a fresh id and the label to use for a new key.
    fn new_id_and_label(&self, label: &str) -> Result<(String, String), Error> {
        let id = hex::encode(self.driver.random_bytes(KEY_ID_RANDOM_BYTES)?);
        let label = if label.is_empty() {
            format!(
                "{}_{}",
                hex::encode(self.driver.random_bytes(KEY_LABEL_RANDOM_BYTES)?),
                Utc::now().format("%Y%m%d%H%M%S")
            )
        } else {
            label.to_string()
        };
        Ok((id, label))
    }

    fn generate(
        &self,
        mechanism: Mechanism,
        public_template: Vec<Attribute>,
        private_template: Vec<Attribute>,
        id: &str,
    ) -> Result<Pkcs11PrivateKey<M>, Error> {
        let slot = self.driver.slot();
        self.driver
            .with_session(slot, |session| {
                let (public, private) = session.generate_key_pair(&mechanism, &public_template, &private_template)?;
                let public = export_public(session, public)?;
                Ok(Pkcs11PrivateKey {
                    driver: self.driver.clone(),
                    slot,
                    handle: private,
                    id: id.to_string(),
                    public,
                })
            })
            .map_err(|e| e.within("generate key pair", Some(slot), Some(id)))
    }

    /// Finds the private object matching id and/or label, and the public
    /// object of the same type and id.
    fn find_key_pair(&self, slot: u64, key_id: &str, label: &str) -> Result<Pkcs11PrivateKey<M>, Error> {
        if key_id.is_empty() && label.is_empty() {
            return Err(Error::KeyNotFound);
        }
        debug!(
            "[{}] looking up key pair with id '{}' and label '{}' in slot {}",
            self.manufacturer, key_id, label, slot
        );

        self.driver
            .with_session(slot, |session| {
                let mut template = vec![Attribute::Class(ObjectClass::PrivateKey)];
                if !key_id.is_empty() {
                    template.push(Attribute::Id(key_id.as_bytes().to_vec()));
                }
                if !label.is_empty() {
                    template.push(Attribute::Label(label.as_bytes().to_vec()));
                }
                let private = first(session.find_objects(&template)?)?;

                let attrs = session.get_attributes(private, &[AttributeType::KeyType, AttributeType::Id])?;
                let key_type = key_type(&attrs)?;
                // a private object without an id has no public half to pair with
                let id = match attr_bytes(&attrs, AttributeType::Id) {
                    Ok(id) if !id.is_empty() => id,
                    _ => return Err(Error::KeyNotFound),
                };

                let public = first(session.find_objects(&[
                    Attribute::Class(ObjectClass::PublicKey),
                    Attribute::KeyType(key_type),
                    Attribute::Id(id.clone()),
                ])?)?;
                let public = export_public(session, public)?;

                Ok(Pkcs11PrivateKey {
                    driver: self.driver.clone(),
                    slot,
                    handle: private,
                    id: String::from_utf8_lossy(&id).into_owned(),
                    public,
                })
            })
            .map_err(|e| e.within("find key pair", Some(slot), Some(key_id)))
    }

    fn identify(&self, key: &Pkcs11PrivateKey<M>) -> Result<(String, String), Error> {
        self.driver
            .with_session(key.slot, |session| {
                let attrs = session.get_attributes(key.handle, &[AttributeType::Id, AttributeType::Label])?;
                let id = attr_bytes(&attrs, AttributeType::Id)?;
                let label = attr_bytes(&attrs, AttributeType::Label)?;
                Ok((
                    String::from_utf8_lossy(&id).into_owned(),
                    String::from_utf8_lossy(&label).into_owned(),
                ))
            })
            .map_err(|e| e.within("identify key", Some(key.slot), Some(&key.id)))
    }
}

impl<M: Module> fmt::Debug for Pkcs11Provider<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11Provider")
            .field("manufacturer", &self.manufacturer)
            .field("model", &self.model)
            .field("driver", &self.driver)
            .finish()
    }
}

/// The attribute templates for a new key pair.
fn key_templates(id: &str, label: &str, purpose: KeyPurpose) -> (Vec<Attribute>, Vec<Attribute>) {
    let mut public = vec![
        Attribute::Id(id.as_bytes().to_vec()),
        Attribute::Label(label.as_bytes().to_vec()),
        Attribute::Token(true),
        Attribute::Verify(true),
    ];
    let mut private = vec![
        Attribute::Id(id.as_bytes().to_vec()),
        Attribute::Label(label.as_bytes().to_vec()),
        Attribute::Token(true),
        Attribute::Private(true),
        Attribute::Sensitive(true),
        Attribute::Extractable(false),
        Attribute::Sign(true),
    ];
    if purpose == KeyPurpose::Encryption {
        public.push(Attribute::Encrypt(true));
        private.push(Attribute::Decrypt(true));
    }
    (public, private)
}

fn first<H>(handles: Vec<H>) -> Result<H, Error> {
    handles.into_iter().next().ok_or(Error::KeyNotFound)
}

fn attr_bytes(attrs: &[Attribute], attr_type: AttributeType) -> Result<Vec<u8>, Error> {
    attrs
        .iter()
        .find(|attr| attr.attribute_type() == Some(attr_type))
        .and_then(Attribute::bytes)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| ModuleError::AttributeTypeInvalid(format!("{:?}", attr_type)).into())
}

fn key_type(attrs: &[Attribute]) -> Result<KeyType, Error> {
    attrs
        .iter()
        .find_map(|attr| match attr {
            Attribute::KeyType(KeyType::Other(_)) => Some(Err(Error::UnsupportedKeyType)),
            Attribute::KeyType(key_type) => Some(Ok(key_type.clone())),
            _ => None,
        })
        .unwrap_or(Err(Error::UnsupportedKeyType))
}

fn algorithm(key_type: &KeyType) -> String {
    match key_type {
        KeyType::Ec => "ECDSA".to_string(),
        other => other.to_string(),
    }
}

/// Reads the public value of a public key object.
fn export_public<S: Session>(session: &S, object: S::Handle) -> Result<PublicKey, Error> {
    let attrs = session.get_attributes(object, &[AttributeType::KeyType])?;
    match key_type(&attrs)? {
        KeyType::Rsa => {
            let attrs = session.get_attributes(object, &[AttributeType::Modulus, AttributeType::PublicExponent])?;
            PublicKey::rsa(
                &attr_bytes(&attrs, AttributeType::Modulus)?,
                &attr_bytes(&attrs, AttributeType::PublicExponent)?,
            )
        }
        KeyType::Ec => {
            let attrs = session.get_attributes(object, &[AttributeType::EcParams, AttributeType::EcPoint])?;
            let curve = codec::curve_from_oid_der(&attr_bytes(&attrs, AttributeType::EcParams)?)?;
            let point = codec::parse_ec_point(&attr_bytes(&attrs, AttributeType::EcPoint)?, curve)?;
            Ok(PublicKey::Ecdsa { curve, point })
        }
        KeyType::Dsa => {
            let attrs = session.get_attributes(
                object,
                &[
                    AttributeType::Prime,
                    AttributeType::SubPrime,
                    AttributeType::Base,
                    AttributeType::Value,
                ],
            )?;
            Ok(PublicKey::Dsa {
                p: attr_bytes(&attrs, AttributeType::Prime)?,
                q: attr_bytes(&attrs, AttributeType::SubPrime)?,
                g: attr_bytes(&attrs, AttributeType::Base)?,
                y: attr_bytes(&attrs, AttributeType::Value)?,
            })
        }
        KeyType::Other(_) => Err(Error::UnsupportedKeyType),
    }
}

impl<M: Module> Provider for Pkcs11Provider<M> {
    fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn generate_rsa_key(&self, label: &str, bits: u32, purpose: KeyPurpose) -> Result<Arc<dyn PrivateKey>, Error> {
        if bits < MIN_RSA_KEY_BITS {
            return Err(Error::WeakRsaKey(bits));
        }
        let (id, label) = self.new_id_and_label(label)?;
        let (mut public, private) = key_templates(&id, &label, purpose);
        public.push(Attribute::ModulusBits(u64::from(bits)));
        public.push(Attribute::PublicExponent(RSA_PUBLIC_EXPONENT.to_vec()));

        let key = self.generate(Mechanism::RsaPkcsKeyPairGen, public, private, &id)?;
        info!(
            "[{}] generated RSA-{} {:?} key '{}' with id {}",
            self.manufacturer, bits, purpose, label, id
        );
        Ok(Arc::new(key))
    }

    fn generate_ecdsa_key(&self, label: &str, curve: Curve) -> Result<Arc<dyn PrivateKey>, Error> {
        let (id, label) = self.new_id_and_label(label)?;
        let (mut public, private) = key_templates(&id, &label, KeyPurpose::Signing);
        public.push(Attribute::EcParams(codec::curve_oid_der(curve).to_vec()));

        let key = self.generate(Mechanism::EcKeyPairGen, public, private, &id)?;
        info!("[{}] generated ECDSA {} key '{}' with id {}", self.manufacturer, curve, label, id);
        Ok(Arc::new(key))
    }

    fn identify_key(&self, key: &dyn PrivateKey) -> Result<(String, String), Error> {
        let key = key
            .as_any()
            .downcast_ref::<Pkcs11PrivateKey<M>>()
            .ok_or(Error::UnsupportedKeyType)?;
        self.identify(key)
    }

    fn export_key(&self, key_id: &str) -> Result<(String, Option<Vec<u8>>), Error> {
        self.find_key_pair(self.driver.slot(), key_id, "")?;
        let token = self.driver.token();
        let uri = KeyUri::new(&self.manufacturer, &self.model, &token.serial, &token.label, key_id);
        Ok((uri.to_string(), None))
    }

    fn get_key(&self, key_id: &str) -> Result<Arc<dyn PrivateKey>, Error> {
        Ok(Arc::new(self.find_key_pair(self.driver.slot(), key_id, "")?))
    }

    fn key_manager(&self) -> Option<&dyn KeyManager> {
        Some(self)
    }

    fn close(&self) -> Result<(), Error> {
        if !self.driver.is_closed() {
            self.driver.close();
            info!("[{}] PKCS#11 provider closed", self.manufacturer);
        }
        Ok(())
    }
}

impl<M: Module> KeyManager for Pkcs11Provider<M> {
    fn current_slot_id(&self) -> u64 {
        self.driver.slot()
    }

    fn enum_tokens(&self, current_only: bool) -> Result<Vec<SlotTokenInfo>, Error> {
        let current = self.driver.slot();
        Ok(self
            .driver
            .tokens()?
            .into_iter()
            .filter(|(slot, _)| !current_only || *slot == current)
            .map(|(id, token)| SlotTokenInfo {
                id,
                description: token.slot_description,
                label: token.label,
                manufacturer: token.manufacturer,
                model: token.model,
                serial: token.serial,
                flags: token.flags,
            })
            .collect())
    }

    fn enum_keys(&self, slot: u64, prefix: &str) -> Result<Vec<KeyDescription>, Error> {
        self.driver
            .with_session(slot, |session| {
                let mut res = Vec::new();
                for object in session.find_objects(&[Attribute::Class(ObjectClass::PrivateKey)])? {
                    let attrs = session.get_attributes(
                        object,
                        &[AttributeType::Id, AttributeType::Label, AttributeType::KeyType],
                    )?;
                    let label = String::from_utf8_lossy(&attr_bytes(&attrs, AttributeType::Label)?).into_owned();
                    if !label.starts_with(prefix) {
                        continue;
                    }
                    let algorithm = attrs
                        .iter()
                        .find_map(|attr| match attr {
                            Attribute::KeyType(key_type) => Some(algorithm(key_type)),
                            _ => None,
                        })
                        .unwrap_or_default();
                    res.push(KeyDescription {
                        id: String::from_utf8_lossy(&attr_bytes(&attrs, AttributeType::Id)?).into_owned(),
                        label,
                        algorithm,
                        public_key_pem: None,
                    });
                }
                Ok(res)
            })
            .map_err(|e| e.within("enumerate keys", Some(slot), None))
    }

    fn destroy_key_pair_on_slot(&self, slot: u64, key_id: &str) -> Result<(), Error> {
        self.driver
            .with_session(slot, |session| {
                let id = Attribute::Id(key_id.as_bytes().to_vec());
                let private = session.find_objects(&[Attribute::Class(ObjectClass::PrivateKey), id.clone()])?;
                let public = session.find_objects(&[Attribute::Class(ObjectClass::PublicKey), id])?;

                if private.is_empty() && public.is_empty() {
                    return Err(Error::KeyNotFound);
                }
                if private.is_empty() {
                    warn!("[{}] no private key with id '{}' in slot {}", self.manufacturer, key_id, slot);
                }
                if public.is_empty() {
                    warn!("[{}] no public key with id '{}' in slot {}", self.manufacturer, key_id, slot);
                }

                for object in private.into_iter().chain(public) {
                    session.destroy_object(object)?;
                }
                info!("[{}] destroyed key pair with id '{}' in slot {}", self.manufacturer, key_id, slot);
                Ok(())
            })
            .map_err(|e| e.within("destroy key pair", Some(slot), Some(key_id)))
    }

    fn find_key_pair_on_slot(&self, slot: u64, key_id: &str, label: &str) -> Result<Arc<dyn PrivateKey>, Error> {
        Ok(Arc::new(self.find_key_pair(slot, key_id, label)?))
    }

    fn key_info(&self, slot: u64, key_id: &str, include_public: bool) -> Result<KeyDescription, Error> {
        let key = self.find_key_pair(slot, key_id, "")?;
        let (id, label) = self.identify(&key)?;
        let public_key_pem = if include_public {
            Some(key.public.to_pem()?)
        } else {
            None
        };
        Ok(KeyDescription {
            id,
            label,
            algorithm: key.public.algorithm().to_string(),
            public_key_pem,
        })
    }
}

//------------ Pkcs11PrivateKey ----------------------------------------------

/// A private key object in a token.
///
/// Holds the object handle, which only stays valid as long as the key
/// exists in the token.
pub struct Pkcs11PrivateKey<M: Module> {
    driver: Arc<Pkcs11Driver<M>>,
    slot: u64,
    handle: ObjectHandle<M>,
    id: String,
    public: PublicKey,
}

impl<M: Module> Pkcs11PrivateKey<M> {
    pub fn slot(&self) -> u64 {
        self.slot
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<M: Module> fmt::Debug for Pkcs11PrivateKey<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11PrivateKey")
            .field("slot", &self.slot)
            .field("handle", &self.handle)
            .field("id", &self.id)
            .field("public", &self.public)
            .finish()
    }
}

impl<M: Module> PrivateKey for Pkcs11PrivateKey<M> {
    fn public_key(&self) -> &PublicKey {
        &self.public
    }

    fn sign(&self, digest: &[u8], opts: &SignerOpts) -> Result<Vec<u8>, Error> {
        opts.hash.check_digest(digest)?;
        let (mechanism, data) = match (&self.public, opts.pss) {
            (PublicKey::Rsa { .. }, None) => (Mechanism::RsaPkcs, codec::digest_info(opts.hash, digest)?),
            (PublicKey::Rsa { .. }, Some(salt)) => {
                (Mechanism::RsaPkcsPss(PssParams::new(opts.hash, salt)?), digest.to_vec())
            }
            (PublicKey::Ecdsa { .. }, _) => (Mechanism::Ecdsa, digest.to_vec()),
            (PublicKey::Dsa { .. }, _) => (Mechanism::Dsa, digest.to_vec()),
        };

        let signature = self
            .driver
            .with_session(self.slot, |session| Ok(session.sign(&mechanism, self.handle, &data)?))
            .map_err(|e| e.within("sign", Some(self.slot), Some(&self.id)))?;

        match self.public {
            PublicKey::Rsa { .. } => Ok(signature),
            _ => codec::raw_signature_to_der(&signature),
        }
    }

    fn decrypt(&self, ciphertext: &[u8], opts: &DecrypterOpts) -> Result<Vec<u8>, Error> {
        if !matches!(self.public, PublicKey::Rsa { .. }) {
            return Err(Error::UnsupportedKeyType);
        }
        let mechanism = match opts {
            DecrypterOpts::Pkcs1v15 => Mechanism::RsaPkcs,
            DecrypterOpts::Oaep { hash, label } => Mechanism::RsaPkcsOaep(OaepParams::new(*hash, label)?),
        };
        self.driver
            .with_session(self.slot, |session| {
                Ok(session.decrypt(&mechanism, self.handle, ciphertext)?)
            })
            .map_err(|e| e.within("decrypt", Some(self.slot), Some(&self.id)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

//------------ Tests ---------------------------------------------------------
