//! A provider keeping openssl keys in memory, for tests.
//!
//! Keys are lost when the provider is dropped and, unlike with the other
//! providers, their private key can be exported.
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::Utc;
use log::{debug, info};
use openssl::{
    bn::BigNum,
    ec::{EcGroup, EcKey},
    pkey::{PKey, Private},
    pkey_ctx::PkeyCtx,
    rsa::{Padding, Rsa},
    sign::RsaPssSaltlen,
};
use rand::RngCore;

use crate::commons::error::Error;
use crate::config::TokenConfig;
use crate::constants::{KEY_ID_RANDOM_BYTES, KEY_LABEL_RANDOM_BYTES, MIN_RSA_KEY_BITS, RSA_PUBLIC_EXPONENT};
use crate::crypto::{
    codec::{Mgf, PssParams},
    keys::{Curve, DecrypterOpts, KeyPurpose, PrivateKey, PublicKey, SignerOpts},
    keyuri::KeyUri,
    provider::{KeyDescription, KeyManager, Provider, SlotTokenInfo},
    registry::Loader,
};

/// The only slot of the in-memory provider.
const SLOT: u64 = 0;
const SERIAL: &str = "0000000000000000";
const TOKEN: &str = "memory";

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0; len];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

//------------ InMemoryProvider ----------------------------------------------

pub struct InMemoryProvider {
    manufacturer: String,
    model: String,
    keys: RwLock<HashMap<String, Arc<InMemoryKey>>>,
    closed: AtomicBool,
}

impl InMemoryProvider {
    /// The manufacturer name the provider is registered under by default.
    pub const MANUFACTURER: &'static str = "inmem";

    pub fn new(manufacturer: &str, model: &str) -> Self {
        InMemoryProvider {
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            keys: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn loader() -> Loader {
        Arc::new(|config: &TokenConfig| {
            let provider = InMemoryProvider::new(config.manufacturer(), config.model());
            Ok(Arc::new(provider) as Arc<dyn Provider>)
        })
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn check_slot(&self, slot: u64) -> Result<(), Error> {
        self.check_open()?;
        if slot != SLOT {
            return Err(Error::TokenNotFound);
        }
        Ok(())
    }

    fn store(&self, label: &str, pkey: PKey<Private>, purpose: KeyPurpose) -> Result<Arc<InMemoryKey>, Error> {
        let id = random_hex(KEY_ID_RANDOM_BYTES);
        let label = if label.is_empty() {
            format!(
                "{}_{}",
                random_hex(KEY_LABEL_RANDOM_BYTES),
                Utc::now().format("%Y%m%d%H%M%S")
            )
        } else {
            label.to_string()
        };
        let key = Arc::new(InMemoryKey {
            id: id.clone(),
            label,
            public: PublicKey::from_pkey(&pkey)?,
            pkey,
            purpose,
        });
        self.keys
            .write()
            .map_err(|_| Error::other("key store lock is poisoned"))?
            .insert(id, key.clone());
        Ok(key)
    }

    fn keys(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<InMemoryKey>>>, Error> {
        self.keys.read().map_err(|_| Error::other("key store lock is poisoned"))
    }

    fn find(&self, key_id: &str, label: &str) -> Result<Arc<InMemoryKey>, Error> {
        self.check_open()?;
        if key_id.is_empty() && label.is_empty() {
            return Err(Error::KeyNotFound);
        }
        self.keys()?
            .values()
            .find(|key| (key_id.is_empty() || key.id == key_id) && (label.is_empty() || key.label == label))
            .cloned()
            .ok_or(Error::KeyNotFound)
    }
}

impl fmt::Debug for InMemoryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryProvider")
            .field("manufacturer", &self.manufacturer)
            .field("model", &self.model)
            .finish()
    }
}

impl Provider for InMemoryProvider {
    fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn generate_rsa_key(&self, label: &str, bits: u32, purpose: KeyPurpose) -> Result<Arc<dyn PrivateKey>, Error> {
        self.check_open()?;
        if bits < MIN_RSA_KEY_BITS {
            return Err(Error::WeakRsaKey(bits));
        }
        let e = BigNum::from_slice(&RSA_PUBLIC_EXPONENT)?;
        let rsa = Rsa::generate_with_e(bits, &e)?;
        let key = self.store(label, PKey::from_rsa(rsa)?, purpose)?;
        debug!("[{}] generated RSA-{} key '{}'", self.manufacturer, bits, key.label);
        Ok(key)
    }

    fn generate_ecdsa_key(&self, label: &str, curve: Curve) -> Result<Arc<dyn PrivateKey>, Error> {
        self.check_open()?;
        let group = EcGroup::from_curve_name(curve.nid())?;
        let ec = EcKey::generate(&group)?;
        let key = self.store(label, PKey::from_ec_key(ec)?, KeyPurpose::Signing)?;
        debug!("[{}] generated ECDSA {} key '{}'", self.manufacturer, curve, key.label);
        Ok(key)
    }

    fn identify_key(&self, key: &dyn PrivateKey) -> Result<(String, String), Error> {
        let key = key
            .as_any()
            .downcast_ref::<InMemoryKey>()
            .ok_or(Error::UnsupportedKeyType)?;
        let key = self.find(&key.id, "")?;
        Ok((key.id.clone(), key.label.clone()))
    }

    fn export_key(&self, key_id: &str) -> Result<(String, Option<Vec<u8>>), Error> {
        let key = self.find(key_id, "")?;
        let uri = KeyUri::new(&self.manufacturer, &self.model, SERIAL, TOKEN, &key.id);
        Ok((uri.to_string(), Some(key.pkey.private_key_to_pkcs8()?)))
    }

    fn get_key(&self, key_id: &str) -> Result<Arc<dyn PrivateKey>, Error> {
        Ok(self.find(key_id, "")?)
    }

    fn key_manager(&self) -> Option<&dyn KeyManager> {
        Some(self)
    }

    fn close(&self) -> Result<(), Error> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Ok(mut keys) = self.keys.write() {
                keys.clear();
            }
            info!("[{}] in-memory provider closed", self.manufacturer);
        }
        Ok(())
    }
}

impl KeyManager for InMemoryProvider {
    fn current_slot_id(&self) -> u64 {
        SLOT
    }

    fn enum_tokens(&self, _current_only: bool) -> Result<Vec<SlotTokenInfo>, Error> {
        self.check_open()?;
        Ok(vec![SlotTokenInfo {
            id: SLOT,
            description: "in-memory key store".to_string(),
            label: TOKEN.to_string(),
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            serial: SERIAL.to_string(),
            flags: 0,
        }])
    }

    fn enum_keys(&self, slot: u64, prefix: &str) -> Result<Vec<KeyDescription>, Error> {
        self.check_slot(slot)?;
        let mut res = self
            .keys()?
            .values()
            .filter(|key| key.label.starts_with(prefix))
            .map(|key| key.describe(false))
            .collect::<Result<Vec<_>, Error>>()?;
        res.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(res)
    }

    fn destroy_key_pair_on_slot(&self, slot: u64, key_id: &str) -> Result<(), Error> {
        self.check_slot(slot)?;
        self.keys
            .write()
            .map_err(|_| Error::other("key store lock is poisoned"))?
            .remove(key_id)
            .map(|_| ())
            .ok_or(Error::KeyNotFound)
    }

    fn find_key_pair_on_slot(&self, slot: u64, key_id: &str, label: &str) -> Result<Arc<dyn PrivateKey>, Error> {
        self.check_slot(slot)?;
        Ok(self.find(key_id, label)?)
    }

    fn key_info(&self, slot: u64, key_id: &str, include_public: bool) -> Result<KeyDescription, Error> {
        self.check_slot(slot)?;
        self.find(key_id, "")?.describe(include_public)
    }
}

//------------ InMemoryKey ---------------------------------------------------

pub struct InMemoryKey {
    id: String,
    label: String,
    pkey: PKey<Private>,
    public: PublicKey,
    purpose: KeyPurpose,
}

impl InMemoryKey {
    fn describe(&self, include_public: bool) -> Result<KeyDescription, Error> {
        Ok(KeyDescription {
            id: self.id.clone(),
            label: self.label.clone(),
            algorithm: self.public.algorithm().to_string(),
            public_key_pem: if include_public {
                Some(self.public.to_pem()?)
            } else {
                None
            },
        })
    }
}

impl fmt::Debug for InMemoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryKey")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("public", &self.public)
            .finish()
    }
}

impl PrivateKey for InMemoryKey {
    fn public_key(&self) -> &PublicKey {
        &self.public
    }

    fn sign(&self, digest: &[u8], opts: &SignerOpts) -> Result<Vec<u8>, Error> {
        opts.hash.check_digest(digest)?;
        let mut ctx = PkeyCtx::new(&self.pkey)?;
        ctx.sign_init()?;
        if let PublicKey::Rsa { .. } = self.public {
            match opts.pss {
                None => ctx.set_rsa_padding(Padding::PKCS1)?,
                Some(salt) => {
                    let params = PssParams::new(opts.hash, salt)?;
                    ctx.set_rsa_padding(Padding::PKCS1_PSS)?;
                    ctx.set_rsa_pss_saltlen(RsaPssSaltlen::custom(params.salt_len as i32))?;
                    ctx.set_rsa_mgf1_md(params.mgf.hash().md())?;
                }
            }
        }
        ctx.set_signature_md(opts.hash.md())?;
        let mut signature = Vec::new();
        ctx.sign_to_vec(digest, &mut signature)?;
        Ok(signature)
    }

    fn decrypt(&self, ciphertext: &[u8], opts: &DecrypterOpts) -> Result<Vec<u8>, Error> {
        if self.purpose != KeyPurpose::Encryption {
            return Err(Error::UnsupportedKeyType);
        }
        let mut ctx = PkeyCtx::new(&self.pkey)?;
        ctx.decrypt_init()?;
        match opts {
            DecrypterOpts::Pkcs1v15 => ctx.set_rsa_padding(Padding::PKCS1)?,
            DecrypterOpts::Oaep { hash, label } => {
                let mgf = Mgf::for_hash(*hash)?;
                ctx.set_rsa_padding(Padding::PKCS1_OAEP)?;
                ctx.set_rsa_oaep_md(hash.md())?;
                ctx.set_rsa_mgf1_md(mgf.hash().md())?;
                if !label.is_empty() {
                    ctx.set_rsa_oaep_label(label)?;
                }
            }
        }
        let mut plaintext = Vec::new();
        ctx.decrypt_to_vec(ciphertext, &mut plaintext)?;
        Ok(plaintext)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use openssl::{md::Md, pkey::PKey};

    use crate::crypto::keys::{HashAlg, PssSaltLength};

    use super::*;

    fn provider() -> InMemoryProvider {
        InMemoryProvider::new(InMemoryProvider::MANUFACTURER, "test")
    }

    #[test]
    fn sign_and_verify() {
        let provider = provider();
        let digest = HashAlg::Sha384.digest(b"data").unwrap();

        let rsa = provider.generate_rsa_key("rsa", 2048, KeyPurpose::Signing).unwrap();
        for opts in [
            SignerOpts::hash(HashAlg::Sha384),
            SignerOpts::pss(HashAlg::Sha384, PssSaltLength::EqualsHash),
            SignerOpts::pss(HashAlg::Sha384, PssSaltLength::Bytes(10)),
        ] {
            let signature = rsa.sign(&digest, &opts).unwrap();
            assert!(rsa.public_key().verify(&digest, &signature, &opts).unwrap());
        }

        let ec = provider.generate_ecdsa_key("ec", Curve::P384).unwrap();
        let opts = SignerOpts::hash(HashAlg::Sha384);
        let signature = ec.sign(&digest, &opts).unwrap();
        assert!(ec.public_key().verify(&digest, &signature, &opts).unwrap());
    }

    #[test]
    fn weak_rsa_key_is_refused() {
        let err = provider().generate_rsa_key("", 1024, KeyPurpose::Signing).unwrap_err();
        assert_eq!(err.to_string(), "RSA key is too weak: 1024");
    }

    #[test]
    fn export_gives_pkcs8() {
        let provider = provider();
        let key = provider.generate_ecdsa_key("exported", Curve::P256).unwrap();
        let (id, label) = provider.identify_key(key.as_ref()).unwrap();
        assert_eq!(label, "exported");

        let (uri, der) = provider.export_key(&id).unwrap();
        let uri = KeyUri::parse(&uri).unwrap();
        assert_eq!(uri.manufacturer(), "inmem");
        assert_eq!(uri.id(), id);

        let pkey = PKey::private_key_from_pkcs8(&der.unwrap()).unwrap();
        assert_eq!(&PublicKey::from_pkey(&pkey).unwrap(), key.public_key());
    }

    #[test]
    fn decrypt_oaep() {
        let provider = provider();
        let key = provider.generate_rsa_key("enc", 2048, KeyPurpose::Encryption).unwrap();
        let pkey = key.public_key().to_pkey().unwrap();
        let mut ctx = PkeyCtx::new(&pkey).unwrap();
        ctx.encrypt_init().unwrap();
        ctx.set_rsa_padding(Padding::PKCS1_OAEP).unwrap();
        ctx.set_rsa_oaep_md(Md::sha1()).unwrap();
        ctx.set_rsa_mgf1_md(Md::sha1()).unwrap();
        let mut ciphertext = Vec::new();
        ctx.encrypt_to_vec(b"plaintext", &mut ciphertext).unwrap();

        let opts = DecrypterOpts::Oaep {
            hash: HashAlg::Sha1,
            label: vec![],
        };
        assert_eq!(key.decrypt(&ciphertext, &opts).unwrap(), b"plaintext");

        let signing = provider.generate_rsa_key("sig", 2048, KeyPurpose::Signing).unwrap();
        assert!(signing.decrypt(&ciphertext, &opts).is_err());
    }

    #[test]
    fn manage_keys() {
        let provider = provider();
        let key = provider.generate_ecdsa_key("managed-1", Curve::P256).unwrap();
        provider.generate_ecdsa_key("managed-2", Curve::P256).unwrap();
        provider.generate_ecdsa_key("other", Curve::P256).unwrap();
        let (id, _) = provider.identify_key(key.as_ref()).unwrap();

        assert_eq!(provider.enum_tokens(false).unwrap().len(), 1);
        let keys = provider.enum_keys(SLOT, "managed-").unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].label, "managed-1");

        let found = provider.find_key_pair_on_slot(SLOT, "", "managed-1").unwrap();
        assert_eq!(found.public_key(), key.public_key());
        assert!(provider.find_key_pair_on_slot(SLOT, "", "").is_err());
        assert!(matches!(provider.enum_keys(7, ""), Err(Error::TokenNotFound)));

        let info = provider.key_info(SLOT, &id, true).unwrap();
        assert_eq!(info.algorithm, "ECDSA");
        assert!(info.public_key_pem.is_some());

        provider.destroy_key_pair_on_slot(SLOT, &id).unwrap();
        assert!(provider.get_key(&id).unwrap_err().is_not_found());
        assert!(provider.destroy_key_pair_on_slot(SLOT, &id).unwrap_err().is_not_found());
        assert!(provider.identify_key(key.as_ref()).is_err());
    }

    #[test]
    fn closed_provider() {
        let provider = provider();
        let key = provider.generate_ecdsa_key("", Curve::P384).unwrap();
        let (id, _) = provider.identify_key(key.as_ref()).unwrap();

        provider.close().unwrap();
        provider.close().unwrap();
        assert!(matches!(provider.get_key(&id), Err(Error::Closed)));
        assert!(matches!(provider.generate_ecdsa_key("", Curve::P256), Err(Error::Closed)));
    }
}
