//! The module seam over a real PKCS#11 library, using `cryptoki`.
use std::sync::Arc;

use cryptoki::{
    context::{CInitializeArgs, Pkcs11},
    error::{Error as CkError, RvError},
    mechanism::{
        Mechanism as CkMechanism, MechanismType,
        rsa::{PkcsMgfType, PkcsOaepParams, PkcsOaepSource, PkcsPssParams},
    },
    object::{
        Attribute as CkAttribute, AttributeType as CkAttributeType, KeyType as CkKeyType, ObjectClass as CkObjectClass,
        ObjectHandle,
    },
    session::{Session as CkSession, UserType},
    slot::Slot,
    types::AuthPin,
};
use log::debug;
use secrecy::{ExposeSecret, SecretString};

use crate::commons::error::Error;
use crate::config::TokenConfig;
use crate::crypto::codec::Mgf;
use crate::crypto::keys::HashAlg;
use crate::crypto::provider::Provider;
use crate::crypto::registry::Loader;
use crate::crypto::signers::pkcs11::{
    module::{Attribute, AttributeType, KeyType, Mechanism, Module, ModuleError, ObjectClass, Session, TokenDetails},
    signer::Pkcs11Provider,
};

const CKF_RNG: u64 = 0x0000_0001;
const CKF_WRITE_PROTECTED: u64 = 0x0000_0002;
const CKF_LOGIN_REQUIRED: u64 = 0x0000_0004;
const CKF_USER_PIN_INITIALIZED: u64 = 0x0000_0008;
const CKF_TOKEN_INITIALIZED: u64 = 0x0000_0400;

fn module_error(function: &str, err: CkError) -> ModuleError {
    match err {
        CkError::Pkcs11(RvError::UserAlreadyLoggedIn, _) => ModuleError::UserAlreadyLoggedIn,
        CkError::Pkcs11(RvError::PinIncorrect, _) => ModuleError::PinIncorrect,
        CkError::Pkcs11(RvError::ObjectHandleInvalid, _) => ModuleError::ObjectHandleInvalid,
        CkError::Pkcs11(RvError::AttributeTypeInvalid, _) => ModuleError::AttributeTypeInvalid(function.to_string()),
        CkError::Pkcs11(RvError::MechanismInvalid, _) => ModuleError::MechanismInvalid(function.to_string()),
        other => ModuleError::failed(function, other),
    }
}

//------------ NativeModule --------------------------------------------------

/// A loaded and initialized PKCS#11 library.
///
/// The library is finalized when the last clone of the context is
/// dropped, i.e. after the provider and all its sessions are gone.
pub struct NativeModule {
    path: String,
    context: Pkcs11,
}

impl NativeModule {
    /// Loads the library at `path` and initializes it for use by multiple
    /// threads.
    pub fn load(path: &str) -> Result<Self, Error> {
        if path.is_empty() {
            return Err(Error::NotConfigured("PKCS#11 library path".to_string()));
        }

        let context = Pkcs11::new(path).map_err(|e| Error::CannotOpenModule(format!("{}: {}", path, e)))?;
        match context.initialize(CInitializeArgs::OsThreads) {
            Ok(()) | Err(CkError::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {}
            Err(err) => {
                return Err(Error::CannotOpenModule(format!(
                    "cannot initialize '{}': {}",
                    path, err
                )));
            }
        }

        debug!("PKCS#11: loaded library '{}'", path);
        Ok(NativeModule {
            path: path.to_string(),
            context,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn slot(&self, id: u64) -> Result<Slot, ModuleError> {
        self.context
            .get_all_slots()
            .map_err(|e| module_error("C_GetSlotList", e))?
            .into_iter()
            .find(|slot| slot.id() == id)
            .ok_or_else(|| ModuleError::failed("C_GetSlotInfo", format!("no slot with id {}", id)))
    }
}

impl Module for NativeModule {
    type Session = NativeSession;

    fn library_description(&self) -> Result<String, ModuleError> {
        let info = self.context.get_library_info().map_err(|e| module_error("C_GetInfo", e))?;
        Ok(format!(
            "{} ({})",
            info.library_description().trim(),
            info.manufacturer_id().trim()
        ))
    }

    fn slots_with_token(&self) -> Result<Vec<u64>, ModuleError> {
        Ok(self
            .context
            .get_slots_with_token()
            .map_err(|e| module_error("C_GetSlotList", e))?
            .into_iter()
            .map(|slot| slot.id())
            .collect())
    }

    fn token_details(&self, slot: u64) -> Result<TokenDetails, ModuleError> {
        let slot = self.slot(slot)?;
        let slot_info = self
            .context
            .get_slot_info(slot)
            .map_err(|e| module_error("C_GetSlotInfo", e))?;
        let token = self
            .context
            .get_token_info(slot)
            .map_err(|e| module_error("C_GetTokenInfo", e))?;

        let mut flags = 0;
        for (set, flag) in [
            (token.rng(), CKF_RNG),
            (token.write_protected(), CKF_WRITE_PROTECTED),
            (token.login_required(), CKF_LOGIN_REQUIRED),
            (token.user_pin_initialized(), CKF_USER_PIN_INITIALIZED),
            (token.token_initialized(), CKF_TOKEN_INITIALIZED),
        ] {
            if set {
                flags |= flag;
            }
        }

        Ok(TokenDetails {
            slot_description: slot_info.slot_description().trim().to_string(),
            label: token.label().trim().to_string(),
            manufacturer: token.manufacturer_id().trim().to_string(),
            model: token.model().trim().to_string(),
            serial: token.serial_number().trim().to_string(),
            flags,
            login_required: token.login_required(),
        })
    }

    fn open_session(&self, slot: u64) -> Result<NativeSession, ModuleError> {
        let slot = self.slot(slot)?;
        let session = self
            .context
            .open_rw_session(slot)
            .map_err(|e| module_error("C_OpenSession", e))?;
        Ok(NativeSession { session })
    }
}

//------------ NativeSession -------------------------------------------------

pub struct NativeSession {
    session: CkSession,
}

impl Session for NativeSession {
    type Handle = ObjectHandle;

    fn login(&self, pin: Option<&SecretString>) -> Result<(), ModuleError> {
        let pin = pin.map(|pin| AuthPin::new(pin.expose_secret().to_string().into()));
        self.session
            .login(UserType::User, pin.as_ref())
            .map_err(|e| module_error("C_Login", e))
    }

    fn generate_key_pair(
        &self,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle), ModuleError> {
        let public = to_native_template(public_template)?;
        let private = to_native_template(private_template)?;
        with_mechanism(mechanism, |mechanism| {
            self.session
                .generate_key_pair(mechanism, &public, &private)
                .map_err(|e| module_error("C_GenerateKeyPair", e))
        })
    }

    fn find_objects(&self, template: &[Attribute]) -> Result<Vec<ObjectHandle>, ModuleError> {
        let template = to_native_template(template)?;
        self.session
            .find_objects(&template)
            .map_err(|e| module_error("C_FindObjects", e))
    }

    fn get_attributes(&self, object: ObjectHandle, types: &[AttributeType]) -> Result<Vec<Attribute>, ModuleError> {
        let types = types
            .iter()
            .map(|attr_type| to_native_type(*attr_type))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self
            .session
            .get_attributes(object, &types)
            .map_err(|e| module_error("C_GetAttributeValue", e))?
            .into_iter()
            .filter_map(from_native_attribute)
            .collect())
    }

    fn destroy_object(&self, object: ObjectHandle) -> Result<(), ModuleError> {
        self.session
            .destroy_object(object)
            .map_err(|e| module_error("C_DestroyObject", e))
    }

    fn sign(&self, mechanism: &Mechanism, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>, ModuleError> {
        with_mechanism(mechanism, |mechanism| {
            self.session
                .sign(mechanism, key, data)
                .map_err(|e| module_error("C_Sign", e))
        })
    }

    fn decrypt(&self, mechanism: &Mechanism, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>, ModuleError> {
        with_mechanism(mechanism, |mechanism| {
            self.session
                .decrypt(mechanism, key, data)
                .map_err(|e| module_error("C_Decrypt", e))
        })
    }

    fn generate_random(&self, len: usize) -> Result<Vec<u8>, ModuleError> {
        let len = u32::try_from(len).map_err(|_| ModuleError::failed("C_GenerateRandom", "length too large"))?;
        self.session
            .generate_random_vec(len)
            .map_err(|e| module_error("C_GenerateRandom", e))
    }
}

//------------ Conversions ---------------------------------------------------

fn hash_mechanism(hash: HashAlg) -> Result<MechanismType, ModuleError> {
    match hash {
        HashAlg::Sha1 => Ok(MechanismType::SHA1),
        HashAlg::Sha224 => Ok(MechanismType::SHA224),
        HashAlg::Sha256 => Ok(MechanismType::SHA256),
        HashAlg::Sha384 => Ok(MechanismType::SHA384),
        HashAlg::Sha512 => Ok(MechanismType::SHA512),
        HashAlg::Md5 => Err(ModuleError::MechanismInvalid("MD5 parameters".to_string())),
    }
}

fn mgf(mgf: Mgf) -> PkcsMgfType {
    match mgf {
        Mgf::Mgf1Sha1 => PkcsMgfType::MGF1_SHA1,
        Mgf::Mgf1Sha224 => PkcsMgfType::MGF1_SHA224,
        Mgf::Mgf1Sha256 => PkcsMgfType::MGF1_SHA256,
        Mgf::Mgf1Sha384 => PkcsMgfType::MGF1_SHA384,
        Mgf::Mgf1Sha512 => PkcsMgfType::MGF1_SHA512,
    }
}

/// Runs `op` with the native form of a mechanism.
///
/// The OAEP parameters borrow the source data, so the native mechanism
/// cannot outlive this call.
fn with_mechanism<T>(
    mechanism: &Mechanism,
    op: impl FnOnce(&CkMechanism) -> Result<T, ModuleError>,
) -> Result<T, ModuleError> {
    let native = match mechanism {
        Mechanism::RsaPkcsKeyPairGen => CkMechanism::RsaPkcsKeyPairGen,
        Mechanism::EcKeyPairGen => CkMechanism::EccKeyPairGen,
        Mechanism::RsaPkcs => CkMechanism::RsaPkcs,
        Mechanism::RsaPkcsPss(params) => CkMechanism::RsaPkcsPss(PkcsPssParams {
            hash_alg: hash_mechanism(params.hash)?,
            mgf: mgf(params.mgf),
            s_len: (params.salt_len as u64).into(),
        }),
        Mechanism::RsaPkcsOaep(params) => {
            let source = if params.source.is_empty() {
                PkcsOaepSource::empty()
            } else {
                PkcsOaepSource::data_specified(&params.source)
            };
            CkMechanism::RsaPkcsOaep(PkcsOaepParams::new(
                hash_mechanism(params.hash)?,
                mgf(params.mgf),
                source,
            ))
        }
        Mechanism::Ecdsa => CkMechanism::Ecdsa,
        Mechanism::Dsa => return Err(ModuleError::MechanismInvalid("CKM_DSA".to_string())),
    };
    op(&native)
}

fn to_native_template(template: &[Attribute]) -> Result<Vec<CkAttribute>, ModuleError> {
    template.iter().map(to_native_attribute).collect()
}

fn to_native_attribute(attr: &Attribute) -> Result<CkAttribute, ModuleError> {
    Ok(match attr {
        Attribute::Class(ObjectClass::PublicKey) => CkAttribute::Class(CkObjectClass::PUBLIC_KEY),
        Attribute::Class(ObjectClass::PrivateKey) => CkAttribute::Class(CkObjectClass::PRIVATE_KEY),
        Attribute::KeyType(key_type) => CkAttribute::KeyType(match key_type {
            KeyType::Rsa => CkKeyType::RSA,
            KeyType::Ec => CkKeyType::EC,
            KeyType::Dsa => CkKeyType::DSA,
            KeyType::Other(name) => return Err(ModuleError::AttributeTypeInvalid(format!("key type {}", name))),
        }),
        Attribute::Id(v) => CkAttribute::Id(v.clone()),
        Attribute::Label(v) => CkAttribute::Label(v.clone()),
        Attribute::Token(b) => CkAttribute::Token(*b),
        Attribute::Private(b) => CkAttribute::Private(*b),
        Attribute::Sensitive(b) => CkAttribute::Sensitive(*b),
        Attribute::Extractable(b) => CkAttribute::Extractable(*b),
        Attribute::Sign(b) => CkAttribute::Sign(*b),
        Attribute::Verify(b) => CkAttribute::Verify(*b),
        Attribute::Encrypt(b) => CkAttribute::Encrypt(*b),
        Attribute::Decrypt(b) => CkAttribute::Decrypt(*b),
        Attribute::ModulusBits(bits) => CkAttribute::ModulusBits((*bits).into()),
        Attribute::PublicExponent(v) => CkAttribute::PublicExponent(v.clone()),
        Attribute::Modulus(v) => CkAttribute::Modulus(v.clone()),
        Attribute::EcParams(v) => CkAttribute::EcParams(v.clone()),
        Attribute::EcPoint(v) => CkAttribute::EcPoint(v.clone()),
        Attribute::Prime(v) => CkAttribute::Prime(v.clone()),
        Attribute::Base(v) => CkAttribute::Base(v.clone()),
        Attribute::Value(v) => CkAttribute::Value(v.clone()),
        Attribute::SubPrime(_) => return Err(ModuleError::AttributeTypeInvalid("CKA_SUBPRIME".to_string())),
    })
}

fn to_native_type(attr_type: AttributeType) -> Result<CkAttributeType, ModuleError> {
    Ok(match attr_type {
        AttributeType::Class => CkAttributeType::Class,
        AttributeType::KeyType => CkAttributeType::KeyType,
        AttributeType::Id => CkAttributeType::Id,
        AttributeType::Label => CkAttributeType::Label,
        AttributeType::Modulus => CkAttributeType::Modulus,
        AttributeType::PublicExponent => CkAttributeType::PublicExponent,
        AttributeType::EcParams => CkAttributeType::EcParams,
        AttributeType::EcPoint => CkAttributeType::EcPoint,
        AttributeType::Prime => CkAttributeType::Prime,
        AttributeType::Base => CkAttributeType::Base,
        AttributeType::Value => CkAttributeType::Value,
        AttributeType::SubPrime => return Err(ModuleError::AttributeTypeInvalid("CKA_SUBPRIME".to_string())),
    })
}

fn from_native_attribute(attr: CkAttribute) -> Option<Attribute> {
    Some(match attr {
        CkAttribute::Class(class) if class == CkObjectClass::PUBLIC_KEY => Attribute::Class(ObjectClass::PublicKey),
        CkAttribute::Class(class) if class == CkObjectClass::PRIVATE_KEY => Attribute::Class(ObjectClass::PrivateKey),
        CkAttribute::KeyType(key_type) => Attribute::KeyType(match key_type {
            CkKeyType::RSA => KeyType::Rsa,
            CkKeyType::EC => KeyType::Ec,
            CkKeyType::DSA => KeyType::Dsa,
            other => KeyType::Other(other.to_string()),
        }),
        CkAttribute::Id(v) => Attribute::Id(v),
        CkAttribute::Label(v) => Attribute::Label(v),
        CkAttribute::Modulus(v) => Attribute::Modulus(v),
        CkAttribute::PublicExponent(v) => Attribute::PublicExponent(v),
        CkAttribute::EcParams(v) => Attribute::EcParams(v),
        CkAttribute::EcPoint(v) => Attribute::EcPoint(v),
        CkAttribute::Prime(v) => Attribute::Prime(v),
        CkAttribute::Base(v) => Attribute::Base(v),
        CkAttribute::Value(v) => Attribute::Value(v),
        _ => return None,
    })
}

//------------ Provider construction -----------------------------------------

impl Pkcs11Provider<NativeModule> {
    /// Loads the configured library and opens the configured token.
    pub fn open(config: &TokenConfig) -> Result<Self, Error> {
        let module = NativeModule::load(config.path())?;
        Self::open_with(config, module)
    }
}

/// The registry loader for PKCS#11 backed providers.
pub fn loader() -> Loader {
    Arc::new(|config: &TokenConfig| {
        let provider = Pkcs11Provider::open(config)?;
        Ok(Arc::new(provider) as Arc<dyn Provider>)
    })
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_cannot_be_opened() {
        let err = NativeModule::load("/nonexistent/libkeycustody-pkcs11.so").err().unwrap();
        assert!(matches!(err, Error::CannotOpenModule(_)));
        assert!(matches!(NativeModule::load(""), Err(Error::NotConfigured(_))));
    }

    #[test]
    fn attribute_conversions() {
        let native = to_native_attribute(&Attribute::KeyType(KeyType::Ec)).unwrap();
        assert_eq!(from_native_attribute(native), Some(Attribute::KeyType(KeyType::Ec)));
        assert!(to_native_attribute(&Attribute::SubPrime(vec![1])).is_err());
        assert!(from_native_attribute(CkAttribute::Token(true)).is_none());
    }
}
