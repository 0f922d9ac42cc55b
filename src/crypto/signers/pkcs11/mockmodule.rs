//! A software stand-in for a PKCS#11 module.
//!
//! Keeps tokens and their objects in memory and performs the mechanisms
//! used by the provider with openssl. Used by the tests of this crate and
//! by integration tests that need a module without an HSM at hand.
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use openssl::{
    bn::{BigNum, BigNumContext},
    dsa::Dsa,
    ec::{EcGroup, EcKey, PointConversionForm},
    pkey::{PKey, Private},
    pkey_ctx::PkeyCtx,
    rsa::{Padding, Rsa},
    sign::RsaPssSaltlen,
};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

use crate::crypto::codec;
use crate::crypto::signers::pkcs11::module::{
    Attribute, AttributeType, KeyType, Mechanism, Module, ModuleError, ObjectClass, Session, TokenDetails,
};

const CKF_RNG: u64 = 0x0000_0001;
const CKF_LOGIN_REQUIRED: u64 = 0x0000_0004;
const CKF_USER_PIN_INITIALIZED: u64 = 0x0000_0008;
const CKF_TOKEN_INITIALIZED: u64 = 0x0000_0400;

/// Slot ids start here, the way SoftHSM hands out large slot ids.
const FIRST_SLOT: u64 = 0x2a8f_0000;

//------------ MockState -----------------------------------------------------

struct MockObject {
    attrs: Vec<Attribute>,
    key: Option<PKey<Private>>,
}

impl MockObject {
    fn has(&self, attr: &Attribute) -> bool {
        self.attrs.contains(attr)
    }
}

struct MockToken {
    details: TokenDetails,
    pin: String,
    logged_in: bool,
    objects: BTreeMap<u64, MockObject>,
}

#[derive(Default)]
struct MockState {
    tokens: BTreeMap<u64, MockToken>,
    next_handle: u64,
    sessions_opened: usize,
    login_calls: usize,
    fail_random: bool,
}

impl MockState {
    fn token(&mut self, slot: u64, function: &str) -> Result<&mut MockToken, ModuleError> {
        self.tokens
            .get_mut(&slot)
            .ok_or_else(|| ModuleError::failed(function, "CKR_SLOT_ID_INVALID"))
    }

    fn store(&mut self, slot: u64, object: MockObject) -> Result<u64, ModuleError> {
        self.next_handle += 1;
        let handle = self.next_handle;
        self.token(slot, "C_CreateObject")?.objects.insert(handle, object);
        Ok(handle)
    }
}

//------------ MockModule ----------------------------------------------------

/// An in-memory PKCS#11 module.
///
/// Clones share the same tokens.
#[derive(Clone, Default)]
pub struct MockModule {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockModule").finish()
    }
}

impl MockModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a module with a single token that requires login.
    pub fn with_token(label: &str, pin: &str) -> Self {
        let module = Self::new();
        module.add_token(label, pin, true);
        module
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>, ModuleError> {
        self.state
            .lock()
            .map_err(|_| ModuleError::failed("C_Lock", "mock module state is poisoned"))
    }

    fn with_state<T: Default>(&self, op: impl FnOnce(&MockState) -> T) -> T {
        self.lock().map(|state| op(&state)).unwrap_or_default()
    }

    /// Adds a token and returns its slot id.
    pub fn add_token(&self, label: &str, pin: &str, login_required: bool) -> u64 {
        let Ok(mut state) = self.lock() else {
            return 0;
        };
        let slot = FIRST_SLOT + state.tokens.len() as u64;
        let mut flags = CKF_RNG | CKF_TOKEN_INITIALIZED | CKF_USER_PIN_INITIALIZED;
        if login_required {
            flags |= CKF_LOGIN_REQUIRED;
        }
        let details = TokenDetails {
            slot_description: format!("Mock slot {}", slot),
            label: label.to_string(),
            manufacturer: "Mock project".to_string(),
            model: "Mock Token v1".to_string(),
            serial: format!("{:016x}", slot),
            flags,
            login_required,
        };
        state.tokens.insert(
            slot,
            MockToken {
                details,
                pin: pin.to_string(),
                logged_in: false,
                objects: BTreeMap::new(),
            },
        );
        slot
    }

    /// Stores a DSA key pair, which the provider cannot generate itself.
    pub fn add_dsa_key_pair(&self, slot: u64, id: &[u8], label: &str) -> Result<(), ModuleError> {
        let dsa = Dsa::generate(1024).map_err(|e| ModuleError::failed("C_CreateObject", e))?;
        let values = [dsa.p().to_vec(), dsa.q().to_vec(), dsa.g().to_vec(), dsa.pub_key().to_vec()];
        let key = PKey::from_dsa(dsa).map_err(|e| ModuleError::failed("C_CreateObject", e))?;

        let common = |class| {
            vec![
                Attribute::Class(class),
                Attribute::KeyType(KeyType::Dsa),
                Attribute::Id(id.to_vec()),
                Attribute::Label(label.as_bytes().to_vec()),
                Attribute::Prime(values[0].clone()),
                Attribute::SubPrime(values[1].clone()),
                Attribute::Base(values[2].clone()),
            ]
        };
        let mut public = common(ObjectClass::PublicKey);
        public.push(Attribute::Value(values[3].clone()));
        let mut private = common(ObjectClass::PrivateKey);
        private.push(Attribute::Sign(true));

        let mut state = self.lock()?;
        state.store(slot, MockObject { attrs: public, key: None })?;
        state.store(slot, MockObject { attrs: private, key: Some(key) })?;
        Ok(())
    }

    /// Stores an object with just the given attributes.
    pub fn add_object(&self, slot: u64, attrs: Vec<Attribute>) -> Result<(), ModuleError> {
        self.lock()?.store(slot, MockObject { attrs, key: None })?;
        Ok(())
    }

    /// Makes `C_GenerateRandom` fail from now on.
    pub fn set_fail_random(&self, fail: bool) {
        if let Ok(mut state) = self.lock() {
            state.fail_random = fail;
        }
    }

    pub fn login_calls(&self) -> usize {
        self.with_state(|state| state.login_calls)
    }

    pub fn sessions_opened(&self) -> usize {
        self.with_state(|state| state.sessions_opened)
    }

    pub fn object_count(&self, slot: u64) -> usize {
        self.with_state(|state| state.tokens.get(&slot).map(|t| t.objects.len()).unwrap_or(0))
    }
}

impl Module for MockModule {
    type Session = MockSession;

    fn library_description(&self) -> Result<String, ModuleError> {
        Ok("Mock PKCS#11 module".to_string())
    }

    fn slots_with_token(&self) -> Result<Vec<u64>, ModuleError> {
        Ok(self.lock()?.tokens.keys().copied().collect())
    }

    fn token_details(&self, slot: u64) -> Result<TokenDetails, ModuleError> {
        Ok(self.lock()?.token(slot, "C_GetTokenInfo")?.details.clone())
    }

    fn open_session(&self, slot: u64) -> Result<MockSession, ModuleError> {
        let mut state = self.lock()?;
        state.token(slot, "C_OpenSession")?;
        state.sessions_opened += 1;
        Ok(MockSession {
            module: self.clone(),
            slot,
        })
    }
}

//------------ MockSession ---------------------------------------------------

pub struct MockSession {
    module: MockModule,
    slot: u64,
}

impl MockSession {
    fn check_logged_in(token: &MockToken, function: &str) -> Result<(), ModuleError> {
        if token.details.login_required && !token.logged_in {
            return Err(ModuleError::failed(function, "CKR_USER_NOT_LOGGED_IN"));
        }
        Ok(())
    }

    /// Looks up a private key object usable for the given function.
    fn private_key(&self, key: u64, usage: Attribute, function: &str) -> Result<PKey<Private>, ModuleError> {
        let mut state = self.module.lock()?;
        let token = state.token(self.slot, function)?;
        Self::check_logged_in(token, function)?;
        let object = token.objects.get(&key).ok_or(ModuleError::ObjectHandleInvalid)?;
        if !object.has(&usage) {
            return Err(ModuleError::failed(function, "CKR_KEY_FUNCTION_NOT_PERMITTED"));
        }
        object
            .key
            .clone()
            .ok_or_else(|| ModuleError::failed(function, "CKR_KEY_TYPE_INCONSISTENT"))
    }

    fn generate_rsa(
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(Vec<Attribute>, Vec<Attribute>, PKey<Private>), openssl::error::ErrorStack> {
        let bits = public_template
            .iter()
            .find_map(|attr| match attr {
                Attribute::ModulusBits(bits) => Some(*bits as u32),
                _ => None,
            })
            .unwrap_or(2048);
        let exponent = public_template
            .iter()
            .find_map(|attr| match attr {
                Attribute::PublicExponent(e) => Some(e.clone()),
                _ => None,
            })
            .unwrap_or_else(|| vec![0x01, 0x00, 0x01]);

        let e = BigNum::from_slice(&exponent)?;
        let rsa = Rsa::generate_with_e(bits, &e)?;
        let modulus = rsa.n().to_vec();
        let exponent = rsa.e().to_vec();

        let mut public = public_template.to_vec();
        public.extend([
            Attribute::Class(ObjectClass::PublicKey),
            Attribute::KeyType(KeyType::Rsa),
            Attribute::Modulus(modulus.clone()),
            Attribute::PublicExponent(exponent.clone()),
        ]);
        let mut private = private_template.to_vec();
        private.extend([
            Attribute::Class(ObjectClass::PrivateKey),
            Attribute::KeyType(KeyType::Rsa),
            Attribute::Modulus(modulus),
            Attribute::PublicExponent(exponent),
        ]);
        Ok((public, private, PKey::from_rsa(rsa)?))
    }

    fn generate_ec(
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(Vec<Attribute>, Vec<Attribute>, PKey<Private>), ModuleError> {
        let failed = |e: openssl::error::ErrorStack| ModuleError::failed("C_GenerateKeyPair", e);
        let params = public_template
            .iter()
            .find_map(|attr| match attr {
                Attribute::EcParams(params) => Some(params.clone()),
                _ => None,
            })
            .ok_or_else(|| ModuleError::failed("C_GenerateKeyPair", "CKR_TEMPLATE_INCOMPLETE"))?;
        let curve = codec::curve_from_oid_der(&params)
            .map_err(|_| ModuleError::failed("C_GenerateKeyPair", "CKR_CURVE_NOT_SUPPORTED"))?;

        let group = EcGroup::from_curve_name(curve.nid()).map_err(failed)?;
        let ec = EcKey::generate(&group).map_err(failed)?;
        let mut ctx = BigNumContext::new().map_err(failed)?;
        let point = ec
            .public_key()
            .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)
            .map_err(failed)?;

        let mut public = public_template.to_vec();
        public.extend([
            Attribute::Class(ObjectClass::PublicKey),
            Attribute::KeyType(KeyType::Ec),
            Attribute::EcPoint(codec::encode_ec_point(&point)),
        ]);
        let mut private = private_template.to_vec();
        private.extend([
            Attribute::Class(ObjectClass::PrivateKey),
            Attribute::KeyType(KeyType::Ec),
            Attribute::EcParams(params),
        ]);
        Ok((public, private, PKey::from_ec_key(ec).map_err(failed)?))
    }

    /// Signs a digest with a DSA or EC key and returns R‖S.
    fn sign_raw_rs(key: &PKey<Private>, data: &[u8]) -> Result<Vec<u8>, ModuleError> {
        let failed = |e: openssl::error::ErrorStack| ModuleError::failed("C_Sign", e);
        let width = match (key.ec_key(), key.dsa()) {
            (Ok(ec), _) => (ec.group().degree() as usize).div_ceil(8),
            (_, Ok(dsa)) => dsa.q().num_bytes() as usize,
            _ => return Err(ModuleError::failed("C_Sign", "CKR_KEY_TYPE_INCONSISTENT")),
        };
        let mut ctx = PkeyCtx::new(key).map_err(failed)?;
        ctx.sign_init().map_err(failed)?;
        let mut der = Vec::new();
        ctx.sign_to_vec(data, &mut der).map_err(failed)?;
        codec::der_signature_to_raw(&der, width).map_err(|e| ModuleError::failed("C_Sign", e))
    }
}

impl Session for MockSession {
    type Handle = u64;

    fn login(&self, pin: Option<&SecretString>) -> Result<(), ModuleError> {
        let mut state = self.module.lock()?;
        state.login_calls += 1;
        let token = state.token(self.slot, "C_Login")?;
        if token.logged_in {
            return Err(ModuleError::UserAlreadyLoggedIn);
        }
        match pin {
            Some(pin) if pin.expose_secret() == &token.pin => {
                token.logged_in = true;
                Ok(())
            }
            _ => Err(ModuleError::PinIncorrect),
        }
    }

    fn generate_key_pair(
        &self,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(u64, u64), ModuleError> {
        {
            let mut state = self.module.lock()?;
            Self::check_logged_in(state.token(self.slot, "C_GenerateKeyPair")?, "C_GenerateKeyPair")?;
        }

        let (public, private, key) = match mechanism {
            Mechanism::RsaPkcsKeyPairGen => Self::generate_rsa(public_template, private_template)
                .map_err(|e| ModuleError::failed("C_GenerateKeyPair", e))?,
            Mechanism::EcKeyPairGen => Self::generate_ec(public_template, private_template)?,
            other => return Err(ModuleError::MechanismInvalid(format!("{:?}", other))),
        };

        let mut state = self.module.lock()?;
        let public = state.store(self.slot, MockObject { attrs: public, key: None })?;
        let private = state.store(self.slot, MockObject { attrs: private, key: Some(key) })?;
        Ok((public, private))
    }

    fn find_objects(&self, template: &[Attribute]) -> Result<Vec<u64>, ModuleError> {
        let mut state = self.module.lock()?;
        let token = state.token(self.slot, "C_FindObjects")?;
        Ok(token
            .objects
            .iter()
            .filter(|(_, object)| template.iter().all(|attr| object.has(attr)))
            .map(|(handle, _)| *handle)
            .collect())
    }

    fn get_attributes(&self, object: u64, types: &[AttributeType]) -> Result<Vec<Attribute>, ModuleError> {
        let mut state = self.module.lock()?;
        let token = state.token(self.slot, "C_GetAttributeValue")?;
        let object = token.objects.get(&object).ok_or(ModuleError::ObjectHandleInvalid)?;
        Ok(object
            .attrs
            .iter()
            .filter(|attr| attr.attribute_type().is_some_and(|t| types.contains(&t)))
            .cloned()
            .collect())
    }

    fn destroy_object(&self, object: u64) -> Result<(), ModuleError> {
        let mut state = self.module.lock()?;
        let token = state.token(self.slot, "C_DestroyObject")?;
        token
            .objects
            .remove(&object)
            .map(|_| ())
            .ok_or(ModuleError::ObjectHandleInvalid)
    }

    fn sign(&self, mechanism: &Mechanism, key: u64, data: &[u8]) -> Result<Vec<u8>, ModuleError> {
        let failed = |e: openssl::error::ErrorStack| ModuleError::failed("C_Sign", e);
        let key = self.private_key(key, Attribute::Sign(true), "C_SignInit")?;
        match mechanism {
            Mechanism::RsaPkcs => {
                let rsa = key.rsa().map_err(failed)?;
                let mut out = vec![0; rsa.size() as usize];
                let len = rsa.private_encrypt(data, &mut out, Padding::PKCS1).map_err(failed)?;
                out.truncate(len);
                Ok(out)
            }
            Mechanism::RsaPkcsPss(params) => {
                let mut ctx = PkeyCtx::new(&key).map_err(failed)?;
                ctx.sign_init().map_err(failed)?;
                ctx.set_rsa_padding(Padding::PKCS1_PSS).map_err(failed)?;
                ctx.set_signature_md(params.hash.md()).map_err(failed)?;
                ctx.set_rsa_pss_saltlen(RsaPssSaltlen::custom(params.salt_len as i32))
                    .map_err(failed)?;
                ctx.set_rsa_mgf1_md(params.mgf.hash().md()).map_err(failed)?;
                let mut out = Vec::new();
                ctx.sign_to_vec(data, &mut out).map_err(failed)?;
                Ok(out)
            }
            Mechanism::Ecdsa | Mechanism::Dsa => Self::sign_raw_rs(&key, data),
            other => Err(ModuleError::MechanismInvalid(format!("{:?}", other))),
        }
    }

    fn decrypt(&self, mechanism: &Mechanism, key: u64, data: &[u8]) -> Result<Vec<u8>, ModuleError> {
        let failed = |e: openssl::error::ErrorStack| ModuleError::failed("C_Decrypt", e);
        let key = self.private_key(key, Attribute::Decrypt(true), "C_DecryptInit")?;
        let mut ctx = PkeyCtx::new(&key).map_err(failed)?;
        ctx.decrypt_init().map_err(failed)?;
        match mechanism {
            Mechanism::RsaPkcs => {
                ctx.set_rsa_padding(Padding::PKCS1).map_err(failed)?;
            }
            Mechanism::RsaPkcsOaep(params) => {
                ctx.set_rsa_padding(Padding::PKCS1_OAEP).map_err(failed)?;
                ctx.set_rsa_oaep_md(params.hash.md()).map_err(failed)?;
                ctx.set_rsa_mgf1_md(params.mgf.hash().md()).map_err(failed)?;
                if !params.source.is_empty() {
                    ctx.set_rsa_oaep_label(&params.source).map_err(failed)?;
                }
            }
            other => return Err(ModuleError::MechanismInvalid(format!("{:?}", other))),
        }
        let mut out = Vec::new();
        ctx.decrypt_to_vec(data, &mut out).map_err(failed)?;
        Ok(out)
    }

    fn generate_random(&self, len: usize) -> Result<Vec<u8>, ModuleError> {
        if self.module.lock()?.fail_random {
            return Err(ModuleError::failed("C_GenerateRandom", "CKR_RANDOM_NO_RNG"));
        }
        let mut bytes = vec![0; len];
        rand::rng().fill_bytes(&mut bytes);
        Ok(bytes)
    }
}
