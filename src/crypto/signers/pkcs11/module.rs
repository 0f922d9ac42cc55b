//! The seam between the PKCS#11 provider and a loaded PKCS#11 module.
//!
//! The provider logic only speaks in the small vocabulary of attributes,
//! object classes and mechanisms defined here. A [`Module`] implementation
//! translates that into calls on an actual module: the `cryptoki` binding
//! for real HSMs (see `native.rs`), or the software emulation used by the
//! tests (see `mockmodule.rs`).
use std::fmt;

use secrecy::SecretString;

use crate::crypto::codec::{OaepParams, PssParams};

//------------ ModuleError ---------------------------------------------------

/// An error reported by a PKCS#11 module.
///
/// Only the return values the provider reacts to get their own variant.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ModuleError {
    /// `CKR_USER_ALREADY_LOGGED_IN`
    UserAlreadyLoggedIn,

    /// `CKR_PIN_INCORRECT`
    PinIncorrect,

    /// `CKR_OBJECT_HANDLE_INVALID`
    ObjectHandleInvalid,

    /// `CKR_ATTRIBUTE_TYPE_INVALID`, or an attribute the binding cannot express.
    AttributeTypeInvalid(String),

    /// `CKR_MECHANISM_INVALID`, or a mechanism the binding cannot express.
    MechanismInvalid(String),

    /// Any other failure, with the function that failed.
    Failed { function: String, reason: String },
}

impl ModuleError {
    pub fn failed(function: &str, reason: impl fmt::Display) -> Self {
        ModuleError::Failed {
            function: function.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ModuleError::UserAlreadyLoggedIn => write!(f, "user already logged in"),
            ModuleError::PinIncorrect => write!(f, "incorrect PIN"),
            ModuleError::ObjectHandleInvalid => write!(f, "invalid object handle"),
            ModuleError::AttributeTypeInvalid(attr) => write!(f, "invalid attribute type: {}", attr),
            ModuleError::MechanismInvalid(mech) => write!(f, "invalid mechanism: {}", mech),
            ModuleError::Failed { function, reason } => write!(f, "{} failed: {}", function, reason),
        }
    }
}

impl std::error::Error for ModuleError {}

//------------ Object vocabulary ---------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ObjectClass {
    PublicKey,
    PrivateKey,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum KeyType {
    Rsa,
    Ec,
    Dsa,
    /// A key type the provider does not handle, by its module name.
    Other(String),
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyType::Rsa => write!(f, "RSA"),
            KeyType::Ec => write!(f, "EC"),
            KeyType::Dsa => write!(f, "DSA"),
            KeyType::Other(name) => write!(f, "{}", name),
        }
    }
}

/// The attribute types the provider reads back.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AttributeType {
    Class,
    KeyType,
    Id,
    Label,
    Modulus,
    PublicExponent,
    EcParams,
    EcPoint,
    Prime,
    SubPrime,
    Base,
    Value,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Attribute {
    Class(ObjectClass),
    KeyType(KeyType),
    Id(Vec<u8>),
    Label(Vec<u8>),
    Token(bool),
    Private(bool),
    Sensitive(bool),
    Extractable(bool),
    Sign(bool),
    Verify(bool),
    Encrypt(bool),
    Decrypt(bool),
    ModulusBits(u64),
    PublicExponent(Vec<u8>),
    Modulus(Vec<u8>),
    EcParams(Vec<u8>),
    EcPoint(Vec<u8>),
    Prime(Vec<u8>),
    SubPrime(Vec<u8>),
    Base(Vec<u8>),
    Value(Vec<u8>),
}

impl Attribute {
    pub fn attribute_type(&self) -> Option<AttributeType> {
        match self {
            Attribute::Class(_) => Some(AttributeType::Class),
            Attribute::KeyType(_) => Some(AttributeType::KeyType),
            Attribute::Id(_) => Some(AttributeType::Id),
            Attribute::Label(_) => Some(AttributeType::Label),
            Attribute::Modulus(_) => Some(AttributeType::Modulus),
            Attribute::PublicExponent(_) => Some(AttributeType::PublicExponent),
            Attribute::EcParams(_) => Some(AttributeType::EcParams),
            Attribute::EcPoint(_) => Some(AttributeType::EcPoint),
            Attribute::Prime(_) => Some(AttributeType::Prime),
            Attribute::SubPrime(_) => Some(AttributeType::SubPrime),
            Attribute::Base(_) => Some(AttributeType::Base),
            Attribute::Value(_) => Some(AttributeType::Value),
            _ => None,
        }
    }

    /// The value of a byte array attribute.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Attribute::Id(v)
            | Attribute::Label(v)
            | Attribute::PublicExponent(v)
            | Attribute::Modulus(v)
            | Attribute::EcParams(v)
            | Attribute::EcPoint(v)
            | Attribute::Prime(v)
            | Attribute::SubPrime(v)
            | Attribute::Base(v)
            | Attribute::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// The mechanisms the provider uses.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Mechanism {
    RsaPkcsKeyPairGen,
    EcKeyPairGen,
    /// Raw PKCS#1 v1.5, the input is a DigestInfo.
    RsaPkcs,
    RsaPkcsPss(PssParams),
    RsaPkcsOaep(OaepParams),
    /// Raw ECDSA over a digest, R‖S output.
    Ecdsa,
    /// Raw DSA over a digest, R‖S output.
    Dsa,
}

//------------ Slot and token information ------------------------------------

/// What a module reports about a slot and the token in it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TokenDetails {
    pub slot_description: String,
    pub label: String,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub flags: u64,
    pub login_required: bool,
}

//------------ Module / Session ----------------------------------------------

/// A loaded and initialized PKCS#11 module.
pub trait Module: Send + Sync + 'static {
    type Session: Session;

    /// A description of the module library itself.
    fn library_description(&self) -> Result<String, ModuleError>;

    /// The ids of all slots with a token present.
    fn slots_with_token(&self) -> Result<Vec<u64>, ModuleError>;

    fn token_details(&self, slot: u64) -> Result<TokenDetails, ModuleError>;

    /// Opens a read-write session.
    fn open_session(&self, slot: u64) -> Result<Self::Session, ModuleError>;
}

/// The handle type of the objects of a module.
pub type ObjectHandle<M> = <<M as Module>::Session as Session>::Handle;

/// An open session.
///
/// A session is only ever used by one thread at a time, but may move
/// between threads.
pub trait Session: Send + 'static {
    type Handle: Copy + fmt::Debug + Send + Sync + 'static;

    fn login(&self, pin: Option<&SecretString>) -> Result<(), ModuleError>;

    fn generate_key_pair(
        &self,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(Self::Handle, Self::Handle), ModuleError>;

    fn find_objects(&self, template: &[Attribute]) -> Result<Vec<Self::Handle>, ModuleError>;

    /// Reads the requested attributes. Attributes the object does not
    /// have are left out of the result.
    fn get_attributes(&self, object: Self::Handle, types: &[AttributeType]) -> Result<Vec<Attribute>, ModuleError>;

    fn destroy_object(&self, object: Self::Handle) -> Result<(), ModuleError>;

    fn sign(&self, mechanism: &Mechanism, key: Self::Handle, data: &[u8]) -> Result<Vec<u8>, ModuleError>;

    fn decrypt(&self, mechanism: &Mechanism, key: Self::Handle, data: &[u8]) -> Result<Vec<u8>, ModuleError>;

    fn generate_random(&self, len: usize) -> Result<Vec<u8>, ModuleError>;
}
