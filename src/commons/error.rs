//! Defines all errors raised by the key custody providers.

use std::{fmt, io};

use openssl::error::ErrorStack;

use crate::config::ConfigError;
use crate::crypto::signers::pkcs11::ModuleError;

//------------ IoError -------------------------------------------------------

/// An io error together with the file operation that caused it.
#[derive(Debug)]
pub struct IoError {
    context: String,
    cause: io::Error,
}

impl IoError {
    pub fn new(context: String, cause: io::Error) -> Self {
        IoError { context, cause }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}, cause: {}", self.context, self.cause)
    }
}

impl std::error::Error for IoError {}

//------------ ErrorContext --------------------------------------------------

/// The operation and identifying parameters of a failed call.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ErrorContext {
    op: String,
    slot: Option<u64>,
    key_id: Option<String>,
}

impl ErrorContext {
    pub fn op(&self) -> &str {
        &self.op
    }

    pub fn slot(&self) -> Option<u64> {
        self.slot
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} failed", self.op)?;
        match (self.slot, self.key_id.as_ref()) {
            (Some(slot), Some(id)) => write!(f, " (slot {}, key id '{}')", slot, id),
            (Some(slot), None) => write!(f, " (slot {})", slot),
            (None, Some(id)) => write!(f, " (key id '{}')", id),
            (None, None) => Ok(()),
        }
    }
}

//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    TokenNotFound,
    KeyNotFound,
    NotConfigured(String),
    CannotOpenModule(String),
    CannotGetRandomData,
    UnsupportedKeyType,
    MalformedRsaKey,
    UnrecognizedRsaOptions,
    UnsupportedRsaOptions,
    MalformedDer,
    MalformedSignature,
    InvalidUri(String),
    InvalidPrivateKeyUri(String),
    UnsupportedEllipticCurve,
    MalformedPoint,
    WeakRsaKey(u32),

    // Registry and aggregator
    AlreadyRegistered(String),
    NotRegistered(String),
    DuplicateManufacturer(String),
    ProviderNotFound(String),

    // Provider was closed
    Closed,

    Module(ModuleError),
    Context(ErrorContext, Box<Error>),
    Config(ConfigError),
    Io(IoError),
    Json(serde_json::Error),
    OpenSsl(ErrorStack),
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::TokenNotFound => write!(f, "could not find PKCS#11 token"),
            Error::KeyNotFound => write!(f, "could not find specified key"),
            Error::NotConfigured(what) => write!(f, "not configured: {}", what),
            Error::CannotOpenModule(e) => write!(f, "could not open PKCS#11 module: {}", e),
            Error::CannotGetRandomData => write!(f, "cannot get random data from PKCS#11 module"),
            Error::UnsupportedKeyType => write!(f, "unsupported key type"),
            Error::MalformedRsaKey => write!(f, "malformed RSA key"),
            Error::UnrecognizedRsaOptions => write!(f, "RSA options not recognized"),
            Error::UnsupportedRsaOptions => write!(f, "RSA options not supported"),
            Error::MalformedDer => write!(f, "malformed DER message"),
            Error::MalformedSignature => write!(f, "malformed signature"),
            Error::InvalidUri(e) => write!(f, "invalid URI: {}", e),
            Error::InvalidPrivateKeyUri(e) => write!(f, "invalid URI for private key: {}", e),
            Error::UnsupportedEllipticCurve => write!(f, "unsupported elliptic curve"),
            Error::MalformedPoint => write!(f, "malformed elliptic curve point"),
            Error::WeakRsaKey(bits) => write!(f, "RSA key is too weak: {}", bits),
            Error::AlreadyRegistered(name) => write!(f, "already registered: {}", name),
            Error::NotRegistered(name) => write!(f, "not registered: {}", name),
            Error::DuplicateManufacturer(name) => write!(f, "duplicate provider specified for manufacturer: {}", name),
            Error::ProviderNotFound(name) => write!(f, "provider for manufacturer '{}' not found", name),
            Error::Closed => write!(f, "provider is closed"),
            Error::Module(e) => write!(f, "PKCS#11 error: {}", e),
            Error::Context(ctx, cause) => write!(f, "{}: {}", ctx, cause),
            Error::Config(e) => write!(f, "configuration error: {}", e),
            Error::Io(e) => write!(f, "{}", e),
            Error::Json(e) => write!(f, "invalid JSON: {}", e),
            Error::OpenSsl(e) => write!(f, "OpenSSL error: {}", e),
            Error::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Context(_, cause) => Some(cause.as_ref()),
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            Error::OpenSsl(e) => Some(e),
            _ => None,
        }
    }
}

impl Error {
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }

    pub fn invalid_uri(msg: impl fmt::Display) -> Self {
        Error::InvalidUri(msg.to_string())
    }

    pub fn invalid_private_key_uri(msg: impl fmt::Display) -> Self {
        Error::InvalidPrivateKeyUri(msg.to_string())
    }

    /// Annotates this error with the failed operation and, where known,
    /// the slot and key id it was working on.
    pub fn within(self, op: &str, slot: Option<u64>, key_id: Option<&str>) -> Self {
        let ctx = ErrorContext {
            op: op.to_string(),
            slot,
            key_id: key_id.map(str::to_string),
        };
        Error::Context(ctx, Box::new(self))
    }

    /// Returns the underlying error kind, looking through any context.
    pub fn kind(&self) -> &Error {
        let mut err = self;
        while let Error::Context(_, cause) = err {
            err = cause;
        }
        err
    }

    /// Returns the outermost context, if any.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Context(ctx, _) => Some(ctx),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind(),
            Error::KeyNotFound | Error::TokenNotFound | Error::ProviderNotFound(_)
        )
    }
}

impl From<ModuleError> for Error {
    fn from(e: ModuleError) -> Self {
        Error::Module(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<ErrorStack> for Error {
    fn from(e: ErrorStack) -> Self {
        Error::OpenSsl(e)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_transparent_for_kind() {
        let err = Error::KeyNotFound.within("find key pair", Some(3), Some("abc"));
        assert!(err.is_not_found());
        assert!(matches!(err.kind(), Error::KeyNotFound));

        let ctx = err.context().unwrap();
        assert_eq!(ctx.op(), "find key pair");
        assert_eq!(ctx.slot(), Some(3));
        assert_eq!(ctx.key_id(), Some("abc"));

        assert_eq!(
            err.to_string(),
            "find key pair failed (slot 3, key id 'abc'): could not find specified key"
        );
    }

    #[test]
    fn weak_rsa_key_message() {
        assert_eq!(Error::WeakRsaKey(1024).to_string(), "RSA key is too weak: 1024");
        assert_eq!(
            Error::AlreadyRegistered("Foo".to_string()).to_string(),
            "already registered: Foo"
        );
        assert!(!Error::MalformedDer.is_not_found());
    }
}
