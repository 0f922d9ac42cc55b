pub mod driver;

#[cfg(any(test, feature = "test-support"))]
pub mod mockmodule;

pub mod module;
pub mod session;
pub mod signer;

#[cfg(feature = "hsm")]
pub mod native;

pub use module::ModuleError;
pub use signer::{Pkcs11PrivateKey, Pkcs11Provider};
