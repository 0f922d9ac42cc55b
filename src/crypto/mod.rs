//! Keys, the providers that hold them, and how to find both again.
pub mod aggregate;
pub mod codec;
pub mod keys;
pub mod keyuri;
pub mod provider;
pub mod registry;
pub mod signers;

pub use self::aggregate::Crypto;
pub use self::keys::{Curve, DecrypterOpts, HashAlg, KeyPurpose, PrivateKey, PublicKey, SignerOpts};
pub use self::keyuri::{KeyUri, TokenUri};
pub use self::provider::{KeyDescription, KeyManager, Provider, SlotTokenInfo};
pub use self::registry::{Loader, ProviderRegistry};
