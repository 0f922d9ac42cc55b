//! A provider keeping its keys in AWS KMS.
//!
//! The KMS API itself is reached through a [`KmsClient`], which the
//! application supplies. Keys are addressed by their KMS key id, their
//! label is kept as the key description.
use std::{
    any::Any,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::Utc;
use log::{debug, info};
use rand::RngCore;

use crate::commons::error::Error;
use crate::config::TokenConfig;
use crate::constants::{KEY_LABEL_RANDOM_BYTES, MIN_RSA_KEY_BITS};
use crate::crypto::{
    keys::{Curve, DecrypterOpts, HashAlg, KeyPurpose, PrivateKey, PublicKey, SignerOpts},
    keyuri::KeyUri,
    provider::Provider,
    registry::Loader,
};

/// The token attribute naming the AWS region.
pub const ATTR_REGION: &str = "Region";

/// The token attribute naming the AWS account.
pub const ATTR_ACCOUNT: &str = "Account";

/// KMS refuses to delete a key sooner than this many days after asking.
pub const MIN_PENDING_WINDOW_DAYS: u32 = 7;

//------------ KmsKeySpec ----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KmsKeySpec {
    Rsa2048,
    Rsa3072,
    Rsa4096,
    EccNistP256,
    EccNistP384,
    EccNistP521,
}

impl KmsKeySpec {
    pub fn rsa(bits: u32) -> Result<Self, Error> {
        match bits {
            2048 => Ok(KmsKeySpec::Rsa2048),
            3072 => Ok(KmsKeySpec::Rsa3072),
            4096 => Ok(KmsKeySpec::Rsa4096),
            bits if bits < MIN_RSA_KEY_BITS => Err(Error::WeakRsaKey(bits)),
            bits => Err(Error::other(format!("KMS has no RSA key spec for {} bits", bits))),
        }
    }

    pub fn ecc(curve: Curve) -> Result<Self, Error> {
        match curve {
            Curve::P256 => Ok(KmsKeySpec::EccNistP256),
            Curve::P384 => Ok(KmsKeySpec::EccNistP384),
            Curve::P521 => Ok(KmsKeySpec::EccNistP521),
            Curve::P224 => Err(Error::UnsupportedEllipticCurve),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KmsKeySpec::Rsa2048 => "RSA_2048",
            KmsKeySpec::Rsa3072 => "RSA_3072",
            KmsKeySpec::Rsa4096 => "RSA_4096",
            KmsKeySpec::EccNistP256 => "ECC_NIST_P256",
            KmsKeySpec::EccNistP384 => "ECC_NIST_P384",
            KmsKeySpec::EccNistP521 => "ECC_NIST_P521",
        }
    }
}

impl fmt::Display for KmsKeySpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//------------ KmsKeyUsage ---------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KmsKeyUsage {
    SignVerify,
    EncryptDecrypt,
}

impl KmsKeyUsage {
    pub fn as_str(self) -> &'static str {
        match self {
            KmsKeyUsage::SignVerify => "SIGN_VERIFY",
            KmsKeyUsage::EncryptDecrypt => "ENCRYPT_DECRYPT",
        }
    }
}

impl From<KeyPurpose> for KmsKeyUsage {
    fn from(purpose: KeyPurpose) -> Self {
        match purpose {
            KeyPurpose::Signing => KmsKeyUsage::SignVerify,
            KeyPurpose::Encryption => KmsKeyUsage::EncryptDecrypt,
        }
    }
}

//------------ KmsSigningAlgorithm -------------------------------------------

/// The signing algorithms of KMS, all of which sign a digest.
///
/// KMS only knows the SHA-2 hashes from SHA-256 up and, for PSS, only a
/// salt as long as the digest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KmsSigningAlgorithm {
    RsaPkcs1(HashAlg),
    RsaPss(HashAlg),
    Ecdsa(HashAlg),
}

impl KmsSigningAlgorithm {
    pub fn for_key(public: &PublicKey, opts: &SignerOpts) -> Result<Self, Error> {
        if !matches!(opts.hash, HashAlg::Sha256 | HashAlg::Sha384 | HashAlg::Sha512) {
            return Err(Error::other(format!("KMS cannot sign {:?} digests", opts.hash)));
        }
        match public {
            PublicKey::Rsa { .. } => match opts.pss {
                None => Ok(KmsSigningAlgorithm::RsaPkcs1(opts.hash)),
                Some(salt) => {
                    if salt.resolve(opts.hash)? != opts.hash.size() {
                        return Err(Error::UnsupportedRsaOptions);
                    }
                    Ok(KmsSigningAlgorithm::RsaPss(opts.hash))
                }
            },
            PublicKey::Ecdsa { .. } => Ok(KmsSigningAlgorithm::Ecdsa(opts.hash)),
            PublicKey::Dsa { .. } => Err(Error::UnsupportedKeyType),
        }
    }

    pub fn hash(self) -> HashAlg {
        match self {
            KmsSigningAlgorithm::RsaPkcs1(hash)
            | KmsSigningAlgorithm::RsaPss(hash)
            | KmsSigningAlgorithm::Ecdsa(hash) => hash,
        }
    }

    pub fn name(self) -> String {
        let bits = self.hash().size() * 8;
        match self {
            KmsSigningAlgorithm::RsaPkcs1(_) => format!("RSASSA_PKCS1_V1_5_SHA_{}", bits),
            KmsSigningAlgorithm::RsaPss(_) => format!("RSASSA_PSS_SHA_{}", bits),
            KmsSigningAlgorithm::Ecdsa(_) => format!("ECDSA_SHA_{}", bits),
        }
    }
}

//------------ KmsEncryptionAlgorithm ----------------------------------------

/// KMS decrypts with OAEP only, without a label.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KmsEncryptionAlgorithm {
    OaepSha1,
    OaepSha256,
}

impl KmsEncryptionAlgorithm {
    pub fn for_opts(opts: &DecrypterOpts) -> Result<Self, Error> {
        match opts {
            DecrypterOpts::Oaep { hash, label } if label.is_empty() => match hash {
                HashAlg::Sha1 => Ok(KmsEncryptionAlgorithm::OaepSha1),
                HashAlg::Sha256 => Ok(KmsEncryptionAlgorithm::OaepSha256),
                _ => Err(Error::UnsupportedRsaOptions),
            },
            _ => Err(Error::UnsupportedRsaOptions),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            KmsEncryptionAlgorithm::OaepSha1 => "RSAES_OAEP_SHA_1",
            KmsEncryptionAlgorithm::OaepSha256 => "RSAES_OAEP_SHA_256",
        }
    }
}

//------------ KmsKeyMetadata ------------------------------------------------

/// What `DescribeKey` and `CreateKey` tell about a key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KmsKeyMetadata {
    pub key_id: String,
    pub arn: String,
    pub description: String,
    pub key_spec: KmsKeySpec,
    pub key_usage: KmsKeyUsage,
    pub enabled: bool,
}

//------------ KmsClient -----------------------------------------------------

/// The KMS calls the provider needs.
///
/// Implementations block until KMS answered. A key that does not exist
/// or is pending deletion must be reported as [`Error::KeyNotFound`].
pub trait KmsClient: Send + Sync {
    fn create_key(&self, spec: KmsKeySpec, usage: KmsKeyUsage, description: &str) -> Result<KmsKeyMetadata, Error>;

    fn describe_key(&self, key_id: &str) -> Result<KmsKeyMetadata, Error>;

    /// Returns the DER encoded SubjectPublicKeyInfo of the key.
    fn get_public_key(&self, key_id: &str) -> Result<Vec<u8>, Error>;

    /// Signs a digest, returning a DER encoded signature for ECDSA keys.
    fn sign(&self, key_id: &str, algorithm: KmsSigningAlgorithm, digest: &[u8]) -> Result<Vec<u8>, Error>;

    fn decrypt(&self, key_id: &str, algorithm: KmsEncryptionAlgorithm, ciphertext: &[u8]) -> Result<Vec<u8>, Error>;

    fn schedule_key_deletion(&self, key_id: &str, pending_window_days: u32) -> Result<(), Error>;
}

//------------ AwsKmsProvider ------------------------------------------------

pub struct AwsKmsProvider {
    client: Arc<dyn KmsClient>,
    region: String,
    account: String,
    closed: AtomicBool,
}

impl AwsKmsProvider {
    pub const MANUFACTURER: &'static str = "aws";
    pub const MODEL: &'static str = "kms";

    pub fn new(client: Arc<dyn KmsClient>, region: &str, account: &str) -> Self {
        AwsKmsProvider {
            client,
            region: region.to_string(),
            account: account.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns a loader that builds the provider from the `Region` and
    /// `Account` token attributes and a client made by `connect`.
    pub fn loader<F>(connect: F) -> Loader
    where
        F: Fn(&TokenConfig) -> Result<Arc<dyn KmsClient>, Error> + Send + Sync + 'static,
    {
        Arc::new(move |config: &TokenConfig| {
            let region = config
                .attribute(ATTR_REGION)
                .ok_or_else(|| Error::NotConfigured(format!("missing attribute {}", ATTR_REGION)))?;
            let account = config
                .attribute(ATTR_ACCOUNT)
                .ok_or_else(|| Error::NotConfigured(format!("missing attribute {}", ATTR_ACCOUNT)))?;
            let client = connect(config)?;
            info!("Using KMS in region {} for account {}", region, account);
            Ok(Arc::new(AwsKmsProvider::new(client, &region, &account)) as Arc<dyn Provider>)
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Asks KMS to delete a key after the pending window has passed.
    ///
    /// Windows shorter than KMS allows are extended to the minimum.
    pub fn schedule_deletion(&self, key_id: &str, pending_window_days: u32) -> Result<(), Error> {
        self.check_open()?;
        let days = pending_window_days.max(MIN_PENDING_WINDOW_DAYS);
        self.client
            .schedule_key_deletion(key_id, days)
            .map_err(|e| e.within("ScheduleKeyDeletion", None, Some(key_id)))?;
        info!("Scheduled deletion of KMS key {} in {} days", key_id, days);
        Ok(())
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn create(&self, label: &str, spec: KmsKeySpec, usage: KmsKeyUsage) -> Result<Arc<dyn PrivateKey>, Error> {
        self.check_open()?;
        let label = if label.is_empty() {
            let mut bytes = [0; KEY_LABEL_RANDOM_BYTES];
            rand::rng().fill_bytes(&mut bytes);
            format!("{}_{}", hex::encode(bytes), Utc::now().format("%Y%m%d%H%M%S"))
        } else {
            label.to_string()
        };

        let metadata = self
            .client
            .create_key(spec, usage, &label)
            .map_err(|e| e.within("CreateKey", None, None))?;
        debug!("Created KMS key {} ({}) '{}'", metadata.key_id, spec, label);
        Ok(Arc::new(self.key_for(metadata)?))
    }

    fn key_for(&self, metadata: KmsKeyMetadata) -> Result<KmsKey, Error> {
        let public = self
            .client
            .get_public_key(&metadata.key_id)
            .map_err(|e| e.within("GetPublicKey", None, Some(&metadata.key_id)))?;
        Ok(KmsKey {
            client: self.client.clone(),
            public: PublicKey::from_der(&public)?,
            key_id: metadata.key_id,
            label: metadata.description,
            usage: metadata.key_usage,
        })
    }
}

impl fmt::Debug for AwsKmsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsKmsProvider")
            .field("region", &self.region)
            .field("account", &self.account)
            .finish()
    }
}

impl Provider for AwsKmsProvider {
    fn manufacturer(&self) -> &str {
        Self::MANUFACTURER
    }

    fn model(&self) -> &str {
        Self::MODEL
    }

    fn generate_rsa_key(&self, label: &str, bits: u32, purpose: KeyPurpose) -> Result<Arc<dyn PrivateKey>, Error> {
        self.create(label, KmsKeySpec::rsa(bits)?, purpose.into())
    }

    fn generate_ecdsa_key(&self, label: &str, curve: Curve) -> Result<Arc<dyn PrivateKey>, Error> {
        self.create(label, KmsKeySpec::ecc(curve)?, KmsKeyUsage::SignVerify)
    }

    fn identify_key(&self, key: &dyn PrivateKey) -> Result<(String, String), Error> {
        self.check_open()?;
        let key = key.as_any().downcast_ref::<KmsKey>().ok_or(Error::UnsupportedKeyType)?;
        Ok((key.key_id.clone(), key.label.clone()))
    }

    fn export_key(&self, key_id: &str) -> Result<(String, Option<Vec<u8>>), Error> {
        self.check_open()?;
        let metadata = self
            .client
            .describe_key(key_id)
            .map_err(|e| e.within("DescribeKey", None, Some(key_id)))?;
        let uri = KeyUri::new(
            Self::MANUFACTURER,
            Self::MODEL,
            &self.region,
            &self.account,
            &metadata.key_id,
        );
        Ok((uri.to_string(), None))
    }

    fn get_key(&self, key_id: &str) -> Result<Arc<dyn PrivateKey>, Error> {
        self.check_open()?;
        let metadata = self
            .client
            .describe_key(key_id)
            .map_err(|e| e.within("DescribeKey", None, Some(key_id)))?;
        if !metadata.enabled {
            return Err(Error::KeyNotFound.within("DescribeKey", None, Some(key_id)));
        }
        Ok(Arc::new(self.key_for(metadata)?))
    }

    fn close(&self) -> Result<(), Error> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("KMS provider for region {} closed", self.region);
        }
        Ok(())
    }
}

//------------ KmsKey --------------------------------------------------------

pub struct KmsKey {
    client: Arc<dyn KmsClient>,
    key_id: String,
    label: String,
    public: PublicKey,
    usage: KmsKeyUsage,
}

impl KmsKey {
    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

impl fmt::Debug for KmsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmsKey")
            .field("key_id", &self.key_id)
            .field("label", &self.label)
            .field("usage", &self.usage)
            .finish()
    }
}

impl PrivateKey for KmsKey {
    fn public_key(&self) -> &PublicKey {
        &self.public
    }

    fn sign(&self, digest: &[u8], opts: &SignerOpts) -> Result<Vec<u8>, Error> {
        opts.hash.check_digest(digest)?;
        let algorithm = KmsSigningAlgorithm::for_key(&self.public, opts)?;
        self.client
            .sign(&self.key_id, algorithm, digest)
            .map_err(|e| e.within("Sign", None, Some(&self.key_id)))
    }

    fn decrypt(&self, ciphertext: &[u8], opts: &DecrypterOpts) -> Result<Vec<u8>, Error> {
        if self.usage != KmsKeyUsage::EncryptDecrypt {
            return Err(Error::UnsupportedKeyType);
        }
        let algorithm = KmsEncryptionAlgorithm::for_opts(opts)?;
        self.client
            .decrypt(&self.key_id, algorithm, ciphertext)
            .map_err(|e| e.within("Decrypt", None, Some(&self.key_id)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use openssl::{
        ec::{EcGroup, EcKey},
        md::Md,
        pkey::{PKey, Private},
        pkey_ctx::PkeyCtx,
        rsa::{Padding, Rsa},
        sign::RsaPssSaltlen,
    };

    use crate::crypto::keys::PssSaltLength;

    use super::*;

    struct FakeKey {
        pkey: PKey<Private>,
        metadata: KmsKeyMetadata,
        pending_days: Option<u32>,
    }

    /// A KMS that keeps openssl keys in a map.
    #[derive(Default)]
    struct FakeKms {
        keys: Mutex<HashMap<String, FakeKey>>,
    }

    impl FakeKms {
        fn with_key<T>(&self, key_id: &str, op: impl FnOnce(&FakeKey) -> Result<T, Error>) -> Result<T, Error> {
            let keys = self.keys.lock().unwrap();
            match keys.get(key_id) {
                Some(key) if key.pending_days.is_none() => op(key),
                _ => Err(Error::KeyNotFound),
            }
        }
    }

    impl KmsClient for FakeKms {
        fn create_key(&self, spec: KmsKeySpec, usage: KmsKeyUsage, description: &str) -> Result<KmsKeyMetadata, Error> {
            let pkey = match spec {
                KmsKeySpec::Rsa2048 => PKey::from_rsa(Rsa::generate(2048)?)?,
                KmsKeySpec::Rsa3072 => PKey::from_rsa(Rsa::generate(3072)?)?,
                KmsKeySpec::Rsa4096 => PKey::from_rsa(Rsa::generate(4096)?)?,
                KmsKeySpec::EccNistP256 => ec_key(Curve::P256)?,
                KmsKeySpec::EccNistP384 => ec_key(Curve::P384)?,
                KmsKeySpec::EccNistP521 => ec_key(Curve::P521)?,
            };
            let mut keys = self.keys.lock().unwrap();
            let key_id = format!("key-{}", keys.len() + 1);
            let metadata = KmsKeyMetadata {
                key_id: key_id.clone(),
                arn: format!("arn:aws:kms:eu-west-1:123456789012:key/{}", key_id),
                description: description.to_string(),
                key_spec: spec,
                key_usage: usage,
                enabled: true,
            };
            keys.insert(
                key_id,
                FakeKey {
                    pkey,
                    metadata: metadata.clone(),
                    pending_days: None,
                },
            );
            Ok(metadata)
        }

        fn describe_key(&self, key_id: &str) -> Result<KmsKeyMetadata, Error> {
            self.with_key(key_id, |key| Ok(key.metadata.clone()))
        }

        fn get_public_key(&self, key_id: &str) -> Result<Vec<u8>, Error> {
            self.with_key(key_id, |key| Ok(key.pkey.public_key_to_der()?))
        }

        fn sign(&self, key_id: &str, algorithm: KmsSigningAlgorithm, digest: &[u8]) -> Result<Vec<u8>, Error> {
            self.with_key(key_id, |key| {
                let mut ctx = PkeyCtx::new(&key.pkey)?;
                ctx.sign_init()?;
                match algorithm {
                    KmsSigningAlgorithm::RsaPkcs1(_) => ctx.set_rsa_padding(Padding::PKCS1)?,
                    KmsSigningAlgorithm::RsaPss(hash) => {
                        ctx.set_rsa_padding(Padding::PKCS1_PSS)?;
                        ctx.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
                        ctx.set_rsa_mgf1_md(hash.md())?;
                    }
                    KmsSigningAlgorithm::Ecdsa(_) => {}
                }
                ctx.set_signature_md(algorithm.hash().md())?;
                let mut signature = Vec::new();
                ctx.sign_to_vec(digest, &mut signature)?;
                Ok(signature)
            })
        }

        fn decrypt(&self, key_id: &str, algorithm: KmsEncryptionAlgorithm, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
            self.with_key(key_id, |key| {
                let md = match algorithm {
                    KmsEncryptionAlgorithm::OaepSha1 => Md::sha1(),
                    KmsEncryptionAlgorithm::OaepSha256 => Md::sha256(),
                };
                let mut ctx = PkeyCtx::new(&key.pkey)?;
                ctx.decrypt_init()?;
                ctx.set_rsa_padding(Padding::PKCS1_OAEP)?;
                ctx.set_rsa_oaep_md(md)?;
                ctx.set_rsa_mgf1_md(md)?;
                let mut plaintext = Vec::new();
                ctx.decrypt_to_vec(ciphertext, &mut plaintext)?;
                Ok(plaintext)
            })
        }

        fn schedule_key_deletion(&self, key_id: &str, pending_window_days: u32) -> Result<(), Error> {
            let mut keys = self.keys.lock().unwrap();
            let key = keys.get_mut(key_id).ok_or(Error::KeyNotFound)?;
            key.pending_days = Some(pending_window_days);
            Ok(())
        }
    }

    fn ec_key(curve: Curve) -> Result<PKey<Private>, Error> {
        let group = EcGroup::from_curve_name(curve.nid())?;
        Ok(PKey::from_ec_key(EcKey::generate(&group)?)?)
    }

    fn provider() -> (Arc<FakeKms>, AwsKmsProvider) {
        let kms = Arc::new(FakeKms::default());
        let provider = AwsKmsProvider::new(kms.clone(), "eu-west-1", "123456789012");
        (kms, provider)
    }

    #[test]
    fn key_specs() {
        assert_eq!(KmsKeySpec::rsa(3072).unwrap().as_str(), "RSA_3072");
        assert!(matches!(KmsKeySpec::rsa(1024), Err(Error::WeakRsaKey(1024))));
        assert!(KmsKeySpec::rsa(2050).is_err());
        assert_eq!(KmsKeySpec::ecc(Curve::P521).unwrap().as_str(), "ECC_NIST_P521");
        assert!(matches!(KmsKeySpec::ecc(Curve::P224), Err(Error::UnsupportedEllipticCurve)));
        assert_eq!(KmsKeyUsage::from(KeyPurpose::Encryption).as_str(), "ENCRYPT_DECRYPT");
    }

    #[test]
    fn signing_algorithms() {
        let rsa = PublicKey::rsa(&[0xc5; 256], &[1, 0, 1]).unwrap();
        let opts = SignerOpts::hash(HashAlg::Sha256);
        assert_eq!(
            KmsSigningAlgorithm::for_key(&rsa, &opts).unwrap().name(),
            "RSASSA_PKCS1_V1_5_SHA_256"
        );
        let opts = SignerOpts::pss(HashAlg::Sha384, PssSaltLength::EqualsHash);
        assert_eq!(KmsSigningAlgorithm::for_key(&rsa, &opts).unwrap().name(), "RSASSA_PSS_SHA_384");

        let opts = SignerOpts::pss(HashAlg::Sha384, PssSaltLength::Bytes(20));
        assert!(matches!(
            KmsSigningAlgorithm::for_key(&rsa, &opts),
            Err(Error::UnsupportedRsaOptions)
        ));
        assert!(KmsSigningAlgorithm::for_key(&rsa, &SignerOpts::hash(HashAlg::Sha1)).is_err());
    }

    #[test]
    fn generate_sign_and_verify() {
        let (_, provider) = provider();
        let digest = HashAlg::Sha256.digest(b"payload").unwrap();

        let ec = provider.generate_ecdsa_key("kms-ec", Curve::P256).unwrap();
        let opts = SignerOpts::hash(HashAlg::Sha256);
        let signature = ec.sign(&digest, &opts).unwrap();
        assert!(ec.public_key().verify(&digest, &signature, &opts).unwrap());

        let rsa = provider.generate_rsa_key("", 2048, KeyPurpose::Signing).unwrap();
        let opts = SignerOpts::pss(HashAlg::Sha256, PssSaltLength::EqualsHash);
        let signature = rsa.sign(&digest, &opts).unwrap();
        assert!(rsa.public_key().verify(&digest, &signature, &opts).unwrap());

        let (_, label) = provider.identify_key(rsa.as_ref()).unwrap();
        assert_eq!(label.len(), 2 * KEY_LABEL_RANDOM_BYTES + 1 + 14);
    }

    #[test]
    fn export_and_get_key() {
        let (_, provider) = provider();
        let key = provider.generate_ecdsa_key("exported", Curve::P384).unwrap();
        let (id, label) = provider.identify_key(key.as_ref()).unwrap();
        assert_eq!(label, "exported");

        let (uri, private) = provider.export_key(&id).unwrap();
        assert!(private.is_none());
        let uri = KeyUri::parse(&uri).unwrap();
        assert_eq!(uri.manufacturer(), "aws");
        assert_eq!(uri.model(), "kms");
        assert_eq!(uri.serial(), "eu-west-1");
        assert_eq!(uri.token(), "123456789012");
        assert_eq!(uri.id(), id);

        let loaded = provider.get_key(uri.id()).unwrap();
        assert_eq!(loaded.public_key(), key.public_key());
    }

    #[test]
    fn decrypt_with_encryption_key() {
        let (_, provider) = provider();
        let key = provider.generate_rsa_key("enc", 2048, KeyPurpose::Encryption).unwrap();
        let pkey = key.public_key().to_pkey().unwrap();
        let mut ctx = PkeyCtx::new(&pkey).unwrap();
        ctx.encrypt_init().unwrap();
        ctx.set_rsa_padding(Padding::PKCS1_OAEP).unwrap();
        ctx.set_rsa_oaep_md(Md::sha256()).unwrap();
        ctx.set_rsa_mgf1_md(Md::sha256()).unwrap();
        let mut ciphertext = Vec::new();
        ctx.encrypt_to_vec(b"secret", &mut ciphertext).unwrap();

        let opts = DecrypterOpts::Oaep {
            hash: HashAlg::Sha256,
            label: vec![],
        };
        assert_eq!(key.decrypt(&ciphertext, &opts).unwrap(), b"secret");
        assert!(matches!(
            key.decrypt(&ciphertext, &DecrypterOpts::Pkcs1v15),
            Err(Error::UnsupportedRsaOptions)
        ));

        let signing = provider.generate_ecdsa_key("sig", Curve::P256).unwrap();
        assert!(signing.decrypt(&ciphertext, &opts).is_err());
    }

    #[test]
    fn scheduled_deletion_hides_key() {
        let (kms, provider) = provider();
        let key = provider.generate_ecdsa_key("doomed", Curve::P256).unwrap();
        let (id, _) = provider.identify_key(key.as_ref()).unwrap();

        provider.schedule_deletion(&id, 1).unwrap();
        assert_eq!(kms.keys.lock().unwrap()[&id].pending_days, Some(MIN_PENDING_WINDOW_DAYS));

        let err = provider.get_key(&id).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.context().unwrap().op(), "DescribeKey");
    }

    #[test]
    fn closed_provider_refuses_work() {
        let (_, provider) = provider();
        provider.close().unwrap();
        provider.close().unwrap();
        assert!(matches!(
            provider.generate_ecdsa_key("", Curve::P256),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn loader_requires_region_and_account() {
        let loader = AwsKmsProvider::loader(|_| Ok(Arc::new(FakeKms::default()) as Arc<dyn KmsClient>));

        let config = TokenConfig::new("aws", "kms").with_attributes("Region=eu-west-1, Account=123456789012");
        let provider = loader(&config).unwrap();
        assert_eq!(provider.manufacturer(), "aws");

        let config = TokenConfig::new("aws", "kms").with_attributes("Region=eu-west-1");
        assert!(matches!(loader(&config), Err(Error::NotConfigured(_))));
    }
}
