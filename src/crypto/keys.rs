//! Key types shared by all providers.
use std::{any::Any, fmt, str::FromStr};

use log::debug;
use openssl::{
    bn::{BigNum, BigNumContext},
    dsa::Dsa,
    ec::{EcGroup, EcKey, EcPoint, PointConversionForm},
    hash::MessageDigest,
    md::{Md, MdRef},
    nid::Nid,
    pkey::{HasPublic, Id, PKey, PKeyRef, Public},
    pkey_ctx::PkeyCtx,
    rsa::{Padding, Rsa},
    sign::RsaPssSaltlen,
};

use crate::commons::error::Error;

//------------ KeyPurpose ----------------------------------------------------

/// What a generated RSA key may be used for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum KeyPurpose {
    Signing = 1,
    Encryption = 2,
}

impl TryFrom<u8> for KeyPurpose {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(KeyPurpose::Signing),
            2 => Ok(KeyPurpose::Encryption),
            _ => Err(Error::other(format!("unknown key purpose: {}", value))),
        }
    }
}

//------------ Curve ---------------------------------------------------------

/// The supported named elliptic curves.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Curve {
    P224,
    P256,
    P384,
    P521,
}

impl Curve {
    pub fn name(self) -> &'static str {
        match self {
            Curve::P224 => "P-224",
            Curve::P256 => "P-256",
            Curve::P384 => "P-384",
            Curve::P521 => "P-521",
        }
    }

    /// The size in bytes of a field element, and so of each of the
    /// coordinates of a point and of each half of a raw signature.
    pub fn field_bytes(self) -> usize {
        match self {
            Curve::P224 => 28,
            Curve::P256 => 32,
            Curve::P384 => 48,
            Curve::P521 => 66,
        }
    }

    pub fn nid(self) -> Nid {
        match self {
            Curve::P224 => Nid::SECP224R1,
            Curve::P256 => Nid::X9_62_PRIME256V1,
            Curve::P384 => Nid::SECP384R1,
            Curve::P521 => Nid::SECP521R1,
        }
    }

    pub fn from_nid(nid: Nid) -> Result<Self, Error> {
        match nid {
            Nid::SECP224R1 => Ok(Curve::P224),
            Nid::X9_62_PRIME256V1 => Ok(Curve::P256),
            Nid::SECP384R1 => Ok(Curve::P384),
            Nid::SECP521R1 => Ok(Curve::P521),
            _ => Err(Error::UnsupportedEllipticCurve),
        }
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Curve {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p-224" | "p224" | "secp224r1" => Ok(Curve::P224),
            "p-256" | "p256" | "secp256r1" | "prime256v1" => Ok(Curve::P256),
            "p-384" | "p384" | "secp384r1" => Ok(Curve::P384),
            "p-521" | "p521" | "secp521r1" => Ok(Curve::P521),
            _ => Err(Error::UnsupportedEllipticCurve),
        }
    }
}

//------------ HashAlg -------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HashAlg {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    /// The length in bytes of a digest.
    pub fn size(self) -> usize {
        match self {
            HashAlg::Md5 => 16,
            HashAlg::Sha1 => 20,
            HashAlg::Sha224 => 28,
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
            HashAlg::Sha512 => 64,
        }
    }

    pub fn message_digest(self) -> MessageDigest {
        match self {
            HashAlg::Md5 => MessageDigest::md5(),
            HashAlg::Sha1 => MessageDigest::sha1(),
            HashAlg::Sha224 => MessageDigest::sha224(),
            HashAlg::Sha256 => MessageDigest::sha256(),
            HashAlg::Sha384 => MessageDigest::sha384(),
            HashAlg::Sha512 => MessageDigest::sha512(),
        }
    }

    pub fn md(self) -> &'static MdRef {
        match self {
            HashAlg::Md5 => Md::md5(),
            HashAlg::Sha1 => Md::sha1(),
            HashAlg::Sha224 => Md::sha224(),
            HashAlg::Sha256 => Md::sha256(),
            HashAlg::Sha384 => Md::sha384(),
            HashAlg::Sha512 => Md::sha512(),
        }
    }

    /// Hashes `data` with this algorithm.
    pub fn digest(self, data: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(openssl::hash::hash(self.message_digest(), data)?.to_vec())
    }

    pub(crate) fn check_digest(self, digest: &[u8]) -> Result<(), Error> {
        if digest.len() != self.size() {
            return Err(Error::other(format!(
                "digest length {} does not match {:?} ({} bytes)",
                digest.len(),
                self,
                self.size()
            )));
        }
        Ok(())
    }
}

//------------ SignerOpts ----------------------------------------------------

/// The salt length of an RSA-PSS signature.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PssSaltLength {
    /// As long as possible when signing, detected when verifying.
    Auto,

    /// As long as the digest.
    EqualsHash,

    Bytes(usize),
}

impl PssSaltLength {
    /// The salt length in bytes for the given hash.
    pub fn resolve(self, hash: HashAlg) -> Result<usize, Error> {
        match self {
            PssSaltLength::Auto => Err(Error::UnsupportedRsaOptions),
            PssSaltLength::EqualsHash => Ok(hash.size()),
            PssSaltLength::Bytes(len) => Ok(len),
        }
    }
}

/// How to sign a digest.
///
/// RSA keys sign with PKCS#1 v1.5 unless `pss` is set. ECDSA and DSA keys
/// only use the hash to check the length of the digest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SignerOpts {
    pub hash: HashAlg,
    pub pss: Option<PssSaltLength>,
}

impl SignerOpts {
    pub fn hash(hash: HashAlg) -> Self {
        SignerOpts { hash, pss: None }
    }

    pub fn pss(hash: HashAlg, salt: PssSaltLength) -> Self {
        SignerOpts { hash, pss: Some(salt) }
    }
}

/// How to decrypt an RSA ciphertext.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DecrypterOpts {
    Pkcs1v15,
    Oaep { hash: HashAlg, label: Vec<u8> },
}

//------------ PublicKey -----------------------------------------------------

/// The public value of a key pair, as exported from a backend.
#[derive(Clone, Eq, PartialEq)]
pub enum PublicKey {
    Rsa {
        modulus: Vec<u8>,
        exponent: Vec<u8>,
    },
    /// The point is kept in uncompressed form.
    Ecdsa {
        curve: Curve,
        point: Vec<u8>,
    },
    Dsa {
        p: Vec<u8>,
        q: Vec<u8>,
        g: Vec<u8>,
        y: Vec<u8>,
    },
}

impl PublicKey {
    /// Creates an RSA public key from big-endian modulus and exponent.
    ///
    /// The exponent must fit in 32 bits.
    pub fn rsa(modulus: &[u8], exponent: &[u8]) -> Result<Self, Error> {
        let modulus = strip_leading_zeros(modulus);
        let exponent = strip_leading_zeros(exponent);
        if modulus.is_empty() || exponent.is_empty() || exponent.len() > 4 {
            return Err(Error::MalformedRsaKey);
        }
        Ok(PublicKey::Rsa {
            modulus: modulus.to_vec(),
            exponent: exponent.to_vec(),
        })
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            PublicKey::Rsa { .. } => "RSA",
            PublicKey::Ecdsa { .. } => "ECDSA",
            PublicKey::Dsa { .. } => "DSA",
        }
    }

    /// The size of the key in bits.
    pub fn bits(&self) -> usize {
        match self {
            PublicKey::Rsa { modulus, .. } => bit_len(modulus),
            PublicKey::Ecdsa { curve, .. } => match curve {
                Curve::P224 => 224,
                Curve::P256 => 256,
                Curve::P384 => 384,
                Curve::P521 => 521,
            },
            PublicKey::Dsa { p, .. } => bit_len(p),
        }
    }

    pub fn to_pkey(&self) -> Result<PKey<Public>, Error> {
        let pkey = match self {
            PublicKey::Rsa { modulus, exponent } => {
                let rsa = Rsa::from_public_components(BigNum::from_slice(modulus)?, BigNum::from_slice(exponent)?)
                    .map_err(|_| Error::MalformedRsaKey)?;
                PKey::from_rsa(rsa)?
            }
            PublicKey::Ecdsa { curve, point } => {
                let group = EcGroup::from_curve_name(curve.nid())?;
                let mut ctx = BigNumContext::new()?;
                let point = EcPoint::from_bytes(&group, point, &mut ctx).map_err(|_| Error::MalformedPoint)?;
                PKey::from_ec_key(EcKey::from_public_key(&group, &point)?)?
            }
            PublicKey::Dsa { p, q, g, y } => {
                let dsa = Dsa::from_public_components(
                    BigNum::from_slice(p)?,
                    BigNum::from_slice(q)?,
                    BigNum::from_slice(g)?,
                    BigNum::from_slice(y)?,
                )?;
                PKey::from_dsa(dsa)?
            }
        };
        Ok(pkey)
    }

    /// Reads the public value of an openssl key.
    pub fn from_pkey<T: HasPublic>(pkey: &PKeyRef<T>) -> Result<Self, Error> {
        match pkey.id() {
            Id::RSA => {
                let rsa = pkey.rsa()?;
                PublicKey::rsa(&rsa.n().to_vec(), &rsa.e().to_vec())
            }
            Id::EC => {
                let ec = pkey.ec_key()?;
                let curve = ec
                    .group()
                    .curve_name()
                    .ok_or(Error::UnsupportedEllipticCurve)
                    .and_then(Curve::from_nid)?;
                let mut ctx = BigNumContext::new()?;
                let point = ec
                    .public_key()
                    .to_bytes(ec.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)?;
                Ok(PublicKey::Ecdsa { curve, point })
            }
            Id::DSA => {
                let dsa = pkey.dsa()?;
                Ok(PublicKey::Dsa {
                    p: dsa.p().to_vec(),
                    q: dsa.q().to_vec(),
                    g: dsa.g().to_vec(),
                    y: dsa.pub_key().to_vec(),
                })
            }
            _ => Err(Error::UnsupportedKeyType),
        }
    }

    /// Parses a DER encoded SubjectPublicKeyInfo.
    pub fn from_der(der: &[u8]) -> Result<Self, Error> {
        let pkey = PKey::public_key_from_der(der).map_err(|_| Error::MalformedDer)?;
        Self::from_pkey(&pkey)
    }

    /// Encodes the key as a DER SubjectPublicKeyInfo.
    pub fn to_der(&self) -> Result<Vec<u8>, Error> {
        Ok(self.to_pkey()?.public_key_to_der()?)
    }

    /// Encodes the key as a PEM "PUBLIC KEY" block.
    pub fn to_pem(&self) -> Result<String, Error> {
        let pem = self.to_pkey()?.public_key_to_pem()?;
        String::from_utf8(pem).map_err(|e| Error::other(format!("PEM is not UTF-8: {}", e)))
    }

    /// Checks a signature made with [`PrivateKey::sign`].
    ///
    /// ECDSA and DSA signatures are expected in DER form.
    pub fn verify(&self, digest: &[u8], signature: &[u8], opts: &SignerOpts) -> Result<bool, Error> {
        opts.hash.check_digest(digest)?;
        let pkey = self.to_pkey()?;
        let mut ctx = PkeyCtx::new(&pkey)?;
        ctx.verify_init()?;
        if let PublicKey::Rsa { .. } = self {
            match opts.pss {
                None => ctx.set_rsa_padding(Padding::PKCS1)?,
                Some(salt) => {
                    ctx.set_rsa_padding(Padding::PKCS1_PSS)?;
                    let salt = match salt {
                        PssSaltLength::Auto => RsaPssSaltlen::MAXIMUM_LENGTH,
                        PssSaltLength::EqualsHash => RsaPssSaltlen::DIGEST_LENGTH,
                        PssSaltLength::Bytes(len) => RsaPssSaltlen::custom(len as i32),
                    };
                    ctx.set_rsa_pss_saltlen(salt)?;
                    ctx.set_rsa_mgf1_md(opts.hash.md())?;
                }
            }
        }
        ctx.set_signature_md(opts.hash.md())?;
        // openssl reports some bad signatures as an error rather than false
        match ctx.verify(digest, signature) {
            Ok(valid) => Ok(valid),
            Err(err) => {
                debug!("{:?} signature rejected: {}", self, err);
                Ok(false)
            }
        }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PublicKey::Rsa { .. } => write!(f, "RSA-{}", self.bits()),
            PublicKey::Ecdsa { curve, .. } => write!(f, "ECDSA-{}", curve),
            PublicKey::Dsa { .. } => write!(f, "DSA-{}", self.bits()),
        }
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn bit_len(bytes: &[u8]) -> usize {
    let bytes = strip_leading_zeros(bytes);
    match bytes.first() {
        Some(first) => bytes.len() * 8 - first.leading_zeros() as usize,
        None => 0,
    }
}

//------------ PrivateKey ----------------------------------------------------

/// A handle to a private key held by some provider.
///
/// The handle never carries private key material for keys held by a
/// module. Signatures made with ECDSA and DSA keys are DER encoded
/// `SEQUENCE { r, s }` values.
pub trait PrivateKey: fmt::Debug + Send + Sync {
    fn public_key(&self) -> &PublicKey;

    /// Signs an already computed digest.
    fn sign(&self, digest: &[u8], opts: &SignerOpts) -> Result<Vec<u8>, Error>;

    /// Decrypts with an RSA key generated for encryption.
    fn decrypt(&self, _ciphertext: &[u8], _opts: &DecrypterOpts) -> Result<Vec<u8>, Error> {
        Err(Error::UnsupportedKeyType)
    }

    /// Allows a provider to recognise its own keys.
    fn as_any(&self) -> &dyn Any;
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsa_public_key_rejects_bad_components() {
        assert!(matches!(PublicKey::rsa(&[], &[1, 0, 1]), Err(Error::MalformedRsaKey)));
        assert!(matches!(
            PublicKey::rsa(&[0xc5; 256], &[1, 2, 3, 4, 5]),
            Err(Error::MalformedRsaKey)
        ));

        // leading zeros do not count
        let key = PublicKey::rsa(&[0, 0, 0xc5, 1], &[0, 0, 0, 0, 1, 0, 1]).unwrap();
        assert_eq!(key.bits(), 16);
    }

    #[test]
    fn public_key_from_openssl_and_back() {
        let rsa = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let key = PublicKey::from_pkey(&rsa).unwrap();
        assert_eq!(key.bits(), 2048);
        assert_eq!(key.to_der().unwrap(), rsa.public_key_to_der().unwrap());
        assert!(key.to_pem().unwrap().starts_with("-----BEGIN PUBLIC KEY-----"));

        let group = EcGroup::from_curve_name(Curve::P384.nid()).unwrap();
        let ec = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
        let key = PublicKey::from_der(&ec.public_key_to_der().unwrap()).unwrap();
        match &key {
            PublicKey::Ecdsa { curve, point } => {
                assert_eq!(*curve, Curve::P384);
                assert_eq!(point.len(), 1 + 2 * 48);
            }
            other => panic!("unexpected key {:?}", other),
        }
    }

    #[test]
    fn verify_only_accepts_own_digest() {
        let group = EcGroup::from_curve_name(Curve::P256.nid()).unwrap();
        let ec = EcKey::generate(&group).unwrap();
        let opts = SignerOpts::hash(HashAlg::Sha256);
        let digest = opts.hash.digest(b"own message").unwrap();
        let other = opts.hash.digest(b"other message").unwrap();
        let signature = openssl::ecdsa::EcdsaSig::sign(&digest, &ec).unwrap().to_der().unwrap();

        let key = PublicKey::from_pkey(&PKey::from_ec_key(ec).unwrap()).unwrap();
        assert!(key.verify(&digest, &signature, &opts).unwrap());
        assert!(!key.verify(&other, &signature, &opts).unwrap());
        assert!(!key.verify(&digest, b"not a signature", &opts).unwrap());
        assert!(key.verify(&digest[..20], &signature, &opts).is_err());
    }

    #[test]
    fn parse_curve_names() {
        assert_eq!(Curve::from_str("P-256").unwrap(), Curve::P256);
        assert_eq!(Curve::from_str("secp384r1").unwrap(), Curve::P384);
        assert!(matches!(Curve::from_str("P-192"), Err(Error::UnsupportedEllipticCurve)));
    }

    #[test]
    fn key_purpose_values() {
        assert_eq!(KeyPurpose::try_from(1).unwrap(), KeyPurpose::Signing);
        assert_eq!(KeyPurpose::try_from(2).unwrap(), KeyPurpose::Encryption);
        assert!(KeyPurpose::try_from(3).is_err());
    }

    #[test]
    fn pss_auto_salt_is_unsupported() {
        assert!(matches!(
            PssSaltLength::Auto.resolve(HashAlg::Sha256),
            Err(Error::UnsupportedRsaOptions)
        ));
        assert_eq!(PssSaltLength::EqualsHash.resolve(HashAlg::Sha384).unwrap(), 48);
    }
}
