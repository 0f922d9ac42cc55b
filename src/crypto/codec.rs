//! Encodings needed to drive a PKCS#11 module.
//!
//! PKCS#11 hands out EC points wrapped in a DER OCTET STRING, identifies
//! curves by their DER encoded OID, and returns ECDSA and DSA signatures
//! as the raw concatenation of R and S. RSA signing with `CKM_RSA_PKCS`
//! pads but does not wrap the digest, so the DigestInfo prefix has to be
//! added here.

use openssl::{bn::BigNum, ecdsa::EcdsaSig};

use crate::commons::error::Error;
use crate::crypto::keys::{Curve, HashAlg, PssSaltLength};

//------------ Curves --------------------------------------------------------

const OID_P224: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x21];
const OID_P256: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
const OID_P384: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22];
const OID_P521: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x23];

const CURVES: &[(Curve, &[u8])] = &[
    (Curve::P224, OID_P224),
    (Curve::P256, OID_P256),
    (Curve::P384, OID_P384),
    (Curve::P521, OID_P521),
];

/// The DER encoded OID of a curve, as used for `CKA_EC_PARAMS`.
pub fn curve_oid_der(curve: Curve) -> &'static [u8] {
    match curve {
        Curve::P224 => OID_P224,
        Curve::P256 => OID_P256,
        Curve::P384 => OID_P384,
        Curve::P521 => OID_P521,
    }
}

/// Looks up the curve for a `CKA_EC_PARAMS` value.
pub fn curve_from_oid_der(params: &[u8]) -> Result<Curve, Error> {
    CURVES
        .iter()
        .find(|(_, oid)| *oid == params)
        .map(|(curve, _)| *curve)
        .ok_or(Error::UnsupportedEllipticCurve)
}

//------------ EC points -----------------------------------------------------

const TAG_OCTET_STRING: u8 = 0x04;

/// Reads the tag and length of a DER value at the start of `der`.
///
/// Only the short form and the one byte long form are accepted, which
/// covers every value up to 255 content bytes. Returns the content.
fn read_tlv(der: &[u8], tag: u8) -> Result<(&[u8], &[u8]), Error> {
    if der.len() < 2 || der[0] != tag {
        return Err(Error::MalformedDer);
    }
    let (len, header) = match der[1] {
        len @ 0..=0x7f => (len as usize, 2),
        0x81 => {
            let len = *der.get(2).ok_or(Error::MalformedDer)? as usize;
            if len < 0x80 {
                // should have used the short form
                return Err(Error::MalformedDer);
            }
            (len, 3)
        }
        _ => return Err(Error::MalformedDer),
    };
    let rest = &der[header..];
    if len > rest.len() {
        return Err(Error::MalformedDer);
    }
    Ok(rest.split_at(len))
}

/// Appends a DER length in its minimal form.
fn push_len(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
}

/// Extracts the uncompressed point from a `CKA_EC_POINT` value.
pub fn parse_ec_point(der: &[u8], curve: Curve) -> Result<Vec<u8>, Error> {
    let (point, rest) = read_tlv(der, TAG_OCTET_STRING)?;
    if !rest.is_empty() {
        return Err(Error::MalformedDer);
    }
    if point.len() != 1 + 2 * curve.field_bytes() || point[0] != 0x04 {
        return Err(Error::MalformedPoint);
    }
    Ok(point.to_vec())
}

/// Wraps an uncompressed point as a `CKA_EC_POINT` value.
pub fn encode_ec_point(point: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(point.len() + 3);
    res.push(TAG_OCTET_STRING);
    push_len(&mut res, point.len());
    res.extend_from_slice(point);
    res
}

//------------ Signatures ----------------------------------------------------

/// Re-encodes a raw R‖S signature as DER `SEQUENCE { r, s }`.
///
/// DSA and ECDSA signatures share this encoding.
pub fn raw_signature_to_der(raw: &[u8]) -> Result<Vec<u8>, Error> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(Error::MalformedSignature);
    }
    let (r, s) = raw.split_at(raw.len() / 2);
    let sig = EcdsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?;
    Ok(sig.to_der()?)
}

/// Converts a DER `SEQUENCE { r, s }` into R‖S with each half left
/// padded to `width` bytes.
pub fn der_signature_to_raw(der: &[u8], width: usize) -> Result<Vec<u8>, Error> {
    let sig = EcdsaSig::from_der(der).map_err(|_| Error::MalformedSignature)?;
    if sig.to_der().map_err(|_| Error::MalformedSignature)?.as_slice() != der {
        return Err(Error::MalformedSignature);
    }
    let width = i32::try_from(width).map_err(|_| Error::MalformedSignature)?;
    let mut raw = sig.r().to_vec_padded(width).map_err(|_| Error::MalformedSignature)?;
    raw.extend(sig.s().to_vec_padded(width).map_err(|_| Error::MalformedSignature)?);
    Ok(raw)
}

//------------ RSA -----------------------------------------------------------

/// The mask generation functions of PKCS#11 (`CKG_MGF1_*`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mgf {
    Mgf1Sha1,
    Mgf1Sha224,
    Mgf1Sha256,
    Mgf1Sha384,
    Mgf1Sha512,
}

impl Mgf {
    pub fn for_hash(hash: HashAlg) -> Result<Self, Error> {
        match hash {
            HashAlg::Sha1 => Ok(Mgf::Mgf1Sha1),
            HashAlg::Sha224 => Ok(Mgf::Mgf1Sha224),
            HashAlg::Sha256 => Ok(Mgf::Mgf1Sha256),
            HashAlg::Sha384 => Ok(Mgf::Mgf1Sha384),
            HashAlg::Sha512 => Ok(Mgf::Mgf1Sha512),
            HashAlg::Md5 => Err(Error::UnrecognizedRsaOptions),
        }
    }

    /// The `CKG_MGF1_*` value.
    pub fn id(self) -> u64 {
        match self {
            Mgf::Mgf1Sha1 => 0x1,
            Mgf::Mgf1Sha256 => 0x2,
            Mgf::Mgf1Sha384 => 0x3,
            Mgf::Mgf1Sha512 => 0x4,
            Mgf::Mgf1Sha224 => 0x5,
        }
    }

    /// The hash used inside MGF1.
    pub fn hash(self) -> HashAlg {
        match self {
            Mgf::Mgf1Sha1 => HashAlg::Sha1,
            Mgf::Mgf1Sha224 => HashAlg::Sha224,
            Mgf::Mgf1Sha256 => HashAlg::Sha256,
            Mgf::Mgf1Sha384 => HashAlg::Sha384,
            Mgf::Mgf1Sha512 => HashAlg::Sha512,
        }
    }
}

/// The `CKM_*` value of the digest mechanism for a hash.
pub fn hash_mechanism(hash: HashAlg) -> u64 {
    match hash {
        HashAlg::Md5 => 0x210,
        HashAlg::Sha1 => 0x220,
        HashAlg::Sha224 => 0x255,
        HashAlg::Sha256 => 0x250,
        HashAlg::Sha384 => 0x260,
        HashAlg::Sha512 => 0x270,
    }
}

const CKZ_DATA_SPECIFIED: u64 = 0x1;

fn push_ulong(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&(value as std::ffi::c_ulong).to_ne_bytes());
}

/// Parameters for `CKM_RSA_PKCS_PSS`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PssParams {
    pub hash: HashAlg,
    pub mgf: Mgf,
    pub salt_len: usize,
}

impl PssParams {
    pub fn new(hash: HashAlg, salt: PssSaltLength) -> Result<Self, Error> {
        let mgf = Mgf::for_hash(hash)?;
        let salt_len = salt.resolve(hash)?;
        Ok(PssParams { hash, mgf, salt_len })
    }

    /// The `CK_RSA_PKCS_PSS_PARAMS` layout: hash mechanism, MGF and salt
    /// length as native `CK_ULONG`s.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_ulong(&mut out, hash_mechanism(self.hash));
        push_ulong(&mut out, self.mgf.id());
        push_ulong(&mut out, self.salt_len as u64);
        out
    }
}

/// Parameters for `CKM_RSA_PKCS_OAEP`.
///
/// An empty source is passed as "no source data".
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OaepParams {
    pub hash: HashAlg,
    pub mgf: Mgf,
    pub source: Vec<u8>,
}

impl OaepParams {
    pub fn new(hash: HashAlg, label: &[u8]) -> Result<Self, Error> {
        let mgf = Mgf::for_hash(hash)?;
        Ok(OaepParams {
            hash,
            mgf,
            source: label.to_vec(),
        })
    }

    /// The scalar fields of `CK_RSA_PKCS_OAEP_PARAMS`: hash mechanism, MGF,
    /// source type and source length as native `CK_ULONG`s. The binding
    /// supplies the pointer to the source data in between the last two.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_ulong(&mut out, hash_mechanism(self.hash));
        push_ulong(&mut out, self.mgf.id());
        push_ulong(&mut out, if self.source.is_empty() { 0 } else { CKZ_DATA_SPECIFIED });
        push_ulong(&mut out, self.source.len() as u64);
        out
    }
}

const PREFIX_MD5: &[u8] = &[
    0x30, 0x20, 0x30, 0x0c, 0x06, 0x08, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x02, 0x05, 0x05, 0x00, 0x04, 0x10,
];
const PREFIX_SHA1: &[u8] = &[
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];
const PREFIX_SHA224: &[u8] = &[
    0x30, 0x2d, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x04, 0x05, 0x00, 0x04, 0x1c,
];
const PREFIX_SHA256: &[u8] = &[
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05, 0x00, 0x04, 0x20,
];
const PREFIX_SHA384: &[u8] = &[
    0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02, 0x05, 0x00, 0x04, 0x30,
];
const PREFIX_SHA512: &[u8] = &[
    0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03, 0x05, 0x00, 0x04, 0x40,
];

/// The DER prefix of a PKCS#1 v1.5 DigestInfo for the given hash.
pub fn digest_info_prefix(hash: HashAlg) -> &'static [u8] {
    match hash {
        HashAlg::Md5 => PREFIX_MD5,
        HashAlg::Sha1 => PREFIX_SHA1,
        HashAlg::Sha224 => PREFIX_SHA224,
        HashAlg::Sha256 => PREFIX_SHA256,
        HashAlg::Sha384 => PREFIX_SHA384,
        HashAlg::Sha512 => PREFIX_SHA512,
    }
}

/// Builds the DigestInfo that `CKM_RSA_PKCS` expects as sign input.
pub fn digest_info(hash: HashAlg, digest: &[u8]) -> Result<Vec<u8>, Error> {
    hash.check_digest(digest)?;
    let prefix = digest_info_prefix(hash);
    let mut res = Vec::with_capacity(prefix.len() + digest.len());
    res.extend_from_slice(prefix);
    res.extend_from_slice(digest);
    Ok(res)
}

//------------ Tests ---------------------------------------------------------
