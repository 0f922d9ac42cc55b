//! Key references and token locators in `pkcs11:` URI form.
//!
//! A key reference identifies a key, it never contains key material:
//!
//! ```text
//! pkcs11:manufacturer=SoftHSM;model=v2;serial=1234;token=signer;id=42;type=private
//! ```
use std::{collections::HashMap, fmt, str::FromStr};

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use secrecy::SecretString;
use url::Url;

use crate::commons::error::Error;
use crate::constants::PKCS11_URI_SCHEME;

/// Characters escaped in attribute values.
const VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'/')
    .add(b';')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// The key type of a private key reference.
pub const KEY_TYPE_PRIVATE: &str = "private";

//------------ Attributes ----------------------------------------------------

/// The decoded attributes of a `pkcs11:` URI.
///
/// Path attributes are `;` separated, query attributes `&` separated.
/// Unknown attributes are kept but otherwise ignored.
struct Attributes(HashMap<String, String>);

impl Attributes {
    fn parse(s: &str) -> Result<Self, Error> {
        let url = Url::parse(s).map_err(|e| Error::invalid_uri(format!("'{}': {}", s, e)))?;
        if url.scheme() != PKCS11_URI_SCHEME {
            return Err(Error::invalid_uri(format!(
                "expected scheme '{}' in '{}'",
                PKCS11_URI_SCHEME, s
            )));
        }
        if !url.cannot_be_a_base() {
            return Err(Error::invalid_uri(format!("unexpected authority in '{}'", s)));
        }

        let mut attrs = HashMap::new();
        let segments = url
            .path()
            .split(';')
            .chain(url.query().into_iter().flat_map(|q| q.split('&')));
        for segment in segments.filter(|segment| !segment.is_empty()) {
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| Error::invalid_uri(format!("attribute without value: '{}'", segment)))?;
            let value = percent_decode_str(value)
                .decode_utf8()
                .map_err(|e| Error::invalid_uri(format!("attribute '{}': {}", key, e)))?;
            attrs.insert(key.to_ascii_lowercase(), value.into_owned());
        }
        Ok(Attributes(attrs))
    }

    fn take(&mut self, key: &str) -> String {
        self.0.remove(key).unwrap_or_default()
    }

    fn take_opt(&mut self, key: &str) -> Option<String> {
        self.0.remove(key).filter(|value| !value.is_empty())
    }
}

fn encode(value: &str) -> impl fmt::Display + '_ {
    utf8_percent_encode(value, VALUE)
}

//------------ KeyUri --------------------------------------------------------

/// A reference to a private key held by some provider.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct KeyUri {
    manufacturer: String,
    model: String,
    serial: String,
    token: String,
    id: String,
    key_type: String,
}

impl KeyUri {
    /// Creates a reference to a private key.
    pub fn new(manufacturer: &str, model: &str, serial: &str, token: &str, id: &str) -> Self {
        KeyUri {
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            serial: serial.to_string(),
            token: token.to_string(),
            id: id.to_string(),
            key_type: KEY_TYPE_PRIVATE.to_string(),
        }
    }

    /// Parses a private key reference.
    ///
    /// Fails with `InvalidUri` if this is not a `pkcs11:` URI at all, and
    /// with `InvalidPrivateKeyUri` if it does not name a private key by
    /// token serial and key id.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let mut attrs = Attributes::parse(s)?;
        let uri = KeyUri {
            manufacturer: attrs.take("manufacturer"),
            model: attrs.take("model"),
            serial: attrs.take("serial"),
            token: attrs.take("token"),
            id: attrs.take("id"),
            key_type: attrs.take("type"),
        };

        if uri.key_type != KEY_TYPE_PRIVATE {
            return Err(Error::invalid_private_key_uri(format!("expected type=private in '{}'", s)));
        }
        if uri.serial.is_empty() {
            return Err(Error::invalid_private_key_uri(format!("missing serial in '{}'", s)));
        }
        if uri.id.is_empty() {
            return Err(Error::invalid_private_key_uri(format!("missing id in '{}'", s)));
        }
        Ok(uri)
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key_type(&self) -> &str {
        &self.key_type
    }
}

impl FromStr for KeyUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyUri::parse(s)
    }
}

impl fmt::Display for KeyUri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:manufacturer={};model={};serial={};token={};id={};type={}",
            PKCS11_URI_SCHEME,
            encode(&self.manufacturer),
            encode(&self.model),
            encode(&self.serial),
            encode(&self.token),
            encode(&self.id),
            encode(&self.key_type),
        )
    }
}

//------------ TokenUri ------------------------------------------------------

/// A locator for a token, optionally carrying the module path and PIN.
///
/// ```text
/// pkcs11:manufacturer=SoftHSM;model=v2;token=signer?module-path=/usr/lib/softhsm/libsofthsm2.so&pin-value=1234
/// ```
#[derive(Clone, Debug)]
pub struct TokenUri {
    manufacturer: String,
    model: String,
    serial: String,
    token: String,
    module_path: Option<String>,
    pin: Option<SecretString>,
}

impl TokenUri {
    pub fn parse(s: &str) -> Result<Self, Error> {
        let mut attrs = Attributes::parse(s)?;
        Ok(TokenUri {
            manufacturer: attrs.take("manufacturer"),
            model: attrs.take("model"),
            serial: attrs.take("serial"),
            token: attrs.take("token"),
            module_path: attrs.take_opt("module-path"),
            pin: attrs.take_opt("pin-value").map(SecretString::new),
        })
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn module_path(&self) -> Option<&str> {
        self.module_path.as_deref()
    }

    pub fn pin(&self) -> Option<&SecretString> {
        self.pin.as_ref()
    }
}

impl FromStr for TokenUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TokenUri::parse(s)
    }
}

/// The PIN is never written out.
impl fmt::Display for TokenUri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:manufacturer={};model={};serial={};token={}",
            PKCS11_URI_SCHEME,
            encode(&self.manufacturer),
            encode(&self.model),
            encode(&self.serial),
            encode(&self.token),
        )?;
        if let Some(path) = &self.module_path {
            write!(f, "?module-path={}", encode(path))?;
        }
        Ok(())
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn parse_private_key_reference() {
        let uri = KeyUri::parse("pkcs11:manufacturer=X;model=Y;serial=S;token=T;id=42;type=private").unwrap();
        assert_eq!(uri.id(), "42");
        assert_eq!(uri.manufacturer(), "X");
        assert_eq!(uri.model(), "Y");
        assert_eq!(uri.serial(), "S");
        assert_eq!(uri.token(), "T");
        assert_eq!(uri.key_type(), "private");
    }

    #[test]
    fn format_parse_round_trip() {
        let uri = KeyUri::new("SoftHSM project", "SoftHSM v2", "6c1f8f4ad83a", "signer;1", "a1b2=c3");
        let text = uri.to_string();
        assert_eq!(
            text,
            "pkcs11:manufacturer=SoftHSM%20project;model=SoftHSM%20v2;serial=6c1f8f4ad83a;\
             token=signer%3B1;id=a1b2%3Dc3;type=private"
        );
        let parsed = KeyUri::parse(&text).unwrap();
        assert_eq!(parsed, uri);
        assert_eq!(parsed.to_string(), text);
    }

    #[test]
    fn reject_invalid_uris() {
        assert!(matches!(KeyUri::parse("not a uri"), Err(Error::InvalidUri(_))));
        assert!(matches!(
            KeyUri::parse("https://example.com/key?id=1"),
            Err(Error::InvalidUri(_))
        ));
        assert!(matches!(KeyUri::parse("pkcs11:serial"), Err(Error::InvalidUri(_))));
    }

    #[test]
    fn reject_incomplete_private_key_references() {
        assert!(matches!(
            KeyUri::parse("pkcs11:manufacturer=X;serial=S;id=42;type=public"),
            Err(Error::InvalidPrivateKeyUri(_))
        ));
        assert!(matches!(
            KeyUri::parse("pkcs11:manufacturer=X;serial=S;id=42"),
            Err(Error::InvalidPrivateKeyUri(_))
        ));
        assert!(matches!(
            KeyUri::parse("pkcs11:manufacturer=X;id=42;type=private"),
            Err(Error::InvalidPrivateKeyUri(_))
        ));
        assert!(matches!(
            KeyUri::parse("pkcs11:manufacturer=X;serial=S;id=;type=private"),
            Err(Error::InvalidPrivateKeyUri(_))
        ));
    }

    #[test]
    fn parse_token_locator() {
        let uri = TokenUri::parse(
            "pkcs11:manufacturer=SoftHSM;model=v2;token=signer?module-path=%2Fusr%2Flib%2Fsofthsm2.so&pin-value=1234",
        )
        .unwrap();
        assert_eq!(uri.manufacturer(), "SoftHSM");
        assert_eq!(uri.token(), "signer");
        assert_eq!(uri.serial(), "");
        assert_eq!(uri.module_path(), Some("/usr/lib/softhsm2.so"));
        assert_eq!(uri.pin().unwrap().expose_secret(), "1234");

        let text = uri.to_string();
        assert!(!text.contains("1234"));
        assert!(text.contains("module-path=%2Fusr%2Flib%2Fsofthsm2.so"));
    }
}
