use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use log::{debug, warn};

use crate::commons::error::Error;
use crate::crypto::{keys::PrivateKey, keyuri::KeyUri, provider::Provider};

//------------ Crypto --------------------------------------------------------

/// The providers an application works with.
///
/// There is always a default provider, used for creating new keys unless
/// the caller asks for a specific manufacturer. Additional providers are
/// looked up by manufacturer name, of which every provider has a distinct
/// one. The default provider can be looked up by its name too.
///
/// Providers are shared as [`Arc`]s, so the same provider can be handed
/// out to many callers at once.
pub struct Crypto {
    default: Arc<dyn Provider>,
    others: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl Crypto {
    pub fn new(default: Arc<dyn Provider>) -> Self {
        Crypto {
            default,
            others: RwLock::new(HashMap::new()),
        }
    }

    /// Adds a provider for a manufacturer not known yet.
    pub fn add(&self, provider: Arc<dyn Provider>) -> Result<(), Error> {
        let manufacturer = provider.manufacturer().to_string();
        if manufacturer == self.default.manufacturer() {
            return Err(Error::DuplicateManufacturer(manufacturer));
        }
        let mut others = self
            .others
            .write()
            .map_err(|_| Error::other("provider map lock is poisoned"))?;
        if others.contains_key(&manufacturer) {
            return Err(Error::DuplicateManufacturer(manufacturer));
        }
        debug!("Adding provider '{}'", manufacturer);
        others.insert(manufacturer, provider);
        Ok(())
    }

    pub fn default(&self) -> Arc<dyn Provider> {
        self.default.clone()
    }

    pub fn by_manufacturer(&self, manufacturer: &str) -> Result<Arc<dyn Provider>, Error> {
        if self.default.manufacturer() == manufacturer {
            return Ok(self.default.clone());
        }
        self.others
            .read()
            .map_err(|_| Error::other("provider map lock is poisoned"))?
            .get(manufacturer)
            .cloned()
            .ok_or_else(|| Error::ProviderNotFound(manufacturer.to_string()))
    }

    /// The manufacturers of all providers, the default one first.
    pub fn manufacturers(&self) -> Vec<String> {
        let mut res = vec![self.default.manufacturer().to_string()];
        if let Ok(others) = self.others.read() {
            let mut names: Vec<_> = others.keys().cloned().collect();
            names.sort();
            res.extend(names);
        }
        res
    }

    /// Resolves a key reference URI to the key it refers to.
    pub fn load_private_key(&self, uri: &str) -> Result<Arc<dyn PrivateKey>, Error> {
        let uri = KeyUri::parse(uri)?;
        self.by_manufacturer(uri.manufacturer())?.get_key(uri.id())
    }

    /// Closes all providers.
    ///
    /// Every provider is closed even if closing an earlier one fails, the
    /// first error is returned.
    pub fn close(&self) -> Result<(), Error> {
        let mut providers = vec![self.default.clone()];
        if let Ok(others) = self.others.read() {
            providers.extend(others.values().cloned());
        }

        let mut res = Ok(());
        for provider in providers {
            if let Err(e) = provider.close() {
                warn!("Could not close provider '{}': {}", provider.manufacturer(), e);
                if res.is_ok() {
                    res = Err(e);
                }
            }
        }
        res
    }
}

impl fmt::Debug for Crypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crypto")
            .field("manufacturers", &self.manufacturers())
            .finish()
    }
}

//------------ Tests ---------------------------------------------------------
