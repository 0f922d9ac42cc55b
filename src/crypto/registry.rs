use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use log::{debug, info, warn};

use crate::commons::error::Error;
use crate::config::TokenConfig;
use crate::crypto::{aggregate::Crypto, provider::Provider, signers::inmemory::InMemoryProvider};

/// Turns a [`TokenConfig`] into a ready to use provider.
pub type Loader = Arc<dyn Fn(&TokenConfig) -> Result<Arc<dyn Provider>, Error> + Send + Sync>;

//------------ ProviderRegistry ----------------------------------------------

/// Knows how to load a provider for each manufacturer name.
///
/// The registry is created by startup code, filled with the loaders for
/// the backends the application supports, and then used to load the
/// providers named in the token configs. It holds no providers itself:
/// the [`Crypto`] returned by [`ProviderRegistry::load`] owns those and
/// is what has to be closed at shutdown.
///
/// A single lock guards registration and lookup. Loaders run outside of
/// it, so a slow module load does not block other registry users.
#[derive(Default)]
pub struct ProviderRegistry {
    loaders: Mutex<HashMap<String, Loader>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry that knows the built-in in-memory backend.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        if let Ok(mut loaders) = registry.lock() {
            loaders.insert(InMemoryProvider::MANUFACTURER.to_string(), InMemoryProvider::loader());
        }
        registry
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Loader>>, Error> {
        self.loaders
            .lock()
            .map_err(|_| Error::other("provider registry lock is poisoned"))
    }

    /// Registers the loader for a manufacturer.
    ///
    /// Fails if a loader is registered for it already.
    pub fn register(&self, manufacturer: &str, loader: Loader) -> Result<(), Error> {
        let mut loaders = self.lock()?;
        if loaders.contains_key(manufacturer) {
            return Err(Error::AlreadyRegistered(manufacturer.to_string()));
        }
        debug!("Registered provider loader for '{}'", manufacturer);
        loaders.insert(manufacturer.to_string(), loader);
        Ok(())
    }

    pub fn unregister(&self, manufacturer: &str) -> Result<(), Error> {
        self.lock()?
            .remove(manufacturer)
            .map(|_| ())
            .ok_or_else(|| Error::NotRegistered(manufacturer.to_string()))
    }

    pub fn is_registered(&self, manufacturer: &str) -> bool {
        self.lock().map(|l| l.contains_key(manufacturer)).unwrap_or(false)
    }

    /// The registered manufacturer names, sorted.
    pub fn manufacturers(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .lock()
            .map(|l| l.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Loads the provider described by a token config file.
    pub fn load_provider(&self, config_path: &Path) -> Result<Arc<dyn Provider>, Error> {
        let config = TokenConfig::load(config_path)?;
        self.load_provider_from_config(&config)
    }

    /// Loads the provider for an already parsed token config.
    pub fn load_provider_from_config(&self, config: &TokenConfig) -> Result<Arc<dyn Provider>, Error> {
        let loader = self
            .lock()?
            .get(config.manufacturer())
            .cloned()
            .ok_or_else(|| Error::NotRegistered(config.manufacturer().to_string()))?;

        let provider = loader(config)?;
        info!(
            "Loaded provider '{}' model '{}'",
            provider.manufacturer(),
            provider.model()
        );
        Ok(provider)
    }

    /// Loads the default provider and any number of additional ones.
    ///
    /// No two of them may have the same manufacturer. On failure every
    /// provider loaded so far is closed again.
    pub fn load(&self, default_config: &Path, other_configs: &[PathBuf]) -> Result<Crypto, Error> {
        let crypto = Crypto::new(self.load_provider(default_config)?);
        for path in other_configs {
            let res = self.load_provider(path).and_then(|provider| match crypto.add(provider.clone()) {
                Ok(()) => Ok(()),
                Err(e) => {
                    if let Err(close_err) = provider.close() {
                        warn!("Could not close provider '{}': {}", provider.manufacturer(), close_err);
                    }
                    Err(e)
                }
            });
            if let Err(e) = res {
                if let Err(close_err) = crypto.close() {
                    warn!("Could not close providers after failed load: {}", close_err);
                }
                return Err(e);
            }
        }
        Ok(crypto)
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("manufacturers", &self.manufacturers())
            .finish()
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn inmem_loader() -> Loader {
        InMemoryProvider::loader()
    }

    #[test]
    fn register_twice_fails() {
        let registry = ProviderRegistry::new();
        registry.register("Foo", inmem_loader()).unwrap();
        let err = registry.register("Foo", inmem_loader()).unwrap_err();
        assert_eq!(err.to_string(), "already registered: Foo");
    }

    #[test]
    fn unregister_unknown_fails() {
        let registry = ProviderRegistry::new();
        let err = registry.unregister("Foo").unwrap_err();
        assert_eq!(err.to_string(), "not registered: Foo");

        registry.register("Foo", inmem_loader()).unwrap();
        registry.unregister("Foo").unwrap();
        assert!(!registry.is_registered("Foo"));
        registry.register("Foo", inmem_loader()).unwrap();
    }

    #[test]
    fn defaults_know_inmem() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(registry.manufacturers(), vec![InMemoryProvider::MANUFACTURER.to_string()]);
    }

    #[test]
    fn load_provider_by_manufacturer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inmem.json");
        fs::write(&path, r#"{"Manufacturer": "inmem", "Model": "test"}"#).unwrap();

        let registry = ProviderRegistry::with_defaults();
        let provider = registry.load_provider(&path).unwrap();
        assert_eq!(provider.manufacturer(), "inmem");
        assert_eq!(provider.model(), "test");

        let unknown = dir.path().join("unknown.json");
        fs::write(&unknown, r#"{"Manufacturer": "Acme"}"#).unwrap();
        let err = registry.load_provider(&unknown).unwrap_err();
        assert!(matches!(err, Error::NotRegistered(_)));

        assert!(registry.load_provider(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn load_rejects_duplicate_manufacturer() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.json");
        let second = dir.path().join("second.json");
        fs::write(&first, r#"{"Manufacturer": "inmem"}"#).unwrap();
        fs::write(&second, r#"{"Manufacturer": "inmem"}"#).unwrap();

        let registry = ProviderRegistry::with_defaults();
        let err = registry.load(&first, &[second]).unwrap_err();
        assert!(matches!(err, Error::DuplicateManufacturer(_)));
    }

    #[test]
    fn failed_load_closes_loaded_providers() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.json");
        let second = dir.path().join("second.json");
        fs::write(&first, r#"{"Manufacturer": "Recorded"}"#).unwrap();
        fs::write(&second, r#"{"Manufacturer": "Recorded"}"#).unwrap();

        let loaded: Arc<Mutex<Vec<Arc<dyn Provider>>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = loaded.clone();
        let loader: Loader = Arc::new(move |config: &TokenConfig| -> Result<Arc<dyn Provider>, Error> {
            let provider: Arc<dyn Provider> = Arc::new(InMemoryProvider::new(config.manufacturer(), "test"));
            recorder.lock().unwrap().push(provider.clone());
            Ok(provider)
        });
        let registry = ProviderRegistry::new();
        registry.register("Recorded", loader).unwrap();

        assert!(registry.load(&first, &[second]).is_err());
        let loaded = loaded.lock().unwrap();
        assert_eq!(loaded.len(), 2);
        for provider in loaded.iter() {
            assert!(matches!(
                provider.generate_ecdsa_key("", crate::crypto::keys::Curve::P256),
                Err(Error::Closed)
            ));
        }
    }

    #[test]
    fn concurrent_registration() {
        let registry = Arc::new(ProviderRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.register(&format!("m{}", i % 4), inmem_loader()).is_ok())
            })
            .collect();
        let registered = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(registered, 4);
        assert_eq!(registry.manufacturers().len(), 4);
    }
}
