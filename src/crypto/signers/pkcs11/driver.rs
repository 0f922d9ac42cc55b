use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, error, info, trace};
use secrecy::SecretString;

use crate::commons::error::Error;
use crate::crypto::signers::pkcs11::{
    module::{Module, ModuleError, Session, TokenDetails},
    session::SessionPool,
};

//------------ TokenSelector -------------------------------------------------

/// How to pick the token to use from the slots of a module.
///
/// When both are given, a token must match both.
#[derive(Clone, Debug, Default)]
pub struct TokenSelector {
    pub serial: String,
    pub label: String,
}

impl TokenSelector {
    fn matches(&self, token: &TokenDetails) -> bool {
        (self.serial.is_empty() || self.serial == token.serial)
            && (self.label.is_empty() || self.label == token.label)
    }
}

//------------ Pkcs11Driver --------------------------------------------------

/// A PKCS#11 module together with the slot in use and its sessions.
///
/// Sessions are pooled per slot. The slot the driver was opened for has
/// its pool from the start, other slots get one when first used.
pub struct Pkcs11Driver<M: Module> {
    module: Arc<M>,

    slot: u64,

    token: TokenDetails,

    pin: Option<SecretString>,

    max_sessions: usize,

    // Guards creation of the per slot pools.
    pools: RwLock<HashMap<u64, Arc<SessionPool<M::Session>>>>,

    closed: AtomicBool,
}

impl<M: Module> std::fmt::Debug for Pkcs11Driver<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkcs11Driver")
            .field("slot", &self.slot)
            .field("token", &self.token.label)
            .field("serial", &self.token.serial)
            .finish()
    }
}

impl<M: Module> Pkcs11Driver<M> {
    /// Finds the selected token in the module and logs in to it.
    ///
    /// Fails if no token matches, if neither a serial nor a label is
    /// given, or if logging in fails.
    pub fn open(
        module: M,
        selector: &TokenSelector,
        pin: Option<SecretString>,
        max_sessions: usize,
    ) -> Result<Self, Error> {
        if selector.serial.is_empty() && selector.label.is_empty() {
            return Err(Error::NotConfigured("token serial or token label".to_string()));
        }

        let (slot, token) = Self::find_token(&module, selector)?;

        let library = module.library_description().unwrap_or_default();
        info!(
            "Using PKCS#11 token '{}' (serial '{}', model '{}') in slot {} of library '{}'",
            token.label, token.serial, token.model, slot, library
        );

        let driver = Pkcs11Driver {
            module: Arc::new(module),
            slot,
            token,
            pin,
            max_sessions,
            pools: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };

        driver.setup_sessions(slot, max_sessions)?;

        // Opening the first session logs in, don't wait for the first key
        // operation to find out the PIN is wrong.
        driver.with_session(slot, |_| Ok(()))?;

        Ok(driver)
    }

    fn find_token(module: &M, selector: &TokenSelector) -> Result<(u64, TokenDetails), Error> {
        let slots = module
            .slots_with_token()
            .map_err(|e| Error::from(e).within("list slots", None, None))?;
        for slot in slots {
            let token = module
                .token_details(slot)
                .map_err(|e| Error::from(e).within("get token info", Some(slot), None))?;
            if selector.matches(&token) {
                return Ok((slot, token));
            }
            debug!(
                "PKCS#11: skipping token '{}' with serial '{}' in slot {}",
                token.label, token.serial, slot
            );
        }
        Err(Error::TokenNotFound)
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    /// The slot the driver was opened for.
    pub fn slot(&self) -> u64 {
        self.slot
    }

    /// The token in [`Self::slot`], as found when opening.
    pub fn token(&self) -> &TokenDetails {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Creates the session pool for a slot, unless it exists already.
    pub fn setup_sessions(&self, slot: u64, max: usize) -> Result<Arc<SessionPool<M::Session>>, Error> {
        if let Some(pool) = self.read_pools()?.get(&slot) {
            return Ok(pool.clone());
        }

        let mut pools = self
            .pools
            .write()
            .map_err(|_| Error::other("session pool lock is poisoned"))?;
        let pool = pools.entry(slot).or_insert_with(|| {
            debug!("PKCS#11: creating session pool for slot {} with capacity {}", slot, max);
            Arc::new(SessionPool::new(slot, max))
        });
        Ok(pool.clone())
    }

    fn read_pools(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<u64, Arc<SessionPool<M::Session>>>>, Error> {
        self.pools
            .read()
            .map_err(|_| Error::other("session pool lock is poisoned"))
    }

    /// Runs `op` with a session for `slot` that no other thread uses.
    ///
    /// The session comes from the pool of the slot if one is idle and is
    /// opened otherwise. Whatever `op` returns, the session goes back into
    /// the pool afterwards. Errors are not retried.
    pub fn with_session<T, F>(&self, slot: u64, op: F) -> Result<T, Error>
    where
        F: FnOnce(&M::Session) -> Result<T, Error>,
    {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let pool = self.setup_sessions(slot, self.max_sessions)?;
        let session = match pool.take() {
            Some(session) => {
                trace!("PKCS#11: borrowed idle session for slot {}", slot);
                session
            }
            None => self.open_session(&pool)?,
        };

        let session = pool.lend(session);
        op(&session)
    }

    /// Opens a new session, logging in if this is the first one.
    fn open_session(&self, pool: &SessionPool<M::Session>) -> Result<M::Session, Error> {
        let slot = pool.slot();
        trace!("PKCS#11: opening new session for slot {}", slot);
        let session = self
            .module
            .open_session(slot)
            .map_err(|e| Error::from(e).within("open session", Some(slot), None))?;

        let mut logged_in = pool.login_state()?;
        if !*logged_in {
            if self.login_required(slot)? {
                match session.login(self.pin.as_ref()) {
                    Ok(()) | Err(ModuleError::UserAlreadyLoggedIn) => {
                        debug!("PKCS#11: logged in to slot {}", slot);
                    }
                    Err(err) => {
                        error!("PKCS#11: login to slot {} failed: {}", slot, err);
                        return Err(Error::from(err).within("login", Some(slot), None));
                    }
                }
            }
            *logged_in = true;
        }

        Ok(session)
    }

    fn login_required(&self, slot: u64) -> Result<bool, Error> {
        if slot == self.slot {
            return Ok(self.token.login_required);
        }
        let token = self
            .module
            .token_details(slot)
            .map_err(|e| Error::from(e).within("get token info", Some(slot), None))?;
        Ok(token.login_required)
    }

    /// Reads the current details of every token of the module.
    pub fn tokens(&self) -> Result<Vec<(u64, TokenDetails)>, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let slots = self
            .module
            .slots_with_token()
            .map_err(|e| Error::from(e).within("list slots", None, None))?;
        slots
            .into_iter()
            .map(|slot| {
                self.module
                    .token_details(slot)
                    .map(|token| (slot, token))
                    .map_err(|e| Error::from(e).within("get token info", Some(slot), None))
            })
            .collect()
    }

    /// Draws random bytes from the module.
    pub fn random_bytes(&self, len: usize) -> Result<Vec<u8>, Error> {
        self.with_session(self.slot, |session| {
            session.generate_random(len).map_err(|e| {
                debug!("PKCS#11: generate random failed: {}", e);
                Error::CannotGetRandomData
            })
        })
    }

    /// Closes all idle sessions and refuses further use.
    ///
    /// Must only be called once no thread holds a borrowed session.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut pools) = self.pools.write() {
            for (slot, pool) in pools.drain() {
                let closed = pool.drain();
                debug!("PKCS#11: closed {} idle session(s) for slot {}", closed, slot);
            }
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use crate::crypto::signers::pkcs11::mockmodule::MockModule;

    use super::*;

    fn selector(label: &str) -> TokenSelector {
        TokenSelector {
            serial: String::new(),
            label: label.to_string(),
        }
    }

    fn pin(pin: &str) -> Option<SecretString> {
        Some(SecretString::new(pin.to_string()))
    }

    #[test]
    fn open_requires_token_selection() {
        let module = MockModule::with_token("test", "1234");
        let err = Pkcs11Driver::open(module, &TokenSelector::default(), pin("1234"), 4).unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)));
    }

    #[test]
    fn open_unknown_token_fails() {
        let module = MockModule::with_token("test", "1234");
        let err = Pkcs11Driver::open(module, &selector("other"), pin("1234"), 4).unwrap_err();
        assert!(matches!(err, Error::TokenNotFound));
    }

    #[test]
    fn open_with_wrong_pin_fails() {
        let module = MockModule::with_token("test", "1234");
        let err = Pkcs11Driver::open(module, &selector("test"), pin("0000"), 4).unwrap_err();
        assert!(matches!(err.kind(), Error::Module(ModuleError::PinIncorrect)));
    }

    #[test]
    fn open_selects_by_serial_and_label() {
        let module = MockModule::new();
        module.add_token("first", "1111", true);
        let slot = module.add_token("second", "2222", true);
        let serial = module.token_details(slot).unwrap().serial;

        let selector = TokenSelector {
            serial,
            label: "second".to_string(),
        };
        let driver = Pkcs11Driver::open(module, &selector, pin("2222"), 4).unwrap();
        assert_eq!(driver.slot(), slot);
        assert_eq!(driver.token().label, "second");
    }

    #[test]
    fn login_once_per_slot() {
        let module = MockModule::with_token("test", "1234");
        let driver = Pkcs11Driver::open(module, &selector("test"), pin("1234"), 8).unwrap();
        let slot = driver.slot();

        // Hold several sessions at once so that more get opened.
        driver
            .with_session(slot, |_| {
                driver.with_session(slot, |_| driver.with_session(slot, |_| Ok(())))
            })
            .unwrap();

        assert_eq!(driver.module().login_calls(), 1);
        assert_eq!(driver.module().sessions_opened(), 3);
        assert_eq!(driver.setup_sessions(slot, 8).unwrap().idle(), 3);
    }

    #[test]
    fn login_skipped_when_not_required() {
        let module = MockModule::new();
        module.add_token("public", "", false);
        let driver = Pkcs11Driver::open(module, &selector("public"), None, 4).unwrap();
        assert_eq!(driver.module().login_calls(), 0);
    }

    #[test]
    fn session_returned_after_failure() {
        let module = MockModule::with_token("test", "1234");
        let driver = Pkcs11Driver::open(module, &selector("test"), pin("1234"), 4).unwrap();
        let slot = driver.slot();

        let res: Result<(), Error> = driver.with_session(slot, |_| Err(Error::KeyNotFound));
        assert!(res.is_err());
        assert_eq!(driver.setup_sessions(slot, 4).unwrap().idle(), 1);
        assert_eq!(driver.module().sessions_opened(), 1);
    }

    #[test]
    fn setup_sessions_is_idempotent_under_concurrency() {
        let module = MockModule::with_token("test", "1234");
        let driver = Arc::new(Pkcs11Driver::open(module, &selector("test"), pin("1234"), 4).unwrap());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let driver = driver.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    driver.setup_sessions(42, 16).unwrap()
                })
            })
            .collect();
        let pools: Vec<_> = handles.into_iter().map(|handle| handle.join().unwrap()).collect();

        for pool in &pools {
            assert!(Arc::ptr_eq(pool, &pools[0]));
            assert_eq!(pool.capacity(), 16);
        }
    }

    #[test]
    fn closed_driver_refuses_sessions() {
        let module = MockModule::with_token("test", "1234");
        let driver = Pkcs11Driver::open(module, &selector("test"), pin("1234"), 4).unwrap();
        driver.close();
        driver.close();
        let res = driver.with_session(driver.slot(), |_| Ok(()));
        assert!(matches!(res, Err(Error::Closed)));
    }
}
