use std::{
    ops::Deref,
    sync::{Mutex, MutexGuard},
};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use log::{trace, warn};

use crate::commons::error::Error;
use crate::crypto::signers::pkcs11::module::Session;

//------------ SessionPool ---------------------------------------------------

/// The idle sessions of one slot.
///
/// PKCS#11 sessions must not be used by two threads at the same time. The
/// pool hands out each idle session to exactly one borrower, and when it
/// has none left the caller opens a new one. The pool never opens sessions
/// itself and never checks whether a returned session still works: a
/// session on which a call failed goes back into the pool like any other.
///
/// The pool holds at most `capacity` idle sessions. Returning a session to
/// a full pool blocks until a borrower takes one out.
#[derive(Debug)]
pub struct SessionPool<S> {
    slot: u64,
    capacity: usize,
    idle_tx: Sender<S>,
    idle_rx: Receiver<S>,

    /// Whether the first session of this slot has logged in. Login state
    /// is shared by all sessions of an application on a token.
    logged_in: Mutex<bool>,
}

impl<S: Session> SessionPool<S> {
    pub fn new(slot: u64, capacity: usize) -> Self {
        let (idle_tx, idle_rx) = bounded(capacity.max(1));
        SessionPool {
            slot,
            capacity: capacity.max(1),
            idle_tx,
            idle_rx,
            logged_in: Mutex::new(false),
        }
    }

    pub fn slot(&self) -> u64 {
        self.slot
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of sessions waiting to be borrowed.
    pub fn idle(&self) -> usize {
        self.idle_rx.len()
    }

    /// Takes an idle session, if there is one.
    pub fn take(&self) -> Option<S> {
        self.idle_rx.try_recv().ok()
    }

    /// Returns a session, waiting for room if the pool is full.
    pub fn put(&self, session: S) {
        match self.idle_tx.try_send(session) {
            Ok(()) => {}
            Err(TrySendError::Full(session)) => {
                trace!("PKCS#11: session pool for slot {} is full, waiting to return session", self.slot);
                if self.idle_tx.send(session).is_err() {
                    warn!("PKCS#11: session pool for slot {} is gone, dropping session", self.slot);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("PKCS#11: session pool for slot {} is gone, dropping session", self.slot);
            }
        }
    }

    /// Wraps a session so that it is returned to this pool on drop.
    pub fn lend(&self, session: S) -> PooledSession<'_, S> {
        PooledSession {
            session: Some(session),
            pool: self,
        }
    }

    /// Locks the login state of the slot.
    pub fn login_state(&self) -> Result<MutexGuard<'_, bool>, Error> {
        self.logged_in
            .lock()
            .map_err(|_| Error::other(format!("login lock for slot {} is poisoned", self.slot)))
    }

    /// Closes all idle sessions.
    pub fn drain(&self) -> usize {
        let mut closed = 0;
        while self.take().is_some() {
            closed += 1;
        }
        closed
    }
}

//------------ PooledSession -------------------------------------------------

/// A session borrowed from a [`SessionPool`].
///
/// The session goes back into the pool when this is dropped, whether the
/// work done with it succeeded, failed, or panicked.
pub struct PooledSession<'a, S: Session> {
    session: Option<S>,
    pool: &'a SessionPool<S>,
}

impl<S: Session> Deref for PooledSession<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        // Only taken out in drop.
        self.session.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<S: Session> Drop for PooledSession<'_, S> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            trace!("PKCS#11: returning session to pool for slot {}", self.pool.slot);
            self.pool.put(session);
        }
    }
}

//------------ Tests ---------------------------------------------------------
