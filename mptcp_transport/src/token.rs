//! Token table
//!
//! Maps 32-bit tokens to connections so an incoming MP_JOIN can find the
//! connection it belongs to. A token is reserved while its handshake is in
//! flight and bound to the connection once the handshake completes.
//! The table has its own lock and never calls into a connection while
//! holding it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use mptcp_core::crypto::{KeyMaterial, KeySource};

use crate::mptcp::connection::{ConnectionHandle, WeakConnection};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("no unique token after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("unknown token {0:08x}")]
    UnknownToken(u32),

    #[error("token {0:08x} is already bound to a connection")]
    AlreadyLive(u32),
}

enum Slot {
    Pending,
    Live(WeakConnection),
}

impl Slot {
    /// Live entry whose connection was dropped without releasing it
    fn is_stale(&self) -> bool {
        matches!(self, Slot::Live(weak) if weak.inner.strong_count() == 0)
    }
}

/// Global token table
pub struct TokenTable {
    slots: Mutex<HashMap<u32, Slot>>,
    key_source: Arc<dyn KeySource>,
    max_retries: u32,
    collisions: AtomicU64,
}

impl TokenTable {
    pub fn new(key_source: Arc<dyn KeySource>, max_retries: u32) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            key_source,
            max_retries: max_retries.max(1),
            collisions: AtomicU64::new(0),
        }
    }

    /// Draw a key whose token is not in use and reserve that token.
    ///
    /// Used both for outgoing connections and for incoming MP_CAPABLE
    /// requests. The reservation is released when dropped unless it was
    /// bound to a connection.
    pub fn reserve(self: &Arc<Self>) -> Result<TokenReservation, TokenError> {
        for attempt in 1..=self.max_retries {
            let keys = KeyMaterial::generate(self.key_source.as_ref());

            let mut slots = self.slots.lock();
            if slots.get(&keys.token).map_or(false, Slot::is_stale) {
                slots.remove(&keys.token);
                tracing::debug!(token = format_args!("{:08x}", keys.token), "reclaimed stale token");
            }
            if slots.contains_key(&keys.token) {
                drop(slots);
                self.collisions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(token = format_args!("{:08x}", keys.token), attempt, "token collision");
                continue;
            }
            slots.insert(keys.token, Slot::Pending);
            drop(slots);

            tracing::trace!(token = format_args!("{:08x}", keys.token), "token reserved");
            return Ok(TokenReservation {
                keys,
                table: Arc::clone(self),
                bound: false,
            });
        }

        tracing::warn!(attempts = self.max_retries, "token space exhausted");
        Err(TokenError::Exhausted { attempts: self.max_retries })
    }

    /// Find the live connection owning `token`
    pub fn lookup(&self, token: u32) -> Option<ConnectionHandle> {
        let mut slots = self.slots.lock();
        let handle = match slots.get(&token) {
            Some(Slot::Live(weak)) => weak.upgrade(),
            _ => return None,
        };
        if handle.is_none() {
            // connection dropped without releasing its token
            slots.remove(&token);
        }
        handle
    }

    /// Remove the live entry of `owner`. A token that has since been
    /// reserved or bound by another connection is left alone. Returns
    /// whether an entry was removed.
    pub fn release(&self, owner: &WeakConnection) -> bool {
        let mut slots = self.slots.lock();
        let owned = matches!(
            slots.get(&owner.token),
            Some(Slot::Live(weak)) if Weak::ptr_eq(&weak.inner, &owner.inner)
        );
        if owned {
            slots.remove(&owner.token);
            tracing::trace!(token = format_args!("{:08x}", owner.token), "token released");
        }
        owned
    }

    fn release_pending(&self, token: u32) {
        let mut slots = self.slots.lock();
        if matches!(slots.get(&token), Some(Slot::Pending)) {
            slots.remove(&token);
            tracing::trace!(token = format_args!("{:08x}", token), "reservation dropped");
        }
    }

    fn promote(&self, token: u32, conn: WeakConnection) -> Result<(), TokenError> {
        let mut slots = self.slots.lock();
        match slots.get_mut(&token) {
            Some(slot @ Slot::Pending) => {
                *slot = Slot::Live(conn);
                Ok(())
            }
            Some(Slot::Live(_)) => Err(TokenError::AlreadyLive(token)),
            None => Err(TokenError::UnknownToken(token)),
        }
    }

    pub fn contains(&self, token: u32) -> bool {
        self.slots.lock().contains_key(&token)
    }

    /// Pending plus live tokens
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys discarded because their token was taken
    pub fn collisions(&self) -> u64 {
        self.collisions.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TokenTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenTable")
            .field("len", &self.len())
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// A reserved token and the key it was derived from
pub struct TokenReservation {
    keys: KeyMaterial,
    table: Arc<TokenTable>,
    bound: bool,
}

impl TokenReservation {
    pub fn keys(&self) -> &KeyMaterial {
        &self.keys
    }

    pub fn token(&self) -> u32 {
        self.keys.token
    }

    /// Make the token resolvable to `conn`
    pub(crate) fn bind(mut self, conn: WeakConnection) -> Result<(), TokenError> {
        self.table.promote(self.keys.token, conn)?;
        self.bound = true;
        Ok(())
    }
}

impl Drop for TokenReservation {
    fn drop(&mut self) {
        if !self.bound {
            self.table.release_pending(self.keys.token);
        }
    }
}

impl fmt::Debug for TokenReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenReservation")
            .field("token", &format_args!("{:08x}", self.keys.token))
            .field("bound", &self.bound)
            .finish()
    }
}
