use std::{
    collections::HashMap,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::oneshot;

/// Identifies one reverse-forward reservation: `address:port` as requested by
/// the client. Listening ports are a process-wide resource, so keys are unique
/// across every SSH connection, not per connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForwardKey(String);

impl ForwardKey {
    pub fn new(address: &str, port: u32) -> Self {
        Self(format!("{address}:{port}"))
    }

    #[cfg(test)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ForwardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("reverse forward {0} already reserved")]
    Conflict(ForwardKey),
}

/// Receives the single cancellation signal of a reservation. Resolves when the
/// reservation is cancelled (explicitly, by the owning connection dying, or by
/// its listener failing).
pub type CancelSignal = oneshot::Receiver<()>;

/// Table of active reverse forwards. One instance per server process, shared by
/// every connection; all mutation goes through [`add`](Self::add) and
/// [`cancel`](Self::cancel) under a single lock.
#[derive(Debug, Default)]
pub struct ForwardRegistry {
    reservations: Mutex<HashMap<ForwardKey, oneshot::Sender<()>>>,
}

impl ForwardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `key`. Fails if it is already reserved by anyone.
    pub fn add(&self, key: ForwardKey) -> Result<CancelSignal, RegistryError> {
        let mut map = self.lock();
        if map.contains_key(&key) {
            return Err(RegistryError::Conflict(key));
        }
        let (tx, rx) = oneshot::channel();
        map.insert(key, tx);
        metrics::gauge!("holepunch_reverse_forwards_active").increment(1.0);
        Ok(rx)
    }

    /// Releases `key` and fires its cancellation signal. Returns `false` if the
    /// key was not reserved (already cancelled, or never added).
    pub fn cancel(&self, key: &ForwardKey) -> bool {
        let Some(tx) = self.lock().remove(key) else {
            return false;
        };
        metrics::gauge!("holepunch_reverse_forwards_active").decrement(1.0);
        // The forward may already be gone (listener closed); nobody to tell.
        let _ = tx.send(());
        true
    }

    #[cfg(test)]
    pub fn contains(&self, key: &ForwardKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn snapshot(&self) -> Vec<ForwardKey> {
        let mut keys: Vec<ForwardKey> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ForwardKey, oneshot::Sender<()>>> {
        self.reservations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
