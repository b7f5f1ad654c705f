use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::watch, task::JoinSet};

/// Owns every background task spawned on behalf of one SSH connection
/// (reverse-forward accept loops, relays, direct-forward bridges).
///
/// When the connection ends, [`shutdown`](Self::shutdown) flips the `closed`
/// signal that forward loops watch, then waits for the tasks and aborts the
/// ones that do not finish in time. Nothing spawned here outlives the
/// connection.
pub struct ConnScope {
    id: String,
    closed: watch::Sender<bool>,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl std::fmt::Debug for ConnScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnScope").field("id", &self.id).finish_non_exhaustive()
    }
}

impl ConnScope {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        let (closed, _rx) = watch::channel(false);
        Arc::new(Self {
            id: id.into(),
            closed,
            tasks: Mutex::new(Some(JoinSet::new())),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Receiver that flips to `true` once the connection is gone.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Spawns `fut` under this connection. Errors are logged with `what` as the
    /// task label. Returns `false` (and drops `fut` unpolled) if the connection
    /// has already shut down.
    pub fn spawn<F>(&self, what: &'static str, fut: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut guard = self.lock();
        let Some(set) = guard.as_mut() else {
            return false;
        };

        // Reap what already finished so long-lived connections don't
        // accumulate results.
        while let Some(res) = set.try_join_next() {
            self.log_join(res);
        }

        let conn = self.id.clone();
        set.spawn(async move {
            if let Err(err) = fut.await {
                tracing::warn!(conn = %conn, task = what, err = %format!("{err:#}"), "sshd: task failed");
            }
        });
        true
    }

    /// Signals `closed`, then drains the tasks; whatever is still running after
    /// `grace` is aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.closed.send_replace(true);

        let Some(mut set) = self.lock().take() else {
            return;
        };

        let drain = async {
            while let Some(res) = set.join_next().await {
                self.log_join(res);
            }
        };

        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::debug!(conn = %self.id, left = set.len(), "sshd: aborting leftover tasks");
            set.abort_all();
            while set.join_next().await.is_some() {}
        }
    }

    fn log_join(&self, res: Result<(), tokio::task::JoinError>) {
        if let Err(err) = res {
            if err.is_panic() {
                tracing::error!(conn = %self.id, err = %err, "sshd: task panicked");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<JoinSet<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves once `closed` reports the connection gone (or its sender is dropped).
pub async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}
