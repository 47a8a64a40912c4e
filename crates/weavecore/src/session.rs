//! Long-lived side resources started by a run but not awaited by it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tracks duplex sessions for one run; torn down with the run.
#[derive(Clone)]
pub struct SessionTracker {
    token: CancellationToken,
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl SessionTracker {
    /// Sessions stop when `parent` is cancelled or on [`SessionTracker::shutdown`].
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Run `session` in the background until it finishes or the tracker stops.
    pub fn spawn<F>(&self, session_id: impl Into<String>, session: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let session_id = session_id.into();
        let token = self.token.clone();
        let id = session_id.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(session_id = %id, "Session stopped");
                }
                _ = session => {
                    tracing::debug!(session_id = %id, "Session ended");
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|_, h| !h.is_finished());
        tasks.insert(session_id, handle);
    }

    /// Number of sessions still running.
    pub fn active(&self) -> usize {
        self.tasks.lock().values().filter(|h| !h.is_finished()).count()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}
