//! Tracked background tasks
//!
//! Loops run detached, but the node remembers their handles so shutdown can
//! give each one a bounded amount of time to stop.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Handles = Vec<(String, JoinHandle<()>)>;

#[derive(Debug, Clone, Default)]
pub(crate) struct Tasks {
    handles: Arc<Mutex<Handles>>,
}

impl Tasks {
    fn lock(&self) -> MutexGuard<'_, Handles> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn a named task and keep its handle
    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut handles = self.lock();
        handles.retain(|(_, h)| !h.is_finished());
        handles.push((name.into(), handle));
    }

    /// Number of tracked tasks that have not finished yet
    pub fn running(&self) -> usize {
        self.lock().iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Wait for every tracked task, at most `timeout` each
    pub async fn join_all(&self, timeout: Duration) {
        let handles = std::mem::take(&mut *self.lock());

        for (name, handle) in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => debug!(task = %name, "Task stopped"),
                Ok(Err(e)) => warn!(task = %name, error = %e, "Task failed"),
                Err(_) => warn!(task = %name, "Task did not stop in time, detaching"),
            }
        }
    }
}
