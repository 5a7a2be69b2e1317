//! Connection registry.
//!
//! Every accepted socket is served by a task spawned through
//! [`ConnectionRegistry::track`]. The registry keeps an abort handle per
//! live task so that [`ConnectionRegistry::destroy_all`] can tear down
//! every connection at once, mid-response included. A task removes its own
//! entry when it finishes, however it finishes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::AbortHandle;
use tracing::{debug, trace};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    live: HashMap<Uuid, AbortHandle>,
    closed: bool,
}

/// Tracks the live connection tasks of one listener.
pub struct ConnectionRegistry {
    name: &'static str,
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    /// Create an empty registry. `name` labels log lines.
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Registry label.
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the map inconsistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn `fut` as a tracked connection task.
    ///
    /// Returns `false` (and drops `fut`) if the registry has been closed.
    pub fn track<F>(self: &Arc<Self>, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let mut inner = self.lock();
        if inner.closed {
            debug!(registry = self.name, "Registry closed, dropping connection");
            return false;
        }

        let guard = Untrack {
            registry: Arc::clone(self),
            id,
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            fut.await;
        });
        // Inserted while still holding the lock, so the task's own removal
        // can never run before the insert.
        inner.live.insert(id, handle.abort_handle());
        trace!(registry = self.name, %id, live = inner.live.len(), "Tracking connection");
        true
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    /// Whether no connection is live.
    pub fn is_empty(&self) -> bool {
        self.lock().live.is_empty()
    }

    /// Whether [`destroy_all`](Self::destroy_all) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Abort every live connection and refuse new ones.
    ///
    /// Returns how many connections were destroyed.
    pub fn destroy_all(&self) -> usize {
        let drained: Vec<AbortHandle> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.live.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &drained {
            handle.abort();
        }
        if !drained.is_empty() {
            debug!(registry = self.name, count = drained.len(), "Destroyed connections");
        }
        drained.len()
    }

    fn remove(&self, id: Uuid) {
        if self.lock().live.remove(&id).is_some() {
            trace!(registry = self.name, %id, "Connection closed");
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ConnectionRegistry")
            .field("name", &self.name)
            .field("live", &inner.live.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

/// Removes a task's entry when the task completes or is aborted.
struct Untrack {
    registry: Arc<ConnectionRegistry>,
    id: Uuid,
}

impl Drop for Untrack {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn settle<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_finished_task_untracks_itself() {
        let registry = ConnectionRegistry::new("http");
        let (tx, rx) = oneshot::channel::<()>();

        assert!(registry.track(async move {
            let _ = rx.await;
        }));
        assert_eq!(registry.len(), 1);

        tx.send(()).unwrap();
        settle(|| registry.is_empty()).await;
    }

    #[tokio::test]
    async fn test_destroy_all_aborts_pending_tasks() {
        let registry = ConnectionRegistry::new("https");
        let (tx, mut rx) = oneshot::channel::<()>();

        for _ in 0..3 {
            registry.track(std::future::pending());
        }
        registry.track(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        assert_eq!(registry.len(), 4);

        assert_eq!(registry.destroy_all(), 4);
        assert!(registry.is_empty());

        // Aborting the task drops its future, closing the channel.
        tokio::time::timeout(Duration::from_secs(1), &mut rx)
            .await
            .expect("task was not aborted")
            .unwrap_err();
    }

    #[tokio::test]
    async fn test_closed_registry_refuses_new_connections() {
        let registry = ConnectionRegistry::new("http");
        registry.destroy_all();

        assert!(registry.is_closed());
        assert!(!registry.track(async {}));
        assert!(registry.is_empty());
    }
}
