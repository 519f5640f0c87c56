//! Lazily loaded, lock-guarded model handles.
//!
//! A [`ModelProxy`] starts `Unloaded`. The first caller that needs the model
//! moves it to `Loading` and runs the loader on the blocking pool; every
//! other caller waits for that same transition instead of loading a second
//! copy. A failed load is remembered (for health reporting) and retried by
//! the next caller.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tracing::{error, info};

use crate::error::{Result, TtsError};

/// A loaded model. Inference takes the inner mutex, so calls into one model
/// are serialized.
pub type SharedModel<M> = Arc<Mutex<M>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

enum Slot<M> {
    Unloaded,
    Loading,
    Ready(SharedModel<M>),
    Failed(String),
}

struct Shared<M> {
    slot: Mutex<Slot<M>>,
    settled: Notify,
}

impl<M> Shared<M> {
    /// Record the outcome of a load and wake everyone waiting on it.
    fn settle(&self, name: &str, start: Instant, outcome: Result<M>) -> Result<SharedModel<M>> {
        let result = match self.slot.lock() {
            Ok(mut slot) => match outcome {
                Ok(model) => {
                    let shared = Arc::new(Mutex::new(model));
                    *slot = Slot::Ready(shared.clone());
                    info!(model = %name, elapsed_ms = start.elapsed().as_millis() as u64, "model ready");
                    Ok(shared)
                }
                Err(e) => {
                    error!(model = %name, "model load failed: {e}");
                    *slot = Slot::Failed(e.to_string());
                    Err(e)
                }
            },
            Err(_) => Err(TtsError::poisoned("model slot")),
        };
        self.settled.notify_waiters();
        result
    }
}

pub struct ModelProxy<M> {
    name: String,
    shared: Arc<Shared<M>>,
}

impl<M: Send + 'static> std::fmt::Debug for ModelProxy<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelProxy")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl<M: Send + 'static> ModelProxy<M> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Unloaded),
                settled: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LoadState {
        match self.shared.slot.lock().as_deref() {
            Ok(Slot::Unloaded) => LoadState::Unloaded,
            Ok(Slot::Loading) => LoadState::Loading,
            Ok(Slot::Ready(_)) => LoadState::Ready,
            Ok(Slot::Failed(_)) | Err(_) => LoadState::Failed,
        }
    }

    /// Last load error, if the most recent attempt failed.
    pub fn last_error(&self) -> Option<String> {
        match self.shared.slot.lock().as_deref() {
            Ok(Slot::Failed(msg)) => Some(msg.clone()),
            _ => None,
        }
    }

    /// Return the loaded model, running `loader` on the blocking pool if no
    /// load has succeeded yet.
    ///
    /// The load runs in its own task: a caller dropped mid-load does not
    /// leave the slot stuck in `Loading`, the load still settles and wakes
    /// the other waiters.
    pub async fn get_or_load<F>(&self, loader: F) -> Result<SharedModel<M>>
    where
        F: FnOnce() -> Result<M> + Send + 'static,
    {
        loop {
            // Register interest before releasing the slot lock so a load that
            // settles in between still wakes us.
            let settled = self.shared.settled.notified();
            {
                let mut slot = self.shared.slot.lock().map_err(|_| TtsError::poisoned("model slot"))?;
                match &*slot {
                    Slot::Ready(model) => return Ok(model.clone()),
                    Slot::Loading => {}
                    Slot::Unloaded | Slot::Failed(_) => {
                        *slot = Slot::Loading;
                        break;
                    }
                }
            }
            settled.await;
        }

        info!(model = %self.name, "loading model");
        let (tx, rx) = oneshot::channel();
        let shared = self.shared.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let outcome = match tokio::task::spawn_blocking(loader).await {
                Ok(result) => result,
                Err(join_err) => Err(TtsError::from(join_err)),
            };
            let _ = tx.send(shared.settle(&name, start, outcome));
        });

        rx.await
            .map_err(|_| TtsError::Internal(format!("load task for {} ended without a result", self.name)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_load() {
        let proxy = Arc::new(ModelProxy::<u32>::new("test"));
        let loads = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let proxy = proxy.clone();
            let loads = loads.clone();
            handles.push(tokio::spawn(async move {
                proxy
                    .get_or_load(move || {
                        loads.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(50));
                        Ok(7)
                    })
                    .await
            }));
        }

        for handle in handles {
            let model = handle.await.unwrap().unwrap();
            assert_eq!(*model.lock().unwrap(), 7);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.state(), LoadState::Ready);
    }

    #[tokio::test]
    async fn failed_load_is_reported_then_retried() {
        let proxy = ModelProxy::<u32>::new("flaky");
        assert_eq!(proxy.state(), LoadState::Unloaded);

        let err = proxy
            .get_or_load(|| Err(TtsError::MissingArtifact("missing.onnx".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, TtsError::MissingArtifact(_)));
        assert_eq!(proxy.state(), LoadState::Failed);
        assert!(proxy.last_error().unwrap().contains("missing.onnx"));

        let model = proxy.get_or_load(|| Ok(3)).await.unwrap();
        assert_eq!(*model.lock().unwrap(), 3);
        assert_eq!(proxy.state(), LoadState::Ready);
        assert!(proxy.last_error().is_none());
    }

    #[tokio::test]
    async fn panicking_loader_becomes_failure() {
        let proxy = ModelProxy::<u32>::new("panics");
        let err = proxy.get_or_load(|| panic!("boom")).await.unwrap_err();
        assert!(matches!(err, TtsError::Internal(_)));
        assert_eq!(proxy.state(), LoadState::Failed);
    }

    #[tokio::test]
    async fn abandoned_caller_does_not_strand_the_load() {
        let proxy = ModelProxy::<u32>::new("slow");

        let first = tokio::time::timeout(
            Duration::from_millis(50),
            proxy.get_or_load(|| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(1)
            }),
        )
        .await;
        assert!(first.is_err());

        // The load keeps going without the first caller; the next caller
        // gets its result instead of waiting forever.
        let model = tokio::time::timeout(Duration::from_secs(2), proxy.get_or_load(|| Ok(2)))
            .await
            .expect("second caller timed out")
            .unwrap();
        assert_eq!(*model.lock().unwrap(), 1);
        assert_eq!(proxy.state(), LoadState::Ready);
    }
}
