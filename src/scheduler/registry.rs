//! Concurrent registry of running probe loops, keyed by target identity.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{run_probe_loop, RoundSinks};
use crate::probe::ProbeConfig;

/// Registry error types.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("target {0} is already being probed")]
    AlreadyAdmitted(String),
    #[error("registry is shutting down")]
    ShuttingDown,
}

/// A running probe loop as seen from outside.
#[derive(Debug, Clone)]
pub struct ProbeHandle {
    identity: String,
    config: Arc<ProbeConfig>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
}

impl ProbeHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// False once the loop has exited.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct Entry {
    handle: ProbeHandle,
    /// Taken by the withdraw that owns the join.
    task: Option<JoinHandle<()>>,
}

struct Inner {
    entries: RwLock<HashMap<String, Entry>>,
    sinks: RoundSinks,
    root: CancellationToken,
    size: watch::Sender<usize>,
}

/// Map of target identity to its running loop.
///
/// Admission is check-and-insert under one write lock, so an identity has at
/// most one loop at a time. Cheap to clone; clones share the same map.
#[derive(Clone)]
pub struct TargetRegistry {
    inner: Arc<Inner>,
}

impl TargetRegistry {
    pub fn new(sinks: RoundSinks) -> Self {
        Self::with_cancel(sinks, CancellationToken::new())
    }

    /// Loops are cancelled when `root` is.
    pub fn with_cancel(sinks: RoundSinks, root: CancellationToken) -> Self {
        let (size, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                sinks,
                root,
                size,
            }),
        }
    }

    /// Start probing `config.target`.
    ///
    /// Fails if the identity already has a running loop; a configuration
    /// change must withdraw first.
    pub async fn admit(&self, config: ProbeConfig) -> Result<ProbeHandle, RegistryError> {
        if self.inner.root.is_cancelled() {
            return Err(RegistryError::ShuttingDown);
        }

        let identity = config.identity().to_string();
        let mut entries = self.inner.entries.write().await;
        if entries.contains_key(&identity) {
            return Err(RegistryError::AlreadyAdmitted(identity));
        }

        let handle = ProbeHandle {
            identity: identity.clone(),
            config: Arc::new(config),
            cancel: self.inner.root.child_token(),
            alive: Arc::new(AtomicBool::new(true)),
        };

        tracing::info!(
            "Registry: Adding target {} (interval {:?})",
            identity,
            handle.config.interval
        );

        let task = tokio::spawn(run_handle(
            handle.clone(),
            self.inner.sinks.clone(),
            Arc::downgrade(&self.inner),
        ));
        entries.insert(
            identity,
            Entry {
                handle: handle.clone(),
                task: Some(task),
            },
        );
        self.inner.size.send_replace(entries.len());

        Ok(handle)
    }

    /// Stop probing `identity` and wait for its loop to exit.
    ///
    /// The entry stays in the map until the loop has exited and its series
    /// are gone, so the identity cannot be admitted again in between.
    /// Returns false if the identity was not registered or is already being
    /// withdrawn.
    pub async fn withdraw(&self, identity: &str) -> bool {
        let (handle, task) = {
            let mut entries = self.inner.entries.write().await;
            let Some(entry) = entries.get_mut(identity) else {
                return false;
            };
            let Some(task) = entry.task.take() else {
                return false;
            };
            entry.handle.cancel.cancel();
            (entry.handle.clone(), task)
        };

        if let Err(e) = task.await {
            tracing::error!("Registry: Probe loop for {} panicked: {}", identity, e);
        }
        if let Some(metrics) = &self.inner.sinks.metrics {
            metrics.forget(identity);
        }

        let mut entries = self.inner.entries.write().await;
        let same = entries
            .get(identity)
            .is_some_and(|e| Arc::ptr_eq(&e.handle.alive, &handle.alive));
        if same {
            entries.remove(identity);
            self.inner.size.send_replace(entries.len());
        }
        tracing::info!("Registry: Removed target {}", identity);
        true
    }

    /// Identities with a running loop, excluding those being withdrawn.
    pub async fn snapshot(&self) -> BTreeSet<String> {
        self.inner
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| !e.handle.is_cancelled())
            .map(|(identity, _)| identity.clone())
            .collect()
    }

    pub async fn get(&self, identity: &str) -> Option<ProbeHandle> {
        self.inner
            .entries
            .read()
            .await
            .get(identity)
            .map(|e| e.handle.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    /// Resolve once no loops remain.
    pub async fn wait_empty(&self) {
        let mut rx = self.inner.size.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Cancel every loop and wait for all of them to exit.
    pub async fn shutdown(&self) {
        self.inner.root.cancel();
        let drained: Vec<(String, Entry)> = {
            let mut entries = self.inner.entries.write().await;
            let drained = entries.drain().collect();
            self.inner.size.send_replace(0);
            drained
        };

        for (identity, entry) in drained {
            // A concurrent withdraw is already joining this one.
            let Some(task) = entry.task else {
                continue;
            };
            if let Err(e) = task.await {
                tracing::error!("Registry: Probe loop for {} panicked: {}", identity, e);
            }
        }
        tracing::info!("Registry: All probe loops stopped");
    }
}

async fn run_handle(handle: ProbeHandle, sinks: RoundSinks, registry: Weak<Inner>) {
    let rounds = run_probe_loop(handle.config.clone(), sinks, handle.cancel.clone()).await;
    handle.alive.store(false, Ordering::Release);
    tracing::info!("Probe loop for {} exited after {} rounds", handle.identity, rounds);

    // Clean up when the loop ended on its own (count exhausted). A cancelled
    // loop is removed by whoever cancelled it.
    if handle.cancel.is_cancelled() {
        return;
    }
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let mut entries = inner.entries.write().await;
    let same = entries
        .get(&handle.identity)
        .is_some_and(|e| Arc::ptr_eq(&e.handle.alive, &handle.alive));
    if same {
        entries.remove(&handle.identity);
        inner.size.send_replace(entries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsExporter;
    use crate::probe::testutil::http_server;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn config(target: &str) -> ProbeConfig {
        ProbeConfig {
            interval: Duration::from_millis(50),
            timeout: Duration::from_secs(1),
            ..ProbeConfig::new(target)
        }
    }

    #[tokio::test]
    async fn test_admit_twice_rejected() {
        let registry = TargetRegistry::new(RoundSinks::default());
        let addr = http_server().await.to_string();

        let handle = registry.admit(config(&addr)).await.unwrap();
        assert_eq!(handle.identity(), addr);
        assert_eq!(
            registry.admit(config(&addr)).await.unwrap_err(),
            RegistryError::AlreadyAdmitted(addr.clone())
        );
        assert_eq!(registry.len().await, 1);

        assert!(registry.withdraw(&addr).await);
        assert!(handle.is_cancelled());
        assert!(!handle.is_alive());

        assert!(registry.admit(config(&addr)).await.is_ok());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_withdraw_idempotent() {
        let registry = TargetRegistry::new(RoundSinks::default());
        assert!(!registry.withdraw("never-admitted").await);

        registry.admit(config("127.0.0.1:9")).await.unwrap();
        assert!(registry.withdraw("127.0.0.1:9").await);
        assert!(!registry.withdraw("127.0.0.1:9").await);
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_admission_single_winner() {
        let registry = TargetRegistry::new(RoundSinks::default());
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.admit(config("127.0.0.1:9")).await.is_ok() })
            })
            .collect();

        let mut admitted = 0;
        for t in tasks {
            if t.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(registry.snapshot().await.len(), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_finished_loop_removes_itself() {
        let registry = TargetRegistry::new(RoundSinks::default());
        let addr = http_server().await.to_string();
        let handle = registry.admit(ProbeConfig { count: 1, ..config(&addr) }).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), registry.wait_empty())
            .await
            .unwrap();
        assert!(!handle.is_alive());
        assert!(registry.get(&addr).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let root = CancellationToken::new();
        let registry = TargetRegistry::with_cancel(RoundSinks::default(), root.clone());
        let a = registry.admit(config("127.0.0.1:9")).await.unwrap();
        let b = registry.admit(config("127.0.0.1:10")).await.unwrap();

        registry.shutdown().await;
        assert!(!a.is_alive());
        assert!(!b.is_alive());
        assert!(registry.snapshot().await.is_empty());
        assert_eq!(
            registry.admit(config("127.0.0.1:11")).await.unwrap_err(),
            RegistryError::ShuttingDown
        );
    }

    #[tokio::test]
    async fn test_withdraw_with_stalled_sink() {
        let addr = http_server().await.to_string();
        let (tx, _rx) = mpsc::channel(1);
        let registry = TargetRegistry::new(RoundSinks { metrics: None, results: Some(tx) });
        let handle = registry
            .admit(ProbeConfig { interval: Duration::from_millis(20), ..config(&addr) })
            .await
            .unwrap();

        // Let the loop fill the channel and block on the next send.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let withdraw = tokio::spawn({
            let registry = registry.clone();
            let addr = addr.clone();
            async move { registry.withdraw(&addr).await }
        });
        while !handle.is_cancelled() {
            tokio::task::yield_now().await;
        }
        // Not admissible again until the old loop is gone.
        if handle.is_alive() {
            assert_eq!(
                registry.admit(config(&addr)).await.unwrap_err(),
                RegistryError::AlreadyAdmitted(addr.clone())
            );
        }
        assert!(!registry.snapshot().await.contains(&addr));

        let withdrawn = tokio::time::timeout(Duration::from_secs(3), withdraw)
            .await
            .unwrap()
            .unwrap();
        assert!(withdrawn);
        assert!(!handle.is_alive());
        assert_eq!(registry.len().await, 0);
        assert!(registry.admit(config(&addr)).await.is_ok());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_withdraw_forgets_metrics_before_readmit() {
        let addr = http_server().await.to_string();
        let metrics = Arc::new(MetricsExporter::new());
        let registry = TargetRegistry::new(RoundSinks {
            metrics: Some(metrics.clone()),
            results: None,
        });

        registry.admit(config(&addr)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.withdraw(&addr).await);
        assert!(!metrics.encode().unwrap().contains(&format!("target=\"{}\"", addr)));

        registry.admit(config(&addr)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(metrics.encode().unwrap().contains(&format!("target=\"{}\"", addr)));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_withdraw_does_not_affect_others() {
        let registry = TargetRegistry::new(RoundSinks::default());
        let a = registry.admit(config("127.0.0.1:9")).await.unwrap();
        let b = registry.admit(config("127.0.0.1:10")).await.unwrap();

        registry.withdraw("127.0.0.1:9").await;
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(b.is_alive());
        assert_eq!(
            registry.snapshot().await,
            BTreeSet::from(["127.0.0.1:10".to_string()])
        );
        registry.shutdown().await;
    }
}
