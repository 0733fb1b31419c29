//! Target discovery from workload annotations.
//!
//! A [`DiscoveryReconciler`] periodically lists workloads from a
//! [`WorkloadInventory`], derives probe targets from the annotations of the
//! ready ones and brings the [`TargetRegistry`] in line: new targets are
//! admitted, targets whose workload (or annotation) disappeared are
//! withdrawn. Only targets admitted by the reconciler are ever withdrawn by
//! it.

#[cfg(feature = "k8s")]
mod k8s;

#[cfg(feature = "k8s")]
pub use k8s::KubeInventory;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::probe::ProbeConfig;
use crate::scheduler::{RegistryError, TargetRegistry};

pub const TARGETS_ANNOTATION: &str = "tcptrail/targets";
pub const INTERVAL_ANNOTATION: &str = "tcptrail/interval";
pub const LABELS_ANNOTATION: &str = "tcptrail/labels";

/// Discovery error types.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("inventory client error: {0}")]
    Client(String),
    #[error("inventory list failed: {0}")]
    List(String),
}

/// A workload as reported by the inventory.
#[derive(Debug, Clone, Default)]
pub struct Workload {
    pub name: String,
    pub namespace: String,
    pub ready: bool,
    pub annotations: BTreeMap<String, String>,
}

/// Read access to the current set of workloads in scope.
pub trait WorkloadInventory: Send + Sync + 'static {
    /// List workloads in `namespace`, or in every namespace when `None`.
    fn list(
        &self,
        namespace: Option<&str>,
    ) -> impl Future<Output = Result<Vec<Workload>, DiscoveryError>> + Send;
}

/// One target derived from a workload's annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTarget {
    pub addr: String,
    pub interval: Option<Duration>,
    pub labels: BTreeMap<String, String>,
}

/// Extract targets from a workload's annotations.
///
/// No targets annotation means nothing to probe. A malformed interval or
/// labels value is logged and replaced by the default.
pub fn parse_annotations(workload: &Workload) -> Vec<DiscoveredTarget> {
    let Some(targets) = workload.annotations.get(TARGETS_ANNOTATION) else {
        return Vec::new();
    };

    let interval = workload.annotations.get(INTERVAL_ANNOTATION).and_then(|raw| {
        match humantime::parse_duration(raw.trim()) {
            Ok(d) if !d.is_zero() => Some(d),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(
                    "Discovery: Bad interval {:?} on {}/{}: {}",
                    raw,
                    workload.namespace,
                    workload.name,
                    e
                );
                None
            }
        }
    });

    let labels = workload
        .annotations
        .get(LABELS_ANNOTATION)
        .map(|raw| {
            serde_json::from_str::<BTreeMap<String, String>>(raw).unwrap_or_else(|e| {
                tracing::warn!(
                    "Discovery: Bad labels on {}/{}: {}",
                    workload.namespace,
                    workload.name,
                    e
                );
                BTreeMap::new()
            })
        })
        .unwrap_or_default();

    targets
        .split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(|addr| DiscoveredTarget {
            addr: addr.to_string(),
            interval,
            labels: labels.clone(),
        })
        .collect()
}

/// What one reconciliation pass changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub admitted: Vec<String>,
    pub withdrawn: Vec<String>,
}

/// Keeps the registry in line with the workload inventory.
pub struct DiscoveryReconciler<I> {
    inventory: I,
    registry: TargetRegistry,
    base: ProbeConfig,
    namespace: Option<String>,
    owned: BTreeSet<String>,
}

impl<I: WorkloadInventory> DiscoveryReconciler<I> {
    /// `base` supplies everything but target, interval and labels for
    /// discovered targets.
    pub fn new(
        inventory: I,
        registry: TargetRegistry,
        base: ProbeConfig,
        namespace: Option<String>,
    ) -> Self {
        Self {
            inventory,
            registry,
            base,
            namespace,
            owned: BTreeSet::new(),
        }
    }

    /// Identities currently admitted by this reconciler.
    pub fn owned(&self) -> &BTreeSet<String> {
        &self.owned
    }

    /// Run one pass: list, diff, admit and withdraw.
    ///
    /// A failed listing changes nothing.
    pub async fn reconcile(&mut self) -> Result<ReconcileSummary, DiscoveryError> {
        let workloads = self.inventory.list(self.namespace.as_deref()).await?;

        let mut desired: BTreeMap<String, ProbeConfig> = BTreeMap::new();
        for workload in workloads.iter().filter(|w| w.ready) {
            for target in parse_annotations(workload) {
                let mut config = self.base.for_target(&target.addr, target.interval, target.labels);
                config.count = 0;
                config.namespace = Some(workload.namespace.clone());
                desired.entry(config.identity().to_string()).or_insert(config);
            }
        }

        let mut summary = ReconcileSummary::default();

        let gone: Vec<String> = self
            .owned
            .iter()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for identity in gone {
            self.owned.remove(&identity);
            if self.registry.withdraw(&identity).await {
                tracing::info!("Discovery: Withdrew {}", identity);
                summary.withdrawn.push(identity);
            }
        }

        let active = self.registry.snapshot().await;
        for (identity, config) in desired {
            if active.contains(&identity) {
                continue;
            }
            match self.registry.admit(config).await {
                Ok(_) => {
                    tracing::info!("Discovery: Admitted {}", identity);
                    self.owned.insert(identity.clone());
                    summary.admitted.push(identity);
                }
                Err(RegistryError::AlreadyAdmitted(_)) => {
                    tracing::warn!("Discovery: {} is already being probed", identity);
                }
                Err(RegistryError::ShuttingDown) => break,
            }
        }

        Ok(summary)
    }

    /// Reconcile every `period` until `cancel` fires.
    pub async fn run(mut self, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.reconcile().await {
                Ok(summary) => {
                    if !summary.admitted.is_empty() || !summary.withdrawn.is_empty() {
                        tracing::debug!(
                            "Discovery: +{} -{} targets",
                            summary.admitted.len(),
                            summary.withdrawn.len()
                        );
                    }
                }
                Err(e) => tracing::warn!("Discovery: {}", e),
            }
        }

        tracing::info!("Discovery stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::RoundSinks;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MemoryInventory {
        workloads: Arc<Mutex<Vec<Workload>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl MemoryInventory {
        fn set(&self, workloads: Vec<Workload>) {
            *self.workloads.lock().unwrap() = workloads;
        }
    }

    impl WorkloadInventory for MemoryInventory {
        async fn list(&self, namespace: Option<&str>) -> Result<Vec<Workload>, DiscoveryError> {
            if *self.fail.lock().unwrap() {
                return Err(DiscoveryError::List("unavailable".to_string()));
            }
            Ok(self
                .workloads
                .lock()
                .unwrap()
                .iter()
                .filter(|w| namespace.map_or(true, |ns| ns == w.namespace))
                .cloned()
                .collect())
        }
    }

    fn pod(name: &str, annotations: &[(&str, &str)]) -> Workload {
        Workload {
            name: name.to_string(),
            namespace: "default".to_string(),
            ready: true,
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn base() -> ProbeConfig {
        ProbeConfig {
            quiet: true,
            count: 5,
            interval: Duration::from_secs(3600),
            timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn reconciler(
        inventory: &MemoryInventory,
    ) -> (DiscoveryReconciler<MemoryInventory>, TargetRegistry) {
        let registry = TargetRegistry::new(RoundSinks::default());
        let r = DiscoveryReconciler::new(
            inventory.clone(),
            registry.clone(),
            base(),
            Some("default".to_string()),
        );
        (r, registry)
    }

    #[test]
    fn test_parse_full_annotations() {
        let targets = parse_annotations(&pod(
            "fake",
            &[
                (TARGETS_ANNOTATION, "https://a.example, 10.0.0.1:80"),
                (INTERVAL_ANNOTATION, "6s"),
                (LABELS_ANNOTATION, r#"{"mykey":"myvalue"}"#),
            ],
        ));
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].addr, "https://a.example");
        assert_eq!(targets[1].addr, "10.0.0.1:80");
        assert_eq!(targets[0].interval, Some(Duration::from_secs(6)));
        assert_eq!(targets[1].labels.get("mykey").map(String::as_str), Some("myvalue"));
    }

    #[test]
    fn test_parse_malformed_values_default() {
        let targets = parse_annotations(&pod(
            "fake",
            &[
                (TARGETS_ANNOTATION, "10.0.0.1"),
                (INTERVAL_ANNOTATION, "soon"),
                (LABELS_ANNOTATION, "{not json"),
            ],
        ));
        assert_eq!(
            targets,
            vec![DiscoveredTarget {
                addr: "10.0.0.1".to_string(),
                interval: None,
                labels: BTreeMap::new(),
            }]
        );
    }

    #[test]
    fn test_parse_without_targets() {
        assert!(parse_annotations(&pod("fake", &[(INTERVAL_ANNOTATION, "6s")])).is_empty());
        assert!(parse_annotations(&pod("fake", &[(TARGETS_ANNOTATION, " , ")])).is_empty());
    }

    #[tokio::test]
    async fn test_address_only_uses_defaults() {
        let inventory = MemoryInventory::default();
        inventory.set(vec![pod("fake", &[(TARGETS_ANNOTATION, "127.0.0.1:9")])]);
        let (mut r, registry) = reconciler(&inventory);

        let summary = r.reconcile().await.unwrap();
        assert_eq!(summary.admitted, vec!["127.0.0.1:9".to_string()]);

        let handle = registry.get("127.0.0.1:9").await.unwrap();
        assert_eq!(handle.config().interval, Duration::from_secs(3600));
        assert!(handle.config().labels.is_empty());
        assert_eq!(handle.config().count, 0);
        assert_eq!(handle.config().namespace.as_deref(), Some("default"));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_removed_workload_is_withdrawn() {
        let inventory = MemoryInventory::default();
        inventory.set(vec![pod("fake", &[(TARGETS_ANNOTATION, "127.0.0.1:9")])]);
        let (mut r, registry) = reconciler(&inventory);

        r.reconcile().await.unwrap();
        let handle = registry.get("127.0.0.1:9").await.unwrap();

        inventory.set(Vec::new());
        let summary = r.reconcile().await.unwrap();
        assert_eq!(summary.withdrawn, vec!["127.0.0.1:9".to_string()]);
        assert!(handle.is_cancelled());
        assert!(registry.snapshot().await.is_empty());
        assert!(r.owned().is_empty());
    }

    #[tokio::test]
    async fn test_removed_annotation_is_withdrawn() {
        let inventory = MemoryInventory::default();
        inventory.set(vec![pod("fake", &[(TARGETS_ANNOTATION, "127.0.0.1:9")])]);
        let (mut r, registry) = reconciler(&inventory);
        r.reconcile().await.unwrap();

        inventory.set(vec![pod("fake", &[])]);
        r.reconcile().await.unwrap();
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_not_running_is_skipped() {
        let inventory = MemoryInventory::default();
        let mut pending = pod("fake", &[(TARGETS_ANNOTATION, "127.0.0.1:9")]);
        pending.ready = false;
        inventory.set(vec![pending]);
        let (mut r, registry) = reconciler(&inventory);

        assert_eq!(r.reconcile().await.unwrap(), ReconcileSummary::default());
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_static_target_is_left_alone() {
        let inventory = MemoryInventory::default();
        inventory.set(vec![pod("fake", &[(TARGETS_ANNOTATION, "127.0.0.1:9")])]);
        let (mut r, registry) = reconciler(&inventory);
        let static_handle = registry
            .admit(base().for_target("127.0.0.1:9", None, BTreeMap::new()))
            .await
            .unwrap();

        let summary = r.reconcile().await.unwrap();
        assert!(summary.admitted.is_empty());
        assert!(r.owned().is_empty());

        inventory.set(Vec::new());
        r.reconcile().await.unwrap();
        assert!(!static_handle.is_cancelled());
        assert_eq!(registry.len().await, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_list_failure_changes_nothing() {
        let inventory = MemoryInventory::default();
        inventory.set(vec![pod("fake", &[(TARGETS_ANNOTATION, "127.0.0.1:9")])]);
        let (mut r, registry) = reconciler(&inventory);
        r.reconcile().await.unwrap();

        *inventory.fail.lock().unwrap() = true;
        assert!(r.reconcile().await.is_err());
        assert_eq!(registry.len().await, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_other_namespace_is_ignored() {
        let inventory = MemoryInventory::default();
        let mut other = pod("fake", &[(TARGETS_ANNOTATION, "127.0.0.1:9")]);
        other.namespace = "kube-system".to_string();
        inventory.set(vec![other]);
        let (mut r, registry) = reconciler(&inventory);

        r.reconcile().await.unwrap();
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let inventory = MemoryInventory::default();
        inventory.set(vec![pod("fake", &[(TARGETS_ANNOTATION, "127.0.0.1:9")])]);
        let (r, registry) = reconciler(&inventory);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(r.run(Duration::from_millis(20), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.len().await, 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        registry.shutdown().await;
    }
}
