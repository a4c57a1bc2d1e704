//! Bounded polling and the pod readiness waiter
//!
//! A pod start is waited for in three phases, always in this order:
//!
//! 1. scheduling: skipped when the pod already runs, otherwise until the pod
//!    leaves `Pending`
//! 2. downloading images: until the pod is `Running`
//! 3. starting: until the `Ready` condition is true
//!
//! Each phase has its own bound. Exceeding it fails the wait with
//! [`Error::Timeout`]; nothing is retried at this layer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::cluster::{ConditionStatus, PodPhase};
use crate::config::Timeouts;
use crate::probe::ClusterProbe;
use crate::task::{Task, TaskList};
use crate::Error;

/// Phase name for the scheduling wait
pub const PHASE_SCHEDULING: &str = "scheduling";
/// Phase name for the image download wait
pub const PHASE_DOWNLOADING: &str = "downloading images";
/// Phase name for the readiness wait
pub const PHASE_STARTING: &str = "starting";
/// Phase name for the pod deletion wait
pub const PHASE_DELETION: &str = "pod deletion";

/// Poll until a condition is met or timeout is reached
///
/// `check_fn` returns `Ok(true)` when the condition is met and `Ok(false)` to
/// keep polling. Transient errors (see [`Error::is_transient`]) are logged at
/// trace level and polling continues; any other error ends the wait at once.
/// The condition is always checked at least once, and once more at the
/// deadline.
pub async fn poll_until<F, Fut, T>(
    timeout: Duration,
    poll_interval: Duration,
    on_timeout: T,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
    T: FnOnce() -> Error,
{
    let deadline = Instant::now() + timeout;

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("Polling condition not yet met, retrying..."),
            Err(e) if e.is_transient() => {
                trace!("Polling check returned error (retrying): {}", e)
            }
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(on_timeout());
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

/// Waits on pod sets through the cluster probe
#[derive(Clone)]
pub struct PodWaiter {
    probe: ClusterProbe,
    timeouts: Arc<Timeouts>,
}

impl PodWaiter {
    /// Waiter bounded by `timeouts`
    pub fn new(probe: ClusterProbe, timeouts: Timeouts) -> Self {
        Self {
            probe,
            timeouts: Arc::new(timeouts),
        }
    }

    /// Wait bounds in use
    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Phase 1: wait for the pod to be placed
    pub async fn wait_scheduled(&self, selector: &str, namespace: &str) -> Result<(), Error> {
        // A transient lookup failure just means we have to wait
        match self.probe.pod_phase(selector, namespace).await {
            Ok(PodPhase::Running) => {
                debug!(selector, "pod already running, nothing to schedule");
                return Ok(());
            }
            Err(e) if !e.is_transient() => return Err(e),
            _ => {}
        }
        poll_until(
            self.timeouts.pod_wait,
            self.timeouts.poll_interval,
            || Error::timeout(PHASE_SCHEDULING, selector, namespace, self.timeouts.pod_wait),
            || async {
                let phase = self.probe.pod_phase(selector, namespace).await?;
                Ok(!matches!(phase, PodPhase::Unknown | PodPhase::Pending))
            },
        )
        .await
    }

    /// Phase 2: wait for the pod to run, spanning image pulls
    pub async fn wait_running(&self, selector: &str, namespace: &str) -> Result<(), Error> {
        poll_until(
            self.timeouts.pod_download,
            self.timeouts.poll_interval,
            || Error::timeout(PHASE_DOWNLOADING, selector, namespace, self.timeouts.pod_download),
            || async { Ok(self.probe.pod_phase(selector, namespace).await? == PodPhase::Running) },
        )
        .await
    }

    /// Phase 3: wait for the Ready condition
    pub async fn wait_ready(&self, selector: &str, namespace: &str) -> Result<(), Error> {
        poll_until(
            self.timeouts.pod_ready,
            self.timeouts.poll_interval,
            || Error::timeout(PHASE_STARTING, selector, namespace, self.timeouts.pod_ready),
            || async {
                Ok(self.probe.ready_condition_status(selector, namespace).await?
                    == ConditionStatus::True)
            },
        )
        .await
    }

    /// All three phases in order
    pub async fn wait_for_pod_start(&self, selector: &str, namespace: &str) -> Result<(), Error> {
        self.wait_scheduled(selector, namespace).await?;
        self.wait_running(selector, namespace).await?;
        self.wait_ready(selector, namespace).await?;
        debug!(selector, namespace, "pod ready");
        Ok(())
    }

    /// Wait until no pod matches the selector
    pub async fn wait_until_pods_deleted(
        &self,
        selector: &str,
        namespace: &str,
    ) -> Result<(), Error> {
        poll_until(
            self.timeouts.pod_delete,
            self.timeouts.poll_interval,
            || Error::timeout(PHASE_DELETION, selector, namespace, self.timeouts.pod_delete),
            || async { Ok(!self.probe.pods_exist(selector, namespace).await?) },
        )
        .await
    }

    /// The three phases as tasks, each titled `<phase>...done.` on success
    pub fn pod_start_tasks<C: Send + 'static>(&self, selector: &str, namespace: &str) -> TaskList<C> {
        let scheduling = {
            let (waiter, selector, namespace) = self.owned(selector, namespace);
            Task::new(PHASE_SCHEDULING, move |_ctx: &mut C, title| {
                let (waiter, selector, namespace) =
                    (waiter.clone(), selector.clone(), namespace.clone());
                Box::pin(async move {
                    waiter.wait_scheduled(&selector, &namespace).await?;
                    title.append("done.");
                    Ok(())
                })
            })
        };
        let downloading = {
            let (waiter, selector, namespace) = self.owned(selector, namespace);
            Task::new(PHASE_DOWNLOADING, move |_ctx: &mut C, title| {
                let (waiter, selector, namespace) =
                    (waiter.clone(), selector.clone(), namespace.clone());
                Box::pin(async move {
                    waiter.wait_running(&selector, &namespace).await?;
                    title.append("done.");
                    Ok(())
                })
            })
        };
        let starting = {
            let (waiter, selector, namespace) = self.owned(selector, namespace);
            Task::new(PHASE_STARTING, move |_ctx: &mut C, title| {
                let (waiter, selector, namespace) =
                    (waiter.clone(), selector.clone(), namespace.clone());
                Box::pin(async move {
                    waiter.wait_ready(&selector, &namespace).await?;
                    title.append("done.");
                    Ok(())
                })
            })
        };
        TaskList::new().add(scheduling).add(downloading).add(starting)
    }

    fn owned(&self, selector: &str, namespace: &str) -> (PodWaiter, String, String) {
        (self.clone(), selector.to_string(), namespace.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MockClusterTransport, CONDITION_READY};
    use crate::context::WorkloadKind;
    use crate::task::{RecordingRenderer, SilentRenderer};
    use crate::testing::{FakeCluster, PodBehavior};
    use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NS: &str = "che";
    const SEL: &str = "app=che,component=postgres";

    fn fast() -> Timeouts {
        Timeouts {
            pod_wait: Duration::from_millis(60),
            pod_download: Duration::from_millis(60),
            pod_ready: Duration::from_millis(60),
            pod_delete: Duration::from_millis(60),
            server_boot: Duration::from_millis(60),
            shutdown: Duration::from_millis(60),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn waiter(transport: impl crate::cluster::ClusterTransport + 'static) -> PodWaiter {
        PodWaiter::new(ClusterProbe::new(Arc::new(transport)), fast())
    }

    fn api_blip() -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "etcdserver: request timed out".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        }))
    }

    fn running_ready_pod() -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: CONDITION_READY.to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn phase_of(err: &Error) -> Option<&str> {
        match err {
            Error::Timeout { phase, .. } => Some(phase),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_poll_until_succeeds_eventually() {
        let calls = AtomicUsize::new(0);
        let result = poll_until(
            Duration::from_secs(1),
            Duration::from_millis(1),
            || Error::timeout("x", "s", "n", Duration::from_secs(1)),
            || async { Ok(calls.fetch_add(1, Ordering::SeqCst) >= 2) },
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let result = poll_until(
            Duration::from_millis(20),
            Duration::from_millis(5),
            || Error::timeout("ready", "app=x", "ns", Duration::from_millis(20)),
            || async { Ok(false) },
        )
        .await;
        assert_eq!(phase_of(&result.unwrap_err()), Some("ready"));
    }

    #[tokio::test]
    async fn test_poll_until_swallows_transient_errors() {
        let calls = AtomicUsize::new(0);
        let result = poll_until(
            Duration::from_secs(1),
            Duration::from_millis(1),
            || Error::timeout("x", "s", "n", Duration::from_secs(1)),
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(api_blip())
                } else {
                    Ok(true)
                }
            },
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_poll_until_stops_on_hard_error() {
        let calls = AtomicUsize::new(0);
        let result = poll_until(
            Duration::from_secs(1),
            Duration::from_millis(1),
            || Error::timeout("x", "s", "n", Duration::from_secs(1)),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::coordination("no"))
            },
        )
        .await;
        assert!(matches!(result, Err(Error::Coordination { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_running_pod_skips_scheduling_poll() {
        let mut mock = MockClusterTransport::new();
        mock.expect_list_pods()
            .times(1)
            .returning(|_, _| Ok(vec![running_ready_pod()]));
        waiter(mock).wait_scheduled(SEL, NS).await.unwrap();
    }

    #[tokio::test]
    async fn test_stuck_pending_times_out_in_scheduling() {
        let cluster = FakeCluster::new(NS).with_workload_behavior(
            WorkloadKind::Deployment,
            "postgres",
            SEL,
            1,
            PodBehavior::StuckPending,
        );
        let err = waiter(cluster).wait_for_pod_start(SEL, NS).await.unwrap_err();
        assert_eq!(phase_of(&err), Some(PHASE_SCHEDULING));
        match err {
            Error::Timeout {
                selector,
                namespace,
                ..
            } => {
                assert_eq!(selector, SEL);
                assert_eq!(namespace, NS);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stuck_pending_never_reaches_later_phases() {
        let cluster = FakeCluster::new(NS).with_workload_behavior(
            WorkloadKind::Deployment,
            "postgres",
            SEL,
            1,
            PodBehavior::StuckPending,
        );
        let recorder = RecordingRenderer::default();
        let tasks = waiter(cluster).pod_start_tasks::<()>(SEL, NS);
        assert!(tasks.run((), &recorder).await.is_err());
        assert_eq!(
            recorder.events(),
            vec!["start:0:scheduling", "fail:0:scheduling"]
        );
    }

    #[tokio::test]
    async fn test_never_ready_times_out_in_starting() {
        let cluster = FakeCluster::new(NS).with_workload_behavior(
            WorkloadKind::Deployment,
            "postgres",
            SEL,
            1,
            PodBehavior::NeverReady,
        );
        let err = waiter(cluster).wait_for_pod_start(SEL, NS).await.unwrap_err();
        assert_eq!(phase_of(&err), Some(PHASE_STARTING));
    }

    #[tokio::test]
    async fn test_healthy_pod_titles() {
        let cluster =
            FakeCluster::new(NS).with_workload(WorkloadKind::Deployment, "postgres", SEL, 1);
        let recorder = RecordingRenderer::default();
        waiter(cluster)
            .pod_start_tasks::<()>(SEL, NS)
            .run((), &recorder)
            .await
            .unwrap();
        let done: Vec<String> = recorder
            .events()
            .into_iter()
            .filter(|e| e.starts_with("done:"))
            .collect();
        assert_eq!(
            done,
            vec![
                "done:0:scheduling...done.",
                "done:0:downloading images...done.",
                "done:0:starting...done.",
            ]
        );
    }

    #[tokio::test]
    async fn test_scheduling_tolerates_transient_errors() {
        let mut mock = MockClusterTransport::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        mock.expect_list_pods().returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(api_blip())
            } else {
                Ok(vec![running_ready_pod()])
            }
        });
        waiter(mock).wait_scheduled(SEL, NS).await.unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_scheduling_fails_fast_on_forbidden() {
        let mut mock = MockClusterTransport::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        mock.expect_list_pods().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::connectivity(
                "list pods: pods is forbidden (403 Forbidden)",
            ))
        });
        let err = waiter(mock).wait_scheduled(SEL, NS).await.unwrap_err();
        assert!(matches!(err, Error::Connectivity { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_until_pods_deleted() {
        let cluster =
            FakeCluster::new(NS).with_workload(WorkloadKind::Deployment, "postgres", SEL, 0);
        waiter(cluster).wait_until_pods_deleted(SEL, NS).await.unwrap();

        let running =
            FakeCluster::new(NS).with_workload(WorkloadKind::Deployment, "postgres", SEL, 1);
        let err = waiter(running)
            .wait_until_pods_deleted(SEL, NS)
            .await
            .unwrap_err();
        assert_eq!(phase_of(&err), Some(PHASE_DELETION));
    }

    #[tokio::test]
    async fn test_silent_run_of_tasks() {
        let cluster =
            FakeCluster::new(NS).with_workload(WorkloadKind::Deployment, "postgres", SEL, 1);
        let tasks = waiter(cluster).pod_start_tasks::<u8>(SEL, NS);
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks.run(7, &SilentRenderer).await.unwrap(), 7);
    }
}
