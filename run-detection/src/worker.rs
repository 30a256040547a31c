use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use health::{ComponentStatus, HealthHandle};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Egress, Ingress, IngressMessage};
use crate::detection::{parse_payload, Detector};
use crate::error::{BrokerError, DetectionError};
use crate::job_request::JobRequest;
use crate::metric_consts::{
    MESSAGES_ACKED, MESSAGES_RECEIVED, MESSAGES_REJECTED, MESSAGES_REQUEUED, PROCESSING_TIME,
    RECV_ERRORS, SETTLE_ERRORS, WORKER_SATURATION,
};
use crate::retry::RetryPolicy;

/// Settle calls made for one message before it is given up on.
pub const SETTLE_ATTEMPTS: u32 = 3;
const SETTLE_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// How one ingress message was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Acknowledged, after publishing its job requests if the run is to be reduced.
    Acked { published: bool },
    /// Handed back to the broker for another delivery after `delay`.
    Requeued { delay: Duration },
    /// Removed without publishing anything.
    Rejected { reason: String },
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Acked { .. } => "acked",
            Outcome::Requeued { .. } => "requeued",
            Outcome::Rejected { .. } => "rejected",
        }
    }
}

/// What is known about the run behind a message, for the settlement logs.
#[derive(Debug, Default)]
struct RunContext {
    path: String,
    instrument: Option<String>,
    run_number: Option<i64>,
}

impl RunContext {
    fn instrument(&self) -> &str {
        self.instrument.as_deref().unwrap_or("unknown")
    }

    fn run_number(&self) -> String {
        self.run_number
            .map_or_else(|| "unknown".to_owned(), |run| run.to_string())
    }
}

/// The [`Outcome`] a message is headed for, before it is settled.
#[derive(Debug)]
pub struct Decision {
    pub outcome: Outcome,
    run: RunContext,
    /// Label of the rejection counter.
    cause: &'static str,
}

/// Consumes ingress messages and drives each through detection to one [`Outcome`].
pub struct RunDetectionWorker<I: Ingress, E: Egress> {
    ingress: I,
    egress: Arc<E>,
    detector: Arc<Detector>,
    /// How long to wait for a message before reporting liveness again.
    poll_interval: Duration,
    /// Messages detected and published at the same time. Backoff and settling happen
    /// outside of this limit.
    max_concurrent_messages: usize,
    /// Deliveries after which a retryable failure is rejected instead.
    max_delivery_count: u32,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
    /// How long in-flight messages get to settle once the worker stops receiving.
    drain_timeout: Duration,
    /// Set for good once a message could not be settled.
    settle_failed: Arc<AtomicBool>,
}

impl<I: Ingress, E: Egress> RunDetectionWorker<I, E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ingress: I,
        egress: Arc<E>,
        detector: Arc<Detector>,
        poll_interval: Duration,
        max_concurrent_messages: usize,
        max_delivery_count: u32,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            ingress,
            egress,
            detector,
            poll_interval,
            max_concurrent_messages: max_concurrent_messages.max(1),
            max_delivery_count: max_delivery_count.max(1),
            retry_policy,
            liveness,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            settle_failed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// A message that cannot be settled holds back its partition for good, so the
    /// worker stops reporting healthy and gets restarted.
    fn report_liveness(&self) {
        if self.settle_failed.load(Ordering::SeqCst) {
            self.liveness.report_status(ComponentStatus::Unhealthy);
        } else {
            self.liveness.report_healthy();
        }
    }

    /// Process messages until the ingress closes or `shutdown` is cancelled, then
    /// give in-flight messages up to the drain timeout to settle.
    ///
    /// A failing message never stops the loop; its outcome is logged and counted.
    pub async fn run(&self, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_messages));
        let report_semaphore_utilization = || {
            metrics::gauge!(WORKER_SATURATION).set(
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_messages as f64,
            );
        };
        let mut tasks = JoinSet::new();

        loop {
            report_semaphore_utilization();
            self.report_liveness();

            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, no longer receiving");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_task_failure(joined);
                    continue;
                }
                received = tokio::time::timeout(self.poll_interval, self.ingress.recv()) => received,
            };
            let message = match received {
                Err(_) => continue,
                Ok(Ok(message)) => message,
                Ok(Err(BrokerError::Closed)) => {
                    info!("ingress closed");
                    break;
                }
                Ok(Err(e)) => {
                    metrics::counter!(RECV_ERRORS).increment(1);
                    error!("failed to receive message: {}", e);
                    continue;
                }
            };
            metrics::counter!(MESSAGES_RECEIVED).increment(1);

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    // Unsettled, so the broker delivers it again
                    info!("shutdown requested, leaving received message unsettled");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    // Only closed by us, never happens while looping
                    Err(_) => break,
                },
            };
            let egress = self.egress.clone();
            let detector = self.detector.clone();
            let retry_policy = self.retry_policy.clone();
            let max_delivery_count = self.max_delivery_count;
            let settle_failed = self.settle_failed.clone();
            let task_shutdown = shutdown.clone();

            tasks.spawn(async move {
                let decision = decide(
                    &detector,
                    egress.as_ref(),
                    &message,
                    max_delivery_count,
                    &retry_policy,
                )
                .await;
                // Backoff and settling must not hold up intake
                drop(permit);

                if let Err(e) = settle(&message, decision, &task_shutdown).await {
                    metrics::counter!(SETTLE_ERRORS).increment(1);
                    error!("failed to settle message, reporting unhealthy: {}", e);
                    settle_failed.store(true, Ordering::SeqCst);
                }
            });
        }

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "waiting for in-flight messages to settle");
        }
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                log_task_failure(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                abandoned = tasks.len(),
                "in-flight messages did not settle within {:?}", self.drain_timeout
            );
            tasks.shutdown().await;
        }
        info!("worker stopped");
    }
}

fn log_task_failure(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!("message task failed: {}", e);
    }
}

/// Run one message from RECEIVED to its final state without a surrounding worker.
pub async fn process_message<M: IngressMessage, E: Egress + ?Sized>(
    detector: &Detector,
    egress: &E,
    message: &M,
    max_delivery_count: u32,
    retry_policy: &RetryPolicy,
) -> Result<Outcome, BrokerError> {
    let decision = decide(detector, egress, message, max_delivery_count, retry_policy).await;
    settle(message, decision, &CancellationToken::new()).await
}

/// Detect the run behind `message` and publish its job requests if it is to be
/// reduced, deciding how the message must be settled.
///
/// Job requests are published before the message is acknowledged, so a crash in
/// between leads to a duplicate job rather than a lost one.
pub async fn decide<M: IngressMessage, E: Egress + ?Sized>(
    detector: &Detector,
    egress: &E,
    message: &M,
    max_delivery_count: u32,
    retry_policy: &RetryPolicy,
) -> Decision {
    let timing = common_metrics::timing_guard(PROCESSING_TIME);
    let delivery_count = message.delivery_count();
    let mut run = RunContext {
        path: payload_text(message.payload()),
        ..RunContext::default()
    };

    let detected = match parse_payload(message.payload()) {
        Ok(path) => detector.detect(&path).await,
        Err(e) => Err(e),
    };

    let decision = match detected {
        Ok(job_request) => {
            run.instrument = Some(job_request.instrument.clone());
            run.run_number = Some(job_request.run_number);

            if !job_request.will_reduce {
                Decision {
                    outcome: Outcome::Acked { published: false },
                    run,
                    cause: "none",
                }
            } else if let Err(e) = publish_all(egress, &job_request).await {
                let reason = format!("failed to publish job request: {e}");
                warn!(
                    path = %run.path,
                    instrument = run.instrument(),
                    run_number = %run.run_number(),
                    "{}", reason
                );
                let retry = Redelivery {
                    delivery_count,
                    max_delivery_count,
                    retry_policy,
                };
                retry.decide(run, true, reason, "publish")
            } else {
                Decision {
                    outcome: Outcome::Acked { published: true },
                    run,
                    cause: "none",
                }
            }
        }
        Err(e) => {
            log_failure(&e, &run.path, delivery_count);
            run.instrument = e.instrument().map(str::to_owned);
            run.run_number = e.run_number();
            let retry = Redelivery {
                delivery_count,
                max_delivery_count,
                retry_policy,
            };
            retry.decide(run, e.is_retryable(), e.to_string(), e.cause())
        }
    };

    timing.label("outcome", decision.outcome.label()).fin();
    decision
}

/// The run itself, then every stitched request it carries.
async fn publish_all<E: Egress + ?Sized>(
    egress: &E,
    job_request: &JobRequest,
) -> Result<(), BrokerError> {
    egress.publish(job_request).await?;
    for additional in &job_request.additional_requests {
        egress.publish(additional).await?;
    }
    Ok(())
}

struct Redelivery<'a> {
    delivery_count: u32,
    max_delivery_count: u32,
    retry_policy: &'a RetryPolicy,
}

impl Redelivery<'_> {
    /// Requeue a retryable failure while deliveries remain, reject everything else.
    fn decide(
        &self,
        run: RunContext,
        retryable: bool,
        reason: String,
        cause: &'static str,
    ) -> Decision {
        let outcome = if retryable && self.delivery_count < self.max_delivery_count {
            Outcome::Requeued {
                delay: self.retry_policy.retry_interval(self.delivery_count),
            }
        } else if retryable {
            Outcome::Rejected {
                reason: format!(
                    "giving up after {} deliveries: {}",
                    self.delivery_count, reason
                ),
            }
        } else {
            Outcome::Rejected { reason }
        };
        Decision {
            outcome,
            run,
            cause,
        }
    }
}

/// Settle `message` as decided, retrying a failing settle a few times.
///
/// A requeue waits out its backoff first, unless `shutdown` is cancelled meanwhile.
/// Every settled message is logged with what is known about its run, and counted.
pub async fn settle<M: IngressMessage>(
    message: &M,
    decision: Decision,
    shutdown: &CancellationToken,
) -> Result<Outcome, BrokerError> {
    let Decision {
        outcome,
        run,
        cause,
    } = decision;
    let delivery_count = message.delivery_count();

    match &outcome {
        Outcome::Acked { published } => {
            with_settle_retries(move || message.ack()).await?;
            metrics::counter!(MESSAGES_ACKED, "published" => published.to_string()).increment(1);
            if *published {
                info!(
                    instrument = run.instrument(),
                    run_number = %run.run_number(),
                    path = %run.path,
                    "published job request"
                );
            } else {
                info!(
                    instrument = run.instrument(),
                    run_number = %run.run_number(),
                    path = %run.path,
                    "run will not be reduced, skipping"
                );
            }
        }
        Outcome::Requeued { delay } => {
            warn!(
                instrument = run.instrument(),
                run_number = %run.run_number(),
                path = %run.path,
                delivery_count,
                delay_ms = delay.as_millis() as u64,
                "requeueing message"
            );
            tokio::select! {
                _ = tokio::time::sleep(*delay) => {}
                _ = shutdown.cancelled() => debug!("shutting down, requeueing without backoff"),
            }
            with_settle_retries(move || message.requeue()).await?;
            metrics::counter!(MESSAGES_REQUEUED).increment(1);
        }
        Outcome::Rejected { reason } => {
            error!(
                instrument = run.instrument(),
                run_number = %run.run_number(),
                path = %run.path,
                delivery_count,
                cause,
                "rejecting message: {}", reason
            );
            with_settle_retries(move || message.reject(reason)).await?;
            metrics::counter!(MESSAGES_REJECTED, "cause" => cause).increment(1);
        }
    }
    Ok(outcome)
}

async fn with_settle_retries<F, Fut>(mut settle: F) -> Result<(), BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), BrokerError>>,
{
    let mut interval = SETTLE_RETRY_INTERVAL;
    let mut attempt = 1;
    loop {
        match settle().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < SETTLE_ATTEMPTS => {
                warn!(attempt, "failed to settle message, retrying: {}", e);
                tokio::time::sleep(interval).await;
                interval *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn payload_text(payload: Option<&[u8]>) -> String {
    payload
        .map(String::from_utf8_lossy)
        .unwrap_or_default()
        .trim()
        .to_owned()
}

fn log_failure(error: &DetectionError, path: &str, delivery_count: u32) {
    let instrument = error.instrument().unwrap_or("unknown");
    let run_number = error
        .run_number()
        .map_or_else(|| "unknown".to_owned(), |run| run.to_string());

    if error.is_retryable() {
        warn!(%path, instrument, %run_number, delivery_count, "detection failed: {}", error);
    } else {
        error!(%path, instrument, %run_number, delivery_count, "detection failed: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Instant;

    use health::HealthRegistry;
    use serde_json::json;

    use super::*;
    use crate::container::JsonTreeOpener;
    use crate::specification::DirectorySpecificationStore;
    use crate::test_utils::{
        run_entry, write_run_file, write_specification, MemoryEgress, MemoryIngress,
        MemoryMessage, Settlement,
    };

    fn detector(specifications: &Path) -> Detector {
        Detector::new(
            Arc::new(JsonTreeOpener),
            Arc::new(DirectorySpecificationStore::new(specifications)),
        )
    }

    fn fast_retries() -> RetryPolicy {
        RetryPolicy::build(2, Duration::from_millis(1))
            .maximum_interval(Duration::from_millis(5))
            .provide()
    }

    fn slow_retries() -> RetryPolicy {
        RetryPolicy::build(1, Duration::from_millis(1500)).provide()
    }

    fn payload(path: &Path) -> Vec<u8> {
        path.display().to_string().into_bytes()
    }

    fn liveness() -> (HealthRegistry, HealthHandle) {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("worker", Duration::from_secs(30));
        (registry, handle)
    }

    #[tokio::test]
    async fn test_publishes_before_acking() {
        let dir = tempfile::tempdir().unwrap();
        write_specification(dir.path(), "LOQ", json!({"enabled": true}));
        let file = write_run_file(dir.path(), "LOQ00110782.nxs", run_entry("LOQ", 110782, "Test Run"));
        let egress = MemoryEgress::new();
        let (message, ingress) = MemoryMessage::detached(payload(&file), 1);

        let outcome = process_message(&detector(dir.path()), &egress, &message, 5, &fast_retries())
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Acked { published: true });
        let published = egress.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].run_number, 110782);
        assert_eq!(ingress.settled()[0].settlement, Settlement::Acked);
    }

    #[tokio::test]
    async fn test_stitched_requests_are_published_after_the_run() {
        let dir = tempfile::tempdir().unwrap();
        write_specification(dir.path(), "MARI", json!({"mariStitch": true, "enabled": true}));
        write_run_file(dir.path(), "MAR25580.nxs", run_entry("MARI", 25580, "Vanadium"));
        let file = write_run_file(dir.path(), "MAR25581.nxs", run_entry("MARI", 25581, "Vanadium"));
        let egress = MemoryEgress::new();
        let (message, ingress) = MemoryMessage::detached(payload(&file), 1);

        process_message(&detector(dir.path()), &egress, &message, 5, &fast_retries())
            .await
            .unwrap();

        let published = egress.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].additional_values["runno"], json!(25581));
        assert_eq!(published[1].additional_values["runno"], json!([25581, 25580]));
        assert_eq!(published[1].additional_values["sum_runs"], json!(true));
        assert_eq!(ingress.settled()[0].settlement, Settlement::Acked);
    }

    #[tokio::test]
    async fn test_skipped_run_is_acked_without_publishing() {
        let dir = tempfile::tempdir().unwrap();
        write_specification(dir.path(), "LOQ", json!({"enabled": false}));
        let file = write_run_file(dir.path(), "LOQ00110782.nxs", run_entry("LOQ", 110782, "Test Run"));
        let egress = MemoryEgress::new();
        let (message, ingress) = MemoryMessage::detached(payload(&file), 1);

        let outcome = process_message(&detector(dir.path()), &egress, &message, 5, &fast_retries())
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Acked { published: false });
        assert!(egress.published().is_empty());
        assert_eq!(ingress.settled()[0].settlement, Settlement::Acked);
    }

    #[tokio::test]
    async fn test_unopenable_file_is_requeued_until_the_last_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("LOQ00110783.nxs");
        let egress = MemoryEgress::new();

        let (message, _) = MemoryMessage::detached(payload(&missing), 1);
        let outcome = process_message(&detector(dir.path()), &egress, &message, 3, &fast_retries())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Requeued {
                delay: Duration::from_millis(1)
            }
        );

        let (message, _) = MemoryMessage::detached(payload(&missing), 2);
        let outcome = process_message(&detector(dir.path()), &egress, &message, 3, &fast_retries())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Requeued {
                delay: Duration::from_millis(2)
            }
        );

        let (message, ingress) = MemoryMessage::detached(payload(&missing), 3);
        let outcome = process_message(&detector(dir.path()), &egress, &message, 3, &fast_retries())
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Rejected { .. }));
        assert!(matches!(
            ingress.settled()[0].settlement,
            Settlement::Rejected(_)
        ));
        assert!(egress.published().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_errors_are_rejected_on_first_delivery() {
        let dir = tempfile::tempdir().unwrap();
        write_specification(dir.path(), "LOQ", json!({"fooBarRule": true}));
        let file = write_run_file(dir.path(), "LOQ00110782.nxs", run_entry("LOQ", 110782, "Test Run"));
        let egress = MemoryEgress::new();

        let (message, _) = MemoryMessage::detached(payload(&file), 1);
        let outcome = process_message(&detector(dir.path()), &egress, &message, 5, &fast_retries())
            .await
            .unwrap();
        match outcome {
            Outcome::Rejected { reason } => assert!(reason.contains("fooBarRule"), "{reason}"),
            other => panic!("unexpected outcome {other:?}"),
        }

        let (message, _) = MemoryMessage::detached(Vec::new(), 1);
        let outcome = process_message(&detector(dir.path()), &egress, &message, 5, &fast_retries())
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Rejected { .. }));
        assert!(egress.published().is_empty());
    }

    #[tokio::test]
    async fn test_failed_publish_is_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_run_file(dir.path(), "LOQ00110782.nxs", run_entry("LOQ", 110782, "Test Run"));
        let egress = MemoryEgress::failing(1);

        let (message, ingress) = MemoryMessage::detached(payload(&file), 1);
        let outcome = process_message(&detector(dir.path()), &egress, &message, 5, &fast_retries())
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Requeued { .. }));
        assert!(egress.published().is_empty());
        assert_eq!(ingress.settled()[0].settlement, Settlement::Requeued);
    }

    #[tokio::test]
    async fn test_failed_publish_on_last_delivery_is_rejected_with_run_context() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_run_file(dir.path(), "LOQ00110782.nxs", run_entry("LOQ", 110782, "Test Run"));
        let egress = MemoryEgress::failing(1);
        let (message, ingress) = MemoryMessage::detached(payload(&file), 5);

        let decision = decide(&detector(dir.path()), &egress, &message, 5, &fast_retries()).await;

        assert_eq!(decision.cause, "publish");
        assert_eq!(decision.run.instrument(), "LOQ");
        assert_eq!(decision.run.run_number(), "110782");
        assert_eq!(decision.run.path, file.display().to_string());
        match &decision.outcome {
            Outcome::Rejected { reason } => {
                assert!(reason.contains("giving up after 5 deliveries"), "{reason}")
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        settle(&message, decision, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            ingress.settled()[0].settlement,
            Settlement::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_metadata_names_the_instrument() {
        let dir = tempfile::tempdir().unwrap();
        let mut entry = run_entry("LOQ", 110782, "Test Run");
        entry.as_object_mut().unwrap().remove("title");
        let file = write_run_file(dir.path(), "LOQ00110782.nxs", entry);
        let (message, _) = MemoryMessage::detached(payload(&file), 1);

        let egress = MemoryEgress::new();

        let decision = decide(&detector(dir.path()), &egress, &message, 5, &fast_retries()).await;

        assert_eq!(decision.cause, "missing_metadata");
        assert_eq!(decision.run.instrument(), "LOQ");
        assert!(matches!(decision.outcome, Outcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_failed_settle_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_run_file(dir.path(), "LOQ00110782.nxs", run_entry("LOQ", 110782, "Test Run"));
        let egress = MemoryEgress::new();
        let (message, ingress) = MemoryMessage::detached(payload(&file), 1);
        ingress.fail_settles(SETTLE_ATTEMPTS - 1);

        let outcome = process_message(&detector(dir.path()), &egress, &message, 5, &fast_retries())
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Acked { published: true });
        assert_eq!(ingress.settled().len(), 1);
        assert_eq!(ingress.settled()[0].settlement, Settlement::Acked);
    }

    #[tokio::test]
    async fn test_unsettleable_message_makes_the_worker_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_run_file(dir.path(), "LOQ00110782.nxs", run_entry("LOQ", 110782, "Test Run"));
        let ingress = MemoryIngress::new();
        ingress.fail_settles(SETTLE_ATTEMPTS);
        ingress.push(payload(&file));
        let egress = Arc::new(MemoryEgress::new());
        let (registry, handle) = liveness();

        let worker = RunDetectionWorker::new(
            ingress.clone(),
            egress.clone(),
            Arc::new(detector(dir.path())),
            Duration::from_millis(20),
            2,
            3,
            fast_retries(),
            handle,
        );
        let shutdown = CancellationToken::new();
        let running = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { worker.run(shutdown).await }
        });

        let started = Instant::now();
        while registry.get_status().components.get("worker") != Some(&ComponentStatus::Unhealthy) {
            assert!(started.elapsed() < Duration::from_secs(5), "worker never reported unhealthy");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        shutdown.cancel();
        running.await.unwrap();

        assert!(!registry.get_status().healthy);
        assert_eq!(egress.published().len(), 1);
        assert!(ingress.settled().is_empty());
    }

    #[tokio::test]
    async fn test_backoff_does_not_hold_up_other_messages() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_run_file(dir.path(), "LOQ00110782.nxs", run_entry("LOQ", 110782, "Test Run"));
        let ingress = MemoryIngress::new();
        ingress.push(payload(&dir.path().join("LOQ00110780.nxs")));
        ingress.push(payload(&dir.path().join("LOQ00110781.nxs")));
        ingress.push(payload(&good));
        let egress = Arc::new(MemoryEgress::new());

        // Two permits, both taken by files whose retries back off for 1.5s
        let worker = RunDetectionWorker::new(
            ingress.clone(),
            egress.clone(),
            Arc::new(detector(dir.path())),
            Duration::from_millis(50),
            2,
            3,
            slow_retries(),
            liveness().1,
        );
        let shutdown = CancellationToken::new();
        let running = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { worker.run(shutdown).await }
        });

        let started = Instant::now();
        while egress.published().is_empty() {
            assert!(
                started.elapsed() < Duration::from_millis(500),
                "good file waited for the backoff of others"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        running.await.unwrap();

        assert_eq!(egress.published()[0].run_number, 110782);
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_messages() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("LOQ00110783.nxs");
        let ingress = MemoryIngress::new();
        ingress.push(payload(&missing));

        let worker = RunDetectionWorker::new(
            ingress.clone(),
            Arc::new(MemoryEgress::new()),
            Arc::new(detector(dir.path())),
            Duration::from_millis(20),
            2,
            3,
            slow_retries(),
            liveness().1,
        )
        .with_drain_timeout(Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        let running = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { worker.run(shutdown).await }
        });

        // Let the message reach its backoff, then stop
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stopping = Instant::now();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("worker stops without waiting out the backoff")
            .unwrap();

        assert!(stopping.elapsed() < Duration::from_secs(1));
        let settled = ingress.settled();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].settlement, Settlement::Requeued);
        assert_eq!(settled[0].delivery_count, 1);
    }

    #[tokio::test]
    async fn test_run_drains_the_ingress() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_run_file(dir.path(), "LOQ00110782.nxs", run_entry("LOQ", 110782, "Test Run"));
        let missing = dir.path().join("LOQ00110783.nxs");
        let ingress = MemoryIngress::new();
        ingress.push(payload(&missing));
        ingress.push(payload(&good));
        let egress = Arc::new(MemoryEgress::new());

        let worker = RunDetectionWorker::new(
            ingress.clone(),
            egress.clone(),
            Arc::new(detector(dir.path())),
            Duration::from_millis(50),
            2,
            3,
            fast_retries(),
            liveness().1,
        );
        worker.run(CancellationToken::new()).await;

        assert_eq!(egress.published().len(), 1);
        let missing_payload = payload(&missing);
        let attempts: Vec<_> = ingress
            .settled()
            .into_iter()
            .filter(|settled| settled.payload == missing_payload)
            .collect();
        assert_eq!(attempts.len(), 3);
        assert!(matches!(attempts[2].settlement, Settlement::Rejected(_)));
        assert_eq!(attempts[2].delivery_count, 3);
    }
}
