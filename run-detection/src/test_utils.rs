//! In-memory channels and data file helpers for driving the worker in tests.
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use common_kafka::kafka_producer::KafkaProduceError;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::broker::{Egress, Ingress, IngressMessage};
use crate::error::{BrokerError, SpecificationError};
use crate::job_request::JobRequest;
use crate::rules::Specification;
use crate::specification::SpecificationStore;

/// How a message left the in-memory ingress.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Acked,
    Requeued,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settled {
    pub payload: Vec<u8>,
    pub delivery_count: u32,
    pub settlement: Settlement,
}

#[derive(Default)]
struct IngressState {
    queue: VecDeque<(Vec<u8>, u32)>,
    // Delivered or queued, but not yet acked or rejected
    unsettled: usize,
    settled: Vec<Settled>,
    // Settle calls still to fail, whatever the message
    settle_failures_left: u32,
}

/// A queue that closes once every message pushed to it has been acked or rejected.
#[derive(Clone, Default)]
pub struct MemoryIngress {
    state: Arc<Mutex<IngressState>>,
    notify: Arc<Notify>,
}

impl MemoryIngress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, payload: impl Into<Vec<u8>>) {
        self.push_delivery(payload.into(), 1);
    }

    /// Queue a message as if the broker had already delivered it `delivery_count - 1` times.
    pub fn push_delivery(&self, payload: Vec<u8>, delivery_count: u32) {
        let mut state = self.lock();
        state.queue.push_back((payload, delivery_count));
        state.unsettled += 1;
        drop(state);
        self.notify.notify_one();
    }

    /// Make the next `failures` settle calls fail as a broker outage would.
    pub fn fail_settles(&self, failures: u32) {
        self.lock().settle_failures_left = failures;
    }

    /// Every settlement so far, in the order they happened.
    pub fn settled(&self) -> Vec<Settled> {
        self.lock().settled.clone()
    }

    fn lock(&self) -> MutexGuard<'_, IngressState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settle(
        &self,
        payload: &[u8],
        delivery_count: u32,
        settlement: Settlement,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if state.settle_failures_left > 0 {
            state.settle_failures_left -= 1;
            return Err(KafkaProduceError::KafkaProduceCanceled.into());
        }
        let payload = payload.to_vec();
        match &settlement {
            Settlement::Requeued => {
                state.queue.push_back((payload.clone(), delivery_count + 1));
            }
            Settlement::Acked | Settlement::Rejected(_) => {
                state.unsettled = state.unsettled.saturating_sub(1);
            }
        }
        state.settled.push(Settled {
            payload,
            delivery_count,
            settlement,
        });
        drop(state);
        self.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl Ingress for MemoryIngress {
    type Message = MemoryMessage;

    async fn recv(&self) -> Result<MemoryMessage, BrokerError> {
        loop {
            {
                let mut state = self.lock();
                if let Some((payload, delivery_count)) = state.queue.pop_front() {
                    return Ok(MemoryMessage {
                        payload,
                        delivery_count,
                        ingress: self.clone(),
                        settled: AtomicBool::new(false),
                    });
                }
                if state.unsettled == 0 {
                    return Err(BrokerError::Closed);
                }
            }
            self.notify.notified().await;
        }
    }
}

pub struct MemoryMessage {
    payload: Vec<u8>,
    delivery_count: u32,
    ingress: MemoryIngress,
    settled: AtomicBool,
}

impl MemoryMessage {
    /// A message that is not attached to any queue worth inspecting.
    pub fn detached(payload: impl Into<Vec<u8>>, delivery_count: u32) -> (Self, MemoryIngress) {
        let ingress = MemoryIngress::new();
        ingress.lock().unsettled += 1;
        let message = Self {
            payload: payload.into(),
            delivery_count,
            ingress: ingress.clone(),
            settled: AtomicBool::new(false),
        };
        (message, ingress)
    }
}

#[async_trait]
impl IngressMessage for MemoryMessage {
    fn payload(&self) -> Option<&[u8]> {
        Some(&self.payload)
    }

    fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle_once(Settlement::Acked)
    }

    async fn requeue(&self) -> Result<(), BrokerError> {
        self.settle_once(Settlement::Requeued)
    }

    async fn reject(&self, reason: &str) -> Result<(), BrokerError> {
        self.settle_once(Settlement::Rejected(reason.to_owned()))
    }
}

impl MemoryMessage {
    fn settle_once(&self, settlement: Settlement) -> Result<(), BrokerError> {
        if self.settled.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.ingress
            .settle(&self.payload, self.delivery_count, settlement)?;
        self.settled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Records published job requests, optionally failing the first few publishes.
#[derive(Default)]
pub struct MemoryEgress {
    published: Mutex<Vec<JobRequest>>,
    failures_left: AtomicU32,
}

impl MemoryEgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failures: u32) -> Self {
        Self {
            published: Mutex::default(),
            failures_left: AtomicU32::new(failures),
        }
    }

    pub fn published(&self) -> Vec<JobRequest> {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Egress for MemoryEgress {
    async fn publish(&self, job_request: &JobRequest) -> Result<(), BrokerError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(KafkaProduceError::KafkaProduceCanceled.into());
        }

        // Round trip through JSON, as a real broker would
        let document = serde_json::to_vec(job_request)?;
        let published: JobRequest = serde_json::from_slice(&document)?;
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(published);
        Ok(())
    }
}

/// Fails with [`SpecificationError::Unavailable`] a fixed number of times, then
/// serves from the wrapped store.
pub struct FlakySpecificationStore<S> {
    inner: S,
    failures_left: AtomicU32,
}

impl<S> FlakySpecificationStore<S> {
    pub fn new(inner: S, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl<S: SpecificationStore> SpecificationStore for FlakySpecificationStore<S> {
    async fn get_specification(&self, instrument: &str) -> Result<Specification, SpecificationError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SpecificationError::Unavailable {
                instrument: instrument.to_owned(),
                reason: "connection refused".to_owned(),
            });
        }
        self.inner.get_specification(instrument).await
    }
}

/// The entry group of a minimal data file for `instrument`.
pub fn run_entry(instrument: &str, run_number: i64, title: &str) -> Value {
    json!({
        "run_number": [run_number],
        "beamline": [instrument],
        "title": [title],
        "start_time": ["2024-09-03T10:15:00"],
        "end_time": ["2024-09-03T10:45:00"],
        "raw_frames": [8067],
        "good_frames": [6452],
        "experiment_identifier": ["1820497"],
        "user_1": {"name": ["J. Smith"]}
    })
}

/// Write `entry` as a data file named `name` under `dir`.
pub fn write_run_file(dir: &Path, name: &str, entry: Value) -> PathBuf {
    let path = dir.join(name);
    let document = json!({ "raw_data_1": entry });
    std::fs::write(&path, document.to_string()).expect("data file is writable");
    path
}

/// Write the specification document for `instrument` where the directory store finds it.
pub fn write_specification(dir: &Path, instrument: &str, document: Value) -> PathBuf {
    let path = dir.join(format!("{}_specification.json", instrument.to_lowercase()));
    std::fs::write(&path, document.to_string()).expect("specification is writable");
    path
}
