use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A candidate run for automatic reduction.
///
/// Built by ingestion, then mutated in place by the instrument's rules. The
/// egress document is this struct serialized as JSON, minus `will_reduce`: only
/// runs that will be reduced are ever published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub run_number: i64,
    pub instrument: String,
    pub experiment_title: String,
    pub experiment_number: String,
    pub filepath: String,
    pub run_start: String,
    pub run_end: String,
    pub raw_frames: i64,
    pub good_frames: i64,
    pub users: String,
    /// Only ever cleared by rules, see [`JobRequest::skip`].
    #[serde(skip_serializing, default = "will_reduce_default")]
    pub will_reduce: bool,
    #[serde(default)]
    pub additional_values: Map<String, Value>,
    /// Further requests to publish right after this one, each as its own document.
    #[serde(skip)]
    pub additional_requests: Vec<JobRequest>,
}

fn will_reduce_default() -> bool {
    true
}

impl Default for JobRequest {
    fn default() -> Self {
        Self {
            run_number: 0,
            instrument: String::new(),
            experiment_title: String::new(),
            experiment_number: String::new(),
            filepath: String::new(),
            run_start: String::new(),
            run_end: String::new(),
            raw_frames: 0,
            good_frames: 0,
            users: String::new(),
            will_reduce: true,
            additional_values: Map::new(),
            additional_requests: Vec::new(),
        }
    }
}

impl JobRequest {
    /// Exclude this run from reduction. There is no way back for the rest of the evaluation.
    pub fn skip(&mut self) {
        self.will_reduce = false;
    }

    pub fn set_value(&mut self, key: &str, value: impl Into<Value>) {
        self.additional_values.insert(key.to_owned(), value.into());
    }

    /// Broker key of the egress message, so redeliveries of one run land on one partition.
    pub fn key(&self) -> String {
        format!("{}-{}", self.instrument, self.run_number)
    }
}
