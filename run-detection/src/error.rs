use std::path::PathBuf;

use common_kafka::{kafka_consumer::OffsetErr, kafka_producer::KafkaProduceError};
use rdkafka::error::KafkaError;
use serde_json::Value;
use thiserror::Error;

/// Errors raised while building or applying a rule.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("no rule is registered for key {0}")]
    UnknownRule(String),
    #[error("bad value {value} for rule {key}")]
    RuleValue { key: String, value: Value },
    #[error("rule {rule} cannot be applied: {reason}")]
    RuleViolation { rule: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum SpecificationError {
    #[error("specification for {instrument} could not be parsed: {reason}")]
    Parse { instrument: String, reason: String },
    #[error("specification for {instrument} is unavailable: {reason}")]
    Unavailable { instrument: String, reason: String },
    #[error(transparent)]
    Rule(#[from] RuleError),
}

impl SpecificationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SpecificationError::Unavailable { .. })
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("data file {path} could not be opened: {reason}")]
    FileOpen { path: PathBuf, reason: String },
    #[error("data file {path} has no readable {field}")]
    MissingMetadata {
        path: PathBuf,
        field: String,
        /// The beamline, when it was readable.
        instrument: Option<String>,
    },
}

impl IngestError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::FileOpen { .. })
    }
}

/// Everything that can end the detection of one ingress message.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("unusable ingress payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("{instrument} run {run_number}: {source}")]
    Specification {
        instrument: String,
        run_number: i64,
        #[source]
        source: SpecificationError,
    },
    #[error("{instrument} run {run_number}: {source}")]
    Rule {
        instrument: String,
        run_number: i64,
        #[source]
        source: RuleError,
    },
    #[error("extraction task failed: {0}")]
    Extraction(#[from] tokio::task::JoinError),
}

impl DetectionError {
    /// Transient failures are worth another delivery, everything else is rejected.
    pub fn is_retryable(&self) -> bool {
        match self {
            DetectionError::Ingest(error) => error.is_retryable(),
            DetectionError::Specification { source, .. } => source.is_retryable(),
            DetectionError::Payload(_)
            | DetectionError::Rule { .. }
            | DetectionError::Extraction(_) => false,
        }
    }

    /// Short label for the rejection counter.
    pub fn cause(&self) -> &'static str {
        match self {
            DetectionError::Payload(_) => "payload",
            DetectionError::Ingest(IngestError::FileOpen { .. }) => "file_open",
            DetectionError::Ingest(IngestError::MissingMetadata { .. }) => "missing_metadata",
            DetectionError::Specification { source, .. } => match source {
                SpecificationError::Parse { .. } => "specification_parse",
                SpecificationError::Unavailable { .. } => "specification_unavailable",
                SpecificationError::Rule(RuleError::UnknownRule(_)) => "unknown_rule",
                SpecificationError::Rule(_) => "rule_value",
            },
            DetectionError::Rule { .. } => "rule_violation",
            DetectionError::Extraction(_) => "extraction_task",
        }
    }

    pub fn instrument(&self) -> Option<&str> {
        match self {
            DetectionError::Specification { instrument, .. }
            | DetectionError::Rule { instrument, .. } => Some(instrument),
            DetectionError::Ingest(IngestError::MissingMetadata { instrument, .. }) => {
                instrument.as_deref()
            }
            _ => None,
        }
    }

    pub fn run_number(&self) -> Option<i64> {
        match self {
            DetectionError::Specification { run_number, .. }
            | DetectionError::Rule { run_number, .. } => Some(*run_number),
            _ => None,
        }
    }
}

/// Failures of the message channels themselves, as opposed to the messages they carry.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error(transparent)]
    Produce(#[from] KafkaProduceError),
    #[error("failed to store offset: {0}")]
    Offset(#[from] OffsetErr),
    #[error("failed to serialize job request: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("ingress closed")]
    Closed,
}

/// Errors that stop the service from starting.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] envconfig::Error),
    #[error("kafka setup failed: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to build the specification client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to install the metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let file_open = DetectionError::from(IngestError::FileOpen {
            path: "/data/LOQ110782.nxs".into(),
            reason: "truncated".to_owned(),
        });
        assert!(file_open.is_retryable());
        assert_eq!(file_open.cause(), "file_open");

        let missing = DetectionError::from(IngestError::MissingMetadata {
            path: "/data/LOQ110782.nxs".into(),
            field: "title".to_owned(),
            instrument: Some("LOQ".to_owned()),
        });
        assert!(!missing.is_retryable());
        assert_eq!(missing.instrument(), Some("LOQ"));

        let unknown = DetectionError::Specification {
            instrument: "LOQ".to_owned(),
            run_number: 110782,
            source: RuleError::UnknownRule("fooBarRule".to_owned()).into(),
        };
        assert!(!unknown.is_retryable());
        assert_eq!(unknown.cause(), "unknown_rule");
        assert_eq!(unknown.instrument(), Some("LOQ"));
        assert_eq!(unknown.run_number(), Some(110782));

        let unavailable = DetectionError::Specification {
            instrument: "LOQ".to_owned(),
            run_number: 110782,
            source: SpecificationError::Unavailable {
                instrument: "loq".to_owned(),
                reason: "connection refused".to_owned(),
            },
        };
        assert!(unavailable.is_retryable());
    }
}
