use std::str::FromStr;
use std::time;

use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    // Job requests for runs that will be reduced
    #[envconfig(default = "scheduled-jobs")]
    pub egress_topic: NonEmptyString,

    // Rejected messages are copied here, or dropped when unset
    pub dead_letter_topic: Option<NonEmptyString>,

    // Holds one <instrument>_specification.json per instrument
    #[envconfig(default = "specifications")]
    pub specification_dir: String,

    // Read specifications over HTTP instead of from specification_dir when set
    pub specification_api_url: Option<String>,

    pub specification_api_key: Option<String>,

    #[envconfig(default = "5000")]
    pub specification_api_timeout: EnvMsDuration,

    #[envconfig(default = "4")]
    pub max_concurrent_messages: usize,

    #[envconfig(default = "5")]
    pub max_delivery_count: u32,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(default = "1000")]
    pub poll_interval: EnvMsDuration,

    // On shutdown, how long in-flight messages get to settle
    #[envconfig(default = "30000")]
    pub shutdown_drain_timeout: EnvMsDuration,

    #[envconfig(default = "/tmp/heartbeat")]
    pub heartbeat_path: String,

    #[envconfig(default = "5000")]
    pub heartbeat_interval: EnvMsDuration,

    #[envconfig(default = "text")]
    pub log_format: LogFormat,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Settings for the liveness probe binary.
#[derive(Envconfig, Clone)]
pub struct ProbeConfig {
    #[envconfig(default = "/tmp/heartbeat")]
    pub heartbeat_path: String,

    // A data file the probe must be able to read, proving the archive is mounted
    pub probe_sample_file: Option<String>,

    #[envconfig(default = "30000")]
    pub probe_max_age: EnvMsDuration,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "RETRY_POLICY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "RETRY_POLICY_INITIAL_INTERVAL", default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_POLICY_MAXIMUM_INTERVAL", default = "30000")]
    pub maximum_interval: EnvMsDuration,

    // Requeued messages go back to the ingress topic when unset
    #[envconfig(from = "RETRY_POLICY_RETRY_QUEUE_NAME")]
    pub retry_queue_name: Option<NonEmptyString>,
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLogFormatError(String);

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(ParseLogFormatError(s.to_owned())),
        }
    }
}
