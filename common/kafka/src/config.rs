use envconfig::Envconfig;
use rdkafka::ClientConfig;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Broker credentials, SASL/PLAIN is used when a username is set
    pub kafka_username: Option<String>,
    pub kafka_password: Option<String>,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}

impl KafkaConfig {
    /// Connection settings shared by consumers and producers.
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("statistics.interval.ms", "10000");

        let protocol = match (self.kafka_tls, self.kafka_username.is_some()) {
            (false, false) => "plaintext",
            (true, false) => "ssl",
            (false, true) => "sasl_plaintext",
            (true, true) => "sasl_ssl",
        };
        client_config.set("security.protocol", protocol);

        if let Some(username) = &self.kafka_username {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set(
                    "sasl.password",
                    self.kafka_password.as_deref().unwrap_or_default(),
                );
        }

        client_config
    }
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    #[envconfig(default = "run-detection")]
    pub kafka_consumer_group: String,

    // The ingress queue, one message per newly written data file
    #[envconfig(default = "watched-files")]
    pub kafka_consumer_topic: String,

    // New deployments should not replay the whole history of watched files
    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tls: bool, username: Option<&str>) -> KafkaConfig {
        KafkaConfig {
            kafka_hosts: "broker:9092".to_owned(),
            kafka_tls: tls,
            kafka_username: username.map(str::to_owned),
            kafka_password: Some("secret".to_owned()),
            kafka_producer_linger_ms: 20,
            kafka_message_timeout_ms: 20000,
            kafka_compression_codec: "none".to_owned(),
        }
    }

    #[test]
    fn test_security_protocol_follows_tls_and_credentials() {
        let plain = config(false, None).client_config();
        assert_eq!(plain.get("security.protocol"), Some("plaintext"));
        assert_eq!(plain.get("sasl.username"), None);

        let sasl = config(true, Some("rundetection")).client_config();
        assert_eq!(sasl.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(sasl.get("sasl.username"), Some("rundetection"));
        assert_eq!(sasl.get("sasl.password"), Some("secret"));
        assert_eq!(sasl.get("bootstrap.servers"), Some("broker:9092"));
    }
}
