//! Kafka connection options.

use clap::Args;
use rdkafka::config::ClientConfig;

/// Kafka options for the command line.
#[derive(Debug, Clone, Args)]
pub struct KafkaOpts {
    /// Kafka brokers (comma-separated or multiple --brokers)
    #[clap(
        long,
        env = "KAFKA_BROKERS",
        value_delimiter = ',',
        default_value = "localhost:9092"
    )]
    pub brokers: Vec<String>,

    /// Topics carrying vehicle-position messages
    #[clap(long = "topic", env = "KAFKA_TOPICS", value_delimiter = ',', default_value = "icymta")]
    pub topics: Vec<String>,

    /// Consumer group ID
    #[clap(long, env = "KAFKA_GROUP_ID", default_value = "transit-ingest")]
    pub group_id: String,

    /// Where to start when the group has no committed offset ("earliest" or "latest")
    #[clap(long, env = "KAFKA_AUTO_OFFSET_RESET", default_value = "latest")]
    pub auto_offset_reset: String,

    /// Session timeout in milliseconds
    #[clap(long, env = "KAFKA_SESSION_TIMEOUT_MS", default_value_t = 30000)]
    pub session_timeout_ms: u32,

    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT or SASL_SSL)
    #[clap(long, env = "KAFKA_SECURITY_PROTOCOL")]
    pub security_protocol: Option<String>,

    /// SASL mechanism, used with SASL_* security protocols
    #[clap(long, env = "KAFKA_SASL_MECHANISM", default_value = "PLAIN")]
    pub sasl_mechanism: String,

    #[clap(long, env = "KAFKA_SASL_USERNAME")]
    pub sasl_username: Option<String>,

    #[clap(long, env = "KAFKA_SASL_PASSWORD", hide_env_values = true)]
    pub sasl_password: Option<String>,

    /// CA certificate file
    #[clap(long, env = "KAFKA_SSL_CA_LOCATION")]
    pub ssl_ca_location: Option<String>,

    /// Client certificate file
    #[clap(long, env = "KAFKA_SSL_CERTIFICATE_LOCATION")]
    pub ssl_certificate_location: Option<String>,

    /// Client private key file
    #[clap(long, env = "KAFKA_SSL_KEY_LOCATION")]
    pub ssl_key_location: Option<String>,
}

impl From<KafkaOpts> for ConsumerConfig {
    fn from(opts: KafkaOpts) -> Self {
        Self {
            brokers: opts.brokers.join(","),
            topics: opts.topics,
            group_id: opts.group_id,
            auto_offset_reset: opts.auto_offset_reset,
            session_timeout_ms: opts.session_timeout_ms.to_string(),
            security_protocol: opts.security_protocol,
            sasl_mechanism: opts.sasl_mechanism,
            sasl_username: opts.sasl_username,
            sasl_password: opts.sasl_password,
            ssl_ca_location: opts.ssl_ca_location,
            ssl_certificate_location: opts.ssl_certificate_location,
            ssl_key_location: opts.ssl_key_location,
        }
    }
}

/// Configuration for the Kafka consumer
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Kafka brokers (comma-separated list)
    pub brokers: String,
    pub topics: Vec<String>,
    pub group_id: String,
    /// Auto offset reset strategy ("earliest" or "latest")
    ///
    /// Only used when the consumer group has no committed offset yet.
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    pub session_timeout_ms: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: String,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub ssl_certificate_location: Option<String>,
    pub ssl_key_location: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topics: vec!["icymta".to_string()],
            group_id: "transit-ingest".to_string(),
            auto_offset_reset: "latest".to_string(),
            session_timeout_ms: "30000".to_string(),
            security_protocol: None,
            sasl_mechanism: "PLAIN".to_string(),
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            ssl_certificate_location: None,
            ssl_key_location: None,
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.brokers.trim().is_empty() {
            return Err("at least one broker is required".to_string());
        }
        if self.topics.iter().all(|t| t.trim().is_empty()) {
            return Err("at least one topic is required".to_string());
        }
        if !matches!(self.auto_offset_reset.as_str(), "earliest" | "latest") {
            return Err(format!(
                "auto offset reset must be 'earliest' or 'latest', got '{}'",
                self.auto_offset_reset
            ));
        }
        if self.uses_sasl() && (self.sasl_username.is_none() || self.sasl_password.is_none()) {
            return Err("SASL username and password are required for SASL protocols".to_string());
        }
        Ok(())
    }

    fn uses_sasl(&self) -> bool {
        self.security_protocol
            .as_deref()
            .is_some_and(|p| p.to_ascii_uppercase().starts_with("SASL"))
    }

    /// librdkafka settings for this consumer.
    ///
    /// Auto commit is always off: offsets are committed by the engine once
    /// the sink has accepted every record below them.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", &self.session_timeout_ms)
            .set("enable.partition.eof", "false");

        if let Some(protocol) = &self.security_protocol {
            config.set("security.protocol", protocol);
        }
        if self.uses_sasl() {
            config.set("sasl.mechanism", &self.sasl_mechanism);
            if let Some(username) = &self.sasl_username {
                config.set("sasl.username", username);
            }
            if let Some(password) = &self.sasl_password {
                config.set("sasl.password", password);
            }
        }
        if let Some(path) = &self.ssl_ca_location {
            config.set("ssl.ca.location", path);
        }
        if let Some(path) = &self.ssl_certificate_location {
            config.set("ssl.certificate.location", path);
        }
        if let Some(path) = &self.ssl_key_location {
            config.set("ssl.key.location", path);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[clap(flatten)]
        kafka: KafkaOpts,
    }

    #[test]
    fn test_plaintext_client_config() {
        let config = ConsumerConfig {
            brokers: "kafka-1:9092,kafka-2:9092".to_string(),
            ..Default::default()
        }
        .client_config();

        assert_eq!(config.get("bootstrap.servers"), Some("kafka-1:9092,kafka-2:9092"));
        assert_eq!(config.get("group.id"), Some("transit-ingest"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("security.protocol"), None);
        assert_eq!(config.get("sasl.username"), None);
    }

    #[test]
    fn test_sasl_ssl_client_config() {
        let config = ConsumerConfig {
            security_protocol: Some("SASL_SSL".to_string()),
            sasl_username: Some("ingest".to_string()),
            sasl_password: Some("secret".to_string()),
            ssl_ca_location: Some("/etc/kafka/ca.pem".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let client = config.client_config();
        assert_eq!(client.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client.get("sasl.mechanism"), Some("PLAIN"));
        assert_eq!(client.get("sasl.username"), Some("ingest"));
        assert_eq!(client.get("sasl.password"), Some("secret"));
        assert_eq!(client.get("ssl.ca.location"), Some("/etc/kafka/ca.pem"));
        assert_eq!(client.get("ssl.key.location"), None);
    }

    #[test]
    fn test_validate() {
        assert!(ConsumerConfig::default().validate().is_ok());
        assert!(ConsumerConfig {
            auto_offset_reset: "smallest".to_string(),
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(ConsumerConfig {
            security_protocol: Some("sasl_plaintext".to_string()),
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(ConsumerConfig {
            topics: vec![],
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_opts_from_args() {
        let cli = Cli::parse_from([
            "test",
            "--brokers",
            "a:9092,b:9092",
            "--topic",
            "icymta,bus",
            "--auto-offset-reset",
            "earliest",
        ]);
        let config = ConsumerConfig::from(cli.kafka);
        assert_eq!(config.brokers, "a:9092,b:9092");
        assert_eq!(config.topics, vec!["icymta", "bus"]);
        assert_eq!(config.auto_offset_reset, "earliest");
        assert_eq!(config.session_timeout_ms, "30000");
    }
}
