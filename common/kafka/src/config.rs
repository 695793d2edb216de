use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use envconfig::Envconfig;
use event_queue::{validate_brokers, ConfigError};
use rdkafka::ClientConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    /// The librdkafka `compression.codec` value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "snappy" => Ok(Compression::Snappy),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            _ => Err(format!(
                "Unknown compression codec: {s}, must be one of none, gzip, snappy, lz4, zstd"
            )),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compression codecs in order of preference, e.g. `zstd,lz4,none`.
///
/// The producer uses the first entry; the rest document acceptable fallbacks
/// for whoever operates the brokers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionPreference(Vec<Compression>);

impl CompressionPreference {
    pub fn new(codecs: Vec<Compression>) -> Result<Self, ConfigError> {
        if codecs.is_empty() {
            return Err(ConfigError::Invalid {
                name: "kafka_compression",
                reason: "at least one codec is required".to_string(),
            });
        }
        Ok(CompressionPreference(codecs))
    }

    pub fn codec(&self) -> Compression {
        self.0.first().copied().unwrap_or(Compression::None)
    }
}

impl Default for CompressionPreference {
    fn default() -> Self {
        CompressionPreference(vec![Compression::None])
    }
}

impl FromStr for CompressionPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let codecs = s
            .split(',')
            .filter(|c| !c.trim().is_empty())
            .map(Compression::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        if codecs.is_empty() {
            return Err("at least one compression codec is required".to_string());
        }
        Ok(CompressionPreference(codecs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

impl FromStr for SaslMechanism {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace('_', "-").as_ref() {
            "PLAIN" => Ok(SaslMechanism::Plain),
            "SCRAM-SHA-256" => Ok(SaslMechanism::ScramSha256),
            "SCRAM-SHA-512" => Ok(SaslMechanism::ScramSha512),
            _ => Err(format!(
                "Unknown SASL mechanism: {s}, must be PLAIN, SCRAM-SHA-256 or SCRAM-SHA-512"
            )),
        }
    }
}

/// Connection settings shared by producers and consumers.
#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String, // comma separated host:port list

    #[envconfig(default = "event-queue")]
    pub kafka_client_id: String,

    pub kafka_version: Option<String>, // broker.version.fallback, e.g. 2.8.1

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    pub kafka_tls_ca_location: Option<String>,

    pub kafka_sasl_mechanism: Option<SaslMechanism>,
    pub kafka_sasl_username: Option<String>,
    pub kafka_sasl_password: Option<String>,
}

impl KafkaConfig {
    pub fn for_brokers(hosts: &str) -> Self {
        KafkaConfig {
            kafka_hosts: hosts.to_string(),
            kafka_client_id: "event-queue".to_string(),
            kafka_version: None,
            kafka_tls: false,
            kafka_tls_ca_location: None,
            kafka_sasl_mechanism: None,
            kafka_sasl_username: None,
            kafka_sasl_password: None,
        }
    }

    pub fn with_sasl(mut self, mechanism: SaslMechanism, username: &str, password: &str) -> Self {
        self.kafka_sasl_mechanism = Some(mechanism);
        self.kafka_sasl_username = Some(username.to_string());
        self.kafka_sasl_password = Some(password.to_string());
        self
    }

    pub fn brokers(&self) -> Vec<&str> {
        self.kafka_hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_brokers(self.brokers().as_slice())?;

        let has_credentials =
            self.kafka_sasl_username.is_some() || self.kafka_sasl_password.is_some();
        match self.kafka_sasl_mechanism {
            Some(mechanism) => {
                let username = self.kafka_sasl_username.as_deref().unwrap_or_default();
                if username.trim().is_empty() {
                    return Err(ConfigError::InvalidCredentials(format!(
                        "{} requires a username",
                        mechanism.as_str()
                    )));
                }
                if self.kafka_sasl_password.is_none() {
                    return Err(ConfigError::InvalidCredentials(format!(
                        "{} requires a password",
                        mechanism.as_str()
                    )));
                }
            }
            None if has_credentials => {
                return Err(ConfigError::InvalidCredentials(
                    "SASL credentials given without a mechanism".to_string(),
                ));
            }
            None => {}
        }
        Ok(())
    }

    /// Validated connection settings common to every client.
    pub fn client_config(&self) -> Result<ClientConfig, ConfigError> {
        self.validate()?;

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", self.brokers().join(","))
            .set("client.id", &self.kafka_client_id)
            .set("statistics.interval.ms", "10000");

        if let Some(version) = &self.kafka_version {
            client_config
                .set("api.version.request", "true")
                .set("broker.version.fallback", version);
        }

        let protocol = match (self.kafka_tls, self.kafka_sasl_mechanism.is_some()) {
            (false, false) => "plaintext",
            (true, false) => "ssl",
            (false, true) => "sasl_plaintext",
            (true, true) => "sasl_ssl",
        };
        client_config.set("security.protocol", protocol);

        if self.kafka_tls {
            match &self.kafka_tls_ca_location {
                Some(location) => {
                    client_config.set("ssl.ca.location", location);
                }
                None => {
                    client_config.set("enable.ssl.certificate.verification", "false");
                }
            }
        }

        if let Some(mechanism) = self.kafka_sasl_mechanism {
            client_config
                .set("sasl.mechanisms", mechanism.as_str())
                .set(
                    "sasl.username",
                    self.kafka_sasl_username.clone().unwrap_or_default(),
                )
                .set(
                    "sasl.password",
                    self.kafka_sasl_password.clone().unwrap_or_default(),
                );
        }

        Ok(client_config)
    }
}

const SECRET_KEYS: &[&str] = &["sasl.password", "ssl.key.password"];

/// The client settings with secrets masked, safe to log.
pub fn redacted(config: &ClientConfig) -> BTreeMap<&str, &str> {
    config
        .config_map()
        .iter()
        .map(|(key, value)| {
            if SECRET_KEYS.contains(&key.as_str()) {
                (key.as_str(), "[redacted]")
            } else {
                (key.as_str(), value.as_str())
            }
        })
        .collect()
}

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaProducerConfig {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression: CompressionPreference, // none, gzip, snappy, lz4, zstd in order of preference
}

impl KafkaProducerConfig {
    pub fn new(kafka: KafkaConfig) -> Self {
        KafkaProducerConfig {
            kafka,
            kafka_producer_linger_ms: 20,
            kafka_producer_queue_mib: 400,
            kafka_producer_queue_messages: 10_000_000,
            kafka_message_timeout_ms: 20_000,
            kafka_compression: CompressionPreference::default(),
        }
    }

    pub fn with_compression(mut self, compression: CompressionPreference) -> Self {
        self.kafka_compression = compression;
        self
    }

    pub fn client_config(&self) -> Result<ClientConfig, ConfigError> {
        let mut client_config = self.kafka.client_config()?;
        client_config
            .set("linger.ms", self.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                self.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", self.kafka_compression.codec().as_str())
            .set(
                "queue.buffering.max.kbytes",
                (self.kafka_producer_queue_mib * 1024).to_string(),
            )
            .set(
                "queue.buffering.max.messages",
                self.kafka_producer_queue_messages.to_string(),
            );
        Ok(client_config)
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConsumerConfig {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    // We default to "earliest" for this, but if you're bringing up a new service, you probably want "latest"
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "30000")]
    pub kafka_consumer_session_timeout_ms: u32,

    // How long a poll keeps filling a batch after its first record arrived
    #[envconfig(default = "500")]
    pub kafka_consumer_batch_timeout_ms: u64,
}

impl KafkaConsumerConfig {
    pub fn new(kafka: KafkaConfig) -> Self {
        KafkaConsumerConfig {
            kafka,
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_consumer_session_timeout_ms: 30_000,
            kafka_consumer_batch_timeout_ms: 500,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.kafka_consumer_offset_reset.as_str() {
            "earliest" | "latest" => {}
            other => {
                return Err(ConfigError::Invalid {
                    name: "kafka_consumer_offset_reset",
                    reason: format!("{other} is not one of earliest, latest"),
                })
            }
        }
        self.kafka.validate()
    }

    /// Group consumer settings. Offsets are only ever committed explicitly,
    /// after a batch was processed.
    pub fn client_config(&self, group_id: &str) -> Result<ClientConfig, ConfigError> {
        self.validate()?;
        if group_id.trim().is_empty() {
            return Err(ConfigError::NoGroupId);
        }

        let mut client_config = self.kafka.client_config()?;
        client_config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", &self.kafka_consumer_offset_reset)
            .set(
                "session.timeout.ms",
                self.kafka_consumer_session_timeout_ms.to_string(),
            );
        Ok(client_config)
    }
}
