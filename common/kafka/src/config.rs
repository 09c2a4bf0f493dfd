use envconfig::Envconfig;
use rdkafka::ClientConfig;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "100000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "1000000")]
    pub kafka_producer_message_max_bytes: u32,

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    // Managed brokers authenticate over SASL, the three below are only read when
    // the mechanism is set.
    pub kafka_security_protocol: Option<String>, // plaintext, ssl, sasl_plaintext, sasl_ssl
    pub kafka_sasl_mechanism: Option<String>,    // PLAIN, SCRAM-SHA-256, SCRAM-SHA-512
    pub kafka_sasl_username: Option<String>,
    pub kafka_sasl_password: Option<String>,
}

impl KafkaConfig {
    /// Connection settings shared by producers, consumers and admin clients.
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &self.kafka_hosts);

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        if let Some(protocol) = &self.kafka_security_protocol {
            client_config.set("security.protocol", protocol);
        }

        if let Some(mechanism) = &self.kafka_sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
            if let Some(username) = &self.kafka_sasl_username {
                client_config.set("sasl.username", username);
            }
            if let Some(password) = &self.kafka_sasl_password {
                client_config.set("sasl.password", password);
            }
        }

        client_config
    }
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    #[envconfig(default = "appeal-relay")]
    pub kafka_consumer_group: String,

    // Relay consumers must see every message at least once, so a fresh group starts
    // from the beginning of the topic.
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest
}
