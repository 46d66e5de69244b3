use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::topics::{MessageType, MessageTypeError};

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop waiting for all replicas to ack a message

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,
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

/// Comma separated list of message types, e.g. `MESSAGE_TYPES=message,ping`.
#[derive(Debug, Clone)]
pub struct MessageTypeList(pub Vec<MessageType>);

impl FromStr for MessageTypeList {
    type Err = MessageTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let types = s
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(MessageType::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        if types.is_empty() {
            return Err(MessageTypeError::NoneConfigured);
        }
        Ok(MessageTypeList(types))
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "100")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(default = "3")]
    pub max_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_type_list() {
        let list: MessageTypeList = "message, ping,".parse().unwrap();
        let names: Vec<&str> = list.0.iter().map(MessageType::as_str).collect();
        assert_eq!(names, vec!["message", "ping"]);

        assert_eq!(
            " , ".parse::<MessageTypeList>().unwrap_err(),
            MessageTypeError::NoneConfigured
        );
        assert!("message,Ping".parse::<MessageTypeList>().is_err());
    }

    #[test]
    fn test_parse_ms_duration() {
        let EnvMsDuration(duration) = "1500".parse().unwrap();
        assert_eq!(duration, time::Duration::from_millis(1500));
        assert_eq!(
            "1.5s".parse::<EnvMsDuration>().unwrap_err(),
            ParseEnvMsDurationError
        );
    }
}
