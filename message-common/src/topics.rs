//! Routing of message types to their storage relation and Kafka topic/group.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_MESSAGE_TYPE_LEN: usize = 48;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MessageTypeError {
    #[error("message type must not be empty")]
    Empty,
    #[error("message type {0:?} is longer than {MAX_MESSAGE_TYPE_LEN} bytes")]
    TooLong(String),
    #[error("message type {0:?} must match [a-z_][a-z0-9_]*")]
    InvalidCharacters(String),
    #[error("at least one message type must be configured")]
    NoneConfigured,
}

/// A configured category of message, e.g. `message` or `ping`.
///
/// Only lowercase ASCII letters, digits and `_` are accepted, with a non-digit
/// first character. Every name derived from a `MessageType` (relation, Kafka
/// topic, consumer group) is therefore a valid identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageType(String);

impl MessageType {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MessageType {
    type Err = MessageTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let Some(first) = chars.next() else {
            return Err(MessageTypeError::Empty);
        };
        if s.len() > MAX_MESSAGE_TYPE_LEN {
            return Err(MessageTypeError::TooLong(s.to_owned()));
        }
        let valid_first = first.is_ascii_lowercase() || first == '_';
        let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid_first || !valid_rest {
            return Err(MessageTypeError::InvalidCharacters(s.to_owned()));
        }

        Ok(MessageType(s.to_owned()))
    }
}

impl TryFrom<String> for MessageType {
    type Error = MessageTypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        value.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a given `MessageType` lives: its relation, Kafka topic and consumer group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub message_type: MessageType,
    pub relation: String,
    pub event_topic: String,
    pub consumer_group: String,
}

/// Map a message type to its relation, event topic and consumer group.
pub fn route(message_type: &MessageType) -> Route {
    let name = message_type.as_str();
    Route {
        message_type: message_type.clone(),
        relation: name.to_owned(),
        event_topic: format!("{name}-topic"),
        consumer_group: format!("{name}-group"),
    }
}

/// The fixed set of routes built from configuration at startup.
#[derive(Clone, Debug)]
pub struct TopicRouter {
    // Kept in configuration order, so workers and provisioning run in a stable order.
    routes: Vec<Route>,
    by_name: HashMap<String, usize>,
}

impl TopicRouter {
    pub fn new(message_types: &[MessageType]) -> Result<Self, MessageTypeError> {
        let mut routes = Vec::with_capacity(message_types.len());
        let mut by_name = HashMap::with_capacity(message_types.len());

        for message_type in message_types {
            if by_name.contains_key(message_type.as_str()) {
                continue;
            }
            by_name.insert(message_type.as_str().to_owned(), routes.len());
            routes.push(route(message_type));
        }

        if routes.is_empty() {
            return Err(MessageTypeError::NoneConfigured);
        }

        Ok(Self { routes, by_name })
    }

    /// Look up a caller supplied topic. `None` means the topic is not configured.
    pub fn resolve(&self, topic: &str) -> Option<&Route> {
        self.by_name.get(topic).map(|index| &self.routes[*index])
    }

    /// Resolve a Kafka topic name (`<type>-topic`) back to its route.
    pub fn resolve_event_topic(&self, event_topic: &str) -> Option<&Route> {
        event_topic
            .strip_suffix("-topic")
            .and_then(|name| self.resolve(name))
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    pub fn types(&self) -> impl Iterator<Item = &MessageType> {
        self.routes.iter().map(|route| &route.message_type)
    }
}
