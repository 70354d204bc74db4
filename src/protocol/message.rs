//! Protocol message definitions
//!
//! Message type tags and the structured payload carried after the header.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Message type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Claim an identity on the control channel
    Login = 0x01,
    /// Public text, sent as a datagram
    BroadcastText = 0x03,
    /// Server receipt of a datagram, sent on the control channel
    Ack = 0x04,
    /// Server push of every logged-in identity
    UserList = 0x05,
    /// One-to-one text, sent as a datagram
    PrivateText = 0x06,
    /// Clean session end
    Logout = 0x09,
    PingRequest = 0x0A,
    PingResponse = 0x0B,
}

impl MessageType {
    /// Get the on-wire tag
    pub fn type_id(self) -> u8 {
        self as u8
    }

    /// Check if this type travels over the datagram transport
    pub fn is_datagram(self) -> bool {
        matches!(self, MessageType::BroadcastText | MessageType::PrivateText)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Login),
            0x03 => Ok(MessageType::BroadcastText),
            0x04 => Ok(MessageType::Ack),
            0x05 => Ok(MessageType::UserList),
            0x06 => Ok(MessageType::PrivateText),
            0x09 => Ok(MessageType::Logout),
            0x0A => Ok(MessageType::PingRequest),
            0x0B => Ok(MessageType::PingResponse),
            other => Err(other),
        }
    }
}

/// A single payload value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Text(String),
    List(Vec<String>),
}

/// String-keyed payload map
///
/// Keys in use are `text`, `recipient` and `users`; unknown keys survive a
/// decode/encode cycle untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, PayloadValue>);

impl Payload {
    pub const TEXT: &'static str = "text";
    pub const RECIPIENT: &'static str = "recipient";
    pub const USERS: &'static str = "users";

    pub fn new() -> Self {
        Self::default()
    }

    /// Payload of a public text message
    pub fn broadcast(text: impl Into<String>) -> Self {
        Self::new().with_str(Self::TEXT, text)
    }

    /// Payload of a private text message
    pub fn private(text: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self::broadcast(text).with_str(Self::RECIPIENT, recipient)
    }

    /// Payload of a ping request or response
    pub fn ping(recipient: impl Into<String>) -> Self {
        Self::new().with_str(Self::RECIPIENT, recipient)
    }

    /// Payload of a user list push
    pub fn user_list(users: Vec<String>) -> Self {
        let mut payload = Self::new();
        payload.insert(Self::USERS, PayloadValue::List(users));
        payload
    }

    pub fn with_str(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, PayloadValue::Text(value.into()));
        self
    }

    pub fn insert(&mut self, key: &str, value: PayloadValue) {
        self.0.insert(key.to_string(), value);
    }

    /// Get a string value; lists yield `None`
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(PayloadValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.get_str(Self::TEXT)
    }

    pub fn recipient(&self) -> Option<&str> {
        self.get_str(Self::RECIPIENT)
    }

    pub fn users(&self) -> Option<&[String]> {
        match self.0.get(Self::USERS) {
            Some(PayloadValue::List(users)) => Some(users),
            _ => None,
        }
    }
}
