// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Message
//!
//! The broker-agnostic message exchanged between the core and the adapters. A message
//! is immutable once built: the only way to create one is `Message::builder`.

use std::collections::BTreeMap;

/// Header carrying the destination a dead-lettered message was meant for
pub const HEADER_ORIGINAL_DESTINATION: &str = "x-original-destination";
/// Header carrying the RFC 3339 UTC time a message was dead lettered
pub const HEADER_DEAD_LETTERED_AT: &str = "x-dead-lettered-at";
/// Header carrying the number of delivery attempts before dead lettering
pub const HEADER_DELIVERY_ATTEMPTS: &str = "x-delivery-attempts";
/// Header carrying the last delivery error before dead lettering
pub const HEADER_LAST_ERROR: &str = "x-last-error";
/// Header carrying a unique message id
pub const HEADER_MESSAGE_ID: &str = "message-id";

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    destination: String,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    headers: BTreeMap<String, Vec<u8>>,
}

impl Message {
    pub fn builder(destination: &str, payload: impl Into<Vec<u8>>) -> MessageBuilder {
        MessageBuilder {
            destination: destination.to_owned(),
            key: None,
            payload: payload.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name).map(Vec::as_slice)
    }

    /// Header value as UTF-8, if present and valid.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Starts a builder for a copy of this message addressed to `destination`.
    pub fn redirect(&self, destination: &str) -> MessageBuilder {
        MessageBuilder {
            destination: destination.to_owned(),
            key: self.key.clone(),
            payload: self.payload.clone(),
            headers: self.headers.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageBuilder {
    destination: String,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    headers: BTreeMap<String, Vec<u8>>,
}

impl MessageBuilder {
    pub fn key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn maybe_key(mut self, key: Option<&[u8]>) -> Self {
        self.key = key.map(<[u8]>::to_vec);
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(name.to_owned(), value.into());
        self
    }

    pub fn headers(mut self, headers: BTreeMap<String, Vec<u8>>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn build(self) -> Message {
        Message {
            destination: self.destination,
            key: self.key,
            payload: self.payload,
            headers: self.headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_redirect_keeping_key_payload_and_headers() {
        let msg = Message::builder("orders", b"{}".to_vec())
            .key("order-1")
            .header("tenant", "acme")
            .build();

        let dlq = msg
            .redirect("dlq.topic")
            .header(HEADER_ORIGINAL_DESTINATION, msg.destination())
            .build();

        assert_eq!(dlq.destination(), "dlq.topic");
        assert_eq!(dlq.key(), Some(&b"order-1"[..]));
        assert_eq!(dlq.payload(), b"{}");
        assert_eq!(dlq.header_str("tenant"), Some("acme"));
        assert_eq!(dlq.header_str(HEADER_ORIGINAL_DESTINATION), Some("orders"));
        assert_eq!(msg.header(HEADER_ORIGINAL_DESTINATION), None);
    }
}
