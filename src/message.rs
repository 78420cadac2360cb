// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Payloads
//!
//! Outbound messages are JSON-encoded when published and kept as bytes while
//! buffered; inbound deliveries are decoded back into the application type.
//! `serde_json` is built with `arbitrary_precision`, so integers past 2^53
//! travel as exact numbers instead of going through `f64`.

use crate::{broker::RawDelivery, errors::AmqpError};
use serde::{de::DeserializeOwned, Serialize};

/// A message waiting in the producer buffer for its broker confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub(crate) id: u64,
    pub(crate) payload: Vec<u8>,
}

impl PendingMessage {
    pub fn encode<M: Serialize + ?Sized>(id: u64, message: &M) -> Result<Self, AmqpError> {
        let payload = serde_json::to_vec(message)
            .map_err(|err| AmqpError::SerializePayloadError(err.to_string()))?;

        Ok(PendingMessage { id, payload })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// One received message together with its decoded value.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundDelivery<M> {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub message: M,
}

impl<M: DeserializeOwned> InboundDelivery<M> {
    pub fn decode(raw: RawDelivery) -> Result<Self, AmqpError> {
        let message = serde_json::from_slice(&raw.data)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

        Ok(InboundDelivery {
            delivery_tag: raw.delivery_tag,
            payload: raw.data,
            message,
        })
    }
}
