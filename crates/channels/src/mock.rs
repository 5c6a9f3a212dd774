//! `MockChannel`: a test double for `ChannelAdapter`.
//!
//! Useful in unit and integration tests where a real transport is either
//! unavailable or irrelevant.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{Channel, ChannelAdapter, DispatchError, DispatchKey, DispatchReceipt, DispatchRequest};

/// Behaviour injected into `MockChannel` at construction time.
pub enum MockBehaviour {
    /// Always deliver.
    Deliver,
    /// Fail with a `Transient` error for the first `n` calls, then deliver.
    FailTransient { times: usize, message: String },
    /// Always fail with a `Rejected` error.
    Reject(String),
}

/// A mock channel that records every request it receives and answers with a
/// programmer-specified result.
pub struct MockChannel {
    pub channel: Channel,
    pub behaviour: MockBehaviour,
    /// All requests seen by this channel (in call order).
    pub calls: Arc<Mutex<Vec<DispatchRequest>>>,
}

impl MockChannel {
    /// Create a mock that always delivers.
    pub fn delivering(channel: Channel) -> Self {
        Self::with_behaviour(channel, MockBehaviour::Deliver)
    }

    /// Create a mock that fails transiently `times` times before delivering.
    pub fn failing_transient(channel: Channel, times: usize, msg: impl Into<String>) -> Self {
        Self::with_behaviour(
            channel,
            MockBehaviour::FailTransient {
                times,
                message: msg.into(),
            },
        )
    }

    /// Create a mock that rejects every message.
    pub fn rejecting(channel: Channel, msg: impl Into<String>) -> Self {
        Self::with_behaviour(channel, MockBehaviour::Reject(msg.into()))
    }

    fn with_behaviour(channel: Channel, behaviour: MockBehaviour) -> Self {
        Self {
            channel,
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of times `dispatch` has been called.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Every request received, in call order.
    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of distinct dispatch keys received.
    pub fn distinct_keys(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.key.clone())
            .collect::<HashSet<DispatchKey>>()
            .len()
    }
}

#[async_trait]
impl ChannelAdapter for MockChannel {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        let seen = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len()
        };

        match &self.behaviour {
            MockBehaviour::Deliver => {}
            MockBehaviour::FailTransient { times, message } if seen <= *times => {
                return Err(DispatchError::Transient(message.clone()));
            }
            MockBehaviour::FailTransient { .. } => {}
            MockBehaviour::Reject(msg) => return Err(DispatchError::Rejected(msg.clone())),
        }

        Ok(DispatchReceipt {
            message_id: format!("mock:{}", request.key),
            duplicate: false,
        })
    }
}
