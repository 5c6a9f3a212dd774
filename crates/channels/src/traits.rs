//! The `ChannelAdapter` trait: the contract every delivery channel must fulfil.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::DispatchError;

/// Delivery channel a rendered payload is sent through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Sms => write!(f, "sms"),
        }
    }
}

/// Identifies one delivery attempt.
///
/// A re-dispatch after a crash or a lease expiry carries the same instance
/// and node but a higher `attempt_number`; adapters use the key to recognise
/// a repeat of the exact same attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchKey {
    pub trigger_instance_id: Uuid,
    pub node_id: String,
    pub attempt_number: u32,
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.trigger_instance_id, self.node_id, self.attempt_number
        )
    }
}

/// Everything an adapter needs to deliver one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub key: DispatchKey,
    pub workflow_id: Uuid,
    pub channel: Channel,
    /// Rendered message body.
    pub payload: String,
    /// Trigger context; adapters read recipient details from it.
    pub context: Value,
}

/// Acknowledgement returned by a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    /// Transport-side message identifier.
    pub message_id: String,
    /// `true` when the adapter recognised the key and did not send again.
    pub duplicate: bool,
}

/// The core channel trait.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// The channel this adapter serves.
    fn channel(&self) -> Channel;

    /// Deliver the rendered payload.
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError>;
}
