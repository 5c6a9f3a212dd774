//! `LogChannel`: an adapter that "delivers" by emitting a tracing event.
//!
//! Used by the `worker` binary when no real transport is wired in. It still
//! honours the dispatch contract: the recipient must be present in the
//! context, and a repeated [`DispatchKey`] is acknowledged without a second
//! delivery. Only the most recent keys are remembered.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::{Channel, ChannelAdapter, DispatchError, DispatchKey, DispatchReceipt, DispatchRequest};

/// How many dispatch keys a [`LogChannel`] remembers by default.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Insertion-ordered key set that forgets its oldest entry when full.
struct RecentKeys {
    capacity: usize,
    order: VecDeque<DispatchKey>,
    keys: HashSet<DispatchKey>,
}

impl RecentKeys {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            keys: HashSet::new(),
        }
    }

    /// `false` if the key is already remembered.
    fn insert(&mut self, key: &DispatchKey) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.keys.insert(key.clone());
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

pub struct LogChannel {
    channel: Channel,
    /// Context key holding the recipient address.
    recipient_key: String,
    delivered: Mutex<RecentKeys>,
}

impl LogChannel {
    pub fn new(channel: Channel, recipient_key: impl Into<String>) -> Self {
        Self::with_capacity(channel, recipient_key, DEFAULT_DEDUP_CAPACITY)
    }

    /// Like [`new`](Self::new), remembering at most `capacity` dispatch keys.
    pub fn with_capacity(
        channel: Channel,
        recipient_key: impl Into<String>,
        capacity: usize,
    ) -> Self {
        Self {
            channel,
            recipient_key: recipient_key.into(),
            delivered: Mutex::new(RecentKeys::new(capacity)),
        }
    }

    /// Email adapter reading the recipient from `context.email`.
    pub fn email() -> Self {
        Self::new(Channel::Email, "email")
    }

    /// SMS adapter reading the recipient from `context.phone`.
    pub fn sms() -> Self {
        Self::new(Channel::Sms, "phone")
    }

    fn message_id(key: &DispatchKey) -> String {
        format!("log:{key}")
    }
}

#[async_trait]
impl ChannelAdapter for LogChannel {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        let recipient = request
            .context
            .get(&self.recipient_key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                DispatchError::Rejected(format!(
                    "context has no '{}' for {} delivery",
                    self.recipient_key, self.channel
                ))
            })?;

        let mut delivered = self
            .delivered
            .lock()
            .map_err(|_| DispatchError::Transient("delivery log poisoned".into()))?;

        if !delivered.insert(&request.key) {
            return Ok(DispatchReceipt {
                message_id: Self::message_id(&request.key),
                duplicate: true,
            });
        }

        info!(
            channel = %self.channel,
            key = %request.key,
            recipient,
            bytes = request.payload.len(),
            "delivered notification"
        );

        Ok(DispatchReceipt {
            message_id: Self::message_id(&request.key),
            duplicate: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn request(context: serde_json::Value, attempt: u32) -> DispatchRequest {
        DispatchRequest {
            key: DispatchKey {
                trigger_instance_id: Uuid::nil(),
                node_id: "welcome".into(),
                attempt_number: attempt,
            },
            workflow_id: Uuid::nil(),
            channel: Channel::Email,
            payload: "hello".into(),
            context,
        }
    }

    #[tokio::test]
    async fn same_key_is_acknowledged_as_duplicate() {
        let adapter = LogChannel::email();
        let ctx = json!({ "email": "ada@example.com" });

        let first = adapter.dispatch(&request(ctx.clone(), 1)).await.unwrap();
        let again = adapter.dispatch(&request(ctx.clone(), 1)).await.unwrap();
        let next = adapter.dispatch(&request(ctx, 2)).await.unwrap();

        assert!(!first.duplicate);
        assert!(again.duplicate);
        assert_eq!(first.message_id, again.message_id);
        assert!(!next.duplicate);
    }

    #[tokio::test]
    async fn missing_recipient_is_rejected() {
        let adapter = LogChannel::sms();
        let err = adapter
            .dispatch(&request(json!({ "email": "ada@example.com" }), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn remembered_keys_are_bounded() {
        let adapter = LogChannel::with_capacity(Channel::Email, "email", 2);
        let ctx = json!({ "email": "ada@example.com" });

        for attempt in 1..=5 {
            adapter.dispatch(&request(ctx.clone(), attempt)).await.unwrap();
        }
        assert_eq!(adapter.delivered.lock().unwrap().len(), 2);

        // The newest keys are still deduplicated; the oldest were forgotten.
        assert!(adapter.dispatch(&request(ctx.clone(), 5)).await.unwrap().duplicate);
        assert!(!adapter.dispatch(&request(ctx, 1)).await.unwrap().duplicate);
    }
}
