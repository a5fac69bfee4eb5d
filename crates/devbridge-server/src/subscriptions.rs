//! Log-stream and channel subscriptions.

use std::collections::{BTreeMap, HashMap};

use devbridge_core::{BridgeError, ConnectionId, Envelope, LogEntry, LogFilter, SubscriptionId};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::registry::ConnectionRegistry;

/// A log-stream subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSubscription {
    /// Caller-chosen key.
    pub subscription_id: SubscriptionId,
    /// Connection that receives deliveries.
    #[serde(skip)]
    pub owner: ConnectionId,
    /// Delivery criteria.
    pub filters: LogFilter,
}

/// Subscriptions of one connection, as reported by `list-subscriptions`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionListing {
    /// Log-stream subscriptions.
    pub logs: Vec<LogSubscription>,
    /// Subscribed channel names.
    pub channels: Vec<String>,
}

/// All subscriptions. Owned by the router behind its lock.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    logs: BTreeMap<SubscriptionId, LogSubscription>,
    channels: HashMap<String, Vec<ConnectionId>>,
}

impl SubscriptionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a log subscription.
    ///
    /// The same owner re-subscribing replaces its filters; an id owned by a
    /// different connection is rejected.
    pub fn subscribe_log(
        &mut self,
        owner: &ConnectionId,
        subscription_id: SubscriptionId,
        filters: LogFilter,
    ) -> Result<(), BridgeError> {
        if let Some(existing) = self.logs.get_mut(&subscription_id) {
            if &existing.owner != owner {
                return Err(BridgeError::DuplicateSubscription {
                    subscription_id: subscription_id.into_inner(),
                });
            }
            existing.filters = filters;
            return Ok(());
        }
        let sub = LogSubscription {
            subscription_id: subscription_id.clone(),
            owner: owner.clone(),
            filters,
        };
        let _ = self.logs.insert(subscription_id, sub);
        Ok(())
    }

    /// Remove a log subscription owned by `owner`.
    pub fn unsubscribe_log(
        &mut self,
        owner: &ConnectionId,
        subscription_id: &SubscriptionId,
    ) -> Result<(), BridgeError> {
        match self.logs.get(subscription_id) {
            Some(sub) if &sub.owner == owner => {
                let _ = self.logs.remove(subscription_id);
                Ok(())
            }
            _ => Err(BridgeError::SubscriptionNotFound),
        }
    }

    /// Subscribe `owner` to `channel`. Returns `false` if it already was.
    pub fn subscribe_channel(&mut self, owner: &ConnectionId, channel: &str) -> bool {
        let members = self.channels.entry(channel.to_owned()).or_default();
        if members.contains(owner) {
            return false;
        }
        members.push(owner.clone());
        true
    }

    /// Unsubscribe `owner` from `channel`. Returns `false` if it was not
    /// subscribed.
    pub fn unsubscribe_channel(&mut self, owner: &ConnectionId, channel: &str) -> bool {
        let Some(members) = self.channels.get_mut(channel) else {
            return false;
        };
        let before = members.len();
        members.retain(|m| m != owner);
        let removed = members.len() != before;
        if members.is_empty() {
            let _ = self.channels.remove(channel);
        }
        removed
    }

    /// Deliver a log entry to every matching subscription.
    ///
    /// Returns the number of deliveries queued.
    pub fn publish_log(&self, entry: &LogEntry, connections: &ConnectionRegistry) -> usize {
        let data = match serde_json::to_value(entry) {
            Ok(data) => data,
            Err(_) => return 0,
        };
        let mut delivered = 0;
        for sub in self.logs.values().filter(|s| s.filters.matches(entry)) {
            let Some(conn) = connections.get(&sub.owner) else {
                continue;
            };
            let event = Envelope::new("log-event")
                .with("subscriptionId", json!(sub.subscription_id))
                .with("data", data.clone())
                .stamped();
            if conn.send_envelope(&event) {
                delivered += 1;
            } else {
                debug!(
                    conn_id = %conn.id,
                    subscription_id = %sub.subscription_id,
                    "log event dropped"
                );
            }
        }
        delivered
    }

    /// Deliver `data` to every subscriber of `channel`.
    ///
    /// Returns the number of deliveries queued.
    pub fn publish_channel(
        &self,
        channel: &str,
        data: &Value,
        connections: &ConnectionRegistry,
    ) -> usize {
        let Some(members) = self.channels.get(channel) else {
            return 0;
        };
        let event = Envelope::new("channel-event")
            .with("channel", json!(channel))
            .with("data", data.clone())
            .stamped();
        members
            .iter()
            .filter_map(|id| connections.get(id))
            .filter(|conn| conn.send_envelope(&event))
            .count()
    }

    /// Remove everything owned by `owner`. Idempotent.
    ///
    /// Returns the number of subscriptions removed.
    pub fn cleanup(&mut self, owner: &ConnectionId) -> usize {
        let before = self.logs.len();
        self.logs.retain(|_, sub| &sub.owner != owner);
        let mut removed = before - self.logs.len();

        self.channels.retain(|_, members| {
            let len = members.len();
            members.retain(|m| m != owner);
            removed += len - members.len();
            !members.is_empty()
        });
        removed
    }

    /// Subscriptions owned by `owner`, log subscriptions in id order.
    pub fn list(&self, owner: &ConnectionId) -> SubscriptionListing {
        let logs = self
            .logs
            .values()
            .filter(|s| &s.owner == owner)
            .cloned()
            .collect();
        let mut channels: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, members)| members.contains(owner))
            .map(|(name, _)| name.clone())
            .collect();
        channels.sort();
        SubscriptionListing { logs, channels }
    }

    /// Total log subscriptions.
    pub fn log_count(&self) -> usize {
        self.logs.len()
    }

    /// Total (channel, owner) pairs.
    pub fn channel_count(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.logs.clear();
        self.channels.clear();
    }
}
