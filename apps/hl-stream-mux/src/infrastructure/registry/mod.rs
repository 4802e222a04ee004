//! Fast Subscription Lookup Index
//!
//! Concurrent-read registry of subscription snapshots, kept eventually
//! consistent by the coordinator: every write originates from the
//! coordinator's serial loop after a state transition, so readers outside
//! the loop never contend with routing decisions — they only take a brief
//! read lock on a plain map of snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::domain::subscription::{SubscriptionId, SubscriptionSnapshot};

/// Shared read-mostly index of subscription snapshots.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionIndex {
    inner: Arc<RwLock<HashMap<SubscriptionId, SubscriptionSnapshot>>>,
}

impl SubscriptionIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the snapshot for one subscription.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<SubscriptionSnapshot> {
        self.inner.read().get(id).cloned()
    }

    /// List all subscription snapshots.
    #[must_use]
    pub fn list(&self) -> Vec<SubscriptionSnapshot> {
        self.inner.read().values().cloned().collect()
    }

    /// List snapshots whose principal matches `principal`
    /// (case-insensitive).
    #[must_use]
    pub fn for_principal(&self, principal: &str) -> Vec<SubscriptionSnapshot> {
        let wanted = principal.to_lowercase();
        self.inner
            .read()
            .values()
            .filter(|snapshot| snapshot.principal().as_deref() == Some(wanted.as_str()))
            .cloned()
            .collect()
    }

    /// Number of indexed subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Insert or replace a snapshot. Coordinator-only.
    pub(crate) fn publish(&self, snapshot: SubscriptionSnapshot) {
        self.inner.write().insert(snapshot.id.clone(), snapshot);
    }

    /// Remove a snapshot. Coordinator-only.
    pub(crate) fn remove(&self, id: &str) {
        self.inner.write().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::domain::feed::{ConnectionClass, FeedKind};

    fn snapshot(id: &str, user: Option<&str>) -> SubscriptionSnapshot {
        let mut params = crate::domain::feed::FeedParams::new();
        if let Some(user) = user {
            params.insert("user".to_string(), json!(user));
        }
        SubscriptionSnapshot {
            id: id.to_string(),
            kind: FeedKind::UserFills,
            params,
            connection_key: "user:test".to_string(),
            connection_class: ConnectionClass::UserGrouped,
            alive: true,
            subscribed_at: Utc::now(),
            message_count: 0,
            last_message_at: None,
        }
    }

    #[test]
    fn publish_get_remove() {
        let index = SubscriptionIndex::new();
        assert!(index.is_empty());

        index.publish(snapshot("sub-1", Some("0xABC")));
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("sub-1").unwrap().id, "sub-1");

        index.remove("sub-1");
        assert!(index.get("sub-1").is_none());
    }

    #[test]
    fn principal_lookup_is_case_insensitive() {
        let index = SubscriptionIndex::new();
        index.publish(snapshot("sub-1", Some("0xAbCd")));
        index.publish(snapshot("sub-2", Some("0xffff")));
        index.publish(snapshot("sub-3", None));

        let matches = index.for_principal("0XABCD");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "sub-1");
    }

    #[test]
    fn publish_replaces_existing_snapshot() {
        let index = SubscriptionIndex::new();
        index.publish(snapshot("sub-1", Some("0xABC")));

        let mut updated = snapshot("sub-1", Some("0xABC"));
        updated.message_count = 42;
        index.publish(updated);

        assert_eq!(index.len(), 1);
        assert_eq!(index.get("sub-1").unwrap().message_count, 42);
    }
}
