//! Notification fan-out: delivering transitions to subscribers and poll
//! results to per-endpoint delivery targets.

use async_trait::async_trait;
use regex::RegexBuilder;
use thiserror::Error;

use crate::db::{DeliveryTarget, Store};
use crate::probe::Snapshot;

/// Delivery error types.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("recipient blocked delivery")]
    Blocked,
}

/// Injected subscriber-notification capability (e.g. direct messages).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        subscriber_id: i64,
        payload: &serde_json::Value,
    ) -> Result<(), NotifyError>;
}

/// Injected presentation sink for delivery targets.
///
/// Returns a replacement message reference when the sink had to recreate
/// its rendered message, so the tracking row can be repointed.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn render(
        &self,
        target: &DeliveryTarget,
        payload: &serde_json::Value,
    ) -> Result<Option<i64>, NotifyError>;
}

/// Notifier that only logs; stand-in until a real transport is wired up.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        subscriber_id: i64,
        payload: &serde_json::Value,
    ) -> Result<(), NotifyError> {
        tracing::info!("Notify {}: {}", subscriber_id, payload);
        Ok(())
    }
}

/// Sink that only logs.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn render(
        &self,
        target: &DeliveryTarget,
        payload: &serde_json::Value,
    ) -> Result<Option<i64>, NotifyError> {
        tracing::info!(
            "Render for group {} sink {}: {}",
            target.group_id,
            target.sink_id,
            payload
        );
        Ok(None)
    }
}

/// Build the presentation payload for a snapshot.
pub fn presentation_payload(snapshot: &Snapshot, status: &str) -> serde_json::Value {
    serde_json::json!({
        "name": snapshot.name,
        "online": snapshot.online,
        "label": snapshot.label,
        "population": snapshot.population,
        "capacity": snapshot.capacity,
        "status": status,
    })
}

/// Does an interest pattern match a label?
///
/// Exact labels compare case-insensitively. Anything with regex
/// metacharacters is compiled case-insensitively; if it fails to compile
/// it degrades to a substring test.
pub fn pattern_matches(pattern: &str, label: &str) -> bool {
    if pattern.eq_ignore_ascii_case(label) {
        return true;
    }

    let is_plain = pattern
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ' ');
    if is_plain {
        return label.to_lowercase().contains(&pattern.to_lowercase());
    }

    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => re.is_match(label),
        Err(_) => label.to_lowercase().contains(&pattern.to_lowercase()),
    }
}

/// Deliver a transition to every subscriber with a matching pattern.
///
/// Each delivery is attempted independently: one failing recipient never
/// blocks the rest. Best effort, at most once per transition. Returns how
/// many deliveries succeeded.
pub async fn fanout_subscribers(
    store: &Store,
    notifier: &dyn Notifier,
    label: &str,
    payload: &serde_json::Value,
) -> usize {
    let subscriptions = match store.all_subscriptions() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Fanout: failed to list subscriptions: {}", e);
            return 0;
        }
    };

    // One delivery per subscriber, however many of their patterns match
    let mut matched: Vec<i64> = subscriptions
        .iter()
        .filter(|s| pattern_matches(&s.pattern, label))
        .map(|s| s.subscriber_id)
        .collect();
    matched.sort_unstable();
    matched.dedup();

    let mut delivered = 0;
    for subscriber_id in matched {
        match notifier.notify(subscriber_id, payload).await {
            Ok(()) => delivered += 1,
            Err(e) => {
                tracing::warn!("Cannot notify {}: {}", subscriber_id, e);
            }
        }
    }

    delivered
}

/// Render the latest payload to every delivery target for an endpoint.
///
/// A sink that recreated its message hands back a new reference, which is
/// persisted so the next cycle edits the right message. Failures are
/// isolated per target.
pub async fn render_targets(
    store: &Store,
    sink: &dyn Sink,
    address: &str,
    payload: &serde_json::Value,
) {
    let targets = match store.get_delivery_targets(address) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!("Fanout: failed to load delivery targets for {}: {}", address, e);
            return;
        }
    };

    for target in targets {
        match sink.render(&target, payload).await {
            Ok(Some(new_ref)) => {
                if let Err(e) = store.update_message_ref(address, target.group_id, new_ref) {
                    tracing::error!(
                        "Fanout: failed to update message ref for {} group {}: {}",
                        address,
                        target.group_id,
                        e
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    "Cannot render to group {} sink {}: {}",
                    target.group_id,
                    target.sink_id,
                    e
                );
            }
        }
    }
}
