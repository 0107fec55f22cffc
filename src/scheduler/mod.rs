//! Poll scheduler: one independent cycle per tracked endpoint.

mod detector;
mod samples;
mod tracker;

pub use detector::*;
pub use samples::*;
pub use tracker::*;

use crate::config::Config;
use crate::db::{DeliveryTarget, Endpoint, Store};
use crate::notify::{fanout_subscribers, presentation_payload, render_targets, Notifier, Sink};
use crate::probe::{ProbeError, Prober, Snapshot};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// The main scheduler. Owns the stop channel for every endpoint's polling
/// loop; loops for different endpoints never share mutable state.
pub struct Scheduler {
    store: Arc<Store>,
    prober: Arc<dyn Prober>,
    notifier: Arc<dyn Notifier>,
    sink: Arc<dyn Sink>,
    config: Config,
    stop_chans: Arc<RwLock<HashMap<String, tokio::sync::broadcast::Sender<()>>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        prober: Arc<dyn Prober>,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn Sink>,
        config: Config,
    ) -> Self {
        Self {
            store,
            prober,
            notifier,
            sink,
            config,
            stop_chans: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start polling every endpoint registered in the store.
    pub async fn start(&self) -> Result<(), crate::db::StoreError> {
        let endpoints = self.store.get_endpoints()?;

        tracing::info!("Starting scheduler with {} endpoints", endpoints.len());

        for endpoint in endpoints {
            self.add_endpoint(endpoint).await;
        }

        Ok(())
    }

    /// Register an endpoint and a delivery target, then begin polling.
    pub async fn track(
        &self,
        endpoint: Endpoint,
        target: DeliveryTarget,
    ) -> Result<(), crate::db::StoreError> {
        self.store.add_endpoint(&endpoint)?;
        self.store.add_delivery_target(&target)?;
        self.add_endpoint(endpoint).await;
        Ok(())
    }

    /// Remove one group's tracking of an endpoint. When the last delivery
    /// target goes away the endpoint itself is removed and its loop
    /// cancelled.
    pub async fn untrack(&self, address: &str, group_id: i64) -> Result<(), crate::db::StoreError> {
        self.store.remove_delivery_target(address, group_id)?;

        if self.store.get_delivery_targets(address)?.is_empty() {
            self.store.remove_endpoint(address)?;
            self.remove_endpoint(address).await;
        }
        Ok(())
    }

    /// Begin a polling loop for an endpoint. No-op if one is already
    /// running or the endpoint was already abandoned.
    pub async fn add_endpoint(&self, endpoint: Endpoint) {
        // Malformed addresses are skipped, never fatal to the scheduler
        if !endpoint.address.contains(':') {
            tracing::warn!("Skipping endpoint with malformed address: {:?}", endpoint.address);
            return;
        }

        if endpoint.failure_count >= self.config.abandon_threshold as i64 {
            tracing::warn!(
                "Not scheduling abandoned endpoint {} ({} consecutive failures)",
                endpoint.address,
                endpoint.failure_count
            );
            return;
        }

        let mut stop_chans = self.stop_chans.write().await;

        if stop_chans.contains_key(&endpoint.address) {
            return; // Already running
        }

        let (stop_tx, _) = tokio::sync::broadcast::channel(1);
        stop_chans.insert(endpoint.address.clone(), stop_tx.clone());
        drop(stop_chans);

        tracing::info!("Scheduler: Adding endpoint {}", endpoint.address);

        let address = endpoint.address.clone();
        let stop_chans = self.stop_chans.clone();
        let cycle = EndpointCycle::new(
            endpoint,
            self.store.clone(),
            self.notifier.clone(),
            self.sink.clone(),
            &self.config,
        );
        let prober = self.prober.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            run_poll_loop(cycle, prober, config, stop_tx.subscribe()).await;

            // Clean up when done
            let mut chans = stop_chans.write().await;
            chans.remove(&address);
        });
    }

    /// Cancel an endpoint's polling loop. An in-flight cycle may finish
    /// once but is never rescheduled.
    pub async fn remove_endpoint(&self, address: &str) {
        let mut stop_chans = self.stop_chans.write().await;

        if let Some(stop_tx) = stop_chans.remove(address) {
            let _ = stop_tx.send(());
            tracing::info!("Scheduler: Removed endpoint {}", address);
        }
    }

    /// Is a polling loop currently scheduled for this address?
    pub async fn is_tracking(&self, address: &str) -> bool {
        self.stop_chans.read().await.contains_key(address)
    }
}

/// Run the polling loop for a single endpoint until stopped or abandoned.
async fn run_poll_loop(
    mut cycle: EndpointCycle,
    prober: Arc<dyn Prober>,
    config: Config,
    mut stop_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let probe_timeout = config.probe_timeout();
    let mut interval = tokio::time::interval(config.poll_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                // Jitter to avoid thundering herd across endpoints
                let jitter = rand::random::<u64>() % 100;
                tokio::time::sleep(Duration::from_millis(jitter)).await;

                // Guard against prober implementations that ignore their
                // timeout; a stuck probe must not stall this loop forever.
                let result = match tokio::time::timeout(
                    probe_timeout + Duration::from_secs(1),
                    prober.probe(&cycle.address, probe_timeout),
                )
                .await
                {
                    Ok(r) => r,
                    Err(_) => Err(ProbeError::Timeout(probe_timeout)),
                };

                // The store/delivery phase gets its own deadline; overrun
                // is recoverable and scoped to this cycle only.
                match tokio::time::timeout(
                    config.cycle_deadline(),
                    cycle.observe(result, Utc::now()),
                )
                .await
                {
                    Ok(outcome) => {
                        if outcome.abandoned {
                            break;
                        }
                    }
                    Err(_) => {
                        tracing::warn!(
                            "Cycle for {} exceeded {}s deadline, skipping",
                            cycle.address,
                            config.cycle_deadline_secs
                        );
                    }
                }
            }
        }
    }

    tracing::info!("Finished polling loop for {}", cycle.address);
}

/// What one cycle did, for callers and tests.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub transitioned: bool,
    pub tracker_event: Option<TrackerEvent>,
    pub abandoned: bool,
    pub notified: usize,
}

/// Live polling state for one endpoint. Owned exclusively by that
/// endpoint's loop; the store holds the durable projection.
pub struct EndpointCycle {
    pub address: String,
    name: String,
    notifications_enabled: bool,
    warn_threshold: u64,
    store: Arc<Store>,
    notifier: Arc<dyn Notifier>,
    sink: Arc<dyn Sink>,
    last_label: String,
    tracker: RetryTracker,
    samples: SampleBuffer,
    record_open_time: DateTime<Utc>,
}

impl EndpointCycle {
    pub fn new(
        endpoint: Endpoint,
        store: Arc<Store>,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn Sink>,
        config: &Config,
    ) -> Self {
        Self {
            last_label: endpoint.last_label.clone(),
            tracker: RetryTracker::with_failures(
                config.warn_threshold,
                config.abandon_threshold,
                endpoint.failure_count.max(0) as u64,
            ),
            samples: SampleBuffer::new(config.sample_depth),
            record_open_time: endpoint.last_transition.unwrap_or_else(Utc::now),
            name: if endpoint.name.is_empty() {
                endpoint.address.clone()
            } else {
                endpoint.name.clone()
            },
            notifications_enabled: endpoint.notifications_enabled,
            warn_threshold: config.warn_threshold,
            address: endpoint.address,
            store,
            notifier,
            sink,
        }
    }

    /// Process one probe result. Phases run in strict order: detect,
    /// close/open records, retry tracker, fan-out, delivery rendering.
    pub async fn observe(
        &mut self,
        result: Result<Snapshot, ProbeError>,
        now: DateTime<Utc>,
    ) -> CycleOutcome {
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::debug!("Probe failed for {}: {}", self.address, e);
                Snapshot::offline(&self.name)
            }
        };

        let mut outcome = CycleOutcome::default();
        let detection = detect(&self.last_label, &snapshot);
        let mut transition_deferred = false;

        // Persist the transition atomically before committing any live
        // state. If the store is unavailable this cycle's persistence is
        // skipped and the same transition is detected and retried next
        // tick, so the closed period is never lost.
        if let Detection::Transition { from, to, initial } = &detection {
            let closing = if *initial {
                None
            } else {
                let elapsed = now - self.record_open_time;
                let minutes = (elapsed.num_seconds() as f64 / 60.0).round() as i64;
                Some((from.as_str(), minutes, self.samples.average()))
            };

            match self.store.record_transition(&self.address, closing, to, now) {
                Ok(()) => {
                    self.samples.clear();
                    self.record_open_time = now;
                    self.last_label = to.clone();
                    outcome.transitioned = true;
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to persist transition for {}, retrying next tick: {}",
                        self.address,
                        e
                    );
                    transition_deferred = true;
                }
            }
        }

        // While a transition is deferred the sample belongs to neither the
        // old period nor the not-yet-opened one; drop it for this cycle.
        if snapshot.online && !transition_deferred {
            self.samples.push(snapshot.population);
            if let Err(e) = self.store.append_sample(
                &self.address,
                &self.last_label,
                now,
                self.samples.average(),
            ) {
                tracing::error!("Failed to append sample for {}: {}", self.address, e);
            }
        }

        // Retry tracker update
        let event = if snapshot.online {
            self.tracker.record_success()
        } else {
            self.tracker.record_failure()
        };
        outcome.tracker_event = event;

        if let Err(e) = self
            .store
            .set_failure_count(&self.address, self.tracker.failures() as i64)
        {
            tracing::error!("Failed to persist failure count for {}: {}", self.address, e);
        }

        if event == Some(TrackerEvent::Recovered) {
            tracing::info!("Connection established for {}", self.address);
        }

        // Fan-out, once per transition
        if outcome.transitioned && self.notifications_enabled {
            let payload = presentation_payload(&snapshot, "transition");
            outcome.notified =
                fanout_subscribers(&self.store, self.notifier.as_ref(), &self.last_label, &payload)
                    .await;
        }

        // Delivery targets see the latest snapshot regardless of change,
        // except while degraded past the warn threshold: then they get one
        // timeout notice, silence, and finally the abandonment.
        match event {
            Some(TrackerEvent::Warn) => {
                tracing::warn!("Connection timeout for {}", self.address);
                let payload = presentation_payload(&snapshot, "timeout");
                render_targets(&self.store, self.sink.as_ref(), &self.address, &payload).await;
            }
            Some(TrackerEvent::Abandon) => {
                tracing::error!(
                    "Giving up on {}: failed to respond within {} attempts",
                    self.address,
                    self.tracker.failures()
                );
                let payload = presentation_payload(&snapshot, "abandoned");
                render_targets(&self.store, self.sink.as_ref(), &self.address, &payload).await;
                if let Err(e) = self.store.remove_delivery_targets(&self.address) {
                    tracing::error!(
                        "Failed to remove delivery targets for {}: {}",
                        self.address,
                        e
                    );
                }
                outcome.abandoned = true;
            }
            _ if !snapshot.online && self.tracker.failures() >= self.warn_threshold => {
                // Already warned; stay quiet until recovery or abandonment
            }
            _ => {
                let status = if snapshot.online { "online" } else { "offline" };
                let payload = presentation_payload(&snapshot, status);
                render_targets(&self.store, self.sink.as_ref(), &self.address, &payload).await;
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyError;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingNotifier {
        count: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(
            &self,
            _subscriber_id: i64,
            _payload: &serde_json::Value,
        ) -> Result<(), NotifyError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RecordingSink {
        statuses: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn render(
            &self,
            _target: &DeliveryTarget,
            payload: &serde_json::Value,
        ) -> Result<Option<i64>, NotifyError> {
            let status = payload["status"].as_str().unwrap_or("").to_string();
            self.statuses.lock().unwrap().push(status);
            Ok(None)
        }
    }

    fn online(label: &str, population: i64) -> Result<Snapshot, ProbeError> {
        Ok(Snapshot {
            online: true,
            name: "srv".to_string(),
            label: label.to_string(),
            population,
            capacity: 32,
        })
    }

    fn offline() -> Result<Snapshot, ProbeError> {
        Err(ProbeError::Timeout(Duration::from_secs(5)))
    }

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
            + chrono::Duration::minutes(minute as i64)
    }

    struct Fixture {
        cycle: EndpointCycle,
        store: Arc<Store>,
        notifier: Arc<CountingNotifier>,
        sink: Arc<RecordingSink>,
    }

    fn fixture(subscribe_to: &[&str]) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let endpoint = Endpoint {
            address: "10.0.0.1:27015".to_string(),
            name: "srv".to_string(),
            ..Default::default()
        };
        store.add_endpoint(&endpoint).unwrap();
        store
            .add_delivery_target(&DeliveryTarget {
                address: endpoint.address.clone(),
                group_id: 1,
                sink_id: 10,
                last_message_ref: 0,
            })
            .unwrap();

        if !subscribe_to.is_empty() {
            let patterns: Vec<String> = subscribe_to.iter().map(|s| s.to_string()).collect();
            store.put_subscriptions(1, &patterns, false).unwrap();
        }

        let notifier = Arc::new(CountingNotifier {
            count: AtomicUsize::new(0),
        });
        let sink = Arc::new(RecordingSink {
            statuses: Mutex::new(Vec::new()),
        });
        let cycle = EndpointCycle::new(
            endpoint,
            store.clone(),
            notifier.clone(),
            sink.clone(),
            &Config::default(),
        );

        Fixture {
            cycle,
            store,
            notifier,
            sink,
        }
    }

    #[tokio::test]
    async fn test_constant_label_never_transitions() {
        let mut f = fixture(&[]);

        let first = f.cycle.observe(online("de_dust2", 5), ts(0)).await;
        assert!(first.transitioned); // First observation opens a record

        for i in 1..5 {
            let outcome = f.cycle.observe(online("de_dust2", 5), ts(i)).await;
            assert!(!outcome.transitioned);
        }

        let records = f.store.get_records("10.0.0.1:27015").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].occurrences, 0); // Never closed
    }

    #[tokio::test]
    async fn test_label_change_scenario() {
        // Labels [A, A, A, B, B] at populations [10, 12, 11, 20, 22]
        let mut f = fixture(&[]);

        f.cycle.observe(online("A", 10), ts(0)).await;
        f.cycle.observe(online("A", 12), ts(1)).await;
        f.cycle.observe(online("A", 11), ts(2)).await;
        let outcome = f.cycle.observe(online("B", 20), ts(30)).await;
        assert!(outcome.transitioned);
        f.cycle.observe(online("B", 22), ts(31)).await;

        let records = f.store.get_records("10.0.0.1:27015").unwrap();
        let a = records.iter().find(|r| r.label == "A").unwrap();
        let b = records.iter().find(|r| r.label == "B").unwrap();

        assert_eq!(a.occurrences, 1);
        assert_eq!(a.avg_population, 11); // From [10, 12, 11]
        assert_eq!(a.playtime_minutes, 30);
        assert_eq!(b.avg_population, 21); // From [20, 22]
        assert_eq!(b.occurrences, 0); // Still open
    }

    #[tokio::test]
    async fn test_fanout_once_per_transition() {
        let mut f = fixture(&["B"]);

        f.cycle.observe(online("A", 1), ts(0)).await;
        assert_eq!(f.notifier.count.load(Ordering::SeqCst), 0); // No match for A

        f.cycle.observe(online("B", 1), ts(1)).await;
        f.cycle.observe(online("B", 1), ts(2)).await;
        f.cycle.observe(online("B", 1), ts(3)).await;

        // Matched once on the transition, not on every poll
        assert_eq!(f.notifier.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_replayed_snapshot_is_idempotent() {
        let mut f = fixture(&["A"]);

        let first = f.cycle.observe(online("A", 3), ts(0)).await;
        let replay = f.cycle.observe(online("A", 3), ts(0)).await;

        assert!(first.transitioned);
        assert!(!replay.transitioned);
        assert_eq!(f.notifier.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_offline_preserves_label_until_recovery() {
        let mut f = fixture(&[]);

        f.cycle.observe(online("A", 5), ts(0)).await;
        f.cycle.observe(offline(), ts(1)).await;
        f.cycle.observe(offline(), ts(2)).await;

        // Recovery with the same label is not a transition
        let outcome = f.cycle.observe(online("A", 5), ts(3)).await;
        assert!(!outcome.transitioned);
        assert_eq!(f.store.get_last_label("10.0.0.1:27015").unwrap(), "A");
    }

    #[tokio::test]
    async fn test_warn_then_abandon_thresholds() {
        let mut f = fixture(&[]);

        let mut warns = 0;
        let mut abandons = 0;
        for i in 0..10_080u32 {
            let outcome = f.cycle.observe(offline(), ts(i)).await;
            match outcome.tracker_event {
                Some(TrackerEvent::Warn) => warns += 1,
                Some(TrackerEvent::Abandon) => {
                    abandons += 1;
                    assert!(outcome.abandoned);
                }
                _ => {}
            }
        }

        assert_eq!(warns, 1);
        assert_eq!(abandons, 1);

        // Abandonment removed the delivery targets
        assert!(f
            .store
            .get_delivery_targets("10.0.0.1:27015")
            .unwrap()
            .is_empty());

        // Exactly one timeout notice reached the sink, then silence until
        // the abandonment notice
        let statuses = f.sink.statuses.lock().unwrap();
        assert_eq!(statuses.iter().filter(|s| *s == "timeout").count(), 1);
        assert_eq!(statuses.iter().filter(|s| *s == "abandoned").count(), 1);
    }

    #[tokio::test]
    async fn test_recovery_resets_failure_count() {
        let mut f = fixture(&[]);

        for i in 0..15u32 {
            f.cycle.observe(offline(), ts(i)).await;
        }
        let outcome = f.cycle.observe(online("A", 1), ts(15)).await;

        assert_eq!(outcome.tracker_event, Some(TrackerEvent::Recovered));
        let endpoint = f.store.get_endpoint("10.0.0.1:27015").unwrap();
        assert_eq!(endpoint.failure_count, 0);
    }

    #[tokio::test]
    async fn test_notifications_disabled_endpoint_is_exempt() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let address = "10.0.0.1:27015";
        store
            .add_endpoint(&Endpoint {
                address: address.to_string(),
                ..Default::default()
            })
            .unwrap();
        store.set_notifications_enabled(address, false).unwrap();
        store.put_subscriptions(1, &["A".to_string()], false).unwrap();

        let notifier = Arc::new(CountingNotifier {
            count: AtomicUsize::new(0),
        });
        // The cycle picks the flag up from the stored endpoint row
        let mut cycle = EndpointCycle::new(
            store.get_endpoint(address).unwrap(),
            store.clone(),
            notifier.clone(),
            Arc::new(RecordingSink {
                statuses: Mutex::new(Vec::new()),
            }),
            &Config::default(),
        );

        let outcome = cycle.observe(online("A", 1), ts(0)).await;
        assert!(outcome.transitioned);
        assert_eq!(outcome.notified, 0);
        assert_eq!(notifier.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_transition_persist_is_retried() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let address = "10.0.0.1:27015";
        store
            .add_endpoint(&Endpoint {
                address: address.to_string(),
                name: "srv".to_string(),
                ..Default::default()
            })
            .unwrap();
        store.put_subscriptions(1, &["B".to_string()], false).unwrap();

        let notifier = Arc::new(CountingNotifier {
            count: AtomicUsize::new(0),
        });
        let mut cycle = EndpointCycle::new(
            store.get_endpoint(address).unwrap(),
            store.clone(),
            notifier.clone(),
            Arc::new(RecordingSink {
                statuses: Mutex::new(Vec::new()),
            }),
            &Config::default(),
        );

        cycle.observe(online("A", 5), ts(0)).await;

        // Sabotage the history table through a second connection
        let raw = rusqlite::Connection::open(tmp.path()).unwrap();
        raw.execute_batch("ALTER TABLE activity_history RENAME TO activity_history_gone")
            .unwrap();

        let failed = cycle.observe(online("B", 7), ts(10)).await;
        assert!(!failed.transitioned);
        // Nothing was committed: no fan-out, label still A in the store
        assert_eq!(notifier.count.load(Ordering::SeqCst), 0);
        assert_eq!(store.get_last_label(address).unwrap(), "A");

        raw.execute_batch("ALTER TABLE activity_history_gone RENAME TO activity_history")
            .unwrap();

        // Next tick re-detects the same transition and commits it
        let retried = cycle.observe(online("B", 9), ts(11)).await;
        assert!(retried.transitioned);
        assert_eq!(notifier.count.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_last_label(address).unwrap(), "B");

        let records = store.get_records(address).unwrap();
        let a = records.iter().find(|r| r.label == "A").unwrap();
        assert_eq!(a.occurrences, 1);
        assert_eq!(a.playtime_minutes, 11);
        // The sample seen while the transition was deferred was dropped
        assert_eq!(a.avg_population, 5);
    }

    struct HangingProber;

    #[async_trait]
    impl Prober for HangingProber {
        async fn probe(&self, _address: &str, _timeout: Duration) -> Result<Snapshot, ProbeError> {
            std::future::pending().await
        }
    }

    struct CountingProber {
        probes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Prober for CountingProber {
        async fn probe(&self, _address: &str, _timeout: Duration) -> Result<Snapshot, ProbeError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            online("A", 1)
        }
    }

    struct SlowSink;

    #[async_trait]
    impl Sink for SlowSink {
        async fn render(
            &self,
            _target: &DeliveryTarget,
            _payload: &serde_json::Value,
        ) -> Result<Option<i64>, crate::notify::NotifyError> {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_probe_counts_as_timeout() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let address = "10.0.0.3:27015";
        store
            .add_endpoint(&Endpoint {
                address: address.to_string(),
                ..Default::default()
            })
            .unwrap();

        let sink = Arc::new(RecordingSink {
            statuses: Mutex::new(Vec::new()),
        });
        let config = Config::default();
        let cycle = EndpointCycle::new(
            store.get_endpoint(address).unwrap(),
            store.clone(),
            Arc::new(CountingNotifier {
                count: AtomicUsize::new(0),
            }),
            sink.clone(),
            &config,
        );

        let (stop_tx, _) = tokio::sync::broadcast::channel(1);
        let handle = tokio::spawn(run_poll_loop(
            cycle,
            Arc::new(HangingProber),
            config,
            stop_tx.subscribe(),
        ));

        // Three poll intervals of virtual time; every probe hangs forever
        tokio::time::sleep(Duration::from_secs(185)).await;
        let _ = stop_tx.send(());
        handle.await.unwrap();

        // The guard converted each hang into an offline cycle
        let endpoint = store.get_endpoint(address).unwrap();
        assert!(endpoint.failure_count >= 3);
        let statuses = sink.statuses.lock().unwrap();
        assert!(statuses.iter().all(|s| s == "offline"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_deadline_overrun_keeps_schedule() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let address = "10.0.0.5:27015";
        store
            .add_endpoint(&Endpoint {
                address: address.to_string(),
                ..Default::default()
            })
            .unwrap();
        store
            .add_delivery_target(&DeliveryTarget {
                address: address.to_string(),
                group_id: 1,
                sink_id: 10,
                last_message_ref: 0,
            })
            .unwrap();

        let probes = Arc::new(AtomicUsize::new(0));
        let config = Config::default();
        let cycle = EndpointCycle::new(
            store.get_endpoint(address).unwrap(),
            store.clone(),
            Arc::new(CountingNotifier {
                count: AtomicUsize::new(0),
            }),
            Arc::new(SlowSink),
            &config,
        );

        let (stop_tx, _) = tokio::sync::broadcast::channel(1);
        let handle = tokio::spawn(run_poll_loop(
            cycle,
            Arc::new(CountingProber {
                probes: probes.clone(),
            }),
            config,
            stop_tx.subscribe(),
        ));

        // Every cycle's render phase blows the 30s deadline; the loop must
        // keep ticking on schedule regardless
        tokio::time::sleep(Duration::from_secs(185)).await;
        let _ = stop_tx.send(());
        handle.await.unwrap();

        assert!(probes.load(Ordering::SeqCst) >= 3);
        // The transition persisted before the overrun hit
        assert_eq!(store.get_last_label(address).unwrap(), "A");
    }

    #[tokio::test]
    async fn test_sink_sees_every_snapshot() {
        let mut f = fixture(&[]);

        f.cycle.observe(online("A", 1), ts(0)).await;
        f.cycle.observe(online("A", 2), ts(1)).await;
        f.cycle.observe(offline(), ts(2)).await;

        let statuses = f.sink.statuses.lock().unwrap();
        assert_eq!(*statuses, vec!["online", "online", "offline"]);
    }

    fn test_scheduler(store: Arc<Store>) -> Scheduler {
        Scheduler::new(
            store,
            Arc::new(crate::probe::UdpProber),
            Arc::new(CountingNotifier {
                count: AtomicUsize::new(0),
            }),
            Arc::new(RecordingSink {
                statuses: Mutex::new(Vec::new()),
            }),
            Config::default(),
        )
    }

    #[tokio::test]
    async fn test_scheduler_add_remove() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let scheduler = test_scheduler(store);

        let endpoint = Endpoint {
            address: "127.0.0.1:1".to_string(),
            ..Default::default()
        };
        scheduler.add_endpoint(endpoint).await;
        assert!(scheduler.is_tracking("127.0.0.1:1").await);

        scheduler.remove_endpoint("127.0.0.1:1").await;
        assert!(!scheduler.is_tracking("127.0.0.1:1").await);
    }

    #[tokio::test]
    async fn test_scheduler_skips_malformed_and_abandoned() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let scheduler = test_scheduler(store);

        scheduler
            .add_endpoint(Endpoint {
                address: "not-an-address".to_string(),
                ..Default::default()
            })
            .await;
        assert!(!scheduler.is_tracking("not-an-address").await);

        scheduler
            .add_endpoint(Endpoint {
                address: "10.0.0.1:1".to_string(),
                failure_count: 20_000,
                ..Default::default()
            })
            .await;
        assert!(!scheduler.is_tracking("10.0.0.1:1").await);
    }

    #[tokio::test]
    async fn test_untrack_last_group_removes_endpoint() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let scheduler = test_scheduler(store.clone());

        let endpoint = Endpoint {
            address: "10.0.0.2:27015".to_string(),
            ..Default::default()
        };
        scheduler
            .track(
                endpoint.clone(),
                DeliveryTarget {
                    address: endpoint.address.clone(),
                    group_id: 1,
                    sink_id: 10,
                    last_message_ref: 0,
                },
            )
            .await
            .unwrap();
        scheduler
            .track(
                endpoint.clone(),
                DeliveryTarget {
                    address: endpoint.address.clone(),
                    group_id: 2,
                    sink_id: 20,
                    last_message_ref: 0,
                },
            )
            .await
            .unwrap();
        assert!(scheduler.is_tracking("10.0.0.2:27015").await);

        scheduler.untrack("10.0.0.2:27015", 1).await.unwrap();
        assert!(scheduler.is_tracking("10.0.0.2:27015").await);

        scheduler.untrack("10.0.0.2:27015", 2).await.unwrap();
        assert!(!scheduler.is_tracking("10.0.0.2:27015").await);
        assert!(store.get_endpoint("10.0.0.2:27015").is_err());
    }
}
