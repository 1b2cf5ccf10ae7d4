//! Integration tests for the full relay pipeline.
//!
//! Tests: TriggerRequest → Dispatcher → CircuitBreaker → Upstream, with the
//! tenant retry queue as fallback.
//!
//! Verifies:
//! - A shared breaker opens on failures and fast-fails every tenant
//! - Queued triggers survive a restart and are delivered by the sweeper
//! - Invalid triggers are dropped, reported once, and leave breaker stats alone

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use relay_core::{RequestId, TenantId};
    use serde_json::{json, Value as JsonValue};

    use crate::circuit::CircuitState;
    use crate::config::RelayConfig;
    use crate::dispatcher::TriggerOutcome;
    use crate::jobs::{InMemoryPendingTriggerStore, PendingTriggerStore, TriggerRequest};
    use crate::notify::{AlertKind, CollectingNotifier};
    use crate::relay::{RelayError, TriggerRelay};
    use crate::tenants::{DirectoryError, StaticTenantDirectory, TenantDirectory};
    use crate::upstream::{DeliveryError, TriggerPayload, TriggerUpstream};

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Mode {
        Healthy,
        /// Fails three calls out of every five.
        Flaky,
        Down,
    }

    #[derive(Debug, Clone)]
    struct Call {
        tenant_id: TenantId,
        request_id: String,
        row_log_id: Option<String>,
    }

    struct ScriptedUpstream {
        mode: Mutex<Mode>,
        calls: Mutex<Vec<Call>>,
    }

    impl ScriptedUpstream {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                mode: Mutex::new(mode),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn set_mode(&self, mode: Mode) {
            *self.mode.lock().unwrap() = mode;
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TriggerUpstream for ScriptedUpstream {
        async fn deliver(&self, tenant_id: TenantId, payload: &TriggerPayload) -> Result<JsonValue, DeliveryError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(Call {
                    tenant_id,
                    request_id: payload.request_id.clone(),
                    row_log_id: payload.row_log_id.clone(),
                });
                calls.len() - 1
            };

            if payload.key.ends_with(".invalid") {
                return Err(DeliveryError::InvalidInputs(format!("unknown key {}", payload.key)));
            }
            match *self.mode.lock().unwrap() {
                Mode::Healthy => Ok(json!({"accepted": payload.request_id})),
                Mode::Flaky if n % 5 >= 3 => Ok(json!({"accepted": payload.request_id})),
                Mode::Flaky => Err(DeliveryError::Timeout),
                Mode::Down => Err(DeliveryError::Server {
                    status: 503,
                    message: "unavailable".into(),
                }),
            }
        }
    }

    struct Harness {
        relay: TriggerRelay,
        store: Arc<InMemoryPendingTriggerStore>,
        upstream: Arc<ScriptedUpstream>,
        notifier: Arc<CollectingNotifier>,
    }

    async fn start(
        store: Arc<InMemoryPendingTriggerStore>,
        upstream: Arc<ScriptedUpstream>,
        tenants: &[TenantId],
    ) -> Harness {
        start_with(RelayConfig::default(), store, upstream, tenants).await
    }

    async fn start_with(
        config: RelayConfig,
        store: Arc<InMemoryPendingTriggerStore>,
        upstream: Arc<ScriptedUpstream>,
        tenants: &[TenantId],
    ) -> Harness {
        let notifier = Arc::new(CollectingNotifier::new());
        let relay = TriggerRelay::start(
            config,
            store.clone(),
            Arc::new(StaticTenantDirectory::new(tenants.iter().copied())),
            upstream.clone(),
            notifier.clone(),
        )
        .await
        .unwrap();
        Harness {
            relay,
            store,
            upstream,
            notifier,
        }
    }

    fn request(id: &str) -> TriggerRequest {
        TriggerRequest::new("obj1.updated", json!({"row": id}))
            .with_request_id(RequestId::parse(id).unwrap())
            .with_user(json!({"id": "u-1"}))
    }

    fn rid(id: &str) -> RequestId {
        RequestId::parse(id).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn closed_breaker_delivers_without_persisting() {
        let tenant = TenantId::new();
        let h = start(InMemoryPendingTriggerStore::arc(), ScriptedUpstream::new(Mode::Healthy), &[tenant]).await;

        let receipt = h
            .relay
            .dispatcher()
            .register_trigger(tenant, request("R1").with_row_log_id("L1"))
            .await
            .unwrap();

        assert_eq!(receipt.outcome, TriggerOutcome::Delivered(json!({"accepted": "R1"})));
        assert!(!receipt.used_fallback());
        assert_eq!(h.store.count(tenant), 0);
        assert_eq!(h.relay.registry().queue(tenant).unwrap().len().await, 0);
        assert_eq!(h.upstream.calls()[0].row_log_id.as_deref(), Some("L1"));
        h.relay.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_request_id_is_assigned() {
        let tenant = TenantId::new();
        let h = start(InMemoryPendingTriggerStore::arc(), ScriptedUpstream::new(Mode::Healthy), &[tenant]).await;

        let receipt = h
            .relay
            .dispatcher()
            .register_trigger(tenant, TriggerRequest::new("obj1.added", json!({})))
            .await
            .unwrap();

        assert_eq!(h.upstream.calls()[0].request_id, receipt.request_id.as_str());
        h.relay.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_key_is_refused_before_delivery() {
        let tenant = TenantId::new();
        let h = start(InMemoryPendingTriggerStore::arc(), ScriptedUpstream::new(Mode::Healthy), &[tenant]).await;

        let result = h
            .relay
            .dispatcher()
            .register_trigger(tenant, TriggerRequest::new("  ", json!({})))
            .await;

        assert!(result.is_err());
        assert_eq!(h.upstream.call_count(), 0);
        h.relay.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_queues_without_upstream_call_then_recovers() {
        let tenant = TenantId::new();
        let h = start(InMemoryPendingTriggerStore::arc(), ScriptedUpstream::new(Mode::Flaky), &[tenant]).await;
        let dispatcher = h.relay.dispatcher().clone();

        // R1 hits a failing upstream; 1 of 1 failed trips the 50 % threshold.
        let r1 = dispatcher
            .register_trigger(tenant, request("R1").with_row_log_id("L1"))
            .await
            .unwrap();
        assert_eq!(r1.outcome, TriggerOutcome::Queued);
        assert_eq!(h.relay.breaker().state(), CircuitState::Open);
        assert_eq!(h.upstream.call_count(), 1);

        // R2 is fast-failed straight into the queue.
        let r2 = dispatcher.register_trigger(tenant, request("R2")).await.unwrap();
        assert_eq!(r2.outcome, TriggerOutcome::Queued);
        assert_eq!(h.upstream.call_count(), 1);
        assert_eq!(h.store.count(tenant), 2);

        // Upstream recovers; after the reset period a probe closes the breaker.
        h.upstream.set_mode(Mode::Healthy);
        tokio::time::advance(Duration::from_secs(30)).await;
        let probe = dispatcher.register_trigger(tenant, request("P1")).await.unwrap();
        assert!(matches!(probe.outcome, TriggerOutcome::Delivered(_)));
        assert_eq!(h.relay.breaker().state(), CircuitState::Closed);

        // Next sweep (60 s after bootstrap) delivers and removes R1 and R2.
        tokio::time::sleep(Duration::from_secs(31)).await;
        let queue = h.relay.registry().queue(tenant).unwrap();
        assert!(queue.is_empty().await);
        assert_eq!(h.store.count(tenant), 0);

        let calls = h.upstream.calls();
        assert_eq!(calls.len(), 4);
        let r1_calls: Vec<_> = calls.iter().filter(|c| c.request_id == "R1").collect();
        assert_eq!(r1_calls.len(), 2);
        // rowLogID travels with the first attempt only.
        assert_eq!(r1_calls[0].row_log_id.as_deref(), Some("L1"));
        assert_eq!(r1_calls[1].row_log_id, None);
        h.relay.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_trigger_is_dropped_from_queue_and_reported_once() {
        let tenant = TenantId::new();
        let store = InMemoryPendingTriggerStore::arc();
        // R3 was queued by an earlier process.
        store
            .create(
                &TriggerRequest::new("obj9.invalid", json!({"row": "R3"}))
                    .with_request_id(rid("R3"))
                    .into_job(tenant)
                    .unwrap(),
            )
            .await
            .unwrap();
        let h = start(store, ScriptedUpstream::new(Mode::Healthy), &[tenant]).await;
        let queue = h.relay.registry().queue(tenant).unwrap();
        assert!(queue.contains(&rid("R3")).await);

        let receipt = h
            .relay
            .dispatcher()
            .register_trigger(
                tenant,
                TriggerRequest::new("obj9.invalid", json!({"row": "R3"})).with_request_id(rid("R3")),
            )
            .await
            .unwrap();

        assert_eq!(receipt.outcome, TriggerOutcome::Dropped);
        assert!(!queue.contains(&rid("R3")).await);
        assert_eq!(h.store.count(tenant), 0);
        assert_eq!(h.notifier.count(AlertKind::InvalidInputs), 1);
        let alert = &h.notifier.alerts()[0];
        assert_eq!(alert.request_id, Some(rid("R3")));
        assert_eq!(alert.inputs["key"], "obj9.invalid");

        let stats = h.relay.breaker().stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.counts.counted_calls(), 0);
        assert_eq!(stats.counts.filtered, 1);

        // Nothing left for the sweeper to retry.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(h.upstream.call_count(), 1);
        assert_eq!(h.notifier.count(AlertKind::InvalidInputs), 1);
        h.relay.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_trigger_is_removed_when_tenant_queue_never_started() {
        let tenant = TenantId::new();
        let store = InMemoryPendingTriggerStore::arc();
        store
            .create(
                &TriggerRequest::new("obj9.invalid", json!({"row": "R3"}))
                    .with_request_id(rid("R3"))
                    .into_job(tenant)
                    .unwrap(),
            )
            .await
            .unwrap();

        store.set_unavailable(true);
        let h = start(store, ScriptedUpstream::new(Mode::Healthy), &[tenant]).await;
        assert_eq!(h.relay.bootstrap_report().failed, vec![tenant]);
        assert!(h.relay.registry().queue(tenant).is_none());
        h.store.set_unavailable(false);

        let receipt = h
            .relay
            .dispatcher()
            .register_trigger(
                tenant,
                TriggerRequest::new("obj9.invalid", json!({"row": "R3"})).with_request_id(rid("R3")),
            )
            .await
            .unwrap();

        assert_eq!(receipt.outcome, TriggerOutcome::Dropped);
        assert_eq!(h.store.count(tenant), 0);
        assert!(!h.relay.registry().queue(tenant).unwrap().contains(&rid("R3")).await);

        // The sweeper finds nothing to redeliver or report again.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(h.upstream.call_count(), 1);
        assert_eq!(h.notifier.count(AlertKind::InvalidInputs), 1);
        h.relay.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_upstream_opens_breaker_once_volume_is_reached() {
        let tenant = TenantId::new();
        let mut config = RelayConfig::default();
        config.circuit.volume_threshold = 5;
        let h = start_with(
            config,
            InMemoryPendingTriggerStore::arc(),
            ScriptedUpstream::new(Mode::Flaky),
            &[tenant],
        )
        .await;
        assert_eq!(h.relay.config().circuit.threshold, 50);
        let dispatcher = h.relay.dispatcher();

        // Upstream fails three calls in five: 60 % against a 50 % threshold.
        let mut outcomes = Vec::new();
        for i in 1..=5 {
            let receipt = dispatcher.register_trigger(tenant, request(&format!("R{i}"))).await.unwrap();
            outcomes.push(receipt.used_fallback());
            assert_eq!(h.relay.breaker().state(), CircuitState::Closed, "tripped early at R{i}");
        }
        assert_eq!(outcomes, vec![true, true, true, false, false]);

        // Sixth call fails with six calls in the window; 4 of 6 failed.
        let r6 = dispatcher.register_trigger(tenant, request("R6")).await.unwrap();
        assert_eq!(r6.outcome, TriggerOutcome::Queued);
        assert_eq!(h.relay.breaker().state(), CircuitState::Open);
        let stats = h.relay.breaker().stats();
        assert_eq!(stats.counts.counted_calls(), 6);

        // Open: the seventh never reaches upstream.
        let r7 = dispatcher.register_trigger(tenant, request("R7")).await.unwrap();
        assert_eq!(r7.outcome, TriggerOutcome::Queued);
        assert_eq!(h.upstream.call_count(), 6);
        assert_eq!(h.store.count(tenant), 5);
        h.relay.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn one_tenant_trips_the_breaker_for_all() {
        let (t1, t2) = (TenantId::new(), TenantId::new());
        let h = start(InMemoryPendingTriggerStore::arc(), ScriptedUpstream::new(Mode::Down), &[t1]).await;
        let dispatcher = h.relay.dispatcher();

        let first = dispatcher.register_trigger(t1, request("A1")).await.unwrap();
        assert_eq!(first.outcome, TriggerOutcome::Queued);
        assert_eq!(h.relay.breaker().state(), CircuitState::Open);

        // T2 was never bootstrapped; its queue is created on demand.
        assert!(h.relay.registry().queue(t2).is_none());
        let second = dispatcher.register_trigger(t2, request("B1")).await.unwrap();
        assert_eq!(second.outcome, TriggerOutcome::Queued);

        let calls = h.upstream.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tenant_id, t1);
        assert_eq!(h.store.count(t1), 1);
        assert_eq!(h.store.count(t2), 1);
        assert_eq!(h.relay.registry().tenants().len(), 2);
        assert!(h.relay.registry().queue(t2).unwrap().contains(&rid("B1")).await);
        h.relay.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_reproduces_unresolved_jobs() {
        let tenant = TenantId::new();
        let store = InMemoryPendingTriggerStore::arc();
        let h = start(store.clone(), ScriptedUpstream::new(Mode::Down), &[tenant]).await;
        for id in ["R1", "R2", "R3"] {
            h.relay.dispatcher().register_trigger(tenant, request(id)).await.unwrap();
        }
        let mut before: Vec<_> = h
            .relay
            .registry()
            .queue(tenant)
            .unwrap()
            .pending()
            .await
            .into_iter()
            .map(|j| j.id)
            .collect();
        h.relay.shutdown().await;

        let h = start(store, ScriptedUpstream::new(Mode::Down), &[tenant]).await;
        let mut after: Vec<_> = h
            .relay
            .registry()
            .queue(tenant)
            .unwrap()
            .pending()
            .await
            .into_iter()
            .map(|j| j.id)
            .collect();

        assert_eq!(before.len(), 3);
        before.sort();
        after.sort();
        assert_eq!(before, after);
        h.relay.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_is_reported_and_job_lost() {
        let tenant = TenantId::new();
        let h = start(InMemoryPendingTriggerStore::arc(), ScriptedUpstream::new(Mode::Down), &[tenant]).await;
        h.store.set_unavailable(true);

        let receipt = h
            .relay
            .dispatcher()
            .register_trigger(tenant, request("R1"))
            .await
            .unwrap();

        assert_eq!(receipt.outcome, TriggerOutcome::Lost);
        assert_eq!(h.notifier.count(AlertKind::PersistenceFailure), 1);
        assert!(!h.relay.registry().queue(tenant).unwrap().contains(&rid("R1")).await);
        h.relay.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_retries_and_keeps_rows() {
        let tenant = TenantId::new();
        let h = start(InMemoryPendingTriggerStore::arc(), ScriptedUpstream::new(Mode::Down), &[tenant]).await;
        h.relay.dispatcher().register_trigger(tenant, request("R1")).await.unwrap();
        let upstream = h.upstream.clone();
        let store = h.store.clone();
        h.relay.shutdown().await;

        upstream.set_mode(Mode::Healthy);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(upstream.call_count(), 1);
        assert_eq!(store.count(tenant), 1);
    }

    struct BrokenDirectory;

    #[async_trait]
    impl TenantDirectory for BrokenDirectory {
        async fn list_tenants(&self) -> Result<Vec<TenantId>, DirectoryError> {
            Err(DirectoryError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn start_fails_on_unreachable_directory_or_bad_config() {
        let result = TriggerRelay::start(
            RelayConfig::default(),
            InMemoryPendingTriggerStore::arc(),
            Arc::new(BrokenDirectory),
            ScriptedUpstream::new(Mode::Healthy),
            Arc::new(CollectingNotifier::new()),
        )
        .await;
        assert!(matches!(result, Err(RelayError::Bootstrap(_))));

        let mut config = RelayConfig::default();
        config.circuit.threshold = 0;
        let result = TriggerRelay::start(
            config,
            InMemoryPendingTriggerStore::arc(),
            Arc::new(StaticTenantDirectory::default()),
            ScriptedUpstream::new(Mode::Healthy),
            Arc::new(CollectingNotifier::new()),
        )
        .await;
        assert!(matches!(result, Err(RelayError::Config(_))));
    }
}
