//! Telemetry poller
//!
//! Requests port counters from every active switch on a fixed tick and turns
//! each reply into per-port rates, observations, decisions and enforcement.
//! Replies arrive through the controller's event path, not the poll loop, so
//! a slow switch only ever delays itself.

use crate::enforcement::{Enforcement, EnforcementEngine};
use crate::error::EnforceError;
use crate::event_log::{EventLog, StatsRecord};
use crate::policy::{decide_within, Action, Normalizer, PolicyOracle, PortRate};
use crate::registry::{ConnectionRegistry, EvictionListener};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use portguard_common::{
    AtomicCounter, DatapathId, PortCounters, PortKey, PortNo, PortStatsEntry, PortStatsRequest,
    StatsError,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Last counters seen on a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSample {
    /// Monotonic receive time of the reply
    pub at: Instant,
    /// Counters
    pub counters: PortCounters,
}

/// Why no rate was produced for an interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateSkip {
    /// Samples are not strictly ordered in time
    NonPositiveInterval,
    /// A byte counter went backwards (reset or wrap)
    CounterReset,
}

/// Rate between two samples of the same port: `delta * 8 / dt` bits per second
pub fn rate_between(prev: &PortSample, cur: &PortSample) -> Result<PortRate, RateSkip> {
    let dt = match cur.at.checked_duration_since(prev.at) {
        Some(dt) if !dt.is_zero() => dt.as_secs_f64(),
        _ => return Err(RateSkip::NonPositiveInterval),
    };

    let d_tx = cur
        .counters
        .tx_bytes
        .checked_sub(prev.counters.tx_bytes)
        .ok_or(RateSkip::CounterReset)?;
    let d_rx = cur
        .counters
        .rx_bytes
        .checked_sub(prev.counters.rx_bytes)
        .ok_or(RateSkip::CounterReset)?;

    Ok(PortRate {
        tx_bps: d_tx as f64 * 8.0 / dt,
        rx_bps: d_rx as f64 * 8.0 / dt,
    })
}

/// Result of processing one port of a stats reply
#[derive(Debug, Clone, PartialEq)]
pub enum PortOutcome {
    /// Entry lacked a required counter; dropped
    Malformed(StatsError),
    /// First sample of the port; recorded only
    Recorded,
    /// Sample recorded but the interval produced no rate
    Skipped(RateSkip),
    /// Switch went away before enforcement; decision discarded
    Stale,
    /// Oracle consulted and its action enforced
    Decided {
        /// Measured rate
        rate: PortRate,
        /// Action taken; NOOP when the oracle ran out of time
        action: Action,
        /// Oracle exceeded its budget
        timed_out: bool,
        /// Enforcement result
        result: Result<Enforcement, EnforceError>,
    },
}

/// Poller timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerSettings {
    /// Tick period
    pub interval: Duration,
    /// Per-switch request timeout
    pub op_timeout: Duration,
    /// Oracle budget per port
    pub oracle_budget: Duration,
}

/// Telemetry counters
#[derive(Debug, Default)]
pub struct TelemetryStats {
    /// Poll rounds started
    pub rounds: AtomicCounter,
    /// Stats requests accepted by switches
    pub requests: AtomicCounter,
    /// Stats requests that failed or timed out
    pub request_failures: AtomicCounter,
    /// Valid samples recorded
    pub samples: AtomicCounter,
    /// Entries dropped as malformed
    pub malformed: AtomicCounter,
    /// Intervals discarded because a counter went backwards
    pub counter_resets: AtomicCounter,
    /// Oracle calls that exceeded the budget
    pub oracle_timeouts: AtomicCounter,
    /// Replies for switches no longer registered
    pub stale_replies: AtomicCounter,
}

/// Periodic counter sampling and decision loop
pub struct TelemetryPoller {
    registry: Arc<ConnectionRegistry>,
    engine: Arc<EnforcementEngine>,
    oracle: Arc<dyn PolicyOracle>,
    event_log: Arc<dyn EventLog>,
    normalizer: Normalizer,
    settings: PollerSettings,
    samples: DashMap<PortKey, PortSample>,
    next_xid: AtomicU32,
    stats: TelemetryStats,
}

impl TelemetryPoller {
    /// Create poller
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        engine: Arc<EnforcementEngine>,
        oracle: Arc<dyn PolicyOracle>,
        event_log: Arc<dyn EventLog>,
        normalizer: Normalizer,
        settings: PollerSettings,
    ) -> Self {
        Self {
            registry,
            engine,
            oracle,
            event_log,
            normalizer,
            settings,
            samples: DashMap::new(),
            next_xid: AtomicU32::new(1),
            stats: TelemetryStats::default(),
        }
    }

    /// Send one stats request to every active switch.
    ///
    /// Each request runs on its own task bounded by the operation timeout.
    /// Returns the number of switches that accepted the request.
    pub async fn poll_once(&self) -> usize {
        self.stats.rounds.inc();

        let mut requests = JoinSet::new();
        for link in self.registry.active_links() {
            let xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
            let timeout = self.settings.op_timeout;

            requests.spawn(async move {
                let request = link.handle.send_stats_request(PortStatsRequest::all(xid));
                let sent = tokio::time::timeout(timeout, request).await;
                (link.dpid, sent)
            });
        }

        let mut accepted = 0;
        while let Some(joined) = requests.join_next().await {
            match joined {
                Ok((_, Ok(Ok(())))) => {
                    accepted += 1;
                    self.stats.requests.inc();
                }
                Ok((dpid, Ok(Err(e)))) => {
                    self.stats.request_failures.inc();
                    tracing::warn!(%dpid, error = %e, "port stats request failed");
                }
                Ok((dpid, Err(_))) => {
                    self.stats.request_failures.inc();
                    tracing::warn!(
                        %dpid,
                        timeout_ms = self.settings.op_timeout.as_millis() as u64,
                        "port stats request timed out"
                    );
                }
                Err(e) => {
                    self.stats.request_failures.inc();
                    tracing::error!(error = %e, "port stats request task failed");
                }
            }
        }
        accepted
    }

    /// Poll until `shutdown` flips to true or its sender is dropped
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            oracle = self.oracle.name(),
            "telemetry poller started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let accepted = self.poll_once().await;
                    tracing::trace!(accepted, "poll round sent");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("telemetry poller stopped");
    }

    /// Process a port-stats reply received at `at` (monotonic) / `wall` (log time)
    pub async fn handle_stats_reply(
        &self,
        dpid: DatapathId,
        entries: Vec<PortStatsEntry>,
        at: Instant,
        wall: DateTime<Utc>,
    ) -> Vec<(PortNo, PortOutcome)> {
        let Ok(link) = self.registry.handle_for(dpid) else {
            self.stats.stale_replies.inc();
            tracing::debug!(%dpid, "stats reply from unregistered switch discarded");
            return Vec::new();
        };

        let mut outcomes = Vec::with_capacity(entries.len());
        let mut records = Vec::with_capacity(entries.len());
        let mut pending = Vec::new();

        for entry in entries {
            let port = entry.port_no;
            let counters = match entry.counters() {
                Ok(counters) => counters,
                Err(e) => {
                    self.stats.malformed.inc();
                    tracing::warn!(%dpid, port, error = %e, "malformed port stats dropped");
                    outcomes.push((port, PortOutcome::Malformed(e)));
                    continue;
                }
            };

            self.stats.samples.inc();
            records.push(StatsRecord::new(wall, dpid, port, &counters));

            let sample = PortSample { at, counters };
            let previous = self.samples.insert(PortKey::new(dpid, port), sample);

            match previous.map(|prev| rate_between(&prev, &sample)) {
                None => outcomes.push((port, PortOutcome::Recorded)),
                Some(Err(skip)) => {
                    if skip == RateSkip::CounterReset {
                        self.stats.counter_resets.inc();
                    }
                    tracing::debug!(%dpid, port, ?skip, "interval discarded");
                    outcomes.push((port, PortOutcome::Skipped(skip)));
                }
                Some(Ok(rate)) => {
                    tracing::debug!(
                        %dpid,
                        port,
                        tx_bps = rate.tx_bps,
                        rx_bps = rate.rx_bps,
                        "port rate"
                    );
                    pending.push((port, rate));
                }
            }
        }

        if !records.is_empty() {
            if let Err(e) = self.event_log.append(&records) {
                tracing::warn!(
                    %dpid,
                    rows = records.len(),
                    error = %e,
                    "failed to append telemetry"
                );
            }
        }

        for (port, rate) in pending {
            let observation = self.normalizer.observe(dpid, port, rate);

            let budget = self.settings.oracle_budget;
            let (action, timed_out) =
                match decide_within(self.oracle.as_ref(), &observation, budget).await {
                    Some(action) => (action, false),
                    None => {
                        self.stats.oracle_timeouts.inc();
                        tracing::warn!(
                            %dpid,
                            port,
                            oracle = self.oracle.name(),
                            "policy decision timed out, treating as NOOP"
                        );
                        (Action::Noop, true)
                    }
                };

            if !self.registry.is_current(dpid, link.session) {
                tracing::debug!(
                    %dpid,
                    port,
                    %action,
                    "switch disconnected during decision, discarded"
                );
                outcomes.push((port, PortOutcome::Stale));
                continue;
            }

            let result = self.engine.enforce(dpid, port, action).await;
            if let Err(e) = &result {
                tracing::warn!(%dpid, port, %action, error = %e, "enforcement failed");
            }

            outcomes.push((
                port,
                PortOutcome::Decided {
                    rate,
                    action,
                    timed_out,
                    result,
                },
            ));
        }

        // Samples inserted after a concurrent eviction would outlive the session.
        if !self.registry.is_current(dpid, link.session) {
            self.forget_switch(dpid);
        }

        outcomes
    }

    /// Last sample of a port
    pub fn last_sample(&self, dpid: DatapathId, port: PortNo) -> Option<PortSample> {
        self.samples.get(&PortKey::new(dpid, port)).map(|s| *s)
    }

    /// Drop every sample of a switch
    pub fn forget_switch(&self, dpid: DatapathId) {
        self.samples.retain(|key, _| key.dpid != dpid);
    }

    /// Counters
    pub fn stats(&self) -> &TelemetryStats {
        &self.stats
    }

    /// Configured oracle
    pub fn oracle(&self) -> &Arc<dyn PolicyOracle> {
        &self.oracle
    }
}

impl EvictionListener for TelemetryPoller {
    fn evict_switch(&self, dpid: DatapathId) {
        self.forget_switch(dpid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnforcementConfig;
    use crate::event_log::MemoryEventLog;
    use crate::policy::{Observation, StaticPolicy};
    use crate::switch::{Mutation, RecordingSwitch, SwitchHandle};
    use async_trait::async_trait;
    use portguard_common::{
        ChannelError, FlowMod, MeterMod, PacketOut, SessionId, SwitchFeatures,
    };
    use proptest::prelude::*;

    struct CountingPolicy {
        action: Action,
        calls: AtomicCounter,
        seen: parking_lot::Mutex<Vec<Observation>>,
    }

    impl CountingPolicy {
        fn new(action: Action) -> Arc<Self> {
            Arc::new(Self {
                action,
                calls: AtomicCounter::default(),
                seen: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PolicyOracle for CountingPolicy {
        async fn decide(&self, observation: &Observation) -> Action {
            self.calls.inc();
            self.seen.lock().push(*observation);
            self.action
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        poller: Arc<TelemetryPoller>,
        switch: Arc<RecordingSwitch>,
        log: Arc<MemoryEventLog>,
    }

    fn settings() -> PollerSettings {
        PollerSettings {
            interval: Duration::from_secs(1),
            op_timeout: Duration::from_millis(100),
            oracle_budget: Duration::from_millis(50),
        }
    }

    fn fixture(oracle: Arc<dyn PolicyOracle>) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let engine = Arc::new(EnforcementEngine::new(
            registry.clone(),
            EnforcementConfig::default(),
            Duration::from_millis(100),
        ));
        let log = Arc::new(MemoryEventLog::new());
        let poller = Arc::new(TelemetryPoller::new(
            registry.clone(),
            engine.clone(),
            oracle,
            log.clone(),
            Normalizer::default(),
            settings(),
        ));
        registry.add_eviction_listener(engine);
        registry.add_eviction_listener(poller.clone());

        let switch = RecordingSwitch::shared();
        let session = SessionId::next();
        registry.register(DatapathId(1), session, switch.clone(), SwitchFeatures::default());
        registry.activate(DatapathId(1), session);

        Fixture {
            registry,
            poller,
            switch,
            log,
        }
    }

    fn entry(port: PortNo, rx: u64, tx: u64) -> PortStatsEntry {
        PortStatsEntry::new(port, PortCounters::bytes(rx, tx))
    }

    fn sample(at: Instant, rx: u64, tx: u64) -> PortSample {
        PortSample {
            at,
            counters: PortCounters::bytes(rx, tx),
        }
    }

    #[test]
    fn test_rate_between() {
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(1);
        let rate = rate_between(&sample(t0, 1000, 2000), &sample(later, 9000, 10000)).unwrap();
        assert_eq!(rate.tx_bps, 64000.0);
        assert_eq!(rate.rx_bps, 64000.0);

        let half = t0 + Duration::from_millis(500);
        let rate = rate_between(&sample(t0, 0, 0), &sample(half, 1000, 0)).unwrap();
        assert_eq!(rate.rx_bps, 16000.0);
        assert_eq!(rate.tx_bps, 0.0);
    }

    #[test]
    fn test_rate_skips() {
        let t0 = Instant::now();
        assert_eq!(
            rate_between(&sample(t0, 100, 100), &sample(t0, 200, 200)),
            Err(RateSkip::NonPositiveInterval)
        );
        assert_eq!(
            rate_between(&sample(t0 + Duration::from_secs(1), 100, 100), &sample(t0, 200, 200)),
            Err(RateSkip::NonPositiveInterval)
        );
        assert_eq!(
            rate_between(&sample(t0, 100, 500), &sample(t0 + Duration::from_secs(1), 200, 10)),
            Err(RateSkip::CounterReset)
        );
    }

    proptest! {
        #[test]
        fn prop_rate_is_delta_bits_over_interval(
            base_rx in 0u64..1_000_000_000,
            base_tx in 0u64..1_000_000_000,
            d_rx in 0u64..1_000_000_000_000,
            d_tx in 0u64..1_000_000_000_000,
            dt_ms in 1u64..100_000,
        ) {
            let t0 = Instant::now();
            let dt = Duration::from_millis(dt_ms);
            let rate = rate_between(
                &sample(t0, base_rx, base_tx),
                &sample(t0 + dt, base_rx + d_rx, base_tx + d_tx),
            ).unwrap();

            let expected_rx = d_rx as f64 * 8.0 / dt.as_secs_f64();
            let expected_tx = d_tx as f64 * 8.0 / dt.as_secs_f64();
            prop_assert!((rate.rx_bps - expected_rx).abs() <= expected_rx * 1e-9);
            prop_assert!((rate.tx_bps - expected_tx).abs() <= expected_tx * 1e-9);
            prop_assert!(rate.rx_bps >= 0.0 && rate.tx_bps >= 0.0);
        }

        #[test]
        fn prop_counter_decrease_never_yields_rate(
            prev in 1u64..u64::MAX,
            drop_by in 1u64..u64::MAX,
            dt_ms in 1u64..100_000,
        ) {
            let cur = prev.saturating_sub(drop_by.min(prev));
            prop_assume!(cur < prev);
            let t0 = Instant::now();
            let later = t0 + Duration::from_millis(dt_ms);
            let result = rate_between(&sample(t0, prev, 0), &sample(later, cur, 0));
            prop_assert_eq!(result, Err(RateSkip::CounterReset));
        }
    }

    #[tokio::test]
    async fn test_first_sample_is_recorded_without_decision() {
        let oracle = CountingPolicy::new(Action::Drop);
        let f = fixture(oracle.clone());

        let outcomes = f
            .poller
            .handle_stats_reply(
                DatapathId(1),
                vec![entry(3, 1000, 2000)],
                Instant::now(),
                Utc::now(),
            )
            .await;

        assert_eq!(outcomes, vec![(3, PortOutcome::Recorded)]);
        assert_eq!(oracle.calls.get(), 0);
        assert_eq!(f.log.len(), 1);
        assert!(f.switch.sent().is_empty());
    }

    #[tokio::test]
    async fn test_decision_flows_to_enforcement() {
        let oracle = CountingPolicy::new(Action::Drop);
        let f = fixture(oracle.clone());
        let t0 = Instant::now();

        f.poller
            .handle_stats_reply(DatapathId(1), vec![entry(3, 1000, 2000)], t0, Utc::now())
            .await;
        let outcomes = f
            .poller
            .handle_stats_reply(
                DatapathId(1),
                vec![entry(3, 9000, 10000)],
                t0 + Duration::from_secs(1),
                Utc::now(),
            )
            .await;

        match &outcomes[0] {
            (3, PortOutcome::Decided { rate, action, timed_out, result }) => {
                assert_eq!(rate.tx_bps, 64000.0);
                assert_eq!(rate.rx_bps, 64000.0);
                assert_eq!(*action, Action::Drop);
                assert!(!timed_out);
                assert_eq!(result, &Ok(Enforcement::Installed { superseded: None }));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let seen = oracle.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].tx_rate_norm, 64000.0 / 100e6);
        assert_eq!(seen[0].switch_id_norm, 0.01);
        assert_eq!(seen[0].port_norm, 0.03);
        assert_eq!(f.log.len(), 2);
    }

    #[tokio::test]
    async fn test_counter_reset_never_calls_oracle() {
        let oracle = CountingPolicy::new(Action::Drop);
        let f = fixture(oracle.clone());
        let t0 = Instant::now();

        f.poller
            .handle_stats_reply(DatapathId(1), vec![entry(3, 9000, 10000)], t0, Utc::now())
            .await;
        let outcomes = f
            .poller
            .handle_stats_reply(
                DatapathId(1),
                vec![entry(3, 10, 20)],
                t0 + Duration::from_secs(1),
                Utc::now(),
            )
            .await;

        assert_eq!(outcomes, vec![(3, PortOutcome::Skipped(RateSkip::CounterReset))]);
        assert_eq!(oracle.calls.get(), 0);
        assert_eq!(f.poller.stats().counter_resets.get(), 1);
        // the reset sample becomes the new baseline
        assert_eq!(f.poller.last_sample(DatapathId(1), 3).unwrap().counters.rx_bytes, 10);
        assert!(f.switch.sent().is_empty());
        assert_eq!(f.log.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_dropped_individually() {
        let f = fixture(Arc::new(StaticPolicy(Action::Noop)));

        let mut broken = entry(2, 0, 0);
        broken.tx_bytes = None;

        let outcomes = f
            .poller
            .handle_stats_reply(
                DatapathId(1),
                vec![broken, entry(3, 1, 1)],
                Instant::now(),
                Utc::now(),
            )
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(matches!(
            outcomes[0],
            (2, PortOutcome::Malformed(StatsError { field: "tx_bytes", .. }))
        ));
        assert_eq!(outcomes[1], (3, PortOutcome::Recorded));
        assert_eq!(f.log.records().iter().map(|r| r.port_no).collect::<Vec<_>>(), vec![3]);
        assert_eq!(f.poller.stats().malformed.get(), 1);
    }

    #[tokio::test]
    async fn test_reply_for_unknown_switch_is_discarded() {
        let oracle = CountingPolicy::new(Action::Drop);
        let f = fixture(oracle.clone());

        let outcomes = f
            .poller
            .handle_stats_reply(
                DatapathId(42),
                vec![entry(1, 1, 1)],
                Instant::now(),
                Utc::now(),
            )
            .await;

        assert!(outcomes.is_empty());
        assert!(f.log.is_empty());
        assert!(f.poller.last_sample(DatapathId(42), 1).is_none());
        assert_eq!(f.poller.stats().stale_replies.get(), 1);
    }

    struct SlowPolicy;

    #[async_trait]
    impl PolicyOracle for SlowPolicy {
        async fn decide(&self, _observation: &Observation) -> Action {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Action::Drop
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_oracle_timeout_counts_as_noop() {
        let f = fixture(Arc::new(SlowPolicy));
        let t0 = Instant::now();

        f.poller
            .handle_stats_reply(DatapathId(1), vec![entry(3, 0, 0)], t0, Utc::now())
            .await;
        let outcomes = f
            .poller
            .handle_stats_reply(
                DatapathId(1),
                vec![entry(3, 1000, 1000)],
                t0 + Duration::from_secs(1),
                Utc::now(),
            )
            .await;

        assert!(matches!(
            outcomes[0],
            (
                3,
                PortOutcome::Decided {
                    action: Action::Noop,
                    timed_out: true,
                    result: Ok(Enforcement::Unchanged),
                    ..
                }
            )
        ));
        assert!(f.switch.sent().is_empty());
        assert_eq!(f.poller.stats().oracle_timeouts.get(), 1);
    }

    #[tokio::test]
    async fn test_poll_once_requests_active_switches() {
        let f = fixture(Arc::new(StaticPolicy(Action::Noop)));

        // a connecting switch is not polled yet
        let pending = RecordingSwitch::shared();
        let features = SwitchFeatures::default();
        f.registry
            .register(DatapathId(2), SessionId::next(), pending.clone(), features);

        assert_eq!(f.poller.poll_once().await, 1);
        assert!(matches!(
            f.switch.sent().as_slice(),
            [Mutation::StatsRequest(PortStatsRequest { port: None, .. })]
        ));
        assert!(pending.sent().is_empty());

        f.switch.set_failing(true);
        assert_eq!(f.poller.poll_once().await, 0);
        assert_eq!(f.poller.stats().request_failures.get(), 1);
    }

    /// Switch that never answers a stats request in time
    struct UnresponsiveSwitch;

    #[async_trait]
    impl SwitchHandle for UnresponsiveSwitch {
        async fn send_flow_mod(&self, _flow: FlowMod) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn send_meter_mod(&self, _meter: MeterMod) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn send_stats_request(&self, _request: PortStatsRequest) -> Result<(), ChannelError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn send_packet_out(&self, _packet: PacketOut) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_switch_does_not_block_others() {
        let f = fixture(Arc::new(StaticPolicy(Action::Noop)));

        let session = SessionId::next();
        let features = SwitchFeatures::default();
        f.registry
            .register(DatapathId(2), session, Arc::new(UnresponsiveSwitch), features);
        f.registry.activate(DatapathId(2), session);

        let started = tokio::time::Instant::now();
        assert_eq!(f.poller.poll_once().await, 1);

        // the round ends at the per-switch timeout, not when the slow switch answers
        assert_eq!(started.elapsed(), settings().op_timeout);
        assert_eq!(f.switch.sent().len(), 1);
        assert_eq!(f.poller.stats().requests.get(), 1);
        assert_eq!(f.poller.stats().request_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_forgets_samples() {
        let f = fixture(Arc::new(StaticPolicy(Action::Noop)));

        f.poller
            .handle_stats_reply(DatapathId(1), vec![entry(3, 1, 1)], Instant::now(), Utc::now())
            .await;
        assert!(f.poller.last_sample(DatapathId(1), 3).is_some());

        f.registry.unregister(DatapathId(1));
        assert!(f.poller.last_sample(DatapathId(1), 3).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(Arc::new(StaticPolicy(Action::Noop)));
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(f.poller.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        // ticks at 0s, 1s and 2s
        assert_eq!(f.poller.stats().rounds.get(), 3);
    }
}
