//! Circuit breaker over the measurement source.
//!
//! The monitor probes the source on a fixed interval. After `threshold`
//! consecutive failures it clears every run flag in every scope; the timers
//! keep firing but their ticks find the flags off and do nothing. Jobs stay
//! stopped until someone starts them again.

use log::{error, info, warn};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::client::HeartbeatProbe;
use crate::db::store::JobStore;
use crate::models::scope::BankId;
use crate::services::scheduler::Timer;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Log lines about the breaker are filed under this pseudo sensor.
pub const MONITOR_BANK_ID: BankId = BankId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Healthy,
    /// First success after `after` failures.
    Recovered { after: u32 },
    Failing { count: u32 },
    /// Threshold reached; the caller must stop everything and reset.
    Tripped { count: u32 },
}

#[derive(Debug, Clone)]
pub struct HealthState {
    consecutive_failures: u32,
    threshold: u32,
    probe_interval: Duration,
}

impl Default for HealthState {
    fn default() -> Self {
        HealthState::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_PROBE_INTERVAL)
    }
}

impl HealthState {
    pub fn new(threshold: u32, probe_interval: Duration) -> Self {
        HealthState {
            consecutive_failures: 0,
            threshold: threshold.max(1),
            probe_interval,
        }
    }

    pub fn record(&mut self, healthy: bool) -> Transition {
        if healthy {
            let after = std::mem::take(&mut self.consecutive_failures);
            return if after > 0 {
                Transition::Recovered { after }
            } else {
                Transition::Healthy
            };
        }
        self.consecutive_failures += 1;
        let count = self.consecutive_failures;
        if count >= self.threshold {
            Transition::Tripped { count }
        } else {
            Transition::Failing { count }
        }
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn probe_interval(&self) -> Duration {
        self.probe_interval
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GlobalStopReport {
    pub scopes: usize,
    pub records_cleared: usize,
    pub scopes_failed: usize,
}

/// Clear both flags on every control record of every scope.
pub fn global_stop(store: &dyn JobStore, reason: &str) -> GlobalStopReport {
    let mut report = GlobalStopReport::default();
    let scopes = match store.list_scopes() {
        Ok(scopes) => scopes,
        Err(e) => {
            error!("Global stop could not list scopes: {}", e);
            return report;
        }
    };
    report.scopes = scopes.len();
    for scope in scopes {
        match store.clear_all_flags(&scope) {
            Ok(0) => {}
            Ok(n) => {
                report.records_cleared += n;
                warn!("Stopped {} job record(s) in {}", n, scope);
                let line = format!("all jobs stopped: {}", reason);
                if let Err(e) = store.append_log(&scope, MONITOR_BANK_ID, &line) {
                    warn!("Could not persist stop log for {}: {}", scope, e);
                }
            }
            Err(e) => {
                report.scopes_failed += 1;
                error!("Global stop failed for {}: {}", scope, e);
            }
        }
    }
    report
}

pub struct HealthMonitor {
    state: HealthState,
    probe: Arc<dyn HeartbeatProbe>,
    store: Arc<dyn JobStore>,
}

impl HealthMonitor {
    pub fn new(state: HealthState, probe: Arc<dyn HeartbeatProbe>, store: Arc<dyn JobStore>) -> Self {
        HealthMonitor { state, probe, store }
    }

    pub fn state(&self) -> &HealthState {
        &self.state
    }

    /// Run one probe and act on the resulting transition.
    pub fn probe_once(&mut self) -> Transition {
        let outcome = self.probe.probe();
        if let Err(e) = &outcome {
            warn!("Source heartbeat failed: {}", e);
        }
        let transition = self.state.record(outcome.is_ok());
        match transition {
            Transition::Healthy => {}
            Transition::Recovered { after } => info!("Source reachable again after {} failed probe(s)", after),
            Transition::Failing { count } => {
                warn!("Source unhealthy ({}/{})", count, self.state.threshold())
            }
            Transition::Tripped { count } => {
                error!("Source failed {} consecutive probes; stopping all jobs", count);
                let report = global_stop(
                    self.store.as_ref(),
                    &format!("source unreachable for {} consecutive probes", count),
                );
                info!(
                    "Global stop done: {} scope(s), {} record(s) cleared, {} failed",
                    report.scopes, report.records_cleared, report.scopes_failed
                );
                self.state.reset();
            }
        }
        transition
    }

    /// Probe forever on the configured interval. The first probe runs one
    /// interval after start.
    pub fn spawn(mut self) -> io::Result<Timer> {
        let interval = self.state.probe_interval();
        info!(
            "Health monitor running every {}s, threshold {}",
            interval.as_secs(),
            self.state.threshold()
        );
        Timer::spawn("health-monitor".to_string(), interval, move || {
            self.probe_once();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryJobStore;
    use crate::models::scope::{JobKey, Scope};
    use crate::testing::ScriptedProbe;

    fn build_monitor(store: &Arc<MemoryJobStore>, script: &[bool]) -> HealthMonitor {
        HealthMonitor::new(
            HealthState::new(3, Duration::from_secs(30)),
            Arc::new(ScriptedProbe::new(script)),
            store.clone(),
        )
    }

    fn running(store: &MemoryJobStore, key: &JobKey) {
        let id = store.local_id(&key.scope, key.bank_id).unwrap().unwrap();
        store.set_fetching(&key.scope, id, true).unwrap();
        store.set_sending(&key.scope, id, true).unwrap();
    }

    #[test]
    fn state_machine_transitions() {
        let mut state = HealthState::new(3, DEFAULT_PROBE_INTERVAL);
        assert_eq!(state.record(true), Transition::Healthy);
        assert_eq!(state.record(false), Transition::Failing { count: 1 });
        assert_eq!(state.record(false), Transition::Failing { count: 2 });
        assert_eq!(state.record(true), Transition::Recovered { after: 2 });
        assert_eq!(state.consecutive_failures(), 0);
        state.record(false);
        state.record(false);
        assert_eq!(state.record(false), Transition::Tripped { count: 3 });
    }

    #[test]
    fn trip_at_threshold_clears_every_scope_and_resets() {
        let store = Arc::new(MemoryJobStore::new());
        let a = JobKey::new(Scope::subsite(1, 7), BankId(1));
        let b = JobKey::new(Scope::tenant(2), BankId(2));
        store.register(a.scope, a.bank_id, "https://source/1");
        store.register(b.scope, b.bank_id, "https://source/2");
        running(&store, &a);
        running(&store, &b);

        let mut monitor = build_monitor(&store, &[false, false, false]);
        assert_eq!(monitor.probe_once(), Transition::Failing { count: 1 });
        assert_eq!(monitor.probe_once(), Transition::Failing { count: 2 });
        assert_eq!(store.running_jobs(&a.scope).unwrap().len(), 1);
        assert_eq!(monitor.probe_once(), Transition::Tripped { count: 3 });

        assert!(store.running_jobs(&a.scope).unwrap().is_empty());
        assert!(store.running_jobs(&b.scope).unwrap().is_empty());
        assert_eq!(monitor.state().consecutive_failures(), 0);

        let logs = store.recent_logs(&b.scope, MONITOR_BANK_ID, 5).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].log.starts_with("all jobs stopped"));
    }

    #[test]
    fn success_resets_the_count() {
        let store = Arc::new(MemoryJobStore::new());
        let key = JobKey::new(Scope::tenant(1), BankId(1));
        store.register(key.scope, key.bank_id, "https://source/1");
        running(&store, &key);

        let mut monitor = build_monitor(&store, &[false, false, true, false, false]);
        for _ in 0..5 {
            assert!(!matches!(monitor.probe_once(), Transition::Tripped { .. }));
        }
        assert_eq!(monitor.state().consecutive_failures(), 2);
        assert_eq!(store.running_jobs(&key.scope).unwrap().len(), 1);
    }

    #[test]
    fn global_stop_continues_past_a_failing_scope() {
        let store = Arc::new(MemoryJobStore::new());
        let ok = JobKey::new(Scope::tenant(1), BankId(1));
        let broken = Scope::tenant(2);
        store.register(ok.scope, ok.bank_id, "https://source/1");
        store.add_scope(broken);
        store.fail_scope(broken);
        running(&store, &ok);

        let report = global_stop(store.as_ref(), "test");
        assert_eq!(
            report,
            GlobalStopReport {
                scopes: 2,
                records_cleared: 1,
                scopes_failed: 1
            }
        );
        assert!(store.running_jobs(&ok.scope).unwrap().is_empty());
    }
}
