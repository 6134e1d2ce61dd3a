//! Startup recovery of running jobs from the persisted run flags.

use log::{Level, error, info};

use crate::models::scope::JobKey;
use crate::services::jobs::{Jobs, SensorSettings};
use crate::utils::record;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RehydrationReport {
    pub scopes_scanned: usize,
    pub fetch_started: usize,
    pub send_started: usize,
    pub scopes_failed: usize,
}

/// Start a timer for every flag found set on an active sensor, in every scope.
///
/// Stale flags are harmless: a resumed tick re-reads its flag like any other.
/// A scope that cannot be read is logged and skipped.
pub fn rehydrate(jobs: &Jobs) -> RehydrationReport {
    let mut report = RehydrationReport::default();
    let store = jobs.store();
    let scopes = match store.list_scopes() {
        Ok(scopes) => scopes,
        Err(e) => {
            error!("Rehydration could not list scopes: {}", e);
            return report;
        }
    };

    for scope in scopes {
        report.scopes_scanned += 1;
        let running = match store.running_jobs(&scope) {
            Ok(rows) => rows,
            Err(e) => {
                report.scopes_failed += 1;
                error!("Rehydration skipped {}: {}", scope, e);
                continue;
            }
        };

        for schedule in running {
            let key = JobKey::new(scope, schedule.bank_id());
            let settings = SensorSettings::from_schedule(&schedule);

            if schedule.is_fetching {
                match schedule.api_endpoint.clone() {
                    Some(endpoint) => match jobs.schedule_fetch(key, settings, endpoint) {
                        Ok(started) => {
                            if started {
                                report.fetch_started += 1;
                            }
                            record(store, Level::Info, &key, "rehydrated fetching job");
                        }
                        Err(e) => record(store, Level::Error, &key, &format!("could not resume fetching: {}", e)),
                    },
                    None => record(store, Level::Warn, &key, "could not resume fetching: no api endpoint"),
                }
            }

            if schedule.is_sending {
                match jobs.schedule_send(key, settings) {
                    Ok(started) => {
                        if started {
                            report.send_started += 1;
                        }
                        record(store, Level::Info, &key, "rehydrated sending job");
                    }
                    Err(e) => record(store, Level::Error, &key, &format!("could not resume sending: {}", e)),
                }
            }
        }
    }

    info!(
        "Rehydrated {} fetch and {} send job(s) across {} scope(s), {} failed",
        report.fetch_started, report.send_started, report.scopes_scanned, report.scopes_failed
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryJobStore;
    use crate::db::store::JobStore;
    use crate::models::scope::{BankId, JobKind, Scope};
    use crate::services::jobs::JobContext;
    use crate::services::scheduler::Scheduler;
    use crate::testing::{RecordingSink, ScriptedSource, StaticCredentials};
    use std::sync::Arc;
    use std::time::Duration;

    fn jobs_over(store: &Arc<MemoryJobStore>) -> Jobs {
        let ctx = JobContext::new(
            store.clone(),
            Arc::new(ScriptedSource::default()),
            Arc::new(RecordingSink::default()),
            Arc::new(StaticCredentials::both("c", "s")),
        );
        Jobs::new(ctx, Arc::new(Scheduler::new()))
    }

    #[test]
    fn restores_exactly_the_flagged_jobs_with_persisted_intervals() {
        let scope = Scope::subsite(1, 7);
        let store = Arc::new(MemoryJobStore::new());
        let a = store.register_with(scope, BankId(10), 15, 5, Some("https://source/a"));
        let b = store.register_with(scope, BankId(20), 25, 8, Some("https://source/b"));
        store.register_with(scope, BankId(30), 40, 5, Some("https://source/c"));
        store.set_fetching(&scope, a, true).unwrap();
        store.set_sending(&scope, b, true).unwrap();

        let jobs = jobs_over(&store);
        let report = rehydrate(&jobs);

        let key_a = JobKey::new(scope, BankId(10));
        let key_b = JobKey::new(scope, BankId(20));
        let scheduler = jobs.scheduler();
        assert_eq!(scheduler.active_keys(JobKind::Fetch), vec![key_a]);
        assert_eq!(scheduler.active_keys(JobKind::Send), vec![key_b]);
        assert_eq!(scheduler.interval_of(JobKind::Fetch, &key_a), Some(Duration::from_secs(15)));
        assert_eq!(scheduler.interval_of(JobKind::Send, &key_b), Some(Duration::from_secs(25)));
        assert_eq!(
            report,
            RehydrationReport {
                scopes_scanned: 1,
                fetch_started: 1,
                send_started: 1,
                scopes_failed: 0
            }
        );

        let logs = store.recent_logs(&scope, BankId(10), 1).unwrap();
        assert_eq!(logs[0].log, "rehydrated fetching job");
        jobs.shutdown();
    }

    #[test]
    fn running_twice_starts_nothing_new() {
        let scope = Scope::tenant(4);
        let store = Arc::new(MemoryJobStore::new());
        let id = store.register(scope, BankId(1), "https://source/1");
        store.set_fetching(&scope, id, true).unwrap();
        store.set_sending(&scope, id, true).unwrap();

        let jobs = jobs_over(&store);
        rehydrate(&jobs);
        let second = rehydrate(&jobs);
        assert_eq!(second.fetch_started, 0);
        assert_eq!(second.send_started, 0);
        assert_eq!(jobs.scheduler().fetch_count(), 1);
        assert_eq!(jobs.scheduler().send_count(), 1);
        jobs.shutdown();
    }

    #[test]
    fn failing_scope_does_not_block_the_others() {
        let good = Scope::tenant(1);
        let bad = Scope::tenant(2);
        let store = Arc::new(MemoryJobStore::new());
        let id = store.register(good, BankId(1), "https://source/1");
        store.set_sending(&good, id, true).unwrap();
        store.register(bad, BankId(1), "https://source/1");
        store.fail_scope(bad);

        let jobs = jobs_over(&store);
        let report = rehydrate(&jobs);
        assert_eq!(report.scopes_scanned, 2);
        assert_eq!(report.scopes_failed, 1);
        assert_eq!(report.send_started, 1);
        jobs.shutdown();
    }

    #[test]
    fn fetch_flag_without_endpoint_is_not_resumed() {
        let scope = Scope::tenant(5);
        let store = Arc::new(MemoryJobStore::new());
        let id = store.register_with(scope, BankId(3), 10, 5, None);
        store.set_fetching(&scope, id, true).unwrap();

        let jobs = jobs_over(&store);
        let report = rehydrate(&jobs);
        assert_eq!(report.fetch_started, 0);
        assert_eq!(jobs.scheduler().fetch_count(), 0);
    }
}
