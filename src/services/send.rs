use log::{Level, debug};

use crate::db::store::JobStore;
use crate::models::desigo::IngestBatch;
use crate::models::scope::{JobKey, JobKind};
use crate::services::jobs::JobContext;
use crate::utils::{JobError, batch_id, record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Idle,
    Busy,
    /// Fewer unsent rows than the batch size; nothing dispatched.
    WaitingForBatch { found: usize, needed: usize },
    Dispatched { count: usize },
}

fn sending_enabled(store: &dyn JobStore, key: &JobKey) -> bool {
    let flags = store.local_id(&key.scope, key.bank_id).and_then(|id| match id {
        Some(id) => store.control_flags(&key.scope, id),
        None => Ok(None),
    });
    match flags {
        Ok(Some(f)) => f.is_sending,
        Ok(None) => false,
        Err(e) => {
            debug!("{}: flag check failed, skipping tick: {}", key, e);
            false
        }
    }
}

/// One send tick: only a full batch of the oldest unsent rows is dispatched,
/// and those rows are marked sent only after the cloud accepted them.
pub fn run_send_tick(ctx: &JobContext, key: &JobKey, batch_size: i32) -> Result<SendOutcome, JobError> {
    let Some(_guard) = ctx.locks.try_claim(JobKind::Send, *key) else {
        return Ok(SendOutcome::Busy);
    };
    let store = ctx.store.as_ref();
    if !sending_enabled(store, key) {
        return Ok(SendOutcome::Idle);
    }

    let needed = batch_size.max(1) as usize;
    let rows = store.unsent_batch(&key.scope, key.bank_id, needed as i64)?;
    if rows.len() < needed {
        return Ok(SendOutcome::WaitingForBatch {
            found: rows.len(),
            needed,
        });
    }

    let token = ctx
        .credentials
        .cloud_token()?
        .ok_or(JobError::MissingCredential("cloud"))?;
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let batch = IngestBatch {
        company_id: key.scope.tenant_id().0,
        subsite_id: key.scope.subsite_id().map(|s| s.0),
        sensor_id: key.bank_id.0,
        batch_id: batch_id(key, &ids),
        batch: rows.iter().map(|r| r.to_ingest_row(key.bank_id)).collect(),
    };
    ctx.sink.dispatch(&key.scope, &batch, &token)?;

    let marked = store.mark_sent(&key.scope, key.bank_id, &ids)?;
    record(
        store,
        Level::Info,
        key,
        &format!("sent batch {} ({} rows, {} marked)", batch.batch_id, ids.len(), marked),
    );
    Ok(SendOutcome::Dispatched { count: ids.len() })
}

pub fn send_tick(ctx: &JobContext, key: &JobKey, batch_size: i32) {
    match run_send_tick(ctx, key, batch_size) {
        Ok(SendOutcome::WaitingForBatch { found, needed }) => record(
            ctx.store.as_ref(),
            Level::Info,
            key,
            &format!("waiting for full batch ({}/{})", found, needed),
        ),
        Ok(SendOutcome::Busy) => debug!("{}: previous send still running, tick skipped", key),
        Ok(_) => {}
        Err(e) => record(ctx.store.as_ref(), Level::Warn, key, &format!("send failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SourceError;
    use crate::db::memory::MemoryJobStore;
    use crate::models::scope::{BankId, Scope};
    use crate::testing::{RecordingSink, ScriptedSource, StaticCredentials};
    use std::sync::Arc;

    fn setup(sink: RecordingSink, scope: Scope) -> (Arc<MemoryJobStore>, Arc<RecordingSink>, JobContext, JobKey) {
        let store = Arc::new(MemoryJobStore::new());
        store.register(scope, BankId(42), "https://source/42");
        let sink = Arc::new(sink);
        let ctx = JobContext::new(
            store.clone(),
            Arc::new(ScriptedSource::default()),
            sink.clone(),
            Arc::new(StaticCredentials::both("cloud-token", "source-token")),
        );
        let key = JobKey::new(scope, BankId(42));
        let id = store.local_id(&scope, BankId(42)).unwrap().unwrap();
        store.set_sending(&scope, id, true).unwrap();
        (store, sink, ctx, key)
    }

    #[test]
    fn partial_batch_is_not_dispatched() {
        let (store, sink, ctx, key) = setup(RecordingSink::default(), Scope::subsite(1, 7));
        store.seed_rows(&key.scope, key.bank_id, 4);

        let outcome = run_send_tick(&ctx, &key, 5).unwrap();
        assert_eq!(outcome, SendOutcome::WaitingForBatch { found: 4, needed: 5 });
        assert!(sink.batches().is_empty());
        assert_eq!(store.unsent_batch(&key.scope, key.bank_id, 10).unwrap().len(), 4);

        send_tick(&ctx, &key, 5);
        let logs = store.recent_logs(&key.scope, key.bank_id, 1).unwrap();
        assert_eq!(logs[0].log, "waiting for full batch (4/5)");
    }

    #[test]
    fn full_batch_is_dispatched_once_and_marked() {
        let (store, sink, ctx, key) = setup(RecordingSink::default(), Scope::subsite(1, 7));
        let ids = store.seed_rows(&key.scope, key.bank_id, 5);

        assert_eq!(run_send_tick(&ctx, &key, 5).unwrap(), SendOutcome::Dispatched { count: 5 });
        let sent = sink.batches();
        assert_eq!(sent.len(), 1);
        let (scope, batch, token) = &sent[0];
        assert_eq!(*scope, key.scope);
        assert_eq!(token, "cloud-token");
        assert_eq!(batch.company_id, 1);
        assert_eq!(batch.subsite_id, Some(7));
        assert_eq!(batch.sensor_id, 42);
        assert_eq!(batch.batch.iter().map(|r| r.id).collect::<Vec<_>>(), ids);
        assert!(batch.batch.iter().all(|r| r.sensor_id == 42));
        assert!(store.unsent_batch(&key.scope, key.bank_id, 10).unwrap().is_empty());

        // Everything is sent now; the next tick waits again.
        assert_eq!(
            run_send_tick(&ctx, &key, 5).unwrap(),
            SendOutcome::WaitingForBatch { found: 0, needed: 5 }
        );
        assert_eq!(sink.batches().len(), 1);
    }

    #[test]
    fn oldest_rows_go_first() {
        let (store, sink, ctx, key) = setup(RecordingSink::default(), Scope::tenant(2));
        let ids = store.seed_rows(&key.scope, key.bank_id, 7);
        run_send_tick(&ctx, &key, 5).unwrap();
        let batch = &sink.batches()[0].1;
        assert_eq!(batch.batch.iter().map(|r| r.id).collect::<Vec<_>>(), ids[..5].to_vec());
        assert_eq!(batch.subsite_id, None);
        assert_eq!(store.unsent_batch(&key.scope, key.bank_id, 10).unwrap().len(), 2);
    }

    #[test]
    fn failed_dispatch_leaves_rows_unsent() {
        let sink = RecordingSink::failing(|| SourceError::Http {
            status: 502,
            message: "bad gateway".into(),
        });
        let (store, sink, ctx, key) = setup(sink, Scope::subsite(1, 7));
        store.seed_rows(&key.scope, key.bank_id, 5);

        let err = run_send_tick(&ctx, &key, 5).expect_err("dispatch fails");
        assert!(matches!(err, JobError::TransientSource(_)));
        assert_eq!(sink.attempts(), 1);
        assert_eq!(store.unsent_batch(&key.scope, key.bank_id, 10).unwrap().len(), 5);
    }

    #[test]
    fn resend_after_failure_uses_same_batch_id() {
        let failing = RecordingSink::failing(|| SourceError::Timeout("10s".into()));
        let (store, sink, ctx, key) = setup(failing, Scope::subsite(1, 7));
        store.seed_rows(&key.scope, key.bank_id, 5);
        let _ = run_send_tick(&ctx, &key, 5);
        let _ = run_send_tick(&ctx, &key, 5);
        let ids = sink.attempted_batch_ids();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
    }

    #[test]
    fn flag_off_sends_nothing() {
        let (store, sink, ctx, key) = setup(RecordingSink::default(), Scope::tenant(2));
        store.seed_rows(&key.scope, key.bank_id, 5);
        let id = store.local_id(&key.scope, key.bank_id).unwrap().unwrap();
        store.set_sending(&key.scope, id, false).unwrap();
        assert_eq!(run_send_tick(&ctx, &key, 5).unwrap(), SendOutcome::Idle);
        assert_eq!(sink.attempts(), 0);
    }

    #[test]
    fn send_tick_stays_within_its_scope() {
        let scopes = [Scope::subsite(1, 7), Scope::subsite(1, 8), Scope::tenant(2)];
        let store = Arc::new(MemoryJobStore::new());
        for scope in scopes {
            store.register(scope, BankId(42), "https://source/42");
            let id = store.local_id(&scope, BankId(42)).unwrap().unwrap();
            store.set_sending(&scope, id, true).unwrap();
            store.seed_rows(&scope, BankId(42), 5);
        }
        let sink = Arc::new(RecordingSink::default());
        let ctx = JobContext::new(
            store.clone(),
            Arc::new(ScriptedSource::default()),
            sink.clone(),
            Arc::new(StaticCredentials::both("cloud-token", "source-token")),
        );
        store.reset_touched();

        let key = JobKey::new(scopes[0], BankId(42));
        assert_eq!(run_send_tick(&ctx, &key, 5).unwrap(), SendOutcome::Dispatched { count: 5 });
        assert_eq!(store.touched_scopes().into_iter().collect::<Vec<_>>(), vec![scopes[0]]);
        assert_eq!(sink.batches().len(), 1);
        assert_eq!(sink.batches()[0].0, scopes[0]);
        assert!(store.unsent_batch(&scopes[0], BankId(42), 10).unwrap().is_empty());
        for other in &scopes[1..] {
            assert_eq!(store.unsent_batch(other, BankId(42), 10).unwrap().len(), 5, "{other}");
        }
    }
}
