mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{minutes, test_store};
use labrelay::error::Error;
use labrelay::model::{FailOutcome, JobId, JobPayload, JobStatus, NewJob};

fn file_job(source: &str, name: &str) -> NewJob {
    NewJob::file(source, format!("/spool/{source}/{name}"), name)
}

#[tokio::test]
async fn opens_and_migrates() {
    let t = test_store().await;
    assert!(t.store.health_check().await.is_ok());
    // migrations are idempotent
    t.store.migrate().await.unwrap();
}

#[tokio::test]
async fn enqueue_then_claim_returns_job_in_processing() {
    let t = test_store().await;
    let id = t
        .store
        .enqueue(file_job("101", "a.pdf").origin("Your report", "lab@example.com").tenant("acme"))
        .await
        .unwrap();

    let job = t.store.claim_next().await.unwrap().expect("a pending job");
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.source_id, "101");
    assert_eq!(job.tenant.as_deref(), Some("acme"));
    assert_eq!(job.payload.email_subject(), "Your report");
    assert!(matches!(job.payload, JobPayload::File { ref filename, .. } if filename == "a.pdf"));

    assert!(t.store.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn claims_oldest_first() {
    let t = test_store().await;
    let first = t.store.enqueue(file_job("1", "a.pdf")).await.unwrap();
    t.clock.advance(minutes(1));
    let second = t.store.enqueue(NewJob::link("2", "https://example.com/r")).await.unwrap();

    assert_eq!(t.store.claim_next().await.unwrap().unwrap().id, first);
    assert_eq!(t.store.claim_next().await.unwrap().unwrap().id, second);
}

#[tokio::test]
async fn concurrent_claims_never_share_a_job() {
    let t = test_store().await;
    let mut enqueued = HashSet::new();
    for i in 0..20 {
        enqueued.insert(t.store.enqueue(file_job(&i.to_string(), "r.pdf")).await.unwrap());
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = t.store.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = store.claim_next().await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(seen, enqueued);
    assert_eq!(t.store.counts().await.unwrap().processing, 20);
}

#[tokio::test]
async fn failed_job_waits_for_reclaim_delay() {
    let t = test_store().await;
    let id = t.store.enqueue(file_job("1", "a.pdf")).await.unwrap();
    t.store.claim_next().await.unwrap().unwrap();

    let outcome = t.store.fail(id, "extractor crashed").await.unwrap();
    assert_eq!(outcome, FailOutcome::Retrying { attempt: 1 });

    let job = t.store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.last_error.as_deref(), Some("extractor crashed"));

    assert!(t.store.claim_next().await.unwrap().is_none());
    t.clock.advance(minutes(1));
    assert!(t.store.claim_next().await.unwrap().is_none());
    t.clock.advance(minutes(1) + chrono::Duration::seconds(1));
    assert_eq!(t.store.claim_next().await.unwrap().unwrap().id, id);
}

#[tokio::test]
async fn fourth_failure_is_permanent() {
    let t = test_store().await;
    let id = t.store.enqueue(file_job("1", "a.pdf")).await.unwrap();

    for attempt in 1..=3 {
        t.store.claim_next().await.unwrap().expect("claimable");
        assert_eq!(
            t.store.fail(id, "boom").await.unwrap(),
            FailOutcome::Retrying { attempt }
        );
        t.clock.advance(minutes(3));
    }

    t.store.claim_next().await.unwrap().expect("claimable");
    assert_eq!(
        t.store.fail(id, "boom again").await.unwrap(),
        FailOutcome::Exhausted { attempts: 4 }
    );

    let job = t.store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 4);
    assert_eq!(job.last_error.as_deref(), Some("boom again"));

    t.clock.advance(minutes(60));
    assert!(t.store.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn fail_requires_processing() {
    let t = test_store().await;
    let id = t.store.enqueue(file_job("1", "a.pdf")).await.unwrap();

    let err = t.store.fail(id, "nope").await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: JobStatus::Pending,
            to: JobStatus::Pending
        }
    ));
    assert!(matches!(
        t.store.fail(JobId(999), "nope").await.unwrap_err(),
        Error::NotFound(_)
    ));
}

#[tokio::test]
async fn complete_is_idempotent() {
    let t = test_store().await;
    let id = t.store.enqueue(file_job("1", "a.pdf")).await.unwrap();
    t.store.claim_next().await.unwrap().unwrap();

    assert_eq!(t.store.complete(id).await.unwrap(), JobStatus::Processing);
    assert_eq!(t.store.complete(id).await.unwrap(), JobStatus::Completed);

    assert_eq!(t.store.get(id).await.unwrap().status, JobStatus::Completed);
    assert!(t.store.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn complete_rejects_failed_and_unknown_jobs() {
    let t = test_store().await;
    let store = &t.store;
    let config = *store.config();
    let id = store.enqueue(file_job("1", "a.pdf")).await.unwrap();
    for _ in 0..=config.max_retries {
        store.claim_next().await.unwrap().unwrap();
        store.fail(id, "bad").await.unwrap();
        t.clock.advance(minutes(3));
    }

    assert!(matches!(
        store.complete(id).await.unwrap_err(),
        Error::InvalidTransition {
            from: JobStatus::Failed,
            to: JobStatus::Completed
        }
    ));
    assert!(matches!(
        store.complete(JobId(12345)).await.unwrap_err(),
        Error::NotFound(_)
    ));
}

#[tokio::test]
async fn reset_stuck_only_touches_old_processing_jobs() {
    let t = test_store().await;
    let old = t.store.enqueue(file_job("1", "a.pdf")).await.unwrap();
    let fresh = t.store.enqueue(file_job("2", "b.pdf")).await.unwrap();
    let waiting = t.store.enqueue(file_job("3", "c.pdf")).await.unwrap();

    t.store.claim_next().await.unwrap().unwrap();
    t.clock.advance(minutes(11));
    t.store.claim_next().await.unwrap().unwrap();

    let reset = t.store.reset_stuck(Duration::from_secs(10 * 60)).await.unwrap();
    assert_eq!(reset, 1);

    let job = t.store.get(old).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.last_error.as_deref(), Some("reset from stuck state"));
    assert_eq!(t.store.get(fresh).await.unwrap().status, JobStatus::Processing);
    assert_eq!(t.store.get(waiting).await.unwrap().status, JobStatus::Pending);

    // with nothing stale left, a second sweep is a no-op
    assert_eq!(t.store.reset_stuck_default().await.unwrap(), 0);
}

#[tokio::test]
async fn reset_job_can_still_be_completed() {
    let t = test_store().await;
    let id = t.store.enqueue(file_job("1", "a.pdf")).await.unwrap();
    t.store.claim_next().await.unwrap().unwrap();
    t.clock.advance(minutes(30));
    assert_eq!(t.store.reset_stuck_default().await.unwrap(), 1);

    // the transition is recorded from where the row actually was
    assert_eq!(t.store.complete(id).await.unwrap(), JobStatus::Pending);
    assert_eq!(t.store.get(id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn enqueue_batch_shares_source_and_counts() {
    let t = test_store().await;
    let ids = t
        .store
        .enqueue_batch(vec![file_job("77", "a.pdf"), file_job("77", "b.pdf")])
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    t.store.enqueue(NewJob::link("78", "https://example.com/x")).await.unwrap();

    assert_eq!(t.store.count_for_source("77").await.unwrap(), 2);
    assert_eq!(t.store.count_for_source("78").await.unwrap(), 1);
    assert_eq!(t.store.count_for_source("79").await.unwrap(), 0);

    let counts = t.store.counts().await.unwrap();
    assert_eq!(counts.pending, 3);
    assert_eq!(counts.total(), 3);
    assert!(t.store.enqueue_batch(Vec::new()).await.unwrap().is_empty());
}

#[tokio::test]
async fn list_filters_by_status_newest_first() {
    let t = test_store().await;
    let a = t.store.enqueue(file_job("1", "a.pdf")).await.unwrap();
    let b = t.store.enqueue(file_job("2", "b.pdf")).await.unwrap();
    let c = t.store.enqueue(file_job("3", "c.pdf")).await.unwrap();
    t.store.claim_next().await.unwrap().unwrap();
    t.store.complete(a).await.unwrap();

    let all: Vec<JobId> = t.store.list(None, 10).await.unwrap().iter().map(|j| j.id).collect();
    assert_eq!(all, vec![c, b, a]);

    let pending: Vec<JobId> = t
        .store
        .list(Some(JobStatus::Pending), 1)
        .await
        .unwrap()
        .iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(pending, vec![c]);
}

#[tokio::test]
async fn requeue_creates_fresh_job_from_failed_one() {
    let t = test_store().await;
    let id = t
        .store
        .enqueue(NewJob::link("9", "https://example.com/r").tenant("acme"))
        .await
        .unwrap();
    assert!(matches!(
        t.store.requeue(id).await.unwrap_err(),
        Error::InvalidTransition { from: JobStatus::Pending, .. }
    ));

    for _ in 0..4 {
        t.store.claim_next().await.unwrap().unwrap();
        t.store.fail(id, "portal down").await.unwrap();
        t.clock.advance(minutes(3));
    }

    let new_id = t.store.requeue(id).await.unwrap();
    assert_ne!(new_id, id);
    let fresh = t.store.get(new_id).await.unwrap();
    let old = t.store.get(id).await.unwrap();
    assert_eq!(fresh.status, JobStatus::Pending);
    assert_eq!(fresh.retry_count, 0);
    assert_eq!(fresh.payload, old.payload);
    assert_eq!(fresh.tenant.as_deref(), Some("acme"));
    assert_eq!(old.status, JobStatus::Failed);
}

#[tokio::test]
async fn purge_removes_only_old_finished_jobs() {
    let t = test_store().await;
    let done = t.store.enqueue(file_job("1", "a.pdf")).await.unwrap();
    t.store.claim_next().await.unwrap().unwrap();
    t.store.complete(done).await.unwrap();
    let pending = t.store.enqueue(file_job("2", "b.pdf")).await.unwrap();

    let week = Duration::from_secs(7 * 24 * 60 * 60);
    assert_eq!(t.store.purge_finished(week).await.unwrap(), 0);

    t.clock.advance(chrono::Duration::days(8));
    assert_eq!(t.store.purge_finished(week).await.unwrap(), 1);
    assert!(matches!(t.store.get(done).await.unwrap_err(), Error::NotFound(_)));
    assert_eq!(t.store.get(pending).await.unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn jobs_survive_reopen() {
    let t = test_store().await;
    let id = t.store.enqueue(file_job("1", "a.pdf")).await.unwrap();
    let path = t.dir.path().join("jobs.db");
    t.store.close().await;

    let reopened = labrelay::db::JobStore::open_default(&path).await.unwrap();
    assert_eq!(reopened.get(id).await.unwrap().status, JobStatus::Pending);
}
