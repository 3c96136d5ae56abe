mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{TestStore, pdf_with_pages, test_store};
use labrelay::clock::Clock;
use labrelay::config::settings::DEFAULT_LINK_PATTERN;
use labrelay::error::{Error, Result};
use labrelay::model::{JobPayload, JobStatus};
use labrelay::producer::{
    Attachment, IncomingMessage, MessageSource, Producer, ProducerConfig, ProducerTick,
    SpoolSource, WatermarkFile,
};
use regex::Regex;
use tempfile::TempDir;

fn write_message(inbox: &Path, uid: u64, header: &str, files: &[(&str, Vec<u8>)]) {
    let dir = inbox.join(uid.to_string());
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("message.toml"), header).unwrap();
    for (name, data) in files {
        std::fs::write(dir.join(name), data).unwrap();
    }
}

struct Harness {
    t: TestStore,
    dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        Self {
            t: test_store().await,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn inbox(&self) -> PathBuf {
        self.dir.path().join("inbox")
    }

    fn spool(&self) -> PathBuf {
        self.dir.path().join("temp_jobs")
    }

    fn watermark_path(&self) -> PathBuf {
        self.dir.path().join("producer_state.json")
    }

    fn config(&self) -> ProducerConfig {
        ProducerConfig {
            spool_dir: self.spool(),
            watermark_path: self.watermark_path(),
            link_pattern: Some(Regex::new(DEFAULT_LINK_PATTERN).unwrap()),
            tenant: Some("clinic-a".to_string()),
            poll_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
            ..ProducerConfig::default()
        }
    }

    fn producer(&self) -> Producer {
        self.producer_with(Arc::new(SpoolSource::new(self.inbox())))
    }

    fn producer_with(&self, source: Arc<dyn MessageSource>) -> Producer {
        Producer::new(self.t.store.clone(), source, self.config()).with_clock(self.t.clock.clone())
    }
}

#[tokio::test]
async fn pdf_attachments_become_file_jobs() {
    let h = Harness::new().await;
    write_message(
        &h.inbox(),
        101,
        "subject = \"Your Thyrocare Report\"\nsender = \"Reports <reports@lab.example>\"\n",
        &[
            ("cbc.pdf", pdf_with_pages("CBC", 3)),
            ("lipid.PDF", pdf_with_pages("LIPID", 3)),
            ("invoice.txt", b"not a report".to_vec()),
        ],
    );

    let tick = h.producer().tick().await.unwrap();
    assert_eq!(
        tick,
        ProducerTick {
            scanned: 1,
            enqueued: 2,
            watermark: 101
        }
    );

    let mut jobs = h.t.store.list(None, 10).await.unwrap();
    jobs.reverse();
    assert_eq!(jobs.len(), 2);
    for (job, name) in jobs.iter().zip(["cbc.pdf", "lipid.PDF"]) {
        assert_eq!(job.source_id, "101");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.tenant.as_deref(), Some("clinic-a"));
        assert_eq!(job.payload.email_subject(), "Your Thyrocare Report");
        assert_eq!(job.payload.email_sender(), "Reports <reports@lab.example>");
        let JobPayload::File { path, filename, .. } = &job.payload else {
            panic!("expected a file job");
        };
        assert_eq!(filename, name);
        let path = Path::new(path);
        assert!(path.is_absolute());
        assert!(path.starts_with(std::path::absolute(h.spool().join("101")).unwrap()));
        assert!(path.is_file());
    }
}

#[tokio::test]
async fn link_is_used_when_there_is_no_attachment() {
    let h = Harness::new().await;
    write_message(
        &h.inbox(),
        5,
        "subject = \"Report ready\"\nsender = \"noreply@thyrocare.example\"\nbody = \"\"\"\nDownload: https://thyro.care/n/o/AbC123 (valid 7 days)\nOther: https://thyro.care/n/o/Second\n\"\"\"\n",
        &[],
    );

    h.producer().tick().await.unwrap();
    let jobs = h.t.store.list(None, 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(matches!(
        &jobs[0].payload,
        JobPayload::Link { url, .. } if url == "https://thyro.care/n/o/AbC123"
    ));
    assert!(!h.spool().join("5").exists());
}

#[tokio::test]
async fn irrelevant_and_empty_messages_only_move_the_watermark() {
    let h = Harness::new().await;
    write_message(
        &h.inbox(),
        1,
        "subject = \"Newsletter\"\nsender = \"news@shop.example\"\n",
        &[("deal.pdf", pdf_with_pages("X", 1))],
    );
    write_message(
        &h.inbox(),
        2,
        "subject = \"Thyrocare booking confirmed\"\nsender = \"noreply@bookings.example\"\n",
        &[],
    );

    let tick = h.producer().tick().await.unwrap();
    assert_eq!(tick.scanned, 2);
    assert_eq!(tick.enqueued, 0);
    assert_eq!(h.t.store.counts().await.unwrap().total(), 0);
    assert_eq!(WatermarkFile::new(h.watermark_path()).load().last_processed_uid, 2);
}

#[tokio::test]
async fn allow_list_overrides_keywords() {
    let h = Harness::new().await;
    write_message(
        &h.inbox(),
        3,
        "subject = \"Thyrocare report\"\nsender = \"someone@else.example\"\n",
        &[("r.pdf", pdf_with_pages("R", 2))],
    );
    write_message(
        &h.inbox(),
        4,
        "subject = \"Results\"\nsender = \"desk@partner-lab.example\"\n",
        &[("r.pdf", pdf_with_pages("R", 2))],
    );

    let config = ProducerConfig {
        allowed_senders: vec!["partner-lab.example".to_string()],
        ..h.config()
    };
    let producer = Producer::new(
        h.t.store.clone(),
        Arc::new(SpoolSource::new(h.inbox())),
        config,
    );
    producer.tick().await.unwrap();

    assert_eq!(h.t.store.count_for_source("3").await.unwrap(), 0);
    assert_eq!(h.t.store.count_for_source("4").await.unwrap(), 1);
}

#[tokio::test]
async fn watermark_skips_handled_messages() {
    let h = Harness::new().await;
    write_message(
        &h.inbox(),
        10,
        "subject = \"Thyrocare report\"\n",
        &[("a.pdf", pdf_with_pages("A", 2))],
    );
    let producer = h.producer();
    producer.tick().await.unwrap();

    write_message(
        &h.inbox(),
        11,
        "subject = \"Thyrocare report\"\n",
        &[("b.pdf", pdf_with_pages("B", 2))],
    );
    let tick = producer.tick().await.unwrap();
    assert_eq!(tick.scanned, 1);
    assert_eq!(tick.watermark, 11);

    let mark = WatermarkFile::new(h.watermark_path()).load();
    assert_eq!(mark.last_processed_uid, 11);
    assert_eq!(mark.last_processed_time, h.t.clock.now().timestamp());
    assert_eq!(h.t.store.counts().await.unwrap().pending, 2);
}

#[tokio::test]
async fn replay_after_lost_watermark_does_not_duplicate() {
    let h = Harness::new().await;
    write_message(
        &h.inbox(),
        20,
        "subject = \"Thyrocare report\"\n",
        &[("a.pdf", pdf_with_pages("A", 2)), ("b.pdf", pdf_with_pages("B", 2))],
    );
    h.producer().tick().await.unwrap();
    assert_eq!(h.t.store.count_for_source("20").await.unwrap(), 2);

    std::fs::remove_file(h.watermark_path()).unwrap();
    let tick = h.producer().tick().await.unwrap();
    assert_eq!(tick.scanned, 1);
    assert_eq!(tick.enqueued, 0);
    assert_eq!(h.t.store.count_for_source("20").await.unwrap(), 2);
}

/// In-memory messages; fetching `fail_on` errors.
struct MemorySource {
    messages: Vec<IncomingMessage>,
    fail_on: Option<u64>,
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn list_since(&self, watermark: u64) -> Result<Vec<u64>> {
        Ok(self
            .messages
            .iter()
            .map(|m| m.source_id)
            .filter(|id| *id > watermark)
            .collect())
    }

    async fn fetch(&self, id: u64) -> Result<IncomingMessage> {
        if self.fail_on == Some(id) {
            return Err(Error::Other("connection reset".to_string()));
        }
        self.messages
            .iter()
            .find(|m| m.source_id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("message {id}")))
    }
}

fn relevant(id: u64, attachments: Vec<Attachment>) -> IncomingMessage {
    IncomingMessage {
        source_id: id,
        subject: "Thyrocare report".to_string(),
        sender: "reports@lab.example".to_string(),
        body: String::new(),
        attachments,
    }
}

fn pdf(name: &str) -> Attachment {
    Attachment {
        filename: name.to_string(),
        data: pdf_with_pages(name, 2),
    }
}

#[tokio::test]
async fn fetch_error_stops_before_the_failing_message() {
    let h = Harness::new().await;
    let source = MemorySource {
        messages: vec![
            relevant(1, vec![pdf("a.pdf")]),
            relevant(2, vec![pdf("b.pdf")]),
            relevant(3, vec![pdf("c.pdf")]),
        ],
        fail_on: Some(2),
    };

    let err = h.producer_with(Arc::new(source)).tick().await.unwrap_err();
    assert!(err.to_string().contains("connection reset"));
    assert_eq!(WatermarkFile::new(h.watermark_path()).load().last_processed_uid, 1);
    assert_eq!(h.t.store.counts().await.unwrap().total(), 1);
}

#[tokio::test]
async fn attachment_names_are_sanitized_and_unique() {
    let h = Harness::new().await;
    let source = MemorySource {
        messages: vec![relevant(
            30,
            vec![pdf("re:port.pdf"), pdf("report.pdf"), pdf("<>.pdf")],
        )],
        fail_on: None,
    };
    h.producer_with(Arc::new(source)).tick().await.unwrap();

    let mut names: Vec<String> = h
        .t
        .store
        .list(None, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|job| match job.payload {
            JobPayload::File { filename, .. } => filename,
            JobPayload::Link { url, .. } => url,
        })
        .collect();
    names.sort();
    assert_eq!(names, [".pdf", "1-report.pdf", "report.pdf"]);
}

#[tokio::test]
async fn stale_spool_folder_is_replaced() {
    let h = Harness::new().await;
    let stale = h.spool().join("40");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("report.pdf"), b"half written").unwrap();

    let source = MemorySource {
        messages: vec![relevant(40, vec![pdf("report.pdf")])],
        fail_on: None,
    };
    h.producer_with(Arc::new(source)).tick().await.unwrap();

    let entries: Vec<_> = std::fs::read_dir(&stale).unwrap().collect();
    assert_eq!(entries.len(), 1);
    assert_ne!(std::fs::read(stale.join("report.pdf")).unwrap(), b"half written");
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let h = Harness::new().await;
    write_message(
        &h.inbox(),
        60,
        "subject = \"Thyrocare report\"\n",
        &[("a.pdf", pdf_with_pages("A", 2))],
    );
    let producer = Arc::new(h.producer());
    let runner = {
        let producer = Arc::clone(&producer);
        tokio::spawn(async move { producer.run().await })
    };

    for _ in 0..200 {
        if h.t.store.count_for_source("60").await.unwrap() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    producer.shutdown();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("producer did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(h.t.store.count_for_source("60").await.unwrap(), 1);
}
