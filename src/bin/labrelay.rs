//! labrelay CLI: run the pipeline, inspect and repair the queue, or brand a
//! folder of reports by hand.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use labrelay::clock::{Clock, SystemClock};
use labrelay::compose::batch::process_folder;
use labrelay::compose::{BrandAssets, Composer, HeaderStyle};
use labrelay::config::{Config, Settings};
use labrelay::db::JobStore;
use labrelay::engine::Worker;
use labrelay::extract::{CommandExtractor, MetadataExtractor, PlaceholderExtractor};
use labrelay::fetch::CommandFetcher;
use labrelay::model::{JobId, JobPayload, JobStatus, NewJob};
use labrelay::producer::{Producer, SpoolSource};
use labrelay::sink::{ArchiveSink, HttpSink};
use labrelay::telemetry::{TelemetryConfig, init_telemetry};
use tracing::info;

#[derive(Parser)]
#[command(name = "labrelay", about = "Brand and deliver lab reports", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the producer and worker loops until Ctrl-C
    Serve {
        /// Run only the worker
        #[arg(long)]
        no_producer: bool,
    },
    /// Run only the worker loop
    Worker,
    /// Run only the producer loop
    Producer,
    /// Job queue operations
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
    /// Brand every PDF in a folder
    Rebrand {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// none, white, or branded
        #[arg(long, value_parser = parse_header_style)]
        header_style: Option<HeaderStyle>,
        #[arg(long)]
        no_cover: bool,
        /// Keep source file names instead of "<patient> - <test>.pdf"
        #[arg(long)]
        no_rename: bool,
        #[arg(long)]
        keep_first_page: bool,
        /// Merge reports belonging to the same patient
        #[arg(long)]
        merge: bool,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// Enqueue a PDF already on disk
    EnqueueFile {
        path: PathBuf,
        #[arg(long)]
        source_id: Option<String>,
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Enqueue a portal link
    EnqueueLink {
        url: String,
        #[arg(long)]
        source_id: Option<String>,
        #[arg(long)]
        tenant: Option<String>,
    },
    /// List jobs, newest first
    List {
        /// pending, processing, completed, or failed
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show one job
    Show { id: JobId },
    /// Job counts per state
    Stats,
    /// Re-enqueue a failed job
    Requeue { id: JobId },
    /// Delete finished jobs older than the given age
    Purge {
        #[arg(long)]
        days: u64,
    },
    /// Return abandoned processing jobs to pending
    ResetStuck {
        #[arg(long)]
        minutes: Option<u64>,
    },
}

fn parse_header_style(s: &str) -> Result<HeaderStyle, String> {
    s.parse().map_err(|e: labrelay::error::Error| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "labrelay".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let settings = Settings::load_or_default(&config.settings_path)?;

    match cli.command {
        Command::Serve { no_producer } => cmd_serve(&config, &settings, !no_producer).await,
        Command::Worker => cmd_serve(&config, &settings, false).await,
        Command::Producer => cmd_producer(&config, &settings).await,
        Command::Jobs { action } => {
            let store = open_store(&config, &settings).await?;
            let result = cmd_jobs(&store, action).await;
            store.close().await;
            result
        }
        Command::Rebrand {
            input,
            output,
            header_style,
            no_cover,
            no_rename,
            keep_first_page,
            merge,
        } => {
            let mut options = settings.branding.options;
            if let Some(style) = header_style {
                options.header_style = style;
            }
            options.add_cover &= !no_cover;
            options.rename &= !no_rename;
            options.remove_first_page &= !keep_first_page;

            let composer = build_composer(&settings).with_options(options);
            let extractor = build_extractor(&settings);
            let summary = process_folder(
                &composer,
                extractor.as_ref(),
                &input,
                &output,
                merge || settings.branding.merge_reports,
            )
            .await?;
            println!("{} of {} report(s) branded", summary.succeeded, summary.total);
            Ok(())
        }
    }
}

async fn open_store(config: &Config, settings: &Settings) -> anyhow::Result<JobStore> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Ok(JobStore::open(&config.database_path, settings.store_config(), clock).await?)
}

fn build_composer(settings: &Settings) -> Composer {
    Composer::new(
        BrandAssets::load(&settings.branding.assets),
        settings.branding.options,
    )
}

fn build_extractor(settings: &Settings) -> Arc<dyn MetadataExtractor> {
    match &settings.extract {
        Some(command) => Arc::new(CommandExtractor::new(command.clone())),
        None => Arc::new(PlaceholderExtractor),
    }
}

fn build_worker(store: JobStore, config: &Config, settings: &Settings) -> Worker {
    let mut worker = Worker::new(store, build_composer(settings), settings.worker_config())
        .with_extractor(build_extractor(settings));
    if let Some(command) = &settings.fetch {
        worker = worker.with_fetcher(Arc::new(CommandFetcher::new(command.clone())));
    }
    if let Some(root) = &settings.sinks.archive_dir {
        worker = worker.with_sink(Arc::new(ArchiveSink::new(root, Arc::new(SystemClock))));
    }
    if let Some(url) = &settings.sinks.upload_url {
        worker = worker.with_sink(Arc::new(HttpSink::new(url, config.upload_token.clone())));
    }
    worker
}

fn build_producer(store: JobStore, settings: &Settings) -> anyhow::Result<Producer> {
    let source = Arc::new(SpoolSource::new(&settings.producer.inbox_dir));
    Ok(Producer::new(store, source, settings.producer_config()?))
}

async fn cmd_serve(config: &Config, settings: &Settings, with_producer: bool) -> anyhow::Result<()> {
    settings.validate()?;
    let store = open_store(config, settings).await?;

    let worker = Arc::new(build_worker(store.clone(), config, settings));
    let producer = if with_producer {
        Some(Arc::new(build_producer(store.clone(), settings)?))
    } else {
        None
    };

    let (w, p) = (Arc::clone(&worker), producer.clone());
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        w.shutdown();
        if let Some(p) = p {
            p.shutdown();
        }
    });

    match producer {
        Some(producer) => {
            tokio::try_join!(worker.run(), producer.run())?;
        }
        None => worker.run().await?,
    }

    store.close().await;
    Ok(())
}

async fn cmd_producer(config: &Config, settings: &Settings) -> anyhow::Result<()> {
    settings.link_regex()?;
    let store = open_store(config, settings).await?;
    let producer = Arc::new(build_producer(store.clone(), settings)?);

    let p = Arc::clone(&producer);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        p.shutdown();
    });

    producer.run().await?;
    store.close().await;
    Ok(())
}

async fn cmd_jobs(store: &JobStore, action: JobsAction) -> anyhow::Result<()> {
    match action {
        JobsAction::EnqueueFile {
            path,
            source_id,
            tenant,
        } => {
            let path = std::path::absolute(&path)?;
            anyhow::ensure!(path.is_file(), "no such file: {}", path.display());
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mut new = NewJob::file(manual_source_id(source_id), path.to_string_lossy(), filename);
            if let Some(tenant) = tenant {
                new = new.tenant(tenant);
            }
            let id = store.enqueue(new).await?;
            println!("Enqueued: {id}");
        }
        JobsAction::EnqueueLink {
            url,
            source_id,
            tenant,
        } => {
            let mut new = NewJob::link(manual_source_id(source_id), url);
            if let Some(tenant) = tenant {
                new = new.tenant(tenant);
            }
            let id = store.enqueue(new).await?;
            println!("Enqueued: {id}");
        }
        JobsAction::List { status, limit } => {
            let status: Option<JobStatus> = match status {
                Some(s) => Some(s.parse()?),
                None => None,
            };
            cmd_jobs_list(store, status, limit).await?;
        }
        JobsAction::Show { id } => cmd_jobs_show(store, id).await?,
        JobsAction::Stats => {
            let counts = store.counts().await?;
            println!("pending:    {}", counts.pending);
            println!("processing: {}", counts.processing);
            println!("completed:  {}", counts.completed);
            println!("failed:     {}", counts.failed);
            println!("total:      {}", counts.total());
        }
        JobsAction::Requeue { id } => {
            let new_id = store.requeue(id).await?;
            println!("Requeued: {id} -> {new_id}");
        }
        JobsAction::Purge { days } => {
            let purged = store
                .purge_finished(Duration::from_secs(days * 24 * 60 * 60))
                .await?;
            println!("Purged {purged} job(s)");
        }
        JobsAction::ResetStuck { minutes } => {
            let timeout = minutes
                .map(|m| Duration::from_secs(m * 60))
                .unwrap_or(store.config().stuck_timeout);
            let reset = store.reset_stuck(timeout).await?;
            println!("Reset {reset} job(s)");
        }
    }
    Ok(())
}

fn manual_source_id(given: Option<String>) -> String {
    given.unwrap_or_else(|| format!("manual-{}", uuid::Uuid::new_v4()))
}

async fn cmd_jobs_list(store: &JobStore, status: Option<JobStatus>, limit: i64) -> anyhow::Result<()> {
    let jobs = store.list(status, limit).await?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<6}  {:<5}  {:<10}  {:<5}  {:<24}  UPDATED",
        "ID", "KIND", "STATUS", "TRIES", "SOURCE"
    );
    println!("{}", "-".repeat(80));
    for job in &jobs {
        let source: String = job.source_id.chars().take(24).collect();
        println!(
            "{:<6}  {:<5}  {:<10}  {:<5}  {:<24}  {}",
            job.id,
            job.kind(),
            job.status,
            job.retry_count,
            source,
            job.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} job(s)", jobs.len());
    Ok(())
}

async fn cmd_jobs_show(store: &JobStore, id: JobId) -> anyhow::Result<()> {
    let job = store.get(id).await?;

    println!("ID:         {}", job.id);
    println!("Kind:       {}", job.kind());
    println!("Status:     {}", job.status);
    println!("Source:     {}", job.source_id);
    println!("Tenant:     {}", job.tenant.as_deref().unwrap_or("-"));
    println!("Retries:    {}", job.retry_count);
    match &job.payload {
        JobPayload::File { path, filename, .. } => {
            println!("Path:       {path}");
            println!("Filename:   {filename}");
        }
        JobPayload::Link { url, .. } => println!("URL:        {url}"),
    }
    if !job.payload.email_subject().is_empty() {
        println!("Subject:    {}", job.payload.email_subject());
    }
    if !job.payload.email_sender().is_empty() {
        println!("Sender:     {}", job.payload.email_sender());
    }
    println!("Created:    {}", job.created_at);
    println!("Updated:    {}", job.updated_at);
    if let Some(err) = &job.last_error {
        println!("Last Error: {err}");
    }
    Ok(())
}
