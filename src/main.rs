use anyhow::{Context, Result};
use promo_shorts::api::GeminiClient;
use promo_shorts::backend::create_backend;
use promo_shorts::brief::BackendKind;
use promo_shorts::config::Config;
use promo_shorts::cookies::{load_cookie_file, validate_cookies};
use promo_shorts::executor::CancelFlag;
use promo_shorts::history::{HistoryRecord, HistoryStore};
use promo_shorts::retry::RetryPolicy;
use promo_shorts::{
    Brief, EventSink, GenerationError, PipelineEvent, TaskRegistry, TaskStatus,
    WorkflowOrchestrator, init,
};
use reqwest::Client;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE: &str = "config.json";

const USAGE: &str = "usage:\n  promo-shorts run <brief.json>\n  promo-shorts check-cookies <cookie-file>";

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::Stage { name, .. } => println!("[STAGE] {} done", name),
        PipelineEvent::TaskFinished(done) if done.success => {
            let paths = done.output_paths.as_deref().unwrap_or_default();
            for path in paths {
                println!("[VIDEO] {} {}", done.task_id, path.display());
            }
        }
        PipelineEvent::TaskFinished(done) => println!(
            "[FAILED] {} {}",
            done.task_id,
            done.error.as_deref().unwrap_or("unknown error")
        ),
        // Logs and progress are already traced by the sink.
        PipelineEvent::Log { .. } | PipelineEvent::Progress { .. } => {}
    }
}

async fn run(brief_path: &Path) -> Result<i32> {
    let config = Config::load_or_default(CONFIG_FILE).await?;
    let mut brief = Brief::load(brief_path).await?;
    init::ensure_directories(&brief.output_dir, &config.history_file).await?;
    brief.backend_credentials = brief
        .backend_credentials
        .clone()
        .with_api_key_fallback(std::env::var("GEMINI_API_KEY").ok());

    let client = Client::builder()
        .gzip(true)
        .build()
        .context("Failed to build HTTP client")?;

    if brief.backend == BackendKind::Browser
        && !init::check_webdriver(&client, &config.browser.webdriver_url).await
    {
        warn!(
            "No WebDriver answering at {}. Start chromedriver first.",
            config.browser.webdriver_url
        );
    }

    let llm_key = brief
        .backend_credentials
        .api_key()
        .context("An api_key (or GEMINI_API_KEY) is required for script generation")?;
    let llm = Arc::new(GeminiClient::new(client.clone(), &config, llm_key));
    let backend = create_backend(brief.backend, &config, &brief.backend_credentials, client)?;

    let store = HistoryStore::new(&config.history_file);
    match store.load().await {
        Ok(previous) => info!("{} videos in history", previous.len()),
        Err(err) => warn!("History not readable: {:#}", err),
    }

    let (events, rx) = EventSink::channel();
    let printer = std::thread::spawn(move || {
        for event in rx {
            print_event(&event);
        }
    });

    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after running tasks");
            on_signal.cancel();
        }
    });

    let orchestrator =
        WorkflowOrchestrator::new(llm, backend.clone(), TaskRegistry::new(), events)
            .with_retry(RetryPolicy::from(&config.retry))
            .with_cancel(cancel)
            .with_default_threads(config.default_threads);

    let outcome = orchestrator.run(&brief).await;

    let records: Vec<HistoryRecord> = orchestrator
        .registry()
        .snapshot()
        .iter()
        .filter(|t| t.status() == TaskStatus::Completed)
        .flat_map(HistoryRecord::from_task)
        .collect();
    if !records.is_empty() {
        match store.append(records).await {
            Ok(n) => info!("Saved {} videos to {}", n, store.path().display()),
            Err(err) => warn!("History not saved: {:#}", err),
        }
    }

    if let Err(err) = backend.shutdown().await {
        warn!("Backend shutdown: {}", err);
    }
    drop(orchestrator);
    if printer.join().is_err() {
        warn!("Event printer stopped early");
    }

    match outcome {
        Ok(report) => {
            println!("{}", report.message);
            Ok(if report.success { 0 } else { 1 })
        }
        Err(err @ GenerationError::Input(_)) => {
            error!("{}", err);
            Ok(2)
        }
        Err(err) => Err(err.into()),
    }
}

async fn check_cookies(path: &Path) -> Result<i32> {
    let raw = load_cookie_file(path).await?;
    let validation = validate_cookies(&raw);
    println!("{}", serde_json::to_string_pretty(&validation)?);
    if !validation.valid {
        error!("Missing required cookies: {}", validation.missing.join(", "));
        return Ok(1);
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = match args.as_slice() {
        [cmd, path] if cmd == "run" => run(Path::new(path)).await?,
        [cmd, path] if cmd == "check-cookies" => check_cookies(Path::new(path)).await?,
        _ => {
            eprintln!("{}", USAGE);
            2
        }
    };
    std::process::exit(code);
}
