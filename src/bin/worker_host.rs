//! Run a content script against a synthetic document and print what it
//! sends back.
//!
//! usage: worker_host <script.js> [document-url] [run-ms]
//!
//! `CONTENT_WORKER_CONFIG` may point at a YAML `WorkerConfig`.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use content_worker::{Document, Worker, WorkerConfig, WorkerOptions};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: worker_host <script.js> [document-url] [run-ms]";
const DEFAULT_URL: &str = "data:text/html;charset=utf-8,content-worker";
const DEFAULT_RUN_MS: u64 = 1_000;

fn main() {
    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    if let Err(err) = run() {
        eprintln!("worker_host: {err:#}");
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let script_path = args.next().context(USAGE)?;
    let url = args.next().unwrap_or_else(|| DEFAULT_URL.to_string());
    let run_ms = match args.next() {
        Some(raw) => raw.parse::<u64>().context("run-ms must be a number")?,
        None => DEFAULT_RUN_MS,
    };

    let config_path = env::var("CONTENT_WORKER_CONFIG")
        .ok()
        .filter(|path| !path.is_empty())
        .map(PathBuf::from);
    let mut config = WorkerConfig::load(config_path)?;
    config.script_url = script_path.clone();

    let script = fs::read_to_string(&script_path)
        .with_context(|| format!("failed to read {script_path}"))?;
    let document = Document::loaded(&url).with_context(|| format!("invalid document URL {url}"))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async move {
        let options = WorkerOptions::new(document, script)
            .config(config)
            .on_message(|message| match message.value() {
                Some(value) => println!("message: {value}"),
                None => println!("message: undefined"),
            })
            .on_error(|fault| eprintln!("error ({}): {}", fault.phase.as_str(), fault.message));
        let worker = Worker::new(options)?;
        worker.run_for(Duration::from_millis(run_ms)).await;
        worker.destroy();
        Ok::<(), anyhow::Error>(())
    })
}
