use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tlshook::{DEFAULT_BPF_OBJECT, TlsHookEngine, settings::Settings, telemetry};

#[derive(Debug, Parser)]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// eBPF object with the Go TLS uprobes and process tracepoints
    #[clap(long, env = "BPF_OBJECT")]
    bpf_object: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if opt.verbose {
        "info"
    } else {
        "warn"
    }))
    .init();

    let settings = Settings::new().context("Failed to load settings")?;

    let bpf_object = opt
        .bpf_object
        .or_else(|| settings.bpf_object.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BPF_OBJECT));

    if let Err(e) = telemetry::init_metrics(settings.otel_exporter_otlp_endpoint.as_deref()) {
        log::warn!("Failed to initialize metrics: {:#}", e);
    }

    info!("Loading eBPF object {}", bpf_object.display());
    let engine = TlsHookEngine::new(settings, &bpf_object)?;
    let result = engine.run().await;

    telemetry::shutdown_metrics();
    result
}
